/// Domain-specific error types for the pool engine.
/// Every public pool operation is all-or-nothing: any error below means
/// no state was changed.

/// Fixed-point and model failures. Never silently saturated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MathError {
    #[error("fixed-point overflow")]
    Overflow,

    #[error("fixed-point underflow")]
    Underflow,

    #[error("division by zero")]
    DivisionByZero,

    #[error("undefined result: {0}")]
    Undefined(&'static str),

    #[error("coefficient {index} outside (-2^41, 2^41)")]
    CoefficientOutOfRange { index: usize },
}

pub type MathResult<T> = Result<T, MathError>;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("insufficient liquidity: {0}")]
    InsufficientLiquidity(String),

    #[error("slippage exceeded: cost {cost} > max {max_cost}")]
    SlippageExceeded { cost: u128, max_cost: u128 },

    #[error("not authorized: {0}")]
    Authorization(String),

    #[error("expiry state: {0}")]
    ExpiryState(String),

    #[error("arithmetic error: {0}")]
    Arithmetic(#[from] MathError),

    #[error("price feed error: {0}")]
    ExternalDependency(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("state corruption: {0}")]
    StateCorruption(String),
}

impl PoolError {
    /// Stable machine-readable name for API responses and the journal.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::InsufficientLiquidity(_) => "insufficient_liquidity",
            Self::SlippageExceeded { .. } => "slippage_exceeded",
            Self::Authorization(_) => "authorization",
            Self::ExpiryState(_) => "expiry_state",
            Self::Arithmetic(_) => "arithmetic",
            Self::ExternalDependency(_) => "external_dependency",
            Self::Database(_) => "database",
            Self::Config(_) => "config",
            Self::StateCorruption(_) => "state_corruption",
        }
    }
}

impl From<rusqlite::Error> for PoolError {
    fn from(e: rusqlite::Error) -> Self {
        PoolError::Database(e.to_string())
    }
}

impl From<std::io::Error> for PoolError {
    fn from(e: std::io::Error) -> Self {
        PoolError::Database(e.to_string())
    }
}

pub type PoolResult<T> = Result<T, PoolError>;
