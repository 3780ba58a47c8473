pub mod black_scholes;
pub mod liquidity;
pub mod quote;
pub mod surface;
pub mod volatility;

use crate::errors::MathResult;
use crate::math::Fixed64;

/// Source of the annualized variance fed into the pricer.
/// Must be a pure read: pricing never mutates the model.
pub trait VarianceModel: Send + Sync {
    fn name(&self) -> &'static str;

    fn annualized_variance(
        &self,
        spot: Fixed64,
        strike: Fixed64,
        time_to_maturity: Fixed64,
    ) -> MathResult<Fixed64>;
}

impl VarianceModel for volatility::VolatilityEstimator {
    fn name(&self) -> &'static str {
        "rolling-ema"
    }

    /// Flat across strikes and maturities.
    fn annualized_variance(&self, _: Fixed64, _: Fixed64, _: Fixed64) -> MathResult<Fixed64> {
        volatility::VolatilityEstimator::annualized_variance(self)
    }
}

impl VarianceModel for surface::VolatilitySurface {
    fn name(&self) -> &'static str {
        "surface"
    }

    fn annualized_variance(
        &self,
        spot: Fixed64,
        strike: Fixed64,
        time_to_maturity: Fixed64,
    ) -> MathResult<Fixed64> {
        surface::VolatilitySurface::annualized_variance(self, spot, strike, time_to_maturity)
    }
}
