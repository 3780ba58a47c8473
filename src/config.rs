use crate::errors::{PoolError, PoolResult};
use crate::math::Fixed64;
use crate::models::surface::VolatilitySurface;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server_port: u16,
    pub data_dir: PathBuf,
    pub underlying_decimals: u8,
    pub base_decimals: u8,
    pub fee_rate: f64,
    pub steepness: f64,
    pub min_apy: f64,
    pub initial_variance_annualized: f64,
    pub initial_spot_price: Option<f64>,
    pub call_surface: Option<String>,
    pub put_surface: Option<String>,
    pub keeper_interval_secs: u64,
}

impl AppConfig {
    pub fn from_env() -> PoolResult<Self> {
        dotenvy::dotenv().ok();

        let server_port = parse_var("SERVER_PORT", "3001")?;
        let underlying_decimals = parse_var("UNDERLYING_DECIMALS", "18")?;
        let base_decimals = parse_var("BASE_DECIMALS", "18")?;
        let fee_rate = parse_var("FEE_RATE", "0.03")?;
        let steepness = parse_var("STEEPNESS", "1.0")?;
        let min_apy = parse_var("MIN_APY", "0.0")?;
        let initial_variance_annualized = parse_var("INITIAL_VARIANCE_ANNUALIZED", "0.16")?;
        let keeper_interval_secs = parse_var("KEEPER_INTERVAL_SECS", "60")?;

        let initial_spot_price = match optional_var("INITIAL_SPOT_PRICE") {
            Some(v) => Some(
                v.parse::<f64>()
                    .map_err(|e| PoolError::Config(format!("INITIAL_SPOT_PRICE: {e}")))?,
            ),
            None => None,
        };

        let cfg = Self {
            server_port,
            data_dir: PathBuf::from(env_var_or("DATA_DIR", "data")),
            underlying_decimals,
            base_decimals,
            fee_rate,
            steepness,
            min_apy,
            initial_variance_annualized,
            initial_spot_price,
            call_surface: optional_var("CALL_SURFACE"),
            put_surface: optional_var("PUT_SURFACE"),
            keeper_interval_secs,
        };
        // fail at startup, not on the first quote
        cfg.pool_config()?;
        Ok(cfg)
    }

    /// Numeric pool parameters, validated and converted to 64.64.
    pub fn pool_config(&self) -> PoolResult<PoolConfig> {
        if !(0.0..1.0).contains(&self.fee_rate) {
            return Err(PoolError::Config(format!("FEE_RATE must be in [0, 1), got {}", self.fee_rate)));
        }
        if self.steepness <= 0.0 {
            return Err(PoolError::Config("STEEPNESS must be positive".into()));
        }
        if self.min_apy < 0.0 {
            return Err(PoolError::Config("MIN_APY must not be negative".into()));
        }
        if self.underlying_decimals > 30 || self.base_decimals > 30 {
            return Err(PoolError::Config("token decimals above 30 are not supported".into()));
        }

        let fixed = |name: &str, v: f64| {
            Fixed64::from_f64(v).map_err(|e| PoolError::Config(format!("{name}: {e}")))
        };
        let surface = |name: &str, v: &Option<String>| -> PoolResult<Option<VolatilitySurface>> {
            v.as_deref()
                .map(|raw| VolatilitySurface::parse(raw).map_err(|e| PoolError::Config(format!("{name}: {e}"))))
                .transpose()
        };

        Ok(PoolConfig {
            underlying_decimals: self.underlying_decimals,
            base_decimals: self.base_decimals,
            fee_rate: fixed("FEE_RATE", self.fee_rate)?,
            steepness: fixed("STEEPNESS", self.steepness)?,
            min_apy: fixed("MIN_APY", self.min_apy)?,
            initial_variance: fixed("INITIAL_VARIANCE_ANNUALIZED", self.initial_variance_annualized)?,
            call_surface: surface("CALL_SURFACE", &self.call_surface)?,
            put_surface: surface("PUT_SURFACE", &self.put_surface)?,
        })
    }
}

/// Pool parameters in engine units.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub underlying_decimals: u8,
    pub base_decimals: u8,
    pub fee_rate: Fixed64,
    pub steepness: Fixed64,
    pub min_apy: Fixed64,
    pub initial_variance: Fixed64,
    pub call_surface: Option<VolatilitySurface>,
    pub put_surface: Option<VolatilitySurface>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            underlying_decimals: 18,
            base_decimals: 18,
            fee_rate: Fixed64::from_bits(0x7ae147ae147ae14), // 0.03
            steepness: Fixed64::ONE,
            min_apy: Fixed64::ZERO,
            initial_variance: Fixed64::from_bits(0x28f5c28f5c28f5c2), // 0.16
            call_surface: None,
            put_surface: None,
        }
    }
}

fn parse_var<T>(key: &str, default: &str) -> PoolResult<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    env_var_or(key, default)
        .parse::<T>()
        .map_err(|e| PoolError::Config(format!("{key}: {e}")))
}

fn optional_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_var_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> AppConfig {
        AppConfig {
            server_port: 3001,
            data_dir: PathBuf::from("data"),
            underlying_decimals: 18,
            base_decimals: 6,
            fee_rate: 0.03,
            steepness: 1.0,
            min_apy: 0.0,
            initial_variance_annualized: 0.16,
            initial_spot_price: None,
            call_surface: None,
            put_surface: None,
            keeper_interval_secs: 60,
        }
    }

    #[test]
    fn test_default_constants_match_env_defaults() {
        let derived = base().pool_config().unwrap();
        let defaults = PoolConfig::default();
        assert!((derived.fee_rate.to_f64() - defaults.fee_rate.to_f64()).abs() < 1e-15);
        assert!((derived.initial_variance.to_f64() - defaults.initial_variance.to_f64()).abs() < 1e-15);
        assert_eq!(derived.base_decimals, 6);
    }

    #[test]
    fn test_rejects_bad_values() {
        let mut cfg = base();
        cfg.fee_rate = 1.0;
        assert!(cfg.pool_config().is_err());

        let mut cfg = base();
        cfg.steepness = 0.0;
        assert!(cfg.pool_config().is_err());

        let mut cfg = base();
        cfg.call_surface = Some("0xnothex".into());
        let err = cfg.pool_config().unwrap_err();
        assert_eq!(err.kind(), "config");
    }

    #[test]
    fn test_surface_parsed() {
        let mut cfg = base();
        cfg.put_surface = Some("0x2a".into());
        assert!(cfg.pool_config().unwrap().put_surface.is_some());

        cfg.call_surface = Some("0,0,0,0,0,4000000000".into());
        assert!(cfg.pool_config().unwrap().call_surface.is_some());
    }
}
