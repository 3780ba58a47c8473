use crate::errors::MathResult;
use crate::math::Fixed64;
use crate::models::black_scholes::{black_scholes_price, OptionParams};

/// Pool state before and after a hypothetical trade, plus the option
/// being priced.
#[derive(Debug, Clone, Copy)]
pub struct QuoteArgs {
    pub option: OptionParams,
    pub old_c_level: Fixed64,
    pub old_liquidity: Fixed64,
    pub new_liquidity: Fixed64,
    pub steepness: Fixed64,
    /// Minimum annualized yield on collateral. Zero disables the floor.
    pub min_apy: Fixed64,
}

/// Per-contract price in base units.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct QuoteOutput {
    pub price: Fixed64,
    pub c_level: Fixed64,
    pub slippage_coefficient: Fixed64,
}

/// `price = bs * c_level * slippage`, floored at intrinsic value plus the
/// minimum yield on the contract's collateral.
pub fn quote(args: &QuoteArgs) -> MathResult<QuoteOutput> {
    let delta_ratio = args
        .steepness
        .checked_mul(args.new_liquidity.checked_sub(args.old_liquidity)?)?
        .checked_div(args.old_liquidity)?;
    let trading_delta = delta_ratio.checked_neg()?.exp()?;

    let bsch = black_scholes_price(&args.option)?;
    let c_level = trading_delta.checked_mul(args.old_c_level)?;

    // limit of (1 - e^-x) / x at 0
    let slippage_coefficient = if delta_ratio.is_zero() {
        Fixed64::ONE
    } else {
        Fixed64::ONE
            .checked_sub(trading_delta)?
            .checked_div(delta_ratio)?
    };

    let price = bsch
        .checked_mul(c_level)?
        .checked_mul(slippage_coefficient)?
        .max(price_floor(args)?);

    Ok(QuoteOutput {
        price,
        c_level,
        slippage_coefficient,
    })
}

fn price_floor(args: &QuoteArgs) -> MathResult<Fixed64> {
    let opt = &args.option;
    let (intrinsic, collateral) = if opt.is_call {
        (opt.spot.checked_sub(opt.strike)?, opt.spot)
    } else {
        (opt.strike.checked_sub(opt.spot)?, opt.strike)
    };
    let carry = collateral
        .checked_mul(args.min_apy)?
        .checked_mul(opt.time_to_maturity)?;
    intrinsic.max(Fixed64::ZERO).checked_add(carry)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fx(v: f64) -> Fixed64 {
        Fixed64::from_f64(v).unwrap()
    }

    fn args(old_liquidity: f64, new_liquidity: f64) -> QuoteArgs {
        QuoteArgs {
            option: OptionParams {
                variance: fx(0.16),
                strike: fx(52_520.0),
                spot: fx(55_284.0),
                time_to_maturity: Fixed64::divu(28, 365).unwrap(),
                is_call: true,
            },
            old_c_level: Fixed64::ONE,
            old_liquidity: fx(old_liquidity),
            new_liquidity: fx(new_liquidity),
            steepness: Fixed64::ONE,
            min_apy: Fixed64::ZERO,
        }
    }

    #[test]
    fn test_no_liquidity_change_is_plain_black_scholes() {
        let a = args(100.0, 100.0);
        let q = quote(&a).unwrap();
        assert_eq!(q.slippage_coefficient, Fixed64::ONE);
        assert_eq!(q.c_level, Fixed64::ONE);
        assert_eq!(q.price, black_scholes_price(&a.option).unwrap());
    }

    #[test]
    fn test_utilization_raises_price() {
        let a = args(100.0, 80.0);
        let q = quote(&a).unwrap();
        let bs = black_scholes_price(&a.option).unwrap().to_f64();

        let ratio: f64 = -0.2;
        let delta = (-ratio).exp();
        let slippage = (1.0 - delta) / ratio;
        assert!((q.c_level.to_f64() - delta).abs() < 1e-12);
        assert!((q.slippage_coefficient.to_f64() - slippage).abs() < 1e-12);
        let want = bs * delta * slippage;
        assert!((q.price.to_f64() - want).abs() / want < 1e-9);
        assert!(q.price.to_f64() > bs);
    }

    #[test]
    fn test_floor_applies_to_deep_itm() {
        let mut a = args(100.0, 100.0);
        a.option.variance = fx(0.0001);
        a.option.strike = fx(30_000.0);
        a.min_apy = fx(0.1);
        let q = quote(&a).unwrap().price.to_f64();
        let floor = (55_284.0 - 30_000.0) + 55_284.0 * 0.1 * 28.0 / 365.0;
        assert!((q - floor).abs() < 1e-6, "price {q} floor {floor}");
    }

    #[test]
    fn test_empty_pool_cannot_quote() {
        assert!(quote(&args(0.0, 10.0)).is_err());
    }
}
