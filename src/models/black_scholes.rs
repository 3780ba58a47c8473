use crate::errors::MathResult;
use crate::math::Fixed64;

/// Choudhury's normal CDF constants with sqrt(2*pi) folded in:
/// 0.226, 0.64 and 0.33, each times sqrt(2*pi), as 64.64.
const CDF_CONST_0: Fixed64 = Fixed64::from_bits(0x9106032495f763cc);
const CDF_CONST_1: Fixed64 = Fixed64::from_bits(0x19aaf9c282c14ed4e);
const CDF_CONST_2: Fixed64 = Fixed64::from_bits(0xd3c28c84b6baca5c);

/// European option inputs. `variance` is annualized and
/// `time_to_maturity` is in years.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OptionParams {
    pub variance: Fixed64,
    pub strike: Fixed64,
    pub spot: Fixed64,
    pub time_to_maturity: Fixed64,
    pub is_call: bool,
}

/// Standard normal CDF, Choudhury's rational approximation.
///
/// The tail value depends only on |x|, so N(x) + N(-x) == 1 exactly.
pub fn normal_cdf(x: Fixed64) -> MathResult<Fixed64> {
    let x2 = x.checked_mul(x)?;
    let numerator = x2.checked_div(Fixed64::TWO)?.checked_neg()?.exp()?;
    let denominator = CDF_CONST_0
        .checked_add(CDF_CONST_1.checked_mul(x.checked_abs()?)?)?
        .checked_add(CDF_CONST_2.checked_mul(x2.checked_add(Fixed64::from_int(3))?.sqrt()?)?)?;
    let value = numerator.checked_div(denominator)?;

    if x.is_positive() {
        Fixed64::ONE.checked_sub(value)
    } else {
        Ok(value)
    }
}

/// Closed-form Black-Scholes price with zero rates.
///
/// All inputs must be strictly positive: zero variance or strike fails
/// with `DivisionByZero`, a non-positive spot with `Undefined`.
pub fn black_scholes_price(params: &OptionParams) -> MathResult<Fixed64> {
    let cum_var = params.time_to_maturity.checked_mul(params.variance)?;
    let cum_vol = cum_var.sqrt()?;

    let ln_moneyness = params.spot.checked_div(params.strike)?.ln()?;
    let d1 = ln_moneyness
        .checked_add(cum_var.checked_div(Fixed64::TWO)?)?
        .checked_div(cum_vol)?;
    let d2 = d1.checked_sub(cum_vol)?;

    if params.is_call {
        params
            .spot
            .checked_mul(normal_cdf(d1)?)?
            .checked_sub(params.strike.checked_mul(normal_cdf(d2)?)?)
    } else {
        params
            .strike
            .checked_mul(normal_cdf(d2.checked_neg()?)?)?
            .checked_sub(params.spot.checked_mul(normal_cdf(d1.checked_neg()?)?)?)
    }
}
