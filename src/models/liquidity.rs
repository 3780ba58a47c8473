use crate::errors::MathResult;
use crate::math::Fixed64;

/// Rebase the C-Level after pool liquidity moves from `old_liquidity` to
/// `new_liquidity`:
///
/// `c * exp(-steepness * (new - old) / max(old, new))`
///
/// Withdrawals raise the level, deposits lower it. The larger side is the
/// denominator so the exponent stays within `[-steepness, steepness]`.
pub fn calculate_c_level(
    old_c_level: Fixed64,
    old_liquidity: Fixed64,
    new_liquidity: Fixed64,
    steepness: Fixed64,
) -> MathResult<Fixed64> {
    if old_liquidity == new_liquidity {
        return Ok(old_c_level);
    }

    let change = new_liquidity.checked_sub(old_liquidity)?;
    let exponent = steepness
        .checked_mul(change)?
        .checked_div(old_liquidity.max(new_liquidity))?
        .checked_neg()?;

    old_c_level.checked_mul(exponent.exp()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fx(v: f64) -> Fixed64 {
        Fixed64::from_f64(v).unwrap()
    }

    #[test]
    fn test_unchanged_liquidity_keeps_level() {
        for (c, s, k) in [(1.0, 100.0, 1.0), (2.7, 0.0, 0.5), (0.3, 1e9, 4.0)] {
            assert_eq!(calculate_c_level(fx(c), fx(s), fx(s), fx(k)).unwrap(), fx(c));
        }
    }

    #[test]
    fn test_withdrawal_raises_level() {
        let c = calculate_c_level(Fixed64::ONE, fx(100.0), fx(20.0), Fixed64::ONE)
            .unwrap()
            .to_f64();
        assert!((c - 2.2255409285).abs() < 1e-9, "c = {c}");
    }

    #[test]
    fn test_deposit_lowers_level() {
        let c = calculate_c_level(Fixed64::ONE, fx(20.0), fx(100.0), Fixed64::ONE)
            .unwrap()
            .to_f64();
        assert!((c - 0.4493289641).abs() < 1e-9, "c = {c}");
    }

    #[test]
    fn test_first_deposit_into_empty_pool() {
        let c = calculate_c_level(fx(1.0), Fixed64::ZERO, fx(50.0), fx(2.0))
            .unwrap()
            .to_f64();
        assert!((c - (-2.0f64).exp()).abs() < 1e-12);
    }
}
