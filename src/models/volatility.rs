use crate::errors::{MathError, MathResult};
use crate::math::Fixed64;

/// Reference window of the time-weighted decay (one week)
pub const DECAY_WINDOW_SECS: u64 = 7 * 86_400;

/// Variance increments are normalized per hour of elapsed time
const SECONDS_PER_HOUR: u128 = 3_600;

const DAYS_PER_YEAR: i64 = 365;

/// Weight given to a new observation after `t_new - t_old` seconds:
/// `1 - exp(-(t_new - t_old) / window)`.
pub fn decay(t_old: u64, t_new: u64) -> MathResult<Fixed64> {
    let elapsed = t_new
        .checked_sub(t_old)
        .ok_or(MathError::Undefined("decay over a negative interval"))?;
    let ratio = Fixed64::divu(elapsed as u128, DECAY_WINDOW_SECS as u128)?;
    Fixed64::ONE.checked_sub(ratio.checked_neg()?.exp()?)
}

/// EMA over unevenly spaced samples, weighted by elapsed time rather than
/// sample count.
pub fn rolling_ema(
    old_ema: Fixed64,
    log_return: Fixed64,
    t_old: u64,
    t_new: u64,
) -> MathResult<Fixed64> {
    let omega = decay(t_old, t_new)?;
    ema_step(old_ema, log_return, omega)
}

/// Welford-style online variance for uneven sampling. Returns
/// `(new_ema, new_variance)`; the variance is not annualized.
pub fn rolling_ema_variance(
    old_ema: Fixed64,
    old_variance: Fixed64,
    log_return: Fixed64,
    t_old: u64,
    t_new: u64,
) -> MathResult<(Fixed64, Fixed64)> {
    let new_ema = rolling_ema(old_ema, log_return, t_old, t_new)?;
    let omega = decay(t_old, t_new)?;
    let delta = Fixed64::divu((t_new - t_old) as u128, SECONDS_PER_HOUR)?;

    let carried = Fixed64::ONE.checked_sub(omega)?.checked_mul(old_variance)?;
    let innovation = omega
        .checked_mul(log_return.checked_sub(old_ema)?)?
        .checked_mul(log_return.checked_sub(new_ema)?)?
        .checked_div(delta)?;

    Ok((new_ema, carried.checked_add(innovation)?))
}

#[inline]
fn ema_step(old_ema: Fixed64, sample: Fixed64, omega: Fixed64) -> MathResult<Fixed64> {
    let fresh = sample.checked_mul(omega)?;
    let kept = old_ema.checked_mul(Fixed64::ONE.checked_sub(omega)?)?;
    fresh.checked_add(kept)
}

/// Estimator state. `ema_variance` is stored raw and only annualized on
/// read, so repeated updates never round-trip through the x365 scaling.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct VolatilityState {
    pub ema_log_return: Fixed64,
    pub ema_variance: Fixed64,
    pub last_update: u64,
    pub last_price: Fixed64,
    pub sample_count: u64,
}

/// Rolling log-return volatility estimator. Maintains state across
/// price observations; every update is an in-place state transition.
#[derive(Debug, Clone)]
pub struct VolatilityEstimator {
    pub state: VolatilityState,
}

impl VolatilityEstimator {
    pub fn new(initial_annualized_variance: Fixed64) -> MathResult<Self> {
        if !initial_annualized_variance.is_positive() {
            return Err(MathError::Undefined("initial variance must be positive"));
        }
        let raw = initial_annualized_variance.checked_div(Fixed64::from_int(DAYS_PER_YEAR))?;
        Ok(Self {
            state: VolatilityState {
                ema_log_return: Fixed64::ZERO,
                ema_variance: raw,
                last_update: 0,
                last_price: Fixed64::ZERO,
                sample_count: 0,
            },
        })
    }

    /// Feed a new price observation. The first observation only seeds the
    /// reference price; observations at or before `last_update` are ignored.
    pub fn update(&mut self, price: Fixed64, timestamp: u64) -> MathResult<()> {
        if !price.is_positive() {
            return Err(MathError::Undefined("price must be positive"));
        }

        if self.state.last_price.is_zero() {
            self.state.last_price = price;
            self.state.last_update = timestamp;
            return Ok(());
        }

        if timestamp <= self.state.last_update {
            return Ok(());
        }

        let log_return = price.checked_div(self.state.last_price)?.ln()?;
        let (ema, variance) = rolling_ema_variance(
            self.state.ema_log_return,
            self.state.ema_variance,
            log_return,
            self.state.last_update,
            timestamp,
        )?;

        self.state = VolatilityState {
            ema_log_return: ema,
            ema_variance: variance,
            last_update: timestamp,
            last_price: price,
            sample_count: self.state.sample_count + 1,
        };
        Ok(())
    }

    #[inline]
    pub fn annualized_variance(&self) -> MathResult<Fixed64> {
        self.state
            .ema_variance
            .checked_mul(Fixed64::from_int(DAYS_PER_YEAR))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: u64 = 1_616_543_600;

    fn fx(v: f64) -> Fixed64 {
        Fixed64::from_f64(v).unwrap()
    }

    fn assert_close(got: Fixed64, want: f64) {
        let got = got.to_f64();
        assert!(
            (got - want).abs() <= want.abs() * 1e-3,
            "got {got}, want {want}"
        );
    }

    #[test]
    fn test_decay_one_day() {
        assert_close(decay(T0, T0 + 86_400).unwrap(), 0.1331221002);
        assert_eq!(decay(T0, T0).unwrap(), Fixed64::ZERO);
        assert!(decay(T0 + 1, T0).is_err());
    }

    #[test]
    fn test_rolling_ema_three_days() {
        let ema = rolling_ema(fx(0.000001), fx(0.013508), T0, T0 + 3 * 86_400).unwrap();
        assert_close(ema, 0.00470901265);
    }

    #[test]
    fn test_rolling_ema_variance_matches_float() {
        let (old_ema, old_var, r) = (0.001, 0.0004, 0.02);
        let dt = 7_200u64;
        let (ema, var) =
            rolling_ema_variance(fx(old_ema), fx(old_var), fx(r), T0, T0 + dt).unwrap();

        let omega = 1.0 - (-(dt as f64) / DECAY_WINDOW_SECS as f64).exp();
        let want_ema = r * omega + old_ema * (1.0 - omega);
        let want_var = (1.0 - omega) * old_var + omega * (r - old_ema) * (r - want_ema) / 2.0;
        assert_close(ema, want_ema);
        assert_close(var, want_var);
    }

    #[test]
    fn test_same_timestamp_has_no_variance_step() {
        let err = rolling_ema_variance(fx(0.0), fx(0.1), fx(0.01), T0, T0);
        assert_eq!(err, Err(MathError::DivisionByZero));
    }

    #[test]
    fn test_estimator_seeds_then_updates() {
        let mut est = VolatilityEstimator::new(fx(0.16)).unwrap();
        assert_close(est.annualized_variance().unwrap(), 0.16);

        est.update(fx(100.0), T0).unwrap();
        assert_eq!(est.state.sample_count, 0);
        assert_eq!(est.state.last_update, T0);

        est.update(fx(101.0), T0 + 3_600).unwrap();
        assert_eq!(est.state.sample_count, 1);
        assert_eq!(est.state.last_price, fx(101.0));
        assert!(est.state.ema_log_return.is_positive());

        // replays at the same timestamp are ignored
        let before = est.state;
        est.update(fx(150.0), T0 + 3_600).unwrap();
        assert_eq!(est.state, before);
    }

    #[test]
    fn test_estimator_rejects_bad_inputs() {
        assert!(VolatilityEstimator::new(Fixed64::ZERO).is_err());
        let mut est = VolatilityEstimator::new(fx(0.16)).unwrap();
        assert!(est.update(Fixed64::ZERO, T0).is_err());
    }
}
