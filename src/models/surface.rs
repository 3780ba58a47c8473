//! Packed volatility-surface coefficients.
//!
//! Six signed 42-bit coefficients share one 256-bit word, first coefficient
//! in the most significant position: coefficient `i` occupies bits
//! `[42 * (5 - i), 42 * (6 - i))`. The top four bits are unused and must
//! be zero.

use crate::errors::{MathError, MathResult};
use crate::math::wide::{self, U256};
use crate::math::Fixed64;

pub const COEFFICIENT_COUNT: usize = 6;
const COEFFICIENT_BITS: u32 = 42;
const COEFFICIENT_MASK: u128 = (1 << COEFFICIENT_BITS) - 1;
/// Open bound: valid coefficients lie strictly inside (-2^41, 2^41)
const COEFFICIENT_LIMIT: i64 = 1 << (COEFFICIENT_BITS - 1);
/// Stored integers are the real coefficient times 1e10
const COEFFICIENT_SCALE: i128 = 10_000_000_000;

pub fn encode_coefficients(coefficients: &[i64; COEFFICIENT_COUNT]) -> MathResult<U256> {
    let mut word = U256::ZERO;
    for (index, &c) in coefficients.iter().enumerate() {
        if c <= -COEFFICIENT_LIMIT || c >= COEFFICIENT_LIMIT {
            return Err(MathError::CoefficientOutOfRange { index });
        }
        let bits = (c as i128 as u128) & COEFFICIENT_MASK;
        word |= U256::from(bits) << shift_of(index);
    }
    Ok(word)
}

pub fn decode_coefficients(word: U256) -> MathResult<[i64; COEFFICIENT_COUNT]> {
    if word.into_words().0 >> 124 != 0 {
        return Err(MathError::Undefined("unused surface bits set"));
    }
    let mut out = [0i64; COEFFICIENT_COUNT];
    for (index, slot) in out.iter_mut().enumerate() {
        let bits = (word >> shift_of(index)).into_words().1 & COEFFICIENT_MASK;
        // sign-extend from bit 41
        *slot = (((bits << (128 - COEFFICIENT_BITS)) as i128) >> (128 - COEFFICIENT_BITS)) as i64;
        if *slot <= -COEFFICIENT_LIMIT {
            return Err(MathError::CoefficientOutOfRange { index });
        }
    }
    Ok(out)
}

#[inline]
fn shift_of(index: usize) -> u32 {
    COEFFICIENT_BITS * (COEFFICIENT_COUNT - 1 - index) as u32
}

/// Implied volatility as a quadratic in time to maturity `T` (years) and
/// log-moneyness `M = ln(K / S)`:
///
/// `iv = c0*T^2 + c1*M^2 + c2*T*M + c3*T + c4*M + c5`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VolatilitySurface {
    coefficients: [Fixed64; COEFFICIENT_COUNT],
}

impl VolatilitySurface {
    pub fn from_packed(word: U256) -> MathResult<Self> {
        let raw = decode_coefficients(word)?;
        let mut coefficients = [Fixed64::ZERO; COEFFICIENT_COUNT];
        for (dst, &c) in coefficients.iter_mut().zip(raw.iter()) {
            *dst = Fixed64::divi(c as i128, COEFFICIENT_SCALE)?;
        }
        Ok(Self { coefficients })
    }

    pub fn from_hex(s: &str) -> MathResult<Self> {
        let word = wide::parse_hex(s).ok_or(MathError::Undefined("malformed surface word"))?;
        Self::from_packed(word)
    }

    /// Either a packed `0x` word or six comma-separated raw coefficients
    /// (real value times 1e10).
    pub fn parse(s: &str) -> MathResult<Self> {
        let s = s.trim();
        if s.starts_with("0x") {
            return Self::from_hex(s);
        }
        let mut coefficients = [0i64; COEFFICIENT_COUNT];
        let mut parts = s.split(',');
        for slot in coefficients.iter_mut() {
            *slot = parts
                .next()
                .and_then(|p| p.trim().parse::<i64>().ok())
                .ok_or(MathError::Undefined("expected six integer coefficients"))?;
        }
        if parts.next().is_some() {
            return Err(MathError::Undefined("expected six integer coefficients"));
        }
        Self::from_packed(encode_coefficients(&coefficients)?)
    }

    pub fn annualized_volatility(
        &self,
        spot: Fixed64,
        strike: Fixed64,
        time_to_maturity: Fixed64,
    ) -> MathResult<Fixed64> {
        let t = time_to_maturity;
        let m = strike.checked_div(spot)?.ln()?;
        let [c0, c1, c2, c3, c4, c5] = self.coefficients;

        let terms = [
            c0.checked_mul(t.checked_mul(t)?)?,
            c1.checked_mul(m.checked_mul(m)?)?,
            c2.checked_mul(t.checked_mul(m)?)?,
            c3.checked_mul(t)?,
            c4.checked_mul(m)?,
            c5,
        ];
        terms
            .iter()
            .try_fold(Fixed64::ZERO, |acc, term| acc.checked_add(*term))
    }

    /// Annualized variance, `iv^2`.
    pub fn annualized_variance(
        &self,
        spot: Fixed64,
        strike: Fixed64,
        time_to_maturity: Fixed64,
    ) -> MathResult<Fixed64> {
        let iv = self.annualized_volatility(spot, strike, time_to_maturity)?;
        iv.checked_mul(iv)
    }
}
