use super::wide::{isqrt, narrow, U256};
use crate::errors::{MathError, MathResult};
use std::fmt;

/// ln(2) as a 0.128 fraction
const LN2_Q128: u128 = 0xb17217f7d1cf79abc9e3b39803f2f6af;
/// ln(2) as 64.64
const LN2_BITS: i128 = 0xb17217f7d1cf79ab;
/// log2(e) as 64.64
const LOG2E_BITS: i128 = 0x171547652b82fe177;
/// Taylor terms needed for |r| <= ln(2)/2 to reach 2^-64
const EXP_MAX_TERMS: i128 = 32;

/// Signed 64.64 binary fixed-point number: `bits / 2^64`.
///
/// Deterministic across platforms. Every fallible operation returns
/// [`MathError`] instead of wrapping or saturating.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Fixed64(i128);

impl Fixed64 {
    pub const ZERO: Fixed64 = Fixed64(0);
    pub const ONE: Fixed64 = Fixed64(1 << 64);
    pub const TWO: Fixed64 = Fixed64(2 << 64);
    pub const HALF: Fixed64 = Fixed64(1 << 63);

    #[inline]
    pub const fn from_bits(bits: i128) -> Self {
        Self(bits)
    }

    #[inline]
    pub const fn to_bits(self) -> i128 {
        self.0
    }

    #[inline]
    pub const fn from_int(value: i64) -> Self {
        Self((value as i128) << 64)
    }

    /// Integer part, rounded toward negative infinity.
    #[inline]
    pub const fn to_int(self) -> i64 {
        (self.0 >> 64) as i64
    }

    /// `numerator / denominator` for unsigned integers.
    pub fn divu(numerator: u128, denominator: u128) -> MathResult<Self> {
        if denominator == 0 {
            return Err(MathError::DivisionByZero);
        }
        let quotient = narrow((U256::from(numerator) << 64u32) / U256::from(denominator))
            .ok_or(MathError::Overflow)?;
        to_signed(quotient, false)
    }

    /// `numerator / denominator` for signed integers.
    pub fn divi(numerator: i128, denominator: i128) -> MathResult<Self> {
        if denominator == 0 {
            return Err(MathError::DivisionByZero);
        }
        let negative = (numerator < 0) != (denominator < 0);
        let magnitude = Self::divu(numerator.unsigned_abs(), denominator.unsigned_abs())?;
        if negative {
            magnitude.checked_neg()
        } else {
            Ok(magnitude)
        }
    }

    /// `floor(self * y)` as an unsigned integer. `self` must be non-negative.
    pub fn mulu(self, y: u128) -> MathResult<u128> {
        if self.0 < 0 {
            return Err(MathError::Undefined("mulu of a negative value"));
        }
        narrow((U256::from(self.0 as u128) * U256::from(y)) >> 64u32).ok_or(MathError::Overflow)
    }

    /// Token amount with `decimals` places to 64.64.
    pub fn from_decimals(amount: u128, decimals: u8) -> MathResult<Self> {
        Self::divu(amount, pow10(decimals)?)
    }

    /// Lossy boundary conversion for configuration and API input.
    pub fn from_f64(value: f64) -> MathResult<Self> {
        if !value.is_finite() {
            return Err(MathError::Undefined("non-finite input"));
        }
        let scaled = value * 18_446_744_073_709_551_616.0;
        if scaled >= 1.7014118346046923e38 || scaled < -1.7014118346046923e38 {
            return Err(MathError::Overflow);
        }
        Ok(Self(scaled as i128))
    }

    #[inline]
    pub fn to_f64(self) -> f64 {
        self.0 as f64 / 18_446_744_073_709_551_616.0
    }

    #[inline]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn is_positive(self) -> bool {
        self.0 > 0
    }

    pub fn checked_add(self, rhs: Self) -> MathResult<Self> {
        self.0.checked_add(rhs.0).map(Self).ok_or(MathError::Overflow)
    }

    pub fn checked_sub(self, rhs: Self) -> MathResult<Self> {
        self.0.checked_sub(rhs.0).map(Self).ok_or(MathError::Overflow)
    }

    pub fn checked_neg(self) -> MathResult<Self> {
        self.0.checked_neg().map(Self).ok_or(MathError::Overflow)
    }

    pub fn checked_abs(self) -> MathResult<Self> {
        self.0.checked_abs().map(Self).ok_or(MathError::Overflow)
    }

    pub fn checked_mul(self, rhs: Self) -> MathResult<Self> {
        let negative = (self.0 < 0) != (rhs.0 < 0);
        let product = U256::from(self.0.unsigned_abs()) * U256::from(rhs.0.unsigned_abs());
        let product = narrow(product >> 64u32).ok_or(MathError::Overflow)?;
        to_signed(product, negative)
    }

    pub fn checked_div(self, rhs: Self) -> MathResult<Self> {
        if rhs.0 == 0 {
            return Err(MathError::DivisionByZero);
        }
        let negative = (self.0 < 0) != (rhs.0 < 0);
        let a = self.0.unsigned_abs();
        let quotient = narrow((U256::from(a) << 64u32) / U256::from(rhs.0.unsigned_abs()))
            .ok_or(MathError::Overflow)?;
        to_signed(quotient, negative)
    }

    pub fn sqrt(self) -> MathResult<Self> {
        if self.0 < 0 {
            return Err(MathError::Undefined("square root of a negative value"));
        }
        let root = isqrt(U256::from(self.0 as u128) << 64u32);
        to_signed(root, false)
    }

    /// Binary logarithm, bit-by-bit on the normalized mantissa.
    pub fn log2(self) -> MathResult<Self> {
        if self.0 <= 0 {
            return Err(MathError::Undefined("logarithm of a non-positive value"));
        }
        let x = self.0 as u128;
        let msb = 127 - x.leading_zeros() as i128;
        let mut result: i128 = (msb - 64) << 64;
        let mut ux: u128 = x << (127 - msb);

        let mut bit: i128 = 1 << 63;
        while bit > 0 {
            let square = U256::from(ux) * U256::from(ux);
            let b = (square.into_words().0 >> 127) as u32;
            // below 2^128 after the normalizing shift
            ux = (square >> (127 + b)).into_words().1;
            if b == 1 {
                result += bit;
            }
            bit >>= 1;
        }
        Ok(Self(result))
    }

    pub fn ln(self) -> MathResult<Self> {
        let log2 = self.log2()?.0;
        let magnitude = ((U256::from(log2.unsigned_abs()) * U256::from(LN2_Q128)) >> 128u32).into_words().1;
        to_signed(magnitude, log2 < 0)
    }

    /// Natural exponent via `e^x = 2^k * e^r`, `|r| <= ln(2)/2`, with a
    /// Taylor series on `r`. Inputs below -64 are exactly zero at 2^-64
    /// resolution.
    pub fn exp(self) -> MathResult<Self> {
        if self.0 < -(64 << 64) {
            return Ok(Self::ZERO);
        }
        let k = self
            .checked_mul(Self(LOG2E_BITS))?
            .checked_add(Self::HALF)?
            .to_int() as i128;
        if k > 126 {
            return Err(MathError::Overflow);
        }
        let r = self.0 - k * LN2_BITS;

        let mut sum: i128 = 1 << 64;
        let mut term: i128 = 1 << 64;
        let mut n: i128 = 1;
        while n <= EXP_MAX_TERMS {
            term = ((term * r) >> 64) / n;
            if term == 0 {
                break;
            }
            sum += term;
            n += 1;
        }

        if k >= 0 {
            sum.checked_mul(1i128 << k)
                .map(Self)
                .ok_or(MathError::Overflow)
        } else {
            Ok(Self(sum >> (-k).min(127)))
        }
    }
}

fn to_signed(magnitude: u128, negative: bool) -> MathResult<Fixed64> {
    if negative {
        if magnitude > 1u128 << 127 {
            return Err(MathError::Overflow);
        }
        Ok(Fixed64((magnitude as i128).wrapping_neg()))
    } else {
        if magnitude > i128::MAX as u128 {
            return Err(MathError::Overflow);
        }
        Ok(Fixed64(magnitude as i128))
    }
}

fn pow10(decimals: u8) -> MathResult<u128> {
    10u128
        .checked_pow(decimals as u32)
        .ok_or(MathError::Overflow)
}

impl fmt::Debug for Fixed64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fixed64({})", self.to_f64())
    }
}

impl fmt::Display for Fixed64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_f64())
    }
}

impl serde::Serialize for Fixed64 {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.to_f64())
    }
}

impl<'de> serde::Deserialize<'de> for Fixed64 {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = f64::deserialize(deserializer)?;
        Fixed64::from_f64(value).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fx(v: f64) -> Fixed64 {
        Fixed64::from_f64(v).unwrap()
    }

    #[test]
    fn test_integer_round_trip() {
        assert_eq!(Fixed64::from_int(7).to_int(), 7);
        assert_eq!(Fixed64::from_int(-3).to_int(), -3);
        assert_eq!(fx(-0.5).to_int(), -1);
        assert_eq!(Fixed64::from_int(1), Fixed64::ONE);
    }

    #[test]
    fn test_mul_div() {
        let a = fx(1.5);
        let b = fx(-2.25);
        assert_eq!(a.checked_mul(b).unwrap(), fx(-3.375));
        assert_eq!(fx(-3.375).checked_div(b).unwrap(), a);
        assert_eq!(a.checked_div(Fixed64::ZERO), Err(MathError::DivisionByZero));
    }

    #[test]
    fn test_overflow_is_reported() {
        let max = Fixed64::from_bits(i128::MAX);
        assert_eq!(max.checked_add(Fixed64::ONE), Err(MathError::Overflow));
        let big = Fixed64::from_int(1 << 62);
        assert_eq!(big.checked_mul(big), Err(MathError::Overflow));
        assert_eq!(Fixed64::from_bits(i128::MIN).checked_neg(), Err(MathError::Overflow));
        assert_eq!(Fixed64::from_bits(i128::MIN).checked_div(fx(-1.0)), Err(MathError::Overflow));
        assert_eq!(Fixed64::from_int(50).exp(), Err(MathError::Overflow));
    }

    #[test]
    fn test_divu_and_decimals() {
        assert_eq!(Fixed64::divu(1, 4).unwrap(), fx(0.25));
        let amount = 1_500_000_000_000_000_000u128;
        let v = Fixed64::from_decimals(amount, 18).unwrap();
        assert!((v.to_f64() - 1.5).abs() < 1e-15);
        assert_eq!(fx(2.5).mulu(1_000_000).unwrap(), 2_500_000);
        assert_eq!(Fixed64::divi(-3, 4).unwrap(), fx(-0.75));
    }

    #[test]
    fn test_mulu() {
        assert_eq!(fx(0.5).mulu(101).unwrap(), 50);
        assert!(fx(-0.5).mulu(2).is_err());
    }

    #[test]
    fn test_exp_ln() {
        for x in [-40.0, -3.5, -0.7, 0.0, 0.01, 0.5, 1.0, 5.0, 20.0] {
            let got = fx(x).exp().unwrap().to_f64();
            let want = f64::exp(x);
            assert!((got - want).abs() <= want * 1e-12 + 1e-18, "exp({x}) = {got}, want {want}");
        }
        for x in [0.001, 0.3, 1.0, 2.0, 10.0, 12345.678, 1e6] {
            let got = fx(x).ln().unwrap().to_f64();
            assert!((got - x.ln()).abs() < 1e-12, "ln({x}) = {got}");
        }
        assert_eq!(Fixed64::ONE.ln().unwrap(), Fixed64::ZERO);
        assert_eq!(Fixed64::from_int(-80).exp().unwrap(), Fixed64::ZERO);
        assert!(Fixed64::ZERO.ln().is_err());
    }

    #[test]
    fn test_log2_exact_powers() {
        assert_eq!(Fixed64::from_int(8).log2().unwrap(), Fixed64::from_int(3));
        assert_eq!(fx(0.25).log2().unwrap(), Fixed64::from_int(-2));
    }

    #[test]
    fn test_sqrt() {
        assert_eq!(Fixed64::from_int(9).sqrt().unwrap(), Fixed64::from_int(3));
        assert_eq!(fx(0.25).sqrt().unwrap(), fx(0.5));
        let got = Fixed64::TWO.sqrt().unwrap().to_f64();
        assert!((got - std::f64::consts::SQRT_2).abs() < 1e-15);
        assert!(fx(-1.0).sqrt().is_err());
    }

    #[test]
    fn test_serde_as_number() {
        let json = serde_json::to_string(&fx(1.25)).unwrap();
        assert_eq!(json, "1.25");
        let back: Fixed64 = serde_json::from_str(&json).unwrap();
        assert_eq!(back, fx(1.25));
    }
}
