//! 256-bit unsigned intermediates.
//!
//! 64.64 multiplication, division and square root all need more than 128
//! bits before they are narrowed back. Token amount `a * b / d` does too.

pub use ethnum::U256;

/// Low word when the high word is clear.
#[inline]
pub fn narrow(value: U256) -> Option<u128> {
    let (hi, lo) = value.into_words();
    if hi == 0 {
        Some(lo)
    } else {
        None
    }
}

/// `floor(a * b / d)`, `None` on zero divisor or a quotient past u128.
#[inline]
pub fn mul_div(a: u128, b: u128, d: u128) -> Option<u128> {
    if d == 0 {
        return None;
    }
    narrow(U256::from(a) * U256::from(b) / U256::from(d))
}

/// `floor(sqrt(x))` by Newton iteration from above.
pub fn isqrt(x: U256) -> u128 {
    if x == U256::ZERO {
        return 0;
    }
    let bits = 256 - x.leading_zeros();
    let mut root = U256::ONE << ((bits + 1) / 2);
    loop {
        let next = (root + x / root) >> 1u32;
        if next >= root {
            break;
        }
        root = next;
    }
    // the root of a 256-bit value fits in 128 bits
    root.into_words().1
}

/// `0x`-prefixed, 64 hex digits.
pub fn to_hex(value: U256) -> String {
    let (hi, lo) = value.into_words();
    format!("0x{hi:032x}{lo:032x}")
}

/// Accepts up to 64 hex digits with optional `0x` prefix.
pub fn parse_hex(s: &str) -> Option<U256> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    if digits.is_empty() || digits.len() > 64 || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    U256::from_str_radix(digits, 16).ok()
}
