use crate::errors::{PoolError, PoolResult};
use crate::math::wide::{self, U256};
use crate::math::Fixed64;
use std::fmt;

/// Token classes held in a pool. Discriminants are part of the position-id
/// encoding and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum TokenType {
    UnderlyingFreeLiquidity = 0,
    BaseFreeLiquidity = 1,
    UnderlyingReservedLiquidity = 2,
    BaseReservedLiquidity = 3,
    LongCall = 4,
    ShortCall = 5,
    LongPut = 6,
    ShortPut = 7,
}

impl TokenType {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::UnderlyingFreeLiquidity,
            1 => Self::BaseFreeLiquidity,
            2 => Self::UnderlyingReservedLiquidity,
            3 => Self::BaseReservedLiquidity,
            4 => Self::LongCall,
            5 => Self::ShortCall,
            6 => Self::LongPut,
            7 => Self::ShortPut,
            _ => return None,
        })
    }

    pub fn free_liquidity(is_call: bool) -> Self {
        if is_call {
            Self::UnderlyingFreeLiquidity
        } else {
            Self::BaseFreeLiquidity
        }
    }

    pub fn reserved_liquidity(is_call: bool) -> Self {
        if is_call {
            Self::UnderlyingReservedLiquidity
        } else {
            Self::BaseReservedLiquidity
        }
    }

    pub fn long(is_call: bool) -> Self {
        if is_call {
            Self::LongCall
        } else {
            Self::LongPut
        }
    }

    pub fn short(is_call: bool) -> Self {
        if is_call {
            Self::ShortCall
        } else {
            Self::ShortPut
        }
    }

    #[inline]
    pub fn is_long(self) -> bool {
        matches!(self, Self::LongCall | Self::LongPut)
    }

    #[inline]
    pub fn is_short(self) -> bool {
        matches!(self, Self::ShortCall | Self::ShortPut)
    }

    #[inline]
    pub fn is_free_liquidity(self) -> bool {
        matches!(self, Self::UnderlyingFreeLiquidity | Self::BaseFreeLiquidity)
    }

    /// Which side of the pool (underlying/calls vs base/puts) the token
    /// belongs to.
    pub fn is_call_side(self) -> bool {
        matches!(
            self,
            Self::UnderlyingFreeLiquidity
                | Self::UnderlyingReservedLiquidity
                | Self::LongCall
                | Self::ShortCall
        )
    }
}

/// Decoded position identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub struct PositionKey {
    pub token_type: TokenType,
    pub maturity: u64,
    pub strike: Fixed64,
}

impl PositionKey {
    /// Liquidity tokens carry no maturity or strike.
    pub fn liquidity(token_type: TokenType) -> Self {
        Self {
            token_type,
            maturity: 0,
            strike: Fixed64::ZERO,
        }
    }

    pub fn option(token_type: TokenType, maturity: u64, strike: Fixed64) -> Self {
        Self {
            token_type,
            maturity,
            strike,
        }
    }

    /// `type << 248 | maturity << 128 | strike`, strike as its raw
    /// two's-complement bits. Bits 192..248 are always zero.
    pub fn encode(&self) -> PositionId {
        let hi = ((self.token_type as u128) << 120) | self.maturity as u128;
        PositionId(U256::from_words(hi, self.strike.to_bits() as u128))
    }

    pub fn decode(id: PositionId) -> PoolResult<Self> {
        let (hi, lo) = id.0.into_words();
        let raw_type = (hi >> 120) as u8;
        let token_type = TokenType::from_u8(raw_type)
            .ok_or_else(|| PoolError::Validation(format!("unknown token type {raw_type}")))?;
        if (hi >> 64) & ((1 << 56) - 1) != 0 {
            return Err(PoolError::Validation("malformed position id".into()));
        }
        Ok(Self {
            token_type,
            maturity: hi as u64,
            strike: Fixed64::from_bits(lo as i128),
        })
    }

    /// Long and short of the same series share maturity and strike.
    pub fn with_type(&self, token_type: TokenType) -> Self {
        Self { token_type, ..*self }
    }
}

/// 256-bit token id. Serialized as a `0x` hex string.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PositionId(pub U256);

impl PositionId {
    pub fn key(self) -> PoolResult<PositionKey> {
        PositionKey::decode(self)
    }

    pub fn parse(s: &str) -> PoolResult<Self> {
        wide::parse_hex(s)
            .map(PositionId)
            .ok_or_else(|| PoolError::Validation(format!("malformed position id {s}")))
    }
}

impl From<PositionKey> for PositionId {
    fn from(key: PositionKey) -> Self {
        key.encode()
    }
}

impl fmt::Display for PositionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&wide::to_hex(self.0))
    }
}

impl fmt::Debug for PositionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PositionId({})", wide::to_hex(self.0))
    }
}

impl serde::Serialize for PositionId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&wide::to_hex(self.0))
    }
}

impl<'de> serde::Deserialize<'de> for PositionId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        PositionId::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_all_types() {
        let strikes = [
            Fixed64::ZERO,
            Fixed64::from_int(52_520),
            Fixed64::from_bits(1),
            Fixed64::from_bits(i128::MAX),
            Fixed64::from_bits(-12_345),
        ];
        let maturities = [0u64, 1_617_235_200, u64::MAX];
        for t in 0..8u8 {
            let token_type = TokenType::from_u8(t).unwrap();
            for &maturity in &maturities {
                for &strike in &strikes {
                    let key = PositionKey::option(token_type, maturity, strike);
                    assert_eq!(PositionKey::decode(key.encode()).unwrap(), key);
                }
            }
        }
    }

    #[test]
    fn test_bit_layout() {
        let key = PositionKey::option(TokenType::ShortPut, 5, Fixed64::from_bits(9));
        let id = key.encode();
        assert_eq!(id.0.into_words(), ((7u128 << 120) | 5, 9));
        assert_eq!(id.0, (U256::from(7u128) << 248u32) | (U256::from(5u128) << 128u32) | U256::from(9u128));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(PositionKey::decode(PositionId(U256::from_words(8u128 << 120, 0))).is_err());
        assert!(PositionKey::decode(PositionId(U256::from_words(1u128 << 100, 0))).is_err());
    }

    #[test]
    fn test_hex_serde() {
        let id = PositionKey::option(TokenType::LongCall, 86_400, Fixed64::ONE).encode();
        let json = serde_json::to_string(&id).unwrap();
        let back: PositionId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
        assert!(json.starts_with("\"0x04"));
    }

    #[test]
    fn test_side_helpers() {
        assert!(TokenType::ShortCall.is_call_side());
        assert!(!TokenType::BaseReservedLiquidity.is_call_side());
        assert_eq!(TokenType::short(false), TokenType::ShortPut);
        assert!(TokenType::long(true).is_long());
    }
}
