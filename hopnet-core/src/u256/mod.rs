//! 256-bit token amounts.
//!
//! Deposits, transferred amounts and lock amounts are 256-bit unsigned
//! integers so any ERC20-style token balance fits without truncation.

// Allow clippy warnings produced inside the uint crate's construct_uint macro
#![allow(clippy::manual_div_ceil)]
#![allow(clippy::assign_op_pattern)]

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uint::construct_uint;

construct_uint! {
    /// 256-bit unsigned token amount.
    pub struct TokenAmount(4);
}

impl TokenAmount {
    /// Create a TokenAmount from a u64 value.
    #[inline]
    pub const fn from_u64(value: u64) -> Self {
        TokenAmount([value, 0, 0, 0])
    }

    /// Convert to u64, returning None if the value does not fit.
    #[inline]
    pub fn to_u64(&self) -> Option<u64> {
        if self.0[1] == 0 && self.0[2] == 0 && self.0[3] == 0 {
            Some(self.0[0])
        } else {
            None
        }
    }

    /// Serialize to big-endian bytes, as used in signing layouts.
    pub fn to_be_bytes(&self) -> [u8; 32] {
        let mut bytes = [0u8; 32];
        bytes[0..8].copy_from_slice(&self.0[3].to_be_bytes());
        bytes[8..16].copy_from_slice(&self.0[2].to_be_bytes());
        bytes[16..24].copy_from_slice(&self.0[1].to_be_bytes());
        bytes[24..32].copy_from_slice(&self.0[0].to_be_bytes());
        bytes
    }

    /// Deserialize from big-endian bytes.
    pub fn from_be_bytes(bytes: &[u8; 32]) -> Self {
        TokenAmount([
            u64::from_be_bytes(bytes[24..32].try_into().unwrap()),
            u64::from_be_bytes(bytes[16..24].try_into().unwrap()),
            u64::from_be_bytes(bytes[8..16].try_into().unwrap()),
            u64::from_be_bytes(bytes[0..8].try_into().unwrap()),
        ])
    }

}

// Custom serde: always the 32 big-endian bytes, so the deterministic
// bincode profile and the signing layouts agree on the representation.
impl Serialize for TokenAmount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.to_be_bytes())
    }
}

impl<'de> Deserialize<'de> for TokenAmount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct AmountVisitor;

        impl<'de> serde::de::Visitor<'de> for AmountVisitor {
            type Value = TokenAmount;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str("32 bytes")
            }

            fn visit_bytes<E: serde::de::Error>(self, v: &[u8]) -> Result<TokenAmount, E> {
                if v.len() != 32 {
                    return Err(E::invalid_length(v.len(), &self));
                }
                let bytes: [u8; 32] = v.try_into().unwrap();
                Ok(TokenAmount::from_be_bytes(&bytes))
            }

            fn visit_seq<A: serde::de::SeqAccess<'de>>(
                self,
                mut seq: A,
            ) -> Result<TokenAmount, A::Error> {
                let mut bytes = [0u8; 32];
                for (i, byte) in bytes.iter_mut().enumerate() {
                    *byte = seq
                        .next_element()?
                        .ok_or_else(|| serde::de::Error::invalid_length(i, &self))?;
                }
                Ok(TokenAmount::from_be_bytes(&bytes))
            }
        }

        deserializer.deserialize_bytes(AmountVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arithmetic() {
        let a = TokenAmount::from_u64(100);
        let b = TokenAmount::from_u64(30);
        assert_eq!(a + b, TokenAmount::from_u64(130));
        assert_eq!(a - b, TokenAmount::from_u64(70));
    }

    #[test]
    fn test_saturating_sub() {
        let a = TokenAmount::from_u64(10);
        let b = TokenAmount::from_u64(30);
        assert_eq!(a.saturating_sub(b), TokenAmount::zero());
        assert_eq!(b.saturating_sub(a), TokenAmount::from_u64(20));
    }

    #[test]
    fn test_be_bytes_roundtrip() {
        let value = TokenAmount::from_u64(0xDEADBEEF) << 64;
        let bytes = value.to_be_bytes();
        assert_eq!(TokenAmount::from_be_bytes(&bytes), value);
    }

    #[test]
    fn test_be_bytes_layout() {
        let one = TokenAmount::from_u64(1);
        let bytes = one.to_be_bytes();
        assert_eq!(bytes[31], 1);
        assert!(bytes[..31].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_serde_roundtrip() {
        let value = TokenAmount::from_u64(123456789);
        let bytes = crate::serialization::serialize(&value).unwrap();
        let recovered: TokenAmount = crate::serialization::deserialize(&bytes).unwrap();
        assert_eq!(value, recovered);
    }

    #[test]
    fn test_to_u64_overflow() {
        let big = TokenAmount::from_u64(1) << 80;
        assert_eq!(big.to_u64(), None);
        assert_eq!(TokenAmount::from_u64(7).to_u64(), Some(7));
    }
}
