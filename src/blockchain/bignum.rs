use num_bigint::BigUint;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use std::fmt;
use std::str::FromStr;

/// Arbitrary-precision unsigned integer stored as big-endian bytes.
///
/// Nonces, token ids and token nonces use this type. At the storage
/// boundary it is written as its minimal big-endian byte form, so nil,
/// empty and all-zero byte inputs all decode to the same zero value.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BigNum(BigUint);

impl BigNum {
    pub fn zero() -> Self {
        BigNum(BigUint::default())
    }

    pub fn from_u64(value: u64) -> Self {
        BigNum(BigUint::from(value))
    }

    /// Decodes a big-endian byte slice. Leading zero bytes are ignored.
    pub fn from_be_bytes(bytes: &[u8]) -> Self {
        BigNum(BigUint::from_bytes_be(bytes))
    }

    /// Minimal big-endian encoding; zero encodes to an empty vector.
    pub fn to_be_bytes(&self) -> Vec<u8> {
        if self.is_zero() {
            return Vec::new();
        }
        self.0.to_bytes_be()
    }

    /// Zero means "no significant bits".
    pub fn is_zero(&self) -> bool {
        self.0.bits() == 0
    }

    pub fn increment(&self) -> Self {
        BigNum(&self.0 + 1u32)
    }
}

impl From<u64> for BigNum {
    fn from(value: u64) -> Self {
        BigNum::from_u64(value)
    }
}

impl fmt::Display for BigNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Invalid integer: {0}")]
pub struct ParseBigNumError(String);

impl FromStr for BigNum {
    type Err = ParseBigNumError;

    /// Accepts decimal digits or a `0x`-prefixed hex string.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(hex_digits) = s.strip_prefix("0x") {
            if hex_digits.is_empty() {
                return Ok(BigNum::zero());
            }
            return BigUint::parse_bytes(hex_digits.as_bytes(), 16)
                .map(BigNum)
                .ok_or_else(|| ParseBigNumError(s.to_string()));
        }

        BigUint::parse_bytes(s.as_bytes(), 10)
            .map(BigNum)
            .ok_or_else(|| ParseBigNumError(s.to_string()))
    }
}

impl Serialize for BigNum {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_string())
        } else {
            serializer.serialize_bytes(&self.to_be_bytes())
        }
    }
}

struct BigNumVisitor;

impl<'de> Visitor<'de> for BigNumVisitor {
    type Value = BigNum;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("an unsigned integer as a number, a decimal/hex string or big-endian bytes")
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<BigNum, E> {
        Ok(BigNum::from_u64(v))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<BigNum, E> {
        BigNum::from_str(v).map_err(E::custom)
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<BigNum, E> {
        Ok(BigNum::from_be_bytes(v))
    }

    fn visit_unit<E: de::Error>(self) -> Result<BigNum, E> {
        Ok(BigNum::zero())
    }

    fn visit_none<E: de::Error>(self) -> Result<BigNum, E> {
        Ok(BigNum::zero())
    }

    fn visit_seq<A: de::SeqAccess<'de>>(self, mut seq: A) -> Result<BigNum, A::Error> {
        let mut bytes = Vec::new();
        while let Some(byte) = seq.next_element::<u8>()? {
            bytes.push(byte);
        }
        Ok(BigNum::from_be_bytes(&bytes))
    }
}

impl<'de> Deserialize<'de> for BigNum {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            deserializer.deserialize_any(BigNumVisitor)
        } else {
            deserializer.deserialize_bytes(BigNumVisitor)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_forms_are_equal() {
        assert!(BigNum::from_be_bytes(&[]).is_zero());
        assert!(BigNum::from_be_bytes(&[0, 0, 0]).is_zero());
        assert_eq!(BigNum::from_be_bytes(&[0, 0]), BigNum::zero());
        assert!(BigNum::zero().to_be_bytes().is_empty());
    }

    #[test]
    fn test_leading_zero_bytes_ignored() {
        let a = BigNum::from_be_bytes(&[0, 0, 1, 2]);
        let b = BigNum::from_be_bytes(&[1, 2]);
        assert_eq!(a, b);
        assert_eq!(a, BigNum::from_u64(258));
        assert_eq!(a.to_be_bytes(), vec![1, 2]);
    }

    #[test]
    fn test_increment_past_u64() {
        let max = BigNum::from_u64(u64::MAX);
        let next = max.increment();
        assert!(next > max);
        assert_eq!(next.to_be_bytes(), vec![1, 0, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_parse_decimal_and_hex() {
        assert_eq!(BigNum::from_str("255").unwrap(), BigNum::from_u64(255));
        assert_eq!(BigNum::from_str("0xff").unwrap(), BigNum::from_u64(255));
        assert_eq!(BigNum::from_str("0x").unwrap(), BigNum::zero());
        assert!(BigNum::from_str("nope").is_err());
    }

    #[test]
    fn test_json_accepts_numbers_and_strings() {
        let from_number: BigNum = serde_json::from_str("42").unwrap();
        let from_string: BigNum = serde_json::from_str("\"0x2a\"").unwrap();
        assert_eq!(from_number, from_string);
        assert_eq!(serde_json::to_string(&from_number).unwrap(), "\"42\"");
    }

    #[test]
    fn test_bincode_uses_minimal_bytes() {
        let value = BigNum::from_be_bytes(&[0, 0, 7]);
        let encoded = bincode::serialize(&value).unwrap();
        let decoded: BigNum = bincode::deserialize(&encoded).unwrap();
        assert_eq!(decoded, value);
        assert_eq!(encoded, bincode::serialize(&BigNum::from_u64(7)).unwrap());
    }
}
