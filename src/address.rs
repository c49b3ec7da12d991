use std::{fmt, str::FromStr};

use ed25519_dalek::VerifyingKey;
use serde::{de::Error as _, Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

pub const ADDRESS_LEN: usize = 20;

const ADDRESS_DOMAIN: &[u8] = b"model-market/address";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    #[error("invalid address hex: {0}")]
    InvalidHex(String),
    #[error("address must be 20 bytes, got {0}")]
    InvalidLength(usize),
}

/// Account identity on the market ledger.
///
/// Text form is `0x` followed by 40 lowercase hex digits. Parsing is
/// case-insensitive, so two spellings of the same address compare equal.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address([u8; ADDRESS_LEN]);

impl Address {
    pub const ZERO: Address = Address([0u8; ADDRESS_LEN]);

    pub const fn from_bytes(bytes: [u8; ADDRESS_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ADDRESS_LEN] {
        &self.0
    }

    /// Last 20 bytes of `SHA-256(domain || pubkey)`.
    pub fn from_verifying_key(key: &VerifyingKey) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(ADDRESS_DOMAIN);
        hasher.update(key.as_bytes());
        let digest: [u8; 32] = hasher.finalize().into();
        let mut out = [0u8; ADDRESS_LEN];
        out.copy_from_slice(&digest[32 - ADDRESS_LEN..]);
        Self(out)
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let digits = s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .unwrap_or(s);
        let bytes = hex::decode(digits).map_err(|e| AddressError::InvalidHex(e.to_string()))?;
        if bytes.len() != ADDRESS_LEN {
            return Err(AddressError::InvalidLength(bytes.len()));
        }
        let mut out = [0u8; ADDRESS_LEN];
        out.copy_from_slice(&bytes);
        Ok(Self(out))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl Serialize for Address {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        encoded.parse().map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use ed25519_dalek::SigningKey;

    #[test]
    fn parsing_ignores_case_and_prefix() {
        let lower: Address = "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266".parse().unwrap();
        let upper: Address = "0XF39FD6E51AAD88F6F4CE6AB8827279CFFFB92266".parse().unwrap();
        let bare: Address = "F39Fd6e51aad88F6F4ce6aB8827279cffFb92266".parse().unwrap();
        assert_eq!(lower, upper);
        assert_eq!(lower, bare);
        assert_eq!(
            upper.to_string(),
            "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266"
        );
    }

    #[test]
    fn rejects_wrong_length_and_bad_hex() {
        assert_eq!(
            "0x1234".parse::<Address>().unwrap_err(),
            AddressError::InvalidLength(2)
        );
        assert!(matches!(
            "0xzz9fd6e51aad88f6f4ce6ab8827279cfffb92266".parse::<Address>(),
            Err(AddressError::InvalidHex(_))
        ));
    }

    #[test]
    fn derived_address_is_stable_per_key() {
        let a = SigningKey::from_bytes(&[7u8; 32]).verifying_key();
        let b = SigningKey::from_bytes(&[8u8; 32]).verifying_key();
        assert_eq!(Address::from_verifying_key(&a), Address::from_verifying_key(&a));
        assert_ne!(Address::from_verifying_key(&a), Address::from_verifying_key(&b));
    }

    #[test]
    fn serializes_as_string_and_works_as_map_key() {
        let addr = Address::from_bytes([0xab; ADDRESS_LEN]);
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, format!("\"{addr}\""));

        let mut map = std::collections::BTreeMap::new();
        map.insert(addr, 5u64);
        let encoded = serde_json::to_string(&map).unwrap();
        let decoded: std::collections::BTreeMap<Address, u64> =
            serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded[&addr], 5);
    }
}
