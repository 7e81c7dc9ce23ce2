use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Player wallet address, normalized to lowercase so ledger lookups are
/// case-insensitive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WalletAddress(String);

impl WalletAddress {
    pub fn new(raw: &str) -> Result<Self, AddressError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(AddressError::Empty);
        }
        let hex_part = trimmed
            .strip_prefix("0x")
            .ok_or_else(|| AddressError::MissingPrefix(trimmed.to_string()))?;
        if hex_part.is_empty() || hex_part.len() > 64 {
            return Err(AddressError::InvalidLength(trimmed.to_string()));
        }
        if !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(AddressError::InvalidCharacters(trimmed.to_string()));
        }
        Ok(Self(trimmed.to_ascii_lowercase()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WalletAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("wallet address is empty")]
    Empty,
    #[error("wallet address missing 0x prefix: {0}")]
    MissingPrefix(String),
    #[error("wallet address has invalid length: {0}")]
    InvalidLength(String),
    #[error("wallet address has non-hex characters: {0}")]
    InvalidCharacters(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_to_lowercase() {
        let a = WalletAddress::new("0xABCDEF1234").expect("address");
        let b = WalletAddress::new("0xabcdef1234").expect("address");
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "0xabcdef1234");
    }

    #[test]
    fn rejects_malformed_addresses() {
        assert!(matches!(WalletAddress::new("  "), Err(AddressError::Empty)));
        assert!(matches!(
            WalletAddress::new("abcdef"),
            Err(AddressError::MissingPrefix(_))
        ));
        assert!(matches!(
            WalletAddress::new("0x"),
            Err(AddressError::InvalidLength(_))
        ));
        assert!(matches!(
            WalletAddress::new("0xzzzz"),
            Err(AddressError::InvalidCharacters(_))
        ));
    }
}
