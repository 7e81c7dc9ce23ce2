use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::money::TokenAmount;

/// Supported escrow token types. Each variant carries its own unit metadata;
/// the chain-level coin type tag is resolved by the chain client so test
/// networks can remap it without touching domain code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TokenType {
    Apt,
    Emojicoin,
}

impl TokenType {
    pub const ALL: [Self; 2] = [Self::Apt, Self::Emojicoin];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Apt => "APT",
            Self::Emojicoin => "EMOJICOIN",
        }
    }

    #[must_use]
    pub const fn decimals(self) -> u32 {
        match self {
            Self::Apt => 8,
            Self::Emojicoin => 8,
        }
    }

    pub fn parse(value: &str) -> Result<Self, TokenError> {
        match value.trim().to_ascii_uppercase().as_str() {
            "APT" => Ok(Self::Apt),
            "EMOJICOIN" => Ok(Self::Emojicoin),
            other => Err(TokenError::Unsupported(other.to_string())),
        }
    }

    /// Converts a human-readable amount to base units, rounding to the
    /// nearest base unit.
    pub fn to_base_units(self, human: f64) -> Result<TokenAmount, TokenError> {
        if !human.is_finite() {
            return Err(TokenError::InvalidAmount(human.to_string()));
        }
        if human < 0.0 {
            return Err(TokenError::NegativeAmount(human.to_string()));
        }
        let scaled = (human * 10_f64.powi(self.decimals() as i32)).round();
        if scaled > u64::MAX as f64 {
            return Err(TokenError::InvalidAmount(human.to_string()));
        }
        Ok(TokenAmount(scaled as u64))
    }

    #[must_use]
    pub fn to_human(self, amount: TokenAmount) -> f64 {
        amount.as_u64() as f64 / 10_f64.powi(self.decimals() as i32)
    }
}

impl std::fmt::Display for TokenType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("unsupported token type: {0}")]
    Unsupported(String),
    #[error("invalid token amount: {0}")]
    InvalidAmount(String),
    #[error("negative token amount: {0}")]
    NegativeAmount(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_token_names_case_insensitively() {
        assert_eq!(TokenType::parse("apt").expect("apt"), TokenType::Apt);
        assert_eq!(
            TokenType::parse(" EmojiCoin ").expect("emojicoin"),
            TokenType::Emojicoin
        );
        assert!(matches!(
            TokenType::parse("DOGE"),
            Err(TokenError::Unsupported(_))
        ));
    }

    #[test]
    fn converts_human_amounts_to_octas_with_rounding() {
        assert_eq!(
            TokenType::Apt.to_base_units(1.0).expect("one"),
            TokenAmount(100_000_000)
        );
        assert_eq!(
            TokenType::Apt.to_base_units(2.5).expect("two and a half"),
            TokenAmount(250_000_000)
        );
        // Sub-octa precision rounds to the nearest unit.
        assert_eq!(
            TokenType::Apt.to_base_units(0.123456789).expect("tiny"),
            TokenAmount(12_345_679)
        );
    }

    #[test]
    fn rejects_negative_and_non_finite_amounts() {
        assert!(matches!(
            TokenType::Apt.to_base_units(-1.0),
            Err(TokenError::NegativeAmount(_))
        ));
        assert!(matches!(
            TokenType::Apt.to_base_units(f64::NAN),
            Err(TokenError::InvalidAmount(_))
        ));
        assert!(matches!(
            TokenType::Emojicoin.to_base_units(f64::INFINITY),
            Err(TokenError::InvalidAmount(_))
        ));
    }

    #[test]
    fn human_rendering_round_trips_exact_octa_values() {
        let amount = TokenType::Apt.to_base_units(1.5).expect("amount");
        assert_eq!(TokenType::Apt.to_human(amount), 1.5);
    }

    #[test]
    fn serializes_as_screaming_snake_case() {
        let json = serde_json::to_string(&TokenType::Emojicoin).expect("serialize");
        assert_eq!(json, "\"EMOJICOIN\"");
    }
}
