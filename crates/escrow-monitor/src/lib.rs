use std::{collections::HashMap, sync::Arc};

use chain_client::EscrowWalletAdapter;
use game_domain::{TokenAmount, TokenType};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Minimum escrow balance per token for it to be offered for new bets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundingThresholds {
    pub min_apt: TokenAmount,
    pub min_emojicoin: TokenAmount,
}

impl FundingThresholds {
    #[must_use]
    pub fn for_token(&self, token: TokenType) -> TokenAmount {
        match token {
            TokenType::Apt => self.min_apt,
            TokenType::Emojicoin => self.min_emojicoin,
        }
    }
}

/// Point-in-time view of the escrow account. Tokens whose lookup failed are
/// absent from `balances` and never listed as available.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowFundingSnapshot {
    pub balances: HashMap<TokenType, TokenAmount>,
    pub available_tokens: Vec<TokenType>,
}

pub struct EscrowFundingMonitor {
    wallet: Arc<dyn EscrowWalletAdapter>,
    escrow_address: String,
    thresholds: FundingThresholds,
}

impl std::fmt::Debug for EscrowFundingMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EscrowFundingMonitor")
            .field("escrow_address", &self.escrow_address)
            .field("thresholds", &self.thresholds)
            .finish_non_exhaustive()
    }
}

impl EscrowFundingMonitor {
    #[must_use]
    pub fn new(
        wallet: Arc<dyn EscrowWalletAdapter>,
        escrow_address: impl Into<String>,
        thresholds: FundingThresholds,
    ) -> Self {
        Self {
            wallet,
            escrow_address: escrow_address.into(),
            thresholds,
        }
    }

    /// Never fails as a whole: a token whose balance cannot be read is
    /// reported unavailable and the rest of the snapshot stands.
    pub async fn snapshot(&self) -> EscrowFundingSnapshot {
        let mut snapshot = EscrowFundingSnapshot::default();
        for token in TokenType::ALL {
            match self
                .wallet
                .account_balance(&self.escrow_address, token)
                .await
            {
                Ok(balance) => {
                    snapshot.balances.insert(token, balance);
                    if balance >= self.thresholds.for_token(token) {
                        snapshot.available_tokens.push(token);
                    } else {
                        debug!(
                            token = %token,
                            balance = balance.as_u64(),
                            threshold = self.thresholds.for_token(token).as_u64(),
                            "escrow balance below betting threshold"
                        );
                    }
                }
                Err(err) => {
                    warn!(
                        token = %token,
                        error = %err,
                        "escrow balance lookup failed; token marked unavailable"
                    );
                }
            }
        }
        snapshot
    }
}
