mod memory;
mod postgres;

pub use memory::InMemoryLedgerStore;
pub use postgres::PostgresLedgerStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use game_domain::{MoneyError, TokenAmount, TokenType, WalletAddress};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum LedgerStoreError {
    #[error("player entry not found for {0}")]
    PlayerNotFound(String),
    #[error("transaction not found for correlation id {0}")]
    TransactionNotFound(String),
    #[error("duplicate correlation id {0}")]
    DuplicateCorrelationId(String),
    #[error("insufficient balance: available {available} base units, requested {requested}")]
    InsufficientBalance {
        available: TokenAmount,
        requested: TokenAmount,
    },
    #[error("invalid status transition {from:?} -> {to:?}")]
    InvalidStatusTransition {
        from: TransactionStatus,
        to: TransactionStatus,
    },
    #[error("referral code not found")]
    ReferralCodeNotFound,
    #[error("referral already accepted for this player")]
    ReferralAlreadyAccepted,
    #[error("self referral rejected")]
    SelfReferral,
    #[error("ledger lock poisoned")]
    LockPoisoned,
    #[error("database error: {0}")]
    Database(String),
    #[error("money error: {0}")]
    Money(#[from] MoneyError),
}

/// One row of `player_stats`. Balances are base units; `win_rate` is derived
/// from the counters and recomputed on every counter write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerLedgerEntry {
    pub wallet_address: WalletAddress,
    pub games_played: u64,
    pub wins: u64,
    pub losses: u64,
    pub win_rate: u8,
    pub apt_won: TokenAmount,
    pub emoji_won: TokenAmount,
    pub referrals: u64,
    pub referral_code: String,
    pub referred_by: Option<WalletAddress>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PlayerLedgerEntry {
    #[must_use]
    pub fn new_zeroed(wallet_address: WalletAddress, now: DateTime<Utc>) -> Self {
        Self {
            wallet_address,
            games_played: 0,
            wins: 0,
            losses: 0,
            win_rate: 0,
            apt_won: TokenAmount::ZERO,
            emoji_won: TokenAmount::ZERO,
            referrals: 0,
            referral_code: format!("ref-{}", Uuid::now_v7().simple()),
            referred_by: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn balance(&self, token: TokenType) -> TokenAmount {
        match token {
            TokenType::Apt => self.apt_won,
            TokenType::Emojicoin => self.emoji_won,
        }
    }

    pub(crate) fn balance_mut(&mut self, token: TokenType) -> &mut TokenAmount {
        match token {
            TokenType::Apt => &mut self.apt_won,
            TokenType::Emojicoin => &mut self.emoji_won,
        }
    }

    pub(crate) fn recompute_win_rate(&mut self) {
        self.win_rate = derive_win_rate(self.wins, self.games_played);
    }
}

#[must_use]
pub fn derive_win_rate(wins: u64, games_played: u64) -> u8 {
    if games_played == 0 {
        return 0;
    }
    ((wins as f64 / games_played as f64) * 100.0).round() as u8
}

/// Delta-based counter update; callers send increments, never absolutes, so
/// retries and out-of-order delivery cannot regress the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatDeltas {
    pub games: u32,
    pub wins: u32,
    pub losses: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Processing,
    Pending,
    Completed,
    Failed,
}

impl TransactionStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "processing" => Some(Self::Processing),
            "pending" => Some(Self::Pending),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Allowed record transitions. Re-asserting the current status is a no-op so
/// status writes can be retried; terminal states never change.
pub fn validate_transition(
    from: TransactionStatus,
    to: TransactionStatus,
) -> Result<(), LedgerStoreError> {
    use TransactionStatus::{Completed, Failed, Pending, Processing};
    match (from, to) {
        (a, b) if a == b => Ok(()),
        (Processing, Pending | Completed | Failed) => Ok(()),
        (Pending, Completed | Failed) => Ok(()),
        _ => Err(LedgerStoreError::InvalidStatusTransition { from, to }),
    }
}

/// One row of `game_transactions`, a single settlement attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub id: Uuid,
    pub player_address: WalletAddress,
    pub amount: TokenAmount,
    pub token_type: TokenType,
    pub correlation_id: String,
    pub status: TransactionStatus,
    pub tx_hash: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionRecordInsert {
    pub player_address: WalletAddress,
    pub amount: TokenAmount,
    pub token_type: TokenType,
    pub correlation_id: String,
    pub status: TransactionStatus,
    pub tx_hash: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionStatusUpdate {
    pub status: TransactionStatus,
    /// Set when the hash became known; `None` leaves any stored hash intact.
    pub tx_hash: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub limit: u32,
    pub offset: u32,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WithdrawalCommit {
    pub correlation_id: String,
    pub player_address: WalletAddress,
    pub token_type: TokenType,
    pub amount: TokenAmount,
    pub tx_hash: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayoutCredit {
    pub correlation_id: String,
    pub player_address: WalletAddress,
    pub token_type: TokenType,
    pub amount: TokenAmount,
    pub occurred_at: DateTime<Utc>,
}

#[async_trait]
pub trait PlayerStatsRepository: Send + Sync {
    async fn get_player(
        &self,
        address: &WalletAddress,
    ) -> Result<Option<PlayerLedgerEntry>, LedgerStoreError>;

    /// Lazily creates the entry with zero defaults.
    async fn ensure_player(
        &self,
        address: &WalletAddress,
    ) -> Result<PlayerLedgerEntry, LedgerStoreError>;

    async fn apply_stat_deltas(
        &self,
        address: &WalletAddress,
        deltas: &StatDeltas,
    ) -> Result<PlayerLedgerEntry, LedgerStoreError>;

    /// Applies a referral by exact referral-code match: marks the new player
    /// as referred and increments the referrer's counter, atomically.
    async fn accept_referral(
        &self,
        new_player: &WalletAddress,
        code: &str,
    ) -> Result<(), LedgerStoreError>;
}

#[async_trait]
pub trait TransactionLogRepository: Send + Sync {
    /// Write-ahead insert. Duplicate correlation ids are rejected.
    async fn insert_transaction(
        &self,
        insert: &TransactionRecordInsert,
    ) -> Result<TransactionRecord, LedgerStoreError>;

    async fn update_transaction_status(
        &self,
        correlation_id: &str,
        update: &TransactionStatusUpdate,
    ) -> Result<TransactionRecord, LedgerStoreError>;

    async fn get_transaction(
        &self,
        correlation_id: &str,
    ) -> Result<Option<TransactionRecord>, LedgerStoreError>;

    async fn list_player_transactions(
        &self,
        address: &WalletAddress,
        page: PageRequest,
    ) -> Result<Vec<TransactionRecord>, LedgerStoreError>;

    async fn list_transactions_by_status(
        &self,
        status: TransactionStatus,
        limit: u32,
    ) -> Result<Vec<TransactionRecord>, LedgerStoreError>;
}

/// Multi-row operations the orchestrator needs to be atomic: a withdrawal
/// debit never lands without its completed-status write, and a payout credit
/// never lands twice for one correlation id.
#[async_trait]
pub trait SettlementUnitOfWork: Send + Sync {
    /// Debits the balance (guarded by `balance >= amount`) and marks the
    /// record completed with the final hash, as one atomic operation.
    async fn commit_withdrawal(
        &self,
        commit: &WithdrawalCommit,
    ) -> Result<PlayerLedgerEntry, LedgerStoreError>;

    /// Inserts a completed payout record and credits the balance as one
    /// atomic operation. Duplicate correlation ids are rejected before any
    /// credit is applied.
    async fn record_payout(
        &self,
        credit: &PayoutCredit,
    ) -> Result<PlayerLedgerEntry, LedgerStoreError>;
}

pub trait SettlementLedger:
    PlayerStatsRepository + TransactionLogRepository + SettlementUnitOfWork
{
}

impl<T> SettlementLedger for T where
    T: PlayerStatsRepository + TransactionLogRepository + SettlementUnitOfWork
{
}
