use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use audit_store::{AuditRepository, SettlementEventRecord};
use chain_client::{EscrowWalletAdapter, TransferOutcome};
use chrono::Utc;
use game_domain::{TokenAmount, TokenType, TraceId, WalletAddress};
use ledger_store::{
    LedgerStoreError, PayoutCredit, PlayerLedgerEntry, SettlementLedger, StatDeltas,
    TransactionRecordInsert, TransactionStatus, TransactionStatusUpdate, WithdrawalCommit,
};
use rand::Rng;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

const RECONCILE_CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum SettlementError {
    #[error("insufficient {token} balance: available {available} base units, requested {requested}")]
    InsufficientBalance {
        token: TokenType,
        available: TokenAmount,
        requested: TokenAmount,
    },
    #[error("ledger lookup failed: {0}")]
    LedgerLookup(String),
    #[error("ledger write failed: {0}")]
    LedgerWrite(String),
    #[error("chain submission failed: {0}")]
    ChainSubmission(String),
    #[error("transaction {hash} failed on chain: {vm_status}")]
    ChainExecution { hash: String, vm_status: String },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Clone)]
pub struct WithdrawalRequest {
    pub player_address: WalletAddress,
    pub token: TokenType,
    pub amount: TokenAmount,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WithdrawalOutcome {
    Completed {
        correlation_id: String,
        tx_hash: String,
        explorer_url: String,
        new_balance: TokenAmount,
    },
    /// Hash is known but the chain gave no verdict within the confirmation
    /// window; the record stays `pending` until reconciled.
    Pending {
        correlation_id: String,
        tx_hash: String,
        explorer_url: String,
    },
}

#[derive(Debug, Clone)]
pub struct PayoutRequest {
    pub player_address: WalletAddress,
    pub token: TokenType,
    pub amount: TokenAmount,
    pub game_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayoutOutcome {
    Credited { new_balance: TokenAmount },
    /// The game id was already settled; the ledger is untouched.
    AlreadyCredited,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconciliationReport {
    pub examined: usize,
    pub completed: usize,
    pub failed: usize,
    pub still_pending: usize,
}

#[derive(Debug, Clone)]
pub struct SettlementConfig {
    pub explorer_base_url: String,
    pub network: String,
    pub confirmation_timeout: Duration,
}

impl SettlementConfig {
    #[must_use]
    pub fn explorer_url(&self, tx_hash: &str) -> String {
        format!(
            "{}/txn/{tx_hash}?network={}",
            self.explorer_base_url.trim_end_matches('/'),
            self.network
        )
    }
}

/// Serializes verify -> commit per wallet so two concurrent withdrawals
/// cannot both pass the balance check.
#[derive(Debug, Default, Clone)]
pub struct WalletLockRegistry {
    locks: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl WalletLockRegistry {
    fn lock_for(&self, address: &WalletAddress) -> Result<Arc<AsyncMutex<()>>, SettlementError> {
        let mut guard = self
            .locks
            .lock()
            .map_err(|_| SettlementError::Internal("wallet lock registry poisoned".to_string()))?;
        Ok(guard
            .entry(address.as_str().to_string())
            .or_default()
            .clone())
    }
}

#[async_trait]
pub trait SettlementAuditSink: Send + Sync {
    async fn emit(&self, event: SettlementEventRecord) -> Result<(), String>;
}

/// Sink that appends orchestrator events to an audit repository.
#[derive(Clone)]
pub struct AuditRepositorySink {
    repo: Arc<dyn AuditRepository>,
}

impl AuditRepositorySink {
    #[must_use]
    pub fn new(repo: Arc<dyn AuditRepository>) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl SettlementAuditSink for AuditRepositorySink {
    async fn emit(&self, event: SettlementEventRecord) -> Result<(), String> {
        self.repo
            .append_event(&event)
            .await
            .map_err(|e| e.to_string())
    }
}

fn generate_withdrawal_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(10)
        .map(char::from)
        .collect();
    format!(
        "withdrawal_{}_{}",
        Utc::now().timestamp_millis(),
        suffix.to_ascii_lowercase()
    )
}

pub struct SettlementService {
    ledger: Arc<dyn SettlementLedger>,
    wallet: Arc<dyn EscrowWalletAdapter>,
    config: SettlementConfig,
    wallet_locks: WalletLockRegistry,
    audit: Option<Arc<dyn SettlementAuditSink>>,
}

impl std::fmt::Debug for SettlementService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettlementService")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SettlementService {
    #[must_use]
    pub fn new(
        ledger: Arc<dyn SettlementLedger>,
        wallet: Arc<dyn EscrowWalletAdapter>,
        config: SettlementConfig,
    ) -> Self {
        Self {
            ledger,
            wallet,
            config,
            wallet_locks: WalletLockRegistry::default(),
            audit: None,
        }
    }

    #[must_use]
    pub fn with_audit_sink(mut self, sink: Arc<dyn SettlementAuditSink>) -> Self {
        self.audit = Some(sink);
        self
    }

    #[must_use]
    pub fn explorer_url(&self, tx_hash: &str) -> String {
        self.config.explorer_url(tx_hash)
    }

    /// Read-only gate against over-withdrawal; runs before any record or
    /// chain action exists. A missing entry verifies as a zero balance.
    pub async fn verify_balance(
        &self,
        address: &WalletAddress,
        token: TokenType,
        amount: TokenAmount,
    ) -> Result<TokenAmount, SettlementError> {
        let entry = self
            .ledger
            .get_player(address)
            .await
            .map_err(|e| SettlementError::LedgerLookup(e.to_string()))?;
        let available = entry
            .map(|entry| entry.balance(token))
            .unwrap_or(TokenAmount::ZERO);
        if available < amount {
            return Err(SettlementError::InsufficientBalance {
                token,
                available,
                requested: amount,
            });
        }
        Ok(available)
    }

    pub async fn withdraw(
        &self,
        request: &WithdrawalRequest,
    ) -> Result<WithdrawalOutcome, SettlementError> {
        if request.amount == TokenAmount::ZERO {
            return Err(SettlementError::InvalidRequest(
                "withdrawal amount must be positive".to_string(),
            ));
        }
        let trace_id = TraceId::new();
        let lock = self.wallet_locks.lock_for(&request.player_address)?;
        let _guard = lock.lock().await;

        self.verify_balance(&request.player_address, request.token, request.amount)
            .await?;

        // Write-ahead record: nothing touches the chain until this insert
        // has succeeded.
        let correlation_id = generate_withdrawal_id();
        self.ledger
            .insert_transaction(&TransactionRecordInsert {
                player_address: request.player_address.clone(),
                amount: request.amount,
                token_type: request.token,
                correlation_id: correlation_id.clone(),
                status: TransactionStatus::Processing,
                tx_hash: None,
                created_at: Utc::now(),
            })
            .await
            .map_err(|e| SettlementError::LedgerWrite(e.to_string()))?;

        let tx_hash = match self
            .wallet
            .submit_transfer(&request.player_address, request.amount, request.token)
            .await
        {
            Ok(hash) => hash,
            Err(err) => {
                self.mark_record(&correlation_id, TransactionStatus::Failed, None)
                    .await;
                self.emit_event(
                    "withdrawal_submit_failed",
                    "error",
                    request,
                    &correlation_id,
                    None,
                    json!({ "detail": err.to_string() }),
                    trace_id,
                )
                .await;
                return Err(SettlementError::ChainSubmission(err.to_string()));
            }
        };
        info!(
            player = %request.player_address,
            token = %request.token,
            amount = request.amount.as_u64(),
            correlation_id = %correlation_id,
            tx_hash = %tx_hash,
            "withdrawal transfer submitted"
        );
        self.emit_event(
            "withdrawal_submitted",
            "info",
            request,
            &correlation_id,
            Some(&tx_hash),
            json!({ "amount": request.amount.as_u64() }),
            trace_id,
        )
        .await;

        let outcome = match self
            .wallet
            .await_confirmation(&tx_hash, self.config.confirmation_timeout)
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                // A failed poll says nothing about the transfer itself.
                warn!(tx_hash = %tx_hash, error = %err, "confirmation polling failed");
                TransferOutcome::Unknown
            }
        };

        match outcome {
            TransferOutcome::Committed => {
                self.commit_confirmed_withdrawal(request, &correlation_id, &tx_hash, trace_id)
                    .await
            }
            TransferOutcome::Reverted { vm_status } => {
                self.mark_record(
                    &correlation_id,
                    TransactionStatus::Failed,
                    Some(tx_hash.clone()),
                )
                .await;
                self.emit_event(
                    "withdrawal_reverted",
                    "error",
                    request,
                    &correlation_id,
                    Some(&tx_hash),
                    json!({ "vm_status": vm_status }),
                    trace_id,
                )
                .await;
                Err(SettlementError::ChainExecution {
                    hash: tx_hash,
                    vm_status,
                })
            }
            TransferOutcome::Unknown => {
                self.mark_record(
                    &correlation_id,
                    TransactionStatus::Pending,
                    Some(tx_hash.clone()),
                )
                .await;
                self.emit_event(
                    "withdrawal_confirmation_timeout",
                    "warn",
                    request,
                    &correlation_id,
                    Some(&tx_hash),
                    Value::Null,
                    trace_id,
                )
                .await;
                Ok(WithdrawalOutcome::Pending {
                    explorer_url: self.config.explorer_url(&tx_hash),
                    correlation_id,
                    tx_hash,
                })
            }
        }
    }

    async fn commit_confirmed_withdrawal(
        &self,
        request: &WithdrawalRequest,
        correlation_id: &str,
        tx_hash: &str,
        trace_id: TraceId,
    ) -> Result<WithdrawalOutcome, SettlementError> {
        match self
            .ledger
            .commit_withdrawal(&WithdrawalCommit {
                correlation_id: correlation_id.to_string(),
                player_address: request.player_address.clone(),
                token_type: request.token,
                amount: request.amount,
                tx_hash: tx_hash.to_string(),
                updated_at: Utc::now(),
            })
            .await
        {
            Ok(entry) => {
                info!(
                    player = %request.player_address,
                    correlation_id = %correlation_id,
                    tx_hash = %tx_hash,
                    new_balance = entry.balance(request.token).as_u64(),
                    "withdrawal committed"
                );
                self.emit_event(
                    "withdrawal_completed",
                    "info",
                    request,
                    correlation_id,
                    Some(tx_hash),
                    json!({ "new_balance": entry.balance(request.token).as_u64() }),
                    trace_id,
                )
                .await;
                Ok(WithdrawalOutcome::Completed {
                    correlation_id: correlation_id.to_string(),
                    tx_hash: tx_hash.to_string(),
                    explorer_url: self.config.explorer_url(tx_hash),
                    new_balance: entry.balance(request.token),
                })
            }
            Err(err) => {
                // The transfer landed on chain but the ledger refused the
                // debit. Hold the record pending so reconciliation or an
                // operator can resolve it.
                warn!(
                    correlation_id = %correlation_id,
                    tx_hash = %tx_hash,
                    error = %err,
                    "confirmed withdrawal could not be committed to the ledger"
                );
                self.mark_record(
                    correlation_id,
                    TransactionStatus::Pending,
                    Some(tx_hash.to_string()),
                )
                .await;
                self.emit_event(
                    "withdrawal_commit_failed",
                    "error",
                    request,
                    correlation_id,
                    Some(tx_hash),
                    json!({ "detail": err.to_string() }),
                    trace_id,
                )
                .await;
                Err(SettlementError::LedgerWrite(err.to_string()))
            }
        }
    }

    /// Credits a win to the virtual ledger. No chain transfer happens here;
    /// winnings leave the escrow only through `withdraw`.
    pub async fn credit_payout(
        &self,
        request: &PayoutRequest,
    ) -> Result<PayoutOutcome, SettlementError> {
        if request.game_id.trim().is_empty() {
            return Err(SettlementError::InvalidRequest(
                "gameId must not be empty".to_string(),
            ));
        }
        if request.amount == TokenAmount::ZERO {
            return Err(SettlementError::InvalidRequest(
                "payout amount must be positive".to_string(),
            ));
        }
        let trace_id = TraceId::new();
        match self
            .ledger
            .record_payout(&PayoutCredit {
                correlation_id: request.game_id.clone(),
                player_address: request.player_address.clone(),
                token_type: request.token,
                amount: request.amount,
                occurred_at: Utc::now(),
            })
            .await
        {
            Ok(entry) => {
                info!(
                    player = %request.player_address,
                    token = %request.token,
                    amount = request.amount.as_u64(),
                    game_id = %request.game_id,
                    "payout credited"
                );
                if let Some(sink) = self.audit.as_ref() {
                    let mut event = SettlementEventRecord::new("payout_credited", "info");
                    event.player_address = Some(request.player_address.as_str().to_string());
                    event.correlation_id = Some(request.game_id.clone());
                    event.payload_json = json!({ "amount": request.amount.as_u64() });
                    event.trace_id = trace_id;
                    if let Err(err) = sink.emit(event).await {
                        warn!(error = %err, "failed to emit settlement audit event");
                    }
                }
                Ok(PayoutOutcome::Credited {
                    new_balance: entry.balance(request.token),
                })
            }
            Err(LedgerStoreError::DuplicateCorrelationId(game_id)) => {
                info!(game_id = %game_id, "payout already credited; ignoring retry");
                Ok(PayoutOutcome::AlreadyCredited)
            }
            Err(err) => Err(SettlementError::LedgerWrite(err.to_string())),
        }
    }

    pub async fn apply_stat_deltas(
        &self,
        address: &WalletAddress,
        deltas: &StatDeltas,
    ) -> Result<PlayerLedgerEntry, SettlementError> {
        self.ledger
            .apply_stat_deltas(address, deltas)
            .await
            .map_err(|e| SettlementError::LedgerWrite(e.to_string()))
    }

    pub async fn accept_referral(
        &self,
        new_player: &WalletAddress,
        code: &str,
    ) -> Result<(), SettlementError> {
        match self.ledger.accept_referral(new_player, code).await {
            Ok(()) => Ok(()),
            Err(
                err @ (LedgerStoreError::ReferralCodeNotFound
                | LedgerStoreError::ReferralAlreadyAccepted
                | LedgerStoreError::SelfReferral),
            ) => Err(SettlementError::InvalidRequest(err.to_string())),
            Err(err) => Err(SettlementError::LedgerWrite(err.to_string())),
        }
    }

    /// Re-polls `pending` records and resolves the ones the chain has since
    /// decided. Safe to run from a timer or an admin endpoint.
    pub async fn reconcile_pending(
        &self,
        limit: u32,
    ) -> Result<ReconciliationReport, SettlementError> {
        let pending = self
            .ledger
            .list_transactions_by_status(TransactionStatus::Pending, limit)
            .await
            .map_err(|e| SettlementError::LedgerLookup(e.to_string()))?;

        let mut report = ReconciliationReport {
            examined: pending.len(),
            ..ReconciliationReport::default()
        };
        for record in pending {
            let Some(tx_hash) = record.tx_hash.clone() else {
                report.still_pending += 1;
                continue;
            };
            let outcome = self
                .wallet
                .await_confirmation(&tx_hash, RECONCILE_CONFIRMATION_TIMEOUT)
                .await
                .unwrap_or(TransferOutcome::Unknown);
            match outcome {
                TransferOutcome::Committed => {
                    let lock = self.wallet_locks.lock_for(&record.player_address)?;
                    let _guard = lock.lock().await;
                    match self
                        .ledger
                        .commit_withdrawal(&WithdrawalCommit {
                            correlation_id: record.correlation_id.clone(),
                            player_address: record.player_address.clone(),
                            token_type: record.token_type,
                            amount: record.amount,
                            tx_hash: tx_hash.clone(),
                            updated_at: Utc::now(),
                        })
                        .await
                    {
                        Ok(_) => report.completed += 1,
                        Err(err) => {
                            warn!(
                                correlation_id = %record.correlation_id,
                                error = %err,
                                "pending withdrawal confirmed on chain but commit failed"
                            );
                            report.still_pending += 1;
                        }
                    }
                }
                TransferOutcome::Reverted { vm_status } => {
                    warn!(
                        correlation_id = %record.correlation_id,
                        tx_hash = %tx_hash,
                        vm_status = %vm_status,
                        "pending withdrawal reverted on chain"
                    );
                    self.mark_record(
                        &record.correlation_id,
                        TransactionStatus::Failed,
                        Some(tx_hash),
                    )
                    .await;
                    report.failed += 1;
                }
                TransferOutcome::Unknown => report.still_pending += 1,
            }
        }
        info!(
            examined = report.examined,
            completed = report.completed,
            failed = report.failed,
            still_pending = report.still_pending,
            "pending reconciliation pass finished"
        );
        Ok(report)
    }

    async fn mark_record(
        &self,
        correlation_id: &str,
        status: TransactionStatus,
        tx_hash: Option<String>,
    ) {
        let update = TransactionStatusUpdate {
            status,
            tx_hash,
            updated_at: Utc::now(),
        };
        if let Err(err) = self
            .ledger
            .update_transaction_status(correlation_id, &update)
            .await
        {
            warn!(
                correlation_id,
                status = status.as_str(),
                error = %err,
                "failed to update transaction record"
            );
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn emit_event(
        &self,
        kind: &str,
        severity: &str,
        request: &WithdrawalRequest,
        correlation_id: &str,
        tx_hash: Option<&str>,
        payload: Value,
        trace_id: TraceId,
    ) {
        let Some(sink) = self.audit.as_ref() else {
            return;
        };
        let mut event = SettlementEventRecord::new(kind, severity);
        event.player_address = Some(request.player_address.as_str().to_string());
        event.correlation_id = Some(correlation_id.to_string());
        event.tx_hash = tx_hash.map(ToOwned::to_owned);
        event.payload_json = payload;
        event.trace_id = trace_id;
        if let Err(err) = sink.emit(event).await {
            warn!(error = %err, "failed to emit settlement audit event");
        }
    }
}
