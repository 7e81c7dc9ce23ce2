use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use escrow_monitor::EscrowFundingMonitor;
use game_domain::{TokenAmount, TokenType, WalletAddress};
use ledger_store::{
    PageRequest, PlayerLedgerEntry, PlayerStatsRepository, TransactionLogRepository,
    TransactionRecord, TransactionStatus, TransactionStatusUpdate,
};
use serde::{Deserialize, Serialize};
use settlement::{
    PayoutOutcome, PayoutRequest, SettlementError, SettlementService, WithdrawalOutcome,
    WithdrawalRequest,
};
use tracing::info;

#[derive(Clone)]
pub struct ApiState {
    pub settlement: Arc<SettlementService>,
    pub monitor: Arc<EscrowFundingMonitor>,
    pub players: Arc<dyn PlayerStatsRepository>,
    pub transactions: Arc<dyn TransactionLogRepository>,
}

impl std::fmt::Debug for ApiState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiState").finish_non_exhaustive()
    }
}

pub fn build_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/payout/withdraw", post(withdraw))
        .route("/payout", post(payout))
        .route("/stats", post(stats))
        .route("/referral", post(referral))
        .route("/escrow/balances", get(escrow_balances))
        .route("/transactions/{address}", get(player_transactions))
        .route("/players/{address}", get(player_entry))
        .route("/admin/reconcile", post(admin_reconcile))
        .route(
            "/admin/transactions/{id}/status",
            post(admin_override_status),
        )
        .with_state(state)
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub service: &'static str,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawRequestBody {
    pub player_address: String,
    pub amount: f64,
    pub token_type: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawResponseBody {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explorer_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayoutRequestBody {
    pub player_address: String,
    pub amount: f64,
    pub token_type: String,
    pub game_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PayoutResponseBody {
    pub success: bool,
    /// Payouts credit the virtual ledger only; no chain transaction exists.
    pub transaction_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsRequestBody {
    pub player_address: String,
    pub games_delta: i64,
    pub wins_delta: i64,
    pub losses_delta: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimpleResponseBody {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferralRequestBody {
    pub player_address: String,
    pub code: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EscrowBalancesResponse {
    pub apt: Option<f64>,
    pub emojicoin: Option<f64>,
    pub available_tokens: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionView {
    pub id: String,
    pub player_address: String,
    pub amount: f64,
    pub token_type: String,
    pub correlation_id: String,
    pub status: String,
    pub transaction_hash: Option<String>,
    pub explorer_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionsResponse {
    pub success: bool,
    pub transactions: Vec<TransactionView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerView {
    pub wallet_address: String,
    pub games_played: u64,
    pub wins: u64,
    pub losses: u64,
    pub win_rate: u8,
    pub apt_won: f64,
    pub emoji_won: f64,
    pub referrals: u64,
    pub referral_code: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerResponse {
    pub success: bool,
    pub found: bool,
    pub player: Option<PlayerView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileResponse {
    pub success: bool,
    pub examined: usize,
    pub completed: usize,
    pub failed: usize,
    pub still_pending: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminStatusOverrideRequest {
    pub status: String,
    pub reason: Option<String>,
}

struct SettlementInput {
    address: WalletAddress,
    token: TokenType,
    amount: TokenAmount,
}

fn parse_settlement_input(
    address: &str,
    token: &str,
    amount: f64,
) -> Result<SettlementInput, String> {
    let address = WalletAddress::new(address).map_err(|e| e.to_string())?;
    let token = TokenType::parse(token).map_err(|e| e.to_string())?;
    if amount <= 0.0 {
        return Err("amount must be positive".to_string());
    }
    let amount = token.to_base_units(amount).map_err(|e| e.to_string())?;
    Ok(SettlementInput {
        address,
        token,
        amount,
    })
}

fn bad_request(error: impl Into<String>) -> (StatusCode, Json<WithdrawResponseBody>) {
    (
        StatusCode::BAD_REQUEST,
        Json(WithdrawResponseBody {
            success: false,
            error: Some(error.into()),
            ..WithdrawResponseBody::default()
        }),
    )
}

async fn health() -> Json<HealthResponse> {
    info!(route = "/health", "payout http request");
    Json(HealthResponse {
        ok: true,
        service: "payout-api",
    })
}

async fn withdraw(
    State(state): State<ApiState>,
    Json(body): Json<WithdrawRequestBody>,
) -> (StatusCode, Json<WithdrawResponseBody>) {
    info!(
        route = "/payout/withdraw",
        player = %body.player_address,
        token = %body.token_type,
        "payout http request"
    );
    let input = match parse_settlement_input(&body.player_address, &body.token_type, body.amount) {
        Ok(input) => input,
        Err(error) => return bad_request(error),
    };

    let request = WithdrawalRequest {
        player_address: input.address,
        token: input.token,
        amount: input.amount,
    };
    match state.settlement.withdraw(&request).await {
        Ok(WithdrawalOutcome::Completed {
            tx_hash,
            explorer_url,
            ..
        }) => (
            StatusCode::OK,
            Json(WithdrawResponseBody {
                success: true,
                transaction_hash: Some(tx_hash),
                explorer_url: Some(explorer_url),
                message: Some("withdrawal completed".to_string()),
                ..WithdrawResponseBody::default()
            }),
        ),
        Ok(WithdrawalOutcome::Pending {
            tx_hash,
            explorer_url,
            ..
        }) => (
            StatusCode::ACCEPTED,
            Json(WithdrawResponseBody {
                success: true,
                transaction_hash: Some(tx_hash),
                explorer_url: Some(explorer_url),
                message: Some(
                    "transfer submitted; confirmation still pending, check back later".to_string(),
                ),
                ..WithdrawResponseBody::default()
            }),
        ),
        Err(err) => withdrawal_error_response(&state, err),
    }
}

fn withdrawal_error_response(
    state: &ApiState,
    err: SettlementError,
) -> (StatusCode, Json<WithdrawResponseBody>) {
    match err {
        SettlementError::InsufficientBalance { .. } => (
            StatusCode::BAD_REQUEST,
            Json(WithdrawResponseBody {
                success: false,
                error: Some("insufficient balance".to_string()),
                details: Some(err.to_string()),
                ..WithdrawResponseBody::default()
            }),
        ),
        SettlementError::InvalidRequest(detail) => (
            StatusCode::BAD_REQUEST,
            Json(WithdrawResponseBody {
                success: false,
                error: Some("invalid request".to_string()),
                details: Some(detail),
                ..WithdrawResponseBody::default()
            }),
        ),
        SettlementError::ChainExecution { hash, vm_status } => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(WithdrawResponseBody {
                success: false,
                explorer_url: Some(state.settlement.explorer_url(&hash)),
                transaction_hash: Some(hash),
                error: Some("transaction failed on chain".to_string()),
                details: Some(vm_status),
                ..WithdrawResponseBody::default()
            }),
        ),
        SettlementError::ChainSubmission(detail) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(WithdrawResponseBody {
                success: false,
                error: Some("chain submission failed".to_string()),
                details: Some(detail),
                ..WithdrawResponseBody::default()
            }),
        ),
        SettlementError::LedgerLookup(detail) | SettlementError::LedgerWrite(detail) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(WithdrawResponseBody {
                success: false,
                error: Some("ledger error".to_string()),
                details: Some(detail),
                ..WithdrawResponseBody::default()
            }),
        ),
        SettlementError::Internal(detail) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(WithdrawResponseBody {
                success: false,
                error: Some("internal error".to_string()),
                details: Some(detail),
                ..WithdrawResponseBody::default()
            }),
        ),
    }
}

async fn payout(
    State(state): State<ApiState>,
    Json(body): Json<PayoutRequestBody>,
) -> (StatusCode, Json<PayoutResponseBody>) {
    info!(
        route = "/payout",
        player = %body.player_address,
        game_id = %body.game_id,
        "payout http request"
    );
    let input = match parse_settlement_input(&body.player_address, &body.token_type, body.amount) {
        Ok(input) => input,
        Err(error) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(PayoutResponseBody {
                    success: false,
                    transaction_hash: None,
                    details: None,
                    error: Some(error),
                }),
            );
        }
    };

    let request = PayoutRequest {
        player_address: input.address,
        token: input.token,
        amount: input.amount,
        game_id: body.game_id,
    };
    match state.settlement.credit_payout(&request).await {
        Ok(PayoutOutcome::Credited { new_balance }) => (
            StatusCode::OK,
            Json(PayoutResponseBody {
                success: true,
                transaction_hash: None,
                details: Some(format!(
                    "credited; new balance {}",
                    request.token.to_human(new_balance)
                )),
                error: None,
            }),
        ),
        Ok(PayoutOutcome::AlreadyCredited) => (
            StatusCode::OK,
            Json(PayoutResponseBody {
                success: true,
                transaction_hash: None,
                details: Some("already credited for this game".to_string()),
                error: None,
            }),
        ),
        Err(SettlementError::InvalidRequest(detail)) => (
            StatusCode::BAD_REQUEST,
            Json(PayoutResponseBody {
                success: false,
                transaction_hash: None,
                details: Some(detail),
                error: Some("invalid request".to_string()),
            }),
        ),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(PayoutResponseBody {
                success: false,
                transaction_hash: None,
                details: Some(err.to_string()),
                error: Some("payout failed".to_string()),
            }),
        ),
    }
}

async fn stats(
    State(state): State<ApiState>,
    Json(body): Json<StatsRequestBody>,
) -> (StatusCode, Json<SimpleResponseBody>) {
    info!(route = "/stats", player = %body.player_address, "payout http request");
    let address = match WalletAddress::new(&body.player_address) {
        Ok(address) => address,
        Err(err) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(SimpleResponseBody {
                    success: false,
                    error: Some(err.to_string()),
                }),
            );
        }
    };
    let deltas = match parse_stat_deltas(&body) {
        Ok(deltas) => deltas,
        Err(error) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(SimpleResponseBody {
                    success: false,
                    error: Some(error),
                }),
            );
        }
    };

    match state.settlement.apply_stat_deltas(&address, &deltas).await {
        Ok(_) => (
            StatusCode::OK,
            Json(SimpleResponseBody {
                success: true,
                error: None,
            }),
        ),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(SimpleResponseBody {
                success: false,
                error: Some(err.to_string()),
            }),
        ),
    }
}

fn parse_stat_deltas(body: &StatsRequestBody) -> Result<ledger_store::StatDeltas, String> {
    let convert = |value: i64, field: &str| {
        u32::try_from(value).map_err(|_| format!("{field} must be a non-negative delta"))
    };
    Ok(ledger_store::StatDeltas {
        games: convert(body.games_delta, "gamesDelta")?,
        wins: convert(body.wins_delta, "winsDelta")?,
        losses: convert(body.losses_delta, "lossesDelta")?,
    })
}

async fn referral(
    State(state): State<ApiState>,
    Json(body): Json<ReferralRequestBody>,
) -> (StatusCode, Json<SimpleResponseBody>) {
    info!(route = "/referral", player = %body.player_address, "payout http request");
    let address = match WalletAddress::new(&body.player_address) {
        Ok(address) => address,
        Err(err) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(SimpleResponseBody {
                    success: false,
                    error: Some(err.to_string()),
                }),
            );
        }
    };

    match state.settlement.accept_referral(&address, &body.code).await {
        Ok(()) => (
            StatusCode::OK,
            Json(SimpleResponseBody {
                success: true,
                error: None,
            }),
        ),
        Err(SettlementError::InvalidRequest(detail)) => (
            StatusCode::BAD_REQUEST,
            Json(SimpleResponseBody {
                success: false,
                error: Some(detail),
            }),
        ),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(SimpleResponseBody {
                success: false,
                error: Some(err.to_string()),
            }),
        ),
    }
}

async fn escrow_balances(State(state): State<ApiState>) -> Json<EscrowBalancesResponse> {
    info!(route = "/escrow/balances", "payout http request");
    let snapshot = state.monitor.snapshot().await;
    Json(EscrowBalancesResponse {
        apt: snapshot
            .balances
            .get(&TokenType::Apt)
            .map(|b| TokenType::Apt.to_human(*b)),
        emojicoin: snapshot
            .balances
            .get(&TokenType::Emojicoin)
            .map(|b| TokenType::Emojicoin.to_human(*b)),
        available_tokens: snapshot
            .available_tokens
            .iter()
            .map(|t| t.as_str().to_string())
            .collect(),
    })
}

fn transaction_view(state: &ApiState, record: TransactionRecord) -> TransactionView {
    TransactionView {
        id: record.id.to_string(),
        player_address: record.player_address.as_str().to_string(),
        amount: record.token_type.to_human(record.amount),
        token_type: record.token_type.as_str().to_string(),
        correlation_id: record.correlation_id,
        status: record.status.as_str().to_string(),
        explorer_url: record
            .tx_hash
            .as_deref()
            .map(|hash| state.settlement.explorer_url(hash)),
        transaction_hash: record.tx_hash,
        created_at: record.created_at,
        updated_at: record.updated_at,
    }
}

async fn player_transactions(
    State(state): State<ApiState>,
    Path(address): Path<String>,
) -> (StatusCode, Json<TransactionsResponse>) {
    info!(route = "/transactions/:address", player = %address, "payout http request");
    let address = match WalletAddress::new(&address) {
        Ok(address) => address,
        Err(err) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(TransactionsResponse {
                    success: false,
                    transactions: Vec::new(),
                    error: Some(err.to_string()),
                }),
            );
        }
    };

    match state
        .transactions
        .list_player_transactions(&address, PageRequest::default())
        .await
    {
        Ok(records) => (
            StatusCode::OK,
            Json(TransactionsResponse {
                success: true,
                transactions: records
                    .into_iter()
                    .map(|record| transaction_view(&state, record))
                    .collect(),
                error: None,
            }),
        ),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(TransactionsResponse {
                success: false,
                transactions: Vec::new(),
                error: Some(err.to_string()),
            }),
        ),
    }
}

fn player_view(entry: PlayerLedgerEntry) -> PlayerView {
    PlayerView {
        wallet_address: entry.wallet_address.as_str().to_string(),
        games_played: entry.games_played,
        wins: entry.wins,
        losses: entry.losses,
        win_rate: entry.win_rate,
        apt_won: TokenType::Apt.to_human(entry.apt_won),
        emoji_won: TokenType::Emojicoin.to_human(entry.emoji_won),
        referrals: entry.referrals,
        referral_code: entry.referral_code,
    }
}

async fn player_entry(
    State(state): State<ApiState>,
    Path(address): Path<String>,
) -> (StatusCode, Json<PlayerResponse>) {
    info!(route = "/players/:address", player = %address, "payout http request");
    let address = match WalletAddress::new(&address) {
        Ok(address) => address,
        Err(err) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(PlayerResponse {
                    success: false,
                    found: false,
                    player: None,
                    error: Some(err.to_string()),
                }),
            );
        }
    };

    match state.players.get_player(&address).await {
        Ok(entry) => {
            let player = entry.map(player_view);
            (
                StatusCode::OK,
                Json(PlayerResponse {
                    success: true,
                    found: player.is_some(),
                    player,
                    error: None,
                }),
            )
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(PlayerResponse {
                success: false,
                found: false,
                player: None,
                error: Some(err.to_string()),
            }),
        ),
    }
}

async fn admin_reconcile(State(state): State<ApiState>) -> (StatusCode, Json<ReconcileResponse>) {
    info!(route = "/admin/reconcile", "payout http request");
    match state.settlement.reconcile_pending(50).await {
        Ok(report) => (
            StatusCode::OK,
            Json(ReconcileResponse {
                success: true,
                examined: report.examined,
                completed: report.completed,
                failed: report.failed,
                still_pending: report.still_pending,
            }),
        ),
        Err(err) => {
            tracing::warn!(error = %err, "reconciliation pass failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ReconcileResponse {
                    success: false,
                    examined: 0,
                    completed: 0,
                    failed: 0,
                    still_pending: 0,
                }),
            )
        }
    }
}

async fn admin_override_status(
    State(state): State<ApiState>,
    Path(correlation_id): Path<String>,
    Json(body): Json<AdminStatusOverrideRequest>,
) -> (StatusCode, Json<SimpleResponseBody>) {
    info!(
        route = "/admin/transactions/:id/status",
        correlation_id = %correlation_id,
        status = %body.status,
        reason = body.reason.as_deref().unwrap_or("unspecified"),
        "payout http request"
    );
    let Some(status) = TransactionStatus::parse(&body.status) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(SimpleResponseBody {
                success: false,
                error: Some(format!("unknown status {}", body.status)),
            }),
        );
    };

    match state
        .transactions
        .update_transaction_status(
            &correlation_id,
            &TransactionStatusUpdate {
                status,
                tx_hash: None,
                updated_at: Utc::now(),
            },
        )
        .await
    {
        Ok(_) => (
            StatusCode::OK,
            Json(SimpleResponseBody {
                success: true,
                error: None,
            }),
        ),
        Err(err @ ledger_store::LedgerStoreError::TransactionNotFound(_)) => (
            StatusCode::NOT_FOUND,
            Json(SimpleResponseBody {
                success: false,
                error: Some(err.to_string()),
            }),
        ),
        Err(err @ ledger_store::LedgerStoreError::InvalidStatusTransition { .. }) => (
            StatusCode::BAD_REQUEST,
            Json(SimpleResponseBody {
                success: false,
                error: Some(err.to_string()),
            }),
        ),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(SimpleResponseBody {
                success: false,
                error: Some(err.to_string()),
            }),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chain_client::{ChainClientError, EscrowWalletAdapter, TransferOutcome};
    use escrow_monitor::FundingThresholds;
    use ledger_store::InMemoryLedgerStore;
    use settlement::SettlementConfig;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Debug, Clone)]
    struct TestWallet {
        commit: bool,
        apt_balance: u64,
        emojicoin_balance: u64,
        counter: Arc<Mutex<u64>>,
    }

    impl Default for TestWallet {
        fn default() -> Self {
            Self {
                commit: true,
                apt_balance: 500_000_000,
                emojicoin_balance: 50_000,
                counter: Arc::new(Mutex::new(0)),
            }
        }
    }

    #[async_trait]
    impl EscrowWalletAdapter for TestWallet {
        async fn submit_transfer(
            &self,
            _recipient: &WalletAddress,
            _amount: TokenAmount,
            _token: TokenType,
        ) -> Result<String, ChainClientError> {
            let mut counter = self.counter.lock().expect("lock");
            *counter += 1;
            Ok(format!("0xhash{counter}"))
        }

        async fn await_confirmation(
            &self,
            _hash: &str,
            _timeout: Duration,
        ) -> Result<TransferOutcome, ChainClientError> {
            Ok(if self.commit {
                TransferOutcome::Committed
            } else {
                TransferOutcome::Unknown
            })
        }

        async fn account_balance(
            &self,
            _address: &str,
            token: TokenType,
        ) -> Result<TokenAmount, ChainClientError> {
            Ok(TokenAmount(match token {
                TokenType::Apt => self.apt_balance,
                TokenType::Emojicoin => self.emojicoin_balance,
            }))
        }
    }

    fn build_state(wallet: TestWallet) -> (ApiState, InMemoryLedgerStore) {
        let ledger = InMemoryLedgerStore::new();
        let wallet = Arc::new(wallet);
        let settlement = Arc::new(SettlementService::new(
            Arc::new(ledger.clone()),
            wallet.clone(),
            SettlementConfig {
                explorer_base_url: "https://explorer.aptoslabs.com".to_string(),
                network: "testnet".to_string(),
                confirmation_timeout: Duration::from_secs(30),
            },
        ));
        let monitor = Arc::new(EscrowFundingMonitor::new(
            wallet,
            "0xe5c40",
            FundingThresholds {
                min_apt: TokenAmount(100_000_000),
                min_emojicoin: TokenAmount(1_000),
            },
        ));
        (
            ApiState {
                settlement,
                monitor,
                players: Arc::new(ledger.clone()),
                transactions: Arc::new(ledger.clone()),
            },
            ledger,
        )
    }

    async fn seed_payout(state: &ApiState, address: &str, token: &str, amount: f64, game_id: &str) {
        let (status, response) = payout(
            State(state.clone()),
            Json(PayoutRequestBody {
                player_address: address.to_string(),
                amount,
                token_type: token.to_string(),
                game_id: game_id.to_string(),
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(response.0.success);
    }

    #[tokio::test]
    async fn withdraw_happy_path_returns_hash_and_debits_ledger() {
        let (state, ledger) = build_state(TestWallet::default());
        seed_payout(&state, "0xp1a1", "APT", 2.5, "game-1").await;

        let (status, response) = withdraw(
            State(state.clone()),
            Json(WithdrawRequestBody {
                player_address: "0xP1A1".to_string(),
                amount: 1.0,
                token_type: "APT".to_string(),
            }),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        let body = response.0;
        assert!(body.success);
        let hash = body.transaction_hash.expect("hash");
        assert!(body.explorer_url.expect("explorer").contains(&hash));

        let address = WalletAddress::new("0xp1a1").expect("address");
        let entry = ledger
            .get_player(&address)
            .await
            .expect("get")
            .expect("entry");
        assert_eq!(entry.apt_won, TokenAmount(150_000_000));
        let records = ledger.transactions_snapshot();
        assert!(records.iter().any(|r| {
            r.status == TransactionStatus::Completed && r.correlation_id.starts_with("withdrawal_")
        }));
    }

    #[tokio::test]
    async fn withdraw_with_zero_balance_is_rejected_without_residue() {
        let (state, ledger) = build_state(TestWallet::default());

        let (status, response) = withdraw(
            State(state.clone()),
            Json(WithdrawRequestBody {
                player_address: "0xp1a2".to_string(),
                amount: 5.0,
                token_type: "EMOJICOIN".to_string(),
            }),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        let body = response.0;
        assert!(!body.success);
        assert_eq!(body.error.as_deref(), Some("insufficient balance"));
        assert!(body.details.expect("details").contains("insufficient"));
        assert!(
            ledger.transactions_snapshot().is_empty(),
            "no record may be left behind"
        );
    }

    #[tokio::test]
    async fn withdraw_rejects_unknown_token_and_bad_amounts() {
        let (state, _ledger) = build_state(TestWallet::default());

        let (status, response) = withdraw(
            State(state.clone()),
            Json(WithdrawRequestBody {
                player_address: "0xp1a3".to_string(),
                amount: 1.0,
                token_type: "DOGE".to_string(),
            }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(response.0.error.expect("error").contains("unsupported"));

        let (status, response) = withdraw(
            State(state),
            Json(WithdrawRequestBody {
                player_address: "0xp1a3".to_string(),
                amount: -2.0,
                token_type: "APT".to_string(),
            }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(response.0.error.expect("error").contains("positive"));
    }

    #[tokio::test]
    async fn pending_confirmation_returns_accepted_with_check_back_message() {
        let (state, ledger) = build_state(TestWallet {
            commit: false,
            ..TestWallet::default()
        });
        seed_payout(&state, "0xp1a4", "APT", 1.0, "game-2").await;

        let (status, response) = withdraw(
            State(state),
            Json(WithdrawRequestBody {
                player_address: "0xp1a4".to_string(),
                amount: 1.0,
                token_type: "APT".to_string(),
            }),
        )
        .await;

        assert_eq!(status, StatusCode::ACCEPTED);
        let body = response.0;
        assert!(body.success);
        assert!(body.message.expect("message").contains("check back"));

        // Pending means not debited yet.
        let address = WalletAddress::new("0xp1a4").expect("address");
        let entry = ledger
            .get_player(&address)
            .await
            .expect("get")
            .expect("entry");
        assert_eq!(entry.apt_won, TokenAmount(100_000_000));
    }

    #[tokio::test]
    async fn duplicate_game_id_payout_reports_already_credited() {
        let (state, ledger) = build_state(TestWallet::default());
        seed_payout(&state, "0xp1a5", "EMOJICOIN", 3.0, "game-dup").await;

        let (status, response) = payout(
            State(state),
            Json(PayoutRequestBody {
                player_address: "0xp1a5".to_string(),
                amount: 3.0,
                token_type: "EMOJICOIN".to_string(),
                game_id: "game-dup".to_string(),
            }),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        let body = response.0;
        assert!(body.success);
        assert!(body.details.expect("details").contains("already credited"));
        assert!(body.transaction_hash.is_none());

        let address = WalletAddress::new("0xp1a5").expect("address");
        let entry = ledger
            .get_player(&address)
            .await
            .expect("get")
            .expect("entry");
        assert_eq!(entry.emoji_won, TokenAmount(300_000_000));
    }

    #[tokio::test]
    async fn stats_endpoint_rejects_negative_deltas_and_applies_valid_ones() {
        let (state, ledger) = build_state(TestWallet::default());

        let (status, response) = stats(
            State(state.clone()),
            Json(StatsRequestBody {
                player_address: "0xp1a6".to_string(),
                games_delta: -1,
                wins_delta: 0,
                losses_delta: 0,
            }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(response.0.error.expect("error").contains("gamesDelta"));

        let (status, _) = stats(
            State(state),
            Json(StatsRequestBody {
                player_address: "0xp1a6".to_string(),
                games_delta: 4,
                wins_delta: 3,
                losses_delta: 1,
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let address = WalletAddress::new("0xp1a6").expect("address");
        let entry = ledger
            .get_player(&address)
            .await
            .expect("get")
            .expect("entry");
        assert_eq!(entry.games_played, 4);
        assert_eq!(entry.win_rate, 75);
    }

    #[tokio::test]
    async fn referral_endpoint_applies_exact_code_match_once() {
        let (state, ledger) = build_state(TestWallet::default());
        let referrer = WalletAddress::new("0xp1a7").expect("address");
        let code = ledger
            .ensure_player(&referrer)
            .await
            .expect("referrer")
            .referral_code;

        let (status, _) = referral(
            State(state.clone()),
            Json(ReferralRequestBody {
                player_address: "0xp1a8".to_string(),
                code: code.clone(),
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, response) = referral(
            State(state),
            Json(ReferralRequestBody {
                player_address: "0xp1a8".to_string(),
                code,
            }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(response.0.error.expect("error").contains("already accepted"));
    }

    #[tokio::test]
    async fn escrow_balances_exclude_tokens_below_threshold() {
        // 0.5 APT on hand against a 1 APT minimum; emojicoin is funded.
        let (state, _ledger) = build_state(TestWallet {
            apt_balance: 50_000_000,
            ..TestWallet::default()
        });

        let response = escrow_balances(State(state)).await.0;
        assert_eq!(response.apt, Some(0.5));
        assert!(!response.available_tokens.contains(&"APT".to_string()));
        assert!(response.available_tokens.contains(&"EMOJICOIN".to_string()));
    }

    #[tokio::test]
    async fn transaction_history_lists_player_records_with_explorer_links() {
        let (state, _ledger) = build_state(TestWallet::default());
        seed_payout(&state, "0xp1a9", "APT", 2.0, "game-h1").await;
        let (status, _) = withdraw(
            State(state.clone()),
            Json(WithdrawRequestBody {
                player_address: "0xp1a9".to_string(),
                amount: 1.0,
                token_type: "APT".to_string(),
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, response) =
            player_transactions(State(state), Path("0xp1a9".to_string())).await;
        assert_eq!(status, StatusCode::OK);
        let body = response.0;
        assert!(body.success);
        assert_eq!(body.transactions.len(), 2);
        let withdrawal = body
            .transactions
            .iter()
            .find(|t| t.correlation_id.starts_with("withdrawal_"))
            .expect("withdrawal row");
        assert_eq!(withdrawal.status, "completed");
        assert!(withdrawal.explorer_url.as_deref().expect("url").contains("explorer"));
    }

    #[tokio::test]
    async fn player_endpoint_reports_found_and_human_balances() {
        let (state, _ledger) = build_state(TestWallet::default());
        seed_payout(&state, "0xp1aa", "APT", 1.5, "game-p1").await;

        let (status, response) = player_entry(State(state.clone()), Path("0xP1AA".to_string())).await;
        assert_eq!(status, StatusCode::OK);
        let body = response.0;
        assert!(body.found);
        assert_eq!(body.player.expect("player").apt_won, 1.5);

        let (_, response) = player_entry(State(state), Path("0xffff".to_string())).await;
        assert!(!response.0.found);
    }

    #[tokio::test]
    async fn admin_reconcile_resolves_pending_withdrawals() {
        let (state, ledger) = build_state(TestWallet {
            commit: false,
            ..TestWallet::default()
        });
        seed_payout(&state, "0xp1ab", "APT", 2.0, "game-r1").await;
        let (status, _) = withdraw(
            State(state.clone()),
            Json(WithdrawRequestBody {
                player_address: "0xp1ab".to_string(),
                amount: 1.0,
                token_type: "APT".to_string(),
            }),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);

        // Reconciling against a wallet that still reports no verdict keeps
        // the record pending.
        let (status, response) = admin_reconcile(State(state.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(response.0.still_pending, 1);
        let records = ledger.transactions_snapshot();
        assert!(records.iter().any(|r| r.status == TransactionStatus::Pending));
    }

    #[tokio::test]
    async fn admin_status_override_respects_transition_rules() {
        let (state, ledger) = build_state(TestWallet {
            commit: false,
            ..TestWallet::default()
        });
        seed_payout(&state, "0xp1ac", "APT", 2.0, "game-o1").await;
        let (status, _) = withdraw(
            State(state.clone()),
            Json(WithdrawRequestBody {
                player_address: "0xp1ac".to_string(),
                amount: 1.0,
                token_type: "APT".to_string(),
            }),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let pending = ledger
            .transactions_snapshot()
            .into_iter()
            .find(|r| r.status == TransactionStatus::Pending)
            .expect("pending record");

        let (status, _) = admin_override_status(
            State(state.clone()),
            Path(pending.correlation_id.clone()),
            Json(AdminStatusOverrideRequest {
                status: "failed".to_string(),
                reason: Some("operator resolved as failed".to_string()),
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        // A terminal record cannot be flipped back.
        let (status, response) = admin_override_status(
            State(state),
            Path(pending.correlation_id),
            Json(AdminStatusOverrideRequest {
                status: "completed".to_string(),
                reason: None,
            }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(response.0.error.expect("error").contains("transition"));
    }

    #[tokio::test]
    async fn admin_status_override_404s_unknown_correlation_ids() {
        let (state, _ledger) = build_state(TestWallet::default());
        let (status, _) = admin_override_status(
            State(state),
            Path("withdrawal_unknown".to_string()),
            Json(AdminStatusOverrideRequest {
                status: "failed".to_string(),
                reason: None,
            }),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
