use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use ed25519_dalek::{Signer, SigningKey};
use game_domain::{TokenAmount, TokenType, WalletAddress};
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::debug;

pub const APT_COIN_TYPE: &str = "0x1::aptos_coin::AptosCoin";

const TRANSFER_FUNCTION: &str = "0x1::aptos_account::transfer_coins";
const MAX_GAS_AMOUNT: u64 = 2_000;
const GAS_UNIT_PRICE: u64 = 100;
const TRANSACTION_EXPIRY_SECS: i64 = 120;

#[derive(Debug, Error)]
pub enum ChainClientError {
    #[error("chain submission failed: {0}")]
    Submission(String),
    #[error("chain lookup failed: {0}")]
    Lookup(String),
    #[error("invalid escrow key material: {0}")]
    InvalidKey(String),
}

/// Final observation for a submitted transfer. `Unknown` means the bounded
/// confirmation wait elapsed without a terminal answer from the chain; it is
/// neither a success nor a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    Committed,
    Reverted { vm_status: String },
    Unknown,
}

/// Coin-type tags per token. The emojicoin tag comes from configuration so
/// test networks can piggyback on the APT coin without code changes.
#[derive(Debug, Clone)]
pub struct TokenRegistry {
    emojicoin_type: String,
}

impl TokenRegistry {
    #[must_use]
    pub fn new(emojicoin_type: impl Into<String>) -> Self {
        Self {
            emojicoin_type: emojicoin_type.into(),
        }
    }

    #[must_use]
    pub fn coin_type(&self, token: TokenType) -> &str {
        match token {
            TokenType::Apt => APT_COIN_TYPE,
            TokenType::Emojicoin => &self.emojicoin_type,
        }
    }
}

/// The escrow account's signing identity. Key bytes stay private to this
/// type and are never printed or serialized.
pub struct EscrowSigner {
    address: String,
    signing_key: SigningKey,
}

impl EscrowSigner {
    pub fn from_hex(address: &str, private_key_hex: &str) -> Result<Self, ChainClientError> {
        let cleaned = private_key_hex.trim();
        let cleaned = cleaned.strip_prefix("ed25519-priv-").unwrap_or(cleaned);
        let cleaned = cleaned.strip_prefix("0x").unwrap_or(cleaned);
        let bytes = hex::decode(cleaned).map_err(|e| ChainClientError::InvalidKey(e.to_string()))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| ChainClientError::InvalidKey("expected a 32-byte ed25519 key".to_string()))?;
        Ok(Self {
            address: address.trim().to_ascii_lowercase(),
            signing_key: SigningKey::from_bytes(&bytes),
        })
    }

    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    #[must_use]
    pub fn public_key_hex(&self) -> String {
        format!("0x{}", hex::encode(self.signing_key.verifying_key().to_bytes()))
    }

    #[must_use]
    pub fn sign_hex(&self, message: &[u8]) -> String {
        format!("0x{}", hex::encode(self.signing_key.sign(message).to_bytes()))
    }
}

impl std::fmt::Debug for EscrowSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EscrowSigner")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait EscrowWalletAdapter: Send + Sync {
    /// Builds, signs, and broadcasts an escrow -> recipient transfer; returns
    /// the transaction hash. Confirmation is a separate call.
    async fn submit_transfer(
        &self,
        recipient: &WalletAddress,
        amount: TokenAmount,
        token: TokenType,
    ) -> Result<String, ChainClientError>;

    /// Bounded wait for the chain's verdict on a submitted hash.
    async fn await_confirmation(
        &self,
        hash: &str,
        timeout: Duration,
    ) -> Result<TransferOutcome, ChainClientError>;

    async fn account_balance(
        &self,
        address: &str,
        token: TokenType,
    ) -> Result<TokenAmount, ChainClientError>;
}

#[must_use]
pub fn build_transfer_payload(coin_type: &str, recipient: &str, amount: TokenAmount) -> Value {
    json!({
        "type": "entry_function_payload",
        "function": TRANSFER_FUNCTION,
        "type_arguments": [coin_type],
        "arguments": [recipient, amount.as_u64().to_string()],
    })
}

/// Aptos fullnode REST client. Signing happens locally: the node supplies
/// the BCS signing message via `encode_submission`, this client signs it
/// with the escrow key and submits the JSON transaction.
#[derive(Debug)]
pub struct ReqwestAptosClient {
    node_url: String,
    registry: TokenRegistry,
    signer: EscrowSigner,
    client: reqwest::Client,
    poll_interval: Duration,
}

impl ReqwestAptosClient {
    #[must_use]
    pub fn new(
        node_url: impl Into<String>,
        registry: TokenRegistry,
        signer: EscrowSigner,
        poll_interval: Duration,
    ) -> Self {
        Self {
            node_url: node_url.into().trim_end_matches('/').to_string(),
            registry,
            signer,
            client: reqwest::Client::new(),
            poll_interval,
        }
    }

    #[must_use]
    pub fn escrow_address(&self) -> &str {
        self.signer.address()
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
    ) -> Result<Option<T>, ChainClientError> {
        let url = format!("{}{path}", self.node_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ChainClientError::Lookup(e.to_string()))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(ChainClientError::Lookup(format!(
                "GET {path} returned {}",
                resp.status()
            )));
        }
        resp.json::<T>()
            .await
            .map(Some)
            .map_err(|e| ChainClientError::Lookup(e.to_string()))
    }

    async fn post_json<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &Value,
    ) -> Result<T, ChainClientError> {
        let url = format!("{}{path}", self.node_url);
        let resp = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| ChainClientError::Submission(e.to_string()))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let detail = resp
                .json::<ApiErrorBody>()
                .await
                .map(|e| e.message)
                .unwrap_or_else(|_| "no error detail".to_string());
            return Err(ChainClientError::Submission(format!(
                "POST {path} returned {status}: {detail}"
            )));
        }
        resp.json::<T>()
            .await
            .map_err(|e| ChainClientError::Submission(e.to_string()))
    }

    async fn account_sequence_number(&self) -> Result<u64, ChainClientError> {
        let path = format!("/v1/accounts/{}", self.signer.address());
        let account: AccountResponse = self
            .get_json(&path)
            .await?
            .ok_or_else(|| ChainClientError::Submission("escrow account not found".to_string()))?;
        account
            .sequence_number
            .parse::<u64>()
            .map_err(|e| ChainClientError::Submission(format!("bad sequence number: {e}")))
    }

    async fn transaction_by_hash(
        &self,
        hash: &str,
    ) -> Result<Option<TransactionStatusResponse>, ChainClientError> {
        self.get_json(&format!("/v1/transactions/by_hash/{hash}"))
            .await
    }
}

#[async_trait]
impl EscrowWalletAdapter for ReqwestAptosClient {
    async fn submit_transfer(
        &self,
        recipient: &WalletAddress,
        amount: TokenAmount,
        token: TokenType,
    ) -> Result<String, ChainClientError> {
        let sequence_number = self.account_sequence_number().await?;
        let expiration = Utc::now().timestamp() + TRANSACTION_EXPIRY_SECS;
        let mut transaction = json!({
            "sender": self.signer.address(),
            "sequence_number": sequence_number.to_string(),
            "max_gas_amount": MAX_GAS_AMOUNT.to_string(),
            "gas_unit_price": GAS_UNIT_PRICE.to_string(),
            "expiration_timestamp_secs": expiration.to_string(),
            "payload": build_transfer_payload(
                self.registry.coin_type(token),
                recipient.as_str(),
                amount,
            ),
        });

        let signing_message: String = self
            .post_json("/v1/transactions/encode_submission", &transaction)
            .await?;
        let message_hex = signing_message.strip_prefix("0x").unwrap_or(&signing_message);
        let message = hex::decode(message_hex)
            .map_err(|e| ChainClientError::Submission(format!("bad signing message: {e}")))?;

        transaction["signature"] = json!({
            "type": "ed25519_signature",
            "public_key": self.signer.public_key_hex(),
            "signature": self.signer.sign_hex(&message),
        });

        let submitted: SubmitResponse = self.post_json("/v1/transactions", &transaction).await?;
        debug!(
            hash = %submitted.hash,
            token = %token,
            sequence_number,
            "escrow transfer submitted"
        );
        Ok(submitted.hash)
    }

    async fn await_confirmation(
        &self,
        hash: &str,
        timeout: Duration,
    ) -> Result<TransferOutcome, ChainClientError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.transaction_by_hash(hash).await {
                Ok(Some(status)) if status.kind != "pending_transaction" => {
                    return Ok(if status.success.unwrap_or(false) {
                        TransferOutcome::Committed
                    } else {
                        TransferOutcome::Reverted {
                            vm_status: status
                                .vm_status
                                .unwrap_or_else(|| "unknown vm status".to_string()),
                        }
                    });
                }
                Ok(_) => {}
                // Transient lookup failures must not be read as a verdict;
                // keep polling until the deadline.
                Err(err) => debug!(hash, error = %err, "confirmation poll failed"),
            }
            if tokio::time::Instant::now() + self.poll_interval > deadline {
                return Ok(TransferOutcome::Unknown);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn account_balance(
        &self,
        address: &str,
        token: TokenType,
    ) -> Result<TokenAmount, ChainClientError> {
        let coin_type = self.registry.coin_type(token);
        let path = format!(
            "/v1/accounts/{address}/resource/0x1::coin::CoinStore%3C{coin_type}%3E"
        );
        let Some(resource) = self.get_json::<CoinStoreResource>(&path).await? else {
            // Account has never registered this coin; treat as empty.
            return Ok(TokenAmount::ZERO);
        };
        resource
            .data
            .coin
            .value
            .parse::<u64>()
            .map(TokenAmount)
            .map_err(|e| ChainClientError::Lookup(format!("bad coin value: {e}")))
    }
}

#[derive(Debug, Deserialize)]
struct AccountResponse {
    sequence_number: String,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    hash: String,
}

#[derive(Debug, Deserialize)]
struct TransactionStatusResponse {
    #[serde(rename = "type")]
    kind: String,
    success: Option<bool>,
    vm_status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CoinStoreResource {
    data: CoinStoreData,
}

#[derive(Debug, Deserialize)]
struct CoinStoreData {
    coin: CoinValue,
}

#[derive(Debug, Deserialize)]
struct CoinValue {
    value: String,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    message: String,
}
