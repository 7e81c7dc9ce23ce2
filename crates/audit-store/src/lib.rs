use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use game_domain::TraceId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{PgPool, Row};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum AuditStoreError {
    #[error("store lock poisoned")]
    LockPoisoned,
    #[error("database error: {0}")]
    Database(String),
}

/// Append-only behavior event emitted by the settlement orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementEventRecord {
    pub event_id: String,
    pub event_kind: String,
    pub event_source: String,
    pub player_address: Option<String>,
    pub correlation_id: Option<String>,
    pub tx_hash: Option<String>,
    pub severity: String,
    pub payload_json: Value,
    pub occurred_at: DateTime<Utc>,
    pub trace_id: TraceId,
}

impl SettlementEventRecord {
    #[must_use]
    pub fn new(event_kind: impl Into<String>, severity: impl Into<String>) -> Self {
        Self {
            event_id: Uuid::now_v7().to_string(),
            event_kind: event_kind.into(),
            event_source: "settlement_orchestrator".to_string(),
            player_address: None,
            correlation_id: None,
            tx_hash: None,
            severity: severity.into(),
            payload_json: Value::Null,
            occurred_at: Utc::now(),
            trace_id: TraceId::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PageRequest {
    pub limit: usize,
    pub offset: usize,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            limit: 100,
            offset: 0,
        }
    }
}

#[async_trait]
pub trait AuditRepository: Send + Sync {
    async fn append_event(&self, record: &SettlementEventRecord) -> Result<(), AuditStoreError>;

    async fn list_events_by_correlation(
        &self,
        correlation_id: &str,
        page: PageRequest,
    ) -> Result<Vec<SettlementEventRecord>, AuditStoreError>;
}

#[derive(Debug, Default)]
pub struct NoopAuditRepository;

#[async_trait]
impl AuditRepository for NoopAuditRepository {
    async fn append_event(&self, _record: &SettlementEventRecord) -> Result<(), AuditStoreError> {
        Ok(())
    }

    async fn list_events_by_correlation(
        &self,
        _correlation_id: &str,
        _page: PageRequest,
    ) -> Result<Vec<SettlementEventRecord>, AuditStoreError> {
        Ok(Vec::new())
    }
}

#[derive(Debug, Default, Clone)]
pub struct InMemoryAuditRepository {
    pub events: Arc<Mutex<Vec<SettlementEventRecord>>>,
}

impl InMemoryAuditRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuditRepository for InMemoryAuditRepository {
    async fn append_event(&self, record: &SettlementEventRecord) -> Result<(), AuditStoreError> {
        self.events
            .lock()
            .map_err(|_| AuditStoreError::LockPoisoned)?
            .push(record.clone());
        Ok(())
    }

    async fn list_events_by_correlation(
        &self,
        correlation_id: &str,
        page: PageRequest,
    ) -> Result<Vec<SettlementEventRecord>, AuditStoreError> {
        let events = self
            .events
            .lock()
            .map_err(|_| AuditStoreError::LockPoisoned)?;
        Ok(events
            .iter()
            .filter(|event| event.correlation_id.as_deref() == Some(correlation_id))
            .skip(page.offset)
            .take(page.limit)
            .cloned()
            .collect())
    }
}

#[derive(Debug, Clone)]
pub struct PostgresAuditRepository {
    pool: PgPool,
}

impl PostgresAuditRepository {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<(), AuditStoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS settlement_events (
                event_id TEXT PRIMARY KEY,
                event_kind TEXT NOT NULL,
                event_source TEXT NOT NULL,
                player_address TEXT,
                correlation_id TEXT,
                tx_hash TEXT,
                severity TEXT NOT NULL,
                payload_json JSONB NOT NULL,
                occurred_at TIMESTAMPTZ NOT NULL,
                trace_id UUID NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| AuditStoreError::Database(e.to_string()))?;
        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_settlement_events_correlation
                ON settlement_events (correlation_id, occurred_at)
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| AuditStoreError::Database(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl AuditRepository for PostgresAuditRepository {
    async fn append_event(&self, record: &SettlementEventRecord) -> Result<(), AuditStoreError> {
        sqlx::query(
            r#"
            INSERT INTO settlement_events (
                event_id, event_kind, event_source, player_address,
                correlation_id, tx_hash, severity, payload_json,
                occurred_at, trace_id
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(&record.event_id)
        .bind(&record.event_kind)
        .bind(&record.event_source)
        .bind(record.player_address.as_deref())
        .bind(record.correlation_id.as_deref())
        .bind(record.tx_hash.as_deref())
        .bind(&record.severity)
        .bind(&record.payload_json)
        .bind(record.occurred_at)
        .bind(record.trace_id.0)
        .execute(&self.pool)
        .await
        .map_err(|e| AuditStoreError::Database(e.to_string()))?;
        Ok(())
    }

    async fn list_events_by_correlation(
        &self,
        correlation_id: &str,
        page: PageRequest,
    ) -> Result<Vec<SettlementEventRecord>, AuditStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM settlement_events
            WHERE correlation_id = $1
            ORDER BY occurred_at ASC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(correlation_id)
        .bind(page.limit as i64)
        .bind(page.offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AuditStoreError::Database(e.to_string()))?;

        rows.iter()
            .map(|row| {
                Ok(SettlementEventRecord {
                    event_id: row
                        .try_get("event_id")
                        .map_err(|e: sqlx::Error| AuditStoreError::Database(e.to_string()))?,
                    event_kind: row
                        .try_get("event_kind")
                        .map_err(|e: sqlx::Error| AuditStoreError::Database(e.to_string()))?,
                    event_source: row
                        .try_get("event_source")
                        .map_err(|e: sqlx::Error| AuditStoreError::Database(e.to_string()))?,
                    player_address: row
                        .try_get("player_address")
                        .map_err(|e: sqlx::Error| AuditStoreError::Database(e.to_string()))?,
                    correlation_id: row
                        .try_get("correlation_id")
                        .map_err(|e: sqlx::Error| AuditStoreError::Database(e.to_string()))?,
                    tx_hash: row
                        .try_get("tx_hash")
                        .map_err(|e: sqlx::Error| AuditStoreError::Database(e.to_string()))?,
                    severity: row
                        .try_get("severity")
                        .map_err(|e: sqlx::Error| AuditStoreError::Database(e.to_string()))?,
                    payload_json: row
                        .try_get("payload_json")
                        .map_err(|e: sqlx::Error| AuditStoreError::Database(e.to_string()))?,
                    occurred_at: row
                        .try_get("occurred_at")
                        .map_err(|e: sqlx::Error| AuditStoreError::Database(e.to_string()))?,
                    trace_id: TraceId(
                        row.try_get("trace_id")
                            .map_err(|e: sqlx::Error| AuditStoreError::Database(e.to_string()))?,
                    ),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_repo_appends_and_filters_by_correlation() {
        let repo = InMemoryAuditRepository::new();
        let mut event = SettlementEventRecord::new("withdrawal_submitted", "info");
        event.correlation_id = Some("w-1".to_string());
        repo.append_event(&event).await.expect("append");

        let mut other = SettlementEventRecord::new("payout_credited", "info");
        other.correlation_id = Some("game-9".to_string());
        repo.append_event(&other).await.expect("append");

        let events = repo
            .list_events_by_correlation("w-1", PageRequest::default())
            .await
            .expect("list");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_kind, "withdrawal_submitted");
    }
}
