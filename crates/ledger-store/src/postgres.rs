use async_trait::async_trait;
use chrono::Utc;
use game_domain::{TokenAmount, TokenType, WalletAddress};
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::{
    LedgerStoreError, PageRequest, PayoutCredit, PlayerLedgerEntry, PlayerStatsRepository,
    SettlementUnitOfWork, StatDeltas, TransactionLogRepository, TransactionRecord,
    TransactionRecordInsert, TransactionStatus, TransactionStatusUpdate, WithdrawalCommit,
    derive_win_rate, validate_transition,
};

const SCHEMA_SQL: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS player_stats (
        wallet_address TEXT PRIMARY KEY,
        games_played BIGINT NOT NULL DEFAULT 0,
        wins BIGINT NOT NULL DEFAULT 0,
        losses BIGINT NOT NULL DEFAULT 0,
        win_rate SMALLINT NOT NULL DEFAULT 0,
        apt_won BIGINT NOT NULL DEFAULT 0,
        emoji_won BIGINT NOT NULL DEFAULT 0,
        referrals BIGINT NOT NULL DEFAULT 0,
        referral_code TEXT NOT NULL UNIQUE,
        referred_by TEXT,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS game_transactions (
        id UUID PRIMARY KEY,
        player_address TEXT NOT NULL,
        amount BIGINT NOT NULL,
        token_type TEXT NOT NULL,
        correlation_id TEXT NOT NULL UNIQUE,
        status TEXT NOT NULL,
        tx_hash TEXT,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_game_transactions_player
        ON game_transactions (player_address, created_at DESC)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_game_transactions_status
        ON game_transactions (status, created_at)
    "#,
];

#[derive(Debug, Clone)]
pub struct PostgresLedgerStore {
    pool: PgPool,
}

impl PostgresLedgerStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<(), LedgerStoreError> {
        for statement in SCHEMA_SQL {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
        }
        tracing::info!("ledger schema ensured");
        Ok(())
    }
}

fn db_err(err: sqlx::Error) -> LedgerStoreError {
    LedgerStoreError::Database(err.to_string())
}

fn balance_column(token: TokenType) -> &'static str {
    match token {
        TokenType::Apt => "apt_won",
        TokenType::Emojicoin => "emoji_won",
    }
}

fn amount_to_db(amount: TokenAmount) -> Result<i64, LedgerStoreError> {
    i64::try_from(amount.as_u64())
        .map_err(|_| LedgerStoreError::Database("amount exceeds bigint range".to_string()))
}

fn amount_from_db(value: i64) -> Result<TokenAmount, LedgerStoreError> {
    u64::try_from(value)
        .map(TokenAmount)
        .map_err(|_| LedgerStoreError::Database("negative amount in ledger".to_string()))
}

fn counter_from_db(value: i64) -> Result<u64, LedgerStoreError> {
    u64::try_from(value)
        .map_err(|_| LedgerStoreError::Database("negative counter in ledger".to_string()))
}

fn row_to_player(row: &PgRow) -> Result<PlayerLedgerEntry, LedgerStoreError> {
    let address: String = row.try_get("wallet_address").map_err(db_err)?;
    let referred_by: Option<String> = row.try_get("referred_by").map_err(db_err)?;
    Ok(PlayerLedgerEntry {
        wallet_address: WalletAddress::new(&address)
            .map_err(|e| LedgerStoreError::Database(e.to_string()))?,
        games_played: counter_from_db(row.try_get("games_played").map_err(db_err)?)?,
        wins: counter_from_db(row.try_get("wins").map_err(db_err)?)?,
        losses: counter_from_db(row.try_get("losses").map_err(db_err)?)?,
        win_rate: u8::try_from(row.try_get::<i16, _>("win_rate").map_err(db_err)?)
            .unwrap_or_default(),
        apt_won: amount_from_db(row.try_get("apt_won").map_err(db_err)?)?,
        emoji_won: amount_from_db(row.try_get("emoji_won").map_err(db_err)?)?,
        referrals: counter_from_db(row.try_get("referrals").map_err(db_err)?)?,
        referral_code: row.try_get("referral_code").map_err(db_err)?,
        referred_by: referred_by
            .map(|value| WalletAddress::new(&value))
            .transpose()
            .map_err(|e| LedgerStoreError::Database(e.to_string()))?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
    })
}

fn row_to_transaction(row: &PgRow) -> Result<TransactionRecord, LedgerStoreError> {
    let address: String = row.try_get("player_address").map_err(db_err)?;
    let token: String = row.try_get("token_type").map_err(db_err)?;
    let status: String = row.try_get("status").map_err(db_err)?;
    Ok(TransactionRecord {
        id: row.try_get("id").map_err(db_err)?,
        player_address: WalletAddress::new(&address)
            .map_err(|e| LedgerStoreError::Database(e.to_string()))?,
        amount: amount_from_db(row.try_get("amount").map_err(db_err)?)?,
        token_type: TokenType::parse(&token)
            .map_err(|e| LedgerStoreError::Database(e.to_string()))?,
        correlation_id: row.try_get("correlation_id").map_err(db_err)?,
        status: TransactionStatus::parse(&status).ok_or_else(|| {
            LedgerStoreError::Database(format!("unknown transaction status {status}"))
        })?,
        tx_hash: row.try_get("tx_hash").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
    })
}

fn insert_player_sql() -> &'static str {
    r#"
    INSERT INTO player_stats (
        wallet_address, games_played, wins, losses, win_rate,
        apt_won, emoji_won, referrals, referral_code, referred_by,
        created_at, updated_at
    ) VALUES ($1, 0, 0, 0, 0, 0, 0, 0, $2, NULL, $3, $3)
    ON CONFLICT (wallet_address) DO NOTHING
    "#
}

#[async_trait]
impl PlayerStatsRepository for PostgresLedgerStore {
    async fn get_player(
        &self,
        address: &WalletAddress,
    ) -> Result<Option<PlayerLedgerEntry>, LedgerStoreError> {
        let row = sqlx::query("SELECT * FROM player_stats WHERE wallet_address = $1")
            .bind(address.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(row_to_player).transpose()
    }

    async fn ensure_player(
        &self,
        address: &WalletAddress,
    ) -> Result<PlayerLedgerEntry, LedgerStoreError> {
        let template = PlayerLedgerEntry::new_zeroed(address.clone(), Utc::now());
        sqlx::query(insert_player_sql())
            .bind(address.as_str())
            .bind(&template.referral_code)
            .bind(template.created_at)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        self.get_player(address)
            .await?
            .ok_or_else(|| LedgerStoreError::PlayerNotFound(address.as_str().to_string()))
    }

    async fn apply_stat_deltas(
        &self,
        address: &WalletAddress,
        deltas: &StatDeltas,
    ) -> Result<PlayerLedgerEntry, LedgerStoreError> {
        let template = PlayerLedgerEntry::new_zeroed(address.clone(), Utc::now());
        let fresh_win_rate =
            i16::from(derive_win_rate(u64::from(deltas.wins), u64::from(deltas.games)));
        let row = sqlx::query(
            r#"
            INSERT INTO player_stats (
                wallet_address, games_played, wins, losses, win_rate,
                apt_won, emoji_won, referrals, referral_code, referred_by,
                created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, 0, 0, 0, $6, NULL, $7, $7)
            ON CONFLICT (wallet_address) DO UPDATE SET
                games_played = player_stats.games_played + EXCLUDED.games_played,
                wins = player_stats.wins + EXCLUDED.wins,
                losses = player_stats.losses + EXCLUDED.losses,
                win_rate = CASE
                    WHEN player_stats.games_played + EXCLUDED.games_played = 0 THEN 0
                    ELSE ROUND(
                        (player_stats.wins + EXCLUDED.wins) * 100.0
                        / (player_stats.games_played + EXCLUDED.games_played)
                    )::smallint
                END,
                updated_at = EXCLUDED.updated_at
            RETURNING *
            "#,
        )
        .bind(address.as_str())
        .bind(i64::from(deltas.games))
        .bind(i64::from(deltas.wins))
        .bind(i64::from(deltas.losses))
        .bind(fresh_win_rate)
        .bind(&template.referral_code)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        row_to_player(&row)
    }

    async fn accept_referral(
        &self,
        new_player: &WalletAddress,
        code: &str,
    ) -> Result<(), LedgerStoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let referrer_row =
            sqlx::query("SELECT wallet_address FROM player_stats WHERE referral_code = $1")
                .bind(code)
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_err)?
                .ok_or(LedgerStoreError::ReferralCodeNotFound)?;
        let referrer_address: String = referrer_row.try_get("wallet_address").map_err(db_err)?;
        if referrer_address == new_player.as_str() {
            return Err(LedgerStoreError::SelfReferral);
        }

        let template = PlayerLedgerEntry::new_zeroed(new_player.clone(), Utc::now());
        sqlx::query(insert_player_sql())
            .bind(new_player.as_str())
            .bind(&template.referral_code)
            .bind(template.created_at)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        let marked = sqlx::query(
            r#"
            UPDATE player_stats
            SET referred_by = $1, updated_at = $2
            WHERE wallet_address = $3 AND referred_by IS NULL
            "#,
        )
        .bind(&referrer_address)
        .bind(Utc::now())
        .bind(new_player.as_str())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        if marked.rows_affected() == 0 {
            return Err(LedgerStoreError::ReferralAlreadyAccepted);
        }

        sqlx::query(
            r#"
            UPDATE player_stats
            SET referrals = referrals + 1, updated_at = $1
            WHERE wallet_address = $2
            "#,
        )
        .bind(Utc::now())
        .bind(&referrer_address)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)
    }
}

#[async_trait]
impl TransactionLogRepository for PostgresLedgerStore {
    async fn insert_transaction(
        &self,
        insert: &TransactionRecordInsert,
    ) -> Result<TransactionRecord, LedgerStoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO game_transactions (
                id, player_address, amount, token_type, correlation_id,
                status, tx_hash, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8)
            ON CONFLICT (correlation_id) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(insert.player_address.as_str())
        .bind(amount_to_db(insert.amount)?)
        .bind(insert.token_type.as_str())
        .bind(&insert.correlation_id)
        .bind(insert.status.as_str())
        .bind(insert.tx_hash.as_deref())
        .bind(insert.created_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or_else(|| LedgerStoreError::DuplicateCorrelationId(insert.correlation_id.clone()))?;
        row_to_transaction(&row)
    }

    async fn update_transaction_status(
        &self,
        correlation_id: &str,
        update: &TransactionStatusUpdate,
    ) -> Result<TransactionRecord, LedgerStoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let current = sqlx::query(
            "SELECT * FROM game_transactions WHERE correlation_id = $1 FOR UPDATE",
        )
        .bind(correlation_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?
        .ok_or_else(|| LedgerStoreError::TransactionNotFound(correlation_id.to_string()))?;
        let current = row_to_transaction(&current)?;
        validate_transition(current.status, update.status)?;

        let row = sqlx::query(
            r#"
            UPDATE game_transactions
            SET status = $1, tx_hash = COALESCE($2, tx_hash), updated_at = $3
            WHERE correlation_id = $4
            RETURNING *
            "#,
        )
        .bind(update.status.as_str())
        .bind(update.tx_hash.as_deref())
        .bind(update.updated_at)
        .bind(correlation_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;
        let record = row_to_transaction(&row)?;

        tx.commit().await.map_err(db_err)?;
        Ok(record)
    }

    async fn get_transaction(
        &self,
        correlation_id: &str,
    ) -> Result<Option<TransactionRecord>, LedgerStoreError> {
        let row = sqlx::query("SELECT * FROM game_transactions WHERE correlation_id = $1")
            .bind(correlation_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(row_to_transaction).transpose()
    }

    async fn list_player_transactions(
        &self,
        address: &WalletAddress,
        page: PageRequest,
    ) -> Result<Vec<TransactionRecord>, LedgerStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM game_transactions
            WHERE player_address = $1
            ORDER BY created_at DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(address.as_str())
        .bind(i64::from(page.limit))
        .bind(i64::from(page.offset))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_transaction).collect()
    }

    async fn list_transactions_by_status(
        &self,
        status: TransactionStatus,
        limit: u32,
    ) -> Result<Vec<TransactionRecord>, LedgerStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM game_transactions
            WHERE status = $1
            ORDER BY created_at ASC
            LIMIT $2
            "#,
        )
        .bind(status.as_str())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_transaction).collect()
    }
}

#[async_trait]
impl SettlementUnitOfWork for PostgresLedgerStore {
    async fn commit_withdrawal(
        &self,
        commit: &WithdrawalCommit,
    ) -> Result<PlayerLedgerEntry, LedgerStoreError> {
        let amount = amount_to_db(commit.amount)?;
        let column = balance_column(commit.token_type);
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let current = sqlx::query(
            "SELECT * FROM game_transactions WHERE correlation_id = $1 FOR UPDATE",
        )
        .bind(&commit.correlation_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?
        .ok_or_else(|| LedgerStoreError::TransactionNotFound(commit.correlation_id.clone()))?;
        let current = row_to_transaction(&current)?;
        validate_transition(current.status, TransactionStatus::Completed)?;
        if current.status == TransactionStatus::Completed {
            // Replayed commit: the debit already landed with the first call.
            let row = sqlx::query("SELECT * FROM player_stats WHERE wallet_address = $1")
                .bind(commit.player_address.as_str())
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_err)?
                .ok_or_else(|| {
                    LedgerStoreError::PlayerNotFound(commit.player_address.as_str().to_string())
                })?;
            let entry = row_to_player(&row)?;
            tx.commit().await.map_err(db_err)?;
            return Ok(entry);
        }

        // Conditional decrement: the balance guard and the debit are one
        // statement, so concurrent commits cannot drive the balance negative.
        let debited = sqlx::query(&format!(
            r#"
            UPDATE player_stats
            SET {column} = {column} - $1, updated_at = $2
            WHERE wallet_address = $3 AND {column} >= $1
            RETURNING *
            "#,
        ))
        .bind(amount)
        .bind(commit.updated_at)
        .bind(commit.player_address.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;

        let Some(entry_row) = debited else {
            let existing = sqlx::query("SELECT * FROM player_stats WHERE wallet_address = $1")
                .bind(commit.player_address.as_str())
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_err)?;
            return match existing {
                Some(row) => {
                    let entry = row_to_player(&row)?;
                    Err(LedgerStoreError::InsufficientBalance {
                        available: entry.balance(commit.token_type),
                        requested: commit.amount,
                    })
                }
                None => Err(LedgerStoreError::PlayerNotFound(
                    commit.player_address.as_str().to_string(),
                )),
            };
        };
        let entry = row_to_player(&entry_row)?;

        sqlx::query(
            r#"
            UPDATE game_transactions
            SET status = 'completed', tx_hash = $1, updated_at = $2
            WHERE correlation_id = $3
            "#,
        )
        .bind(&commit.tx_hash)
        .bind(commit.updated_at)
        .bind(&commit.correlation_id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(entry)
    }

    async fn record_payout(
        &self,
        credit: &PayoutCredit,
    ) -> Result<PlayerLedgerEntry, LedgerStoreError> {
        let amount = amount_to_db(credit.amount)?;
        let column = balance_column(credit.token_type);
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO game_transactions (
                id, player_address, amount, token_type, correlation_id,
                status, tx_hash, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, 'completed', NULL, $6, $6)
            ON CONFLICT (correlation_id) DO NOTHING
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(credit.player_address.as_str())
        .bind(amount)
        .bind(credit.token_type.as_str())
        .bind(&credit.correlation_id)
        .bind(credit.occurred_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        if inserted.rows_affected() == 0 {
            return Err(LedgerStoreError::DuplicateCorrelationId(
                credit.correlation_id.clone(),
            ));
        }

        let template = PlayerLedgerEntry::new_zeroed(credit.player_address.clone(), Utc::now());
        let (fresh_apt, fresh_emoji) = match credit.token_type {
            TokenType::Apt => (amount, 0_i64),
            TokenType::Emojicoin => (0_i64, amount),
        };
        // A first payout implies the wallet's first recorded win; existing
        // entries keep their counters (stats sync owns them).
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO player_stats (
                wallet_address, games_played, wins, losses, win_rate,
                apt_won, emoji_won, referrals, referral_code, referred_by,
                created_at, updated_at
            ) VALUES ($1, 1, 1, 0, 100, $2, $3, 0, $4, NULL, $5, $5)
            ON CONFLICT (wallet_address) DO UPDATE SET
                {column} = player_stats.{column} + $6,
                updated_at = EXCLUDED.updated_at
            RETURNING *
            "#,
        ))
        .bind(credit.player_address.as_str())
        .bind(fresh_apt)
        .bind(fresh_emoji)
        .bind(&template.referral_code)
        .bind(credit.occurred_at)
        .bind(amount)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;
        let entry = row_to_player(&row)?;

        tx.commit().await.map_err(db_err)?;
        Ok(entry)
    }
}
