use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use async_trait::async_trait;
use chrono::Utc;
use game_domain::WalletAddress;
use uuid::Uuid;

use crate::{
    LedgerStoreError, PageRequest, PayoutCredit, PlayerLedgerEntry, PlayerStatsRepository,
    SettlementUnitOfWork, StatDeltas, TransactionLogRepository, TransactionRecord,
    TransactionRecordInsert, TransactionStatus, TransactionStatusUpdate, WithdrawalCommit,
    validate_transition,
};

/// In-memory ledger backed by two maps. Lock order is players before
/// transactions everywhere, so the unit-of-work operations can hold both.
#[derive(Debug, Default, Clone)]
pub struct InMemoryLedgerStore {
    players: Arc<Mutex<HashMap<String, PlayerLedgerEntry>>>,
    transactions: Arc<Mutex<HashMap<String, TransactionRecord>>>,
}

impl InMemoryLedgerStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn players_snapshot(&self) -> Vec<PlayerLedgerEntry> {
        self.players
            .lock()
            .map(|guard| guard.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn transactions_snapshot(&self) -> Vec<TransactionRecord> {
        self.transactions
            .lock()
            .map(|guard| guard.values().cloned().collect())
            .unwrap_or_default()
    }

    fn lock_players(
        &self,
    ) -> Result<MutexGuard<'_, HashMap<String, PlayerLedgerEntry>>, LedgerStoreError> {
        self.players.lock().map_err(|_| LedgerStoreError::LockPoisoned)
    }

    fn lock_transactions(
        &self,
    ) -> Result<MutexGuard<'_, HashMap<String, TransactionRecord>>, LedgerStoreError> {
        self.transactions
            .lock()
            .map_err(|_| LedgerStoreError::LockPoisoned)
    }
}

fn ensure_entry<'a>(
    players: &'a mut HashMap<String, PlayerLedgerEntry>,
    address: &WalletAddress,
) -> &'a mut PlayerLedgerEntry {
    players
        .entry(address.as_str().to_string())
        .or_insert_with(|| PlayerLedgerEntry::new_zeroed(address.clone(), Utc::now()))
}

#[async_trait]
impl PlayerStatsRepository for InMemoryLedgerStore {
    async fn get_player(
        &self,
        address: &WalletAddress,
    ) -> Result<Option<PlayerLedgerEntry>, LedgerStoreError> {
        Ok(self.lock_players()?.get(address.as_str()).cloned())
    }

    async fn ensure_player(
        &self,
        address: &WalletAddress,
    ) -> Result<PlayerLedgerEntry, LedgerStoreError> {
        let mut players = self.lock_players()?;
        Ok(ensure_entry(&mut players, address).clone())
    }

    async fn apply_stat_deltas(
        &self,
        address: &WalletAddress,
        deltas: &StatDeltas,
    ) -> Result<PlayerLedgerEntry, LedgerStoreError> {
        let mut players = self.lock_players()?;
        let entry = ensure_entry(&mut players, address);
        entry.games_played += u64::from(deltas.games);
        entry.wins += u64::from(deltas.wins);
        entry.losses += u64::from(deltas.losses);
        entry.recompute_win_rate();
        entry.updated_at = Utc::now();
        Ok(entry.clone())
    }

    async fn accept_referral(
        &self,
        new_player: &WalletAddress,
        code: &str,
    ) -> Result<(), LedgerStoreError> {
        let mut players = self.lock_players()?;
        let referrer_key = players
            .values()
            .find(|entry| entry.referral_code == code)
            .map(|entry| entry.wallet_address.as_str().to_string())
            .ok_or(LedgerStoreError::ReferralCodeNotFound)?;
        if referrer_key == new_player.as_str() {
            return Err(LedgerStoreError::SelfReferral);
        }

        let entry = ensure_entry(&mut players, new_player);
        if entry.referred_by.is_some() {
            return Err(LedgerStoreError::ReferralAlreadyAccepted);
        }
        let referrer_address = WalletAddress::new(&referrer_key)
            .map_err(|e| LedgerStoreError::Database(e.to_string()))?;
        entry.referred_by = Some(referrer_address);
        entry.updated_at = Utc::now();

        let referrer = players
            .get_mut(&referrer_key)
            .ok_or(LedgerStoreError::ReferralCodeNotFound)?;
        referrer.referrals += 1;
        referrer.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl TransactionLogRepository for InMemoryLedgerStore {
    async fn insert_transaction(
        &self,
        insert: &TransactionRecordInsert,
    ) -> Result<TransactionRecord, LedgerStoreError> {
        let mut transactions = self.lock_transactions()?;
        if transactions.contains_key(&insert.correlation_id) {
            return Err(LedgerStoreError::DuplicateCorrelationId(
                insert.correlation_id.clone(),
            ));
        }
        let record = TransactionRecord {
            id: Uuid::now_v7(),
            player_address: insert.player_address.clone(),
            amount: insert.amount,
            token_type: insert.token_type,
            correlation_id: insert.correlation_id.clone(),
            status: insert.status,
            tx_hash: insert.tx_hash.clone(),
            created_at: insert.created_at,
            updated_at: insert.created_at,
        };
        transactions.insert(insert.correlation_id.clone(), record.clone());
        Ok(record)
    }

    async fn update_transaction_status(
        &self,
        correlation_id: &str,
        update: &TransactionStatusUpdate,
    ) -> Result<TransactionRecord, LedgerStoreError> {
        let mut transactions = self.lock_transactions()?;
        let record = transactions
            .get_mut(correlation_id)
            .ok_or_else(|| LedgerStoreError::TransactionNotFound(correlation_id.to_string()))?;
        validate_transition(record.status, update.status)?;
        record.status = update.status;
        if let Some(tx_hash) = update.tx_hash.clone() {
            record.tx_hash = Some(tx_hash);
        }
        record.updated_at = update.updated_at;
        Ok(record.clone())
    }

    async fn get_transaction(
        &self,
        correlation_id: &str,
    ) -> Result<Option<TransactionRecord>, LedgerStoreError> {
        Ok(self.lock_transactions()?.get(correlation_id).cloned())
    }

    async fn list_player_transactions(
        &self,
        address: &WalletAddress,
        page: PageRequest,
    ) -> Result<Vec<TransactionRecord>, LedgerStoreError> {
        let transactions = self.lock_transactions()?;
        let mut records: Vec<TransactionRecord> = transactions
            .values()
            .filter(|record| record.player_address == *address)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records
            .into_iter()
            .skip(page.offset as usize)
            .take(page.limit as usize)
            .collect())
    }

    async fn list_transactions_by_status(
        &self,
        status: TransactionStatus,
        limit: u32,
    ) -> Result<Vec<TransactionRecord>, LedgerStoreError> {
        let transactions = self.lock_transactions()?;
        let mut records: Vec<TransactionRecord> = transactions
            .values()
            .filter(|record| record.status == status)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        records.truncate(limit as usize);
        Ok(records)
    }
}

#[async_trait]
impl SettlementUnitOfWork for InMemoryLedgerStore {
    async fn commit_withdrawal(
        &self,
        commit: &WithdrawalCommit,
    ) -> Result<PlayerLedgerEntry, LedgerStoreError> {
        let mut players = self.lock_players()?;
        let mut transactions = self.lock_transactions()?;

        let record = transactions
            .get_mut(&commit.correlation_id)
            .ok_or_else(|| LedgerStoreError::TransactionNotFound(commit.correlation_id.clone()))?;
        validate_transition(record.status, TransactionStatus::Completed)?;
        if record.status == TransactionStatus::Completed {
            // Replayed commit: the debit already landed with the first call.
            return players
                .get(commit.player_address.as_str())
                .cloned()
                .ok_or_else(|| {
                    LedgerStoreError::PlayerNotFound(commit.player_address.as_str().to_string())
                });
        }

        let entry = players
            .get_mut(commit.player_address.as_str())
            .ok_or_else(|| {
                LedgerStoreError::PlayerNotFound(commit.player_address.as_str().to_string())
            })?;
        let available = entry.balance(commit.token_type);
        if available < commit.amount {
            return Err(LedgerStoreError::InsufficientBalance {
                available,
                requested: commit.amount,
            });
        }

        // Both rows are still under our locks, so this pair cannot be torn.
        *entry.balance_mut(commit.token_type) = available.checked_sub(commit.amount)?;
        entry.updated_at = commit.updated_at;
        record.status = TransactionStatus::Completed;
        record.tx_hash = Some(commit.tx_hash.clone());
        record.updated_at = commit.updated_at;
        Ok(entry.clone())
    }

    async fn record_payout(
        &self,
        credit: &PayoutCredit,
    ) -> Result<PlayerLedgerEntry, LedgerStoreError> {
        let mut players = self.lock_players()?;
        let mut transactions = self.lock_transactions()?;

        if transactions.contains_key(&credit.correlation_id) {
            return Err(LedgerStoreError::DuplicateCorrelationId(
                credit.correlation_id.clone(),
            ));
        }

        let entry = players
            .entry(credit.player_address.as_str().to_string())
            .or_insert_with(|| {
                // A first payout implies the wallet's first recorded win;
                // existing entries keep their counters (stats sync owns them).
                let mut fresh =
                    PlayerLedgerEntry::new_zeroed(credit.player_address.clone(), credit.occurred_at);
                fresh.games_played = 1;
                fresh.wins = 1;
                fresh.recompute_win_rate();
                fresh
            });
        let balance = entry.balance(credit.token_type);
        *entry.balance_mut(credit.token_type) = balance.checked_add(credit.amount)?;
        entry.updated_at = credit.occurred_at;
        let updated = entry.clone();

        transactions.insert(
            credit.correlation_id.clone(),
            TransactionRecord {
                id: Uuid::now_v7(),
                player_address: credit.player_address.clone(),
                amount: credit.amount,
                token_type: credit.token_type,
                correlation_id: credit.correlation_id.clone(),
                status: TransactionStatus::Completed,
                tx_hash: None,
                created_at: credit.occurred_at,
                updated_at: credit.occurred_at,
            },
        );
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use game_domain::{TokenAmount, TokenType};

    fn address(tag: &str) -> WalletAddress {
        WalletAddress::new(&format!("0x{tag}")).expect("address")
    }

    async fn payout(store: &InMemoryLedgerStore, addr: &WalletAddress, amount: u64, game_id: &str) {
        store
            .record_payout(&PayoutCredit {
                correlation_id: game_id.to_string(),
                player_address: addr.clone(),
                token_type: TokenType::Apt,
                amount: TokenAmount(amount),
                occurred_at: Utc::now(),
            })
            .await
            .expect("payout");
    }

    #[tokio::test]
    async fn ensure_player_is_lazy_and_idempotent() {
        let store = InMemoryLedgerStore::new();
        let addr = address("aa11");
        assert!(store.get_player(&addr).await.expect("get").is_none());

        let created = store.ensure_player(&addr).await.expect("create");
        assert_eq!(created.games_played, 0);
        assert_eq!(created.apt_won, TokenAmount::ZERO);
        assert!(created.referral_code.starts_with("ref-"));

        let again = store.ensure_player(&addr).await.expect("reuse");
        assert_eq!(again.referral_code, created.referral_code);
    }

    #[tokio::test]
    async fn lookups_are_case_insensitive_via_normalized_addresses() {
        let store = InMemoryLedgerStore::new();
        let upper = WalletAddress::new("0xABCD12").expect("upper");
        let lower = WalletAddress::new("0xabcd12").expect("lower");
        store.ensure_player(&upper).await.expect("create");
        assert!(store.get_player(&lower).await.expect("get").is_some());
    }

    #[tokio::test]
    async fn stat_deltas_accumulate_and_recompute_win_rate() {
        let store = InMemoryLedgerStore::new();
        let addr = address("bb22");
        store
            .apply_stat_deltas(
                &addr,
                &StatDeltas {
                    games: 2,
                    wins: 1,
                    losses: 1,
                },
            )
            .await
            .expect("first");
        let entry = store
            .apply_stat_deltas(
                &addr,
                &StatDeltas {
                    games: 1,
                    wins: 1,
                    losses: 0,
                },
            )
            .await
            .expect("second");
        assert_eq!(entry.games_played, 3);
        assert_eq!(entry.wins, 2);
        assert_eq!(entry.losses, 1);
        assert_eq!(entry.win_rate, 67);
    }

    #[tokio::test]
    async fn duplicate_correlation_id_is_rejected() {
        let store = InMemoryLedgerStore::new();
        let insert = TransactionRecordInsert {
            player_address: address("cc33"),
            amount: TokenAmount(10),
            token_type: TokenType::Apt,
            correlation_id: "withdrawal_1_abc".to_string(),
            status: TransactionStatus::Processing,
            tx_hash: None,
            created_at: Utc::now(),
        };
        store.insert_transaction(&insert).await.expect("first");
        let err = store
            .insert_transaction(&insert)
            .await
            .expect_err("duplicate");
        assert!(matches!(err, LedgerStoreError::DuplicateCorrelationId(_)));
    }

    #[tokio::test]
    async fn status_update_is_idempotent_but_terminal_states_are_sticky() {
        let store = InMemoryLedgerStore::new();
        store
            .insert_transaction(&TransactionRecordInsert {
                player_address: address("dd44"),
                amount: TokenAmount(10),
                token_type: TokenType::Apt,
                correlation_id: "w1".to_string(),
                status: TransactionStatus::Processing,
                tx_hash: None,
                created_at: Utc::now(),
            })
            .await
            .expect("insert");

        let failed = store
            .update_transaction_status(
                "w1",
                &TransactionStatusUpdate {
                    status: TransactionStatus::Failed,
                    tx_hash: Some("0xdead".to_string()),
                    updated_at: Utc::now(),
                },
            )
            .await
            .expect("fail");
        assert_eq!(failed.status, TransactionStatus::Failed);
        assert_eq!(failed.tx_hash.as_deref(), Some("0xdead"));

        // Retrying the same terminal write is a no-op success.
        store
            .update_transaction_status(
                "w1",
                &TransactionStatusUpdate {
                    status: TransactionStatus::Failed,
                    tx_hash: None,
                    updated_at: Utc::now(),
                },
            )
            .await
            .expect("idempotent retry");

        let err = store
            .update_transaction_status(
                "w1",
                &TransactionStatusUpdate {
                    status: TransactionStatus::Completed,
                    tx_hash: None,
                    updated_at: Utc::now(),
                },
            )
            .await
            .expect_err("terminal flip");
        assert!(matches!(
            err,
            LedgerStoreError::InvalidStatusTransition { .. }
        ));
    }

    #[tokio::test]
    async fn commit_withdrawal_debits_and_completes_atomically() {
        let store = InMemoryLedgerStore::new();
        let addr = address("ee55");
        payout(&store, &addr, 250_000_000, "game-1").await;
        store
            .insert_transaction(&TransactionRecordInsert {
                player_address: addr.clone(),
                amount: TokenAmount(100_000_000),
                token_type: TokenType::Apt,
                correlation_id: "w-commit".to_string(),
                status: TransactionStatus::Processing,
                tx_hash: None,
                created_at: Utc::now(),
            })
            .await
            .expect("insert");

        let entry = store
            .commit_withdrawal(&WithdrawalCommit {
                correlation_id: "w-commit".to_string(),
                player_address: addr.clone(),
                token_type: TokenType::Apt,
                amount: TokenAmount(100_000_000),
                tx_hash: "0xhash".to_string(),
                updated_at: Utc::now(),
            })
            .await
            .expect("commit");

        assert_eq!(entry.apt_won, TokenAmount(150_000_000));
        let record = store
            .get_transaction("w-commit")
            .await
            .expect("get")
            .expect("record");
        assert_eq!(record.status, TransactionStatus::Completed);
        assert_eq!(record.tx_hash.as_deref(), Some("0xhash"));
    }

    #[tokio::test]
    async fn replayed_commit_with_same_correlation_id_debits_once() {
        let store = InMemoryLedgerStore::new();
        let addr = address("ee56");
        payout(&store, &addr, 200, "game-replay").await;
        store
            .insert_transaction(&TransactionRecordInsert {
                player_address: addr.clone(),
                amount: TokenAmount(80),
                token_type: TokenType::Apt,
                correlation_id: "w-replay".to_string(),
                status: TransactionStatus::Processing,
                tx_hash: None,
                created_at: Utc::now(),
            })
            .await
            .expect("insert");

        let commit = WithdrawalCommit {
            correlation_id: "w-replay".to_string(),
            player_address: addr.clone(),
            token_type: TokenType::Apt,
            amount: TokenAmount(80),
            tx_hash: "0xhash".to_string(),
            updated_at: Utc::now(),
        };
        store.commit_withdrawal(&commit).await.expect("first");
        store.commit_withdrawal(&commit).await.expect("retry");

        let entry = store.get_player(&addr).await.expect("get").expect("entry");
        assert_eq!(entry.apt_won, TokenAmount(120));
    }

    #[tokio::test]
    async fn commit_withdrawal_guard_leaves_both_rows_untouched() {
        let store = InMemoryLedgerStore::new();
        let addr = address("ff66");
        payout(&store, &addr, 50, "game-2").await;
        store
            .insert_transaction(&TransactionRecordInsert {
                player_address: addr.clone(),
                amount: TokenAmount(80),
                token_type: TokenType::Apt,
                correlation_id: "w-guard".to_string(),
                status: TransactionStatus::Processing,
                tx_hash: None,
                created_at: Utc::now(),
            })
            .await
            .expect("insert");

        let err = store
            .commit_withdrawal(&WithdrawalCommit {
                correlation_id: "w-guard".to_string(),
                player_address: addr.clone(),
                token_type: TokenType::Apt,
                amount: TokenAmount(80),
                tx_hash: "0xhash".to_string(),
                updated_at: Utc::now(),
            })
            .await
            .expect_err("guard");
        assert!(matches!(
            err,
            LedgerStoreError::InsufficientBalance { .. }
        ));

        let entry = store.get_player(&addr).await.expect("get").expect("entry");
        assert_eq!(entry.apt_won, TokenAmount(50));
        let record = store
            .get_transaction("w-guard")
            .await
            .expect("get")
            .expect("record");
        assert_eq!(record.status, TransactionStatus::Processing);
        assert!(record.tx_hash.is_none());
    }

    #[tokio::test]
    async fn first_payout_creates_the_entry_as_a_won_game() {
        let store = InMemoryLedgerStore::new();
        let addr = address("aa76");
        payout(&store, &addr, 100, "game-first").await;

        let entry = store.get_player(&addr).await.expect("get").expect("entry");
        assert_eq!(entry.games_played, 1);
        assert_eq!(entry.wins, 1);
        assert_eq!(entry.win_rate, 100);
        assert_eq!(entry.apt_won, TokenAmount(100));

        // A later payout only credits the balance; the counters belong to
        // the stats sync.
        payout(&store, &addr, 40, "game-second").await;
        let entry = store.get_player(&addr).await.expect("get").expect("entry");
        assert_eq!(entry.games_played, 1);
        assert_eq!(entry.wins, 1);
        assert_eq!(entry.apt_won, TokenAmount(140));
    }

    #[tokio::test]
    async fn record_payout_rejects_duplicate_game_id_without_double_credit() {
        let store = InMemoryLedgerStore::new();
        let addr = address("aa77");
        let credit = PayoutCredit {
            correlation_id: "game-dup".to_string(),
            player_address: addr.clone(),
            token_type: TokenType::Emojicoin,
            amount: TokenAmount(500),
            occurred_at: Utc::now(),
        };
        store.record_payout(&credit).await.expect("first");
        let err = store.record_payout(&credit).await.expect_err("duplicate");
        assert!(matches!(err, LedgerStoreError::DuplicateCorrelationId(_)));

        let entry = store.get_player(&addr).await.expect("get").expect("entry");
        assert_eq!(entry.emoji_won, TokenAmount(500));
        assert_eq!(store.transactions_snapshot().len(), 1);
    }

    #[tokio::test]
    async fn referral_rules_enforce_unique_code_and_single_acceptance() {
        let store = InMemoryLedgerStore::new();
        let referrer = address("ab01");
        let newcomer = address("ab02");
        let code = store
            .ensure_player(&referrer)
            .await
            .expect("referrer")
            .referral_code;

        assert!(matches!(
            store.accept_referral(&newcomer, "ref-unknown").await,
            Err(LedgerStoreError::ReferralCodeNotFound)
        ));
        assert!(matches!(
            store.accept_referral(&referrer, &code).await,
            Err(LedgerStoreError::SelfReferral)
        ));

        store
            .accept_referral(&newcomer, &code)
            .await
            .expect("accept");
        assert!(matches!(
            store.accept_referral(&newcomer, &code).await,
            Err(LedgerStoreError::ReferralAlreadyAccepted)
        ));

        let entry = store
            .get_player(&referrer)
            .await
            .expect("get")
            .expect("entry");
        assert_eq!(entry.referrals, 1);
        let newcomer_entry = store
            .get_player(&newcomer)
            .await
            .expect("get")
            .expect("entry");
        assert_eq!(newcomer_entry.referred_by, Some(referrer));
    }

    #[tokio::test]
    async fn player_transaction_listing_is_newest_first_and_paged() {
        let store = InMemoryLedgerStore::new();
        let addr = address("ac01");
        for i in 0..3 {
            store
                .insert_transaction(&TransactionRecordInsert {
                    player_address: addr.clone(),
                    amount: TokenAmount(i + 1),
                    token_type: TokenType::Apt,
                    correlation_id: format!("w-{i}"),
                    status: TransactionStatus::Processing,
                    tx_hash: None,
                    created_at: Utc::now() + chrono::Duration::milliseconds(i as i64),
                })
                .await
                .expect("insert");
        }

        let page = store
            .list_player_transactions(
                &addr,
                PageRequest {
                    limit: 2,
                    offset: 0,
                },
            )
            .await
            .expect("list");
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].correlation_id, "w-2");
        assert_eq!(page[1].correlation_id, "w-1");
    }
}
