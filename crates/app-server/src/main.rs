use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use audit_store::{AuditRepository, InMemoryAuditRepository, PostgresAuditRepository};
use chain_client::{EscrowSigner, ReqwestAptosClient, TokenRegistry};
use escrow_monitor::{EscrowFundingMonitor, FundingThresholds};
use game_domain::TokenType;
use ledger_store::{InMemoryLedgerStore, PostgresLedgerStore, SettlementLedger};
use observability::init_tracing;
use payout_api::{ApiState, build_router};
use platform_core::{AppConfig, load_escrow_private_key};
use settlement::{AuditRepositorySink, SettlementConfig, SettlementService};
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load().context("load configuration")?;
    init_tracing(&config.app.service_name, &config.observability.log_filter);

    // Missing key material is fatal before any request is accepted.
    let private_key = load_escrow_private_key()?;
    let signer = EscrowSigner::from_hex(&config.escrow.escrow_address, &private_key)
        .context("parse escrow signing key")?;
    let chain = Arc::new(ReqwestAptosClient::new(
        config.chain.node_url.clone(),
        TokenRegistry::new(config.chain.emojicoin_type.clone()),
        signer,
        Duration::from_millis(config.chain.poll_interval_ms),
    ));

    let state = match std::env::var("DATABASE_URL") {
        Ok(url) => {
            let pool = sqlx::postgres::PgPoolOptions::new()
                .max_connections(8)
                .connect(&url)
                .await
                .context("connect postgres")?;
            let store = PostgresLedgerStore::new(pool.clone());
            store.ensure_schema().await.context("ensure ledger schema")?;
            let audit = PostgresAuditRepository::new(pool);
            audit.ensure_schema().await.context("ensure audit schema")?;
            info!("ledger backed by postgres");
            build_state(&config, chain, store, Arc::new(audit))?
        }
        Err(_) => {
            warn!("DATABASE_URL not set; using the in-memory ledger, state is lost on restart");
            build_state(
                &config,
                chain,
                InMemoryLedgerStore::new(),
                Arc::new(InMemoryAuditRepository::new()),
            )?
        }
    };

    if config.escrow.reconcile_batch_size > 0 {
        spawn_reconciler(
            state.settlement.clone(),
            config.escrow.reconcile_batch_size,
            Duration::from_millis(config.escrow.reconcile_interval_ms),
        );
    }

    let listener = tokio::net::TcpListener::bind(&config.app.http_bind_addr)
        .await
        .with_context(|| format!("bind {}", config.app.http_bind_addr))?;
    info!(
        addr = %config.app.http_bind_addr,
        env = config.app.env.as_str(),
        network = %config.chain.network,
        "payout api listening"
    );
    axum::serve(listener, build_router(state))
        .await
        .context("serve http")?;
    Ok(())
}

fn build_state<L>(
    config: &AppConfig,
    chain: Arc<ReqwestAptosClient>,
    store: L,
    audit: Arc<dyn AuditRepository>,
) -> Result<ApiState>
where
    L: SettlementLedger + Clone + 'static,
{
    let settlement = SettlementService::new(
        Arc::new(store.clone()),
        chain.clone(),
        SettlementConfig {
            explorer_base_url: config.chain.explorer_base_url.clone(),
            network: config.chain.network.clone(),
            confirmation_timeout: Duration::from_millis(config.chain.confirmation_timeout_ms),
        },
    )
    .with_audit_sink(Arc::new(AuditRepositorySink::new(audit)));

    let thresholds = FundingThresholds {
        min_apt: TokenType::Apt
            .to_base_units(config.escrow.min_apt_balance)
            .context("escrow.min_apt_balance")?,
        min_emojicoin: TokenType::Emojicoin
            .to_base_units(config.escrow.min_emojicoin_balance)
            .context("escrow.min_emojicoin_balance")?,
    };
    let monitor = EscrowFundingMonitor::new(
        chain,
        config.escrow.escrow_address.clone(),
        thresholds,
    );

    Ok(ApiState {
        settlement: Arc::new(settlement),
        monitor: Arc::new(monitor),
        players: Arc::new(store.clone()),
        transactions: Arc::new(store),
    })
}

fn spawn_reconciler(settlement: Arc<SettlementService>, batch_size: u32, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = settlement.reconcile_pending(batch_size).await {
                warn!(error = %err, "background reconciliation pass failed");
            }
        }
    });
}
