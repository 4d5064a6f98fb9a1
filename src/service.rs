//! Service assembly and lifecycle
//!
//! Wires the ledger store, settlement gateway, payout queue, engine and
//! reconciliation watcher together from a `ServiceConfig`, runs the HTTP API
//! until a shutdown signal arrives, then stops the background tasks in
//! reverse order of their start.

use crate::api::{self, AppState, HeaderPrincipalResolver};
use crate::config::{GatewayConfig, ServiceConfig};
use crate::core::{AccountLedger, InMemoryCatalog, LedgerStore, PayoutQueue, PriceCatalog, WalletEngine};
use crate::io::write_accounts_csv;
use crate::settlement::{SettlementGateway, SimulatedGateway, XrplGateway};
use crate::watcher::ReconciliationWatcher;
use anyhow::Context;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Fully wired components of a running wallet
pub struct Components {
    pub engine: WalletEngine,
    pub watcher: Arc<ReconciliationWatcher>,
}

/// Build every component described by `config`
///
/// Must be called inside a Tokio runtime: watches on already bound
/// addresses are started immediately.
///
/// # Errors
///
/// Fails if the journal cannot be replayed or the catalog cannot be read.
pub fn assemble(config: &ServiceConfig) -> anyhow::Result<Components> {
    let store: Arc<dyn LedgerStore> = match &config.journal {
        Some(path) => {
            let ledger = AccountLedger::open(path, config.journal_sync)
                .with_context(|| format!("failed to open journal {}", path.display()))?;
            info!(journal = %path.display(), accounts = ledger.accounts().len(), "Ledger restored");
            Arc::new(ledger)
        }
        None => {
            warn!("No journal configured, ledger state will be lost on exit");
            Arc::new(AccountLedger::new())
        }
    };

    let catalog: Arc<dyn PriceCatalog> = match &config.catalog {
        Some(path) => {
            let catalog = InMemoryCatalog::from_json_file(path)?;
            info!(items = catalog.len(), "Price catalog loaded");
            Arc::new(catalog)
        }
        None => {
            warn!("No price catalog configured, every order will be rejected");
            Arc::new(InMemoryCatalog::new())
        }
    };

    let gateway: Arc<dyn SettlementGateway> = match &config.gateway {
        GatewayConfig::Xrpl(xrpl) => {
            info!(url = %xrpl.url, sender = %xrpl.sender, "Using XRPL settlement gateway");
            Arc::new(XrplGateway::new(xrpl.clone()))
        }
        GatewayConfig::Simulated { topup_url } => {
            warn!("Using SIMULATED settlement gateway, no funds move on any network");
            Arc::new(SimulatedGateway::new(topup_url.clone()))
        }
    };

    let payouts = Arc::new(PayoutQueue::new(
        config.payouts.max_attempts,
        config.payouts.recheck_after,
    ));
    let engine = WalletEngine::new(store, gateway, catalog, payouts, config.apy);

    let watcher = Arc::new(ReconciliationWatcher::new(engine.clone()));
    watcher.watch_all();

    Ok(Components { engine, watcher })
}

/// Run the wallet service until Ctrl+C or SIGTERM
pub async fn serve(config: ServiceConfig) -> anyhow::Result<()> {
    let Components { engine, watcher } = assemble(&config)?;

    let shutdown = CancellationToken::new();
    let payout_loop = tokio::spawn(Arc::clone(engine.payouts()).run(
        Arc::clone(engine.gateway()),
        config.payouts.retry_interval,
        shutdown.child_token(),
    ));

    let app = api::router(AppState {
        engine: engine.clone(),
        watcher: Arc::clone(&watcher),
        principals: Arc::new(HeaderPrincipalResolver),
        topup_secret: config.topup_webhook_secret.clone(),
    });
    if config.topup_webhook_secret.is_none() {
        warn!("No top-up webhook secret configured, provider confirmations are refused");
    }

    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;
    info!(listen = %config.listen, workers = config.workers, "Wallet service listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    info!("Shutting down...");
    shutdown.cancel();
    watcher.shutdown().await;
    let parked = watcher.parked_credits();
    if !parked.is_empty() {
        // Watches resume from the binding ledger, so the backfill redelivers them
        warn!(payments = parked.len(), "Inbound payments left uncredited at shutdown");
    }
    if let Err(e) = payout_loop.await {
        warn!(error = %e, "Payout loop ended abnormally");
    }
    engine.gateway().shutdown().await;

    let unfinished = engine
        .payouts()
        .tasks()
        .into_iter()
        .filter(|task| !task.status.is_final())
        .count();
    if unfinished > 0 {
        warn!(payouts = unfinished, "Unfinished payouts at shutdown");
    }
    info!("Wallet service stopped");
    Ok(())
}

/// Write a CSV snapshot of every account in `journal` to `output`
///
/// Reads the journal without taking it over, so it is safe against the
/// journal of a running service.
pub fn report(journal: &Path, output: &mut dyn Write) -> anyhow::Result<()> {
    let ledger = AccountLedger::snapshot(journal)
        .with_context(|| format!("failed to read journal {}", journal.display()))?;
    write_accounts_csv(&ledger.accounts(), output).map_err(anyhow::Error::msg)?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
