//! Wallet Ledger Engine CLI
//!
//! # Usage
//!
//! ```bash
//! # Run against the XRPL testnet
//! XRPL_SENDER_ADDRESS=r... XRPL_SENDER_SEED=s... \
//!     cargo run -- serve --journal wallet.jsonl --catalog prices.json
//!
//! # Local development without a network
//! cargo run -- serve --gateway simulated --journal wallet.jsonl
//!
//! # Dump every account of a journal as CSV
//! cargo run -- report --journal wallet.jsonl > accounts.csv
//! ```
//!
//! Log verbosity is controlled with `RUST_LOG` (default `info`).
//!
//! # Exit Codes
//!
//! - 0: Clean shutdown
//! - 1: Invalid configuration, unreadable journal, or a fatal runtime error

use anyhow::Context;
use std::process;
use tracing::error;
use tracing_subscriber::EnvFilter;
use wallet_ledger_engine::cli::{self, Command};
use wallet_ledger_engine::service;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let args = cli::parse_args();

    if let Err(e) = run(args.command) {
        error!("{:#}", e);
        process::exit(1);
    }
}

fn run(command: Command) -> anyhow::Result<()> {
    match command {
        Command::Serve(args) => {
            let config = args.to_service_config()?;
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(config.workers)
                .enable_all()
                .build()
                .context("failed to create tokio runtime")?;
            runtime.block_on(service::serve(config))
        }
        Command::Report(args) => {
            let mut output = std::io::stdout().lock();
            service::report(&args.journal, &mut output)
        }
    }
}
