//! chanstore-db - Channel Store Inspector
//!
//! Opens the node's store, bringing its schema up to date and checking it
//! belongs to the configured network, then prints what it holds.
//!
//! Run modes:
//!   chanstore-db             - Store summary
//!   chanstore-db forwards    - Forwarding ledger
//!   chanstore-db payments    - Outgoing payments

use std::env;
use std::process::ExitCode;

use bitcoin::Amount;
use chanstore::common::logging::init_from_config;
use chanstore::types::{sats_to_display, OutputStatus};
use chanstore::{StoreConfig, StoreError, Wallet};

fn main() -> ExitCode {
    dotenv::dotenv().ok();
    let args: Vec<String> = env::args().collect();

    let result = match args.get(1).map(String::as_str) {
        None | Some("status") => run(print_status),
        Some("forwards") => run(print_forwards),
        Some("payments") => run(print_payments),
        Some("help" | "--help" | "-h") => {
            print_usage();
            Ok(())
        }
        Some(other) => {
            eprintln!("Unknown command: {}", other);
            print_usage();
            return ExitCode::FAILURE;
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error [{}]: {}", e.error_code(), e);
            ExitCode::FAILURE
        }
    }
}

fn print_usage() {
    println!("chanstore-db - Channel Store Inspector");
    println!();
    println!("Usage:");
    println!("  chanstore-db [status]     Store summary (default)");
    println!("  chanstore-db forwards     List the forwarding ledger");
    println!("  chanstore-db payments     List outgoing payments");
    println!();
    println!("Environment Variables:");
    println!("  CHANSTORE_DB_PATH     Database file (default: ~/.chanstore/<network>/lightningd.sqlite3)");
    println!("  CHANSTORE_NETWORK     mainnet | testnet | signet | regtest (default: regtest)");
    println!("  CHANSTORE_FEE_BASE    Base fee for upgraded channels, msat (default: 1000)");
    println!("  CHANSTORE_FEE_PPM     Proportional fee for upgraded channels (default: 10)");
    println!("  CHANSTORE_LOG_LEVEL   trace | debug | info | warn | error (default: info)");
    println!("  CHANSTORE_LOG_JSON    Emit JSON logs (default: false)");
}

/// Load configuration, open the store and hand it to `report`
fn run(report: fn(&Wallet) -> Result<(), StoreError>) -> Result<(), StoreError> {
    let config = StoreConfig::from_env()?;
    init_from_config(&config)?;

    tracing::info!(
        target: "chanstore",
        network = %config.network,
        path = %config.db_path.display(),
        "opening store"
    );
    let wallet = Wallet::open(&config)?;

    println!("=== Channel Store ===");
    println!();
    println!("Network:  {}", config.network);
    println!("Database: {}", config.db_path.display());
    println!();
    report(&wallet)
}

fn print_status(wallet: &Wallet) -> Result<(), StoreError> {
    wallet.transaction(|w| {
        let channels = w.channels_load()?;
        let (min_height, max_height) = w.blocks_heights(0)?;

        println!("Chain:");
        if max_height == 0 {
            println!("  No blocks processed");
        } else {
            println!("  Blocks: {} - {}", min_height, max_height);
        }
        println!();

        println!("Outputs:");
        for status in [OutputStatus::Available, OutputStatus::Reserved, OutputStatus::Spent] {
            let utxos = w.get_utxos(Some(status))?;
            let total = utxos.iter().fold(Amount::ZERO, |acc, u| acc + u.amount);
            println!("  {:<10} {:>4}  {}", status.to_string(), utxos.len(), sats_to_display(total));
        }
        println!();

        println!("Channels: {} active", channels.len());
        for chan in &channels {
            println!(
                "  #{:<4} {}  {}  {}",
                chan.dbid,
                chan.state,
                chan.peer.node_id,
                sats_to_display(chan.funding)
            );
        }
        println!();

        println!("{}", w.forwarding_stats()?);
        Ok(())
    })?;
    Ok(())
}

fn print_forwards(wallet: &Wallet) -> Result<(), StoreError> {
    let forwards = wallet.transaction(|w| w.forwarded_payments_list())?;
    println!("Forwards: {}", forwards.len());
    for f in &forwards {
        let out = f
            .channel_out
            .map(|scid| scid.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {} -> {}  in {}  out {}  fee {}  {}",
            f.channel_in, out, f.msat_in, f.msat_out, f.fee, f.status
        );
    }
    Ok(())
}

fn print_payments(wallet: &Wallet) -> Result<(), StoreError> {
    let payments = wallet.transaction(|w| w.payments_list(None))?;
    println!("Payments: {}", payments.len());
    for p in &payments {
        println!(
            "  {}  {}  {}  to {}",
            p.payment_hash, p.status, p.msatoshi, p.destination
        );
    }
    Ok(())
}
