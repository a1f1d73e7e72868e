//! chanstore - Channel Node Persistence Engine
//!
//! Durable storage for a payment-channel node: wallet outputs, per-channel
//! revocation secrets, HTLCs and forwarding accounting, all behind explicit
//! single-writer SQLite transactions.
//!
//! ## Layers
//!
//! 1. **Statement layer** - typed binding and column decoding ([`db::statement`])
//! 2. **Transaction manager** - begin/commit discipline and the changelog hook ([`db::Db`])
//! 3. **Migration engine** - append-only schema history ([`db::migrations`])
//! 4. **Wallet** - coins, shachains, channels, HTLCs, payments, chain tracking
//!    and the forwarding ledger ([`wallet::Wallet`])
//!
//! Violations of the transaction discipline are programming errors and panic;
//! everything else is returned as an error classified by `is_fatal()`.

/// Log a broken invariant, then abort the current thread
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {{
        let msg = format!($($arg)*);
        tracing::error!(target: "chanstore", "FATAL: {}", msg);
        panic!("{}", msg)
    }};
}

pub mod common;
pub mod db;
pub mod shachain;
pub mod types;
pub mod wallet;

// Re-exports: configuration, logging, errors
pub use common::{init_logging, LogLevel, Network, StoreConfig, StoreError};

// Re-exports: store handle
pub use db::{migrate, Db, DbError, MigrationContext, MigrationOutcome};

// Re-exports: shachain
pub use shachain::{Shachain, ShachainError, SHACHAIN_MAX_INDEX};

// Re-exports: wallet
pub use wallet::{
    ChainOracle, CoinSelection, ReconcileStats, UtxoReconciler, Wallet, WalletError,
};
