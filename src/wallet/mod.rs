//! Wallet Store
//!
//! Typed persistence for everything a channel node must recover after a
//! crash. Every method runs inside the transaction the caller opened on the
//! shared [`Db`]; none of them begins or commits on its own, except the
//! reservation rollback of a dropped [`CoinSelection`].
//!
//! ## Components
//!
//! - [`outputs`] - owned outputs and reservation-based coin selection
//! - [`reconcile`] - spend-status reconciliation of reserved outputs
//! - [`shachain`] - remote revocation secrets
//! - [`channels`] - peers, channel configs and channel records
//! - [`htlcs`] - incoming and outgoing HTLCs
//! - [`payments`] - outgoing payments and their staging list
//! - [`chain`] - blocks, the UTXO set and tracked transactions
//! - [`forwards`] - the forwarding ledger

pub mod chain;
pub mod channels;
pub mod forwards;
pub mod htlcs;
pub mod outputs;
pub mod payments;
pub mod reconcile;
pub mod shachain;

use std::cell::{Cell, RefCell};

use bitcoin::OutPoint;
use thiserror::Error;

use crate::common::config::{Network, StoreConfig};
use crate::common::logging::{log_broken, EventCategory};
use crate::db::{migrate, Db, DbError, MigrationContext};
use crate::types::WalletPayment;

pub use outputs::CoinSelection;
pub use reconcile::{ChainOracle, ReconcileStats, UtxoReconciler};

/// Derivation indices from here on are hardened and never handed out
pub const BIP32_MAX_INDEX: i64 = 1 << 31;

/// Wallet bookkeeping errors
#[derive(Debug, Error)]
pub enum WalletError {
    #[error("Store error: {0}")]
    Db(#[from] DbError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Failed to reserve output {0}")]
    ReservationFailed(OutPoint),

    #[error("Failed to mark output {0} spent")]
    SpendFailed(OutPoint),

    #[error("Failed to unreserve output {0}")]
    UnreserveFailed(OutPoint),

    #[error("Amount overflow: {0}")]
    Overflow(String),

    #[error("Missing referenced row: {0}")]
    MissingReference(String),

    #[error("Wallet is for network {stored}, configured for {expected}")]
    NetworkMismatch { stored: String, expected: String },

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Chain oracle error: {0}")]
    Oracle(String),
}

impl WalletError {
    /// Whether the node must abort on this error
    pub fn is_fatal(&self) -> bool {
        match self {
            WalletError::Db(e) => e.is_fatal(),
            WalletError::NotFound(_) | WalletError::InvalidData(_) | WalletError::Oracle(_) => {
                false
            }
            WalletError::ReservationFailed(_)
            | WalletError::SpendFailed(_)
            | WalletError::UnreserveFailed(_)
            | WalletError::Overflow(_)
            | WalletError::MissingReference(_)
            | WalletError::NetworkMismatch { .. } => true,
        }
    }
}

/// Wallet store over one database
pub struct Wallet {
    db: Db,
    /// Payments set up but not yet written; searched linearly by hash
    unstored_payments: RefCell<Vec<WalletPayment>>,
    max_channel_dbid: Cell<u64>,
}

impl Wallet {
    /// Wrap an already-migrated store
    pub fn new(db: Db) -> Self {
        Self {
            db,
            unstored_payments: RefCell::new(Vec::new()),
            max_channel_dbid: Cell::new(0),
        }
    }

    /// Open the configured store: migrate, check the network, then load
    /// the channel id high-water mark
    pub fn open(config: &StoreConfig) -> Result<Self, WalletError> {
        let db = Db::open(&config.db_path)?;
        Self::start(db, config.network, &config.migration_context())
    }

    /// Fresh in-memory wallet (for testing)
    pub fn in_memory(network: Network) -> Result<Self, WalletError> {
        Self::start(Db::in_memory()?, network, &MigrationContext::default())
    }

    fn start(db: Db, network: Network, ctx: &MigrationContext) -> Result<Self, WalletError> {
        let outcome = migrate(&db, ctx)?;
        tracing::info!(
            target: "chanstore::wallet",
            from = outcome.from,
            to = outcome.to,
            network = %network,
            "store opened"
        );

        let wallet = Self::new(db);
        wallet.transaction(|w| {
            w.network_check(network)?;
            w.load_max_channel_dbid()
        })?;
        Ok(wallet)
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    /// Run `f` in its own transaction on the wallet's store
    #[track_caller]
    pub fn transaction<T>(
        &self,
        f: impl FnOnce(&Wallet) -> Result<T, WalletError>,
    ) -> Result<T, WalletError> {
        self.db.transaction(|_| f(self))
    }

    /// Refuse to run against a store created for another chain
    ///
    /// A store without a recorded genesis hash adopts the configured one.
    pub fn network_check(&self, network: Network) -> Result<(), WalletError> {
        let expected = network.genesis_bytes();
        match self.db.get_blobvar("genesis_hash")? {
            Some(stored) if stored.as_slice() == expected.as_slice() => Ok(()),
            Some(stored) => {
                let stored = hex::encode(stored);
                let expected = hex::encode(expected);
                log_broken(
                    EventCategory::System,
                    "NETWORK_MISMATCH",
                    format!(
                        "Wallet blockchain hash {} does not match configured {} ({})",
                        stored, expected, network
                    ),
                );
                Err(WalletError::NetworkMismatch { stored, expected })
            }
            None => {
                self.db.set_blobvar("genesis_hash", &expected)?;
                Ok(())
            }
        }
    }

    /// Next unused derivation index, or `None` once the range is exhausted
    pub fn get_newindex(&self) -> Result<Option<u32>, WalletError> {
        let newidx = self.db.get_intvar("bip32_max_index", 0)? + 1;
        if newidx >= BIP32_MAX_INDEX {
            return Ok(None);
        }
        self.db.set_intvar("bip32_max_index", newidx)?;
        Ok(Some(newidx as u32))
    }
}

#[cfg(test)]
pub(crate) mod test_utils {
    use bitcoin::hashes::Hash;
    use bitcoin::{Amount, Txid};
    use secp256k1::{PublicKey, Secp256k1, SecretKey};

    use super::*;
    use crate::types::{Basepoints, Channel, ChannelConfig, ChannelInfo, Peer, Side};

    pub fn wallet() -> Wallet {
        Wallet::in_memory(Network::Regtest).unwrap()
    }

    pub fn pubkey(n: u8) -> PublicKey {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[n.max(1); 32]).unwrap();
        PublicKey::from_secret_key(&secp, &sk)
    }

    pub fn txid(n: u8) -> Txid {
        Txid::from_byte_array([n; 32])
    }

    pub fn channel_info() -> ChannelInfo {
        ChannelInfo {
            their_config: ChannelConfig::default(),
            remote_fundingkey: pubkey(10),
            theirbase: Basepoints {
                revocation: pubkey(11),
                payment: pubkey(12),
                htlc: pubkey(13),
                delayed_payment: pubkey(14),
            },
            remote_per_commit: pubkey(15),
            old_remote_per_commit: pubkey(16),
            feerate_per_kw: [253, 253],
        }
    }

    /// Insert a fresh channel with the peer `pubkey(n)`; needs an open transaction
    pub fn new_channel(w: &Wallet, n: u8) -> Channel {
        let peer = Peer::new(pubkey(n), Some("127.0.0.1:9735".to_string()));
        let mut chan = Channel::new(
            peer,
            channel_info(),
            txid(n),
            0,
            Amount::from_sat(1_000_000),
            Side::Local,
        );
        w.channel_insert(&mut chan).unwrap();
        chan
    }
}
