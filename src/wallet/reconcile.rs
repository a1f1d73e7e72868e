//! Reserved Output Reconciliation
//!
//! After a crash, outputs can stay `reserved` although the transaction that
//! would have spent them was never broadcast, or was broadcast and confirmed
//! without us recording it. The reconciler asks a chain oracle about each
//! reserved output, one at a time, and corrects its status in its own
//! transaction.

use std::collections::VecDeque;

use async_trait::async_trait;
use bitcoin::{OutPoint, TxOut};

use super::{Wallet, WalletError};
use crate::common::logging::log_output_event;
use crate::types::{OutputStatus, Utxo};

/// Source of truth for whether an outpoint is still unspent
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainOracle: Send + Sync {
    /// The output at `outpoint`, or `None` if it has been spent
    async fn get_txout(&self, outpoint: &OutPoint) -> Result<Option<TxOut>, WalletError>;
}

/// Summary of a reconciliation pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    pub checked: u64,
    /// Unspent on chain, returned to `available`
    pub released: u64,
    /// Spent on chain, marked `spent`
    pub spent: u64,
    /// Status changed by someone else while queued
    pub unchanged: u64,
    pub oracle_errors: u64,
}

impl std::fmt::Display for ReconcileStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Reconciled {} outputs: {} released, {} spent, {} unchanged, {} oracle errors",
            self.checked, self.released, self.spent, self.unchanged, self.oracle_errors
        )
    }
}

/// Queue of reserved outputs awaiting an oracle answer
pub struct UtxoReconciler<'w, O> {
    wallet: &'w Wallet,
    oracle: O,
    queue: VecDeque<Utxo>,
}

impl<'w, O: ChainOracle> UtxoReconciler<'w, O> {
    pub fn new(wallet: &'w Wallet, oracle: O) -> Self {
        Self {
            wallet,
            oracle,
            queue: VecDeque::new(),
        }
    }

    /// Queue every currently reserved output
    pub fn load_reserved(&mut self) -> Result<usize, WalletError> {
        let reserved = self
            .wallet
            .transaction(|w| w.get_utxos(Some(OutputStatus::Reserved)))?;
        let count = reserved.len();
        self.queue.extend(reserved);
        tracing::debug!(target: "chanstore::wallet", count, "queued reserved outputs");
        Ok(count)
    }

    pub fn enqueue(&mut self, utxo: Utxo) {
        self.queue.push_back(utxo);
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Resolve the next queued output; `false` once the queue is empty
    pub async fn process_next(&mut self, stats: &mut ReconcileStats) -> Result<bool, WalletError> {
        let Some(utxo) = self.queue.pop_front() else {
            return Ok(false);
        };
        stats.checked += 1;

        let txout = match self.oracle.get_txout(&utxo.outpoint).await {
            Ok(txout) => txout,
            Err(e) => {
                tracing::warn!(
                    target: "chanstore::wallet",
                    outpoint = %utxo.outpoint,
                    error = %e,
                    "chain oracle failed, leaving output reserved"
                );
                stats.oracle_errors += 1;
                return Ok(true);
            }
        };

        let new = match txout {
            Some(_) => OutputStatus::Available,
            None => OutputStatus::Spent,
        };
        let changed = self.wallet.transaction(|w| {
            w.update_output_status(&utxo.outpoint, OutputStatus::Reserved, new)
        })?;

        if !changed {
            stats.unchanged += 1;
        } else {
            log_output_event(
                &utxo.outpoint.txid.to_string(),
                utxo.outpoint.vout,
                &OutputStatus::Reserved.to_string(),
                &new.to_string(),
            );
            match new {
                OutputStatus::Spent => stats.spent += 1,
                _ => stats.released += 1,
            }
        }
        Ok(true)
    }

    /// Drain the queue
    pub async fn run(&mut self) -> Result<ReconcileStats, WalletError> {
        let mut stats = ReconcileStats::default();
        while self.process_next(&mut stats).await? {}
        tracing::info!(target: "chanstore::wallet", "{}", stats);
        Ok(stats)
    }
}
