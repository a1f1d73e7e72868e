//! Chain Tracking
//!
//! Processed blocks, the UTXO set of outputs that may fund channels we see
//! announced, and the transactions we watch. Spent `utxoset` rows are kept
//! for [`UTXO_PRUNE_DEPTH`] blocks so a short reorg can still find them.

use bitcoin::{Amount, OutPoint, Script, Transaction, Txid};

use super::{Wallet, WalletError};
use crate::db::{Query, Row};
use crate::types::{
    Block, ChannelTx, FilteredBlock, ScidOutpoint, ShortChannelId, TxLocator, TxType, WalletTransaction,
    ONCHAIN_INIT, UTXO_PRUNE_DEPTH,
};

static BLOCK_INSERT: Query = Query::write(
    "blocks_insert",
    "INSERT INTO blocks (height, hash, prev_hash) VALUES (?, ?, ?)",
);
static BLOCK_INSERT_OR_IGNORE: Query = Query::write(
    "blocks_insert_or_ignore",
    "INSERT OR IGNORE INTO blocks (height, hash, prev_hash) VALUES (?, ?, ?)",
);
static BLOCK_DELETE: Query = Query::write("blocks_delete", "DELETE FROM blocks WHERE hash = ?");
static BLOCKS_FROM_HEIGHT: Query = Query::read(
    "blocks_from_height",
    "SELECT height FROM blocks WHERE height >= ?",
);
static BLOCKS_ROLLBACK: Query = Query::write(
    "blocks_rollback",
    "DELETE FROM blocks WHERE height > ?",
);
static BLOCKS_HEIGHTS: Query = Query::read(
    "blocks_heights",
    "SELECT MIN(height), MAX(height) FROM blocks",
);
static BLOCK_AT_HEIGHT: Query = Query::read(
    "blocks_at_height",
    "SELECT height FROM blocks WHERE height = ?",
);

static UTXOSET_PRUNE: Query = Query::write(
    "utxoset_prune",
    "DELETE FROM utxoset WHERE spendheight < ?",
);
static UTXOSET_INSERT: Query = Query::write(
    "utxoset_insert",
    "INSERT INTO utxoset (txid, outnum, blockheight, spendheight, txindex, scriptpubkey, satoshis) \
     VALUES (?, ?, ?, NULL, ?, ?, ?)",
);
static OUTPUT_SPEND_HEIGHT: Query = Query::write(
    "outputs_set_spend_height",
    "UPDATE outputs SET spend_height = ? WHERE prev_out_tx = ? AND prev_out_index = ?",
);
static UTXOSET_SPEND: Query = Query::write(
    "utxoset_spend",
    "UPDATE utxoset SET spendheight = ? WHERE txid = ? AND outnum = ?",
);
static UTXOSET_LOCATE: Query = Query::read(
    "utxoset_locate",
    "SELECT blockheight, txindex FROM utxoset WHERE txid = ? AND outnum = ?",
);
static UTXOSET_BY_SCID: Query = Query::read(
    "utxoset_by_scid",
    "SELECT txid, scriptpubkey, satoshis FROM utxoset \
     WHERE blockheight = ? AND txindex = ? AND outnum = ? AND spendheight IS NULL",
);

static TRANSACTION_HEIGHT: Query = Query::read(
    "transactions_height",
    "SELECT blockheight FROM transactions WHERE id = ?",
);
static TRANSACTION_INSERT: Query = Query::write(
    "transactions_insert",
    "INSERT INTO transactions (id, blockheight, txindex, rawtx) VALUES (?, ?, ?, ?)",
);
static TRANSACTION_CONFIRM: Query = Query::write(
    "transactions_confirm",
    "UPDATE transactions SET blockheight = ?, txindex = ? WHERE id = ?",
);
static TRANSACTION_ANNOTATION: Query = Query::read(
    "transactions_annotation",
    "SELECT type, channel_id FROM transactions WHERE id = ?",
);
static TRANSACTION_ANNOTATE: Query = Query::write(
    "transactions_annotate",
    "UPDATE transactions SET type = ?, channel_id = ? WHERE id = ?",
);
static TRANSACTION_LOCATE: Query = Query::read(
    "transactions_locate",
    "SELECT blockheight, txindex FROM transactions WHERE id = ?",
);
static TRANSACTION_GET: Query = Query::read(
    "transactions_get",
    "SELECT id, blockheight, txindex, rawtx, type, channel_id FROM transactions WHERE id = ?",
);
static TRANSACTIONS_BY_HEIGHT: Query = Query::read(
    "transactions_by_height",
    "SELECT id FROM transactions WHERE blockheight = ?",
);

static CHANNELTXS_INSERT: Query = Query::write(
    "channeltxs_insert",
    "INSERT INTO channeltxs (channel_id, type, transaction_id, input_num, blockheight) \
     VALUES (?, ?, ?, ?, ?)",
);
static CHANNELTXS_ONCHAIND: Query = Query::read(
    "channeltxs_onchaind_channels",
    "SELECT DISTINCT(channel_id) FROM channeltxs WHERE type = ?",
);
static CHANNELTXS_GET: Query = Query::read(
    "channeltxs_get",
    "SELECT c.type, c.blockheight, t.rawtx, c.input_num, c.blockheight - t.blockheight + 1, t.id \
     FROM channeltxs c JOIN transactions t ON t.id = c.transaction_id \
     WHERE c.channel_id = ? ORDER BY c.id ASC",
);

fn optional_u32(row: &Row, col: usize) -> Option<u32> {
    (!row.is_null(col)).then(|| row.column_u64(col) as u32)
}

impl Wallet {
    /// Record a processed block and drop `utxoset` rows that were spent too
    /// long ago to matter
    pub fn block_add(&self, block: &Block) -> Result<(), WalletError> {
        let mut stmt = self.db.prepare(&BLOCK_INSERT);
        stmt.bind_u64(0, u64::from(block.height));
        stmt.bind_block_hash(1, &block.hash);
        stmt.bind_block_hash(2, &block.prev_hash);
        stmt.exec()?;

        let mut stmt = self.db.prepare(&UTXOSET_PRUNE);
        stmt.bind_u64(0, u64::from(block.height.saturating_sub(UTXO_PRUNE_DEPTH)));
        let pruned = stmt.exec()?.changes;
        if pruned > 0 {
            tracing::debug!(target: "chanstore::wallet", height = block.height, pruned, "pruned utxoset");
        }
        Ok(())
    }

    /// Record a filtered block together with the outputs it carries
    ///
    /// A height we already have is left untouched, outputs included.
    pub fn filteredblock_add(&self, fb: &FilteredBlock) -> Result<(), WalletError> {
        if self.have_block(fb.height)? {
            return Ok(());
        }

        let mut stmt = self.db.prepare(&BLOCK_INSERT_OR_IGNORE);
        stmt.bind_u64(0, u64::from(fb.height));
        stmt.bind_block_hash(1, &fb.hash);
        stmt.bind_block_hash(2, &fb.prev_hash);
        stmt.exec()?;

        for o in &fb.outpoints {
            self.utxoset_add(&o.outpoint, fb.height, o.txindex, &o.script_pubkey, o.amount)?;
        }
        tracing::debug!(
            target: "chanstore::wallet",
            height = fb.height,
            outpoints = fb.outpoints.len(),
            "added filtered block"
        );
        Ok(())
    }

    /// Forget a block that was reorganized away
    ///
    /// # Panics
    ///
    /// If a block at or above its height is still stored: descendants must
    /// be removed first.
    pub fn block_remove(&self, block: &Block) -> Result<(), WalletError> {
        let mut stmt = self.db.prepare(&BLOCK_DELETE);
        stmt.bind_block_hash(0, &block.hash);
        stmt.exec()?;

        let mut stmt = self.db.prepare(&BLOCKS_FROM_HEIGHT);
        stmt.bind_u64(0, u64::from(block.height));
        if let Some(row) = stmt.query()?.single() {
            crate::fatal!(
                "Removed block {} at height {} but block at height {} remains",
                block.hash,
                block.height,
                row.column_u64(0)
            );
        }
        Ok(())
    }

    /// Drop every block above `height`
    pub fn blocks_rollback(&self, height: u32) -> Result<(), WalletError> {
        let mut stmt = self.db.prepare(&BLOCKS_ROLLBACK);
        stmt.bind_u64(0, u64::from(height));
        let removed = stmt.exec()?.changes;
        tracing::info!(target: "chanstore::wallet", height, removed, "rolled back blocks");
        Ok(())
    }

    /// Lowest and highest stored block, both `default` if there are none
    pub fn blocks_heights(&self, default: u32) -> Result<(u32, u32), WalletError> {
        let row = self.db.prepare(&BLOCKS_HEIGHTS).query()?.single();
        Ok(match row {
            Some(row) if !row.is_null(0) => (row.column_u64(0) as u32, row.column_u64(1) as u32),
            _ => (default, default),
        })
    }

    pub fn have_block(&self, height: u32) -> Result<bool, WalletError> {
        let mut stmt = self.db.prepare(&BLOCK_AT_HEIGHT);
        stmt.bind_u64(0, u64::from(height));
        Ok(stmt.query()?.single().is_some())
    }

    /// Track an output that may be a channel's funding output
    pub fn utxoset_add(
        &self,
        outpoint: &OutPoint,
        blockheight: u32,
        txindex: u32,
        script_pubkey: &Script,
        amount: Amount,
    ) -> Result<(), WalletError> {
        let mut stmt = self.db.prepare(&UTXOSET_INSERT);
        stmt.bind_txid(0, &outpoint.txid);
        stmt.bind_u64(1, u64::from(outpoint.vout));
        stmt.bind_u64(2, u64::from(blockheight));
        stmt.bind_u64(3, u64::from(txindex));
        stmt.bind_script(4, script_pubkey);
        stmt.bind_amount_sat(5, amount);
        stmt.exec()?;
        Ok(())
    }

    /// Record that `outpoint` was spent at `blockheight`
    ///
    /// Returns the short channel id of the output if it is in the UTXO set,
    /// meaning a channel it funded has just closed.
    pub fn outpoint_spend(
        &self,
        blockheight: u32,
        outpoint: &OutPoint,
    ) -> Result<Option<ShortChannelId>, WalletError> {
        let mut stmt = self.db.prepare(&OUTPUT_SPEND_HEIGHT);
        stmt.bind_u64(0, u64::from(blockheight));
        stmt.bind_txid(1, &outpoint.txid);
        stmt.bind_u64(2, u64::from(outpoint.vout));
        stmt.exec()?;

        let mut stmt = self.db.prepare(&UTXOSET_SPEND);
        stmt.bind_u64(0, u64::from(blockheight));
        stmt.bind_txid(1, &outpoint.txid);
        stmt.bind_u64(2, u64::from(outpoint.vout));
        if stmt.exec()?.changes == 0 {
            return Ok(None);
        }

        let mut stmt = self.db.prepare(&UTXOSET_LOCATE);
        stmt.bind_txid(0, &outpoint.txid);
        stmt.bind_u64(1, u64::from(outpoint.vout));
        let row = stmt
            .query()?
            .single()
            .ok_or_else(|| WalletError::NotFound(format!("utxoset {}", outpoint)))?;

        let (height, txindex) = (row.column_u64(0) as u32, row.column_u64(1) as u32);
        let Ok(outnum) = u16::try_from(outpoint.vout) else {
            crate::fatal!("Invalid short channel id {}:{}:{}", height, txindex, outpoint.vout);
        };
        match ShortChannelId::new(height, txindex, outnum) {
            Some(scid) => Ok(Some(scid)),
            None => crate::fatal!("Invalid short channel id {}:{}:{}", height, txindex, outnum),
        }
    }

    /// The unspent output a short channel id points at
    pub fn utxoset_get_by_scid(
        &self,
        scid: &ShortChannelId,
    ) -> Result<Option<ScidOutpoint>, WalletError> {
        let mut stmt = self.db.prepare(&UTXOSET_BY_SCID);
        stmt.bind_u64(0, u64::from(scid.block_height()));
        stmt.bind_u64(1, u64::from(scid.tx_index()));
        stmt.bind_u64(2, u64::from(scid.output_index()));
        let Some(row) = stmt.query()?.single() else {
            return Ok(None);
        };
        Ok(Some(ScidOutpoint {
            outpoint: OutPoint::new(row.column_txid(0)?, u32::from(scid.output_index())),
            blockheight: scid.block_height(),
            txindex: scid.tx_index(),
            script_pubkey: row.column_script(1).unwrap_or_default(),
            amount: row.column_amount_sat(2),
        }))
    }

    /// Remember a transaction, or record where it confirmed if we already do
    ///
    /// A `blockheight` of 0 means unconfirmed.
    pub fn transaction_add(
        &self,
        tx: &Transaction,
        blockheight: u32,
        txindex: u32,
    ) -> Result<(), WalletError> {
        let txid = tx.compute_txid();
        let mut stmt = self.db.prepare(&TRANSACTION_HEIGHT);
        stmt.bind_txid(0, &txid);
        let known = stmt.query()?.single().is_some();

        if !known {
            let mut stmt = self.db.prepare(&TRANSACTION_INSERT);
            stmt.bind_txid(0, &txid);
            if blockheight != 0 {
                stmt.bind_u64(1, u64::from(blockheight));
                stmt.bind_u64(2, u64::from(txindex));
            } else {
                stmt.bind_null(1);
                stmt.bind_null(2);
            }
            stmt.bind_tx(3, tx);
            stmt.exec()?;
        } else if blockheight != 0 {
            let mut stmt = self.db.prepare(&TRANSACTION_CONFIRM);
            stmt.bind_u64(0, u64::from(blockheight));
            stmt.bind_u64(1, u64::from(txindex));
            stmt.bind_txid(2, &txid);
            stmt.exec()?;
        }
        Ok(())
    }

    /// Add `tx_type` flags to a known transaction, and its channel if given
    ///
    /// # Panics
    ///
    /// If the transaction is unknown.
    pub fn transaction_annotate(
        &self,
        txid: &Txid,
        tx_type: TxType,
        channel_id: Option<u64>,
    ) -> Result<(), WalletError> {
        let mut stmt = self.db.prepare(&TRANSACTION_ANNOTATION);
        stmt.bind_txid(0, txid);
        let Some(row) = stmt.query()?.single() else {
            crate::fatal!("Attempting to annotate a transaction we don't have: {}", txid);
        };
        let tx_type = tx_type | TxType(row.column_u64(0) as u16);
        let channel_id = channel_id.or_else(|| (!row.is_null(1)).then(|| row.column_u64(1)));

        let mut stmt = self.db.prepare(&TRANSACTION_ANNOTATE);
        stmt.bind_u64(0, u64::from(tx_type.0));
        stmt.bind_optional(1, channel_id, |s, p, v| s.bind_u64(p, v));
        stmt.bind_txid(2, txid);
        stmt.exec()?;
        Ok(())
    }

    /// Confirmation height, `None` if unknown or unconfirmed
    pub fn transaction_height(&self, txid: &Txid) -> Result<Option<u32>, WalletError> {
        let mut stmt = self.db.prepare(&TRANSACTION_HEIGHT);
        stmt.bind_txid(0, txid);
        Ok(stmt.query()?.single().and_then(|row| optional_u32(&row, 0)))
    }

    pub fn transaction_locate(&self, txid: &Txid) -> Result<Option<TxLocator>, WalletError> {
        let mut stmt = self.db.prepare(&TRANSACTION_LOCATE);
        stmt.bind_txid(0, txid);
        Ok(stmt.query()?.single().and_then(|row| {
            optional_u32(&row, 0).map(|blockheight| TxLocator {
                blockheight,
                index: row.column_u64(1) as u32,
            })
        }))
    }

    pub fn transaction_get(&self, txid: &Txid) -> Result<Option<WalletTransaction>, WalletError> {
        let mut stmt = self.db.prepare(&TRANSACTION_GET);
        stmt.bind_txid(0, txid);
        let Some(row) = stmt.query()?.single() else {
            return Ok(None);
        };
        Ok(Some(WalletTransaction {
            id: row.column_txid(0)?,
            blockheight: optional_u32(&row, 1),
            txindex: optional_u32(&row, 2),
            rawtx: row.column_tx(3)?,
            tx_type: TxType(row.column_u64(4) as u16),
            channel_id: (!row.is_null(5)).then(|| row.column_u64(5)),
        }))
    }

    pub fn transactions_by_height(&self, blockheight: u32) -> Result<Vec<Txid>, WalletError> {
        let mut stmt = self.db.prepare(&TRANSACTIONS_BY_HEIGHT);
        stmt.bind_u64(0, u64::from(blockheight));
        stmt.query()?
            .map(|row| row.column_txid(0).map_err(WalletError::from))
            .collect()
    }

    /// Watch `txid` on behalf of a channel's onchain resolution
    pub fn channeltxs_add(
        &self,
        channel_dbid: u64,
        tx_type: u32,
        txid: &Txid,
        input_num: u32,
        blockheight: u32,
    ) -> Result<(), WalletError> {
        let mut stmt = self.db.prepare(&CHANNELTXS_INSERT);
        stmt.bind_u64(0, channel_dbid);
        stmt.bind_u64(1, u64::from(tx_type));
        stmt.bind_txid(2, txid);
        stmt.bind_u64(3, u64::from(input_num));
        stmt.bind_u64(4, u64::from(blockheight));
        stmt.exec()?;
        Ok(())
    }

    /// Channels whose onchain resolution has started
    pub fn onchaind_channels(&self) -> Result<Vec<u64>, WalletError> {
        let mut stmt = self.db.prepare(&CHANNELTXS_ONCHAIND);
        stmt.bind_u64(0, u64::from(ONCHAIN_INIT));
        Ok(stmt.query()?.map(|row| row.column_u64(0)).collect())
    }

    /// Watched transactions of a channel, in the order they were added
    pub fn channeltxs_get(&self, channel_dbid: u64) -> Result<Vec<ChannelTx>, WalletError> {
        let mut stmt = self.db.prepare(&CHANNELTXS_GET);
        stmt.bind_u64(0, channel_dbid);
        stmt.query()?
            .map(|row| -> Result<ChannelTx, WalletError> {
                Ok(ChannelTx {
                    channel_id: channel_dbid,
                    tx_type: row.column_u64(0) as u32,
                    blockheight: row.column_u64(1) as u32,
                    tx: row.column_tx(2)?,
                    input_num: row.column_u64(3) as u32,
                    depth: row.column_u64(4) as u32,
                    txid: row.column_txid(5)?,
                })
            })
            .collect()
    }
}
