//! Chain Tracking Types

use bitcoin::{Amount, BlockHash, OutPoint, ScriptBuf, Transaction, Txid};

/// Number of blocks a spent `utxoset` row is kept for
pub const UTXO_PRUNE_DEPTH: u32 = 144;

/// `channeltxs` type of the transaction that started onchain resolution
pub const ONCHAIN_INIT: u32 = 5001;

/// A block the chain topology has processed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub height: u32,
    pub hash: BlockHash,
    pub prev_hash: BlockHash,
}

/// Output of a filtered block that may fund a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilteredOutpoint {
    pub outpoint: OutPoint,
    pub txindex: u32,
    pub script_pubkey: ScriptBuf,
    pub amount: Amount,
}

/// A block reduced to the outputs a light client was asked about
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilteredBlock {
    pub height: u32,
    pub hash: BlockHash,
    pub prev_hash: BlockHash,
    pub outpoints: Vec<FilteredOutpoint>,
}

/// Bitmask describing what a wallet transaction does for us
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct TxType(pub u16);

impl TxType {
    pub const UNKNOWN: TxType = TxType(0);
    pub const THEIR_UNILATERAL: TxType = TxType(1);
    pub const OUR_UNILATERAL: TxType = TxType(1 << 1);
    pub const CHANNEL_FUNDING: TxType = TxType(1 << 2);
    pub const CHANNEL_MUTUAL_CLOSE: TxType = TxType(1 << 3);
    pub const CHANNEL_UNILATERAL: TxType = TxType(1 << 4);
    pub const CHANNEL_SWEEP: TxType = TxType(1 << 5);
    pub const CHANNEL_HTLC_SUCCESS: TxType = TxType(1 << 6);
    pub const CHANNEL_HTLC_TIMEOUT: TxType = TxType(1 << 7);
    pub const CHANNEL_PENALTY: TxType = TxType(1 << 8);
    pub const CHANNEL_CHEAT: TxType = TxType(1 << 9);

    pub fn contains(self, other: TxType) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for TxType {
    type Output = TxType;

    fn bitor(self, rhs: TxType) -> TxType {
        TxType(self.0 | rhs.0)
    }
}

/// Position of a transaction in the chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxLocator {
    pub blockheight: u32,
    pub index: u32,
}

/// A transaction recorded in the wallet's `transactions` table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletTransaction {
    pub id: Txid,
    pub blockheight: Option<u32>,
    pub txindex: Option<u32>,
    pub rawtx: Transaction,
    pub tx_type: TxType,
    pub channel_id: Option<u64>,
}

/// A transaction onchain resolution is watching for a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelTx {
    pub channel_id: u64,
    pub tx_type: u32,
    pub txid: Txid,
    pub tx: Transaction,
    pub input_num: u32,
    pub blockheight: u32,
    /// Confirmations of the transaction as of `blockheight`
    pub depth: u32,
}

/// Unspent `utxoset` row located by its short channel id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScidOutpoint {
    pub outpoint: OutPoint,
    pub blockheight: u32,
    pub txindex: u32,
    pub script_pubkey: ScriptBuf,
    pub amount: Amount,
}
