//! Shared Types Module
//!
//! Records persisted by the wallet store and the enums that describe their
//! lifecycles.

pub mod chain;
pub mod channel;
pub mod forward;
pub mod htlc;
pub mod keys;
pub mod output;
pub mod payment;
pub mod units;

pub use chain::{
    Block, ChannelTx, FilteredBlock, FilteredOutpoint, ScidOutpoint, TxLocator, TxType, WalletTransaction, ONCHAIN_INIT,
    UTXO_PRUNE_DEPTH,
};
pub use channel::{
    AnnouncementSigs, Basepoints, ChangedHtlc, Channel, ChannelConfig, ChannelInfo, ChannelState,
    ChannelStats, Peer, Side, WalletShachain,
};
pub use forward::{ForwardStatus, Forwarding, ForwardingStats};
pub use htlc::{
    HtlcIn, HtlcOut, HtlcState, HtlcStub, FAILCODE_BADONION, FAILCODE_NODE, FAILCODE_PERM,
    FAILCODE_UPDATE, ONION_PACKET_LEN, TEMPORARY_NODE_FAILURE,
};
pub use keys::{PaymentHash, Preimage, Secret, ShortChannelId};
pub use output::{OutputStatus, OutputType, UnilateralCloseInfo, Utxo};
pub use payment::{PaymentFailInfo, PaymentStatus, WalletPayment};
pub use units::{amount_tx_fee, sats_to_display, AmountMsat, MSAT_PER_SAT};
