//! Channel Types
//!
//! A channel's lifecycle: opening → awaiting lock-in → normal → shutting down
//! → closing → onchain → closed. Rows at or past `Closed` are never reloaded.

use bitcoin::{Amount, ScriptBuf, Transaction, Txid};
use secp256k1::ecdsa::Signature;
use secp256k1::PublicKey;
use serde::{Deserialize, Serialize};

use super::htlc::HtlcState;
use super::keys::ShortChannelId;
use super::units::AmountMsat;
use crate::shachain::Shachain;

/// Which side of a channel something belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Local,
    Remote,
}

impl Side {
    pub fn db_value(self) -> u64 {
        match self {
            Side::Local => 0,
            Side::Remote => 1,
        }
    }

    pub fn index(self) -> usize {
        self.db_value() as usize
    }
}

impl TryFrom<u64> for Side {
    type Error = String;

    fn try_from(v: u64) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Side::Local),
            1 => Ok(Side::Remote),
            _ => Err(format!("invalid side: {}", v)),
        }
    }
}

/// Channel lifecycle state, ordered
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    #[default]
    Opening,
    AwaitingLockin,
    Normal,
    ShuttingDown,
    ClosingSigExchange,
    ClosingComplete,
    AwaitingUnilateral,
    FundingSpendSeen,
    Onchain,
    Closed,
}

impl ChannelState {
    pub fn db_value(self) -> u64 {
        match self {
            Self::Opening => 1,
            Self::AwaitingLockin => 2,
            Self::Normal => 3,
            Self::ShuttingDown => 4,
            Self::ClosingSigExchange => 5,
            Self::ClosingComplete => 6,
            Self::AwaitingUnilateral => 7,
            Self::FundingSpendSeen => 8,
            Self::Onchain => 9,
            Self::Closed => 10,
        }
    }
}

impl TryFrom<u64> for ChannelState {
    type Error = String;

    fn try_from(v: u64) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(Self::Opening),
            2 => Ok(Self::AwaitingLockin),
            3 => Ok(Self::Normal),
            4 => Ok(Self::ShuttingDown),
            5 => Ok(Self::ClosingSigExchange),
            6 => Ok(Self::ClosingComplete),
            7 => Ok(Self::AwaitingUnilateral),
            8 => Ok(Self::FundingSpendSeen),
            9 => Ok(Self::Onchain),
            10 => Ok(Self::Closed),
            _ => Err(format!("unknown channel state: {}", v)),
        }
    }
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Opening => "opening",
            Self::AwaitingLockin => "awaiting_lockin",
            Self::Normal => "normal",
            Self::ShuttingDown => "shutting_down",
            Self::ClosingSigExchange => "closing_sig_exchange",
            Self::ClosingComplete => "closing_complete",
            Self::AwaitingUnilateral => "awaiting_unilateral",
            Self::FundingSpendSeen => "funding_spend_seen",
            Self::Onchain => "onchain",
            Self::Closed => "closed",
        };
        write!(f, "{}", s)
    }
}

/// Negotiated per-side channel limits
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Row id, 0 until saved
    pub id: u64,
    pub dust_limit: Amount,
    pub max_htlc_value_in_flight: AmountMsat,
    pub channel_reserve: Amount,
    pub htlc_minimum: AmountMsat,
    pub to_self_delay: u16,
    pub max_accepted_htlcs: u16,
}

/// Remote basepoints
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Basepoints {
    pub revocation: PublicKey,
    pub payment: PublicKey,
    pub htlc: PublicKey,
    pub delayed_payment: PublicKey,
}

/// Everything we know about the remote side of a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    pub their_config: ChannelConfig,
    pub remote_fundingkey: PublicKey,
    pub theirbase: Basepoints,
    pub remote_per_commit: PublicKey,
    pub old_remote_per_commit: PublicKey,
    /// Indexed by `Side`
    pub feerate_per_kw: [u32; 2],
}

/// HTLC state change included in the last commitment we sent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangedHtlc {
    pub newstate: HtlcState,
    pub id: u64,
}

/// A peer we have (or had) channels with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    /// Row id, 0 until stored
    pub dbid: u64,
    pub node_id: PublicKey,
    pub address: Option<String>,
}

impl Peer {
    pub fn new(node_id: PublicKey, address: Option<String>) -> Self {
        Self {
            dbid: 0,
            node_id,
            address,
        }
    }
}

/// The remote revocation chain of one channel
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WalletShachain {
    /// Row id in `shachains`, 0 until stored
    pub id: u64,
    pub chain: Shachain,
}

/// Persistent channel record
#[derive(Debug, Clone, PartialEq)]
pub struct Channel {
    /// Row id, 0 until inserted
    pub dbid: u64,
    pub peer: Peer,
    pub scid: Option<ShortChannelId>,
    pub our_config: ChannelConfig,
    pub channel_info: ChannelInfo,
    pub their_shachain: WalletShachain,
    pub state: ChannelState,
    pub funder: Side,
    pub channel_flags: u8,
    pub minimum_depth: u32,
    /// Next commitment number, indexed by `Side`
    pub next_index: [u64; 2],
    pub next_htlc_id: u64,
    pub funding_txid: Txid,
    pub funding_outnum: u16,
    pub funding: Amount,
    pub remote_funding_locked: bool,
    pub push: AmountMsat,
    pub our_msat: AmountMsat,
    pub msat_to_us_min: AmountMsat,
    pub msat_to_us_max: AmountMsat,
    pub last_tx: Option<Transaction>,
    pub last_sig: Option<Signature>,
    pub last_htlc_sigs: Vec<Signature>,
    pub shutdown_scriptpubkey_remote: Option<ScriptBuf>,
    pub final_key_idx: u64,
    pub last_was_revoke: bool,
    pub last_sent_commit: Vec<ChangedHtlc>,
    /// Block height the funding transaction was first seen at
    pub first_blocknum: u32,
    pub min_possible_feerate: u32,
    pub max_possible_feerate: u32,
    pub future_per_commitment_point: Option<PublicKey>,
    pub feerate_base: u32,
    pub feerate_ppm: u32,
    pub remote_upfront_shutdown_script: Option<ScriptBuf>,
}

impl Channel {
    /// A channel that has not been stored yet
    pub fn new(
        peer: Peer,
        channel_info: ChannelInfo,
        funding_txid: Txid,
        funding_outnum: u16,
        funding: Amount,
        funder: Side,
    ) -> Self {
        let our_msat = match funder {
            Side::Local => AmountMsat::from_sat(funding).unwrap_or_default(),
            Side::Remote => AmountMsat::ZERO,
        };
        Self {
            dbid: 0,
            peer,
            scid: None,
            our_config: ChannelConfig::default(),
            channel_info,
            their_shachain: WalletShachain::default(),
            state: ChannelState::Opening,
            funder,
            channel_flags: 0,
            minimum_depth: 3,
            next_index: [1, 1],
            next_htlc_id: 0,
            funding_txid,
            funding_outnum,
            funding,
            remote_funding_locked: false,
            push: AmountMsat::ZERO,
            our_msat,
            msat_to_us_min: our_msat,
            msat_to_us_max: our_msat,
            last_tx: None,
            last_sig: None,
            last_htlc_sigs: Vec::new(),
            shutdown_scriptpubkey_remote: None,
            final_key_idx: 0,
            last_was_revoke: false,
            last_sent_commit: Vec::new(),
            first_blocknum: 0,
            min_possible_feerate: 253,
            max_possible_feerate: 253,
            future_per_commitment_point: None,
            feerate_base: 1000,
            feerate_ppm: 10,
            remote_upfront_shutdown_script: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state < ChannelState::Closed
    }
}

/// Per-channel payment counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub in_payments_offered: u64,
    pub in_payments_fulfilled: u64,
    pub in_msatoshi_offered: AmountMsat,
    pub in_msatoshi_fulfilled: AmountMsat,
    pub out_payments_offered: u64,
    pub out_payments_fulfilled: u64,
    pub out_msatoshi_offered: AmountMsat,
    pub out_msatoshi_fulfilled: AmountMsat,
}

impl std::fmt::Display for ChannelStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "in: {}/{} ({}/{}), out: {}/{} ({}/{})",
            self.in_payments_fulfilled,
            self.in_payments_offered,
            self.in_msatoshi_fulfilled,
            self.in_msatoshi_offered,
            self.out_payments_fulfilled,
            self.out_payments_offered,
            self.out_msatoshi_fulfilled,
            self.out_msatoshi_offered,
        )
    }
}

/// Signatures from the remote side of a channel announcement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnnouncementSigs {
    pub node_sig: Signature,
    pub bitcoin_sig: Signature,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_state_order() {
        assert!(ChannelState::Normal < ChannelState::Closed);
        assert!(ChannelState::Onchain < ChannelState::Closed);
        for v in 1..=10 {
            let state = ChannelState::try_from(v).unwrap();
            assert_eq!(state.db_value(), v);
        }
        assert!(ChannelState::try_from(0).is_err());
        assert_eq!(ChannelState::Closed.to_string(), "closed");
        assert_eq!(ChannelState::default(), ChannelState::Opening);
    }

    #[test]
    fn test_side_index() {
        assert_eq!(Side::Local.index(), 0);
        assert_eq!(Side::try_from(1), Ok(Side::Remote));
    }
}
