//! HTLC Types
//!
//! Offered HTLCs walk `SentAddHtlc → … → RcvdRemoveAckRevocation`, received
//! ones walk `RcvdAddHtlc → … → SentRemoveAckRevocation`. The final state of
//! each direction means both commitments no longer carry the HTLC.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::channel::Side;
use super::keys::{PaymentHash, Preimage, Secret};
use super::units::AmountMsat;

/// Length of a routing onion packet
pub const ONION_PACKET_LEN: usize = 1366;

/// Failure code flag: error is from the final node
pub const FAILCODE_PERM: u16 = 0x4000;
/// Failure code flag: error is node-level
pub const FAILCODE_NODE: u16 = 0x2000;
/// Failure code flag: error carries a channel_update
pub const FAILCODE_UPDATE: u16 = 0x1000;
/// Failure code flag: onion could not be parsed
pub const FAILCODE_BADONION: u16 = 0x8000;
pub const TEMPORARY_NODE_FAILURE: u16 = FAILCODE_NODE | 2;

/// Per-HTLC state, stored as its ordinal
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HtlcState {
    SentAddHtlc,
    SentAddCommit,
    RcvdAddRevocation,
    RcvdAddAckCommit,
    SentAddAckRevocation,
    RcvdRemoveHtlc,
    RcvdRemoveCommit,
    SentRemoveRevocation,
    SentRemoveAckCommit,
    RcvdRemoveAckRevocation,
    RcvdAddHtlc,
    RcvdAddCommit,
    SentAddRevocation,
    SentAddAckCommit,
    RcvdAddAckRevocation,
    SentRemoveHtlc,
    SentRemoveCommit,
    RcvdRemoveRevocation,
    RcvdRemoveAckCommit,
    SentRemoveAckRevocation,
}

const HTLC_STATES: [HtlcState; 20] = [
    HtlcState::SentAddHtlc,
    HtlcState::SentAddCommit,
    HtlcState::RcvdAddRevocation,
    HtlcState::RcvdAddAckCommit,
    HtlcState::SentAddAckRevocation,
    HtlcState::RcvdRemoveHtlc,
    HtlcState::RcvdRemoveCommit,
    HtlcState::SentRemoveRevocation,
    HtlcState::SentRemoveAckCommit,
    HtlcState::RcvdRemoveAckRevocation,
    HtlcState::RcvdAddHtlc,
    HtlcState::RcvdAddCommit,
    HtlcState::SentAddRevocation,
    HtlcState::SentAddAckCommit,
    HtlcState::RcvdAddAckRevocation,
    HtlcState::SentRemoveHtlc,
    HtlcState::SentRemoveCommit,
    HtlcState::RcvdRemoveRevocation,
    HtlcState::RcvdRemoveAckCommit,
    HtlcState::SentRemoveAckRevocation,
];

impl HtlcState {
    pub fn db_value(self) -> u64 {
        self as u64
    }

    /// Side that offered an HTLC in this state
    pub fn owner(self) -> Side {
        if self < HtlcState::RcvdAddHtlc {
            Side::Local
        } else {
            Side::Remote
        }
    }

    /// Whether the HTLC has been removed from both commitments
    pub fn is_final(self) -> bool {
        matches!(
            self,
            HtlcState::RcvdRemoveAckRevocation | HtlcState::SentRemoveAckRevocation
        )
    }

    /// Whether a removal has started
    pub fn is_removing(self) -> bool {
        (self >= HtlcState::RcvdRemoveHtlc && self <= HtlcState::RcvdRemoveAckRevocation)
            || self >= HtlcState::SentRemoveHtlc
    }
}

impl TryFrom<u64> for HtlcState {
    type Error = String;

    fn try_from(v: u64) -> Result<Self, Self::Error> {
        HTLC_STATES
            .get(v as usize)
            .copied()
            .ok_or_else(|| format!("unknown htlc state: {}", v))
    }
}

impl std::fmt::Display for HtlcState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_uppercase))
            .unwrap_or_default();
        write!(f, "{}", name)
    }
}

/// An HTLC offered to us
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HtlcIn {
    /// Row id, 0 until saved
    pub dbid: u64,
    /// Id assigned by the offering peer
    pub key_id: u64,
    pub msat: AmountMsat,
    pub cltv_expiry: u32,
    pub hstate: HtlcState,
    pub payment_hash: PaymentHash,
    pub preimage: Option<Preimage>,
    pub onion_routing_packet: Vec<u8>,
    pub shared_secret: Option<Secret>,
    /// Onion error to relay back
    pub failuremsg: Option<Vec<u8>>,
    /// Failure code we generated ourselves, 0 if none
    pub failcode: u16,
    pub received_time: DateTime<Utc>,
}

impl HtlcIn {
    pub fn new(
        key_id: u64,
        msat: AmountMsat,
        cltv_expiry: u32,
        payment_hash: PaymentHash,
        onion_routing_packet: Vec<u8>,
    ) -> Self {
        Self {
            dbid: 0,
            key_id,
            msat,
            cltv_expiry,
            hstate: HtlcState::RcvdAddHtlc,
            payment_hash,
            preimage: None,
            onion_routing_packet,
            shared_secret: None,
            failuremsg: None,
            failcode: 0,
            received_time: Utc::now(),
        }
    }
}

/// An HTLC we offered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HtlcOut {
    /// Row id, 0 until saved
    pub dbid: u64,
    /// Id we assigned
    pub key_id: u64,
    pub msat: AmountMsat,
    pub cltv_expiry: u32,
    pub hstate: HtlcState,
    pub payment_hash: PaymentHash,
    pub preimage: Option<Preimage>,
    pub onion_routing_packet: Vec<u8>,
    pub failuremsg: Option<Vec<u8>>,
    pub failcode: u16,
    /// Row id of the incoming HTLC this forwards, `None` for our own payments
    pub origin_htlc: Option<u64>,
}

impl HtlcOut {
    pub fn new(
        key_id: u64,
        msat: AmountMsat,
        cltv_expiry: u32,
        payment_hash: PaymentHash,
        onion_routing_packet: Vec<u8>,
    ) -> Self {
        Self {
            dbid: 0,
            key_id,
            msat,
            cltv_expiry,
            hstate: HtlcState::SentAddHtlc,
            payment_hash,
            preimage: None,
            onion_routing_packet,
            failuremsg: None,
            failcode: 0,
            origin_htlc: None,
        }
    }

    pub fn am_origin(&self) -> bool {
        self.origin_htlc.is_none()
    }
}

/// Minimal HTLC description handed to onchain resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HtlcStub {
    pub owner: Side,
    pub cltv_expiry: u32,
    pub id: u64,
    pub ripemd: [u8; 20],
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_roundtrip_and_owner() {
        for (i, state) in HTLC_STATES.iter().enumerate() {
            assert_eq!(state.db_value(), i as u64);
            assert_eq!(HtlcState::try_from(i as u64), Ok(*state));
        }
        assert!(HtlcState::try_from(20).is_err());
        assert_eq!(HtlcState::SentAddCommit.owner(), Side::Local);
        assert_eq!(HtlcState::RcvdAddCommit.owner(), Side::Remote);
    }

    #[test]
    fn test_final_states() {
        assert!(HtlcState::SentRemoveAckRevocation.is_final());
        assert!(HtlcState::RcvdRemoveAckRevocation.is_final());
        assert!(!HtlcState::RcvdAddAckRevocation.is_final());
        assert!(HtlcState::SentRemoveHtlc.is_removing());
        assert!(!HtlcState::RcvdAddHtlc.is_removing());
        assert_eq!(HtlcState::RcvdAddHtlc.to_string(), "RCVD_ADD_HTLC");
    }
}
