//! Outgoing Payment Types

use secp256k1::PublicKey;
use serde::{Deserialize, Serialize};

use super::keys::{PaymentHash, Preimage, Secret, ShortChannelId};
use super::units::AmountMsat;

/// Status of a payment we initiated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Complete,
    Failed,
}

impl Default for PaymentStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl PaymentStatus {
    pub fn db_value(self) -> u64 {
        match self {
            Self::Pending => 0,
            Self::Complete => 1,
            Self::Failed => 2,
        }
    }
}

impl TryFrom<u64> for PaymentStatus {
    type Error = String;

    fn try_from(v: u64) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Self::Pending),
            1 => Ok(Self::Complete),
            2 => Ok(Self::Failed),
            _ => Err(format!("unknown payment status: {}", v)),
        }
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Complete => "complete",
            Self::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// A payment we are sending or have sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletPayment {
    /// Row id, 0 while staged
    pub id: u64,
    /// Creation time, seconds since epoch
    pub timestamp: u64,
    pub payment_hash: PaymentHash,
    pub destination: PublicKey,
    pub status: PaymentStatus,
    pub msatoshi: AmountMsat,
    pub msatoshi_sent: AmountMsat,
    pub payment_preimage: Option<Preimage>,
    /// Onion shared secrets along the route, cleared once terminal
    pub path_secrets: Option<Vec<Secret>>,
    pub route_nodes: Option<Vec<PublicKey>>,
    pub route_channels: Option<Vec<ShortChannelId>>,
    pub label: Option<String>,
    pub bolt11: Option<String>,
}

impl WalletPayment {
    pub fn new(
        payment_hash: PaymentHash,
        destination: PublicKey,
        msatoshi: AmountMsat,
        msatoshi_sent: AmountMsat,
    ) -> Self {
        Self {
            id: 0,
            timestamp: chrono::Utc::now().timestamp().max(0) as u64,
            payment_hash,
            destination,
            status: PaymentStatus::Pending,
            msatoshi,
            msatoshi_sent,
            payment_preimage: None,
            path_secrets: None,
            route_nodes: None,
            route_channels: None,
            label: None,
            bolt11: None,
        }
    }
}

/// Decoded failure of the last attempt of a payment
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PaymentFailInfo {
    pub failonionreply: Option<Vec<u8>>,
    pub faildestperm: bool,
    /// Index of the failing hop, -1 if unknown
    pub failindex: i32,
    pub failcode: u16,
    pub failnode: Option<PublicKey>,
    pub failchannel: Option<ShortChannelId>,
    pub failupdate: Option<Vec<u8>>,
    pub faildetail: Option<String>,
    /// Direction of the failing channel, 0 or 1
    pub faildirection: Option<u8>,
}
