//! Forwarding Ledger Types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::keys::{PaymentHash, ShortChannelId};
use super::units::AmountMsat;

/// Outcome of a forward attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForwardStatus {
    /// Outgoing HTLC offered, unresolved
    Offered,
    Settled,
    /// Outgoing HTLC failed downstream
    Failed,
    /// Never forwarded: we failed the incoming HTLC ourselves
    LocalFailed,
}

impl Default for ForwardStatus {
    fn default() -> Self {
        Self::Offered
    }
}

impl ForwardStatus {
    pub fn db_value(self) -> u64 {
        match self {
            Self::Offered => 0,
            Self::Settled => 1,
            Self::Failed => 2,
            Self::LocalFailed => 3,
        }
    }

    /// Whether the forward has reached an outcome
    pub fn is_resolved(self) -> bool {
        matches!(self, Self::Settled | Self::Failed)
    }

    /// Whether a failcode may be recorded
    pub fn may_carry_failcode(self) -> bool {
        matches!(self, Self::Failed | Self::LocalFailed)
    }
}

impl TryFrom<u64> for ForwardStatus {
    type Error = String;

    fn try_from(v: u64) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Self::Offered),
            1 => Ok(Self::Settled),
            2 => Ok(Self::Failed),
            3 => Ok(Self::LocalFailed),
            _ => Err(format!("unknown forward status: {}", v)),
        }
    }
}

impl std::fmt::Display for ForwardStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Offered => "offered",
            Self::Settled => "settled",
            Self::Failed => "failed",
            Self::LocalFailed => "local_failed",
        };
        write!(f, "{}", s)
    }
}

/// One row of the forwarding ledger, as listed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Forwarding {
    pub channel_in: ShortChannelId,
    /// `None` for locally failed forwards
    pub channel_out: Option<ShortChannelId>,
    pub msat_in: AmountMsat,
    /// Zero for locally failed forwards
    pub msat_out: AmountMsat,
    /// Never negative
    pub fee: AmountMsat,
    pub payment_hash: Option<PaymentHash>,
    pub status: ForwardStatus,
    pub failcode: Option<u16>,
    pub received_time: DateTime<Utc>,
    pub resolved_time: Option<DateTime<Utc>>,
}

/// Ledger summary
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwardingStats {
    pub offered: u64,
    pub settled: u64,
    pub failed: u64,
    pub local_failed: u64,
    pub total_fees: AmountMsat,
}

impl std::fmt::Display for ForwardingStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Forwards: {} offered, {} settled, {} failed, {} local_failed | Fees: {}",
            self.offered, self.settled, self.failed, self.local_failed, self.total_fees
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failcode_rules() {
        assert!(ForwardStatus::LocalFailed.may_carry_failcode());
        assert!(ForwardStatus::Failed.may_carry_failcode());
        assert!(!ForwardStatus::Settled.may_carry_failcode());
        assert!(!ForwardStatus::LocalFailed.is_resolved());
        assert_eq!(ForwardStatus::try_from(3), Ok(ForwardStatus::LocalFailed));
    }
}
