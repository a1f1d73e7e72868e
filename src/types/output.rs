//! Wallet Output Types
//!
//! Outputs move available → reserved → spent, or back from reserved to
//! available when a coin selection is abandoned.

use bitcoin::{Amount, OutPoint, ScriptBuf};
use secp256k1::PublicKey;
use serde::{Deserialize, Serialize};

/// Spend status of a wallet output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStatus {
    /// Spendable and not part of any selection
    Available,
    /// Held by an unconfirmed coin selection
    Reserved,
    /// Spent by a transaction we built
    Spent,
}

impl Default for OutputStatus {
    fn default() -> Self {
        Self::Available
    }
}

impl OutputStatus {
    pub fn db_value(self) -> u64 {
        match self {
            Self::Available => 0,
            Self::Reserved => 1,
            Self::Spent => 2,
        }
    }
}

impl TryFrom<u64> for OutputStatus {
    type Error = String;

    fn try_from(v: u64) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Self::Available),
            1 => Ok(Self::Reserved),
            2 => Ok(Self::Spent),
            _ => Err(format!("unknown output status: {}", v)),
        }
    }
}

impl std::fmt::Display for OutputStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Available => "available",
            Self::Reserved => "reserved",
            Self::Spent => "spent",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for OutputStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "available" => Ok(Self::Available),
            "reserved" => Ok(Self::Reserved),
            "spent" => Ok(Self::Spent),
            _ => Err(format!("unknown status: {}", s)),
        }
    }
}

/// How an output is spent, which determines its input weight
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputType {
    /// P2WPKH wrapped in P2SH
    P2shWpkh,
    /// Our `to_local` output from a unilateral close
    ToLocal,
    HtlcOffer,
    HtlcRecv,
    /// Change from a transaction we built
    OurChange,
    /// Native P2WPKH
    P2wpkh,
}

impl OutputType {
    pub fn db_value(self) -> u64 {
        match self {
            Self::P2shWpkh => 0,
            Self::ToLocal => 1,
            Self::HtlcOffer => 3,
            Self::HtlcRecv => 4,
            Self::OurChange => 5,
            Self::P2wpkh => 6,
        }
    }
}

impl TryFrom<u64> for OutputType {
    type Error = String;

    fn try_from(v: u64) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Self::P2shWpkh),
            1 => Ok(Self::ToLocal),
            3 => Ok(Self::HtlcOffer),
            4 => Ok(Self::HtlcRecv),
            5 => Ok(Self::OurChange),
            6 => Ok(Self::P2wpkh),
            _ => Err(format!("unknown output type: {}", v)),
        }
    }
}

/// Spending information for an output paid to us by a peer's unilateral close
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnilateralCloseInfo {
    pub channel_id: u64,
    pub peer_id: PublicKey,
    pub commitment_point: PublicKey,
}

/// A wallet-owned transaction output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utxo {
    pub outpoint: OutPoint,
    pub amount: Amount,
    /// BIP32 derivation index of the receiving key
    pub keyindex: u32,
    pub output_type: OutputType,
    pub status: OutputStatus,
    pub close_info: Option<UnilateralCloseInfo>,
    /// Height of the block that confirmed the output
    pub blockheight: Option<u32>,
    /// Height of the block that spent the output
    pub spendheight: Option<u32>,
    pub scriptpubkey: Option<ScriptBuf>,
}

impl Utxo {
    /// A new, unconfirmed, available output
    pub fn new(outpoint: OutPoint, amount: Amount, keyindex: u32, output_type: OutputType) -> Self {
        Self {
            outpoint,
            amount,
            keyindex,
            output_type,
            status: OutputStatus::Available,
            close_info: None,
            blockheight: None,
            spendheight: None,
            scriptpubkey: None,
        }
    }

    pub fn is_p2sh(&self) -> bool {
        self.output_type == OutputType::P2shWpkh
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_db_values() {
        for status in [
            OutputStatus::Available,
            OutputStatus::Reserved,
            OutputStatus::Spent,
        ] {
            assert_eq!(OutputStatus::try_from(status.db_value()), Ok(status));
        }
        assert!(OutputStatus::try_from(7).is_err());
        assert_eq!("reserved".parse::<OutputStatus>(), Ok(OutputStatus::Reserved));
    }

    #[test]
    fn test_output_type_gap() {
        assert!(OutputType::try_from(2).is_err());
        assert_eq!(OutputType::try_from(5), Ok(OutputType::OurChange));
    }
}
