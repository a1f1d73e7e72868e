//! Amount Types and Fee Arithmetic
//!
//! On-chain values use `bitcoin::Amount`; channel balances and HTLCs are
//! denominated in millisatoshi.

use bitcoin::Amount;
use serde::{Deserialize, Serialize};

/// Millisatoshis per satoshi
pub const MSAT_PER_SAT: u64 = 1000;

/// An amount in millisatoshi
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct AmountMsat(pub u64);

impl AmountMsat {
    pub const ZERO: AmountMsat = AmountMsat(0);

    pub fn from_msat(msat: u64) -> Self {
        Self(msat)
    }

    /// Lossless conversion from satoshi, `None` on overflow
    pub fn from_sat(amount: Amount) -> Option<Self> {
        amount.to_sat().checked_mul(MSAT_PER_SAT).map(Self)
    }

    pub fn msat(&self) -> u64 {
        self.0
    }

    pub fn checked_add(self, other: AmountMsat) -> Option<AmountMsat> {
        self.0.checked_add(other.0).map(AmountMsat)
    }

    pub fn checked_sub(self, other: AmountMsat) -> Option<AmountMsat> {
        self.0.checked_sub(other.0).map(AmountMsat)
    }
}

impl std::fmt::Display for AmountMsat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}msat", self.0)
    }
}

/// Fee for a transaction of `weight` weight units at `feerate_per_kw`
pub fn amount_tx_fee(feerate_per_kw: u32, weight: u64) -> Amount {
    Amount::from_sat(u64::from(feerate_per_kw).saturating_mul(weight) / 1000)
}

/// Convert satoshis to human-readable string
/// e.g., 100000 -> "100,000 sats"
pub fn sats_to_display(amount: Amount) -> String {
    format!("{} sats", format_with_commas(amount.to_sat()))
}

/// Format number with thousands separators
fn format_with_commas(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::new();
    let chars: Vec<char> = s.chars().collect();

    for (i, c) in chars.iter().enumerate() {
        if i > 0 && (chars.len() - i) % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_msat_arithmetic() {
        let a = AmountMsat::from_msat(50_000);
        let b = AmountMsat::from_msat(49_000);
        assert_eq!(a.checked_sub(b), Some(AmountMsat(1_000)));
        assert_eq!(b.checked_sub(a), None);
        assert_eq!(AmountMsat(u64::MAX).checked_add(AmountMsat(1)), None);
        assert_eq!(
            AmountMsat::from_sat(Amount::from_sat(21)),
            Some(AmountMsat(21_000))
        );
    }

    #[test]
    fn test_tx_fee() {
        assert_eq!(amount_tx_fee(1000, 712), Amount::from_sat(712));
        assert_eq!(amount_tx_fee(253, 1000), Amount::from_sat(253));
        assert_eq!(amount_tx_fee(0, 5000), Amount::ZERO);
    }

    #[test]
    fn test_sats_display() {
        assert_eq!(sats_to_display(Amount::from_sat(100_000)), "100,000 sats");
        assert_eq!(sats_to_display(Amount::from_sat(999)), "999 sats");
    }
}
