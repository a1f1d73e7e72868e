//! Fixed-size secrets, hashes and channel identifiers

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

macro_rules! hash_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
        pub struct $name(pub [u8; 32]);

        impl $name {
            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", hex::encode(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), hex::encode(self.0))
            }
        }

        impl From<[u8; 32]> for $name {
            fn from(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }
        }
    };
}

hash_newtype!(
    /// SHA256 of a payment preimage
    PaymentHash
);
hash_newtype!(
    /// Payment preimage revealed on fulfillment
    Preimage
);
hash_newtype!(
    /// 32-byte secret: revocation secrets, onion shared secrets
    Secret
);

impl Preimage {
    /// The payment hash this preimage unlocks
    pub fn payment_hash(&self) -> PaymentHash {
        PaymentHash(Sha256::digest(self.0).into())
    }
}

/// Block height, transaction index and output index packed into 64 bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ShortChannelId(pub u64);

impl ShortChannelId {
    /// `None` if a component does not fit its field
    pub fn new(blocknum: u32, txnum: u32, outnum: u16) -> Option<Self> {
        if blocknum >= 1 << 24 || txnum >= 1 << 24 {
            return None;
        }
        Some(Self(
            (u64::from(blocknum) << 40) | (u64::from(txnum) << 16) | u64::from(outnum),
        ))
    }

    pub fn block_height(&self) -> u32 {
        (self.0 >> 40) as u32
    }

    pub fn tx_index(&self) -> u32 {
        ((self.0 >> 16) & 0xFF_FFFF) as u32
    }

    pub fn output_index(&self) -> u16 {
        (self.0 & 0xFFFF) as u16
    }
}

impl fmt::Display for ShortChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{}x{}",
            self.block_height(),
            self.tx_index(),
            self.output_index()
        )
    }
}

impl FromStr for ShortChannelId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(&['x', ':'][..]).collect();
        if parts.len() != 3 {
            return Err(format!("invalid short channel id: {}", s));
        }
        let block = parts[0].parse().map_err(|_| format!("invalid block in {}", s))?;
        let tx = parts[1].parse().map_err(|_| format!("invalid tx index in {}", s))?;
        let out = parts[2].parse().map_err(|_| format!("invalid output in {}", s))?;
        ShortChannelId::new(block, tx, out).ok_or_else(|| format!("out of range: {}", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preimage_hash() {
        // sha256 of 32 zero bytes
        let hash = Preimage([0u8; 32]).payment_hash();
        assert_eq!(
            hash.to_string(),
            "66687aadf862bd776c8fc18b8e9f8e20089714856ee233b3902a591d0d5f2925"
        );
    }

    #[test]
    fn test_short_channel_id() {
        let scid = ShortChannelId::new(600_000, 1_234, 1).unwrap();
        assert_eq!(scid.to_string(), "600000x1234x1");
        assert_eq!("600000x1234x1".parse::<ShortChannelId>().unwrap(), scid);
        assert_eq!("600000:1234:1".parse::<ShortChannelId>().unwrap(), scid);
        assert!("600000x1234".parse::<ShortChannelId>().is_err());
        assert!(ShortChannelId::new(1 << 24, 0, 0).is_none());
    }
}
