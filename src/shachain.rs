//! Revocation Secret Compression
//!
//! Commitment secrets are derived from a single seed by flipping index bits
//! from the most significant down and hashing after each flip. A receiver
//! that learns secrets in decreasing index order only needs to keep the latest
//! secret for each count of trailing zero bits: every older secret can be
//! re-derived from one of those. That bounds storage to
//! `SHACHAIN_BITS + 1` slots no matter how many revocations a channel sees.

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::types::Secret;

/// Number of index bits used by commitment secret derivation
pub const SHACHAIN_BITS: u32 = 48;

/// Number of slots a chain can ever hold
pub const SHACHAIN_SLOTS: usize = SHACHAIN_BITS as usize + 1;

/// Largest index; the first secret ever received
pub const SHACHAIN_MAX_INDEX: u64 = (1 << SHACHAIN_BITS) - 1;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ShachainError {
    #[error("index {index} out of order (expected {expected})")]
    OutOfOrder { index: u64, expected: u64 },

    #[error("secret for index {0} does not derive previously known secrets")]
    Inconsistent(u64),

    #[error("index {0} out of range")]
    OutOfRange(u64),
}

/// One materialized secret
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KnownSecret {
    pub index: u64,
    pub hash: Secret,
}

/// Compressed store of received revocation secrets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shachain {
    pub min_index: u64,
    pub num_valid: u32,
    pub known: [KnownSecret; SHACHAIN_SLOTS],
}

impl Default for Shachain {
    fn default() -> Self {
        Self::new()
    }
}

/// Shachain index used for commitment number `commit_num`
pub fn shachain_index(commit_num: u64) -> u64 {
    SHACHAIN_MAX_INDEX - commit_num
}

/// Number of trailing zero bits, `SHACHAIN_BITS` for index 0
pub fn count_trailing_zeros(index: u64) -> u32 {
    if index == 0 {
        SHACHAIN_BITS
    } else {
        index.trailing_zeros()
    }
}

fn can_derive(from: u64, to: u64) -> bool {
    if from == 0 {
        return true;
    }
    let mask = !((1u64 << count_trailing_zeros(from)) - 1);
    (from ^ to) & mask == 0
}

fn derive(from: u64, to: u64, from_hash: &Secret) -> Secret {
    let branches = from ^ to;
    let mut hash = from_hash.0;
    for i in (0..SHACHAIN_BITS).rev() {
        if (branches >> i) & 1 == 1 {
            hash[(i / 8) as usize] ^= 1 << (i % 8);
            hash = Sha256::digest(hash).into();
        }
    }
    Secret(hash)
}

/// Secret for `index` generated from `seed`
pub fn shachain_from_seed(seed: &Secret, index: u64) -> Secret {
    derive(0, index, seed)
}

impl Shachain {
    pub fn new() -> Self {
        Self {
            min_index: 0,
            num_valid: 0,
            known: [KnownSecret::default(); SHACHAIN_SLOTS],
        }
    }

    /// Slot the secret for `index` would occupy
    pub fn slot_for(index: u64) -> usize {
        count_trailing_zeros(index) as usize
    }

    /// Add the next secret; must be called with strictly decreasing indices
    ///
    /// On error the chain is left untouched. Returns the slot written.
    pub fn add_hash(&mut self, index: u64, hash: &Secret) -> Result<usize, ShachainError> {
        if index > SHACHAIN_MAX_INDEX {
            return Err(ShachainError::OutOfRange(index));
        }
        let expected = if self.num_valid == 0 {
            SHACHAIN_MAX_INDEX
        } else {
            self.min_index.wrapping_sub(1)
        };
        if index != expected {
            return Err(ShachainError::OutOfOrder { index, expected });
        }

        let pos = Self::slot_for(index);
        for known in &self.known[..pos] {
            if derive(index, known.index, hash) != known.hash {
                return Err(ShachainError::Inconsistent(index));
            }
        }

        self.known[pos] = KnownSecret { index, hash: *hash };
        if pos as u32 + 1 > self.num_valid {
            self.num_valid = pos as u32 + 1;
        }
        self.min_index = index;
        Ok(pos)
    }

    /// Recover the secret for any index we have already been given
    pub fn get_hash(&self, index: u64) -> Option<Secret> {
        if self.num_valid == 0 || index < self.min_index {
            return None;
        }
        self.known[..self.num_valid as usize]
            .iter()
            .find(|known| can_derive(known.index, index))
            .map(|known| derive(known.index, index, &known.hash))
    }

    /// Materialized slots
    pub fn valid(&self) -> &[KnownSecret] {
        &self.known[..self.num_valid as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed() -> Secret {
        Secret([0x42; 32])
    }

    #[test]
    fn test_bolt3_generate_from_seed() {
        // BOLT #3 test vectors
        let zero = Secret([0u8; 32]);
        assert_eq!(
            shachain_from_seed(&zero, 281474976710655).to_string(),
            "02a40c85b6f28da08dfdbe0926c53fab2de6d28c10301f8f7c4073d5e42e3148"
        );
        let ff = Secret([0xff; 32]);
        assert_eq!(
            shachain_from_seed(&ff, 281474976710655).to_string(),
            "7cc854b54e3e0dcdb010d7a3fee464a9687be6e8db3be6854c475621e007a5dc"
        );
        assert_eq!(
            shachain_from_seed(&ff, 0xaaaaaaaaaaa).to_string(),
            "56f4008fb007ca9acf0e15b054d5c9fd12ee06cea347914ddbaed70d1c13a528"
        );
    }

    #[test]
    fn test_add_in_order_and_rederive() {
        let mut chain = Shachain::new();
        for n in 0..1000u64 {
            let index = shachain_index(n);
            let secret = shachain_from_seed(&seed(), index);
            chain.add_hash(index, &secret).unwrap();
            assert!(chain.num_valid as usize <= SHACHAIN_SLOTS);
        }
        for n in 0..1000u64 {
            let index = shachain_index(n);
            assert_eq!(chain.get_hash(index), Some(shachain_from_seed(&seed(), index)));
        }
        assert_eq!(chain.get_hash(shachain_index(1000)), None);
    }

    #[test]
    fn test_rejects_out_of_order() {
        let mut chain = Shachain::new();
        let first = shachain_index(0);
        chain.add_hash(first, &shachain_from_seed(&seed(), first)).unwrap();

        let skipped = shachain_index(2);
        let before = chain.clone();
        let err = chain
            .add_hash(skipped, &shachain_from_seed(&seed(), skipped))
            .unwrap_err();
        assert!(matches!(err, ShachainError::OutOfOrder { .. }));
        assert_eq!(chain, before);
    }

    #[test]
    fn test_rejects_inconsistent_secret() {
        let mut chain = Shachain::new();
        let first = shachain_index(0);
        chain.add_hash(first, &shachain_from_seed(&seed(), first)).unwrap();

        // Index ...110 sits in slot 1 and must derive slot 0
        let second = shachain_index(1);
        let before = chain.clone();
        let bogus = Secret([0x13; 32]);
        assert_eq!(
            chain.add_hash(second, &bogus),
            Err(ShachainError::Inconsistent(second))
        );
        assert_eq!(chain, before);
    }

    #[test]
    fn test_trailing_zeros() {
        assert_eq!(count_trailing_zeros(0), SHACHAIN_BITS);
        assert_eq!(count_trailing_zeros(1), 0);
        assert_eq!(count_trailing_zeros(8), 3);
        assert_eq!(Shachain::slot_for(SHACHAIN_MAX_INDEX), 0);
    }
}
