//! Remote revocation chains, one per channel

use super::{Wallet, WalletError};
use crate::db::Query;
use crate::shachain::{KnownSecret, Shachain, SHACHAIN_SLOTS};
use crate::types::{Secret, WalletShachain};

static SHACHAIN_INSERT: Query = Query::write(
    "shachains_insert",
    "INSERT INTO shachains (min_index, num_valid) VALUES (?, 0)",
);
static SHACHAIN_UPDATE: Query = Query::write(
    "shachains_update",
    "UPDATE shachains SET num_valid = ?, min_index = ? WHERE id = ?",
);
static SHACHAIN_KNOWN_UPSERT: Query = Query::write(
    "shachain_known_upsert",
    "INSERT OR REPLACE INTO shachain_known (shachain_id, pos, idx, hash) VALUES (?, ?, ?, ?)",
);
static SHACHAIN_GET: Query = Query::read(
    "shachains_get",
    "SELECT min_index, num_valid FROM shachains WHERE id = ?",
);
static SHACHAIN_KNOWN_GET: Query = Query::read(
    "shachain_known_get",
    "SELECT pos, idx, hash FROM shachain_known WHERE shachain_id = ?",
);
static SHACHAIN_KNOWN_COUNT: Query = Query::read(
    "shachain_known_count",
    "SELECT COUNT(*) FROM shachain_known WHERE shachain_id = ?",
);

impl Wallet {
    /// Create an empty chain row
    pub fn shachain_init(&self) -> Result<WalletShachain, WalletError> {
        let chain = Shachain::new();
        let mut stmt = self.db.prepare(&SHACHAIN_INSERT);
        stmt.bind_u64(0, chain.min_index);
        let id = stmt.exec()?.last_insert_id;
        Ok(WalletShachain { id, chain })
    }

    /// Add the next revocation secret and persist the slot it lands in
    ///
    /// A secret that does not derive the ones already known is rejected,
    /// and on any error `wallet_chain` is left as it was.
    pub fn shachain_add_hash(
        &self,
        wallet_chain: &mut WalletShachain,
        index: u64,
        hash: &Secret,
    ) -> Result<(), WalletError> {
        let mut chain = wallet_chain.chain.clone();
        let pos = chain
            .add_hash(index, hash)
            .map_err(|e| WalletError::InvalidData(e.to_string()))?;

        let mut stmt = self.db.prepare(&SHACHAIN_UPDATE);
        stmt.bind_u64(0, u64::from(chain.num_valid));
        stmt.bind_u64(1, index);
        stmt.bind_u64(2, wallet_chain.id);
        if stmt.exec()?.changes == 0 {
            return Err(WalletError::NotFound(format!("shachain {}", wallet_chain.id)));
        }

        let mut stmt = self.db.prepare(&SHACHAIN_KNOWN_UPSERT);
        stmt.bind_u64(0, wallet_chain.id);
        stmt.bind_u64(1, pos as u64);
        stmt.bind_u64(2, index);
        stmt.bind_secret(3, hash);
        stmt.exec()?;

        wallet_chain.chain = chain;
        Ok(())
    }

    /// Rebuild a chain from its summary and slot rows
    pub fn shachain_load(&self, id: u64) -> Result<WalletShachain, WalletError> {
        let mut stmt = self.db.prepare(&SHACHAIN_GET);
        stmt.bind_u64(0, id);
        let row = stmt
            .query()?
            .single()
            .ok_or_else(|| WalletError::NotFound(format!("shachain {}", id)))?;

        let mut chain = Shachain::new();
        chain.min_index = row.column_u64(0);
        chain.num_valid = row.column_u64(1) as u32;
        if chain.num_valid as usize > SHACHAIN_SLOTS {
            return Err(WalletError::InvalidData(format!(
                "shachain {} has {} valid slots",
                id, chain.num_valid
            )));
        }

        let mut stmt = self.db.prepare(&SHACHAIN_KNOWN_GET);
        stmt.bind_u64(0, id);
        for row in stmt.query()? {
            let pos = row.column_u64(0) as usize;
            if pos >= SHACHAIN_SLOTS {
                return Err(WalletError::InvalidData(format!(
                    "shachain {} slot {} out of range",
                    id, pos
                )));
            }
            chain.known[pos] = KnownSecret {
                index: row.column_u64(1),
                hash: row.column_secret(2)?,
            };
        }
        Ok(WalletShachain { id, chain })
    }

    /// Number of stored slot rows of a chain
    pub fn shachain_slot_count(&self, id: u64) -> Result<u64, WalletError> {
        let mut stmt = self.db.prepare(&SHACHAIN_KNOWN_COUNT);
        stmt.bind_u64(0, id);
        Ok(stmt.query()?.single().map(|r| r.column_u64(0)).unwrap_or(0))
    }
}
