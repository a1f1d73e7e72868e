//! Prepared Statements
//!
//! Every SQL statement the engine runs is a [`Query`] registered as a static,
//! with a stable name, a placeholder count and a read-only flag. A
//! [`Statement`] binds values to a query's placeholders and is consumed by
//! exactly one of [`Statement::exec`] (writes) or [`Statement::query`] (reads).
//! Query results are materialized into owned [`Row`]s whose typed accessors
//! check the stored length of fixed-size values.

use std::panic::Location;

use bitcoin::consensus::encode;
use bitcoin::hashes::Hash;
use bitcoin::{Amount, BlockHash, Script, ScriptBuf, Transaction, Txid};
use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use secp256k1::ecdsa::Signature;
use secp256k1::PublicKey;

use super::{Db, DbError};
use crate::types::{AmountMsat, PaymentHash, Preimage, Secret, ShortChannelId};

/// Length of a compressed public key
pub const PUBKEY_LEN: usize = 33;
/// Length of a compact ECDSA signature
pub const SIGNATURE_LEN: usize = 64;
/// Length of a SHA256 hash, preimage or secret
pub const HASH_LEN: usize = 32;

// ============================================================================
// Query registry
// ============================================================================

/// A fixed SQL statement
#[derive(Debug)]
pub struct Query {
    /// Stable key used in logs and fatal messages
    pub name: &'static str,
    pub sql: &'static str,
    /// Number of `?` placeholders in `sql`
    pub placeholders: usize,
    pub readonly: bool,
}

impl Query {
    /// A query that only reads
    pub const fn read(name: &'static str, sql: &'static str) -> Self {
        Self {
            name,
            sql,
            placeholders: count_placeholders(sql),
            readonly: true,
        }
    }

    /// A query that modifies the store
    pub const fn write(name: &'static str, sql: &'static str) -> Self {
        Self {
            name,
            sql,
            placeholders: count_placeholders(sql),
            readonly: false,
        }
    }
}

const fn count_placeholders(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut quoted = false;
    let mut count = 0;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\'' {
            quoted = !quoted;
        } else if bytes[i] == b'?' && !quoted {
            count += 1;
        }
        i += 1;
    }
    count
}

// ============================================================================
// Bindings
// ============================================================================

/// Value bound to one placeholder
#[derive(Debug, Clone, PartialEq)]
pub enum Binding {
    Uninitialized,
    Null,
    Int(i32),
    U64(u64),
    Blob(Vec<u8>),
    Text(String),
}

impl Binding {
    fn to_value(&self) -> Option<Value> {
        match self {
            Binding::Uninitialized => None,
            Binding::Null => Some(Value::Null),
            Binding::Int(v) => Some(Value::Integer(i64::from(*v))),
            // SQLite integers are signed; values above i64::MAX wrap and read back identically
            Binding::U64(v) => Some(Value::Integer(*v as i64)),
            Binding::Blob(v) => Some(Value::Blob(v.clone())),
            Binding::Text(v) => Some(Value::Text(v.clone())),
        }
    }
}

/// Outcome of a write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Executed {
    /// Rows changed by the statement
    pub changes: usize,
    pub last_insert_id: u64,
}

/// A statement being bound, owned by the open transaction
pub struct Statement<'db> {
    db: &'db Db,
    query: &'static Query,
    bindings: Vec<Binding>,
    id: u64,
}

impl<'db> Statement<'db> {
    pub(super) fn new(db: &'db Db, query: &'static Query, location: &'static Location<'static>) -> Self {
        let id = db.register_statement(query.name, location);
        Self {
            db,
            query,
            bindings: vec![Binding::Uninitialized; query.placeholders],
            id,
        }
    }

    pub fn name(&self) -> &'static str {
        self.query.name
    }

    fn bind(&mut self, pos: usize, binding: Binding) {
        if pos >= self.bindings.len() {
            crate::fatal!(
                "{}: binding position {} out of range ({} placeholders)",
                self.query.name,
                pos,
                self.bindings.len()
            );
        }
        self.bindings[pos] = binding;
    }

    pub fn bind_null(&mut self, pos: usize) {
        self.bind(pos, Binding::Null);
    }

    pub fn bind_int(&mut self, pos: usize, val: i32) {
        self.bind(pos, Binding::Int(val));
    }

    pub fn bind_u64(&mut self, pos: usize, val: u64) {
        self.bind(pos, Binding::U64(val));
    }

    pub fn bind_blob(&mut self, pos: usize, val: &[u8]) {
        self.bind(pos, Binding::Blob(val.to_vec()));
    }

    pub fn bind_text(&mut self, pos: usize, val: &str) {
        self.bind(pos, Binding::Text(val.to_string()));
    }

    /// Bind `val` with `bind`, or NULL when absent
    pub fn bind_optional<T>(&mut self, pos: usize, val: Option<T>, bind: impl FnOnce(&mut Self, usize, T)) {
        match val {
            Some(v) => bind(self, pos, v),
            None => self.bind_null(pos),
        }
    }

    pub fn bind_txid(&mut self, pos: usize, txid: &Txid) {
        self.bind_blob(pos, txid.as_byte_array());
    }

    pub fn bind_block_hash(&mut self, pos: usize, hash: &BlockHash) {
        self.bind_blob(pos, hash.as_byte_array());
    }

    pub fn bind_sha256(&mut self, pos: usize, hash: &PaymentHash) {
        self.bind_blob(pos, hash.as_bytes());
    }

    pub fn bind_preimage(&mut self, pos: usize, preimage: &Preimage) {
        self.bind_blob(pos, preimage.as_bytes());
    }

    pub fn bind_secret(&mut self, pos: usize, secret: &Secret) {
        self.bind_blob(pos, secret.as_bytes());
    }

    pub fn bind_pubkey(&mut self, pos: usize, key: &PublicKey) {
        self.bind_blob(pos, &key.serialize());
    }

    pub fn bind_signature(&mut self, pos: usize, sig: &Signature) {
        self.bind_blob(pos, &sig.serialize_compact());
    }

    pub fn bind_amount_sat(&mut self, pos: usize, amount: Amount) {
        self.bind_u64(pos, amount.to_sat());
    }

    pub fn bind_amount_msat(&mut self, pos: usize, amount: AmountMsat) {
        self.bind_u64(pos, amount.msat());
    }

    /// Absolute time, stored as nanoseconds since the epoch
    pub fn bind_timeabs(&mut self, pos: usize, time: DateTime<Utc>) {
        let nanos = time.timestamp_nanos_opt().unwrap_or(i64::MAX).max(0);
        self.bind_u64(pos, nanos as u64);
    }

    pub fn bind_tx(&mut self, pos: usize, tx: &Transaction) {
        self.bind_blob(pos, &encode::serialize(tx));
    }

    pub fn bind_script(&mut self, pos: usize, script: &Script) {
        self.bind_blob(pos, script.as_bytes());
    }

    /// Short channel ids are stored in their `BxTxO` text form
    pub fn bind_short_channel_id(&mut self, pos: usize, scid: &ShortChannelId) {
        self.bind_text(pos, &scid.to_string());
    }

    pub fn bind_secret_arr(&mut self, pos: usize, secrets: &[Secret]) {
        let blob: Vec<u8> = secrets.iter().flat_map(|s| s.0).collect();
        self.bind_blob(pos, &blob);
    }

    pub fn bind_pubkey_arr(&mut self, pos: usize, keys: &[PublicKey]) {
        let blob: Vec<u8> = keys.iter().flat_map(|k| k.serialize()).collect();
        self.bind_blob(pos, &blob);
    }

    pub fn bind_short_channel_id_arr(&mut self, pos: usize, scids: &[ShortChannelId]) {
        let blob: Vec<u8> = scids.iter().flat_map(|s| s.0.to_be_bytes()).collect();
        self.bind_blob(pos, &blob);
    }

    fn values(&self) -> Vec<Value> {
        self.bindings
            .iter()
            .enumerate()
            .map(|(i, b)| match b.to_value() {
                Some(v) => v,
                None => crate::fatal!("{}: placeholder {} was never bound", self.query.name, i),
            })
            .collect()
    }

    /// Run a write statement
    ///
    /// # Panics
    ///
    /// If the query was registered read-only or a placeholder is unbound.
    pub fn exec(self) -> Result<Executed, DbError> {
        if self.query.readonly {
            crate::fatal!("{}: read-only query passed to exec", self.query.name);
        }
        let values = self.values();
        let name = self.query.name;

        let (changes, last_insert_id, expanded) = self
            .db
            .with_conn(|conn| {
                let mut stmt = conn.prepare_cached(self.query.sql)?;
                for (i, value) in values.iter().enumerate() {
                    stmt.raw_bind_parameter(i + 1, value)?;
                }
                let expanded = stmt.expanded_sql();
                let changes = stmt.raw_execute()?;
                Ok((changes, conn.last_insert_rowid(), expanded))
            })
            .map_err(|e| match e {
                DbError::Database(rusqlite::Error::SqliteFailure(ref err, _))
                    if err.extended_code == 1555 || err.extended_code == 2067 =>
                {
                    DbError::Duplicate(name.to_string())
                }
                other => other,
            })?;

        self.db
            .record_change(expanded.unwrap_or_else(|| self.query.sql.to_string()));
        tracing::trace!(target: "chanstore::db", query = name, changes, "executed");

        Ok(Executed {
            changes,
            last_insert_id: last_insert_id as u64,
        })
    }

    /// Run a read statement, collecting every row
    ///
    /// # Panics
    ///
    /// If the query was not registered read-only or a placeholder is unbound.
    pub fn query(self) -> Result<Rows, DbError> {
        if !self.query.readonly {
            crate::fatal!("{}: write query passed to query", self.query.name);
        }
        let values = self.values();
        let name = self.query.name;

        let rows = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(self.query.sql)?;
            for (i, value) in values.iter().enumerate() {
                stmt.raw_bind_parameter(i + 1, value)?;
            }
            let ncols = stmt.column_count();
            let mut raw = stmt.raw_query();
            let mut rows = Vec::new();
            while let Some(row) = raw.next()? {
                let mut cols = Vec::with_capacity(ncols);
                for i in 0..ncols {
                    cols.push(row.get::<_, Value>(i)?);
                }
                rows.push(Row { query: name, cols });
            }
            Ok(rows)
        })?;

        Ok(Rows {
            rows: rows.into_iter(),
        })
    }
}

impl Drop for Statement<'_> {
    fn drop(&mut self) {
        self.db.unregister_statement(self.id);
    }
}

// ============================================================================
// Rows
// ============================================================================

/// Result rows of a read query
#[derive(Debug)]
pub struct Rows {
    rows: std::vec::IntoIter<Row>,
}

impl Rows {
    /// First row, if any
    pub fn single(mut self) -> Option<Row> {
        self.rows.next()
    }
}

impl Iterator for Rows {
    type Item = Row;

    fn next(&mut self) -> Option<Row> {
        self.rows.next()
    }
}

/// One materialized result row
#[derive(Debug, Clone)]
pub struct Row {
    query: &'static str,
    cols: Vec<Value>,
}

impl Row {
    fn col(&self, col: usize) -> &Value {
        match self.cols.get(col) {
            Some(v) => v,
            None => crate::fatal!("{}: column {} out of range", self.query, col),
        }
    }

    fn corrupt(&self, col: usize, what: impl std::fmt::Display) -> DbError {
        DbError::Corrupt(format!("{} column {}: {}", self.query, col, what))
    }

    fn decode(&self, col: usize, what: impl std::fmt::Display) -> DbError {
        DbError::Decode(format!("{} column {}: {}", self.query, col, what))
    }

    pub fn is_null(&self, col: usize) -> bool {
        matches!(self.col(col), Value::Null)
    }

    /// Integer column; NULL reads as 0
    pub fn column_u64(&self, col: usize) -> u64 {
        match self.col(col) {
            Value::Integer(v) => *v as u64,
            Value::Real(v) => *v as u64,
            _ => 0,
        }
    }

    pub fn column_int(&self, col: usize) -> i32 {
        match self.col(col) {
            Value::Integer(v) => *v as i32,
            Value::Real(v) => *v as i32,
            _ => 0,
        }
    }

    /// Integer column read as a signed value
    pub fn column_i64(&self, col: usize) -> i64 {
        match self.col(col) {
            Value::Integer(v) => *v,
            Value::Real(v) => *v as i64,
            _ => 0,
        }
    }

    pub fn column_blob(&self, col: usize) -> Option<&[u8]> {
        match self.col(col) {
            Value::Blob(v) => Some(v),
            Value::Text(v) => Some(v.as_bytes()),
            _ => None,
        }
    }

    pub fn column_text(&self, col: usize) -> Option<&str> {
        match self.col(col) {
            Value::Text(v) => Some(v),
            _ => None,
        }
    }

    /// Exactly `N` bytes; any other length is corruption
    pub fn column_fixed<const N: usize>(&self, col: usize) -> Result<[u8; N], DbError> {
        let blob = self.column_blob(col).unwrap_or_default();
        blob.try_into()
            .map_err(|_| self.corrupt(col, format!("expected {} bytes, found {}", N, blob.len())))
    }

    /// Apply `f` unless the column is NULL
    pub fn column_optional<T>(
        &self,
        col: usize,
        f: impl FnOnce(&Self, usize) -> Result<T, DbError>,
    ) -> Result<Option<T>, DbError> {
        if self.is_null(col) {
            Ok(None)
        } else {
            f(self, col).map(Some)
        }
    }

    pub fn column_txid(&self, col: usize) -> Result<Txid, DbError> {
        self.column_fixed::<HASH_LEN>(col).map(Txid::from_byte_array)
    }

    pub fn column_block_hash(&self, col: usize) -> Result<BlockHash, DbError> {
        self.column_fixed::<HASH_LEN>(col).map(BlockHash::from_byte_array)
    }

    pub fn column_sha256(&self, col: usize) -> Result<PaymentHash, DbError> {
        self.column_fixed::<HASH_LEN>(col).map(PaymentHash)
    }

    pub fn column_preimage(&self, col: usize) -> Result<Preimage, DbError> {
        self.column_fixed::<HASH_LEN>(col).map(Preimage)
    }

    pub fn column_secret(&self, col: usize) -> Result<Secret, DbError> {
        self.column_fixed::<HASH_LEN>(col).map(Secret)
    }

    /// Compressed public key; a wrong length is corruption, an invalid point is not
    pub fn column_pubkey(&self, col: usize) -> Result<PublicKey, DbError> {
        let bytes = self.column_fixed::<PUBKEY_LEN>(col)?;
        PublicKey::from_slice(&bytes).map_err(|e| self.decode(col, e))
    }

    pub fn column_signature(&self, col: usize) -> Result<Signature, DbError> {
        let bytes = self.column_fixed::<SIGNATURE_LEN>(col)?;
        Signature::from_compact(&bytes).map_err(|e| self.decode(col, e))
    }

    pub fn column_amount_sat(&self, col: usize) -> Amount {
        Amount::from_sat(self.column_u64(col))
    }

    pub fn column_amount_msat(&self, col: usize) -> AmountMsat {
        AmountMsat(self.column_u64(col))
    }

    pub fn column_timeabs(&self, col: usize) -> DateTime<Utc> {
        DateTime::from_timestamp_nanos(self.column_i64(col))
    }

    pub fn column_tx(&self, col: usize) -> Result<Transaction, DbError> {
        let blob = self.column_blob(col).unwrap_or_default();
        encode::deserialize(blob).map_err(|e| self.decode(col, e))
    }

    pub fn column_script(&self, col: usize) -> Option<ScriptBuf> {
        self.column_blob(col).map(|b| ScriptBuf::from_bytes(b.to_vec()))
    }

    pub fn column_short_channel_id(&self, col: usize) -> Result<ShortChannelId, DbError> {
        let text = self.column_text(col).unwrap_or_default();
        text.parse().map_err(|e: String| self.decode(col, e))
    }

    fn column_arr<const N: usize>(&self, col: usize) -> Result<Vec<[u8; N]>, DbError> {
        let blob = self.column_blob(col).unwrap_or_default();
        if blob.len() % N != 0 {
            return Err(self.corrupt(
                col,
                format!("array length {} not a multiple of {}", blob.len(), N),
            ));
        }
        Ok(blob
            .chunks_exact(N)
            .map(|c| {
                let mut elem = [0u8; N];
                elem.copy_from_slice(c);
                elem
            })
            .collect())
    }

    pub fn column_secret_arr(&self, col: usize) -> Result<Vec<Secret>, DbError> {
        Ok(self.column_arr::<HASH_LEN>(col)?.into_iter().map(Secret).collect())
    }

    pub fn column_pubkey_arr(&self, col: usize) -> Result<Vec<PublicKey>, DbError> {
        self.column_arr::<PUBKEY_LEN>(col)?
            .iter()
            .map(|k| PublicKey::from_slice(k).map_err(|e| self.decode(col, e)))
            .collect()
    }

    pub fn column_short_channel_id_arr(&self, col: usize) -> Result<Vec<ShortChannelId>, DbError> {
        Ok(self
            .column_arr::<8>(col)?
            .into_iter()
            .map(|b| ShortChannelId(u64::from_be_bytes(b)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static SCRATCH_CREATE: Query = Query::write(
        "test_scratch_create",
        "CREATE TABLE scratch (id INTEGER PRIMARY KEY, a BLOB, b TEXT, c INTEGER)",
    );
    static SCRATCH_INSERT: Query =
        Query::write("test_scratch_insert", "INSERT INTO scratch (a, b, c) VALUES (?, ?, ?)");
    static SCRATCH_SELECT: Query =
        Query::read("test_scratch_select", "SELECT a, b, c FROM scratch WHERE id = ?");

    fn db_with_scratch() -> Db {
        let db = Db::in_memory().unwrap();
        db.begin().unwrap();
        db.prepare(&SCRATCH_CREATE).exec().unwrap();
        db.commit().unwrap();
        db
    }

    #[test]
    fn test_placeholder_count() {
        assert_eq!(SCRATCH_INSERT.placeholders, 3);
        assert_eq!(SCRATCH_SELECT.placeholders, 1);
        assert_eq!(count_placeholders("SELECT '?' FROM t WHERE a = ?"), 1);
        assert!(SCRATCH_SELECT.readonly);
        assert!(!SCRATCH_INSERT.readonly);
    }

    #[test]
    fn test_bind_and_read_back() {
        let db = db_with_scratch();
        db.begin().unwrap();
        let mut stmt = db.prepare(&SCRATCH_INSERT);
        stmt.bind_blob(0, &[7u8; 33]);
        stmt.bind_text(1, "600000x1x0");
        stmt.bind_u64(2, u64::MAX);
        let done = stmt.exec().unwrap();
        assert_eq!(done.changes, 1);

        let mut stmt = db.prepare(&SCRATCH_SELECT);
        stmt.bind_u64(0, done.last_insert_id);
        let row = stmt.query().unwrap().single().unwrap();
        db.commit().unwrap();

        assert_eq!(row.column_fixed::<33>(0).unwrap(), [7u8; 33]);
        assert_eq!(row.column_u64(2), u64::MAX);
        assert_eq!(
            row.column_short_channel_id(1).unwrap(),
            ShortChannelId::new(600_000, 1, 0).unwrap()
        );
    }

    #[test]
    fn test_fixed_length_mismatch_is_corruption() {
        let db = db_with_scratch();
        db.begin().unwrap();
        let mut stmt = db.prepare(&SCRATCH_INSERT);
        stmt.bind_blob(0, &[1u8; 31]);
        stmt.bind_null(1);
        stmt.bind_int(2, 0);
        let id = stmt.exec().unwrap().last_insert_id;

        let mut stmt = db.prepare(&SCRATCH_SELECT);
        stmt.bind_u64(0, id);
        let row = stmt.query().unwrap().single().unwrap();
        db.commit().unwrap();

        let err = row.column_sha256(0).unwrap_err();
        assert!(matches!(err, DbError::Corrupt(_)));
        assert!(err.is_fatal());
        assert!(matches!(row.column_secret_arr(0), Err(DbError::Corrupt(_))));
        assert!(row.column_text(1).is_none());
        assert!(row.is_null(1));
    }

    #[test]
    fn test_invalid_pubkey_is_recoverable() {
        let db = db_with_scratch();
        db.begin().unwrap();
        let mut stmt = db.prepare(&SCRATCH_INSERT);
        stmt.bind_blob(0, &[0u8; 33]);
        stmt.bind_null(1);
        stmt.bind_null(2);
        let id = stmt.exec().unwrap().last_insert_id;
        let mut stmt = db.prepare(&SCRATCH_SELECT);
        stmt.bind_u64(0, id);
        let row = stmt.query().unwrap().single().unwrap();
        db.commit().unwrap();

        let err = row.column_pubkey(0).unwrap_err();
        assert!(matches!(err, DbError::Decode(_)));
        assert!(!err.is_fatal());
        assert_eq!(row.column_u64(2), 0);
    }

    #[test]
    #[should_panic(expected = "never bound")]
    fn test_unbound_placeholder_panics() {
        let db = db_with_scratch();
        db.begin().unwrap();
        let mut stmt = db.prepare(&SCRATCH_INSERT);
        stmt.bind_int(0, 1);
        let _ = stmt.exec();
    }

    #[test]
    #[should_panic(expected = "read-only query passed to exec")]
    fn test_readonly_exec_panics() {
        let db = db_with_scratch();
        db.begin().unwrap();
        let mut stmt = db.prepare(&SCRATCH_SELECT);
        stmt.bind_u64(0, 1);
        let _ = stmt.exec();
    }

    #[test]
    #[should_panic(expected = "write query passed to query")]
    fn test_write_query_panics() {
        let db = db_with_scratch();
        db.begin().unwrap();
        let mut stmt = db.prepare(&SCRATCH_INSERT);
        stmt.bind_null(0);
        stmt.bind_null(1);
        stmt.bind_null(2);
        let _ = stmt.query();
    }
}
