//! SQLite Store Handle and Transaction Manager
//!
//! A [`Db`] owns the connection pool of one database file. All statements run
//! inside an explicit transaction opened with [`Db::begin`] and closed with
//! [`Db::commit`]; nesting is a programming error. Every write executed in a
//! transaction is appended, fully expanded, to a changelog that is handed to
//! the registered change hook right before the transaction commits.
//!
//! The handle is single-threaded: it is `!Sync`, and exactly one logical
//! owner drives transactions sequentially.

pub mod migrations;
pub mod statement;
pub mod vars;

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::panic::Location;
use std::path::Path;

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use thiserror::Error;

pub use migrations::{migrate, Migration, MigrationContext, MigrationOutcome};
pub use statement::{Binding, Executed, Query, Row, Rows, Statement};

/// Pragmas run on every fresh connection, outside of any transaction
const SETUP_PRAGMAS: &[&str] = &["PRAGMA foreign_keys = ON;"];

/// SQLite database errors
#[derive(Debug, Error)]
pub enum DbError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Duplicate record: {0}")]
    Duplicate(String),

    #[error("Refusing to migrate down from version {current} to {available}")]
    Downgrade { current: i64, available: i64 },

    #[error("Corrupt column: {0}")]
    Corrupt(String),

    #[error("Undecodable column: {0}")]
    Decode(String),

    #[error("Migration error: {0}")]
    Migration(String),
}

impl DbError {
    /// Whether the node must abort on this error
    pub fn is_fatal(&self) -> bool {
        !matches!(self, DbError::Duplicate(_) | DbError::Decode(_))
    }
}

/// Receives the changelog of a transaction and whether it was closed by a commit
pub type ChangeHook = dyn Fn(&[String], bool);

struct PendingStatement {
    name: &'static str,
    location: &'static Location<'static>,
}

/// Exclusive handle on the node's database
pub struct Db {
    pool: Pool<SqliteConnectionManager>,
    conn: RefCell<Option<PooledConnection<SqliteConnectionManager>>>,
    in_transaction: Cell<Option<&'static Location<'static>>>,
    changes: RefCell<Option<Vec<String>>>,
    pending: RefCell<BTreeMap<u64, PendingStatement>>,
    next_statement_id: Cell<u64>,
    hook: RefCell<Option<Box<ChangeHook>>>,
}

impl Db {
    /// Open (creating if needed) the database at `db_path`
    ///
    /// Does not migrate; see [`migrate`].
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self, DbError> {
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let manager = SqliteConnectionManager::file(db_path.as_ref()).with_init(setup_connection);
        Self::with_manager(manager)
    }

    /// Create an in-memory database (for testing)
    pub fn in_memory() -> Result<Self, DbError> {
        Self::with_manager(SqliteConnectionManager::memory().with_init(setup_connection))
    }

    fn with_manager(manager: SqliteConnectionManager) -> Result<Self, DbError> {
        // One connection, never recycled: the store has a single writer, and an
        // in-memory database lives exactly as long as its connection.
        let pool = Pool::builder()
            .max_size(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .build(manager)?;

        let db = Self {
            pool,
            conn: RefCell::new(None),
            in_transaction: Cell::new(None),
            changes: RefCell::new(None),
            pending: RefCell::new(BTreeMap::new()),
            next_statement_id: Cell::new(0),
            hook: RefCell::new(None),
        };
        db.setup()?;
        Ok(db)
    }

    /// Register the receiver of transaction changelogs
    pub fn set_change_hook(&self, hook: impl Fn(&[String], bool) + 'static) {
        *self.hook.borrow_mut() = Some(Box::new(hook));
    }

    /// Standalone setup pass: reported to the hook as a non-final batch
    fn setup(&self) -> Result<(), DbError> {
        self.prepare_for_changes();
        let conn = self.pool.get()?;
        for pragma in SETUP_PRAGMAS {
            conn.execute_batch(pragma)?;
            self.record_change(pragma.to_string());
        }
        drop(conn);
        self.report_changes(false, 0);
        Ok(())
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction.get().is_some()
    }

    /// Open a transaction
    ///
    /// # Panics
    ///
    /// If a transaction is already open.
    #[track_caller]
    pub fn begin(&self) -> Result<(), DbError> {
        let caller = Location::caller();
        if let Some(open) = self.in_transaction.get() {
            crate::fatal!("Already in transaction from {}", open);
        }

        let conn = self.pool.get()?;
        conn.execute_batch("BEGIN TRANSACTION;")?;
        *self.conn.borrow_mut() = Some(conn);
        self.prepare_for_changes();
        self.in_transaction.set(Some(caller));
        tracing::trace!(target: "chanstore::db", location = %caller, "begin");
        Ok(())
    }

    /// Report the changelog, then commit
    ///
    /// # Panics
    ///
    /// If no transaction is open, or a statement prepared in it is still alive.
    #[track_caller]
    pub fn commit(&self) -> Result<(), DbError> {
        let Some(opened) = self.in_transaction.get() else {
            crate::fatal!("Commit without transaction at {}", Location::caller());
        };
        if let Some(stmt) = self.pending.borrow().values().next() {
            crate::fatal!(
                "Unfinalized statement {} prepared at {} (transaction from {})",
                stmt.name,
                stmt.location,
                opened
            );
        }

        self.report_changes(true, 0);
        let conn = self.conn.borrow_mut().take();
        self.in_transaction.set(None);
        match conn {
            Some(conn) => conn.execute_batch("COMMIT;")?,
            None => crate::fatal!("Transaction from {} lost its connection", opened),
        }
        Ok(())
    }

    /// Run `f` in its own transaction
    ///
    /// An error from `f` rolls the transaction back, discarding its changelog.
    #[track_caller]
    pub fn transaction<T, E>(&self, f: impl FnOnce(&Db) -> Result<T, E>) -> Result<T, E>
    where
        E: From<DbError>,
    {
        self.begin()?;
        match f(self) {
            Ok(v) => {
                self.commit()?;
                Ok(v)
            }
            Err(e) => {
                self.rollback();
                Err(e)
            }
        }
    }

    fn rollback(&self) {
        let conn = self.conn.borrow_mut().take();
        let opened = self.in_transaction.take();
        self.changes.borrow_mut().take();
        if let Some(conn) = conn {
            if let Err(e) = conn.execute_batch("ROLLBACK;") {
                tracing::error!(target: "chanstore::db", error = %e, "rollback failed");
            }
        }
        if let Some(opened) = opened {
            tracing::warn!(target: "chanstore::db", location = %opened, "transaction rolled back");
        }
    }

    /// Prepare `query` in the open transaction
    ///
    /// # Panics
    ///
    /// If no transaction is open.
    #[track_caller]
    pub fn prepare(&self, query: &'static Query) -> Statement<'_> {
        let caller = Location::caller();
        if !self.in_transaction() {
            crate::fatal!(
                "Attempting to prepare {} outside of a transaction at {}",
                query.name,
                caller
            );
        }
        Statement::new(self, query, caller)
    }

    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&rusqlite::Connection) -> rusqlite::Result<T>,
    ) -> Result<T, DbError> {
        let conn = self.conn.borrow();
        match conn.as_ref() {
            Some(conn) => Ok(f(conn)?),
            None => crate::fatal!("Statement executed outside of a transaction"),
        }
    }

    fn register_statement(&self, name: &'static str, location: &'static Location<'static>) -> u64 {
        let id = self.next_statement_id.get();
        self.next_statement_id.set(id + 1);
        self.pending
            .borrow_mut()
            .insert(id, PendingStatement { name, location });
        id
    }

    fn unregister_statement(&self, id: u64) {
        self.pending.borrow_mut().remove(&id);
    }

    fn prepare_for_changes(&self) {
        *self.changes.borrow_mut() = Some(Vec::new());
    }

    fn record_change(&self, sql: String) {
        if let Some(changes) = self.changes.borrow_mut().as_mut() {
            changes.push(sql);
        }
    }

    fn report_changes(&self, is_final: bool, min: usize) {
        let changes = self.changes.borrow_mut().take().unwrap_or_default();
        if changes.len() > min {
            if let Some(hook) = self.hook.borrow().as_ref() {
                hook(&changes, is_final);
            }
        }
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        debug_assert!(
            self.pending.borrow().is_empty(),
            "statements outlived their store"
        );
        if let Some(opened) = self.in_transaction.get() {
            tracing::error!(target: "chanstore::db", location = %opened, "store closed with open transaction");
            self.rollback();
        }
    }
}

fn setup_connection(conn: &mut rusqlite::Connection) -> rusqlite::Result<()> {
    for pragma in SETUP_PRAGMAS {
        conn.execute_batch(pragma)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    static CREATE_T: Query = Query::write("test_create", "CREATE TABLE t (k INTEGER PRIMARY KEY, v TEXT)");
    static INSERT_T: Query = Query::write("test_insert", "INSERT INTO t (k, v) VALUES (?, ?)");
    static COUNT_T: Query = Query::read("test_count", "SELECT COUNT(*) FROM t");

    fn count(db: &Db) -> u64 {
        db.transaction(|db| {
            let row = db.prepare(&COUNT_T).query()?.single();
            Ok::<_, DbError>(row.map(|r| r.column_u64(0)).unwrap_or(0))
        })
        .unwrap()
    }

    #[test]
    fn test_changelog_reported_on_commit() {
        let db = Db::in_memory().unwrap();
        let seen: Rc<RefCell<Vec<(Vec<String>, bool)>>> = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        db.set_change_hook(move |changes, is_final| {
            sink.borrow_mut().push((changes.to_vec(), is_final));
        });

        db.begin().unwrap();
        db.prepare(&CREATE_T).exec().unwrap();
        let mut stmt = db.prepare(&INSERT_T);
        stmt.bind_int(0, 5);
        stmt.bind_text(1, "five");
        stmt.exec().unwrap();
        db.commit().unwrap();

        // Reads alone do not notify
        assert_eq!(count(&db), 1);

        let seen = seen.borrow();
        assert_eq!(seen.len(), 1);
        let (changes, is_final) = &seen[0];
        assert!(is_final);
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[1], "INSERT INTO t (k, v) VALUES (5, 'five')");
    }

    #[test]
    fn test_error_rolls_back() {
        let db = Db::in_memory().unwrap();
        db.transaction(|db| db.prepare(&CREATE_T).exec().map(|_| ())).unwrap();

        let result: Result<(), DbError> = db.transaction(|db| {
            let mut stmt = db.prepare(&INSERT_T);
            stmt.bind_int(0, 1);
            stmt.bind_text(1, "one");
            stmt.exec()?;
            let mut stmt = db.prepare(&INSERT_T);
            stmt.bind_int(0, 1);
            stmt.bind_text(1, "again");
            stmt.exec()?;
            Ok(())
        });
        assert!(matches!(result, Err(DbError::Duplicate(_))));
        assert!(!db.in_transaction());
        assert_eq!(count(&db), 0);
    }

    #[test]
    #[should_panic(expected = "Already in transaction")]
    fn test_nested_begin_panics() {
        let db = Db::in_memory().unwrap();
        db.begin().unwrap();
        let _ = db.begin();
    }

    #[test]
    #[should_panic(expected = "Commit without transaction")]
    fn test_commit_without_begin_panics() {
        let db = Db::in_memory().unwrap();
        let _ = db.commit();
    }

    #[test]
    #[should_panic(expected = "Unfinalized statement test_count")]
    fn test_commit_with_live_statement_panics() {
        let db = Db::in_memory().unwrap();
        db.begin().unwrap();
        let _stmt = db.prepare(&COUNT_T);
        let _ = db.commit();
    }

    #[test]
    #[should_panic(expected = "outside of a transaction")]
    fn test_prepare_outside_transaction_panics() {
        let db = Db::in_memory().unwrap();
        let _stmt = db.prepare(&COUNT_T);
    }

    #[test]
    fn test_freed_statement_allows_commit() {
        let db = Db::in_memory().unwrap();
        db.begin().unwrap();
        {
            let _unused = db.prepare(&COUNT_T);
        }
        db.commit().unwrap();
    }
}
