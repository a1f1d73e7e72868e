//! Scalar variables kept in the `vars` table

use super::{Db, DbError, Query};

static VAR_GET_INT: Query = Query::read("vars_get_int", "SELECT intval FROM vars WHERE name = ? LIMIT 1");
static VAR_SET_INT: Query = Query::write("vars_set_int", "UPDATE vars SET intval = ? WHERE name = ?");
static VAR_INSERT_INT: Query =
    Query::write("vars_insert_int", "INSERT INTO vars (name, intval) VALUES (?, ?)");
static VAR_GET_BLOB: Query =
    Query::read("vars_get_blob", "SELECT blobval FROM vars WHERE name = ? LIMIT 1");
static VAR_SET_BLOB: Query = Query::write("vars_set_blob", "UPDATE vars SET blobval = ? WHERE name = ?");
static VAR_INSERT_BLOB: Query =
    Query::write("vars_insert_blob", "INSERT INTO vars (name, blobval) VALUES (?, ?)");

impl Db {
    /// Integer variable, or `default` if never set
    pub fn get_intvar(&self, name: &str, default: i64) -> Result<i64, DbError> {
        let mut stmt = self.prepare(&VAR_GET_INT);
        stmt.bind_text(0, name);
        Ok(stmt
            .query()?
            .single()
            .map(|row| row.column_i64(0))
            .unwrap_or(default))
    }

    /// Set an integer variable, creating it if needed
    pub fn set_intvar(&self, name: &str, val: i64) -> Result<(), DbError> {
        let mut stmt = self.prepare(&VAR_SET_INT);
        stmt.bind_u64(0, val as u64);
        stmt.bind_text(1, name);
        if stmt.exec()?.changes == 0 {
            let mut stmt = self.prepare(&VAR_INSERT_INT);
            stmt.bind_text(0, name);
            stmt.bind_u64(1, val as u64);
            stmt.exec()?;
        }
        Ok(())
    }

    pub fn get_blobvar(&self, name: &str) -> Result<Option<Vec<u8>>, DbError> {
        let mut stmt = self.prepare(&VAR_GET_BLOB);
        stmt.bind_text(0, name);
        Ok(stmt
            .query()?
            .single()
            .and_then(|row| row.column_blob(0).map(<[u8]>::to_vec)))
    }

    pub fn set_blobvar(&self, name: &str, val: &[u8]) -> Result<(), DbError> {
        let mut stmt = self.prepare(&VAR_SET_BLOB);
        stmt.bind_blob(0, val);
        stmt.bind_text(1, name);
        if stmt.exec()?.changes == 0 {
            let mut stmt = self.prepare(&VAR_INSERT_BLOB);
            stmt.bind_text(0, name);
            stmt.bind_blob(1, val);
            stmt.exec()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::migrations::{migrate, MigrationContext};
    use super::*;

    #[test]
    fn test_intvar_default_then_update() {
        let db = Db::in_memory().unwrap();
        migrate(&db, &MigrationContext::default()).unwrap();

        db.begin().unwrap();
        assert_eq!(db.get_intvar("bip32_max_index", 0).unwrap(), 0);
        db.set_intvar("bip32_max_index", 5).unwrap();
        db.set_intvar("bip32_max_index", 6).unwrap();
        assert_eq!(db.get_intvar("bip32_max_index", 0).unwrap(), 6);
        assert_eq!(db.get_intvar("unset", -1).unwrap(), -1);
        db.commit().unwrap();
    }

    #[test]
    fn test_blobvar() {
        let db = Db::in_memory().unwrap();
        migrate(&db, &MigrationContext::default()).unwrap();

        db.begin().unwrap();
        assert_eq!(db.get_blobvar("genesis_hash").unwrap(), None);
        db.set_blobvar("genesis_hash", &[1, 2, 3]).unwrap();
        assert_eq!(db.get_blobvar("genesis_hash").unwrap(), Some(vec![1, 2, 3]));
        db.commit().unwrap();
    }
}
