//! Schema Migrations
//!
//! `MIGRATIONS` is append-only: an entry's position is the schema version it
//! produces. Entries are never edited, reordered or removed once released.

use super::{Db, DbError, Query};
use crate::common::logging::log_migration_event;

/// Host-side parameters some migrations need
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationContext {
    /// Configured base fee (msat) used to seed per-channel fee policy
    pub fee_base: u32,
    /// Configured proportional fee (ppm)
    pub fee_ppm: u32,
}

impl Default for MigrationContext {
    fn default() -> Self {
        Self {
            fee_base: 1000,
            fee_ppm: 10,
        }
    }
}

/// One step of the schema history
pub enum Migration {
    Sql(Query),
    Callback(fn(&Db, &MigrationContext) -> Result<(), DbError>),
}

const fn sql(sql: &'static str) -> Migration {
    Migration::Sql(Query::write("migration", sql))
}

/// Versions before this were applied to a store that is being migrated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationOutcome {
    /// Persisted version before the pass, -1 if unset
    pub from: i64,
    pub to: i64,
}

impl MigrationOutcome {
    pub fn upgraded(&self) -> bool {
        self.from != self.to
    }
}

pub static MIGRATIONS: &[Migration] = &[
    sql("CREATE TABLE version (version INTEGER)"),
    sql("INSERT INTO version VALUES (1)"),
    sql("CREATE TABLE vars (name VARCHAR(32), val VARCHAR(255), PRIMARY KEY (name))"),
    sql("CREATE TABLE blocks (height INT, hash BLOB, prev_hash BLOB, UNIQUE(height))"),
    sql("CREATE TABLE outputs (\
         prev_out_tx BLOB, \
         prev_out_index INTEGER, \
         value INTEGER, \
         type INTEGER, \
         status INTEGER, \
         keyindex INTEGER, \
         PRIMARY KEY (prev_out_tx, prev_out_index))"),
    sql("CREATE TABLE shachains (id INTEGER, min_index INTEGER, num_valid INTEGER, PRIMARY KEY (id))"),
    sql("CREATE TABLE shachain_known (\
         shachain_id INTEGER REFERENCES shachains(id) ON DELETE CASCADE, \
         pos INTEGER, \
         idx INTEGER, \
         hash BLOB, \
         PRIMARY KEY (shachain_id, pos))"),
    sql("CREATE TABLE peers (id INTEGER, node_id BLOB UNIQUE, address TEXT, PRIMARY KEY (id))"),
    sql("CREATE TABLE channel_configs (\
         id INTEGER, \
         dust_limit_satoshis INTEGER, \
         max_htlc_value_in_flight_msat INTEGER, \
         channel_reserve_satoshis INTEGER, \
         htlc_minimum_msat INTEGER, \
         to_self_delay INTEGER, \
         max_accepted_htlcs INTEGER, \
         PRIMARY KEY (id))"),
    sql("CREATE TABLE channels (\
         id INTEGER, \
         peer_id INTEGER REFERENCES peers(id) ON DELETE CASCADE, \
         short_channel_id TEXT, \
         channel_config_local INTEGER, \
         channel_config_remote INTEGER, \
         state INTEGER, \
         funder INTEGER, \
         channel_flags INTEGER, \
         minimum_depth INTEGER, \
         next_index_local INTEGER, \
         next_index_remote INTEGER, \
         next_htlc_id INTEGER, \
         funding_tx_id BLOB, \
         funding_tx_outnum INTEGER, \
         funding_satoshi INTEGER, \
         funding_locked_remote INTEGER, \
         push_msatoshi INTEGER, \
         msatoshi_local INTEGER, \
         fundingkey_remote BLOB, \
         revocation_basepoint_remote BLOB, \
         payment_basepoint_remote BLOB, \
         htlc_basepoint_remote BLOB, \
         delayed_payment_basepoint_remote BLOB, \
         per_commit_remote BLOB, \
         old_per_commit_remote BLOB, \
         local_feerate_per_kw INTEGER, \
         remote_feerate_per_kw INTEGER, \
         shachain_remote_id INTEGER, \
         shutdown_scriptpubkey_remote BLOB, \
         shutdown_keyidx_local INTEGER, \
         last_tx BLOB, \
         last_sig BLOB, \
         PRIMARY KEY (id))"),
    sql("CREATE TABLE channel_htlcs (\
         id INTEGER, \
         channel_id INTEGER REFERENCES channels(id) ON DELETE CASCADE, \
         channel_htlc_id INTEGER, \
         direction INTEGER, \
         origin_htlc INTEGER, \
         msatoshi INTEGER, \
         cltv_expiry INTEGER, \
         payment_hash BLOB, \
         payment_key BLOB, \
         routing_onion BLOB, \
         failuremsg BLOB, \
         malformed_onion INTEGER, \
         hstate INTEGER, \
         shared_secret BLOB, \
         PRIMARY KEY (id), \
         UNIQUE (channel_id, channel_htlc_id, direction))"),
    sql("CREATE TABLE payments (\
         id INTEGER, \
         timestamp INTEGER, \
         status INTEGER, \
         payment_hash BLOB, \
         destination BLOB, \
         msatoshi INTEGER, \
         payment_preimage BLOB, \
         path_secrets BLOB, \
         PRIMARY KEY (id), \
         UNIQUE (payment_hash))"),
    sql("CREATE TABLE htlc_sigs (channelid INTEGER REFERENCES channels(id) ON DELETE CASCADE, signature BLOB)"),
    sql("CREATE INDEX channel_idx ON htlc_sigs (channelid)"),
    sql("CREATE TABLE db_upgrades (upgrade_from INTEGER, lightning_version TEXT)"),
    // Unilateral close outputs need their channel context to be spendable
    sql("ALTER TABLE outputs ADD COLUMN channel_id INTEGER"),
    sql("ALTER TABLE outputs ADD COLUMN peer_id BLOB"),
    sql("ALTER TABLE outputs ADD COLUMN commitment_point BLOB"),
    sql("ALTER TABLE channels ADD first_blocknum INTEGER"),
    sql("UPDATE channels SET first_blocknum = 1 WHERE short_channel_id IS NOT NULL"),
    sql("ALTER TABLE channels ADD last_was_revoke INTEGER"),
    sql("UPDATE channels SET last_was_revoke = 0"),
    sql("ALTER TABLE payments ADD route_nodes BLOB"),
    sql("ALTER TABLE payments ADD route_channels BLOB"),
    sql("CREATE TABLE utxoset (\
         txid BLOB NOT NULL, \
         outnum INT NOT NULL, \
         blockheight INT REFERENCES blocks(height) ON DELETE CASCADE, \
         spendheight INT REFERENCES blocks(height) ON DELETE SET NULL, \
         txindex INT, \
         scriptpubkey BLOB, \
         satoshis BIGINT, \
         PRIMARY KEY(txid, outnum))"),
    sql("CREATE INDEX short_channel_id ON utxoset (blockheight, txindex, outnum)"),
    sql("CREATE INDEX utxoset_spend ON utxoset (spendheight)"),
    sql("ALTER TABLE outputs ADD COLUMN confirmation_height INTEGER REFERENCES blocks(height) ON DELETE SET NULL"),
    sql("ALTER TABLE outputs ADD COLUMN spend_height INTEGER REFERENCES blocks(height) ON DELETE SET NULL"),
    sql("CREATE INDEX output_height_idx ON outputs (confirmation_height, spend_height)"),
    sql("ALTER TABLE channels ADD min_possible_feerate INTEGER"),
    sql("ALTER TABLE channels ADD max_possible_feerate INTEGER"),
    // Channels from before feerate bounds were tracked accept anything
    sql("UPDATE channels SET min_possible_feerate = 0, max_possible_feerate = 250000"),
    sql("ALTER TABLE channels ADD msatoshi_to_us_min INTEGER"),
    sql("ALTER TABLE channels ADD msatoshi_to_us_max INTEGER"),
    sql("UPDATE channels SET msatoshi_to_us_min = msatoshi_local, msatoshi_to_us_max = msatoshi_local"),
    sql("CREATE TABLE transactions (\
         id BLOB, \
         blockheight INTEGER REFERENCES blocks(height) ON DELETE SET NULL, \
         txindex INTEGER, \
         rawtx BLOB, \
         PRIMARY KEY (id))"),
    sql("ALTER TABLE payments ADD failonionreply BLOB"),
    sql("ALTER TABLE payments ADD faildestperm INTEGER"),
    sql("ALTER TABLE payments ADD failindex INTEGER"),
    sql("ALTER TABLE payments ADD failcode INTEGER"),
    sql("ALTER TABLE payments ADD failnode BLOB"),
    sql("ALTER TABLE payments ADD failchannel TEXT"),
    sql("ALTER TABLE payments ADD failupdate BLOB"),
    // Route details of settled payments are no longer needed
    sql("UPDATE payments SET path_secrets = NULL, route_nodes = NULL, route_channels = NULL WHERE status <> 0"),
    sql("CREATE TABLE channeltxs (\
         id INTEGER, \
         channel_id INTEGER REFERENCES channels(id) ON DELETE CASCADE, \
         type INTEGER, \
         transaction_id BLOB REFERENCES transactions(id) ON DELETE CASCADE, \
         input_num INTEGER, \
         blockheight INTEGER REFERENCES blocks(height) ON DELETE CASCADE, \
         PRIMARY KEY(id))"),
    sql("ALTER TABLE channels ADD future_per_commitment_point BLOB"),
    sql("ALTER TABLE channels ADD last_sent_commit BLOB"),
    sql("CREATE TABLE forwarded_payments (\
         in_htlc_id INTEGER REFERENCES channel_htlcs(id) ON DELETE SET NULL, \
         out_htlc_id INTEGER REFERENCES channel_htlcs(id) ON DELETE SET NULL, \
         in_channel_scid INTEGER, \
         out_channel_scid INTEGER, \
         in_msatoshi INTEGER, \
         out_msatoshi INTEGER, \
         state INTEGER, \
         UNIQUE(in_htlc_id, out_htlc_id))"),
    sql("ALTER TABLE payments ADD faildetail TEXT"),
    sql("UPDATE payments SET faildetail = 'unspecified payment failure reason' WHERE status = 2"),
    sql("ALTER TABLE payments ADD msatoshi_sent INTEGER"),
    sql("UPDATE payments SET msatoshi_sent = msatoshi"),
    sql("ALTER TABLE channels ADD in_payments_offered INTEGER"),
    sql("ALTER TABLE channels ADD in_payments_fulfilled INTEGER"),
    sql("ALTER TABLE channels ADD in_msatoshi_offered INTEGER"),
    sql("ALTER TABLE channels ADD in_msatoshi_fulfilled INTEGER"),
    sql("ALTER TABLE channels ADD out_payments_offered INTEGER"),
    sql("ALTER TABLE channels ADD out_payments_fulfilled INTEGER"),
    sql("ALTER TABLE channels ADD out_msatoshi_offered INTEGER"),
    sql("ALTER TABLE channels ADD out_msatoshi_fulfilled INTEGER"),
    sql("UPDATE channels SET \
         in_payments_offered = 0, in_payments_fulfilled = 0, \
         in_msatoshi_offered = 0, in_msatoshi_fulfilled = 0, \
         out_payments_offered = 0, out_payments_fulfilled = 0, \
         out_msatoshi_offered = 0, out_msatoshi_fulfilled = 0"),
    sql("ALTER TABLE payments ADD description TEXT"),
    sql("ALTER TABLE channel_htlcs ADD received_time INTEGER"),
    sql("ALTER TABLE forwarded_payments ADD received_time INTEGER"),
    sql("ALTER TABLE forwarded_payments ADD resolved_time INTEGER"),
    sql("ALTER TABLE channels ADD remote_upfront_shutdown_script BLOB"),
    sql("ALTER TABLE forwarded_payments ADD failcode INTEGER"),
    sql("ALTER TABLE channels ADD remote_ann_node_sig BLOB"),
    sql("ALTER TABLE channels ADD remote_ann_bitcoin_sig BLOB"),
    sql("ALTER TABLE transactions ADD type INTEGER"),
    sql("ALTER TABLE transactions ADD channel_id INTEGER"),
    sql("ALTER TABLE outputs ADD scriptpubkey BLOB"),
    sql("ALTER TABLE payments ADD bolt11 TEXT"),
    sql("ALTER TABLE channels ADD feerate_base INTEGER"),
    sql("ALTER TABLE channels ADD feerate_ppm INTEGER"),
    Migration::Callback(migrate_feerate_per_channel),
    sql("ALTER TABLE payments ADD faildirection INTEGER"),
    sql("ALTER TABLE vars ADD intval INTEGER"),
    sql("ALTER TABLE vars ADD blobval BLOB"),
    sql("UPDATE vars SET intval = CAST(val AS INTEGER) WHERE name IN ('bip32_max_index', 'last_processed_block')"),
    sql("CREATE INDEX channel_htlcs_payment_hash ON channel_htlcs (payment_hash)"),
];

static VERSION_GET: Query = Query::read("version_get", "SELECT version FROM version LIMIT 1");
static VERSION_SET: Query = Query::write("version_set", "UPDATE version SET version = ?");
static UPGRADE_INSERT: Query = Query::write(
    "db_upgrades_insert",
    "INSERT INTO db_upgrades VALUES (?, ?)",
);
static CHANNELS_SET_FEERATE: Query = Query::write(
    "channels_set_feerate",
    "UPDATE channels SET feerate_base = ?, feerate_ppm = ?",
);

/// Existing channels get the node-wide fee policy they were created under
fn migrate_feerate_per_channel(db: &Db, ctx: &MigrationContext) -> Result<(), DbError> {
    let mut stmt = db.prepare(&CHANNELS_SET_FEERATE);
    stmt.bind_int(0, ctx.fee_base as i32);
    stmt.bind_int(1, ctx.fee_ppm as i32);
    stmt.exec()?;
    Ok(())
}

/// Persisted schema version, -1 before the version table exists
fn get_version(db: &Db) -> i64 {
    match db.prepare(&VERSION_GET).query() {
        Ok(rows) => rows.single().map(|row| row.column_i64(0)).unwrap_or(-1),
        Err(e) => {
            tracing::debug!(target: "chanstore::migrations", error = %e, "no version table");
            -1
        }
    }
}

/// Bring the store up to the latest schema, in one transaction
pub fn migrate(db: &Db, ctx: &MigrationContext) -> Result<MigrationOutcome, DbError> {
    migrate_with(db, ctx, MIGRATIONS)
}

pub(crate) fn migrate_with(
    db: &Db,
    ctx: &MigrationContext,
    migrations: &'static [Migration],
) -> Result<MigrationOutcome, DbError> {
    db.transaction(|db| {
        let orig = get_version(db);
        let available = migrations.len() as i64 - 1;

        if orig > available {
            tracing::error!(
                target: "chanstore::migrations",
                current = orig,
                available,
                "refusing to migrate down"
            );
            return Err(DbError::Downgrade {
                current: orig,
                available,
            });
        }

        let mut current = orig;
        while current < available {
            current += 1;
            match &migrations[current as usize] {
                Migration::Sql(query) => {
                    db.prepare(query).exec()?;
                }
                Migration::Callback(func) => func(db, ctx)?,
            }
            tracing::debug!(target: "chanstore::migrations", version = current, "applied migration");
        }

        let mut stmt = db.prepare(&VERSION_SET);
        stmt.bind_u64(0, current as u64);
        stmt.exec()?;

        if current != orig {
            let version = env!("CARGO_PKG_VERSION");
            let mut stmt = db.prepare(&UPGRADE_INSERT);
            stmt.bind_u64(0, orig as u64);
            stmt.bind_text(1, version);
            stmt.exec()?;
            log_migration_event(orig, current, version);
        }

        Ok(MigrationOutcome {
            from: orig,
            to: current,
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    static UPGRADES_COUNT: Query = Query::read("test_upgrades_count", "SELECT COUNT(*) FROM db_upgrades");
    static FORCE_VERSION: Query = Query::write("test_force_version", "UPDATE version SET version = ?");
    static CHANNEL_STUB: Query = Query::write("test_channel_stub", "INSERT INTO channels (id) VALUES (1)");
    static CHANNEL_FEES: Query =
        Query::read("test_channel_fees", "SELECT feerate_base, feerate_ppm FROM channels WHERE id = 1");

    fn upgrades(db: &Db) -> u64 {
        db.transaction(|db| {
            Ok::<_, DbError>(
                db.prepare(&UPGRADES_COUNT)
                    .query()?
                    .single()
                    .map(|r| r.column_u64(0))
                    .unwrap_or(0),
            )
        })
        .unwrap()
    }

    #[test]
    fn test_fresh_store_migrates_to_latest() {
        let db = Db::in_memory().unwrap();
        let outcome = migrate(&db, &MigrationContext::default()).unwrap();
        assert_eq!(outcome.from, -1);
        assert_eq!(outcome.to, MIGRATIONS.len() as i64 - 1);
        assert!(outcome.upgraded());
        assert_eq!(upgrades(&db), 1);
    }

    #[test]
    fn test_migration_is_idempotent() {
        let db = Db::in_memory().unwrap();
        let first = migrate(&db, &MigrationContext::default()).unwrap();
        let second = migrate(&db, &MigrationContext::default()).unwrap();
        assert_eq!(second.from, first.to);
        assert_eq!(second.to, first.to);
        assert!(!second.upgraded());
        assert_eq!(upgrades(&db), 1);
    }

    #[test]
    fn test_refuses_downgrade() {
        let db = Db::in_memory().unwrap();
        migrate(&db, &MigrationContext::default()).unwrap();
        db.transaction(|db| {
            let mut stmt = db.prepare(&FORCE_VERSION);
            stmt.bind_u64(0, 9999);
            stmt.exec().map(|_| ())
        })
        .unwrap();

        let err = migrate(&db, &MigrationContext::default()).unwrap_err();
        assert!(matches!(err, DbError::Downgrade { current: 9999, .. }));
        assert!(err.is_fatal());
        assert!(!db.in_transaction());
    }

    #[test]
    fn test_fee_policy_callback_seeds_existing_channels() {
        let callback_at = MIGRATIONS
            .iter()
            .position(|m| matches!(m, Migration::Callback(_)))
            .unwrap();

        let db = Db::in_memory().unwrap();
        migrate_with(&db, &MigrationContext::default(), &MIGRATIONS[..callback_at]).unwrap();
        db.transaction(|db| db.prepare(&CHANNEL_STUB).exec().map(|_| ()))
            .unwrap();

        let ctx = MigrationContext {
            fee_base: 2000,
            fee_ppm: 7,
        };
        let outcome = migrate(&db, &ctx).unwrap();
        assert_eq!(outcome.from, callback_at as i64 - 1);

        let (base, ppm) = db
            .transaction(|db| {
                let row = db.prepare(&CHANNEL_FEES).query()?.single();
                Ok::<_, DbError>(row.map(|r| (r.column_u64(0), r.column_u64(1))))
            })
            .unwrap()
            .unwrap();
        assert_eq!((base, ppm), (2000, 7));
        assert_eq!(upgrades(&db), 2);
    }

    #[test]
    fn test_every_migration_is_a_write() {
        for m in MIGRATIONS {
            if let Migration::Sql(q) = m {
                assert!(!q.readonly);
                assert_eq!(q.placeholders, 0, "{}", q.sql);
            }
        }
    }
}
