//! Peers, Channel Configs and Channels
//!
//! A channel is inserted in two phases: a stub row first, so its id exists
//! before the config and shachain rows that hang off it, then a full
//! [`Wallet::channel_save`]. Saving splits the hot fixed-width fields, the
//! remote-facing fields and the variable-length last-sent-commit blob into
//! separate updates. Closing keeps the channel row but drops everything the
//! channel needed only while it was alive.

use secp256k1::ecdsa::Signature;

use super::{Wallet, WalletError};
use crate::common::logging::log_channel_event;
use crate::db::{Query, Row};
use crate::types::{
    AnnouncementSigs, Basepoints, ChangedHtlc, Channel, ChannelConfig, ChannelInfo, ChannelState,
    ChannelStats, HtlcState, Peer, Side,
};

// ============================================================================
// Queries
// ============================================================================

static PEER_INSERT: Query = Query::write("peers_insert", "INSERT INTO peers (node_id, address) VALUES (?, ?)");
static PEER_BY_NODE_ID: Query =
    Query::read("peers_by_node_id", "SELECT id, node_id, address FROM peers WHERE node_id = ?");
static PEER_BY_ID: Query = Query::read("peers_by_id", "SELECT id, node_id, address FROM peers WHERE id = ?");
static PEER_CHANNEL_COUNT: Query =
    Query::read("peers_channel_count", "SELECT COUNT(*) FROM channels WHERE peer_id = ?");
static PEER_DELETE: Query = Query::write("peers_delete", "DELETE FROM peers WHERE id = ?");

static CONFIG_INSERT: Query = Query::write("channel_configs_insert", "INSERT INTO channel_configs DEFAULT VALUES");
static CONFIG_UPDATE: Query = Query::write(
    "channel_configs_update",
    "UPDATE channel_configs SET \
     dust_limit_satoshis = ?, max_htlc_value_in_flight_msat = ?, channel_reserve_satoshis = ?, \
     htlc_minimum_msat = ?, to_self_delay = ?, max_accepted_htlcs = ? \
     WHERE id = ?",
);
static CONFIG_GET: Query = Query::read(
    "channel_configs_get",
    "SELECT id, dust_limit_satoshis, max_htlc_value_in_flight_msat, channel_reserve_satoshis, \
     htlc_minimum_msat, to_self_delay, max_accepted_htlcs \
     FROM channel_configs WHERE id = ?",
);

static CHANNEL_MAX_ID: Query = Query::read("channels_max_id", "SELECT id FROM channels ORDER BY id DESC LIMIT 1");
static CHANNEL_STUB: Query = Query::write(
    "channels_insert_stub",
    "INSERT INTO channels (peer_id, first_blocknum, id) VALUES (?, ?, ?)",
);
static CHANNEL_SAVE_LOCAL: Query = Query::write(
    "channels_save_local",
    "UPDATE channels SET \
     shachain_remote_id = ?, short_channel_id = ?, state = ?, funder = ?, channel_flags = ?, \
     minimum_depth = ?, next_index_local = ?, next_index_remote = ?, next_htlc_id = ?, \
     funding_tx_id = ?, funding_tx_outnum = ?, funding_satoshi = ?, funding_locked_remote = ?, \
     push_msatoshi = ?, msatoshi_local = ?, shutdown_scriptpubkey_remote = ?, \
     shutdown_keyidx_local = ?, channel_config_local = ?, last_tx = ?, last_sig = ?, \
     last_was_revoke = ?, min_possible_feerate = ?, max_possible_feerate = ?, \
     msatoshi_to_us_min = ?, msatoshi_to_us_max = ?, feerate_base = ?, feerate_ppm = ?, \
     remote_upfront_shutdown_script = ? \
     WHERE id = ?",
);
static CHANNEL_SAVE_REMOTE: Query = Query::write(
    "channels_save_remote",
    "UPDATE channels SET \
     fundingkey_remote = ?, revocation_basepoint_remote = ?, payment_basepoint_remote = ?, \
     htlc_basepoint_remote = ?, delayed_payment_basepoint_remote = ?, per_commit_remote = ?, \
     old_per_commit_remote = ?, local_feerate_per_kw = ?, remote_feerate_per_kw = ?, \
     channel_config_remote = ?, future_per_commitment_point = ? \
     WHERE id = ?",
);
static CHANNEL_SAVE_LAST_SENT: Query = Query::write(
    "channels_save_last_sent_commit",
    "UPDATE channels SET last_sent_commit = ? WHERE id = ?",
);
static CHANNELS_ACTIVE: Query = Query::read(
    "channels_active",
    "SELECT id, peer_id, short_channel_id, channel_config_local, channel_config_remote, state, \
     funder, channel_flags, minimum_depth, next_index_local, next_index_remote, next_htlc_id, \
     funding_tx_id, funding_tx_outnum, funding_satoshi, funding_locked_remote, push_msatoshi, \
     msatoshi_local, fundingkey_remote, revocation_basepoint_remote, payment_basepoint_remote, \
     htlc_basepoint_remote, delayed_payment_basepoint_remote, per_commit_remote, \
     old_per_commit_remote, local_feerate_per_kw, remote_feerate_per_kw, shachain_remote_id, \
     shutdown_scriptpubkey_remote, shutdown_keyidx_local, last_tx, last_sig, last_was_revoke, \
     first_blocknum, min_possible_feerate, max_possible_feerate, msatoshi_to_us_min, \
     msatoshi_to_us_max, future_per_commitment_point, last_sent_commit, feerate_base, \
     feerate_ppm, remote_upfront_shutdown_script \
     FROM channels WHERE state < ?",
);
static CHANNEL_STATE: Query = Query::read("channels_state", "SELECT state FROM channels WHERE id = ?");

static CLOSE_HTLCS: Query = Query::write("close_delete_htlcs", "DELETE FROM channel_htlcs WHERE channel_id = ?");
static CLOSE_HTLC_SIGS: Query = Query::write("close_delete_htlc_sigs", "DELETE FROM htlc_sigs WHERE channelid = ?");
static CLOSE_CHANNELTXS: Query = Query::write("close_delete_channeltxs", "DELETE FROM channeltxs WHERE channel_id = ?");
static CLOSE_SHACHAIN: Query = Query::write(
    "close_delete_shachain",
    "DELETE FROM shachains WHERE id IN (SELECT shachain_remote_id FROM channels WHERE channels.id = ?)",
);
static CLOSE_CHANNEL: Query = Query::write(
    "close_mark_channel",
    "UPDATE channels SET state = ?, peer_id = NULL WHERE channels.id = ?",
);

static HTLC_SIGS_DELETE: Query = Query::write("htlc_sigs_delete", "DELETE FROM htlc_sigs WHERE channelid = ?");
static HTLC_SIGS_INSERT: Query =
    Query::write("htlc_sigs_insert", "INSERT INTO htlc_sigs (channelid, signature) VALUES (?, ?)");
static HTLC_SIGS_GET: Query =
    Query::read("htlc_sigs_get", "SELECT signature FROM htlc_sigs WHERE channelid = ? ORDER BY rowid");

static ANN_SIGS_SAVE: Query = Query::write(
    "channels_save_announcement_sigs",
    "UPDATE channels SET remote_ann_node_sig = ?, remote_ann_bitcoin_sig = ? WHERE id = ?",
);
static ANN_SIGS_GET: Query = Query::read(
    "channels_announcement_sigs",
    "SELECT remote_ann_node_sig, remote_ann_bitcoin_sig FROM channels WHERE id = ?",
);

static STATS_IN_OFFERED: Query = Query::write(
    "channel_stats_in_offered",
    "UPDATE channels SET in_payments_offered = COALESCE(in_payments_offered, 0) + 1, \
     in_msatoshi_offered = COALESCE(in_msatoshi_offered, 0) + ? WHERE id = ?",
);
static STATS_IN_FULFILLED: Query = Query::write(
    "channel_stats_in_fulfilled",
    "UPDATE channels SET in_payments_fulfilled = COALESCE(in_payments_fulfilled, 0) + 1, \
     in_msatoshi_fulfilled = COALESCE(in_msatoshi_fulfilled, 0) + ? WHERE id = ?",
);
static STATS_OUT_OFFERED: Query = Query::write(
    "channel_stats_out_offered",
    "UPDATE channels SET out_payments_offered = COALESCE(out_payments_offered, 0) + 1, \
     out_msatoshi_offered = COALESCE(out_msatoshi_offered, 0) + ? WHERE id = ?",
);
static STATS_OUT_FULFILLED: Query = Query::write(
    "channel_stats_out_fulfilled",
    "UPDATE channels SET out_payments_fulfilled = COALESCE(out_payments_fulfilled, 0) + 1, \
     out_msatoshi_fulfilled = COALESCE(out_msatoshi_fulfilled, 0) + ? WHERE id = ?",
);
static STATS_GET: Query = Query::read(
    "channel_stats_get",
    "SELECT in_payments_offered, in_payments_fulfilled, in_msatoshi_offered, \
     in_msatoshi_fulfilled, out_payments_offered, out_payments_fulfilled, \
     out_msatoshi_offered, out_msatoshi_fulfilled \
     FROM channels WHERE id = ?",
);

/// Which HTLC counter of a channel to bump
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatEvent {
    InOffered,
    InFulfilled,
    OutOffered,
    OutFulfilled,
}

// ============================================================================
// Encoding helpers
// ============================================================================

/// One changed HTLC: state byte, then big-endian id
const CHANGED_HTLC_LEN: usize = 9;

fn encode_changed_htlcs(changed: &[ChangedHtlc]) -> Vec<u8> {
    let mut out = Vec::with_capacity(changed.len() * CHANGED_HTLC_LEN);
    for c in changed {
        out.push(c.newstate.db_value() as u8);
        out.extend_from_slice(&c.id.to_be_bytes());
    }
    out
}

fn decode_changed_htlcs(blob: &[u8]) -> Result<Vec<ChangedHtlc>, WalletError> {
    if blob.len() % CHANGED_HTLC_LEN != 0 {
        return Err(WalletError::InvalidData(format!(
            "last_sent_commit length {}",
            blob.len()
        )));
    }
    blob.chunks_exact(CHANGED_HTLC_LEN)
        .map(|c| {
            let newstate = HtlcState::try_from(u64::from(c[0])).map_err(WalletError::InvalidData)?;
            let mut id = [0u8; 8];
            id.copy_from_slice(&c[1..]);
            Ok(ChangedHtlc {
                newstate,
                id: u64::from_be_bytes(id),
            })
        })
        .collect()
}

fn peer_from_row(row: &Row) -> Result<Peer, WalletError> {
    Ok(Peer {
        dbid: row.column_u64(0),
        node_id: row.column_pubkey(1)?,
        address: row.column_text(2).map(str::to_string),
    })
}

fn config_from_row(row: &Row) -> ChannelConfig {
    ChannelConfig {
        id: row.column_u64(0),
        dust_limit: row.column_amount_sat(1),
        max_htlc_value_in_flight: row.column_amount_msat(2),
        channel_reserve: row.column_amount_sat(3),
        htlc_minimum: row.column_amount_msat(4),
        to_self_delay: row.column_u64(5) as u16,
        max_accepted_htlcs: row.column_u64(6) as u16,
    }
}

impl Wallet {
    // ========================================================================
    // Peers
    // ========================================================================

    pub fn peer_by_node_id(&self, node_id: &secp256k1::PublicKey) -> Result<Option<Peer>, WalletError> {
        let mut stmt = self.db.prepare(&PEER_BY_NODE_ID);
        stmt.bind_pubkey(0, node_id);
        stmt.query()?.single().map(|row| peer_from_row(&row)).transpose()
    }

    fn peer_by_dbid(&self, dbid: u64) -> Result<Option<Peer>, WalletError> {
        let mut stmt = self.db.prepare(&PEER_BY_ID);
        stmt.bind_u64(0, dbid);
        stmt.query()?.single().map(|row| peer_from_row(&row)).transpose()
    }

    /// Give `peer` a row id, reusing the row of a known node id
    fn peer_save(&self, peer: &mut Peer) -> Result<(), WalletError> {
        if let Some(known) = self.peer_by_node_id(&peer.node_id)? {
            peer.dbid = known.dbid;
            return Ok(());
        }
        let mut stmt = self.db.prepare(&PEER_INSERT);
        stmt.bind_pubkey(0, &peer.node_id);
        stmt.bind_optional(1, peer.address.as_deref(), |s, p, a| s.bind_text(p, a));
        peer.dbid = stmt.exec()?.last_insert_id;
        Ok(())
    }

    /// Forget a peer
    ///
    /// # Panics
    ///
    /// If a channel still belongs to the peer.
    pub fn peer_delete(&self, peer_dbid: u64) -> Result<(), WalletError> {
        let mut stmt = self.db.prepare(&PEER_CHANNEL_COUNT);
        stmt.bind_u64(0, peer_dbid);
        let channels = stmt.query()?.single().map(|r| r.column_u64(0)).unwrap_or(0);
        if channels > 0 {
            crate::fatal!("Deleting peer {} that still has {} channels", peer_dbid, channels);
        }

        let mut stmt = self.db.prepare(&PEER_DELETE);
        stmt.bind_u64(0, peer_dbid);
        stmt.exec()?;
        Ok(())
    }

    // ========================================================================
    // Channel configs
    // ========================================================================

    fn channel_config_insert(&self) -> Result<u64, WalletError> {
        Ok(self.db.prepare(&CONFIG_INSERT).exec()?.last_insert_id)
    }

    pub fn channel_config_save(&self, config: &ChannelConfig) -> Result<(), WalletError> {
        let mut stmt = self.db.prepare(&CONFIG_UPDATE);
        stmt.bind_amount_sat(0, config.dust_limit);
        stmt.bind_amount_msat(1, config.max_htlc_value_in_flight);
        stmt.bind_amount_sat(2, config.channel_reserve);
        stmt.bind_amount_msat(3, config.htlc_minimum);
        stmt.bind_u64(4, u64::from(config.to_self_delay));
        stmt.bind_u64(5, u64::from(config.max_accepted_htlcs));
        stmt.bind_u64(6, config.id);
        stmt.exec()?;
        Ok(())
    }

    /// A config that a channel refers to; absence is a broken reference
    pub fn channel_config_load(&self, id: u64) -> Result<ChannelConfig, WalletError> {
        let mut stmt = self.db.prepare(&CONFIG_GET);
        stmt.bind_u64(0, id);
        stmt.query()?
            .single()
            .map(|row| config_from_row(&row))
            .ok_or_else(|| WalletError::MissingReference(format!("channel_config {}", id)))
    }

    // ========================================================================
    // Channels
    // ========================================================================

    pub(crate) fn load_max_channel_dbid(&self) -> Result<(), WalletError> {
        let max = self
            .db
            .prepare(&CHANNEL_MAX_ID)
            .query()?
            .single()
            .map(|r| r.column_u64(0))
            .unwrap_or(0);
        self.max_channel_dbid.set(max);
        Ok(())
    }

    /// Allocate the next channel id
    pub fn get_channel_dbid(&self) -> u64 {
        let id = self.max_channel_dbid.get() + 1;
        self.max_channel_dbid.set(id);
        id
    }

    /// Create every row a new channel needs, then save it in full
    pub fn channel_insert(&self, chan: &mut Channel) -> Result<(), WalletError> {
        if chan.peer.dbid == 0 {
            self.peer_save(&mut chan.peer)?;
        }

        chan.dbid = self.get_channel_dbid();
        let mut stmt = self.db.prepare(&CHANNEL_STUB);
        stmt.bind_u64(0, chan.peer.dbid);
        stmt.bind_u64(1, u64::from(chan.first_blocknum));
        stmt.bind_u64(2, chan.dbid);
        stmt.exec()?;

        chan.our_config.id = self.channel_config_insert()?;
        chan.channel_info.their_config.id = self.channel_config_insert()?;
        chan.their_shachain = self.shachain_init()?;

        self.channel_save(chan)?;
        log_channel_event("channel_created", chan.dbid, &chan.state.to_string());
        Ok(())
    }

    /// Persist every mutable field of `chan`
    pub fn channel_save(&self, chan: &Channel) -> Result<(), WalletError> {
        self.channel_config_save(&chan.our_config)?;

        let mut stmt = self.db.prepare(&CHANNEL_SAVE_LOCAL);
        stmt.bind_u64(0, chan.their_shachain.id);
        stmt.bind_optional(1, chan.scid.as_ref(), |s, p, scid| s.bind_short_channel_id(p, scid));
        stmt.bind_u64(2, chan.state.db_value());
        stmt.bind_u64(3, chan.funder.db_value());
        stmt.bind_u64(4, u64::from(chan.channel_flags));
        stmt.bind_u64(5, u64::from(chan.minimum_depth));
        stmt.bind_u64(6, chan.next_index[Side::Local.index()]);
        stmt.bind_u64(7, chan.next_index[Side::Remote.index()]);
        stmt.bind_u64(8, chan.next_htlc_id);
        stmt.bind_txid(9, &chan.funding_txid);
        stmt.bind_u64(10, u64::from(chan.funding_outnum));
        stmt.bind_amount_sat(11, chan.funding);
        stmt.bind_int(12, i32::from(chan.remote_funding_locked));
        stmt.bind_amount_msat(13, chan.push);
        stmt.bind_amount_msat(14, chan.our_msat);
        stmt.bind_optional(15, chan.shutdown_scriptpubkey_remote.as_deref(), |s, p, script| {
            s.bind_script(p, script)
        });
        stmt.bind_u64(16, chan.final_key_idx);
        stmt.bind_u64(17, chan.our_config.id);
        stmt.bind_optional(18, chan.last_tx.as_ref(), |s, p, tx| s.bind_tx(p, tx));
        stmt.bind_optional(19, chan.last_sig.as_ref(), |s, p, sig| s.bind_signature(p, sig));
        stmt.bind_int(20, i32::from(chan.last_was_revoke));
        stmt.bind_u64(21, u64::from(chan.min_possible_feerate));
        stmt.bind_u64(22, u64::from(chan.max_possible_feerate));
        stmt.bind_amount_msat(23, chan.msat_to_us_min);
        stmt.bind_amount_msat(24, chan.msat_to_us_max);
        stmt.bind_u64(25, u64::from(chan.feerate_base));
        stmt.bind_u64(26, u64::from(chan.feerate_ppm));
        stmt.bind_optional(27, chan.remote_upfront_shutdown_script.as_deref(), |s, p, script| {
            s.bind_script(p, script)
        });
        stmt.bind_u64(28, chan.dbid);
        stmt.exec()?;

        let info = &chan.channel_info;
        self.channel_config_save(&info.their_config)?;
        let mut stmt = self.db.prepare(&CHANNEL_SAVE_REMOTE);
        stmt.bind_pubkey(0, &info.remote_fundingkey);
        stmt.bind_pubkey(1, &info.theirbase.revocation);
        stmt.bind_pubkey(2, &info.theirbase.payment);
        stmt.bind_pubkey(3, &info.theirbase.htlc);
        stmt.bind_pubkey(4, &info.theirbase.delayed_payment);
        stmt.bind_pubkey(5, &info.remote_per_commit);
        stmt.bind_pubkey(6, &info.old_remote_per_commit);
        stmt.bind_u64(7, u64::from(info.feerate_per_kw[Side::Local.index()]));
        stmt.bind_u64(8, u64::from(info.feerate_per_kw[Side::Remote.index()]));
        stmt.bind_u64(9, info.their_config.id);
        stmt.bind_optional(10, chan.future_per_commitment_point.as_ref(), |s, p, key| {
            s.bind_pubkey(p, key)
        });
        stmt.bind_u64(11, chan.dbid);
        stmt.exec()?;

        let mut stmt = self.db.prepare(&CHANNEL_SAVE_LAST_SENT);
        if chan.last_sent_commit.is_empty() {
            stmt.bind_null(0);
        } else {
            stmt.bind_blob(0, &encode_changed_htlcs(&chan.last_sent_commit));
        }
        stmt.bind_u64(1, chan.dbid);
        stmt.exec()?;
        Ok(())
    }

    fn channel_from_row(&self, row: &Row) -> Result<Channel, WalletError> {
        let dbid = row.column_u64(0);
        let peer_dbid = row.column_u64(1);
        let peer = self
            .peer_by_dbid(peer_dbid)?
            .ok_or_else(|| WalletError::MissingReference(format!("peer {} of channel {}", peer_dbid, dbid)))?;

        let our_config = self.channel_config_load(row.column_u64(3))?;
        let their_config = self.channel_config_load(row.column_u64(4))?;

        let shachain_id = row.column_u64(27);
        let their_shachain = self.shachain_load(shachain_id).map_err(|e| match e {
            WalletError::NotFound(what) => {
                WalletError::MissingReference(format!("{} of channel {}", what, dbid))
            }
            other => other,
        })?;

        let channel_info = ChannelInfo {
            their_config,
            remote_fundingkey: row.column_pubkey(18)?,
            theirbase: Basepoints {
                revocation: row.column_pubkey(19)?,
                payment: row.column_pubkey(20)?,
                htlc: row.column_pubkey(21)?,
                delayed_payment: row.column_pubkey(22)?,
            },
            remote_per_commit: row.column_pubkey(23)?,
            old_remote_per_commit: row.column_pubkey(24)?,
            feerate_per_kw: [row.column_u64(25) as u32, row.column_u64(26) as u32],
        };

        let last_sent_commit = match row.column_blob(39) {
            Some(blob) => decode_changed_htlcs(blob)?,
            None => Vec::new(),
        };

        Ok(Channel {
            dbid,
            peer,
            scid: row.column_optional(2, |r, c| r.column_short_channel_id(c))?,
            our_config,
            channel_info,
            their_shachain,
            state: ChannelState::try_from(row.column_u64(5)).map_err(WalletError::InvalidData)?,
            funder: Side::try_from(row.column_u64(6)).map_err(WalletError::InvalidData)?,
            channel_flags: row.column_u64(7) as u8,
            minimum_depth: row.column_u64(8) as u32,
            next_index: [row.column_u64(9), row.column_u64(10)],
            next_htlc_id: row.column_u64(11),
            funding_txid: row.column_txid(12)?,
            funding_outnum: row.column_u64(13) as u16,
            funding: row.column_amount_sat(14),
            remote_funding_locked: row.column_u64(15) != 0,
            push: row.column_amount_msat(16),
            our_msat: row.column_amount_msat(17),
            shutdown_scriptpubkey_remote: row.column_script(28),
            final_key_idx: row.column_u64(29),
            last_tx: row.column_optional(30, |r, c| r.column_tx(c))?,
            last_sig: row.column_optional(31, |r, c| r.column_signature(c))?,
            last_htlc_sigs: self.htlc_sigs_load(dbid)?,
            last_was_revoke: row.column_u64(32) != 0,
            first_blocknum: row.column_u64(33) as u32,
            min_possible_feerate: row.column_u64(34) as u32,
            max_possible_feerate: row.column_u64(35) as u32,
            msat_to_us_min: row.column_amount_msat(36),
            msat_to_us_max: row.column_amount_msat(37),
            future_per_commitment_point: row.column_optional(38, |r, c| r.column_pubkey(c))?,
            last_sent_commit,
            feerate_base: row.column_u64(40) as u32,
            feerate_ppm: row.column_u64(41) as u32,
            remote_upfront_shutdown_script: row.column_script(42),
        })
    }

    /// Every channel not yet closed, raising the channel id high-water mark
    pub fn channels_load(&self) -> Result<Vec<Channel>, WalletError> {
        let mut stmt = self.db.prepare(&CHANNELS_ACTIVE);
        stmt.bind_u64(0, ChannelState::Closed.db_value());
        let rows = stmt.query()?;

        let mut channels = Vec::new();
        for row in rows {
            let chan = self.channel_from_row(&row)?;
            if chan.dbid > self.max_channel_dbid.get() {
                self.max_channel_dbid.set(chan.dbid);
            }
            channels.push(chan);
        }
        tracing::debug!(target: "chanstore::wallet", count = channels.len(), "loaded channels");
        Ok(channels)
    }

    /// State of any channel row, closed ones included
    pub fn channel_state(&self, dbid: u64) -> Result<Option<ChannelState>, WalletError> {
        let mut stmt = self.db.prepare(&CHANNEL_STATE);
        stmt.bind_u64(0, dbid);
        stmt.query()?
            .single()
            .map(|row| ChannelState::try_from(row.column_u64(0)).map_err(WalletError::InvalidData))
            .transpose()
    }

    /// Drop a channel's working rows, keeping the channel itself as closed
    pub fn channel_close(&self, dbid: u64) -> Result<(), WalletError> {
        for query in [&CLOSE_HTLCS, &CLOSE_HTLC_SIGS, &CLOSE_CHANNELTXS, &CLOSE_SHACHAIN] {
            let mut stmt = self.db.prepare(query);
            stmt.bind_u64(0, dbid);
            stmt.exec()?;
        }

        let mut stmt = self.db.prepare(&CLOSE_CHANNEL);
        stmt.bind_u64(0, ChannelState::Closed.db_value());
        stmt.bind_u64(1, dbid);
        stmt.exec()?;

        log_channel_event("channel_closed", dbid, &ChannelState::Closed.to_string());
        Ok(())
    }

    // ========================================================================
    // Signatures
    // ========================================================================

    /// Replace the HTLC signatures of the latest commitment
    pub fn htlc_sigs_save(&self, channel_dbid: u64, sigs: &[Signature]) -> Result<(), WalletError> {
        let mut stmt = self.db.prepare(&HTLC_SIGS_DELETE);
        stmt.bind_u64(0, channel_dbid);
        stmt.exec()?;

        for sig in sigs {
            let mut stmt = self.db.prepare(&HTLC_SIGS_INSERT);
            stmt.bind_u64(0, channel_dbid);
            stmt.bind_signature(1, sig);
            stmt.exec()?;
        }
        Ok(())
    }

    pub fn htlc_sigs_load(&self, channel_dbid: u64) -> Result<Vec<Signature>, WalletError> {
        let mut stmt = self.db.prepare(&HTLC_SIGS_GET);
        stmt.bind_u64(0, channel_dbid);
        stmt.query()?
            .map(|row| row.column_signature(0).map_err(WalletError::from))
            .collect()
    }

    pub fn announcement_sigs_save(
        &self,
        channel_dbid: u64,
        sigs: &AnnouncementSigs,
    ) -> Result<(), WalletError> {
        let mut stmt = self.db.prepare(&ANN_SIGS_SAVE);
        stmt.bind_signature(0, &sigs.node_sig);
        stmt.bind_signature(1, &sigs.bitcoin_sig);
        stmt.bind_u64(2, channel_dbid);
        stmt.exec()?;
        Ok(())
    }

    /// Remote announcement signatures, if both were received
    pub fn announcement_sigs_load(&self, channel_dbid: u64) -> Result<Option<AnnouncementSigs>, WalletError> {
        let mut stmt = self.db.prepare(&ANN_SIGS_GET);
        stmt.bind_u64(0, channel_dbid);
        let Some(row) = stmt.query()?.single() else {
            return Ok(None);
        };
        if row.is_null(0) || row.is_null(1) {
            return Ok(None);
        }
        Ok(Some(AnnouncementSigs {
            node_sig: row.column_signature(0)?,
            bitcoin_sig: row.column_signature(1)?,
        }))
    }

    // ========================================================================
    // Stats
    // ========================================================================

    pub fn channel_stats_incr(
        &self,
        channel_dbid: u64,
        event: ChannelStatEvent,
        msat: crate::types::AmountMsat,
    ) -> Result<(), WalletError> {
        let query = match event {
            ChannelStatEvent::InOffered => &STATS_IN_OFFERED,
            ChannelStatEvent::InFulfilled => &STATS_IN_FULFILLED,
            ChannelStatEvent::OutOffered => &STATS_OUT_OFFERED,
            ChannelStatEvent::OutFulfilled => &STATS_OUT_FULFILLED,
        };
        let mut stmt = self.db.prepare(query);
        stmt.bind_amount_msat(0, msat);
        stmt.bind_u64(1, channel_dbid);
        stmt.exec()?;
        Ok(())
    }

    pub fn channel_stats_load(&self, channel_dbid: u64) -> Result<ChannelStats, WalletError> {
        let mut stmt = self.db.prepare(&STATS_GET);
        stmt.bind_u64(0, channel_dbid);
        let row = stmt
            .query()?
            .single()
            .ok_or_else(|| WalletError::NotFound(format!("channel {}", channel_dbid)))?;
        Ok(ChannelStats {
            in_payments_offered: row.column_u64(0),
            in_payments_fulfilled: row.column_u64(1),
            in_msatoshi_offered: row.column_amount_msat(2),
            in_msatoshi_fulfilled: row.column_amount_msat(3),
            out_payments_offered: row.column_u64(4),
            out_payments_fulfilled: row.column_u64(5),
            out_msatoshi_offered: row.column_amount_msat(6),
            out_msatoshi_fulfilled: row.column_amount_msat(7),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_utils::*;
    use super::*;
    use crate::shachain::{shachain_from_seed, shachain_index};
    use crate::types::{AmountMsat, Secret, ShortChannelId};
    use bitcoin::{Amount, ScriptBuf};
    use secp256k1::{Message, Secp256k1, SecretKey};

    fn sig(n: u8) -> Signature {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[n.max(1); 32]).unwrap();
        secp.sign_ecdsa(&Message::from_digest([n; 32]), &sk)
    }

    #[test]
    fn test_insert_then_load_roundtrip() {
        let w = wallet();
        w.transaction(|w| {
            let mut chan = new_channel(w, 1);
            chan.scid = ShortChannelId::new(500_000, 3, 1);
            chan.state = ChannelState::Normal;
            chan.our_config.dust_limit = Amount::from_sat(546);
            chan.channel_info.their_config.to_self_delay = 144;
            chan.last_sig = Some(sig(3));
            chan.shutdown_scriptpubkey_remote = Some(ScriptBuf::from_bytes(vec![0x00, 0x14]));
            chan.last_sent_commit = vec![ChangedHtlc {
                newstate: HtlcState::SentAddCommit,
                id: 9,
            }];
            chan.future_per_commitment_point = Some(pubkey(9));
            let seed = Secret([7; 32]);
            let index = shachain_index(0);
            w.shachain_add_hash(&mut chan.their_shachain, index, &shachain_from_seed(&seed, index))?;
            w.channel_save(&chan)?;
            w.htlc_sigs_save(chan.dbid, &[sig(1), sig(2)])?;
            chan.last_htlc_sigs = vec![sig(1), sig(2)];

            let loaded = w.channels_load()?;
            assert_eq!(loaded.len(), 1);
            assert_eq!(loaded[0], chan);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_same_peer_reused() {
        let w = wallet();
        w.transaction(|w| {
            let a = new_channel(w, 1);
            let b = new_channel(w, 1);
            assert_eq!(a.peer.dbid, b.peer.dbid);
            assert_eq!(b.dbid, a.dbid + 1);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_close_hides_channel_and_keeps_row() {
        let w = wallet();
        w.transaction(|w| {
            let chan = new_channel(w, 1);
            w.htlc_sigs_save(chan.dbid, &[sig(1)])?;
            w.channel_close(chan.dbid)?;

            assert!(w.channels_load()?.is_empty());
            assert_eq!(w.channel_state(chan.dbid)?, Some(ChannelState::Closed));
            assert!(w.htlc_sigs_load(chan.dbid)?.is_empty());
            assert!(matches!(
                w.shachain_load(chan.their_shachain.id),
                Err(WalletError::NotFound(_))
            ));
            // Detached, so the peer can now go
            w.peer_delete(chan.peer.dbid)?;
            Ok(())
        })
        .unwrap();
    }

    #[test]
    #[should_panic(expected = "still has 1 channels")]
    fn test_peer_delete_with_channel_panics() {
        let w = wallet();
        w.db().begin().unwrap();
        let chan = new_channel(&w, 1);
        let _ = w.peer_delete(chan.peer.dbid);
    }

    #[test]
    fn test_channel_ids_survive_reload() {
        let w = wallet();
        w.transaction(|w| {
            new_channel(w, 1);
            new_channel(w, 2);
            Ok(())
        })
        .unwrap();

        w.transaction(|w| {
            w.max_channel_dbid.set(0);
            w.channels_load()?;
            assert_eq!(w.get_channel_dbid(), 3);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_missing_config_is_fatal() {
        let w = wallet();
        w.transaction(|w| {
            let err = w.channel_config_load(77).unwrap_err();
            assert!(matches!(err, WalletError::MissingReference(_)));
            assert!(err.is_fatal());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_stats_and_announcement_sigs() {
        let w = wallet();
        w.transaction(|w| {
            let chan = new_channel(w, 1);
            assert_eq!(w.announcement_sigs_load(chan.dbid)?, None);
            let sigs = AnnouncementSigs {
                node_sig: sig(4),
                bitcoin_sig: sig(5),
            };
            w.announcement_sigs_save(chan.dbid, &sigs)?;
            assert_eq!(w.announcement_sigs_load(chan.dbid)?, Some(sigs));

            w.channel_stats_incr(chan.dbid, ChannelStatEvent::InOffered, AmountMsat(5_000))?;
            w.channel_stats_incr(chan.dbid, ChannelStatEvent::InOffered, AmountMsat(7_000))?;
            w.channel_stats_incr(chan.dbid, ChannelStatEvent::OutFulfilled, AmountMsat(1_000))?;
            let stats = w.channel_stats_load(chan.dbid)?;
            assert_eq!(stats.in_payments_offered, 2);
            assert_eq!(stats.in_msatoshi_offered, AmountMsat(12_000));
            assert_eq!(stats.out_payments_fulfilled, 1);
            assert_eq!(stats.in_payments_fulfilled, 0);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_changed_htlc_encoding_rejects_truncation() {
        let blob = encode_changed_htlcs(&[ChangedHtlc {
            newstate: HtlcState::RcvdAddHtlc,
            id: 1,
        }]);
        assert_eq!(blob.len(), CHANGED_HTLC_LEN);
        assert!(decode_changed_htlcs(&blob[..5]).is_err());
    }
}
