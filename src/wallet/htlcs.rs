//! HTLC Store
//!
//! Rows are keyed by `(channel_id, channel_htlc_id, direction)`. Only HTLCs
//! that have not reached the final state of their direction are reloaded.

use bitcoin::hashes::{ripemd160, Hash};

use super::{Wallet, WalletError};
use crate::common::logging::{log_broken, EventCategory};
use crate::db::{Query, Row};
use crate::types::{
    HtlcIn, HtlcOut, HtlcState, HtlcStub, PaymentHash, Preimage, Side, FAILCODE_UPDATE,
    TEMPORARY_NODE_FAILURE,
};

const DIRECTION_INCOMING: u64 = 0;
const DIRECTION_OUTGOING: u64 = 1;

static HTLC_IN_INSERT: Query = Query::write(
    "channel_htlcs_insert_in",
    "INSERT INTO channel_htlcs (\
     channel_id, channel_htlc_id, direction, msatoshi, cltv_expiry, payment_hash, \
     payment_key, hstate, shared_secret, routing_onion, received_time\
     ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
);
static HTLC_OUT_INSERT: Query = Query::write(
    "channel_htlcs_insert_out",
    "INSERT INTO channel_htlcs (\
     channel_id, channel_htlc_id, direction, origin_htlc, msatoshi, cltv_expiry, \
     payment_hash, payment_key, hstate, routing_onion\
     ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
);
static HTLC_UPDATE: Query = Query::write(
    "channel_htlcs_update",
    "UPDATE channel_htlcs SET hstate = ?, payment_key = ?, malformed_onion = ?, failuremsg = ? \
     WHERE id = ?",
);
static HTLCS_IN_LOAD: Query = Query::read(
    "channel_htlcs_load_in",
    "SELECT id, channel_htlc_id, msatoshi, cltv_expiry, hstate, payment_hash, payment_key, \
     routing_onion, failuremsg, malformed_onion, shared_secret, received_time \
     FROM channel_htlcs WHERE direction = ? AND channel_id = ? AND hstate != ?",
);
static HTLCS_OUT_LOAD: Query = Query::read(
    "channel_htlcs_load_out",
    "SELECT id, channel_htlc_id, msatoshi, cltv_expiry, hstate, payment_hash, payment_key, \
     routing_onion, failuremsg, malformed_onion, origin_htlc \
     FROM channel_htlcs WHERE direction = ? AND channel_id = ? AND hstate != ?",
);
static HTLC_STUBS: Query = Query::read(
    "channel_htlcs_stubs",
    "SELECT channel_htlc_id, cltv_expiry, direction, payment_hash \
     FROM channel_htlcs WHERE channel_id = ?",
);
static LOCAL_HTLC_OUT_DELETE: Query = Query::write(
    "channel_htlcs_delete_local_out",
    "DELETE FROM channel_htlcs \
     WHERE direction = ? AND origin_htlc IS NULL AND channel_id = ? AND payment_hash = ?",
);

fn state_from_row(row: &Row, col: usize) -> Result<HtlcState, WalletError> {
    HtlcState::try_from(row.column_u64(col)).map_err(WalletError::InvalidData)
}

fn blob_from_row(row: &Row, col: usize) -> Option<Vec<u8>> {
    row.column_blob(col).map(<[u8]>::to_vec)
}

fn htlc_in_from_row(row: &Row) -> Result<HtlcIn, WalletError> {
    let mut htlc = HtlcIn {
        dbid: row.column_u64(0),
        key_id: row.column_u64(1),
        msat: row.column_amount_msat(2),
        cltv_expiry: row.column_u64(3) as u32,
        hstate: state_from_row(row, 4)?,
        payment_hash: row.column_sha256(5)?,
        preimage: row.column_optional(6, |r, c| r.column_preimage(c))?,
        onion_routing_packet: blob_from_row(row, 7).unwrap_or_default(),
        failuremsg: blob_from_row(row, 8),
        failcode: row.column_u64(9) as u16,
        shared_secret: row.column_optional(10, |r, c| r.column_secret(c))?,
        received_time: row.column_timeabs(11),
    };

    if htlc.failcode & FAILCODE_UPDATE != 0 {
        log_broken(
            EventCategory::Htlc,
            "HTLC_FAILCODE_UPDATE",
            format!(
                "HTLC {} has failcode {:#06x} with the UPDATE bit, using temporary node failure",
                htlc.dbid, htlc.failcode
            ),
        );
        htlc.failcode = TEMPORARY_NODE_FAILURE;
    }

    if htlc.hstate >= HtlcState::SentRemoveHtlc
        && htlc.preimage.is_none()
        && htlc.failcode == 0
        && htlc.failuremsg.is_none()
    {
        log_broken(
            EventCategory::Htlc,
            "HTLC_UNRESOLVED",
            format!(
                "HTLC {} in state {} has no resolution, using temporary node failure",
                htlc.dbid, htlc.hstate
            ),
        );
        htlc.failcode = TEMPORARY_NODE_FAILURE;
    }
    Ok(htlc)
}

fn htlc_out_from_row(row: &Row) -> Result<HtlcOut, WalletError> {
    Ok(HtlcOut {
        dbid: row.column_u64(0),
        key_id: row.column_u64(1),
        msat: row.column_amount_msat(2),
        cltv_expiry: row.column_u64(3) as u32,
        hstate: state_from_row(row, 4)?,
        payment_hash: row.column_sha256(5)?,
        preimage: row.column_optional(6, |r, c| r.column_preimage(c))?,
        onion_routing_packet: blob_from_row(row, 7).unwrap_or_default(),
        failuremsg: blob_from_row(row, 8),
        failcode: row.column_u64(9) as u16,
        origin_htlc: row.column_optional(10, |r, c| Ok(r.column_u64(c)))?,
    })
}

fn htlc_stub_from_row(row: &Row) -> Result<HtlcStub, WalletError> {
    let payment_hash = row.column_sha256(3)?;
    Ok(HtlcStub {
        id: row.column_u64(0),
        cltv_expiry: row.column_u64(1) as u32,
        // Whoever offered the HTLC owns it
        owner: if row.column_u64(2) == DIRECTION_INCOMING {
            Side::Remote
        } else {
            Side::Local
        },
        ripemd: ripemd160::Hash::hash(payment_hash.as_bytes()).to_byte_array(),
    })
}

impl Wallet {
    /// Store a new incoming HTLC and give it its row id
    pub fn htlc_in_save(&self, channel_dbid: u64, htlc: &mut HtlcIn) -> Result<(), WalletError> {
        let mut stmt = self.db.prepare(&HTLC_IN_INSERT);
        stmt.bind_u64(0, channel_dbid);
        stmt.bind_u64(1, htlc.key_id);
        stmt.bind_u64(2, DIRECTION_INCOMING);
        stmt.bind_amount_msat(3, htlc.msat);
        stmt.bind_u64(4, u64::from(htlc.cltv_expiry));
        stmt.bind_sha256(5, &htlc.payment_hash);
        stmt.bind_optional(6, htlc.preimage.as_ref(), |s, p, v| s.bind_preimage(p, v));
        stmt.bind_u64(7, htlc.hstate.db_value());
        stmt.bind_optional(8, htlc.shared_secret.as_ref(), |s, p, v| s.bind_secret(p, v));
        stmt.bind_blob(9, &htlc.onion_routing_packet);
        stmt.bind_timeabs(10, htlc.received_time);
        htlc.dbid = stmt.exec()?.last_insert_id;
        Ok(())
    }

    /// Store a new outgoing HTLC and give it its row id
    ///
    /// # Panics
    ///
    /// If the HTLC is forwarded from an incoming HTLC that has no row yet.
    pub fn htlc_out_save(&self, channel_dbid: u64, htlc: &mut HtlcOut) -> Result<(), WalletError> {
        if htlc.origin_htlc == Some(0) {
            crate::fatal!(
                "Outgoing HTLC {} forwarded from an unsaved incoming HTLC",
                htlc.key_id
            );
        }

        let mut stmt = self.db.prepare(&HTLC_OUT_INSERT);
        stmt.bind_u64(0, channel_dbid);
        stmt.bind_u64(1, htlc.key_id);
        stmt.bind_u64(2, DIRECTION_OUTGOING);
        stmt.bind_optional(3, htlc.origin_htlc, |s, p, v| s.bind_u64(p, v));
        stmt.bind_amount_msat(4, htlc.msat);
        stmt.bind_u64(5, u64::from(htlc.cltv_expiry));
        stmt.bind_sha256(6, &htlc.payment_hash);
        stmt.bind_optional(7, htlc.preimage.as_ref(), |s, p, v| s.bind_preimage(p, v));
        stmt.bind_u64(8, htlc.hstate.db_value());
        stmt.bind_blob(9, &htlc.onion_routing_packet);
        htlc.dbid = stmt.exec()?.last_insert_id;
        Ok(())
    }

    /// Move an HTLC to `new_state`, recording how it was resolved
    pub fn htlc_update(
        &self,
        htlc_dbid: u64,
        new_state: HtlcState,
        payment_key: Option<&Preimage>,
        failcode: u16,
        failuremsg: Option<&[u8]>,
    ) -> Result<(), WalletError> {
        let mut stmt = self.db.prepare(&HTLC_UPDATE);
        stmt.bind_u64(0, new_state.db_value());
        stmt.bind_optional(1, payment_key, |s, p, v| s.bind_preimage(p, v));
        stmt.bind_u64(2, u64::from(failcode));
        stmt.bind_optional(3, failuremsg, |s, p, v| s.bind_blob(p, v));
        stmt.bind_u64(4, htlc_dbid);
        if stmt.exec()?.changes == 0 {
            return Err(WalletError::NotFound(format!("htlc {}", htlc_dbid)));
        }
        Ok(())
    }

    /// Incoming HTLCs of a channel still in flight
    pub fn htlcs_load_in(&self, channel_dbid: u64) -> Result<Vec<HtlcIn>, WalletError> {
        let mut stmt = self.db.prepare(&HTLCS_IN_LOAD);
        stmt.bind_u64(0, DIRECTION_INCOMING);
        stmt.bind_u64(1, channel_dbid);
        stmt.bind_u64(2, HtlcState::SentRemoveAckRevocation.db_value());
        stmt.query()?.map(|row| htlc_in_from_row(&row)).collect()
    }

    /// Outgoing HTLCs of a channel still in flight
    pub fn htlcs_load_out(&self, channel_dbid: u64) -> Result<Vec<HtlcOut>, WalletError> {
        let mut stmt = self.db.prepare(&HTLCS_OUT_LOAD);
        stmt.bind_u64(0, DIRECTION_OUTGOING);
        stmt.bind_u64(1, channel_dbid);
        stmt.bind_u64(2, HtlcState::RcvdRemoveAckRevocation.db_value());
        stmt.query()?.map(|row| htlc_out_from_row(&row)).collect()
    }

    /// Minimal view of every HTLC row of a channel, for onchain resolution
    pub fn htlc_stubs(&self, channel_dbid: u64) -> Result<Vec<HtlcStub>, WalletError> {
        let mut stmt = self.db.prepare(&HTLC_STUBS);
        stmt.bind_u64(0, channel_dbid);
        stmt.query()?.map(|row| htlc_stub_from_row(&row)).collect()
    }

    /// Drop outgoing HTLCs we originated for `payment_hash`
    pub fn local_htlc_out_delete(
        &self,
        channel_dbid: u64,
        payment_hash: &PaymentHash,
    ) -> Result<usize, WalletError> {
        let mut stmt = self.db.prepare(&LOCAL_HTLC_OUT_DELETE);
        stmt.bind_u64(0, DIRECTION_OUTGOING);
        stmt.bind_u64(1, channel_dbid);
        stmt.bind_sha256(2, payment_hash);
        Ok(stmt.exec()?.changes)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_utils::*;
    use super::*;
    use crate::db::DbError;
    use crate::types::{AmountMsat, ChannelState, Secret, FAILCODE_PERM, ONION_PACKET_LEN};

    fn incoming(id: u64, preimage: &Preimage) -> HtlcIn {
        let mut htlc = HtlcIn::new(
            id,
            AmountMsat(50_000),
            500_144,
            preimage.payment_hash(),
            vec![0u8; ONION_PACKET_LEN],
        );
        htlc.shared_secret = Some(Secret([3; 32]));
        htlc
    }

    #[test]
    fn test_in_save_and_reload() {
        let w = wallet();
        w.transaction(|w| {
            let chan = new_channel(w, 1);
            let mut htlc = incoming(7, &Preimage([1; 32]));
            w.htlc_in_save(chan.dbid, &mut htlc)?;
            assert_ne!(htlc.dbid, 0);
            assert_eq!(w.htlcs_load_in(chan.dbid)?, vec![htlc]);
            assert!(w.htlcs_load_out(chan.dbid)?.is_empty());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_duplicate_htlc_rejected() {
        let w = wallet();
        w.transaction(|w| {
            let chan = new_channel(w, 1);
            w.htlc_in_save(chan.dbid, &mut incoming(7, &Preimage([1; 32])))?;
            let err = w
                .htlc_in_save(chan.dbid, &mut incoming(7, &Preimage([2; 32])))
                .unwrap_err();
            assert!(matches!(err, WalletError::Db(DbError::Duplicate(_))));

            // Same id in the other direction is a different HTLC
            let mut out = HtlcOut::new(7, AmountMsat(1), 1, PaymentHash([0; 32]), Vec::new());
            w.htlc_out_save(chan.dbid, &mut out)?;
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_stub_then_close_scenario() {
        let w = wallet();
        let preimage = Preimage([0x42; 32]);
        w.transaction(|w| {
            let chan = new_channel(w, 1);
            let mut htlc = incoming(7, &preimage);
            w.htlc_in_save(chan.dbid, &mut htlc)?;

            let stubs = w.htlc_stubs(chan.dbid)?;
            assert_eq!(stubs.len(), 1);
            assert_eq!(stubs[0].id, 7);
            assert_eq!(stubs[0].owner, Side::Remote);
            assert_eq!(
                stubs[0].ripemd,
                ripemd160::Hash::hash(preimage.payment_hash().as_bytes()).to_byte_array()
            );

            w.htlc_update(htlc.dbid, HtlcState::SentRemoveHtlc, Some(&preimage), 0, None)?;
            assert_eq!(w.htlcs_load_in(chan.dbid)?[0].preimage, Some(preimage));

            w.channel_close(chan.dbid)?;
            assert!(w.htlc_stubs(chan.dbid)?.is_empty());
            assert_eq!(w.channel_state(chan.dbid)?, Some(ChannelState::Closed));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_final_states_not_reloaded() {
        let w = wallet();
        w.transaction(|w| {
            let chan = new_channel(w, 1);
            let mut htlc = incoming(1, &Preimage([1; 32]));
            w.htlc_in_save(chan.dbid, &mut htlc)?;
            w.htlc_update(htlc.dbid, HtlcState::SentRemoveAckRevocation, None, FAILCODE_PERM, None)?;
            assert!(w.htlcs_load_in(chan.dbid)?.is_empty());
            assert_eq!(w.htlc_stubs(chan.dbid)?.len(), 1);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_reload_fixes_unresolved_and_update_failcodes() {
        let w = wallet();
        w.transaction(|w| {
            let chan = new_channel(w, 1);
            let mut a = incoming(1, &Preimage([1; 32]));
            let mut b = incoming(2, &Preimage([2; 32]));
            w.htlc_in_save(chan.dbid, &mut a)?;
            w.htlc_in_save(chan.dbid, &mut b)?;
            w.htlc_update(a.dbid, HtlcState::SentRemoveCommit, None, 0, None)?;
            w.htlc_update(b.dbid, HtlcState::RcvdAddAckRevocation, None, FAILCODE_UPDATE | 7, None)?;

            for htlc in w.htlcs_load_in(chan.dbid)? {
                assert_eq!(htlc.failcode, TEMPORARY_NODE_FAILURE);
            }
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_forwarded_out_references_in() {
        let w = wallet();
        w.transaction(|w| {
            let a = new_channel(w, 1);
            let b = new_channel(w, 2);
            let mut hin = incoming(1, &Preimage([5; 32]));
            w.htlc_in_save(a.dbid, &mut hin)?;

            let mut hout = HtlcOut::new(0, AmountMsat(49_000), 500_100, hin.payment_hash, Vec::new());
            hout.origin_htlc = Some(hin.dbid);
            w.htlc_out_save(b.dbid, &mut hout)?;
            let loaded = w.htlcs_load_out(b.dbid)?;
            assert_eq!(loaded[0].origin_htlc, Some(hin.dbid));
            assert!(!loaded[0].am_origin());

            // Forwarded legs are not ours to clean up
            assert_eq!(w.local_htlc_out_delete(b.dbid, &hin.payment_hash)?, 0);
            let mut local = HtlcOut::new(1, AmountMsat(10), 1, hin.payment_hash, Vec::new());
            w.htlc_out_save(b.dbid, &mut local)?;
            assert_eq!(w.local_htlc_out_delete(b.dbid, &hin.payment_hash)?, 1);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    #[should_panic(expected = "unsaved incoming HTLC")]
    fn test_out_with_unsaved_origin_panics() {
        let w = wallet();
        w.db().begin().unwrap();
        let chan = new_channel(&w, 1);
        let mut hout = HtlcOut::new(0, AmountMsat(1), 1, PaymentHash([0; 32]), Vec::new());
        hout.origin_htlc = Some(0);
        let _ = w.htlc_out_save(chan.dbid, &mut hout);
    }
}
