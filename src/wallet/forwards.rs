//! Forwarding Ledger
//!
//! One row per forward attempt, keyed by the incoming and outgoing HTLC.
//! The ledger is bookkeeping only: inconsistent amounts are logged and
//! reported as a zero fee rather than failing the caller.

use chrono::Utc;

use super::{Wallet, WalletError};
use crate::common::logging::{log_broken, EventCategory};
use crate::db::{Query, Row};
use crate::types::{
    AmountMsat, ForwardStatus, Forwarding, ForwardingStats, HtlcIn, HtlcOut, ShortChannelId,
};

static FORWARD_UPSERT: Query = Query::write(
    "forwarded_payments_upsert",
    "INSERT OR REPLACE INTO forwarded_payments (\
     in_htlc_id, out_htlc_id, in_channel_scid, out_channel_scid, in_msatoshi, out_msatoshi, \
     state, received_time, resolved_time, failcode\
     ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
);
// NULL never matches UNIQUE, so a local failure is replaced by hand
static FORWARD_LOCAL_DELETE: Query = Query::write(
    "forwarded_payments_local_delete",
    "DELETE FROM forwarded_payments WHERE in_htlc_id = ? AND out_htlc_id IS NULL",
);
static FORWARDS_SETTLED_AMOUNTS: Query = Query::read(
    "forwarded_payments_settled_amounts",
    "SELECT in_msatoshi, out_msatoshi FROM forwarded_payments \
     WHERE state = ? AND out_msatoshi IS NOT NULL",
);
static FORWARDS_LIST: Query = Query::read(
    "forwarded_payments_list",
    "SELECT f.state, f.in_msatoshi, f.out_msatoshi, hin.payment_hash, f.in_channel_scid, \
     f.out_channel_scid, f.received_time, f.resolved_time, f.failcode \
     FROM forwarded_payments f LEFT JOIN channel_htlcs hin ON (f.in_htlc_id = hin.id)",
);
static FORWARDS_COUNT_BY_STATE: Query = Query::read(
    "forwarded_payments_count_by_state",
    "SELECT state, COUNT(*) FROM forwarded_payments GROUP BY state",
);

/// Fee earned on a forward, zero (and logged) if it paid out more than it took in
fn forward_fee(msat_in: AmountMsat, msat_out: AmountMsat) -> AmountMsat {
    msat_in.checked_sub(msat_out).unwrap_or_else(|| {
        log_broken(
            EventCategory::Forward,
            "FORWARD_FEE_NEGATIVE",
            format!("Forwarded in {} less than out {}", msat_in, msat_out),
        );
        AmountMsat::ZERO
    })
}

fn forwarding_from_row(row: &Row) -> Result<Forwarding, WalletError> {
    let status = ForwardStatus::try_from(row.column_u64(0)).map_err(WalletError::InvalidData)?;
    let msat_in = row.column_amount_msat(1);
    let (msat_out, fee) = if row.is_null(2) {
        (AmountMsat::ZERO, AmountMsat::ZERO)
    } else {
        let msat_out = row.column_amount_msat(2);
        (msat_out, forward_fee(msat_in, msat_out))
    };

    Ok(Forwarding {
        status,
        msat_in,
        msat_out,
        fee,
        payment_hash: row.column_optional(3, |r, c| r.column_sha256(c))?,
        channel_in: ShortChannelId(row.column_u64(4)),
        channel_out: (!row.is_null(5)).then(|| ShortChannelId(row.column_u64(5))),
        received_time: row.column_timeabs(6),
        resolved_time: (!row.is_null(7)).then(|| row.column_timeabs(7)),
        failcode: (!row.is_null(8)).then(|| row.column_u64(8) as u16),
    })
}

impl Wallet {
    /// Record or update the forward of `hin`
    ///
    /// `out` is the outgoing HTLC and its channel, absent only when we
    /// failed the incoming HTLC before forwarding it.
    ///
    /// # Panics
    ///
    /// If a failcode accompanies a status that cannot carry one, or a
    /// forward without an outgoing HTLC is anything but a local failure
    /// with a failcode.
    pub fn forwarded_payment_add(
        &self,
        hin: &HtlcIn,
        in_scid: ShortChannelId,
        out: Option<(&HtlcOut, ShortChannelId)>,
        status: ForwardStatus,
        failcode: u16,
    ) -> Result<(), WalletError> {
        if out.is_none() && (failcode == 0 || status != ForwardStatus::LocalFailed) {
            crate::fatal!(
                "Forward of HTLC {} without outgoing HTLC has status {} and failcode {}",
                hin.dbid,
                status,
                failcode
            );
        }
        if failcode != 0 && !status.may_carry_failcode() {
            crate::fatal!(
                "Forward of HTLC {} has failcode {} in status {}",
                hin.dbid,
                failcode,
                status
            );
        }

        if out.is_none() {
            let mut stmt = self.db.prepare(&FORWARD_LOCAL_DELETE);
            stmt.bind_u64(0, hin.dbid);
            stmt.exec()?;
        }

        let mut stmt = self.db.prepare(&FORWARD_UPSERT);
        stmt.bind_u64(0, hin.dbid);
        match out {
            Some((hout, out_scid)) => {
                stmt.bind_u64(1, hout.dbid);
                stmt.bind_u64(3, out_scid.0);
                stmt.bind_amount_msat(5, hout.msat);
            }
            None => {
                stmt.bind_null(1);
                stmt.bind_null(3);
                stmt.bind_null(5);
            }
        }
        stmt.bind_u64(2, in_scid.0);
        stmt.bind_amount_msat(4, hin.msat);
        stmt.bind_u64(6, status.db_value());
        stmt.bind_timeabs(7, hin.received_time);
        if status.is_resolved() {
            stmt.bind_timeabs(8, Utc::now());
        } else {
            stmt.bind_null(8);
        }
        if failcode != 0 {
            stmt.bind_u64(9, u64::from(failcode));
        } else {
            stmt.bind_null(9);
        }
        stmt.exec()?;

        tracing::info!(
            target: "chanstore::wallet",
            in_htlc = hin.dbid,
            in_channel = %in_scid,
            out_channel = ?out.map(|(_, scid)| scid.to_string()),
            %status,
            failcode,
            "forward recorded"
        );
        Ok(())
    }

    /// Fees earned on settled forwards
    ///
    /// Rows without an outgoing amount earned nothing we can account for.
    pub fn total_forward_fees(&self) -> Result<AmountMsat, WalletError> {
        let mut stmt = self.db.prepare(&FORWARDS_SETTLED_AMOUNTS);
        stmt.bind_u64(0, ForwardStatus::Settled.db_value());
        let mut total = AmountMsat::ZERO;
        for row in stmt.query()? {
            let fee = forward_fee(row.column_amount_msat(0), row.column_amount_msat(1));
            total = total
                .checked_add(fee)
                .ok_or_else(|| WalletError::Overflow(format!("forward fees {} + {}", total, fee)))?;
        }
        Ok(total)
    }

    pub fn forwarded_payments_list(&self) -> Result<Vec<Forwarding>, WalletError> {
        self.db
            .prepare(&FORWARDS_LIST)
            .query()?
            .map(|row| forwarding_from_row(&row))
            .collect()
    }

    pub fn forwarding_stats(&self) -> Result<ForwardingStats, WalletError> {
        let mut stats = ForwardingStats {
            total_fees: self.total_forward_fees()?,
            ..Default::default()
        };
        for row in self.db.prepare(&FORWARDS_COUNT_BY_STATE).query()? {
            let count = row.column_u64(1);
            match ForwardStatus::try_from(row.column_u64(0)).map_err(WalletError::InvalidData)? {
                ForwardStatus::Offered => stats.offered = count,
                ForwardStatus::Settled => stats.settled = count,
                ForwardStatus::Failed => stats.failed = count,
                ForwardStatus::LocalFailed => stats.local_failed = count,
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_utils::*;
    use super::*;
    use crate::types::{Channel, Preimage, TEMPORARY_NODE_FAILURE};

    static SETTLED_WITHOUT_OUT: Query = Query::write(
        "test_forward_settled_without_out",
        "INSERT INTO forwarded_payments (in_htlc_id, in_channel_scid, in_msatoshi, state) \
         VALUES (?, ?, ?, ?)",
    );

    struct Forward {
        hin: HtlcIn,
        hout: HtlcOut,
    }

    fn scid(n: u32) -> ShortChannelId {
        ShortChannelId::new(100 + n, n, 0).unwrap()
    }

    fn htlcs(w: &Wallet, a: &Channel, b: &Channel, n: u8, msat_in: u64, msat_out: u64) -> Forward {
        let hash = Preimage([n; 32]).payment_hash();
        let mut hin = HtlcIn::new(u64::from(n), AmountMsat(msat_in), 500, hash, Vec::new());
        w.htlc_in_save(a.dbid, &mut hin).unwrap();
        let mut hout = HtlcOut::new(u64::from(n), AmountMsat(msat_out), 450, hash, Vec::new());
        hout.origin_htlc = Some(hin.dbid);
        w.htlc_out_save(b.dbid, &mut hout).unwrap();
        Forward { hin, hout }
    }

    #[test]
    fn test_settled_forward_upsert_and_fees() {
        let w = wallet();
        w.transaction(|w| {
            let (a, b) = (new_channel(w, 1), new_channel(w, 2));
            let f = htlcs(w, &a, &b, 1, 50_000, 49_000);

            w.forwarded_payment_add(&f.hin, scid(1), Some((&f.hout, scid(2))), ForwardStatus::Offered, 0)?;
            let listed = w.forwarded_payments_list()?;
            assert_eq!(listed.len(), 1);
            assert_eq!(listed[0].resolved_time, None);
            assert_eq!(w.total_forward_fees()?, AmountMsat::ZERO);

            w.forwarded_payment_add(&f.hin, scid(1), Some((&f.hout, scid(2))), ForwardStatus::Settled, 0)?;
            let listed = w.forwarded_payments_list()?;
            assert_eq!(listed.len(), 1);
            assert_eq!(listed[0].status, ForwardStatus::Settled);
            assert_eq!(listed[0].fee, AmountMsat(1_000));
            assert_eq!(listed[0].payment_hash, Some(f.hin.payment_hash));
            assert_eq!(listed[0].channel_out, Some(scid(2)));
            assert!(listed[0].resolved_time.is_some());
            assert_eq!(w.total_forward_fees()?, AmountMsat(1_000));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_local_failure_has_no_out_leg() {
        let w = wallet();
        w.transaction(|w| {
            let a = new_channel(w, 1);
            let mut hin = HtlcIn::new(9, AmountMsat(10_000), 500, Preimage([9; 32]).payment_hash(), Vec::new());
            w.htlc_in_save(a.dbid, &mut hin)?;
            w.forwarded_payment_add(&hin, scid(1), None, ForwardStatus::LocalFailed, TEMPORARY_NODE_FAILURE)?;

            let listed = w.forwarded_payments_list()?;
            assert_eq!(listed[0].channel_out, None);
            assert_eq!(listed[0].msat_out, AmountMsat::ZERO);
            assert_eq!(listed[0].fee, AmountMsat::ZERO);
            assert_eq!(listed[0].failcode, Some(TEMPORARY_NODE_FAILURE));
            assert_eq!(listed[0].resolved_time, None);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_repeated_local_failure_keeps_one_row() {
        let w = wallet();
        w.transaction(|w| {
            let a = new_channel(w, 1);
            let mut hin = HtlcIn::new(4, AmountMsat(10_000), 500, Preimage([4; 32]).payment_hash(), Vec::new());
            w.htlc_in_save(a.dbid, &mut hin)?;
            for _ in 0..2 {
                w.forwarded_payment_add(&hin, scid(1), None, ForwardStatus::LocalFailed, TEMPORARY_NODE_FAILURE)?;
            }

            assert_eq!(w.forwarded_payments_list()?.len(), 1);
            assert_eq!(w.forwarding_stats()?.local_failed, 1);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_settled_row_without_out_amount_earns_nothing() {
        let w = wallet();
        w.transaction(|w| {
            let a = new_channel(w, 1);
            let mut hin = HtlcIn::new(5, AmountMsat(5_000), 500, Preimage([5; 32]).payment_hash(), Vec::new());
            w.htlc_in_save(a.dbid, &mut hin)?;
            let mut stmt = w.db().prepare(&SETTLED_WITHOUT_OUT);
            stmt.bind_u64(0, hin.dbid);
            stmt.bind_u64(1, scid(1).0);
            stmt.bind_amount_msat(2, hin.msat);
            stmt.bind_u64(3, ForwardStatus::Settled.db_value());
            stmt.exec()?;

            let listed = w.forwarded_payments_list()?;
            assert_eq!(listed[0].fee, AmountMsat::ZERO);
            assert_eq!(w.total_forward_fees()?, AmountMsat::ZERO);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_negative_fee_clamped() {
        let w = wallet();
        w.transaction(|w| {
            let (a, b) = (new_channel(w, 1), new_channel(w, 2));
            let good = htlcs(w, &a, &b, 1, 50_000, 49_000);
            let bad = htlcs(w, &a, &b, 2, 1_000, 2_000);
            for f in [&good, &bad] {
                w.forwarded_payment_add(&f.hin, scid(1), Some((&f.hout, scid(2))), ForwardStatus::Settled, 0)?;
            }

            let fees: Vec<_> = w.forwarded_payments_list()?.iter().map(|f| f.fee).collect();
            assert!(fees.contains(&AmountMsat::ZERO));
            assert_eq!(w.total_forward_fees()?, AmountMsat(1_000));

            let stats = w.forwarding_stats()?;
            assert_eq!(stats.settled, 2);
            assert_eq!(stats.total_fees, AmountMsat(1_000));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_close_keeps_ledger_rows() {
        let w = wallet();
        w.transaction(|w| {
            let (a, b) = (new_channel(w, 1), new_channel(w, 2));
            let f = htlcs(w, &a, &b, 1, 50_000, 49_500);
            w.forwarded_payment_add(&f.hin, scid(1), Some((&f.hout, scid(2))), ForwardStatus::Failed, 0x100f)?;
            w.channel_close(a.dbid)?;

            let listed = w.forwarded_payments_list()?;
            assert_eq!(listed.len(), 1);
            assert_eq!(listed[0].payment_hash, None);
            assert_eq!(listed[0].failcode, Some(0x100f));
            assert_eq!(w.forwarding_stats()?.failed, 1);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    #[should_panic(expected = "without outgoing HTLC")]
    fn test_missing_out_leg_requires_local_failure() {
        let w = wallet();
        w.db().begin().unwrap();
        let a = new_channel(&w, 1);
        let mut hin = HtlcIn::new(1, AmountMsat(1), 1, Preimage([1; 32]).payment_hash(), Vec::new());
        w.htlc_in_save(a.dbid, &mut hin).unwrap();
        let _ = w.forwarded_payment_add(&hin, scid(1), None, ForwardStatus::Failed, 0x2002);
    }
}
