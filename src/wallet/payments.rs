//! Outgoing Payments
//!
//! A payment is first staged in memory by [`Wallet::payment_setup`] and only
//! written once the caller commits to it with [`Wallet::payment_store`].
//! Lookups consult the staging list first so callers never see the
//! difference.

use super::{Wallet, WalletError};
use crate::db::{Query, Row};
use crate::types::{PaymentFailInfo, PaymentHash, PaymentStatus, Preimage, WalletPayment};

static PAYMENT_INSERT: Query = Query::write(
    "payments_insert",
    "INSERT INTO payments (\
     status, payment_hash, destination, msatoshi, timestamp, path_secrets, route_nodes, \
     route_channels, msatoshi_sent, description, bolt11\
     ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
);
static PAYMENT_DELETE: Query = Query::write(
    "payments_delete",
    "DELETE FROM payments WHERE payment_hash = ?",
);
static PAYMENT_BY_HASH: Query = Query::read(
    "payments_by_hash",
    "SELECT id, status, destination, msatoshi, payment_hash, timestamp, payment_preimage, \
     path_secrets, route_nodes, route_channels, msatoshi_sent, description, bolt11 \
     FROM payments WHERE payment_hash = ?",
);
static PAYMENTS_ALL: Query = Query::read(
    "payments_all",
    "SELECT id, status, destination, msatoshi, payment_hash, timestamp, payment_preimage, \
     path_secrets, route_nodes, route_channels, msatoshi_sent, description, bolt11 \
     FROM payments ORDER BY id",
);
static PAYMENT_SET_STATUS: Query = Query::write(
    "payments_set_status",
    "UPDATE payments SET status = ? WHERE payment_hash = ?",
);
static PAYMENT_SET_PREIMAGE: Query = Query::write(
    "payments_set_preimage",
    "UPDATE payments SET payment_preimage = ? WHERE payment_hash = ?",
);
static PAYMENT_CLEAR_ROUTE: Query = Query::write(
    "payments_clear_route",
    "UPDATE payments SET path_secrets = NULL, route_nodes = NULL, route_channels = NULL \
     WHERE payment_hash = ?",
);
static PAYMENT_GET_FAILINFO: Query = Query::read(
    "payments_get_failinfo",
    "SELECT failonionreply, faildestperm, failindex, failcode, failnode, failchannel, \
     failupdate, faildetail, faildirection FROM payments WHERE payment_hash = ?",
);
static PAYMENT_SET_FAILINFO: Query = Query::write(
    "payments_set_failinfo",
    "UPDATE payments SET failonionreply = ?, faildestperm = ?, failindex = ?, failcode = ?, \
     failnode = ?, failchannel = ?, failupdate = ?, faildetail = ?, faildirection = ? \
     WHERE payment_hash = ?",
);

fn payment_from_row(row: &Row) -> Result<WalletPayment, WalletError> {
    Ok(WalletPayment {
        id: row.column_u64(0),
        status: PaymentStatus::try_from(row.column_u64(1)).map_err(WalletError::InvalidData)?,
        destination: row.column_pubkey(2)?,
        msatoshi: row.column_amount_msat(3),
        payment_hash: row.column_sha256(4)?,
        timestamp: row.column_u64(5),
        payment_preimage: row.column_optional(6, |r, c| r.column_preimage(c))?,
        path_secrets: row.column_optional(7, |r, c| r.column_secret_arr(c))?,
        route_nodes: row.column_optional(8, |r, c| r.column_pubkey_arr(c))?,
        route_channels: row.column_optional(9, |r, c| r.column_short_channel_id_arr(c))?,
        msatoshi_sent: row.column_amount_msat(10),
        label: row.column_text(11).map(str::to_string),
        bolt11: row.column_text(12).map(str::to_string),
    })
}

impl Wallet {
    fn find_unstored_payment(&self, payment_hash: &PaymentHash) -> Option<usize> {
        self.unstored_payments
            .borrow()
            .iter()
            .position(|p| p.payment_hash == *payment_hash)
    }

    /// Stage a payment in memory
    ///
    /// # Panics
    ///
    /// If a payment with the same hash is already staged.
    pub fn payment_setup(&self, payment: WalletPayment) {
        if self.find_unstored_payment(&payment.payment_hash).is_some() {
            crate::fatal!("Payment {} is already set up", payment.payment_hash);
        }
        self.unstored_payments.borrow_mut().push(payment);
    }

    /// Write a staged payment; a payment that is not staged is already stored
    pub fn payment_store(&self, payment_hash: &PaymentHash) -> Result<(), WalletError> {
        let Some(idx) = self.find_unstored_payment(payment_hash) else {
            tracing::debug!(target: "chanstore::wallet", %payment_hash, "payment already stored");
            return Ok(());
        };
        let payment = self.unstored_payments.borrow_mut().remove(idx);
        if payment.id != 0 {
            crate::fatal!("Payment {} stored twice", payment_hash);
        }

        let mut stmt = self.db.prepare(&PAYMENT_INSERT);
        stmt.bind_u64(0, payment.status.db_value());
        stmt.bind_sha256(1, &payment.payment_hash);
        stmt.bind_pubkey(2, &payment.destination);
        stmt.bind_amount_msat(3, payment.msatoshi);
        stmt.bind_u64(4, payment.timestamp);
        stmt.bind_optional(5, payment.path_secrets.as_deref(), |s, p, v| s.bind_secret_arr(p, v));
        stmt.bind_optional(6, payment.route_nodes.as_deref(), |s, p, v| s.bind_pubkey_arr(p, v));
        stmt.bind_optional(7, payment.route_channels.as_deref(), |s, p, v| {
            s.bind_short_channel_id_arr(p, v)
        });
        stmt.bind_amount_msat(8, payment.msatoshi_sent);
        stmt.bind_optional(9, payment.label.as_deref(), |s, p, v| s.bind_text(p, v));
        stmt.bind_optional(10, payment.bolt11.as_deref(), |s, p, v| s.bind_text(p, v));
        stmt.exec()?;
        Ok(())
    }

    /// Forget a payment, staged or stored
    pub fn payment_delete(&self, payment_hash: &PaymentHash) -> Result<(), WalletError> {
        if let Some(idx) = self.find_unstored_payment(payment_hash) {
            self.unstored_payments.borrow_mut().remove(idx);
            return Ok(());
        }
        let mut stmt = self.db.prepare(&PAYMENT_DELETE);
        stmt.bind_sha256(0, payment_hash);
        stmt.exec()?;
        Ok(())
    }

    pub fn payment_by_hash(
        &self,
        payment_hash: &PaymentHash,
    ) -> Result<Option<WalletPayment>, WalletError> {
        if let Some(idx) = self.find_unstored_payment(payment_hash) {
            return Ok(Some(self.unstored_payments.borrow()[idx].clone()));
        }
        let mut stmt = self.db.prepare(&PAYMENT_BY_HASH);
        stmt.bind_sha256(0, payment_hash);
        stmt.query()?.single().map(|row| payment_from_row(&row)).transpose()
    }

    /// Move a payment to `status`
    ///
    /// A staged payment can only fail, which discards it. Stored payments
    /// lose their route details once they leave `pending`.
    pub fn payment_set_status(
        &self,
        payment_hash: &PaymentHash,
        status: PaymentStatus,
        preimage: Option<&Preimage>,
    ) -> Result<(), WalletError> {
        if let Some(idx) = self.find_unstored_payment(payment_hash) {
            if status != PaymentStatus::Failed {
                crate::fatal!(
                    "Unstored payment {} can only fail, not become {}",
                    payment_hash,
                    status
                );
            }
            self.unstored_payments.borrow_mut().remove(idx);
            return Ok(());
        }

        let mut stmt = self.db.prepare(&PAYMENT_SET_STATUS);
        stmt.bind_u64(0, status.db_value());
        stmt.bind_sha256(1, payment_hash);
        if stmt.exec()?.changes == 0 {
            return Err(WalletError::NotFound(format!("payment {}", payment_hash)));
        }

        if let Some(preimage) = preimage {
            let mut stmt = self.db.prepare(&PAYMENT_SET_PREIMAGE);
            stmt.bind_preimage(0, preimage);
            stmt.bind_sha256(1, payment_hash);
            stmt.exec()?;
        }

        if status != PaymentStatus::Pending {
            let mut stmt = self.db.prepare(&PAYMENT_CLEAR_ROUTE);
            stmt.bind_sha256(0, payment_hash);
            stmt.exec()?;
        }
        Ok(())
    }

    pub fn payment_get_failinfo(
        &self,
        payment_hash: &PaymentHash,
    ) -> Result<PaymentFailInfo, WalletError> {
        let mut stmt = self.db.prepare(&PAYMENT_GET_FAILINFO);
        stmt.bind_sha256(0, payment_hash);
        let row = stmt
            .query()?
            .single()
            .ok_or_else(|| WalletError::NotFound(format!("payment {}", payment_hash)))?;

        let failchannel = row.column_optional(5, |r, c| r.column_short_channel_id(c))?;
        Ok(PaymentFailInfo {
            failonionreply: row.column_blob(0).map(<[u8]>::to_vec),
            faildestperm: row.column_int(1) != 0,
            failindex: row.column_int(2),
            failcode: row.column_u64(3) as u16,
            failnode: row.column_optional(4, |r, c| r.column_pubkey(c))?,
            // Direction is only meaningful alongside a channel; old rows report 0
            faildirection: failchannel.map(|_| row.column_u64(8) as u8),
            failchannel,
            failupdate: row.column_blob(6).map(<[u8]>::to_vec),
            faildetail: row.column_text(7).map(str::to_string),
        })
    }

    pub fn payment_set_failinfo(
        &self,
        payment_hash: &PaymentHash,
        info: &PaymentFailInfo,
    ) -> Result<(), WalletError> {
        let mut stmt = self.db.prepare(&PAYMENT_SET_FAILINFO);
        stmt.bind_optional(0, info.failonionreply.as_deref(), |s, p, v| s.bind_blob(p, v));
        stmt.bind_int(1, i32::from(info.faildestperm));
        stmt.bind_int(2, info.failindex);
        stmt.bind_u64(3, u64::from(info.failcode));
        stmt.bind_optional(4, info.failnode.as_ref(), |s, p, v| s.bind_pubkey(p, v));
        stmt.bind_optional(5, info.failchannel.as_ref(), |s, p, v| {
            s.bind_short_channel_id(p, v)
        });
        stmt.bind_optional(6, info.failupdate.as_deref(), |s, p, v| s.bind_blob(p, v));
        stmt.bind_optional(7, info.faildetail.as_deref(), |s, p, v| s.bind_text(p, v));
        match info.failchannel {
            Some(_) => stmt.bind_u64(8, u64::from(info.faildirection.unwrap_or(0))),
            None => stmt.bind_null(8),
        }
        stmt.bind_sha256(9, payment_hash);
        if stmt.exec()?.changes == 0 {
            return Err(WalletError::NotFound(format!("payment {}", payment_hash)));
        }
        Ok(())
    }

    /// Stored payments, followed by staged ones, optionally for one hash
    pub fn payments_list(
        &self,
        payment_hash: Option<&PaymentHash>,
    ) -> Result<Vec<WalletPayment>, WalletError> {
        let rows = match payment_hash {
            Some(hash) => {
                let mut stmt = self.db.prepare(&PAYMENT_BY_HASH);
                stmt.bind_sha256(0, hash);
                stmt.query()?
            }
            None => self.db.prepare(&PAYMENTS_ALL).query()?,
        };
        let mut payments = rows
            .map(|row| payment_from_row(&row))
            .collect::<Result<Vec<_>, _>>()?;

        payments.extend(
            self.unstored_payments
                .borrow()
                .iter()
                .filter(|p| payment_hash.map_or(true, |h| p.payment_hash == *h))
                .cloned(),
        );
        Ok(payments)
    }
}
