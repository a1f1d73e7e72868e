//! Owned Outputs and Coin Selection
//!
//! Outputs move `available → reserved → spent`, or back from `reserved` to
//! `available` when a selection is abandoned. A [`CoinSelection`] owns its
//! reservations: dropping it without calling [`CoinSelection::confirm`]
//! returns every reserved output to `available`.

use bitcoin::{Amount, OutPoint, Txid};

use super::{Wallet, WalletError};
use crate::db::{Query, Row};
use crate::types::{amount_tx_fee, OutputStatus, OutputType, UnilateralCloseInfo, Utxo};

/// Length of a P2WPKH output script; change always pays to one
const P2WPKH_SCRIPT_LEN: u64 = 22;

static OUTPUT_INSERT: Query = Query::write(
    "outputs_insert",
    "INSERT INTO outputs (\
     prev_out_tx, prev_out_index, value, type, status, keyindex, \
     channel_id, peer_id, commitment_point, confirmation_height, spend_height, scriptpubkey\
     ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
);
static OUTPUTS_ALL: Query = Query::read(
    "outputs_all",
    "SELECT prev_out_tx, prev_out_index, value, type, status, keyindex, \
     channel_id, peer_id, commitment_point, confirmation_height, spend_height, scriptpubkey \
     FROM outputs",
);
static OUTPUTS_BY_STATUS: Query = Query::read(
    "outputs_by_status",
    "SELECT prev_out_tx, prev_out_index, value, type, status, keyindex, \
     channel_id, peer_id, commitment_point, confirmation_height, spend_height, scriptpubkey \
     FROM outputs WHERE status = ?",
);
static OUTPUT_GET: Query = Query::read(
    "outputs_get",
    "SELECT prev_out_tx, prev_out_index, value, type, status, keyindex, \
     channel_id, peer_id, commitment_point, confirmation_height, spend_height, scriptpubkey \
     FROM outputs WHERE prev_out_tx = ? AND prev_out_index = ?",
);
static OUTPUTS_UNCONFIRMED_CLOSEINFO: Query = Query::read(
    "outputs_unconfirmed_closeinfo",
    "SELECT prev_out_tx, prev_out_index, value, type, status, keyindex, \
     channel_id, peer_id, commitment_point, confirmation_height, spend_height, scriptpubkey \
     FROM outputs WHERE channel_id IS NOT NULL AND confirmation_height IS NULL",
);
static OUTPUT_SET_STATUS: Query = Query::write(
    "outputs_set_status",
    "UPDATE outputs SET status = ? WHERE status = ? AND prev_out_tx = ? AND prev_out_index = ?",
);
static OUTPUT_CONFIRM: Query = Query::write(
    "outputs_confirm",
    "UPDATE outputs SET confirmation_height = ? WHERE prev_out_tx = ?",
);

fn utxo_from_row(row: &Row) -> Result<Utxo, WalletError> {
    let close_info = if row.is_null(6) {
        None
    } else {
        Some(UnilateralCloseInfo {
            channel_id: row.column_u64(6),
            peer_id: row.column_pubkey(7)?,
            commitment_point: row.column_pubkey(8)?,
        })
    };

    Ok(Utxo {
        outpoint: OutPoint::new(row.column_txid(0)?, row.column_u64(1) as u32),
        amount: row.column_amount_sat(2),
        output_type: OutputType::try_from(row.column_u64(3)).map_err(WalletError::InvalidData)?,
        status: OutputStatus::try_from(row.column_u64(4)).map_err(WalletError::InvalidData)?,
        keyindex: row.column_u64(5) as u32,
        close_info,
        blockheight: row.column_optional(9, |r, c| Ok(r.column_u64(c) as u32))?,
        spendheight: row.column_optional(10, |r, c| Ok(r.column_u64(c) as u32))?,
        scriptpubkey: row.column_script(11),
    })
}

fn input_weight(utxo: &Utxo) -> u64 {
    // prevout, sequence, and the always-present script length
    let mut weight = (32 + 4 + 4) * 4 + 4;
    // P2SH-wrapped inputs push <0 <20-byte-key-hash>>
    if utxo.is_p2sh() {
        weight += 23 * 4;
    }
    // witness: item count, signature, key
    weight + 1 + (1 + 73 + 1 + 33)
}

fn base_weight(outscript_len: u64, allow_change: bool) -> u64 {
    // version, input count, output count, locktime, segwit marker and flag
    let mut weight = (4 + 1 + 1 + 4) * 4 + 2;
    weight += (8 + 1 + outscript_len) * 4;
    if allow_change {
        weight += (8 + 1 + P2WPKH_SCRIPT_LEN) * 4;
    }
    weight
}

/// Reserved outputs, released on drop unless confirmed
#[must_use = "dropping a selection releases its reservations"]
pub struct CoinSelection<'w> {
    wallet: &'w Wallet,
    utxos: Vec<Utxo>,
    amount: Amount,
    satoshi_in: Amount,
    fee: Amount,
    change: Amount,
    weight: u64,
    armed: bool,
}

impl<'w> CoinSelection<'w> {
    fn empty(wallet: &'w Wallet, weight: u64) -> Self {
        Self {
            wallet,
            utxos: Vec::new(),
            amount: Amount::ZERO,
            satoshi_in: Amount::ZERO,
            fee: Amount::ZERO,
            change: Amount::ZERO,
            weight,
            armed: true,
        }
    }

    /// Reserve `utxo` and account for it
    fn push(&mut self, mut utxo: Utxo) -> Result<(), WalletError> {
        if !self.wallet.update_output_status(
            &utxo.outpoint,
            OutputStatus::Available,
            OutputStatus::Reserved,
        )? {
            return Err(WalletError::ReservationFailed(utxo.outpoint));
        }
        utxo.status = OutputStatus::Reserved;

        self.satoshi_in = self
            .satoshi_in
            .checked_add(utxo.amount)
            .ok_or_else(|| WalletError::Overflow("available satoshis".to_string()))?;
        self.weight += input_weight(&utxo);
        self.utxos.push(utxo);
        Ok(())
    }

    pub fn utxos(&self) -> &[Utxo] {
        &self.utxos
    }

    /// Amount paid to the main output
    pub fn amount(&self) -> Amount {
        self.amount
    }

    pub fn satoshi_in(&self) -> Amount {
        self.satoshi_in
    }

    pub fn fee(&self) -> Amount {
        self.fee
    }

    pub fn change(&self) -> Amount {
        self.change
    }

    /// Estimated weight of the spending transaction
    pub fn weight(&self) -> u64 {
        self.weight
    }

    /// Mark every reserved output spent; the reservation is no longer
    /// released on drop
    ///
    /// On failure the outputs not yet reached stay reserved and are released
    /// when the selection drops.
    pub fn confirm(mut self) -> Result<(), WalletError> {
        let mut reached = 0;
        let mut result = Ok(());
        for utxo in &self.utxos {
            reached += 1;
            match self.wallet.update_output_status(
                &utxo.outpoint,
                OutputStatus::Reserved,
                OutputStatus::Spent,
            ) {
                Ok(true) => {}
                Ok(false) => {
                    result = Err(WalletError::SpendFailed(utxo.outpoint));
                    break;
                }
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }
        self.utxos.drain(..reached);
        if result.is_ok() {
            self.armed = false;
        }
        result
    }
}

impl Drop for CoinSelection<'_> {
    fn drop(&mut self) {
        if !self.armed || self.utxos.is_empty() {
            return;
        }
        if std::thread::panicking() {
            tracing::error!(
                target: "chanstore::wallet",
                outputs = self.utxos.len(),
                "panicking with reserved outputs, not releasing"
            );
            return;
        }

        let wallet = self.wallet;
        let utxos = &self.utxos;
        let result = if wallet.db().in_transaction() {
            wallet.unreserve_utxos(utxos)
        } else {
            wallet.transaction(|w| w.unreserve_utxos(utxos))
        };
        if let Err(e) = result {
            crate::fatal!("Unable to unreserve outputs: {}", e);
        }
    }
}

impl std::fmt::Debug for CoinSelection<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoinSelection")
            .field("utxos", &self.utxos.len())
            .field("amount", &self.amount)
            .field("satoshi_in", &self.satoshi_in)
            .field("fee", &self.fee)
            .field("change", &self.change)
            .field("armed", &self.armed)
            .finish()
    }
}

impl Wallet {
    /// Record a new owned output as available
    ///
    /// Returns `false` if the outpoint is already known.
    pub fn add_utxo(&self, utxo: &Utxo) -> Result<bool, WalletError> {
        let mut stmt = self.db.prepare(&OUTPUT_INSERT);
        stmt.bind_txid(0, &utxo.outpoint.txid);
        stmt.bind_u64(1, u64::from(utxo.outpoint.vout));
        stmt.bind_amount_sat(2, utxo.amount);
        stmt.bind_u64(3, utxo.output_type.db_value());
        stmt.bind_u64(4, OutputStatus::Available.db_value());
        stmt.bind_u64(5, u64::from(utxo.keyindex));
        match &utxo.close_info {
            Some(info) => {
                stmt.bind_u64(6, info.channel_id);
                stmt.bind_pubkey(7, &info.peer_id);
                stmt.bind_pubkey(8, &info.commitment_point);
            }
            None => {
                stmt.bind_null(6);
                stmt.bind_null(7);
                stmt.bind_null(8);
            }
        }
        stmt.bind_optional(9, utxo.blockheight, |s, p, h| s.bind_u64(p, u64::from(h)));
        stmt.bind_optional(10, utxo.spendheight, |s, p, h| s.bind_u64(p, u64::from(h)));
        stmt.bind_optional(11, utxo.scriptpubkey.as_deref(), |s, p, script| {
            s.bind_script(p, script)
        });

        match stmt.exec() {
            Ok(_) => Ok(true),
            Err(crate::db::DbError::Duplicate(_)) => {
                tracing::debug!(target: "chanstore::wallet", outpoint = %utxo.outpoint, "output already known");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// All owned outputs, optionally only those in `status`
    pub fn get_utxos(&self, status: Option<OutputStatus>) -> Result<Vec<Utxo>, WalletError> {
        let rows = match status {
            Some(status) => {
                let mut stmt = self.db.prepare(&OUTPUTS_BY_STATUS);
                stmt.bind_u64(0, status.db_value());
                stmt.query()?
            }
            None => self.db.prepare(&OUTPUTS_ALL).query()?,
        };
        rows.map(|row| utxo_from_row(&row)).collect()
    }

    pub fn get_utxo(&self, outpoint: &OutPoint) -> Result<Option<Utxo>, WalletError> {
        let mut stmt = self.db.prepare(&OUTPUT_GET);
        stmt.bind_txid(0, &outpoint.txid);
        stmt.bind_u64(1, u64::from(outpoint.vout));
        stmt.query()?
            .single()
            .map(|row| utxo_from_row(&row))
            .transpose()
    }

    /// Outputs from a unilateral close whose transaction has not confirmed
    pub fn get_unconfirmed_closeinfo_utxos(&self) -> Result<Vec<Utxo>, WalletError> {
        self.db
            .prepare(&OUTPUTS_UNCONFIRMED_CLOSEINFO)
            .query()?
            .map(|row| utxo_from_row(&row))
            .collect()
    }

    /// Move an output from `old` to `new`; `false` if it was not in `old`
    pub fn update_output_status(
        &self,
        outpoint: &OutPoint,
        old: OutputStatus,
        new: OutputStatus,
    ) -> Result<bool, WalletError> {
        let mut stmt = self.db.prepare(&OUTPUT_SET_STATUS);
        stmt.bind_u64(0, new.db_value());
        stmt.bind_u64(1, old.db_value());
        stmt.bind_txid(2, &outpoint.txid);
        stmt.bind_u64(3, u64::from(outpoint.vout));
        Ok(stmt.exec()?.changes > 0)
    }

    /// Return reserved outputs to `available`
    pub fn unreserve_utxos(&self, utxos: &[Utxo]) -> Result<(), WalletError> {
        for utxo in utxos {
            if !self.update_output_status(
                &utxo.outpoint,
                OutputStatus::Reserved,
                OutputStatus::Available,
            )? {
                return Err(WalletError::UnreserveFailed(utxo.outpoint));
            }
        }
        Ok(())
    }

    /// Reserve available outputs, in storage order, until they cover
    /// `target` plus the fee of the transaction spending them
    ///
    /// With `target == None` every eligible output is taken. A non-zero
    /// `maxheight` skips outputs unconfirmed or confirmed above it.
    fn select(
        &self,
        target: Option<Amount>,
        feerate_per_kw: u32,
        outscript_len: u64,
        allow_change: bool,
        maxheight: u32,
    ) -> Result<CoinSelection<'_>, WalletError> {
        let mut selection = CoinSelection::empty(self, base_weight(outscript_len, allow_change));

        for utxo in self.get_utxos(Some(OutputStatus::Available))? {
            if maxheight != 0 && utxo.blockheight.map_or(true, |h| h > maxheight) {
                continue;
            }
            selection.push(utxo)?;
            selection.fee = amount_tx_fee(feerate_per_kw, selection.weight);

            if let Some(target) = target {
                let needed = target
                    .checked_add(selection.fee)
                    .ok_or_else(|| WalletError::Overflow("amount plus fee".to_string()))?;
                if selection.satoshi_in >= needed {
                    break;
                }
            }
        }
        Ok(selection)
    }

    /// Reserve outputs to pay `amount` at `feerate_per_kw`
    ///
    /// Returns `None`, with nothing left reserved, if the available outputs
    /// cannot cover the amount and fee.
    pub fn select_coins(
        &self,
        amount: Amount,
        feerate_per_kw: u32,
        outscript_len: u64,
        allow_change: bool,
        maxheight: u32,
    ) -> Result<Option<CoinSelection<'_>>, WalletError> {
        let mut selection =
            self.select(Some(amount), feerate_per_kw, outscript_len, allow_change, maxheight)?;

        let change = selection
            .satoshi_in
            .checked_sub(amount)
            .and_then(|rest| rest.checked_sub(selection.fee));
        let Some(change) = change else {
            tracing::debug!(
                target: "chanstore::wallet",
                amount = amount.to_sat(),
                satoshi_in = selection.satoshi_in.to_sat(),
                fee = selection.fee.to_sat(),
                "insufficient funds"
            );
            return Ok(None);
        };

        selection.amount = amount;
        selection.change = if allow_change { change } else { Amount::ZERO };
        Ok(Some(selection))
    }

    /// Reserve every eligible output for a sweep paying their total minus fee
    pub fn select_all(
        &self,
        feerate_per_kw: u32,
        outscript_len: u64,
        maxheight: u32,
    ) -> Result<Option<CoinSelection<'_>>, WalletError> {
        let mut selection = self.select(None, feerate_per_kw, outscript_len, false, maxheight)?;
        match selection.satoshi_in.checked_sub(selection.fee) {
            Some(value) if !selection.utxos.is_empty() => {
                selection.amount = value;
                Ok(Some(selection))
            }
            _ => Ok(None),
        }
    }

    /// Reserve exactly `outpoints`
    ///
    /// Fails with `NotFound`, reserving nothing, if any of them is not an
    /// available owned output.
    pub fn select_specific(&self, outpoints: &[OutPoint]) -> Result<CoinSelection<'_>, WalletError> {
        let mut selection = CoinSelection::empty(self, 0);
        for outpoint in outpoints {
            match self.get_utxo(outpoint)? {
                Some(utxo) if utxo.status == OutputStatus::Available => selection.push(utxo)?,
                _ => return Err(WalletError::NotFound(format!("available output {}", outpoint))),
            }
        }
        selection.amount = selection.satoshi_in;
        Ok(selection)
    }

    /// Record the confirmation height of our outputs created by `txid`
    pub fn confirm_tx(&self, txid: &Txid, confirmation_height: u32) -> Result<usize, WalletError> {
        let mut stmt = self.db.prepare(&OUTPUT_CONFIRM);
        stmt.bind_u64(0, u64::from(confirmation_height));
        stmt.bind_txid(1, txid);
        Ok(stmt.exec()?.changes)
    }
}
