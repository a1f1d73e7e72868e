//! End-to-end tests against an on-disk store
//!
//! Each test works on its own database file under the system temp dir.

use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;

use bitcoin::hashes::Hash;
use bitcoin::{Amount, OutPoint, Txid};
use chanstore::db::Query;
use chanstore::types::{
    AmountMsat, Basepoints, Channel, ChannelConfig, ChannelInfo, ChannelState, HtlcIn, HtlcState,
    OutputStatus, OutputType, Peer, Preimage, Secret, Side, Utxo,
};
use chanstore::{migrate, Db, DbError, MigrationContext, Network, StoreConfig, Wallet, WalletError};
use secp256k1::{PublicKey, Secp256k1, SecretKey};

static HTLC_ROWS: Query = Query::read(
    "it_htlc_rows",
    "SELECT COUNT(*) FROM channel_htlcs WHERE channel_id = ?",
);
static UPGRADE_ROWS: Query = Query::read("it_upgrade_rows", "SELECT COUNT(*) FROM db_upgrades");
static BUMP_VERSION: Query = Query::write("it_bump_version", "UPDATE version SET version = version + 1");

struct TempStore(PathBuf);

impl TempStore {
    fn new(name: &str) -> Self {
        let path = std::env::temp_dir().join(format!(
            "chanstore-it-{}-{}.sqlite3",
            std::process::id(),
            name
        ));
        let _ = std::fs::remove_file(&path);
        Self(path)
    }

    fn config(&self, network: Network) -> StoreConfig {
        StoreConfig::for_network(network, &self.0)
    }
}

impl Drop for TempStore {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

fn pubkey(n: u8) -> PublicKey {
    let secp = Secp256k1::new();
    PublicKey::from_secret_key(&secp, &SecretKey::from_slice(&[n; 32]).unwrap())
}

fn new_channel(w: &Wallet, n: u8) -> Channel {
    let info = ChannelInfo {
        their_config: ChannelConfig::default(),
        remote_fundingkey: pubkey(10),
        theirbase: Basepoints {
            revocation: pubkey(11),
            payment: pubkey(12),
            htlc: pubkey(13),
            delayed_payment: pubkey(14),
        },
        remote_per_commit: pubkey(15),
        old_remote_per_commit: pubkey(16),
        feerate_per_kw: [253, 253],
    };
    let mut chan = Channel::new(
        Peer::new(pubkey(n), None),
        info,
        Txid::from_byte_array([n; 32]),
        0,
        Amount::from_sat(1_000_000),
        Side::Local,
    );
    w.channel_insert(&mut chan).unwrap();
    chan
}

fn count(w: &Wallet, query: &'static Query, arg: Option<u64>) -> u64 {
    let mut stmt = w.db().prepare(query);
    if let Some(arg) = arg {
        stmt.bind_u64(0, arg);
    }
    stmt.query().unwrap().single().map(|r| r.column_u64(0)).unwrap_or(0)
}

#[test]
fn test_reopen_restores_channels_and_checks_network() {
    let store = TempStore::new("reopen");
    let chan = {
        let w = Wallet::open(&store.config(Network::Regtest)).unwrap();
        w.transaction(|w| {
            let mut chan = new_channel(w, 1);
            let seed = Secret([0x5a; 32]);
            let index = chanstore::shachain::shachain_index(0);
            w.shachain_add_hash(
                &mut chan.their_shachain,
                index,
                &chanstore::shachain::shachain_from_seed(&seed, index),
            )?;
            chan.state = ChannelState::Normal;
            w.channel_save(&chan)?;
            Ok(chan)
        })
        .unwrap()
    };

    let w = Wallet::open(&store.config(Network::Regtest)).unwrap();
    let loaded = w.transaction(|w| w.channels_load()).unwrap();
    assert_eq!(loaded, vec![chan.clone()]);
    let upgrades = w.transaction(|w| Ok(count(w, &UPGRADE_ROWS, None))).unwrap();
    assert_eq!(upgrades, 1);

    // A new channel never reuses an id
    let next = w.transaction(|w| Ok(new_channel(w, 2))).unwrap();
    assert!(next.dbid > chan.dbid);
    drop(w);

    let err = Wallet::open(&store.config(Network::Mainnet)).err().unwrap();
    assert!(matches!(err, WalletError::NetworkMismatch { .. }));
    assert!(err.is_fatal());
}

#[test]
fn test_newer_store_is_refused() {
    let store = TempStore::new("downgrade");
    drop(Wallet::open(&store.config(Network::Regtest)).unwrap());

    let db = Db::open(&store.0).unwrap();
    db.transaction(|db| db.prepare(&BUMP_VERSION).exec().map(|_| ()))
        .unwrap();
    let err = migrate(&db, &MigrationContext::default()).unwrap_err();
    assert!(matches!(err, DbError::Downgrade { .. }));
    assert!(err.is_fatal());
}

#[test]
fn test_two_outputs_selected_without_change() {
    let w = Wallet::in_memory(Network::Regtest).unwrap();
    let a = OutPoint::new(Txid::from_byte_array([1; 32]), 0);
    let b = OutPoint::new(Txid::from_byte_array([2; 32]), 0);
    w.transaction(|w| {
        w.add_utxo(&Utxo::new(a, Amount::from_sat(10_000), 1, OutputType::P2wpkh))?;
        w.add_utxo(&Utxo::new(b, Amount::from_sat(8_000), 2, OutputType::P2wpkh))
    })
    .unwrap();

    w.db().begin().unwrap();
    let sel = w
        .select_coins(Amount::from_sat(12_000), 700, 22, false, 0)
        .unwrap()
        .unwrap();
    assert_eq!(sel.satoshi_in(), Amount::from_sat(18_000));
    assert_eq!(sel.utxos().len(), 2);
    assert!(sel.fee() > Amount::ZERO);
    assert!(Amount::from_sat(10_000) < Amount::from_sat(12_000) + sel.fee());
    sel.confirm().unwrap();
    w.db().commit().unwrap();

    let available = w
        .transaction(|w| w.get_utxos(Some(OutputStatus::Available)))
        .unwrap();
    assert!(available.is_empty());
    let spent = w.transaction(|w| w.get_utxos(Some(OutputStatus::Spent))).unwrap();
    assert_eq!(spent.len(), 2);
}

#[test]
fn test_htlc_seven_then_close() {
    let w = Wallet::in_memory(Network::Regtest).unwrap();
    let preimage = Preimage([0x77; 32]);

    let chan = w.transaction(|w| Ok(new_channel(w, 3))).unwrap();
    let mut htlc = HtlcIn::new(7, AmountMsat(50_000), 600_000, preimage.payment_hash(), Vec::new());
    w.transaction(|w| w.htlc_in_save(chan.dbid, &mut htlc)).unwrap();

    let stubs = w.transaction(|w| w.htlc_stubs(chan.dbid)).unwrap();
    assert_eq!(stubs.len(), 1);
    assert_eq!(stubs[0].id, 7);
    assert_eq!(stubs[0].owner, Side::Remote);

    w.transaction(|w| {
        w.htlc_update(htlc.dbid, HtlcState::SentRemoveHtlc, Some(&preimage), 0, None)?;
        w.channel_close(chan.dbid)
    })
    .unwrap();

    w.transaction(|w| {
        assert_eq!(count(w, &HTLC_ROWS, Some(chan.dbid)), 0);
        assert_eq!(w.channel_state(chan.dbid)?, Some(ChannelState::Closed));
        assert!(w.channels_load()?.is_empty());
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_changelog_reaches_hook_once_per_commit() {
    let w = Wallet::in_memory(Network::Regtest).unwrap();
    let seen: Rc<RefCell<Vec<(Vec<String>, bool)>>> = Rc::default();
    let sink = Rc::clone(&seen);
    w.db()
        .set_change_hook(move |changes, is_final| sink.borrow_mut().push((changes.to_vec(), is_final)));

    let outpoint = OutPoint::new(Txid::from_byte_array([9; 32]), 1);
    w.transaction(|w| w.add_utxo(&Utxo::new(outpoint, Amount::from_sat(1_000), 1, OutputType::P2wpkh)))
        .unwrap();
    // Reads alone do not notify
    w.transaction(|w| w.get_utxos(None)).unwrap();

    let seen = seen.borrow();
    assert_eq!(seen.len(), 1);
    assert!(seen[0].1);
    assert!(seen[0].0.iter().any(|sql| sql.starts_with("INSERT INTO outputs")));
}

#[test]
fn test_failed_transaction_leaves_no_trace() {
    let w = Wallet::in_memory(Network::Regtest).unwrap();
    let outpoint = OutPoint::new(Txid::from_byte_array([4; 32]), 0);
    let result: Result<(), WalletError> = w.transaction(|w| {
        w.add_utxo(&Utxo::new(outpoint, Amount::from_sat(1_000), 1, OutputType::P2wpkh))?;
        Err(WalletError::NotFound("abandoned".to_string()))
    });
    assert!(result.is_err());
    assert_eq!(w.transaction(|w| w.get_utxo(&outpoint)).unwrap(), None);
}
