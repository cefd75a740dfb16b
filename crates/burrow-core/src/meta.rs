// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! The meta layer: collection semantics on top of sync.
//!
//! A collection is identified by `cid = hash(owner_fp, uniq)`.  Its
//! Basis record carries `(uniq, owner_public)` and is owner-signed;
//! Writer records (owner-signed) admit or remove writer keys; Data
//! records must verify under a current writer's key.  Replacement is
//! governed by the `(priority, value)` tiebreak, and data changes are
//! surfaced to callbacks as a down event for the leaving value
//! followed by an up event for the arriving one.

use std::io::{Read, Write};
use std::sync::{Arc, RwLock as StdRwLock};

use rand::RngCore;
use tracing::debug;

use crate::crypto::{hash_bytes, hash_pair, Digest, Hasher, PublicIdentity, SecretIdentity, Signature};
use crate::error::{Error, Result};
use crate::store::{FriendId, Record, RT_BASIS, RT_DATA, RT_WRITER};
use crate::sync::{RecordSink, SyncMgr};
use crate::wire::{self, Wire};

/// Key under which the single Basis record of a collection lives.
pub const BASIS_KEY: &str = "$";

/// Data-change observer: `(cid, key, value, author, up)`.  Every
/// replacement fires the old value down before the new value up, with
/// the author whose record is leaving on the down event.
pub type DataCallback = Box<dyn Fn(&str, &str, &[u8], &str, bool) + Send + Sync>;

/// The payload of a Basis record.
#[derive(Clone, Debug)]
struct CollectionBasis {
    uniq: Digest,
    owner: PublicIdentity,
}

impl Wire for CollectionBasis {
    fn encode(&self, out: &mut dyn Write) -> Result<()> {
        self.uniq.encode(out)?;
        self.owner.encode(out)
    }
    fn decode(input: &mut dyn Read) -> Result<Self> {
        Ok(CollectionBasis {
            uniq: Digest::decode(input)?,
            owner: PublicIdentity::decode(input)?,
        })
    }
}

/// The digest a record signature covers.  The author field itself is
/// excluded; the writer check binds author to key instead.
fn record_digest(rec: &Record) -> Digest {
    let mut h = Hasher::new();
    h.write_wire(&rec.rtype);
    h.write_wire(&rec.topic);
    h.write_wire(&rec.key);
    wire::write_bytes(&mut h, &rec.value).expect("hashing cannot fail");
    h.write_wire(&rec.priority);
    h.finalize()
}

fn sign_record(rec: &mut Record, writer: &SecretIdentity) {
    let sig = writer.sign(&record_digest(rec));
    rec.author = writer.fingerprint().to_string();
    rec.signature = wire::to_vec(&sig);
}

fn verify_record(rec: &Record, signer: &PublicIdentity) -> bool {
    let sig: Signature = match wire::from_slice(&rec.signature) {
        Ok(sig) => sig,
        Err(_) => return false,
    };
    signer.verify(&record_digest(rec), &sig)
}

/// The meta manager.
pub struct MetaMgr {
    sync: Arc<SyncMgr>,
    callbacks: StdRwLock<Vec<DataCallback>>,
}

impl MetaMgr {
    pub fn new(sync: Arc<SyncMgr>) -> Arc<MetaMgr> {
        Arc::new(MetaMgr {
            sync,
            callbacks: StdRwLock::new(Vec::new()),
        })
    }

    pub fn sync(&self) -> &Arc<SyncMgr> {
        &self.sync
    }

    pub fn add_callback(&self, callback: DataCallback) {
        self.callbacks
            .write()
            .expect("callback lock poisoned")
            .push(callback);
    }

    fn fire(&self, cid: &str, key: &str, value: &[u8], author: &str, up: bool) {
        let callbacks = self.callbacks.read().expect("callback lock poisoned");
        for cb in callbacks.iter() {
            cb(cid, key, value, author, up);
        }
    }

    /// Create a fresh collection owned by `owner`.
    pub fn create_collection(&self, owner: &SecretIdentity) -> String {
        let mut uniq = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut uniq);
        self.create_special_collection(owner, &hash_bytes(&uniq))
    }

    /// Create a collection with a chosen `uniq`, used for the self,
    /// profile and per-friend collections.  Idempotent.
    pub fn create_special_collection(&self, owner: &SecretIdentity, uniq: &Digest) -> String {
        let public = owner.public();
        let basis = CollectionBasis {
            uniq: *uniq,
            owner: public.clone(),
        };
        let cid = hash_pair(&public.fingerprint(), uniq).to_string();

        if self.sync.get(RT_BASIS, &cid, BASIS_KEY).is_some() {
            return cid;
        }

        let mut basis_rec = Record {
            rtype: RT_BASIS,
            topic: cid.clone(),
            key: BASIS_KEY.to_string(),
            value: wire::to_vec(&basis),
            priority: 0,
            author: String::new(),
            signature: vec![],
        };
        sign_record(&mut basis_rec, owner);
        self.sync.put(&basis_rec);

        let mut owner_rec = Record {
            rtype: RT_WRITER,
            topic: cid.clone(),
            key: public.fingerprint().to_string(),
            value: wire::to_vec(&public),
            priority: 0,
            author: String::new(),
            signature: vec![],
        };
        sign_record(&mut owner_rec, owner);
        self.sync.put(&owner_rec);

        cid
    }

    /// Admit a writer to a collection (owner-signed).
    pub fn add_writer(&self, cid: &str, owner: &SecretIdentity, writer: &PublicIdentity) {
        let key = writer.fingerprint().to_string();
        let new_value = wire::to_vec(writer);
        let mut priority = 0;
        if let Some(existing) = self.sync.get(RT_WRITER, cid, &key) {
            if existing.value == new_value {
                return;
            }
            priority = existing.priority + 1;
        }
        let mut rec = Record {
            rtype: RT_WRITER,
            topic: cid.to_string(),
            key,
            value: new_value,
            priority,
            author: String::new(),
            signature: vec![],
        };
        sign_record(&mut rec, owner);
        self.sync.put(&rec);
    }

    /// Remove a writer: an empty value at one priority higher.
    pub fn remove_writer(&self, cid: &str, owner: &SecretIdentity, key: &str) {
        let Some(existing) = self.sync.get(RT_WRITER, cid, key) else {
            return;
        };
        if existing.value.is_empty() {
            return;
        }
        let mut rec = Record {
            value: vec![],
            priority: existing.priority + 1,
            ..existing
        };
        sign_record(&mut rec, owner);
        self.sync.put(&rec);
    }

    /// Write a data record.  Fails `NotFound` when the collection does
    /// not exist and `Unauthorized` when `writer` has no live (non-
    /// empty) writer row.
    pub fn put(&self, cid: &str, writer: &SecretIdentity, key: &str, data: &[u8]) -> Result<()> {
        if self.sync.get(RT_BASIS, cid, BASIS_KEY).is_none() {
            return Err(Error::not_found(format!("collection {cid}")));
        }
        let fp = writer.fingerprint().to_string();
        let allowed = self
            .sync
            .get(RT_WRITER, cid, &fp)
            .is_some_and(|rec| !rec.value.is_empty());
        if !allowed {
            return Err(Error::Unauthorized(format!(
                "{fp} may not write to collection {cid}"
            )));
        }

        let old = self.sync.get(RT_DATA, cid, key);
        let priority = old.as_ref().map(|o| o.priority + 1).unwrap_or(0);
        let mut rec = Record {
            rtype: RT_DATA,
            topic: cid.to_string(),
            key: key.to_string(),
            value: data.to_vec(),
            priority,
            author: String::new(),
            signature: vec![],
        };
        sign_record(&mut rec, writer);

        if let Some(old) = &old {
            self.fire(cid, key, &old.value, &old.author, false);
        }
        self.sync.put(&rec);
        self.fire(cid, key, data, &fp, true);
        Ok(())
    }

    /// Highest-priority value for a key, if any.
    pub fn get(&self, cid: &str, key: &str) -> Option<Vec<u8>> {
        self.sync.get(RT_DATA, cid, key).map(|rec| rec.value)
    }

    pub fn get_owner(&self, cid: &str) -> Option<PublicIdentity> {
        let rec = self.sync.get(RT_BASIS, cid, BASIS_KEY)?;
        self.decode_basis(&rec, false)
    }

    pub fn get_writer(&self, cid: &str, writer_fp: &str) -> Option<PublicIdentity> {
        let rec = self.sync.get(RT_WRITER, cid, writer_fp)?;
        wire::from_slice(&rec.value).ok()
    }

    /// Decode a Basis record, optionally recomputing the topic hash.
    fn decode_basis(&self, rec: &Record, check: bool) -> Option<PublicIdentity> {
        let basis: CollectionBasis = match wire::from_slice(&rec.value) {
            Ok(basis) => basis,
            Err(err) => {
                debug!("unable to decode basis: {err}");
                return None;
            }
        };
        if check {
            let cid = hash_pair(&basis.owner.fingerprint(), &basis.uniq).to_string();
            if cid != rec.topic {
                debug!("basis hash mismatch: {} vs {}", cid, rec.topic);
                return None;
            }
        }
        Some(basis.owner)
    }

    /// Common acceptance path for replicated Writer and Data records:
    /// the `(priority, value)` tiebreak, then the signature.
    fn verify_update(&self, rec: &Record, signer: &PublicIdentity) {
        let current = self
            .sync
            .get_author(rec.rtype, &rec.topic, &rec.key, &rec.author);
        if let Some(current) = &current {
            if current.priority > rec.priority {
                return;
            }
            if current.priority == rec.priority && current.value >= rec.value {
                debug!("duplicate of current priority and value, ignoring");
                return;
            }
        }
        if !verify_record(rec, signer) {
            debug!("record signature failed to verify, ignoring");
            return;
        }

        if rec.rtype == RT_DATA {
            if let Some(current) = &current {
                self.fire(&rec.topic, &rec.key, &current.value, &current.author, false);
            }
        }
        self.sync.put(rec);
        if rec.rtype == RT_DATA {
            self.fire(&rec.topic, &rec.key, &rec.value, &rec.author, true);
        }
    }

    fn on_basis(&self, rec: &Record) {
        debug!("processing basis for {}", rec.topic);
        if self.sync.get(RT_BASIS, &rec.topic, BASIS_KEY).is_some() {
            debug!("redundant basis, ignoring");
            return;
        }
        let Some(owner) = self.decode_basis(rec, true) else {
            debug!("basis failed to verify, ignoring");
            return;
        };
        if owner.fingerprint().to_string() != rec.author {
            debug!("basis author is not the owner, ignoring");
            return;
        }
        if !verify_record(rec, &owner) {
            debug!("basis signature failed to verify, ignoring");
            return;
        }
        self.sync.put(rec);
    }

    fn on_writer(&self, rec: &Record) {
        debug!("processing writer for {}", rec.topic);
        let Some(basis_rec) = self.sync.get(RT_BASIS, &rec.topic, BASIS_KEY) else {
            debug!("writer before basis, ignoring");
            return;
        };
        let Some(owner) = self.decode_basis(&basis_rec, false) else {
            return;
        };

        // A non-empty value must be the public key hashing to the row
        // key; an empty value expresses removal.
        if !rec.value.is_empty() {
            let writer: PublicIdentity = match wire::from_slice(&rec.value) {
                Ok(writer) => writer,
                Err(err) => {
                    debug!("writer record is malformed: {err}");
                    return;
                }
            };
            if writer.fingerprint().to_string() != rec.key {
                debug!("writer record key does not match its value hash");
                return;
            }
        }
        self.verify_update(rec, &owner);
    }

    fn on_data(&self, rec: &Record) {
        debug!("processing data for {}", rec.topic);
        if self.sync.get(RT_BASIS, &rec.topic, BASIS_KEY).is_none() {
            debug!("data before basis, ignoring");
            return;
        }
        let Some(writer_rec) = self.sync.get(RT_WRITER, &rec.topic, &rec.author) else {
            debug!("write by unauthorized author, ignoring");
            return;
        };
        if writer_rec.value.is_empty() {
            debug!("write by removed author, ignoring");
            return;
        }
        let signer: PublicIdentity = match wire::from_slice(&writer_rec.value) {
            Ok(signer) => signer,
            Err(err) => {
                debug!("error decoding writer record: {err}");
                return;
            }
        };
        self.verify_update(rec, &signer);
    }
}

impl RecordSink for MetaMgr {
    fn on_record(&self, _friend: FriendId, _fp: &Digest, rec: &Record) {
        match rec.rtype {
            RT_BASIS => self.on_basis(rec),
            RT_WRITER => self.on_writer(rec),
            RT_DATA => self.on_data(rec),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::LinkMgr;
    use crate::store::RecordStore;

    fn test_meta() -> (Arc<MetaMgr>, SecretIdentity) {
        let ident = SecretIdentity::generate("");
        let store = Arc::new(RecordStore::open_in_memory().expect("store"));
        let link = LinkMgr::new(
            ident.clone(),
            "127.0.0.1:0".parse().expect("addr"),
            store.clone(),
        )
        .expect("link");
        let sync = SyncMgr::new(link, store);
        (MetaMgr::new(sync), ident)
    }

    #[test]
    fn collection_roundtrip() {
        let (meta, owner) = test_meta();
        let cid = meta.create_collection(&owner);

        meta.put(&cid, &owner, "greeting", b"hello").expect("put");
        assert_eq!(meta.get(&cid, "greeting"), Some(b"hello".to_vec()));

        // Replacement bumps priority and returns the new value.
        meta.put(&cid, &owner, "greeting", b"goodbye").expect("put");
        assert_eq!(meta.get(&cid, "greeting"), Some(b"goodbye".to_vec()));

        let owner_back = meta.get_owner(&cid).expect("owner");
        assert_eq!(owner_back.fingerprint(), owner.fingerprint());
    }

    #[test]
    fn put_to_missing_collection_is_not_found() {
        let (meta, owner) = test_meta();
        match meta.put("nonexistent", &owner, "k", b"v") {
            Err(Error::NotFound(_)) => {}
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[test]
    fn unauthorized_writer_is_rejected_and_emits_nothing() {
        let (meta, owner) = test_meta();
        let carol = SecretIdentity::generate("");
        let cid = meta.create_collection(&owner);

        match meta.put(&cid, &carol, "x", b"data") {
            Err(Error::Unauthorized(_)) => {}
            other => panic!("expected Unauthorized, got {other:?}"),
        }
        assert!(meta.get(&cid, "x").is_none());
    }

    #[test]
    fn added_writer_can_write_until_removed() {
        let (meta, owner) = test_meta();
        let bob = SecretIdentity::generate("");
        let cid = meta.create_collection(&owner);

        meta.add_writer(&cid, &owner, &bob.public());
        meta.put(&cid, &bob, "k", b"from bob").expect("put");

        meta.remove_writer(&cid, &owner, &bob.fingerprint().to_string());
        match meta.put(&cid, &bob, "k2", b"again") {
            Err(Error::Unauthorized(_)) => {}
            other => panic!("expected Unauthorized after removal, got {other:?}"),
        }
    }

    #[test]
    fn replicated_data_with_bad_signature_is_dropped() {
        let (meta, owner) = test_meta();
        let bob = SecretIdentity::generate("");
        let cid = meta.create_collection(&owner);
        meta.add_writer(&cid, &owner, &bob.public());

        let mut rec = Record {
            rtype: RT_DATA,
            topic: cid.clone(),
            key: "k".to_string(),
            value: b"forged".to_vec(),
            priority: 0,
            author: bob.fingerprint().to_string(),
            signature: vec![],
        };
        // Signed by the wrong key entirely.
        let mallory = SecretIdentity::generate("");
        let sig = mallory.sign(&record_digest(&rec));
        rec.signature = wire::to_vec(&sig);

        let fp = bob.fingerprint();
        meta.on_record(1, &fp, &rec);
        assert!(meta.get(&cid, "k").is_none());
    }

    #[test]
    fn replicated_records_apply_in_causal_order() {
        let (alice_meta, alice) = test_meta();
        let (bob_meta, _bob) = test_meta();

        let cid = alice_meta.create_collection(&alice);
        alice_meta.put(&cid, &alice, "k", b"v").expect("put");

        // Replay alice's records at bob in seqno order, as sync would.
        let fp = alice.fingerprint();
        let basis = alice_meta.sync.get(RT_BASIS, &cid, BASIS_KEY).expect("basis");
        let writer = alice_meta
            .sync
            .get(RT_WRITER, &cid, &fp.to_string())
            .expect("writer");
        let data = alice_meta.sync.get(RT_DATA, &cid, "k").expect("data");

        bob_meta.on_record(1, &fp, &basis);
        bob_meta.on_record(1, &fp, &writer);
        bob_meta.on_record(1, &fp, &data);
        assert_eq!(bob_meta.get(&cid, "k"), Some(b"v".to_vec()));
    }

    #[test]
    fn data_before_basis_is_dropped() {
        let (alice_meta, alice) = test_meta();
        let (bob_meta, _) = test_meta();

        let cid = alice_meta.create_collection(&alice);
        alice_meta.put(&cid, &alice, "k", b"v").expect("put");
        let data = alice_meta.sync.get(RT_DATA, &cid, "k").expect("data");

        let fp = alice.fingerprint();
        bob_meta.on_record(1, &fp, &data);
        assert!(bob_meta.get(&cid, "k").is_none());
    }

    #[test]
    fn basis_with_wrong_topic_hash_is_rejected() {
        let (alice_meta, alice) = test_meta();
        let (bob_meta, _) = test_meta();

        let cid = alice_meta.create_collection(&alice);
        let mut basis = alice_meta.sync.get(RT_BASIS, &cid, BASIS_KEY).expect("basis");
        basis.topic = "somewhere-else".to_string();

        let fp = alice.fingerprint();
        bob_meta.on_record(1, &fp, &basis);
        assert!(bob_meta.get_owner("somewhere-else").is_none());
    }

    #[test]
    fn priority_tiebreak_prefers_higher_value() {
        let (alice_meta, alice) = test_meta();
        let (bob_meta, bob) = test_meta();

        let cid = alice_meta.create_collection(&alice);
        alice_meta.add_writer(&cid, &alice, &bob.public());

        // Two records from bob at the same priority; the bytewise
        // larger value must win regardless of arrival order.
        let make = |value: &[u8]| {
            let mut rec = Record {
                rtype: RT_DATA,
                topic: cid.clone(),
                key: "k".to_string(),
                value: value.to_vec(),
                priority: 0,
                author: String::new(),
                signature: vec![],
            };
            sign_record(&mut rec, &bob);
            rec
        };
        let low = make(b"aaa");
        let high = make(b"zzz");

        let basis = alice_meta.sync.get(RT_BASIS, &cid, BASIS_KEY).expect("basis");
        let writer = alice_meta
            .sync
            .get(RT_WRITER, &cid, &bob.fingerprint().to_string())
            .expect("writer");
        let fp = alice.fingerprint();
        bob_meta.on_record(1, &fp, &basis);
        bob_meta.on_record(1, &fp, &writer);

        bob_meta.on_record(1, &fp, &high);
        bob_meta.on_record(1, &fp, &low);
        assert_eq!(bob_meta.get(&cid, "k"), Some(b"zzz".to_vec()));
    }

    #[test]
    fn data_callbacks_fire_down_then_up() {
        use std::sync::Mutex;
        let (meta, owner) = test_meta();
        let cid = meta.create_collection(&owner);

        let events: Arc<Mutex<Vec<(Vec<u8>, bool)>>> = Arc::new(Mutex::new(Vec::new()));
        let captured = events.clone();
        meta.add_callback(Box::new(move |_cid, _key, value, _author, up| {
            captured.lock().expect("lock").push((value.to_vec(), up));
        }));

        meta.put(&cid, &owner, "k", b"one").expect("put");
        meta.put(&cid, &owner, "k", b"two").expect("put");

        let seen = events.lock().expect("lock").clone();
        assert_eq!(
            seen,
            vec![
                (b"one".to_vec(), true),
                (b"one".to_vec(), false),
                (b"two".to_vec(), true),
            ]
        );
    }
}
