// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! The sync layer: reliable, ordered replication of records between
//! friends.
//!
//! Each friend gets a long-lived notify worker that drains pending
//! records in `seqno` order, sends them as one batch over the link
//! layer, and advances the per-topic `acked_seqno` cursors once the
//! transfer succeeds.  Inbound batches are filtered by subscription
//! state and per-topic `heard_seqno` monotonicity, then dispatched to
//! the sink registered for the record type.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::crypto::{hash_pair, hash_str, Digest};
use crate::error::Result;
use crate::link::{FriendListener, FriendStatus, LinkMgr, ResponseStream, Service, ServiceHandler};
use crate::store::{FriendId, Record, RecordEnvelope, RecordStore, RT_SUBSCRIBE};
use crate::wire;

/// Author marker for records generated by the machinery itself
/// (subscriptions, adverts) rather than a signing identity.
pub const LOCAL_AUTHOR: &str = "$";

/// Maximum records in one notify batch.
pub const NOTIFY_BATCH: usize = 100;

/// Minimum spacing between notify attempts after a failure, measured
/// from send start.
pub const FAILURE_RETRY: Duration = Duration::from_secs(5);

/// Inbox topic: records flowing from `friend` to `me`.
pub fn inbox_topic(me: &Digest, friend: &Digest) -> String {
    hash_pair(friend, me).to_string()
}

/// Outbox topic: records flowing from `me` to `friend`.
pub fn outbox_topic(me: &Digest, friend: &Digest) -> String {
    hash_pair(me, friend).to_string()
}

/// A node's private topic.
pub fn self_topic(me: &Digest) -> String {
    hash_pair(me, me).to_string()
}

/// The profile topic of a node, shared with every friend.
pub fn profile_topic(of: &Digest) -> String {
    hash_pair(of, &hash_str("profile")).to_string()
}

/// Destination for inbound records of one type.
pub trait RecordSink: Send + Sync {
    fn on_record(&self, friend: FriendId, fp: &Digest, rec: &Record);
}

struct ClientWorker {
    friend_id: FriendId,
    /// Woken on new work (puts, subscription changes).
    wake: Notify,
    /// Woken only on shutdown; retry sleeps listen here so a put
    /// cannot cut the failure spacing short.
    stop: Notify,
    closing: AtomicBool,
    task: StdMutex<Option<JoinHandle<()>>>,
}

impl ClientWorker {
    fn begin_stop(&self) {
        self.closing.store(true, Ordering::SeqCst);
        self.wake.notify_one();
        self.stop.notify_one();
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }
}

/// The sync manager.  One per node, layered directly on the link.
pub struct SyncMgr {
    weak: Weak<SyncMgr>,
    link: Arc<LinkMgr>,
    store: Arc<RecordStore>,
    sinks: StdMutex<HashMap<u8, Vec<Weak<dyn RecordSink>>>>,
    clients: StdMutex<HashMap<String, Arc<ClientWorker>>>,
}

impl SyncMgr {
    pub fn new(link: Arc<LinkMgr>, store: Arc<RecordStore>) -> Arc<SyncMgr> {
        Arc::new_cyclic(|weak| SyncMgr {
            weak: weak.clone(),
            link,
            store,
            sinks: StdMutex::new(HashMap::new()),
            clients: StdMutex::new(HashMap::new()),
        })
    }

    pub fn link(&self) -> &Arc<LinkMgr> {
        &self.link
    }

    pub fn store(&self) -> &Arc<RecordStore> {
        &self.store
    }

    pub fn self_fingerprint(&self) -> Digest {
        self.link.self_fingerprint()
    }

    /// Register a sink for inbound records of `rtype`.  Several sinks
    /// may share a type; they run in registration order.
    pub fn add_sink(&self, rtype: u8, sink: Weak<dyn RecordSink>) {
        self.sinks
            .lock()
            .expect("sink lock poisoned")
            .entry(rtype)
            .or_default()
            .push(sink);
    }

    /// Store a record and wake every notify worker.  Replaces any
    /// record with the same `(topic, rtype, author, key)`.
    pub fn put(&self, rec: &Record) -> u64 {
        assert!(!rec.topic.is_empty(), "record topic must be set");
        assert!(!rec.key.is_empty(), "record key must be set");
        assert!(!rec.author.is_empty(), "record author must be set");
        debug!("put: {} {:?}", rec.topic, rec.key);
        let seqno = self.store.put(rec).expect("record store put failed");
        let clients = self.clients.lock().expect("client lock poisoned");
        for worker in clients.values() {
            worker.wake.notify_one();
        }
        seqno
    }

    /// Latest record for any author.
    pub fn get(&self, rtype: u8, topic: &str, key: &str) -> Option<Record> {
        self.store
            .get(rtype, topic, key)
            .expect("record store query failed")
    }

    /// Latest record for a specific author.
    pub fn get_author(&self, rtype: u8, topic: &str, key: &str, author: &str) -> Option<Record> {
        self.store
            .get_author(rtype, topic, key, author)
            .expect("record store query failed")
    }

    /// Update the subscription state for a topic on a friend: mark the
    /// topic desired locally and tell the friend via a `Subscribe`
    /// record on our outbox.  The record's priority carries our
    /// `heard_seqno` so a re-subscription does not re-deliver records
    /// we already processed.
    pub fn subscribe(&self, friend_fp: &Digest, topic: &str, enable: bool) -> bool {
        let Some(worker) = self.client(friend_fp) else {
            return false;
        };
        self.store
            .ensure_topic_friend(worker.friend_id, topic, false, false)
            .expect("record store update failed");
        self.store
            .set_desired(worker.friend_id, topic, enable)
            .expect("record store update failed");
        let heard = self
            .store
            .cursor(worker.friend_id, topic)
            .expect("record store query failed")
            .map(|c| c.heard_seqno)
            .unwrap_or(0);

        let me = self.self_fingerprint();
        self.put(&Record {
            rtype: RT_SUBSCRIBE,
            topic: outbox_topic(&me, friend_fp),
            key: topic.to_string(),
            value: vec![u8::from(enable)],
            priority: heard as u32,
            author: LOCAL_AUTHOR.to_string(),
            signature: vec![],
        });
        true
    }

    /// Stop all notify workers.  The link layer is stopped separately
    /// by whoever owns the stack.
    pub async fn stop(&self) {
        let workers: Vec<Arc<ClientWorker>> = {
            let mut clients = self.clients.lock().expect("client lock poisoned");
            clients.drain().map(|(_, w)| w).collect()
        };
        for worker in &workers {
            worker.begin_stop();
        }
        for worker in workers {
            let task = worker.task.lock().expect("task lock poisoned").take();
            if let Some(task) = task {
                let _ = task.await;
            }
        }
    }

    fn client(&self, fp: &Digest) -> Option<Arc<ClientWorker>> {
        self.clients
            .lock()
            .expect("client lock poisoned")
            .get(&fp.to_string())
            .cloned()
    }

    fn sinks_for(&self, rtype: u8) -> Vec<Arc<dyn RecordSink>> {
        let sinks = self.sinks.lock().expect("sink lock poisoned");
        sinks
            .get(&rtype)
            .map(|entries| entries.iter().filter_map(Weak::upgrade).collect())
            .unwrap_or_default()
    }

    fn attach_friend(&self, friend: FriendId, fp: &Digest) {
        debug!("attaching friend {}", fp);
        let me = self.self_fingerprint();
        for topic in [
            inbox_topic(&me, fp),
            outbox_topic(&me, fp),
            profile_topic(&me),
            profile_topic(fp),
        ] {
            self.store
                .ensure_topic_friend(friend, &topic, true, true)
                .expect("record store update failed");
        }

        let worker = Arc::new(ClientWorker {
            friend_id: friend,
            wake: Notify::new(),
            stop: Notify::new(),
            closing: AtomicBool::new(false),
            task: StdMutex::new(None),
        });
        let sync = self.weak.upgrade().expect("sync manager alive");
        let task = tokio::spawn(notify_loop(sync, worker.clone()));
        *worker.task.lock().expect("task lock poisoned") = Some(task);
        self.clients
            .lock()
            .expect("client lock poisoned")
            .insert(fp.to_string(), worker);
    }

    fn detach_friend(&self, friend: FriendId, fp: &Digest) {
        let worker = self
            .clients
            .lock()
            .expect("client lock poisoned")
            .remove(&fp.to_string());
        if let Some(worker) = worker {
            worker.begin_stop();
            let task = worker.task.lock().expect("task lock poisoned").take();
            if let Some(task) = task {
                tokio::spawn(async move {
                    let _ = task.await;
                });
            }
        }
        self.store
            .delete_topic_friends(friend)
            .expect("record store update failed");
    }
}

impl FriendListener for SyncMgr {
    fn on_friend_change(&self, friend: FriendId, fp: &Digest, status: FriendStatus) {
        match status {
            FriendStatus::Startup | FriendStatus::Added => self.attach_friend(friend, fp),
            FriendStatus::Removed => self.detach_friend(friend, fp),
        }
    }
}

/// Inbound notify batches.
#[async_trait]
impl ServiceHandler for SyncMgr {
    async fn handle(
        &self,
        friend: FriendId,
        fp: &Digest,
        body: Vec<u8>,
        _out: &mut ResponseStream<'_>,
    ) -> Result<()> {
        let batch: Vec<RecordEnvelope> = {
            let mut cursor = body.as_slice();
            wire::read_seq(&mut cursor)?
        };
        if self.client(fp).is_none() {
            debug!("notify from non-friend, ignoring");
            return Ok(());
        }

        for env in batch {
            let rec = &env.record;
            debug!("notify in: {} {:?}", rec.topic, rec.key);
            let Some(cursor) = self
                .store
                .cursor(friend, &rec.topic)
                .expect("record store query failed")
            else {
                continue;
            };
            if !cursor.desired || env.seqno <= cursor.heard_seqno {
                continue;
            }
            let sinks = self.sinks_for(rec.rtype);
            if sinks.is_empty() {
                continue;
            }
            for sink in sinks {
                sink.on_record(friend, fp, rec);
            }
            self.store
                .set_heard(friend, &rec.topic, env.seqno)
                .expect("record store update failed");
        }
        Ok(())
    }
}

/// The `Subscribe` sink: a friend announcing (or revoking) interest in
/// a topic.  The carried priority is the friend's `heard_seqno`, which
/// becomes our `acked_seqno` so already-delivered records are skipped.
impl RecordSink for SyncMgr {
    fn on_record(&self, friend: FriendId, fp: &Digest, rec: &Record) {
        if self.client(fp).is_none() {
            return;
        }
        self.store
            .ensure_topic_friend(friend, &rec.key, false, false)
            .expect("record store update failed");
        let enable = rec.value.first().is_some_and(|b| *b != 0);
        self.store
            .set_requested_acked(friend, &rec.key, enable, u64::from(rec.priority))
            .expect("record store update failed");
        if let Some(worker) = self.client(fp) {
            worker.wake.notify_one();
        }
    }
}

async fn notify_loop(sync: Arc<SyncMgr>, worker: Arc<ClientWorker>) {
    let friend = worker.friend_id;
    debug!("notify loop for friend {friend} starting");
    loop {
        if worker.is_closing() {
            break;
        }
        let batch = sync
            .store
            .pending_for(friend, NOTIFY_BATCH)
            .expect("record store query failed");
        if batch.is_empty() {
            worker.wake.notified().await;
            continue;
        }

        let mut acked: HashMap<String, u64> = HashMap::new();
        for env in &batch {
            acked.insert(env.record.topic.clone(), env.seqno);
        }
        let body = {
            let mut buf = Vec::new();
            wire::write_seq(&mut buf, &batch).expect("encoding a batch cannot fail");
            buf
        };
        debug!("notify {} rows to friend {friend}", batch.len());

        let started = tokio::time::Instant::now();
        let result = async {
            let mut resp = sync.link.send(Service::Notify, friend, body).await?;
            let mut sink = tokio::io::sink();
            tokio::io::copy(&mut resp, &mut sink)
                .await
                .map_err(|e| crate::error::Error::transport(format!("notify response: {e}")))?;
            Ok::<(), crate::error::Error>(())
        }
        .await;

        match result {
            Ok(()) => {
                for (topic, seqno) in acked {
                    sync.store
                        .set_acked(friend, &topic, seqno)
                        .expect("record store update failed");
                }
            }
            Err(err) => {
                warn!("notify to friend {friend} failed, retrying: {err}");
                tokio::select! {
                    _ = tokio::time::sleep_until(started + FAILURE_RETRY) => {}
                    _ = worker.stop.notified() => {}
                }
            }
        }
    }
    debug!("notify loop for friend {friend} done");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SecretIdentity;
    use crate::store::RT_DATA;
    use std::sync::Mutex;

    struct CaptureSink {
        records: Mutex<Vec<Record>>,
    }

    impl RecordSink for CaptureSink {
        fn on_record(&self, _friend: FriendId, _fp: &Digest, rec: &Record) {
            self.records.lock().expect("capture lock").push(rec.clone());
        }
    }

    struct TestNode {
        ident_fp: Digest,
        link: Arc<LinkMgr>,
        sync: Arc<SyncMgr>,
        sink: Arc<CaptureSink>,
    }

    async fn test_node() -> TestNode {
        let ident = SecretIdentity::generate("");
        let ident_fp = ident.fingerprint();
        let store = Arc::new(RecordStore::open_in_memory().expect("store"));
        let link = LinkMgr::new(ident, "127.0.0.1:0".parse().expect("addr"), store.clone())
            .expect("link");
        let sync = SyncMgr::new(link.clone(), store);
        link.add_handler(Service::Notify, sync.clone());
        link.add_listener(sync.clone());
        sync.add_sink(RT_SUBSCRIBE, Arc::downgrade(&sync) as Weak<dyn RecordSink>);

        let sink = Arc::new(CaptureSink {
            records: Mutex::new(Vec::new()),
        });
        sync.add_sink(RT_DATA, Arc::downgrade(&sink) as Weak<dyn RecordSink>);

        link.start().await.expect("start");
        TestNode {
            ident_fp,
            link,
            sync,
            sink,
        }
    }

    async fn create_link(a: &TestNode, b: &TestNode) {
        a.link
            .add_update_friend(&b.ident_fp, "unused:0")
            .await
            .expect("add");
        b.link
            .add_update_friend(&a.ident_fp, "unused:0")
            .await
            .expect("add");
        let a_port = a.link.local_addr().expect("addr").port();
        let b_port = b.link.local_addr().expect("addr").port();
        a.link
            .update_host_data(&b.ident_fp, "127.0.0.1", b_port, None)
            .await
            .expect("host");
        b.link
            .update_host_data(&a.ident_fp, "127.0.0.1", a_port, None)
            .await
            .expect("host");
    }

    async fn wait_for<F: Fn() -> bool>(what: &str, cond: F) {
        for _ in 0..600 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("timed out waiting for {what}");
    }

    fn data_record(topic: &str, key: &str, value: &[u8]) -> Record {
        Record {
            rtype: RT_DATA,
            topic: topic.to_string(),
            key: key.to_string(),
            value: value.to_vec(),
            priority: 0,
            author: "unused".to_string(),
            signature: vec![],
        }
    }

    #[tokio::test]
    async fn records_replicate_between_subscribed_friends() {
        let alice = test_node().await;
        let bob = test_node().await;
        create_link(&alice, &bob).await;

        let topic = "CuteKittens";
        assert!(alice.sync.subscribe(&bob.ident_fp, topic, true));
        assert!(bob.sync.subscribe(&alice.ident_fp, topic, true));

        alice.sync.put(&data_record(topic, "key", b"value"));
        wait_for("first record", || {
            !bob.sink.records.lock().expect("lock").is_empty()
        })
        .await;

        alice.sync.put(&data_record(topic, "hello", b"world"));
        alice.sync.put(&data_record(topic, "what", b"the"));
        wait_for("three records", || {
            bob.sink.records.lock().expect("lock").len() >= 3
        })
        .await;

        let seen = bob.sink.records.lock().expect("lock").clone();
        assert!(seen.iter().any(|r| r.key == "hello" && r.value == b"world"));

        alice.sync.stop().await;
        bob.sync.stop().await;
        alice.link.stop().await;
        bob.link.stop().await;
    }

    #[tokio::test]
    async fn resubscription_does_not_redeliver() {
        let alice = test_node().await;
        let bob = test_node().await;
        create_link(&alice, &bob).await;

        let topic = "OldNews";
        alice.sync.subscribe(&bob.ident_fp, topic, true);
        bob.sync.subscribe(&alice.ident_fp, topic, true);

        alice.sync.put(&data_record(topic, "k1", b"v1"));
        wait_for("delivery", || {
            bob.sink.records.lock().expect("lock").len() == 1
        })
        .await;

        // Unsubscribe, then re-subscribe.  The new Subscribe record
        // carries bob's heard_seqno, so nothing is re-sent.
        bob.sync.subscribe(&alice.ident_fp, topic, false);
        bob.sync.subscribe(&alice.ident_fp, topic, true);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(bob.sink.records.lock().expect("lock").len(), 1);

        // New records still flow.
        alice.sync.put(&data_record(topic, "k2", b"v2"));
        wait_for("post-resubscribe delivery", || {
            bob.sink.records.lock().expect("lock").len() == 2
        })
        .await;

        alice.sync.stop().await;
        bob.sync.stop().await;
        alice.link.stop().await;
        bob.link.stop().await;
    }

    #[tokio::test]
    async fn undesired_topics_are_dropped() {
        let alice = test_node().await;
        let bob = test_node().await;
        create_link(&alice, &bob).await;

        // Alice believes bob wants the topic; bob never marked it
        // desired.  Forge the requested flag on alice's side.
        let topic = "Unwanted";
        let bob_id = alice
            .link
            .friend_id(&bob.ident_fp)
            .await
            .expect("friend id");
        alice
            .sync
            .store
            .ensure_topic_friend(bob_id, topic, true, true)
            .expect("tf");

        alice.sync.put(&data_record(topic, "k", b"v"));
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(bob.sink.records.lock().expect("lock").is_empty());

        alice.sync.stop().await;
        bob.sync.stop().await;
        alice.link.stop().await;
        bob.link.stop().await;
    }

    #[test]
    fn well_known_topics_are_derived_from_fingerprints() {
        let a = crate::crypto::hash_bytes(b"a");
        let b = crate::crypto::hash_bytes(b"b");
        assert_eq!(inbox_topic(&a, &b), outbox_topic(&b, &a));
        assert_ne!(inbox_topic(&a, &b), outbox_topic(&a, &b));
        assert_eq!(self_topic(&a), hash_pair(&a, &a).to_string());
        assert_eq!(profile_topic(&a), profile_topic(&a));
        assert_ne!(profile_topic(&a), profile_topic(&b));
    }
}
