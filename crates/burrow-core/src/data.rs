// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! The data layer: content-addressed blob storage and distribution.
//!
//! Blobs are keyed by the SHA-224 digest of their bytes and live as
//! plain files under the data directory.  Meta-layer data records
//! reference blobs by digest; record up/down events drive a per-topic
//! tracking count, which in turn drives advert records telling friends
//! whether we hold the blob.  A single download task pulls wanted
//! blobs from advertised holders, one at a time, with a five second
//! floor between failed attempts.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::advert::BlobSource;
use crate::crypto::{random_string, Digest, Hasher};
use crate::error::{Error, Result};
use crate::link::{LinkMgr, ResponseStream, Service, ServiceHandler};
use crate::meta::MetaMgr;
use crate::store::{FriendId, Record, RecordStore, RT_ADVERT};
use crate::sync::{SyncMgr, LOCAL_AUTHOR};
use crate::wire::{self, Wire};

const BLOB_NOT_READY: u8 = 0;
const BLOB_READY: u8 = 1;
const BLOB_LOCAL: u8 = 2;

const DOWNLOAD_RETRY: Duration = Duration::from_secs(5);
const COPY_BUF: usize = 64 * 1024;

/// Persisted per-blob state, stored wire-encoded in the blob table.
#[derive(Debug, Clone)]
struct BlobState {
    key: String,
    holds: i64,
    state: u8,
    downloading: bool,
    tracking: BTreeMap<String, i64>,
}

impl BlobState {
    fn new(key: &str) -> Self {
        BlobState {
            key: key.to_string(),
            holds: 0,
            state: BLOB_NOT_READY,
            downloading: false,
            tracking: BTreeMap::new(),
        }
    }
}

impl Wire for BlobState {
    fn encode(&self, out: &mut dyn Write) -> Result<()> {
        wire::write_string(out, &self.key)?;
        self.holds.encode(out)?;
        self.state.encode(out)?;
        self.downloading.encode(out)?;
        self.tracking.encode(out)
    }
    fn decode(input: &mut dyn Read) -> Result<Self> {
        Ok(BlobState {
            key: wire::read_string(input)?,
            holds: i64::decode(input)?,
            state: u8::decode(input)?,
            downloading: bool::decode(input)?,
            tracking: BTreeMap::decode(input)?,
        })
    }
}

/// The blob table: every read-modify-write of blob state happens with
/// this locked, so holds, tracking and the on-disk file stay coherent.
struct BlobTable {
    store: Arc<RecordStore>,
    sync: Arc<SyncMgr>,
    dir: PathBuf,
    wake: Arc<Notify>,
}

impl BlobTable {
    fn maybe_get(&self, key: &str) -> Option<BlobState> {
        let data = self
            .store
            .blob_data(key)
            .expect("record store query failed")?;
        let state: BlobState =
            wire::from_slice(&data).expect("corrupt blob state in record store");
        Some(state)
    }

    fn get(&self, key: &str) -> BlobState {
        self.maybe_get(key).unwrap_or_else(|| BlobState::new(key))
    }

    /// Persist a blob row, or delete it (and any local file) once it
    /// serves no purpose.
    fn write(&self, blob: &BlobState) {
        if blob.tracking.is_empty() && blob.holds == 0 {
            if blob.state == BLOB_LOCAL {
                let _ = std::fs::remove_file(self.dir.join(&blob.key));
            }
            self.store
                .delete_blob(&blob.key)
                .expect("record store update failed");
        } else {
            let needs_download = blob.state == BLOB_READY && !blob.downloading;
            self.store
                .put_blob(&blob.key, needs_download, &wire::to_vec(blob))
                .expect("record store update failed");
            if needs_download {
                self.wake.notify_one();
            }
        }
    }

    /// Publish (or retract) our advert for a blob on a topic.
    fn advertize(&self, topic: &str, key: &str, up: bool) {
        debug!("advertize topic={topic} key={key} up={up}");
        self.sync.put(&Record {
            rtype: RT_ADVERT,
            topic: topic.to_string(),
            key: key.to_string(),
            value: if up { vec![1] } else { vec![] },
            priority: 0,
            author: LOCAL_AUTHOR.to_string(),
            signature: vec![],
        });
    }

    /// A finished file becomes the local copy and is advertised on
    /// every tracked topic.
    fn install_file(&self, blob: &mut BlobState, tmp: &Path) {
        if blob.state == BLOB_LOCAL {
            let _ = std::fs::remove_file(tmp);
            return;
        }
        if let Err(err) = std::fs::rename(tmp, self.dir.join(&blob.key)) {
            warn!("unable to install blob {}: {err}", blob.key);
            let _ = std::fs::remove_file(tmp);
            return;
        }
        debug!("blob {} is now local", blob.key);
        blob.state = BLOB_LOCAL;
        for topic in blob.tracking.keys() {
            self.advertize(topic, &blob.key, true);
        }
    }

    fn track_up(&self, blob: &mut BlobState, topic: &str) {
        let count = blob.tracking.entry(topic.to_string()).or_insert(0);
        *count += 1;
        if blob.state == BLOB_LOCAL && *count == 1 {
            self.advertize(topic, &blob.key, true);
        }
        if blob.state == BLOB_NOT_READY
            && self
                .store
                .any_adverts(&blob.key)
                .expect("record store query failed")
        {
            blob.state = BLOB_READY;
        }
    }

    fn track_down(&self, blob: &mut BlobState, topic: &str) {
        let remove = match blob.tracking.get_mut(topic) {
            Some(count) => {
                *count -= 1;
                *count <= 0
            }
            None => false,
        };
        if remove {
            blob.tracking.remove(topic);
            if blob.state == BLOB_LOCAL {
                self.advertize(topic, &blob.key, false);
            }
        }
    }
}

/// The data manager.
pub struct DataMgr {
    link: Arc<LinkMgr>,
    meta: Arc<MetaMgr>,
    store: Arc<RecordStore>,
    table: StdMutex<BlobTable>,
    dir: PathBuf,
    incoming: PathBuf,
    wake: Arc<Notify>,
    stop_notify: Notify,
    closing: AtomicBool,
    task: StdMutex<Option<JoinHandle<()>>>,
}

impl DataMgr {
    pub fn new(dir: impl Into<PathBuf>, meta: Arc<MetaMgr>) -> Result<Arc<DataMgr>> {
        let dir = dir.into();
        let incoming = dir.join("incoming");
        std::fs::create_dir_all(&incoming)?;

        let sync = meta.sync().clone();
        let link = sync.link().clone();
        let store = sync.store().clone();
        let wake = Arc::new(Notify::new());
        Ok(Arc::new(DataMgr {
            link,
            meta,
            store: store.clone(),
            table: StdMutex::new(BlobTable {
                store,
                sync,
                dir: dir.clone(),
                wake: wake.clone(),
            }),
            dir,
            incoming,
            wake,
            stop_notify: Notify::new(),
            closing: AtomicBool::new(false),
            task: StdMutex::new(None),
        }))
    }

    pub fn meta(&self) -> &Arc<MetaMgr> {
        &self.meta
    }

    fn table(&self) -> MutexGuard<'_, BlobTable> {
        self.table.lock().expect("blob table lock poisoned")
    }

    /// Start the download task.
    pub fn start(self: &Arc<Self>) {
        let mgr = self.clone();
        let task = tokio::spawn(download_loop(mgr));
        *self.task.lock().expect("task lock poisoned") = Some(task);
    }

    pub async fn stop(&self) {
        self.closing.store(true, Ordering::SeqCst);
        self.wake.notify_one();
        self.stop_notify.notify_one();
        let task = self.task.lock().expect("task lock poisoned").take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// Meta-layer data callback: a record referencing a blob came up
    /// or went down on a topic.
    pub fn on_meta(&self, topic: &str, _key: &str, value: &[u8], _author: &str, up: bool) {
        let digest: Digest = match wire::from_slice(value) {
            Ok(digest) => digest,
            Err(_) => {
                debug!("unable to decode data record value as a digest");
                return;
            }
        };
        let blob_key = digest.to_string();
        let table = self.table();
        let mut blob = table.get(&blob_key);
        if up {
            table.track_up(&mut blob, topic);
        } else {
            table.track_down(&mut blob, topic);
        }
        table.write(&blob);
    }

    /// Store a blob from a stream and publish the referencing data
    /// record.  The blob row holds a reference for the duration so a
    /// concurrent tracking change cannot delete the file out from
    /// under us.
    pub async fn put_data(
        &self,
        cid: &str,
        key: &str,
        writer: &crate::crypto::SecretIdentity,
        stream: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<()> {
        debug!("put_data {cid} {key:?}");
        let tmp = self.incoming.join(random_string());
        let digest = match write_hashed(&tmp, stream).await {
            Ok(digest) => digest,
            Err(err) => {
                let _ = tokio::fs::remove_file(&tmp).await;
                return Err(err);
            }
        };
        let blob_key = digest.to_string();

        {
            let table = self.table();
            let mut blob = table.get(&blob_key);
            table.install_file(&mut blob, &tmp);
            blob.holds += 1;
            table.write(&blob);
        }

        let result = self.meta.put(cid, writer, key, &wire::to_vec(&digest));

        {
            let table = self.table();
            let mut blob = table.get(&blob_key);
            blob.holds -= 1;
            table.write(&blob);
        }
        result
    }

    /// Read the blob referenced by `(cid, key)` into `out`.
    pub async fn get_data(
        &self,
        cid: &str,
        key: &str,
        out: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<()> {
        let value = self
            .meta
            .get(cid, key)
            .ok_or_else(|| Error::not_found(format!("{cid}/{key}")))?;
        let digest: Digest = wire::from_slice(&value)?;
        let blob_key = digest.to_string();

        {
            let table = self.table();
            let mut blob = table
                .maybe_get(&blob_key)
                .filter(|b| b.state == BLOB_LOCAL)
                .ok_or_else(|| Error::not_found(format!("blob {blob_key} not local yet")))?;
            blob.holds += 1;
            table.write(&blob);
        }

        let result = stream_file(&self.dir.join(&blob_key), out).await;

        {
            let table = self.table();
            let mut blob = table.get(&blob_key);
            blob.holds -= 1;
            table.write(&blob);
        }
        result
    }

    /// Validate a blob key and take a hold on its local copy.  Fails
    /// before any response byte can go out when the key is unknown or
    /// the blob is not local.
    fn acquire_local_blob(&self, key: &str) -> Result<()> {
        if !valid_blob_key(key) {
            return Err(Error::decode(format!("invalid blob key {key:?}")));
        }
        let table = self.table();
        let mut blob = table
            .maybe_get(key)
            .filter(|b| b.state == BLOB_LOCAL)
            .ok_or_else(|| Error::not_found(format!("unknown blob {key}")))?;
        blob.holds += 1;
        table.write(&blob);
        Ok(())
    }

    fn release_blob(&self, key: &str) {
        let table = self.table();
        let mut blob = table.get(key);
        blob.holds -= 1;
        table.write(&blob);
    }

    async fn serve_local_blob(
        &self,
        key: &str,
        out: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<()> {
        self.acquire_local_blob(key)?;
        let result = stream_file(&self.dir.join(key), out).await;
        self.release_blob(key);
        result
    }

    /// Fetch one blob from one advertised holder into a temp file.
    async fn fetch_blob(&self, friend: FriendId, key: &str) -> Result<PathBuf> {
        debug!("downloading {key} from friend {friend}");
        let body = wire::to_vec(&key.to_string());
        let mut resp = self.link.send(Service::Data, friend, body).await?;

        let tmp = self.incoming.join(random_string());
        let result = async {
            let digest = write_hashed(&tmp, &mut resp).await?;
            if digest.to_string() != key {
                return Err(Error::auth(format!("blob {key} digest mismatch")));
            }
            Ok(())
        }
        .await;
        match result {
            Ok(()) => Ok(tmp),
            Err(err) => {
                let _ = tokio::fs::remove_file(&tmp).await;
                Err(err)
            }
        }
    }
}

/// Incoming advert records: remember who holds what, and flip blobs
/// between ready and not-ready.  Only data-plane adverts (`[1]` or
/// empty) are handled here; routing adverts belong to the advert
/// manager.
impl crate::sync::RecordSink for DataMgr {
    fn on_record(&self, friend: FriendId, _fp: &Digest, rec: &Record) {
        if rec.value.len() > 1 {
            return;
        }
        let table = self.table();
        let mut blob = table.maybe_get(&rec.key);
        if rec.value.first() == Some(&1) {
            self.store
                .add_advert(&rec.key, friend, &rec.topic)
                .expect("record store update failed");
            if let Some(blob) = blob.as_mut() {
                if blob.state == BLOB_NOT_READY {
                    blob.state = BLOB_READY;
                }
            }
        } else {
            self.store
                .del_advert(&rec.key, friend, &rec.topic)
                .expect("record store update failed");
            if let Some(blob) = blob.as_mut() {
                if blob.state == BLOB_READY
                    && !self
                        .store
                        .any_adverts(&rec.key)
                        .expect("record store query failed")
                {
                    blob.state = BLOB_NOT_READY;
                }
            }
        }
        if let Some(blob) = &blob {
            table.write(blob);
        }
    }
}

/// Serves blob fetches from friends.  Refuses keys that are unknown
/// or not yet local.
#[async_trait]
impl ServiceHandler for DataMgr {
    async fn handle(
        &self,
        _friend: FriendId,
        _fp: &Digest,
        body: Vec<u8>,
        out: &mut ResponseStream<'_>,
    ) -> Result<()> {
        let key: String = wire::from_slice(&body)?;
        self.acquire_local_blob(&key)?;
        let result = async {
            let writer = out.begin().await?;
            stream_file(&self.dir.join(&key), writer).await
        }
        .await;
        self.release_blob(&key);
        result
    }
}

#[async_trait]
impl BlobSource for DataMgr {
    async fn read_blob_to(
        &self,
        key: &str,
        out: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<()> {
        self.serve_local_blob(key, out).await
    }
}

async fn download_loop(mgr: Arc<DataMgr>) {
    debug!("entering download loop");
    enum Step {
        Wait,
        Again,
        Fetch { key: String, friend: FriendId },
    }

    loop {
        if mgr.closing.load(Ordering::SeqCst) {
            break;
        }
        let step = {
            let table = mgr.table();
            match table.store.next_download().expect("record store query failed") {
                None => Step::Wait,
                Some(key) => {
                    let friends = table
                        .store
                        .advert_friends(&key)
                        .expect("record store query failed");
                    if friends.is_empty() {
                        warn!("download wanted for {key} but nobody advertises it");
                        table
                            .store
                            .clear_needs_download(&key)
                            .expect("record store update failed");
                        Step::Again
                    } else {
                        let friend = friends[rand::thread_rng().gen_range(0..friends.len())];
                        let mut blob = table.get(&key);
                        blob.holds += 1;
                        blob.downloading = true;
                        table.write(&blob);
                        Step::Fetch { key, friend }
                    }
                }
            }
        };

        match step {
            Step::Wait => mgr.wake.notified().await,
            Step::Again => {}
            Step::Fetch { key, friend } => {
                let started = tokio::time::Instant::now();
                let fetched = mgr.fetch_blob(friend, &key).await;
                if let Err(err) = &fetched {
                    debug!("download of {key} failed: {err}");
                    if started.elapsed() < DOWNLOAD_RETRY {
                        tokio::select! {
                            _ = tokio::time::sleep_until(started + DOWNLOAD_RETRY) => {}
                            _ = mgr.stop_notify.notified() => {}
                        }
                    }
                } else {
                    debug!("download of {key} worked");
                }
                let table = mgr.table();
                let mut blob = table.get(&key);
                blob.downloading = false;
                blob.holds -= 1;
                if let Ok(tmp) = &fetched {
                    table.install_file(&mut blob, tmp);
                }
                table.write(&blob);
            }
        }
    }
    debug!("download loop done");
}

/// Stream `input` into `path` while hashing, returning the digest.
async fn write_hashed(
    path: &Path,
    input: &mut (dyn AsyncRead + Unpin + Send),
) -> Result<Digest> {
    let mut file = tokio::fs::File::create(path).await?;
    let mut hasher = Hasher::new();
    let mut buf = vec![0u8; COPY_BUF];
    loop {
        let n = input
            .read(&mut buf)
            .await
            .map_err(|e| Error::transport(format!("blob read: {e}")))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        file.write_all(&buf[..n]).await?;
    }
    file.flush().await?;
    Ok(hasher.finalize())
}

async fn stream_file(path: &Path, out: &mut (dyn AsyncWrite + Unpin + Send)) -> Result<()> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut buf = vec![0u8; COPY_BUF];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        out.write_all(&buf[..n])
            .await
            .map_err(|e| Error::transport(format!("blob write: {e}")))?;
    }
    out.flush()
        .await
        .map_err(|e| Error::transport(format!("blob flush: {e}")))?;
    Ok(())
}

/// A blob key must be the canonical textual form of a digest; anything
/// else is rejected before it can touch the filesystem.
fn valid_blob_key(key: &str) -> bool {
    match Digest::parse(key) {
        Ok(digest) => digest.to_string() == key,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SecretIdentity;
    use crate::link::LinkMgr;
    use crate::store::RecordStore;

    fn test_data() -> (Arc<DataMgr>, SecretIdentity, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let ident = SecretIdentity::generate("");
        let store = Arc::new(RecordStore::open_in_memory().expect("store"));
        let link = LinkMgr::new(
            ident.clone(),
            "127.0.0.1:0".parse().expect("addr"),
            store.clone(),
        )
        .expect("link");
        let sync = SyncMgr::new(link, store);
        let meta = MetaMgr::new(sync);
        let data = DataMgr::new(dir.path().join("data"), meta.clone()).expect("data");
        let weak = Arc::downgrade(&data);
        meta.add_callback(Box::new(move |cid, key, value, author, up| {
            if let Some(data) = weak.upgrade() {
                data.on_meta(cid, key, value, author, up);
            }
        }));
        (data, ident, dir)
    }

    #[tokio::test]
    async fn put_then_get_roundtrip() {
        let (data, ident, _dir) = test_data();
        let cid = data.meta().create_collection(&ident);

        let payload = b"hello blob world".to_vec();
        data.put_data(&cid, "greeting", &ident, &mut payload.as_slice())
            .await
            .expect("put");

        let mut out = std::io::Cursor::new(Vec::new());
        data.get_data(&cid, "greeting", &mut out).await.expect("get");
        assert_eq!(out.into_inner(), payload);
    }

    #[tokio::test]
    async fn local_blob_file_matches_digest() {
        let (data, ident, _dir) = test_data();
        let cid = data.meta().create_collection(&ident);
        let payload = b"check my hash".to_vec();
        data.put_data(&cid, "k", &ident, &mut payload.as_slice())
            .await
            .expect("put");

        let value = data.meta().get(&cid, "k").expect("record");
        let digest: Digest = wire::from_slice(&value).expect("digest");
        let file = std::fs::read(data.dir.join(digest.to_string())).expect("file");
        assert_eq!(crate::crypto::hash_bytes(&file), digest);
    }

    #[tokio::test]
    async fn unauthorized_put_leaves_no_blob_behind() {
        let (data, ident, _dir) = test_data();
        let mallory = SecretIdentity::generate("");
        let cid = data.meta().create_collection(&ident);

        let payload = b"sneaky".to_vec();
        let err = data
            .put_data(&cid, "x", &mallory, &mut payload.as_slice())
            .await;
        assert!(matches!(err, Err(Error::Unauthorized(_))));

        // The blob row was held only for the duration of the put; with
        // no tracking it must be gone, along with the file.
        let digest = crate::crypto::hash_bytes(&payload);
        assert!(data.table().maybe_get(&digest.to_string()).is_none());
        assert!(!data.dir.join(digest.to_string()).exists());
    }

    #[tokio::test]
    async fn replacement_drops_old_blob_when_untracked() {
        let (data, ident, _dir) = test_data();
        let cid = data.meta().create_collection(&ident);

        let old = b"old payload".to_vec();
        let new = b"new payload".to_vec();
        data.put_data(&cid, "k", &ident, &mut old.as_slice())
            .await
            .expect("put old");
        data.put_data(&cid, "k", &ident, &mut new.as_slice())
            .await
            .expect("put new");

        let old_key = crate::crypto::hash_bytes(&old).to_string();
        let new_key = crate::crypto::hash_bytes(&new).to_string();
        assert!(data.table().maybe_get(&old_key).is_none());
        assert!(!data.dir.join(&old_key).exists());

        let blob = data.table().maybe_get(&new_key).expect("new blob");
        assert_eq!(blob.state, BLOB_LOCAL);
        assert_eq!(blob.tracking.len(), 1);
    }

    #[tokio::test]
    async fn advert_records_flip_ready_state() {
        let (data, _ident, _dir) = test_data();
        let fp = crate::crypto::hash_bytes(b"friend");
        let blob_key = crate::crypto::hash_bytes(b"wanted").to_string();

        // Track the blob without holding it locally.
        {
            let table = data.table();
            let mut blob = table.get(&blob_key);
            blob.tracking.insert("topic".to_string(), 1);
            table.write(&blob);
        }

        let advert_up = Record {
            rtype: RT_ADVERT,
            topic: "topic".to_string(),
            key: blob_key.clone(),
            value: vec![1],
            priority: 0,
            author: LOCAL_AUTHOR.to_string(),
            signature: vec![],
        };
        crate::sync::RecordSink::on_record(&*data, 7, &fp, &advert_up);
        assert_eq!(data.table().get(&blob_key).state, BLOB_READY);
        assert_eq!(data.store.advert_friends(&blob_key).expect("adverts"), vec![7]);

        let advert_down = Record {
            value: vec![],
            ..advert_up
        };
        crate::sync::RecordSink::on_record(&*data, 7, &fp, &advert_down);
        assert_eq!(data.table().get(&blob_key).state, BLOB_NOT_READY);
        assert!(!data.store.any_adverts(&blob_key).expect("any"));
    }

    #[tokio::test]
    async fn fetch_handler_refuses_unknown_blobs() {
        let (data, _ident, _dir) = test_data();
        let key = crate::crypto::hash_bytes(b"nope").to_string();
        let mut out = std::io::Cursor::new(Vec::new());
        match data.read_blob_to(&key, &mut out).await {
            Err(Error::NotFound(_)) => {}
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn traversal_blob_keys_are_rejected() {
        let (data, _ident, _dir) = test_data();
        let mut out = std::io::Cursor::new(Vec::new());
        match data.read_blob_to("../../etc/passwd", &mut out).await {
            Err(Error::Decode(_)) => {}
            other => panic!("expected Decode error, got {other:?}"),
        }
    }
}
