// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Node assembly: wires the link, sync, meta, data and advert layers
//! together and owns their lifecycles.

use std::sync::{Arc, Weak};

use tracing::info;

use crate::advert::{AdvertMgr, BlobSource};
use crate::config::NodeConfig;
use crate::crypto::{hash_str, Digest, SecretIdentity};
use crate::data::DataMgr;
use crate::error::{Error, Result};
use crate::link::{LinkMgr, Service};
use crate::meta::MetaMgr;
use crate::store::{RecordStore, RT_ADVERT, RT_BASIS, RT_DATA, RT_SUBSCRIBE, RT_WRITER};
use crate::sync::{RecordSink, SyncMgr};
use crate::wire;

/// A running node: the full Link → Sync → Meta → Data stack plus the
/// advert subsystem.
pub struct Node {
    config: NodeConfig,
    link: Arc<LinkMgr>,
    sync: Arc<SyncMgr>,
    meta: Arc<MetaMgr>,
    data: Arc<DataMgr>,
    advert: Arc<AdvertMgr>,
    self_cid: String,
    profile_cid: String,
}

impl Node {
    /// Bring the stack up.  Ordering matters: sinks, handlers and
    /// listeners are registered before the link starts so persisted
    /// friends get their notify workers from the `Startup` events.
    pub async fn start(config: NodeConfig) -> Result<Arc<Node>> {
        std::fs::create_dir_all(&config.dir)?;
        let store = Arc::new(RecordStore::open(config.dir.join("burrow.db"))?);

        let link = LinkMgr::new(config.identity.clone(), config.bind, store.clone())?;
        let sync = SyncMgr::new(link.clone(), store.clone());
        link.add_handler(Service::Notify, sync.clone());
        link.add_listener(sync.clone());
        sync.add_sink(RT_SUBSCRIBE, Arc::downgrade(&sync) as Weak<dyn RecordSink>);

        let meta = MetaMgr::new(sync.clone());
        for rtype in [RT_BASIS, RT_WRITER, RT_DATA] {
            sync.add_sink(rtype, Arc::downgrade(&meta) as Weak<dyn RecordSink>);
        }

        let data = DataMgr::new(config.dir.join("data"), meta.clone())?;
        sync.add_sink(RT_ADVERT, Arc::downgrade(&data) as Weak<dyn RecordSink>);
        link.add_handler(Service::Data, data.clone());
        let blob_events = Arc::downgrade(&data);
        meta.add_callback(Box::new(move |cid, key, value, author, up| {
            if let Some(data) = blob_events.upgrade() {
                data.on_meta(cid, key, value, author, up);
            }
        }));

        let advert = AdvertMgr::new(sync.clone());
        sync.add_sink(RT_ADVERT, Arc::downgrade(&advert) as Weak<dyn RecordSink>);
        link.add_handler(Service::Advert, advert.clone());
        advert.set_blob_source(Arc::downgrade(&data) as Weak<dyn BlobSource>);

        link.start().await?;

        let me = config.identity.fingerprint();
        let self_cid = meta.create_special_collection(&config.identity, &me);
        let profile_cid = meta.create_special_collection(&config.identity, &hash_str("profile"));
        data.start();

        info!("node {} up on {:?}", me, link.local_addr());
        Ok(Arc::new(Node {
            config,
            link,
            sync,
            meta,
            data,
            advert,
            self_cid,
            profile_cid,
        }))
    }

    /// Tear the stack down, leaves first.
    pub async fn stop(&self) {
        self.data.stop().await;
        self.sync.stop().await;
        self.link.stop().await;
    }

    pub fn identity(&self) -> &SecretIdentity {
        &self.config.identity
    }

    pub fn fingerprint(&self) -> Digest {
        self.config.identity.fingerprint()
    }

    pub fn link(&self) -> &Arc<LinkMgr> {
        &self.link
    }

    pub fn sync(&self) -> &Arc<SyncMgr> {
        &self.sync
    }

    pub fn meta(&self) -> &Arc<MetaMgr> {
        &self.meta
    }

    pub fn data(&self) -> &Arc<DataMgr> {
        &self.data
    }

    pub fn advert(&self) -> &Arc<AdvertMgr> {
        &self.advert
    }

    /// The node's own collection, `hash(self, self)`.
    pub fn self_cid(&self) -> &str {
        &self.self_cid
    }

    /// The node's profile collection, `hash(self, hash("profile"))`.
    pub fn profile_cid(&self) -> &str {
        &self.profile_cid
    }

    /// The textual token handed out of band to introduce this node.
    pub fn passport(&self) -> String {
        encode_passport(&self.fingerprint(), &self.config.rendezvous)
    }

    /// Consume a passport.  A passport naming ourselves is rejected.
    pub async fn add_friend(&self, passport: &str) -> Result<Digest> {
        let (fp, rendezvous) = decode_passport(passport)?;
        if fp == self.fingerprint() {
            return Err(Error::auth("cannot add self as a friend"));
        }
        self.add_update_friend(&fp, &rendezvous).await?;
        Ok(fp)
    }

    /// Add or refresh a friend and create the shared per-friend
    /// collection `hash(self, friend)`.
    pub async fn add_update_friend(&self, fp: &Digest, rendezvous: &str) -> Result<()> {
        self.link.add_update_friend(fp, rendezvous).await?;
        self.meta
            .create_special_collection(&self.config.identity, fp);
        Ok(())
    }

    pub async fn remove_friend(&self, fp: &Digest) -> Result<()> {
        self.link.remove_friend(fp).await
    }
}

pub fn encode_passport(fp: &Digest, rendezvous: &str) -> String {
    let mut buf = Vec::new();
    use crate::wire::Wire as _;
    fp.encode(&mut buf).expect("encoding cannot fail");
    wire::write_string(&mut buf, rendezvous).expect("encoding cannot fail");
    wire::b64_encode(&buf)
}

pub fn decode_passport(passport: &str) -> Result<(Digest, String)> {
    use crate::wire::Wire as _;
    let raw = wire::b64_decode(passport)?;
    let mut cursor = raw.as_slice();
    let fp = Digest::decode(&mut cursor)?;
    let rendezvous = wire::read_string(&mut cursor)?;
    if !cursor.is_empty() {
        return Err(Error::decode("trailing bytes in passport"));
    }
    Ok((fp, rendezvous))
}
