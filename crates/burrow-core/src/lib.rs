// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Friend-to-friend data sharing: each participant publishes
//! collections of signed records to a chosen set of mutually
//! authenticated peers, with content-addressed blob distribution and
//! distance-vector routing for multi-hop retrieval.

pub mod advert;
pub mod config;
pub mod crypto;
pub mod data;
pub mod error;
pub mod httpx;
pub mod link;
pub mod meta;
pub mod node;
pub mod rendezvous;
pub mod store;
pub mod sync;
pub mod wire;

pub use advert::{AdvertMgr, BlobSource, RouteAdvert, COST_INF};
pub use config::NodeConfig;
pub use crypto::{
    hash_bytes, hash_pair, hash_str, Digest, Hasher, LockedIdentity, PublicIdentity,
    SecretIdentity, Signature, SymmetricKey, TinyMessage,
};
pub use data::DataMgr;
pub use error::{Error, Result};
pub use link::{
    FriendListener, FriendStatus, LinkMgr, ResponseStream, Service, ServiceHandler,
};
pub use meta::MetaMgr;
pub use node::{decode_passport, encode_passport, Node};
pub use rendezvous::{Client as RendezvousClient, RendezvousRecord, Server as RendezvousServer};
pub use store::{
    FriendId, Record, RecordEnvelope, RecordStore, RT_ADVERT, RT_BASIS, RT_DATA, RT_SUBSCRIBE,
    RT_WRITER,
};
pub use sync::{
    inbox_topic, outbox_topic, profile_topic, self_topic, RecordSink, SyncMgr, FAILURE_RETRY,
    LOCAL_AUTHOR, NOTIFY_BATCH,
};
