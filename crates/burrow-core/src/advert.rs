// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! The advert subsystem: distance-vector routing to the nearest holder
//! of a blob key, and multi-hop request forwarding along the downhill
//! gradient.
//!
//! Per destination key a node tracks its own cost (0 when holding a
//! local copy, `min(friend) + 1` otherwise, clipped at the ∞ sentinel
//! of 1000), a timestamp that advances on every transition to or from
//! ∞, and the current downhill friend.  A neighbour's advert is only
//! accepted when it strictly improves cost and is at least as fresh —
//! the strict `cost + 1 < self.cost` rule is what prevents routing
//! loops.  Outgoing adverts ride the node's profile topic as ordinary
//! advert records.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tracing::{debug, warn};

use crate::crypto::Digest;
use crate::error::{Error, Result};
use crate::link::{LinkMgr, ResponseStream, Service, ServiceHandler};
use crate::store::{FriendId, Record, RecordStore, RT_ADVERT};
use crate::sync::{profile_topic, RecordSink, SyncMgr, LOCAL_AUTHOR};
use crate::wire::{self, Wire};

/// The ∞ cost sentinel; advert arithmetic never exceeds it.
pub const COST_INF: i64 = 1000;

/// One hop's view of a destination: its cost and freshness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteAdvert {
    pub cost: i64,
    pub timestamp: i64,
}

impl Wire for RouteAdvert {
    fn encode(&self, out: &mut dyn Write) -> Result<()> {
        self.cost.encode(out)?;
        self.timestamp.encode(out)
    }
    fn decode(input: &mut dyn Read) -> Result<Self> {
        Ok(RouteAdvert {
            cost: i64::decode(input)?,
            timestamp: i64::decode(input)?,
        })
    }
}

/// Everything a node tracks about one destination key.
#[derive(Debug, Clone)]
struct DestInfo {
    ref_count: i64,
    cost: i64,
    timestamp: i64,
    /// Friend id the current route goes through, -1 when none.
    downhill: i64,
    /// Whether some friend might want to route through us.
    routing: bool,
    needs_req: bool,
    friends: BTreeMap<i64, RouteAdvert>,
}

impl Default for DestInfo {
    fn default() -> Self {
        DestInfo {
            ref_count: 0,
            cost: COST_INF,
            timestamp: -1,
            downhill: -1,
            routing: false,
            needs_req: false,
            friends: BTreeMap::new(),
        }
    }
}

impl Wire for DestInfo {
    fn encode(&self, out: &mut dyn Write) -> Result<()> {
        self.ref_count.encode(out)?;
        self.cost.encode(out)?;
        self.timestamp.encode(out)?;
        self.downhill.encode(out)?;
        self.routing.encode(out)?;
        self.needs_req.encode(out)?;
        self.friends.encode(out)
    }
    fn decode(input: &mut dyn Read) -> Result<Self> {
        Ok(DestInfo {
            ref_count: i64::decode(input)?,
            cost: i64::decode(input)?,
            timestamp: i64::decode(input)?,
            downhill: i64::decode(input)?,
            routing: bool::decode(input)?,
            needs_req: bool::decode(input)?,
            friends: BTreeMap::decode(input)?,
        })
    }
}

impl DestInfo {
    fn accept(&mut self, src: i64, advert: RouteAdvert) {
        self.cost = (advert.cost + 1).min(COST_INF);
        self.timestamp = advert.timestamp;
        self.downhill = src;
    }

    /// Re-derive cost, downhill, routing and needs_req from the friend
    /// map.
    fn check(&mut self) {
        if self.downhill >= 0 {
            match self.friends.get(&self.downhill).copied() {
                None => {
                    // Downhill is gone, fall to infinity.
                    self.cost = COST_INF;
                    self.downhill = -1;
                    self.timestamp += 1;
                }
                Some(dh) if dh.cost == COST_INF => {
                    self.cost = COST_INF;
                    self.downhill = -1;
                    self.timestamp += 1;
                }
                Some(dh) if dh.timestamp > self.timestamp => {
                    // Downhill advanced; adopt its freshness even when
                    // the cost is unchanged so repair can converge.
                    self.accept(self.downhill, dh);
                }
                Some(_) => {}
            }
        }
        let entries: Vec<(i64, RouteAdvert)> =
            self.friends.iter().map(|(k, v)| (*k, *v)).collect();
        for (src, advert) in &entries {
            if advert.cost + 1 < self.cost && advert.timestamp >= self.timestamp {
                self.accept(*src, *advert);
            }
        }
        for (_, advert) in &entries {
            if advert.cost + 1 < self.cost {
                self.needs_req = true;
            }
            if advert.cost >= self.cost + 1 {
                self.routing = true;
            }
        }
    }

    fn interesting(&self) -> bool {
        self.ref_count > 0 || self.routing
    }
}

/// The request carried by the advert service: who wants `dest`, how
/// fresh an answer must be, and whether the blob bytes should follow.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RequestMsg {
    dest: String,
    timestamp: i64,
    full: bool,
}

impl Wire for RequestMsg {
    fn encode(&self, out: &mut dyn Write) -> Result<()> {
        wire::write_string(out, &self.dest)?;
        self.timestamp.encode(out)?;
        self.full.encode(out)
    }
    fn decode(input: &mut dyn Read) -> Result<Self> {
        Ok(RequestMsg {
            dest: wire::read_string(input)?,
            timestamp: i64::decode(input)?,
            full: bool::decode(input)?,
        })
    }
}

/// Provider of local blob bytes for `full` requests.
#[async_trait]
pub trait BlobSource: Send + Sync {
    async fn read_blob_to(
        &self,
        key: &str,
        out: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<()>;
}

enum ReplySource {
    None,
    Local,
    Relay(crate::link::ResponseBody),
}

/// The advert manager.
pub struct AdvertMgr {
    sync: Arc<SyncMgr>,
    link: Arc<LinkMgr>,
    store: Arc<RecordStore>,
    /// Guards every route-row read-modify-write.
    lock: StdMutex<()>,
    blob_source: StdMutex<Option<Weak<dyn BlobSource>>>,
}

impl AdvertMgr {
    pub fn new(sync: Arc<SyncMgr>) -> Arc<AdvertMgr> {
        let link = sync.link().clone();
        let store = sync.store().clone();
        Arc::new(AdvertMgr {
            sync,
            link,
            store,
            lock: StdMutex::new(()),
            blob_source: StdMutex::new(None),
        })
    }

    pub fn set_blob_source(&self, source: Weak<dyn BlobSource>) {
        *self.blob_source.lock().expect("source lock poisoned") = Some(source);
    }

    fn blob_source(&self) -> Result<Arc<dyn BlobSource>> {
        self.blob_source
            .lock()
            .expect("source lock poisoned")
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or_else(|| Error::not_found("no blob source attached"))
    }

    fn get_dest(&self, key: &str) -> DestInfo {
        match self.store.route_data(key).expect("record store query failed") {
            Some(data) => wire::from_slice(&data).expect("corrupt route state in record store"),
            None => DestInfo::default(),
        }
    }

    /// Persist a route row, dropping it once nobody cares.
    fn put_dest(&self, key: &str, di: &DestInfo) {
        self.store
            .delete_route(key)
            .expect("record store update failed");
        if di.ref_count == 0 && di.friends.is_empty() {
            return;
        }
        self.store
            .put_route(key, di.needs_req, &wire::to_vec(di))
            .expect("record store update failed");
    }

    /// Republish our outgoing advert for `key` on the profile topic.
    /// An empty value retracts it; unchanged values are not re-put.
    fn update_advert(&self, key: &str, di: &DestInfo) {
        let value = if di.interesting() {
            wire::to_vec(&RouteAdvert {
                cost: di.cost,
                timestamp: di.timestamp,
            })
        } else {
            vec![]
        };
        let topic = profile_topic(&self.link.self_fingerprint());
        let current = self.sync.get(RT_ADVERT, &topic, key);
        match &current {
            None if value.is_empty() => return,
            Some(rec) if rec.value == value => return,
            _ => {}
        }
        debug!(
            "advert out for {key}: cost={} timestamp={}",
            di.cost, di.timestamp
        );
        self.sync.put(&Record {
            rtype: RT_ADVERT,
            topic,
            key: key.to_string(),
            value,
            priority: 0,
            author: LOCAL_AUTHOR.to_string(),
            signature: vec![],
        });
    }

    /// Mark local interest in a key.
    pub fn inc_ref(&self, key: &str) {
        let _guard = self.lock.lock().expect("advert lock poisoned");
        let mut di = self.get_dest(key);
        di.ref_count += 1;
        self.update_advert(key, &di);
        self.put_dest(key, &di);
    }

    pub fn dec_ref(&self, key: &str) {
        let _guard = self.lock.lock().expect("advert lock poisoned");
        let mut di = self.get_dest(key);
        di.ref_count -= 1;
        self.update_advert(key, &di);
        self.put_dest(key, &di);
    }

    /// Declare that we hold a local copy of `key`.
    pub fn has_copy(&self, key: &str) {
        debug!("have a copy of {key}");
        let _guard = self.lock.lock().expect("advert lock poisoned");
        let mut di = self.get_dest(key);
        di.ref_count += 1;
        di.cost = 0;
        di.downhill = -1;
        di.timestamp = di
            .friends
            .values()
            .map(|a| a.timestamp)
            .max()
            .unwrap_or(0)
            .max(0);
        self.update_advert(key, &di);
        self.put_dest(key, &di);
    }

    pub fn no_copy(&self, key: &str) {
        let _guard = self.lock.lock().expect("advert lock poisoned");
        let mut di = self.get_dest(key);
        di.ref_count -= 1;
        di.cost = COST_INF;
        di.downhill = -1;
        di.check();
        self.update_advert(key, &di);
        self.put_dest(key, &di);
    }

    /// Fetch the blob for `key` from wherever the routing gradient
    /// leads.  Fails `NotFound` when no route is known.
    pub async fn request(&self, key: &str) -> Result<Vec<u8>> {
        let (advert, source) = self.request_inner(key, 0, true).await;
        if advert.cost == COST_INF {
            return Err(Error::not_found(format!("no route to {key}")));
        }
        match source {
            ReplySource::Local => {
                let mut out = std::io::Cursor::new(Vec::new());
                self.blob_source()?.read_blob_to(key, &mut out).await?;
                Ok(out.into_inner())
            }
            ReplySource::Relay(mut stream) => {
                let mut out = Vec::new();
                stream
                    .read_to_end(&mut out)
                    .await
                    .map_err(|e| Error::transport(format!("relay read: {e}")))?;
                Ok(out)
            }
            ReplySource::None => Err(Error::not_found(format!("no route to {key}"))),
        }
    }

    /// Answer (or forward) a request for `key` with minimum timestamp
    /// `min_ts`.  Returns our advert for the reply plus where the blob
    /// bytes, if any, come from.
    async fn request_inner(&self, key: &str, min_ts: i64, full: bool) -> (RouteAdvert, ReplySource) {
        enum Decision {
            NoRoute,
            Source(i64),
            Forward(i64),
        }
        let decision = {
            let _guard = self.lock.lock().expect("advert lock poisoned");
            let mut di = self.get_dest(key);
            if di.cost == COST_INF {
                Decision::NoRoute
            } else if di.cost == 0 {
                if di.timestamp < min_ts {
                    debug!("source timestamp for {key} advances to {min_ts}");
                    di.timestamp = min_ts;
                    self.update_advert(key, &di);
                    self.put_dest(key, &di);
                }
                Decision::Source(di.timestamp)
            } else {
                Decision::Forward(di.downhill)
            }
        };

        match decision {
            Decision::NoRoute => {
                debug!("no known source for {key}");
                (
                    RouteAdvert {
                        cost: COST_INF,
                        timestamp: min_ts,
                    },
                    ReplySource::None,
                )
            }
            Decision::Source(timestamp) => {
                debug!("serving {key} as a source");
                (
                    RouteAdvert { cost: 0, timestamp },
                    if full {
                        ReplySource::Local
                    } else {
                        ReplySource::None
                    },
                )
            }
            Decision::Forward(who) => self.forward(key, min_ts, full, who).await,
        }
    }

    /// Forward a request downhill.  On success the reply advert is
    /// learned as that neighbour's current state and we answer with
    /// our own advert; on failure the downhill is invalidated and one
    /// repair probe goes to the best remaining neighbour.
    async fn forward(
        &self,
        key: &str,
        min_ts: i64,
        full: bool,
        who: FriendId,
    ) -> (RouteAdvert, ReplySource) {
        debug!("not a source for {key}, forwarding to friend {who}");
        match self.forward_once(key, min_ts, full, who).await {
            Ok((advert, stream)) => {
                let reply = self.learn(key, who, advert);
                (
                    reply,
                    if full {
                        ReplySource::Relay(stream)
                    } else {
                        ReplySource::None
                    },
                )
            }
            Err(err) => {
                debug!("forward of {key} to friend {who} failed: {err}");
                let (reply, probe) = {
                    let _guard = self.lock.lock().expect("advert lock poisoned");
                    let mut di = self.get_dest(key);
                    di.timestamp += 1;
                    di.downhill = -1;
                    di.cost = COST_INF;
                    di.check();
                    self.update_advert(key, &di);
                    self.put_dest(key, &di);
                    let probe = di
                        .friends
                        .iter()
                        .filter(|(friend, advert)| **friend != who && advert.cost < COST_INF)
                        .min_by_key(|(_, advert)| advert.cost)
                        .map(|(friend, _)| *friend);
                    (
                        RouteAdvert {
                            cost: di.cost,
                            timestamp: di.timestamp,
                        },
                        probe.map(|friend| (friend, di.timestamp)),
                    )
                };
                if let Some((friend, timestamp)) = probe {
                    self.repair_probe(key, friend, timestamp).await;
                }
                (reply, ReplySource::None)
            }
        }
    }

    async fn forward_once(
        &self,
        key: &str,
        min_ts: i64,
        full: bool,
        who: FriendId,
    ) -> Result<(RouteAdvert, crate::link::ResponseBody)> {
        let body = wire::to_vec(&RequestMsg {
            dest: key.to_string(),
            timestamp: min_ts,
            full,
        });
        let mut stream = self.link.send(Service::Advert, who, body).await?;
        let advert = read_route_advert(&mut stream).await?;
        Ok((advert, stream))
    }

    /// Absorb a reply advert as the neighbour's current state and
    /// return our own advert for the destination.
    fn learn(&self, key: &str, who: FriendId, advert: RouteAdvert) -> RouteAdvert {
        let _guard = self.lock.lock().expect("advert lock poisoned");
        let mut di = self.get_dest(key);
        if advert.cost == COST_INF {
            di.friends.remove(&who);
        } else {
            di.friends.insert(who, advert);
        }
        di.check();
        self.update_advert(key, &di);
        self.put_dest(key, &di);
        RouteAdvert {
            cost: di.cost,
            timestamp: di.timestamp,
        }
    }

    /// A non-full request whose only purpose is refreshing route
    /// state after a downhill failure.
    async fn repair_probe(&self, key: &str, friend: FriendId, timestamp: i64) {
        debug!("repair probe for {key} via friend {friend}");
        match self.forward_once(key, timestamp, false, friend).await {
            Ok((advert, _stream)) => {
                self.learn(key, friend, advert);
            }
            Err(err) => {
                debug!("repair probe for {key} failed: {err}");
                let _guard = self.lock.lock().expect("advert lock poisoned");
                let mut di = self.get_dest(key);
                di.friends.remove(&friend);
                di.check();
                self.update_advert(key, &di);
                self.put_dest(key, &di);
            }
        }
    }
}

/// Routing adverts arriving from friends on the sync plane.  Data
/// adverts (the single-byte presence markers) belong to the data
/// layer and are skipped here.
impl RecordSink for AdvertMgr {
    fn on_record(&self, friend: FriendId, fp: &Digest, rec: &Record) {
        if rec.value.len() == 1 {
            return;
        }
        let _guard = self.lock.lock().expect("advert lock poisoned");
        let mut di = self.get_dest(&rec.key);
        if rec.value.is_empty() {
            debug!("empty advert for {} from friend {friend}", rec.key);
            di.friends.remove(&friend);
        } else {
            let advert: RouteAdvert = match wire::from_slice(&rec.value) {
                Ok(advert) => advert,
                Err(_) => {
                    warn!("junk advert from friend {friend}:{fp}");
                    return;
                }
            };
            debug!(
                "advert in for {} from friend {friend}: cost={} timestamp={}",
                rec.key, advert.cost, advert.timestamp
            );
            di.friends.insert(friend, advert);
        }
        di.check();
        self.update_advert(&rec.key, &di);
        self.put_dest(&rec.key, &di);
    }
}

/// The advert service endpoint: answer with our advert, then stream
/// the blob bytes when asked for a full answer and we are the source
/// (or relay them from downhill).
#[async_trait]
impl ServiceHandler for AdvertMgr {
    async fn handle(
        &self,
        _friend: FriendId,
        _fp: &Digest,
        body: Vec<u8>,
        out: &mut ResponseStream<'_>,
    ) -> Result<()> {
        let msg: RequestMsg = wire::from_slice(&body)?;
        debug!("advert request for {} (full={})", msg.dest, msg.full);
        let (advert, source) = self.request_inner(&msg.dest, msg.timestamp, msg.full).await;
        out.write_all(&wire::to_vec(&advert)).await?;
        match source {
            ReplySource::None => Ok(()),
            ReplySource::Local => {
                let writer = out.begin().await?;
                self.blob_source()?.read_blob_to(&msg.dest, writer).await
            }
            ReplySource::Relay(mut stream) => {
                let writer = out.begin().await?;
                tokio::io::copy(&mut stream, writer)
                    .await
                    .map_err(|e| Error::transport(format!("relay copy: {e}")))?;
                Ok(())
            }
        }
    }
}

/// Read a `RouteAdvert` (two zig-zag varints) from an async stream.
async fn read_route_advert<R: AsyncRead + Unpin>(input: &mut R) -> Result<RouteAdvert> {
    let cost = read_async_ivarint(input).await?;
    let timestamp = read_async_ivarint(input).await?;
    Ok(RouteAdvert { cost, timestamp })
}

async fn read_async_ivarint<R: AsyncRead + Unpin>(input: &mut R) -> Result<i64> {
    let mut value: u64 = 0;
    let mut offset = 0u32;
    loop {
        let byte = input
            .read_u8()
            .await
            .map_err(|e| Error::transport(format!("advert read: {e}")))?;
        value |= u64::from(byte & 0x7f) << offset;
        if byte & 0x80 == 0 {
            break;
        }
        offset += 7;
        if offset > 63 {
            return Err(Error::decode("varint too long"));
        }
    }
    Ok(((value >> 1) as i64) ^ -((value & 1) as i64))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn advert(cost: i64, timestamp: i64) -> RouteAdvert {
        RouteAdvert { cost, timestamp }
    }

    #[test]
    fn better_advert_is_accepted() {
        let mut di = DestInfo::default();
        di.friends.insert(1, advert(0, 0));
        di.check();
        assert_eq!(di.cost, 1);
        assert_eq!(di.downhill, 1);
    }

    #[test]
    fn cost_is_clipped_at_infinity() {
        let mut di = DestInfo::default();
        di.friends.insert(1, advert(COST_INF - 1, 0));
        di.check();
        assert_eq!(di.cost, COST_INF);
        di.friends.insert(2, advert(COST_INF - 2, 0));
        di.check();
        assert_eq!(di.cost, COST_INF - 1);
    }

    #[test]
    fn worse_advert_does_not_displace_downhill() {
        let mut di = DestInfo::default();
        di.friends.insert(1, advert(0, 0));
        di.check();
        di.friends.insert(2, advert(5, 10));
        di.check();
        assert_eq!(di.downhill, 1);
        assert_eq!(di.cost, 1);
    }

    #[test]
    fn equal_cost_keeps_current_downhill() {
        let mut di = DestInfo::default();
        di.friends.insert(1, advert(2, 0));
        di.check();
        assert_eq!(di.downhill, 1);
        di.friends.insert(2, advert(2, 0));
        di.check();
        assert_eq!(di.downhill, 1);
    }

    #[test]
    fn losing_the_downhill_goes_to_infinity_and_bumps_timestamp() {
        let mut di = DestInfo::default();
        di.friends.insert(1, advert(0, 4));
        di.check();
        assert_eq!(di.cost, 1);
        let ts = di.timestamp;

        di.friends.remove(&1);
        di.check();
        assert_eq!(di.cost, COST_INF);
        assert_eq!(di.downhill, -1);
        assert_eq!(di.timestamp, ts + 1);
    }

    #[test]
    fn stale_adverts_are_not_accepted_after_invalidation() {
        let mut di = DestInfo::default();
        di.friends.insert(1, advert(0, 0));
        di.check();
        // Downhill dies; timestamp advances past the stale entries.
        di.friends.remove(&1);
        di.check();
        di.friends.insert(2, advert(2, 0));
        di.check();
        assert_eq!(di.cost, COST_INF, "stale advert must not resurrect a route");
        assert!(di.needs_req, "a stale candidate flags a repair request");
    }

    #[test]
    fn downhill_timestamp_refresh_propagates_at_equal_cost() {
        let mut di = DestInfo::default();
        di.friends.insert(1, advert(1, 0));
        di.check();
        assert_eq!(di.cost, 2);
        assert_eq!(di.timestamp, 0);

        di.friends.insert(1, advert(1, 7));
        di.check();
        assert_eq!(di.cost, 2);
        assert_eq!(di.timestamp, 7);
    }

    #[test]
    fn routing_flag_tracks_uphill_friends() {
        let mut di = DestInfo::default();
        di.friends.insert(1, advert(0, 0));
        di.friends.insert(2, advert(COST_INF, 0));
        di.check();
        assert_eq!(di.cost, 1);
        assert!(di.routing, "an interested friend at ∞ makes us a router");
    }

    #[test]
    fn dest_info_wire_roundtrip() {
        let mut di = DestInfo {
            ref_count: 2,
            cost: 3,
            timestamp: 9,
            downhill: 4,
            routing: true,
            needs_req: false,
            friends: BTreeMap::new(),
        };
        di.friends.insert(4, advert(2, 9));
        di.friends.insert(7, advert(COST_INF, -1));

        let bytes = wire::to_vec(&di);
        let back: DestInfo = wire::from_slice(&bytes).expect("decode");
        assert_eq!(back.cost, di.cost);
        assert_eq!(back.downhill, di.downhill);
        assert_eq!(back.friends, di.friends);
    }

    #[tokio::test]
    async fn route_advert_async_read_matches_wire() {
        let advert = RouteAdvert {
            cost: 42,
            timestamp: -3,
        };
        let bytes = wire::to_vec(&advert);
        let mut cursor = bytes.as_slice();
        let back = read_route_advert(&mut cursor).await.expect("read");
        assert_eq!(back, advert);
    }
}
