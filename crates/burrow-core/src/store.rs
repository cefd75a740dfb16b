// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! The durable record store: a single SQLite file holding the signed
//! record table, the friend directory, per-(friend, topic) replication
//! cursors, and the blob/advert/route side tables.
//!
//! `seqno` is a store-wide monotonically increasing counter assigned at
//! insert time inside the insert transaction; replacing a row by tuple
//! key always yields a fresh `seqno`.

use std::io::{Read, Write};
use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;
use crate::wire::{self, Wire};

pub type FriendId = i64;

/// Record types, namespacing keys within a topic.
pub const RT_SUBSCRIBE: u8 = 0;
pub const RT_BASIS: u8 = 1;
pub const RT_WRITER: u8 = 2;
pub const RT_DATA: u8 = 3;
pub const RT_ADVERT: u8 = 4;

/// The unit of replication.  The tuple key is
/// `(topic, rtype, author, key)`; `value`, `priority` and `signature`
/// are the payload.  Multiple authors may disagree about a key, so one
/// row is kept per author; `priority` (then bytewise `value`)
/// disambiguates successive versions from one author.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub rtype: u8,
    pub topic: String,
    pub key: String,
    pub value: Vec<u8>,
    pub priority: u32,
    pub author: String,
    pub signature: Vec<u8>,
}

impl Wire for Record {
    fn encode(&self, out: &mut dyn Write) -> Result<()> {
        self.rtype.encode(out)?;
        wire::write_string(out, &self.topic)?;
        wire::write_string(out, &self.key)?;
        wire::write_bytes(out, &self.value)?;
        self.priority.encode(out)?;
        wire::write_string(out, &self.author)?;
        wire::write_bytes(out, &self.signature)
    }
    fn decode(input: &mut dyn Read) -> Result<Self> {
        Ok(Record {
            rtype: u8::decode(input)?,
            topic: wire::read_string(input)?,
            key: wire::read_string(input)?,
            value: wire::read_bytes(input)?,
            priority: u32::decode(input)?,
            author: wire::read_string(input)?,
            signature: wire::read_bytes(input)?,
        })
    }
}

/// A record plus the sender-side `seqno`, as carried in notify batches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordEnvelope {
    pub record: Record,
    pub seqno: u64,
}

impl Wire for RecordEnvelope {
    fn encode(&self, out: &mut dyn Write) -> Result<()> {
        self.record.encode(out)?;
        self.seqno.encode(out)
    }
    fn decode(input: &mut dyn Read) -> Result<Self> {
        Ok(RecordEnvelope {
            record: Record::decode(input)?,
            seqno: u64::decode(input)?,
        })
    }
}

/// A persisted friend.
#[derive(Debug, Clone)]
pub struct FriendRow {
    pub id: FriendId,
    pub fingerprint: String,
    pub rendezvous: String,
    pub public_key: Option<Vec<u8>>,
    pub host: String,
    pub port: u16,
}

/// Replication cursor for one (friend, topic) pair.
#[derive(Debug, Clone, Copy, Default)]
pub struct TopicCursor {
    pub desired: bool,
    pub requested: bool,
    pub acked_seqno: u64,
    pub heard_seqno: u64,
}

/// Host placeholder for a friend whose address is unknown.
pub const UNKNOWN_HOST: &str = "$";

const MIGRATIONS: &[&str] = &[SCHEMA_V1, SCHEMA_V2_ROUTE];

const SCHEMA_V1: &str = "
CREATE TABLE record(
    topic        TEXT NOT NULL,
    rtype        INTEGER NOT NULL,
    author       TEXT NOT NULL,
    key          TEXT NOT NULL,
    value        BLOB NOT NULL,
    priority     INTEGER NOT NULL DEFAULT(0),
    signature    BLOB NOT NULL,
    seqno        INTEGER NOT NULL,
    PRIMARY KEY(topic, rtype, author, key)
);
CREATE UNIQUE INDEX idx_record_seqno ON record (seqno);
CREATE INDEX idx_record_ttkp ON record (topic, rtype, key, priority DESC);

CREATE TABLE friend(
    friend_id    INTEGER PRIMARY KEY NOT NULL,
    fingerprint  TEXT NOT NULL,
    rendezvous   TEXT NOT NULL,
    public_key   BLOB NULL,
    host         TEXT NOT NULL DEFAULT('$'),
    port         INTEGER NOT NULL DEFAULT(0)
);
CREATE UNIQUE INDEX idx_friend_fingerprint ON friend (fingerprint);

CREATE TABLE topic_friend(
    friend_id    INTEGER NOT NULL,
    topic        TEXT NOT NULL,
    desired      INTEGER NOT NULL DEFAULT(0),
    requested    INTEGER NOT NULL DEFAULT(0),
    acked_seqno  INTEGER NOT NULL DEFAULT(0),
    heard_seqno  INTEGER NOT NULL DEFAULT(0),
    PRIMARY KEY(friend_id, topic)
);
CREATE INDEX idx_topic_friend_flags ON topic_friend (friend_id, desired, requested);

CREATE TABLE blob(
    key            TEXT NOT NULL PRIMARY KEY,
    needs_download INTEGER NOT NULL,
    data           BLOB NOT NULL
);
CREATE INDEX idx_blob_needs_download ON blob (needs_download);

CREATE TABLE advert(
    key          TEXT NOT NULL,
    friend_id    INTEGER NOT NULL,
    topic        TEXT NOT NULL,
    PRIMARY KEY(key, friend_id, topic)
);
";

const SCHEMA_V2_ROUTE: &str = "
CREATE TABLE route(
    key          TEXT NOT NULL PRIMARY KEY,
    needs_req    INTEGER NOT NULL,
    data         BLOB NOT NULL
);
";

pub struct RecordStore {
    conn: Mutex<Connection>,
}

impl RecordStore {
    /// Open (and migrate) a store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    /// In-memory store, for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        apply_migrations(&conn)?;
        Ok(RecordStore {
            conn: Mutex::new(conn),
        })
    }

    // --- records ---

    /// Insert a record, replacing any row with the same tuple key, and
    /// assign it a fresh `seqno` in the same transaction.
    pub fn put(&self, rec: &Record) -> Result<u64> {
        let mut conn = self.conn.lock().expect("store lock poisoned");
        let tx = conn.transaction()?;
        let seqno: i64 =
            tx.query_row("SELECT IFNULL(MAX(seqno), 0) + 1 FROM record", [], |row| {
                row.get(0)
            })?;
        tx.execute(
            "REPLACE INTO record (topic, rtype, author, key, value, priority, signature, seqno)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                rec.topic,
                rec.rtype,
                rec.author,
                rec.key,
                rec.value,
                rec.priority,
                rec.signature,
                seqno,
            ],
        )?;
        tx.commit()?;
        Ok(seqno as u64)
    }

    /// Highest-priority record among all authors for a tuple prefix.
    pub fn get(&self, rtype: u8, topic: &str, key: &str) -> Result<Option<Record>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.query_row(
            "SELECT topic, rtype, author, key, value, priority, signature
             FROM record
             WHERE topic = ?1 AND rtype = ?2 AND key = ?3
             ORDER BY priority DESC
             LIMIT 1",
            params![topic, rtype, key],
            row_to_record,
        )
        .optional()
        .map_err(Into::into)
    }

    /// A specific author's record.
    pub fn get_author(
        &self,
        rtype: u8,
        topic: &str,
        key: &str,
        author: &str,
    ) -> Result<Option<Record>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.query_row(
            "SELECT topic, rtype, author, key, value, priority, signature
             FROM record
             WHERE topic = ?1 AND rtype = ?2 AND key = ?3 AND author = ?4
             ORDER BY priority DESC
             LIMIT 1",
            params![topic, rtype, key, author],
            row_to_record,
        )
        .optional()
        .map_err(Into::into)
    }

    /// Rows not yet acknowledged by `friend`, for topics replicated in
    /// both directions, in ascending `seqno` order.
    pub fn pending_for(&self, friend: FriendId, limit: usize) -> Result<Vec<RecordEnvelope>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT r.topic, r.rtype, r.author, r.key, r.value, r.priority, r.signature, r.seqno
             FROM record r
             JOIN topic_friend tf ON tf.topic = r.topic
             WHERE tf.friend_id = ?1
               AND tf.desired = 1 AND tf.requested = 1
               AND r.seqno > tf.acked_seqno
             ORDER BY r.seqno
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![friend, limit as i64], |row| {
            Ok(RecordEnvelope {
                record: row_to_record(row)?,
                seqno: row.get::<_, i64>(7)? as u64,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // --- topic_friend cursors ---

    pub fn ensure_topic_friend(
        &self,
        friend: FriendId,
        topic: &str,
        desired: bool,
        requested: bool,
    ) -> Result<()> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "INSERT OR IGNORE INTO topic_friend (friend_id, topic, desired, requested)
             VALUES (?1, ?2, ?3, ?4)",
            params![friend, topic, desired, requested],
        )?;
        Ok(())
    }

    pub fn cursor(&self, friend: FriendId, topic: &str) -> Result<Option<TopicCursor>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.query_row(
            "SELECT desired, requested, acked_seqno, heard_seqno
             FROM topic_friend
             WHERE friend_id = ?1 AND topic = ?2",
            params![friend, topic],
            |row| {
                Ok(TopicCursor {
                    desired: row.get(0)?,
                    requested: row.get(1)?,
                    acked_seqno: row.get::<_, i64>(2)? as u64,
                    heard_seqno: row.get::<_, i64>(3)? as u64,
                })
            },
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn set_desired(&self, friend: FriendId, topic: &str, desired: bool) -> Result<()> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "UPDATE topic_friend SET desired = ?3 WHERE friend_id = ?1 AND topic = ?2",
            params![friend, topic, desired],
        )?;
        Ok(())
    }

    pub fn set_requested_acked(
        &self,
        friend: FriendId,
        topic: &str,
        requested: bool,
        acked_seqno: u64,
    ) -> Result<()> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "UPDATE topic_friend SET requested = ?3, acked_seqno = ?4
             WHERE friend_id = ?1 AND topic = ?2",
            params![friend, topic, requested, acked_seqno as i64],
        )?;
        Ok(())
    }

    pub fn set_acked(&self, friend: FriendId, topic: &str, seqno: u64) -> Result<()> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "UPDATE topic_friend SET acked_seqno = ?3
             WHERE friend_id = ?1 AND topic = ?2 AND acked_seqno < ?3",
            params![friend, topic, seqno as i64],
        )?;
        Ok(())
    }

    pub fn set_heard(&self, friend: FriendId, topic: &str, seqno: u64) -> Result<()> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "UPDATE topic_friend SET heard_seqno = ?3
             WHERE friend_id = ?1 AND topic = ?2 AND heard_seqno < ?3",
            params![friend, topic, seqno as i64],
        )?;
        Ok(())
    }

    pub fn delete_topic_friends(&self, friend: FriendId) -> Result<()> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "DELETE FROM topic_friend WHERE friend_id = ?1",
            params![friend],
        )?;
        Ok(())
    }

    // --- friends ---

    /// Insert a friend or refresh its rendezvous address.  Returns the
    /// stable id and whether the row was created.
    pub fn upsert_friend(&self, fingerprint: &str, rendezvous: &str) -> Result<(FriendId, bool)> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let existing: Option<FriendId> = conn
            .query_row(
                "SELECT friend_id FROM friend WHERE fingerprint = ?1",
                params![fingerprint],
                |row| row.get(0),
            )
            .optional()?;
        match existing {
            Some(id) => {
                conn.execute(
                    "UPDATE friend SET rendezvous = ?2 WHERE friend_id = ?1",
                    params![id, rendezvous],
                )?;
                Ok((id, false))
            }
            None => {
                conn.execute(
                    "INSERT INTO friend (fingerprint, rendezvous, host, port)
                     VALUES (?1, ?2, ?3, 0)",
                    params![fingerprint, rendezvous, UNKNOWN_HOST],
                )?;
                Ok((conn.last_insert_rowid(), true))
            }
        }
    }

    pub fn update_friend_host(
        &self,
        fingerprint: &str,
        host: &str,
        port: u16,
        public_key: Option<&[u8]>,
    ) -> Result<()> {
        let conn = self.conn.lock().expect("store lock poisoned");
        match public_key {
            Some(pk) => conn.execute(
                "UPDATE friend SET host = ?2, port = ?3, public_key = ?4
                 WHERE fingerprint = ?1",
                params![fingerprint, host, port, pk],
            )?,
            None => conn.execute(
                "UPDATE friend SET host = ?2, port = ?3 WHERE fingerprint = ?1",
                params![fingerprint, host, port],
            )?,
        };
        Ok(())
    }

    pub fn load_friends(&self) -> Result<Vec<FriendRow>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT friend_id, fingerprint, rendezvous, public_key, host, port FROM friend",
        )?;
        let rows = stmt.query_map([], row_to_friend)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn delete_friend(&self, fingerprint: &str) -> Result<()> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "DELETE FROM friend WHERE fingerprint = ?1",
            params![fingerprint],
        )?;
        Ok(())
    }

    // --- blobs ---

    pub fn blob_data(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.query_row(
            "SELECT data FROM blob WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn put_blob(&self, key: &str, needs_download: bool, data: &[u8]) -> Result<()> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "REPLACE INTO blob (key, needs_download, data) VALUES (?1, ?2, ?3)",
            params![key, needs_download, data],
        )?;
        Ok(())
    }

    pub fn delete_blob(&self, key: &str) -> Result<()> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute("DELETE FROM blob WHERE key = ?1", params![key])?;
        Ok(())
    }

    /// Any blob currently wanting a download.
    pub fn next_download(&self) -> Result<Option<String>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.query_row(
            "SELECT key FROM blob WHERE needs_download = 1 LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn clear_needs_download(&self, key: &str) -> Result<()> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "UPDATE blob SET needs_download = 0 WHERE key = ?1",
            params![key],
        )?;
        Ok(())
    }

    // --- inbound adverts ---

    pub fn add_advert(&self, key: &str, friend: FriendId, topic: &str) -> Result<()> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "INSERT OR IGNORE INTO advert (key, friend_id, topic) VALUES (?1, ?2, ?3)",
            params![key, friend, topic],
        )?;
        Ok(())
    }

    pub fn del_advert(&self, key: &str, friend: FriendId, topic: &str) -> Result<()> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "DELETE FROM advert WHERE key = ?1 AND friend_id = ?2 AND topic = ?3",
            params![key, friend, topic],
        )?;
        Ok(())
    }

    pub fn any_adverts(&self, key: &str) -> Result<bool> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM advert WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Everyone advertising a blob, deduplicated.
    pub fn advert_friends(&self, key: &str) -> Result<Vec<FriendId>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt =
            conn.prepare("SELECT friend_id FROM advert WHERE key = ?1 GROUP BY friend_id")?;
        let rows = stmt.query_map(params![key], |row| row.get(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // --- routes (distance-vector state) ---

    pub fn route_data(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.query_row(
            "SELECT data FROM route WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn put_route(&self, key: &str, needs_req: bool, data: &[u8]) -> Result<()> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "REPLACE INTO route (key, needs_req, data) VALUES (?1, ?2, ?3)",
            params![key, needs_req, data],
        )?;
        Ok(())
    }

    pub fn delete_route(&self, key: &str) -> Result<()> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute("DELETE FROM route WHERE key = ?1", params![key])?;
        Ok(())
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<Record> {
    Ok(Record {
        topic: row.get(0)?,
        rtype: row.get(1)?,
        author: row.get(2)?,
        key: row.get(3)?,
        value: row.get(4)?,
        priority: row.get::<_, i64>(5)? as u32,
        signature: row.get(6)?,
    })
}

fn row_to_friend(row: &rusqlite::Row<'_>) -> rusqlite::Result<FriendRow> {
    Ok(FriendRow {
        id: row.get(0)?,
        fingerprint: row.get(1)?,
        rendezvous: row.get(2)?,
        public_key: row.get(3)?,
        host: row.get(4)?,
        port: row.get::<_, i64>(5)? as u16,
    })
}

fn apply_migrations(conn: &Connection) -> Result<()> {
    let mut version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;

    if version == 0 {
        let has_tables: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'record'",
            [],
            |row| row.get(0),
        )?;
        if has_tables > 0 {
            // Installation-party legacy: the first release created its
            // schema without bumping user_version.
            version = 1;
        } else {
            for migration in MIGRATIONS {
                conn.execute_batch(migration)?;
            }
            conn.pragma_update(None, "user_version", MIGRATIONS.len() as i64)?;
            return Ok(());
        }
    }

    for migration in MIGRATIONS.iter().skip(version as usize) {
        conn.execute_batch(migration)?;
    }
    if (version as usize) < MIGRATIONS.len() {
        conn.pragma_update(None, "user_version", MIGRATIONS.len() as i64)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(topic: &str, key: &str, value: &[u8], priority: u32, author: &str) -> Record {
        Record {
            rtype: RT_DATA,
            topic: topic.to_string(),
            key: key.to_string(),
            value: value.to_vec(),
            priority,
            author: author.to_string(),
            signature: vec![],
        }
    }

    #[test]
    fn put_assigns_strictly_increasing_seqnos() {
        let store = RecordStore::open_in_memory().expect("open");
        let s1 = store.put(&rec("t", "a", b"1", 0, "x")).expect("put");
        let s2 = store.put(&rec("t", "b", b"2", 0, "x")).expect("put");
        let s3 = store.put(&rec("u", "c", b"3", 0, "y")).expect("put");
        assert!(s1 < s2 && s2 < s3);
    }

    #[test]
    fn replace_by_tuple_key_gets_fresh_seqno() {
        let store = RecordStore::open_in_memory().expect("open");
        let s1 = store.put(&rec("t", "a", b"old", 0, "x")).expect("put");
        let s2 = store.put(&rec("t", "a", b"new", 1, "x")).expect("put");
        assert!(s2 > s1);
        let got = store.get(RT_DATA, "t", "a").expect("get").expect("some");
        assert_eq!(got.value, b"new");
    }

    #[test]
    fn get_prefers_highest_priority_across_authors() {
        let store = RecordStore::open_in_memory().expect("open");
        store.put(&rec("t", "k", b"low", 1, "alice")).expect("put");
        store.put(&rec("t", "k", b"high", 5, "bob")).expect("put");
        let got = store.get(RT_DATA, "t", "k").expect("get").expect("some");
        assert_eq!(got.author, "bob");

        let alice = store
            .get_author(RT_DATA, "t", "k", "alice")
            .expect("get")
            .expect("some");
        assert_eq!(alice.value, b"low");
    }

    #[test]
    fn pending_respects_flags_order_and_limit() {
        let store = RecordStore::open_in_memory().expect("open");
        store.ensure_topic_friend(7, "t", true, true).expect("tf");
        store.ensure_topic_friend(7, "quiet", true, false).expect("tf");

        for i in 0..5 {
            store
                .put(&rec("t", &format!("k{i}"), b"v", 0, "x"))
                .expect("put");
        }
        store.put(&rec("quiet", "k", b"v", 0, "x")).expect("put");

        let pending = store.pending_for(7, 3).expect("pending");
        assert_eq!(pending.len(), 3);
        assert!(pending.windows(2).all(|w| w[0].seqno < w[1].seqno));
        assert!(pending.iter().all(|e| e.record.topic == "t"));

        let all = store.pending_for(7, 100).expect("pending");
        assert_eq!(all.len(), 5);

        store.set_acked(7, "t", all[4].seqno).expect("ack");
        assert!(store.pending_for(7, 100).expect("pending").is_empty());
    }

    #[test]
    fn heard_seqno_never_decreases() {
        let store = RecordStore::open_in_memory().expect("open");
        store.ensure_topic_friend(1, "t", true, true).expect("tf");
        store.set_heard(1, "t", 9).expect("heard");
        store.set_heard(1, "t", 4).expect("heard");
        let cursor = store.cursor(1, "t").expect("cursor").expect("some");
        assert_eq!(cursor.heard_seqno, 9);
    }

    #[test]
    fn friend_upsert_and_host_update() {
        let store = RecordStore::open_in_memory().expect("open");
        let (id, created) = store.upsert_friend("fp1", "rdv.example:2134").expect("up");
        assert!(created);
        let (id2, created2) = store.upsert_friend("fp1", "other:2134").expect("up");
        assert_eq!(id, id2);
        assert!(!created2);

        store
            .update_friend_host("fp1", "10.0.0.1", 9000, Some(b"pk"))
            .expect("host");
        let friends = store.load_friends().expect("load");
        assert_eq!(friends.len(), 1);
        assert_eq!(friends[0].host, "10.0.0.1");
        assert_eq!(friends[0].port, 9000);
        assert_eq!(friends[0].public_key.as_deref(), Some(&b"pk"[..]));
    }

    #[test]
    fn advert_rows_group_by_friend() {
        let store = RecordStore::open_in_memory().expect("open");
        store.add_advert("blob", 1, "t1").expect("add");
        store.add_advert("blob", 1, "t2").expect("add");
        store.add_advert("blob", 2, "t1").expect("add");
        assert!(store.any_adverts("blob").expect("any"));
        let friends = store.advert_friends("blob").expect("friends");
        assert_eq!(friends.len(), 2);

        store.del_advert("blob", 1, "t1").expect("del");
        store.del_advert("blob", 1, "t2").expect("del");
        store.del_advert("blob", 2, "t1").expect("del");
        assert!(!store.any_adverts("blob").expect("any"));
    }

    #[test]
    fn installation_party_upgrade_applies_later_migrations() {
        let conn = Connection::open_in_memory().expect("open");
        // Simulate the first release: v1 tables present, user_version 0.
        conn.execute_batch(SCHEMA_V1).expect("v1");
        let version: i64 = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .expect("version");
        assert_eq!(version, 0);

        let store = RecordStore::with_connection(conn).expect("migrate");
        // The route table only exists after migration 2.
        store.put_route("k", false, b"d").expect("route");
        assert_eq!(store.route_data("k").expect("get"), Some(b"d".to_vec()));
    }

    #[test]
    fn fresh_install_sets_latest_version() {
        let store = RecordStore::open_in_memory().expect("open");
        let conn = store.conn.lock().expect("lock");
        let version: i64 = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .expect("version");
        assert_eq!(version, MIGRATIONS.len() as i64);
    }

    #[test]
    fn record_envelope_wire_roundtrip() {
        let env = RecordEnvelope {
            record: rec("topic", "key", b"value", 3, "author"),
            seqno: 42,
        };
        let bytes = wire::to_vec(&env);
        let back: RecordEnvelope = wire::from_slice(&bytes).expect("decode");
        assert_eq!(back, env);
    }
}
