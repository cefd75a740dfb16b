// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! The rendezvous directory: a signed mapping from fingerprint to
//! `(host, port)` used when a friend's address is unknown or stale.
//!
//! Records are self-certifying — the signature verifies under the public
//! key embedded in the record, and the fingerprint must match that key —
//! so the server needs no trust beyond storage.  Timestamps are
//! monotonic per fingerprint; a `PUT` that does not advance the stored
//! timestamp is rejected with `409`.

use std::path::Path;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, warn};

use crate::crypto::{Digest, Hasher, PublicIdentity, SecretIdentity, Signature};
use crate::error::{Error, Result};
use crate::httpx;
use crate::wire;

/// A published rendezvous row.  `public_key` and `signature` are
/// base64url-framed; the signature covers `(timestamp, host, port)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RendezvousRecord {
    pub fingerprint: String,
    #[serde(rename = "publicKey")]
    pub public_key: String,
    pub timestamp: i64,
    pub host: String,
    pub port: u16,
    pub signature: String,
}

impl RendezvousRecord {
    fn digest(&self) -> Digest {
        let mut h = Hasher::new();
        h.write_wire(&self.timestamp);
        h.write_wire(&self.host);
        h.write_wire(&self.port);
        h.finalize()
    }

    /// Fill in `fingerprint`, `public_key` and `signature` given that
    /// `timestamp`, `host` and `port` are set.
    pub fn sign(&mut self, ident: &SecretIdentity) {
        self.fingerprint = ident.fingerprint().to_string();
        self.public_key = wire::to_string_b64(&ident.public());
        let sig = ident.sign(&self.digest());
        self.signature = wire::to_string_b64(&sig);
    }

    /// Validate the embedded signature and the key/fingerprint binding.
    pub fn check_signature(&self) -> bool {
        let public: PublicIdentity = match wire::from_string_b64(&self.public_key) {
            Ok(p) => p,
            Err(_) => return false,
        };
        let sig: Signature = match wire::from_string_b64(&self.signature) {
            Ok(s) => s,
            Err(_) => return false,
        };
        if public.fingerprint().to_string() != self.fingerprint {
            return false;
        }
        public.verify(&self.digest(), &sig)
    }
}

/// Client side of the rendezvous protocol.
#[derive(Debug, Clone, Default)]
pub struct Client;

impl Client {
    pub fn new() -> Self {
        Client
    }

    /// Fetch and validate the record for `fingerprint` from the server
    /// at `addr` (`host:port`).
    pub async fn get(&self, addr: &str, fingerprint: &str) -> Result<RendezvousRecord> {
        let mut stream = TcpStream::connect(addr)
            .await
            .map_err(|e| Error::transport(format!("rendezvous connect: {e}")))?;
        httpx::write_request(
            &mut stream,
            "GET",
            &format!("/{fingerprint}"),
            httpx::CONTENT_JSON,
            b"",
        )
        .await?;
        let head = httpx::read_response_head(&mut stream).await?;
        let body = read_sized_body(&mut stream, &head).await?;
        match head.status {
            200 => {}
            404 => return Err(Error::not_found(format!("rendezvous key {fingerprint}"))),
            status => return Err(Error::transport(format!("rendezvous GET status {status}"))),
        }
        let record: RendezvousRecord = serde_json::from_slice(&body)
            .map_err(|e| Error::decode(format!("rendezvous record: {e}")))?;
        if !record.check_signature() {
            return Err(Error::auth("rendezvous record signature invalid"));
        }
        if record.fingerprint != fingerprint {
            return Err(Error::auth("rendezvous record fingerprint mismatch"));
        }
        Ok(record)
    }

    /// Publish our current address under our fingerprint.
    pub async fn put(
        &self,
        addr: &str,
        ident: &SecretIdentity,
        host: &str,
        port: u16,
    ) -> Result<()> {
        let mut record = RendezvousRecord {
            fingerprint: String::new(),
            public_key: String::new(),
            timestamp: unix_now(),
            host: host.to_string(),
            port,
            signature: String::new(),
        };
        record.sign(ident);

        let body = serde_json::to_vec(&record).expect("record serialization cannot fail");
        let mut stream = TcpStream::connect(addr)
            .await
            .map_err(|e| Error::transport(format!("rendezvous connect: {e}")))?;
        httpx::write_request(
            &mut stream,
            "PUT",
            &format!("/{}", record.fingerprint),
            httpx::CONTENT_JSON,
            &body,
        )
        .await?;
        let head = httpx::read_response_head(&mut stream).await?;
        match head.status {
            200 => Ok(()),
            409 => Err(Error::Conflict("rendezvous record too old".to_string())),
            status => Err(Error::transport(format!("rendezvous PUT status {status}"))),
        }
    }
}

async fn read_sized_body(stream: &mut TcpStream, head: &httpx::ResponseHead) -> Result<Vec<u8>> {
    use tokio::io::AsyncReadExt;
    match head.content_length {
        Some(len) => {
            if len > 1 << 20 {
                return Err(Error::transport("rendezvous body too large"));
            }
            let mut body = vec![0u8; len as usize];
            stream
                .read_exact(&mut body)
                .await
                .map_err(|e| Error::transport(format!("rendezvous body: {e}")))?;
            Ok(body)
        }
        None => {
            let mut body = Vec::new();
            stream
                .take(1 << 20)
                .read_to_end(&mut body)
                .await
                .map_err(|e| Error::transport(format!("rendezvous body: {e}")))?;
            Ok(body)
        }
    }
}

/// The rendezvous server: a signed-record key-value store over HTTP.
pub struct Server {
    conn: Mutex<Connection>,
    local_addr: std::net::SocketAddr,
    shutdown: watch::Sender<bool>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl Server {
    /// Bind `addr` and serve until [`Server::stop`].
    pub async fn start(addr: &str, db_path: impl AsRef<Path>) -> Result<std::sync::Arc<Server>> {
        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS rendezvous(
                fingerprint  TEXT NOT NULL PRIMARY KEY,
                public_key   TEXT NOT NULL,
                timestamp    INTEGER NOT NULL,
                host         TEXT NOT NULL,
                port         INTEGER NOT NULL,
                signature    TEXT NOT NULL
            );",
        )?;

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::transport(format!("rendezvous bind: {e}")))?;
        let local_addr = listener.local_addr()?;
        let (shutdown, shutdown_rx) = watch::channel(false);

        let server = std::sync::Arc::new(Server {
            conn: Mutex::new(conn),
            local_addr,
            shutdown,
            accept_task: Mutex::new(None),
        });

        let accept = tokio::spawn(accept_loop(server.clone(), listener, shutdown_rx));
        *server.accept_task.lock().expect("task lock poisoned") = Some(accept);
        Ok(server)
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let task = self
            .accept_task
            .lock()
            .expect("task lock poisoned")
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    fn lookup(&self, key: &str) -> Result<Option<RendezvousRecord>> {
        let conn = self.conn.lock().expect("rendezvous lock poisoned");
        conn.query_row(
            "SELECT fingerprint, public_key, timestamp, host, port, signature
             FROM rendezvous WHERE fingerprint = ?1",
            params![key],
            |row| {
                Ok(RendezvousRecord {
                    fingerprint: row.get(0)?,
                    public_key: row.get(1)?,
                    timestamp: row.get(2)?,
                    host: row.get(3)?,
                    port: row.get::<_, i64>(4)? as u16,
                    signature: row.get(5)?,
                })
            },
        )
        .optional()
        .map_err(Into::into)
    }

    /// Store a record iff it validates and strictly advances the stored
    /// timestamp.
    fn store(&self, key: &str, record: &RendezvousRecord) -> std::result::Result<(), u16> {
        if record.fingerprint != key || !record.check_signature() {
            return Err(401);
        }
        let conn = self.conn.lock().expect("rendezvous lock poisoned");
        let stored: Option<i64> = conn
            .query_row(
                "SELECT timestamp FROM rendezvous WHERE fingerprint = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .map_err(|_| 500u16)?;
        if let Some(stored) = stored {
            if record.timestamp <= stored {
                return Err(409);
            }
        }
        conn.execute(
            "REPLACE INTO rendezvous (fingerprint, public_key, timestamp, host, port, signature)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.fingerprint,
                record.public_key,
                record.timestamp,
                record.host,
                record.port,
                record.signature,
            ],
        )
        .map_err(|_| 500u16)?;
        Ok(())
    }
}

async fn accept_loop(
    server: std::sync::Arc<Server>,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        let server = server.clone();
                        connections.spawn(async move {
                            if let Err(err) = handle_connection(&server, stream).await {
                                debug!("rendezvous connection error: {err}");
                            }
                        });
                    }
                    Err(err) => {
                        warn!("rendezvous accept failed: {err}");
                        break;
                    }
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    while connections.join_next().await.is_some() {}
}

async fn handle_connection(server: &Server, mut stream: TcpStream) -> Result<()> {
    let req = httpx::read_request(&mut stream, 64 * 1024).await?;
    let key = match req.path.strip_prefix('/') {
        Some(key) if !key.is_empty() && !key.contains('/') => key.to_string(),
        _ => {
            return send_json_error(&mut stream, 404, "Unknown Key").await;
        }
    };

    match req.method.as_str() {
        "GET" => match server.lookup(&key) {
            Ok(Some(record)) => {
                let body = serde_json::to_vec(&record).expect("record serialization cannot fail");
                httpx::write_response(&mut stream, 200, httpx::CONTENT_JSON, &body).await
            }
            Ok(None) => send_json_error(&mut stream, 404, "Unknown Key").await,
            Err(err) => send_json_error(&mut stream, 500, &err.to_string()).await,
        },
        "PUT" => {
            if req.content_type.as_deref() != Some(httpx::CONTENT_JSON) {
                return send_json_error(&mut stream, 400, "Invalid content type").await;
            }
            let record: RendezvousRecord = match serde_json::from_slice(&req.body) {
                Ok(record) => record,
                Err(_) => {
                    return send_json_error(&mut stream, 400, "Unable to decode JSON").await;
                }
            };
            match server.store(&key, &record) {
                Ok(()) => httpx::write_response(&mut stream, 200, httpx::CONTENT_JSON, b"{}").await,
                Err(401) => send_json_error(&mut stream, 401, "Unable to validate record").await,
                Err(409) => send_json_error(&mut stream, 409, "Record too old").await,
                Err(status) => send_json_error(&mut stream, status, "Internal error").await,
            }
        }
        _ => send_json_error(&mut stream, 405, "Invalid method").await,
    }
}

async fn send_json_error(stream: &mut TcpStream, status: u16, message: &str) -> Result<()> {
    let body = serde_json::to_vec(message).expect("string serialization cannot fail");
    httpx::write_response(stream, status, httpx::CONTENT_JSON, &body).await
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock before unix epoch")
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SecretIdentity;

    async fn test_server() -> (std::sync::Arc<Server>, String, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = dir.path().join("rendezvous.db");
        let server = Server::start("127.0.0.1:0", &db).await.expect("start");
        let addr = server.local_addr().to_string();
        (server, addr, dir)
    }

    #[tokio::test]
    async fn publish_then_lookup() {
        let (server, addr, _dir) = test_server().await;
        let ident = SecretIdentity::generate("pw");
        let client = Client::new();

        client
            .put(&addr, &ident, "203.0.113.7", 8123)
            .await
            .expect("put");
        let record = client
            .get(&addr, &ident.fingerprint().to_string())
            .await
            .expect("get");
        assert_eq!(record.host, "203.0.113.7");
        assert_eq!(record.port, 8123);
        assert!(record.check_signature());

        server.stop().await;
    }

    #[tokio::test]
    async fn stale_timestamp_is_conflict() {
        let (server, addr, _dir) = test_server().await;
        let ident = SecretIdentity::generate("pw");

        let mut newer = RendezvousRecord {
            fingerprint: String::new(),
            public_key: String::new(),
            timestamp: 2000,
            host: "h1".to_string(),
            port: 1,
            signature: String::new(),
        };
        newer.sign(&ident);
        let mut older = RendezvousRecord {
            timestamp: 1000,
            host: "h2".to_string(),
            port: 2,
            ..newer.clone()
        };
        older.sign(&ident);

        let put = |record: RendezvousRecord, addr: String| async move {
            let body = serde_json::to_vec(&record).expect("json");
            let mut stream = TcpStream::connect(&addr).await.expect("connect");
            httpx::write_request(
                &mut stream,
                "PUT",
                &format!("/{}", record.fingerprint),
                httpx::CONTENT_JSON,
                &body,
            )
            .await
            .expect("request");
            httpx::read_response_head(&mut stream)
                .await
                .expect("head")
                .status
        };

        assert_eq!(put(newer, addr.clone()).await, 200);
        assert_eq!(put(older, addr.clone()).await, 409);

        server.stop().await;
    }

    #[tokio::test]
    async fn unknown_key_is_not_found() {
        let (server, addr, _dir) = test_server().await;
        let client = Client::new();
        match client.get(&addr, "nonexistent").await {
            Err(Error::NotFound(_)) => {}
            other => panic!("expected NotFound, got {other:?}"),
        }
        server.stop().await;
    }

    #[tokio::test]
    async fn tampered_record_is_rejected_by_server() {
        let (server, addr, _dir) = test_server().await;
        let ident = SecretIdentity::generate("pw");

        let mut record = RendezvousRecord {
            fingerprint: String::new(),
            public_key: String::new(),
            timestamp: 1234,
            host: "legit".to_string(),
            port: 1,
            signature: String::new(),
        };
        record.sign(&ident);
        record.host = "evil".to_string();

        let body = serde_json::to_vec(&record).expect("json");
        let mut stream = TcpStream::connect(&addr).await.expect("connect");
        httpx::write_request(
            &mut stream,
            "PUT",
            &format!("/{}", record.fingerprint),
            httpx::CONTENT_JSON,
            &body,
        )
        .await
        .expect("request");
        let head = httpx::read_response_head(&mut stream).await.expect("head");
        assert_eq!(head.status, 401);

        server.stop().await;
    }
}
