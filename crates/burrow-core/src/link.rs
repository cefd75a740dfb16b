// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! The link layer: mutual-TLS friend-to-friend RPC.
//!
//! Every node presents a self-signed certificate bound to its identity.
//! The server accepts any client certificate and then requires the
//! SPKI fingerprint to match a known friend; the client skips the name
//! check entirely and pins the peer certificate fingerprint after the
//! handshake.  RPCs are `POST /h0tb0x/<service>` with binary bodies;
//! responses are close-delimited so handlers can stream.
//!
//! Outbound calls address friends by fingerprint
//! (`friend://<fingerprint>/h0tb0x/<service>`); the fingerprint is
//! resolved to `host:port` through the friend directory, falling back
//! to the rendezvous server when the address is unknown or the last
//! attempt failed.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex, Once};
use std::time::Duration;

use async_trait::async_trait;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::DigitallySignedStruct;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, warn};

use crate::crypto::{self, Digest, PublicIdentity, SecretIdentity};
use crate::error::{Error, Result};
use crate::httpx;
use crate::rendezvous;
use crate::store::{FriendId, RecordStore, UNKNOWN_HOST};
use crate::wire;

pub const DIAL_TIMEOUT: Duration = Duration::from_secs(3);
const MAX_REQUEST_BODY: usize = 16 * 1024 * 1024;

/// Numeric service identifiers dispatched by the link layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Service {
    Notify = 1,
    Data = 2,
    Advert = 3,
}

impl Service {
    pub fn number(self) -> u32 {
        self as u32
    }

    fn from_number(n: u32) -> Option<Service> {
        match n {
            1 => Some(Service::Notify),
            2 => Some(Service::Data),
            3 => Some(Service::Advert),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FriendStatus {
    /// Emitted for every persisted friend at `start` time.
    Startup,
    Added,
    Removed,
}

/// Server side of one RPC: the response stream handed to a handler.
///
/// Nothing is written until the handler produces its first byte; at
/// that point a `200` head goes out and the status can no longer
/// change.  A handler error after that surfaces to the caller as
/// stream truncation.
pub struct ResponseStream<'a> {
    io: &'a mut (dyn AsyncWrite + Unpin + Send),
    wrote: bool,
}

impl<'a> ResponseStream<'a> {
    fn new(io: &'a mut (dyn AsyncWrite + Unpin + Send)) -> Self {
        ResponseStream { io, wrote: false }
    }

    /// Send the `200` head if it has not gone out yet and return the
    /// raw stream for writing.
    pub async fn begin(&mut self) -> Result<&mut (dyn AsyncWrite + Unpin + Send)> {
        if !self.wrote {
            httpx::write_response_head(&mut self.io, 200, Some(httpx::CONTENT_BINARY), None)
                .await?;
            self.wrote = true;
        }
        Ok(&mut *self.io)
    }

    pub async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        let io = self.begin().await?;
        io.write_all(data)
            .await
            .map_err(|e| Error::transport(format!("write response: {e}")))?;
        Ok(())
    }

    pub fn wrote(&self) -> bool {
        self.wrote
    }
}

/// A registered service endpoint.
#[async_trait]
pub trait ServiceHandler: Send + Sync {
    async fn handle(
        &self,
        friend: FriendId,
        fp: &Digest,
        body: Vec<u8>,
        out: &mut ResponseStream<'_>,
    ) -> Result<()>;
}

/// Upper-layer observer of friend directory changes.
pub trait FriendListener: Send + Sync {
    fn on_friend_change(&self, friend: FriendId, fp: &Digest, status: FriendStatus);
}

/// Response body of an outbound RPC, delimited either by the announced
/// length or by connection close.
pub type ResponseBody = tokio::io::Take<tokio_rustls::client::TlsStream<TcpStream>>;

#[derive(Clone)]
struct FriendInfo {
    id: FriendId,
    fp: Digest,
    fp_str: String,
    rendezvous: String,
    public_key: Option<PublicIdentity>,
    host: String,
    port: u16,
    failed: bool,
}

#[derive(Default)]
struct FriendTable {
    by_fp: HashMap<String, FriendInfo>,
    fp_by_id: HashMap<FriendId, String>,
}

impl FriendTable {
    fn insert(&mut self, info: FriendInfo) {
        self.fp_by_id.insert(info.id, info.fp_str.clone());
        self.by_fp.insert(info.fp_str.clone(), info);
    }

    fn by_id(&self, id: FriendId) -> Option<&FriendInfo> {
        self.fp_by_id.get(&id).and_then(|fp| self.by_fp.get(fp))
    }

    fn remove(&mut self, fp_str: &str) -> Option<FriendInfo> {
        let info = self.by_fp.remove(fp_str)?;
        self.fp_by_id.remove(&info.id);
        Some(info)
    }
}

/// The link manager: friend directory plus TLS listener and dialer.
pub struct LinkMgr {
    ident: SecretIdentity,
    self_fp: Digest,
    bind: SocketAddr,
    store: Arc<RecordStore>,
    rclient: rendezvous::Client,
    friends: RwLock<FriendTable>,
    handlers: StdMutex<HashMap<u32, Arc<dyn ServiceHandler>>>,
    listeners: StdMutex<Vec<Arc<dyn FriendListener>>>,
    acceptor: TlsAcceptor,
    connector: TlsConnector,
    local_addr: StdMutex<Option<SocketAddr>>,
    shutdown: watch::Sender<bool>,
    accept_task: StdMutex<Option<JoinHandle<()>>>,
}

impl LinkMgr {
    /// Build a link manager; does not bind or start anything.
    pub fn new(
        ident: SecretIdentity,
        bind: SocketAddr,
        store: Arc<RecordStore>,
    ) -> Result<Arc<LinkMgr>> {
        ensure_rustls_crypto_provider();
        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());

        let (cert, key) = ident.tls_identity()?;
        let server_config = rustls::ServerConfig::builder()
            .with_client_cert_verifier(Arc::new(AcceptAnyClient {
                provider: provider.clone(),
            }))
            .with_single_cert(vec![cert.clone()], key.clone_key())
            .map_err(|e| Error::transport(format!("tls server config: {e}")))?;

        let client_config = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServer { provider }))
            .with_client_auth_cert(vec![cert], key)
            .map_err(|e| Error::transport(format!("tls client config: {e}")))?;

        let (shutdown, _) = watch::channel(false);
        let self_fp = ident.fingerprint();
        Ok(Arc::new(LinkMgr {
            ident,
            self_fp,
            bind,
            store,
            rclient: rendezvous::Client::new(),
            friends: RwLock::new(FriendTable::default()),
            handlers: StdMutex::new(HashMap::new()),
            listeners: StdMutex::new(Vec::new()),
            acceptor: TlsAcceptor::from(Arc::new(server_config)),
            connector: TlsConnector::from(Arc::new(client_config)),
            local_addr: StdMutex::new(None),
            shutdown,
            accept_task: StdMutex::new(None),
        }))
    }

    pub fn identity(&self) -> &SecretIdentity {
        &self.ident
    }

    pub fn self_fingerprint(&self) -> Digest {
        self.self_fp
    }

    /// Register a handler for a service number.  Call before `start`.
    pub fn add_handler(&self, service: Service, handler: Arc<dyn ServiceHandler>) {
        self.handlers
            .lock()
            .expect("handler lock poisoned")
            .insert(service.number(), handler);
    }

    /// Register a friend-change listener.  Call before `start`.
    pub fn add_listener(&self, listener: Arc<dyn FriendListener>) {
        self.listeners
            .lock()
            .expect("listener lock poisoned")
            .push(listener);
    }

    /// Load the persisted friend directory, emit `Startup` events, and
    /// begin accepting connections.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let rows = self.store.load_friends()?;
        {
            let mut friends = self.friends.write().await;
            for row in rows {
                let fp = match Digest::parse(&row.fingerprint) {
                    Ok(fp) => fp,
                    Err(_) => panic!("corrupt friend fingerprint in store"),
                };
                let public_key = row
                    .public_key
                    .as_deref()
                    .and_then(|raw| wire::from_slice::<PublicIdentity>(raw).ok());
                friends.insert(FriendInfo {
                    id: row.id,
                    fp,
                    fp_str: row.fingerprint,
                    rendezvous: row.rendezvous,
                    public_key,
                    host: row.host,
                    port: row.port,
                    failed: false,
                });
            }
        }

        let startup: Vec<(FriendId, Digest)> = {
            let friends = self.friends.read().await;
            friends.by_fp.values().map(|f| (f.id, f.fp)).collect()
        };
        for listener in self.listeners_snapshot() {
            for (id, fp) in &startup {
                listener.on_friend_change(*id, fp, FriendStatus::Startup);
            }
        }

        let listener = TcpListener::bind(self.bind)
            .await
            .map_err(|e| Error::transport(format!("link bind: {e}")))?;
        *self.local_addr.lock().expect("addr lock poisoned") = Some(listener.local_addr()?);

        let mgr = self.clone();
        let shutdown_rx = self.shutdown.subscribe();
        let task = tokio::spawn(accept_loop(mgr, listener, shutdown_rx));
        *self.accept_task.lock().expect("task lock poisoned") = Some(task);
        Ok(())
    }

    /// Close the listener and drain in-flight handlers.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let task = self.accept_task.lock().expect("task lock poisoned").take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().expect("addr lock poisoned")
    }

    fn listeners_snapshot(&self) -> Vec<Arc<dyn FriendListener>> {
        self.listeners
            .lock()
            .expect("listener lock poisoned")
            .clone()
    }

    /// Add a friend, or refresh the rendezvous address of an existing
    /// one.  `Added` is emitted only for new friends.
    pub async fn add_update_friend(&self, fp: &Digest, rendezvous: &str) -> Result<FriendId> {
        let fp_str = fp.to_string();
        let (id, was_known) = {
            let mut friends = self.friends.write().await;
            let (id, _) = self.store.upsert_friend(&fp_str, rendezvous)?;
            match friends.by_fp.get_mut(&fp_str) {
                Some(info) => {
                    info.rendezvous = rendezvous.to_string();
                    (id, true)
                }
                None => {
                    friends.insert(FriendInfo {
                        id,
                        fp: *fp,
                        fp_str: fp_str.clone(),
                        rendezvous: rendezvous.to_string(),
                        public_key: None,
                        host: UNKNOWN_HOST.to_string(),
                        port: 0,
                        failed: false,
                    });
                    (id, false)
                }
            }
        };
        if !was_known {
            for listener in self.listeners_snapshot() {
                listener.on_friend_change(id, fp, FriendStatus::Added);
            }
        }
        Ok(id)
    }

    /// Record a friend's current address, bypassing rendezvous.
    pub async fn update_host_data(
        &self,
        fp: &Digest,
        host: &str,
        port: u16,
        public_key: Option<&PublicIdentity>,
    ) -> Result<()> {
        let fp_str = fp.to_string();
        let mut friends = self.friends.write().await;
        let encoded = public_key.map(wire::to_vec);
        self.store
            .update_friend_host(&fp_str, host, port, encoded.as_deref())?;
        match friends.by_fp.get_mut(&fp_str) {
            Some(info) => {
                info.host = host.to_string();
                info.port = port;
                info.failed = false;
                if let Some(pk) = public_key {
                    info.public_key = Some(pk.clone());
                }
                Ok(())
            }
            None => Err(Error::not_found(format!("friend {fp_str}"))),
        }
    }

    pub async fn remove_friend(&self, fp: &Digest) -> Result<()> {
        let fp_str = fp.to_string();
        let removed = {
            let mut friends = self.friends.write().await;
            match friends.remove(&fp_str) {
                Some(info) => {
                    self.store.delete_friend(&fp_str)?;
                    Some(info.id)
                }
                None => None,
            }
        };
        if let Some(id) = removed {
            for listener in self.listeners_snapshot() {
                listener.on_friend_change(id, fp, FriendStatus::Removed);
            }
        }
        Ok(())
    }

    pub async fn friend_fingerprint(&self, id: FriendId) -> Option<Digest> {
        let friends = self.friends.read().await;
        friends.by_id(id).map(|f| f.fp)
    }

    pub async fn friend_id(&self, fp: &Digest) -> Option<FriendId> {
        let friends = self.friends.read().await;
        friends.by_fp.get(&fp.to_string()).map(|f| f.id)
    }

    /// Send an RPC to a friend and return the open response stream.
    pub async fn send(
        &self,
        service: Service,
        friend: FriendId,
        body: Vec<u8>,
    ) -> Result<ResponseBody> {
        let fi = {
            let friends = self.friends.read().await;
            friends
                .by_id(friend)
                .cloned()
                .ok_or_else(|| Error::transport(format!("dial of removed friend {friend}")))?
        };
        debug!(
            "POST friend://{}/h0tb0x/{}",
            fi.fp_str,
            service.number()
        );

        let fi = self.resolve(fi).await;
        if fi.host == UNKNOWN_HOST {
            return Err(Error::transport(
                "no address known and rendezvous lookup failed",
            ));
        }

        let mut stream = match self.dial(&fi).await {
            Ok(stream) => stream,
            Err(err) => {
                self.mark_failed(&fi.fp_str).await;
                return Err(err);
            }
        };

        httpx::write_request(
            &mut stream,
            "POST",
            &format!("/h0tb0x/{}", service.number()),
            httpx::CONTENT_BINARY,
            &body,
        )
        .await?;

        let head = httpx::read_response_head(&mut stream).await?;
        if head.status != 200 {
            return Err(Error::transport(format!(
                "rpc had non 200 http return code: {}",
                head.status
            )));
        }
        if head.content_type.as_deref() != Some(httpx::CONTENT_BINARY) {
            return Err(Error::transport("rpc content type mismatch"));
        }
        use tokio::io::AsyncReadExt as _;
        Ok(stream.take(head.content_length.unwrap_or(u64::MAX)))
    }

    /// Refresh the address from rendezvous when it is unknown or the
    /// previous attempt failed.
    async fn resolve(&self, fi: FriendInfo) -> FriendInfo {
        if !fi.failed && fi.host != UNKNOWN_HOST {
            return fi;
        }
        debug!("rendezvous lookup for {}", fi.fp_str);
        match self.rclient.get(&fi.rendezvous, &fi.fp_str).await {
            Ok(rec) => {
                let public: Option<PublicIdentity> = wire::from_string_b64(&rec.public_key).ok();
                if let Err(err) = self
                    .update_host_data(&fi.fp, &rec.host, rec.port, public.as_ref())
                    .await
                {
                    warn!("rendezvous host update failed: {err}");
                    return fi;
                }
                FriendInfo {
                    host: rec.host,
                    port: rec.port,
                    failed: false,
                    public_key: public,
                    ..fi
                }
            }
            Err(err) => {
                debug!("rendezvous lookup failed: {err}");
                fi
            }
        }
    }

    async fn mark_failed(&self, fp_str: &str) {
        let mut friends = self.friends.write().await;
        if let Some(info) = friends.by_fp.get_mut(fp_str) {
            info.failed = true;
        }
    }

    /// Dial a friend and pin its certificate fingerprint.
    async fn dial(
        &self,
        fi: &FriendInfo,
    ) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
        let addr = format!("{}:{}", fi.host, fi.port);
        let tcp = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&addr))
            .await
            .map_err(|_| Error::transport(format!("dial {addr}: timeout")))?
            .map_err(|e| Error::transport(format!("dial {addr}: {e}")))?;

        let name = ServerName::try_from("h0tb0x").expect("static server name is valid");
        let tls = self
            .connector
            .connect(name, tcp)
            .await
            .map_err(|e| Error::transport(format!("tls handshake: {e}")))?;

        let peer = {
            let (_, conn) = tls.get_ref();
            let der = conn
                .peer_certificates()
                .and_then(|certs| certs.first())
                .ok_or_else(|| Error::auth("missing peer certificate"))?;
            crypto::public_from_cert_der(der)?
        };
        if peer.fingerprint() != fi.fp {
            return Err(Error::auth("peer certificate fingerprint mismatch"));
        }
        Ok(tls)
    }

    async fn handle_connection(
        self: Arc<Self>,
        stream: tokio_rustls::server::TlsStream<TcpStream>,
    ) {
        let mut stream = stream;
        let peer = {
            let (_, conn) = stream.get_ref();
            match conn
                .peer_certificates()
                .and_then(|certs| certs.first())
                .ok_or_else(|| Error::auth("missing peer certificate"))
                .and_then(|der| crypto::public_from_cert_der(der))
            {
                Ok(peer) => peer,
                Err(_) => {
                    let _ = respond_error(&mut stream, 403, "Invalid peer certificate").await;
                    return;
                }
            }
        };

        let req = match httpx::read_request(&mut stream, MAX_REQUEST_BODY).await {
            Ok(req) => req,
            Err(err) => {
                debug!("bad link request: {err}");
                let _ = respond_error(&mut stream, 400, "Bad request").await;
                return;
            }
        };

        if req.content_type.as_deref() != Some(httpx::CONTENT_BINARY) {
            let _ = respond_error(&mut stream, 400, "Invalid content type").await;
            return;
        }
        let service = match req
            .path
            .strip_prefix("/h0tb0x/")
            .and_then(|rest| rest.parse::<u32>().ok())
        {
            Some(service) => service,
            None => {
                let _ =
                    respond_error(&mut stream, 404, &format!("Unknown URL: '{}'", req.path)).await;
                return;
            }
        };
        if req.method != "POST" {
            let _ = respond_error(
                &mut stream,
                405,
                &format!("Invalid method: '{}'", req.method),
            )
            .await;
            return;
        }

        let handler = {
            let handlers = self.handlers.lock().expect("handler lock poisoned");
            handlers.get(&service).cloned()
        };
        let Some(handler) = handler else {
            let _ = respond_error(&mut stream, 403, &format!("Unknown service: {service}")).await;
            return;
        };

        let fp = peer.fingerprint();
        // The read guard stays held across dispatch so friend removal
        // blocks until in-flight handlers finish.
        let friends = self.friends.read().await;
        let Some(fi) = friends.by_fp.get(&fp.to_string()) else {
            drop(friends);
            let _ = respond_error(&mut stream, 403, &format!("Unknown friend: {fp}")).await;
            return;
        };
        let friend_id = fi.id;

        let mut out = ResponseStream::new(&mut stream);
        let result = handler.handle(friend_id, &fp, req.body, &mut out).await;
        let wrote = out.wrote();
        drop(friends);

        match result {
            Err(err) if !wrote => {
                let _ = respond_error(&mut stream, 500, &err.to_string()).await;
            }
            Err(err) => {
                debug!("handler failed mid-stream: {err}");
            }
            Ok(()) => {
                if !wrote {
                    let _ = httpx::write_response_head(
                        &mut stream,
                        200,
                        Some(httpx::CONTENT_BINARY),
                        Some(0),
                    )
                    .await;
                }
            }
        }
        let _ = stream.shutdown().await;
    }
}

async fn respond_error(
    stream: &mut (impl AsyncWrite + Unpin),
    status: u16,
    message: &str,
) -> Result<()> {
    debug!("link responding {status}: {message}");
    httpx::write_response(stream, status, "text/plain", message.as_bytes()).await
}

async fn accept_loop(
    mgr: Arc<LinkMgr>,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((tcp, _)) => {
                        let mgr = mgr.clone();
                        let acceptor = mgr.acceptor.clone();
                        connections.spawn(async move {
                            match acceptor.accept(tcp).await {
                                Ok(tls) => mgr.handle_connection(tls).await,
                                Err(err) => debug!("tls accept failed: {err}"),
                            }
                        });
                    }
                    Err(err) => {
                        warn!("link accept failed: {err}");
                        break;
                    }
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    while connections.join_next().await.is_some() {}
}

fn ensure_rustls_crypto_provider() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    });
}

#[derive(Debug)]
struct AcceptAnyServer {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyServer {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        // Identity is pinned by fingerprint after the handshake.
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[derive(Debug)]
struct AcceptAnyClient {
    provider: Arc<CryptoProvider>,
}

impl ClientCertVerifier for AcceptAnyClient {
    fn root_hint_subjects(&self) -> &[rustls::DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> std::result::Result<ClientCertVerified, rustls::Error> {
        // Any certificate is admitted; dispatch rejects fingerprints
        // that do not belong to a friend.
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    struct EchoHandler;

    #[async_trait]
    impl ServiceHandler for EchoHandler {
        async fn handle(
            &self,
            _friend: FriendId,
            _fp: &Digest,
            body: Vec<u8>,
            out: &mut ResponseStream<'_>,
        ) -> Result<()> {
            out.write_all(&body).await
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl ServiceHandler for FailingHandler {
        async fn handle(
            &self,
            _friend: FriendId,
            _fp: &Digest,
            _body: Vec<u8>,
            _out: &mut ResponseStream<'_>,
        ) -> Result<()> {
            Err(Error::not_found("nothing here"))
        }
    }

    async fn test_link(ident: SecretIdentity) -> Arc<LinkMgr> {
        let store = Arc::new(RecordStore::open_in_memory().expect("store"));
        LinkMgr::new(ident, "127.0.0.1:0".parse().expect("addr"), store).expect("link")
    }

    async fn befriend(a: &Arc<LinkMgr>, b: &Arc<LinkMgr>) {
        let b_fp = b.self_fingerprint();
        a.add_update_friend(&b_fp, "unused:0").await.expect("add");
        let b_addr = b.local_addr().expect("addr");
        a.update_host_data(&b_fp, "127.0.0.1", b_addr.port(), None)
            .await
            .expect("host");
    }

    #[tokio::test]
    async fn rpc_roundtrip_between_friends() {
        let alice = test_link(SecretIdentity::generate("a")).await;
        let bob = test_link(SecretIdentity::generate("b")).await;
        bob.add_handler(Service::Data, Arc::new(EchoHandler));

        alice.start().await.expect("start alice");
        bob.start().await.expect("start bob");
        befriend(&alice, &bob).await;
        befriend(&bob, &alice).await;

        let friend = alice.friend_id(&bob.self_fingerprint()).await.expect("id");
        let mut resp = alice
            .send(Service::Data, friend, b"ping".to_vec())
            .await
            .expect("send");
        let mut body = Vec::new();
        resp.read_to_end(&mut body).await.expect("read");
        assert_eq!(body, b"ping");

        alice.stop().await;
        bob.stop().await;
    }

    #[tokio::test]
    async fn handler_error_without_bytes_is_internal_error() {
        let alice = test_link(SecretIdentity::generate("a")).await;
        let bob = test_link(SecretIdentity::generate("b")).await;
        bob.add_handler(Service::Data, Arc::new(FailingHandler));

        alice.start().await.expect("start alice");
        bob.start().await.expect("start bob");
        befriend(&alice, &bob).await;
        befriend(&bob, &alice).await;

        let friend = alice.friend_id(&bob.self_fingerprint()).await.expect("id");
        match alice.send(Service::Data, friend, vec![]).await {
            Err(Error::Transport(msg)) => assert!(msg.contains("500"), "got: {msg}"),
            other => panic!("expected transport error, got {:?}", other.map(|_| ())),
        }

        alice.stop().await;
        bob.stop().await;
    }

    #[tokio::test]
    async fn unknown_caller_is_rejected() {
        let alice = test_link(SecretIdentity::generate("a")).await;
        let bob = test_link(SecretIdentity::generate("b")).await;
        bob.add_handler(Service::Data, Arc::new(EchoHandler));

        alice.start().await.expect("start alice");
        bob.start().await.expect("start bob");
        // Alice knows bob, but bob has never heard of alice.
        befriend(&alice, &bob).await;

        let friend = alice.friend_id(&bob.self_fingerprint()).await.expect("id");
        match alice.send(Service::Data, friend, vec![]).await {
            Err(Error::Transport(msg)) => assert!(msg.contains("403"), "got: {msg}"),
            other => panic!("expected 403 transport error, got {:?}", other.map(|_| ())),
        }

        alice.stop().await;
        bob.stop().await;
    }

    #[tokio::test]
    async fn fingerprint_mismatch_fails_the_dial() {
        let alice = test_link(SecretIdentity::generate("a")).await;
        let bob = test_link(SecretIdentity::generate("b")).await;
        let mallory = SecretIdentity::generate("m");
        bob.add_handler(Service::Data, Arc::new(EchoHandler));

        alice.start().await.expect("start alice");
        bob.start().await.expect("start bob");

        // Alice expects mallory's fingerprint at bob's address.
        let mallory_fp = mallory.fingerprint();
        alice
            .add_update_friend(&mallory_fp, "unused:0")
            .await
            .expect("add");
        let bob_addr = bob.local_addr().expect("addr");
        alice
            .update_host_data(&mallory_fp, "127.0.0.1", bob_addr.port(), None)
            .await
            .expect("host");

        let friend = alice.friend_id(&mallory_fp).await.expect("id");
        match alice.send(Service::Data, friend, vec![]).await {
            Err(Error::Auth(_)) => {}
            other => panic!("expected auth error, got {:?}", other.map(|_| ())),
        }

        alice.stop().await;
        bob.stop().await;
    }

    #[tokio::test]
    async fn friend_events_fire_in_order() {
        use std::sync::Mutex;

        struct Recorder(Mutex<Vec<(FriendId, FriendStatus)>>);
        impl FriendListener for Recorder {
            fn on_friend_change(&self, friend: FriendId, _fp: &Digest, status: FriendStatus) {
                self.0.lock().expect("events").push((friend, status));
            }
        }

        let store = Arc::new(RecordStore::open_in_memory().expect("store"));
        let persisted = SecretIdentity::generate("p");
        store
            .upsert_friend(&persisted.fingerprint().to_string(), "rdv:0")
            .expect("seed");

        let link = LinkMgr::new(
            SecretIdentity::generate("x"),
            "127.0.0.1:0".parse().expect("addr"),
            store,
        )
        .expect("link");
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        link.add_listener(recorder.clone());

        link.start().await.expect("start");
        let other = SecretIdentity::generate("o");
        link.add_update_friend(&other.fingerprint(), "rdv:0")
            .await
            .expect("add");
        link.remove_friend(&other.fingerprint()).await.expect("rm");

        let events = recorder.0.lock().expect("events").clone();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].1, FriendStatus::Startup);
        assert_eq!(events[1].1, FriendStatus::Added);
        assert_eq!(events[2].1, FriendStatus::Removed);

        link.stop().await;
    }
}
