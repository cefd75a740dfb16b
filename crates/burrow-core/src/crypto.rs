// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Identities, hashing and the handful of symmetric primitives the
//! protocol needs.
//!
//! A node identity is an RSA-2048 keypair.  Its stable network name is
//! the `Fingerprint`: the SHA-224 digest of the DER-encoded subject
//! public key info.  Record signatures are RSASSA-PKCS#1-v1.5 over
//! SHA-224; symmetric keys travel under RSA-OAEP-SHA-224.  A secret
//! identity is serializable only in *locked* form: scrypt-derived key,
//! AES-256-OFB over the PKCS#1 private key bytes, with a 60-byte
//! preamble of `salt(16) || iv(16) || digest(28)`.

use std::fmt;
use std::io::{Read, Write};

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use ofb::cipher::{KeyIvInit, StreamCipher};
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey};
use rsa::pkcs8::{DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use rsa::{Oaep, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use sha2::{Digest as _, Sha224};

use crate::error::{Error, Result};
use crate::wire::{self, Wire};

type Aes256Ofb = ofb::Ofb<aes::Aes256>;

pub const DIGEST_LEN: usize = 28;
const LOCK_PREAMBLE_LEN: usize = 16 + 16 + DIGEST_LEN;
const SCRYPT_LOG_N: u8 = 14; // N = 16384
const SCRYPT_R: u32 = 8;
const SCRYPT_P: u32 = 1;

/// The output of the protocol hash function (SHA-224).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest([u8; DIGEST_LEN]);

impl Digest {
    pub fn from_bytes(bytes: [u8; DIGEST_LEN]) -> Self {
        Digest(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    pub fn parse(s: &str) -> Result<Self> {
        let raw = wire::b64_decode(s)?;
        let bytes: [u8; DIGEST_LEN] = raw
            .try_into()
            .map_err(|_| Error::decode("digest must be 28 bytes"))?;
        Ok(Digest(bytes))
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&wire::b64_encode(&self.0))
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let full = self.to_string();
        write!(f, "Digest({})", &full[..8.min(full.len())])
    }
}

impl Wire for Digest {
    fn encode(&self, out: &mut dyn Write) -> Result<()> {
        out.write_all(&self.0)?;
        Ok(())
    }
    fn decode(input: &mut dyn Read) -> Result<Self> {
        let raw = wire::read_raw(input, DIGEST_LEN)?;
        let bytes: [u8; DIGEST_LEN] = raw.try_into().expect("length fixed");
        Ok(Digest(bytes))
    }
}

/// Incremental SHA-224.  Implements `io::Write` so framed encodings can
/// be hashed without an intermediate buffer.
pub struct Hasher {
    inner: Sha224,
}

impl Hasher {
    pub fn new() -> Self {
        Hasher {
            inner: Sha224::new(),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    pub fn write_wire<T: Wire>(&mut self, value: &T) {
        value
            .encode(self)
            .expect("hashing an encodable value cannot fail");
    }

    pub fn finalize(self) -> Digest {
        let out = self.inner.finalize();
        let mut bytes = [0u8; DIGEST_LEN];
        bytes.copy_from_slice(&out);
        Digest(bytes)
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Hasher::new()
    }
}

impl Write for Hasher {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.inner.update(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Hash of raw bytes.
pub fn hash_bytes(data: &[u8]) -> Digest {
    let mut h = Hasher::new();
    h.update(data);
    h.finalize()
}

/// Hash of two digests in order; the derivation behind topic names.
pub fn hash_pair(a: &Digest, b: &Digest) -> Digest {
    let mut h = Hasher::new();
    h.write_wire(a);
    h.write_wire(b);
    h.finalize()
}

/// Hash of a framed string (length prefix included).
pub fn hash_str(s: &str) -> Digest {
    let mut h = Hasher::new();
    wire::write_string(&mut h, s).expect("hashing cannot fail");
    h.finalize()
}

/// A record signature.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Signature(Vec<u8>);

impl Signature {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Wire for Signature {
    fn encode(&self, out: &mut dyn Write) -> Result<()> {
        wire::write_bytes(out, &self.0)
    }
    fn decode(input: &mut dyn Read) -> Result<Self> {
        Ok(Signature(wire::read_bytes(input)?))
    }
}

/// A symmetric key encrypted to an identity.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct EncryptedKey(Vec<u8>);

impl Wire for EncryptedKey {
    fn encode(&self, out: &mut dyn Write) -> Result<()> {
        wire::write_bytes(out, &self.0)
    }
    fn decode(input: &mut dyn Read) -> Result<Self> {
        Ok(EncryptedKey(wire::read_bytes(input)?))
    }
}

/// A password-locked secret identity; the only serializable form.
#[derive(Clone, PartialEq, Eq)]
pub struct LockedIdentity(Vec<u8>);

impl LockedIdentity {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        LockedIdentity(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Wire for LockedIdentity {
    fn encode(&self, out: &mut dyn Write) -> Result<()> {
        wire::write_bytes(out, &self.0)
    }
    fn decode(input: &mut dyn Read) -> Result<Self> {
        Ok(LockedIdentity(wire::read_bytes(input)?))
    }
}

/// An encrypted-and-authenticated 32-bit message in a single AES block.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct TinyMessage([u8; 16]);

impl TinyMessage {
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl Wire for TinyMessage {
    fn encode(&self, out: &mut dyn Write) -> Result<()> {
        out.write_all(&self.0)?;
        Ok(())
    }
    fn decode(input: &mut dyn Read) -> Result<Self> {
        let raw = wire::read_raw(input, 16)?;
        Ok(TinyMessage(raw.try_into().expect("length fixed")))
    }
}

/// The public half of an identity.
#[derive(Clone, PartialEq, Eq)]
pub struct PublicIdentity {
    key: RsaPublicKey,
}

impl PublicIdentity {
    /// SHA-224 of the DER-encoded subject public key info.
    pub fn fingerprint(&self) -> Digest {
        let spki = self
            .key
            .to_public_key_der()
            .expect("encoding an RSA public key cannot fail");
        hash_bytes(spki.as_bytes())
    }

    pub fn verify(&self, digest: &Digest, sig: &Signature) -> bool {
        self.key
            .verify(
                Pkcs1v15Sign::new::<Sha224>(),
                digest.as_bytes(),
                sig.as_bytes(),
            )
            .is_ok()
    }

    pub fn encrypt(&self, key: &SymmetricKey) -> EncryptedKey {
        let out = self
            .key
            .encrypt(&mut OsRng, Oaep::new::<Sha224>(), &key.key)
            .expect("OAEP encryption of a 16-byte key cannot fail");
        EncryptedKey(out)
    }
}

impl fmt::Debug for PublicIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicIdentity({:?})", self.fingerprint())
    }
}

impl Wire for PublicIdentity {
    fn encode(&self, out: &mut dyn Write) -> Result<()> {
        let spki = self
            .key
            .to_public_key_der()
            .expect("encoding an RSA public key cannot fail");
        wire::write_bytes(out, spki.as_bytes())
    }
    fn decode(input: &mut dyn Read) -> Result<Self> {
        let der = wire::read_bytes(input)?;
        let key = RsaPublicKey::from_public_key_der(&der)
            .map_err(|_| Error::decode("public key is not RSA SPKI"))?;
        Ok(PublicIdentity { key })
    }
}

/// The secret half of an identity.  Never serialized directly; use
/// [`SecretIdentity::lock`].
#[derive(Clone)]
pub struct SecretIdentity {
    key: RsaPrivateKey,
    password: String,
}

impl SecretIdentity {
    /// Generate a fresh RSA-2048 identity protected by `password`.
    pub fn generate(password: &str) -> Self {
        let key = RsaPrivateKey::new(&mut OsRng, 2048).expect("RSA key generation cannot fail");
        SecretIdentity {
            key,
            password: password.to_string(),
        }
    }

    pub fn public(&self) -> PublicIdentity {
        PublicIdentity {
            key: self.key.to_public_key(),
        }
    }

    pub fn fingerprint(&self) -> Digest {
        self.public().fingerprint()
    }

    pub fn sign(&self, digest: &Digest) -> Signature {
        let out = self
            .key
            .sign(Pkcs1v15Sign::new::<Sha224>(), digest.as_bytes())
            .expect("PKCS#1 v1.5 signing cannot fail");
        Signature(out)
    }

    pub fn verify(&self, digest: &Digest, sig: &Signature) -> bool {
        self.public().verify(digest, sig)
    }

    pub fn decrypt(&self, ek: &EncryptedKey) -> Result<SymmetricKey> {
        let out = self
            .key
            .decrypt(Oaep::new::<Sha224>(), &ek.0)
            .map_err(|_| Error::decode("OAEP decryption failed"))?;
        let key: [u8; 16] = out
            .try_into()
            .map_err(|_| Error::decode("symmetric key must be 16 bytes"))?;
        Ok(SymmetricKey { key })
    }

    pub fn change_password(&mut self, password: &str) {
        self.password = password.to_string();
    }

    /// Lock the key for serialization at rest.  Layout:
    /// `salt(16) || iv(16) || sha224(pkcs1)(28) || ofb(pkcs1)`.
    pub fn lock(&self) -> LockedIdentity {
        let mut salt = [0u8; 16];
        let mut iv = [0u8; 16];
        OsRng.fill_bytes(&mut salt);
        OsRng.fill_bytes(&mut iv);
        let dk = derive_lock_key(&self.password, &salt);

        let mut flat = self
            .key
            .to_pkcs1_der()
            .expect("encoding an RSA private key cannot fail")
            .as_bytes()
            .to_vec();
        let digest = hash_bytes(&flat);

        let mut cipher =
            Aes256Ofb::new_from_slices(&dk, &iv).expect("key and iv lengths are fixed");
        cipher.apply_keystream(&mut flat);

        let mut out = Vec::with_capacity(LOCK_PREAMBLE_LEN + flat.len());
        out.extend_from_slice(&salt);
        out.extend_from_slice(&iv);
        out.extend_from_slice(digest.as_bytes());
        out.extend_from_slice(&flat);
        LockedIdentity(out)
    }

    /// Unlock a locked identity.  A wrong password surfaces as
    /// [`Error::BadPassword`] (the embedded digest does not match after
    /// decryption).
    pub fn unlock(locked: &LockedIdentity, password: &str) -> Result<SecretIdentity> {
        let raw = &locked.0;
        if raw.len() <= LOCK_PREAMBLE_LEN {
            return Err(Error::decode("locked identity too short"));
        }
        let salt = &raw[0..16];
        let iv = &raw[16..32];
        let digest = &raw[32..LOCK_PREAMBLE_LEN];
        let mut flat = raw[LOCK_PREAMBLE_LEN..].to_vec();

        let dk = derive_lock_key(password, salt);
        let mut cipher =
            Aes256Ofb::new_from_slices(&dk, iv).expect("key and iv lengths are fixed");
        cipher.apply_keystream(&mut flat);

        if hash_bytes(&flat).as_bytes() != digest {
            return Err(Error::BadPassword);
        }
        let key = RsaPrivateKey::from_pkcs1_der(&flat)
            .map_err(|_| Error::decode("unlocked bytes are not a PKCS#1 key"))?;
        Ok(SecretIdentity {
            key,
            password: password.to_string(),
        })
    }

    /// Self-signed CA-style certificate (CN=nobody, 1-year validity)
    /// plus the private key, in the forms rustls wants.
    pub fn tls_identity(&self) -> Result<(CertificateDer<'static>, PrivateKeyDer<'static>)> {
        let pkcs8 = self
            .key
            .to_pkcs8_der()
            .expect("encoding an RSA private key cannot fail");
        let key_der = PrivatePkcs8KeyDer::from(pkcs8.as_bytes().to_vec());

        let key_pair = rcgen::KeyPair::from_der_and_sign_algo(
            &PrivateKeyDer::Pkcs8(key_der.clone_key()),
            &rcgen::PKCS_RSA_SHA256,
        )
        .map_err(|e| Error::transport(format!("tls key: {e}")))?;

        let mut params = rcgen::CertificateParams::default();
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, "nobody");
        params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Constrained(1));
        let now = time::OffsetDateTime::now_utc();
        params.not_before = now - time::Duration::days(1);
        params.not_after = now + time::Duration::days(365);

        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| Error::transport(format!("tls certificate: {e}")))?;
        Ok((cert.der().clone(), PrivateKeyDer::Pkcs8(key_der)))
    }
}

impl fmt::Debug for SecretIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretIdentity({:?})", self.fingerprint())
    }
}

fn derive_lock_key(password: &str, salt: &[u8]) -> [u8; 32] {
    let params = scrypt::Params::new(SCRYPT_LOG_N, SCRYPT_R, SCRYPT_P, 32)
        .expect("scrypt parameters are fixed");
    let mut dk = [0u8; 32];
    scrypt::scrypt(password.as_bytes(), salt, &params, &mut dk)
        .expect("scrypt with a fixed output length cannot fail");
    dk
}

/// Extract the public identity bound to an X.509 certificate.
pub fn public_from_cert_der(der: &[u8]) -> Result<PublicIdentity> {
    let (_, cert) = x509_parser::parse_x509_certificate(der)
        .map_err(|_| Error::auth("invalid peer certificate"))?;
    let spki = cert.public_key();
    let key = RsaPublicKey::from_public_key_der(spki.raw)
        .map_err(|_| Error::auth("peer certificate key is not RSA"))?;
    Ok(PublicIdentity { key })
}

/// A shared or session secret (AES-128).
#[derive(Clone)]
pub struct SymmetricKey {
    key: [u8; 16],
}

impl SymmetricKey {
    pub fn generate() -> Self {
        let mut key = [0u8; 16];
        OsRng.fill_bytes(&mut key);
        SymmetricKey { key }
    }

    /// Encrypt and authenticate a 32-bit message into one AES block.
    ///
    /// Plaintext layout, with M1..M4 the message bytes (big-endian) and
    /// R1..R6 random: `R1..R6 M1..M4 R5 R6 M1..M4` — bytes 4..10 repeat
    /// at 10..16, which is what the verifier checks.  This yields about
    /// 2^48 of per-message IV and 2^48 of authenticator.
    pub fn encode_message(&self, msg: u32) -> TinyMessage {
        let mut buf = [0u8; 16];
        OsRng.fill_bytes(&mut buf[0..6]);
        buf[6..10].copy_from_slice(&msg.to_be_bytes());
        let (head, tail) = buf.split_at_mut(10);
        tail.copy_from_slice(&head[4..10]);

        let cipher = Aes128::new(GenericArray::from_slice(&self.key));
        let mut block = GenericArray::clone_from_slice(&buf);
        cipher.encrypt_block(&mut block);
        let mut out = [0u8; 16];
        out.copy_from_slice(&block);
        TinyMessage(out)
    }

    /// Decrypt and verify a tiny message.  `valid` is false when the
    /// repeated halves disagree (wrong key or tampering).
    pub fn decode_message(&self, msg: &TinyMessage) -> (u32, bool) {
        let cipher = Aes128::new(GenericArray::from_slice(&self.key));
        let mut block = GenericArray::clone_from_slice(&msg.0);
        cipher.decrypt_block(&mut block);
        let valid = block[4..10] == block[10..16];
        if !valid {
            return (0, false);
        }
        let mut out = [0u8; 4];
        out.copy_from_slice(&block[6..10]);
        (u32::from_be_bytes(out), true)
    }
}

/// A random string with 128 bits of entropy, charset `[A-Za-z0-9_-]`.
pub fn random_string() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    wire::b64_encode(&bytes)
}
