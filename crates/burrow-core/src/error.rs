// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/// Error kinds consumed by the protocol layers.
///
/// Peer-induced malformations surface as `Decode` or `Auth` and are logged
/// and dropped by the layer that sees them.  `Transport` is the only kind
/// the notify and download loops retry on.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("transport: {0}")]
    Transport(String),

    #[error("auth: {0}")]
    Auth(String),

    #[error("decode: {0}")]
    Decode(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("bad password")]
    BadPassword,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("store: {0}")]
    Store(#[from] rusqlite::Error),
}

impl Error {
    pub fn transport(msg: impl Into<String>) -> Self {
        Error::Transport(msg.into())
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        Error::Auth(msg.into())
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        Error::Decode(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    /// `true` when a retry at a later time could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Io(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
