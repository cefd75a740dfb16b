// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Minimal HTTP/1.1 codec over generic async streams.
//!
//! Both the link RPC endpoint (`POST /h0tb0x/<service>` over mutual TLS)
//! and the rendezvous directory (plain TCP, JSON bodies) speak this
//! subset: one request per connection, `Content-Length` on requests and
//! small responses, close-delimited bodies when a handler streams.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

pub const CONTENT_BINARY: &str = "application/binary";
pub const CONTENT_JSON: &str = "application/json";

const MAX_HEAD_LEN: usize = 8 * 1024;

#[derive(Debug)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

#[derive(Debug)]
pub struct ResponseHead {
    pub status: u16,
    pub content_type: Option<String>,
    /// `None` means the body is delimited by connection close.
    pub content_length: Option<u64>,
}

pub async fn read_request<S>(io: &mut S, max_body: usize) -> Result<Request>
where
    S: AsyncRead + Unpin,
{
    let head = read_head(io).await?;
    let mut lines = head.lines();
    let request_line = lines
        .next()
        .ok_or_else(|| Error::transport("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| Error::transport("missing method"))?
        .to_string();
    let path = parts
        .next()
        .ok_or_else(|| Error::transport("missing path"))?
        .to_string();

    let mut content_type = None;
    let mut content_length: usize = 0;
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            let value = value.trim();
            match name.to_ascii_lowercase().as_str() {
                "content-type" => content_type = Some(value.to_string()),
                "content-length" => {
                    content_length = value
                        .parse()
                        .map_err(|_| Error::transport("bad content-length"))?;
                }
                _ => {}
            }
        }
    }

    if content_length > max_body {
        return Err(Error::transport("request body too large"));
    }
    let mut body = vec![0u8; content_length];
    io.read_exact(&mut body)
        .await
        .map_err(|e| Error::transport(format!("request body: {e}")))?;

    Ok(Request {
        method,
        path,
        content_type,
        body,
    })
}

pub async fn write_request<S>(
    io: &mut S,
    method: &str,
    path: &str,
    content_type: &str,
    body: &[u8],
) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let head = format!(
        "{method} {path} HTTP/1.1\r\n\
         Host: h0tb0x\r\n\
         Content-Type: {content_type}\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\r\n",
        body.len()
    );
    io.write_all(head.as_bytes())
        .await
        .map_err(|e| Error::transport(format!("write request: {e}")))?;
    io.write_all(body)
        .await
        .map_err(|e| Error::transport(format!("write request body: {e}")))?;
    io.flush()
        .await
        .map_err(|e| Error::transport(format!("flush request: {e}")))?;
    Ok(())
}

pub async fn read_response_head<S>(io: &mut S) -> Result<ResponseHead>
where
    S: AsyncRead + Unpin,
{
    let head = read_head(io).await?;
    let mut lines = head.lines();
    let status_line = lines
        .next()
        .ok_or_else(|| Error::transport("empty response"))?;
    let mut parts = status_line.split_whitespace();
    let _version = parts
        .next()
        .ok_or_else(|| Error::transport("missing http version"))?;
    let status: u16 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::transport("missing status code"))?;

    let mut content_type = None;
    let mut content_length = None;
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            let value = value.trim();
            match name.to_ascii_lowercase().as_str() {
                "content-type" => content_type = Some(value.to_string()),
                "content-length" => {
                    content_length = Some(
                        value
                            .parse()
                            .map_err(|_| Error::transport("bad content-length"))?,
                    );
                }
                _ => {}
            }
        }
    }

    Ok(ResponseHead {
        status,
        content_type,
        content_length,
    })
}

/// Write a response head.  `content_length = None` announces a
/// close-delimited streaming body.
pub async fn write_response_head<S>(
    io: &mut S,
    status: u16,
    content_type: Option<&str>,
    content_length: Option<usize>,
) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut head = format!("HTTP/1.1 {status} {}\r\n", reason(status));
    if let Some(ct) = content_type {
        head.push_str(&format!("Content-Type: {ct}\r\n"));
    }
    if let Some(len) = content_length {
        head.push_str(&format!("Content-Length: {len}\r\n"));
    }
    head.push_str("Connection: close\r\n\r\n");
    io.write_all(head.as_bytes())
        .await
        .map_err(|e| Error::transport(format!("write response head: {e}")))?;
    Ok(())
}

/// Write a complete response with a sized body.
pub async fn write_response<S>(
    io: &mut S,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    write_response_head(io, status, Some(content_type), Some(body.len())).await?;
    io.write_all(body)
        .await
        .map_err(|e| Error::transport(format!("write response body: {e}")))?;
    io.flush()
        .await
        .map_err(|e| Error::transport(format!("flush response: {e}")))?;
    Ok(())
}

async fn read_head<S>(io: &mut S) -> Result<String>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(256);
    loop {
        let byte = io
            .read_u8()
            .await
            .map_err(|e| Error::transport(format!("read header: {e}")))?;
        buf.push(byte);
        if buf.ends_with(b"\r\n\r\n") {
            break;
        }
        if buf.len() > MAX_HEAD_LEN {
            return Err(Error::transport("header too large"));
        }
    }
    String::from_utf8(buf).map_err(|_| Error::transport("header is not utf-8"))
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        409 => "Conflict",
        500 => "Internal Server Error",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn request_roundtrip() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        write_request(&mut client, "POST", "/h0tb0x/1", CONTENT_BINARY, b"abc")
            .await
            .expect("write");
        let req = read_request(&mut server, 1024).await.expect("read");
        assert_eq!(req.method, "POST");
        assert_eq!(req.path, "/h0tb0x/1");
        assert_eq!(req.content_type.as_deref(), Some(CONTENT_BINARY));
        assert_eq!(req.body, b"abc");
    }

    #[tokio::test]
    async fn response_roundtrip_sized() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        write_response(&mut server, 200, CONTENT_JSON, b"{}")
            .await
            .expect("write");
        let head = read_response_head(&mut client).await.expect("read head");
        assert_eq!(head.status, 200);
        assert_eq!(head.content_length, Some(2));
        let mut body = vec![0u8; 2];
        client.read_exact(&mut body).await.expect("body");
        assert_eq!(body, b"{}");
    }

    #[tokio::test]
    async fn close_delimited_body() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        tokio::spawn(async move {
            write_response_head(&mut server, 200, Some(CONTENT_BINARY), None)
                .await
                .expect("head");
            server.write_all(b"streamed").await.expect("body");
            server.shutdown().await.expect("shutdown");
        });

        let head = read_response_head(&mut client).await.expect("read head");
        assert_eq!(head.status, 200);
        assert_eq!(head.content_length, None);
        let mut body = Vec::new();
        client.read_to_end(&mut body).await.expect("read body");
        assert_eq!(body, b"streamed");
    }

    #[tokio::test]
    async fn oversized_request_body_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        write_request(&mut client, "POST", "/x", CONTENT_BINARY, &[0u8; 64])
            .await
            .expect("write");
        assert!(read_request(&mut server, 16).await.is_err());
    }
}
