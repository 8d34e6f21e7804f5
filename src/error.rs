// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::{fmt::Display, sync::Arc};

use crate::{ConnectionContext, RtspMessageContext};
use bytes::Bytes;
use thiserror::Error;

/// An opaque `std::error::Error + Send + Sync + 'static` implementation.
///
/// The focus is on detailed human-readable messages: wire-level errors carry
/// enough context to find the offending message in a packet capture.
#[derive(Clone)]
pub struct Error(pub(crate) Arc<ErrorInt>);

impl Error {
    /// Returns the status code, if the error was generated from an upstream
    /// RTSP response.
    pub fn status_code(&self) -> Option<u16> {
        match self.0.as_ref() {
            ErrorInt::RtspResponseError { status, .. } => Some((*status).into()),
            _ => None,
        }
    }

    /// Returns the request method the peer refused, if the error was
    /// generated from an upstream RTSP response.
    pub(crate) fn refused_method(&self) -> Option<&rtsp_types::Method> {
        match self.0.as_ref() {
            ErrorInt::RtspResponseError { method, .. } => Some(method),
            _ => None,
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&self.0, f)
    }
}

impl std::error::Error for Error {}

#[derive(Debug, Error)]
pub(crate) enum ErrorInt {
    /// The configuration document or command line is unusable.
    #[error("Invalid configuration: {0}")]
    InvalidConf(String),

    #[error("Unable to listen on {addr}: {source}")]
    BindError {
        addr: std::net::SocketAddr,
        source: std::io::Error,
    },

    /// Unparseable or unexpected RTSP message.
    #[error("RTSP framing error: {description}\n\nconn: {conn_ctx}\nmsg: {msg_ctx}")]
    RtspFramingError {
        conn_ctx: ConnectionContext,
        msg_ctx: RtspMessageContext,
        description: String,
    },

    #[error("{status} response to {} CSeq={cseq}: {description}\n\n\
             conn: {conn_ctx}\nmsg: {msg_ctx}", Into::<&str>::into(.method))]
    RtspResponseError {
        conn_ctx: ConnectionContext,
        msg_ctx: RtspMessageContext,
        method: rtsp_types::Method,
        cseq: u32,
        status: rtsp_types::StatusCode,
        description: String,
    },

    #[error(
        "Received interleaved data on unassigned channel {channel_id}: \n\
         {:?}\n\nconn: {conn_ctx}\nmsg: {msg_ctx}",
        LimitedHex::new(data, 64)
    )]
    RtspUnassignedChannelError {
        conn_ctx: ConnectionContext,
        msg_ctx: RtspMessageContext,
        channel_id: u8,
        data: Bytes,
    },

    /// The peer violated the RTSP session rules in a way that has no
    /// single offending message position (eg a missing header).
    #[error("RTSP protocol violation: {description}\n\nconn: {conn_ctx}")]
    RtspProtocolError {
        conn_ctx: ConnectionContext,
        description: String,
    },

    #[error("Unable to connect to RTSP origin: {0}")]
    ConnectError(#[source] std::io::Error),

    #[error("Unable to allocate a UDP port pair: {0}")]
    PortAllocError(#[source] std::io::Error),

    #[error("Error reading from RTSP peer: {source}\n\nconn: {conn_ctx}\nmsg: {msg_ctx}")]
    RtspReadError {
        conn_ctx: ConnectionContext,
        msg_ctx: RtspMessageContext,
        source: std::io::Error,
    },

    #[error("Error writing to RTSP peer: {source}\n\nconn: {conn_ctx}")]
    WriteError {
        conn_ctx: ConnectionContext,
        source: std::io::Error,
    },

    #[error("Timeout")]
    Timeout,
}

/// Hex dump of at most `max_bytes` of a packet, with the total length.
///
/// Keeps interleaved-data error messages bounded; the tail of a large
/// payload adds nothing to diagnosis.
pub(crate) struct LimitedHex<'a> {
    inner: &'a [u8],
    max_bytes: usize,
}

impl<'a> LimitedHex<'a> {
    pub(crate) fn new(inner: &'a [u8], max_bytes: usize) -> Self {
        Self { inner, max_bytes }
    }
}

impl<'a> std::fmt::Debug for LimitedHex<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use pretty_hex::PrettyHex;
        let print = &self.inner[..self.inner.len().min(self.max_bytes)];
        writeln!(f, "Length: {0} (0x{0:x}) bytes", self.inner.len())?;
        write!(
            f,
            "{:#?}",
            print.hex_conf(pretty_hex::HexConfig {
                title: false,
                ..Default::default()
            })
        )?;
        if self.inner.len() > self.max_bytes {
            write!(
                f,
                "\n...{0} (0x{0:x}) bytes not shown...",
                self.inner.len() - self.max_bytes
            )?;
        }
        Ok(())
    }
}
