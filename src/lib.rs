// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTSP fan-out proxy.
//!
//! Accepts RTSP client sessions on a local endpoint, starts one upstream
//! RTSP session per configured stream path on demand, and splices upstream
//! RTP/RTCP payloads to every subscribed client over whichever transport
//! that client negotiated (UDP or interleaved TCP). Upstreams with no
//! subscribers are retired after a configurable TTL.

#![forbid(clippy::print_stderr, clippy::print_stdout)]

use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::net::SocketAddr;

mod error;

pub mod conf;
mod net;
pub mod proxy;

pub use error::Error;

/// Wraps the supplied `ErrorInt` and returns it as an `Err`.
macro_rules! bail {
    ($e:expr) => {
        return Err(crate::error::Error(std::sync::Arc::new($e)))
    };
}

macro_rules! wrap {
    ($e:expr) => {
        crate::error::Error(std::sync::Arc::new($e))
    };
}

pub(crate) use {bail, wrap};

/// A transport over which RTP and RTCP may be carried: plain UDP datagrams
/// or frames interleaved into the RTSP TCP connection.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Udp,
    Tcp,
}

impl Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(match self {
            TransportKind::Udp => "udp",
            TransportKind::Tcp => "tcp",
        })
    }
}

impl std::str::FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "udp" => Ok(TransportKind::Udp),
            "tcp" => Ok(TransportKind::Tcp),
            _ => Err(format!("unsupported protocol {s:?}; expected udp or tcp")),
        }
    }
}

/// Whether a packet belongs to the media flow (RTP) or the control flow
/// (RTCP). RTCP always lives one port (or one interleaved channel) above
/// its RTP counterpart.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TrackFlow {
    Rtp,
    Rtcp,
}

impl TrackFlow {
    /// The canonical interleaved channel id carrying this flow for track
    /// `track_id`: `2i` for RTP, `2i+1` for RTCP.
    pub fn channel_id(self, track_id: usize) -> u8 {
        ((track_id as u8) << 1) | (self == TrackFlow::Rtcp) as u8
    }

    /// Inverse of [`TrackFlow::channel_id`] for canonical assignments.
    pub fn of_channel_id(channel_id: u8) -> (usize, TrackFlow) {
        let flow = if (channel_id & 1) == 0 {
            TrackFlow::Rtp
        } else {
            TrackFlow::Rtcp
        };
        (usize::from(channel_id >> 1), flow)
    }
}

impl Display for TrackFlow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(match self {
            TrackFlow::Rtp => "RTP",
            TrackFlow::Rtcp => "RTCP",
        })
    }
}

/// A wall time taken from the local machine's realtime clock, used in error
/// reporting and logs.
#[derive(Copy, Clone, Debug)]
pub struct WallTime(chrono::DateTime<chrono::Utc>);

impl WallTime {
    fn now() -> Self {
        Self(chrono::Utc::now())
    }
}

impl Display for WallTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.format("%FT%T"))
    }
}

/// RTSP connection context: enough information to pick the flow out of a
/// packet capture. The proxy holds connections in both directions, so the
/// rendering doesn't assume which side dialed.
#[derive(Copy, Clone, Debug)]
pub struct ConnectionContext {
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    established_wall: WallTime,
}

impl ConnectionContext {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }
}

impl Display for ConnectionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}<->{}@{}",
            &self.local_addr, &self.peer_addr, &self.established_wall,
        )
    }
}

/// Context of a received message (or read error) within an RTSP connection.
///
/// When paired with a [`ConnectionContext`], this should allow picking the
/// message out of a packet capture.
#[derive(Copy, Clone, Debug)]
pub struct RtspMessageContext {
    /// The starting byte position within the input stream. The bottom 32 bits
    /// can be compared to the relative TCP sequence number.
    pos: u64,

    /// Time when the application parsed the message. Caveat: this may not
    /// closely match the time on a packet capture if the application is
    /// overloaded (or if `CLOCK_REALTIME` jumps).
    received_wall: WallTime,
}

impl RtspMessageContext {
    pub fn pos(&self) -> u64 {
        self.pos
    }
}

impl Display for RtspMessageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.pos, &self.received_wall)
    }
}
