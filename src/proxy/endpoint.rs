// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! UDP endpoints.
//!
//! Each endpoint couples a socket with two task-side halves:
//!
//! *   a reader that allocates a fresh buffer per datagram (payloads travel
//!     across the fan-out to several writer queues, so they must never
//!     alias), looks the source address up in the shared demultiplexing
//!     table, and either forwards the payload or drops it;
//! *   a writer draining a bounded queue, so datagrams from concurrent
//!     producers never interleave mid-write.
//!
//! The proxy's two listener sockets (RTP and RTCP) use both halves. The
//! per-track sockets receiving from UDP origins reuse the reader half via
//! [`run_reader`]; their bindings are entries in the same table.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use log::{debug, trace, warn};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{Shared, WRITE_QUEUE_DEPTH};
use crate::error::ErrorInt;
use crate::{bail, Error, TrackFlow};

/// An enqueued outbound datagram.
pub(super) struct UdpWrite {
    pub(super) to: SocketAddr,
    pub(super) payload: Bytes,
}

/// Where a packet from a known origin peer belongs.
#[derive(Clone, Debug)]
pub(super) struct OriginBinding {
    pub(super) path: String,
    pub(super) track_id: usize,
    pub(super) flow: TrackFlow,
}

/// Source address → owning upstream track, for every socket that receives
/// origin traffic. Upstream sessions insert their peers' addresses when a
/// stream becomes ready and remove them on teardown.
pub(super) type DemuxTable = RwLock<HashMap<SocketAddr, OriginBinding>>;

/// A bound UDP listener with its serialized writer task.
pub(super) struct UdpEndpoint {
    socket: Arc<UdpSocket>,
    tx: mpsc::Sender<UdpWrite>,
    token: CancellationToken,
}

impl UdpEndpoint {
    /// Binds `0.0.0.0:port` and spawns the writer task.
    pub(super) async fn bind(port: u16, token: CancellationToken) -> Result<Self, Error> {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let socket = match UdpSocket::bind(addr).await {
            Ok(s) => Arc::new(s),
            Err(source) => bail!(ErrorInt::BindError { addr, source }),
        };
        let (tx, rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
        tokio::spawn(run_writer(socket.clone(), rx, token.clone()));
        Ok(Self { socket, tx, token })
    }

    /// A handle for enqueueing writes. Submitters use `try_send` and treat a
    /// full queue as a dropped packet.
    pub(super) fn sender(&self) -> mpsc::Sender<UdpWrite> {
        self.tx.clone()
    }

    pub(super) fn spawn_reader(&self, shared: Arc<Shared>) {
        tokio::spawn(run_reader(
            self.socket.clone(),
            shared,
            self.token.clone(),
        ));
    }
}

async fn run_writer(
    socket: Arc<UdpSocket>,
    mut rx: mpsc::Receiver<UdpWrite>,
    token: CancellationToken,
) {
    loop {
        let w = tokio::select! {
            w = rx.recv() => match w {
                Some(w) => w,
                None => return,
            },
            _ = token.cancelled() => return,
        };
        if let Err(e) = socket.send_to(&w.payload, w.to).await {
            warn!("udp write to {} failed: {}", w.to, e);
        }
    }
}

/// Reads datagrams until cancelled, forwarding those whose source address
/// has a binding in the demultiplexing table and dropping the rest.
pub(super) async fn run_reader(
    socket: Arc<UdpSocket>,
    shared: Arc<Shared>,
    token: CancellationToken,
) {
    loop {
        // One freshly allocated buffer per packet: the payload is handed to
        // every subscriber's writer queue without copying.
        let mut buf = vec![0u8; 2048];
        let (n, from) = tokio::select! {
            r = socket.recv_from(&mut buf) => match r {
                Ok(r) => r,
                Err(e) => {
                    debug!("udp read failed: {}", e);
                    return;
                }
            },
            _ = token.cancelled() => return,
        };
        buf.truncate(n);

        let binding = shared.demux.read().unwrap().get(&from).cloned();
        match binding {
            Some(b) => shared.forward(&b.path, b.track_id, b.flow, Bytes::from(buf)),
            None => trace!("dropping {} unroutable bytes from {}", n, from),
        }
    }
}
