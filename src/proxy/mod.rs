// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The proxy itself: shared subscriber state, the fan-out step, the idle
//! sweep, and bootstrap.
//!
//! Locking discipline: one `RwLock` guards the client and stream maps.
//! Forwarding takes it read; connect/disconnect, state changes, and the
//! supervisor sweep take it write. The lock is never held across anything
//! that can suspend: all writer-queue submissions under the lock are
//! `try_send`, and a full queue means the frame is dropped.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use log::{debug, info, warn};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::conf::Conf;
use crate::error::ErrorInt;
use crate::{bail, Error, TrackFlow};

mod client;
mod endpoint;
mod parse;
mod upstream;

use endpoint::{OriginBinding, UdpEndpoint, UdpWrite};

/// Depth of every outbound packet queue (UDP endpoint writers and per-client
/// interleaved writers). Deep enough to ride out scheduling hiccups; a
/// subscriber that stays behind loses frames rather than stalling the
/// fan-out.
pub(crate) const WRITE_QUEUE_DEPTH: usize = 256;

/// Deadlines for single RTSP reads/writes on client connections.
pub(crate) const READ_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);
pub(crate) const WRITE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

const SUPERVISOR_PERIOD: std::time::Duration = std::time::Duration::from_secs(1);

/// What a ready upstream publishes to sessions waiting in DESCRIBE.
#[derive(Clone, Debug)]
pub(crate) struct StreamInfo {
    /// The origin's SDP, relayed to clients byte-identical.
    pub(crate) sdp: Bytes,

    /// Number of advertised tracks.
    pub(crate) tracks: usize,
}

/// Outcome of an upstream session's startup, as observed by DESCRIBE.
pub(crate) type StreamInfoRx = watch::Receiver<Option<Result<StreamInfo, Error>>>;
pub(crate) type StreamInfoTx = watch::Sender<Option<Result<StreamInfo, Error>>>;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum ClientState {
    Init,
    Described,
    SetupPartial,
    Ready,
    Playing,
}

/// Per-track transport binding of a client session, fixed at SETUP.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum TrackBinding {
    Udp { rtp_port: u16, rtcp_port: u16 },
    Tcp { rtp_channel: u8 },
}

struct ClientEntry {
    addr: SocketAddr,
    path: Option<String>,
    state: ClientState,

    /// Bindings in track order; the variant doubles as the session's pinned
    /// transport, so forwarding can't cross transports.
    tracks: Vec<TrackBinding>,

    /// Interleaved frame queue, drained by the session task (TCP clients).
    frame_tx: mpsc::Sender<(u8, Bytes)>,

    /// Cancelled to force the session closed, eg on upstream failure.
    token: CancellationToken,

    /// Frames lost to writer backpressure, reported at disconnect.
    dropped: Arc<AtomicU64>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum StreamState {
    Starting,
    Ready,
    Stopping,
}

struct StreamEntry {
    /// Distinguishes this upstream incarnation from any later one on the
    /// same path, so a late failure can't tear down its successor.
    generation: u64,
    state: StreamState,
    info: StreamInfoRx,
    token: CancellationToken,
}

#[derive(Default)]
struct State {
    clients: HashMap<u64, ClientEntry>,
    streams: HashMap<String, StreamEntry>,

    /// Most recent instant each path had a connected client. Swept against
    /// the stream TTL by the supervisor; also stamped on subscribe so a
    /// fresh stream gets a full TTL window.
    last_seen: HashMap<String, Instant>,
}

/// State shared by every task of one proxy instance.
pub(crate) struct Shared {
    conf: Conf,
    state: RwLock<State>,
    demux: endpoint::DemuxTable,
    rtp_tx: mpsc::Sender<UdpWrite>,
    rtcp_tx: mpsc::Sender<UdpWrite>,
    next_id: AtomicU64,
    root: CancellationToken,
}

impl Shared {
    fn conf(&self) -> &Conf {
        &self.conf
    }

    fn root_token(&self) -> &CancellationToken {
        &self.root
    }

    /// Splices one upstream packet to every playing subscriber of `path` on
    /// its chosen transport.
    ///
    /// Holds the state lock read-only and never blocks: a subscriber whose
    /// queue is full loses this packet.
    fn forward(&self, path: &str, track_id: usize, flow: TrackFlow, payload: Bytes) {
        let state = self.state.read().unwrap();
        for c in state.clients.values() {
            if c.state != ClientState::Playing || c.path.as_deref() != Some(path) {
                continue;
            }
            let Some(binding) = c.tracks.get(track_id) else {
                continue;
            };
            let full = match *binding {
                TrackBinding::Udp { rtp_port, rtcp_port } => {
                    let (tx, port) = match flow {
                        TrackFlow::Rtp => (&self.rtp_tx, rtp_port),
                        TrackFlow::Rtcp => (&self.rtcp_tx, rtcp_port),
                    };
                    let w = UdpWrite {
                        to: SocketAddr::new(c.addr.ip(), port),
                        payload: payload.clone(),
                    };
                    matches!(tx.try_send(w), Err(mpsc::error::TrySendError::Full(_)))
                }
                TrackBinding::Tcp { rtp_channel } => {
                    let channel = rtp_channel + (flow == TrackFlow::Rtcp) as u8;
                    matches!(
                        c.frame_tx.try_send((channel, payload.clone())),
                        Err(mpsc::error::TrySendError::Full(_))
                    )
                }
            };
            if full {
                c.dropped.fetch_add(1, Ordering::Relaxed);
                debug!("{}: dropping {} frame for slow client {}", path, flow, c.addr);
            }
        }
    }

    /// Ensures an upstream session exists for `path` and returns the channel
    /// on which its SDP (or startup error) is published, or `None` if no
    /// such stream is configured.
    ///
    /// The first subscriber of a path starts its upstream; a path whose
    /// prior upstream failed gets a fresh one, which is the only retry in
    /// the system.
    fn subscribe(self: &Arc<Self>, path: &str) -> Option<StreamInfoRx> {
        let source = self.conf.streams.get(path)?.clone();
        let mut state = self.state.write().unwrap();
        state.last_seen.insert(path.to_owned(), Instant::now());
        if let Some(entry) = state.streams.get(path) {
            return Some(entry.info.clone());
        }
        let (tx, rx) = watch::channel(None);
        let token = self.root.child_token();
        let generation = self.next_id.fetch_add(1, Ordering::Relaxed);
        info!("{}: starting on demand", path);
        state.streams.insert(
            path.to_owned(),
            StreamEntry {
                generation,
                state: StreamState::Starting,
                info: rx.clone(),
                token: token.clone(),
            },
        );
        tokio::spawn(upstream::run(
            self.clone(),
            path.to_owned(),
            source,
            tx,
            token,
            generation,
        ));
        Some(rx)
    }

    /// Marks the stream ready once its upstream reaches PLAY. No-op if the
    /// entry was already replaced.
    fn set_stream_ready(&self, path: &str, generation: u64) {
        let mut state = self.state.write().unwrap();
        if let Some(e) = state.streams.get_mut(path) {
            if e.generation == generation {
                e.state = StreamState::Ready;
            }
        }
    }

    fn set_stream_stopping(&self, path: &str, generation: u64) {
        let mut state = self.state.write().unwrap();
        if let Some(e) = state.streams.get_mut(path) {
            if e.generation == generation {
                e.state = StreamState::Stopping;
            }
        }
    }

    /// Removes the stream entry if it still belongs to this incarnation.
    /// Idempotent; returns whether this call removed it.
    fn remove_stream(&self, path: &str, generation: u64) -> bool {
        let mut state = self.state.write().unwrap();
        match state.streams.get(path) {
            Some(e) if e.generation == generation => {
                state.streams.remove(path);
                state.last_seen.remove(path);
                true
            }
            _ => false,
        }
    }

    /// Forces every session attached to `path` closed, for upstream
    /// mid-play failures.
    fn disconnect_subscribers(&self, path: &str) {
        let tokens: Vec<CancellationToken> = {
            let state = self.state.read().unwrap();
            state
                .clients
                .values()
                .filter(|c| c.path.as_deref() == Some(path))
                .map(|c| c.token.clone())
                .collect()
        };
        for t in tokens {
            t.cancel();
        }
    }

    fn add_client(
        &self,
        addr: SocketAddr,
        frame_tx: mpsc::Sender<(u8, Bytes)>,
        token: CancellationToken,
        dropped: Arc<AtomicU64>,
    ) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.write().unwrap();
        state.clients.insert(
            id,
            ClientEntry {
                addr,
                path: None,
                state: ClientState::Init,
                tracks: Vec::new(),
                frame_tx,
                token,
                dropped,
            },
        );
        id
    }

    fn remove_client(&self, id: u64) {
        let mut state = self.state.write().unwrap();
        state.clients.remove(&id);
    }

    fn set_client_described(&self, id: u64, path: &str) {
        let mut state = self.state.write().unwrap();
        if let Some(c) = state.clients.get_mut(&id) {
            c.path = Some(path.to_owned());
            if c.state == ClientState::Init {
                c.state = ClientState::Described;
            }
        }
    }

    /// Records one track binding. `advertised_tracks` moves the session to
    /// `Ready` once every track is bound.
    fn add_client_track(&self, id: u64, binding: TrackBinding, advertised_tracks: usize) {
        let mut state = self.state.write().unwrap();
        if let Some(c) = state.clients.get_mut(&id) {
            c.tracks.push(binding);
            c.state = if c.tracks.len() >= advertised_tracks {
                ClientState::Ready
            } else {
                ClientState::SetupPartial
            };
        }
    }

    /// Registers `id` as a playing subscriber. Fails unless its stream is
    /// still in the map and ready, preserving the invariant that a playing
    /// client always has a live stream behind it.
    fn set_client_playing(&self, id: u64) -> bool {
        let mut state = self.state.write().unwrap();
        let Some(c) = state.clients.get(&id) else {
            return false;
        };
        if c.tracks.is_empty() {
            return false;
        }
        let Some(path) = c.path.clone() else {
            return false;
        };
        if !matches!(state.streams.get(&path), Some(e) if e.state == StreamState::Ready) {
            return false;
        }
        state.clients.get_mut(&id).unwrap().state = ClientState::Playing;
        true
    }

    fn register_origin(&self, from: SocketAddr, binding: OriginBinding) {
        self.demux.write().unwrap().insert(from, binding);
    }

    fn unregister_origins(&self, path: &str) {
        self.demux.write().unwrap().retain(|_, b| b.path != path);
    }
}

/// One supervisor tick: refresh liveness of every connected client's path,
/// then expire streams whose paths have been quiet for a full TTL.
///
/// Returns the stop tokens of expired streams; the caller cancels them
/// outside the lock.
fn sweep(shared: &Shared, now: Instant) -> Vec<(String, CancellationToken)> {
    let mut stopped = Vec::new();
    let mut state = shared.state.write().unwrap();
    let attached: Vec<String> = state
        .clients
        .values()
        .filter_map(|c| c.path.clone())
        .collect();
    for path in attached {
        state.last_seen.insert(path, now);
    }
    let ttl = shared.conf.stream_ttl;
    let expired: Vec<String> = state
        .last_seen
        .iter()
        .filter(|&(_, t)| now.duration_since(*t) >= ttl)
        .map(|(p, _)| p.clone())
        .collect();
    for path in expired {
        if let Some(e) = state.streams.remove(&path) {
            state.last_seen.remove(&path);
            stopped.push((path, e.token));
        }
    }
    stopped
}

async fn supervise(shared: Arc<Shared>) {
    let mut interval = tokio::time::interval(SUPERVISOR_PERIOD);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shared.root.cancelled() => return,
        }
        for (path, token) in sweep(&shared, Instant::now()) {
            info!("{}: no clients for {:?}, stopping", path, shared.conf.stream_ttl);
            token.cancel();
        }
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    loop {
        let (stream, addr) = tokio::select! {
            r = listener.accept() => match r {
                Ok(c) => c,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    continue;
                }
            },
            _ = shared.root.cancelled() => return,
        };
        tokio::spawn(client::run(shared.clone(), stream, addr));
    }
}

/// A running proxy instance.
///
/// All tasks are spawned by [`Proxy::bind`]; dropping the handle does not
/// stop them, [`Proxy::shutdown`] does.
pub struct Proxy {
    shared: Arc<Shared>,
    rtsp_addr: SocketAddr,
}

impl Proxy {
    /// Validates `conf`, binds all three listeners, and spawns the proxy's
    /// tasks. Fails fast on any bind error.
    pub async fn bind(conf: Conf) -> Result<Self, Error> {
        conf.validate()?;
        let root = CancellationToken::new();
        let rtp = UdpEndpoint::bind(conf.rtp_port, root.child_token()).await?;
        let rtcp = UdpEndpoint::bind(conf.rtcp_port, root.child_token()).await?;
        let addr = SocketAddr::from(([0, 0, 0, 0], conf.rtsp_port));
        let listener = match TcpListener::bind(addr).await {
            Ok(l) => l,
            Err(source) => bail!(ErrorInt::BindError { addr, source }),
        };
        let rtsp_addr = listener.local_addr().map_err(|source| {
            crate::wrap!(ErrorInt::BindError { addr, source })
        })?;
        let shared = Arc::new(Shared {
            conf,
            state: RwLock::new(State::default()),
            demux: endpoint::DemuxTable::default(),
            rtp_tx: rtp.sender(),
            rtcp_tx: rtcp.sender(),
            next_id: AtomicU64::new(1),
            root: root.clone(),
        });
        rtp.spawn_reader(shared.clone());
        rtcp.spawn_reader(shared.clone());
        tokio::spawn(supervise(shared.clone()));
        tokio::spawn(accept_loop(listener, shared.clone()));
        info!(
            "listening: rtsp on {}, rtp/rtcp on {}/{}",
            rtsp_addr, shared.conf.rtp_port, shared.conf.rtcp_port
        );
        Ok(Proxy { shared, rtsp_addr })
    }

    /// Where the RTSP listener actually bound.
    pub fn rtsp_addr(&self) -> SocketAddr {
        self.rtsp_addr
    }

    /// Stops every task: acceptor, supervisor, endpoints, all sessions.
    /// Idempotent.
    pub fn shutdown(&self) {
        self.shared.root.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_shared(conf: Conf) -> (Arc<Shared>, mpsc::Receiver<UdpWrite>, mpsc::Receiver<UdpWrite>)
    {
        let (rtp_tx, rtp_rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
        let (rtcp_tx, rtcp_rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
        let shared = Arc::new(Shared {
            conf,
            state: RwLock::new(State::default()),
            demux: endpoint::DemuxTable::default(),
            rtp_tx,
            rtcp_tx,
            next_id: AtomicU64::new(1),
            root: CancellationToken::new(),
        });
        (shared, rtp_rx, rtcp_rx)
    }

    fn playing_client(
        shared: &Shared,
        addr: SocketAddr,
        path: &str,
        binding: TrackBinding,
        queue: usize,
    ) -> (u64, mpsc::Receiver<(u8, Bytes)>) {
        let (frame_tx, frame_rx) = mpsc::channel(queue);
        let id = shared.add_client(
            addr,
            frame_tx,
            CancellationToken::new(),
            Arc::new(AtomicU64::new(0)),
        );
        let mut state = shared.state.write().unwrap();
        let c = state.clients.get_mut(&id).unwrap();
        c.path = Some(path.to_owned());
        c.state = ClientState::Playing;
        c.tracks.push(binding);
        (id, frame_rx)
    }

    #[tokio::test]
    async fn forward_mixed_transports() {
        let (shared, mut rtp_rx, mut rtcp_rx) = test_shared(Conf::default());
        let udp_addr: SocketAddr = "192.0.2.1:9999".parse().unwrap();
        let tcp_addr: SocketAddr = "192.0.2.2:9998".parse().unwrap();
        let (_, _frame_rx_udp) = playing_client(
            &shared,
            udp_addr,
            "cam1",
            TrackBinding::Udp {
                rtp_port: 41000,
                rtcp_port: 41001,
            },
            4,
        );
        let (_, mut frame_rx) = playing_client(
            &shared,
            tcp_addr,
            "cam1",
            TrackBinding::Tcp { rtp_channel: 0 },
            4,
        );

        let payload = Bytes::from_static(&[0xAA, 0xBB]);
        shared.forward("cam1", 0, TrackFlow::Rtp, payload.clone());

        let w = rtp_rx.try_recv().unwrap();
        assert_eq!(w.to, "192.0.2.1:41000".parse().unwrap());
        assert_eq!(w.payload, payload);
        assert!(rtcp_rx.try_recv().is_err());
        let (channel, body) = frame_rx.try_recv().unwrap();
        assert_eq!(channel, 0);
        assert_eq!(body, payload);

        // RTCP flows to the odd port / odd channel.
        shared.forward("cam1", 0, TrackFlow::Rtcp, payload.clone());
        let w = rtcp_rx.try_recv().unwrap();
        assert_eq!(w.to, "192.0.2.1:41001".parse().unwrap());
        assert_eq!(frame_rx.try_recv().unwrap().0, 1);
    }

    #[tokio::test]
    async fn forward_skips_other_paths_and_states() {
        let (shared, mut rtp_rx, _rtcp_rx) = test_shared(Conf::default());
        let addr: SocketAddr = "192.0.2.1:9999".parse().unwrap();
        let (id, _frame_rx) = playing_client(
            &shared,
            addr,
            "cam2",
            TrackBinding::Udp {
                rtp_port: 41000,
                rtcp_port: 41001,
            },
            4,
        );
        shared.forward("cam1", 0, TrackFlow::Rtp, Bytes::from_static(b"x"));
        assert!(rtp_rx.try_recv().is_err());

        shared.state.write().unwrap().clients.get_mut(&id).unwrap().state =
            ClientState::Ready;
        shared.forward("cam2", 0, TrackFlow::Rtp, Bytes::from_static(b"x"));
        assert!(rtp_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn forward_drops_on_full_queue() {
        let (shared, _rtp_rx, _rtcp_rx) = test_shared(Conf::default());
        let addr: SocketAddr = "192.0.2.2:9998".parse().unwrap();
        let (id, mut frame_rx) =
            playing_client(&shared, addr, "cam1", TrackBinding::Tcp { rtp_channel: 0 }, 1);

        shared.forward("cam1", 0, TrackFlow::Rtp, Bytes::from_static(b"1"));
        shared.forward("cam1", 0, TrackFlow::Rtp, Bytes::from_static(b"2"));
        shared.forward("cam1", 0, TrackFlow::Rtp, Bytes::from_static(b"3"));

        // Queue depth 1: the first frame is delivered, the rest are dropped.
        assert_eq!(&frame_rx.try_recv().unwrap().1[..], b"1");
        assert!(frame_rx.try_recv().is_err());
        let state = shared.state.read().unwrap();
        assert_eq!(state.clients[&id].dropped.load(Ordering::Relaxed), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_expires_idle_stream() {
        let mut conf = Conf::default();
        conf.stream_ttl = std::time::Duration::from_secs(2);
        let (shared, _rtp_rx, _rtcp_rx) = test_shared(conf);
        let (tx, rx) = watch::channel(None);
        let token = CancellationToken::new();
        {
            let mut state = shared.state.write().unwrap();
            state.streams.insert(
                "cam1".to_owned(),
                StreamEntry {
                    generation: 1,
                    state: StreamState::Ready,
                    info: rx,
                    token: token.clone(),
                },
            );
            state.last_seen.insert("cam1".to_owned(), Instant::now());
        }
        drop(tx);

        assert!(sweep(&shared, Instant::now()).is_empty());
        tokio::time::advance(std::time::Duration::from_secs(3)).await;
        let stopped = sweep(&shared, Instant::now());
        assert_eq!(stopped.len(), 1);
        assert_eq!(stopped[0].0, "cam1");
        assert!(shared.state.read().unwrap().streams.is_empty());
        assert!(shared.state.read().unwrap().last_seen.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_keeps_streams_with_clients() {
        let mut conf = Conf::default();
        conf.stream_ttl = std::time::Duration::from_secs(2);
        let (shared, _rtp_rx, _rtcp_rx) = test_shared(conf);
        let (tx, rx) = watch::channel(None);
        {
            let mut state = shared.state.write().unwrap();
            state.streams.insert(
                "cam1".to_owned(),
                StreamEntry {
                    generation: 1,
                    state: StreamState::Ready,
                    info: rx,
                    token: CancellationToken::new(),
                },
            );
            state.last_seen.insert("cam1".to_owned(), Instant::now());
        }
        drop(tx);
        let addr: SocketAddr = "192.0.2.1:9999".parse().unwrap();
        playing_client(
            &shared,
            addr,
            "cam1",
            TrackBinding::Tcp { rtp_channel: 0 },
            4,
        );

        // The attached client re-stamps the path every tick, so it never
        // expires no matter how much time passes between sweeps.
        tokio::time::advance(std::time::Duration::from_secs(10)).await;
        assert!(sweep(&shared, Instant::now()).is_empty());
        tokio::time::advance(std::time::Duration::from_secs(10)).await;
        assert!(sweep(&shared, Instant::now()).is_empty());
        assert!(shared.state.read().unwrap().streams.contains_key("cam1"));
    }

    #[tokio::test]
    async fn stream_removal_is_idempotent() {
        let (shared, _rtp_rx, _rtcp_rx) = test_shared(Conf::default());
        let (tx, rx) = watch::channel(None);
        let token = CancellationToken::new();
        shared.state.write().unwrap().streams.insert(
            "cam1".to_owned(),
            StreamEntry {
                generation: 7,
                state: StreamState::Ready,
                info: rx,
                token: token.clone(),
            },
        );
        drop(tx);

        token.cancel();
        token.cancel(); // concurrent stop signals collapse into one teardown
        assert!(shared.remove_stream("cam1", 7));
        assert!(!shared.remove_stream("cam1", 7));
        // A stale generation can't remove a successor.
        let (tx2, rx2) = watch::channel(None);
        shared.state.write().unwrap().streams.insert(
            "cam1".to_owned(),
            StreamEntry {
                generation: 8,
                state: StreamState::Starting,
                info: rx2,
                token: CancellationToken::new(),
            },
        );
        drop(tx2);
        assert!(!shared.remove_stream("cam1", 7));
        assert!(shared.remove_stream("cam1", 8));
    }
}
