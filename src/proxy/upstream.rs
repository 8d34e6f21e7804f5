// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Origin side: one task per demanded stream path.
//!
//! The task dials the configured origin, walks it to PLAY within the
//! configured ready deadline, publishes the SDP to waiting DESCRIBEs, and
//! then relays every received RTP/RTCP payload into the fan-out until it is
//! cancelled or the origin fails. Teardown is best-effort and idempotent:
//! however many times the stop token fires, the origin sees at most one
//! TEARDOWN.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::num::NonZeroU8;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use log::{debug, info, trace, warn};
use rtsp_types::{headers, Message, Method, Version};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::endpoint::{self, OriginBinding};
use super::parse;
use super::{Shared, StreamInfo, StreamInfoTx};
use crate::conf::StreamConf;
use crate::error::ErrorInt;
use crate::net::{Connection, UdpPair};
use crate::{bail, wrap, Error, TrackFlow, TransportKind};

/// Ceiling on the interval between keepalive requests while relaying; the
/// origin's advertised session timeout can lower it further.
const KEEPALIVE_DURATION: Duration = Duration::from_secs(30);

/// Best-effort bound on the final TEARDOWN exchange.
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(2);

pub(super) async fn run(
    shared: Arc<Shared>,
    path: String,
    source: StreamConf,
    publish: StreamInfoTx,
    token: CancellationToken,
    generation: u64,
) {
    let ready_timeout = shared.conf().stream_ready_timeout;
    info!("{}: connecting to {}", path, source.url);
    let started = tokio::select! {
        r = tokio::time::timeout(ready_timeout, start(&path, &source)) => match r {
            Ok(r) => r,
            Err(_) => Err(wrap!(ErrorInt::Timeout)),
        },
        _ = token.cancelled() => Err(wrap!(ErrorInt::Timeout)),
    };
    let mut sess = match started {
        Ok(s) => s,
        Err(e) => {
            warn!("{}: unable to start: {}", path, e);
            shared.set_stream_stopping(&path, generation);
            let _ = publish.send(Some(Err(e)));
            shared.remove_stream(&path, generation);
            return;
        }
    };

    shared.set_stream_ready(&path, generation);
    info!(
        "{}: ready ({} tracks over {})",
        path,
        sess.tracks.len(),
        sess.transport
    );
    let _ = publish.send(Some(Ok(StreamInfo {
        sdp: sess.sdp.clone(),
        tracks: sess.tracks.len(),
    })));

    // UDP origins deliver to the per-track sockets; register their peers in
    // the demultiplexing table and hand each socket to a reader.
    for (track_id, track) in sess.tracks.iter_mut().enumerate() {
        if let UpstreamTrack::Udp {
            sockets,
            origin_rtp,
            origin_rtcp,
        } = track
        {
            shared.register_origin(
                *origin_rtp,
                OriginBinding {
                    path: path.clone(),
                    track_id,
                    flow: TrackFlow::Rtp,
                },
            );
            shared.register_origin(
                *origin_rtcp,
                OriginBinding {
                    path: path.clone(),
                    track_id,
                    flow: TrackFlow::Rtcp,
                },
            );
            if let Some(pair) = sockets.take() {
                tokio::spawn(endpoint::run_reader(
                    Arc::new(pair.rtp_socket),
                    shared.clone(),
                    token.clone(),
                ));
                tokio::spawn(endpoint::run_reader(
                    Arc::new(pair.rtcp_socket),
                    shared.clone(),
                    token.clone(),
                ));
            }
        }
    }

    let result = sess.relay(&shared, &path, &token).await;
    shared.set_stream_stopping(&path, generation);
    let failed = match result {
        Ok(()) => {
            info!("{}: stopping", path);
            false
        }
        Err(e) => {
            warn!("{}: relay failed: {}", path, e);
            true
        }
    };
    if tokio::time::timeout(TEARDOWN_TIMEOUT, sess.teardown())
        .await
        .is_err()
    {
        debug!("{}: teardown timed out", path);
    }
    shared.unregister_origins(&path);
    let removed = shared.remove_stream(&path, generation);
    if failed && removed {
        // Mid-play failure: every attached session is disconnected; the next
        // subscriber starts a fresh upstream.
        shared.disconnect_subscribers(&path);
    }
    // Dropping `sess` closes the RTSP connection; the cancelled reader tasks
    // release the per-track sockets.
}

/// Walks the origin to PLAY, preferring the configured transport and falling
/// back from UDP to interleaved TCP when the origin refuses a UDP SETUP.
async fn start(path: &str, source: &StreamConf) -> Result<UpstreamSession, Error> {
    if source.use_tcp {
        return start_with(source, TransportKind::Tcp).await;
    }
    match start_with(source, TransportKind::Udp).await {
        Ok(s) => Ok(s),
        Err(e) if e.refused_method() == Some(&Method::Setup) => {
            info!("{}: origin refused UDP setup ({}); retrying over tcp", path, e);
            start_with(source, TransportKind::Tcp).await
        }
        Err(e) => Err(e),
    }
}

async fn start_with(source: &StreamConf, kind: TransportKind) -> Result<UpstreamSession, Error> {
    let url = &source.url;
    let host = url.host().expect("conf validation requires a host");
    let port = url.port().unwrap_or(554);
    let conn = Connection::connect(host, port)
        .await
        .map_err(|e| wrap!(ErrorInt::ConnectError(e)))?;
    let mut conn = UpstreamConn { conn, next_cseq: 1 };

    let mut req = rtsp_types::Request::builder(Method::Options, Version::V1_0)
        .request_uri(url.clone())
        .build(Bytes::new());
    let options = conn.send(&mut req).await?;
    let keepalive_method = match options.header(&headers::PUBLIC) {
        Some(v) if v.as_str().contains("GET_PARAMETER") => Method::GetParameter,
        _ => Method::Options,
    };

    let mut req = rtsp_types::Request::builder(Method::Describe, Version::V1_0)
        .request_uri(url.clone())
        .header(headers::ACCEPT, "application/sdp")
        .build(Bytes::new());
    let response = conn.send(&mut req).await?;
    let desc = parse::parse_describe(url, &response)
        .map_err(|description| conn.protocol_error(description))?;

    let mut session: Option<parse::SessionHeader> = None;
    let mut channels = ChannelMap::default();
    let mut tracks = Vec::with_capacity(desc.tracks.len());
    for (track_id, track) in desc.tracks.iter().enumerate() {
        let setup_url = track.control.clone().unwrap_or_else(|| desc.control.clone());
        let transport = match kind {
            TransportKind::Udp => {
                let sockets = UdpPair::for_ip(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
                    .map_err(|e| wrap!(ErrorInt::PortAllocError(e)))?;
                let transport_hdr = format!(
                    "RTP/AVP;unicast;client_port={}-{}",
                    sockets.rtp_port,
                    sockets.rtp_port + 1
                );
                let parsed =
                    send_setup(&mut conn, &setup_url, session.as_ref(), transport_hdr).await?;
                let server_port = parsed.server_port.ok_or_else(|| {
                    conn.protocol_error("UDP SETUP response without server_port".to_owned())
                })?;
                let source_ip = parsed
                    .source
                    .unwrap_or_else(|| conn.conn.ctx().peer_addr().ip());
                check_session(&mut session, parsed.session, &conn)?;
                UpstreamTrack::Udp {
                    sockets: Some(sockets),
                    origin_rtp: SocketAddr::new(source_ip, server_port.0),
                    origin_rtcp: SocketAddr::new(source_ip, server_port.1),
                }
            }
            TransportKind::Tcp => {
                let proposed = channels.next_unassigned().ok_or_else(|| {
                    conn.protocol_error("out of interleaved channels".to_owned())
                })?;
                let transport_hdr = format!(
                    "RTP/AVP/TCP;unicast;interleaved={}-{}",
                    proposed,
                    proposed + 1
                );
                let parsed =
                    send_setup(&mut conn, &setup_url, session.as_ref(), transport_hdr).await?;
                check_session(&mut session, parsed.session, &conn)?;
                let channel_id = parsed.channel_id.unwrap_or(proposed);
                channels
                    .assign(channel_id, track_id)
                    .map_err(|description| conn.protocol_error(description))?;
                UpstreamTrack::Tcp
            }
        };
        tracks.push(transport);
    }

    let session = session
        .ok_or_else(|| conn.protocol_error("origin advertised no tracks".to_owned()))?;
    let mut req = rtsp_types::Request::builder(Method::Play, Version::V1_0)
        .request_uri(desc.control.clone())
        .header(headers::SESSION, session.id.to_string())
        .header(headers::RANGE, "npt=0.000-".to_owned())
        .build(Bytes::new());
    conn.send(&mut req).await?;

    Ok(UpstreamSession {
        conn,
        sdp: desc.sdp,
        control: desc.control,
        session_id: session.id,
        keepalive_method,
        keepalive_period: Duration::from_secs(u64::from(session.timeout_sec.max(2)) / 2)
            .min(KEEPALIVE_DURATION),
        transport: kind,
        channels,
        tracks,
    })
}

async fn send_setup(
    conn: &mut UpstreamConn,
    url: &Url,
    session: Option<&parse::SessionHeader>,
    transport: String,
) -> Result<parse::SetupResponse, Error> {
    let mut builder = rtsp_types::Request::builder(Method::Setup, Version::V1_0)
        .request_uri(url.clone())
        .header(headers::TRANSPORT, transport);
    if let Some(s) = session {
        builder = builder.header(headers::SESSION, s.id.to_string());
    }
    let mut req = builder.build(Bytes::new());
    let response = conn.send(&mut req).await?;
    parse::parse_setup(&response).map_err(|d| conn.protocol_error(d))
}

fn check_session(
    session: &mut Option<parse::SessionHeader>,
    new: parse::SessionHeader,
    conn: &UpstreamConn,
) -> Result<(), Error> {
    match session {
        Some(old) if old.id != new.id => Err(conn.protocol_error(format!(
            "SETUP response changed session id from {:?} to {:?}",
            old.id, new.id
        ))),
        Some(_) => Ok(()),
        None => {
            *session = Some(new);
            Ok(())
        }
    }
}

enum UpstreamTrack {
    Udp {
        /// Taken by the reader tasks once the stream is ready.
        sockets: Option<UdpPair>,
        origin_rtp: SocketAddr,
        origin_rtcp: SocketAddr,
    },
    Tcp,
}

struct UpstreamSession {
    conn: UpstreamConn,
    sdp: Bytes,
    control: Url,
    session_id: Box<str>,
    keepalive_method: Method,
    keepalive_period: Duration,
    transport: TransportKind,
    channels: ChannelMap,
    tracks: Vec<UpstreamTrack>,
}

impl UpstreamSession {
    /// Relays until cancelled (`Ok`) or the origin connection fails (`Err`).
    async fn relay(
        &mut self,
        shared: &Arc<Shared>,
        path: &str,
        token: &CancellationToken,
    ) -> Result<(), Error> {
        let mut keepalive = tokio::time::interval_at(
            tokio::time::Instant::now() + self.keepalive_period,
            self.keepalive_period,
        );
        loop {
            tokio::select! {
                _ = token.cancelled() => return Ok(()),
                _ = keepalive.tick() => self.send_keepalive().await?,
                msg = self.conn.conn.next() => {
                    let msg = match msg {
                        None => return Err(self.conn.eof_error()),
                        Some(Err(e)) => return Err(e),
                        Some(Ok(m)) => m,
                    };
                    match msg.msg {
                        Message::Data(data) => {
                            let channel_id = data.channel_id();
                            match self.channels.lookup(channel_id) {
                                Some((track_id, flow)) => {
                                    shared.forward(path, track_id, flow, data.into_body());
                                }
                                None if self.transport == TransportKind::Udp => {
                                    trace!("{}: ignoring interleaved data from udp origin", path);
                                }
                                None => bail!(ErrorInt::RtspUnassignedChannelError {
                                    conn_ctx: *self.conn.conn.ctx(),
                                    msg_ctx: msg.ctx,
                                    channel_id,
                                    data: data.into_body(),
                                }),
                            }
                        }
                        Message::Response(r) => {
                            trace!("{}: keepalive response {:?}", path, r.status());
                        }
                        Message::Request(r) => {
                            debug!("{}: ignoring {:?} request from origin", path, r.method());
                        }
                    }
                }
            }
        }
    }

    /// Fire-and-forget keepalive; any response is drained by [`relay`]'s
    /// main loop.
    async fn send_keepalive(&mut self) -> Result<(), Error> {
        let mut req = rtsp_types::Request::builder(self.keepalive_method.clone(), Version::V1_0)
            .request_uri(self.control.clone())
            .header(headers::SESSION, self.session_id.to_string())
            .build(Bytes::new());
        self.conn.fill_req(&mut req);
        self.conn.conn.send(Message::Request(req)).await
    }

    /// Sends TEARDOWN and waits for any reply so the request makes it onto
    /// the wire before the socket closes. The caller bounds the wait.
    async fn teardown(&mut self) {
        let mut req = rtsp_types::Request::builder(Method::Teardown, Version::V1_0)
            .request_uri(self.control.clone())
            .header(headers::SESSION, self.session_id.to_string())
            .build(Bytes::new());
        let cseq = self.conn.fill_req(&mut req);
        if self.conn.conn.send(Message::Request(req)).await.is_err() {
            return;
        }
        loop {
            match self.conn.conn.next().await {
                Some(Ok(m)) => {
                    if let Message::Response(r) = m.msg {
                        if parse::response_cseq(&r) == Some(cseq) {
                            return;
                        }
                    }
                }
                Some(Err(_)) | None => return,
            }
        }
    }
}

/// The raw request/response half of the origin connection.
struct UpstreamConn {
    conn: Connection,

    /// The next `CSeq` header value to use when sending a request.
    next_cseq: u32,
}

impl UpstreamConn {
    /// Sends a request and reads messages until its response arrives.
    /// Stale responses (eg to an earlier keepalive) are skipped; a
    /// non-success status is an error.
    async fn send(
        &mut self,
        req: &mut rtsp_types::Request<Bytes>,
    ) -> Result<rtsp_types::Response<Bytes>, Error> {
        let cseq = self.fill_req(req);
        self.conn.send(Message::Request(req.clone())).await?;
        loop {
            let msg = match self.conn.next().await {
                None => return Err(self.eof_error()),
                Some(r) => r?,
            };
            let resp = match msg.msg {
                Message::Response(r) => r,
                Message::Data(_) => continue,
                Message::Request(r) => {
                    debug!("ignoring {:?} request from origin mid-handshake", r.method());
                    continue;
                }
            };
            if parse::response_cseq(&resp) != Some(cseq) {
                continue;
            }
            if !resp.status().is_success() {
                bail!(ErrorInt::RtspResponseError {
                    conn_ctx: *self.conn.ctx(),
                    msg_ctx: msg.ctx,
                    method: req.method().clone(),
                    cseq,
                    status: resp.status(),
                    description: "origin returned non-success status".to_owned(),
                });
            }
            return Ok(resp);
        }
    }

    /// Fills out `CSeq` and `User-Agent` headers, returning the `CSeq`.
    fn fill_req(&mut self, req: &mut rtsp_types::Request<Bytes>) -> u32 {
        let cseq = self.next_cseq;
        self.next_cseq += 1;
        req.insert_header(headers::CSEQ, cseq.to_string());
        req.insert_header(headers::USER_AGENT, "rtsp-fanout-proxy".to_owned());
        cseq
    }

    fn protocol_error(&self, description: String) -> Error {
        wrap!(ErrorInt::RtspProtocolError {
            conn_ctx: *self.conn.ctx(),
            description,
        })
    }

    fn eof_error(&self) -> Error {
        wrap!(ErrorInt::RtspReadError {
            conn_ctx: *self.conn.ctx(),
            msg_ctx: self.conn.eof_ctx(),
            source: std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "origin closed the connection",
            ),
        })
    }
}

/// Mapping of interleaved channels to tracks on the origin connection.
///
/// Channel ids are proposed as the canonical `(2i, 2i+1)` pairs, but an
/// origin may assign different (even) ids in its SETUP response, so lookups
/// go through this table rather than assuming the canonical layout.
#[derive(Default)]
struct ChannelMap(smallvec::SmallVec<[Option<NonZeroU8>; 16]>);

impl ChannelMap {
    /// Returns the next unassigned even channel id, or `None` if all 128
    /// pairs are taken.
    fn next_unassigned(&self) -> Option<u8> {
        if let Some(i) = self.0.iter().position(Option::is_none) {
            return Some((i as u8) << 1);
        }
        if self.0.len() < 128 {
            return Some((self.0.len() as u8) << 1);
        }
        None
    }

    /// Assigns an even channel id (RTP) and its odd successor (RTCP) to a
    /// track.
    fn assign(&mut self, channel_id: u8, track_id: usize) -> Result<(), String> {
        if (channel_id & 1) != 0 {
            return Err(format!("can't assign odd channel id {channel_id}"));
        }
        if track_id >= 255 {
            return Err(format!("can't assign channel to track {track_id} >= 255"));
        }
        let i = usize::from(channel_id >> 1);
        if i >= self.0.len() {
            self.0.resize(i + 1, None);
        }
        let slot = &mut self.0[i];
        if let Some(existing) = slot {
            return Err(format!(
                "channel id {} is already assigned to track {}",
                channel_id,
                existing.get() - 1
            ));
        }
        *slot = Some(NonZeroU8::new((track_id + 1) as u8).expect("[0, 255) + 1 is non-zero"));
        Ok(())
    }

    /// Looks up the track and flow carried by a channel id.
    fn lookup(&self, channel_id: u8) -> Option<(usize, TrackFlow)> {
        let i = usize::from(channel_id >> 1);
        let track = self.0.get(i).copied().flatten()?;
        let flow = if (channel_id & 1) == 0 {
            TrackFlow::Rtp
        } else {
            TrackFlow::Rtcp
        };
        Some((usize::from(track.get() - 1), flow))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_map() {
        let mut map = ChannelMap::default();
        assert_eq!(map.next_unassigned().unwrap(), 0);
        assert_eq!(map.lookup(0), None);
        map.assign(0, 0).unwrap();
        map.assign(0, 1).unwrap_err();
        map.assign(1, 1).unwrap_err();
        assert_eq!(map.lookup(0), Some((0, TrackFlow::Rtp)));
        assert_eq!(map.lookup(1), Some((0, TrackFlow::Rtcp)));
        assert_eq!(map.next_unassigned().unwrap(), 2);

        // An origin may skip ahead; the gap stays assignable.
        map.assign(8, 4).unwrap();
        assert_eq!(map.lookup(8), Some((4, TrackFlow::Rtp)));
        assert_eq!(map.lookup(9), Some((4, TrackFlow::Rtcp)));
        assert_eq!(map.next_unassigned().unwrap(), 2);
        assert_eq!(map.lookup(200), None);
    }
}
