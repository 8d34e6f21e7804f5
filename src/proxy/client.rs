// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Server side: one task per accepted RTSP client connection.
//!
//! The session advances `init -> described -> setup-partial -> ready ->
//! playing`; TEARDOWN, timeouts, and framing errors end it from any state.
//! The same task both answers requests and drains the session's interleaved
//! frame queue, so responses and forwarded frames never interleave
//! mid-message and per-subscriber ordering holds for free.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use log::{debug, info, trace, warn};
use rtsp_types::{headers, Data, Message, Method, StatusCode, Version};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::parse::{self, TransportRequest};
use super::{Shared, TrackBinding, READ_TIMEOUT, WRITE_QUEUE_DEPTH, WRITE_TIMEOUT};
use crate::error::ErrorInt;
use crate::net::Connection;
use crate::{wrap, Error, TransportKind};

pub(super) async fn run(shared: Arc<Shared>, stream: TcpStream, addr: SocketAddr) {
    let conn = match Connection::from_stream(stream) {
        Ok(c) => c,
        Err(e) => {
            warn!("{}: unusable connection: {}", addr, e);
            return;
        }
    };
    let (frame_tx, frame_rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
    let token = shared.root_token().child_token();
    let dropped = Arc::new(AtomicU64::new(0));
    let id = shared.add_client(addr, frame_tx, token.clone(), dropped.clone());
    info!("{}: connected", addr);

    let mut session = ClientSession {
        shared: shared.clone(),
        id,
        addr,
        conn,
        session_id: format!("{:08x}", rand::random::<u32>()),
        path: None,
        advertised_tracks: 0,
        bound_tracks: 0,
        transport: None,
        playing: false,
    };
    if let Err(e) = session.run_inner(frame_rx, token).await {
        debug!("{}: session ended: {}", addr, e);
    }
    shared.remove_client(id);
    let dropped = dropped.load(Ordering::Relaxed);
    if dropped > 0 {
        info!("{}: disconnected ({} frames dropped)", addr, dropped);
    } else {
        info!("{}: disconnected", addr);
    }
}

struct ClientSession {
    shared: Arc<Shared>,
    id: u64,
    addr: SocketAddr,
    conn: Connection,
    session_id: String,
    path: Option<String>,
    advertised_tracks: usize,
    bound_tracks: usize,
    transport: Option<TransportKind>,
    playing: bool,
}

enum Event {
    Msg(Option<Result<crate::net::ReceivedMessage, Error>>),
    Frame(Option<(u8, Bytes)>),
    ReadTimeout,
    Shutdown,
}

impl ClientSession {
    async fn run_inner(
        &mut self,
        mut frame_rx: mpsc::Receiver<(u8, Bytes)>,
        token: CancellationToken,
    ) -> Result<(), Error> {
        loop {
            // While playing, the client is legitimately silent for long
            // stretches, so the read deadline only applies beforehand.
            let event = if self.playing {
                tokio::select! {
                    m = self.conn.next() => Event::Msg(m),
                    f = frame_rx.recv() => Event::Frame(f),
                    _ = token.cancelled() => Event::Shutdown,
                }
            } else {
                tokio::select! {
                    m = tokio::time::timeout(READ_TIMEOUT, self.conn.next()) => match m {
                        Ok(m) => Event::Msg(m),
                        Err(_) => Event::ReadTimeout,
                    },
                    _ = token.cancelled() => Event::Shutdown,
                }
            };
            match event {
                Event::Msg(None) => return Ok(()),
                Event::Msg(Some(Err(e))) => return Err(e),
                Event::Msg(Some(Ok(m))) => match m.msg {
                    Message::Request(req) => {
                        if !self.handle_request(&req, &token).await? {
                            return Ok(());
                        }
                    }
                    // Interleaved data from a client would be its RTCP
                    // backchannel; the proxy doesn't relay it upstream.
                    Message::Data(d) => {
                        trace!("{}: ignoring interleaved data on channel {}",
                               self.addr, d.channel_id());
                    }
                    Message::Response(r) => {
                        warn!("{}: unexpected response {:?}", self.addr, r.status());
                    }
                },
                Event::Frame(Some((channel, payload))) => {
                    self.send_frame(channel, payload).await?;
                }
                Event::Frame(None) => return Ok(()),
                Event::ReadTimeout => {
                    debug!("{}: read timeout", self.addr);
                    return Ok(());
                }
                Event::Shutdown => return Ok(()),
            }
        }
    }

    /// Handles one request. `Ok(false)` ends the session cleanly.
    async fn handle_request(
        &mut self,
        req: &rtsp_types::Request<Bytes>,
        token: &CancellationToken,
    ) -> Result<bool, Error> {
        let Some(cseq) = req.header(&headers::CSEQ).map(|v| v.as_str().to_owned()) else {
            // Can't even form a matching reply; give up on the session.
            self.send_response(self.response(StatusCode::BadRequest, "0").build(Bytes::new()))
                .await?;
            return Ok(false);
        };
        match req.method() {
            Method::Options => {
                let resp = self
                    .response(StatusCode::Ok, &cseq)
                    .header(
                        headers::PUBLIC,
                        "OPTIONS, DESCRIBE, SETUP, PLAY, TEARDOWN",
                    )
                    .build(Bytes::new());
                self.send_response(resp).await?;
                Ok(true)
            }
            Method::Describe => self.handle_describe(req, &cseq, token).await,
            Method::Setup => self.handle_setup(req, &cseq).await,
            Method::Play => self.handle_play(&cseq).await,
            Method::Teardown => {
                debug!("{}: teardown", self.addr);
                let resp = self
                    .response(StatusCode::Ok, &cseq)
                    .header(headers::SESSION, self.session_id.clone())
                    .build(Bytes::new());
                self.send_response(resp).await?;
                Ok(false)
            }
            _ => {
                self.send_response(
                    self.response(StatusCode::BadRequest, &cseq).build(Bytes::new()),
                )
                .await?;
                Ok(true)
            }
        }
    }

    async fn handle_describe(
        &mut self,
        req: &rtsp_types::Request<Bytes>,
        cseq: &str,
        token: &CancellationToken,
    ) -> Result<bool, Error> {
        let Some(url) = req.request_uri() else {
            self.send_response(
                self.response(StatusCode::BadRequest, cseq).build(Bytes::new()),
            )
            .await?;
            return Ok(false);
        };
        let path = url.path().trim_matches('/').to_owned();
        let Some(mut rx) = self.shared.subscribe(&path) else {
            debug!("{}: DESCRIBE of unknown path {:?}", self.addr, path);
            self.send_response(
                self.response(StatusCode::NotFound, cseq).build(Bytes::new()),
            )
            .await?;
            return Ok(true);
        };

        // Wait for the upstream to publish its SDP or its startup failure;
        // the upstream's own ready deadline bounds this wait.
        let outcome = loop {
            if let Some(r) = rx.borrow_and_update().clone() {
                break r;
            }
            tokio::select! {
                c = rx.changed() => {
                    if c.is_err() {
                        break Err(wrap!(ErrorInt::RtspProtocolError {
                            conn_ctx: *self.conn.ctx(),
                            description: "upstream vanished before publishing SDP".to_owned(),
                        }));
                    }
                }
                _ = token.cancelled() => return Ok(false),
            }
        };

        match outcome {
            Ok(info) => {
                self.shared.set_client_described(self.id, &path);
                self.path = Some(path);
                self.advertised_tracks = info.tracks;
                let base = format!("{}/", url.as_str().trim_end_matches('/'));
                let resp = self
                    .response(StatusCode::Ok, cseq)
                    .header(headers::CONTENT_TYPE, "application/sdp")
                    .header(headers::CONTENT_BASE, base)
                    .build(info.sdp);
                self.send_response(resp).await?;
                Ok(true)
            }
            Err(e) => {
                warn!("{}: DESCRIBE {} failed: {}", self.addr, path, e);
                let status = match e.status_code() {
                    Some(404) => StatusCode::NotFound,
                    _ => StatusCode::InternalServerError,
                };
                self.send_response(self.response(status, cseq).build(Bytes::new()))
                    .await?;
                Ok(true)
            }
        }
    }

    async fn handle_setup(
        &mut self,
        req: &rtsp_types::Request<Bytes>,
        cseq: &str,
    ) -> Result<bool, Error> {
        if self.path.is_none() || self.playing {
            self.send_response(
                self.response(StatusCode::SessionNotFound, cseq).build(Bytes::new()),
            )
            .await?;
            return Ok(true);
        }
        let Some(transport_hdr) = req.header(&headers::TRANSPORT) else {
            self.send_response(
                self.response(StatusCode::BadRequest, cseq).build(Bytes::new()),
            )
            .await?;
            return Ok(false);
        };
        let request = match parse::parse_transport_request(transport_hdr.as_str()) {
            Ok(r) => r,
            Err(e) => {
                debug!("{}: bad transport header: {}", self.addr, e);
                self.send_response(
                    self.response(StatusCode::BadRequest, cseq).build(Bytes::new()),
                )
                .await?;
                return Ok(false);
            }
        };
        let kind = match request {
            TransportRequest::Udp { .. } => TransportKind::Udp,
            TransportRequest::Tcp { .. } => TransportKind::Tcp,
        };
        // The transport is pinned by the first SETUP; later SETUPs must
        // agree, and the configuration must offer it at all.
        if !self.shared.conf().allows(kind) || self.transport.is_some_and(|t| t != kind) {
            debug!("{}: refusing {} transport", self.addr, kind);
            self.send_response(
                self.response(StatusCode::UnsupportedTransport, cseq).build(Bytes::new()),
            )
            .await?;
            return Ok(true);
        }
        let track_id = self.bound_tracks;
        if track_id >= self.advertised_tracks {
            self.send_response(
                self.response(StatusCode::BadRequest, cseq).build(Bytes::new()),
            )
            .await?;
            return Ok(true);
        }

        let (binding, transport_resp) = match request {
            TransportRequest::Udp {
                client_rtp_port,
                client_rtcp_port,
            } => {
                if (client_rtp_port % 2) != 0 || client_rtcp_port != client_rtp_port + 1 {
                    debug!(
                        "{}: bad client_port pair {}-{}",
                        self.addr, client_rtp_port, client_rtcp_port
                    );
                    self.send_response(
                        self.response(StatusCode::BadRequest, cseq).build(Bytes::new()),
                    )
                    .await?;
                    return Ok(true);
                }
                (
                    TrackBinding::Udp {
                        rtp_port: client_rtp_port,
                        rtcp_port: client_rtcp_port,
                    },
                    format!(
                        "RTP/AVP;unicast;client_port={}-{};server_port={}-{}",
                        client_rtp_port,
                        client_rtcp_port,
                        self.shared.conf().rtp_port,
                        self.shared.conf().rtcp_port,
                    ),
                )
            }
            TransportRequest::Tcp { proposed_channel_id } => {
                // Whatever the client proposed, the i-th set-up track gets
                // the canonical (2i, 2i+1) channel pair.
                let rtp_channel = crate::TrackFlow::Rtp.channel_id(track_id);
                if let Some(p) = proposed_channel_id.filter(|&p| p != rtp_channel) {
                    debug!(
                        "{}: overriding proposed interleaved channel {} with {}",
                        self.addr, p, rtp_channel
                    );
                }
                (
                    TrackBinding::Tcp { rtp_channel },
                    format!(
                        "RTP/AVP/TCP;unicast;interleaved={}-{}",
                        rtp_channel,
                        rtp_channel + 1
                    ),
                )
            }
        };
        self.shared
            .add_client_track(self.id, binding, self.advertised_tracks);
        self.transport = Some(kind);
        self.bound_tracks += 1;
        debug!(
            "{}: track {} set up over {} ({})",
            self.addr, track_id, kind, transport_resp
        );
        let resp = self
            .response(StatusCode::Ok, cseq)
            .header(headers::SESSION, self.session_id.clone())
            .header(headers::TRANSPORT, transport_resp)
            .build(Bytes::new());
        self.send_response(resp).await?;
        Ok(true)
    }

    async fn handle_play(&mut self, cseq: &str) -> Result<bool, Error> {
        if !self.shared.set_client_playing(self.id) {
            self.send_response(
                self.response(StatusCode::SessionNotFound, cseq).build(Bytes::new()),
            )
            .await?;
            return Ok(true);
        }
        self.playing = true;
        info!(
            "{}: playing {} over {}",
            self.addr,
            self.path.as_deref().unwrap_or("?"),
            self.transport.map(|t| t.to_string()).unwrap_or_default(),
        );
        let resp = self
            .response(StatusCode::Ok, cseq)
            .header(headers::SESSION, self.session_id.clone())
            .build(Bytes::new());
        self.send_response(resp).await?;
        Ok(true)
    }

    fn response(&self, status: StatusCode, cseq: &str) -> rtsp_types::ResponseBuilder {
        rtsp_types::Response::builder(Version::V1_0, status)
            .header(headers::CSEQ, cseq.to_owned())
    }

    async fn send_response(&mut self, resp: rtsp_types::Response<Bytes>) -> Result<(), Error> {
        match tokio::time::timeout(WRITE_TIMEOUT, self.conn.send(Message::Response(resp))).await {
            Ok(r) => r,
            Err(_) => Err(wrap!(ErrorInt::Timeout)),
        }
    }

    async fn send_frame(&mut self, channel: u8, payload: Bytes) -> Result<(), Error> {
        let msg = Message::Data(Data::new(channel, payload));
        match tokio::time::timeout(WRITE_TIMEOUT, self.conn.send(msg)).await {
            Ok(r) => r,
            Err(_) => Err(wrap!(ErrorInt::Timeout)),
        }
    }
}
