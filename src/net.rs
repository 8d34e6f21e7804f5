// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Byte-level plumbing: the RTSP message [`Connection`] used in both
//! directions (accepted clients and dialed origins) and the even/odd UDP
//! socket pairs used to receive from UDP origins.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use log::trace;
use rtsp_types::{Data, Message};
use std::net::{IpAddr, SocketAddr};
use std::ops::Range;
use tokio::net::{TcpStream, UdpSocket};
use tokio_util::codec::Framed;
use url::Host;

use crate::error::ErrorInt;
use crate::{wrap, ConnectionContext, Error, RtspMessageContext, WallTime};

/// A received RTSP message with its position in the connection's byte stream.
#[derive(Debug)]
pub(crate) struct ReceivedMessage {
    pub(crate) ctx: RtspMessageContext,
    pub(crate) msg: Message<Bytes>,
}

/// An RTSP connection which implements `Stream` and `Sink`.
pub(crate) struct Connection(Framed<TcpStream, Codec>);

impl Connection {
    pub(crate) async fn connect(host: Host<&str>, port: u16) -> Result<Self, std::io::Error> {
        let stream = match host {
            Host::Domain(h) => TcpStream::connect((h, port)).await,
            Host::Ipv4(h) => TcpStream::connect((h, port)).await,
            Host::Ipv6(h) => TcpStream::connect((h, port)).await,
        }?;
        Self::from_stream(stream)
    }

    pub(crate) fn from_stream(stream: TcpStream) -> Result<Self, std::io::Error> {
        let established_wall = WallTime::now();
        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;
        Ok(Self(Framed::new(
            stream,
            Codec {
                ctx: ConnectionContext {
                    local_addr,
                    peer_addr,
                    established_wall,
                },
                read_pos: 0,
            },
        )))
    }

    pub(crate) fn ctx(&self) -> &ConnectionContext {
        &self.0.codec().ctx
    }

    pub(crate) fn eof_ctx(&self) -> RtspMessageContext {
        RtspMessageContext {
            pos: self.0.codec().read_pos + (self.0.read_buffer().remaining() as u64),
            received_wall: WallTime::now(),
        }
    }

    /// Reads the next message, or `None` at clean EOF.
    pub(crate) async fn next(&mut self) -> Option<Result<ReceivedMessage, Error>> {
        let conn_ctx = *self.ctx();
        match self.0.next().await {
            Some(Ok(msg)) => Some(Ok(msg)),
            Some(Err(e)) => Some(Err(wrap!(match e {
                CodecError::IoError(source) => ErrorInt::RtspReadError {
                    conn_ctx,
                    msg_ctx: self.eof_ctx(),
                    source,
                },
                CodecError::ParseError { description, pos } => ErrorInt::RtspFramingError {
                    conn_ctx,
                    msg_ctx: RtspMessageContext {
                        pos,
                        received_wall: WallTime::now(),
                    },
                    description,
                },
            }))),
            None => None,
        }
    }

    /// Sends and flushes a single message.
    pub(crate) async fn send(&mut self, msg: Message<Bytes>) -> Result<(), Error> {
        let conn_ctx = *self.ctx();
        self.0.send(msg).await.map_err(|e| {
            wrap!(match e {
                CodecError::IoError(source) => ErrorInt::WriteError { conn_ctx, source },
                CodecError::ParseError { .. } => unreachable!(),
            })
        })
    }
}

/// Encodes and decodes RTSP messages, including `$`-prefixed interleaved
/// data frames.
struct Codec {
    ctx: ConnectionContext,

    /// Number of bytes read and processed (drained from the input buffer).
    read_pos: u64,
}

/// An intermediate error type that exists because [`Framed`] expects the
/// codec's error type to implement `From<std::io::Error>`, while the crate's
/// [`Error`] needs additional context.
#[derive(Debug)]
enum CodecError {
    IoError(std::io::Error),
    ParseError { description: String, pos: u64 },
}

impl std::convert::From<std::io::Error> for CodecError {
    fn from(e: std::io::Error) -> Self {
        CodecError::IoError(e)
    }
}

impl Codec {
    fn parse_msg(&self, src: &mut BytesMut) -> Result<Option<(usize, Message<Bytes>)>, CodecError> {
        // Skip leading CRLF as `rtsp-types` does. It must also happen here,
        // or the data fast path below would miss a frame that follows such
        // padding and then hit unreachable! when rtsp-types returns
        // Message::Data.
        while src.starts_with(b"\r\n") {
            src.advance(2);
        }

        if !src.is_empty() && src[0] == b'$' {
            // Data frames are the hot path: one arrives per relayed packet,
            // and its payload becomes the exact Bytes handed to every
            // subscriber's writer queue, so it is sliced out of the read
            // buffer without copying or going through rtsp-types.
            if src.len() < 4 {
                return Ok(None);
            }
            let channel_id = src[1];
            let len = 4 + usize::from(u16::from_be_bytes([src[2], src[3]]));
            if src.len() < len {
                src.reserve(len - src.len());
                return Ok(None);
            }
            let mut msg = src.split_to(len);
            msg.advance(4);
            return Ok(Some((
                len,
                Message::Data(Data::new(channel_id, msg.freeze())),
            )));
        }

        let (msg, len): (Message<&[u8]>, _) = match Message::parse(src) {
            Ok((m, l)) => (m, l),
            Err(rtsp_types::ParseError::Error) => {
                return Err(CodecError::ParseError {
                    description: format!(
                        "Invalid RTSP message; buffered:\n{:#?}",
                        crate::error::LimitedHex::new(&src[..], 128),
                    ),
                    pos: self.read_pos,
                });
            }
            Err(rtsp_types::ParseError::Incomplete(_)) => return Ok(None),
        };

        // Signaling messages are a handful per session, so their bodies are
        // simply copied out of the read buffer; nothing downstream wants a
        // zero-copy view of an SDP.
        let msg = match msg {
            Message::Request(req) => Message::Request(req.map_body(Bytes::copy_from_slice)),
            Message::Response(resp) => Message::Response(resp.map_body(Bytes::copy_from_slice)),
            Message::Data(_) => unreachable!("the fast path above consumed data frames"),
        };
        src.advance(len);
        Ok(Some((len, msg)))
    }
}

impl tokio_util::codec::Decoder for Codec {
    type Item = ReceivedMessage;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let (len, msg) = match self.parse_msg(src)? {
            None => return Ok(None),
            Some((len, msg)) => (len, msg),
        };
        let msg = ReceivedMessage {
            msg,
            ctx: RtspMessageContext {
                pos: self.read_pos,
                received_wall: WallTime::now(),
            },
        };
        self.read_pos += len as u64;
        Ok(Some(msg))
    }
}

impl tokio_util::codec::Encoder<Message<Bytes>> for Codec {
    type Error = CodecError;

    fn encode(&mut self, item: Message<Bytes>, mut dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.write(&mut (&mut dst).writer())
            .expect("BufMut Writer is infallible");
        Ok(())
    }
}

/// A pair of local UDP sockets for receiving one track from a UDP origin.
///
/// The RTP port is always even, and the RTCP port is always the following
/// (odd) integer; the pair is reserved atomically by binding both before
/// either is returned, retrying on collision with another process.
pub(crate) struct UdpPair {
    pub(crate) rtp_port: u16,
    pub(crate) rtp_socket: UdpSocket,
    pub(crate) rtcp_socket: UdpSocket,
}

impl UdpPair {
    pub(crate) fn for_ip(ip_addr: IpAddr) -> Result<Self, std::io::Error> {
        use rand::Rng as _;
        const MAX_TRIES: usize = 16;
        const ALLOWED_RTP_RANGE: Range<u16> = 5000..65000;
        let mut rng = rand::thread_rng();
        for i in 0..MAX_TRIES {
            let rtp_port = rng.gen_range(ALLOWED_RTP_RANGE) & !0b1;
            let rtp_addr = SocketAddr::new(ip_addr, rtp_port);
            let rtp_socket = match std::net::UdpSocket::bind(rtp_addr) {
                Ok(s) => s,
                Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                    trace!("Try {}/{}: unable to bind RTP addr {:?}", i, MAX_TRIES, rtp_addr);
                    continue;
                }
                Err(e) => return Err(e),
            };
            let rtcp_addr = SocketAddr::new(ip_addr, rtp_port + 1);
            let rtcp_socket = match std::net::UdpSocket::bind(rtcp_addr) {
                Ok(s) => s,
                Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                    trace!("Try {}/{}: unable to bind RTCP addr {:?}", i, MAX_TRIES, rtcp_addr);
                    continue;
                }
                Err(e) => return Err(e),
            };
            rtp_socket.set_nonblocking(true)?;
            rtcp_socket.set_nonblocking(true)?;
            return Ok(Self {
                rtp_port,
                rtp_socket: UdpSocket::from_std(rtp_socket)?,
                rtcp_socket: UdpSocket::from_std(rtcp_socket)?,
            });
        }
        Err(std::io::Error::new(
            std::io::ErrorKind::AddrInUse,
            format!(
                "Unable to find even/odd port pair on {} after {} tries",
                ip_addr, MAX_TRIES
            ),
        ))
    }
}

#[cfg(test)]
mod tests {
    use tokio_util::codec::Decoder;

    use super::*;
    use std::net::Ipv4Addr;

    fn dummy_codec() -> Codec {
        Codec {
            ctx: ConnectionContext {
                local_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
                peer_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
                established_wall: WallTime::now(),
            },
            read_pos: 0,
        }
    }

    #[test]
    fn crlf_then_data() {
        let mut codec = dummy_codec();
        let mut buf = BytesMut::from(&b"\r\n$\x00\x00\x04asdfrest"[..]);
        let msg = codec.decode(&mut buf).unwrap().unwrap();
        match msg.msg {
            Message::Data(d) => {
                assert_eq!(d.channel_id(), 0);
                assert_eq!(&d.into_body()[..], b"asdf");
            }
            o => panic!("unexpected message {o:?}"),
        }
        assert_eq!(&buf[..], b"rest");
    }

    #[test]
    fn signaling_body_is_copied_out() {
        let mut codec = dummy_codec();
        let mut buf = BytesMut::from(
            &b"RTSP/1.0 200 OK\r\nCSeq: 1\r\nContent-Length: 4\r\n\r\nasdf$\x00\x00\x01z"[..],
        );
        let msg = codec.decode(&mut buf).unwrap().unwrap();
        match msg.msg {
            Message::Response(r) => assert_eq!(&r.body()[..], b"asdf"),
            o => panic!("unexpected message {o:?}"),
        }
        // The data frame queued behind it decodes next, via the fast path.
        let msg = codec.decode(&mut buf).unwrap().unwrap();
        match msg.msg {
            Message::Data(d) => {
                assert_eq!(d.channel_id(), 0);
                assert_eq!(&d.into_body()[..], b"z");
            }
            o => panic!("unexpected message {o:?}"),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_data_frame() {
        let mut codec = dummy_codec();
        let mut buf = BytesMut::from(&b"$\x02\x00\x04as"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[tokio::test]
    async fn local_udp_pair() {
        let pair = UdpPair::for_ip(IpAddr::V4(Ipv4Addr::LOCALHOST)).unwrap();
        assert_eq!(pair.rtp_port % 2, 0);
        assert_eq!(
            pair.rtcp_socket.local_addr().unwrap().port(),
            pair.rtp_port + 1
        );
    }
}
