// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Header and SDP parsing helpers shared by the two session directions.
//!
//! Errors are plain strings; callers pack them into a contextful
//! [`crate::Error`] or an RTSP error status as appropriate.

use bytes::Bytes;
use url::Url;

/// Returns the `CSeq` of an RTSP response as a `u32`, or `None` if
/// missing/unparseable.
pub(super) fn response_cseq(response: &rtsp_types::Response<Bytes>) -> Option<u32> {
    response
        .header(&rtsp_types::headers::CSEQ)
        .and_then(|cseq| cseq.as_str().parse().ok())
}

/// A track advertised by an origin's DESCRIBE response.
#[derive(Debug)]
pub(super) struct TrackDescription {
    /// The track's control URL, if the SDP supplied one. `SETUP` goes to
    /// this URL; without it, to the presentation's base.
    pub(super) control: Option<Url>,
}

/// The parts of a DESCRIBE response the proxy cares about: the raw SDP to
/// relay to clients, the aggregate control URL for `PLAY`/`TEARDOWN`, and
/// one entry per advertised track.
#[derive(Debug)]
pub(super) struct Description {
    pub(super) sdp: Bytes,
    pub(super) control: Url,
    pub(super) tracks: Vec<TrackDescription>,
}

/// Parses a successful `DESCRIBE` response.
///
/// The SDP is relayed to clients byte-identical; only the media sections and
/// `control` attributes are interpreted here. Unlike a player, the proxy has
/// no interest in codecs, so media sections are accepted regardless of their
/// format details.
pub(super) fn parse_describe(
    request_url: &Url,
    response: &rtsp_types::Response<Bytes>,
) -> Result<Description, String> {
    if !matches!(response.header(&rtsp_types::headers::CONTENT_TYPE),
                 Some(v) if v.as_str() == "application/sdp")
    {
        return Err(format!(
            "DESCRIBE response not of expected application/sdp content type: {:#?}",
            &response
        ));
    }

    let sdp = sdp_types::Session::parse(&response.body()[..])
        .map_err(|e| format!("Unable to parse SDP: {e}"))?;

    // https://tools.ietf.org/html/rfc2326#appendix-C.1.1
    let base_url = response
        .header(&rtsp_types::headers::CONTENT_BASE)
        .or_else(|| response.header(&rtsp_types::headers::CONTENT_LOCATION))
        .map(|v| Url::parse(v.as_str()).map_err(|e| format!("bad Content-Base {v:?}: {e}")))
        .unwrap_or(Ok(request_url.clone()))?;

    let mut control = None;
    for a in &sdp.attributes {
        if a.attribute == "control" {
            control = a
                .value
                .as_deref()
                .map(|c| join_control(&base_url, c))
                .transpose()?;
            break;
        }
    }
    let control = control.unwrap_or_else(|| request_url.clone());

    if sdp.medias.is_empty() {
        return Err("SDP advertises no media sections".to_owned());
    }
    let tracks = sdp
        .medias
        .iter()
        .map(|m| {
            let control = m
                .attributes
                .iter()
                .find(|a| a.attribute == "control")
                .and_then(|a| a.value.as_deref())
                .map(|c| join_control(&base_url, c))
                .transpose()?;
            Ok(TrackDescription { control })
        })
        .collect::<Result<Vec<_>, String>>()?;

    Ok(Description {
        sdp: response.body().clone(),
        control,
        tracks,
    })
}

/// Joins a control attribute with the base URL, as in
/// [RFC 2326 section C.1.1](https://datatracker.ietf.org/doc/html/rfc2326#appendix-C.1.1).
fn join_control(base_url: &Url, control: &str) -> Result<Url, String> {
    if control == "*" {
        return Ok(base_url.clone());
    }
    if let Ok(absolute_url) = Url::parse(control) {
        return Ok(absolute_url);
    }
    Url::parse(&format!(
        "{}{}{}",
        base_url.as_str(),
        if base_url.as_str().ends_with('/') { "" } else { "/" },
        control
    ))
    .map_err(|e| format!("unable to join base url {base_url} with control url {control:?}: {e}"))
}

#[derive(Debug, PartialEq, Eq)]
pub(super) struct SessionHeader {
    pub(super) id: Box<str>,
    pub(super) timeout_sec: u32,
}

/// Interesting parts of a `SETUP` response's headers.
#[derive(Debug)]
pub(super) struct SetupResponse {
    pub(super) session: SessionHeader,
    pub(super) channel_id: Option<u8>,
    pub(super) source: Option<std::net::IpAddr>,
    pub(super) server_port: Option<(u16, u16)>,
}

/// Parses a `SETUP` response.
pub(super) fn parse_setup(response: &rtsp_types::Response<Bytes>) -> Result<SetupResponse, String> {
    // https://datatracker.ietf.org/doc/html/rfc2326#section-12.37
    let session = response
        .header(&rtsp_types::headers::SESSION)
        .ok_or_else(|| "Missing Session header".to_string())?;
    let session = match session.as_str().split_once(';') {
        None => SessionHeader {
            id: session.as_str().into(),
            timeout_sec: 60, // default
        },
        Some((id, timeout_str)) => {
            if let Some(v) = timeout_str.trim().strip_prefix("timeout=") {
                let timeout_sec = v.parse().map_err(|_| format!("Unparseable timeout {v}"))?;
                SessionHeader {
                    id: id.into(),
                    timeout_sec,
                }
            } else {
                return Err(format!("Unparseable Session header {:?}", session.as_str()));
            }
        }
    };
    let transport = response
        .header(&rtsp_types::headers::TRANSPORT)
        .ok_or_else(|| "Missing Transport header".to_string())?;
    let mut channel_id = None;
    let mut source = None;
    let mut server_port = None;
    for part in transport.as_str().split(';') {
        if let Some(interleaved) = part.strip_prefix("interleaved=") {
            let (n, m) = split_pair::<u8>(interleaved)
                .ok_or_else(|| format!("bad interleaved parameter {interleaved:?}"))?;
            if let Some(m) = m {
                if n.checked_add(1) != Some(m) {
                    return Err(format!("Expected adjacent channels; got {n}-{m}"));
                }
            }
            channel_id = Some(n);
        } else if let Some(s) = part.strip_prefix("source=") {
            source = Some(
                s.parse()
                    .map_err(|_| format!("Transport header has unparseable source {s:?}"))?,
            );
        } else if let Some(s) = part.strip_prefix("server_port=") {
            let (n, m) = split_pair::<u16>(s)
                .ok_or_else(|| format!("bad port in Transport: {}", transport.as_str()))?;
            match m {
                Some(m) => server_port = Some((n, m)),
                // RFC 2326's grammar allows a single port, but it's unclear
                // whether the second is implied or shared. Refuse.
                None => return Err("Transport header specifies a single server_port".to_owned()),
            }
        }
    }
    Ok(SetupResponse {
        session,
        channel_id,
        source,
        server_port,
    })
}

/// The transport a client proposed in a `SETUP` request.
#[derive(Debug, PartialEq, Eq)]
pub(super) enum TransportRequest {
    Udp {
        client_rtp_port: u16,
        client_rtcp_port: u16,
    },
    Tcp {
        proposed_channel_id: Option<u8>,
    },
}

/// Parses the `Transport` header of a client's `SETUP` request.
///
/// The header may list several alternatives; as the original server
/// implementations do, only the first is considered.
pub(super) fn parse_transport_request(value: &str) -> Result<TransportRequest, String> {
    let first = value.split(',').next().expect("split returns at least one");
    let mut parts = first.split(';');
    let proto = parts.next().expect("split returns at least one").trim();
    match proto {
        "RTP/AVP" | "RTP/AVP/UDP" => {
            for part in parts {
                if let Some(s) = part.strip_prefix("client_port=") {
                    let (rtp, rtcp) =
                        split_pair::<u16>(s).ok_or_else(|| format!("bad client_port {s:?}"))?;
                    let rtcp = rtcp.ok_or_else(|| {
                        format!("client_port {s:?} must name an RTP-RTCP pair")
                    })?;
                    return Ok(TransportRequest::Udp {
                        client_rtp_port: rtp,
                        client_rtcp_port: rtcp,
                    });
                }
            }
            Err("UDP transport without client_port".to_owned())
        }
        "RTP/AVP/TCP" => {
            let mut proposed_channel_id = None;
            for part in parts {
                if let Some(s) = part.strip_prefix("interleaved=") {
                    let (n, _) =
                        split_pair::<u8>(s).ok_or_else(|| format!("bad interleaved parameter {s:?}"))?;
                    proposed_channel_id = Some(n);
                }
            }
            Ok(TransportRequest::Tcp {
                proposed_channel_id,
            })
        }
        o => Err(format!("unsupported transport specification {o:?}")),
    }
}

/// Splits `"a-b"` (or a bare `"a"`) into its numeric components.
fn split_pair<T: std::str::FromStr>(s: &str) -> Option<(T, Option<T>)> {
    let mut it = s.splitn(2, '-');
    let n = it.next()?.parse().ok()?;
    let m = match it.next() {
        None => None,
        Some(m) => Some(m.parse().ok()?),
    };
    Some((n, m))
}
