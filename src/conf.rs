// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Proxy configuration: a YAML document and/or command-line overrides,
//! validated once at bootstrap and immutable afterward.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::ErrorInt;
use crate::{bail, Error, TransportKind};

fn default_protocols() -> Vec<TransportKind> {
    vec![TransportKind::Tcp, TransportKind::Udp]
}

fn default_rtsp_port() -> u16 {
    8554
}

fn default_rtp_port() -> u16 {
    8050
}

fn default_rtcp_port() -> u16 {
    8051
}

fn default_stream_ready_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_stream_ttl() -> Duration {
    Duration::from_secs(10)
}

/// One proxied stream: the path clients request mapped to its origin.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct StreamConf {
    /// `rtsp://` URL of the origin publishing this stream.
    pub url: Url,

    /// Prefer interleaved TCP when talking to the origin. Without this,
    /// UDP is attempted first and TCP is the fallback.
    #[serde(default, rename = "useTcp")]
    pub use_tcp: bool,
}

/// Validated proxy configuration.
///
/// Deserializes from the YAML document described in the README; every field
/// has a default so a configuration may also be assembled from command-line
/// flags alone. [`Conf::validate`] must pass before the value is used.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Conf {
    /// Transports offered to clients; non-empty subset of {udp, tcp}.
    #[serde(default = "default_protocols")]
    pub protocols: Vec<TransportKind>,

    /// Port of the RTSP TCP listener.
    #[serde(default = "default_rtsp_port")]
    pub rtsp_port: u16,

    /// Port of the RTP UDP listener; must be even.
    #[serde(default = "default_rtp_port")]
    pub rtp_port: u16,

    /// Port of the RTCP UDP listener; must be `rtp_port + 1`.
    #[serde(default = "default_rtcp_port")]
    pub rtcp_port: u16,

    /// How long an upstream session may take to reach PLAY before waiting
    /// clients are failed; at least one second.
    #[serde(default = "default_stream_ready_timeout", with = "duration_str")]
    pub stream_ready_timeout: Duration,

    /// How long a stream may run with no attached clients before its
    /// upstream is torn down; at least one second.
    #[serde(default = "default_stream_ttl", with = "duration_str", rename = "streamTTL")]
    pub stream_ttl: Duration,

    /// Proxied streams by path.
    #[serde(default)]
    pub streams: BTreeMap<String, StreamConf>,
}

impl Default for Conf {
    fn default() -> Self {
        Conf {
            protocols: default_protocols(),
            rtsp_port: default_rtsp_port(),
            rtp_port: default_rtp_port(),
            rtcp_port: default_rtcp_port(),
            stream_ready_timeout: default_stream_ready_timeout(),
            stream_ttl: default_stream_ttl(),
            streams: BTreeMap::new(),
        }
    }
}

impl Conf {
    /// Loads a configuration document from `path`, or from standard input
    /// when `path` is the literal `stdin`.
    pub fn load(path: &str) -> Result<Self, Error> {
        let conf: Conf = if path == "stdin" {
            serde_yaml::from_reader(std::io::stdin().lock())
                .map_err(|e| wrap_conf(format!("unable to parse stdin: {e}")))?
        } else {
            let f = std::fs::File::open(path)
                .map_err(|e| wrap_conf(format!("unable to open {path}: {e}")))?;
            serde_yaml::from_reader(std::io::BufReader::new(f))
                .map_err(|e| wrap_conf(format!("unable to parse {path}: {e}")))?
        };
        conf.validate()?;
        Ok(conf)
    }

    /// Checks the invariants the rest of the proxy relies on.
    pub fn validate(&self) -> Result<(), Error> {
        if self.protocols.is_empty() {
            bail!(ErrorInt::InvalidConf("no protocols provided".to_owned()));
        }
        let mut seen = self.protocols.clone();
        seen.sort_unstable();
        seen.dedup();
        if seen.len() != self.protocols.len() {
            bail!(ErrorInt::InvalidConf("duplicate protocol".to_owned()));
        }
        if self.rtsp_port == 0 {
            bail!(ErrorInt::InvalidConf("rtsp port not provided".to_owned()));
        }
        if self.rtp_port == 0 {
            bail!(ErrorInt::InvalidConf("rtp port not provided".to_owned()));
        }
        if (self.rtp_port % 2) != 0 {
            bail!(ErrorInt::InvalidConf("rtp port must be even".to_owned()));
        }
        if self.rtcp_port != self.rtp_port + 1 {
            bail!(ErrorInt::InvalidConf(
                "rtcp port must be rtp port plus 1".to_owned()
            ));
        }
        if self.stream_ready_timeout < Duration::from_secs(1) {
            bail!(ErrorInt::InvalidConf(
                "too small stream ready timeout".to_owned()
            ));
        }
        if self.stream_ttl < Duration::from_secs(1) {
            bail!(ErrorInt::InvalidConf("too small stream TTL".to_owned()));
        }
        for (path, stream) in &self.streams {
            if path.is_empty() || path.contains('/') {
                bail!(ErrorInt::InvalidConf(format!(
                    "invalid stream path {path:?}: must be a non-empty single segment"
                )));
            }
            if stream.url.scheme() != "rtsp" {
                bail!(ErrorInt::InvalidConf(format!(
                    "stream {path}: only rtsp urls are supported, got {}",
                    stream.url
                )));
            }
            if stream.url.host_str().is_none() {
                bail!(ErrorInt::InvalidConf(format!(
                    "stream {path}: url must specify a host"
                )));
            }
            if stream.url.username() != "" || stream.url.password().is_some() {
                bail!(ErrorInt::InvalidConf(format!(
                    "stream {path}: url must not contain credentials"
                )));
            }
        }
        Ok(())
    }

    /// True if clients may negotiate the given transport.
    pub fn allows(&self, kind: TransportKind) -> bool {
        self.protocols.contains(&kind)
    }
}

fn wrap_conf(description: String) -> Error {
    crate::wrap!(ErrorInt::InvalidConf(description))
}

/// Parses a duration of the form `10s`, `1500ms`, `2m`, or `1h`.
///
/// Also used by the command-line layer, so errors are plain strings.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let digits = s.len() - s.trim_start_matches(|c: char| c.is_ascii_digit()).len();
    if digits == 0 {
        return Err(format!("duration {s:?} must start with digits"));
    }
    let (n, unit) = s.split_at(digits);
    let n: u64 = n.parse().map_err(|_| format!("bad duration value {n:?}"))?;
    match unit {
        "ms" => Ok(Duration::from_millis(n)),
        "s" => Ok(Duration::from_secs(n)),
        "m" => Ok(Duration::from_secs(n * 60)),
        "h" => Ok(Duration::from_secs(n * 3600)),
        _ => Err(format!(
            "duration {s:?} must end in ms, s, m, or h"
        )),
    }
}

/// Formats a duration in the shortest unit [`parse_duration`] reads back
/// losslessly.
pub fn format_duration(d: Duration) -> String {
    if d.subsec_millis() != 0 {
        format!("{}ms", d.as_millis())
    } else {
        format!("{}s", d.as_secs())
    }
}

mod duration_str {
    use std::time::Duration;

    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(deserializer)?;
        super::parse_duration(&s).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GOOD: &str = "\
protocols: [udp, tcp]
rtspPort: 8554
rtpPort: 8050
rtcpPort: 8051
streamReadyTimeout: 10s
streamTTL: 10s
streams:
  cam1:
    url: rtsp://origin:554/main
    useTcp: false
";

    fn parse(s: &str) -> Conf {
        serde_yaml::from_str(s).unwrap()
    }

    #[test]
    fn good_document() {
        let conf = parse(GOOD);
        conf.validate().unwrap();
        assert_eq!(conf.rtp_port, 8050);
        assert_eq!(conf.stream_ttl, Duration::from_secs(10));
        let cam1 = &conf.streams["cam1"];
        assert_eq!(cam1.url.as_str(), "rtsp://origin:554/main");
        assert!(!cam1.use_tcp);
    }

    #[test]
    fn defaults() {
        let conf = parse("{}");
        conf.validate().unwrap();
        assert_eq!(conf, Conf::default());
    }

    #[test]
    fn round_trip() {
        let conf = parse(GOOD);
        conf.validate().unwrap();
        let reloaded = parse(&serde_yaml::to_string(&conf).unwrap());
        assert_eq!(conf, reloaded);
    }

    #[test]
    fn odd_rtp_port() {
        let conf = parse("{rtpPort: 8051, rtcpPort: 8052}");
        conf.validate().unwrap_err();
    }

    #[test]
    fn mismatched_rtcp_port() {
        let conf = parse("{rtpPort: 8050, rtcpPort: 8060}");
        conf.validate().unwrap_err();
    }

    #[test]
    fn empty_protocols() {
        let conf = parse("{protocols: []}");
        conf.validate().unwrap_err();
    }

    #[test]
    fn sub_second_timeouts() {
        parse("{streamReadyTimeout: 500ms}").validate().unwrap_err();
        parse("{streamTTL: 999ms}").validate().unwrap_err();
    }

    #[test]
    fn stream_url_with_credentials() {
        let conf = parse("{streams: {cam1: {url: \"rtsp://u:p@origin/main\"}}}");
        conf.validate().unwrap_err();
    }

    #[test]
    fn durations() {
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("1500ms").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        parse_duration("10").unwrap_err();
        parse_duration("s").unwrap_err();
        parse_duration("10 s").unwrap_err();
        assert_eq!(format_duration(Duration::from_secs(90)), "90s");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1500ms");
    }
}
