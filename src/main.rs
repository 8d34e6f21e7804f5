// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Command-line entry point for the RTSP fan-out proxy.

use anyhow::{Context, Error};
use clap::Parser;
use log::{error, info};

use rtsp_fanout_proxy::conf::{self, Conf};
use rtsp_fanout_proxy::proxy::Proxy;
use rtsp_fanout_proxy::TransportKind;

/// RTSP proxy: relays each configured stream path to many clients over UDP
/// or interleaved TCP, starting the upstream session on demand.
///
/// Streams are defined in the (optional) YAML configuration document; flags
/// and environment variables override the listener settings.
#[derive(Parser)]
#[command(version)]
struct Opts {
    /// Path of the YAML configuration document, or the literal `stdin`.
    conf: Option<String>,

    /// Supported client protocols, comma-separated [default: tcp,udp].
    #[arg(long, env = "PROTOCOLS")]
    protocols: Option<String>,

    /// Port of the RTSP TCP listener [default: 8554].
    #[arg(long, env = "RTSP_PORT")]
    rtsp_port: Option<u16>,

    /// Port of the RTP UDP listener [default: 8050].
    #[arg(long, env = "RTP_PORT")]
    rtp_port: Option<u16>,

    /// Port of the RTCP UDP listener [default: 8051].
    #[arg(long, env = "RTCP_PORT")]
    rtcp_port: Option<u16>,

    /// Timeout for a stream to become ready, eg `10s` [default: 10s].
    #[arg(long, value_parser = conf::parse_duration)]
    stream_ready_timeout: Option<std::time::Duration>,

    /// How long a stream without clients lives, eg `10s` [default: 10s].
    #[arg(long, value_parser = conf::parse_duration)]
    stream_ttl: Option<std::time::Duration>,
}

fn build_conf(opts: &Opts) -> Result<Conf, Error> {
    let mut conf = match opts.conf.as_deref() {
        Some(path) => Conf::load(path)?,
        None => Conf::default(),
    };
    if let Some(protocols) = opts.protocols.as_deref() {
        conf.protocols = protocols
            .split(',')
            .map(|p| p.trim().parse::<TransportKind>().map_err(Error::msg))
            .collect::<Result<_, _>>()?;
    }
    if let Some(p) = opts.rtsp_port {
        conf.rtsp_port = p;
    }
    if let Some(p) = opts.rtp_port {
        conf.rtp_port = p;
    }
    if let Some(p) = opts.rtcp_port {
        conf.rtcp_port = p;
    }
    if let Some(t) = opts.stream_ready_timeout {
        conf.stream_ready_timeout = t;
    }
    if let Some(t) = opts.stream_ttl {
        conf.stream_ttl = t;
    }
    conf.validate()?;
    Ok(conf)
}

async fn run() -> Result<(), Error> {
    let opts = Opts::parse();
    let conf = build_conf(&opts)?;
    let proxy = Proxy::bind(conf).await?;
    tokio::signal::ctrl_c()
        .await
        .context("unable to listen for shutdown signal")?;
    info!("interrupted; shutting down");
    proxy.shutdown();
    Ok(())
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    if let Err(e) = run().await {
        error!("Fatal: {:#}", e);
        std::process::exit(1);
    }
}
