// Copyright (C) 2026 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Error};
use clap::Parser;
use log::{error, info};
use nalfeed::{Feeder, FeederOptions, MalformedUnitPolicy, ReadinessGate};
use tokio_util::sync::CancellationToken;
use webrtc::{
    api::{interceptor_registry::register_default_interceptors, APIBuilder},
    interceptor::registry::Registry,
    rtp_transceiver::rtp_codec::RTCRtpCodecCapability,
    track::track_local::track_local_static_sample::TrackLocalStaticSample,
};

mod signaling;
mod sink;
mod source;

/// Serves a live H.264 stream to a browser over WebRTC.
///
/// By default, runs `ffmpeg` with the trailing arguments and reads a raw
/// Annex B stream from its stdout, eg:
///
/// ```text
/// nalfeed-server -- -re -i input.mp4 -an -c:v libx264 -bsf:v h264_mp4toannexb -f h264 -
/// ```
///
/// The browser connects to `ws://<host>:<port><path>` and sends an SDP offer.
/// Video starts flowing once the first peer's ICE connection is established.
#[derive(Parser)]
struct Opts {
    /// Address on which to serve WebSocket signaling.
    #[arg(long, default_value = "0.0.0.0")]
    bind: IpAddr,

    #[arg(long, default_value_t = 8081)]
    port: u16,

    /// Request path of the WebSocket signaling endpoint.
    #[arg(long, default_value = "/signaling")]
    path: String,

    /// Frames per second, which sets both the pacing and each sample's duration.
    #[arg(long, default_value_t = 60, value_parser = clap::value_parser!(u32).range(1..=1000))]
    fps: u32,

    /// What to do with unparseable NAL units: `fail` or `skip`.
    #[arg(default_value_t, long)]
    malformed_units: MalformedUnitPolicy,

    /// STUN/TURN server URLs offered to peers.
    #[arg(long = "ice-server", default_value = "stun:stun.l.google.com:19302")]
    ice_servers: Vec<String>,

    /// Reads H.264 from this file (`-` for stdin) rather than running ffmpeg.
    #[arg(long, conflicts_with = "ffmpeg_args", required_unless_present = "ffmpeg_args")]
    input: Option<PathBuf>,

    /// Arguments to pass to `ffmpeg`.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    ffmpeg_args: Vec<String>,
}

fn init_logging() {
    env_logger::Builder::from_env(
        env_logger::Env::new()
            .filter_or("NALFEED_LOG", "info")
            .write_style("NALFEED_LOG_STYLE"),
    )
    .init();
}

#[tokio::main]
async fn main() {
    init_logging();
    if let Err(e) = run().await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Error> {
    let opts = Opts::parse();
    let source = source::open(opts.input.as_deref(), &opts.ffmpeg_args).await?;

    let mut m = webrtc::api::media_engine::MediaEngine::default();
    m.register_default_codecs()?;

    // The interceptors provide NACKs, RTCP reports, and the like.
    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut m)?;
    let api = APIBuilder::new()
        .with_media_engine(m)
        .with_interceptor_registry(registry)
        .build();

    let track = Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: "video/h264".to_owned(),
            ..Default::default()
        },
        "video".to_owned(),
        "nalfeed".to_owned(),
    ));
    let gate = ReadinessGate::new();
    let cancel = CancellationToken::new();

    let listener = tokio::net::TcpListener::bind((opts.bind, opts.port))
        .await
        .with_context(|| format!("unable to bind {}:{}", opts.bind, opts.port))?;
    info!(
        "WebSocket signaling on ws://{}:{}{}",
        opts.bind, opts.port, opts.path
    );
    let signaling = Arc::new(signaling::Signaling {
        api,
        ice_servers: opts.ice_servers,
        path: opts.path,
        track: Arc::clone(&track),
        gate: gate.clone(),
        cancel: cancel.clone(),
    });
    tokio::spawn(signaling.serve(listener));

    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received ctrl-C");
                cancel.cancel();
            }
        }
    });

    let frame_duration = Duration::from_secs(1) / opts.fps;
    let mut feeder = Feeder::new(
        source.reader,
        sink::TrackSink(track),
        gate,
        FeederOptions::default()
            .frame_duration(frame_duration)
            .malformed_units(opts.malformed_units)
            .cancellation(cancel.clone()),
    );
    let summary = feeder.run().await.context("feed failed")?;
    drop(feeder);
    source::finish(source.child).await?;
    info!(
        "Done: {} NAL units, {} samples, {} bytes; {} units skipped, {} trailing parameter set bytes discarded",
        summary.units,
        summary.samples,
        summary.bytes,
        summary.skipped_units,
        summary.discarded_parameter_bytes,
    );
    cancel.cancel();
    Ok(())
}
