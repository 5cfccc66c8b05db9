// Copyright (C) 2026 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! WebSocket signaling endpoint.
//!
//! Each WebSocket client gets its own peer connection carrying the shared
//! video track. The browser sends an offer; the server answers. ICE
//! candidates trickle in both directions.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Error};
use futures::{SinkExt, Stream, StreamExt};
use log::{debug, info, warn};
use nalfeed::ReadinessGate;
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{
    handshake::server::{ErrorResponse, Request, Response},
    http::StatusCode,
    Error as WsError, Message,
};
use tokio_util::sync::CancellationToken;
use webrtc::{
    api::API,
    ice_transport::{
        ice_candidate::{RTCIceCandidate, RTCIceCandidateInit},
        ice_connection_state::RTCIceConnectionState,
        ice_server::RTCIceServer,
    },
    peer_connection::{
        configuration::RTCConfiguration, peer_connection_state::RTCPeerConnectionState,
        sdp::session_description::RTCSessionDescription, RTCPeerConnection,
    },
    track::track_local::{track_local_static_sample::TrackLocalStaticSample, TrackLocal},
};

/// Pause after a failed `accept` before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Calls `accept` until it succeeds, pausing [`ACCEPT_BACKOFF`] after each
/// failure so a persistent error (eg EMFILE) doesn't spin.
async fn accept_retrying<T, F, Fut>(mut accept: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<T>>,
{
    loop {
        match accept().await {
            Ok(a) => return a,
            Err(e) => {
                warn!("Accept failed: {}", e);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

/// A JSON signaling message, tagged by its `type` field.
#[derive(Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub(crate) enum SignalingMessage {
    Offer {
        sdp: String,
    },
    Answer {
        sdp: String,
    },
    Candidate {
        candidate: String,
        #[serde(rename = "sdpMid")]
        sdp_mid: Option<String>,
        #[serde(rename = "sdpMLineIndex")]
        sdp_mline_index: Option<u16>,
    },
}

pub(crate) struct Signaling {
    pub(crate) api: API,
    pub(crate) ice_servers: Vec<String>,

    /// The only request path accepted for the WebSocket upgrade.
    pub(crate) path: String,

    pub(crate) track: Arc<TrackLocalStaticSample>,

    /// Signaled when any peer's ICE connection first reaches `Connected`.
    pub(crate) gate: ReadinessGate,

    /// Cancelled when a connected peer fails or closes.
    pub(crate) cancel: CancellationToken,
}

impl Signaling {
    /// Accepts clients until the session is cancelled.
    pub(crate) async fn serve(self: Arc<Self>, listener: TcpListener) {
        loop {
            let (stream, addr) = tokio::select! {
                _ = self.cancel.cancelled() => return,
                a = accept_retrying(|| listener.accept()) => a,
            };
            let this = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = this.handle(stream, addr).await {
                    warn!("Signaling client {}: {:#}", addr, e);
                }
            });
        }
    }

    async fn handle(&self, stream: TcpStream, addr: SocketAddr) -> Result<(), Error> {
        let path = &self.path[..];
        let ws = tokio_tungstenite::accept_hdr_async(
            stream,
            |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                if req.uri().path() != path {
                    let mut e = ErrorResponse::new(Some("not found".to_owned()));
                    *e.status_mut() = StatusCode::NOT_FOUND;
                    return Err(e);
                }
                Ok(resp)
            },
        )
        .await
        .context("WebSocket handshake failed")?;
        info!("Signaling client {} connected", addr);
        let (mut ws_tx, mut ws_rx) = ws.split();

        let (tx, mut rx) = mpsc::unbounded_channel::<SignalingMessage>();
        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let json = match serde_json::to_string(&msg) {
                    Ok(j) => j,
                    Err(e) => {
                        warn!("Unable to serialize {:?}: {}", msg, e);
                        continue;
                    }
                };
                if ws_tx.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
        });

        let connected = Arc::new(AtomicBool::new(false));
        let pc = self
            .new_peer_connection(addr, tx.clone(), Arc::clone(&connected))
            .await?;

        let result = self.negotiate(addr, &pc, &mut ws_rx, &tx).await;
        info!("Signaling client {} disconnected", addr);
        writer.abort();

        // A connected peer outlives its signaling channel.
        if connected.load(Ordering::SeqCst) {
            self.cancel.cancelled().await;
        }
        pc.close().await?;
        result
    }

    /// Handles signaling messages until the client disconnects or the session is cancelled.
    async fn negotiate<S>(
        &self,
        addr: SocketAddr,
        pc: &RTCPeerConnection,
        ws_rx: &mut S,
        tx: &mpsc::UnboundedSender<SignalingMessage>,
    ) -> Result<(), Error>
    where
        S: Stream<Item = Result<Message, WsError>> + Unpin,
    {
        // Candidates which arrive before the offer.
        let mut pending: Vec<RTCIceCandidateInit> = Vec::new();
        loop {
            let msg = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                m = ws_rx.next() => m,
            };
            let text = match msg {
                None | Some(Ok(Message::Close(_))) => return Ok(()),
                Some(Ok(Message::Text(t))) => t,
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(Error::new(e).context("WebSocket read failed")),
            };
            let msg = match serde_json::from_str::<SignalingMessage>(&text) {
                Ok(m) => m,
                Err(e) => {
                    warn!("Ignoring bad signaling message from {}: {}", addr, e);
                    continue;
                }
            };
            match msg {
                SignalingMessage::Offer { sdp } => {
                    debug!("Offer from {}", addr);
                    pc.set_remote_description(RTCSessionDescription::offer(sdp)?)
                        .await?;
                    for c in pending.drain(..) {
                        pc.add_ice_candidate(c).await?;
                    }
                    let answer = pc.create_answer(None).await?;
                    pc.set_local_description(answer.clone()).await?;
                    let _ = tx.send(SignalingMessage::Answer { sdp: answer.sdp });
                }
                SignalingMessage::Candidate {
                    candidate,
                    sdp_mid,
                    sdp_mline_index,
                } => {
                    let init = RTCIceCandidateInit {
                        candidate,
                        sdp_mid,
                        sdp_mline_index,
                        ..Default::default()
                    };
                    if pc.remote_description().await.is_some() {
                        pc.add_ice_candidate(init).await?;
                    } else {
                        pending.push(init);
                    }
                }
                SignalingMessage::Answer { .. } => {
                    warn!("Ignoring unexpected answer from {}", addr);
                }
            }
        }
    }

    async fn new_peer_connection(
        &self,
        addr: SocketAddr,
        tx: mpsc::UnboundedSender<SignalingMessage>,
        connected: Arc<AtomicBool>,
    ) -> Result<Arc<RTCPeerConnection>, Error> {
        let cfg = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let pc = Arc::new(self.api.new_peer_connection(cfg).await?);
        let sender = pc
            .add_track(Arc::clone(&self.track) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        // Read incoming RTCP packets so interceptors (eg NACK) can process them.
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while let Ok((_, _)) = sender.read(&mut rtcp_buf).await {}
        });

        let gate = self.gate.clone();
        let ice_connected = Arc::clone(&connected);
        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            info!("{}: ICE connection state {}", addr, state);
            if state == RTCIceConnectionState::Connected {
                ice_connected.store(true, Ordering::SeqCst);
                if gate.signal() {
                    info!("{}: first peer connected", addr);
                }
            }
            Box::pin(async {})
        }));

        let cancel = self.cancel.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            info!("{}: peer connection state {}", addr, state);
            if matches!(
                state,
                RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
            ) && connected.load(Ordering::SeqCst)
            {
                cancel.cancel();
            }
            Box::pin(async {})
        }));

        pc.on_ice_candidate(Box::new(move |c: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            Box::pin(async move {
                let Some(c) = c else {
                    return;
                };
                match c.to_json() {
                    Ok(init) => {
                        let _ = tx.send(SignalingMessage::Candidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        });
                    }
                    Err(e) => warn!("{}: unable to serialize local candidate: {}", addr, e),
                }
            })
        }));
        Ok(pc)
    }
}
