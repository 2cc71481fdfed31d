//! Tunnel session (C4): one WebSocket connection to the relay, kept alive
//! for as long as the supervisor wants it up. Owns the request registry
//! and fans decoded frames out to per-request dispatcher tasks.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use http::header::{HeaderValue, AUTHORIZATION, USER_AGENT};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::connect_async;
use tracing::{debug, info, warn};
use tunnel_protocol::{constants, Frame, IdleDescriptor, RequestId};

use crate::config::SessionConfig;
use crate::dispatcher;
use crate::registry::{Registry, Routed};
use crate::status::{self, Status};
use crate::supervisor::SETTLE_DELAY;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("invalid relay credentials: {0}")]
    InvalidHeader(#[from] http::header::InvalidHeaderValue),
    #[error("websocket handshake failed: {0}")]
    Handshake(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("failed to build an HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Why a session loop ended. The supervisor decides what to do next.
#[derive(Debug)]
pub enum SessionExit {
    /// The channel dropped, was closed by the relay, or errored.
    Disconnected,
    /// The relay asked the agent to park in idle mode.
    GoIdle(IdleDescriptor),
}

/// Connect once and run the duplex channel until it ends. Returns how long
/// the channel stayed connected alongside why it ended, so the supervisor
/// can tell a flaky handshake from a connection that settled and later
/// dropped.
pub async fn run(
    config: Arc<SessionConfig>,
    status_tx: watch::Sender<Status>,
) -> Result<(SessionExit, Duration), SessionError> {
    status::set(&status_tx, Status::Connecting);

    let mut request = config.relay_url().into_client_request()?;
    request.headers_mut().insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {}", config.api_key))?,
    );
    request
        .headers_mut()
        .insert(USER_AGENT, HeaderValue::from_str(&config.user_agent)?);

    let (ws_stream, _response) = connect_async(request).await?;
    info!(hostname = %config.hostname, "tunnel channel established");
    let connected_at = tokio::time::Instant::now();

    let (write, mut read) = ws_stream.split();

    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<Frame>();
    let writer = tokio::spawn(writer_task(write, outbound_rx));

    let http_client = Arc::new(
        reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?,
    );
    let (completions_tx, mut completions_rx) = mpsc::unbounded_channel::<RequestId>();
    let mut registry = Registry::new();

    // Stay `Connecting` until the channel has held up past the settle
    // delay; a drop before then never surfaces as `Connected` at all, the
    // same way it never resets the backoff streak.
    let mut settled = false;
    let settle_delay = tokio::time::sleep(SETTLE_DELAY);
    tokio::pin!(settle_delay);

    let exit = loop {
        tokio::select! {
            _ = &mut settle_delay, if !settled => {
                settled = true;
                status::set(&status_tx, Status::Connected);
            }
            Some(request_id) = completions_rx.recv() => {
                registry.remove(&request_id);
            }
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        let Some(frame) = Frame::decode(&data) else { continue };
                        match registry.route(frame) {
                            Routed::New { frame, inbox } => {
                                dispatcher::spawn(
                                    frame,
                                    inbox,
                                    config.clone(),
                                    http_client.clone(),
                                    outbound_tx.clone(),
                                    completions_tx.clone(),
                                );
                            }
                            Routed::Forwarded | Routed::Dropped => {}
                            Routed::Idle(frame) => {
                                match serde_json::from_slice::<IdleDescriptor>(&frame.payload) {
                                    Ok(descriptor) => break SessionExit::GoIdle(descriptor),
                                    Err(err) => {
                                        warn!(error = %err, "malformed go-idle frame, ignoring");
                                    }
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        debug!(?frame, "relay closed the channel");
                        break SessionExit::Disconnected;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(error = %err, "websocket read error");
                        break SessionExit::Disconnected;
                    }
                    None => break SessionExit::Disconnected,
                }
            }
        }
    };

    drop(outbound_tx);
    let _ = writer.await;
    status::set(&status_tx, Status::Disconnected);
    Ok((exit, connected_at.elapsed()))
}

/// The only task allowed to write to the socket: serializes outbound
/// frames and the keepalive ping onto a single sink.
async fn writer_task(
    mut write: futures_util::stream::SplitSink<
        tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
        Message,
    >,
    mut outbound_rx: mpsc::UnboundedReceiver<Frame>,
) {
    let mut ping = tokio::time::interval(Duration::from_secs(constants::WS_PING_INTERVAL_SECONDS));
    ping.tick().await;

    loop {
        tokio::select! {
            _ = ping.tick() => {
                if write.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
            frame = outbound_rx.recv() => {
                match frame {
                    Some(frame) => {
                        let Ok(bytes) = frame.encode() else { continue };
                        if write.send(Message::Binary(bytes.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }
    let _ = write.close().await;
}
