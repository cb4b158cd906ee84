//! Per-group websocket lifecycle: dial, subscribe, demultiplex, heartbeat.
//!
//! Each group is served by one spawned task. A dial registers a new
//! generation on the group and supersedes whatever socket came before it, so
//! reconnects are re-entrant without listener bookkeeping. The task releases
//! every registry lock before touching the wire or user handlers, and handles
//! one frame at a time so event order within a socket is preserved.

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{client_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::channel::Channel;
use crate::error::{Error, Result};
use crate::events::parse_frame;
use crate::limiter::DialLimiter;
use crate::registry::{GroupRegistry, GroupStatus, HeartbeatTick, SocketHandle};

const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const HEARTBEAT_MIN_MS: u64 = 15_000;
const HEARTBEAT_MAX_MS: u64 = 25_000;

/// Uniformly-random ping cadence so a fleet of sockets never beats in sync.
fn heartbeat_period() -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(HEARTBEAT_MIN_MS..=HEARTBEAT_MAX_MS))
}

/// Registers a dial on the group and spawns its socket task. A dial request
/// for a group the registry no longer knows is reported through `on_error`;
/// the reaper retries on its next tick.
pub(crate) async fn spawn<C: Channel>(
    registry: Arc<GroupRegistry>,
    channel: Arc<C>,
    limiter: Arc<dyn DialLimiter>,
    url: String,
    group_id: u64,
) {
    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
    match registry.begin_dial(group_id, SocketHandle::new(shutdown_tx)).await {
        Ok(Some(generation)) => {
            counter!("clob_stream_dials_total", "channel" => channel.name()).increment(1);
            tokio::spawn(run(
                registry,
                channel,
                limiter,
                url,
                group_id,
                generation,
                shutdown_rx,
            ));
        }
        Ok(None) => {
            debug!(group_id, "group drained, scheduled for cleanup instead of dial");
        }
        Err(err) => {
            warn!(group_id, %err, "dial request for unknown group");
            channel.on_error(err).await;
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run<C: Channel>(
    registry: Arc<GroupRegistry>,
    channel: Arc<C>,
    limiter: Arc<dyn DialLimiter>,
    url: String,
    group_id: u64,
    generation: u64,
    mut shutdown_rx: mpsc::Receiver<()>,
) {
    // Wait for a dial slot; a shutdown during the wait wins.
    tokio::select! {
        _ = shutdown_rx.recv() => return,
        _ = limiter.acquire() => {}
    }

    let stream = match dial(&url).await {
        Ok(stream) => stream,
        Err(err) => {
            warn!(group_id, channel = channel.name(), %err, "dial failed");
            counter!("clob_stream_errors_total", "channel" => channel.name()).increment(1);
            registry.set_status(group_id, generation, GroupStatus::Dead).await;
            channel.on_error(err).await;
            return;
        }
    };
    let (mut write, mut read) = stream.split();

    // Subscribe once on open, re-checking that the group still wants a
    // socket. `None` covers both a drained group and a superseding dial.
    let Some(keys) = registry.subscribe_keys(group_id, generation).await else {
        let _ = write.send(Message::Close(None)).await;
        return;
    };
    let payload = match channel.subscribe_payload(&keys) {
        Ok(payload) => payload,
        Err(err) => {
            registry.set_status(group_id, generation, GroupStatus::Dead).await;
            channel.on_error(err).await;
            return;
        }
    };
    if let Err(err) = write.send(Message::Text(payload)).await {
        registry.set_status(group_id, generation, GroupStatus::Dead).await;
        channel.on_error(err.into()).await;
        return;
    }

    registry.set_status(group_id, generation, GroupStatus::Alive).await;
    gauge!("clob_stream_connections_active", "channel" => channel.name()).increment(1.0);
    info!(
        group_id,
        channel = channel.name(),
        keys = keys.len(),
        "websocket subscribed"
    );
    channel.on_open(group_id, keys).await;

    let mut heartbeat = Box::pin(tokio::time::sleep(heartbeat_period()));
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                let _ = write
                    .send(Message::Close(Some(CloseFrame {
                        code: CloseCode::Normal,
                        reason: "shutdown".into(),
                    })))
                    .await;
                break;
            }

            _ = &mut heartbeat => {
                match registry.heartbeat_check(group_id, generation).await {
                    HeartbeatTick::Gone => break,
                    HeartbeatTick::Cleanup => {
                        debug!(group_id, "group drained, closing socket");
                        let _ = write
                            .send(Message::Close(Some(CloseFrame {
                                code: CloseCode::Normal,
                                reason: "unsubscribed".into(),
                            })))
                            .await;
                        break;
                    }
                    HeartbeatTick::Send => {
                        if let Err(err) = write.send(Message::Ping(Vec::new())).await {
                            registry.set_status(group_id, generation, GroupStatus::Dead).await;
                            channel.on_error(err.into()).await;
                            break;
                        }
                    }
                }
                heartbeat = Box::pin(tokio::time::sleep(heartbeat_period()));
            }

            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    counter!("clob_stream_messages_received_total", "channel" => channel.name())
                        .increment(1);
                    handle_frame(&registry, channel.as_ref(), group_id, generation, &text).await;
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = write.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Pong(_))) => {
                    // Liveness only; nothing to do.
                }
                Some(Ok(Message::Close(frame))) => {
                    registry.set_status(group_id, generation, GroupStatus::Dead).await;
                    let (code, reason) = match frame {
                        Some(frame) => (Some(u16::from(frame.code)), frame.reason.into_owned()),
                        None => (None, String::new()),
                    };
                    info!(group_id, channel = channel.name(), ?code, "websocket closed");
                    channel.on_close(group_id, code, reason).await;
                    break;
                }
                Some(Ok(_)) => {
                    // Binary and raw frames never appear on this feed.
                }
                Some(Err(err)) => {
                    registry.set_status(group_id, generation, GroupStatus::Dead).await;
                    counter!("clob_stream_errors_total", "channel" => channel.name()).increment(1);
                    warn!(group_id, channel = channel.name(), %err, "websocket error");
                    channel.on_error(err.into()).await;
                    break;
                }
                None => {
                    registry.set_status(group_id, generation, GroupStatus::Dead).await;
                    info!(group_id, channel = channel.name(), "websocket stream ended");
                    channel.on_close(group_id, None, "stream ended".to_string()).await;
                    break;
                }
            }
        }
    }
    gauge!("clob_stream_connections_active", "channel" => channel.name()).decrement(1.0);
}

async fn handle_frame<C: Channel>(
    registry: &GroupRegistry,
    channel: &C,
    group_id: u64,
    generation: u64,
    text: &str,
) {
    let values = match parse_frame(text) {
        Ok(values) => values,
        Err(err) => {
            counter!("clob_stream_parse_errors_total", "channel" => channel.name()).increment(1);
            channel.on_error(err).await;
            return;
        }
    };
    // Receive-time view of the key set. A missing group means it was just
    // removed (or this socket superseded) and the frame is dropped.
    let Some(keys) = registry.current_keys(group_id, generation).await else {
        return;
    };
    channel.handle_events(group_id, &keys, values).await;
}

/// Open a TCP + (optionally TLS) websocket connection. DNS results are tried
/// IPv4 first; each TCP attempt gets its own timeout.
async fn dial(url: &str) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>> {
    let parsed = Url::parse(url)?;
    let host = parsed
        .host_str()
        .ok_or_else(|| Error::Dial(format!("no host in {url}")))?;
    let secure = parsed.scheme() == "wss";
    let port = parsed.port().unwrap_or(if secure { 443 } else { 80 });
    let addr_str = format!("{host}:{port}");

    let addrs: Vec<SocketAddr> = addr_str
        .to_socket_addrs()
        .map_err(|e| Error::Dial(format!("DNS resolution failed for {addr_str}: {e}")))?
        .collect();
    let mut sorted: Vec<SocketAddr> = addrs.iter().filter(|a| a.is_ipv4()).copied().collect();
    sorted.extend(addrs.iter().filter(|a| a.is_ipv6()).copied());

    let mut tcp = None;
    for addr in &sorted {
        match tokio::time::timeout(TCP_CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                debug!(%addr, "TCP connected");
                tcp = Some(stream);
                break;
            }
            Ok(Err(e)) => debug!(%addr, error = %e, "TCP connect failed"),
            Err(_) => debug!(%addr, "TCP connect timed out"),
        }
    }
    let tcp = tcp.ok_or_else(|| Error::Dial(format!("all connection attempts to {addr_str} failed")))?;

    let connector = if secure {
        Connector::Rustls(tls_config()?)
    } else {
        Connector::Plain
    };
    let (stream, response) = client_async_tls_with_config(url, tcp, None, Some(connector)).await?;
    debug!(status = ?response.status(), "websocket handshake complete");
    Ok(stream)
}

fn tls_config() -> Result<Arc<rustls::ClientConfig>> {
    let mut roots = rustls::RootCertStore::empty();
    for cert in rustls_native_certs::load_native_certs().certs {
        let _ = roots.add(cert);
    }
    let config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| Error::Dial(format!("TLS config error: {e}")))?
    .with_root_certificates(roots)
    .with_no_client_auth();
    Ok(Arc::new(config))
}
