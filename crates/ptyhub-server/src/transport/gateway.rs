//! Per-connection event loop of the transport gateway.
//!
//! Bridges one WebSocket to the hub: decoded client events become hub
//! commands, and events queued for the connection by the hub are encoded
//! in the connection's wire format and written out.

use super::websocket::{ws_recv, ws_send};
use crate::hub::{ConnId, HubHandle};
use crate::rate_limit::TokenBucket;
use ptyhub_core::{decode_frame, encode_frame, ClientEvent, HubResult, WireFormat};
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};

/// Per-connection limits.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    /// Input token bucket capacity in bytes.
    pub input_burst: u32,
    /// Input token refill in bytes per second.
    pub input_rate: u32,
    /// Outbound event queue depth before the connection is dropped.
    pub outbound_queue: usize,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            input_burst: 32 * 1024,
            input_rate: 16 * 1024,
            outbound_queue: 1024,
        }
    }
}

/// Serve one client until it disconnects, the hub drops it, or the server shuts down.
///
/// The connection is always unregistered from the hub on the way out; its
/// session, if any, keeps running.
pub async fn run_connection<S>(
    mut ws: WebSocketStream<S>,
    format: WireFormat,
    hub: HubHandle,
    settings: GatewaySettings,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> HubResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (events_tx, mut events_rx) = mpsc::channel(settings.outbound_queue);
    let conn_id = hub.connect(events_tx).await?;
    let mut bucket = TokenBucket::new(settings.input_burst, settings.input_rate);
    debug!(conn_id, format = format.as_query_value(), "gateway connection registered");

    let result = loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                debug!(conn_id, "shutdown signal received, closing WebSocket");
                let _ = ws.close(None).await;
                break Ok(());
            }

            event = events_rx.recv() => match event {
                Some(event) => {
                    let frame = match encode_frame(format, &event) {
                        Ok(frame) => frame,
                        Err(e) => {
                            warn!(conn_id, event = event.name(), error = %e, "failed to encode event");
                            continue;
                        }
                    };
                    if let Err(e) = ws_send(&mut ws, frame).await {
                        break Err(e);
                    }
                }
                // The hub released our queue: we fell behind.
                None => {
                    warn!(conn_id, "dropped by hub, closing WebSocket");
                    let _ = ws.close(None).await;
                    break Ok(());
                }
            },

            incoming = ws_recv(&mut ws) => match incoming {
                Ok(Some(frame)) => match decode_frame::<ClientEvent>(&frame) {
                    Ok(event) => {
                        if let Err(e) = dispatch(&hub, conn_id, &mut bucket, event).await {
                            break Err(e);
                        }
                    }
                    Err(e) => debug!(conn_id, error = %e, "ignoring undecodable frame"),
                },
                Ok(None) => {
                    debug!(conn_id, "WebSocket closed by peer");
                    break Ok(());
                }
                Err(e) => break Err(e),
            },
        }
    };

    let _ = hub.disconnect(conn_id).await;
    result
}

/// Turn one client event into a hub command.
async fn dispatch(
    hub: &HubHandle,
    conn_id: ConnId,
    bucket: &mut TokenBucket,
    event: ClientEvent,
) -> HubResult<()> {
    match event {
        ClientEvent::SwitchSession(session_id) => hub.switch_session(conn_id, session_id).await,
        ClientEvent::CreateSession => hub.create_session(Some(conn_id)).await,
        ClientEvent::CloseSession(session_id) => hub.close_session(session_id).await,
        ClientEvent::Input(payload) => {
            if bucket.take(payload.data.len()) {
                hub.input(payload.session_id, payload.data).await
            } else {
                debug!(
                    conn_id,
                    session_id = %payload.session_id,
                    bytes = payload.data.len(),
                    available = bucket.available_at(Instant::now()) as u64,
                    "input dropped by rate limit"
                );
                Ok(())
            }
        }
        ClientEvent::Resize(payload) => {
            hub.resize(payload.session_id, payload.cols, payload.rows)
                .await
        }
        ClientEvent::ListSessions => hub.send_sessions_list(conn_id).await,
    }
}
