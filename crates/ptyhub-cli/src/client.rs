//! WebSocket connection to the ptyhub gateway.
//!
//! Speaks the CBOR flavour of the event protocol and resolves the session
//! names users type on the command line.

use anyhow::{anyhow, bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use ptyhub_core::{
    decode_frame, encode_frame, ClientEvent, Frame, ServerEvent, SessionSummary, WireFormat,
    PROTOCOL_VERSION,
};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

/// An open gateway connection.
pub struct HubClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl HubClient {
    /// Connect to the gateway at `server`, asking for CBOR frames.
    pub async fn connect(server: &str) -> Result<Self> {
        let url = gateway_url(server);
        debug!(url = %url, protocol = PROTOCOL_VERSION, "connecting");
        let (ws, _response) = connect_async(url.as_str())
            .await
            .with_context(|| format!("failed to connect to {server}"))?;
        Ok(Self { ws })
    }

    /// Send one client event.
    pub async fn send(&mut self, event: &ClientEvent) -> Result<()> {
        let message = match encode_frame(WireFormat::Cbor, event)? {
            Frame::Binary(data) => Message::Binary(data),
            Frame::Text(text) => Message::Text(text),
        };
        self.ws
            .send(message)
            .await
            .context("failed to send to server")?;
        Ok(())
    }

    /// Wait for the next server event. `None` once the server closes the connection.
    ///
    /// Cancel-safe, so it can sit in a `select!` loop.
    pub async fn recv(&mut self) -> Result<Option<ServerEvent>> {
        loop {
            let frame = match self.ws.next().await {
                Some(Ok(Message::Binary(data))) => Frame::Binary(data),
                Some(Ok(Message::Text(text))) => Frame::Text(text),
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(anyhow!("connection error: {e}")),
            };
            match decode_frame::<ServerEvent>(&frame) {
                Ok(event) => return Ok(Some(event)),
                Err(e) => debug!(error = %e, "ignoring undecodable frame"),
            }
        }
    }

    /// Wait for the next `sessions-list`, skipping anything else.
    pub async fn sessions(&mut self) -> Result<Vec<SessionSummary>> {
        loop {
            match self.recv().await? {
                Some(ServerEvent::SessionsList(sessions)) => return Ok(sessions),
                Some(other) => debug!(event = other.name(), "skipping while waiting for list"),
                None => bail!("server closed the connection"),
            }
        }
    }

    /// Close the connection politely.
    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}

/// Append `format=cbor` to the gateway URL.
pub fn gateway_url(server: &str) -> String {
    let separator = if server.contains('?') { '&' } else { '?' };
    format!("{server}{separator}format=cbor")
}

/// Find the session a user meant.
///
/// Tries, in order: exact id, display name (case-insensitive), a bare
/// number `k` meaning "Session k", then a unique id prefix.
pub fn resolve_session<'a>(
    sessions: &'a [SessionSummary],
    query: &str,
) -> Result<&'a SessionSummary> {
    let query = query.trim();
    if query.is_empty() {
        bail!("empty session name");
    }

    if let Some(found) = sessions.iter().find(|s| s.id == query) {
        return Ok(found);
    }
    if let Some(found) = sessions
        .iter()
        .find(|s| s.display_name.eq_ignore_ascii_case(query))
    {
        return Ok(found);
    }
    if let Ok(k) = query.parse::<u32>() {
        let name = format!("Session {k}");
        if let Some(found) = sessions.iter().find(|s| s.display_name == name) {
            return Ok(found);
        }
    }

    let mut matches = sessions.iter().filter(|s| s.id.starts_with(query));
    match (matches.next(), matches.next()) {
        (Some(found), None) => Ok(found),
        (Some(_), Some(_)) => bail!("session '{query}' is ambiguous"),
        (None, _) => bail!("no session matches '{query}'"),
    }
}
