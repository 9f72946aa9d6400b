//! WebSocket plumbing on top of hyper's upgrade mechanism.
//!
//! The handshake is answered by the HTTP service; the upgraded connection
//! is then wrapped in a tokio-tungstenite stream. Frames are surfaced as
//! [`Frame`] so the gateway stays independent of tungstenite types.

use crate::http::{empty_body, is_upgrade_request, HttpBody};
use futures_util::{SinkExt, StreamExt};
use hyper::header::{HeaderMap, HeaderValue, CONNECTION, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, UPGRADE};
use hyper::upgrade::Upgraded;
use hyper::{Response, StatusCode};
use hyper_util::rt::TokioIo;
use ptyhub_core::{Frame, HubError, HubResult};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::warn;

/// WebSocket over an upgraded hyper connection.
pub type HubSocket = WebSocketStream<TokioIo<Upgraded>>;

/// Maximum inbound frame size (1 MiB). Larger frames are discarded.
const MAX_WS_FRAME_SIZE: usize = 1_048_576;

/// `Sec-WebSocket-Accept` value for a valid WebSocket upgrade request.
pub fn accept_key(headers: &HeaderMap) -> Option<String> {
    if !is_upgrade_request(headers) {
        return None;
    }
    let is_websocket = headers
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    if !is_websocket {
        return None;
    }
    let key = headers.get(SEC_WEBSOCKET_KEY)?;
    Some(derive_accept_key(key.as_bytes()))
}

/// The 101 response completing the server side of the handshake.
pub fn switching_protocols(accept: &str) -> HubResult<Response<HttpBody>> {
    let accept = HeaderValue::from_str(accept)
        .map_err(|e| HubError::Transport(format!("bad accept key: {e}")))?;
    let mut response = Response::new(empty_body());
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    let headers = response.headers_mut();
    headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
    headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
    headers.insert(SEC_WEBSOCKET_ACCEPT, accept);
    Ok(response)
}

/// Wrap an upgraded connection as a server-side WebSocket.
pub async fn from_upgraded(upgraded: Upgraded) -> HubSocket {
    WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await
}

/// Send one frame.
pub async fn ws_send<S>(ws: &mut WebSocketStream<S>, frame: Frame) -> HubResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let message = match frame {
        Frame::Text(text) => Message::Text(text.into()),
        Frame::Binary(data) => Message::Binary(data.into()),
    };
    ws.send(message)
        .await
        .map_err(|e| HubError::Transport(format!("WS send failed: {e}")))
}

/// Receive the next data frame.
///
/// Returns `None` once the peer closes. Pings are answered in place.
pub async fn ws_recv<S>(ws: &mut WebSocketStream<S>) -> HubResult<Option<Frame>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let frame = match ws.next().await {
            Some(Ok(Message::Text(text))) => Frame::Text(text.to_string()),
            Some(Ok(Message::Binary(data))) => Frame::Binary(data.to_vec()),
            Some(Ok(Message::Close(_))) => return Ok(None),
            Some(Ok(Message::Ping(payload))) => {
                let _ = ws.send(Message::Pong(payload)).await;
                continue;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                return Err(HubError::Transport(format!("WS recv failed: {e}")));
            }
            None => return Ok(None),
        };
        let size = match &frame {
            Frame::Text(text) => text.len(),
            Frame::Binary(data) => data.len(),
        };
        if size > MAX_WS_FRAME_SIZE {
            warn!(size, max = MAX_WS_FRAME_SIZE, "discarding oversized WS frame");
            continue;
        }
        return Ok(Some(frame));
    }
}
