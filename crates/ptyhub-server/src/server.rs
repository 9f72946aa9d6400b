//! HTTP listener: gateway WebSocket, session list endpoint and loopback proxy.
//!
//! One hyper HTTP/1.1 server handles everything. Requests under `/p/<port>`
//! go to the proxy regardless of method; `GET /ws` upgrades into the
//! transport gateway; `GET /api/sessions` returns the session list as JSON.

use crate::config::ServerConfig;
use crate::http::{json_response, text_response, HttpBody};
use crate::hub::HubHandle;
use crate::proxy::{resolve_route, ProxyForwarder, ProxyPolicyEnforcer};
use crate::transport::{run_connection, websocket, GatewaySettings};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use ptyhub_core::{HubError, HubResult, WireFormat};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Path of the gateway WebSocket endpoint.
pub const GATEWAY_PATH: &str = "/ws";

/// Path of the JSON session list.
pub const SESSIONS_PATH: &str = "/api/sessions";

/// How long `/api/sessions` waits for the hub.
const LIST_TIMEOUT: Duration = Duration::from_secs(5);

/// State shared by every HTTP connection.
struct ServerState {
    hub: HubHandle,
    proxy: ProxyForwarder,
    gateway: GatewaySettings,
    shutdown_tx: broadcast::Sender<()>,
}

/// A bound ptyhub HTTP server.
pub struct HubServer {
    listener: TcpListener,
    state: Arc<ServerState>,
}

impl HubServer {
    /// Bind the listener. The proxy's self-loop guard uses the port actually bound.
    pub async fn bind(config: &ServerConfig, addr: SocketAddr, hub: HubHandle) -> HubResult<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HubError::Transport(format!("bind {addr} failed: {e}")))?;
        let local_addr = listener.local_addr()?;

        let policy = Arc::new(ProxyPolicyEnforcer::new(
            config.proxy_policy(local_addr.port()),
        ));
        let (shutdown_tx, _) = broadcast::channel(1);
        let state = Arc::new(ServerState {
            hub,
            proxy: ProxyForwarder::new(policy, config.proxy_timeout),
            gateway: config.gateway_settings(),
            shutdown_tx,
        });

        info!(addr = %local_addr, "HTTP listener started");
        Ok(Self { listener, state })
    }

    #[cfg(test)]
    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr().unwrap()
    }

    /// Sender that stops the accept loop and closes every gateway connection.
    pub fn shutdown_sender(&self) -> broadcast::Sender<()> {
        self.state.shutdown_tx.clone()
    }

    /// Accept connections until a shutdown signal is sent.
    pub async fn run(self) -> HubResult<()> {
        let mut shutdown_rx = self.state.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, remote) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    tokio::spawn(serve_connection(stream, remote, self.state.clone()));
                }
                _ = shutdown_rx.recv() => {
                    info!("HTTP listener shutting down");
                    break;
                }
            }
        }
        Ok(())
    }
}

async fn serve_connection(stream: TcpStream, remote: SocketAddr, state: Arc<ServerState>) {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let state = state.clone();
        async move { handle_request(req, remote, state).await }
    });
    if let Err(e) = http1::Builder::new()
        .serve_connection(io, service)
        .with_upgrades()
        .await
    {
        if !e.is_incomplete_message() {
            debug!(remote = %remote, error = %e, "HTTP connection ended with error");
        }
    }
}

async fn handle_request(
    req: Request<Incoming>,
    remote: SocketAddr,
    state: Arc<ServerState>,
) -> HubResult<Response<HttpBody>> {
    let route = resolve_route(
        req.uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/"),
    );
    if let Some(route) = route {
        return state.proxy.forward(req, route).await;
    }

    match (req.method(), req.uri().path()) {
        (&Method::GET, GATEWAY_PATH) => accept_gateway(req, remote, &state),
        (&Method::GET, SESSIONS_PATH) => Ok(list_sessions(&state).await),
        _ => Ok(text_response(StatusCode::NOT_FOUND, "not found")),
    }
}

/// Answer the WebSocket handshake and hand the upgraded socket to the gateway.
fn accept_gateway(
    mut req: Request<Incoming>,
    remote: SocketAddr,
    state: &ServerState,
) -> HubResult<Response<HttpBody>> {
    let Some(accept) = websocket::accept_key(req.headers()) else {
        return Ok(text_response(
            StatusCode::BAD_REQUEST,
            "expected a WebSocket upgrade",
        ));
    };
    let format = WireFormat::from_query(req.uri().query());
    let on_upgrade = hyper::upgrade::on(&mut req);
    let hub = state.hub.clone();
    let settings = state.gateway.clone();
    let shutdown_rx = state.shutdown_tx.subscribe();

    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => {
                let ws = websocket::from_upgraded(upgraded).await;
                info!(remote = %remote, format = format.as_query_value(), "client connected");
                if let Err(e) = run_connection(ws, format, hub, settings, shutdown_rx).await {
                    warn!(remote = %remote, error = %e, "gateway connection failed");
                }
                info!(remote = %remote, "client disconnected");
            }
            Err(e) => warn!(remote = %remote, error = %e, "WebSocket upgrade failed"),
        }
    });

    websocket::switching_protocols(&accept)
}

async fn list_sessions(state: &ServerState) -> Response<HttpBody> {
    let body = tokio::time::timeout(LIST_TIMEOUT, state.hub.list_sessions())
        .await
        .unwrap_or(Err(HubError::Timeout))
        .and_then(|sessions| serde_json::to_vec(&sessions).map_err(HubError::from));
    match body {
        Ok(body) => json_response(body),
        Err(e) => {
            warn!(error = %e, "session list unavailable");
            text_response(StatusCode::SERVICE_UNAVAILABLE, "hub unavailable")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::Hub;
    use crate::session::pty::fake::{FakeControl, FakeSpawner};
    use futures_util::{SinkExt, StreamExt};
    use ptyhub_core::{
        cbor_decode, ClientEvent, InputPayload, ServerEvent, SessionSummary,
    };
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::oneshot;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    struct TestServer {
        addr: SocketAddr,
        control: FakeControl,
        first: SessionSummary,
        hub: HubHandle,
        shutdown_tx: broadcast::Sender<()>,
    }

    async fn start(config: ServerConfig) -> TestServer {
        let (spawner, control) = FakeSpawner::new();
        let (mut hub, handle) = Hub::new(config.registry_settings(), Box::new(spawner));
        let first = hub.bootstrap().unwrap();
        tokio::spawn(hub.run());

        let server = HubServer::bind(&config, "127.0.0.1:0".parse().unwrap(), handle.clone())
            .await
            .unwrap();
        let addr = server.local_addr();
        let shutdown_tx = server.shutdown_sender();
        tokio::spawn(server.run());
        TestServer {
            addr,
            control,
            first,
            hub: handle,
            shutdown_tx,
        }
    }

    fn test_config() -> ServerConfig {
        ServerConfig {
            proxy_timeout: Duration::from_secs(2),
            ..ServerConfig::default()
        }
    }

    fn http() -> reqwest::Client {
        reqwest::Client::builder().no_proxy().build().unwrap()
    }

    async fn ws_connect(addr: SocketAddr, query: &str) -> Client {
        let (ws, _) = connect_async(format!("ws://{addr}{GATEWAY_PATH}{query}"))
            .await
            .unwrap();
        ws
    }

    async fn next_event(ws: &mut Client) -> ServerEvent {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(2), ws.next())
                .await
                .expect("timed out waiting for server event")
                .expect("socket closed")
                .unwrap();
            match message {
                Message::Text(text) => return serde_json::from_str(&text).unwrap(),
                Message::Binary(data) => return cbor_decode(&data).unwrap(),
                _ => continue,
            }
        }
    }

    async fn send_event(ws: &mut Client, event: &ClientEvent) {
        let text = serde_json::to_string(event).unwrap();
        ws.send(Message::Text(text.into())).await.unwrap();
    }

    /// Free loopback port with nothing listening on it.
    async fn unused_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn gateway_json_flow() {
        let server = start(test_config()).await;
        let mut ws = ws_connect(server.addr, "").await;

        assert_eq!(
            next_event(&mut ws).await,
            ServerEvent::SessionsList(vec![server.first.clone()])
        );
        send_event(&mut ws, &ClientEvent::SwitchSession(server.first.id.clone())).await;
        assert_eq!(next_event(&mut ws).await, ServerEvent::History(Vec::new()));

        server.control.output(&server.first.id, b"prompt$ ").await;
        assert_eq!(
            next_event(&mut ws).await,
            ServerEvent::Output(b"prompt$ ".to_vec())
        );
    }

    #[tokio::test]
    async fn gateway_cbor_format_uses_binary_frames() {
        let server = start(test_config()).await;
        let mut ws = ws_connect(server.addr, "?format=cbor").await;
        let message = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        match message {
            Message::Binary(data) => {
                let event: ServerEvent = cbor_decode(&data).unwrap();
                assert!(matches!(event, ServerEvent::SessionsList(_)));
            }
            other => panic!("expected binary frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn undecodable_frames_are_ignored() {
        let server = start(test_config()).await;
        let mut ws = ws_connect(server.addr, "").await;
        next_event(&mut ws).await;
        ws.send(Message::Text("not json".into())).await.unwrap();
        send_event(&mut ws, &ClientEvent::ListSessions).await;
        assert!(matches!(
            next_event(&mut ws).await,
            ServerEvent::SessionsList(_)
        ));
    }

    #[tokio::test]
    async fn input_over_budget_is_dropped() {
        let config = ServerConfig {
            input_burst: 8,
            input_rate: 1,
            ..test_config()
        };
        let server = start(config).await;
        let id = server.first.id.clone();
        let mut ws = ws_connect(server.addr, "").await;
        next_event(&mut ws).await;

        for chunk in [&b"abcdef"[..], &b"ghijkl"[..]] {
            let input = ClientEvent::Input(InputPayload {
                session_id: id.clone(),
                data: chunk.to_vec(),
            });
            send_event(&mut ws, &input).await;
        }
        // The reply orders after both inputs on the hub queue.
        send_event(&mut ws, &ClientEvent::ListSessions).await;
        next_event(&mut ws).await;

        assert_eq!(server.control.writes(), vec![(id, b"abcdef".to_vec())]);
    }

    #[tokio::test]
    async fn disconnect_keeps_session_and_history() {
        let server = start(test_config()).await;
        let id = server.first.id.clone();

        let mut first = ws_connect(server.addr, "").await;
        next_event(&mut first).await;
        send_event(&mut first, &ClientEvent::SwitchSession(id.clone())).await;
        next_event(&mut first).await;
        server.control.output(&id, b"ls\r\nCargo.toml\r\n").await;
        next_event(&mut first).await;
        first.close(None).await.unwrap();
        drop(first);

        let mut second = ws_connect(server.addr, "").await;
        assert_eq!(
            next_event(&mut second).await,
            ServerEvent::SessionsList(vec![server.first.clone()])
        );
        send_event(&mut second, &ClientEvent::SwitchSession(id)).await;
        assert_eq!(
            next_event(&mut second).await,
            ServerEvent::History(b"ls\r\nCargo.toml\r\n".to_vec())
        );
        assert!(server.control.killed().is_empty());
    }

    #[tokio::test]
    async fn closing_reaches_every_client() {
        let server = start(test_config()).await;
        let mut a = ws_connect(server.addr, "").await;
        let mut b = ws_connect(server.addr, "").await;
        next_event(&mut a).await;
        next_event(&mut b).await;

        send_event(&mut a, &ClientEvent::CloseSession(server.first.id.clone())).await;
        let closed = ServerEvent::SessionClosed(server.first.clone());
        assert_eq!(next_event(&mut a).await, closed);
        assert_eq!(next_event(&mut b).await, closed);

        send_event(&mut b, &ClientEvent::ListSessions).await;
        assert_eq!(next_event(&mut b).await, ServerEvent::SessionsList(vec![]));
    }

    #[tokio::test]
    async fn sessions_endpoint_lists_json() {
        let server = start(test_config()).await;
        let response = http()
            .get(format!("http://{}{SESSIONS_PATH}", server.addr))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        let body = response.text().await.unwrap();
        let sessions: Vec<SessionSummary> = serde_json::from_str(&body).unwrap();
        assert_eq!(sessions, vec![server.first.clone()]);
        assert!(body.contains("displayName"));
    }

    #[tokio::test]
    async fn unknown_path_is_404() {
        let server = start(test_config()).await;
        let response = http()
            .get(format!("http://{}/nope", server.addr))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);

        let response = http()
            .get(format!("http://{}{GATEWAY_PATH}", server.addr))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn proxy_unreachable_target_is_502() {
        let server = start(test_config()).await;
        let port = unused_port().await;
        let started = std::time::Instant::now();
        let response = http()
            .get(format!("http://{}/p/{port}/foo", server.addr))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::BAD_GATEWAY);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(response.text().await.unwrap().contains("proxy error"));
    }

    /// Backend that accepts connections and never answers.
    async fn silent_backend() -> u16 {
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = backend.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = backend.accept().await {
                held.push(stream);
            }
        });
        port
    }

    fn short_timeout_config() -> ServerConfig {
        ServerConfig {
            proxy_timeout: Duration::from_secs(1),
            ..ServerConfig::default()
        }
    }

    #[tokio::test]
    async fn proxy_silent_target_times_out_with_502() {
        let server = start(short_timeout_config()).await;
        let port = silent_backend().await;
        let started = std::time::Instant::now();
        let response = http()
            .get(format!("http://{}/p/{port}/slow", server.addr))
            .send()
            .await
            .unwrap();
        let elapsed = started.elapsed();
        assert_eq!(response.status(), reqwest::StatusCode::BAD_GATEWAY);
        assert!(elapsed >= Duration::from_millis(900), "answered after {elapsed:?}");
        assert!(elapsed < Duration::from_secs(4), "answered after {elapsed:?}");
        assert!(response.text().await.unwrap().contains("did not respond"));
    }

    #[tokio::test]
    async fn proxy_upgrade_to_silent_target_drops_socket() {
        let server = start(short_timeout_config()).await;
        let port = silent_backend().await;
        let started = std::time::Instant::now();
        let result = tokio::time::timeout(
            Duration::from_secs(4),
            connect_async(format!("ws://{}/p/{port}/", server.addr)),
        )
        .await
        .expect("client socket was not dropped");
        assert!(result.is_err());
        assert!(started.elapsed() >= Duration::from_millis(900));
    }

    #[tokio::test]
    async fn proxy_to_own_port_is_refused() {
        let server = start(test_config()).await;
        let response = http()
            .get(format!("http://{}/p/{}/ws", server.addr, server.addr.port()))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::LOOP_DETECTED);
    }

    #[tokio::test]
    async fn proxy_strips_prefix_and_keeps_query() {
        let server = start(test_config()).await;
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = backend.local_addr().unwrap().port();
        let (seen_tx, seen_rx) = oneshot::channel::<String>();

        tokio::spawn(async move {
            let (mut stream, _) = backend.accept().await.unwrap();
            let mut head = Vec::new();
            let mut buf = [0u8; 1024];
            while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = stream.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                head.extend_from_slice(&buf[..n]);
            }
            let head = String::from_utf8_lossy(&head).to_string();
            let _ = seen_tx.send(head);
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok")
                .await
                .unwrap();
        });

        let response = http()
            .get(format!("http://{}/p/{port}/hello/world?x=1&y=2", server.addr))
            .header("x-probe", "kept")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert_eq!(response.text().await.unwrap(), "ok");

        let head = seen_rx.await.unwrap();
        assert!(
            head.starts_with("GET /hello/world?x=1&y=2 HTTP/1.1\r\n"),
            "backend saw {head:?}"
        );
        assert!(head.to_ascii_lowercase().contains("x-probe: kept"));
    }

    #[tokio::test]
    async fn proxy_bridges_websocket_upgrade() {
        let server = start(test_config()).await;
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = backend.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (stream, _) = backend.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            while let Some(Ok(message)) = ws.next().await {
                if message.is_text() || message.is_binary() {
                    ws.send(message).await.unwrap();
                }
            }
        });

        let (mut ws, response) = connect_async(format!("ws://{}/p/{port}/echo", server.addr))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);
        ws.send(Message::Text("through the tunnel".into())).await.unwrap();
        let echoed = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(echoed, Message::Text("through the tunnel".into()));
    }

    #[tokio::test]
    async fn proxy_upgrade_to_unreachable_target_drops_socket() {
        let server = start(test_config()).await;
        let port = unused_port().await;
        let result = connect_async(format!("ws://{}/p/{port}/", server.addr)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn shutdown_closes_gateway_connections() {
        let server = start(test_config()).await;
        let mut ws = ws_connect(server.addr, "").await;
        next_event(&mut ws).await;

        server.shutdown_tx.send(()).unwrap();
        let end = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match ws.next().await {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => continue,
                }
            }
        })
        .await;
        assert!(end.is_ok());
        server.hub.shutdown().await.unwrap();
    }
}
