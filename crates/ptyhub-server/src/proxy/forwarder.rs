//! Forwarding of `/p/<port>/...` requests to `localhost:<port>`.
//!
//! Plain requests are relayed as a single HTTP/1.1 exchange with the
//! response body streamed back. Upgrade requests (WebSocket and friends)
//! are forwarded with their headers; once the backend answers 101 both
//! connections are taken over and spliced with `copy_bidirectional`.

use super::policy::{ConnectionGuard, ProxyPolicyEnforcer};
use super::route::ProxyRoute;
use crate::http::{empty_body, is_upgrade_request, text_response, HttpBody};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::client::conn::http1::SendRequest;
use hyper::{Request, Response, StatusCode, Uri, Version};
use hyper_util::rt::TokioIo;
use ptyhub_core::{HubError, HubResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Forwards proxied requests under a shared policy.
pub struct ProxyForwarder {
    policy: Arc<ProxyPolicyEnforcer>,
    /// Deadline covering connect plus response headers.
    timeout: Duration,
}

impl ProxyForwarder {
    pub fn new(policy: Arc<ProxyPolicyEnforcer>, timeout: Duration) -> Self {
        Self { policy, timeout }
    }

    /// Forward one request.
    ///
    /// Policy refusals and unreachable targets become error responses. For
    /// an upgrade request whose target is unreachable the error is returned
    /// instead, so hyper drops the client socket without answering.
    pub async fn forward(
        &self,
        req: Request<Incoming>,
        route: ProxyRoute,
    ) -> HubResult<Response<HttpBody>> {
        let guard = match self.policy.try_acquire(route.port) {
            Ok(guard) => guard,
            Err(rejection) => {
                warn!(port = route.port, reason = %rejection, "proxy request refused");
                return Ok(text_response(rejection.status(), &rejection.to_string()));
            }
        };
        debug!(
            port = route.port,
            in_flight = self.policy.active_connections(),
            "proxy exchange admitted"
        );

        if is_upgrade_request(req.headers()) {
            self.forward_upgrade(req, route, guard).await
        } else {
            self.forward_plain(req, route, guard).await
        }
    }

    async fn forward_plain(
        &self,
        req: Request<Incoming>,
        route: ProxyRoute,
        guard: ConnectionGuard,
    ) -> HubResult<Response<HttpBody>> {
        let method = req.method().clone();
        match self.exchange(req, &route).await {
            Ok(response) => {
                debug!(
                    port = route.port,
                    method = %method,
                    path = %route.rewritten_path,
                    status = response.status().as_u16(),
                    "proxied"
                );
                let (parts, body) = response.into_parts();
                // The exchange stays counted until the body has been streamed out.
                let body = body
                    .map_frame(move |frame| {
                        let _held = &guard;
                        frame
                    })
                    .boxed();
                Ok(Response::from_parts(parts, body))
            }
            Err(e) => {
                warn!(port = route.port, error = %e, "proxy target unreachable");
                Ok(text_response(
                    StatusCode::BAD_GATEWAY,
                    &format!("proxy error: {e}"),
                ))
            }
        }
    }

    async fn forward_upgrade(
        &self,
        mut req: Request<Incoming>,
        route: ProxyRoute,
        guard: ConnectionGuard,
    ) -> HubResult<Response<HttpBody>> {
        let port = route.port;
        let client_upgrade = hyper::upgrade::on(&mut req);

        let mut response = match self.exchange(req, &route).await {
            Ok(response) => response,
            Err(e) => {
                warn!(port, error = %e, "upgrade target unreachable, dropping client socket");
                return Err(e);
            }
        };

        if response.status() != StatusCode::SWITCHING_PROTOCOLS {
            debug!(port, status = response.status().as_u16(), "backend declined upgrade");
            let (parts, body) = response.into_parts();
            let body = body
                .map_frame(move |frame| {
                    let _held = &guard;
                    frame
                })
                .boxed();
            return Ok(Response::from_parts(parts, body));
        }

        let backend_upgrade = hyper::upgrade::on(&mut response);
        tokio::spawn(async move {
            let _guard = guard;
            match tokio::try_join!(client_upgrade, backend_upgrade) {
                Ok((client, backend)) => {
                    info!(port, "upgraded connection bridged");
                    let mut client = TokioIo::new(client);
                    let mut backend = TokioIo::new(backend);
                    match tokio::io::copy_bidirectional(&mut client, &mut backend).await {
                        Ok((to_backend, to_client)) => {
                            debug!(port, to_backend, to_client, "upgraded connection closed")
                        }
                        Err(e) => debug!(port, error = %e, "upgraded connection ended"),
                    }
                }
                Err(e) => warn!(port, error = %e, "upgrade handshake failed"),
            }
        });

        let (parts, _body) = response.into_parts();
        Ok(Response::from_parts(parts, empty_body()))
    }

    /// Connect to the target and send the rewritten request, all under one deadline.
    async fn exchange(
        &self,
        req: Request<Incoming>,
        route: &ProxyRoute,
    ) -> HubResult<Response<Incoming>> {
        let port = route.port;
        let outbound = rewrite_request(req, route)?;
        let attempt = async {
            let mut sender = connect(port).await?;
            sender
                .send_request(outbound)
                .await
                .map_err(|e| HubError::ProxyTargetUnreachable(format!("localhost:{port}: {e}")))
        };
        tokio::time::timeout(self.timeout, attempt)
            .await
            .map_err(|_| {
                HubError::ProxyTargetUnreachable(format!(
                    "localhost:{port} did not respond within {}s",
                    self.timeout.as_secs_f64()
                ))
            })?
    }
}

/// Open an HTTP/1.1 client connection to `localhost:<port>`.
async fn connect(port: u16) -> HubResult<SendRequest<Incoming>> {
    let stream = TcpStream::connect(("localhost", port))
        .await
        .map_err(|e| HubError::ProxyTargetUnreachable(format!("localhost:{port}: {e}")))?;
    let (sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| HubError::ProxyTargetUnreachable(format!("localhost:{port}: {e}")))?;
    tokio::spawn(async move {
        if let Err(e) = connection.with_upgrades().await {
            debug!(port, error = %e, "upstream connection ended");
        }
    });
    Ok(sender)
}

/// Point the request at the stripped path, keeping method, headers and body.
fn rewrite_request(req: Request<Incoming>, route: &ProxyRoute) -> HubResult<Request<Incoming>> {
    let (mut parts, body) = req.into_parts();
    parts.uri = route
        .rewritten_path
        .parse::<Uri>()
        .map_err(|e| HubError::InvalidMessage(format!("bad proxy path: {e}")))?;
    parts.version = Version::HTTP_11;
    Ok(Request::from_parts(parts, body))
}
