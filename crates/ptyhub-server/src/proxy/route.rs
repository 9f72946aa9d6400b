//! Path-based routing for the loopback proxy.

/// Path prefix that marks a proxied request.
pub const PROXY_PREFIX: &str = "/p/";

/// Target of a proxied request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRoute {
    /// Loopback port to forward to.
    pub port: u16,
    /// Path and query sent upstream, with the `/p/<port>` prefix stripped.
    pub rewritten_path: String,
}

/// Map `/p/<port>/<rest>?<query>` to a loopback target.
///
/// Returns `None` when the path is not under the proxy prefix or the port
/// segment is not a non-zero u16.
pub fn resolve_route(path_and_query: &str) -> Option<ProxyRoute> {
    let (path, query) = match path_and_query.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (path_and_query, None),
    };
    let rest = path.strip_prefix(PROXY_PREFIX)?;
    let (port, tail) = rest.split_once('/').unwrap_or((rest, ""));

    if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let port: u16 = port.parse().ok()?;
    if port == 0 {
        return None;
    }

    let mut rewritten = String::with_capacity(tail.len() + 2 + query.map_or(0, str::len));
    rewritten.push('/');
    rewritten.push_str(tail);
    if let Some(query) = query {
        rewritten.push('?');
        rewritten.push_str(query);
    }
    Some(ProxyRoute {
        port,
        rewritten_path: rewritten,
    })
}
