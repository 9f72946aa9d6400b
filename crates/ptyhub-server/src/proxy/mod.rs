//! Path-based reverse proxy to loopback ports.

pub mod forwarder;
pub mod policy;
pub mod route;

pub use forwarder::ProxyForwarder;
pub use policy::{ProxyPolicy, ProxyPolicyEnforcer};
pub use route::resolve_route;
