//! Proxy policy: refuses self-loops and caps concurrent exchanges.
//!
//! - [`ProxyPolicy`] holds the static rules.
//! - [`ProxyPolicyEnforcer`] adds an atomic in-flight counter shared by
//!   every proxied request, including bridged upgrades.

use hyper::StatusCode;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct ProxyPolicy {
    /// Port the server itself listens on. Proxying to it would recurse.
    pub own_port: u16,
    /// Maximum concurrent proxied exchanges.
    pub max_connections: usize,
}

/// Why a proxied request was refused before any upstream connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyRejection {
    SelfLoop { port: u16 },
    AtCapacity { current: usize, max: usize },
}

impl ProxyRejection {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyRejection::SelfLoop { .. } => StatusCode::LOOP_DETECTED,
            ProxyRejection::AtCapacity { .. } => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl fmt::Display for ProxyRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyRejection::SelfLoop { port } => {
                write!(f, "refusing to proxy to own port {port}")
            }
            ProxyRejection::AtCapacity { current, max } => {
                write!(f, "proxy connection limit reached ({current}/{max})")
            }
        }
    }
}

/// Runtime policy enforcer with atomic connection tracking.
pub struct ProxyPolicyEnforcer {
    policy: ProxyPolicy,
    active: Arc<AtomicUsize>,
}

impl ProxyPolicyEnforcer {
    pub fn new(policy: ProxyPolicy) -> Self {
        Self {
            policy,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Admit a request for `port`, counting it as in flight until the guard drops.
    ///
    /// The capacity check and the increment are one atomic step.
    pub fn try_acquire(&self, port: u16) -> Result<ConnectionGuard, ProxyRejection> {
        if port == self.policy.own_port {
            return Err(ProxyRejection::SelfLoop { port });
        }
        let max = self.policy.max_connections;
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < max).then_some(current + 1)
            })
            .map_err(|current| ProxyRejection::AtCapacity { current, max })?;
        Ok(ConnectionGuard {
            counter: self.active.clone(),
        })
    }

    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }
}

/// Decrements the in-flight count on drop. `Send`, so it can ride in spawned tasks.
pub struct ConnectionGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enforcer(max_connections: usize) -> ProxyPolicyEnforcer {
        ProxyPolicyEnforcer::new(ProxyPolicy {
            own_port: 4000,
            max_connections,
        })
    }

    #[test]
    fn self_loop_refused() {
        let enforcer = enforcer(10);
        let rejection = enforcer.try_acquire(4000).err().unwrap();
        assert_eq!(rejection, ProxyRejection::SelfLoop { port: 4000 });
        assert_eq!(rejection.status(), StatusCode::LOOP_DETECTED);
        assert_eq!(enforcer.active_connections(), 0);
        assert!(enforcer.try_acquire(3000).is_ok());
    }

    #[test]
    fn capacity_enforced_and_released() {
        let enforcer = enforcer(2);
        let g1 = enforcer.try_acquire(3000).unwrap();
        let _g2 = enforcer.try_acquire(3000).unwrap();
        let rejection = enforcer.try_acquire(3000).err().unwrap();
        assert_eq!(rejection, ProxyRejection::AtCapacity { current: 2, max: 2 });
        assert_eq!(rejection.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(enforcer.active_connections(), 2);
        drop(g1);
        assert_eq!(enforcer.active_connections(), 1);
        assert!(enforcer.try_acquire(3000).is_ok());
    }

    #[test]
    fn concurrent_admission_never_exceeds_cap() {
        let enforcer = Arc::new(enforcer(3));
        let barrier = Arc::new(std::sync::Barrier::new(16));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let enforcer = enforcer.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    enforcer.try_acquire(3000).ok()
                })
            })
            .collect();
        let guards: Vec<ConnectionGuard> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(guards.len(), 3);
        assert_eq!(enforcer.active_connections(), 3);
        drop(guards);
        assert_eq!(enforcer.active_connections(), 0);
    }
}
