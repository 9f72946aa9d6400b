//! Session registry: creation, lookup, naming and teardown.
//!
//! Sessions live until their shell exits. `close` only asks the process to
//! die; the entry is removed when the exit event comes back through
//! [`SessionRegistry::remove_exited`]. The registry is owned by the hub task
//! and is never shared, so it needs no locking.

use super::pty::{PtyEventSender, PtyProcess, PtySpawner, SpawnRequest};
use super::ring_buffer::RingBuffer;
use ptyhub_core::{HubError, HubResult, SessionSummary};
use std::collections::{BTreeSet, HashMap};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Lifecycle of a session entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Shell running, accepting input.
    Active,
    /// Kill requested, waiting for the exit event.
    Closing,
}

/// One shell session.
pub struct Session {
    /// Opaque unique id (32 hex chars).
    pub id: String,
    /// Number used in the display name; reused once freed.
    pub index: u32,
    /// "Session k".
    pub display_name: String,
    pty: Box<dyn PtyProcess>,
    /// Scrollback replayed on switch.
    pub history: RingBuffer,
    pub state: SessionState,
    pub created_at: Instant,
    /// Last requested terminal size (cols, rows).
    pub size: (u16, u16),
}

impl Session {
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            display_name: self.display_name.clone(),
        }
    }
}

/// Limits and defaults applied to new sessions.
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub max_sessions: usize,
    pub history_capacity: usize,
    pub cols: u16,
    pub rows: u16,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            max_sessions: 32,
            history_capacity: 512 * 1024,
            cols: 80,
            rows: 24,
        }
    }
}

/// All live sessions, in creation order.
pub struct SessionRegistry {
    sessions: HashMap<String, Session>,
    order: Vec<String>,
    spawner: Box<dyn PtySpawner>,
    events: PtyEventSender,
    settings: RegistrySettings,
}

impl SessionRegistry {
    pub fn new(
        settings: RegistrySettings,
        spawner: Box<dyn PtySpawner>,
        events: PtyEventSender,
    ) -> Self {
        Self {
            sessions: HashMap::new(),
            order: Vec::new(),
            spawner,
            events,
            settings,
        }
    }

    /// Spawn a shell and register it under a fresh id and the lowest free name.
    ///
    /// On failure nothing is registered.
    pub fn create(&mut self) -> HubResult<SessionSummary> {
        if self.sessions.len() >= self.settings.max_sessions {
            return Err(HubError::LimitReached(format!(
                "max sessions ({}) reached",
                self.settings.max_sessions
            )));
        }

        let id = self.unused_id();
        let index = self.lowest_free_index();
        let request = SpawnRequest {
            session_id: id.clone(),
            cols: self.settings.cols,
            rows: self.settings.rows,
        };
        let pty = self.spawner.spawn(&request, self.events.clone())?;

        let session = Session {
            id: id.clone(),
            index,
            display_name: format!("Session {index}"),
            pty,
            history: RingBuffer::new(self.settings.history_capacity),
            state: SessionState::Active,
            created_at: Instant::now(),
            size: (self.settings.cols, self.settings.rows),
        };
        let summary = session.summary();
        info!(session_id = %id, name = %summary.display_name, "session created");

        self.sessions.insert(id.clone(), session);
        self.order.push(id);
        Ok(summary)
    }

    pub fn get(&self, session_id: &str) -> HubResult<&Session> {
        self.sessions
            .get(session_id)
            .ok_or_else(|| HubError::SessionNotFound(session_id.to_string()))
    }

    fn get_mut(&mut self, session_id: &str) -> HubResult<&mut Session> {
        self.sessions
            .get_mut(session_id)
            .ok_or_else(|| HubError::SessionNotFound(session_id.to_string()))
    }

    #[cfg(test)]
    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    /// Summaries of all live sessions in creation order.
    pub fn list(&self) -> Vec<SessionSummary> {
        self.order
            .iter()
            .filter_map(|id| self.sessions.get(id))
            .map(Session::summary)
            .collect()
    }

    /// Ask a session's shell to terminate. Idempotent while the exit is pending.
    pub fn close(&mut self, session_id: &str) -> HubResult<()> {
        let session = self.get_mut(session_id)?;
        if session.state == SessionState::Closing {
            debug!(session_id, "close already requested");
            return Ok(());
        }
        info!(session_id, "closing session");
        session.pty.kill()?;
        session.state = SessionState::Closing;
        Ok(())
    }

    /// Forward keystrokes to a session's shell.
    pub fn write(&mut self, session_id: &str, data: Vec<u8>) -> HubResult<()> {
        let session = self.get_mut(session_id)?;
        if session.state == SessionState::Closing {
            return Ok(());
        }
        session.pty.write(data)
    }

    /// Resize a session's terminal. Zero dimensions are ignored.
    pub fn resize(&mut self, session_id: &str, cols: u16, rows: u16) -> HubResult<()> {
        if cols == 0 || rows == 0 {
            debug!(session_id, cols, rows, "ignoring degenerate resize");
            return Ok(());
        }
        let session = self.get_mut(session_id)?;
        session.pty.resize(cols, rows)?;
        session.size = (cols, rows);
        Ok(())
    }

    /// Record output in the session's history. Returns false for unknown sessions.
    pub fn append_output(&mut self, session_id: &str, data: &[u8]) -> bool {
        match self.sessions.get_mut(session_id) {
            Some(session) => {
                session.history.append(data);
                true
            }
            None => false,
        }
    }

    /// Copy of a session's buffered history.
    pub fn snapshot(&self, session_id: &str) -> HubResult<Vec<u8>> {
        let history = &self.get(session_id)?.history;
        debug!(
            session_id,
            buffered = history.len(),
            capacity = history.capacity(),
            "history snapshot"
        );
        Ok(history.snapshot())
    }

    /// Drop a session whose shell has exited. Returns `None` if it was already gone.
    pub fn remove_exited(&mut self, session_id: &str) -> Option<SessionSummary> {
        let session = self.sessions.remove(session_id)?;
        self.order.retain(|id| id != session_id);
        info!(
            session_id,
            name = %session.display_name,
            uptime_secs = session.created_at.elapsed().as_secs(),
            output_bytes = session.history.total_written(),
            "session removed"
        );
        Some(session.summary())
    }

    /// Kill every shell. Used on server shutdown.
    pub fn kill_all(&mut self) {
        for session in self.sessions.values_mut() {
            session.state = SessionState::Closing;
            if let Err(e) = session.pty.kill() {
                warn!(session_id = %session.id, error = %e, "failed to kill shell");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn lowest_free_index(&self) -> u32 {
        let used: BTreeSet<u32> = self.sessions.values().map(|s| s.index).collect();
        (1..).find(|k| !used.contains(k)).unwrap_or(1)
    }

    fn unused_id(&self) -> String {
        loop {
            let id = generate_session_id();
            if !self.sessions.contains_key(&id) {
                return id;
            }
        }
    }
}

/// Generate a random session ID (hex-encoded, 16 bytes = 32 hex chars).
fn generate_session_id() -> String {
    use rand::Rng;
    let bytes: [u8; 16] = rand::thread_rng().gen();
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::pty::fake::{FakeControl, FakeSpawner};
    use crate::session::pty::PtyEvent;
    use tokio::sync::mpsc;

    fn registry(max_sessions: usize) -> (SessionRegistry, FakeControl, mpsc::Receiver<PtyEvent>) {
        let (spawner, control) = FakeSpawner::new();
        let (tx, rx) = mpsc::channel(64);
        let settings = RegistrySettings {
            max_sessions,
            history_capacity: 16,
            ..RegistrySettings::default()
        };
        (SessionRegistry::new(settings, Box::new(spawner), tx), control, rx)
    }

    fn names(registry: &SessionRegistry) -> Vec<String> {
        registry.list().into_iter().map(|s| s.display_name).collect()
    }

    #[test]
    fn names_reuse_lowest_free_number() {
        let (mut reg, _control, _rx) = registry(8);
        let a = reg.create().unwrap();
        let b = reg.create().unwrap();
        let _c = reg.create().unwrap();
        assert_eq!(names(&reg), ["Session 1", "Session 2", "Session 3"]);

        reg.remove_exited(&b.id).unwrap();
        reg.remove_exited(&a.id).unwrap();
        let d = reg.create().unwrap();
        assert_eq!(d.display_name, "Session 1");
        let e = reg.create().unwrap();
        assert_eq!(e.display_name, "Session 2");
        assert_eq!(names(&reg), ["Session 3", "Session 1", "Session 2"]);
    }

    #[test]
    fn ids_are_unique_hex() {
        let (mut reg, _control, _rx) = registry(32);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..20 {
            let s = reg.create().unwrap();
            assert_eq!(s.id.len(), 32);
            assert!(s.id.chars().all(|c| c.is_ascii_hexdigit()));
            assert!(seen.insert(s.id));
        }
    }

    #[test]
    fn spawn_failure_registers_nothing() {
        let (mut reg, control, _rx) = registry(8);
        control.fail_next_spawn();
        assert!(matches!(reg.create(), Err(HubError::SpawnFailure(_))));
        assert!(reg.is_empty());
        assert_eq!(reg.create().unwrap().display_name, "Session 1");
    }

    #[test]
    fn limit_is_enforced() {
        let (mut reg, _control, _rx) = registry(2);
        reg.create().unwrap();
        reg.create().unwrap();
        assert!(matches!(reg.create(), Err(HubError::LimitReached(_))));
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn close_kills_once_and_keeps_entry() {
        let (mut reg, control, mut rx) = registry(8);
        let s = reg.create().unwrap();
        reg.close(&s.id).unwrap();
        reg.close(&s.id).unwrap();
        assert_eq!(control.killed(), vec![s.id.clone()]);
        assert_eq!(reg.get(&s.id).unwrap().state, SessionState::Closing);
        assert!(matches!(rx.try_recv(), Ok(PtyEvent::Exited { .. })));

        assert!(reg.remove_exited(&s.id).is_some());
        assert!(reg.remove_exited(&s.id).is_none());
        assert!(matches!(reg.close(&s.id), Err(HubError::SessionNotFound(_))));
    }

    #[test]
    fn failed_kill_can_be_retried() {
        let (mut reg, control, mut rx) = registry(8);
        let s = reg.create().unwrap();
        control.fail_next_kill();
        assert!(reg.close(&s.id).is_err());
        assert_eq!(reg.get(&s.id).unwrap().state, SessionState::Active);
        assert!(control.killed().is_empty());

        reg.close(&s.id).unwrap();
        assert_eq!(control.killed(), vec![s.id.clone()]);
        assert_eq!(reg.get(&s.id).unwrap().state, SessionState::Closing);
        assert!(matches!(rx.try_recv(), Ok(PtyEvent::Exited { .. })));
    }

    #[test]
    fn history_is_bounded_per_session() {
        let (mut reg, _control, _rx) = registry(8);
        let a = reg.create().unwrap();
        let b = reg.create().unwrap();
        assert!(reg.append_output(&a.id, b"0123456789abcdefXYZ"));
        assert!(reg.append_output(&b.id, b"other"));
        assert_eq!(reg.snapshot(&a.id).unwrap(), b"3456789abcdefXYZ");
        assert_eq!(reg.snapshot(&b.id).unwrap(), b"other");
        assert!(!reg.append_output("missing", b"x"));
    }

    #[test]
    fn resize_and_write_reach_process() {
        let (mut reg, control, _rx) = registry(8);
        let s = reg.create().unwrap();
        reg.resize(&s.id, 0, 10).unwrap();
        reg.resize(&s.id, 120, 40).unwrap();
        reg.write(&s.id, b"ls\r".to_vec()).unwrap();
        assert_eq!(control.resizes(), vec![(s.id.clone(), 120, 40)]);
        assert_eq!(control.writes(), vec![(s.id.clone(), b"ls\r".to_vec())]);
        assert_eq!(reg.get(&s.id).unwrap().size, (120, 40));
    }
}
