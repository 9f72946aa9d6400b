//! The hub task: sole owner of the session registry and broadcast router.
//!
//! Client requests ([`HubCommand`]) and PTY events arrive on two bounded
//! channels and are handled one at a time, so a history snapshot and the
//! room join that follows it can never interleave with output for the same
//! session.

pub mod handle;
pub mod router;

pub use handle::{HubCommand, HubHandle};
pub use router::{BroadcastRouter, ConnId};

use crate::session::{PtyEvent, PtySpawner, RegistrySettings, SessionRegistry};
use ptyhub_core::{ErrorPayload, HubError, HubResult, ServerEvent, SessionSummary};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Depth of the client command queue.
const COMMAND_QUEUE: usize = 256;

/// Depth of the PTY event queue shared by all sessions.
const PTY_EVENT_QUEUE: usize = 256;

pub struct Hub {
    registry: SessionRegistry,
    router: BroadcastRouter,
    commands: mpsc::Receiver<HubCommand>,
    pty_events: mpsc::Receiver<PtyEvent>,
}

impl Hub {
    pub fn new(settings: RegistrySettings, spawner: Box<dyn PtySpawner>) -> (Self, HubHandle) {
        let (command_tx, commands) = mpsc::channel(COMMAND_QUEUE);
        let (event_tx, pty_events) = mpsc::channel(PTY_EVENT_QUEUE);
        let hub = Self {
            registry: SessionRegistry::new(settings, spawner, event_tx),
            router: BroadcastRouter::new(),
            commands,
            pty_events,
        };
        (hub, HubHandle::new(command_tx))
    }

    /// Create the first session before any client connects.
    pub fn bootstrap(&mut self) -> HubResult<SessionSummary> {
        self.registry.create()
    }

    /// Process commands and PTY events until shutdown.
    pub async fn run(mut self) {
        info!(sessions = self.registry.len(), "hub running");
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(HubCommand::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                Some(event) = self.pty_events.recv() => self.handle_pty_event(event),
            }
        }
        info!(sessions = self.registry.len(), "hub shutting down");
        self.registry.kill_all();
    }

    fn handle_command(&mut self, command: HubCommand) {
        match command {
            HubCommand::Connect { conn_id, events } => {
                self.router.add(conn_id, events);
                debug!(
                    conn_id,
                    connections = self.router.connection_count(),
                    "connection registered"
                );
                self.router
                    .send_to(conn_id, ServerEvent::SessionsList(self.registry.list()));
            }
            HubCommand::Disconnect { conn_id } => {
                let room = self.router.remove(conn_id);
                debug!(conn_id, room = ?room, "connection removed");
            }
            HubCommand::SwitchSession {
                conn_id,
                session_id,
            } => self.switch_session(conn_id, &session_id),
            HubCommand::CreateSession { conn_id } => self.create_session(conn_id),
            HubCommand::CloseSession { session_id } => {
                match self.registry.close(&session_id) {
                    Ok(()) => {}
                    Err(HubError::SessionNotFound(_)) => {
                        debug!(session_id = %session_id, "close ignored for unknown session")
                    }
                    Err(e) => warn!(session_id = %session_id, error = %e, "failed to kill shell"),
                }
            }
            HubCommand::Input { session_id, data } => {
                if let Err(e) = self.registry.write(&session_id, data) {
                    debug!(session_id = %session_id, error = %e, "input ignored");
                }
            }
            HubCommand::Resize {
                session_id,
                cols,
                rows,
            } => {
                if let Err(e) = self.registry.resize(&session_id, cols, rows) {
                    debug!(session_id = %session_id, error = %e, "resize ignored");
                }
            }
            HubCommand::SendSessionsList { conn_id } => {
                self.router
                    .send_to(conn_id, ServerEvent::SessionsList(self.registry.list()));
            }
            HubCommand::ListSessions { reply } => {
                let _ = reply.send(self.registry.list());
            }
            // Handled by the run loop.
            HubCommand::Shutdown => {}
        }
    }

    fn handle_pty_event(&mut self, event: PtyEvent) {
        match event {
            PtyEvent::Output { session_id, data } => {
                if !self.registry.append_output(&session_id, &data) {
                    return;
                }
                self.router
                    .broadcast_room(&session_id, &ServerEvent::Output(data));
            }
            PtyEvent::Exited { session_id, code } => {
                let Some(summary) = self.registry.remove_exited(&session_id) else {
                    return;
                };
                let detached = self.router.clear_room(&session_id);
                info!(
                    session_id = %session_id,
                    name = %summary.display_name,
                    code = ?code,
                    detached = detached.len(),
                    "session closed"
                );
                self.router.broadcast_all(&ServerEvent::SessionClosed(summary));
            }
        }
    }

    /// Join the session's room and replay its history, in that order.
    fn switch_session(&mut self, conn_id: ConnId, session_id: &str) {
        let history = match self.registry.snapshot(session_id) {
            Ok(history) => history,
            Err(_) => {
                debug!(conn_id, session_id, "switch to unknown session ignored");
                return;
            }
        };
        if !self.router.join(conn_id, session_id) {
            return;
        }
        debug!(conn_id, session_id, bytes = history.len(), "switched session");
        self.router.send_to(conn_id, ServerEvent::History(history));
    }

    fn create_session(&mut self, requester: Option<ConnId>) {
        match self.registry.create() {
            Ok(summary) => {
                self.router
                    .broadcast_all(&ServerEvent::SessionCreated(summary.clone()));
                if let Some(conn_id) = requester {
                    self.switch_session(conn_id, &summary.id);
                }
            }
            Err(e) => {
                warn!(error = %e, "session creation failed");
                if let Some(conn_id) = requester {
                    self.router.send_to(
                        conn_id,
                        ServerEvent::Error(ErrorPayload {
                            message: e.to_string(),
                        }),
                    );
                }
            }
        }
    }
}
