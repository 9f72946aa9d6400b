//! Cloneable front door to the hub task.

use super::router::ConnId;
use ptyhub_core::{HubError, HubResult, ServerEvent, SessionSummary};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Requests processed by the hub task, one at a time.
#[derive(Debug)]
pub enum HubCommand {
    Connect {
        conn_id: ConnId,
        events: mpsc::Sender<ServerEvent>,
    },
    Disconnect {
        conn_id: ConnId,
    },
    SwitchSession {
        conn_id: ConnId,
        session_id: String,
    },
    /// `conn_id` is the requester, which gets attached on success.
    CreateSession {
        conn_id: Option<ConnId>,
    },
    CloseSession {
        session_id: String,
    },
    Input {
        session_id: String,
        data: Vec<u8>,
    },
    Resize {
        session_id: String,
        cols: u16,
        rows: u16,
    },
    SendSessionsList {
        conn_id: ConnId,
    },
    ListSessions {
        reply: oneshot::Sender<Vec<SessionSummary>>,
    },
    Shutdown,
}

/// Handle used by transports and the HTTP layer to talk to the hub.
#[derive(Clone)]
pub struct HubHandle {
    tx: mpsc::Sender<HubCommand>,
    next_conn_id: Arc<AtomicU64>,
}

impl HubHandle {
    pub(super) fn new(tx: mpsc::Sender<HubCommand>) -> Self {
        Self {
            tx,
            next_conn_id: Arc::new(AtomicU64::new(1)),
        }
    }

    async fn send(&self, command: HubCommand) -> HubResult<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| HubError::Channel("hub stopped".into()))
    }

    /// Register a connection. It receives a `sessions-list` and starts detached.
    pub async fn connect(&self, events: mpsc::Sender<ServerEvent>) -> HubResult<ConnId> {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        self.send(HubCommand::Connect { conn_id, events }).await?;
        Ok(conn_id)
    }

    /// Forget a connection. Its session keeps running.
    pub async fn disconnect(&self, conn_id: ConnId) -> HubResult<()> {
        self.send(HubCommand::Disconnect { conn_id }).await
    }

    pub async fn switch_session(&self, conn_id: ConnId, session_id: String) -> HubResult<()> {
        self.send(HubCommand::SwitchSession {
            conn_id,
            session_id,
        })
        .await
    }

    pub async fn create_session(&self, conn_id: Option<ConnId>) -> HubResult<()> {
        self.send(HubCommand::CreateSession { conn_id }).await
    }

    pub async fn close_session(&self, session_id: String) -> HubResult<()> {
        self.send(HubCommand::CloseSession { session_id }).await
    }

    pub async fn input(&self, session_id: String, data: Vec<u8>) -> HubResult<()> {
        self.send(HubCommand::Input { session_id, data }).await
    }

    pub async fn resize(&self, session_id: String, cols: u16, rows: u16) -> HubResult<()> {
        self.send(HubCommand::Resize {
            session_id,
            cols,
            rows,
        })
        .await
    }

    /// Push a fresh `sessions-list` to one connection.
    pub async fn send_sessions_list(&self, conn_id: ConnId) -> HubResult<()> {
        self.send(HubCommand::SendSessionsList { conn_id }).await
    }

    /// Snapshot of live sessions in creation order.
    pub async fn list_sessions(&self) -> HubResult<Vec<SessionSummary>> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::ListSessions { reply }).await?;
        rx.await
            .map_err(|_| HubError::Channel("hub dropped list reply".into()))
    }

    /// Stop the hub and kill every shell.
    pub async fn shutdown(&self) -> HubResult<()> {
        self.send(HubCommand::Shutdown).await
    }
}
