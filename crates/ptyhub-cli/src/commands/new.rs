//! `ptyhub new`: create a session and attach to it.

use anyhow::{bail, Result};
use ptyhub_core::{ClientEvent, ServerEvent};
use tracing::{debug, info};

use super::attach;
use crate::client::HubClient;

pub async fn run(server: &str) -> Result<()> {
    let mut client = HubClient::connect(server).await?;
    client.send(&ClientEvent::CreateSession).await?;

    // The server switches us to the new session right after announcing it.
    let created = loop {
        match client.recv().await? {
            Some(ServerEvent::SessionCreated(summary)) => break summary,
            Some(ServerEvent::Error(e)) => bail!("could not create session: {}", e.message),
            Some(other) => debug!(event = other.name(), "waiting for session-created"),
            None => bail!("server closed the connection"),
        }
    };
    info!(session_id = %created.id, name = %created.display_name, "session created");

    attach::attach(client, created, false).await
}
