//! `ptyhub close <session>`: terminate a session's shell.

use std::time::Duration;

use anyhow::{bail, Result};
use ptyhub_core::{ClientEvent, ServerEvent};
use tracing::debug;

use crate::client::{resolve_session, HubClient};

/// How long to wait for the server to confirm the closure.
const CONFIRM_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn run(server: &str, query: &str) -> Result<()> {
    let mut client = HubClient::connect(server).await?;
    let sessions = client.sessions().await?;
    let target = resolve_session(&sessions, query)?.clone();

    client
        .send(&ClientEvent::CloseSession(target.id.clone()))
        .await?;

    let confirmed = tokio::time::timeout(CONFIRM_TIMEOUT, async {
        loop {
            match client.recv().await? {
                Some(ServerEvent::SessionClosed(closed)) if closed.id == target.id => {
                    return Ok(true)
                }
                Some(other) => debug!(event = other.name(), "waiting for closure"),
                None => return Ok::<_, anyhow::Error>(false),
            }
        }
    })
    .await;
    client.close().await;

    match confirmed {
        Ok(Ok(true)) => {
            println!("Closed {} ({})", target.display_name, target.id);
            Ok(())
        }
        Ok(Ok(false)) => bail!("server closed the connection before confirming"),
        Ok(Err(e)) => Err(e),
        Err(_) => bail!("timed out waiting for {} to close", target.display_name),
    }
}
