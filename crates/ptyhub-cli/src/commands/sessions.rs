//! `ptyhub sessions`: print the live session table.

use anyhow::Result;
use ptyhub_core::SessionSummary;

use crate::client::HubClient;

pub async fn run(server: &str) -> Result<()> {
    let mut client = HubClient::connect(server).await?;
    let sessions = client.sessions().await?;
    client.close().await;

    print!("{}", format_table(&sessions));
    Ok(())
}

fn format_table(sessions: &[SessionSummary]) -> String {
    if sessions.is_empty() {
        return "No active sessions.\n".to_string();
    }
    let width = sessions
        .iter()
        .map(|s| s.display_name.len())
        .max()
        .unwrap_or(0)
        .max("NAME".len());
    let mut out = format!("{:<width$}  ID\n", "NAME");
    for session in sessions {
        out.push_str(&format!("{:<width$}  {}\n", session.display_name, session.id));
    }
    out
}
