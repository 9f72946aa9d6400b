//! `ptyhub attach <session>`: join a session from the local terminal.
//!
//! Enters raw mode and pipes the session's history and live output to
//! stdout, while keystrokes and terminal resizes go back to the server.
//! Ctrl+] detaches and leaves the session running.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use crossterm::event::{self, Event};
use ptyhub_core::{ClientEvent, InputPayload, ResizePayload, ServerEvent, SessionSummary};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::client::{resolve_session, HubClient};
use crate::terminal as term;

/// Poll interval of the key reader, so it notices a detach from the other side.
const INPUT_POLL: Duration = Duration::from_millis(100);

pub async fn run(server: &str, query: &str) -> Result<()> {
    let mut client = HubClient::connect(server).await?;
    let sessions = client.sessions().await?;
    let target = resolve_session(&sessions, query)?.clone();
    attach(client, target, true).await
}

/// Why the attach loop ended.
#[derive(Debug, PartialEq, Eq)]
enum Detach {
    User,
    SessionClosed,
    ConnectionClosed,
}

/// Attach the terminal to `session`. `switch` sends `switch-session` first;
/// `new` arrives already switched.
pub async fn attach(mut client: HubClient, session: SessionSummary, switch: bool) -> Result<()> {
    if switch {
        client
            .send(&ClientEvent::SwitchSession(session.id.clone()))
            .await?;
    }

    let (cols, rows) = term::get_terminal_size();
    client
        .send(&ClientEvent::Resize(ResizePayload {
            session_id: session.id.clone(),
            cols,
            rows,
        }))
        .await?;
    info!(session_id = %session.id, cols, rows, "attached");

    let guard = term::RawModeGuard::enter().context("failed to enter raw terminal mode")?;

    let (tx_input, mut rx_input) = mpsc::channel::<Vec<u8>>(64);
    let (tx_resize, mut rx_resize) = mpsc::channel::<(u16, u16)>(8);
    let (tx_quit, mut rx_quit) = mpsc::channel::<()>(1);
    let stop = Arc::new(AtomicBool::new(false));

    let reader_stop = stop.clone();
    let input_handle = tokio::task::spawn_blocking(move || {
        while !reader_stop.load(Ordering::Relaxed) {
            match event::poll(INPUT_POLL) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    warn!("crossterm poll error: {e}");
                    break;
                }
            }
            match event::read() {
                Ok(Event::Key(key_event)) => {
                    if term::is_detach_key(&key_event) {
                        let _ = tx_quit.blocking_send(());
                        break;
                    }
                    if let Some(bytes) = term::key_event_to_bytes(&key_event) {
                        if tx_input.blocking_send(bytes).is_err() {
                            break;
                        }
                    }
                }
                Ok(Event::Paste(text)) => {
                    if tx_input.blocking_send(text.into_bytes()).is_err() {
                        break;
                    }
                }
                Ok(Event::Resize(new_cols, new_rows)) => {
                    let _ = tx_resize.blocking_send((new_cols, new_rows));
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("crossterm event error: {e}");
                    break;
                }
            }
        }
    });

    let mut stdout = std::io::stdout();
    let outcome: Result<Detach> = loop {
        tokio::select! {
            incoming = client.recv() => match incoming {
                Ok(Some(event)) => match apply_event(&session, event, &mut stdout) {
                    Ok(Some(reason)) => break Ok(reason),
                    Ok(None) => {}
                    Err(e) => break Err(e),
                },
                Ok(None) => break Ok(Detach::ConnectionClosed),
                Err(e) => break Err(e),
            },
            Some(bytes) = rx_input.recv() => {
                let event = ClientEvent::Input(InputPayload {
                    session_id: session.id.clone(),
                    data: bytes,
                });
                if let Err(e) = client.send(&event).await {
                    break Err(e);
                }
            }
            Some((c, r)) = rx_resize.recv() => {
                debug!(cols = c, rows = r, "terminal resized");
                let event = ClientEvent::Resize(ResizePayload {
                    session_id: session.id.clone(),
                    cols: c,
                    rows: r,
                });
                if let Err(e) = client.send(&event).await {
                    break Err(e);
                }
            }
            _ = rx_quit.recv() => {
                info!(session_id = %session.id, "detach requested");
                break Ok(Detach::User);
            }
        }
    };

    stop.store(true, Ordering::Relaxed);
    let _ = input_handle.await;
    drop(guard);
    client.close().await;

    match outcome? {
        Detach::User => eprintln!("Detached from {}.", session.display_name),
        Detach::SessionClosed => eprintln!("{} closed.", session.display_name),
        Detach::ConnectionClosed => eprintln!("Connection to server closed."),
    }
    Ok(())
}

/// Render one server event. Returns a reason when the attach should end.
fn apply_event<W: Write>(
    session: &SessionSummary,
    event: ServerEvent,
    out: &mut W,
) -> Result<Option<Detach>> {
    match event {
        ServerEvent::History(data) | ServerEvent::Output(data) => {
            out.write_all(&data)?;
            out.flush()?;
        }
        ServerEvent::SessionClosed(closed) if closed.id == session.id => {
            return Ok(Some(Detach::SessionClosed));
        }
        ServerEvent::Error(e) => warn!(message = %e.message, "server error"),
        other => debug!(event = other.name(), "ignored"),
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ptyhub_core::ErrorPayload;

    fn session(id: &str) -> SessionSummary {
        SessionSummary {
            id: id.into(),
            display_name: "Session 1".into(),
        }
    }

    #[test]
    fn history_and_output_are_written_in_order() {
        let attached = session("abc");
        let mut out = Vec::new();
        assert_eq!(
            apply_event(&attached, ServerEvent::History(b"old ".to_vec()), &mut out).unwrap(),
            None
        );
        assert_eq!(
            apply_event(&attached, ServerEvent::Output(b"new".to_vec()), &mut out).unwrap(),
            None
        );
        assert_eq!(out, b"old new");
    }

    #[test]
    fn closing_the_attached_session_ends_the_attach() {
        let attached = session("abc");
        let mut out = Vec::new();
        let reason = apply_event(
            &attached,
            ServerEvent::SessionClosed(session("abc")),
            &mut out,
        )
        .unwrap();
        assert_eq!(reason, Some(Detach::SessionClosed));
    }

    #[test]
    fn other_sessions_closing_is_ignored() {
        let attached = session("abc");
        let mut out = Vec::new();
        let reason = apply_event(
            &attached,
            ServerEvent::SessionClosed(session("def")),
            &mut out,
        )
        .unwrap();
        assert_eq!(reason, None);
        let reason = apply_event(
            &attached,
            ServerEvent::Error(ErrorPayload {
                message: "nope".into(),
            }),
            &mut out,
        )
        .unwrap();
        assert_eq!(reason, None);
        assert!(out.is_empty());
    }
}
