//! PTY process wrapper using portable-pty.
//!
//! A shell is spawned on the slave side of a fresh pseudo-terminal. Three
//! OS threads service it: a reader that turns master output into
//! [`PtyEvent::Output`], a writer fed through a channel so the hub never
//! blocks on a stalled shell, and a waiter that reports [`PtyEvent::Exited`].
//!
//! The hub only sees the [`PtySpawner`] / [`PtyProcess`] traits, so tests
//! can substitute a scripted fake.

use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use ptyhub_core::{HubError, HubResult};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::mpsc as std_mpsc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// How long the exit watcher waits for the reader to drain after the child exits.
const EXIT_DRAIN_GRACE: Duration = Duration::from_millis(250);

/// Read chunk size for PTY output.
const READ_CHUNK: usize = 8192;

/// Events emitted by a running PTY process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PtyEvent {
    /// Bytes produced by the shell, in production order.
    Output { session_id: String, data: Vec<u8> },
    /// The shell process exited.
    Exited { session_id: String, code: Option<u32> },
}

/// Channel on which PTY processes report output and exit.
pub type PtyEventSender = mpsc::Sender<PtyEvent>;

/// Parameters for spawning one session's shell.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub session_id: String,
    pub cols: u16,
    pub rows: u16,
}

/// A running shell bound to a pseudo-terminal.
pub trait PtyProcess: Send {
    /// Queue bytes for the shell's stdin.
    fn write(&mut self, data: Vec<u8>) -> HubResult<()>;
    /// Change the terminal size.
    fn resize(&mut self, cols: u16, rows: u16) -> HubResult<()>;
    /// Ask the process to terminate. Exit is reported asynchronously.
    fn kill(&mut self) -> HubResult<()>;
}

/// Creates PTY processes.
pub trait PtySpawner: Send + Sync {
    /// Spawn a shell. Output and exit are delivered on `events`.
    fn spawn(
        &self,
        request: &SpawnRequest,
        events: PtyEventSender,
    ) -> HubResult<Box<dyn PtyProcess>>;
}

/// Default shell for the host OS family.
///
/// Windows gets PowerShell; elsewhere `$SHELL` is honoured, falling back to bash.
pub fn default_shell() -> String {
    if cfg!(windows) {
        "powershell.exe".to_string()
    } else {
        std::env::var("SHELL")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| "bash".to_string())
    }
}

/// Spawns real shells through the platform PTY (Unix pty or Windows ConPTY).
pub struct NativePtySpawner {
    /// Shell command line, split on whitespace.
    shell: String,
    /// Working directory for new shells.
    cwd: Option<PathBuf>,
}

impl NativePtySpawner {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
            cwd: dirs::home_dir(),
        }
    }

    fn command(&self) -> HubResult<CommandBuilder> {
        let parts: Vec<&str> = self.shell.split_whitespace().collect();
        let Some((program, args)) = parts.split_first() else {
            return Err(HubError::SpawnFailure("empty shell command".into()));
        };
        let mut builder = CommandBuilder::new(program);
        for arg in args {
            builder.arg(arg);
        }
        if let Some(ref dir) = self.cwd {
            builder.cwd(dir);
        }
        builder.env("TERM", "xterm-256color");
        Ok(builder)
    }
}

impl PtySpawner for NativePtySpawner {
    fn spawn(
        &self,
        request: &SpawnRequest,
        events: PtyEventSender,
    ) -> HubResult<Box<dyn PtyProcess>> {
        let pty_system = native_pty_system();
        let size = PtySize {
            rows: request.rows,
            cols: request.cols,
            pixel_width: 0,
            pixel_height: 0,
        };

        let pair = pty_system
            .openpty(size)
            .map_err(|e| HubError::SpawnFailure(format!("failed to open PTY: {e}")))?;

        let cmd = self.command()?;
        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| HubError::SpawnFailure(format!("failed to spawn {}: {e}", self.shell)))?;
        // The child holds its own copy; ours would keep the master from seeing EOF.
        drop(pair.slave);

        let mut killer = child.clone_killer();
        let pid = child.process_id();

        match start_io_threads(&request.session_id, pair.master.as_ref(), child, events) {
            Ok(input_tx) => {
                info!(
                    session_id = %request.session_id,
                    pid = ?pid,
                    cols = request.cols,
                    rows = request.rows,
                    "PTY spawned"
                );
                Ok(Box::new(NativePty {
                    session_id: request.session_id.clone(),
                    master: pair.master,
                    input_tx,
                    killer,
                }))
            }
            Err(e) => {
                let _ = killer.kill();
                Err(e)
            }
        }
    }
}

/// Start the reader, writer and exit-watcher threads. Returns the writer's input channel.
fn start_io_threads(
    session_id: &str,
    master: &(dyn MasterPty + Send),
    mut child: Box<dyn Child + Send + Sync>,
    events: PtyEventSender,
) -> HubResult<std_mpsc::Sender<Vec<u8>>> {
    let spawn_err = |e: std::io::Error| HubError::SpawnFailure(format!("failed to start PTY thread: {e}"));

    let mut reader = master
        .try_clone_reader()
        .map_err(|e| HubError::SpawnFailure(format!("failed to clone PTY reader: {e}")))?;
    let mut writer = master
        .take_writer()
        .map_err(|e| HubError::SpawnFailure(format!("failed to take PTY writer: {e}")))?;

    let short = &session_id[..8.min(session_id.len())];
    let (drained_tx, drained_rx) = std_mpsc::channel::<()>();
    let (input_tx, input_rx) = std_mpsc::channel::<Vec<u8>>();

    let id = session_id.to_string();
    let output_events = events.clone();
    std::thread::Builder::new()
        .name(format!("pty-read-{short}"))
        .spawn(move || {
            let mut buf = vec![0u8; READ_CHUNK];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        let event = PtyEvent::Output {
                            session_id: id.clone(),
                            data: buf[..n].to_vec(),
                        };
                        if output_events.blocking_send(event).is_err() {
                            break;
                        }
                    }
                    // EIO once the slave side is gone.
                    Err(e) => {
                        debug!(session_id = %id, error = %e, "PTY read ended");
                        break;
                    }
                }
            }
            let _ = drained_tx.send(());
        })
        .map_err(spawn_err)?;

    let id = session_id.to_string();
    std::thread::Builder::new()
        .name(format!("pty-write-{short}"))
        .spawn(move || {
            while let Ok(data) = input_rx.recv() {
                if let Err(e) = writer.write_all(&data).and_then(|_| writer.flush()) {
                    warn!(session_id = %id, error = %e, "PTY write failed");
                    break;
                }
            }
        })
        .map_err(spawn_err)?;

    let id = session_id.to_string();
    std::thread::Builder::new()
        .name(format!("pty-wait-{short}"))
        .spawn(move || {
            let code = match child.wait() {
                Ok(status) => Some(status.exit_code()),
                Err(e) => {
                    warn!(session_id = %id, error = %e, "wait on shell failed");
                    None
                }
            };
            // Let trailing output reach viewers before the session disappears.
            let _ = drained_rx.recv_timeout(EXIT_DRAIN_GRACE);
            info!(session_id = %id, code = ?code, "PTY child exited");
            let _ = events.blocking_send(PtyEvent::Exited {
                session_id: id,
                code,
            });
        })
        .map_err(spawn_err)?;

    Ok(input_tx)
}

/// A live native PTY.
struct NativePty {
    session_id: String,
    /// Kept for resize; dropping it closes the terminal.
    master: Box<dyn MasterPty + Send>,
    input_tx: std_mpsc::Sender<Vec<u8>>,
    killer: Box<dyn ChildKiller + Send + Sync>,
}

impl PtyProcess for NativePty {
    fn write(&mut self, data: Vec<u8>) -> HubResult<()> {
        self.input_tx
            .send(data)
            .map_err(|_| HubError::Channel(format!("PTY writer for {} closed", self.session_id)))
    }

    fn resize(&mut self, cols: u16, rows: u16) -> HubResult<()> {
        let size = PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        };
        self.master
            .resize(size)
            .map_err(|e| HubError::Other(format!("PTY resize failed: {e}")))?;
        debug!(session_id = %self.session_id, cols, rows, "PTY resized");
        Ok(())
    }

    fn kill(&mut self) -> HubResult<()> {
        self.killer.kill()?;
        Ok(())
    }
}

#[cfg(test)]
pub mod fake {
    //! Scripted PTY used by registry, hub and gateway tests.

    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    pub struct FakeState {
        pub spawned: Vec<String>,
        pub writes: Vec<(String, Vec<u8>)>,
        pub resizes: Vec<(String, u16, u16)>,
        pub killed: Vec<String>,
        pub fail_next: bool,
        pub fail_next_kill: bool,
        senders: HashMap<String, PtyEventSender>,
    }

    /// Spawner whose processes record calls and exit when killed.
    pub struct FakeSpawner {
        state: Arc<Mutex<FakeState>>,
    }

    /// Test-side handle for driving fake processes.
    #[derive(Clone)]
    pub struct FakeControl {
        state: Arc<Mutex<FakeState>>,
    }

    impl FakeSpawner {
        pub fn new() -> (Self, FakeControl) {
            let state = Arc::new(Mutex::new(FakeState::default()));
            (
                Self {
                    state: state.clone(),
                },
                FakeControl { state },
            )
        }
    }

    impl PtySpawner for FakeSpawner {
        fn spawn(
            &self,
            request: &SpawnRequest,
            events: PtyEventSender,
        ) -> HubResult<Box<dyn PtyProcess>> {
            let mut state = self.state.lock().unwrap();
            if state.fail_next {
                state.fail_next = false;
                return Err(HubError::SpawnFailure("fake spawn refused".into()));
            }
            state.spawned.push(request.session_id.clone());
            state
                .senders
                .insert(request.session_id.clone(), events.clone());
            Ok(Box::new(FakeProcess {
                session_id: request.session_id.clone(),
                state: self.state.clone(),
                events,
            }))
        }
    }

    impl FakeControl {
        pub fn fail_next_spawn(&self) {
            self.state.lock().unwrap().fail_next = true;
        }

        pub fn fail_next_kill(&self) {
            self.state.lock().unwrap().fail_next_kill = true;
        }

        pub fn spawned(&self) -> Vec<String> {
            self.state.lock().unwrap().spawned.clone()
        }

        pub fn writes(&self) -> Vec<(String, Vec<u8>)> {
            self.state.lock().unwrap().writes.clone()
        }

        pub fn resizes(&self) -> Vec<(String, u16, u16)> {
            self.state.lock().unwrap().resizes.clone()
        }

        pub fn killed(&self) -> Vec<String> {
            self.state.lock().unwrap().killed.clone()
        }

        fn sender(&self, session_id: &str) -> PtyEventSender {
            self.state
                .lock()
                .unwrap()
                .senders
                .get(session_id)
                .cloned()
                .expect("no fake process for session")
        }

        /// Emit shell output as if the PTY produced it.
        pub async fn output(&self, session_id: &str, data: &[u8]) {
            self.sender(session_id)
                .send(PtyEvent::Output {
                    session_id: session_id.to_string(),
                    data: data.to_vec(),
                })
                .await
                .unwrap();
        }

        /// Make the shell exit on its own.
        pub async fn exit(&self, session_id: &str) {
            self.sender(session_id)
                .send(PtyEvent::Exited {
                    session_id: session_id.to_string(),
                    code: Some(0),
                })
                .await
                .unwrap();
        }
    }

    struct FakeProcess {
        session_id: String,
        state: Arc<Mutex<FakeState>>,
        events: PtyEventSender,
    }

    impl PtyProcess for FakeProcess {
        fn write(&mut self, data: Vec<u8>) -> HubResult<()> {
            self.state
                .lock()
                .unwrap()
                .writes
                .push((self.session_id.clone(), data));
            Ok(())
        }

        fn resize(&mut self, cols: u16, rows: u16) -> HubResult<()> {
            self.state
                .lock()
                .unwrap()
                .resizes
                .push((self.session_id.clone(), cols, rows));
            Ok(())
        }

        fn kill(&mut self) -> HubResult<()> {
            {
                let mut state = self.state.lock().unwrap();
                if state.fail_next_kill {
                    state.fail_next_kill = false;
                    return Err(HubError::Other("fake kill refused".into()));
                }
                state.killed.push(self.session_id.clone());
            }
            let _ = self.events.try_send(PtyEvent::Exited {
                session_id: self.session_id.clone(),
                code: None,
            });
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_shell_is_not_empty() {
        assert!(!default_shell().trim().is_empty());
    }

    #[test]
    fn empty_shell_is_spawn_failure() {
        let spawner = NativePtySpawner::new("   ");
        assert!(matches!(spawner.command(), Err(HubError::SpawnFailure(_))));
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread")]
    async fn native_shell_echoes_and_exits() {
        let (tx, mut rx) = mpsc::channel(64);
        let spawner = NativePtySpawner::new("/bin/sh");
        let request = SpawnRequest {
            session_id: "native-test".into(),
            cols: 80,
            rows: 24,
        };
        let mut pty = spawner.spawn(&request, tx).unwrap();
        pty.write(b"echo ptyhub-marker; exit\n".to_vec()).unwrap();

        let mut output = Vec::new();
        let exited = tokio::time::timeout(Duration::from_secs(10), async {
            while let Some(event) = rx.recv().await {
                match event {
                    PtyEvent::Output { data, .. } => output.extend(data),
                    PtyEvent::Exited { .. } => return true,
                }
            }
            false
        })
        .await
        .unwrap_or(false);

        assert!(exited, "shell did not exit");
        let text = String::from_utf8_lossy(&output);
        assert!(text.contains("ptyhub-marker"), "output was {text:?}");
    }
}
