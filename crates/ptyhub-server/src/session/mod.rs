//! Session management: PTY lifecycle, history buffer, registry.

pub mod pty;
pub mod registry;
pub mod ring_buffer;

pub use pty::{default_shell, NativePtySpawner, PtyEvent, PtySpawner};
pub use registry::{RegistrySettings, SessionRegistry};
