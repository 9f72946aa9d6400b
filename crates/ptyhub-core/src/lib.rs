//! ptyhub-core: shared protocol library for ptyhub.
//!
//! Provides the client/server event enums, the JSON and CBOR frame codec,
//! and the error taxonomy shared by the server and the CLI.

pub mod codec;
pub mod error;
pub mod messages;

// Re-export commonly used items at crate root.
pub use codec::{cbor_decode, cbor_encode, decode_frame, encode_frame, Frame, WireFormat};
pub use error::{HubError, HubResult};
pub use messages::{
    ClientEvent, ErrorPayload, InputPayload, ResizePayload, ServerEvent, SessionSummary,
    PROTOCOL_VERSION,
};
