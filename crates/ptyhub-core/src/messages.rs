//! Event protocol between terminal clients and the ptyhub server.
//!
//! Every message is adjacently tagged: `{"event": "<name>", "data": <payload>}`.
//! Field names are camelCase so browser clients can use them directly.
//! Byte payloads serialize as CBOR byte strings (or number arrays in JSON).

use serde::{Deserialize, Serialize};

/// Protocol version string.
pub const PROTOCOL_VERSION: &str = "ptyhub-v1";

/// Id and display name of a live session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputPayload {
    pub session_id: String,
    #[serde(with = "byte_buf")]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResizePayload {
    pub session_id: String,
    pub cols: u16,
    pub rows: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
}

/// Requests sent by a client connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    /// Leave the current room, join this session's room, receive its history once.
    SwitchSession(String),
    /// Create a new session and attach to it.
    CreateSession,
    /// Terminate a session's shell process.
    CloseSession(String),
    /// Keystrokes for a session's PTY.
    Input(InputPayload),
    /// Resize a session's terminal.
    Resize(ResizePayload),
    /// Ask for a fresh `sessions-list`.
    ListSessions,
}

/// Events pushed to a client connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    /// Snapshot of live sessions in creation order.
    SessionsList(Vec<SessionSummary>),
    /// Broadcast to every connection.
    SessionCreated(SessionSummary),
    /// Broadcast to every connection.
    SessionClosed(SessionSummary),
    /// Scrollback replay, sent once per switch before live output.
    History(#[serde(with = "byte_buf")] Vec<u8>),
    /// Live PTY output for the attached session.
    Output(#[serde(with = "byte_buf")] Vec<u8>),
    /// Failure scoped to the requesting connection.
    Error(ErrorPayload),
}

impl ServerEvent {
    /// Short name used in log lines.
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::SessionsList(_) => "sessions-list",
            ServerEvent::SessionCreated(_) => "session-created",
            ServerEvent::SessionClosed(_) => "session-closed",
            ServerEvent::History(_) => "history",
            ServerEvent::Output(_) => "output",
            ServerEvent::Error(_) => "error",
        }
    }
}

// ── Byte payload serde ───────────────────────────────────────────────

mod byte_buf {
    use serde::{Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(ByteBufVisitor)
    }

    struct ByteBufVisitor;

    impl<'de> serde::de::Visitor<'de> for ByteBufVisitor {
        type Value = Vec<u8>;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("bytes, a byte array or a string")
        }

        fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E> {
            Ok(v.to_vec())
        }

        fn visit_byte_buf<E>(self, v: Vec<u8>) -> Result<Self::Value, E> {
            Ok(v)
        }

        // Browsers send keystrokes as plain strings.
        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E> {
            Ok(v.as_bytes().to_vec())
        }

        fn visit_string<E>(self, v: String) -> Result<Self::Value, E> {
            Ok(v.into_bytes())
        }

        fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
        where
            A: serde::de::SeqAccess<'de>,
        {
            let mut bytes = Vec::with_capacity(seq.size_hint().unwrap_or(0));
            while let Some(b) = seq.next_element::<u8>()? {
                bytes.push(b);
            }
            Ok(bytes)
        }
    }
}
