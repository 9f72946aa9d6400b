//! Encoding of protocol events onto WebSocket frames.
//!
//! A connection negotiates its outbound format once (`?format=cbor` or the
//! JSON default). Inbound frames are decoded by their own kind, so a client
//! may mix text and binary frames freely.

use crate::error::HubResult;
use std::io::Cursor;

/// Outbound encoding chosen by a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireFormat {
    /// UTF-8 JSON in text frames.
    #[default]
    Json,
    /// CBOR in binary frames.
    Cbor,
}

impl WireFormat {
    /// Pick the format from a request query string (`format=cbor`).
    ///
    /// Unknown or missing values fall back to JSON.
    pub fn from_query(query: Option<&str>) -> Self {
        let Some(query) = query else {
            return WireFormat::Json;
        };
        for pair in query.split('&') {
            if let Some(value) = pair.strip_prefix("format=") {
                if value.eq_ignore_ascii_case("cbor") {
                    return WireFormat::Cbor;
                }
            }
        }
        WireFormat::Json
    }

    /// Query string value for this format.
    pub fn as_query_value(&self) -> &'static str {
        match self {
            WireFormat::Json => "json",
            WireFormat::Cbor => "cbor",
        }
    }
}

/// A transport-agnostic WebSocket data frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

/// Encode a serializable value as CBOR.
pub fn cbor_encode<T: serde::Serialize>(value: &T) -> HubResult<Vec<u8>> {
    let mut payload = Vec::new();
    ciborium::into_writer(value, &mut payload)?;
    Ok(payload)
}

/// Decode a CBOR payload into a typed value.
pub fn cbor_decode<T: serde::de::DeserializeOwned>(data: &[u8]) -> HubResult<T> {
    let cursor = Cursor::new(data);
    let value: T = ciborium::from_reader(cursor)?;
    Ok(value)
}

/// Encode a value as a frame in the given format.
pub fn encode_frame<T: serde::Serialize>(format: WireFormat, value: &T) -> HubResult<Frame> {
    match format {
        WireFormat::Json => Ok(Frame::Text(serde_json::to_string(value)?)),
        WireFormat::Cbor => Ok(Frame::Binary(cbor_encode(value)?)),
    }
}

/// Decode a frame according to its kind.
pub fn decode_frame<T: serde::de::DeserializeOwned>(frame: &Frame) -> HubResult<T> {
    match frame {
        Frame::Text(text) => Ok(serde_json::from_str(text)?),
        Frame::Binary(data) => cbor_decode(data),
    }
}
