//! Content-type negotiated codecs.
//!
//! Every wire type round-trips losslessly through both encodings, so the
//! engine does not care which one a transport picks.

use crate::error::{ProtocolError, ProtocolResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Encoding used for request and response bodies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContentType {
    /// JSON text.
    #[serde(rename = "application/json")]
    Json,
    /// CBOR binary.
    #[default]
    #[serde(rename = "application/octet-stream")]
    Binary,
}

impl ContentType {
    /// Returns the MIME type.
    pub fn mime(&self) -> &'static str {
        match self {
            ContentType::Json => "application/json",
            ContentType::Binary => "application/octet-stream",
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mime())
    }
}

impl FromStr for ContentType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Ignore parameters such as "; charset=utf-8".
        let mime = s.split(';').next().unwrap_or_default().trim();
        match mime {
            "application/json" => Ok(ContentType::Json),
            "application/octet-stream" => Ok(ContentType::Binary),
            other => Err(ProtocolError::UnsupportedContentType(other.to_string())),
        }
    }
}

/// Encodes a value with the given content type.
pub fn encode<T: Serialize>(content_type: ContentType, value: &T) -> ProtocolResult<Vec<u8>> {
    match content_type {
        ContentType::Json => serde_json::to_vec(value).map_err(|e| ProtocolError::encode(e.to_string())),
        ContentType::Binary => {
            let mut buf = Vec::new();
            ciborium::ser::into_writer(value, &mut buf)
                .map_err(|e| ProtocolError::encode(e.to_string()))?;
            Ok(buf)
        }
    }
}

/// Decodes a value with the given content type.
pub fn decode<T: DeserializeOwned>(content_type: ContentType, bytes: &[u8]) -> ProtocolResult<T> {
    match content_type {
        ContentType::Json => {
            serde_json::from_slice(bytes).map_err(|e| ProtocolError::decode(e.to_string()))
        }
        ContentType::Binary => {
            ciborium::de::from_reader(bytes).map_err(|e| ProtocolError::decode(e.to_string()))
        }
    }
}
