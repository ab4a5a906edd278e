//! Registry wire messages.
//!
//! Messages are wrapped in [`RegistryMessage`], internally tagged on
//! `"type"` with `REGISTER` / `UNREGISTER` discriminators. The binary form is
//! named `MsgPack` (`rmp_serde::to_vec_named()`) with camelCase field names;
//! the JSON form is provided for HTTP-based peers and diagnostics.

pub mod registry;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use registry::{RegisterRequest, UnregisterRequest};

/// Discriminator used to route a message to its handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Register,
    Unregister,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Register => "REGISTER",
            Self::Unregister => "UNREGISTER",
        })
    }
}

/// Envelope for every registry message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RegistryMessage {
    Register(RegisterRequest),
    Unregister(UnregisterRequest),
}

impl RegistryMessage {
    #[must_use]
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Register(_) => MessageType::Register,
            Self::Unregister(_) => MessageType::Unregister,
        }
    }

    #[must_use]
    pub fn instance_id(&self) -> &str {
        match self {
            Self::Register(r) => &r.instance_id,
            Self::Unregister(u) => &u.instance_id,
        }
    }

    #[must_use]
    pub fn service_id(&self) -> &str {
        match self {
            Self::Register(r) => &r.service_id,
            Self::Unregister(u) => &u.service_id,
        }
    }

    /// Encodes to named `MsgPack`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Encode`] if serialization fails.
    pub fn to_msgpack(&self) -> Result<Vec<u8>, CodecError> {
        rmp_serde::to_vec_named(self).map_err(|e| CodecError::Encode(e.to_string()))
    }

    /// Decodes from `MsgPack`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Decode`] for malformed input or an unknown
    /// discriminator.
    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, CodecError> {
        rmp_serde::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))
    }

    /// Encodes to JSON.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Encode`] if serialization fails.
    pub fn to_json(&self) -> Result<String, CodecError> {
        serde_json::to_string(self).map_err(|e| CodecError::Encode(e.to_string()))
    }

    /// Decodes from JSON.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Decode`] for malformed input.
    pub fn from_json(text: &str) -> Result<Self, CodecError> {
        serde_json::from_str(text).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

impl From<RegisterRequest> for RegistryMessage {
    fn from(r: RegisterRequest) -> Self {
        Self::Register(r)
    }
}

impl From<UnregisterRequest> for RegistryMessage {
    fn from(u: UnregisterRequest) -> Self {
        Self::Unregister(u)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("failed to encode registry message: {0}")]
    Encode(String),
    #[error("failed to decode registry message: {0}")]
    Decode(String),
}
