//! Envelope types
//!
//! An envelope is one unit of payload sent over the data channel. The JSON
//! field names match what browser clients put on the wire: a `type`
//! discriminator, `dataType` for the MIME type and `data` for the file body.

use crate::{DroplineError, DroplineResult};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// MIME type used when the sender does not know one
pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

// ----------------------------------------------------------------------------
// Envelope
// ----------------------------------------------------------------------------

/// One unit of payload framed for transmission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Envelope {
    File(FileEnvelope),
    Text(TextEnvelope),
}

/// Payload kind carried by an envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeKind {
    File,
    Text,
}

impl EnvelopeKind {
    /// Wire discriminator for this kind
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeKind::File => "file",
            EnvelopeKind::Text => "text",
        }
    }
}

impl Envelope {
    /// File envelope with size computed from the bytes
    pub fn file(name: impl Into<String>, mime_type: Option<&str>, bytes: Vec<u8>) -> Self {
        Envelope::File(FileEnvelope::new(name, mime_type, bytes))
    }

    /// Text envelope stamped with the current time; rejects blank input
    pub fn text(input: &str) -> DroplineResult<Self> {
        Ok(Envelope::Text(TextEnvelope::compose(input)?))
    }

    pub fn kind(&self) -> EnvelopeKind {
        match self {
            Envelope::File(_) => EnvelopeKind::File,
            Envelope::Text(_) => EnvelopeKind::Text,
        }
    }

    /// Check the invariants every envelope must hold before it is sent
    pub fn validate(&self) -> DroplineResult<()> {
        match self {
            Envelope::File(file) => file.validate(),
            Envelope::Text(text) => text.validate(),
        }
    }
}

// ----------------------------------------------------------------------------
// File Envelope
// ----------------------------------------------------------------------------

/// A whole file sent as one message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEnvelope {
    pub name: String,
    pub size: u64,
    #[serde(rename = "dataType", default = "default_mime_type")]
    pub mime_type: String,
    #[serde(rename = "data", with = "base64_bytes")]
    pub bytes: Vec<u8>,
}

impl FileEnvelope {
    pub fn new(name: impl Into<String>, mime_type: Option<&str>, bytes: Vec<u8>) -> Self {
        let mime_type = match mime_type.map(str::trim) {
            Some(mime) if !mime.is_empty() => mime.to_string(),
            _ => DEFAULT_MIME_TYPE.to_string(),
        };
        Self {
            name: name.into(),
            size: bytes.len() as u64,
            mime_type,
            bytes,
        }
    }

    /// Whether the payload is an image a UI could preview inline
    pub fn is_image(&self) -> bool {
        self.mime_type.starts_with("image/")
    }

    pub fn validate(&self) -> DroplineResult<()> {
        if self.name.trim().is_empty() {
            return Err(DroplineError::invalid_envelope("file name is empty"));
        }
        if self.size != self.bytes.len() as u64 {
            return Err(DroplineError::invalid_envelope(format!(
                "declared size {} does not match {} payload bytes",
                self.size,
                self.bytes.len()
            )));
        }
        if self.mime_type.trim().is_empty() {
            return Err(DroplineError::invalid_envelope("MIME type is empty"));
        }
        Ok(())
    }
}

fn default_mime_type() -> String {
    DEFAULT_MIME_TYPE.to_string()
}

// ----------------------------------------------------------------------------
// Text Envelope
// ----------------------------------------------------------------------------

/// A text message with the sender's ISO-8601 send time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextEnvelope {
    pub content: String,
    #[serde(rename = "timestamp")]
    pub sent_at: String,
}

impl TextEnvelope {
    /// Trim user input and stamp it with the current time
    pub fn compose(input: &str) -> DroplineResult<Self> {
        Self::compose_at(input, Utc::now())
    }

    /// Trim user input and stamp it with the given time
    pub fn compose_at(input: &str, sent_at: DateTime<Utc>) -> DroplineResult<Self> {
        let content = input.trim();
        if content.is_empty() {
            return Err(DroplineError::invalid_envelope("text content is empty"));
        }
        Ok(Self {
            content: content.to_string(),
            sent_at: format_iso8601(sent_at),
        })
    }

    /// Parsed send time, if the sender supplied a valid one
    pub fn sent_at_utc(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.sent_at)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    }

    pub fn validate(&self) -> DroplineResult<()> {
        if self.content.trim().is_empty() {
            return Err(DroplineError::invalid_envelope("text content is empty"));
        }
        if self.sent_at_utc().is_none() {
            return Err(DroplineError::invalid_envelope(format!(
                "send time '{}' is not ISO-8601",
                self.sent_at
            )));
        }
        Ok(())
    }
}

/// Format a time the way browsers' `toISOString` does
pub fn format_iso8601(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

// ----------------------------------------------------------------------------
// Base64 Payload Encoding
// ----------------------------------------------------------------------------

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
