//! Envelope wire codec
//!
//! Envelopes travel as JSON objects. Encoding refuses envelopes that break
//! their invariants; decoding refuses unknown discriminators and malformed
//! bodies. Neither failure is fatal to the session carrying the bytes.

use crate::protocol::envelope::{Envelope, EnvelopeKind};
use crate::{DroplineError, DroplineResult};
use serde_json::Value;
use tracing::debug;

/// Key holding the envelope discriminator
pub const TYPE_FIELD: &str = "type";

/// Validate and serialize an envelope
pub fn encode(envelope: &Envelope) -> DroplineResult<Vec<u8>> {
    envelope.validate()?;
    serde_json::to_vec(envelope)
        .map_err(|e| DroplineError::invalid_envelope(format!("serialization failed: {}", e)))
}

/// Parse and validate an envelope
pub fn decode(bytes: &[u8]) -> DroplineResult<Envelope> {
    let value: Value = serde_json::from_slice(bytes)
        .map_err(|e| DroplineError::invalid_envelope(format!("malformed JSON: {}", e)))?;

    let discriminator = match value.get(TYPE_FIELD) {
        Some(Value::String(kind)) => kind.as_str(),
        Some(other) => return Err(DroplineError::unknown_envelope_type(other.to_string())),
        None => return Err(DroplineError::unknown_envelope_type("<missing>")),
    };

    let Some(kind) = parse_kind(discriminator) else {
        debug!("Unknown envelope type {:?}", discriminator);
        return Err(DroplineError::unknown_envelope_type(discriminator));
    };

    let envelope: Envelope = serde_json::from_value(value).map_err(|e| {
        debug!("Malformed {} envelope: {}", kind.as_str(), e);
        DroplineError::invalid_envelope(e.to_string())
    })?;
    envelope.validate()?;
    Ok(envelope)
}

fn parse_kind(discriminator: &str) -> Option<EnvelopeKind> {
    match discriminator {
        "file" => Some(EnvelopeKind::File),
        "text" => Some(EnvelopeKind::Text),
        _ => None,
    }
}

/// Stateless codec value for callers that prefer a handle over free functions
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvelopeCodec;

impl EnvelopeCodec {
    pub fn encode(&self, envelope: &Envelope) -> DroplineResult<Vec<u8>> {
        encode(envelope)
    }

    pub fn decode(&self, bytes: &[u8]) -> DroplineResult<Envelope> {
        decode(bytes)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
