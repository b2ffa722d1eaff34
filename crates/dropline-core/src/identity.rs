//! Local session identity generation
//!
//! Identities are read aloud, typed on phones and scanned from QR codes, so
//! they avoid glyphs that are easy to confuse (`0`/`o`, `1`/`l`).

use crate::types::SessionIdentity;
use rand_core::{OsRng, RngCore};

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Characters a generated identity may contain
pub const IDENTITY_ALPHABET: &[u8; 32] = b"23456789abcdefghijkmnpqrstuvwxyz";

/// Length of a generated identity
pub const IDENTITY_LENGTH: usize = 8;

// ----------------------------------------------------------------------------
// Identity Generator
// ----------------------------------------------------------------------------

/// Produces fresh local identities from a random source
#[derive(Debug, Clone)]
pub struct IdentityGenerator<R = OsRng> {
    rng: R,
}

impl IdentityGenerator<OsRng> {
    /// Generator backed by the operating system's entropy source
    pub fn new() -> Self {
        Self { rng: OsRng }
    }
}

impl Default for IdentityGenerator<OsRng> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: RngCore> IdentityGenerator<R> {
    /// Generator backed by a caller-supplied random source
    pub fn with_rng(rng: R) -> Self {
        Self { rng }
    }

    /// Generate a new identity
    pub fn generate(&mut self) -> SessionIdentity {
        let mut raw = [0u8; IDENTITY_LENGTH];
        self.rng.fill_bytes(&mut raw);

        // 256 is a multiple of the alphabet size, so the modulo is unbiased
        let token: String = raw
            .iter()
            .map(|byte| IDENTITY_ALPHABET[*byte as usize % IDENTITY_ALPHABET.len()] as char)
            .collect();

        SessionIdentity::new_unchecked(token)
    }
}

/// Generate an identity with the default entropy source
pub fn generate_identity() -> SessionIdentity {
    IdentityGenerator::new().generate()
}

/// Whether every character of `value` comes from [`IDENTITY_ALPHABET`]
pub fn is_transcription_safe(value: &str) -> bool {
    !value.is_empty() && value.bytes().all(|b| IDENTITY_ALPHABET.contains(&b))
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
