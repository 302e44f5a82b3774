//! Transport codec for binary audio
//!
//! Audio crosses the remote boundary as text. The codec is a trait so the
//! session and the response path never depend on a concrete encoding.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

use crate::Result;

/// Encodes binary payloads into a transport-safe text form and back
pub trait TransportCodec: Send + Sync {
    /// Encode bytes for the transport
    fn encode(&self, bytes: &[u8]) -> String;

    /// Decode transport text back into bytes
    ///
    /// # Errors
    ///
    /// Returns error if the text is not valid for this encoding
    fn decode(&self, text: &str) -> Result<Vec<u8>>;
}

/// Standard-alphabet, padded base64
#[derive(Debug, Clone, Copy, Default)]
pub struct Base64Codec;

impl TransportCodec for Base64Codec {
    fn encode(&self, bytes: &[u8]) -> String {
        STANDARD.encode(bytes)
    }

    fn decode(&self, text: &str) -> Result<Vec<u8>> {
        // Some transports wrap long payloads
        let compact: String = text.chars().filter(|c| !c.is_ascii_whitespace()).collect();
        Ok(STANDARD.decode(compact)?)
    }
}
