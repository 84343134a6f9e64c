//! Opaque context tokens for cross-process propagation.
//!
//! A token is `mdk.` followed by URL-safe, unpadded base64 of a JSON object:
//!
//! ```text
//! {"v":1,"trace_id":"<uuid>","path":[0,2,1]}
//! ```
//!
//! Decoders ignore fields they do not know, so newer encoders may add fields
//! without breaking older processes.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD as BASE64};
use serde::Deserialize;
use thiserror::Error;

use crate::{CausalPath, TraceId};

/// Prefix identifying an MDK context token.
pub const TOKEN_PREFIX: &str = "mdk.";

/// Encoding version written by this crate.
pub const TOKEN_VERSION: u32 = 1;

/// Token decoding error.
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("Token is missing the `mdk.` prefix")]
    MissingPrefix,
    #[error("Token is not valid base64: {0}")]
    Encoding(#[from] base64::DecodeError),
    #[error("Token payload is malformed: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("Unsupported token version: {0}")]
    UnsupportedVersion(u32),
}

/// The part of a context that crosses process boundaries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropagatedContext {
    pub trace_id: TraceId,
    pub causal_path: CausalPath,
}

#[derive(Deserialize)]
struct Envelope {
    v: u32,
    trace_id: TraceId,
    #[serde(default)]
    path: CausalPath,
}

/// Encodes and decodes context tokens.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContextPropagator;

impl ContextPropagator {
    /// Encode a context into a transport-safe token.
    #[must_use]
    pub fn encode(context: &PropagatedContext) -> String {
        let payload = serde_json::json!({
            "v": TOKEN_VERSION,
            "trace_id": context.trace_id,
            "path": context.causal_path,
        });
        format!("{TOKEN_PREFIX}{}", BASE64.encode(payload.to_string()))
    }

    /// Decode a token produced by `encode` (this or a newer version).
    ///
    /// # Errors
    /// Returns error if the token is empty, truncated, or otherwise corrupt.
    pub fn decode(token: &str) -> Result<PropagatedContext, TokenError> {
        let body = token
            .trim()
            .strip_prefix(TOKEN_PREFIX)
            .ok_or(TokenError::MissingPrefix)?;
        let bytes = BASE64.decode(body)?;
        let envelope: Envelope = serde_json::from_slice(&bytes)?;
        if envelope.v == 0 {
            return Err(TokenError::UnsupportedVersion(envelope.v));
        }
        Ok(PropagatedContext {
            trace_id: envelope.trace_id,
            causal_path: envelope.path,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PropagatedContext {
        PropagatedContext {
            trace_id: TraceId::new(),
            causal_path: vec![0, 2, 1],
        }
    }

    #[test]
    fn test_token_roundtrip() {
        let original = sample();
        let token = ContextPropagator::encode(&original);
        assert!(token.starts_with(TOKEN_PREFIX));
        assert!(token.chars().all(|c| c.is_ascii_alphanumeric() || "._-".contains(c)));

        let decoded = ContextPropagator::decode(&token).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_newer_token_with_unknown_fields_decodes() {
        let ctx = sample();
        let payload = serde_json::json!({
            "v": 7,
            "trace_id": ctx.trace_id,
            "path": ctx.causal_path,
            "baggage": {"tenant": "acme"},
        });
        let token = format!("{TOKEN_PREFIX}{}", BASE64.encode(payload.to_string()));

        let decoded = ContextPropagator::decode(&token).unwrap();
        assert_eq!(decoded, ctx);
    }

    #[test]
    fn test_corrupt_tokens_are_rejected() {
        assert!(matches!(
            ContextPropagator::decode(""),
            Err(TokenError::MissingPrefix)
        ));
        assert!(matches!(
            ContextPropagator::decode("mdk.!!!"),
            Err(TokenError::Encoding(_))
        ));

        let not_json = format!("{TOKEN_PREFIX}{}", BASE64.encode("hello"));
        assert!(matches!(
            ContextPropagator::decode(&not_json),
            Err(TokenError::Payload(_))
        ));

        let token = ContextPropagator::encode(&sample());
        let truncated = &token[..token.len() - 6];
        assert!(ContextPropagator::decode(truncated).is_err());
    }

    #[test]
    fn test_version_zero_is_rejected() {
        let payload = serde_json::json!({"v": 0, "trace_id": TraceId::new()});
        let token = format!("{TOKEN_PREFIX}{}", BASE64.encode(payload.to_string()));
        assert!(matches!(
            ContextPropagator::decode(&token),
            Err(TokenError::UnsupportedVersion(0))
        ));
    }
}
