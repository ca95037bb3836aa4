//! Protocol modes and message authentication.
//!
//! Two transports share one wire shape: the plaintext `a2a` mode and the
//! authenticated `sage` mode, whose messages carry a signature envelope in
//! their metadata under [`SAGE_METADATA_KEY`].  `auto` mode picks per
//! message: an envelope present routes to verification, an absent one falls
//! through to plaintext.  A present-but-malformed envelope is rejected as
//! unauthorized rather than silently downgraded.
//!
//! Concrete DID resolution is out of scope; verification is a capability
//! injected through the [`Verifier`] trait.  The crate ships
//! [`SharedKeyVerifier`], which checks a keyed digest in constant time and
//! is sufficient for fleets that can share a secret.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::agentkit::error::{AgentError, Result};
use crate::agentkit::message::Message;

/// HTTP header carrying the outbound protocol hint.
pub const PROTOCOL_MODE_HEADER: &str = "X-Protocol-Mode";

/// Metadata key holding the signature envelope on authenticated messages.
pub const SAGE_METADATA_KEY: &str = "sage";

/// The authentication regime for a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtocolMode {
    /// Plaintext RPC; no authentication at the protocol layer.
    #[default]
    A2a,
    /// Every message is signed and verified.
    Sage,
    /// Decide per inbound message by inspecting its metadata.
    Auto,
}

impl ProtocolMode {
    /// Wire name for the `X-Protocol-Mode` header.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolMode::A2a => "a2a",
            ProtocolMode::Sage => "sage",
            ProtocolMode::Auto => "auto",
        }
    }

    /// Parse a wire name; unknown values are invalid input.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "a2a" => Ok(ProtocolMode::A2a),
            "sage" => Ok(ProtocolMode::Sage),
            "auto" => Ok(ProtocolMode::Auto),
            other => Err(AgentError::invalid_input(format!(
                "unknown protocol mode {other:?} (use a2a, sage, or auto)"
            ))),
        }
    }
}

impl std::fmt::Display for ProtocolMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Plaintext protocol settings.
#[derive(Debug, Clone)]
pub struct A2aConfig {
    /// Protocol revision advertised to peers.
    pub version: String,
}

impl Default for A2aConfig {
    fn default() -> Self {
        A2aConfig {
            version: "1.0".to_string(),
        }
    }
}

/// Authenticated protocol settings.
#[derive(Debug, Clone)]
pub struct SageConfig {
    /// Decentralized identifier this agent signs as.
    pub did: String,
}

impl SageConfig {
    /// Create a config for the given DID.
    pub fn new(did: impl Into<String>) -> Self {
        SageConfig { did: did.into() }
    }
}

/// Signature envelope attached to authenticated messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureEnvelope {
    /// DID of the sender.
    pub did: String,
    /// Signature algorithm tag.
    pub algorithm: String,
    /// Hex-encoded signature over the canonical payload.
    pub signature: String,
    /// When the message was signed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signed_at: Option<DateTime<Utc>>,
}

/// Keyed-digest algorithm tag used by [`SigningKey`].
const ALGORITHM: &str = "hmac-sha256";

/// Signing capability held by an agent running the authenticated protocol.
#[derive(Clone)]
pub struct SigningKey {
    secret: Vec<u8>,
}

impl SigningKey {
    /// Wrap raw secret bytes.
    pub fn from_secret(secret: impl Into<Vec<u8>>) -> Self {
        SigningKey {
            secret: secret.into(),
        }
    }

    /// Hex signature over a payload.
    pub fn sign(&self, payload: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.secret);
        hasher.update(payload);
        format!("{:x}", hasher.finalize())
    }
}

/// The canonical byte string a signature covers: message id, role, ordered
/// text parts, and context id.  Metadata is excluded so that attaching the
/// envelope does not invalidate it.
pub fn canonical_payload(message: &Message) -> Vec<u8> {
    let texts: Vec<&str> = message.parts.iter().filter_map(|p| p.as_text()).collect();
    json!({
        "messageId": message.message_id,
        "role": message.role.as_str(),
        "texts": texts,
        "contextId": message.context_id,
    })
    .to_string()
    .into_bytes()
}

/// Sign a message, attaching the envelope to its metadata.
pub fn sign_message(mut message: Message, config: &SageConfig, key: &SigningKey) -> Message {
    let envelope = SignatureEnvelope {
        did: config.did.clone(),
        algorithm: ALGORITHM.to_string(),
        signature: key.sign(&canonical_payload(&message)),
        signed_at: Some(Utc::now()),
    };
    message.metadata.insert(
        SAGE_METADATA_KEY.to_string(),
        serde_json::to_value(&envelope).unwrap_or_default(),
    );
    message
}

/// Pull the signature envelope off a message.  `Ok(None)` means the
/// message is unsigned; a present-but-malformed envelope is an
/// authentication failure.
pub fn extract_envelope(message: &Message) -> Result<Option<SignatureEnvelope>> {
    match message.metadata.get(SAGE_METADATA_KEY) {
        None => Ok(None),
        Some(value) => serde_json::from_value(value.clone())
            .map(Some)
            .map_err(|err| AgentError::unauthorized(format!("malformed signature envelope: {err}"))),
    }
}

/// Resolve the effective protocol for one inbound message.
pub fn detect_mode(configured: ProtocolMode, message: &Message) -> ProtocolMode {
    match configured {
        ProtocolMode::Auto => {
            if message.metadata.contains_key(SAGE_METADATA_KEY) {
                ProtocolMode::Sage
            } else {
                ProtocolMode::A2a
            }
        }
        fixed => fixed,
    }
}

/// Inbound message verification capability.
///
/// Implementations resolve the sender's identity and check the signature;
/// on success they return the verified identity string that the runtime
/// exposes to the handler.
#[async_trait]
pub trait Verifier: Send + Sync {
    /// Verify a message against its envelope.
    async fn verify(&self, message: &Message, envelope: &SignatureEnvelope) -> Result<String>;
}

/// Verifier for deployments sharing a secret key.  Recomputes the keyed
/// digest and compares in constant time.
pub struct SharedKeyVerifier {
    key: SigningKey,
}

impl SharedKeyVerifier {
    /// Wrap the shared secret.
    pub fn new(key: SigningKey) -> Self {
        SharedKeyVerifier { key }
    }
}

#[async_trait]
impl Verifier for SharedKeyVerifier {
    async fn verify(&self, message: &Message, envelope: &SignatureEnvelope) -> Result<String> {
        if envelope.algorithm != ALGORITHM {
            return Err(AgentError::unauthorized(format!(
                "unsupported signature algorithm {:?}",
                envelope.algorithm
            )));
        }
        let expected = self.key.sign(&canonical_payload(message));
        let matches: bool = expected
            .as_bytes()
            .ct_eq(envelope.signature.as_bytes())
            .into();
        if matches {
            Ok(envelope.did.clone())
        } else {
            Err(AgentError::unauthorized("signature verification failed"))
        }
    }
}

/// Verify an inbound authenticated message end to end: envelope required,
/// then checked by the injected verifier.  Returns the verified identity.
pub async fn verify_message(message: &Message, verifier: &dyn Verifier) -> Result<String> {
    let envelope = extract_envelope(message)?.ok_or_else(|| {
        AgentError::unauthorized("authenticated mode requires a signature envelope")
    })?;
    verifier.verify(message, &envelope).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> SigningKey {
        SigningKey::from_secret(b"super secret".to_vec())
    }

    #[test]
    fn test_mode_parse_round_trip() {
        for mode in [ProtocolMode::A2a, ProtocolMode::Sage, ProtocolMode::Auto] {
            assert_eq!(ProtocolMode::parse(mode.as_str()).unwrap(), mode);
        }
        assert!(ProtocolMode::parse("quic").is_err());
    }

    #[test]
    fn test_detect_mode() {
        let plain = Message::user_text("hi");
        let signed = sign_message(
            Message::user_text("hi"),
            &SageConfig::new("did:sage:alice"),
            &key(),
        );
        assert_eq!(detect_mode(ProtocolMode::Auto, &plain), ProtocolMode::A2a);
        assert_eq!(detect_mode(ProtocolMode::Auto, &signed), ProtocolMode::Sage);
        assert_eq!(detect_mode(ProtocolMode::A2a, &signed), ProtocolMode::A2a);
        assert_eq!(detect_mode(ProtocolMode::Sage, &plain), ProtocolMode::Sage);
    }

    #[tokio::test]
    async fn test_sign_then_verify() {
        let key = key();
        let signed = sign_message(
            Message::user_text("hello").with_context_id("c1"),
            &SageConfig::new("did:sage:alice"),
            &key,
        );
        let verifier = SharedKeyVerifier::new(key);
        let identity = verify_message(&signed, &verifier).await.unwrap();
        assert_eq!(identity, "did:sage:alice");
    }

    #[tokio::test]
    async fn test_tampered_message_fails_verification() {
        let key = key();
        let mut signed = sign_message(
            Message::user_text("pay alice 10"),
            &SageConfig::new("did:sage:alice"),
            &key,
        );
        signed.parts = vec![crate::agentkit::message::Part::text("pay mallory 10")];
        let verifier = SharedKeyVerifier::new(key);
        let err = verify_message(&signed, &verifier).await.unwrap_err();
        assert_eq!(err.kind(), "unauthorized");
    }

    #[tokio::test]
    async fn test_wrong_key_fails_verification() {
        let signed = sign_message(
            Message::user_text("hello"),
            &SageConfig::new("did:sage:alice"),
            &key(),
        );
        let verifier = SharedKeyVerifier::new(SigningKey::from_secret(b"other".to_vec()));
        assert!(verify_message(&signed, &verifier).await.is_err());
    }

    #[tokio::test]
    async fn test_missing_envelope_is_unauthorized() {
        let verifier = SharedKeyVerifier::new(key());
        let err = verify_message(&Message::user_text("hi"), &verifier)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "unauthorized");
    }

    #[test]
    fn test_malformed_envelope_is_unauthorized() {
        let message =
            Message::user_text("hi").with_metadata(SAGE_METADATA_KEY, serde_json::json!(42));
        let err = extract_envelope(&message).unwrap_err();
        assert_eq!(err.kind(), "unauthorized");
    }

    #[test]
    fn test_envelope_does_not_invalidate_payload() {
        let key = key();
        let message = Message::user_text("hello");
        let before = canonical_payload(&message);
        let signed = sign_message(message, &SageConfig::new("did:sage:a"), &key);
        assert_eq!(before, canonical_payload(&signed));
    }
}
