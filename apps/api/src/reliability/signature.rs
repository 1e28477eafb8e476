//! HMAC-SHA256 webhook signature checks with replay protection.
//!
//! Two envelope styles are supported:
//! - chat events: `v0=hex(HMAC(secret, "v0:{timestamp}:{body}"))`
//! - inbound mail: `hex(HMAC(key, "{timestamp}{token}"))`
//!
//! Digests are compared with `Mac::verify_slice`, which runs in constant time.

use std::time::Duration;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

use crate::errors::AppError;

type HmacSha256 = Hmac<Sha256>;

pub const DEFAULT_TOLERANCE: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("missing {0}")]
    Missing(&'static str),

    #[error("malformed timestamp")]
    MalformedTimestamp,

    #[error("timestamp outside the {tolerance_secs}s tolerance window")]
    StaleTimestamp { tolerance_secs: u64 },

    #[error("malformed signature")]
    MalformedSignature,

    #[error("signature mismatch")]
    Mismatch,
}

impl From<SignatureError> for AppError {
    fn from(e: SignatureError) -> Self {
        AppError::Security(e.to_string())
    }
}

#[derive(Clone)]
pub struct SignatureVerifier {
    secret: Vec<u8>,
    tolerance: Duration,
}

impl SignatureVerifier {
    pub fn new(secret: &str, tolerance: Duration) -> Self {
        Self {
            secret: secret.as_bytes().to_vec(),
            tolerance,
        }
    }

    fn mac(&self) -> HmacSha256 {
        HmacSha256::new_from_slice(&self.secret).expect("HMAC can take key of any size")
    }

    /// Hex digest of `message` under this verifier's secret.
    pub fn sign(&self, message: &[u8]) -> String {
        let mut mac = self.mac();
        mac.update(message);
        hex::encode(mac.finalize().into_bytes())
    }

    /// Rejects timestamps more than the tolerance away from `now` (unix seconds).
    pub fn check_timestamp(&self, timestamp: i64, now: i64) -> Result<(), SignatureError> {
        let age = now.saturating_sub(timestamp).unsigned_abs();
        if age > self.tolerance.as_secs() {
            return Err(SignatureError::StaleTimestamp {
                tolerance_secs: self.tolerance.as_secs(),
            });
        }
        Ok(())
    }

    /// Constant-time check of a hex digest against `message`.
    pub fn verify(&self, message: &[u8], provided_hex: &str) -> Result<(), SignatureError> {
        let provided =
            hex::decode(provided_hex.trim()).map_err(|_| SignatureError::MalformedSignature)?;
        let mut mac = self.mac();
        mac.update(message);
        mac.verify_slice(&provided)
            .map_err(|_| SignatureError::Mismatch)
    }

    /// Chat-event style: `X-Slack-Request-Timestamp` + `X-Slack-Signature`.
    pub fn verify_chat_event(
        &self,
        timestamp: Option<&str>,
        signature: Option<&str>,
        body: &[u8],
        now: i64,
    ) -> Result<(), SignatureError> {
        let timestamp = timestamp.ok_or(SignatureError::Missing("timestamp header"))?;
        let signature = signature.ok_or(SignatureError::Missing("signature header"))?;
        let ts: i64 = timestamp
            .trim()
            .parse()
            .map_err(|_| SignatureError::MalformedTimestamp)?;
        self.check_timestamp(ts, now)?;

        let digest = signature
            .trim()
            .strip_prefix("v0=")
            .ok_or(SignatureError::MalformedSignature)?;

        let mut message = format!("v0:{}:", timestamp.trim()).into_bytes();
        message.extend_from_slice(body);
        self.verify(&message, digest)
    }

    /// Inbound-mail style: signature block `{timestamp, token, signature}`.
    pub fn verify_mail_event(
        &self,
        timestamp: &str,
        token: &str,
        signature: &str,
        now: i64,
    ) -> Result<(), SignatureError> {
        let ts: i64 = timestamp
            .trim()
            .parse()
            .map_err(|_| SignatureError::MalformedTimestamp)?;
        self.check_timestamp(ts, now)?;
        let message = format!("{}{}", timestamp.trim(), token);
        self.verify(message.as_bytes(), signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000;

    fn verifier() -> SignatureVerifier {
        SignatureVerifier::new("8f742231b10e8888abcd99yyyzzz85a5", DEFAULT_TOLERANCE)
    }

    fn chat_signature(v: &SignatureVerifier, ts: i64, body: &str) -> String {
        format!("v0={}", v.sign(format!("v0:{ts}:{body}").as_bytes()))
    }

    #[test]
    fn test_timestamp_boundary() {
        let v = verifier();
        let body = r#"{"type":"event_callback"}"#;

        let fresh = NOW - 299;
        let sig = chat_signature(&v, fresh, body);
        assert!(v
            .verify_chat_event(Some(&fresh.to_string()), Some(&sig), body.as_bytes(), NOW)
            .is_ok());

        let stale = NOW - 301;
        let sig = chat_signature(&v, stale, body);
        assert_eq!(
            v.verify_chat_event(Some(&stale.to_string()), Some(&sig), body.as_bytes(), NOW),
            Err(SignatureError::StaleTimestamp { tolerance_secs: 300 })
        );
    }

    #[test]
    fn test_tampered_body_is_rejected() {
        let v = verifier();
        let sig = chat_signature(&v, NOW, "original");
        assert_eq!(
            v.verify_chat_event(Some(&NOW.to_string()), Some(&sig), b"tampered", NOW),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn test_mismatch_regardless_of_position() {
        let v = verifier();
        let good = v.sign(b"payload");
        for idx in [0, good.len() / 2, good.len() - 1] {
            let mut bad: Vec<char> = good.chars().collect();
            bad[idx] = if bad[idx] == '0' { '1' } else { '0' };
            let bad: String = bad.into_iter().collect();
            assert_eq!(v.verify(b"payload", &bad), Err(SignatureError::Mismatch));
        }
        assert!(v.verify(b"payload", &good).is_ok());
    }

    #[test]
    fn test_missing_and_malformed_headers() {
        let v = verifier();
        assert_eq!(
            v.verify_chat_event(None, Some("v0=00"), b"", NOW),
            Err(SignatureError::Missing("timestamp header"))
        );
        assert_eq!(
            v.verify_chat_event(Some(&NOW.to_string()), Some("sha256=00"), b"", NOW),
            Err(SignatureError::MalformedSignature)
        );
        assert_eq!(
            v.verify_chat_event(Some("yesterday"), Some("v0=00"), b"", NOW),
            Err(SignatureError::MalformedTimestamp)
        );
        assert_eq!(v.verify(b"x", "not-hex"), Err(SignatureError::MalformedSignature));
    }

    #[test]
    fn test_mail_event_signature() {
        let v = verifier();
        let token = "a8ce0edb2dd8301dee6c2405235584e45aa91d1e9f979f3de0";
        let ts = (NOW - 10).to_string();
        let sig = v.sign(format!("{ts}{token}").as_bytes());
        assert!(v.verify_mail_event(&ts, token, &sig, NOW).is_ok());

        let old = (NOW - 301).to_string();
        let sig = v.sign(format!("{old}{token}").as_bytes());
        assert!(matches!(
            v.verify_mail_event(&old, token, &sig, NOW),
            Err(SignatureError::StaleTimestamp { .. })
        ));
    }
}
