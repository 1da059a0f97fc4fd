//! Stripe Webhook Signature Verification
//!
//! Header format: `t=<unix seconds>,v1=<hex hmac>[,v1=<hex hmac>...]`. The
//! signed payload is `"{t}.{body}"`, keyed with the endpoint's signing secret.
//! Several `v1` entries appear while a secret is being rolled; any match passes.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{Result, SyncError};

type HmacSha256 = Hmac<Sha256>;

/// Verifies `Stripe-Signature` headers against a signing secret
#[derive(Clone)]
pub struct SignatureVerifier {
    secret: String,
    tolerance_secs: i64,
}

impl std::fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureVerifier")
            .field("tolerance_secs", &self.tolerance_secs)
            .finish_non_exhaustive()
    }
}

impl SignatureVerifier {
    pub fn new(secret: impl Into<String>, tolerance_secs: i64) -> Self {
        Self {
            secret: secret.into(),
            tolerance_secs,
        }
    }

    /// Verify against the current wall clock
    pub fn verify(&self, payload: &[u8], header: &str) -> Result<()> {
        self.verify_at(payload, header, chrono::Utc::now().timestamp())
    }

    /// Verify as if the current time were `now` (unix seconds)
    pub fn verify_at(&self, payload: &[u8], header: &str, now: i64) -> Result<()> {
        let mut timestamp: Option<i64> = None;
        let mut signatures: Vec<Vec<u8>> = Vec::new();

        for part in header.split(',') {
            let Some((key, value)) = part.trim().split_once('=') else {
                continue;
            };
            match key {
                "t" => timestamp = value.parse().ok(),
                // Undecodable entries can never match; skip them.
                "v1" => signatures.extend(hex::decode(value).ok()),
                _ => {}
            }
        }

        let timestamp = timestamp
            .ok_or_else(|| SyncError::WebhookSignature("missing timestamp".into()))?;

        if signatures.is_empty() {
            return Err(SyncError::WebhookSignature("no v1 signature".into()));
        }

        if now.abs_diff(timestamp) > self.tolerance_secs.unsigned_abs() {
            return Err(SyncError::WebhookSignature(format!(
                "timestamp {timestamp} outside tolerance of {}s",
                self.tolerance_secs
            )));
        }

        let mac = self.mac_for(timestamp, payload)?;

        // verify_slice compares in constant time
        if signatures
            .iter()
            .any(|candidate| mac.clone().verify_slice(candidate).is_ok())
        {
            Ok(())
        } else {
            Err(SyncError::WebhookSignature("no matching signature".into()))
        }
    }

    /// Build a header for `payload` signed at `timestamp`
    pub fn sign(&self, payload: &[u8], timestamp: i64) -> Result<String> {
        let digest = self.mac_for(timestamp, payload)?.finalize().into_bytes();
        Ok(format!("t={timestamp},v1={}", hex::encode(digest)))
    }

    fn mac_for(&self, timestamp: i64, payload: &[u8]) -> Result<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|_| SyncError::Config("invalid webhook secret".into()))?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        Ok(mac)
    }
}
