//! Delivery identity for cloud de-duplication.
//!
//! Every outbound task carries a key derived from (pallet id, record
//! version). The key is stable across retries so the cloud side can drop
//! duplicate deliveries of the same record version.

use crate::types::{CaptureMode, PalletId, PalletMeta};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

const SEP: u8 = 0x1f;

fn hash_parts(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([SEP]);
    }
    hex_encode(&hasher.finalize())
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

/// Stable identifier for one delivery of one pallet record version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeliveryKey(String);

impl DeliveryKey {
    pub fn new(pallet_id: &PalletId, version: i64) -> Self {
        Self(format!("{}@{}", pallet_id.as_str(), version))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Restore a key read back from the queue table.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }
}

impl fmt::Display for DeliveryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Integrity hash over the canonical JSON body of a cloud payload.
///
/// The body is serialized from a struct with a fixed field order, so the
/// same record version always hashes identically across retries.
pub fn payload_hash(canonical_json: &str) -> String {
    hash_parts(&[canonical_json])
}

/// One capture, summarized for the cloud payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureSummary {
    pub sequence: u64,
    pub counted: u32,
    pub decoded: Option<String>,
    pub mode: CaptureMode,
    pub at: DateTime<Utc>,
}

/// Wire body POSTed to the cloud inventory API.
///
/// Idempotent on `delivery_key`. `hash` is computed over the body
/// serialized without the hash field; retries carry identical bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudPayload {
    pub pallet_id: String,
    pub keg_count: u64,
    pub expected_count: Option<u32>,
    pub captures: Vec<CaptureSummary>,
    pub meta: PalletMeta,
    pub station: Option<String>,
    pub version: i64,
    pub delivery_key: DeliveryKey,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

impl CloudPayload {
    /// Stamp the integrity hash. Call exactly once, after all other
    /// fields are final.
    pub fn finalize(mut self) -> Self {
        self.hash = None;
        let canonical = serde_json::to_string(&self).unwrap_or_default();
        self.hash = Some(payload_hash(&canonical));
        self
    }

    /// Check the stamped hash against the current field values.
    pub fn verify_hash(&self) -> bool {
        let Some(stamped) = self.hash.clone() else {
            return false;
        };
        let mut unstamped = self.clone();
        unstamped.hash = None;
        let canonical = serde_json::to_string(&unstamped).unwrap_or_default();
        payload_hash(&canonical) == stamped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_stable_across_retries() {
        let id = PalletId::parse("PAL-001").unwrap();
        let a = DeliveryKey::new(&id, 3);
        let b = DeliveryKey::new(&id, 3);
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "PAL-001@3");
    }

    #[test]
    fn key_changes_with_version() {
        let id = PalletId::parse("PAL-001").unwrap();
        assert_ne!(DeliveryKey::new(&id, 1), DeliveryKey::new(&id, 2));
    }

    #[test]
    fn payload_hash_is_deterministic() {
        let body = r#"{"pallet_id":"PAL-001","keg_count":12}"#;
        assert_eq!(payload_hash(body), payload_hash(body));
        assert_ne!(payload_hash(body), payload_hash("{}"));
        assert_eq!(payload_hash(body).len(), 64);
    }

    #[test]
    fn finalized_payload_verifies() {
        let id = PalletId::parse("PAL-001").unwrap();
        let payload = CloudPayload {
            pallet_id: id.as_str().to_string(),
            keg_count: 12,
            expected_count: Some(12),
            captures: Vec::new(),
            meta: Default::default(),
            station: Some("icam-540".to_string()),
            version: 1,
            delivery_key: DeliveryKey::new(&id, 1),
            timestamp: Utc::now(),
            hash: None,
        };
        let finalized = payload.finalize();
        assert!(finalized.verify_hash());

        let mut tampered = finalized.clone();
        tampered.keg_count = 99;
        assert!(!tampered.verify_hash());
    }
}
