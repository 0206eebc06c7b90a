//! Policy content hashing.
//!
//! The content hash is the policy's identity for audit and change
//! detection. It is computed over a canonical JSON rendering of the decoded
//! document, with the `jsonSchema` editor annotation removed, so the YAML
//! and JSON encodings of the same logical policy hash identically.
//!
//! Canonical form: `serde_json::to_vec` over a `serde_json::Value` — object
//! keys are sorted (the default map is ordered by key) and there is no
//! insignificant whitespace. The 64-bit hash is the first 8 bytes of a
//! SHA-256 over those bytes, big-endian.

use sha2::{Digest, Sha256};

/// The annotation key excluded from hashing.
const ANNOTATION_KEY: &str = "jsonSchema";

/// Compute the 64-bit content hash of a decoded policy document.
pub fn content_hash(document: &serde_json::Value) -> u64 {
    let canonical = canonicalize(document);
    // Serialization of a Value cannot fail; keys are strings by construction.
    let bytes = serde_json::to_vec(&canonical).unwrap_or_default();

    let digest = Sha256::digest(&bytes);
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}

/// Render a content hash the way it appears in logs and admin output.
pub fn hash_hex(hash: u64) -> String {
    hex::encode(hash.to_be_bytes())
}

/// A copy of the document with the annotation removed.
fn canonicalize(document: &serde_json::Value) -> serde_json::Value {
    match document {
        serde_json::Value::Object(fields) => serde_json::Value::Object(
            fields
                .iter()
                .filter(|(key, _)| key.as_str() != ANNOTATION_KEY)
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
        ),
        other => other.clone(),
    }
}
