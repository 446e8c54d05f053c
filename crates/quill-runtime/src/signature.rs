//! Detached package signature verification.
//!
//! A package `foo.qpk` may ship with a sidecar `foo.qpk.sig` containing a
//! JSON signature record. The signature is an Ed25519 signature over the
//! SHA-256 digest of the raw archive bytes, so verification never needs
//! to unpack anything.
//!
//! Verification is advisory by default: a missing sidecar reports
//! [`SignatureStatus::Unsigned`] and the install policy decides whether
//! that is acceptable. A sidecar that is present but wrong is always an
//! error.

use crate::error::{RuntimeError, RuntimeResult};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::{Signature, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Signature algorithm identifier accepted in sidecar files.
pub const SIGNATURE_ALGORITHM: &str = "ed25519";

/// Sidecar signature record, stored as JSON next to the package.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureFile {
    /// Identifier of the signing key, matched against the trust store.
    pub key_id: String,

    /// Signature algorithm; only `ed25519` is accepted.
    pub algorithm: String,

    /// Base64-encoded public key, cross-checked against the trust store.
    pub public_key: String,

    /// Base64-encoded signature over the SHA-256 digest of the archive.
    pub signature: String,

    /// Signing timestamp (informational).
    #[serde(default)]
    pub signed_at: Option<String>,
}

/// Outcome of verifying a package against the trust store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureStatus {
    /// Signature present and valid under a trusted key.
    Verified { key_id: String },

    /// No sidecar signature file exists for the package.
    Unsigned,
}

/// Store of verifying keys the host trusts, keyed by key id.
#[derive(Debug, Clone, Default)]
pub struct TrustedKeys {
    keys: HashMap<String, VerifyingKey>,
}

impl TrustedKeys {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a trusted verifying key.
    pub fn add(&mut self, key_id: impl Into<String>, key: VerifyingKey) {
        self.keys.insert(key_id.into(), key);
    }

    /// Register a trusted key from its base64-encoded bytes.
    pub fn add_base64(&mut self, key_id: impl Into<String>, encoded: &str) -> RuntimeResult<()> {
        let key = decode_verifying_key(encoded)?;
        self.keys.insert(key_id.into(), key);
        Ok(())
    }

    pub fn get(&self, key_id: &str) -> Option<&VerifyingKey> {
        self.keys.get(key_id)
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }
}

/// Sidecar path for a package: the archive path with `.sig` appended.
pub fn signature_path_for(package: &Path) -> PathBuf {
    let mut name = package.as_os_str().to_os_string();
    name.push(".sig");
    PathBuf::from(name)
}

/// Verify a package archive against the trust store.
///
/// Returns [`SignatureStatus::Unsigned`] when no sidecar exists. Any
/// present-but-invalid state (untrusted key, algorithm mismatch, bad
/// encoding, digest mismatch) is a [`RuntimeError::SignatureRejected`].
pub fn verify_package(package: &Path, trusted: &TrustedKeys) -> RuntimeResult<SignatureStatus> {
    let sidecar = signature_path_for(package);
    if !sidecar.exists() {
        return Ok(SignatureStatus::Unsigned);
    }

    let content = std::fs::read_to_string(&sidecar)?;
    let record: SignatureFile = serde_json::from_str(&content)
        .map_err(|e| RuntimeError::SignatureRejected(format!("malformed signature file: {e}")))?;

    if record.algorithm != SIGNATURE_ALGORITHM {
        return Err(RuntimeError::SignatureRejected(format!(
            "unsupported algorithm '{}'",
            record.algorithm
        )));
    }

    let key = trusted.get(&record.key_id).ok_or_else(|| {
        RuntimeError::SignatureRejected(format!("key '{}' is not trusted", record.key_id))
    })?;

    let embedded = decode_verifying_key(&record.public_key)?;
    if &embedded != key {
        return Err(RuntimeError::SignatureRejected(format!(
            "embedded public key does not match trusted key '{}'",
            record.key_id
        )));
    }

    let signature_bytes = BASE64
        .decode(&record.signature)
        .map_err(|e| RuntimeError::SignatureRejected(format!("invalid signature encoding: {e}")))?;
    let signature_bytes: [u8; 64] = signature_bytes
        .as_slice()
        .try_into()
        .map_err(|_| RuntimeError::SignatureRejected("signature has wrong length".to_string()))?;
    let signature = Signature::from_bytes(&signature_bytes);

    let digest = archive_digest(package)?;
    key.verify_strict(&digest, &signature)
        .map_err(|_| RuntimeError::SignatureRejected("signature does not match archive".to_string()))?;

    debug!(
        package = %package.display(),
        key_id = %record.key_id,
        "package signature verified"
    );

    Ok(SignatureStatus::Verified {
        key_id: record.key_id,
    })
}

/// SHA-256 digest of the raw archive bytes.
pub fn archive_digest(package: &Path) -> RuntimeResult<Vec<u8>> {
    let bytes = std::fs::read(package)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hasher.finalize().to_vec())
}

fn decode_verifying_key(encoded: &str) -> RuntimeResult<VerifyingKey> {
    let bytes = BASE64
        .decode(encoded)
        .map_err(|e| RuntimeError::SignatureRejected(format!("invalid key encoding: {e}")))?;
    let bytes: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| RuntimeError::SignatureRejected("key has wrong length".to_string()))?;
    VerifyingKey::from_bytes(&bytes)
        .map_err(|e| RuntimeError::SignatureRejected(format!("invalid public key: {e}")))
}
