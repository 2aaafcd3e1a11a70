//! Authorization artifact verification.
//!
//! An artifact is a JSON document issued by the authority:
//!
//! ```json
//! {
//!   "issuer": "76543210-K",
//!   "doc_type": "33",
//!   "start": 1001,
//!   "end": 2000,
//!   "authorized_at": "2026-05-01T12:00:00Z",
//!   "key_id": "sha256:…",
//!   "signature": "<base64 ed25519>"
//! }
//! ```
//!
//! The signature covers `issuer|doc_type|start|end|authorized_at` with the
//! timestamp in RFC 3339 (seconds, `Z`). Keys are identified by the SHA-256
//! of their SPKI DER encoding.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Months, SecondsFormat, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

use crate::error::{FolioError, FolioResult};

/// Wire form of an authorization artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationArtifact {
    pub issuer: String,
    pub doc_type: String,
    pub start: u64,
    pub end: u64,
    pub authorized_at: DateTime<Utc>,
    pub key_id: String,
    pub signature: String,
}

/// Facts established by a successful verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedArtifact {
    pub issuer: String,
    pub doc_type: String,
    pub start: u64,
    pub end: u64,
    pub authorized_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// `sha256:` digest of the raw artifact bytes.
    pub hash: String,
    pub key_id: String,
}

pub trait ArtifactVerifier: Send + Sync {
    fn verify(
        &self,
        raw: &[u8],
        expected_issuer: &str,
        expected_doc_type: &str,
        now: DateTime<Utc>,
    ) -> FolioResult<VerifiedArtifact>;
}

/// Bytes covered by the artifact signature.
pub fn signing_payload(
    issuer: &str,
    doc_type: &str,
    start: u64,
    end: u64,
    authorized_at: DateTime<Utc>,
) -> String {
    format!(
        "{issuer}|{doc_type}|{start}|{end}|{}",
        authorized_at.to_rfc3339_opts(SecondsFormat::Secs, true)
    )
}

/// `sha256:<hex>` of arbitrary bytes.
pub fn content_hash(raw: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(raw)))
}

/// Key id of a public key: `sha256:<hex>` of its SPKI DER encoding.
pub fn compute_key_id(key: &VerifyingKey) -> FolioResult<String> {
    use pkcs8::EncodePublicKey;
    let der = key
        .to_public_key_der()
        .map_err(|e| FolioError::Config {
            message: format!("failed to encode public key as SPKI DER: {e}"),
        })?;
    Ok(content_hash(der.as_bytes()))
}

/// Load an SPKI PEM public key.
pub fn load_public_key_pem(path: &Path) -> FolioResult<VerifyingKey> {
    use pkcs8::DecodePublicKey;

    let pem = std::fs::read_to_string(path).map_err(|e| FolioError::Config {
        message: format!("failed to read public key {}: {e}", path.display()),
    })?;
    VerifyingKey::from_public_key_pem(&pem).map_err(|e| FolioError::Config {
        message: format!("failed to parse public key PEM {}: {e}", path.display()),
    })
}

/// Produce a signed artifact. Used by authority simulators and tests.
pub fn sign_artifact(
    key: &SigningKey,
    issuer: &str,
    doc_type: &str,
    start: u64,
    end: u64,
    authorized_at: DateTime<Utc>,
) -> FolioResult<Vec<u8>> {
    let payload = signing_payload(issuer, doc_type, start, end, authorized_at);
    let signature = key.sign(payload.as_bytes());
    let artifact = AuthorizationArtifact {
        issuer: issuer.to_string(),
        doc_type: doc_type.to_string(),
        start,
        end,
        authorized_at,
        key_id: compute_key_id(&key.verifying_key())?,
        signature: BASE64.encode(signature.to_bytes()),
    };
    serde_json::to_vec_pretty(&artifact).map_err(|e| FolioError::InvalidArtifact {
        reason: e.to_string(),
    })
}

/// Verifies ed25519-signed JSON artifacts against a set of trusted keys.
#[derive(Debug, Clone)]
pub struct Ed25519ArtifactVerifier {
    trusted: HashMap<String, VerifyingKey>,
    validity_months: u32,
}

impl Ed25519ArtifactVerifier {
    pub fn new(validity_months: u32) -> Self {
        Self {
            trusted: HashMap::new(),
            validity_months,
        }
    }

    /// Trust `key`. Returns its key id.
    pub fn add_key(&mut self, key: VerifyingKey) -> FolioResult<String> {
        let key_id = compute_key_id(&key)?;
        self.trusted.insert(key_id.clone(), key);
        Ok(key_id)
    }

    pub fn with_key(mut self, key: VerifyingKey) -> FolioResult<Self> {
        self.add_key(key)?;
        Ok(self)
    }

    /// Build from PEM public key files.
    pub fn from_pem_files(paths: &[impl AsRef<Path>], validity_months: u32) -> FolioResult<Self> {
        let mut verifier = Self::new(validity_months);
        for path in paths {
            let key_id = verifier.add_key(load_public_key_pem(path.as_ref())?)?;
            debug!(key_id = %key_id, path = %path.as_ref().display(), "trusted artifact key loaded");
        }
        Ok(verifier)
    }

    pub fn trusted_key_ids(&self) -> Vec<&str> {
        self.trusted.keys().map(String::as_str).collect()
    }
}

impl ArtifactVerifier for Ed25519ArtifactVerifier {
    fn verify(
        &self,
        raw: &[u8],
        expected_issuer: &str,
        expected_doc_type: &str,
        now: DateTime<Utc>,
    ) -> FolioResult<VerifiedArtifact> {
        let artifact: AuthorizationArtifact =
            serde_json::from_slice(raw).map_err(|e| FolioError::InvalidArtifact {
                reason: format!("malformed artifact: {e}"),
            })?;

        if artifact.issuer != expected_issuer {
            return Err(FolioError::IssuerMismatch {
                expected: expected_issuer.to_string(),
                actual: artifact.issuer,
            });
        }
        if artifact.doc_type != expected_doc_type {
            return Err(FolioError::InvalidArtifact {
                reason: format!(
                    "document type mismatch: expected {expected_doc_type}, artifact has {}",
                    artifact.doc_type
                ),
            });
        }
        if artifact.start < 1 || artifact.end < artifact.start {
            return Err(FolioError::InvalidArtifact {
                reason: format!("invalid bounds {}..={}", artifact.start, artifact.end),
            });
        }

        let key = self
            .trusted
            .get(&artifact.key_id)
            .ok_or_else(|| FolioError::SignatureInvalid {
                reason: format!("key not trusted: {}", artifact.key_id),
            })?;

        let signature_bytes =
            BASE64
                .decode(&artifact.signature)
                .map_err(|e| FolioError::SignatureInvalid {
                    reason: format!("invalid base64 signature: {e}"),
                })?;
        let signature =
            Signature::from_slice(&signature_bytes).map_err(|e| FolioError::SignatureInvalid {
                reason: format!("invalid signature bytes: {e}"),
            })?;

        let payload = signing_payload(
            &artifact.issuer,
            &artifact.doc_type,
            artifact.start,
            artifact.end,
            artifact.authorized_at,
        );
        key.verify(payload.as_bytes(), &signature)
            .map_err(|_| FolioError::SignatureInvalid {
                reason: "ed25519 verification failed".to_string(),
            })?;

        let expires_at = artifact
            .authorized_at
            .checked_add_months(Months::new(self.validity_months))
            .ok_or_else(|| FolioError::InvalidArtifact {
                reason: "expiry out of range".to_string(),
            })?;
        if expires_at <= now {
            return Err(FolioError::InvalidArtifact {
                reason: format!("authorization expired at {expires_at}"),
            });
        }

        Ok(VerifiedArtifact {
            issuer: artifact.issuer,
            doc_type: artifact.doc_type,
            start: artifact.start,
            end: artifact.end,
            authorized_at: artifact.authorized_at,
            expires_at,
            hash: content_hash(raw),
            key_id: artifact.key_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn keypair() -> (SigningKey, Ed25519ArtifactVerifier) {
        let signing_key = SigningKey::generate(&mut rand::thread_rng());
        let verifier = Ed25519ArtifactVerifier::new(6)
            .with_key(signing_key.verifying_key())
            .unwrap();
        (signing_key, verifier)
    }

    fn authorized_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_valid_artifact_verifies() {
        let (key, verifier) = keypair();
        let raw = sign_artifact(&key, "76543210-K", "33", 1001, 2000, authorized_at()).unwrap();

        let verified = verifier
            .verify(&raw, "76543210-K", "33", authorized_at() + Duration::days(1))
            .unwrap();
        assert_eq!(verified.start, 1001);
        assert_eq!(verified.end, 2000);
        assert_eq!(
            verified.expires_at,
            Utc.with_ymd_and_hms(2026, 11, 1, 12, 0, 0).unwrap()
        );
        assert_eq!(verified.hash, content_hash(&raw));
        assert!(verified.hash.starts_with("sha256:"));
    }

    #[test]
    fn test_tampered_bounds_fail_signature() {
        let (key, verifier) = keypair();
        let raw = sign_artifact(&key, "76543210-K", "33", 1001, 2000, authorized_at()).unwrap();
        let mut artifact: AuthorizationArtifact = serde_json::from_slice(&raw).unwrap();
        artifact.end = 9000;
        let tampered = serde_json::to_vec(&artifact).unwrap();

        assert!(matches!(
            verifier.verify(&tampered, "76543210-K", "33", authorized_at()),
            Err(FolioError::SignatureInvalid { .. })
        ));
    }

    #[test]
    fn test_untrusted_key_is_rejected() {
        let (_, verifier) = keypair();
        let other = SigningKey::generate(&mut rand::thread_rng());
        let raw = sign_artifact(&other, "76543210-K", "33", 1, 10, authorized_at()).unwrap();
        assert!(matches!(
            verifier.verify(&raw, "76543210-K", "33", authorized_at()),
            Err(FolioError::SignatureInvalid { .. })
        ));
    }

    #[test]
    fn test_issuer_and_type_mismatch() {
        let (key, verifier) = keypair();
        let raw = sign_artifact(&key, "11111111-1", "33", 1, 10, authorized_at()).unwrap();
        assert!(matches!(
            verifier.verify(&raw, "76543210-K", "33", authorized_at()),
            Err(FolioError::IssuerMismatch { .. })
        ));
        assert!(matches!(
            verifier.verify(&raw, "11111111-1", "61", authorized_at()),
            Err(FolioError::InvalidArtifact { .. })
        ));
    }

    #[test]
    fn test_expired_and_malformed_artifacts() {
        let (key, verifier) = keypair();
        let raw = sign_artifact(&key, "76543210-K", "33", 1, 10, authorized_at()).unwrap();
        assert!(matches!(
            verifier.verify(&raw, "76543210-K", "33", authorized_at() + Duration::days(200)),
            Err(FolioError::InvalidArtifact { .. })
        ));
        assert!(matches!(
            verifier.verify(b"<caf/>", "76543210-K", "33", authorized_at()),
            Err(FolioError::InvalidArtifact { .. })
        ));
    }

    #[test]
    fn test_key_id_is_stable() {
        let key = SigningKey::generate(&mut rand::thread_rng());
        let a = compute_key_id(&key.verifying_key()).unwrap();
        let b = compute_key_id(&key.verifying_key()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), "sha256:".len() + 64);
    }
}
