//! Agent identity: an Ed25519 keypair that signs every [`MemoryUnit`], and
//! the chain/attestation machinery built on top of it (spec.md §4.3).
//!
//! The keypair is generated on first use and persisted under
//! `identity_dir/keypair.json`; every subsequent [`Identity::load_or_create`]
//! call on the same directory resumes the same agent identity.

use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::memory::MemoryUnit;

#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed keypair file: {0}")]
    MalformedKeypair(String),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, IdentityError>;

#[derive(Serialize, Deserialize)]
struct KeypairFile {
    seed: String,
    public_key: String,
    created: chrono::DateTime<chrono::Utc>,
}

/// A signed wakeup attestation, proving at session start that this agent's
/// key produced the current chain root (spec.md §4.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WakeupAttestation {
    #[serde(rename = "type")]
    pub kind: String,
    pub agent_id: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub root_hash: String,
    pub last_consolidation: Option<chrono::DateTime<chrono::Utc>>,
    pub signature: String,
}

/// Outcome of [`Identity::verify_chain`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainVerdict {
    Valid,
    BrokenAt(String),
}

pub struct Identity {
    signing_key: SigningKey,
    keypair_path: PathBuf,
    attestation_path: PathBuf,
}

impl Identity {
    /// Load the keypair at `identity_dir/keypair.json`, or generate and
    /// persist a new one if absent.
    pub fn load_or_create(identity_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(identity_dir)?;
        let keypair_path = identity_dir.join("keypair.json");
        let attestation_path = identity_dir.join("attestations.jsonl");

        let signing_key = if keypair_path.exists() {
            let raw = std::fs::read_to_string(&keypair_path)?;
            let file: KeypairFile = serde_json::from_str(&raw)?;
            let seed_bytes = BASE64
                .decode(file.seed.as_bytes())
                .map_err(|e| IdentityError::MalformedKeypair(e.to_string()))?;
            let seed: [u8; 32] = seed_bytes
                .try_into()
                .map_err(|_| IdentityError::MalformedKeypair("seed is not 32 bytes".into()))?;
            SigningKey::from_bytes(&seed)
        } else {
            let signing_key = SigningKey::generate(&mut OsRng);
            let file = KeypairFile {
                seed: BASE64.encode(signing_key.to_bytes()),
                public_key: BASE64.encode(signing_key.verifying_key().to_bytes()),
                created: chrono::Utc::now(),
            };
            std::fs::write(&keypair_path, serde_json::to_string_pretty(&file)?)?;
            tracing::info!(public_key = %file.public_key, "new identity created");
            signing_key
        };

        Ok(Self {
            signing_key,
            keypair_path,
            attestation_path,
        })
    }

    pub fn public_key_b64(&self) -> String {
        BASE64.encode(self.signing_key.verifying_key().to_bytes())
    }

    /// Sign arbitrary text, base64-encoded.
    pub fn sign(&self, data: &str) -> String {
        let sig: Signature = self.signing_key.sign(data.as_bytes());
        BASE64.encode(sig.to_bytes())
    }

    /// Verify a base64 signature over `data`, against `public_key_b64` if
    /// given, or this identity's own key otherwise.
    pub fn verify(&self, data: &str, signature_b64: &str, public_key_b64: Option<&str>) -> bool {
        let verifying_key = match public_key_b64 {
            Some(pk) => match decode_verifying_key(pk) {
                Ok(k) => k,
                Err(_) => return false,
            },
            None => self.signing_key.verifying_key(),
        };
        let sig_bytes = match BASE64.decode(signature_b64.as_bytes()) {
            Ok(b) => b,
            Err(_) => return false,
        };
        let sig_bytes: [u8; 64] = match sig_bytes.try_into() {
            Ok(b) => b,
            Err(_) => return false,
        };
        let signature = Signature::from_bytes(&sig_bytes);
        verifying_key.verify(data.as_bytes(), &signature).is_ok()
    }

    /// Sign a unit's `content_hash`, the signature ENGRAM stores alongside it.
    pub fn sign_memory(&self, unit: &MemoryUnit) -> String {
        self.sign(&unit.content_hash())
    }

    pub fn verify_memory(&self, unit: &MemoryUnit, public_key_b64: Option<&str>) -> bool {
        if unit.signature.is_empty() {
            return false;
        }
        self.verify(&unit.content_hash(), &unit.signature, public_key_b64)
    }

    /// Build, sign, and append a wakeup attestation to the log.
    pub fn wakeup_attestation(
        &self,
        root_hash: &str,
        last_consolidation: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<WakeupAttestation> {
        let mut attestation = WakeupAttestation {
            kind: "wakeup".to_string(),
            agent_id: self.public_key_b64(),
            timestamp: chrono::Utc::now(),
            root_hash: root_hash.to_string(),
            last_consolidation,
            signature: String::new(),
        };
        // Sign the canonical (unsigned) form, matching the signed payload
        // a verifier would reconstruct.
        let payload = serde_json::to_string(&UnsignedAttestation {
            kind: &attestation.kind,
            agent_id: &attestation.agent_id,
            timestamp: attestation.timestamp,
            root_hash: &attestation.root_hash,
            last_consolidation: attestation.last_consolidation,
        })?;
        attestation.signature = self.sign(&payload);

        use std::io::Write;
        let mut log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.attestation_path)?;
        writeln!(log, "{}", serde_json::to_string(&attestation)?)?;

        Ok(attestation)
    }

    /// Walk `memories` in timestamp order, checking each unit's `prev_hash`
    /// links to the previous unit's `content_hash` and, if signed, that its
    /// signature verifies. Returns the id of the first broken link.
    pub fn verify_chain(&self, memories: &[MemoryUnit]) -> ChainVerdict {
        let mut ordered: Vec<&MemoryUnit> = memories.iter().collect();
        ordered.sort_by_key(|m| m.timestamp);

        let mut prev_hash = String::new();
        for m in ordered {
            if !prev_hash.is_empty() && m.prev_hash != prev_hash {
                return ChainVerdict::BrokenAt(m.id.clone());
            }
            if !m.signature.is_empty() && !self.verify_memory(m, None) {
                return ChainVerdict::BrokenAt(m.id.clone());
            }
            prev_hash = m.content_hash();
        }
        ChainVerdict::Valid
    }

    /// Merkle root over every unit's `content_hash`, duplicating the final
    /// hash at each level with an odd count. `"empty"`'s hash for an empty
    /// store.
    pub fn compute_root_hash(&self, memories: &[MemoryUnit]) -> String {
        if memories.is_empty() {
            let mut hasher = Sha256::new();
            hasher.update(b"empty");
            return hex::encode(hasher.finalize());
        }

        let mut ordered: Vec<&MemoryUnit> = memories.iter().collect();
        ordered.sort_by_key(|m| m.timestamp);
        let mut hashes: Vec<String> = ordered.iter().map(|m| m.content_hash()).collect();

        while hashes.len() > 1 {
            if hashes.len() % 2 == 1 {
                let last = hashes.last().unwrap().clone();
                hashes.push(last);
            }
            let mut next_level = Vec::with_capacity(hashes.len() / 2);
            for pair in hashes.chunks(2) {
                let mut hasher = Sha256::new();
                hasher.update(pair[0].as_bytes());
                hasher.update(pair[1].as_bytes());
                next_level.push(hex::encode(hasher.finalize()));
            }
            hashes = next_level;
        }
        hashes.into_iter().next().unwrap()
    }

    pub fn keypair_path(&self) -> &Path {
        &self.keypair_path
    }
}

#[derive(Serialize)]
struct UnsignedAttestation<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    agent_id: &'a str,
    timestamp: chrono::DateTime<chrono::Utc>,
    root_hash: &'a str,
    last_consolidation: Option<chrono::DateTime<chrono::Utc>>,
}

fn decode_verifying_key(b64: &str) -> std::result::Result<VerifyingKey, ()> {
    let bytes = BASE64.decode(b64.as_bytes()).map_err(|_| ())?;
    let bytes: [u8; 32] = bytes.try_into().map_err(|_| ())?;
    VerifyingKey::from_bytes(&bytes).map_err(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryKind;

    fn identity() -> Identity {
        let dir = std::env::temp_dir().join(format!("engram-identity-{}", uuid::Uuid::new_v4()));
        Identity::load_or_create(&dir).unwrap()
    }

    #[test]
    fn sign_and_verify_roundtrip() {
        let id = identity();
        let sig = id.sign("hello");
        assert!(id.verify("hello", &sig, None));
    }

    #[test]
    fn tampered_data_fails_verification() {
        let id = identity();
        let sig = id.sign("hello");
        assert!(!id.verify("goodbye", &sig, None));
    }

    #[test]
    fn sign_memory_roundtrips() {
        let id = identity();
        let mut unit = MemoryUnit::new("remember this", MemoryKind::Episodic, String::new());
        unit.signature = id.sign_memory(&unit);
        assert!(id.verify_memory(&unit, None));
    }

    #[test]
    fn verify_chain_detects_broken_link() {
        let id = identity();
        let mut a = MemoryUnit::new("first", MemoryKind::Episodic, String::new());
        a.signature = id.sign_memory(&a);
        let mut b = MemoryUnit::new("second", MemoryKind::Episodic, "wrong-hash".to_string());
        b.timestamp = a.timestamp + chrono::Duration::seconds(1);
        b.signature = id.sign_memory(&b);
        assert_eq!(
            id.verify_chain(&[a, b.clone()]),
            ChainVerdict::BrokenAt(b.id)
        );
    }

    #[test]
    fn verify_chain_accepts_linked_units() {
        let id = identity();
        let mut a = MemoryUnit::new("first", MemoryKind::Episodic, String::new());
        a.signature = id.sign_memory(&a);
        let mut b = MemoryUnit::new("second", MemoryKind::Episodic, a.content_hash());
        b.timestamp = a.timestamp + chrono::Duration::seconds(1);
        b.signature = id.sign_memory(&b);
        assert_eq!(id.verify_chain(&[a, b]), ChainVerdict::Valid);
    }

    #[test]
    fn empty_root_hash_is_stable() {
        let id = identity();
        assert_eq!(id.compute_root_hash(&[]), id.compute_root_hash(&[]));
    }
}
