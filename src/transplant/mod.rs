//! Memory transplant: signed export/import of memory packages between
//! ENGRAM agents (spec.md §4.10).

use serde::{Deserialize, Serialize};

use crate::identity::Identity;
use crate::memory::MemoryUnit;
use crate::storage::{QueryFilter, Store, StorageError};

#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum TransplantError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("package has no signature")]
    Unsigned,
    #[error("signature does not verify")]
    InvalidSignature,
    #[error("package signed by untrusted agent: {0}")]
    UntrustedAgent(String),
}

pub type Result<T> = std::result::Result<T, TransplantError>;

/// The format version this crate writes and reads.
pub const PACKAGE_VERSION: &str = "engram-transplant-v1";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransplantPackage {
    pub version: String,
    pub exported_at: chrono::DateTime<chrono::Utc>,
    pub agent_id: String,
    pub unit_count: usize,
    pub units: Vec<MemoryUnit>,
    pub metadata: serde_json::Value,
    /// Absent while building the package, present once signed. Signing
    /// covers the canonical JSON of every other field.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl TransplantPackage {
    fn unsigned_payload(&self) -> std::result::Result<String, serde_json::Error> {
        #[derive(Serialize)]
        struct Unsigned<'a> {
            version: &'a str,
            exported_at: chrono::DateTime<chrono::Utc>,
            agent_id: &'a str,
            unit_count: usize,
            units: &'a [MemoryUnit],
            metadata: &'a serde_json::Value,
        }
        serde_json::to_string(&Unsigned {
            version: &self.version,
            exported_at: self.exported_at,
            agent_id: &self.agent_id,
            unit_count: self.unit_count,
            units: &self.units,
            metadata: &self.metadata,
        })
    }
}

pub struct Transplant<'a> {
    store: &'a Store,
    identity: &'a Identity,
}

impl<'a> Transplant<'a> {
    pub fn new(store: &'a Store, identity: &'a Identity) -> Self {
        Self { store, identity }
    }

    /// Build and sign a package containing the given unit ids.
    pub fn export_package(&self, unit_ids: &[String], metadata: serde_json::Value) -> Result<Option<TransplantPackage>> {
        let mut units = Vec::new();
        for id in unit_ids {
            if let Some(unit) = self.store.get(id)? {
                units.push(unit);
            }
        }
        if units.is_empty() {
            return Ok(None);
        }

        let mut package = TransplantPackage {
            version: PACKAGE_VERSION.to_string(),
            exported_at: chrono::Utc::now(),
            agent_id: self.identity.public_key_b64(),
            unit_count: units.len(),
            units,
            metadata,
            signature: None,
        };
        let payload = package.unsigned_payload()?;
        package.signature = Some(self.identity.sign(&payload));
        Ok(Some(package))
    }

    /// Export every active memory carrying any of `tags`, up to `limit`.
    pub fn export_by_tags(&self, tags: &[String], limit: usize) -> Result<Option<TransplantPackage>> {
        let mut filter = QueryFilter::new();
        filter.limit = 1000;
        let all = self.store.query(&filter)?;
        let matching: Vec<String> = all
            .into_iter()
            .filter(|m| tags.iter().any(|t| m.tags.contains(t)))
            .take(limit)
            .map(|m| m.id)
            .collect();

        self.export_package(&matching, serde_json::json!({ "filter_tags": tags }))
    }

    /// Verify a package's signature, optionally against a set of trusted
    /// agent public keys.
    pub fn verify_package(&self, package: &TransplantPackage, trusted_keys: Option<&[String]>) -> Result<()> {
        let Some(signature) = &package.signature else {
            return Err(TransplantError::Unsigned);
        };

        if let Some(trusted) = trusted_keys {
            if !trusted.iter().any(|k| k == &package.agent_id) {
                return Err(TransplantError::UntrustedAgent(package.agent_id.clone()));
            }
        }

        let payload = package.unsigned_payload()?;
        if !self.identity.verify(&payload, signature, Some(&package.agent_id)) {
            return Err(TransplantError::InvalidSignature);
        }
        Ok(())
    }

    /// Import a verified package. Units land inactive with a `proposal` tag
    /// unless `auto_accept` is set, in which case they're immediately
    /// active and tagged `accepted`.
    pub fn import_package(
        &self,
        package: &TransplantPackage,
        trust_score: f32,
        auto_accept: bool,
        trusted_keys: Option<&[String]>,
    ) -> Result<Vec<MemoryUnit>> {
        if let Err(e) = self.verify_package(package, trusted_keys) {
            tracing::warn!(agent = %package.agent_id, error = %e, "transplant package failed verification, rejecting import");
            return Ok(Vec::new());
        }

        let mut imported = Vec::new();
        for unit in &package.units {
            let mut unit = unit.clone();
            unit.source_agent = Some(package.agent_id.clone());
            unit.trust_score = trust_score;

            if auto_accept {
                unit.active = true;
                unit.tags.insert("transplant".to_string());
                unit.tags.insert("accepted".to_string());
            } else {
                unit.active = false;
                unit.tags.insert("transplant".to_string());
                unit.tags.insert("proposal".to_string());
            }

            self.store.put(&unit)?;
            imported.push(unit);
        }

        tracing::info!(
            count = imported.len(),
            agent = %package.agent_id,
            accepted = auto_accept,
            "transplant imported"
        );
        Ok(imported)
    }

    /// Pending transplant proposals: inactive units tagged `proposal`.
    pub fn list_proposals(&self) -> Result<Vec<MemoryUnit>> {
        let mut filter = QueryFilter::new();
        filter.active_only = false;
        filter.limit = 1000;
        let all = self.store.query(&filter)?;
        Ok(all.into_iter().filter(|m| !m.active && m.tags.contains("proposal")).collect())
    }

    /// Accept a pending proposal: activate it and swap its `proposal` tag
    /// for `accepted`.
    pub fn accept_proposal(&self, unit_id: &str) -> Result<()> {
        let Some(mut unit) = self.store.get(unit_id)? else {
            return Ok(());
        };
        unit.active = true;
        unit.tags.remove("proposal");
        unit.tags.insert("accepted".to_string());
        self.store.update_unit(&unit)?;
        Ok(())
    }

    /// Reject a pending proposal: delete it permanently.
    pub fn reject_proposal(&self, unit_id: &str) -> Result<()> {
        self.store.delete(unit_id)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryKind;

    fn setup() -> (Store, Identity) {
        let store = Store::open_in_memory(2).unwrap();
        let dir = std::env::temp_dir().join(format!("engram-transplant-{}", uuid::Uuid::new_v4()));
        let identity = Identity::load_or_create(&dir).unwrap();
        (store, identity)
    }

    #[test]
    fn export_then_verify_roundtrips() {
        let (store, identity) = setup();
        let unit = MemoryUnit::new("shared fact", MemoryKind::Semantic, String::new());
        store.put(&unit).unwrap();

        let transplant = Transplant::new(&store, &identity);
        let package = transplant
            .export_package(&[unit.id.clone()], serde_json::json!({}))
            .unwrap()
            .unwrap();

        transplant.verify_package(&package, None).unwrap();
    }

    #[test]
    fn tampered_package_fails_verification() {
        let (store, identity) = setup();
        let unit = MemoryUnit::new("shared fact", MemoryKind::Semantic, String::new());
        store.put(&unit).unwrap();

        let transplant = Transplant::new(&store, &identity);
        let mut package = transplant
            .export_package(&[unit.id.clone()], serde_json::json!({}))
            .unwrap()
            .unwrap();
        package.units[0].content = "tampered".to_string();

        let err = transplant.verify_package(&package, None).unwrap_err();
        assert!(matches!(err, TransplantError::InvalidSignature));
    }

    #[test]
    fn import_of_tampered_package_returns_empty() {
        let (store, identity) = setup();
        let unit = MemoryUnit::new("shared fact", MemoryKind::Semantic, String::new());
        store.put(&unit).unwrap();

        let transplant = Transplant::new(&store, &identity);
        let mut package = transplant
            .export_package(&[unit.id.clone()], serde_json::json!({}))
            .unwrap()
            .unwrap();
        package.units[0].content = "tampered".to_string();

        let imported = transplant.import_package(&package, 0.85, false, None).unwrap();
        assert!(imported.is_empty());
    }

    #[test]
    fn import_as_proposal_lands_inactive() {
        let (store, identity) = setup();
        let unit = MemoryUnit::new("shared fact", MemoryKind::Semantic, String::new());
        store.put(&unit).unwrap();
        let transplant = Transplant::new(&store, &identity);
        let package = transplant
            .export_package(&[unit.id.clone()], serde_json::json!({}))
            .unwrap()
            .unwrap();

        let imported = transplant.import_package(&package, 0.85, false, None).unwrap();
        assert_eq!(imported.len(), 1);
        assert!(!imported[0].active);

        let proposals = transplant.list_proposals().unwrap();
        assert_eq!(proposals.len(), 1);

        transplant.accept_proposal(&imported[0].id).unwrap();
        assert!(transplant.list_proposals().unwrap().is_empty());
    }
}
