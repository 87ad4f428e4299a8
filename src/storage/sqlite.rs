//! SQLite-backed [`Store`]: the durable, keyed + vector store for
//! [`MemoryUnit`]s (spec.md §4.1).
//!
//! Mirrors the reader/writer split used elsewhere in the corpus for
//! SQLite-backed stores: a dedicated writer connection serializes mutation
//! (and is held for the duration of a hash-chain batch, spec.md §5), while a
//! separate reader connection lets queries proceed without blocking behind
//! a long write. Vector search runs over an in-memory cache of active
//! embeddings rather than an external index — the "embedded columnar" path
//! spec.md §9 calls out as the one to implement.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::embedder::cosine_similarity;
use crate::memory::{EmotionVector, MemoryKind, MemoryUnit, Relation};

use super::migrations::SCHEMA;

/// Errors raised by the storage layer (spec.md §7).
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Writing an embedding whose length disagrees with the store's
    /// declared dimension. The one variant in this taxonomy that is fatal
    /// and propagated (spec.md §7).
    #[error("embedding has dimension {got}, store expects {expected}")]
    DimensionMismatch { expected: usize, got: usize },
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Filters accepted by [`Store::query`].
#[derive(Debug, Clone, Default)]
pub struct QueryFilter {
    pub kind: Option<MemoryKind>,
    pub active_only: bool,
    pub min_salience: f32,
    pub unconsolidated_only: bool,
    pub limit: usize,
}

impl QueryFilter {
    pub fn new() -> Self {
        Self {
            active_only: true,
            limit: 100,
            ..Default::default()
        }
    }
}

pub struct Store {
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
    /// In-memory cache of active embeddings, id -> vector, rebuilt at open
    /// and kept in sync on every mutating call.
    vectors: Mutex<HashMap<String, Vec<f32>>>,
    episodic_log: Mutex<std::fs::File>,
    dimension: usize,
}

impl Store {
    /// Open (or create) a store backed by `data_dir/engram.db` and
    /// `data_dir/episodic.jsonl`, per spec.md §6's on-disk layout.
    /// `dimension` is the fixed embedding width this store accepts.
    pub fn open(data_dir: &Path, dimension: usize) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let db_path = data_dir.join("engram.db");
        let store = Self::open_connections(
            Connection::open(&db_path)?,
            Connection::open(&db_path)?,
            data_dir.join("episodic.jsonl"),
            dimension,
        )?;
        Ok(store)
    }

    /// Open an ephemeral in-memory store, for tests.
    pub fn open_in_memory(dimension: usize) -> Result<Self> {
        let jsonl = std::env::temp_dir().join(format!("engram-test-{}.jsonl", uuid::Uuid::new_v4()));
        Self::open_connections(
            Connection::open_in_memory()?,
            Connection::open_in_memory()?,
            jsonl,
            dimension,
        )
    }

    fn open_connections(
        writer: Connection,
        reader: Connection,
        jsonl_path: PathBuf,
        dimension: usize,
    ) -> Result<Self> {
        writer.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        writer.execute_batch(SCHEMA)?;

        let episodic_log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&jsonl_path)?;

        let store = Self {
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
            vectors: Mutex::new(HashMap::new()),
            episodic_log: Mutex::new(episodic_log),
            dimension,
        };
        store.load_vectors()?;
        Ok(store)
    }

    fn load_vectors(&self) -> Result<()> {
        let conn = self.reader.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT id, embedding FROM memories WHERE active=1 AND embedding IS NOT NULL")?;
        let mut vectors = self.vectors.lock().unwrap();
        let rows = stmt.query_map([], |row| {
            let id: String = row.get(0)?;
            let blob: Vec<u8> = row.get(1)?;
            Ok((id, decode_embedding(&blob)))
        })?;
        for row in rows {
            let (id, vec) = row?;
            vectors.insert(id, vec);
        }
        Ok(())
    }

    /// The fixed embedding dimension this store was opened with.
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Insert or replace a unit by id. Appends to the episodic audit log if
    /// `kind == Episodic`. Fails with [`StorageError::DimensionMismatch`] if
    /// the embedding is non-empty and disagrees with the store's dimension.
    pub fn put(&self, unit: &MemoryUnit) -> Result<()> {
        if !unit.embedding.is_empty() && unit.embedding.len() != self.dimension {
            return Err(StorageError::DimensionMismatch {
                expected: self.dimension,
                got: unit.embedding.len(),
            });
        }

        let embedding_blob = if unit.embedding.is_empty() {
            None
        } else {
            Some(encode_embedding(&unit.embedding))
        };

        {
            let conn = self.writer.lock().unwrap();
            conn.execute(
                "INSERT OR REPLACE INTO memories
                 (id, kind, content, timestamp, salience, emotion_vector, tags, relations,
                  decay_rate, version, prev_hash, signature, consolidated_ts,
                  trigger_condition, action, source_agent, trust_score,
                  maintenance_cost, retrieval_count, last_accessed, active, embedding)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21,?22)",
                params![
                    unit.id,
                    unit.kind.as_str(),
                    unit.content,
                    unit.timestamp.to_rfc3339(),
                    unit.salience,
                    serde_json::to_string(&unit.emotion_vector).unwrap(),
                    serde_json::to_string(&unit.tags).unwrap(),
                    serde_json::to_string(&unit.relations).unwrap(),
                    unit.decay_rate,
                    unit.version,
                    unit.prev_hash,
                    unit.signature,
                    unit.consolidated_ts.map(|t| t.to_rfc3339()),
                    unit.trigger_condition,
                    unit.action.as_ref().map(|a| a.to_string()),
                    unit.source_agent,
                    unit.trust_score,
                    unit.maintenance_cost,
                    unit.retrieval_count,
                    unit.last_accessed.to_rfc3339(),
                    unit.active as i64,
                    embedding_blob,
                ],
            )?;
        }

        {
            let mut vectors = self.vectors.lock().unwrap();
            if unit.active && !unit.embedding.is_empty() {
                vectors.insert(unit.id.clone(), unit.embedding.clone());
            } else {
                vectors.remove(&unit.id);
            }
        }

        if unit.kind == MemoryKind::Episodic {
            use std::io::Write;
            let mut log = self.episodic_log.lock().unwrap();
            let line = serde_json::to_string(unit).unwrap();
            writeln!(log, "{line}")?;
        }

        Ok(())
    }

    /// Convenience alias matching the orchestrator's naming (spec.md §4.10
    /// calls this `update_unit`).
    pub fn update_unit(&self, unit: &MemoryUnit) -> Result<()> {
        self.put(unit)
    }

    pub fn get(&self, id: &str) -> Result<Option<MemoryUnit>> {
        let conn = self.reader.lock().unwrap();
        let unit = conn
            .query_row("SELECT * FROM memories WHERE id = ?1", params![id], |row| {
                row_to_unit(row)
            })
            .optional()?;
        Ok(unit)
    }

    pub fn query(&self, filter: &QueryFilter) -> Result<Vec<MemoryUnit>> {
        let conn = self.reader.lock().unwrap();
        let mut conditions = Vec::new();
        let mut bound: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if filter.active_only {
            conditions.push("active=1".to_string());
        }
        if let Some(kind) = filter.kind {
            conditions.push(format!("kind=?{}", bound.len() + 1));
            bound.push(Box::new(kind.as_str().to_string()));
        }
        if filter.min_salience > 0.0 {
            conditions.push(format!("salience>=?{}", bound.len() + 1));
            bound.push(Box::new(filter.min_salience));
        }
        if filter.unconsolidated_only {
            conditions.push("consolidated_ts IS NULL AND kind='episodic'".to_string());
        }

        let where_clause = if conditions.is_empty() {
            "1=1".to_string()
        } else {
            conditions.join(" AND ")
        };
        let limit_idx = bound.len() + 1;
        let sql = format!(
            "SELECT * FROM memories WHERE {where_clause} ORDER BY timestamp DESC LIMIT ?{limit_idx}"
        );

        let mut stmt = conn.prepare(&sql)?;
        let params_refs: Vec<&dyn rusqlite::ToSql> =
            bound.iter().map(|b| b.as_ref()).chain(std::iter::once(&filter.limit as &dyn rusqlite::ToSql)).collect();
        let rows = stmt.query_map(params_refs.as_slice(), row_to_unit)?;

        let mut units = Vec::new();
        for row in rows {
            match row {
                Ok(u) => units.push(u),
                Err(e) => tracing::warn!("skipping corrupt memory row: {e}"),
            }
        }
        Ok(units)
    }

    /// Cosine similarity search over the in-memory active-vector cache.
    /// Returns `(id, similarity)` pairs, `top_k` highest first.
    pub fn vector_search(
        &self,
        query_embedding: &[f32],
        top_k: usize,
        kind_filter: Option<MemoryKind>,
        min_salience: f32,
    ) -> Result<Vec<(String, f32)>> {
        if query_embedding.is_empty() {
            return Ok(Vec::new());
        }
        let vectors = self.vectors.lock().unwrap();
        if vectors.is_empty() {
            return Ok(Vec::new());
        }

        // Filter by kind/salience requires a row lookup; keep it to the
        // candidate set already narrowed by the vector cache (active only).
        let mut scored: Vec<(String, f32)> = Vec::new();
        for (id, vec) in vectors.iter() {
            if kind_filter.is_some() || min_salience > 0.0 {
                if let Some(unit) = self.get(id)? {
                    if let Some(k) = kind_filter {
                        if unit.kind != k {
                            continue;
                        }
                    }
                    if unit.salience < min_salience {
                        continue;
                    }
                }
            }
            scored.push((id.clone(), cosine_similarity(query_embedding, vec)));
        }

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);
        Ok(scored)
    }

    pub fn update_access(&self, id: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let conn = self.writer.lock().unwrap();
        conn.execute(
            "UPDATE memories SET retrieval_count = retrieval_count + 1, last_accessed = ?1 WHERE id = ?2",
            params![now, id],
        )?;
        Ok(())
    }

    pub fn deactivate(&self, id: &str) -> Result<()> {
        {
            let conn = self.writer.lock().unwrap();
            conn.execute("UPDATE memories SET active=0 WHERE id=?1", params![id])?;
        }
        self.vectors.lock().unwrap().remove(id);
        Ok(())
    }

    /// Re-activate a unit — only legitimate callers are
    /// [`crate::transplant::Transplant::accept_proposal`] and
    /// [`crate::anchoring::Anchoring::anchor`] clearing a prior demotion
    /// (invariant 5, spec.md §3).
    pub fn reactivate(&self, id: &str) -> Result<()> {
        let conn = self.writer.lock().unwrap();
        conn.execute("UPDATE memories SET active=1 WHERE id=?1", params![id])?;
        drop(conn);
        if let Some(unit) = self.get(id)? {
            if !unit.embedding.is_empty() {
                self.vectors.lock().unwrap().insert(id.to_string(), unit.embedding);
            }
        }
        Ok(())
    }

    /// Permanently remove a unit (spec.md §4.10: rejecting a transplant
    /// proposal deletes it rather than deactivating it).
    pub fn delete(&self, id: &str) -> Result<()> {
        {
            let conn = self.writer.lock().unwrap();
            conn.execute("DELETE FROM memories WHERE id=?1", params![id])?;
        }
        self.vectors.lock().unwrap().remove(id);
        Ok(())
    }

    pub fn mark_consolidated(&self, id: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let conn = self.writer.lock().unwrap();
        conn.execute(
            "UPDATE memories SET consolidated_ts=?1 WHERE id=?2 AND consolidated_ts IS NULL",
            params![now, id],
        )?;
        Ok(())
    }

    pub fn count(&self, kind: Option<MemoryKind>, active_only: bool) -> Result<i64> {
        let conn = self.reader.lock().unwrap();
        let count = match (kind, active_only) {
            (Some(k), true) => conn.query_row(
                "SELECT COUNT(*) FROM memories WHERE active=1 AND kind=?1",
                params![k.as_str()],
                |r| r.get(0),
            )?,
            (Some(k), false) => conn.query_row(
                "SELECT COUNT(*) FROM memories WHERE kind=?1",
                params![k.as_str()],
                |r| r.get(0),
            )?,
            (None, true) => conn.query_row("SELECT COUNT(*) FROM memories WHERE active=1", [], |r| r.get(0))?,
            (None, false) => conn.query_row("SELECT COUNT(*) FROM memories", [], |r| r.get(0))?,
        };
        Ok(count)
    }

    /// `content_hash` of the most recent unit by timestamp, or `""` for an
    /// empty store (spec.md §4.1/§4.3). This is what makes chain-linking a
    /// local operation: the caller reads this once under the writer's lock
    /// and uses it as `prev_hash` for the next unit.
    pub fn get_last_hash(&self) -> Result<String> {
        let conn = self.reader.lock().unwrap();
        let row: Option<(String,)> = conn
            .query_row("SELECT * FROM memories ORDER BY timestamp DESC LIMIT 1", [], |row| {
                Ok((row_to_unit(row)?.content_hash(),))
            })
            .optional()?;
        Ok(row.map(|(h,)| h).unwrap_or_default())
    }

    /// `(id, maintenance_cost, utility_score)` for every active unit,
    /// sorted by utility ascending — the eviction order for
    /// [`crate::metabolism::Metabolism::metabolize`] (spec.md §4.1/§4.6).
    pub fn all_active_costs(&self) -> Result<Vec<(String, f32, f32)>> {
        let conn = self.reader.lock().unwrap();
        let mut stmt = conn.prepare("SELECT * FROM memories WHERE active=1")?;
        let rows = stmt.query_map([], row_to_unit)?;
        let mut costs = Vec::new();
        for row in rows {
            match row {
                Ok(u) => costs.push((u.id.clone(), u.maintenance_cost, u.utility_score())),
                Err(e) => tracing::warn!("skipping corrupt memory row: {e}"),
            }
        }
        costs.sort_by(|a, b| a.2.partial_cmp(&b.2).unwrap_or(std::cmp::Ordering::Equal));
        Ok(costs)
    }
}

fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn decode_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn row_to_unit(row: &Row) -> rusqlite::Result<MemoryUnit> {
    let kind_str: String = row.get("kind")?;
    let kind = MemoryKind::parse_name(&kind_str).unwrap_or(MemoryKind::Episodic);

    let timestamp: String = row.get("timestamp")?;
    let timestamp = parse_rfc3339(&timestamp, "timestamp")?;

    let last_accessed: String = row.get("last_accessed")?;
    let last_accessed = parse_rfc3339(&last_accessed, "last_accessed")?;

    let consolidated_ts: Option<String> = row.get("consolidated_ts")?;
    let consolidated_ts = consolidated_ts
        .map(|s| parse_rfc3339(&s, "consolidated_ts"))
        .transpose()?;

    let emotion_json: String = row.get("emotion_vector")?;
    let emotion_vector: EmotionVector = serde_json::from_str(&emotion_json).unwrap_or_default();

    let tags_json: String = row.get("tags")?;
    let tags: BTreeSet<String> = serde_json::from_str(&tags_json).unwrap_or_default();

    let relations_json: String = row.get("relations")?;
    let relations: Vec<Relation> = serde_json::from_str(&relations_json).unwrap_or_default();

    let action_json: Option<String> = row.get("action")?;
    let action = action_json.and_then(|s| serde_json::from_str(&s).ok());

    let embedding: Option<Vec<u8>> = row.get("embedding")?;
    let embedding = embedding.map(|b| decode_embedding(&b)).unwrap_or_default();

    Ok(MemoryUnit {
        id: row.get("id")?,
        kind,
        content: row.get("content")?,
        timestamp,
        embedding,
        salience: row.get("salience")?,
        emotion_vector,
        tags,
        relations,
        decay_rate: row.get("decay_rate")?,
        version: row.get("version")?,
        prev_hash: row.get("prev_hash")?,
        signature: row.get("signature")?,
        consolidated_ts,
        trigger_condition: row.get("trigger_condition")?,
        action,
        source_agent: row.get("source_agent")?,
        trust_score: row.get("trust_score")?,
        maintenance_cost: row.get("maintenance_cost")?,
        retrieval_count: row.get("retrieval_count")?,
        last_accessed,
        active: row.get::<_, i64>("active")? != 0,
    })
}

fn parse_rfc3339(s: &str, field: &'static str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(InvalidTimestamp(field, e.to_string()))))
}

#[derive(Debug)]
struct InvalidTimestamp(&'static str, String);

impl std::fmt::Display for InvalidTimestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid {}: {}", self.0, self.1)
    }
}

impl std::error::Error for InvalidTimestamp {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryUnit;

    fn unit_with_embedding(content: &str, dim: usize) -> MemoryUnit {
        let mut u = MemoryUnit::new(content, MemoryKind::Episodic, String::new());
        u.embedding = vec![0.1; dim];
        u
    }

    #[test]
    fn put_then_get_roundtrips() {
        let store = Store::open_in_memory(4).unwrap();
        let unit = unit_with_embedding("hello world", 4);
        store.put(&unit).unwrap();
        let fetched = store.get(&unit.id).unwrap().unwrap();
        assert_eq!(fetched.content, "hello world");
        assert_eq!(fetched.embedding.len(), 4);
    }

    #[test]
    fn dimension_mismatch_is_rejected() {
        let store = Store::open_in_memory(4).unwrap();
        let unit = unit_with_embedding("x", 3);
        let err = store.put(&unit).unwrap_err();
        assert!(matches!(err, StorageError::DimensionMismatch { .. }));
    }

    #[test]
    fn empty_store_last_hash_is_empty() {
        let store = Store::open_in_memory(4).unwrap();
        assert_eq!(store.get_last_hash().unwrap(), "");
    }

    #[test]
    fn deactivate_removes_from_vector_search() {
        let store = Store::open_in_memory(4).unwrap();
        let unit = unit_with_embedding("x", 4);
        store.put(&unit).unwrap();
        store.deactivate(&unit.id).unwrap();
        let results = store.vector_search(&[0.1, 0.1, 0.1, 0.1], 10, None, 0.0).unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn vector_search_ranks_by_similarity() {
        let store = Store::open_in_memory(2).unwrap();
        let mut a = MemoryUnit::new("a", MemoryKind::Semantic, String::new());
        a.embedding = vec![1.0, 0.0];
        let mut b = MemoryUnit::new("b", MemoryKind::Semantic, String::new());
        b.embedding = vec![0.0, 1.0];
        store.put(&a).unwrap();
        store.put(&b).unwrap();
        let results = store.vector_search(&[1.0, 0.0], 10, None, 0.0).unwrap();
        assert_eq!(results[0].0, a.id);
    }

    #[test]
    fn count_filters_by_kind_and_active() {
        let store = Store::open_in_memory(2).unwrap();
        let a = MemoryUnit::new("a", MemoryKind::Episodic, String::new());
        let b = MemoryUnit::new("b", MemoryKind::Semantic, String::new());
        store.put(&a).unwrap();
        store.put(&b).unwrap();
        assert_eq!(store.count(None, true).unwrap(), 2);
        assert_eq!(store.count(Some(MemoryKind::Episodic), true).unwrap(), 1);
        store.deactivate(&a.id).unwrap();
        assert_eq!(store.count(None, true).unwrap(), 1);
    }
}
