//! Schema for the `memories` table and its indexes.

/// Applied once at [`super::Store`] construction. `IF NOT EXISTS` everywhere
/// so re-opening an existing database is a no-op.
pub const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS memories (
    id                  TEXT PRIMARY KEY,
    kind                TEXT NOT NULL,
    content             TEXT NOT NULL,
    timestamp           TEXT NOT NULL,
    salience            REAL NOT NULL DEFAULT 0.5,
    emotion_vector      TEXT NOT NULL DEFAULT '[0,0,0,0,0,0,0,0]',
    tags                TEXT NOT NULL DEFAULT '[]',
    relations           TEXT NOT NULL DEFAULT '[]',
    decay_rate          REAL NOT NULL DEFAULT 0.95,
    version             INTEGER NOT NULL DEFAULT 1,
    prev_hash           TEXT NOT NULL DEFAULT '',
    signature           TEXT NOT NULL DEFAULT '',
    consolidated_ts     TEXT,
    trigger_condition   TEXT,
    action              TEXT,
    source_agent        TEXT,
    trust_score         REAL NOT NULL DEFAULT 1.0,
    maintenance_cost    REAL NOT NULL DEFAULT 0.0,
    retrieval_count     INTEGER NOT NULL DEFAULT 0,
    last_accessed       TEXT NOT NULL,
    active              INTEGER NOT NULL DEFAULT 1,
    embedding           BLOB
);

CREATE INDEX IF NOT EXISTS idx_memories_kind ON memories(kind);
CREATE INDEX IF NOT EXISTS idx_memories_active ON memories(active);
CREATE INDEX IF NOT EXISTS idx_memories_consolidated ON memories(consolidated_ts);
CREATE INDEX IF NOT EXISTS idx_memories_timestamp ON memories(timestamp);
";
