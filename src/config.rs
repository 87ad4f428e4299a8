//! Environment-driven configuration (spec.md §6).

use std::path::PathBuf;

/// Runtime configuration for an [`crate::orchestrator::Orchestrator`]
/// instance, resolved from environment variables with the defaults spec.md
/// §6 documents.
#[derive(Debug, Clone)]
pub struct EngramConfig {
    /// Root of all persistent state. `DATA_DIR`, default `./engram_data`.
    pub data_dir: PathBuf,
    /// Identifies the embedder. `EMBEDDING_PROVIDER`.
    pub embedding_provider: Option<String>,
    /// Identifies the embedding model. `EMBEDDING_MODEL`.
    pub embedding_model: Option<String>,
    /// Identifies the LLM provider. `LLM_PROVIDER`.
    pub llm_provider: Option<String>,
    /// Identifies the LLM model. `LLM_MODEL`.
    pub llm_model: Option<String>,
    /// LLM API key. `LLM_API_KEY`.
    pub llm_api_key: Option<String>,
    /// LLM base URL. `LLM_BASE_URL`.
    pub llm_base_url: Option<String>,
    /// Used in narrative prompts. `AGENT_NAME`.
    pub agent_name: String,
    /// Metabolism base budget. `MAX_TOKENS`, default 2,000,000.
    pub max_tokens: u64,
}

impl Default for EngramConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./engram_data"),
            embedding_provider: None,
            embedding_model: None,
            llm_provider: None,
            llm_model: None,
            llm_api_key: None,
            llm_base_url: None,
            agent_name: "Metatron".to_string(),
            max_tokens: 2_000_000,
        }
    }
}

impl EngramConfig {
    /// Read configuration from the process environment, falling back to
    /// spec.md §6's documented defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            data_dir: std::env::var("DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| default_data_dir().unwrap_or(defaults.data_dir)),
            embedding_provider: std::env::var("EMBEDDING_PROVIDER").ok(),
            embedding_model: std::env::var("EMBEDDING_MODEL").ok(),
            llm_provider: std::env::var("LLM_PROVIDER").ok(),
            llm_model: std::env::var("LLM_MODEL").ok(),
            llm_api_key: std::env::var("LLM_API_KEY").ok(),
            llm_base_url: std::env::var("LLM_BASE_URL").ok(),
            agent_name: std::env::var("AGENT_NAME").unwrap_or(defaults.agent_name),
            max_tokens: std::env::var("MAX_TOKENS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_tokens),
        }
    }

    pub fn store_dir(&self) -> PathBuf {
        self.data_dir.join("store")
    }

    pub fn identity_dir(&self) -> PathBuf {
        self.data_dir.join("identity")
    }
}

/// Platform-appropriate data directory, used when `DATA_DIR` is unset and
/// the caller hasn't overridden [`EngramConfig::default`].
fn default_data_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "engram", "engram").map(|d| d.data_dir().to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = EngramConfig::default();
        assert_eq!(cfg.data_dir, PathBuf::from("./engram_data"));
        assert_eq!(cfg.max_tokens, 2_000_000);
        assert_eq!(cfg.agent_name, "Metatron");
    }
}
