//! The LLM backend — an external collaborator (spec.md §1).
//!
//! ENGRAM treats the language model as an opaque `prompt -> text` function.
//! A `None` return is the "unavailable" signal (spec.md §6/§7,
//! `BackendUnavailable`): every caller in this crate treats it as "skip this
//! cycle," never as a fatal error.

/// Prompt-to-text backend.
pub trait LlmClient: Send + Sync {
    /// Complete a prompt at the given sampling temperature. `None` means the
    /// backend is unavailable (timed out, rate-limited, not configured).
    fn complete(&self, prompt: &str, temperature: f32) -> Option<String>;
}

/// An `LlmClient` that is always unavailable — the default when no backend
/// is configured. Every subsystem degrades gracefully around it.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoLlm;

impl LlmClient for NoLlm {
    fn complete(&self, _prompt: &str, _temperature: f32) -> Option<String> {
        None
    }
}

/// Extract the first top-level `[...]` JSON array substring from `text` and
/// parse it, per spec.md §4.4/§4.5/§9: "LLM output JSON parsing is
/// deliberately lenient (extract first bracketed region)." Returns `None` on
/// any parse failure; callers treat that as `ParseFailure` (spec.md §7) and
/// must not mark anything consolidated.
pub fn extract_json_array(text: &str) -> Option<serde_json::Value> {
    let start = text.find('[')?;
    let end = text.rfind(']')?;
    if end < start {
        return None;
    }
    serde_json::from_str(&text[start..=end]).ok()
}
