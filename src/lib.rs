//! ENGRAM — a cognitive memory substrate for autonomous agents.
//!
//! An agent session constructs one [`orchestrator::Orchestrator`], handing
//! it an [`embedder::Embedder`] and an [`llm::LlmClient`] it controls;
//! ENGRAM never bundles a model runtime of its own. Everything the agent
//! remembers, retrieves, consolidates, dreams about, forgets under
//! metabolic pressure, or transplants to another agent flows through that
//! one entry point.
//!
//! ```no_run
//! use engram::{config::EngramConfig, embedder::Embedder, llm::NoLlm, memory::MemoryKind, orchestrator::Orchestrator};
//!
//! struct MyEmbedder;
//! impl Embedder for MyEmbedder {
//!     fn embed(&self, text: &str) -> Vec<f32> { vec![0.0; 384] }
//!     fn dimension(&self) -> usize { 384 }
//! }
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let orchestrator = Orchestrator::new(EngramConfig::default(), Box::new(MyEmbedder), Box::new(NoLlm))?;
//! orchestrator.wakeup()?;
//! orchestrator.remember("deployed v0.1 today", MemoryKind::Episodic, vec!["milestone".into()], 0.7, None)?;
//! # Ok(())
//! # }
//! ```

pub mod anchoring;
pub mod config;
pub mod consolidation;
pub mod dreaming;
pub mod embedder;
pub mod identity;
pub mod llm;
pub mod memory;
pub mod metabolism;
pub mod narrative;
pub mod orchestrator;
pub mod prospective;
pub mod retrieval;
pub mod storage;
pub mod transplant;

pub use memory::{EmotionVector, MemoryCounts, MemoryKind, MemoryUnit, Relation, RelationKind};
pub use orchestrator::{Orchestrator, OrchestratorError};
