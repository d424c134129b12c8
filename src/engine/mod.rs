//! The batched generation engine seam.
//!
//! The pipeline never decodes tokens itself. It hands the whole batch of
//! [`PageInput`]s to a [`GenerationEngine`] together with one
//! [`LogitsAdjuster`] per sequence, and receives one [`GeneratedSequence`]
//! per input, in input order.
//!
//! Two engines ship with the crate:
//!
//! * [`StepwiseEngine`] drives any in-process [`TokenModel`] greedily and
//!   calls each sequence's adjuster once per decoding step.
//! * [`ProviderEngine`] forwards pages to a remote vision LLM through
//!   `edgequake-llm`. Remote APIs do not expose per-step scores, so it does
//!   not host adjusters; see [`GenerationEngine::hosts_adjusters`].

pub mod provider;
pub mod stepwise;

pub use provider::ProviderEngine;
pub use stepwise::{ModelResult, StepSlot, StepwiseEngine, TokenModel};

use crate::error::Pdf2TextError;
use crate::pipeline::prepare::PageInput;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

/// Per-sequence hook applied to the raw next-token scores.
///
/// The engine calls [`LogitsAdjuster::adjust`] exactly once per decoding step
/// of the sequence the adjuster is bound to, with the tokens generated so far
/// and the raw score vector over the vocabulary.
pub trait LogitsAdjuster: Send {
    /// Modify `scores` in place. Suppressed tokens are set to `f32::NEG_INFINITY`.
    fn adjust(&mut self, history: &[u32], scores: &mut [f32]);

    /// Human-readable name for debugging and tracing.
    fn name(&self) -> &'static str {
        "unnamed"
    }
}

/// Sampling settings for one batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingConfig {
    /// 0.0 means greedy decoding.
    pub temperature: f32,
    /// Output budget per sequence, in tokens.
    pub max_tokens: usize,
    /// How many sequences the engine may decode at once.
    pub max_concurrency: usize,
    /// Text the engine emits when a sequence terminates.
    pub eos_marker: String,
    /// Keep `eos_marker` literally at the end of terminated sequences.
    pub keep_eos_marker: bool,
    /// Strip special tokens while detokenizing.
    pub skip_special_tokens: bool,
}

impl SamplingConfig {
    /// Greedy decoding that keeps the end marker in the text.
    pub fn greedy(max_tokens: usize, eos_marker: impl Into<String>) -> Self {
        Self {
            temperature: 0.0,
            max_tokens,
            max_concurrency: 1,
            eos_marker: eos_marker.into(),
            keep_eos_marker: true,
            skip_special_tokens: false,
        }
    }

    pub fn with_max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = n.max(1);
        self
    }

    pub fn is_greedy(&self) -> bool {
        self.temperature <= 0.0
    }
}

/// One decoded sequence as returned by an engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedSequence {
    /// Detokenized text, including the end marker when the sequence
    /// terminated and `keep_eos_marker` was requested.
    pub text: String,
    /// Tokens generated for this sequence.
    pub token_count: usize,
}

impl GeneratedSequence {
    pub fn new(text: impl Into<String>, token_count: usize) -> Self {
        Self {
            text: text.into(),
            token_count,
        }
    }
}

/// A batched sequence-generation engine.
///
/// # Contract
/// - `generate` is called once per document with every page input.
/// - `adjusters.len() == inputs.len()`; adjuster `i` belongs to input `i`.
/// - The result has exactly one sequence per input, in input order.
/// - A failure fails the whole batch; no partial results.
pub trait GenerationEngine: Send + Sync {
    /// Short identifier used in logs and errors.
    fn name(&self) -> &str;

    /// Whether the engine invokes the per-sequence adjusters while decoding.
    fn hosts_adjusters(&self) -> bool {
        true
    }

    fn generate<'a>(
        &'a self,
        inputs: Vec<PageInput>,
        sampling: &'a SamplingConfig,
        adjusters: Vec<Box<dyn LogitsAdjuster>>,
    ) -> BoxFuture<'a, Result<Vec<GeneratedSequence>, Pdf2TextError>>;
}
