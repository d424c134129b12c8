//! # edgequake-pdf2text
//!
//! Batched PDF-to-text OCR with a decoding-time repetition guard.
//!
//! Every page of a PDF is rasterized, turned into a model input on a bounded
//! worker pool, and the whole document is decoded in **one** batched call to
//! a generation engine. Each sequence carries its own n-gram
//! [`RepetitionGuard`] so a page cannot loop on the same phrase until the
//! token budget runs out. Pages that still never emit the end marker are
//! either dropped (`skip_repeat`) or kept raw.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF
//!  │
//!  ├─ 1. Input     resolve local file or download from URL
//!  ├─ 2. Render    rasterise every page via pdfium (spawn_blocking)
//!  ├─ 3. Prepare   global view + tiles per page, num_workers in parallel
//!  ├─ 4. Generate  one batched engine call, one guard per sequence
//!  ├─ 5. Classify  end marker present → clean; absent → skip or keep raw
//!  └─ 6. Output    contiguous slot → text mapping + stats
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_pdf2text::{run_file, OcrConfig, ProviderEngine};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // OpenAI-compatible server, e.g. vLLM serving DeepSeek-OCR
//!     let engine = Arc::new(ProviderEngine::from_env(Some("deepseek-ocr"))?);
//!     let config = OcrConfig::builder().skip_repeat(true).build()?;
//!     let doc = run_file("document.pdf", &config, engine).await?;
//!     for (slot, text) in doc.to_map() {
//!         println!("--- {slot} ---\n{text}");
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Engines
//!
//! | Engine | Guard | Use |
//! |--------|-------|-----|
//! | [`StepwiseEngine`] | per step, in process | any [`TokenModel`] you can drive step by step |
//! | [`ProviderEngine`] | server side | remote vision LLMs via `edgequake-llm` |
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `pdf2text` binary (clap + anyhow + tracing-subscriber + indicatif) |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod convert;
pub mod engine;
pub mod error;
pub mod guard;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{InputFailurePolicy, OcrConfig, OcrConfigBuilder, PageSeparator};
pub use convert::{run, run_file, run_sync, run_to_file, BatchPipeline};
pub use engine::{
    GeneratedSequence, GenerationEngine, LogitsAdjuster, ModelResult, ProviderEngine,
    SamplingConfig, StepSlot, StepwiseEngine, TokenModel,
};
pub use error::{PageError, Pdf2TextError, Phase};
pub use guard::{GuardConfig, NgramWindow, RepetitionGuard};
pub use output::{DocumentText, PageResult, RunStats};
pub use pipeline::prepare::{CropMode, PageInput, PageInputBuilder, TilingInputBuilder};
pub use pipeline::render::{PdfiumRasterizer, Rasterizer};
pub use progress::{NoopProgressCallback, ProgressCallback};
