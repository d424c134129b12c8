//! Pipeline stages for batched PDF-to-text OCR.
//!
//! Each submodule implements one transformation step and is testable on its
//! own. The orchestration lives in [`crate::convert::BatchPipeline`].
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ render ──▶ prepare ──▶ (engine) ──▶ postprocess ──▶ assemble
//! (path/URL) (pdfium)  (workers)   one batch    (end marker)    (slots)
//! ```
//!
//! 1. [`input`]: read a local file or download a URL into memory
//! 2. [`render`]: rasterize every page; runs in `spawn_blocking`
//! 3. [`prepare`]: build per-page model inputs on a bounded worker pool,
//!    reassembled in page order
//! 4. the [`crate::engine::GenerationEngine`] decodes the whole batch in one
//!    call, with one repetition guard per sequence
//! 5. [`postprocess`]: detect and strip the end marker, tidy the text
//! 6. [`assemble`]: apply the skip policy and number kept pages

pub mod assemble;
pub mod input;
pub mod postprocess;
pub mod prepare;
pub mod render;
