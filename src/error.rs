//! Error types for the edgequake-pdf2text library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`Pdf2TextError`]: **Fatal**: the run cannot produce a page mapping
//!   (unreadable document, a page input that could not be built under the
//!   default abort policy, a failed engine call). Returned as
//!   `Err(Pdf2TextError)` from the top-level `run*` functions.
//!
//! * [`PageError`]: **Non-fatal**: a single page was excluded from the batch
//!   under [`crate::config::InputFailurePolicy::ExcludePage`]. Stored inside
//!   [`crate::output::DocumentText`] so callers can see which physical pages
//!   never reached the engine.
//!
//! Pages whose generation never emitted an end marker are *not* errors; they
//! are resolved by the `skip_repeat` policy and reported as data.

use std::path::PathBuf;
use thiserror::Error;

/// The pipeline phase a fatal error originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Phase {
    /// Locating or downloading the document.
    Input,
    /// Turning the document into page images.
    Rasterization,
    /// Building a per-page model input.
    InputBuild,
    /// The batched engine call.
    Generation,
    /// Configuration validation.
    Config,
    /// Writing results.
    Output,
    Internal,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Input => "input",
            Phase::Rasterization => "rasterization",
            Phase::InputBuild => "input-build",
            Phase::Generation => "generation",
            Phase::Config => "config",
            Phase::Output => "output",
            Phase::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// All fatal errors returned by the edgequake-pdf2text library.
#[derive(Debug, Error)]
pub enum Pdf2TextError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("PDF file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// The input string is not a valid file path or URL.
    #[error("Invalid input '{input}': not a file path or a valid HTTP/HTTPS URL")]
    InvalidInput { input: String },

    /// HTTP URL was syntactically valid but download failed.
    #[error("Failed to download '{url}': {reason}")]
    DownloadFailed { url: String, reason: String },

    /// Download exceeded the configured timeout.
    #[error("Download timed out after {secs}s for '{url}'\nIncrease --download-timeout.")]
    DownloadTimeout { url: String, secs: u64 },

    /// The bytes were read, but they are not a PDF.
    #[error("Input is not a valid PDF (first bytes: {magic:?})")]
    NotAPdf { magic: [u8; 4] },

    // ── Document (rasterization) errors ───────────────────────────────────
    /// PDF header/trailer/xref is corrupt and cannot be parsed.
    #[error("PDF is corrupt: {detail}")]
    CorruptPdf { detail: String },

    /// PDF requires a password but none was provided.
    #[error("PDF is encrypted and requires a password.\nProvide it with --password <PASSWORD>.")]
    PasswordRequired,

    /// A password was provided but it is wrong.
    #[error("Wrong password for PDF")]
    WrongPassword,

    /// The rasterizer failed on a specific page. The whole run is aborted.
    #[error("Rasterisation failed for page {page}: {detail}")]
    RasterisationFailed { page: usize, detail: String },

    /// The document parsed but contains no pages.
    #[error("PDF contains no pages")]
    EmptyDocument,

    // ── Input-build errors ────────────────────────────────────────────────
    /// A page's model input could not be built and the policy is to abort.
    #[error("Failed to build model input for page {page}: {detail}")]
    InputBuildFailed { page: usize, detail: String },

    // ── Generation errors ─────────────────────────────────────────────────
    /// The batched engine call failed. No partial results are produced.
    #[error("Generation engine '{engine}' failed: {detail}")]
    GenerationFailed { engine: String, detail: String },

    /// The engine broke its contract of one output per input.
    #[error("Generation engine returned {got} sequences for {expected} inputs")]
    EngineOutputMismatch { expected: usize, got: usize },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder or guard validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write the output file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Pdf2TextError {
    /// Which phase of the run failed.
    pub fn phase(&self) -> Phase {
        match self {
            Pdf2TextError::FileNotFound { .. }
            | Pdf2TextError::PermissionDenied { .. }
            | Pdf2TextError::InvalidInput { .. }
            | Pdf2TextError::DownloadFailed { .. }
            | Pdf2TextError::DownloadTimeout { .. }
            | Pdf2TextError::NotAPdf { .. } => Phase::Input,
            Pdf2TextError::CorruptPdf { .. }
            | Pdf2TextError::PasswordRequired
            | Pdf2TextError::WrongPassword
            | Pdf2TextError::RasterisationFailed { .. }
            | Pdf2TextError::EmptyDocument => Phase::Rasterization,
            Pdf2TextError::InputBuildFailed { .. } => Phase::InputBuild,
            Pdf2TextError::GenerationFailed { .. }
            | Pdf2TextError::EngineOutputMismatch { .. } => Phase::Generation,
            Pdf2TextError::InvalidConfig(_) => Phase::Config,
            Pdf2TextError::OutputWriteFailed { .. } => Phase::Output,
            Pdf2TextError::Internal(_) => Phase::Internal,
        }
    }
}

/// A non-fatal error for a single page.
#[derive(Debug, Clone, PartialEq, Eq, Error, serde::Serialize, serde::Deserialize)]
pub enum PageError {
    /// The page image could not be turned into a model input.
    #[error("Page {page}: input build failed: {detail}")]
    InputBuildFailed { page: usize, detail: String },
}

impl PageError {
    /// 0-indexed physical page the error refers to.
    pub fn page(&self) -> usize {
        match self {
            PageError::InputBuildFailed { page, .. } => *page,
        }
    }

    /// Promote to a fatal error (abort policy).
    pub fn into_fatal(self) -> Pdf2TextError {
        match self {
            PageError::InputBuildFailed { page, detail } => {
                Pdf2TextError::InputBuildFailed { page, detail }
            }
        }
    }
}
