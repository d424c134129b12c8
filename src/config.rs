//! Configuration types for batched PDF-to-text OCR.
//!
//! All run behaviour is controlled through [`OcrConfig`], built via its
//! [`OcrConfigBuilder`]. Setters clamp numeric knobs into their valid range;
//! `build()` validates what cannot be clamped (guard sizes, empty markers).

use crate::engine::SamplingConfig;
use crate::error::Pdf2TextError;
use crate::guard::GuardConfig;
use crate::pipeline::prepare::CropMode;
use crate::progress::ProgressCallback;
use crate::prompts::{DEFAULT_EOS_MARKER, DEFAULT_PROMPT};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Configuration for one OCR run.
///
/// Built via [`OcrConfig::builder()`] or using [`OcrConfig::default()`].
///
/// # Example
/// ```rust
/// use edgequake_pdf2text::{CropMode, OcrConfig};
///
/// let config = OcrConfig::builder()
///     .crop_mode(CropMode::Tiled)
///     .max_concurrency(8)
///     .skip_repeat(true)
///     .build()
///     .unwrap();
/// assert_eq!(config.guard.ngram_size, 20);
/// ```
#[derive(Clone)]
pub struct OcrConfig {
    /// Rasterization resolution. Range: 72–400. Default: 144.
    pub dpi: u32,

    /// Longest-edge cap for a rendered page, in pixels. Default: 4096.
    pub max_rendered_pixels: u32,

    /// PDF user password for encrypted documents.
    pub password: Option<String>,

    /// Prompt attached to every page. Default: [`DEFAULT_PROMPT`].
    pub prompt: String,

    /// Whether pages are cut into local tiles. Default: [`CropMode::Auto`].
    pub crop_mode: CropMode,

    /// Sequences the engine may decode at once. Default: 1.
    pub max_concurrency: usize,

    /// Parallel workers for input preparation. Default: 4.
    pub num_workers: usize,

    /// Drop pages that never emit the end marker instead of keeping their
    /// raw text. Default: false.
    pub skip_repeat: bool,

    /// Output budget per page, in tokens. Default: 8192.
    pub max_tokens: usize,

    /// Repetition guard settings, one fresh guard per page.
    pub guard: GuardConfig,

    /// Text marking a cleanly terminated page.
    pub eos_marker: String,

    /// What to do when a page input cannot be built. Default: abort.
    pub input_failure_policy: InputFailurePolicy,

    /// Normalise line endings and trim trailing whitespace of terminated
    /// pages. Default: false (only the end marker is removed).
    pub tidy_whitespace: bool,

    /// Replace `<|ref|>…<|/ref|><|det|>…<|/det|>` grounding spans with their
    /// label. Default: false.
    pub strip_grounding: bool,

    /// Separator used by [`crate::output::DocumentText::assemble`].
    pub page_separator: PageSeparator,

    /// Download timeout for URL inputs in seconds. Default: 120.
    pub download_timeout_secs: u64,

    /// Optional progress callback.
    pub progress_callback: Option<Arc<dyn ProgressCallback>>,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            dpi: 144,
            max_rendered_pixels: 4096,
            password: None,
            prompt: DEFAULT_PROMPT.to_string(),
            crop_mode: CropMode::default(),
            max_concurrency: 1,
            num_workers: 4,
            skip_repeat: false,
            max_tokens: 8192,
            guard: GuardConfig::default(),
            eos_marker: DEFAULT_EOS_MARKER.to_string(),
            input_failure_policy: InputFailurePolicy::default(),
            tidy_whitespace: false,
            strip_grounding: false,
            page_separator: PageSeparator::default(),
            download_timeout_secs: 120,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for OcrConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OcrConfig")
            .field("dpi", &self.dpi)
            .field("max_rendered_pixels", &self.max_rendered_pixels)
            .field("prompt", &self.prompt)
            .field("crop_mode", &self.crop_mode)
            .field("max_concurrency", &self.max_concurrency)
            .field("num_workers", &self.num_workers)
            .field("skip_repeat", &self.skip_repeat)
            .field("max_tokens", &self.max_tokens)
            .field("guard", &self.guard)
            .field("input_failure_policy", &self.input_failure_policy)
            .field("tidy_whitespace", &self.tidy_whitespace)
            .field("strip_grounding", &self.strip_grounding)
            .field("page_separator", &self.page_separator)
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<dyn ProgressCallback>"),
            )
            .finish()
    }
}

impl OcrConfig {
    /// Create a new builder for `OcrConfig`.
    pub fn builder() -> OcrConfigBuilder {
        OcrConfigBuilder {
            config: Self::default(),
        }
    }

    /// Greedy sampling for this run: end marker kept literally, special
    /// tokens kept.
    pub fn sampling(&self) -> SamplingConfig {
        SamplingConfig::greedy(self.max_tokens, self.eos_marker.clone())
            .with_max_concurrency(self.max_concurrency)
    }

    /// Check the constraints `build()` enforces.
    pub fn validate(&self) -> Result<(), Pdf2TextError> {
        if !(72..=400).contains(&self.dpi) {
            return Err(Pdf2TextError::InvalidConfig(format!(
                "DPI must be 72–400, got {}",
                self.dpi
            )));
        }
        if self.max_concurrency == 0 || self.num_workers == 0 {
            return Err(Pdf2TextError::InvalidConfig(
                "max_concurrency and num_workers must be ≥ 1".into(),
            ));
        }
        if self.max_tokens == 0 {
            return Err(Pdf2TextError::InvalidConfig(
                "max_tokens must be ≥ 1".into(),
            ));
        }
        if self.eos_marker.is_empty() {
            return Err(Pdf2TextError::InvalidConfig(
                "eos_marker must not be empty".into(),
            ));
        }
        self.guard.validate()
    }
}

/// Builder for [`OcrConfig`].
pub struct OcrConfigBuilder {
    config: OcrConfig,
}

impl fmt::Debug for OcrConfigBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OcrConfigBuilder")
            .field("config", &self.config)
            .finish()
    }
}

impl OcrConfigBuilder {
    pub fn dpi(mut self, dpi: u32) -> Self {
        self.config.dpi = dpi.clamp(72, 400);
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = px.max(100);
        self
    }

    pub fn password(mut self, pwd: impl Into<String>) -> Self {
        self.config.password = Some(pwd.into());
        self
    }

    pub fn prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.prompt = prompt.into();
        self
    }

    pub fn crop_mode(mut self, mode: CropMode) -> Self {
        self.config.crop_mode = mode;
        self
    }

    pub fn max_concurrency(mut self, n: usize) -> Self {
        self.config.max_concurrency = n.max(1);
        self
    }

    pub fn num_workers(mut self, n: usize) -> Self {
        self.config.num_workers = n.max(1);
        self
    }

    pub fn skip_repeat(mut self, v: bool) -> Self {
        self.config.skip_repeat = v;
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn ngram_size(mut self, n: usize) -> Self {
        self.config.guard.ngram_size = n;
        self
    }

    pub fn window_size(mut self, n: usize) -> Self {
        self.config.guard.window_size = n;
        self
    }

    pub fn whitelist(mut self, ids: impl IntoIterator<Item = u32>) -> Self {
        self.config.guard.whitelist = ids.into_iter().collect();
        self
    }

    pub fn guard(mut self, guard: GuardConfig) -> Self {
        self.config.guard = guard;
        self
    }

    pub fn eos_marker(mut self, marker: impl Into<String>) -> Self {
        self.config.eos_marker = marker.into();
        self
    }

    pub fn input_failure_policy(mut self, policy: InputFailurePolicy) -> Self {
        self.config.input_failure_policy = policy;
        self
    }

    pub fn tidy_whitespace(mut self, v: bool) -> Self {
        self.config.tidy_whitespace = v;
        self
    }

    pub fn strip_grounding(mut self, v: bool) -> Self {
        self.config.strip_grounding = v;
        self
    }

    pub fn page_separator(mut self, sep: PageSeparator) -> Self {
        self.config.page_separator = sep;
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    pub fn progress_callback(mut self, cb: Arc<dyn ProgressCallback>) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<OcrConfig, Pdf2TextError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// What happens when one page's model input cannot be built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum InputFailurePolicy {
    /// Fail the whole run. (default)
    #[default]
    Abort,
    /// Leave the page out of the batch and record a [`crate::error::PageError`].
    ExcludePage,
}

/// How to separate pages in assembled output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PageSeparator {
    /// Pages joined with "\n\n". (default)
    #[default]
    None,
    /// Horizontal rule: "\n\n---\n\n"
    HorizontalRule,
    /// HTML comment with page number: "<!-- page N -->"
    Comment,
    /// Custom string inserted between pages.
    Custom(String),
}

impl PageSeparator {
    /// Render the separator string for the given page number (1-indexed).
    pub fn render(&self, page_num: usize) -> String {
        match self {
            PageSeparator::None => "\n\n".to_string(),
            PageSeparator::HorizontalRule => "\n\n---\n\n".to_string(),
            PageSeparator::Comment => format!("\n\n<!-- page {} -->\n\n", page_num),
            PageSeparator::Custom(s) => format!("\n\n{}\n\n", s),
        }
    }
}
