//! Run entry points: [`BatchPipeline`] and the `run*` convenience functions.
//!
//! A run is strictly phased:
//!
//! 1. rasterize the whole document (any failure aborts);
//! 2. build every page input on a bounded worker pool, back in page order;
//! 3. submit **one** batch to the engine with one fresh
//!    [`RepetitionGuard`](crate::guard::RepetitionGuard) per sequence;
//! 4. classify each sequence by its end marker and number the kept pages.
//!
//! The batch boundary is a hard synchronization point: generation starts
//! only after every page input is ready.

use crate::config::{InputFailurePolicy, OcrConfig};
use crate::engine::{GenerationEngine, LogitsAdjuster};
use crate::error::{PageError, Pdf2TextError};
use crate::output::{DocumentText, RunStats};
use crate::pipeline::assemble::assign_slots;
use crate::pipeline::postprocess::CleanupRules;
use crate::pipeline::prepare::{build_inputs, PageInput, PageInputBuilder, TilingInputBuilder};
use crate::pipeline::render::{rasterize_document, PdfiumRasterizer, Rasterizer};
use crate::pipeline::input;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Rasterizer, input builder and engine wired together under one config.
///
/// Each collaborator can be swapped; by default pages are rendered with
/// pdfium and prepared with [`TilingInputBuilder`].
#[derive(Clone)]
pub struct BatchPipeline {
    engine: Arc<dyn GenerationEngine>,
    rasterizer: Arc<dyn Rasterizer>,
    builder: Arc<dyn PageInputBuilder>,
    config: OcrConfig,
}

impl std::fmt::Debug for BatchPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchPipeline")
            .field("engine", &self.engine.name())
            .field("config", &self.config)
            .finish()
    }
}

impl BatchPipeline {
    pub fn new(engine: Arc<dyn GenerationEngine>, config: OcrConfig) -> Self {
        let rasterizer = PdfiumRasterizer::new(config.max_rendered_pixels, config.password.clone());
        Self {
            engine,
            rasterizer: Arc::new(rasterizer),
            builder: Arc::new(TilingInputBuilder::default()),
            config,
        }
    }

    pub fn with_rasterizer(mut self, rasterizer: Arc<dyn Rasterizer>) -> Self {
        self.rasterizer = rasterizer;
        self
    }

    pub fn with_input_builder(mut self, builder: Arc<dyn PageInputBuilder>) -> Self {
        self.builder = builder;
        self
    }

    pub fn config(&self) -> &OcrConfig {
        &self.config
    }

    /// Run OCR over a document held in memory.
    ///
    /// # Errors
    /// One fatal error naming the failed phase (see
    /// [`Pdf2TextError::phase`]). Pages that never terminate are not errors;
    /// they are kept or skipped according to `skip_repeat`.
    pub async fn run(&self, pdf: impl Into<Arc<[u8]>>) -> Result<DocumentText, Pdf2TextError> {
        let total_start = Instant::now();
        let config = &self.config;
        config.validate()?;
        let mut stats = RunStats::default();

        // ── Step 1: Rasterise ────────────────────────────────────────────
        let render_start = Instant::now();
        let images =
            rasterize_document(Arc::clone(&self.rasterizer), pdf.into(), config.dpi).await?;
        if images.is_empty() {
            return Err(Pdf2TextError::EmptyDocument);
        }
        stats.total_pages = images.len();
        stats.rasterize_duration_ms = render_start.elapsed().as_millis() as u64;
        info!(
            "Rasterized {} pages at {} dpi in {}ms",
            stats.total_pages, config.dpi, stats.rasterize_duration_ms
        );
        if let Some(cb) = &config.progress_callback {
            cb.on_document_rasterized(stats.total_pages);
        }

        // ── Step 2: Build inputs ─────────────────────────────────────────
        let prepare_start = Instant::now();
        let prepared = build_inputs(
            Arc::clone(&self.builder),
            images,
            &config.prompt,
            config.crop_mode,
            config.num_workers,
            config.progress_callback.clone(),
        )
        .await;
        let (inputs, excluded) = apply_input_policy(prepared, config.input_failure_policy)?;
        stats.prepare_duration_ms = prepare_start.elapsed().as_millis() as u64;
        stats.excluded_pages = excluded.len();
        stats.submitted_pages = inputs.len();
        info!(
            "Prepared {} page inputs ({} excluded) with {} workers in {}ms",
            inputs.len(),
            excluded.len(),
            config.num_workers,
            stats.prepare_duration_ms
        );

        // ── Step 3: One batched generation call ──────────────────────────
        if !self.engine.hosts_adjusters() {
            warn!(
                "Engine '{}' does not run per-step adjusters; repetition guard inactive",
                self.engine.name()
            );
        }
        let adjusters = inputs
            .iter()
            .map(|_| {
                config
                    .guard
                    .build()
                    .map(|g| Box::new(g) as Box<dyn LogitsAdjuster>)
            })
            .collect::<Result<Vec<_>, _>>()?;
        let page_indices: Vec<usize> = inputs.iter().map(|i| i.page_index).collect();
        let sampling = config.sampling();

        if let Some(cb) = &config.progress_callback {
            cb.on_generation_start(inputs.len());
        }
        let generate_start = Instant::now();
        let sequences = self.engine.generate(inputs, &sampling, adjusters).await?;
        stats.generate_duration_ms = generate_start.elapsed().as_millis() as u64;
        debug!(
            "Engine '{}' returned {} sequences in {}ms",
            self.engine.name(),
            sequences.len(),
            stats.generate_duration_ms
        );

        // ── Step 4: Classify and number kept pages ───────────────────────
        stats.total_tokens = sequences.iter().map(|s| s.token_count as u64).sum();
        let rules = CleanupRules {
            tidy_whitespace: config.tidy_whitespace,
            strip_grounding: config.strip_grounding,
        };
        let assembled = assign_slots(
            &page_indices,
            sequences,
            &config.eos_marker,
            config.skip_repeat,
            rules,
        )?;
        stats.kept_pages = assembled.pages.len();
        stats.skipped_pages = assembled.skipped.len();
        stats.unterminated_kept = assembled.unterminated_kept;
        stats.total_duration_ms = total_start.elapsed().as_millis() as u64;

        info!(
            "Run complete: {}/{} pages kept ({} skipped, {} excluded), {}ms total",
            stats.kept_pages,
            stats.total_pages,
            stats.skipped_pages,
            stats.excluded_pages,
            stats.total_duration_ms
        );
        if let Some(cb) = &config.progress_callback {
            cb.on_run_complete(stats.total_pages, stats.kept_pages);
        }

        Ok(DocumentText {
            pages: assembled.pages,
            skipped: assembled.skipped,
            excluded,
            stats,
        })
    }

    /// Resolve a path or URL, then [`run`](Self::run).
    pub async fn run_input(&self, input_str: &str) -> Result<DocumentText, Pdf2TextError> {
        self.config.validate()?;
        let bytes = input::resolve_input(input_str, self.config.download_timeout_secs).await?;
        self.run(bytes).await
    }
}

/// Split prepared pages into submitted inputs and excluded pages.
///
/// Under [`InputFailurePolicy::Abort`] the lowest failing page aborts the
/// run. Under `ExcludePage` a run where every page failed still aborts,
/// since there is nothing to submit.
fn apply_input_policy(
    prepared: Vec<(usize, Result<PageInput, PageError>)>,
    policy: InputFailurePolicy,
) -> Result<(Vec<PageInput>, Vec<PageError>), Pdf2TextError> {
    let mut inputs = Vec::with_capacity(prepared.len());
    let mut excluded = Vec::new();
    for (_, res) in prepared {
        match res {
            Ok(input) => inputs.push(input),
            Err(e) if policy == InputFailurePolicy::Abort => return Err(e.into_fatal()),
            Err(e) => {
                warn!("{}; page excluded", e);
                excluded.push(e);
            }
        }
    }
    if inputs.is_empty() {
        if let Some(first) = excluded.into_iter().next() {
            return Err(first.into_fatal());
        }
        return Err(Pdf2TextError::EmptyDocument);
    }
    Ok((inputs, excluded))
}

/// Run OCR over in-memory document bytes with the default collaborators.
pub async fn run(
    pdf_bytes: impl Into<Arc<[u8]>>,
    config: &OcrConfig,
    engine: Arc<dyn GenerationEngine>,
) -> Result<DocumentText, Pdf2TextError> {
    BatchPipeline::new(engine, config.clone()).run(pdf_bytes).await
}

/// Run OCR over a local file path or HTTP(S) URL.
pub async fn run_file(
    input_str: impl AsRef<str>,
    config: &OcrConfig,
    engine: Arc<dyn GenerationEngine>,
) -> Result<DocumentText, Pdf2TextError> {
    BatchPipeline::new(engine, config.clone())
        .run_input(input_str.as_ref())
        .await
}

/// Run OCR and write the result to `output_path`.
///
/// A `.json` path receives the slot → `{"text": …}` page map; anything else
/// receives the pages assembled with `config.page_separator`. Uses atomic
/// write (temp file + rename) to prevent partial files.
pub async fn run_to_file(
    input_str: impl AsRef<str>,
    output_path: impl AsRef<Path>,
    config: &OcrConfig,
    engine: Arc<dyn GenerationEngine>,
) -> Result<RunStats, Pdf2TextError> {
    let doc = run_file(input_str, config, engine).await?;
    let path = output_path.as_ref();
    let body = if path.extension().is_some_and(|e| e == "json") {
        serde_json::to_string_pretty(&doc.to_page_map_json())
            .map_err(|e| Pdf2TextError::Internal(format!("JSON serialisation failed: {e}")))?
    } else {
        doc.assemble(&config.page_separator)
    };
    write_atomic(path, body.as_bytes()).await?;
    Ok(doc.stats)
}

/// Write `contents` to a sibling temp file, then rename over `path`.
pub async fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), Pdf2TextError> {
    let write_err = |source: std::io::Error| Pdf2TextError::OutputWriteFailed {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
    }

    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);
    tokio::fs::write(&tmp_path, contents).await.map_err(write_err)?;
    tokio::fs::rename(&tmp_path, path).await.map_err(write_err)
}

/// Synchronous wrapper around [`run`].
///
/// Creates a temporary tokio runtime internally.
pub fn run_sync(
    pdf_bytes: impl Into<Arc<[u8]>>,
    config: &OcrConfig,
    engine: Arc<dyn GenerationEngine>,
) -> Result<DocumentText, Pdf2TextError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| Pdf2TextError::Internal(format!("Failed to create tokio runtime: {}", e)))?
        .block_on(run(pdf_bytes, config, engine))
}
