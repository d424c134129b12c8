//! Pipeline integration tests with in-memory collaborators.
//!
//! The rasterizer, input builder and engine are replaced by fakes so these
//! tests run without pdfium, a GPU or network access.

use edgequake_llm::ImageData;
use edgequake_pdf2text::{
    BatchPipeline, CropMode, GeneratedSequence, GenerationEngine, InputFailurePolicy,
    LogitsAdjuster, ModelResult, OcrConfig, PageError, PageInput, PageInputBuilder,
    Pdf2TextError, Phase, ProgressCallback, Rasterizer, SamplingConfig, StepSlot,
    StepwiseEngine, TokenModel,
};
use futures::future::BoxFuture;
use image::{DynamicImage, Rgb, RgbImage};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const EOS: &str = "<｜end▁of▁sentence｜>";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("edgequake_pdf2text=debug")
        .try_init();
}

// ── Fakes ────────────────────────────────────────────────────────────────────

/// Produces `pages` images whose width encodes the page index.
struct FakeRasterizer {
    pages: usize,
    fail: bool,
}

impl FakeRasterizer {
    fn pages(pages: usize) -> Arc<Self> {
        Arc::new(Self { pages, fail: false })
    }
}

impl Rasterizer for FakeRasterizer {
    fn rasterize(&self, _pdf: &[u8], _dpi: u32) -> Result<Vec<DynamicImage>, Pdf2TextError> {
        if self.fail {
            return Err(Pdf2TextError::CorruptPdf {
                detail: "trailer not found".into(),
            });
        }
        Ok((0..self.pages)
            .map(|i| DynamicImage::ImageRgb8(RgbImage::from_pixel(i as u32 + 1, 4, Rgb([255; 3]))))
            .collect())
    }
}

/// Recovers the page index from the image width; later pages finish first.
struct SlowFirstBuilder {
    total: usize,
    failing: Vec<usize>,
    calls: AtomicUsize,
}

impl SlowFirstBuilder {
    fn new(total: usize) -> Arc<Self> {
        Arc::new(Self {
            total,
            failing: Vec::new(),
            calls: AtomicUsize::new(0),
        })
    }

    fn failing(total: usize, failing: Vec<usize>) -> Arc<Self> {
        Arc::new(Self {
            total,
            failing,
            calls: AtomicUsize::new(0),
        })
    }
}

impl PageInputBuilder for SlowFirstBuilder {
    fn build(
        &self,
        page_index: usize,
        image: &DynamicImage,
        prompt: &str,
        crop_mode: CropMode,
    ) -> Result<PageInput, PageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        assert_eq!(image.width() as usize, page_index + 1);
        std::thread::sleep(Duration::from_millis(((self.total - page_index) * 3) as u64));
        if self.failing.contains(&page_index) {
            return Err(PageError::InputBuildFailed {
                page: page_index,
                detail: "unsupported crop mode".into(),
            });
        }
        Ok(PageInput {
            page_index,
            prompt: prompt.to_string(),
            crop_mode,
            global_view: ImageData::new(format!("page-{page_index}"), "image/png"),
            tiles: Vec::new(),
            grid: None,
        })
    }
}

/// Returns a scripted text per page and records every call.
#[derive(Default)]
struct ScriptedEngine {
    texts: HashMap<usize, String>,
    calls: Mutex<Vec<Vec<usize>>>,
    adjuster_names: Mutex<Vec<&'static str>>,
    fail: bool,
    drop_last: bool,
    remote: bool,
}

impl ScriptedEngine {
    fn with_texts(texts: &[(usize, &str)]) -> Self {
        Self {
            texts: texts.iter().map(|(i, t)| (*i, t.to_string())).collect(),
            ..Default::default()
        }
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl GenerationEngine for ScriptedEngine {
    fn name(&self) -> &str {
        "scripted"
    }

    fn hosts_adjusters(&self) -> bool {
        !self.remote
    }

    fn generate<'a>(
        &'a self,
        inputs: Vec<PageInput>,
        sampling: &'a SamplingConfig,
        adjusters: Vec<Box<dyn LogitsAdjuster>>,
    ) -> BoxFuture<'a, Result<Vec<GeneratedSequence>, Pdf2TextError>> {
        Box::pin(async move {
            assert!(sampling.is_greedy());
            assert!(sampling.keep_eos_marker);
            assert_eq!(adjusters.len(), inputs.len());
            self.calls
                .lock()
                .unwrap()
                .push(inputs.iter().map(|i| i.page_index).collect());
            self.adjuster_names
                .lock()
                .unwrap()
                .extend(adjusters.iter().map(|a| a.name()));
            if self.fail {
                return Err(Pdf2TextError::GenerationFailed {
                    engine: "scripted".into(),
                    detail: "device lost".into(),
                });
            }
            let mut out: Vec<GeneratedSequence> = inputs
                .iter()
                .map(|i| {
                    let text = self
                        .texts
                        .get(&i.page_index)
                        .cloned()
                        .unwrap_or_else(|| format!("p{}{EOS}", i.page_index));
                    GeneratedSequence::new(text, 5)
                })
                .collect();
            if self.drop_last {
                out.pop();
            }
            Ok(out)
        })
    }
}

fn pipeline(
    engine: Arc<ScriptedEngine>,
    pages: usize,
    config: OcrConfig,
) -> BatchPipeline {
    BatchPipeline::new(engine, config)
        .with_rasterizer(FakeRasterizer::pages(pages))
        .with_input_builder(SlowFirstBuilder::new(pages))
}

fn three_page_engine() -> Arc<ScriptedEngine> {
    Arc::new(ScriptedEngine::with_texts(&[
        (0, format!("p0{EOS}").as_str()),
        (1, "again again again again"),
        (2, format!("p2{EOS}").as_str()),
    ]))
}

// ── Skip / keep policy ───────────────────────────────────────────────────────

#[tokio::test]
async fn skip_repeat_drops_unterminated_page_and_renumbers() {
    init_tracing();
    let config = OcrConfig::builder().skip_repeat(true).build().unwrap();
    let doc = pipeline(three_page_engine(), 3, config)
        .run(b"%PDF".to_vec())
        .await
        .unwrap();

    let map = doc.to_map();
    assert_eq!(map.len(), 2);
    assert_eq!(map[&0], "p0");
    assert_eq!(map[&1], "p2");
    assert_eq!(doc.pages[1].page_index, 2);
    assert_eq!(doc.skipped, vec![1]);
    assert_eq!(doc.stats.skipped_pages, 1);
    assert_eq!(doc.stats.kept_pages, 2);
}

#[tokio::test]
async fn keep_policy_retains_raw_unterminated_text() {
    let config = OcrConfig::default();
    let doc = pipeline(three_page_engine(), 3, config)
        .run(b"%PDF".to_vec())
        .await
        .unwrap();

    let map = doc.to_map();
    assert_eq!(map.keys().copied().collect::<Vec<_>>(), vec![0, 1, 2]);
    assert_eq!(map[&0], "p0");
    assert_eq!(map[&1], "again again again again");
    assert_eq!(map[&2], "p2");
    assert!(!doc.pages[1].terminated_cleanly);
    assert_eq!(doc.stats.unterminated_kept, 1);
    assert!(doc.skipped.is_empty());
}

#[tokio::test]
async fn page_map_json_uses_contiguous_keys() {
    let config = OcrConfig::builder().skip_repeat(true).build().unwrap();
    let doc = pipeline(three_page_engine(), 3, config)
        .run(b"%PDF".to_vec())
        .await
        .unwrap();
    let v = doc.to_page_map_json();
    assert_eq!(v["page_0"]["text"], "p0");
    assert_eq!(v["page_1"]["text"], "p2");
    assert!(v.get("page_2").is_none());
}

#[tokio::test]
async fn terminated_text_is_left_as_generated_by_default() {
    let raw = format!("line one  \nline two\t\n{EOS}");
    let engine = Arc::new(ScriptedEngine::with_texts(&[(0, raw.as_str())]));
    let doc = pipeline(Arc::clone(&engine), 1, OcrConfig::default())
        .run(b"%PDF".to_vec())
        .await
        .unwrap();
    assert_eq!(doc.pages[0].text, "line one  \nline two\t\n");
    assert!(doc.pages[0].terminated_cleanly);

    let config = OcrConfig::builder().tidy_whitespace(true).build().unwrap();
    let doc = pipeline(engine, 1, config)
        .run(b"%PDF".to_vec())
        .await
        .unwrap();
    assert_eq!(doc.pages[0].text, "line one\nline two");
}

// ── Ordering and batching ────────────────────────────────────────────────────

#[tokio::test]
async fn submission_order_matches_page_order_for_every_worker_count() {
    const PAGES: usize = 6;
    for workers in 1..=PAGES {
        let engine = Arc::new(ScriptedEngine::default());
        let config = OcrConfig::builder().num_workers(workers).build().unwrap();
        let doc = pipeline(Arc::clone(&engine), PAGES, config)
            .run(b"%PDF".to_vec())
            .await
            .unwrap();

        let calls = engine.calls.lock().unwrap().clone();
        assert_eq!(calls, vec![(0..PAGES).collect::<Vec<_>>()], "workers={workers}");
        let texts: Vec<String> = doc.pages.iter().map(|p| p.text.clone()).collect();
        let expected: Vec<String> = (0..PAGES).map(|i| format!("p{i}")).collect();
        assert_eq!(texts, expected, "workers={workers}");
    }
}

#[tokio::test]
async fn one_engine_call_with_one_guard_per_page() {
    let engine = Arc::new(ScriptedEngine::default());
    let config = OcrConfig::builder().max_concurrency(2).build().unwrap();
    pipeline(Arc::clone(&engine), 5, config)
        .run(b"%PDF".to_vec())
        .await
        .unwrap();

    assert_eq!(engine.call_count(), 1);
    let names = engine.adjuster_names.lock().unwrap().clone();
    assert_eq!(names, vec!["no_repeat_ngram"; 5]);
}

#[tokio::test]
async fn identical_runs_give_identical_mappings() {
    let engine = three_page_engine();
    let p = pipeline(Arc::clone(&engine), 3, OcrConfig::default());
    let first = p.run(b"%PDF".to_vec()).await.unwrap();
    let second = p.run(b"%PDF".to_vec()).await.unwrap();
    assert_eq!(first.to_map(), second.to_map());
    assert_eq!(engine.call_count(), 2);
}

#[tokio::test]
async fn engine_without_adjuster_support_still_runs() {
    let engine = Arc::new(ScriptedEngine {
        remote: true,
        ..Default::default()
    });
    let doc = pipeline(Arc::clone(&engine), 2, OcrConfig::default())
        .run(b"%PDF".to_vec())
        .await
        .unwrap();
    assert_eq!(doc.len(), 2);
}

#[test]
fn blocking_callers_can_drive_the_pipeline() {
    let engine = Arc::new(ScriptedEngine::default());
    let p = pipeline(Arc::clone(&engine), 3, OcrConfig::default());
    let doc = tokio_test::assert_ok!(tokio_test::block_on(p.run(b"%PDF".to_vec())));
    assert_eq!(doc.len(), 3);
    assert_eq!(engine.call_count(), 1);
}

// ── Failure phases ───────────────────────────────────────────────────────────

#[tokio::test]
async fn rasterization_failure_aborts_before_generation() {
    let engine = Arc::new(ScriptedEngine::default());
    let err = BatchPipeline::new(engine.clone(), OcrConfig::default())
        .with_rasterizer(Arc::new(FakeRasterizer {
            pages: 3,
            fail: true,
        }))
        .with_input_builder(SlowFirstBuilder::new(3))
        .run(b"garbage".to_vec())
        .await
        .unwrap_err();

    assert_eq!(err.phase(), Phase::Rasterization);
    assert_eq!(engine.call_count(), 0);
}

#[tokio::test]
async fn empty_document_is_rejected() {
    let engine = Arc::new(ScriptedEngine::default());
    let err = pipeline(engine.clone(), 0, OcrConfig::default())
        .run(b"%PDF".to_vec())
        .await
        .unwrap_err();
    assert!(matches!(err, Pdf2TextError::EmptyDocument));
    assert_eq!(engine.call_count(), 0);
}

#[tokio::test]
async fn input_build_failure_aborts_by_default() {
    let engine = Arc::new(ScriptedEngine::default());
    let builder = SlowFirstBuilder::failing(4, vec![2]);
    let err = BatchPipeline::new(engine.clone(), OcrConfig::default())
        .with_rasterizer(FakeRasterizer::pages(4))
        .with_input_builder(builder.clone())
        .run(b"%PDF".to_vec())
        .await
        .unwrap_err();

    assert_eq!(err.phase(), Phase::InputBuild);
    assert!(err.to_string().contains("page 2"), "got: {err}");
    assert_eq!(engine.call_count(), 0);
    // Sibling pages were still attempted.
    assert_eq!(builder.calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn exclude_policy_leaves_out_failing_page_only() {
    let engine = Arc::new(ScriptedEngine::default());
    let config = OcrConfig::builder()
        .input_failure_policy(InputFailurePolicy::ExcludePage)
        .build()
        .unwrap();
    let doc = BatchPipeline::new(engine.clone(), config)
        .with_rasterizer(FakeRasterizer::pages(4))
        .with_input_builder(SlowFirstBuilder::failing(4, vec![1]))
        .run(b"%PDF".to_vec())
        .await
        .unwrap();

    assert_eq!(engine.calls.lock().unwrap().clone(), vec![vec![0, 2, 3]]);
    assert_eq!(doc.excluded.len(), 1);
    assert_eq!(doc.excluded[0].page(), 1);
    let slots: Vec<(usize, usize)> = doc.pages.iter().map(|p| (p.slot, p.page_index)).collect();
    assert_eq!(slots, vec![(0, 0), (1, 2), (2, 3)]);
    assert_eq!(doc.stats.excluded_pages, 1);
}

#[tokio::test]
async fn engine_failure_yields_no_partial_results() {
    let engine = Arc::new(ScriptedEngine {
        fail: true,
        ..Default::default()
    });
    let err = pipeline(engine, 3, OcrConfig::default())
        .run(b"%PDF".to_vec())
        .await
        .unwrap_err();
    assert_eq!(err.phase(), Phase::Generation);
}

#[tokio::test]
async fn engine_returning_too_few_sequences_is_a_generation_error() {
    let engine = Arc::new(ScriptedEngine {
        drop_last: true,
        ..Default::default()
    });
    let err = pipeline(engine, 3, OcrConfig::default())
        .run(b"%PDF".to_vec())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Pdf2TextError::EngineOutputMismatch {
            expected: 3,
            got: 2
        }
    ));
    assert_eq!(err.phase(), Phase::Generation);
}

// ── Progress events ──────────────────────────────────────────────────────────

#[derive(Default)]
struct Counting {
    rasterized: AtomicUsize,
    prepared: AtomicUsize,
    errors: AtomicUsize,
    batch: AtomicUsize,
    kept: AtomicUsize,
}

impl ProgressCallback for Counting {
    fn on_document_rasterized(&self, total_pages: usize) {
        self.rasterized.store(total_pages, Ordering::SeqCst);
    }
    fn on_page_prepared(&self, _page_index: usize, _total_pages: usize) {
        self.prepared.fetch_add(1, Ordering::SeqCst);
    }
    fn on_page_error(&self, _page_index: usize, _total_pages: usize, _error: &str) {
        self.errors.fetch_add(1, Ordering::SeqCst);
    }
    fn on_generation_start(&self, batch_len: usize) {
        self.batch.store(batch_len, Ordering::SeqCst);
    }
    fn on_run_complete(&self, _total_pages: usize, kept_pages: usize) {
        self.kept.store(kept_pages, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn progress_events_follow_the_run() {
    let counting = Arc::new(Counting::default());
    let config = OcrConfig::builder()
        .skip_repeat(true)
        .input_failure_policy(InputFailurePolicy::ExcludePage)
        .progress_callback(counting.clone())
        .build()
        .unwrap();
    let engine = Arc::new(ScriptedEngine::with_texts(&[(2, "loop loop")]));
    BatchPipeline::new(engine, config)
        .with_rasterizer(FakeRasterizer::pages(4))
        .with_input_builder(SlowFirstBuilder::failing(4, vec![0]))
        .run(b"%PDF".to_vec())
        .await
        .unwrap();

    assert_eq!(counting.rasterized.load(Ordering::SeqCst), 4);
    assert_eq!(counting.prepared.load(Ordering::SeqCst), 3);
    assert_eq!(counting.errors.load(Ordering::SeqCst), 1);
    assert_eq!(counting.batch.load(Ordering::SeqCst), 3);
    assert_eq!(counting.kept.load(Ordering::SeqCst), 2);
}

// ── Stepwise engine with the real guard ──────────────────────────────────────

/// A decoder stuck in a loop: it always prefers continuing the cycle
/// `1 2 3`, with the end token as its second choice.
struct LoopingModel;

const END: u32 = 0;

impl TokenModel for LoopingModel {
    type State = ();

    fn eos_token_id(&self) -> u32 {
        END
    }

    fn prefill(&self, _input: &PageInput) -> ModelResult<()> {
        Ok(())
    }

    fn step(&self, batch: &mut [StepSlot<'_, ()>]) -> ModelResult<Vec<Vec<f32>>> {
        Ok(batch
            .iter()
            .map(|slot| {
                let next = slot.generated.len() % 3 + 1;
                let mut row = vec![0.0f32; 4];
                row[next] = 10.0;
                row[END as usize] = 5.0;
                row
            })
            .collect())
    }

    fn decode(&self, tokens: &[u32], _skip_special_tokens: bool) -> String {
        tokens
            .iter()
            .map(|t| t.to_string())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn stepwise_pipeline(config: OcrConfig) -> BatchPipeline {
    let engine = Arc::new(StepwiseEngine::new(Arc::new(LoopingModel)));
    BatchPipeline::new(engine, config)
        .with_rasterizer(FakeRasterizer::pages(2))
        .with_input_builder(SlowFirstBuilder::new(2))
}

#[tokio::test]
async fn guard_lets_looping_page_terminate() {
    let config = OcrConfig::builder()
        .ngram_size(3)
        .window_size(10)
        .whitelist(Vec::new())
        .max_tokens(32)
        .max_concurrency(2)
        .skip_repeat(true)
        .build()
        .unwrap();
    let doc = stepwise_pipeline(config).run(b"%PDF".to_vec()).await.unwrap();

    assert_eq!(doc.len(), 2);
    for page in &doc.pages {
        assert!(page.terminated_cleanly);
        assert_eq!(page.text, "1 2 3 1 2");
    }
}

#[tokio::test]
async fn whitelisted_loop_runs_out_of_budget_and_is_skipped() {
    let config = OcrConfig::builder()
        .ngram_size(3)
        .window_size(10)
        .whitelist([1, 2, 3])
        .max_tokens(32)
        .skip_repeat(true)
        .build()
        .unwrap();
    let doc = stepwise_pipeline(config).run(b"%PDF".to_vec()).await.unwrap();

    assert!(doc.is_empty());
    assert_eq!(doc.skipped, vec![0, 1]);
    assert_eq!(doc.stats.total_tokens, 64);
}
