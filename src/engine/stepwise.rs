//! In-process greedy batch driver over a [`TokenModel`].
//!
//! The model owns the forward pass and the tokenizer; this engine owns the
//! decoding loop around it: batching sequences into waves of
//! `max_concurrency`, applying each sequence's adjuster to its scores,
//! picking the argmax token and detecting termination.
//!
//! The loop is CPU/GPU bound and runs on the blocking thread pool.

use super::{GeneratedSequence, GenerationEngine, LogitsAdjuster, SamplingConfig};
use crate::error::Pdf2TextError;
use crate::pipeline::prepare::PageInput;
use futures::future::BoxFuture;
use std::sync::Arc;
use tracing::{debug, warn};

pub type ModelResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// One active sequence handed to [`TokenModel::step`].
pub struct StepSlot<'a, S> {
    pub state: &'a mut S,
    /// Tokens generated so far for this sequence (prompt excluded).
    pub generated: &'a [u32],
}

/// A vision-language decoder that can be driven one step at a time.
pub trait TokenModel: Send + Sync + 'static {
    /// Per-sequence model state (KV cache, position, …).
    type State: Send;

    fn eos_token_id(&self) -> u32;

    /// Encode the prompt and image views of one page.
    fn prefill(&self, input: &PageInput) -> ModelResult<Self::State>;

    /// Run one decoding step for every slot. Returns one score vector per
    /// slot, in slot order.
    fn step(&self, batch: &mut [StepSlot<'_, Self::State>]) -> ModelResult<Vec<Vec<f32>>>;

    /// Detokenize generated tokens (end token excluded).
    fn decode(&self, tokens: &[u32], skip_special_tokens: bool) -> String;
}

/// Greedy engine that calls every adjuster once per decoding step.
pub struct StepwiseEngine<M> {
    model: Arc<M>,
}

impl<M: TokenModel> StepwiseEngine<M> {
    pub fn new(model: Arc<M>) -> Self {
        Self { model }
    }

    pub fn model(&self) -> &Arc<M> {
        &self.model
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Finish {
    Eos,
    Budget,
    NoCandidate,
}

struct Active<S> {
    index: usize,
    state: S,
    generated: Vec<u32>,
    adjuster: Box<dyn LogitsAdjuster>,
    finish: Option<Finish>,
}

impl<M: TokenModel> GenerationEngine for StepwiseEngine<M> {
    fn name(&self) -> &str {
        "stepwise"
    }

    fn generate<'a>(
        &'a self,
        inputs: Vec<PageInput>,
        sampling: &'a SamplingConfig,
        adjusters: Vec<Box<dyn LogitsAdjuster>>,
    ) -> BoxFuture<'a, Result<Vec<GeneratedSequence>, Pdf2TextError>> {
        let model = Arc::clone(&self.model);
        let sampling = sampling.clone();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || decode_batch(&*model, inputs, &sampling, adjusters))
                .await
                .map_err(|e| Pdf2TextError::Internal(format!("Decode task panicked: {e}")))?
        })
    }
}

fn engine_error(detail: impl std::fmt::Display) -> Pdf2TextError {
    Pdf2TextError::GenerationFailed {
        engine: "stepwise".into(),
        detail: detail.to_string(),
    }
}

/// Blocking decode loop for the whole batch.
fn decode_batch<M: TokenModel>(
    model: &M,
    inputs: Vec<PageInput>,
    sampling: &SamplingConfig,
    adjusters: Vec<Box<dyn LogitsAdjuster>>,
) -> Result<Vec<GeneratedSequence>, Pdf2TextError> {
    if !sampling.is_greedy() {
        return Err(engine_error(format!(
            "only greedy decoding is supported (temperature {})",
            sampling.temperature
        )));
    }
    if adjusters.len() != inputs.len() {
        return Err(engine_error(format!(
            "{} adjusters for {} inputs",
            adjusters.len(),
            inputs.len()
        )));
    }

    let total = inputs.len();
    let width = sampling.max_concurrency.max(1);
    let mut outputs: Vec<Option<GeneratedSequence>> = (0..total).map(|_| None).collect();
    let mut pending = inputs.into_iter().zip(adjusters).enumerate();

    loop {
        let mut wave = Vec::with_capacity(width);
        for (index, (input, adjuster)) in pending.by_ref().take(width) {
            let state = model
                .prefill(&input)
                .map_err(|e| engine_error(format!("prefill of page {}: {e}", input.page_index)))?;
            wave.push(Active {
                index,
                state,
                generated: Vec::new(),
                adjuster,
                finish: None,
            });
        }
        if wave.is_empty() {
            break;
        }
        debug!("Decoding wave of {} sequences", wave.len());

        while !wave.is_empty() {
            step_wave(model, &mut wave, sampling)?;

            let mut i = 0;
            while i < wave.len() {
                if wave[i].finish.is_some() {
                    let done = wave.swap_remove(i);
                    let slot = done.index;
                    outputs[slot] = Some(finish_sequence(model, done, sampling));
                } else {
                    i += 1;
                }
            }
        }
    }

    outputs
        .into_iter()
        .enumerate()
        .map(|(i, o)| o.ok_or_else(|| engine_error(format!("sequence {i} produced no output"))))
        .collect()
}

/// Advance every sequence of the wave by one token.
fn step_wave<M: TokenModel>(
    model: &M,
    wave: &mut [Active<M::State>],
    sampling: &SamplingConfig,
) -> Result<(), Pdf2TextError> {
    let scores = {
        let mut slots: Vec<StepSlot<'_, M::State>> = wave
            .iter_mut()
            .map(|a| StepSlot {
                state: &mut a.state,
                generated: &a.generated,
            })
            .collect();
        model.step(&mut slots).map_err(engine_error)?
    };
    if scores.len() != wave.len() {
        return Err(engine_error(format!(
            "model returned {} score vectors for {} sequences",
            scores.len(),
            wave.len()
        )));
    }

    let eos = model.eos_token_id();
    for (active, mut row) in wave.iter_mut().zip(scores) {
        active.adjuster.adjust(&active.generated, &mut row);

        let Some(token) = argmax(&row) else {
            warn!(
                "Sequence {}: every candidate suppressed after {} tokens",
                active.index,
                active.generated.len()
            );
            active.finish = Some(Finish::NoCandidate);
            continue;
        };

        active.generated.push(token);
        if token == eos {
            active.finish = Some(Finish::Eos);
        } else if active.generated.len() >= sampling.max_tokens {
            active.finish = Some(Finish::Budget);
        }
    }
    Ok(())
}

fn finish_sequence<M: TokenModel>(
    model: &M,
    done: Active<M::State>,
    sampling: &SamplingConfig,
) -> GeneratedSequence {
    let token_count = done.generated.len();
    let body = match done.finish {
        Some(Finish::Eos) => &done.generated[..token_count - 1],
        _ => &done.generated[..],
    };
    let mut text = model.decode(body, sampling.skip_special_tokens);
    if done.finish == Some(Finish::Eos) && sampling.keep_eos_marker {
        text.push_str(&sampling.eos_marker);
    }
    debug!(
        "Sequence {} finished ({:?}) after {} tokens",
        done.index, done.finish, token_count
    );
    GeneratedSequence { text, token_count }
}

/// Index of the highest finite score; `None` when nothing is selectable.
fn argmax(scores: &[f32]) -> Option<u32> {
    let mut best: Option<(usize, f32)> = None;
    for (idx, &val) in scores.iter().enumerate() {
        if !val.is_finite() {
            continue;
        }
        if best.is_none_or(|(_, b)| val > b) {
            best = Some((idx, val));
        }
    }
    best.map(|(idx, _)| idx as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::RepetitionGuard;
    use crate::pipeline::prepare::CropMode;
    use edgequake_llm::ImageData;
    use std::sync::Mutex;

    const EOS: u32 = 0;
    const VOCAB: usize = 8;

    /// Replays a fixed preference order per page: at each step the first
    /// script token gets the top score, the rest decay.
    struct ScriptedModel {
        scripts: Vec<Vec<u32>>,
        step_batches: Mutex<Vec<usize>>,
    }

    impl ScriptedModel {
        fn new(scripts: Vec<Vec<u32>>) -> Self {
            Self {
                scripts,
                step_batches: Mutex::new(Vec::new()),
            }
        }
    }

    struct ScriptState {
        page: usize,
    }

    impl TokenModel for ScriptedModel {
        type State = ScriptState;

        fn eos_token_id(&self) -> u32 {
            EOS
        }

        fn prefill(&self, input: &PageInput) -> ModelResult<ScriptState> {
            if input.prompt == "explode" {
                return Err("bad prompt".into());
            }
            Ok(ScriptState {
                page: input.page_index,
            })
        }

        fn step(&self, batch: &mut [StepSlot<'_, ScriptState>]) -> ModelResult<Vec<Vec<f32>>> {
            self.step_batches.lock().unwrap().push(batch.len());
            Ok(batch
                .iter()
                .map(|slot| {
                    let script = &self.scripts[slot.state.page];
                    let pos = slot.generated.len();
                    let mut row = vec![-10.0f32; VOCAB];
                    // Preferred token first, then a fallback one below it.
                    if let Some(&t) = script.get(pos) {
                        row[t as usize] = 5.0;
                    }
                    row[7] = 1.0;
                    row
                })
                .collect())
        }

        fn decode(&self, tokens: &[u32], _skip_special_tokens: bool) -> String {
            tokens.iter().map(|t| char::from(b'a' + *t as u8)).collect()
        }
    }

    fn input(page: usize) -> PageInput {
        PageInput {
            page_index: page,
            prompt: "ocr".into(),
            crop_mode: CropMode::None,
            global_view: ImageData::new("", "image/png"),
            tiles: Vec::new(),
            grid: None,
        }
    }

    struct CountingAdjuster {
        calls: Arc<Mutex<Vec<usize>>>,
    }

    impl LogitsAdjuster for CountingAdjuster {
        fn adjust(&mut self, history: &[u32], _scores: &mut [f32]) {
            self.calls.lock().unwrap().push(history.len());
        }
    }

    fn no_op_adjusters(n: usize) -> Vec<Box<dyn LogitsAdjuster>> {
        (0..n)
            .map(|_| {
                Box::new(CountingAdjuster {
                    calls: Arc::new(Mutex::new(Vec::new())),
                }) as Box<dyn LogitsAdjuster>
            })
            .collect()
    }

    #[test]
    fn eos_marker_kept_and_budget_respected() {
        let model = ScriptedModel::new(vec![vec![1, 2, EOS], vec![3, 3, 3, 3, 3, 3]]);
        let sampling = SamplingConfig::greedy(4, "<eos>").with_max_concurrency(2);
        let out = decode_batch(&model, vec![input(0), input(1)], &sampling, no_op_adjusters(2))
            .unwrap();
        assert_eq!(out[0], GeneratedSequence::new("bc<eos>", 3));
        assert_eq!(out[1], GeneratedSequence::new("dddd", 4));
    }

    #[test]
    fn adjuster_called_once_per_step() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let model = ScriptedModel::new(vec![vec![1, 2, 3, EOS]]);
        let sampling = SamplingConfig::greedy(16, "<eos>");
        let adjusters: Vec<Box<dyn LogitsAdjuster>> = vec![Box::new(CountingAdjuster {
            calls: Arc::clone(&calls),
        })];
        decode_batch(&model, vec![input(0)], &sampling, adjusters).unwrap();
        assert_eq!(*calls.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn guard_breaks_repetition_loop() {
        // Page 0 wants to loop "1 2 3" forever; the guard forces the fallback.
        let model = ScriptedModel::new(vec![vec![1, 2, 3, 1, 2, 3, 1, 2, 3, EOS]]);
        let sampling = SamplingConfig::greedy(6, "<eos>");
        let guard = RepetitionGuard::new(3, 10, []).unwrap();
        let out = decode_batch(&model, vec![input(0)], &sampling, vec![Box::new(guard)]).unwrap();
        // After "1 2 3 1 2", completing "3" is banned and token 7 wins.
        assert_eq!(out[0].text, "bcdbch");
    }

    #[test]
    fn outputs_follow_input_order_when_finishing_out_of_order() {
        // One wave; page 1 finishes first, page 0 last.
        let model = ScriptedModel::new(vec![
            vec![1, 1, 1, 1, EOS],
            vec![2, EOS],
            vec![3, 3, EOS],
        ]);
        let sampling = SamplingConfig::greedy(16, "<eos>").with_max_concurrency(3);
        let inputs = (0..3).map(input).collect();
        let out = decode_batch(&model, inputs, &sampling, no_op_adjusters(3)).unwrap();
        let texts: Vec<&str> = out.iter().map(|s| s.text.as_str()).collect();
        assert_eq!(texts, vec!["bbbb<eos>", "c<eos>", "dd<eos>"]);
        assert_eq!(*model.step_batches.lock().unwrap(), vec![3, 3, 2, 1, 1]);
    }

    #[test]
    fn waves_respect_max_concurrency() {
        let scripts = (0..5).map(|_| vec![1, EOS]).collect();
        let model = ScriptedModel::new(scripts);
        let sampling = SamplingConfig::greedy(8, "<eos>").with_max_concurrency(2);
        let inputs = (0..5).map(input).collect();
        let out = decode_batch(&model, inputs, &sampling, no_op_adjusters(5)).unwrap();
        assert_eq!(out.len(), 5);
        assert!(model.step_batches.lock().unwrap().iter().all(|&n| n <= 2));
    }

    #[test]
    fn sampling_temperature_is_rejected() {
        let model = ScriptedModel::new(vec![vec![EOS]]);
        let mut sampling = SamplingConfig::greedy(8, "<eos>");
        sampling.temperature = 0.7;
        let err = decode_batch(&model, vec![input(0)], &sampling, no_op_adjusters(1)).unwrap_err();
        assert!(matches!(err, Pdf2TextError::GenerationFailed { .. }));
    }

    #[test]
    fn prefill_failure_fails_the_batch() {
        let model = ScriptedModel::new(vec![vec![EOS], vec![EOS]]);
        let sampling = SamplingConfig::greedy(8, "<eos>");
        let mut bad = input(1);
        bad.prompt = "explode".into();
        let err = decode_batch(&model, vec![input(0), bad], &sampling, no_op_adjusters(2))
            .unwrap_err();
        assert!(err.to_string().contains("page 1"), "got: {err}");
    }

    #[tokio::test]
    async fn generate_runs_on_blocking_pool() {
        let engine = StepwiseEngine::new(Arc::new(ScriptedModel::new(vec![vec![2, EOS]])));
        let sampling = SamplingConfig::greedy(8, "<eos>");
        let out = engine
            .generate(vec![input(0)], &sampling, no_op_adjusters(1))
            .await
            .unwrap();
        assert_eq!(out[0].text, "c<eos>");
        assert_eq!(engine.name(), "stepwise");
        assert!(engine.hosts_adjusters());
    }

    #[test]
    fn argmax_skips_suppressed() {
        assert_eq!(argmax(&[1.0, f32::NEG_INFINITY, 0.5]), Some(0));
        assert_eq!(argmax(&[f32::NEG_INFINITY, 2.0]), Some(1));
        assert_eq!(argmax(&[f32::NEG_INFINITY, f32::NAN]), None);
    }
}
