//! Remote vision-LLM engine built on `edgequake-llm`.
//!
//! Each page input becomes one vision chat request: the prompt text (with the
//! `<image>` placeholder removed) plus the global view followed by the tiles.
//! Requests run with ordered, bounded concurrency so results come back in
//! input order.
//!
//! ## Retry Strategy
//!
//! HTTP 429 / 503 errors are transient under concurrent load. Each request is
//! retried with exponential backoff (`retry_backoff_ms * 2^attempt`). A page
//! that still fails after the last retry fails the whole batch.

use super::{GeneratedSequence, GenerationEngine, LogitsAdjuster, SamplingConfig};
use crate::error::Pdf2TextError;
use crate::pipeline::prepare::PageInput;
use crate::prompts::strip_image_placeholder;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider, ProviderFactory};
use futures::future::BoxFuture;
use futures::stream::{self, StreamExt, TryStreamExt};
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

const DEFAULT_MODEL: &str = "deepseek-ocr";

/// Engine that forwards page inputs to an [`LLMProvider`].
#[derive(Clone)]
pub struct ProviderEngine {
    provider: Arc<dyn LLMProvider>,
    label: String,
    max_retries: u32,
    retry_backoff_ms: u64,
}

impl std::fmt::Debug for ProviderEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderEngine")
            .field("provider", &self.label)
            .field("max_retries", &self.max_retries)
            .field("retry_backoff_ms", &self.retry_backoff_ms)
            .finish()
    }
}

impl ProviderEngine {
    pub fn new(provider: Arc<dyn LLMProvider>) -> Self {
        Self {
            provider,
            label: "provider".into(),
            max_retries: 3,
            retry_backoff_ms: 500,
        }
    }

    /// Instantiate a named provider (`"openai"`, `"ollama"`, …) serving `model`.
    pub fn from_name(provider_name: &str, model: &str) -> Result<Self, Pdf2TextError> {
        let provider = ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
            Pdf2TextError::InvalidConfig(format!(
                "provider '{provider_name}' could not be created: {e}"
            ))
        })?;
        Ok(Self::new(provider).with_label(provider_name))
    }

    /// Resolve a provider from the environment.
    ///
    /// 1. `EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL` when both are set;
    /// 2. `OPENAI_API_KEY` (OpenAI-compatible servers, e.g. vLLM with
    ///    `OPENAI_BASE_URL`) with `model` or `deepseek-ocr`;
    /// 3. `ProviderFactory::from_env()` auto-detection.
    pub fn from_env(model: Option<&str>) -> Result<Self, Pdf2TextError> {
        if let (Ok(prov), Ok(env_model)) = (
            std::env::var("EDGEQUAKE_LLM_PROVIDER"),
            std::env::var("EDGEQUAKE_MODEL"),
        ) {
            if !prov.is_empty() && !env_model.is_empty() {
                return Self::from_name(&prov, model.unwrap_or(&env_model));
            }
        }

        if std::env::var("OPENAI_API_KEY").is_ok_and(|k| !k.is_empty()) {
            return Self::from_name("openai", model.unwrap_or(DEFAULT_MODEL));
        }

        let (provider, _embedding) = ProviderFactory::from_env().map_err(|e| {
            Pdf2TextError::InvalidConfig(format!(
                "No generation provider could be auto-detected from environment.\n\
                 Set OPENAI_API_KEY (and OPENAI_BASE_URL for a local server) or pass --provider.\n\
                 Error: {e}"
            ))
        })?;
        Ok(Self::new(provider))
    }

    /// Name reported in logs and errors.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_retries(mut self, max_retries: u32, retry_backoff_ms: u64) -> Self {
        self.max_retries = max_retries;
        self.retry_backoff_ms = retry_backoff_ms;
        self
    }

    async fn complete_page(
        &self,
        input: PageInput,
        sampling: &SamplingConfig,
    ) -> Result<GeneratedSequence, Pdf2TextError> {
        let start = Instant::now();
        let page = input.page_index;
        let mut images = Vec::with_capacity(1 + input.tiles.len());
        images.push(input.global_view);
        images.extend(input.tiles);
        let prompt = strip_image_placeholder(&input.prompt);
        let messages = vec![ChatMessage::user_with_images(prompt.as_str(), images)];
        let options = CompletionOptions {
            temperature: Some(sampling.temperature),
            max_tokens: Some(sampling.max_tokens),
            ..Default::default()
        };

        let mut last_err: Option<String> = None;
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let backoff = self.retry_backoff_ms * 2u64.pow(attempt - 1);
                warn!(
                    "Page {}: retry {}/{} after {}ms",
                    page, attempt, self.max_retries, backoff
                );
                sleep(Duration::from_millis(backoff)).await;
            }

            match self.provider.chat(&messages, Some(&options)).await {
                Ok(response) => {
                    debug!(
                        "Page {}: {} input tokens, {} output tokens, {:?}",
                        page,
                        response.prompt_tokens,
                        response.completion_tokens,
                        start.elapsed()
                    );
                    let text = reattach_marker(
                        response.content,
                        response.finish_reason.as_deref(),
                        response.completion_tokens,
                        sampling,
                    );
                    return Ok(GeneratedSequence::new(text, response.completion_tokens));
                }
                Err(e) => {
                    warn!("Page {}: attempt {} failed: {}", page, attempt + 1, e);
                    last_err = Some(e.to_string());
                }
            }
        }

        Err(Pdf2TextError::GenerationFailed {
            engine: self.label.clone(),
            detail: format!(
                "page {page} failed after {} retries: {}",
                self.max_retries,
                last_err.unwrap_or_else(|| "unknown error".into())
            ),
        })
    }
}

/// Whether a completion stopped on the end token rather than the budget.
///
/// The finish reason decides when the server reports one: `stop` (and the
/// equivalent `end_turn`, `stop_sequence`, `eos`) is terminated, anything
/// else (`length`, `content_filter`, ...) is not. Without it, the token count
/// decides; a zero count on non-empty text means usage was not reported and
/// the page counts as unterminated.
fn stopped_on_end_token(
    finish_reason: Option<&str>,
    completion_tokens: usize,
    text: &str,
    max_tokens: usize,
) -> bool {
    match finish_reason.map(str::trim).filter(|r| !r.is_empty()) {
        Some(reason) => matches!(
            reason.to_ascii_lowercase().as_str(),
            "stop" | "end_turn" | "stop_sequence" | "eos"
        ),
        None if completion_tokens == 0 => text.is_empty(),
        None => completion_tokens < max_tokens,
    }
}

/// Servers strip the stop string from the completion; put the marker back on
/// completions that stopped on the end token.
fn reattach_marker(
    mut text: String,
    finish_reason: Option<&str>,
    completion_tokens: usize,
    sampling: &SamplingConfig,
) -> String {
    if !sampling.keep_eos_marker || text.ends_with(&sampling.eos_marker) {
        return text;
    }
    if stopped_on_end_token(finish_reason, completion_tokens, &text, sampling.max_tokens) {
        text.push_str(&sampling.eos_marker);
    } else {
        debug!(
            "Completion not terminated (finish_reason {:?}, {} tokens)",
            finish_reason, completion_tokens
        );
    }
    text
}

impl GenerationEngine for ProviderEngine {
    fn name(&self) -> &str {
        &self.label
    }

    fn hosts_adjusters(&self) -> bool {
        false
    }

    fn generate<'a>(
        &'a self,
        inputs: Vec<PageInput>,
        sampling: &'a SamplingConfig,
        _adjusters: Vec<Box<dyn LogitsAdjuster>>,
    ) -> BoxFuture<'a, Result<Vec<GeneratedSequence>, Pdf2TextError>> {
        Box::pin(async move {
            stream::iter(inputs.into_iter().map(|input| self.complete_page(input, sampling)))
                .buffered(sampling.max_concurrency.max(1))
                .try_collect()
                .await
        })
    }
}
