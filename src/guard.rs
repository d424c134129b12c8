//! Decoding-time n-gram repetition guard.
//!
//! Autoregressive OCR decoders occasionally fall into loops, emitting the
//! same run of tokens until the output budget is exhausted. [`RepetitionGuard`]
//! blocks that at the source: at every decoding step it sets the score of any
//! candidate token that would complete an n-gram already present in the
//! recent history to `-inf`, so no sampler can ever pick it.
//!
//! Some tokens repeat legitimately (table cell markup such as `<td>` and
//! `</td>`), so a whitelist exempts them from suppression.
//!
//! ## Search window
//!
//! With history length `t`, n-gram size `n` and window size `w`, the n-grams
//! considered are those of exactly `n` tokens whose start position lies in
//! `[max(0, t - w), t - n]`, i.e. complete n-grams beginning inside the last
//! `w` tokens of history.
//!
//! ## Index
//!
//! [`NgramWindow`] keeps a map `prefix (n-1 tokens) → {next token → count}`
//! over exactly the n-grams of the window. Each appended token inserts at
//! most one n-gram and evicts at most one, so a decoding step costs a single
//! hash lookup instead of a rescan of the window for every vocabulary entry.

use crate::engine::LogitsAdjuster;
use crate::error::Pdf2TextError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};

/// Default n-gram length. Matches the DeepSeek-OCR PDF runner.
pub const DEFAULT_NGRAM_SIZE: usize = 20;

/// Default search window.
pub const DEFAULT_WINDOW_SIZE: usize = 50;

/// Token ids of `<td>` and `</td>` in the DeepSeek-OCR vocabulary.
pub const DEFAULT_WHITELIST: [u32; 2] = [128821, 128822];

/// Serialisable guard settings; one fresh [`RepetitionGuard`] is built from
/// this per sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardConfig {
    /// Length of the repeated unit to forbid. Must be ≥ 1.
    pub ngram_size: usize,
    /// How many trailing tokens of history to search. Must be ≥ `ngram_size`.
    pub window_size: usize,
    /// Tokens that are never suppressed.
    pub whitelist: BTreeSet<u32>,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            ngram_size: DEFAULT_NGRAM_SIZE,
            window_size: DEFAULT_WINDOW_SIZE,
            whitelist: DEFAULT_WHITELIST.into_iter().collect(),
        }
    }
}

impl GuardConfig {
    /// Reject malformed sizes.
    pub fn validate(&self) -> Result<(), Pdf2TextError> {
        validate_sizes(self.ngram_size, self.window_size)
    }

    /// Build a fresh guard with an empty history.
    pub fn build(&self) -> Result<RepetitionGuard, Pdf2TextError> {
        RepetitionGuard::new(
            self.ngram_size,
            self.window_size,
            self.whitelist.iter().copied(),
        )
    }
}

fn validate_sizes(ngram_size: usize, window_size: usize) -> Result<(), Pdf2TextError> {
    if ngram_size < 1 {
        return Err(Pdf2TextError::InvalidConfig(
            "ngram_size must be ≥ 1".into(),
        ));
    }
    if window_size < ngram_size {
        return Err(Pdf2TextError::InvalidConfig(format!(
            "window_size must be ≥ ngram_size ({}), got {}",
            ngram_size, window_size
        )));
    }
    Ok(())
}

// ── NgramWindow ──────────────────────────────────────────────────────────

/// Token history plus an incrementally maintained index of the n-grams that
/// start inside the last `window_size` positions.
///
/// # Invariants
/// - `index` holds exactly the n-grams starting at `evicted_to..indexed_to`
/// - `evicted_to == max(0, t - window_size)` and `indexed_to == max(0, t - n + 1)`
///   after every [`NgramWindow::push`]
/// - every stored count is ≥ 1
#[derive(Debug, Clone)]
pub struct NgramWindow {
    ngram_size: usize,
    window_size: usize,
    history: Vec<u32>,
    index: HashMap<Box<[u32]>, HashMap<u32, usize>>,
    indexed_to: usize,
    evicted_to: usize,
}

impl NgramWindow {
    fn new(ngram_size: usize, window_size: usize) -> Self {
        Self {
            ngram_size,
            window_size,
            history: Vec::new(),
            index: HashMap::new(),
            indexed_to: 0,
            evicted_to: 0,
        }
    }

    /// The full token history of the sequence.
    pub fn history(&self) -> &[u32] {
        &self.history
    }

    /// Number of distinct n-gram prefixes currently indexed.
    pub fn indexed_prefixes(&self) -> usize {
        self.index.len()
    }

    /// Append one token and slide the window.
    pub fn push(&mut self, token: u32) {
        self.history.push(token);
        let t = self.history.len();

        let hi = (t + 1).saturating_sub(self.ngram_size);
        while self.indexed_to < hi {
            self.insert(self.indexed_to);
            self.indexed_to += 1;
        }

        let lo = t.saturating_sub(self.window_size);
        while self.evicted_to < lo {
            self.evict(self.evicted_to);
            self.evicted_to += 1;
        }
    }

    /// Drop all state.
    pub fn clear(&mut self) {
        self.history.clear();
        self.index.clear();
        self.indexed_to = 0;
        self.evicted_to = 0;
    }

    /// Tokens that would complete an n-gram already in the window.
    pub fn completions(&self) -> impl Iterator<Item = u32> + '_ {
        let t = self.history.len();
        let found = if t >= self.ngram_size {
            let prefix = &self.history[t - (self.ngram_size - 1)..];
            self.index.get(prefix)
        } else {
            None
        };
        found.into_iter().flat_map(|next| next.keys().copied())
    }

    fn insert(&mut self, start: usize) {
        let end = start + self.ngram_size - 1;
        let prefix: Box<[u32]> = self.history[start..end].into();
        let next = self.history[end];
        *self.index.entry(prefix).or_default().entry(next).or_insert(0) += 1;
    }

    fn evict(&mut self, start: usize) {
        let end = start + self.ngram_size - 1;
        let prefix = &self.history[start..end];
        let next = self.history[end];
        let Some(nexts) = self.index.get_mut(prefix) else {
            return;
        };
        if let Some(count) = nexts.get_mut(&next) {
            *count -= 1;
            if *count == 0 {
                nexts.remove(&next);
            }
        }
        if nexts.is_empty() {
            self.index.remove(prefix);
        }
    }
}

// ── RepetitionGuard ──────────────────────────────────────────────────────

/// Per-sequence repetition constraint.
///
/// One instance per generated sequence; the history it owns is never shared.
#[derive(Debug, Clone)]
pub struct RepetitionGuard {
    window: NgramWindow,
    whitelist: HashSet<u32>,
}

impl RepetitionGuard {
    /// Create a guard with an empty history.
    ///
    /// # Errors
    /// [`Pdf2TextError::InvalidConfig`] if `ngram_size < 1` or
    /// `window_size < ngram_size` (which includes `window_size == 0`).
    pub fn new(
        ngram_size: usize,
        window_size: usize,
        whitelist: impl IntoIterator<Item = u32>,
    ) -> Result<Self, Pdf2TextError> {
        validate_sizes(ngram_size, window_size)?;
        Ok(Self {
            window: NgramWindow::new(ngram_size, window_size),
            whitelist: whitelist.into_iter().collect(),
        })
    }

    pub fn ngram_size(&self) -> usize {
        self.window.ngram_size
    }

    pub fn window_size(&self) -> usize {
        self.window.window_size
    }

    pub fn is_whitelisted(&self, token: u32) -> bool {
        self.whitelist.contains(&token)
    }

    /// Tokens emitted so far.
    pub fn history(&self) -> &[u32] {
        self.window.history()
    }

    /// Record one emitted token.
    pub fn observe(&mut self, token: u32) {
        self.window.push(token);
    }

    /// Tokens that must not be emitted next, sorted ascending.
    pub fn banned_tokens(&self) -> Vec<u32> {
        let mut banned: Vec<u32> = self
            .window
            .completions()
            .filter(|t| !self.whitelist.contains(t))
            .collect();
        banned.sort_unstable();
        banned
    }

    /// Set every banned token's score to `-inf`. Returns how many were set.
    pub fn apply(&self, scores: &mut [f32]) -> usize {
        let mut suppressed = 0;
        for token in self.window.completions() {
            if self.whitelist.contains(&token) {
                continue;
            }
            if let Some(score) = scores.get_mut(token as usize) {
                *score = f32::NEG_INFINITY;
                suppressed += 1;
            }
        }
        suppressed
    }

    /// Bring the owned history in line with the engine's view of it.
    ///
    /// Engines pass the full history every step; the common case is that it
    /// grew by one token. Anything else (a different sequence, a rewound
    /// history) rebuilds the window from scratch.
    fn sync(&mut self, history: &[u32]) {
        let known = self.window.history.len();
        let extends = history.len() >= known
            && (known == 0 || history[known - 1] == self.window.history[known - 1]);
        if !extends {
            self.window.clear();
        }
        let start = self.window.history.len();
        for &token in &history[start..] {
            self.window.push(token);
        }
    }
}

impl LogitsAdjuster for RepetitionGuard {
    fn adjust(&mut self, history: &[u32], scores: &mut [f32]) {
        self.sync(history);
        self.apply(scores);
    }

    fn name(&self) -> &'static str {
        "no_repeat_ngram"
    }
}
