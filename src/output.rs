//! Output types returned by a pipeline run.
//!
//! A run yields a [`DocumentText`]: the kept pages keyed by a contiguous
//! output *slot* (0, 1, 2, …) plus what was left out and why. The slot and
//! the physical page index are separate fields because the skip policy can
//! drop pages, after which the two no longer line up.

use crate::config::PageSeparator;
use crate::error::PageError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One kept page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageResult {
    /// Position in the output mapping.
    pub slot: usize,
    /// 0-indexed physical page in the source document.
    pub page_index: usize,
    pub text: String,
    /// `false` when the sequence never emitted the end marker and was kept
    /// raw.
    pub terminated_cleanly: bool,
    /// Tokens the engine generated for this page.
    pub token_count: usize,
}

/// Counters and phase timings for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    /// Pages in the source document.
    pub total_pages: usize,
    /// Pages submitted to the engine.
    pub submitted_pages: usize,
    pub kept_pages: usize,
    /// Pages dropped because they never terminated.
    pub skipped_pages: usize,
    /// Pages kept even though they never terminated.
    pub unterminated_kept: usize,
    /// Pages left out because their input could not be built.
    pub excluded_pages: usize,
    pub total_tokens: u64,
    pub rasterize_duration_ms: u64,
    pub prepare_duration_ms: u64,
    pub generate_duration_ms: u64,
    pub total_duration_ms: u64,
}

/// Result of a successful run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentText {
    /// Kept pages in slot order.
    pub pages: Vec<PageResult>,
    /// Physical indices of pages dropped by `skip_repeat`.
    pub skipped: Vec<usize>,
    /// Pages excluded before generation.
    pub excluded: Vec<PageError>,
    pub stats: RunStats,
}

impl DocumentText {
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Slot → text mapping.
    pub fn to_map(&self) -> BTreeMap<usize, String> {
        self.pages.iter().map(|p| (p.slot, p.text.clone())).collect()
    }

    pub fn page_for_slot(&self, slot: usize) -> Option<&PageResult> {
        self.pages.get(slot).filter(|p| p.slot == slot)
    }

    /// `{"page_0": {"text": …}, "page_1": …}` keyed by slot.
    pub fn to_page_map_json(&self) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> = self
            .pages
            .iter()
            .map(|p| {
                (
                    format!("page_{}", p.slot),
                    serde_json::json!({ "text": p.text }),
                )
            })
            .collect();
        serde_json::Value::Object(map)
    }

    /// Join all kept pages into one text, separated by `separator`.
    pub fn assemble(&self, separator: &PageSeparator) -> String {
        let mut out = String::new();
        for (i, page) in self.pages.iter().enumerate() {
            if i > 0 {
                out.push_str(&separator.render(page.page_index + 1));
            }
            out.push_str(&page.text);
        }
        out
    }
}
