//! Slot assignment: engine sequences → kept [`PageResult`]s.
//!
//! Sequences are walked in submission (page) order. Every kept page takes
//! the next slot, so slots are always contiguous from 0 no matter how many
//! pages the skip policy drops.

use crate::engine::GeneratedSequence;
use crate::error::Pdf2TextError;
use crate::output::PageResult;
use crate::pipeline::postprocess::{process_sequence, CleanupRules};
use tracing::warn;

/// Kept pages plus the pages dropped by the skip policy.
#[derive(Debug, Default)]
pub struct Assembled {
    pub pages: Vec<PageResult>,
    pub skipped: Vec<usize>,
    pub unterminated_kept: usize,
}

/// Fold `sequences` (one per entry of `page_indices`) into slotted results.
pub fn assign_slots(
    page_indices: &[usize],
    sequences: Vec<GeneratedSequence>,
    eos_marker: &str,
    skip_repeat: bool,
    rules: CleanupRules,
) -> Result<Assembled, Pdf2TextError> {
    if sequences.len() != page_indices.len() {
        return Err(Pdf2TextError::EngineOutputMismatch {
            expected: page_indices.len(),
            got: sequences.len(),
        });
    }

    let mut out = Assembled::default();
    for (&page_index, seq) in page_indices.iter().zip(sequences) {
        let outcome = process_sequence(&seq.text, eos_marker, rules);
        if !outcome.terminated_cleanly {
            if skip_repeat {
                warn!(
                    "Page {}: no end marker after {} tokens, skipped",
                    page_index, seq.token_count
                );
                out.skipped.push(page_index);
                continue;
            }
            warn!(
                "Page {}: no end marker after {} tokens, kept raw",
                page_index, seq.token_count
            );
            out.unterminated_kept += 1;
        }
        out.pages.push(PageResult {
            slot: out.pages.len(),
            page_index,
            text: outcome.text,
            terminated_cleanly: outcome.terminated_cleanly,
            token_count: seq.token_count,
        });
    }
    Ok(out)
}
