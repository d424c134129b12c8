//! Post-processing: classify each generated sequence and clean its text.
//!
//! A sequence that contains the end marker finished on its own; the marker
//! is removed and nothing else changes unless a [`CleanupRules`] flag asks
//! for it. A sequence without the marker ran out of budget (typically a
//! repetition loop the guard could only delay) and is returned raw for the
//! skip/keep policy to decide.
//!
//! ## Rule Order (terminated sequences)
//!
//! 1. Remove every occurrence of the end marker
//! 2. `tidy_whitespace`: normalise line endings (CRLF → LF)
//! 3. `strip_grounding`: replace grounding spans with their label
//! 4. `tidy_whitespace`: trim trailing whitespace per line and at the end
//!
//! Both flags are off by default.

use once_cell::sync::Lazy;
use regex::Regex;

/// Text of one sequence and whether it terminated on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceOutcome {
    pub text: String,
    pub terminated_cleanly: bool,
}

/// Which optional rules to run. All off by default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupRules {
    /// Normalise line endings and trim trailing whitespace.
    pub tidy_whitespace: bool,
    pub strip_grounding: bool,
}

/// Split the end marker off a raw sequence.
pub fn split_marker(raw: &str, marker: &str) -> SequenceOutcome {
    if !marker.is_empty() && raw.contains(marker) {
        SequenceOutcome {
            text: raw.replace(marker, ""),
            terminated_cleanly: true,
        }
    } else {
        SequenceOutcome {
            text: raw.to_string(),
            terminated_cleanly: false,
        }
    }
}

/// Classify a raw sequence and apply `rules` when it terminated cleanly.
pub fn process_sequence(raw: &str, marker: &str, rules: CleanupRules) -> SequenceOutcome {
    let mut outcome = split_marker(raw, marker);
    if outcome.terminated_cleanly {
        outcome.text = clean(outcome.text, rules);
    }
    outcome
}

fn clean(mut text: String, rules: CleanupRules) -> String {
    if rules.tidy_whitespace {
        text = normalise_line_endings(&text);
    }
    if rules.strip_grounding {
        text = strip_grounding(&text);
    }
    if rules.tidy_whitespace {
        text = trim_trailing_whitespace(&text);
    }
    text
}

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

// `<|ref|>label<|/ref|><|det|>[[x0, y0, x1, y1]]<|/det|>`
static RE_GROUNDING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)<\|ref\|>(.*?)<\|/ref\|><\|det\|>.*?<\|/det\|>").unwrap()
});

/// Replace grounding spans with their label.
pub fn strip_grounding(input: &str) -> String {
    RE_GROUNDING.replace_all(input, "$1").to_string()
}

fn trim_trailing_whitespace(input: &str) -> String {
    input
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
        .trim_end()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const EOS: &str = "<｜end▁of▁sentence｜>";

    #[test]
    fn marker_present_is_stripped() {
        let o = split_marker(&format!("hello{EOS}"), EOS);
        assert_eq!(o.text, "hello");
        assert!(o.terminated_cleanly);
    }

    #[test]
    fn marker_absent_is_unterminated_raw() {
        let raw = "loop loop loop   \r\n";
        let o = process_sequence(raw, EOS, CleanupRules::default());
        assert_eq!(o.text, raw);
        assert!(!o.terminated_cleanly);
    }

    #[test]
    fn empty_text_with_marker_is_clean() {
        let o = process_sequence(EOS, EOS, CleanupRules::default());
        assert_eq!(o.text, "");
        assert!(o.terminated_cleanly);
    }

    #[test]
    fn default_rules_only_remove_the_marker() {
        let raw = format!("line one  \nline two\t\n{EOS}");
        let o = process_sequence(&raw, EOS, CleanupRules::default());
        assert_eq!(o.text, "line one  \nline two\t\n");
        assert!(o.terminated_cleanly);

        let crlf = format!("a\r\nb\r\n{EOS}");
        assert_eq!(process_sequence(&crlf, EOS, CleanupRules::default()).text, "a\r\nb\r\n");
    }

    #[test]
    fn tidy_whitespace_is_opt_in() {
        let raw = format!("# Title  \r\nbody\t\r\n\r\n{EOS}");
        let rules = CleanupRules {
            tidy_whitespace: true,
            ..Default::default()
        };
        assert_eq!(process_sequence(&raw, EOS, rules).text, "# Title\nbody");
    }

    #[test]
    fn grounding_spans_replaced_by_label() {
        let raw = "<|ref|>title<|/ref|><|det|>[[10, 20, 300, 40]]<|/det|>\n# Report";
        assert_eq!(strip_grounding(raw), "title\n# Report");

        let kept = process_sequence(&format!("{raw}{EOS}"), EOS, CleanupRules::default());
        assert!(kept.text.contains("<|det|>"));

        let stripped = process_sequence(
            &format!("{raw}{EOS}"),
            EOS,
            CleanupRules {
                strip_grounding: true,
                ..Default::default()
            },
        );
        assert_eq!(stripped.text, "title\n# Report");
    }

    #[test]
    fn empty_marker_never_terminates() {
        assert!(!split_marker("text", "").terminated_cleanly);
    }
}
