//! Prompts and markers understood by DeepSeek-OCR-style document models.
//!
//! The model expects an `<image>` placeholder where the vision tokens are
//! spliced in. In-process engines keep it; chat APIs attach images out of
//! band, so [`strip_image_placeholder`] removes it for them.

/// Placeholder marking where the page views go in the prompt.
pub const IMAGE_PLACEHOLDER: &str = "<image>";

/// Default prompt: layout-aware conversion to Markdown with grounding boxes.
pub const DEFAULT_PROMPT: &str = "<image>\n<|grounding|>Convert the document to markdown.";

/// Plain transcription without layout grounding.
pub const FREE_OCR_PROMPT: &str = "<image>\nFree OCR.";

/// Instruction-only prompt for general chat models.
pub const PLAIN_PROMPT: &str = "Extract text from this image.";

/// End-of-sentence marker emitted by the model when a page is finished.
pub const DEFAULT_EOS_MARKER: &str = "<｜end▁of▁sentence｜>";

/// Remove the image placeholder (and the newline after it) from `prompt`.
pub fn strip_image_placeholder(prompt: &str) -> String {
    prompt
        .replace(&format!("{IMAGE_PLACEHOLDER}\n"), "")
        .replace(IMAGE_PLACEHOLDER, "")
        .trim()
        .to_string()
}
