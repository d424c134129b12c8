//! Progress-callback trait for pipeline events.
//!
//! Inject an [`Arc<dyn ProgressCallback>`] via
//! [`crate::config::OcrConfigBuilder::progress_callback`] to receive events
//! as the pipeline moves through rasterization, input preparation and
//! generation. Callers can forward them to a progress bar, a channel or a
//! log without the library knowing how the host application communicates.
//!
//! # Example
//!
//! ```rust
//! use edgequake_pdf2text::{OcrConfig, ProgressCallback};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct Prepared(AtomicUsize);
//!
//! impl ProgressCallback for Prepared {
//!     fn on_page_prepared(&self, page_index: usize, total_pages: usize) {
//!         let done = self.0.fetch_add(1, Ordering::SeqCst) + 1;
//!         eprintln!("prepared page {page_index} ({done}/{total_pages})");
//!     }
//! }
//!
//! let config = OcrConfig::builder()
//!     .progress_callback(Arc::new(Prepared(AtomicUsize::new(0))))
//!     .build()
//!     .unwrap();
//! ```

/// Called by the pipeline as a run progresses.
///
/// Input preparation runs on several workers, so `on_page_prepared` and
/// `on_page_error` may be called concurrently and in any page order.
/// All methods default to no-ops.
pub trait ProgressCallback: Send + Sync {
    /// The document was rasterized into `total_pages` images.
    fn on_document_rasterized(&self, total_pages: usize) {
        let _ = total_pages;
    }

    /// A page input was built. `page_index` is 0-indexed.
    fn on_page_prepared(&self, page_index: usize, total_pages: usize) {
        let _ = (page_index, total_pages);
    }

    /// Building a page input failed.
    fn on_page_error(&self, page_index: usize, total_pages: usize, error: &str) {
        let _ = (page_index, total_pages, error);
    }

    /// The batched engine call is about to start with `batch_len` sequences.
    fn on_generation_start(&self, batch_len: usize) {
        let _ = batch_len;
    }

    /// The run finished; `kept_pages` pages made it into the output.
    fn on_run_complete(&self, total_pages: usize, kept_pages: usize) {
        let _ = (total_pages, kept_pages);
    }
}

/// Default when no callback is configured.
pub struct NoopProgressCallback;

impl ProgressCallback for NoopProgressCallback {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct Tracking {
        prepared: AtomicUsize,
        errors: AtomicUsize,
        batch: AtomicUsize,
        kept: AtomicUsize,
    }

    impl ProgressCallback for Tracking {
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

    #[test]
    fn noop_callback_does_not_panic() {
        let cb: Arc<dyn ProgressCallback> = Arc::new(NoopProgressCallback);
        cb.on_document_rasterized(3);
        cb.on_page_prepared(0, 3);
        cb.on_page_error(1, 3, "zero-sized image");
        cb.on_generation_start(2);
        cb.on_run_complete(3, 2);
    }

    #[test]
    fn tracking_callback_receives_events() {
        let t = Tracking::default();
        t.on_page_prepared(0, 3);
        t.on_page_prepared(2, 3);
        t.on_page_error(1, 3, "bad");
        t.on_generation_start(2);
        t.on_run_complete(3, 1);
        assert_eq!(t.prepared.load(Ordering::SeqCst), 2);
        assert_eq!(t.errors.load(Ordering::SeqCst), 1);
        assert_eq!(t.batch.load(Ordering::SeqCst), 2);
        assert_eq!(t.kept.load(Ordering::SeqCst), 1);
    }
}
