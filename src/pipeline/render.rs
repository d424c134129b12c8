//! PDF rasterisation: every page of a document → `DynamicImage` via pdfium.
//!
//! ## Why spawn_blocking?
//!
//! `pdfium-render` wraps the pdfium C++ library, which keeps thread-local
//! state and is CPU-bound. [`rasterize_document`] moves the work onto the
//! blocking pool so Tokio worker threads never stall while pages render.
//!
//! Pages are scaled by `dpi / 72` and additionally capped at
//! `max_rendered_pixels` on the longest edge, so an A0 poster cannot exhaust
//! memory. Output images are opaque RGB.

use crate::error::Pdf2TextError;
use image::DynamicImage;
use pdfium_render::prelude::*;
use std::sync::Arc;
use tracing::{debug, info};

/// Turns document bytes into one image per page, in page order.
pub trait Rasterizer: Send + Sync {
    fn rasterize(&self, pdf: &[u8], dpi: u32) -> Result<Vec<DynamicImage>, Pdf2TextError>;
}

/// pdfium-backed rasterizer.
#[derive(Debug, Clone)]
pub struct PdfiumRasterizer {
    pub max_rendered_pixels: u32,
    pub password: Option<String>,
}

impl Default for PdfiumRasterizer {
    fn default() -> Self {
        Self {
            max_rendered_pixels: 4096,
            password: None,
        }
    }
}

impl PdfiumRasterizer {
    pub fn new(max_rendered_pixels: u32, password: Option<String>) -> Self {
        Self {
            max_rendered_pixels,
            password,
        }
    }

    fn bind() -> Result<Pdfium, Pdf2TextError> {
        let bindings = Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path("./"))
            .or_else(|_| Pdfium::bind_to_system_library())
            .map_err(|e| Pdf2TextError::Internal(format!("pdfium library not available: {e:?}")))?;
        Ok(Pdfium::new(bindings))
    }
}

impl Rasterizer for PdfiumRasterizer {
    fn rasterize(&self, pdf: &[u8], dpi: u32) -> Result<Vec<DynamicImage>, Pdf2TextError> {
        let pdfium = Self::bind()?;
        let password = self.password.as_deref();

        let document = pdfium.load_pdf_from_byte_slice(pdf, password).map_err(|e| {
            let err_str = format!("{:?}", e);
            if err_str.contains("Password") || err_str.contains("password") {
                if password.is_some() {
                    Pdf2TextError::WrongPassword
                } else {
                    Pdf2TextError::PasswordRequired
                }
            } else {
                Pdf2TextError::CorruptPdf { detail: err_str }
            }
        })?;

        let pages = document.pages();
        let total_pages = pages.len() as usize;
        info!("PDF loaded: {} pages", total_pages);
        if total_pages == 0 {
            return Err(Pdf2TextError::EmptyDocument);
        }

        let cap = self.max_rendered_pixels as i32;
        let render_config = PdfRenderConfig::new()
            .scale_page_by_factor(dpi as f32 / 72.0)
            .set_maximum_width(cap)
            .set_maximum_height(cap);

        let mut images = Vec::with_capacity(total_pages);
        for (idx, page) in pages.iter().enumerate() {
            let bitmap = page.render_with_config(&render_config).map_err(|e| {
                Pdf2TextError::RasterisationFailed {
                    page: idx,
                    detail: format!("{:?}", e),
                }
            })?;
            let image = DynamicImage::ImageRgb8(bitmap.as_image().to_rgb8());
            debug!(
                "Rendered page {} → {}x{} px",
                idx,
                image.width(),
                image.height()
            );
            images.push(image);
        }

        Ok(images)
    }
}

/// Run a rasterizer on the blocking pool.
pub async fn rasterize_document(
    rasterizer: Arc<dyn Rasterizer>,
    pdf: Arc<[u8]>,
    dpi: u32,
) -> Result<Vec<DynamicImage>, Pdf2TextError> {
    tokio::task::spawn_blocking(move || rasterizer.rasterize(&pdf, dpi))
        .await
        .map_err(|e| Pdf2TextError::Internal(format!("Render task panicked: {}", e)))?
}
