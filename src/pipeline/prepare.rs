//! Page input preparation: page image → model-ready [`PageInput`].
//!
//! Every page gets a *global view*: the whole page letterboxed onto a square
//! gray canvas of `base_size`. When cropping is on, the page is also cut into
//! a grid of `tile_size` squares whose rows × columns best match the page's
//! aspect ratio. All views are PNG-encoded and base64-wrapped in
//! [`ImageData`] with `detail: "high"` so chat APIs keep fine print.
//!
//! Building an input is pure and CPU-bound. [`build_inputs`] fans pages out
//! over the blocking pool with at most `num_workers` in flight and returns
//! the results sorted by page index, whatever order the workers finish in.

use crate::error::PageError;
use crate::progress::ProgressCallback;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use futures::stream::{self, StreamExt};
use image::imageops::{self, FilterType};
use image::{DynamicImage, GenericImageView, Rgb, RgbImage};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Cursor;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

/// Whether pages are additionally cut into local tiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CropMode {
    /// Global view only.
    None,
    /// Always tile.
    Tiled,
    /// Tile when the page is larger than one tile. (default)
    #[default]
    Auto,
}

impl FromStr for CropMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "false" | "off" => Ok(CropMode::None),
            "tiled" | "true" | "crop" => Ok(CropMode::Tiled),
            "auto" => Ok(CropMode::Auto),
            other => Err(format!(
                "unknown crop mode '{other}' (expected none, tiled or auto)"
            )),
        }
    }
}

impl fmt::Display for CropMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CropMode::None => "none",
            CropMode::Tiled => "tiled",
            CropMode::Auto => "auto",
        })
    }
}

/// Everything the engine needs for one page.
#[derive(Debug, Clone)]
pub struct PageInput {
    /// 0-indexed physical page.
    pub page_index: usize,
    pub prompt: String,
    pub crop_mode: CropMode,
    pub global_view: ImageData,
    /// Local tiles in row-major order; empty without cropping.
    pub tiles: Vec<ImageData>,
    /// `(columns, rows)` of the tile grid.
    pub grid: Option<(u32, u32)>,
}

/// Converts one page image into a [`PageInput`].
///
/// Implementations must be stateless: the pipeline calls `build` from
/// several worker threads at once.
pub trait PageInputBuilder: Send + Sync {
    fn build(
        &self,
        page_index: usize,
        image: &DynamicImage,
        prompt: &str,
        crop_mode: CropMode,
    ) -> Result<PageInput, PageError>;
}

/// Global view plus aspect-matched tile grid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TilingInputBuilder {
    pub base_size: u32,
    pub tile_size: u32,
    pub min_tiles: u32,
    pub max_tiles: u32,
}

impl Default for TilingInputBuilder {
    fn default() -> Self {
        Self {
            base_size: 1024,
            tile_size: 640,
            min_tiles: 2,
            max_tiles: 6,
        }
    }
}

impl TilingInputBuilder {
    fn wants_tiles(&self, mode: CropMode, w: u32, h: u32) -> bool {
        match mode {
            CropMode::None => false,
            CropMode::Tiled => true,
            CropMode::Auto => w.max(h) > self.tile_size,
        }
    }

    /// Pick the `(columns, rows)` grid whose ratio is closest to the page's.
    /// Ties go to the larger grid when the page has pixels to fill it.
    pub fn closest_grid(&self, w: u32, h: u32) -> Option<(u32, u32)> {
        let mut candidates: Vec<(u32, u32)> = (1..=self.max_tiles)
            .flat_map(|c| (1..=self.max_tiles).map(move |r| (c, r)))
            .filter(|&(c, r)| c * r >= self.min_tiles && c * r <= self.max_tiles)
            .collect();
        candidates.sort_by_key(|&(c, r)| c * r);

        let aspect = w as f64 / h as f64;
        let area = w as f64 * h as f64;
        let tile_area = (self.tile_size as f64).powi(2);
        let mut best: Option<((u32, u32), f64)> = None;
        for (c, r) in candidates {
            let diff = (aspect - c as f64 / r as f64).abs();
            match best {
                None => best = Some(((c, r), diff)),
                Some((_, d)) if diff < d => best = Some(((c, r), diff)),
                Some((_, d)) if diff == d && area > 0.5 * tile_area * (c * r) as f64 => {
                    best = Some(((c, r), diff))
                }
                _ => {}
            }
        }
        best.map(|(g, _)| g)
    }
}

impl PageInputBuilder for TilingInputBuilder {
    fn build(
        &self,
        page_index: usize,
        image: &DynamicImage,
        prompt: &str,
        crop_mode: CropMode,
    ) -> Result<PageInput, PageError> {
        let fail = |detail: String| PageError::InputBuildFailed {
            page: page_index,
            detail,
        };
        let (w, h) = image.dimensions();
        if w == 0 || h == 0 {
            return Err(fail(format!("zero-sized page image ({w}x{h})")));
        }

        let global = letterbox(image, self.base_size);
        let global_view = encode_png(&global).map_err(|e| fail(format!("encode global view: {e}")))?;

        let (tiles, grid) = if self.wants_tiles(crop_mode, w, h) {
            let (cols, rows) = self.closest_grid(w, h).ok_or_else(|| {
                fail(format!(
                    "no tile grid between {} and {} tiles",
                    self.min_tiles, self.max_tiles
                ))
            })?;
            let t = self.tile_size;
            let resized = image.resize_exact(cols * t, rows * t, FilterType::CatmullRom);
            let mut tiles = Vec::with_capacity((cols * rows) as usize);
            for r in 0..rows {
                for c in 0..cols {
                    let tile = resized.crop_imm(c * t, r * t, t, t);
                    tiles.push(encode_png(&tile).map_err(|e| fail(format!("encode tile: {e}")))?);
                }
            }
            (tiles, Some((cols, rows)))
        } else {
            (Vec::new(), None)
        };

        debug!(
            "Page {}: {}x{} → global + {} tiles",
            page_index,
            w,
            h,
            tiles.len()
        );
        Ok(PageInput {
            page_index,
            prompt: prompt.to_string(),
            crop_mode,
            global_view,
            tiles,
            grid,
        })
    }
}

/// Fit `image` inside a `size`×`size` gray canvas, centred.
fn letterbox(image: &DynamicImage, size: u32) -> DynamicImage {
    let mut canvas = RgbImage::from_pixel(size, size, Rgb([127, 127, 127]));
    let (w, h) = image.dimensions();
    let scale = (size as f64 / w as f64).min(size as f64 / h as f64);
    let nw = ((w as f64 * scale).round() as u32).clamp(1, size);
    let nh = ((h as f64 * scale).round() as u32).clamp(1, size);
    let resized = imageops::resize(&image.to_rgb8(), nw, nh, FilterType::CatmullRom);
    let x = ((size - nw) / 2) as i64;
    let y = ((size - nh) / 2) as i64;
    imageops::overlay(&mut canvas, &resized, x, y);
    DynamicImage::ImageRgb8(canvas)
}

/// PNG-encode an image as base64 [`ImageData`].
pub fn encode_png(img: &DynamicImage) -> Result<ImageData, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;
    Ok(ImageData::new(STANDARD.encode(&buf), "image/png").with_detail("high"))
}

/// Build every page input with at most `num_workers` in flight.
///
/// Returns one result per image, sorted by page index.
pub async fn build_inputs(
    builder: Arc<dyn PageInputBuilder>,
    images: Vec<DynamicImage>,
    prompt: &str,
    crop_mode: CropMode,
    num_workers: usize,
    progress: Option<Arc<dyn ProgressCallback>>,
) -> Vec<(usize, Result<PageInput, PageError>)> {
    let total = images.len();
    let mut results: Vec<(usize, Result<PageInput, PageError>)> =
        stream::iter(images.into_iter().enumerate().map(|(idx, img)| {
            let builder = Arc::clone(&builder);
            let prompt = prompt.to_string();
            let progress = progress.clone();
            async move {
                let res = tokio::task::spawn_blocking(move || {
                    builder.build(idx, &img, &prompt, crop_mode)
                })
                .await
                .unwrap_or_else(|e| {
                    Err(PageError::InputBuildFailed {
                        page: idx,
                        detail: format!("worker panicked: {e}"),
                    })
                });
                if let Some(cb) = &progress {
                    match &res {
                        Ok(_) => cb.on_page_prepared(idx, total),
                        Err(e) => cb.on_page_error(idx, total, &e.to_string()),
                    }
                }
                (idx, res)
            }
        }))
        .buffer_unordered(num_workers.max(1))
        .collect()
        .await;

    results.sort_by_key(|(idx, _)| *idx);
    results
}
