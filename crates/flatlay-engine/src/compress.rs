//! Adaptive JPEG re-encoding that squeezes large uploads under a byte budget.

use std::io::Cursor;

use anyhow::{Context, Result};
use flatlay_contracts::upload::UploadItem;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, Rgb, RgbImage};

pub const COMPRESSION_TRIGGER_BYTES: usize = 4 * 1024 * 1024;
pub const DEFAULT_TARGET_BYTES: usize = 4 * 1024 * 1024;
pub const DEFAULT_MAX_DIMENSION: u32 = 2048;

// Quality in tenths: 0.8 down to the 0.1 floor.
const INITIAL_QUALITY_TENTHS: u8 = 8;
const QUALITY_FLOOR_TENTHS: u8 = 1;

pub const COMPRESSED_MIME: &str = "image/jpeg";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionSettings {
    /// Files at or below this size are sent as-is.
    pub trigger_bytes: usize,
    pub target_bytes: usize,
    pub max_dimension: u32,
}

impl Default for CompressionSettings {
    fn default() -> Self {
        Self {
            trigger_bytes: COMPRESSION_TRIGGER_BYTES,
            target_bytes: DEFAULT_TARGET_BYTES,
            max_dimension: DEFAULT_MAX_DIMENSION,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CompressionOutcome {
    Untouched,
    Compressed {
        original_bytes: usize,
        width: u32,
        height: u32,
        quality: f32,
        attempts: u32,
        /// Set when even the floor quality could not meet the budget.
        over_budget: bool,
    },
    Fallback {
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct PreparedItem {
    pub item: UploadItem,
    pub outcome: CompressionOutcome,
}

impl PreparedItem {
    fn untouched(item: UploadItem) -> Self {
        Self {
            item,
            outcome: CompressionOutcome::Untouched,
        }
    }
}

pub fn prepare_upload(item: UploadItem, settings: &CompressionSettings) -> PreparedItem {
    if item.len() <= settings.trigger_bytes {
        return PreparedItem::untouched(item);
    }
    compress(item, settings.target_bytes, settings.max_dimension)
}

/// Re-encodes `item` as JPEG at falling quality until it fits `target_bytes`.
///
/// Oversized images are first scaled so their longer side equals
/// `max_dimension`. The quality floor result is accepted even when it is still
/// over budget; the outcome says so. Anything undecodable comes back as the
/// original item.
pub fn compress(item: UploadItem, target_bytes: usize, max_dimension: u32) -> PreparedItem {
    let original_bytes = item.len();
    let decoded = match image::load_from_memory(&item.bytes) {
        Ok(decoded) => decoded,
        Err(err) => {
            return PreparedItem {
                item,
                outcome: CompressionOutcome::Fallback {
                    reason: format!("decode failed: {err}"),
                },
            };
        }
    };

    let (width, height) = scaled_dimensions(decoded.width(), decoded.height(), max_dimension);
    let flattened = flatten_onto_white(&decoded);
    let canvas = if (width, height) == flattened.dimensions() {
        flattened
    } else {
        image::imageops::resize(&flattened, width, height, FilterType::Triangle)
    };

    let mut quality = INITIAL_QUALITY_TENTHS;
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        let encoded = match encode_jpeg(&canvas, quality) {
            Ok(encoded) => encoded,
            Err(err) => {
                return PreparedItem {
                    item,
                    outcome: CompressionOutcome::Fallback {
                        reason: format!("{err:#}"),
                    },
                };
            }
        };
        let fits = encoded.len() <= target_bytes;
        if fits || quality <= QUALITY_FLOOR_TENTHS {
            return PreparedItem {
                item: UploadItem::new(item.name, encoded, COMPRESSED_MIME),
                outcome: CompressionOutcome::Compressed {
                    original_bytes,
                    width,
                    height,
                    quality: f32::from(quality) / 10.0,
                    attempts,
                    over_budget: !fits,
                },
            };
        }
        quality -= 1;
    }
}

/// Shrinks `(width, height)` so the longer side is at most `max_dimension`.
pub fn scaled_dimensions(width: u32, height: u32, max_dimension: u32) -> (u32, u32) {
    if max_dimension == 0 || (width <= max_dimension && height <= max_dimension) {
        return (width, height);
    }
    let ratio = (f64::from(max_dimension) / f64::from(width))
        .min(f64::from(max_dimension) / f64::from(height));
    let scale = |side: u32| ((f64::from(side) * ratio).round() as u32).max(1);
    (scale(width), scale(height))
}

fn flatten_onto_white(image: &DynamicImage) -> RgbImage {
    let rgba = image.to_rgba8();
    let mut flattened = RgbImage::new(rgba.width(), rgba.height());
    for (x, y, pixel) in rgba.enumerate_pixels() {
        let alpha = u16::from(pixel[3]);
        let blend =
            |channel: u8| -> u8 { (((u16::from(channel) * alpha) + (255 * (255 - alpha))) / 255) as u8 };
        flattened.put_pixel(x, y, Rgb([blend(pixel[0]), blend(pixel[1]), blend(pixel[2])]));
    }
    flattened
}

fn encode_jpeg(image: &RgbImage, quality_tenths: u8) -> Result<Vec<u8>> {
    let mut bytes = Cursor::new(Vec::new());
    let mut encoder = JpegEncoder::new_with_quality(&mut bytes, quality_tenths * 10);
    encoder
        .encode_image(image)
        .with_context(|| format!("jpeg encode failed at quality {quality_tenths}/10"))?;
    Ok(bytes.into_inner())
}
