//! Image decoding, size normalization, face cropping and annotation.

use crate::types::BoundingBox;
use ab_glyph::FontArc;
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use std::path::{Path, PathBuf};
use thiserror::Error;

const ANNOTATION_THICKNESS: u32 = 2;
/// Label glyph height in pixels.
const LABEL_SCALE: f32 = 18.0;
const LABEL_GAP: i32 = 2;
const KNOWN_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const UNKNOWN_COLOR: Rgb<u8> = Rgb([255, 0, 0]);

#[derive(Error, Debug)]
pub enum ImagingError {
    #[error("image decode failed: {0}")]
    Decode(#[from] image::ImageError),
    #[error("face box {x},{y} {width}x{height} lies outside the {image_width}x{image_height} image")]
    EmptyCrop {
        x: i32,
        y: i32,
        width: u32,
        height: u32,
        image_width: u32,
        image_height: u32,
    },
    #[error("cannot load label font {path}: {reason}")]
    Font { path: PathBuf, reason: String },
}

/// One face to draw on an annotated photo.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceMark {
    pub face: BoundingBox,
    pub known: bool,
    /// Text drawn next to the box (identity or the unknown label).
    pub label: String,
}

/// Decode an encoded image (JPEG, PNG, ...) into an RGB bitmap.
pub fn decode(bytes: &[u8]) -> Result<RgbImage, ImagingError> {
    let image = image::load_from_memory(bytes)?;
    Ok(image.to_rgb8())
}

/// Scale `image` down so neither side exceeds `max_dimension`, preserving
/// aspect ratio. Images already within bounds are returned unchanged.
pub fn fit_within(image: RgbImage, max_dimension: u32) -> RgbImage {
    let (width, height) = image.dimensions();
    if width <= max_dimension && height <= max_dimension {
        return image;
    }

    let (new_w, new_h) = scaled_dimensions(width, height, max_dimension);
    tracing::debug!(width, height, new_w, new_h, "downscaling input image");
    imageops::resize(&image, new_w, new_h, FilterType::Triangle)
}

fn scaled_dimensions(width: u32, height: u32, max_dimension: u32) -> (u32, u32) {
    let scale = (max_dimension as f32 / width as f32).min(max_dimension as f32 / height as f32);
    let new_w = ((width as f32 * scale).round() as u32).clamp(1, max_dimension);
    let new_h = ((height as f32 * scale).round() as u32).clamp(1, max_dimension);
    (new_w, new_h)
}

/// Crop the face region, clamped to the image bounds.
pub fn crop(image: &RgbImage, face: &BoundingBox) -> Result<RgbImage, ImagingError> {
    let (image_width, image_height) = image.dimensions();
    let (x, y, w, h) = face
        .clamp_to(image_width, image_height)
        .ok_or(ImagingError::EmptyCrop {
            x: face.x,
            y: face.y,
            width: face.width,
            height: face.height,
            image_width,
            image_height,
        })?;
    Ok(imageops::crop_imm(image, x, y, w, h).to_image())
}

/// Load a TrueType/OpenType font for face labels.
pub fn load_label_font(path: &Path) -> Result<FontArc, ImagingError> {
    let font_error = |reason: String| ImagingError::Font { path: path.to_path_buf(), reason };
    let bytes = std::fs::read(path).map_err(|e| font_error(e.to_string()))?;
    FontArc::try_from_vec(bytes).map_err(|e| font_error(e.to_string()))
}

/// Draw a rectangle outline around every face, green when recognized and
/// red when unknown. With a font, each label is written above its box.
pub fn annotate(image: &mut RgbImage, marks: &[FaceMark], font: Option<&FontArc>) {
    for mark in marks {
        let color = if mark.known { KNOWN_COLOR } else { UNKNOWN_COLOR };
        let Some((x, y, w, h)) = mark.face.clamp_to(image.width(), image.height()) else {
            continue;
        };
        draw_outline(image, (x, y, w, h), color);

        if let Some(font) = font {
            let (lx, ly) = label_origin(x, y, h);
            draw_text_mut(image, color, lx, ly, LABEL_SCALE, font, &mark.label);
        }
    }
}

fn draw_outline(image: &mut RgbImage, (x, y, w, h): (u32, u32, u32, u32), color: Rgb<u8>) {
    // Concentric 1px rectangles, inset until the box is used up.
    for inset in 0..ANNOTATION_THICKNESS {
        let (iw, ih) = (w.saturating_sub(2 * inset), h.saturating_sub(2 * inset));
        if iw == 0 || ih == 0 {
            break;
        }
        let rect = Rect::at((x + inset) as i32, (y + inset) as i32).of_size(iw, ih);
        draw_hollow_rect_mut(image, rect, color);
    }
}

/// Top-left corner for a label: above the box when there is room, else
/// just below it.
fn label_origin(x: u32, y: u32, height: u32) -> (i32, i32) {
    let above = y as i32 - LABEL_SCALE as i32 - LABEL_GAP;
    if above >= 0 {
        (x as i32, above)
    } else {
        (x as i32, (y + height) as i32 + LABEL_GAP)
    }
}
