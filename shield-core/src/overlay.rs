//! Visible tiled-text watermark (spec §4.6 "Visible overlay"), applied by the
//! orchestrator when `apply_visual_watermark` is set.
//!
//! Grounded on `imageproc::drawing` + `ab_glyph` for glyph rasterization and
//! `imageproc::geometric_transformations::rotate_about_center` for the 45°
//! tile rotation — the idiomatic-Rust equivalent of the original's
//! `PIL.ImageDraw.text` / `Image.rotate(..., expand=True)`.

use ab_glyph::{FontRef, PxScale};
use image::{Rgba, RgbaImage};
use imageproc::drawing::{draw_text_mut, text_size};
use imageproc::geometric_transformations::{rotate_about_center, Interpolation};

use crate::error::{Result, ShieldError};

/// Candidate font paths, matching the original's DejaVu Sans Bold lookup with
/// a couple of common distro layouts as fallback.
const FONT_PATHS: &[&str] = &[
    "/usr/share/fonts/truetype/dejavu/DejaVuSans-Bold.ttf",
    "/usr/share/fonts/dejavu/DejaVuSans-Bold.ttf",
    "/usr/share/fonts/TTF/DejaVuSans-Bold.ttf",
];

const ANGLE_DEGREES: f32 = 45.0;
const TILE_PAD: u32 = 50;
const SHADOW_OFFSET: i32 = 2;

fn load_font() -> Result<Vec<u8>> {
    for path in FONT_PATHS {
        if let Ok(bytes) = std::fs::read(path) {
            return Ok(bytes);
        }
    }
    Err(ShieldError::WatermarkFailed(
        "no DejaVu Sans Bold font found for visual watermark overlay".to_string(),
    ))
}

/// Render `text` as a rotated, tiled, semi-transparent brick pattern over
/// `img` (spec §4.6: "~5% of width, min 20 px ... dark shadow offset ... 45°
/// ... staggered brick pattern ... gaps = 1.5x tile extent").
pub fn apply(img: &RgbaImage, text: &str) -> Result<RgbaImage> {
    let font_bytes = load_font()?;
    let font = FontRef::try_from_slice(&font_bytes)
        .map_err(|e| ShieldError::WatermarkFailed(format!("invalid font data: {e}")))?;

    let (width, height) = img.dimensions();
    let font_px = ((width as f32) * 0.05).max(20.0);
    let scale = PxScale::from(font_px);

    let (text_w, text_h) = text_size(scale, &font, text);
    let tile_w = text_w as u32 + TILE_PAD * 2;
    let tile_h = text_h as u32 + TILE_PAD * 2;

    let mut tile = RgbaImage::new(tile_w, tile_h);
    draw_text_mut(
        &mut tile,
        Rgba([0, 0, 0, 160]),
        TILE_PAD as i32 + SHADOW_OFFSET,
        TILE_PAD as i32 + SHADOW_OFFSET,
        scale,
        &font,
        text,
    );
    draw_text_mut(
        &mut tile,
        Rgba([255, 255, 255, 200]),
        TILE_PAD as i32,
        TILE_PAD as i32,
        scale,
        &font,
        text,
    );

    let rotated = rotate_about_center(
        &tile,
        ANGLE_DEGREES.to_radians(),
        Interpolation::Bilinear,
        Rgba([0, 0, 0, 0]),
    );
    let (rot_w, rot_h) = rotated.dimensions();

    let mut out = img.clone();
    let gap_x = ((rot_w as f32) * 1.5) as i32;
    let gap_y = ((rot_h as f32) * 1.5) as i32;
    let gap_x = gap_x.max(1);
    let gap_y = gap_y.max(1);

    let mut y = -(rot_h as i32);
    let mut row = 0i32;
    while y < height as i32 + rot_h as i32 {
        let row_offset = if row % 2 == 1 { gap_x / 2 } else { 0 };
        let mut x = -(rot_w as i32) - row_offset;
        while x < width as i32 + rot_w as i32 {
            paste_alpha_blend(&mut out, &rotated, x, y);
            x += gap_x;
        }
        y += gap_y;
        row += 1;
    }
    Ok(out)
}

/// Alpha-composite `tile` onto `base` at `(x0, y0)`, matching PIL's
/// `Image.paste(tile, pos, tile)` semantics for an RGBA mask.
fn paste_alpha_blend(base: &mut RgbaImage, tile: &RgbaImage, x0: i32, y0: i32) {
    let (bw, bh) = base.dimensions();
    for (tx, ty, tp) in tile.enumerate_pixels() {
        let px = x0 + tx as i32;
        let py = y0 + ty as i32;
        if px < 0 || py < 0 || px >= bw as i32 || py >= bh as i32 {
            continue;
        }
        let a = tp[3] as f32 / 255.0;
        if a <= 0.0 {
            continue;
        }
        let dst = base.get_pixel_mut(px as u32, py as u32);
        for c in 0..3 {
            dst[c] = ((tp[c] as f32) * a + (dst[c] as f32) * (1.0 - a)).round() as u8;
        }
        dst[3] = ((a + (dst[3] as f32 / 255.0) * (1.0 - a)) * 255.0).round() as u8;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiles_cover_canvas_without_panicking() {
        let img = RgbaImage::from_pixel(256, 256, Rgba([10, 20, 30, 255]));
        let result = apply(&img, "SHIELD");
        match result {
            Ok(out) => assert_eq!(out.dimensions(), (256, 256)),
            Err(ShieldError::WatermarkFailed(_)) => {
                // No DejaVu font on this host; acceptable in sandboxed test runners.
            }
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
}
