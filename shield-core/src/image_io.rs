//! Decode/encode, EXIF transpose, ICC capture, and alpha split/rejoin
//! (spec §4.6 orchestrator preamble, §6 wire format, invariant I3).

use image::{DynamicImage, GenericImageView, GrayImage, ImageFormat, RgbImage, RgbaImage};
use sha2::{Digest, Sha256};

use crate::error::{Result, ShieldError};

/// Everything the orchestrator needs to carry a decoded image through the
/// pipeline and faithfully restore it at the end.
pub struct DecodedImage {
    pub rgb: RgbImage,
    pub alpha: Option<GrayImage>,
    pub icc_profile: Option<Vec<u8>>,
}

/// Decode arbitrary PIL-decodable (per spec §6, here: whatever the `image` crate
/// supports) bytes, apply EXIF orientation, capture the ICC profile, and split
/// alpha out of RGBA inputs.
pub fn decode(bytes: &[u8]) -> Result<DecodedImage> {
    let format = image::guess_format(bytes).ok();
    let icc_profile = format.and_then(|f| extract_icc_profile(bytes, f));

    let img = image::load_from_memory(bytes)
        .map_err(|e| ShieldError::DecodeFailed(e.to_string()))?;
    let img = apply_exif_orientation(bytes, img);

    let (rgb, alpha) = match &img {
        DynamicImage::ImageRgba8(_) | DynamicImage::ImageLumaA8(_) | DynamicImage::ImageRgba16(_) => {
            let rgba = img.to_rgba8();
            let (w, h) = rgba.dimensions();
            let mut rgb = RgbImage::new(w, h);
            let mut alpha = GrayImage::new(w, h);
            for (x, y, px) in rgba.enumerate_pixels() {
                rgb.put_pixel(x, y, image::Rgb([px[0], px[1], px[2]]));
                alpha.put_pixel(x, y, image::Luma([px[3]]));
            }
            (rgb, Some(alpha))
        }
        _ => (img.to_rgb8(), None),
    };

    Ok(DecodedImage {
        rgb,
        alpha,
        icc_profile,
    })
}

fn apply_exif_orientation(bytes: &[u8], img: DynamicImage) -> DynamicImage {
    let orientation = exif::Reader::new()
        .read_from_container(&mut std::io::Cursor::new(bytes))
        .ok()
        .and_then(|exif| {
            exif.get_field(exif::Tag::Orientation, exif::In::PRIMARY)
                .and_then(|f| f.value.get_uint(0))
        })
        .unwrap_or(1);

    match orientation {
        2 => img.fliph(),
        3 => img.rotate180(),
        4 => img.flipv(),
        5 => img.rotate90().fliph(),
        6 => img.rotate90(),
        7 => img.rotate270().fliph(),
        8 => img.rotate270(),
        _ => img,
    }
}

fn extract_icc_profile(bytes: &[u8], format: ImageFormat) -> Option<Vec<u8>> {
    use image::ImageDecoder;
    let cursor = std::io::Cursor::new(bytes);
    match format {
        ImageFormat::Png => {
            let mut decoder = image::codecs::png::PngDecoder::new(cursor).ok()?;
            decoder.icc_profile().ok().flatten()
        }
        ImageFormat::Jpeg => {
            let mut decoder = image::codecs::jpeg::JpegDecoder::new(cursor).ok()?;
            decoder.icc_profile().ok().flatten()
        }
        _ => None,
    }
}

/// Downscale so the longer edge never exceeds `max_res` (spec §3 `max_res`,
/// §8 boundary behavior). A no-op when the image already fits.
pub fn cap_resolution(img: &RgbImage, max_res: u32) -> RgbImage {
    let (w, h) = img.dimensions();
    let longest = w.max(h);
    if longest <= max_res {
        return img.clone();
    }
    let ratio = max_res as f32 / longest as f32;
    let new_w = ((w as f32) * ratio).round().max(1.0) as u32;
    let new_h = ((h as f32) * ratio).round().max(1.0) as u32;
    image::imageops::resize(img, new_w, new_h, image::imageops::FilterType::Lanczos3)
}

/// Resize the alpha plane to match a possibly-resized RGB plane (spec §4.6
/// "alpha rejoin (resize alpha if size changed)").
pub fn resize_alpha(alpha: &GrayImage, w: u32, h: u32) -> GrayImage {
    if alpha.dimensions() == (w, h) {
        alpha.clone()
    } else {
        image::imageops::resize(alpha, w, h, image::imageops::FilterType::Lanczos3)
    }
}

pub fn rejoin_alpha(rgb: &RgbImage, alpha: &GrayImage) -> RgbaImage {
    let (w, h) = rgb.dimensions();
    let mut out = RgbaImage::new(w, h);
    for (x, y, px) in rgb.enumerate_pixels() {
        let a = alpha.get_pixel(x, y)[0];
        out.put_pixel(x, y, image::Rgba([px[0], px[1], px[2], a]));
    }
    out
}

/// Encode as 8-bit PNG, writing back an ICC profile when one was captured
/// (spec §6 "original ICC profile preserved when present").
pub fn encode_png_rgb(img: &RgbImage, icc_profile: Option<&[u8]>) -> Result<Vec<u8>> {
    encode_png(img.width(), img.height(), img.as_raw(), png::ColorType::Rgb, icc_profile)
}

pub fn encode_png_rgba(img: &RgbaImage, icc_profile: Option<&[u8]>) -> Result<Vec<u8>> {
    encode_png(img.width(), img.height(), img.as_raw(), png::ColorType::Rgba, icc_profile)
}

fn encode_png(
    width: u32,
    height: u32,
    data: &[u8],
    color: png::ColorType,
    icc_profile: Option<&[u8]>,
) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    {
        let mut encoder = png::Encoder::new(&mut buf, width, height);
        encoder.set_color(color);
        encoder.set_depth(png::BitDepth::Eight);
        if let Some(icc) = icc_profile {
            encoder.set_icc_profile(icc.to_vec());
        }
        let mut writer = encoder
            .write_header()
            .map_err(|e| ShieldError::DecodeFailed(format!("png header: {e}")))?;
        writer
            .write_image_data(data)
            .map_err(|e| ShieldError::DecodeFailed(format!("png data: {e}")))?;
    }
    Ok(buf)
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Recover the hash used in the storage key layout (spec §4.6 "`hash` is a
/// 64-hex substring recognized in the source URL path or, as fallback,
/// SHA-256 of the downloaded bytes").
pub fn resolve_hash(source_url: &str, raw_bytes: &[u8]) -> String {
    let path = source_url.split('?').next().unwrap_or(source_url);
    let hex_candidate = path.split('/').find(|segment| {
        segment.len() == 64 && segment.chars().all(|c| c.is_ascii_hexdigit())
    });
    hex_candidate
        .map(str::to_string)
        .unwrap_or_else(|| sha256_hex(raw_bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_test_png(w: u32, h: u32) -> Vec<u8> {
        let img = RgbImage::from_fn(w, h, |x, y| image::Rgb([(x % 256) as u8, (y % 256) as u8, 128]));
        encode_png_rgb(&img, None).unwrap()
    }

    #[test]
    fn decode_round_trips_a_plain_rgb_png() {
        let bytes = encode_test_png(8, 8);
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded.rgb.dimensions(), (8, 8));
        assert!(decoded.alpha.is_none());
    }

    #[test]
    fn decode_splits_alpha_out_of_rgba_input() {
        let rgba = RgbaImage::from_fn(4, 4, |x, y| image::Rgba([x as u8, y as u8, 0, 200]));
        let bytes = encode_png_rgba(&rgba, None).unwrap();
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded.rgb.dimensions(), (4, 4));
        let alpha = decoded.alpha.expect("rgba input must split out an alpha plane");
        assert_eq!(alpha.get_pixel(2, 1)[0], 200);
    }

    #[test]
    fn decode_rejects_garbage_bytes() {
        let err = decode(b"not an image").unwrap_err();
        assert!(matches!(err, ShieldError::DecodeFailed(_)));
    }

    #[test]
    fn cap_resolution_is_a_noop_under_the_limit() {
        let img = RgbImage::new(100, 50);
        let capped = cap_resolution(&img, 3840);
        assert_eq!(capped.dimensions(), (100, 50));
    }

    #[test]
    fn cap_resolution_downscales_the_longer_edge() {
        let img = RgbImage::new(4000, 2000);
        let capped = cap_resolution(&img, 2000);
        assert_eq!(capped.width(), 2000);
        assert_eq!(capped.height(), 1000);
    }

    #[test]
    fn rejoin_alpha_preserves_rgb_and_restores_alpha() {
        let rgb = RgbImage::from_fn(2, 2, |_, _| image::Rgb([10, 20, 30]));
        let alpha = GrayImage::from_fn(2, 2, |_, _| image::Luma([77]));
        let rgba = rejoin_alpha(&rgb, &alpha);
        let px = rgba.get_pixel(0, 0);
        assert_eq!([px[0], px[1], px[2], px[3]], [10, 20, 30, 77]);
    }

    #[test]
    fn resolve_hash_prefers_a_64_hex_url_segment() {
        let hash = "a".repeat(64);
        let url = format!("https://cdn.example.com/uploads/{hash}/original.png?sig=x");
        assert_eq!(resolve_hash(&url, b"irrelevant"), hash);
    }

    #[test]
    fn resolve_hash_falls_back_to_sha256_of_bytes() {
        let url = "https://cdn.example.com/uploads/no-hash-here.png";
        let bytes = b"some image bytes";
        assert_eq!(resolve_hash(url, bytes), sha256_hex(bytes));
    }

    #[test]
    fn sha256_hex_is_deterministic_and_input_sensitive() {
        assert_eq!(sha256_hex(b"hello"), sha256_hex(b"hello"));
        assert_ne!(sha256_hex(b"hello"), sha256_hex(b"world"));
    }
}
