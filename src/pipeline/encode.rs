//! Image encoding: rendered bitmap → file bytes, file bytes → base64 data URI.
//!
//! Vision chat APIs accept images as base64 data URIs embedded in the JSON
//! request body. JPEG keeps uploads small for dense statement pages; PNG is
//! available when fine print suffers from compression artefacts.

use crate::config::PageImageFormat;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::codecs::jpeg::JpegEncoder;
use image::DynamicImage;
use std::io::Cursor;
use tracing::debug;

/// A page image ready to embed in an inference request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedImage {
    pub base64: String,
    pub mime_type: String,
}

impl EncodedImage {
    /// `data:<mime>;base64,<payload>`
    pub fn data_uri(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.base64)
    }
}

/// Base64-wrap staged image bytes.
pub fn encode_image(bytes: &[u8], mime_type: &str) -> EncodedImage {
    let b64 = STANDARD.encode(bytes);
    debug!("Encoded image → {} bytes base64", b64.len());
    EncodedImage {
        base64: b64,
        mime_type: mime_type.to_string(),
    }
}

/// Serialise a rendered page in the staging image format.
///
/// JPEG has no alpha channel, so the bitmap is flattened to RGB first.
pub fn encode_page(
    img: &DynamicImage,
    format: PageImageFormat,
    jpeg_quality: u8,
) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    match format {
        PageImageFormat::Jpeg => {
            let rgb = DynamicImage::ImageRgb8(img.to_rgb8());
            rgb.write_with_encoder(JpegEncoder::new_with_quality(&mut buf, jpeg_quality))?;
        }
        PageImageFormat::Png => {
            img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;
        }
    }
    Ok(buf)
}
