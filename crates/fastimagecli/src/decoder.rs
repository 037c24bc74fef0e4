use std::fmt;

use fastimage_service::caching::{CacheContents, CacheError, Decoder};

/// The formats [`SniffingDecoder`] recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Png,
    Jpeg,
    Gif,
    WebP,
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpeg",
            ImageFormat::Gif => "gif",
            ImageFormat::WebP => "webp",
        })
    }
}

impl ImageFormat {
    fn sniff(bytes: &[u8]) -> Option<Self> {
        if bytes.starts_with(b"\x89PNG\r\n\x1a\n") {
            Some(ImageFormat::Png)
        } else if bytes.starts_with(b"\xff\xd8\xff") {
            Some(ImageFormat::Jpeg)
        } else if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
            Some(ImageFormat::Gif)
        } else if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
            Some(ImageFormat::WebP)
        } else {
            None
        }
    }
}

/// An image that was recognized, but not decoded into pixels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SniffedImage {
    pub format: ImageFormat,
    pub len: usize,
}

/// Accepts any input with a known image signature.
#[derive(Debug, Clone, Copy, Default)]
pub struct SniffingDecoder;

impl Decoder for SniffingDecoder {
    type Resource = SniffedImage;

    fn decode(&self, bytes: &[u8]) -> CacheContents<SniffedImage> {
        let format = ImageFormat::sniff(bytes)
            .ok_or_else(|| CacheError::DecodeError("unknown image format".into()))?;
        Ok(SniffedImage {
            format,
            len: bytes.len(),
        })
    }
}
