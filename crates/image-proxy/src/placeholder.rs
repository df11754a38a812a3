//! The placeholder image substituted for every intercepted image.

use bytes::Bytes;

use crate::error::ConfigError;

/// Content type announced for synthetic placeholder responses.
pub const PLACEHOLDER_CONTENT_TYPE: &str = "image/png";

/// Immutable image payload shared by all exchanges.
///
/// Cloning only bumps a reference count; the bytes are never copied or
/// mutated after load.
#[derive(Clone)]
pub struct PlaceholderAsset {
    bytes: Bytes,
    format: &'static str,
}

impl PlaceholderAsset {
    /// Validates and wraps the placeholder bytes.
    ///
    /// Fails when the payload is empty or its magic bytes do not identify an
    /// image format.
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Result<Self, ConfigError> {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Err(ConfigError::InvalidPlaceholder("image is empty".into()));
        }

        let format = detect_image_format(&bytes).ok_or_else(|| {
            ConfigError::InvalidPlaceholder("unrecognized image format".into())
        })?;

        if format != PLACEHOLDER_CONTENT_TYPE {
            tracing::warn!(
                "Placeholder is {} but is served as {}",
                format,
                PLACEHOLDER_CONTENT_TYPE
            );
        }

        Ok(Self { bytes, format })
    }

    /// Returns a shared handle to the image bytes.
    pub fn bytes(&self) -> Bytes {
        self.bytes.clone()
    }

    /// Returns the image length in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Always false for a loaded asset.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Returns the format detected from the magic bytes.
    pub fn format(&self) -> &'static str {
        self.format
    }
}

impl std::fmt::Debug for PlaceholderAsset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaceholderAsset")
            .field("len", &self.bytes.len())
            .field("format", &self.format)
            .finish()
    }
}

/// Detects image format from magic bytes.
pub fn detect_image_format(data: &[u8]) -> Option<&'static str> {
    if data.len() < 4 {
        return None;
    }

    // PNG: 89 50 4E 47 0D 0A 1A 0A
    if data.starts_with(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]) {
        return Some("image/png");
    }

    // JPEG: FF D8 FF
    if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return Some("image/jpeg");
    }

    if data.starts_with(b"GIF87a") || data.starts_with(b"GIF89a") {
        return Some("image/gif");
    }

    // WebP: RIFF....WEBP
    if data.len() >= 12 && data.starts_with(b"RIFF") && &data[8..12] == b"WEBP" {
        return Some("image/webp");
    }

    if data.starts_with(b"BM") {
        return Some("image/bmp");
    }

    None
}
