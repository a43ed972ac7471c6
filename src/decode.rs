//! Frame decoding.
//!
//! The read loop hands every extracted frame to a [`FrameDecoder`]. Marker
//! matching says nothing about the payload, so a failed decode is expected
//! on a noisy link and is reported, never retried.

use image::{GenericImageView, ImageFormat};

use crate::error::LinkError;

/// A decoded RGB8 image.
#[derive(Clone, PartialEq, Eq)]
pub struct DecodedImage {
    pub width: u32,
    pub height: u32,
    pixels: Vec<u8>,
}

impl DecodedImage {
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Self {
        Self {
            width,
            height,
            pixels,
        }
    }

    /// Packed RGB8 pixels, row-major.
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }
}

impl std::fmt::Debug for DecodedImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodedImage")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.pixels.len())
            .finish()
    }
}

/// Decode capability: bytes in, image or failure out.
///
/// Decoders are called from the read loop thread and are treated as fast and
/// non-cancelable.
pub trait FrameDecoder: Send + Sync {
    fn decode(&self, bytes: &[u8]) -> Result<DecodedImage, LinkError>;
}

/// Baseline/progressive JPEG decoder backed by the `image` crate.
#[derive(Clone, Copy, Debug, Default)]
pub struct JpegDecoder;

impl FrameDecoder for JpegDecoder {
    fn decode(&self, bytes: &[u8]) -> Result<DecodedImage, LinkError> {
        let image = image::load_from_memory_with_format(bytes, ImageFormat::Jpeg).map_err(|e| {
            LinkError::Decode {
                len: bytes.len(),
                reason: e.to_string(),
            }
        })?;
        let (width, height) = image.dimensions();
        let rgb = image.into_rgb8();
        Ok(DecodedImage::new(width, height, rgb.into_raw()))
    }
}

impl<F> FrameDecoder for F
where
    F: Fn(&[u8]) -> Result<DecodedImage, LinkError> + Send + Sync,
{
    fn decode(&self, bytes: &[u8]) -> Result<DecodedImage, LinkError> {
        self(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::stub::synthetic_jpeg;
    use anyhow::Result;

    #[test]
    fn decodes_synthetic_jpeg() -> Result<()> {
        let bytes = synthetic_jpeg(32, 24, 7)?;
        let image = JpegDecoder.decode(&bytes)?;
        assert_eq!(image.width, 32);
        assert_eq!(image.height, 24);
        assert_eq!(image.pixels().len(), 32 * 24 * 3);
        Ok(())
    }

    #[test]
    fn marker_only_payload_fails_to_decode() {
        let err = JpegDecoder
            .decode(&[0xFF, 0xD8, 0x00, 0x01, 0xFF, 0xD9])
            .unwrap_err();
        assert!(matches!(err, LinkError::Decode { len: 6, .. }));
    }
}
