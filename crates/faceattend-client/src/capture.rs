//! Photo capture sources.
//!
//! Camera hardware lives outside this crate; a [`CaptureSource`] hands the
//! session a JPEG ready for the extractor.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ExtendedColorType, ImageEncoder};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Longest edge sent to the extractor. Larger photos are downscaled.
pub const MAX_EDGE_PX: u32 = 1280;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("failed to read photo {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("capture interrupted: {0}")]
    Interrupted(String),
}

/// A captured photo, JPEG encoded as base64. Cheap to clone.
#[derive(Debug, Clone)]
pub struct CapturedImage {
    jpeg_base64: Arc<str>,
    pub width: u32,
    pub height: u32,
}

impl CapturedImage {
    pub fn from_base64_jpeg(jpeg_base64: impl Into<Arc<str>>, width: u32, height: u32) -> Self {
        Self {
            jpeg_base64: jpeg_base64.into(),
            width,
            height,
        }
    }

    /// Downscale to [`MAX_EDGE_PX`] if needed and encode as JPEG.
    pub fn encode(image: DynamicImage, jpeg_quality: u8) -> Result<Self, CaptureError> {
        let image = if image.width().max(image.height()) > MAX_EDGE_PX {
            image.resize(MAX_EDGE_PX, MAX_EDGE_PX, FilterType::Triangle)
        } else {
            image
        };
        let rgb = image.to_rgb8();

        let mut jpeg = Vec::new();
        JpegEncoder::new_with_quality(&mut jpeg, jpeg_quality.clamp(1, 100)).write_image(
            rgb.as_raw(),
            rgb.width(),
            rgb.height(),
            ExtendedColorType::Rgb8,
        )?;

        Ok(Self::from_base64_jpeg(
            STANDARD.encode(&jpeg),
            rgb.width(),
            rgb.height(),
        ))
    }

    pub fn base64(&self) -> &str {
        &self.jpeg_base64
    }
}

/// Source of one photo per attendance attempt.
#[async_trait]
pub trait CaptureSource: Send + Sync {
    async fn capture(&self) -> Result<CapturedImage, CaptureError>;
}

/// Reads the photo from a file, as a stand-in for a live camera.
pub struct FileCapture {
    path: PathBuf,
    jpeg_quality: u8,
}

impl FileCapture {
    pub fn new(path: impl Into<PathBuf>, jpeg_quality: u8) -> Self {
        Self {
            path: path.into(),
            jpeg_quality,
        }
    }
}

#[async_trait]
impl CaptureSource for FileCapture {
    async fn capture(&self) -> Result<CapturedImage, CaptureError> {
        let path = self.path.clone();
        let quality = self.jpeg_quality;

        let captured = tokio::task::spawn_blocking(move || {
            let bytes = std::fs::read(&path).map_err(|source| CaptureError::Read {
                path: path.display().to_string(),
                source,
            })?;
            let image = image::load_from_memory(&bytes)?;
            CapturedImage::encode(image, quality)
        })
        .await
        .map_err(|e| CaptureError::Interrupted(e.to_string()))??;

        tracing::debug!(
            path = %self.path.display(),
            width = captured.width,
            height = captured.height,
            bytes = captured.base64().len(),
            "photo captured"
        );
        Ok(captured)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn jpeg_bytes(captured: &CapturedImage) -> Vec<u8> {
        STANDARD.decode(captured.base64()).unwrap()
    }

    #[test]
    fn test_encode_produces_jpeg() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(16, 8, Rgb([200, 100, 50])));
        let captured = CapturedImage::encode(img, 50).unwrap();
        assert_eq!((captured.width, captured.height), (16, 8));
        let bytes = jpeg_bytes(&captured);
        assert_eq!(&bytes[..2], &[0xFF, 0xD8], "missing JPEG SOI marker");
    }

    #[test]
    fn test_encode_downscales_large_photos() {
        let img = DynamicImage::ImageRgb8(RgbImage::new(2560, 1440));
        let captured = CapturedImage::encode(img, 50).unwrap();
        assert_eq!(captured.width, MAX_EDGE_PX);
        assert_eq!(captured.height, 720);
    }

    #[test]
    fn test_encode_drops_alpha() {
        let img = DynamicImage::ImageRgba8(image::RgbaImage::new(4, 4));
        assert!(CapturedImage::encode(img, 90).is_ok());
    }

    #[tokio::test]
    async fn test_file_capture_reads_png() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("face.png");
        RgbImage::from_pixel(32, 24, Rgb([10, 20, 30])).save(&path).unwrap();

        let captured = FileCapture::new(&path, 50).capture().await.unwrap();
        assert_eq!((captured.width, captured.height), (32, 24));
        assert_eq!(&jpeg_bytes(&captured)[..2], &[0xFF, 0xD8]);
    }

    #[tokio::test]
    async fn test_file_capture_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = FileCapture::new(dir.path().join("absent.jpg"), 50)
            .capture()
            .await
            .unwrap_err();
        assert!(matches!(err, CaptureError::Read { .. }));
    }

    #[tokio::test]
    async fn test_file_capture_rejects_non_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.jpg");
        std::fs::write(&path, b"definitely not a jpeg").unwrap();
        let err = FileCapture::new(&path, 50).capture().await.unwrap_err();
        assert!(matches!(err, CaptureError::Image(_)));
    }
}
