//! Decode, downsample, and re-encode images.
//!
//! Everything here is synchronous and CPU-bound; callers run it on the
//! blocking thread pool.

use image::codecs::avif::AvifEncoder;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::webp::WebPEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView};
use std::io::Cursor;
use std::path::Path;

use crate::config::{CompressionConfig, OutputFormat};
use crate::error::{PipelineError, PipelineResult};

/// AVIF encoder speed (1 = slowest/best, 10 = fastest).
const AVIF_SPEED: u8 = 6;

/// An encoded image ready to be written.
#[derive(Debug, Clone)]
pub struct EncodedImage {
    /// Encoded bytes in the target format
    pub bytes: Vec<u8>,
    /// Source dimensions
    pub source_width: u32,
    pub source_height: u32,
    /// Output dimensions
    pub width: u32,
    pub height: u32,
    /// Applied scale factor (1.0 = no resize)
    pub scale: f64,
}

/// Scale factor that fits `width x height` inside the configured maxima.
///
/// Never upscales: sources already within bounds get exactly `1.0`.
pub fn compute_scale(width: u32, height: u32, max_width: u32, max_height: u32) -> f64 {
    if width <= max_width && height <= max_height {
        return 1.0;
    }
    let scale_w = max_width as f64 / width as f64;
    let scale_h = max_height as f64 / height as f64;
    scale_w.min(scale_h).min(1.0)
}

/// Output dimensions for a given scale, never collapsing below one pixel.
pub fn scaled_dimensions(width: u32, height: u32, scale: f64) -> (u32, u32) {
    let w = ((width as f64) * scale).round().max(1.0) as u32;
    let h = ((height as f64) * scale).round().max(1.0) as u32;
    (w, h)
}

/// Replace the extension of `name` with the target codec's extension.
pub fn output_file_name(name: &str, format: OutputFormat) -> String {
    Path::new(name)
        .with_extension(format.extension())
        .to_string_lossy()
        .into_owned()
}

/// Decode `bytes`, downsample if needed, and encode with the configured codec.
///
/// `path` is only used for error context.
pub fn transcode_bytes(
    bytes: &[u8],
    path: &Path,
    config: &CompressionConfig,
) -> PipelineResult<EncodedImage> {
    let image = decode(bytes, path)?;
    let (source_width, source_height) = image.dimensions();

    let scale = compute_scale(
        source_width,
        source_height,
        config.max_width,
        config.max_height,
    );
    let image = if scale < 1.0 {
        let (w, h) = scaled_dimensions(source_width, source_height, scale);
        tracing::trace!(
            "Downsampling {:?} {}x{} -> {}x{} (scale {:.3})",
            path,
            source_width,
            source_height,
            w,
            h,
            scale
        );
        image.resize_exact(w, h, FilterType::Lanczos3)
    } else {
        image
    };
    let (width, height) = image.dimensions();

    let bytes = encode(&image, config.format, config.quality, path)?;

    Ok(EncodedImage {
        bytes,
        source_width,
        source_height,
        width,
        height,
        scale,
    })
}

/// Decode with content-based format detection.
fn decode(bytes: &[u8], path: &Path) -> PipelineResult<DynamicImage> {
    let reader = image::ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| PipelineError::Decode {
            path: path.to_path_buf(),
            message: format!("Cannot detect image format: {}", e),
        })?;
    if reader.format().is_none() {
        return Err(PipelineError::Decode {
            path: path.to_path_buf(),
            message: "Unrecognized image format".to_string(),
        });
    }
    reader.decode().map_err(|e| PipelineError::Decode {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

fn encode(
    image: &DynamicImage,
    format: OutputFormat,
    quality: u8,
    path: &Path,
) -> PipelineResult<Vec<u8>> {
    let mut buffer = Cursor::new(Vec::new());

    let result = match format {
        OutputFormat::Webp => {
            normalize_color(image).write_with_encoder(WebPEncoder::new_lossless(&mut buffer))
        }
        OutputFormat::Jpeg => DynamicImage::ImageRgb8(image.to_rgb8())
            .write_with_encoder(JpegEncoder::new_with_quality(&mut buffer, quality)),
        OutputFormat::Avif => normalize_color(image).write_with_encoder(
            AvifEncoder::new_with_speed_quality(&mut buffer, AVIF_SPEED, quality),
        ),
    };

    result.map_err(|e| PipelineError::Encode {
        path: path.to_path_buf(),
        message: format!("{} encode failed: {}", format, e),
    })?;

    Ok(buffer.into_inner())
}

/// Convert to 8-bit RGB/RGBA, the layouts every supported encoder accepts.
fn normalize_color(image: &DynamicImage) -> DynamicImage {
    if image.color().has_alpha() {
        DynamicImage::ImageRgba8(image.to_rgba8())
    } else {
        DynamicImage::ImageRgb8(image.to_rgb8())
    }
}
