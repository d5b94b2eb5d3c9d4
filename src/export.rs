//! Writing collected bitmaps to disk as PNG or JPEG files.

use std::fs;
use std::path::{Path, PathBuf};

use image::buffer::ConvertBuffer;
use image::{ImageFormat, RgbImage, RgbaImage};

use crate::collector::{PageImage, PageImageSet};
use crate::error::ExtractError;
use crate::{ExtractOptions, OutputFormat};

/// Name of the optional JSON manifest written next to the images.
pub const MANIFEST_FILE: &str = "manifest.json";

/// A bitmap that has been written to disk.
#[derive(Debug, Clone)]
pub struct WrittenImage {
    pub page_index: usize,
    pub object_id: String,
    pub width: u32,
    pub height: u32,
    /// `true` when the pixels went through the pixel-format decoder.
    pub decoded: bool,
    pub path: PathBuf,
}

/// File name for `image`, e.g. `page3_12_0.png`.
pub fn file_name(image: &PageImage, format: OutputFormat) -> String {
    format!(
        "page{}_{}.{}",
        image.page_index + 1,
        image.object_id.replace(' ', "_"),
        format.extension()
    )
}

/// Write every image of `set` into `output_dir`, creating it if needed.
pub fn write_page_images(
    set: &PageImageSet,
    output_dir: &Path,
    options: &ExtractOptions,
) -> Result<Vec<WrittenImage>, ExtractError> {
    fs::create_dir_all(output_dir)
        .map_err(|e| ExtractError::SaveError(format!("{:?}: {}", output_dir, e)))?;

    let mut written = Vec::with_capacity(set.len());
    for page_image in set.iter() {
        let path = output_dir.join(file_name(page_image, options.format));
        write_image(page_image, &path, options)?;
        log::info!(
            "[Export] Page {}: {} -> {}",
            page_image.page_index + 1,
            page_image.object_id,
            path.display()
        );

        written.push(WrittenImage {
            page_index: page_image.page_index,
            object_id: page_image.object_id.clone(),
            width: page_image.bitmap.width(),
            height: page_image.bitmap.height(),
            decoded: page_image.bitmap.is_decoded(),
            path,
        });
    }

    if options.write_manifest {
        write_manifest(&written, output_dir)?;
    }

    Ok(written)
}

fn write_image(
    page_image: &PageImage,
    path: &Path,
    options: &ExtractOptions,
) -> Result<(), ExtractError> {
    let rgba = page_image.bitmap.to_rgba_image().ok_or_else(|| {
        ExtractError::ProcessingError(format!(
            "image {} has inconsistent pixel data",
            page_image.object_id
        ))
    })?;

    match options.format {
        OutputFormat::Png => rgba
            .save_with_format(path, ImageFormat::Png)
            .map_err(|e| ExtractError::SaveError(format!("{:?}: {}", path, e))),
        OutputFormat::Jpeg => {
            let jpeg_bytes = encode_jpeg(&rgba, options.quality)?;
            fs::write(path, jpeg_bytes)
                .map_err(|e| ExtractError::SaveError(format!("{:?}: {}", path, e)))
        }
    }
}

/// Encode as baseline JPEG. Alpha is dropped.
pub fn encode_jpeg(rgba: &RgbaImage, quality: u8) -> Result<Vec<u8>, ExtractError> {
    let rgb: RgbImage = rgba.convert();
    let (width, height) = rgb.dimensions();
    let (Ok(width), Ok(height)) = (u16::try_from(width), u16::try_from(height)) else {
        return Err(ExtractError::ProcessingError(format!(
            "{}x{} exceeds the JPEG size limit",
            width, height
        )));
    };

    let mut jpeg_bytes = Vec::new();
    let mut encoder = jpeg_encoder::Encoder::new(&mut jpeg_bytes, quality);
    encoder.set_sampling_factor(jpeg_encoder::SamplingFactor::R_4_2_0);
    encoder
        .encode(rgb.as_raw(), width, height, jpeg_encoder::ColorType::Rgb)
        .map_err(|e| ExtractError::ProcessingError(format!("Failed to encode JPEG: {}", e)))?;

    Ok(jpeg_bytes)
}

fn write_manifest(written: &[WrittenImage], output_dir: &Path) -> Result<PathBuf, ExtractError> {
    let entries: Vec<serde_json::Value> = written
        .iter()
        .map(|img| {
            serde_json::json!({
                "page": img.page_index + 1,
                "objectId": img.object_id,
                "width": img.width,
                "height": img.height,
                "origin": if img.decoded { "decoded" } else { "pre-rendered" },
                "file": img.path.file_name().map(|n| n.to_string_lossy().to_string()),
            })
        })
        .collect();

    let json = serde_json::to_string_pretty(&entries)
        .map_err(|e| ExtractError::ProcessingError(e.to_string()))?;
    let path = output_dir.join(MANIFEST_FILE);
    fs::write(&path, json).map_err(|e| ExtractError::SaveError(format!("{:?}: {}", path, e)))?;
    Ok(path)
}
