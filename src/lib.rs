//! PDF Image Extractor Library
//!
//! Pulls every embedded raster image out of a PDF as a standalone bitmap.
//! Shared between the CLI and library users.
//!
//! Each page's drawing instructions are evaluated so that every image it
//! references is known, then images are either forwarded as already decoded
//! bitmaps (JPEG and friends) or re-packed from their raw samples into RGBA by
//! the [`PixelFormatDecoder`].

pub mod collector;
pub mod decoder;
pub mod error;
pub mod export;
pub mod pdf;

pub use collector::{
    Bitmap, ObjectTable, PageImage, PageImageCollector, PageImageSet, PageObject, PageSource,
    PdfSource,
};
pub use decoder::{
    BitmapBuilder, Chunk, ChunkLayout, DecodedBitmap, ImageRecord, PixelFormatDecoder, PixelKind,
    Rasterizer, FULL_CHUNK_HEIGHT,
};
pub use error::{DecodeError, ExtractError, SourceError};
pub use pdf::{LopdfPage, LopdfSource};

/// File format used when writing extracted images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Png,
    /// Baseline JPEG; alpha is dropped.
    Jpeg,
}

impl OutputFormat {
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Png => "png",
            OutputFormat::Jpeg => "jpg",
        }
    }
}

/// Options for PDF image extraction
#[derive(Debug, Clone)]
pub struct ExtractOptions {
    /// Rows per chunk handed to the rasterizer
    pub chunk_height: u32,
    /// Format of the written image files
    pub format: OutputFormat,
    /// JPEG quality (1-100, only affects JPEG output)
    pub quality: u8,
    /// Write a `manifest.json` next to the images
    pub write_manifest: bool,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            chunk_height: FULL_CHUNK_HEIGHT,
            format: OutputFormat::Png,
            quality: 90,
            write_manifest: false,
        }
    }
}

impl ExtractOptions {
    pub fn validate(&self) -> Result<(), ExtractError> {
        if self.quality == 0 || self.quality > 100 {
            return Err(ExtractError::InvalidQuality);
        }
        Ok(())
    }

    pub fn decoder(&self) -> PixelFormatDecoder {
        PixelFormatDecoder::with_chunk_height(self.chunk_height)
    }
}

/// Collect the images of every page of `source`.
pub async fn extract_images<S>(source: &S, options: &ExtractOptions) -> PageImageSet
where
    S: PdfSource + ?Sized,
{
    PageImageCollector::new(options.decoder())
        .collect(source)
        .await
}

/// Extract images from PDF bytes.
pub fn extract_pdf_images_bytes(
    input_bytes: &[u8],
    options: &ExtractOptions,
) -> Result<PageImageSet, ExtractError> {
    options.validate()?;
    let source = LopdfSource::load_mem(input_bytes)?;
    run_collection(&source, options)
}

/// Drive the collector to completion on a single-threaded runtime.
fn run_collection<S>(source: &S, options: &ExtractOptions) -> Result<PageImageSet, ExtractError>
where
    S: PdfSource + ?Sized,
{
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .map_err(|e| ExtractError::ProcessingError(format!("Failed to start runtime: {}", e)))?;
    Ok(runtime.block_on(extract_images(source, options)))
}

/// File-based operations (CLI only)
pub mod file_ops {
    use super::*;
    use std::path::Path;

    use crate::export::{self, WrittenImage};

    /// Result of a file-to-directory extraction
    #[derive(Debug, Clone)]
    pub struct ExtractResult {
        pub total_images: usize,
        pub skipped_images: usize,
        pub failed_pages: Vec<usize>,
        pub written: Vec<WrittenImage>,
    }

    /// Extract images from a PDF file into `output_dir`
    pub fn extract_pdf_images_file(
        input_path: &Path,
        output_dir: &Path,
        options: &ExtractOptions,
    ) -> Result<ExtractResult, ExtractError> {
        options.validate()?;

        let source = LopdfSource::load(input_path)
            .map_err(|e| ExtractError::LoadError(format!("{:?}: {}", input_path, e)))?;
        log::info!(
            "[Extract] {:?}: {} pages",
            input_path,
            source.page_count()
        );

        let mut set = run_collection(&source, options)?;
        set.sort_by_page();

        let written = export::write_page_images(&set, output_dir, options)?;

        Ok(ExtractResult {
            total_images: set.len(),
            skipped_images: set.skipped_images,
            failed_pages: set.failed_pages,
            written,
        })
    }
}
