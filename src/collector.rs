//! Page image collector
//!
//! Walks every page of a document, forces the page's content to be evaluated so
//! that its object table is complete, and gathers the image-bearing entries.
//! Pre-rendered bitmaps are forwarded as-is; raw pixel buffers go through the
//! [`PixelFormatDecoder`].
//!
//! Pages are independent: one task per page is spawned before any is awaited,
//! and the result is assembled once every task has finished. A failing page or
//! a malformed image only removes its own contribution.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use image::{DynamicImage, RgbaImage};
use tokio::task::JoinSet;

use crate::decoder::{DecodedBitmap, ImageRecord, PixelFormatDecoder};
use crate::error::SourceError;

/// One entry of a page's object table, as classified by the page source.
#[derive(Debug, Clone)]
pub enum PageObject {
    /// An image the source already decoded to a displayable bitmap.
    PreRendered(Arc<DynamicImage>),
    /// Packed samples that still need re-packing into RGBA.
    RawPixels(ImageRecord),
    /// Fonts, forms and anything else without image data.
    Other,
}

/// Object id -> object, for one page.
pub type ObjectTable = BTreeMap<String, PageObject>;

/// A parsed document whose pages can be handed out independently.
pub trait PdfSource {
    type Page: PageSource + Send + 'static;

    fn page_count(&self) -> usize;

    /// Handle for the page at 0-based `index`.
    fn page(&self, index: usize) -> Result<Self::Page, SourceError>;
}

/// A single page of a [`PdfSource`].
pub trait PageSource {
    /// Evaluate the page's drawing instructions so every image it uses is
    /// present in [`object_table`](PageSource::object_table).
    fn materialize_content(&mut self) -> impl Future<Output = Result<(), SourceError>> + Send;

    fn object_table(&self) -> &ObjectTable;
}

/// A displayable bitmap produced by the collector.
#[derive(Debug, Clone)]
pub enum Bitmap {
    PreRendered(Arc<DynamicImage>),
    Decoded(DecodedBitmap),
}

impl Bitmap {
    pub fn width(&self) -> u32 {
        match self {
            Bitmap::PreRendered(image) => image.width(),
            Bitmap::Decoded(bitmap) => bitmap.width,
        }
    }

    pub fn height(&self) -> u32 {
        match self {
            Bitmap::PreRendered(image) => image.height(),
            Bitmap::Decoded(bitmap) => bitmap.height,
        }
    }

    pub fn is_decoded(&self) -> bool {
        matches!(self, Bitmap::Decoded(_))
    }

    pub fn to_rgba_image(&self) -> Option<RgbaImage> {
        match self {
            Bitmap::PreRendered(image) => Some(image.to_rgba8()),
            Bitmap::Decoded(bitmap) => bitmap.clone().into_rgba_image(),
        }
    }
}

/// A bitmap together with where it was found.
#[derive(Debug, Clone)]
pub struct PageImage {
    /// 0-based page index.
    pub page_index: usize,
    pub object_id: String,
    pub bitmap: Bitmap,
}

/// Everything collected from a document.
///
/// Images arrive in task completion order; only membership is meaningful.
#[derive(Debug, Clone, Default)]
pub struct PageImageSet {
    pub images: Vec<PageImage>,
    /// Image entries that failed to decode.
    pub skipped_images: usize,
    /// Pages whose handle or content could not be obtained, ascending.
    pub failed_pages: Vec<usize>,
}

impl PageImageSet {
    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, PageImage> {
        self.images.iter()
    }

    /// Order images by page, then object id.
    pub fn sort_by_page(&mut self) {
        self.images.sort_by(|a, b| {
            a.page_index
                .cmp(&b.page_index)
                .then_with(|| a.object_id.cmp(&b.object_id))
        });
    }
}

impl IntoIterator for PageImageSet {
    type Item = PageImage;
    type IntoIter = std::vec::IntoIter<PageImage>;

    fn into_iter(self) -> Self::IntoIter {
        self.images.into_iter()
    }
}

/// Images found on one page.
#[derive(Debug, Default)]
struct PageContribution {
    images: Vec<PageImage>,
    skipped: usize,
}

/// Collects bitmaps from every page of a [`PdfSource`].
#[derive(Debug, Clone, Copy, Default)]
pub struct PageImageCollector {
    decoder: PixelFormatDecoder,
}

impl PageImageCollector {
    pub fn new(decoder: PixelFormatDecoder) -> Self {
        Self { decoder }
    }

    pub fn decoder(&self) -> &PixelFormatDecoder {
        &self.decoder
    }

    /// Collect the images of every page.
    ///
    /// Must run inside a tokio runtime. Never fails: unavailable pages are
    /// listed in [`PageImageSet::failed_pages`] and undecodable images are
    /// counted in [`PageImageSet::skipped_images`].
    pub async fn collect<S>(&self, source: &S) -> PageImageSet
    where
        S: PdfSource + ?Sized,
    {
        let mut result = PageImageSet::default();
        let mut tasks = JoinSet::new();

        for index in (0..source.page_count()).rev() {
            match source.page(index) {
                Ok(page) => {
                    let decoder = self.decoder;
                    tasks.spawn(async move { (index, collect_page(index, page, decoder).await) });
                }
                Err(err) => {
                    log::warn!("[Collect] Page {}: unavailable: {}", index + 1, err);
                    result.failed_pages.push(index);
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(contribution))) => {
                    result.skipped_images += contribution.skipped;
                    result.images.extend(contribution.images);
                }
                Ok((index, Err(err))) => {
                    log::warn!("[Collect] Page {}: {}", index + 1, err);
                    result.failed_pages.push(index);
                }
                Err(err) => log::error!("[Collect] Page task did not complete: {}", err),
            }
        }

        result.failed_pages.sort_unstable();
        log::info!(
            "[Collect] {} images from {} pages ({} skipped, {} pages failed)",
            result.images.len(),
            source.page_count(),
            result.skipped_images,
            result.failed_pages.len()
        );
        result
    }
}

async fn collect_page<P: PageSource>(
    index: usize,
    mut page: P,
    decoder: PixelFormatDecoder,
) -> Result<PageContribution, SourceError> {
    page.materialize_content().await?;
    Ok(scan_object_table(index, page.object_table(), &decoder))
}

fn scan_object_table(
    page_index: usize,
    table: &ObjectTable,
    decoder: &PixelFormatDecoder,
) -> PageContribution {
    let mut contribution = PageContribution::default();

    for (object_id, object) in table {
        let bitmap = match object {
            PageObject::PreRendered(handle) => Bitmap::PreRendered(Arc::clone(handle)),
            PageObject::RawPixels(record) => match decoder.decode(record) {
                Ok(decoded) => Bitmap::Decoded(decoded),
                Err(err) => {
                    log::warn!(
                        "[Collect] Page {}: skipping image {}: {}",
                        page_index + 1,
                        object_id,
                        err
                    );
                    contribution.skipped += 1;
                    continue;
                }
            },
            PageObject::Other => continue,
        };

        log::debug!(
            "[Collect] Page {}: image {} {}x{}",
            page_index + 1,
            object_id,
            bitmap.width(),
            bitmap.height()
        );
        contribution.images.push(PageImage {
            page_index,
            object_id: object_id.clone(),
            bitmap,
        });
    }

    contribution
}
