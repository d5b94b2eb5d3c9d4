//! Pixel-format decoder
//!
//! Re-packs already-decompressed image samples (1-bit grayscale, 24-bit RGB,
//! 32-bit RGBA) into RGBA rows. Output is produced in horizontal chunks of at
//! most [`FULL_CHUNK_HEIGHT`] rows and handed to a [`Rasterizer`] as each chunk
//! is finished, so only one chunk-sized buffer is alive at a time.

use image::RgbaImage;

use crate::error::DecodeError;

/// Maximum number of rows in one emitted chunk.
pub const FULL_CHUNK_HEIGHT: u32 = 16;

const WHITE: [u8; 4] = [255, 255, 255, 255];
const BLACK: [u8; 4] = [0, 0, 0, 255];

/// Layout of the packed source samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PixelKind {
    /// One bit per pixel, most significant bit first, 1 = white.
    Grayscale1Bpp = 1,
    /// Three bytes per pixel: R, G, B.
    Rgb24Bpp = 2,
    /// Four bytes per pixel: R, G, B, A.
    Rgba32Bpp = 3,
}

impl PixelKind {
    /// Numeric code carried by [`ImageRecord::kind`].
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Bytes in one packed source row of `width` pixels.
    pub fn source_row_bytes(self, width: u32) -> Option<usize> {
        let width = width as usize;
        match self {
            PixelKind::Grayscale1Bpp => Some(width.div_ceil(8)),
            PixelKind::Rgb24Bpp => width.checked_mul(3),
            PixelKind::Rgba32Bpp => width.checked_mul(4),
        }
    }
}

impl TryFrom<u8> for PixelKind {
    type Error = DecodeError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(PixelKind::Grayscale1Bpp),
            2 => Ok(PixelKind::Rgb24Bpp),
            3 => Ok(PixelKind::Rgba32Bpp),
            other => Err(DecodeError::UnsupportedPixelKind(other)),
        }
    }
}

/// A raw, packed pixel buffer found in a page's object table.
///
/// `kind` keeps the numeric code as handed over by the page source; it is only
/// interpreted (and rejected if unknown) when the record is decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRecord {
    pub width: u32,
    pub height: u32,
    pub kind: u8,
    pub data: Vec<u8>,
}

impl ImageRecord {
    pub fn new(width: u32, height: u32, kind: PixelKind, data: Vec<u8>) -> Self {
        Self {
            width,
            height,
            kind: kind.code(),
            data,
        }
    }

    pub fn pixel_kind(&self) -> Result<PixelKind, DecodeError> {
        PixelKind::try_from(self.kind)
    }
}

/// A fully decoded RGBA raster, `width * height * 4` bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedBitmap {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
}

impl DecodedBitmap {
    /// RGBA value at `(x, y)`, or `None` outside the bitmap.
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let offset = (y as usize * self.width as usize + x as usize) * 4;
        let px = self.rgba.get(offset..offset + 4)?;
        Some([px[0], px[1], px[2], px[3]])
    }

    pub fn into_rgba_image(self) -> Option<RgbaImage> {
        RgbaImage::from_raw(self.width, self.height, self.rgba)
    }
}

/// A run of decoded rows starting at `row_offset`.
///
/// `rgba` holds exactly `width * height * 4` bytes.
#[derive(Debug, Clone, Copy)]
pub struct Chunk<'a> {
    pub index: u32,
    pub row_offset: u32,
    pub width: u32,
    pub height: u32,
    pub rgba: &'a [u8],
}

/// How an image of a given height is split into chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLayout {
    pub chunk_height: u32,
    pub full_chunks: u32,
    pub partial_height: u32,
}

impl ChunkLayout {
    pub fn new(height: u32, chunk_height: u32) -> Self {
        let chunk_height = chunk_height.max(1);
        Self {
            chunk_height,
            full_chunks: height / chunk_height,
            partial_height: height % chunk_height,
        }
    }

    pub fn total_chunks(&self) -> u32 {
        self.full_chunks + u32::from(self.partial_height != 0)
    }

    /// Number of rows in chunk `index` (0 past the last chunk).
    pub fn chunk_rows(&self, index: u32) -> u32 {
        if index < self.full_chunks {
            self.chunk_height
        } else if index == self.full_chunks {
            self.partial_height
        } else {
            0
        }
    }

    /// `(row_offset, rows)` for every chunk, top to bottom.
    pub fn iter(&self) -> impl Iterator<Item = (u32, u32)> {
        let layout = *self;
        (0..layout.total_chunks()).map(move |i| (i * layout.chunk_height, layout.chunk_rows(i)))
    }
}

/// Sink receiving decoded chunks in top-to-bottom order.
pub trait Rasterizer {
    fn put_chunk(&mut self, chunk: Chunk<'_>);
}

/// Rasterizer that concatenates chunks into a [`DecodedBitmap`].
#[derive(Debug)]
pub struct BitmapBuilder {
    width: u32,
    height: u32,
    rgba: Vec<u8>,
}

impl BitmapBuilder {
    pub fn new(width: u32, height: u32) -> Self {
        let capacity = (width as usize)
            .checked_mul(height as usize)
            .and_then(|pixels| pixels.checked_mul(4))
            .unwrap_or(0);
        Self {
            width,
            height,
            rgba: Vec::with_capacity(capacity),
        }
    }

    pub fn finish(self) -> DecodedBitmap {
        DecodedBitmap {
            width: self.width,
            height: self.height,
            rgba: self.rgba,
        }
    }
}

impl Rasterizer for BitmapBuilder {
    fn put_chunk(&mut self, chunk: Chunk<'_>) {
        debug_assert_eq!(
            self.rgba.len(),
            chunk.row_offset as usize * chunk.width as usize * 4
        );
        self.rgba.extend_from_slice(chunk.rgba);
    }
}

impl Rasterizer for RgbaImage {
    fn put_chunk(&mut self, chunk: Chunk<'_>) {
        if chunk.width != self.width() {
            log::warn!(
                "[Decode] chunk width {} does not match target width {}",
                chunk.width,
                self.width()
            );
            return;
        }
        let height = self.height();
        let start = chunk.row_offset as usize * chunk.width as usize * 4;
        let end = start + chunk.rgba.len();
        let buffer: &mut [u8] = &mut **self;
        match buffer.get_mut(start..end) {
            Some(rows) => rows.copy_from_slice(chunk.rgba),
            None => log::warn!(
                "[Decode] chunk at row {} overruns target of height {}",
                chunk.row_offset,
                height
            ),
        }
    }
}

/// Converts packed pixel buffers into RGBA, one chunk at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelFormatDecoder {
    chunk_height: u32,
}

impl Default for PixelFormatDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl PixelFormatDecoder {
    pub const fn new() -> Self {
        Self {
            chunk_height: FULL_CHUNK_HEIGHT,
        }
    }

    /// Decoder emitting chunks of `chunk_height` rows (at least one).
    pub fn with_chunk_height(chunk_height: u32) -> Self {
        Self {
            chunk_height: chunk_height.max(1),
        }
    }

    pub fn chunk_height(&self) -> u32 {
        self.chunk_height
    }

    pub fn layout(&self, height: u32) -> ChunkLayout {
        ChunkLayout::new(height, self.chunk_height)
    }

    /// Decode `record` into a freshly built bitmap.
    pub fn decode(&self, record: &ImageRecord) -> Result<DecodedBitmap, DecodeError> {
        let mut builder = BitmapBuilder::new(record.width, record.height);
        self.decode_into(record, &mut builder)?;
        Ok(builder.finish())
    }

    /// Decode `record` directly into an `image` buffer, chunk by chunk.
    pub fn decode_to_image(&self, record: &ImageRecord) -> Result<RgbaImage, DecodeError> {
        let kind = record.pixel_kind()?;
        check_sizes(record, kind)?;
        let mut target = RgbaImage::new(record.width, record.height);
        self.decode_into(record, &mut target)?;
        Ok(target)
    }

    /// Decode `record`, emitting every chunk to `sink`.
    ///
    /// The record is validated up front; on error nothing reaches the sink.
    pub fn decode_into<R>(&self, record: &ImageRecord, sink: &mut R) -> Result<(), DecodeError>
    where
        R: Rasterizer + ?Sized,
    {
        let kind = record.pixel_kind()?;
        let sizes = check_sizes(record, kind)?;
        let width = record.width as usize;
        let layout = self.layout(record.height);

        let buffer_rows = self.chunk_height.min(record.height) as usize;
        let mut buffer = vec![0u8; sizes.dest_row * buffer_rows];

        for (index, (row_offset, rows)) in layout.iter().enumerate() {
            let dest = &mut buffer[..sizes.dest_row * rows as usize];
            let src_start = row_offset as usize * sizes.src_row;
            let src_end = src_start + rows as usize * sizes.src_row;

            match kind {
                PixelKind::Grayscale1Bpp => {
                    unpack_gray_rows(&record.data, sizes.src_row, row_offset as usize, width, dest);
                }
                PixelKind::Rgb24Bpp => expand_rgb(&record.data[src_start..src_end], dest),
                PixelKind::Rgba32Bpp => dest.copy_from_slice(&record.data[src_start..src_end]),
            }

            sink.put_chunk(Chunk {
                index: index as u32,
                row_offset,
                width: record.width,
                height: rows,
                rgba: dest,
            });
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct RowSizes {
    src_row: usize,
    dest_row: usize,
}

fn check_sizes(record: &ImageRecord, kind: PixelKind) -> Result<RowSizes, DecodeError> {
    let too_large = || DecodeError::ImageTooLarge {
        width: record.width,
        height: record.height,
    };
    let rows = record.height as usize;
    let src_row = kind.source_row_bytes(record.width).ok_or_else(too_large)?;
    let dest_row = (record.width as usize).checked_mul(4).ok_or_else(too_large)?;
    dest_row.checked_mul(rows).ok_or_else(too_large)?;
    let expected = src_row.checked_mul(rows).ok_or_else(too_large)?;

    // A 1-bit buffer may end partway through its final row.
    let minimum = match kind {
        PixelKind::Grayscale1Bpp if expected > 0 => expected - src_row + 1,
        _ => expected,
    };
    if record.data.len() < minimum {
        return Err(DecodeError::MalformedRecord {
            kind,
            width: record.width,
            height: record.height,
            expected,
            actual: record.data.len(),
        });
    }

    Ok(RowSizes { src_row, dest_row })
}

fn bit_pixel(byte: u8, mask: u8) -> &'static [u8; 4] {
    if byte & mask != 0 {
        &WHITE
    } else {
        &BLACK
    }
}

fn unpack_gray_rows(data: &[u8], src_row: usize, first_row: usize, width: usize, dest: &mut [u8]) {
    if width == 0 {
        return;
    }
    for (row, out) in dest.chunks_exact_mut(width * 4).enumerate() {
        let start = (first_row + row) * src_row;
        let end = (start + src_row).min(data.len());
        let src = data.get(start..end).unwrap_or(&[]);
        unpack_gray_row(src, width, out);
    }
}

/// Unpack one 1-bit row. Pixels past the end of `src` are left transparent.
fn unpack_gray_row(src: &[u8], width: usize, out: &mut [u8]) {
    let available = width.min(src.len() * 8);
    let (lit, rest) = out.split_at_mut(available * 4);
    let whole = available / 8;

    for (&byte, pixels) in src[..whole].iter().zip(lit.chunks_exact_mut(32)) {
        for (bit, pixel) in pixels.chunks_exact_mut(4).enumerate() {
            pixel.copy_from_slice(bit_pixel(byte, 0x80 >> bit));
        }
    }

    let mut mask = 0u8;
    let mut byte = 0u8;
    let mut next = whole;
    for pixel in lit[whole * 32..].chunks_exact_mut(4) {
        if mask == 0 {
            byte = src[next];
            next += 1;
            mask = 0x80;
        }
        pixel.copy_from_slice(bit_pixel(byte, mask));
        mask >>= 1;
    }

    rest.fill(0);
}

fn expand_rgb(src: &[u8], dest: &mut [u8]) {
    for (rgb, rgba) in src.chunks_exact(3).zip(dest.chunks_exact_mut(4)) {
        rgba[..3].copy_from_slice(rgb);
        rgba[3] = 255;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        chunks: Vec<(u32, u32, u32, usize)>,
    }

    impl Rasterizer for RecordingSink {
        fn put_chunk(&mut self, chunk: Chunk<'_>) {
            self.chunks
                .push((chunk.index, chunk.row_offset, chunk.height, chunk.rgba.len()));
        }
    }

    fn pseudo_random(len: usize, seed: u32) -> Vec<u8> {
        let mut state = seed.wrapping_mul(2_654_435_761).max(1);
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                (state >> 8) as u8
            })
            .collect()
    }

    fn source_bit(data: &[u8], row_bytes: usize, x: u32, y: u32) -> bool {
        let byte = data[y as usize * row_bytes + x as usize / 8];
        byte & (0x80 >> (x % 8)) != 0
    }

    #[test]
    fn rgb_pixels_become_opaque() {
        let data = pseudo_random(7 * 19 * 3, 1);
        let record = ImageRecord::new(7, 19, PixelKind::Rgb24Bpp, data.clone());
        let bitmap = PixelFormatDecoder::new().decode(&record).unwrap();

        assert_eq!(bitmap.rgba.len(), 7 * 19 * 4);
        for (rgb, rgba) in data.chunks_exact(3).zip(bitmap.rgba.chunks_exact(4)) {
            assert_eq!(&rgba[..3], rgb);
            assert_eq!(rgba[3], 255);
        }
    }

    #[test]
    fn rgba_is_copied_unchanged() {
        let data = pseudo_random(5 * 20 * 4, 2);
        let record = ImageRecord::new(5, 20, PixelKind::Rgba32Bpp, data.clone());
        let bitmap = PixelFormatDecoder::new().decode(&record).unwrap();
        assert_eq!(bitmap.rgba, data);
    }

    #[test]
    fn grayscale_reads_bits_msb_first() {
        // width 10 -> two source bytes per row
        let data = vec![0b1010_0000, 0b1100_0000, 0x00, 0b0100_0000];
        let record = ImageRecord::new(10, 2, PixelKind::Grayscale1Bpp, data);
        let bitmap = PixelFormatDecoder::new().decode(&record).unwrap();

        let white_row0: Vec<u32> = (0..10)
            .filter(|&x| bitmap.pixel(x, 0) == Some(WHITE))
            .collect();
        assert_eq!(white_row0, vec![0, 2, 8, 9]);

        let white_row1: Vec<u32> = (0..10)
            .filter(|&x| bitmap.pixel(x, 1) == Some(WHITE))
            .collect();
        assert_eq!(white_row1, vec![9]);
        assert_eq!(bitmap.pixel(0, 1), Some(BLACK));
    }

    #[test]
    fn grayscale_pixels_match_source_bits() {
        for width in 1..=20u32 {
            for height in [1u32, 15, 16, 17, 33] {
                let row_bytes = (width as usize).div_ceil(8);
                let data = pseudo_random(row_bytes * height as usize, width * 100 + height);
                let record =
                    ImageRecord::new(width, height, PixelKind::Grayscale1Bpp, data.clone());
                let bitmap = PixelFormatDecoder::new().decode(&record).unwrap();

                for y in 0..height {
                    for x in 0..width {
                        let expected = if source_bit(&data, row_bytes, x, y) {
                            WHITE
                        } else {
                            BLACK
                        };
                        assert_eq!(bitmap.pixel(x, y), Some(expected), "{width}x{height} at ({x},{y})");
                    }
                }
            }
        }
    }

    #[test]
    fn grayscale_truncated_final_row_is_transparent_past_the_data() {
        let record = ImageRecord::new(16, 2, PixelKind::Grayscale1Bpp, vec![0xFF, 0xFF, 0xF0]);
        let bitmap = PixelFormatDecoder::new().decode(&record).unwrap();

        assert!((0..16).all(|x| bitmap.pixel(x, 0) == Some(WHITE)));
        assert!((0..4).all(|x| bitmap.pixel(x, 1) == Some(WHITE)));
        assert!((4..8).all(|x| bitmap.pixel(x, 1) == Some(BLACK)));
        assert!((8..16).all(|x| bitmap.pixel(x, 1) == Some([0, 0, 0, 0])));
    }

    #[test]
    fn grayscale_missing_rows_is_malformed() {
        let record = ImageRecord::new(16, 2, PixelKind::Grayscale1Bpp, vec![0xFF, 0xFF]);
        let err = PixelFormatDecoder::new().decode(&record).unwrap_err();
        assert_eq!(
            err,
            DecodeError::MalformedRecord {
                kind: PixelKind::Grayscale1Bpp,
                width: 16,
                height: 2,
                expected: 4,
                actual: 2,
            }
        );
    }

    #[test]
    fn short_rgb_buffer_emits_nothing() {
        let record = ImageRecord::new(4, 4, PixelKind::Rgb24Bpp, vec![0; 4 * 4 * 3 - 1]);
        let mut sink = RecordingSink::default();
        let err = PixelFormatDecoder::new()
            .decode_into(&record, &mut sink)
            .unwrap_err();
        assert!(matches!(err, DecodeError::MalformedRecord { expected: 48, actual: 47, .. }));
        assert!(sink.chunks.is_empty());
    }

    #[test]
    fn unknown_kind_is_rejected_without_output() {
        let record = ImageRecord {
            width: 2,
            height: 2,
            kind: 99,
            data: vec![0; 16],
        };
        let mut sink = RecordingSink::default();
        let err = PixelFormatDecoder::new()
            .decode_into(&record, &mut sink)
            .unwrap_err();
        assert_eq!(err, DecodeError::UnsupportedPixelKind(99));
        assert!(sink.chunks.is_empty());
    }

    #[test]
    fn chunk_heights_sum_to_image_height() {
        for height in 0..=100u32 {
            let layout = ChunkLayout::new(height, FULL_CHUNK_HEIGHT);
            let rows: Vec<u32> = layout.iter().map(|(_, rows)| rows).collect();

            assert_eq!(rows.iter().sum::<u32>(), height);
            if let Some((last, init)) = rows.split_last() {
                assert!(init.iter().all(|&r| r == FULL_CHUNK_HEIGHT));
                let expected_last = if height % 16 == 0 { 16 } else { height % 16 };
                assert_eq!(*last, expected_last);
            } else {
                assert_eq!(height, 0);
            }
        }
    }

    #[test]
    fn chunks_are_emitted_top_to_bottom() {
        let record = ImageRecord::new(3, 37, PixelKind::Rgb24Bpp, vec![9; 3 * 37 * 3]);
        let mut sink = RecordingSink::default();
        PixelFormatDecoder::new()
            .decode_into(&record, &mut sink)
            .unwrap();

        assert_eq!(
            sink.chunks,
            vec![(0, 0, 16, 3 * 16 * 4), (1, 16, 16, 3 * 16 * 4), (2, 32, 5, 3 * 5 * 4)]
        );
    }

    #[test]
    fn custom_chunk_height_gives_same_pixels() {
        let data = pseudo_random(6 * 23 * 3, 7);
        let record = ImageRecord::new(6, 23, PixelKind::Rgb24Bpp, data);
        let default = PixelFormatDecoder::new().decode(&record).unwrap();
        let small = PixelFormatDecoder::with_chunk_height(5).decode(&record).unwrap();
        assert_eq!(default, small);
        assert_eq!(PixelFormatDecoder::with_chunk_height(0).chunk_height(), 1);
    }

    #[test]
    fn decoding_twice_is_identical() {
        let row_bytes = 3;
        let record = ImageRecord::new(
            21,
            40,
            PixelKind::Grayscale1Bpp,
            pseudo_random(row_bytes * 40, 11),
        );
        let decoder = PixelFormatDecoder::new();
        assert_eq!(decoder.decode(&record).unwrap(), decoder.decode(&record).unwrap());
    }

    #[test]
    fn image_sink_matches_bitmap() {
        let record = ImageRecord::new(9, 18, PixelKind::Rgba32Bpp, pseudo_random(9 * 18 * 4, 5));
        let decoder = PixelFormatDecoder::new();
        let image = decoder.decode_to_image(&record).unwrap();
        let bitmap = decoder.decode(&record).unwrap();
        assert_eq!(image.as_raw(), &bitmap.rgba);
    }

    #[test]
    fn empty_image_emits_no_chunks() {
        let record = ImageRecord::new(8, 0, PixelKind::Rgb24Bpp, Vec::new());
        let mut sink = RecordingSink::default();
        PixelFormatDecoder::new()
            .decode_into(&record, &mut sink)
            .unwrap();
        assert!(sink.chunks.is_empty());
    }
}
