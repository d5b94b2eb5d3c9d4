//! Image XObject classification
//!
//! Turns an image stream into the [`PageObject`] the collector understands:
//! JPEG/JPEG 2000 payloads are decoded by the `image` crate and forwarded as
//! ready bitmaps, uncompressed or Flate-compressed samples become packed
//! [`ImageRecord`]s for the pixel-format decoder.

use std::io::Read;
use std::sync::Arc;

use flate2::read::ZlibDecoder;
use image::ImageFormat;
use lopdf::{Dictionary, Document, Object, ObjectId, Stream};

use crate::collector::PageObject;
use crate::decoder::{ImageRecord, PixelKind};

/// Color space of an image, reduced to what the extractor can unpack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ColorSpace {
    Gray,
    Rgb,
    Cmyk,
    Unsupported(String),
}

impl ColorSpace {
    pub(crate) fn resolve(doc: &Document, obj: &Object) -> Self {
        match obj {
            Object::Name(name) => Self::from_family(name),
            Object::Array(arr) => match arr.first() {
                Some(Object::Name(family)) if family.as_slice() == b"ICCBased" => {
                    match arr.get(1).and_then(|profile| icc_components(doc, profile)) {
                        Some(1) => ColorSpace::Gray,
                        Some(3) => ColorSpace::Rgb,
                        Some(4) => ColorSpace::Cmyk,
                        n => ColorSpace::Unsupported(format!("ICCBased with N={:?}", n)),
                    }
                }
                Some(Object::Name(family)) => Self::from_family(family),
                _ => ColorSpace::Unsupported("Unknown".to_string()),
            },
            Object::Reference(id) => match doc.get_object(*id) {
                Ok(resolved) => Self::resolve(doc, resolved),
                Err(_) => ColorSpace::Unsupported("Unknown".to_string()),
            },
            _ => ColorSpace::Unsupported("Unknown".to_string()),
        }
    }

    fn components(&self) -> Option<usize> {
        match self {
            ColorSpace::Gray => Some(1),
            ColorSpace::Rgb => Some(3),
            ColorSpace::Cmyk => Some(4),
            ColorSpace::Unsupported(_) => None,
        }
    }

    fn from_family(name: &[u8]) -> Self {
        match name {
            b"DeviceGray" | b"G" | b"CalGray" => ColorSpace::Gray,
            b"DeviceRGB" | b"RGB" | b"CalRGB" => ColorSpace::Rgb,
            b"DeviceCMYK" | b"CMYK" => ColorSpace::Cmyk,
            other => ColorSpace::Unsupported(String::from_utf8_lossy(other).to_string()),
        }
    }
}

fn icc_components(doc: &Document, profile: &Object) -> Option<i64> {
    let stream = match profile {
        Object::Reference(id) => match doc.get_object(*id).ok()? {
            Object::Stream(stream) => stream,
            _ => return None,
        },
        Object::Stream(stream) => stream,
        _ => return None,
    };
    integer(&stream.dict, b"N")
}

/// An image XObject with everything needed to classify it later.
#[derive(Debug, Clone)]
pub(crate) struct ImageXObject {
    pub(crate) id: ObjectId,
    stream: Stream,
    color_space: ColorSpace,
    smask: Option<Stream>,
}

impl ImageXObject {
    pub(crate) fn resolve(doc: &Document, id: ObjectId, stream: &Stream) -> Self {
        let color_space = stream
            .dict
            .get(b"ColorSpace")
            .map(|cs| ColorSpace::resolve(doc, cs))
            .unwrap_or(ColorSpace::Rgb);

        let smask = match stream.dict.get(b"SMask") {
            Ok(Object::Reference(smask_id)) => match doc.get_object(*smask_id) {
                Ok(Object::Stream(smask)) => Some(smask.clone()),
                _ => None,
            },
            _ => None,
        };

        Self {
            id,
            stream: stream.clone(),
            color_space,
            smask,
        }
    }

    pub(crate) fn to_page_object(&self) -> PageObject {
        match self.classify() {
            Ok(object) => object,
            Err(reason) => {
                log::debug!("[Pdf] Image {} {}: {}", self.id.0, self.id.1, reason);
                PageObject::Other
            }
        }
    }

    fn classify(&self) -> Result<PageObject, String> {
        let dict = &self.stream.dict;
        if matches!(dict.get(b"ImageMask"), Ok(Object::Boolean(true))) {
            return Err("stencil masks are not collected".to_string());
        }

        let width = dimension(dict, b"Width").ok_or("invalid /Width")?;
        let height = dimension(dict, b"Height").ok_or("invalid /Height")?;
        let content = &self.stream.content;

        match filter_names(dict).as_slice() {
            [filter] if filter == "DCTDecode" => {
                let img = image::load_from_memory_with_format(content, ImageFormat::Jpeg)
                    .map_err(|e| format!("Failed to decode JPEG image: {}", e))?;
                Ok(PageObject::PreRendered(Arc::new(img)))
            }
            [filter] if filter == "JPXDecode" => {
                let img = image::load_from_memory(content)
                    .map_err(|e| format!("Failed to decode JPEG2000 image: {}", e))?;
                Ok(PageObject::PreRendered(Arc::new(img)))
            }
            _ => {
                let samples = stream_bytes(&self.stream)?;
                self.packed_record(width, height, samples)
            }
        }
    }

    fn packed_record(&self, width: u32, height: u32, samples: Vec<u8>) -> Result<PageObject, String> {
        let dict = &self.stream.dict;
        let bits = integer(dict, b"BitsPerComponent").unwrap_or(8);
        let pixels = (width as usize)
            .checked_mul(height as usize)
            .ok_or("image dimensions overflow")?;

        let record = match (&self.color_space, bits) {
            (ColorSpace::Gray, 1) => {
                if self.smask.is_some() {
                    log::debug!("[Pdf] Image {} {}: ignoring SMask on 1-bit image", self.id.0, self.id.1);
                }
                let samples = if decode_inverted(dict) {
                    samples.iter().map(|b| !b).collect()
                } else {
                    samples
                };
                ImageRecord::new(width, height, PixelKind::Grayscale1Bpp, samples)
            }
            (space, 8) => {
                let mut samples = samples;
                if let Some(ranges) = space.components().and_then(|n| decode_ranges(dict, n)) {
                    apply_decode(&mut samples, &ranges);
                }
                let rgb = match space {
                    ColorSpace::Rgb => samples,
                    ColorSpace::Gray => gray_to_rgb(&samples, pixels)?,
                    ColorSpace::Cmyk => cmyk_to_rgb(&samples, pixels)?,
                    ColorSpace::Unsupported(name) => {
                        return Err(format!("Unsupported color space: {}", name))
                    }
                };
                match self.smask_alpha(width, height) {
                    Some(alpha) => {
                        let rgba = merge_alpha(&rgb, &alpha)?;
                        ImageRecord::new(width, height, PixelKind::Rgba32Bpp, rgba)
                    }
                    None => ImageRecord::new(width, height, PixelKind::Rgb24Bpp, rgb),
                }
            }
            (space, bits) => {
                return Err(format!("Unsupported format: {:?} at {} bits", space, bits));
            }
        };

        Ok(PageObject::RawPixels(record))
    }

    /// 8-bit alpha samples from the soft mask, if it matches the image size.
    fn smask_alpha(&self, width: u32, height: u32) -> Option<Vec<u8>> {
        let smask = self.smask.as_ref()?;
        let dims = (dimension(&smask.dict, b"Width"), dimension(&smask.dict, b"Height"));
        if dims != (Some(width), Some(height)) {
            log::warn!(
                "[Pdf] Image {} {}: SMask size {:?} differs from {}x{}, ignoring",
                self.id.0,
                self.id.1,
                dims,
                width,
                height
            );
            return None;
        }
        if integer(&smask.dict, b"BitsPerComponent").unwrap_or(8) != 8 {
            log::warn!("[Pdf] Image {} {}: only 8-bit SMasks are applied", self.id.0, self.id.1);
            return None;
        }

        let expected_size = width as usize * height as usize;
        match stream_bytes(smask) {
            Ok(mut alpha) if alpha.len() >= expected_size => {
                alpha.truncate(expected_size);
                Some(alpha)
            }
            Ok(alpha) => {
                log::warn!(
                    "[Pdf] SMask data size mismatch: got {} expected {}",
                    alpha.len(),
                    expected_size
                );
                None
            }
            Err(e) => {
                log::warn!("[Pdf] Could not decode SMask: {}", e);
                None
            }
        }
    }
}

fn integer(dict: &Dictionary, key: &[u8]) -> Option<i64> {
    match dict.get(key) {
        Ok(Object::Integer(n)) => Some(*n),
        _ => None,
    }
}

fn dimension(dict: &Dictionary, key: &[u8]) -> Option<u32> {
    integer(dict, key)
        .and_then(|n| u32::try_from(n).ok())
        .filter(|n| *n > 0)
}

fn filter_names(dict: &Dictionary) -> Vec<String> {
    match dict.get(b"Filter") {
        Ok(Object::Name(n)) => vec![String::from_utf8_lossy(n).to_string()],
        Ok(Object::Array(arr)) => arr
            .iter()
            .filter_map(|f| match f {
                Object::Name(n) => Some(String::from_utf8_lossy(n).to_string()),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn decode_inverted(dict: &Dictionary) -> bool {
    decode_ranges(dict, 1).is_some_and(|ranges| ranges[0].0 > ranges[0].1)
}

/// Per-component `/Decode` ranges, or `None` when absent or the identity.
fn decode_ranges(dict: &Dictionary, components: usize) -> Option<Vec<(f32, f32)>> {
    let Ok(Object::Array(arr)) = dict.get(b"Decode") else {
        return None;
    };
    let values: Vec<f32> = arr.iter().filter_map(|v| v.as_float().ok()).collect();
    if values.len() != components * 2 {
        return None;
    }
    let ranges: Vec<(f32, f32)> = values.chunks_exact(2).map(|r| (r[0], r[1])).collect();
    if ranges.iter().all(|&(min, max)| min == 0.0 && max == 1.0) {
        return None;
    }
    Some(ranges)
}

/// Map 8-bit interleaved samples through their component's decode range.
fn apply_decode(samples: &mut [u8], ranges: &[(f32, f32)]) {
    let tables: Vec<[u8; 256]> = ranges
        .iter()
        .map(|&(min, max)| {
            let mut table = [0u8; 256];
            for (sample, out) in table.iter_mut().enumerate() {
                let value = min + sample as f32 * (max - min) / 255.0;
                *out = (value.clamp(0.0, 1.0) * 255.0).round() as u8;
            }
            table
        })
        .collect();

    for pixel in samples.chunks_exact_mut(ranges.len()) {
        for (sample, table) in pixel.iter_mut().zip(&tables) {
            *sample = table[*sample as usize];
        }
    }
}

/// Stream content with any Flate compression removed.
pub(crate) fn stream_bytes(stream: &Stream) -> Result<Vec<u8>, String> {
    match filter_names(&stream.dict).as_slice() {
        [] => Ok(stream.content.clone()),
        [filter] if filter == "FlateDecode" => {
            if let Ok(Object::Dictionary(parms)) = stream.dict.get(b"DecodeParms") {
                if let Some(predictor) = integer(parms, b"Predictor").filter(|p| *p > 1) {
                    return Err(format!("Unsupported predictor: {}", predictor));
                }
            }
            let mut decoder = ZlibDecoder::new(&stream.content[..]);
            let mut decoded = Vec::new();
            decoder
                .read_to_end(&mut decoded)
                .map_err(|e| e.to_string())?;
            Ok(decoded)
        }
        other => Err(format!("Unsupported filter: {:?}", other)),
    }
}

fn gray_to_rgb(samples: &[u8], pixels: usize) -> Result<Vec<u8>, String> {
    let gray = samples.get(..pixels).ok_or_else(|| {
        format!("grayscale data too short: {} bytes for {} pixels", samples.len(), pixels)
    })?;
    Ok(gray.iter().flat_map(|&g| [g, g, g]).collect())
}

fn cmyk_to_rgb(samples: &[u8], pixels: usize) -> Result<Vec<u8>, String> {
    let expected_size = pixels.checked_mul(4).ok_or("image dimensions overflow")?;
    let cmyk = samples.get(..expected_size).ok_or_else(|| {
        format!("CMYK data too short: {} bytes (expected {})", samples.len(), expected_size)
    })?;

    let mut rgb_data = Vec::with_capacity(pixels * 3);
    for chunk in cmyk.chunks_exact(4) {
        let c = chunk[0] as f32 / 255.0;
        let m = chunk[1] as f32 / 255.0;
        let y = chunk[2] as f32 / 255.0;
        let k = chunk[3] as f32 / 255.0;

        rgb_data.push(((1.0 - c) * (1.0 - k) * 255.0).round() as u8);
        rgb_data.push(((1.0 - m) * (1.0 - k) * 255.0).round() as u8);
        rgb_data.push(((1.0 - y) * (1.0 - k) * 255.0).round() as u8);
    }
    Ok(rgb_data)
}

fn merge_alpha(rgb: &[u8], alpha: &[u8]) -> Result<Vec<u8>, String> {
    if rgb.len() < alpha.len() * 3 {
        return Err(format!(
            "RGB data too short for SMask: {} bytes (expected {})",
            rgb.len(),
            alpha.len() * 3
        ));
    }
    let mut rgba_data = Vec::with_capacity(alpha.len() * 4);
    for (pixel, a) in rgb.chunks_exact(3).zip(alpha) {
        rgba_data.extend_from_slice(pixel);
        rgba_data.push(*a);
    }
    Ok(rgba_data)
}
