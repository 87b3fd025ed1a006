//! Re-encode the embedded images of a document for one compression tier.
//!
//! Decoding, resampling and encoding run on the rayon pool against a snapshot
//! of each image stream. The results are written back into the document one at
//! a time afterwards, in document order, so the object table only ever has a
//! single writer.

use std::collections::HashSet;

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{ColorType, DynamicImage, GenericImageView, GrayImage, ImageFormat, RgbImage};
use log::{debug, info};
use lopdf::{Dictionary, Document, Object, ObjectId, Stream};
use rayon::prelude::*;

use crate::error::ImageError;
use crate::pdf::{
    decode_stream_data, document_image_ids, filters, int_entry, resolve, soft_mask_ids,
};
use crate::policy::{CompressionPolicy, CompressionTier, Interrupt};

/// Why an image was left alone without trying to re-encode it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    SoftMask,
    StencilMask,
    MissingDimensions,
    Icon { width: u32, height: u32 },
    /// Small enough already and within the tier's cap
    AlreadyCompact,
    /// JPEG source within the tier's cap
    AlreadyJpeg,
    Cancelled,
}

#[derive(Debug)]
pub enum ImageOutcome {
    Replaced {
        original_bytes: usize,
        new_bytes: usize,
        resized: bool,
    },
    /// Re-encoding did not pay off and no resize was needed
    Kept {
        original_bytes: usize,
        encoded_bytes: usize,
    },
    Skipped(SkipReason),
    Failed(ImageError),
}

/// Per-attempt counts of what happened to each image.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecompressSummary {
    pub total: usize,
    pub replaced: usize,
    pub resized: usize,
    pub kept: usize,
    pub skipped: usize,
    /// Images left alone because the run was cancelled or timed out
    pub cancelled: usize,
    pub failed: usize,
    /// Stream bytes saved by replacements (negative when forced resizes grew a stream)
    pub bytes_saved: i64,
    pub failures: Vec<(ObjectId, String)>,
}

impl RecompressSummary {
    fn record(&mut self, id: ObjectId, outcome: &ImageOutcome) {
        self.total += 1;
        match outcome {
            ImageOutcome::Replaced {
                original_bytes,
                new_bytes,
                resized,
            } => {
                self.replaced += 1;
                if *resized {
                    self.resized += 1;
                }
                self.bytes_saved += *original_bytes as i64 - *new_bytes as i64;
            }
            ImageOutcome::Kept { .. } => self.kept += 1,
            ImageOutcome::Skipped(reason) => {
                self.skipped += 1;
                if *reason == SkipReason::Cancelled {
                    self.cancelled += 1;
                }
            }
            ImageOutcome::Failed(e) => {
                self.failed += 1;
                self.failures.push((id, e.to_string()));
            }
        }
    }
}

/// Colour model of a raw (non-JPEG) image stream, with references resolved.
#[derive(Debug, Clone, PartialEq)]
enum ColorModel {
    Gray,
    Rgb,
    Cmyk,
    Indexed {
        base: Box<ColorModel>,
        hival: usize,
        lookup: Vec<u8>,
    },
    Unknown(String),
}

impl ColorModel {
    fn components(&self) -> usize {
        match self {
            ColorModel::Gray | ColorModel::Indexed { .. } => 1,
            ColorModel::Rgb => 3,
            ColorModel::Cmyk => 4,
            ColorModel::Unknown(_) => 0,
        }
    }

    fn from_object(doc: &Document, obj: &Object, depth: usize) -> ColorModel {
        if depth > 4 {
            return ColorModel::Unknown("colour space nests too deep".to_string());
        }
        let Some(obj) = resolve(doc, obj) else {
            return ColorModel::Unknown("dangling colour space".to_string());
        };

        match obj {
            Object::Name(name) => Self::from_family(name),
            Object::Array(arr) => {
                let family = match arr.first() {
                    Some(Object::Name(n)) => n.as_slice(),
                    _ => return ColorModel::Unknown("unnamed colour space".to_string()),
                };
                match family {
                    b"ICCBased" => {
                        let components = arr
                            .get(1)
                            .and_then(|o| resolve(doc, o))
                            .and_then(|o| match o {
                                Object::Stream(s) => int_entry(&s.dict, b"N"),
                                _ => None,
                            });
                        match components {
                            Some(1) => ColorModel::Gray,
                            Some(3) => ColorModel::Rgb,
                            Some(4) => ColorModel::Cmyk,
                            other => ColorModel::Unknown(format!("ICCBased with N={:?}", other)),
                        }
                    }
                    b"Indexed" | b"I" => Self::indexed(doc, arr, depth),
                    _ => Self::from_family(family),
                }
            }
            _ => ColorModel::Unknown("malformed colour space".to_string()),
        }
    }

    fn from_family(name: &[u8]) -> ColorModel {
        match name {
            b"DeviceGray" | b"CalGray" | b"G" => ColorModel::Gray,
            b"DeviceRGB" | b"CalRGB" | b"RGB" => ColorModel::Rgb,
            b"DeviceCMYK" | b"CMYK" => ColorModel::Cmyk,
            other => ColorModel::Unknown(String::from_utf8_lossy(other).to_string()),
        }
    }

    fn indexed(doc: &Document, arr: &[Object], depth: usize) -> ColorModel {
        if arr.len() < 4 {
            return ColorModel::Unknown("short Indexed array".to_string());
        }
        let base = Self::from_object(doc, &arr[1], depth + 1);
        if matches!(base, ColorModel::Indexed { .. } | ColorModel::Unknown(_)) {
            return ColorModel::Unknown(format!("Indexed over {:?}", base));
        }
        let hival = match resolve(doc, &arr[2]) {
            Some(Object::Integer(n)) if (0..=255).contains(n) => *n as usize,
            _ => return ColorModel::Unknown("bad Indexed hival".to_string()),
        };
        let lookup = match resolve(doc, &arr[3]) {
            Some(Object::String(bytes, _)) => bytes.clone(),
            Some(Object::Stream(s)) => match decode_stream_data(s) {
                Ok(bytes) => bytes,
                Err(e) => return ColorModel::Unknown(format!("Indexed lookup: {}", e)),
            },
            _ => return ColorModel::Unknown("missing Indexed lookup".to_string()),
        };
        if lookup.len() < (hival + 1) * base.components() {
            return ColorModel::Unknown("Indexed lookup too short".to_string());
        }

        ColorModel::Indexed {
            base: Box::new(base),
            hival,
            lookup,
        }
    }
}

/// Snapshot of one image taken before the parallel phase.
struct ImageSource {
    id: ObjectId,
    stream: Stream,
    color: Option<ColorModel>,
    is_soft_mask: bool,
}

fn cmyk_to_rgb(cmyk: &[u8]) -> [u8; 3] {
    let c = cmyk[0] as f32 / 255.0;
    let m = cmyk[1] as f32 / 255.0;
    let y = cmyk[2] as f32 / 255.0;
    let k = cmyk[3] as f32 / 255.0;

    [
        ((1.0 - c) * (1.0 - k) * 255.0) as u8,
        ((1.0 - m) * (1.0 - k) * 255.0) as u8,
        ((1.0 - y) * (1.0 - k) * 255.0) as u8,
    ]
}

fn raw_to_image(
    data: &[u8],
    width: u32,
    height: u32,
    color: &ColorModel,
) -> Result<DynamicImage, ImageError> {
    let pixels = width as usize * height as usize;
    let components = color.components();
    if components == 0 {
        return Err(ImageError::Unsupported(format!("colour space {:?}", color)));
    }
    let expected = pixels * components;
    if data.len() < expected {
        return Err(ImageError::Decode(format!(
            "{} bytes of samples, expected {}",
            data.len(),
            expected
        )));
    }
    let data = &data[..expected];

    let image = match color {
        ColorModel::Gray => GrayImage::from_raw(width, height, data.to_vec()).map(DynamicImage::ImageLuma8),
        ColorModel::Rgb => RgbImage::from_raw(width, height, data.to_vec()).map(DynamicImage::ImageRgb8),
        ColorModel::Cmyk => {
            let rgb = data.chunks(4).flat_map(cmyk_to_rgb).collect();
            RgbImage::from_raw(width, height, rgb).map(DynamicImage::ImageRgb8)
        }
        ColorModel::Indexed {
            base,
            hival,
            lookup,
        } => {
            let n = base.components();
            let entry = |index: u8| {
                let index = (index as usize).min(*hival);
                &lookup[index * n..index * n + n]
            };
            match base.as_ref() {
                ColorModel::Gray => {
                    let gray = data.iter().map(|&i| entry(i)[0]).collect();
                    GrayImage::from_raw(width, height, gray).map(DynamicImage::ImageLuma8)
                }
                ColorModel::Rgb => {
                    let rgb = data.iter().flat_map(|&i| entry(i).to_vec()).collect();
                    RgbImage::from_raw(width, height, rgb).map(DynamicImage::ImageRgb8)
                }
                ColorModel::Cmyk => {
                    let rgb = data.iter().flat_map(|&i| cmyk_to_rgb(entry(i))).collect();
                    RgbImage::from_raw(width, height, rgb).map(DynamicImage::ImageRgb8)
                }
                other => {
                    return Err(ImageError::Unsupported(format!("Indexed over {:?}", other)))
                }
            }
        }
        ColorModel::Unknown(name) => {
            return Err(ImageError::Unsupported(format!("colour space {}", name)))
        }
    };

    image.ok_or_else(|| ImageError::Decode("sample buffer does not match dimensions".to_string()))
}

/// Numeric entries of `/Decode`, or `None` when the image has no such array.
fn decode_array(dict: &Dictionary) -> Result<Option<Vec<f64>>, ImageError> {
    let Ok(Object::Array(entries)) = dict.get(b"Decode") else {
        return Ok(None);
    };
    entries
        .iter()
        .map(|entry| match entry {
            Object::Integer(n) => Ok(*n as f64),
            Object::Real(r) => Ok(*r as f64),
            _ => Err(ImageError::Unsupported("non-numeric Decode entry".to_string())),
        })
        .collect::<Result<Vec<_>, _>>()
        .map(Some)
}

/// Ranges of a `/Decode` array that actually remaps samples.
///
/// Indexed images decode palette indices over `[0 255]`, everything else
/// decodes component values over `[0 1]`.
fn decode_ranges(dict: &Dictionary, color: &ColorModel) -> Result<Option<Vec<f64>>, ImageError> {
    let Some(values) = decode_array(dict)? else {
        return Ok(None);
    };
    let components = color.components();
    if components == 0 || values.len() != 2 * components {
        return Err(ImageError::Unsupported(format!(
            "Decode array of {} entries",
            values.len()
        )));
    }
    let max = if matches!(color, ColorModel::Indexed { .. }) {
        255.0
    } else {
        1.0
    };
    let identity = values.chunks(2).all(|pair| pair[0] == 0.0 && pair[1] == max);
    Ok((!identity).then_some(values))
}

/// Map 8-bit samples through `ranges` so the bytes carry the decoded values.
fn apply_decode(samples: &mut [u8], ranges: &[f64], indexed: bool) {
    let components = ranges.len() / 2;
    let scale = if indexed { 1.0 } else { 255.0 };
    for (i, sample) in samples.iter_mut().enumerate() {
        let c = i % components;
        let (lo, hi) = (ranges[2 * c], ranges[2 * c + 1]);
        let value = lo + (*sample as f64 / 255.0) * (hi - lo);
        *sample = (value * scale).round().clamp(0.0, 255.0) as u8;
    }
}

fn decode_image(source: &ImageSource, width: u32, height: u32) -> Result<DynamicImage, ImageError> {
    let stream = &source.stream;
    let chain = filters(stream);

    match chain.last().map(Vec::as_slice) {
        Some(b"DCTDecode") | Some(b"DCT") => {
            if chain.len() > 1 {
                return Err(ImageError::Unsupported("filters ahead of DCTDecode".to_string()));
            }
            let remapped = decode_array(&stream.dict)?
                .is_some_and(|values| values.chunks(2).any(|pair| !(pair[0] == 0.0 && pair[1] == 1.0)));
            if remapped {
                return Err(ImageError::Unsupported("JPEG with a Decode array".to_string()));
            }
            image::load_from_memory_with_format(&stream.content, ImageFormat::Jpeg)
                .map_err(|e| ImageError::Decode(format!("JPEG: {}", e)))
        }
        Some(b"JPXDecode") => Err(ImageError::Unsupported("JPEG 2000".to_string())),
        Some(b"JBIG2Decode") | Some(b"CCITTFaxDecode") => {
            Err(ImageError::Unsupported("bilevel codec".to_string()))
        }
        _ => {
            let bits = int_entry(&stream.dict, b"BitsPerComponent").unwrap_or(8);
            if bits != 8 {
                return Err(ImageError::Unsupported(format!("{} bits per component", bits)));
            }
            let color = source
                .color
                .clone()
                .unwrap_or_else(|| ColorModel::Unknown("no colour space".to_string()));
            let mut data = decode_stream_data(stream)?;
            if let Some(ranges) = decode_ranges(&stream.dict, &color)? {
                apply_decode(&mut data, &ranges, matches!(color, ColorModel::Indexed { .. }));
            }
            raw_to_image(&data, width, height, &color)
        }
    }
}

/// JPEG bytes of `img`, single channel for gray sources and RGB otherwise.
fn encode_jpeg(img: &DynamicImage, quality: u8) -> Result<(Vec<u8>, bool), ImageError> {
    let (w, h) = img.dimensions();
    let mut buffer = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut buffer, quality);

    let gray = matches!(img, DynamicImage::ImageLuma8(_) | DynamicImage::ImageLumaA8(_));
    if gray {
        let luma = img.to_luma8();
        encoder.encode(luma.as_raw(), w, h, ColorType::L8.into())?;
    } else {
        let rgb = img.to_rgb8();
        encoder.encode(rgb.as_raw(), w, h, ColorType::Rgb8.into())?;
    }

    Ok((buffer, gray))
}

fn replacement_stream(original: &Stream, jpeg: Vec<u8>, width: u32, height: u32, gray: bool) -> Stream {
    let mut dict = original.dict.clone();
    let color_space: &[u8] = if gray { b"DeviceGray" } else { b"DeviceRGB" };

    dict.set("Filter", Object::Name(b"DCTDecode".to_vec()));
    dict.set("Width", Object::Integer(width as i64));
    dict.set("Height", Object::Integer(height as i64));
    dict.set("ColorSpace", Object::Name(color_space.to_vec()));
    dict.set("BitsPerComponent", Object::Integer(8));
    dict.remove(b"DecodeParms");
    dict.remove(b"Decode");
    // Colour-key masks name exact sample values, which lossy encoding destroys.
    if let Ok(Object::Array(_)) = dict.get(b"Mask") {
        dict.remove(b"Mask");
    }

    let mut stream = Stream::new(dict, jpeg);
    stream.allows_compression = false;
    stream
}

fn process_image(
    source: &ImageSource,
    tier: &CompressionTier,
    policy: &CompressionPolicy,
    interrupt: &Interrupt,
) -> (ImageOutcome, Option<Stream>) {
    let skip = |reason| (ImageOutcome::Skipped(reason), None);

    if interrupt.is_triggered() {
        return skip(SkipReason::Cancelled);
    }
    if source.is_soft_mask {
        return skip(SkipReason::SoftMask);
    }
    let dict = &source.stream.dict;
    if let Ok(Object::Boolean(true)) = dict.get(b"ImageMask") {
        return skip(SkipReason::StencilMask);
    }

    let (width, height) = match (int_entry(dict, b"Width"), int_entry(dict, b"Height")) {
        (Some(w), Some(h)) if w > 0 && h > 0 => (w as u32, h as u32),
        _ => return skip(SkipReason::MissingDimensions),
    };
    if width < policy.min_image_side || height < policy.min_image_side {
        return skip(SkipReason::Icon { width, height });
    }

    let original_bytes = source.stream.content.len();
    let cap = tier.max_dimension(policy.reference_pixels);
    let needs_resize = width > cap || height > cap;
    let is_jpeg = matches!(
        filters(&source.stream).last().map(Vec::as_slice),
        Some(b"DCTDecode") | Some(b"DCT")
    );

    if !needs_resize {
        if original_bytes < policy.min_recompress_bytes {
            return skip(SkipReason::AlreadyCompact);
        }
        if is_jpeg && policy.keep_jpeg_within_cap {
            return skip(SkipReason::AlreadyJpeg);
        }
    }

    let img = match decode_image(source, width, height) {
        Ok(img) => img,
        Err(e) => return (ImageOutcome::Failed(e), None),
    };

    let img = if needs_resize {
        img.resize(cap, cap, FilterType::Lanczos3)
    } else {
        img
    };

    let (jpeg, gray) = match encode_jpeg(&img, tier.quality) {
        Ok(encoded) => encoded,
        Err(e) => return (ImageOutcome::Failed(e), None),
    };

    let new_bytes = jpeg.len();
    if new_bytes < original_bytes || needs_resize {
        let (w, h) = img.dimensions();
        debug!(
            "Image {:?}: {}x{} -> {}x{}, {} -> {} bytes",
            source.id, width, height, w, h, original_bytes, new_bytes
        );
        let stream = replacement_stream(&source.stream, jpeg, w, h, gray);
        (
            ImageOutcome::Replaced {
                original_bytes,
                new_bytes,
                resized: needs_resize,
            },
            Some(stream),
        )
    } else {
        debug!(
            "Image {:?}: keeping original, {} bytes re-encoded would be {}",
            source.id, original_bytes, new_bytes
        );
        (
            ImageOutcome::Kept {
                original_bytes,
                encoded_bytes: new_bytes,
            },
            None,
        )
    }
}

/// Recompress every eligible image of `doc` in place for `tier`.
pub fn recompress(
    doc: &mut Document,
    tier: &CompressionTier,
    policy: &CompressionPolicy,
) -> RecompressSummary {
    recompress_with(doc, tier, policy, &Interrupt::never())
}

pub(crate) fn recompress_with(
    doc: &mut Document,
    tier: &CompressionTier,
    policy: &CompressionPolicy,
    interrupt: &Interrupt,
) -> RecompressSummary {
    let masks: HashSet<ObjectId> = soft_mask_ids(doc);

    let sources: Vec<ImageSource> = document_image_ids(doc)
        .into_iter()
        .filter_map(|id| match doc.get_object(id) {
            Ok(Object::Stream(stream)) => {
                let color = stream
                    .dict
                    .get(b"ColorSpace")
                    .ok()
                    .map(|cs| ColorModel::from_object(doc, cs, 0));
                Some(ImageSource {
                    id,
                    stream: stream.clone(),
                    color,
                    is_soft_mask: masks.contains(&id),
                })
            }
            _ => None,
        })
        .collect();

    let results: Vec<(ImageOutcome, Option<Stream>)> = sources
        .par_iter()
        .map(|source| process_image(source, tier, policy, interrupt))
        .collect();

    let mut summary = RecompressSummary::default();
    for (source, (outcome, replacement)) in sources.iter().zip(results) {
        if let ImageOutcome::Failed(e) = &outcome {
            debug!("Image {:?} left unmodified: {}", source.id, e);
        }
        summary.record(source.id, &outcome);
        if let Some(stream) = replacement {
            doc.objects.insert(source.id, Object::Stream(stream));
        }
    }

    info!(
        "Tier '{}': {} images, {} replaced ({} resized), {} kept, {} skipped, {} failed",
        tier.label,
        summary.total,
        summary.replaced,
        summary.resized,
        summary.kept,
        summary.skipped,
        summary.failed
    );

    summary
}
