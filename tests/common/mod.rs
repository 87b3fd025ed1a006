#![allow(dead_code)]

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use flate2::write::ZlibEncoder;
use flate2::Compression;
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Dictionary, Document, Object, ObjectId, Stream};
use pdf_squeeze::{
    AttemptValidator, CompressionPolicy, FloorFormula, PdfValidator, ValidationFailure, KIB,
};

/// Standard ladder with a 100 px reference budget and a tiny floor, so
/// small fixtures exercise the same decisions as real documents.
pub fn test_policy() -> CompressionPolicy {
    CompressionPolicy {
        reference_pixels: 100,
        floor: FloorFormula {
            base_bytes: 2 * KIB,
            per_page_bytes: KIB,
        },
        min_image_side: 16,
        min_recompress_bytes: 0,
        ..CompressionPolicy::standard()
    }
}

/// Photographic-looking samples: a horizontal gradient with pseudo-random grain.
pub fn noisy_rgb(width: u32, height: u32, seed: u32) -> Vec<u8> {
    let mut state = 0x2545_f491u32 ^ seed.wrapping_mul(0x9e37_79b9);
    (0..width * height * 3)
        .map(|i| {
            state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            ((i / 3 % width) as u8).wrapping_add((state >> 26) as u8)
        })
        .collect()
}

fn deflate(data: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

fn image_stream(width: u32, height: u32, seed: u32) -> Stream {
    Stream::new(
        dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "Width" => width,
            "Height" => height,
            "ColorSpace" => "DeviceRGB",
            "BitsPerComponent" => 8,
            "Filter" => "FlateDecode",
        },
        deflate(&noisy_rgb(width, height, seed)),
    )
}

/// Builds multi-page documents with uncompressed text content and optional
/// Flate-encoded RGB images, image `i` drawn on page `i % pages`.
#[derive(Debug, Clone)]
pub struct FixtureBuilder {
    pages: usize,
    lines_per_page: usize,
    images: Vec<(u32, u32)>,
}

impl FixtureBuilder {
    pub fn new(pages: usize) -> Self {
        Self {
            pages,
            lines_per_page: 20,
            images: Vec::new(),
        }
    }

    pub fn lines_per_page(mut self, lines: usize) -> Self {
        self.lines_per_page = lines;
        self
    }

    pub fn image(mut self, width: u32, height: u32) -> Self {
        self.images.push((width, height));
        self
    }

    pub fn build(&self) -> Document {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Courier",
        });
        let image_ids: Vec<ObjectId> = self
            .images
            .iter()
            .enumerate()
            .map(|(i, &(w, h))| doc.add_object(image_stream(w, h, i as u32)))
            .collect();

        let mut kids: Vec<Object> = Vec::new();
        for page in 0..self.pages {
            let mut operations = vec![
                Operation::new("BT", vec![]),
                Operation::new("Tf", vec!["F1".into(), 10.into()]),
                Operation::new("TL", vec![12.into()]),
                Operation::new("Td", vec![36.into(), 800.into()]),
            ];
            for line in 0..self.lines_per_page {
                let text = format!(
                    "Page {} line {}: the quick brown fox jumps over the lazy dog",
                    page + 1,
                    line + 1
                );
                operations.push(Operation::new("Tj", vec![Object::string_literal(text)]));
                operations.push(Operation::new("T*", vec![]));
            }
            operations.push(Operation::new("ET", vec![]));

            let mut xobjects = Dictionary::new();
            for (i, id) in image_ids.iter().enumerate() {
                if i % self.pages != page {
                    continue;
                }
                let (w, h) = self.images[i];
                let name = format!("Im{}", i);
                operations.push(Operation::new("q", vec![]));
                operations.push(Operation::new(
                    "cm",
                    vec![(w / 2).into(), 0.into(), 0.into(), (h / 2).into(), 36.into(), 36.into()],
                ));
                operations.push(Operation::new("Do", vec![name.as_str().into()]));
                operations.push(Operation::new("Q", vec![]));
                xobjects.set(name, *id);
            }

            let content = Content { operations }.encode().unwrap();
            let content_id = doc.add_object(Stream::new(dictionary! {}, content));
            let page_id = doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "Contents" => content_id,
                "MediaBox" => vec![0.into(), 0.into(), 595.into(), 842.into()],
                "Resources" => dictionary! {
                    "Font" => dictionary! { "F1" => font_id },
                    "XObject" => xobjects,
                },
            });
            kids.push(page_id.into());
        }

        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => self.pages as i64,
            }),
        );
        let catalog_id = doc.add_object(dictionary! { "Type" => "Catalog", "Pages" => pages_id });
        doc.trailer.set("Root", catalog_id);
        doc
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        self.build().save_to(&mut buffer).unwrap();
        buffer
    }

    pub fn write_to(&self, dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, self.to_bytes()).unwrap();
        path
    }
}

pub fn page_count(path: &Path) -> usize {
    Document::load(path).unwrap().get_pages().len()
}

/// (width, height) of every image XObject in the file.
pub fn image_dimensions(path: &Path) -> Vec<(i64, i64)> {
    let doc = Document::load(path).unwrap();
    doc.objects
        .values()
        .filter_map(|object| match object {
            Object::Stream(s)
                if s.dict.get(b"Subtype").and_then(Object::as_name).ok() == Some(&b"Image"[..]) =>
            {
                let w = s.dict.get(b"Width").and_then(Object::as_i64).unwrap();
                let h = s.dict.get(b"Height").and_then(Object::as_i64).unwrap();
                Some((w, h))
            }
            _ => None,
        })
        .collect()
}

/// Rejects the first `failures` candidates, then defers to [`PdfValidator`].
pub struct FlakyValidator {
    remaining: AtomicUsize,
}

impl FlakyValidator {
    pub fn new(failures: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(failures),
        }
    }
}

impl AttemptValidator for FlakyValidator {
    fn validate(&self, candidate: &Path, expected_pages: usize) -> Result<(), ValidationFailure> {
        let rejected = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if rejected {
            return Err(ValidationFailure::Unreadable("simulated corruption".to_string()));
        }
        PdfValidator::default().validate(candidate, expected_pages)
    }
}
