//! Structural compression: deduplicate, garbage-collect, deflate and write.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fs::File;
use std::hash::{Hash, Hasher};
use std::io::{BufWriter, Write};
use std::path::Path;

use log::debug;
use lopdf::{Document, Object, ObjectId};

use crate::error::{CompressError, Result};

/// Switches of the structural pass. All on by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StructuralOptions {
    /// Drop objects unreachable from the trailer
    pub collect_garbage: bool,
    /// Flate-compress every stream that has no filter yet
    pub deflate: bool,
    /// Merge identical streams and drop empty ones
    pub clean: bool,
}

impl Default for StructuralOptions {
    fn default() -> Self {
        Self {
            collect_garbage: true,
            deflate: true,
            clean: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RewriteStats {
    pub deduplicated: usize,
    pub empty_streams_removed: usize,
    pub pruned: usize,
}

fn remap_references(obj: &mut Object, map: &HashMap<ObjectId, ObjectId>) {
    match obj {
        Object::Reference(id) => {
            if let Some(canonical) = map.get(id) {
                *id = *canonical;
            }
        }
        Object::Array(items) => {
            for item in items.iter_mut() {
                remap_references(item, map);
            }
        }
        Object::Dictionary(dict) => {
            for (_, value) in dict.iter_mut() {
                remap_references(value, map);
            }
        }
        Object::Stream(stream) => {
            for (_, value) in stream.dict.iter_mut() {
                remap_references(value, map);
            }
        }
        _ => {}
    }
}

/// Point every reference to a byte-identical stream at one surviving copy.
fn deduplicate_streams(doc: &mut Document) -> usize {
    let mut buckets: HashMap<(u64, usize, String), Vec<ObjectId>> = HashMap::new();
    let mut duplicates: HashMap<ObjectId, ObjectId> = HashMap::new();

    for (id, object) in doc.objects.iter() {
        let Object::Stream(stream) = object else {
            continue;
        };
        let mut hasher = DefaultHasher::new();
        stream.content.hash(&mut hasher);
        let key = (
            hasher.finish(),
            stream.content.len(),
            format!("{:?}", stream.dict),
        );

        let bucket = buckets.entry(key).or_default();
        let same = bucket.iter().copied().find(|existing| {
            matches!(doc.objects.get(existing), Some(Object::Stream(s)) if s.content == stream.content)
        });
        match same {
            Some(canonical) => {
                duplicates.insert(*id, canonical);
            }
            None => bucket.push(*id),
        }
    }

    if duplicates.is_empty() {
        return 0;
    }

    for object in doc.objects.values_mut() {
        remap_references(object, &duplicates);
    }
    for (_, value) in doc.trailer.iter_mut() {
        remap_references(value, &duplicates);
    }
    for id in duplicates.keys() {
        doc.objects.remove(id);
    }

    duplicates.len()
}

/// Apply the structural pass to `doc` in memory.
pub fn restructure(doc: &mut Document, options: &StructuralOptions) -> RewriteStats {
    let mut stats = RewriteStats::default();

    if options.clean {
        stats.deduplicated = deduplicate_streams(doc);
        stats.empty_streams_removed = doc.delete_zero_length_streams().len();
    }
    if options.collect_garbage {
        stats.pruned = doc.prune_objects().len();
    }
    if options.deflate {
        doc.compress();
    }
    doc.renumber_objects();

    debug!(
        "Structural pass: {} duplicate streams merged, {} empty streams and {} unreachable objects removed",
        stats.deduplicated, stats.empty_streams_removed, stats.pruned
    );
    stats
}

/// Restructure `doc` and write it to `path`. Returns the written size.
pub fn serialize(doc: &mut Document, path: &Path, options: &StructuralOptions) -> Result<u64> {
    restructure(doc, options);

    let file = File::create(path).map_err(|e| CompressError::io(path, e))?;
    let mut writer = BufWriter::new(file);
    doc.save_to(&mut writer)
        .map_err(|source| CompressError::DocumentWrite {
            path: path.to_path_buf(),
            source,
        })?;
    writer.flush().map_err(|e| CompressError::io(path, e))?;
    drop(writer);

    let size = std::fs::metadata(path)
        .map_err(|e| CompressError::io(path, e))?
        .len();
    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lopdf::{dictionary, Stream};

    fn doc_with_shared_content() -> (Document, ObjectId, ObjectId) {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let content = b"BT /F1 12 Tf 72 720 Td (same page) Tj ET ".repeat(40);
        let first = doc.add_object(Stream::new(dictionary! {}, content.clone()));
        let second = doc.add_object(Stream::new(dictionary! {}, content));
        let page_a = doc.add_object(dictionary! { "Type" => "Page", "Parent" => pages_id, "Contents" => first });
        let page_b = doc.add_object(dictionary! { "Type" => "Page", "Parent" => pages_id, "Contents" => second });
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => vec![page_a.into(), page_b.into()],
                "Count" => 2,
            }),
        );
        let catalog_id = doc.add_object(dictionary! { "Type" => "Catalog", "Pages" => pages_id });
        doc.trailer.set("Root", catalog_id);
        (doc, first, second)
    }

    #[test]
    fn merges_identical_streams() {
        let (mut doc, first, second) = doc_with_shared_content();
        let before = doc.objects.len();

        assert_eq!(deduplicate_streams(&mut doc), 1);
        assert_eq!(doc.objects.len(), before - 1);
        assert!(doc.objects.contains_key(&first) != doc.objects.contains_key(&second));
        assert_eq!(doc.get_pages().len(), 2);
    }

    #[test]
    fn drops_unreachable_objects_and_deflates() {
        let (mut doc, _, _) = doc_with_shared_content();
        doc.add_object(Stream::new(dictionary! {}, b"orphan".repeat(100)));

        let stats = restructure(&mut doc, &StructuralOptions::default());

        assert_eq!(stats.deduplicated, 1);
        assert!(stats.pruned >= 1);
        let flated = doc.objects.values().any(|o| {
            matches!(o, Object::Stream(s) if s.dict.get(b"Filter").is_ok())
        });
        assert!(flated);
    }

    #[test]
    fn serialize_writes_a_smaller_file() {
        let (mut plain, _, _) = doc_with_shared_content();
        let mut raw = Vec::new();
        plain.save_to(&mut raw).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.pdf");
        let (mut doc, _, _) = doc_with_shared_content();
        let size = serialize(&mut doc, &path, &StructuralOptions::default()).unwrap();

        assert_eq!(size, std::fs::metadata(&path).unwrap().len());
        assert!(size < raw.len() as u64);
        assert_eq!(Document::load(&path).unwrap().get_pages().len(), 2);
    }

    #[test]
    fn serialize_reports_unwritable_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("out.pdf");
        let (mut doc, _, _) = doc_with_shared_content();

        let err = serialize(&mut doc, &path, &StructuralOptions::default()).unwrap_err();

        assert!(matches!(err, CompressError::Io { .. }));
        assert!(!path.exists());
    }
}
