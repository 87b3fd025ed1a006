//! Thin helpers over `lopdf` shared by the analyzer, recompressor and validator.

use std::collections::HashSet;
use std::io::Read;

use flate2::read::ZlibDecoder;
use log::{debug, warn};
use lopdf::{Dictionary, Document, Object, ObjectId, Stream};

use crate::error::{CompressError, ImageError, Result};

/// Parse a document from memory, trying the empty password on encrypted files.
pub fn open_document(bytes: &[u8]) -> Result<Document> {
    let mut doc = Document::load_mem(bytes).map_err(CompressError::DocumentOpen)?;

    if doc.is_encrypted() {
        debug!("Document is encrypted, trying the empty password");
        if let Err(e) = doc.decrypt(b"") {
            warn!("Failed to decrypt with empty password: {:?}", e);
        }
    }

    Ok(doc)
}

pub(crate) fn resolve<'a>(doc: &'a Document, obj: &'a Object) -> Option<&'a Object> {
    match obj {
        Object::Reference(id) => doc.get_object(*id).ok(),
        _ => Some(obj),
    }
}

fn resolve_dict<'a>(doc: &'a Document, obj: &'a Object) -> Option<&'a Dictionary> {
    match resolve(doc, obj)? {
        Object::Dictionary(d) => Some(d),
        Object::Stream(s) => Some(&s.dict),
        _ => None,
    }
}

pub(crate) fn int_entry(dict: &Dictionary, key: &[u8]) -> Option<i64> {
    match dict.get(key).ok()? {
        Object::Integer(n) => Some(*n),
        Object::Real(n) => Some(*n as i64),
        _ => None,
    }
}

pub(crate) fn name_entry<'a>(dict: &'a Dictionary, key: &[u8]) -> Option<&'a [u8]> {
    match dict.get(key).ok()? {
        Object::Name(n) => Some(n.as_slice()),
        _ => None,
    }
}

/// Filter chain of a stream, outermost first.
pub(crate) fn filters(stream: &Stream) -> Vec<Vec<u8>> {
    match stream.dict.get(b"Filter") {
        Ok(Object::Name(n)) => vec![n.clone()],
        Ok(Object::Array(arr)) => arr
            .iter()
            .filter_map(|f| match f {
                Object::Name(n) => Some(n.clone()),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

pub(crate) fn is_image_stream(stream: &Stream) -> bool {
    name_entry(&stream.dict, b"Subtype") == Some(b"Image".as_slice())
}

/// Decoded bytes of a non-JPEG stream.
///
/// lopdf handles predictors and filter chains; when it gives up on a plain
/// FlateDecode stream we inflate it ourselves, since some writers emit streams
/// lopdf rejects but zlib reads fine.
pub(crate) fn decode_stream_data(stream: &Stream) -> Result<Vec<u8>, ImageError> {
    let chain = filters(stream);
    if chain.is_empty() {
        return Ok(stream.content.clone());
    }

    match stream.decompressed_content() {
        Ok(c) => Ok(c),
        Err(e) => {
            if chain.len() == 1 && chain[0] == b"FlateDecode" {
                let mut decoder = ZlibDecoder::new(&stream.content[..]);
                let mut buffer = Vec::new();
                decoder
                    .read_to_end(&mut buffer)
                    .map_err(|e| ImageError::Decode(format!("manual zlib failed: {}", e)))?;
                Ok(buffer)
            } else {
                Err(ImageError::Decode(format!("decompression failed: {:?}", e)))
            }
        }
    }
}

fn page_resources(doc: &Document, page_id: ObjectId) -> Option<&Object> {
    let mut current = doc.get_object(page_id).ok()?;
    let mut seen = HashSet::new();

    // Resources are inheritable, so walk up the page tree.
    loop {
        let dict = match current {
            Object::Dictionary(d) => d,
            _ => return None,
        };
        if let Ok(resources) = dict.get(b"Resources") {
            return Some(resources);
        }
        match dict.get(b"Parent") {
            Ok(Object::Reference(parent_id)) if seen.insert(*parent_id) => {
                current = doc.get_object(*parent_id).ok()?;
            }
            _ => return None,
        }
    }
}

fn xobject_ids(doc: &Document, resources: &Object) -> Vec<ObjectId> {
    let Some(res_dict) = resolve_dict(doc, resources) else {
        return Vec::new();
    };
    let Some(xobj_dict) = res_dict
        .get(b"XObject")
        .ok()
        .and_then(|x| resolve_dict(doc, x))
    else {
        return Vec::new();
    };

    xobj_dict
        .iter()
        .filter_map(|(_, value)| match value {
            Object::Reference(id) => Some(*id),
            _ => None,
        })
        .collect()
}

fn collect_images_recursive(
    doc: &Document,
    obj_id: ObjectId,
    images: &mut Vec<ObjectId>,
    seen: &mut HashSet<ObjectId>,
) {
    if !seen.insert(obj_id) {
        return;
    }

    let stream = match doc.get_object(obj_id) {
        Ok(Object::Stream(s)) => s,
        _ => return,
    };

    match name_entry(&stream.dict, b"Subtype") {
        Some(b"Image") => images.push(obj_id),
        Some(b"Form") => {
            if let Ok(res) = stream.dict.get(b"Resources") {
                for child_id in xobject_ids(doc, res) {
                    collect_images_recursive(doc, child_id, images, seen);
                }
            }
        }
        _ => {}
    }
}

/// Image XObjects drawn by one page, including those inside Form XObjects.
pub fn page_image_ids(doc: &Document, page_id: ObjectId) -> Vec<ObjectId> {
    let mut images = Vec::new();
    let mut seen = HashSet::new();

    if let Some(resources) = page_resources(doc, page_id) {
        for obj_id in xobject_ids(doc, resources) {
            collect_images_recursive(doc, obj_id, &mut images, &mut seen);
        }
    }

    images
}

/// Every image referenced by any page, in page order, each id once.
pub fn document_image_ids(doc: &Document) -> Vec<ObjectId> {
    let mut seen = HashSet::new();
    let mut ordered = Vec::new();

    for (_, page_id) in doc.get_pages() {
        for id in page_image_ids(doc, page_id) {
            if seen.insert(id) {
                ordered.push(id);
            }
        }
    }

    ordered
}

/// Ids of images that serve as another image's soft mask.
pub(crate) fn soft_mask_ids(doc: &Document) -> HashSet<ObjectId> {
    doc.objects
        .values()
        .filter_map(|object| match object {
            Object::Stream(stream) if is_image_stream(stream) => {
                match stream.dict.get(b"SMask") {
                    Ok(Object::Reference(id)) => Some(*id),
                    _ => None,
                }
            }
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::ZlibEncoder;
    use flate2::Compression;
    use lopdf::dictionary;
    use std::io::Write;

    fn deflate(data: &[u8]) -> Vec<u8> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn decodes_flate_and_raw_streams() {
        let raw = vec![7u8; 300];
        let plain = Stream::new(dictionary! {}, raw.clone());
        assert_eq!(decode_stream_data(&plain).unwrap(), raw);

        let flated = Stream::new(dictionary! { "Filter" => "FlateDecode" }, deflate(&raw));
        assert_eq!(decode_stream_data(&flated).unwrap(), raw);
    }

    #[test]
    fn reads_filter_chains() {
        let stream = Stream::new(
            dictionary! { "Filter" => vec![Object::Name(b"FlateDecode".to_vec()), Object::Name(b"DCTDecode".to_vec())] },
            Vec::new(),
        );
        assert_eq!(
            filters(&stream),
            vec![b"FlateDecode".to_vec(), b"DCTDecode".to_vec()]
        );
    }

    #[test]
    fn finds_images_through_forms_and_inherited_resources() {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let image_dict = dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "Width" => 2,
            "Height" => 2,
        };
        let image_id = doc.add_object(Stream::new(image_dict, vec![0; 12]));
        let form_id = doc.add_object(Stream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Form",
                "Resources" => dictionary! { "XObject" => dictionary! { "Im0" => image_id } },
            },
            b"/Im0 Do".to_vec(),
        ));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
        });
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => vec![page_id.into()],
                "Count" => 1,
                "Resources" => dictionary! { "XObject" => dictionary! { "Fm0" => form_id } },
            }),
        );
        let catalog_id = doc.add_object(dictionary! { "Type" => "Catalog", "Pages" => pages_id });
        doc.trailer.set("Root", catalog_id);

        assert_eq!(page_image_ids(&doc, page_id), vec![image_id]);
        assert_eq!(document_image_ids(&doc), vec![image_id]);
    }
}
