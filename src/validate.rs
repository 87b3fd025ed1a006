//! Acceptance checks for candidate files produced by a tier attempt.

use std::collections::HashSet;
use std::path::Path;

use lopdf::{Document, Object, ObjectId};

use crate::error::ValidationFailure;
use crate::pdf::{int_entry, name_entry};

pub const PDF_MAGIC: &[u8] = b"%PDF-";

/// Decides whether a candidate file may be promoted.
pub trait AttemptValidator: Send + Sync {
    fn validate(&self, candidate: &Path, expected_pages: usize) -> Result<(), ValidationFailure>;

    fn is_valid(&self, candidate: &Path, expected_pages: usize) -> bool {
        self.validate(candidate, expected_pages).is_ok()
    }
}

/// Default validator: size floor, header magic, and a page count taken by
/// walking the page tree of a fresh parse of the file on disk.
#[derive(Debug, Clone, Copy)]
pub struct PdfValidator {
    pub min_size_bytes: u64,
}

impl Default for PdfValidator {
    fn default() -> Self {
        Self {
            min_size_bytes: 100,
        }
    }
}

impl AttemptValidator for PdfValidator {
    fn validate(&self, candidate: &Path, expected_pages: usize) -> Result<(), ValidationFailure> {
        if !candidate.is_file() {
            return Err(ValidationFailure::Missing);
        }
        let bytes =
            std::fs::read(candidate).map_err(|e| ValidationFailure::Unreadable(e.to_string()))?;
        if (bytes.len() as u64) < self.min_size_bytes {
            return Err(ValidationFailure::TooSmall(bytes.len() as u64));
        }
        if !bytes.starts_with(PDF_MAGIC) {
            return Err(ValidationFailure::BadHeader);
        }

        let doc = Document::load_mem(&bytes)
            .map_err(|e| ValidationFailure::Unreadable(e.to_string()))?;
        let found = count_pages(&doc)?;
        if found != expected_pages {
            return Err(ValidationFailure::PageCountMismatch {
                expected: expected_pages,
                found,
            });
        }

        Ok(())
    }
}

fn walk_page_tree(
    doc: &Document,
    node_id: ObjectId,
    seen: &mut HashSet<ObjectId>,
) -> Result<usize, ValidationFailure> {
    if !seen.insert(node_id) {
        return Err(ValidationFailure::Unreadable(format!(
            "page tree revisits {:?}",
            node_id
        )));
    }
    let node = match doc.get_object(node_id) {
        Ok(Object::Dictionary(d)) => d,
        _ => {
            return Err(ValidationFailure::Unreadable(format!(
                "page tree node {:?} is missing",
                node_id
            )))
        }
    };

    let kids = match node.get(b"Kids") {
        Ok(Object::Array(kids)) => Some(kids),
        Ok(Object::Reference(id)) => match doc.get_object(*id) {
            Ok(Object::Array(kids)) => Some(kids),
            _ => None,
        },
        _ => None,
    };

    match (name_entry(node, b"Type"), kids) {
        (Some(b"Page"), _) | (None, None) => Ok(1),
        (_, Some(kids)) => {
            let mut total = 0;
            for kid in kids {
                match kid {
                    Object::Reference(id) => total += walk_page_tree(doc, *id, seen)?,
                    _ => {
                        return Err(ValidationFailure::Unreadable(
                            "page tree kid is not a reference".to_string(),
                        ))
                    }
                }
            }
            Ok(total)
        }
        (_, None) => Err(ValidationFailure::Unreadable(format!(
            "page tree node {:?} has no kids",
            node_id
        ))),
    }
}

/// Count leaf pages from the trailer's `/Root`, independently of
/// `Document::get_pages`. A root `/Count` that disagrees is an error.
pub fn count_pages(doc: &Document) -> Result<usize, ValidationFailure> {
    let unreadable = |msg: &str| ValidationFailure::Unreadable(msg.to_string());

    let catalog_id = match doc.trailer.get(b"Root") {
        Ok(Object::Reference(id)) => *id,
        _ => return Err(unreadable("trailer has no /Root")),
    };
    let pages_id = match doc.get_object(catalog_id) {
        Ok(Object::Dictionary(catalog)) => match catalog.get(b"Pages") {
            Ok(Object::Reference(id)) => *id,
            _ => return Err(unreadable("catalog has no /Pages")),
        },
        _ => return Err(unreadable("catalog is missing")),
    };

    let mut seen = HashSet::new();
    let leaves = walk_page_tree(doc, pages_id, &mut seen)?;

    if let Ok(Object::Dictionary(root)) = doc.get_object(pages_id) {
        if let Some(count) = int_entry(root, b"Count") {
            if count != leaves as i64 {
                return Err(ValidationFailure::Unreadable(format!(
                    "page tree claims {} pages but holds {}",
                    count, leaves
                )));
            }
        }
    }

    Ok(leaves)
}
