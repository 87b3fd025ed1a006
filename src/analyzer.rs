//! Read-only inspection of a document: pages, images and whether it looks scanned.

use std::path::Path;

use log::debug;
use lopdf::{Document, Object};

use crate::error::{CompressError, Result};
use crate::pdf::{open_document, page_image_ids};
use crate::policy::KIB;

/// What the analyzer learned about a document.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentAnalysis {
    pub page_count: usize,
    /// Image references summed over pages; a shared image counts once per page
    pub image_count: usize,
    /// Raw embedded stream size of every image that could be read
    pub image_sizes_bytes: Vec<u64>,
    /// No page yields any extractable text
    pub is_scanned: bool,
    pub file_size_bytes: u64,
}

impl DocumentAnalysis {
    pub fn total_image_bytes(&self) -> u64 {
        self.image_sizes_bytes.iter().sum()
    }

    /// Rough lower bound on a sane output size for this document.
    pub fn estimated_min_size_bytes(&self) -> u64 {
        let mut min_kb = 50.0 + self.page_count as f64 * 10.0;

        if self.image_count > 0 {
            if self.image_sizes_bytes.is_empty() {
                min_kb += self.image_count as f64 * 50.0;
            } else {
                let avg_kb = self.total_image_bytes() as f64
                    / self.image_sizes_bytes.len() as f64
                    / KIB as f64;
                min_kb += self.image_count as f64 * (avg_kb * 0.1).max(20.0);
            }
        }

        if self.is_scanned {
            min_kb *= 1.5;
        }
        min_kb *= 1.2;

        (min_kb.min(10.0 * 1024.0) * KIB as f64).round() as u64
    }
}

/// Analyze an opened document. Never fails: unreadable images and pages whose
/// text cannot be extracted are simply left out.
pub fn analyze(doc: &Document, file_size_bytes: u64) -> DocumentAnalysis {
    let pages = doc.get_pages();
    let mut image_count = 0;
    let mut image_sizes_bytes = Vec::new();
    let mut is_scanned = true;

    for (page_num, page_id) in pages.iter() {
        match doc.extract_text(&[*page_num]) {
            Ok(text) if !text.trim().is_empty() => is_scanned = false,
            Ok(_) => {}
            Err(e) => debug!("No text on page {}: {:?}", page_num, e),
        }

        let images = page_image_ids(doc, *page_id);
        image_count += images.len();

        for image_id in images {
            match doc.get_object(image_id) {
                Ok(Object::Stream(stream)) => image_sizes_bytes.push(stream.content.len() as u64),
                _ => debug!("Image {:?} on page {} is unreadable", image_id, page_num),
            }
        }
    }

    DocumentAnalysis {
        page_count: pages.len(),
        image_count,
        image_sizes_bytes,
        is_scanned,
        file_size_bytes,
    }
}

/// Open `path` and analyze it.
pub fn analyze_path(path: &Path) -> Result<DocumentAnalysis> {
    let bytes = std::fs::read(path).map_err(|e| CompressError::io(path, e))?;
    let doc = open_document(&bytes)?;
    Ok(analyze(&doc, bytes.len() as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analysis(pages: usize, sizes: Vec<u64>, images: usize, scanned: bool) -> DocumentAnalysis {
        DocumentAnalysis {
            page_count: pages,
            image_count: images,
            image_sizes_bytes: sizes,
            is_scanned: scanned,
            file_size_bytes: 0,
        }
    }

    #[test]
    fn estimate_for_text_only_document() {
        let a = analysis(2, Vec::new(), 0, false);
        // (50 + 20) * 1.2 KiB
        assert_eq!(a.estimated_min_size_bytes(), (84.0 * 1024.0) as u64);
    }

    #[test]
    fn estimate_uses_image_average_with_a_minimum() {
        let a = analysis(1, vec![1000 * KIB, 1000 * KIB], 2, false);
        // (50 + 10 + 2 * 100) * 1.2
        assert_eq!(a.estimated_min_size_bytes(), (312.0 * 1024.0) as u64);

        let small = analysis(1, vec![10 * KIB], 1, false);
        // (50 + 10 + 20) * 1.2
        assert_eq!(small.estimated_min_size_bytes(), (96.0 * 1024.0) as u64);
    }

    #[test]
    fn estimate_is_conservative_for_scans_and_capped() {
        let unknown = analysis(1, Vec::new(), 1, true);
        // (50 + 10 + 50) * 1.5 * 1.2
        assert_eq!(unknown.estimated_min_size_bytes(), (198.0 * 1024.0) as u64);

        let huge = analysis(5000, Vec::new(), 0, true);
        assert_eq!(huge.estimated_min_size_bytes(), 10 * 1024 * KIB);
    }
}
