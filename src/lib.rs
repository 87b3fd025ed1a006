//! Shrink PDF documents to a byte budget.
//!
//! A run resolves a budget, then walks a ladder of (JPEG quality, resolution
//! cap) tiers from the highest quality down. Every tier recompresses the
//! embedded images of a fresh copy of the source, applies a structural pass,
//! writes a candidate and validates it. The first candidate within budget is
//! promoted to the output path; if none fits, the smallest valid one is.
//!
//! ```no_run
//! use std::path::Path;
//! use pdf_squeeze::{CompressOptions, Compressor};
//!
//! let report = Compressor::new(CompressOptions::with_target(500 * 1024))
//!     .compress(Path::new("in.pdf"), Path::new("out.pdf"))?;
//! println!("{} -> {} bytes ({})", report.original_size_bytes, report.compressed_size_bytes, report.outcome);
//! # Ok::<(), pdf_squeeze::CompressError>(())
//! ```

pub mod analyzer;
pub mod error;
pub mod pdf;
pub mod policy;
pub mod recompress;
pub mod rewrite;
pub mod search;
pub mod target;
pub mod validate;

pub use analyzer::{analyze, analyze_path, DocumentAnalysis};
pub use error::{CompressError, ImageError, Result, ValidationFailure};
pub use policy::{
    CancelFlag, CompressOptions, CompressionPolicy, CompressionTier, FloorFormula, KIB,
};
pub use recompress::{recompress, ImageOutcome, RecompressSummary, SkipReason};
pub use rewrite::{restructure, serialize, RewriteStats, StructuralOptions};
pub use search::{
    compress, AttemptSummary, CompressionOutcome, CompressionReport, CompressionResult,
    Compressor,
};
pub use target::TargetBudget;
pub use validate::{AttemptValidator, PdfValidator};
