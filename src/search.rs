//! Tier search: try each tier in descending quality, keep the first one that
//! fits the budget, otherwise fall back to the smallest valid attempt.

use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};

use log::{info, warn};
use tempfile::TempDir;

use crate::analyzer::{analyze, DocumentAnalysis};
use crate::error::{CompressError, Result};
use crate::pdf::{document_image_ids, open_document};
use crate::policy::{CompressOptions, CompressionTier, Interrupt, KIB};
use crate::recompress::{recompress_with, RecompressSummary};
use crate::rewrite::{serialize, StructuralOptions};
use crate::target::TargetBudget;
use crate::validate::{AttemptValidator, PdfValidator};

/// How the final output was arrived at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompressionOutcome {
    /// The source already fit the budget and was copied through
    AlreadyWithinTarget,
    /// The named tier was the first to fit the budget
    TargetMet { tier: String },
    /// No tier fit; the smallest valid attempt was kept
    BestEffort { tier: String },
    /// Only the structural pass was applied
    StructuralOnly { within_target: bool },
    /// Nothing beat the source, which was copied through unchanged
    NoReductionAchieved,
}

impl CompressionOutcome {
    /// True when the output is at or under the budget.
    pub fn within_target(&self) -> bool {
        match self {
            CompressionOutcome::AlreadyWithinTarget | CompressionOutcome::TargetMet { .. } => true,
            CompressionOutcome::StructuralOnly { within_target } => *within_target,
            CompressionOutcome::BestEffort { .. } | CompressionOutcome::NoReductionAchieved => {
                false
            }
        }
    }
}

impl fmt::Display for CompressionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompressionOutcome::AlreadyWithinTarget => write!(f, "already within target"),
            CompressionOutcome::TargetMet { tier } => write!(f, "target met by tier '{}'", tier),
            CompressionOutcome::BestEffort { tier } => {
                write!(f, "target missed, smallest result from tier '{}'", tier)
            }
            CompressionOutcome::StructuralOnly { within_target: true } => {
                write!(f, "structural compression only, target met")
            }
            CompressionOutcome::StructuralOnly { within_target: false } => {
                write!(f, "structural compression only, target missed")
            }
            CompressionOutcome::NoReductionAchieved => write!(f, "no reduction achieved"),
        }
    }
}

/// What one tier attempt produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptSummary {
    pub tier: CompressionTier,
    /// Size of the written candidate, if one was written
    pub size_bytes: Option<u64>,
    pub valid: bool,
    pub images: RecompressSummary,
    pub error: Option<String>,
}

impl AttemptSummary {
    fn new(tier: &CompressionTier) -> Self {
        Self {
            tier: tier.clone(),
            size_bytes: None,
            valid: false,
            images: RecompressSummary::default(),
            error: None,
        }
    }

    /// Size of the candidate when it passed validation.
    pub fn valid_size(&self) -> Option<u64> {
        self.size_bytes.filter(|_| self.valid)
    }
}

/// Full account of a compression run.
#[derive(Debug, Clone, PartialEq)]
pub struct CompressionReport {
    pub outcome: CompressionOutcome,
    pub original_size_bytes: u64,
    pub compressed_size_bytes: u64,
    pub budget: TargetBudget,
    pub page_count: usize,
    pub image_count: usize,
    pub attempts: Vec<AttemptSummary>,
    pub analysis: Option<DocumentAnalysis>,
}

impl CompressionReport {
    pub fn reduction_percent(&self) -> f64 {
        if self.original_size_bytes == 0 {
            return 0.0;
        }
        100.0 * (1.0 - self.compressed_size_bytes as f64 / self.original_size_bytes as f64)
    }
}

/// Caller-facing result of [`compress`].
#[derive(Debug, Clone, PartialEq)]
pub struct CompressionResult {
    pub success: bool,
    pub compressed_size_bytes: Option<u64>,
    pub outcome: Option<CompressionOutcome>,
    pub error: Option<String>,
}

impl From<Result<CompressionReport>> for CompressionResult {
    fn from(result: Result<CompressionReport>) -> Self {
        match result {
            Ok(report) => Self {
                success: true,
                compressed_size_bytes: Some(report.compressed_size_bytes),
                outcome: Some(report.outcome),
                error: None,
            },
            Err(e) => Self {
                success: false,
                compressed_size_bytes: None,
                outcome: None,
                error: Some(e.to_string()),
            },
        }
    }
}

/// A written candidate that passed validation.
#[derive(Debug)]
struct Candidate {
    path: PathBuf,
    size: u64,
    tier: Option<String>,
}

fn discard(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove {:?}: {}", path, e);
        }
    }
}

/// Copy `from` to `to` through a temporary sibling of `to`, so `to` is
/// either untouched or complete.
fn promote(from: &Path, to: &Path) -> Result<()> {
    let dir = match to.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut staged = tempfile::Builder::new()
        .prefix(".pdf-squeeze-")
        .suffix(".part")
        .tempfile_in(dir)
        .map_err(|e| CompressError::io(dir, e))?;

    let mut source = File::open(from).map_err(|e| CompressError::io(from, e))?;
    std::io::copy(&mut source, staged.as_file_mut()).map_err(|e| CompressError::io(to, e))?;
    staged
        .as_file()
        .sync_all()
        .map_err(|e| CompressError::io(to, e))?;
    staged
        .persist(to)
        .map_err(|e| CompressError::io(to, e.error))?;
    Ok(())
}

fn kb(bytes: u64) -> f64 {
    bytes as f64 / KIB as f64
}

/// Runs compressions with one set of options and one validator.
///
/// Holds no per-run state, so a single instance can serve concurrent calls
/// for different documents.
pub struct Compressor {
    options: CompressOptions,
    structural: StructuralOptions,
    validator: Box<dyn AttemptValidator>,
}

impl Compressor {
    pub fn new(options: CompressOptions) -> Self {
        Self {
            options,
            structural: StructuralOptions::default(),
            validator: Box::new(PdfValidator::default()),
        }
    }

    pub fn with_validator(mut self, validator: impl AttemptValidator + 'static) -> Self {
        self.validator = Box::new(validator);
        self
    }

    pub fn with_structural_options(mut self, structural: StructuralOptions) -> Self {
        self.structural = structural;
        self
    }

    pub fn options(&self) -> &CompressOptions {
        &self.options
    }

    fn scratch_dir(&self) -> Result<TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("pdf-squeeze-");
        match &self.options.scratch_dir {
            Some(parent) => builder
                .tempdir_in(parent)
                .map_err(|e| CompressError::io(parent, e)),
            None => builder
                .tempdir()
                .map_err(|e| CompressError::io(std::env::temp_dir(), e)),
        }
    }

    /// One recompress + restructure + validate cycle on a fresh parse of the source.
    fn attempt(
        &self,
        source: &[u8],
        tier: &CompressionTier,
        path: &Path,
        page_count: usize,
        interrupt: &Interrupt,
    ) -> AttemptSummary {
        let mut summary = AttemptSummary::new(tier);

        let mut doc = match open_document(source) {
            Ok(doc) => doc,
            Err(e) => {
                warn!("Tier '{}': {}", tier.label, e);
                summary.error = Some(e.to_string());
                return summary;
            }
        };

        summary.images = recompress_with(&mut doc, tier, &self.options.policy, interrupt);
        if summary.images.cancelled > 0 {
            warn!(
                "Tier '{}' interrupted with {} images left unprocessed",
                tier.label, summary.images.cancelled
            );
            summary.error = Some("interrupted before every image was processed".to_string());
            return summary;
        }

        match serialize(&mut doc, path, &self.structural) {
            Ok(size) => summary.size_bytes = Some(size),
            Err(e) => {
                warn!("Tier '{}': {}", tier.label, e);
                summary.error = Some(e.to_string());
                return summary;
            }
        }

        match self.validator.validate(path, page_count) {
            Ok(()) => summary.valid = true,
            Err(reason) => {
                warn!("Tier '{}' produced an invalid file: {}", tier.label, reason);
                summary.error = Some(reason.to_string());
            }
        }

        summary
    }

    /// Structural pass alone, validated like a tier attempt.
    fn structural_only(&self, source: &[u8], path: &Path, page_count: usize) -> Option<Candidate> {
        let written = open_document(source).and_then(|mut doc| serialize(&mut doc, path, &self.structural));
        let size = match written {
            Ok(size) => size,
            Err(e) => {
                warn!("Structural compression failed: {}", e);
                discard(path);
                return None;
            }
        };

        if let Err(reason) = self.validator.validate(path, page_count) {
            warn!("Structural compression produced an invalid file: {}", reason);
            discard(path);
            return None;
        }

        Some(Candidate {
            path: path.to_path_buf(),
            size,
            tier: None,
        })
    }

    /// Compress `input` into `output`.
    ///
    /// Only a malformed source, invalid options, I/O failure on the output,
    /// or cancellation before any usable artifact is an error; every other
    /// path ends with a file at `output`.
    pub fn compress(&self, input: &Path, output: &Path) -> Result<CompressionReport> {
        self.options.validate()?;
        let interrupt = self.options.interrupt();
        let policy = &self.options.policy;

        let source = std::fs::read(input).map_err(|e| CompressError::io(input, e))?;
        let original_size = source.len() as u64;

        let (page_count, image_count, analysis) = {
            let doc = open_document(&source)?;
            let analysis = self.options.analyze.then(|| analyze(&doc, original_size));
            (doc.get_pages().len(), document_image_ids(&doc).len(), analysis)
        };

        let budget = TargetBudget::resolve(
            original_size,
            self.options.target_size_bytes,
            page_count,
            &policy.floor,
        );
        info!(
            "Compressing {:?}: {:.0} KB, {} pages, {} images, goal {:.0} KB (floor {:.0} KB)",
            input,
            kb(original_size),
            page_count,
            image_count,
            kb(budget.bytes),
            kb(budget.floor_bytes)
        );

        let mut report = CompressionReport {
            outcome: CompressionOutcome::AlreadyWithinTarget,
            original_size_bytes: original_size,
            compressed_size_bytes: original_size,
            budget,
            page_count,
            image_count,
            attempts: Vec::new(),
            analysis,
        };

        if budget.is_met_by(original_size) {
            info!("Already within target, copying through");
            promote(input, output)?;
            return Ok(report);
        }

        let scratch = self.scratch_dir()?;
        let mut best: Option<Candidate> = None;

        if image_count > 0 {
            for (index, tier) in policy.tiers.iter().enumerate() {
                if interrupt.is_triggered() {
                    warn!("Stopping before tier '{}': cancelled or out of time", tier.label);
                    break;
                }

                let path = scratch.path().join(format!("tier-{}-{}.pdf", index, tier.label));
                let attempt = self.attempt(&source, tier, &path, page_count, &interrupt);
                let valid_size = attempt.valid_size();
                report.attempts.push(attempt);

                let Some(size) = valid_size else {
                    discard(&path);
                    continue;
                };
                info!(
                    "Attempt {}: {:.0} KB (q{} {}dpi '{}')",
                    index,
                    kb(size),
                    tier.quality,
                    tier.max_dimension_dpi,
                    tier.label
                );

                if budget.is_met_by(size) {
                    promote(&path, output)?;
                    report.outcome = CompressionOutcome::TargetMet {
                        tier: tier.label.clone(),
                    };
                    report.compressed_size_bytes = size;
                    return Ok(report);
                }

                // ties keep the earlier, higher quality tier
                if best.as_ref().map_or(true, |current| size < current.size) {
                    let candidate = Candidate {
                        path,
                        size,
                        tier: Some(tier.label.clone()),
                    };
                    if let Some(previous) = best.replace(candidate) {
                        discard(&previous.path);
                    }
                } else {
                    discard(&path);
                }
            }
        }

        if best.is_none() && image_count > 0 && interrupt.is_triggered() {
            return Err(CompressError::Cancelled);
        }

        let chosen = match best {
            Some(candidate) => Some(candidate),
            None => {
                if image_count > 0 {
                    warn!("No tier produced a valid file, falling back to structural compression");
                }
                self.structural_only(&source, &scratch.path().join("structural.pdf"), page_count)
            }
        };

        match chosen {
            Some(candidate) if candidate.size < original_size => {
                promote(&candidate.path, output)?;
                report.compressed_size_bytes = candidate.size;
                report.outcome = match candidate.tier {
                    Some(tier) => CompressionOutcome::BestEffort { tier },
                    None => CompressionOutcome::StructuralOnly {
                        within_target: budget.is_met_by(candidate.size),
                    },
                };
            }
            _ => {
                if self.options.fail_on_no_reduction {
                    return Err(CompressError::NoReduction {
                        size: original_size,
                    });
                }
                warn!("Nothing smaller than the source was produced, copying it through");
                promote(input, output)?;
                report.outcome = CompressionOutcome::NoReductionAchieved;
            }
        }

        info!(
            "Done: {:.0} KB -> {:.0} KB ({})",
            kb(original_size),
            kb(report.compressed_size_bytes),
            report.outcome
        );
        Ok(report)
    }
}

impl Default for Compressor {
    fn default() -> Self {
        Self::new(CompressOptions::default())
    }
}

/// Compress `input` into `output` with the default policy.
pub fn compress(
    input: impl AsRef<Path>,
    output: impl AsRef<Path>,
    target_size_bytes: Option<u64>,
) -> CompressionResult {
    let options = CompressOptions {
        target_size_bytes,
        ..CompressOptions::default()
    };
    Compressor::new(options)
        .compress(input.as_ref(), output.as_ref())
        .into()
}
