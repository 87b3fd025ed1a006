//! Tier ladders, floor formulas and the typed options of a compression run.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{CompressError, Result};

pub const KIB: u64 = 1024;

/// Nominal DPI that `reference_pixels` is expressed against.
pub const REFERENCE_DPI: u32 = 72;

/// One (quality, resolution cap) pair of the search ladder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressionTier {
    /// JPEG quality, 1-100
    pub quality: u8,
    /// Nominal DPI used to derive the pixel cap
    pub max_dimension_dpi: u32,
    pub label: String,
}

impl CompressionTier {
    pub fn new(quality: u8, max_dimension_dpi: u32, label: impl Into<String>) -> Self {
        Self {
            quality,
            max_dimension_dpi,
            label: label.into(),
        }
    }

    /// Longest side, in pixels, an image may keep under this tier.
    pub fn max_dimension(&self, reference_pixels: u32) -> u32 {
        let scale = self.max_dimension_dpi as f64 / REFERENCE_DPI as f64;
        ((scale * reference_pixels as f64) as u32).max(1)
    }
}

/// Minimum byte budget: `base_bytes + pages * per_page_bytes`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FloorFormula {
    pub base_bytes: u64,
    pub per_page_bytes: u64,
}

impl FloorFormula {
    pub fn floor_for(&self, page_count: usize) -> u64 {
        self.base_bytes
            .saturating_add(self.per_page_bytes.saturating_mul(page_count as u64))
    }
}

/// Everything that differs between compression strategies: the tier ladder,
/// the floor formula and the image eligibility thresholds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressionPolicy {
    pub name: String,
    /// Ordered strictly descending in quality
    pub tiers: Vec<CompressionTier>,
    pub floor: FloorFormula,
    /// Pixel budget at `REFERENCE_DPI`; a tier's cap scales it by its DPI
    pub reference_pixels: u32,
    /// Images with a side shorter than this are treated as icons and skipped
    pub min_image_side: u32,
    /// Raw streams smaller than this are not re-encoded unless they must shrink
    pub min_recompress_bytes: usize,
    /// Leave JPEG sources alone unless they exceed the tier's cap
    pub keep_jpeg_within_cap: bool,
}

impl CompressionPolicy {
    /// Six-step ladder with a floor of 50 KiB + 20 KiB per page.
    pub fn standard() -> Self {
        Self {
            name: "standard".to_string(),
            tiers: vec![
                CompressionTier::new(95, 300, "maximum"),
                CompressionTier::new(90, 200, "high"),
                CompressionTier::new(80, 150, "balanced"),
                CompressionTier::new(75, 144, "screen"),
                CompressionTier::new(60, 120, "strong"),
                CompressionTier::new(50, 96, "aggressive"),
            ],
            floor: FloorFormula {
                base_bytes: 50 * KIB,
                per_page_bytes: 20 * KIB,
            },
            reference_pixels: 1000,
            min_image_side: 150,
            min_recompress_bytes: 16 * KIB as usize,
            keep_jpeg_within_cap: true,
        }
    }

    /// Five-step ladder with smaller pixel caps and a lighter per-page floor.
    pub fn gentle() -> Self {
        Self {
            name: "gentle".to_string(),
            tiers: vec![
                CompressionTier::new(95, 300, "best"),
                CompressionTier::new(85, 200, "high"),
                CompressionTier::new(75, 150, "medium"),
                CompressionTier::new(60, 120, "strong"),
                CompressionTier::new(45, 90, "aggressive"),
            ],
            floor: FloorFormula {
                base_bytes: 50 * KIB,
                per_page_bytes: 10 * KIB,
            },
            reference_pixels: 800,
            min_image_side: 150,
            min_recompress_bytes: 16 * KIB as usize,
            keep_jpeg_within_cap: false,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.tiers.is_empty() {
            return Err(CompressError::InvalidOptions(format!(
                "policy '{}' has no tiers",
                self.name
            )));
        }
        if self.reference_pixels == 0 {
            return Err(CompressError::InvalidOptions(
                "reference pixel budget must be positive".to_string(),
            ));
        }
        for tier in &self.tiers {
            if !(1..=100).contains(&tier.quality) {
                return Err(CompressError::InvalidOptions(format!(
                    "tier '{}' has quality {} outside 1-100",
                    tier.label, tier.quality
                )));
            }
            if tier.max_dimension_dpi == 0 {
                return Err(CompressError::InvalidOptions(format!(
                    "tier '{}' has a zero DPI",
                    tier.label
                )));
            }
        }
        if let Some(pair) = self
            .tiers
            .windows(2)
            .find(|pair| pair[1].quality >= pair[0].quality)
        {
            return Err(CompressError::InvalidOptions(format!(
                "tiers must descend in quality: '{}' ({}) follows '{}' ({})",
                pair[1].label, pair[1].quality, pair[0].label, pair[0].quality
            )));
        }
        Ok(())
    }
}

impl Default for CompressionPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

/// Cooperative cancellation shared between a caller and a running compression.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Cancellation flag plus optional deadline, checked between tiers and images.
#[derive(Debug, Clone)]
pub(crate) struct Interrupt {
    flag: CancelFlag,
    deadline: Option<Instant>,
}

impl Interrupt {
    pub(crate) fn new(flag: CancelFlag, timeout: Option<Duration>) -> Self {
        Self {
            flag,
            deadline: timeout.map(|t| Instant::now() + t),
        }
    }

    pub(crate) fn never() -> Self {
        Self {
            flag: CancelFlag::new(),
            deadline: None,
        }
    }

    pub(crate) fn is_triggered(&self) -> bool {
        self.flag.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

/// Options of one compression run.
#[derive(Debug, Clone)]
pub struct CompressOptions {
    /// Requested output size; `None` or `Some(0)` means half the original
    pub target_size_bytes: Option<u64>,
    pub policy: CompressionPolicy,
    pub timeout: Option<Duration>,
    pub cancel: CancelFlag,
    /// Parent of the per-run scratch directory (system temp dir if unset)
    pub scratch_dir: Option<PathBuf>,
    /// Run the document analyzer and attach its report
    pub analyze: bool,
    /// Report `NoReductionAchieved` as an error instead of a success
    pub fail_on_no_reduction: bool,
}

impl Default for CompressOptions {
    fn default() -> Self {
        Self {
            target_size_bytes: None,
            policy: CompressionPolicy::standard(),
            timeout: None,
            cancel: CancelFlag::new(),
            scratch_dir: None,
            analyze: true,
            fail_on_no_reduction: false,
        }
    }
}

impl CompressOptions {
    pub fn with_target(target_size_bytes: u64) -> Self {
        Self {
            target_size_bytes: Some(target_size_bytes),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.policy.validate()?;
        if self.timeout.is_some_and(|t| t.is_zero()) {
            return Err(CompressError::InvalidOptions(
                "timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn interrupt(&self) -> Interrupt {
        Interrupt::new(self.cancel.clone(), self.timeout)
    }
}
