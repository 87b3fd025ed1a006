use crate::policy::FloorFormula;

/// Byte budget of one compression run. `bytes >= floor_bytes` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetBudget {
    pub bytes: u64,
    pub floor_bytes: u64,
}

impl TargetBudget {
    /// Resolve the effective budget.
    ///
    /// A positive `requested` value wins over the default of half the original
    /// size; either way the result is raised to the page-scaled floor so the
    /// search never chases an unreachable size.
    pub fn resolve(
        original_size_bytes: u64,
        requested: Option<u64>,
        page_count: usize,
        floor: &FloorFormula,
    ) -> Self {
        let wanted = match requested {
            Some(bytes) if bytes > 0 => bytes,
            _ => original_size_bytes / 2,
        };
        let floor_bytes = floor.floor_for(page_count);

        Self {
            bytes: wanted.max(floor_bytes),
            floor_bytes,
        }
    }

    pub fn is_met_by(&self, size_bytes: u64) -> bool {
        size_bytes <= self.bytes
    }

    /// True when the floor, not the caller or the default, set the budget.
    pub fn is_clamped(&self) -> bool {
        self.bytes == self.floor_bytes
    }
}
