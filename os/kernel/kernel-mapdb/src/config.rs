//! # Mapping database configuration
//!
//! A [`Mapdb`](crate::Mapdb) is shaped by its page-size classes and the span of
//! resource units it tracks. Size classes are shifts in base units, coarsest
//! first; one physframe exists per unit of the coarsest class.

use crate::error::ConfigError;
use crate::page::{Pfn, units};
use crate::tree::TREE_ENTRIES_MIN;

/// Most size classes a database may be configured with.
pub const MAX_LEVELS: usize = 4;

/// Largest shift between two adjacent size classes; bounds the submap table.
pub const MAX_LEVEL_STEP: u8 = 16;

/// Largest supported size-class shift.
pub const MAX_SHIFT: u8 = 48;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MapdbConfig {
    /// Size-class shifts in base units, strictly decreasing.
    pub page_shifts: &'static [u8],
    /// One past the last tracked resource unit.
    pub end_frame: Pfn,
    /// Slots a fresh tree is allocated with.
    pub tree_entries_min: usize,
    /// Slots a tree may grow to.
    pub tree_entries_max: usize,
}

impl MapdbConfig {
    /// Physical memory: 2 MiB superpages and 4 KiB pages, up to 4 GiB.
    pub const MEMORY: Self = Self {
        page_shifts: &[9, 0],
        end_frame: Pfn::new(1 << 20),
        tree_entries_min: 8,
        tree_entries_max: 1 << 12,
    };

    /// x86 I/O ports: 256-port blocks and single ports.
    pub const IO_PORTS: Self = Self {
        page_shifts: &[8, 0],
        end_frame: Pfn::new(1 << 16),
        tree_entries_min: TREE_ENTRIES_MIN,
        tree_entries_max: 1 << 10,
    };

    #[must_use]
    pub const fn with_end_frame(mut self, end_frame: Pfn) -> Self {
        self.end_frame = end_frame;
        self
    }

    #[must_use]
    pub const fn with_tree_entries(mut self, min: usize, max: usize) -> Self {
        self.tree_entries_min = min;
        self.tree_entries_max = max;
        self
    }

    /// Reject configurations a [`Mapdb`](crate::Mapdb) cannot be built from.
    ///
    /// # Errors
    /// The first [`ConfigError`] found.
    pub const fn validate(&self) -> Result<(), ConfigError> {
        let shifts = self.page_shifts;
        if shifts.is_empty() {
            return Err(ConfigError::NoSizeClasses);
        }
        if shifts.len() > MAX_LEVELS {
            return Err(ConfigError::TooManySizeClasses(shifts.len()));
        }
        let mut i = 0;
        while i < shifts.len() {
            if shifts[i] > MAX_SHIFT {
                return Err(ConfigError::ShiftOutOfRange(shifts[i]));
            }
            if i > 0 {
                if shifts[i] >= shifts[i - 1] {
                    return Err(ConfigError::UnorderedSizeClasses);
                }
                if shifts[i - 1] - shifts[i] > MAX_LEVEL_STEP {
                    return Err(ConfigError::ShiftOutOfRange(shifts[i - 1]));
                }
            }
            i += 1;
        }
        if self.tree_entries_min < TREE_ENTRIES_MIN || self.tree_entries_min > self.tree_entries_max
        {
            return Err(ConfigError::TreeBounds {
                min: self.tree_entries_min,
                max: self.tree_entries_max,
            });
        }
        if self.end_frame.as_u64() == 0 {
            return Err(ConfigError::EmptyResource(0));
        }
        Ok(())
    }

    /// Physframes needed to cover `0..end_frame` at the coarsest class.
    #[must_use]
    pub const fn physframes(&self) -> u64 {
        let per_frame = units(self.page_shifts[0]);
        self.end_frame.as_u64().div_ceil(per_frame)
    }
}

const _: () = {
    assert!(MapdbConfig::MEMORY.validate().is_ok());
    assert!(MapdbConfig::IO_PORTS.validate().is_ok());
    assert!(MapdbConfig::IO_PORTS.physframes() == 256);
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_cover_their_resources() {
        assert_eq!(MapdbConfig::MEMORY.physframes(), 2048);
        assert_eq!(MapdbConfig::IO_PORTS.page_shifts, &[8, 0]);
    }

    #[test]
    fn partial_coarse_unit_still_gets_a_physframe() {
        let cfg = MapdbConfig::MEMORY.with_end_frame(Pfn::new(513));
        assert_eq!(cfg.physframes(), 2);
    }

    #[test]
    fn rejects_bad_size_classes() {
        let mut cfg = MapdbConfig::MEMORY;
        cfg.page_shifts = &[];
        assert_eq!(cfg.validate(), Err(ConfigError::NoSizeClasses));
        cfg.page_shifts = &[0, 9];
        assert_eq!(cfg.validate(), Err(ConfigError::UnorderedSizeClasses));
        cfg.page_shifts = &[30, 20, 10, 5, 0];
        assert_eq!(cfg.validate(), Err(ConfigError::TooManySizeClasses(5)));
        cfg.page_shifts = &[40, 0];
        assert_eq!(cfg.validate(), Err(ConfigError::ShiftOutOfRange(40)));
    }

    #[test]
    fn rejects_bad_bounds() {
        let cfg = MapdbConfig::MEMORY.with_tree_entries(64, 8);
        assert_eq!(cfg.validate(), Err(ConfigError::TreeBounds { min: 64, max: 8 }));
        let cfg = MapdbConfig::MEMORY.with_end_frame(Pfn::new(0));
        assert_eq!(cfg.validate(), Err(ConfigError::EmptyResource(0)));
    }
}
