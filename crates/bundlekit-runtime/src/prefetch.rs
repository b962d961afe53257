//! Warmup prefetch
//!
//! Converts recorded access ranges into download requests and summarises a
//! loaded warmup trace.

use bundlekit_core::{AccessRange, BundleResult, ByteRange, Region, StoreView};
use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Prefetch Ranges
// ----------------------------------------------------------------------------

/// Block ranges to download, split by region
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrefetchRanges {
    pub meta: Vec<ByteRange>,
    pub data: Vec<ByteRange>,
}

impl PrefetchRanges {
    /// Both regions in full
    pub fn everything() -> Self {
        Self {
            meta: vec![ByteRange::open_ended(0)],
            data: vec![ByteRange::open_ended(0)],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.meta.is_empty() && self.data.is_empty()
    }
}

impl From<&[AccessRange]> for PrefetchRanges {
    fn from(ranges: &[AccessRange]) -> Self {
        let mut prefetch = Self::default();
        for range in ranges {
            match range.region {
                Region::Meta => prefetch.meta.push(range.into()),
                Region::Data => prefetch.data.push(range.into()),
            }
        }
        prefetch
    }
}

impl From<Vec<AccessRange>> for PrefetchRanges {
    fn from(ranges: Vec<AccessRange>) -> Self {
        Self::from(ranges.as_slice())
    }
}

impl From<AccessRange> for PrefetchRanges {
    fn from(range: AccessRange) -> Self {
        Self::from(std::slice::from_ref(&range))
    }
}

/// Ask `view` to download `ranges`; empty requests never reach the store
pub(crate) async fn download(view: &dyn StoreView, ranges: &PrefetchRanges) -> BundleResult<()> {
    if ranges.is_empty() {
        return Ok(());
    }
    view.download_range(&ranges.meta, &ranges.data).await?;
    Ok(())
}

// ----------------------------------------------------------------------------
// Warmup Statistics
// ----------------------------------------------------------------------------

/// Size of the warmup trace loaded during calibration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarmupStats {
    /// Number of recorded ranges
    pub ranges: usize,
    /// Blocks covered, counting overlaps once per range
    pub blocks: u64,
}

impl WarmupStats {
    pub fn from_ranges(ranges: &[AccessRange]) -> Self {
        Self {
            ranges: ranges.len(),
            blocks: ranges.iter().map(AccessRange::len).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_range_becomes_one_element_request() {
        let prefetch = PrefetchRanges::from(AccessRange::new(Region::Data, 4, 9));
        assert!(prefetch.meta.is_empty());
        assert_eq!(prefetch.data, vec![ByteRange::new(4, 9)]);
    }

    #[test]
    fn test_ranges_split_by_region_in_order() {
        let prefetch = PrefetchRanges::from(vec![
            AccessRange::new(Region::Data, 10, 12),
            AccessRange::new(Region::Meta, 1, 2),
            AccessRange::new(Region::Data, 0, 3),
        ]);
        assert_eq!(prefetch.meta, vec![ByteRange::new(1, 2)]);
        assert_eq!(prefetch.data, vec![ByteRange::new(10, 12), ByteRange::new(0, 3)]);
    }

    #[test]
    fn test_everything_is_open_ended() {
        let all = PrefetchRanges::everything();
        assert_eq!(all.meta[0].end, None);
        assert!(!all.is_empty());
    }

    #[test]
    fn test_warmup_stats() {
        let stats = WarmupStats::from_ranges(&[
            AccessRange::new(Region::Meta, 0, 1),
            AccessRange::new(Region::Data, 5, 10),
        ]);
        assert_eq!(stats, WarmupStats { ranges: 2, blocks: 6 });
    }
}
