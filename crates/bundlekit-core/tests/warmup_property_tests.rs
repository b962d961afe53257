//! Property-based tests for warmup trace encoding
//!
//! These tests verify that a recorded access pattern survives persistence with
//! its per-region order, duplicates and overlaps intact.

use bundlekit_core::{AccessRange, AccessTracer, Region, WarmupTrace};
use proptest::prelude::*;

/// Generate an arbitrary region
fn arb_region() -> impl Strategy<Value = Region> {
    prop_oneof![Just(Region::Meta), Just(Region::Data)]
}

/// Generate an arbitrary block range, including backwards jumps
fn arb_range() -> impl Strategy<Value = AccessRange> {
    (arb_region(), 0u64..=1_000_000_000u64, 0u64..=65_536u64)
        .prop_map(|(region, start, len)| AccessRange::new(region, start, start + len))
}

/// Generate a mostly-sequential scan of one region
fn arb_sequential_scan() -> impl Strategy<Value = Vec<AccessRange>> {
    (0u64..=10_000u64, 1usize..=200usize).prop_map(|(base, count)| {
        (0..count as u64)
            .map(|i| AccessRange::new(Region::Data, base + i * 8, base + i * 8 + 8))
            .collect()
    })
}

proptest! {
    /// Property: inflating a deflated trace yields meta ranges then data ranges,
    /// each in encounter order
    #[test]
    fn inflate_preserves_region_order(ranges in prop::collection::vec(arb_range(), 0..128)) {
        let tracer = AccessTracer::new();
        for range in &ranges {
            tracer.record(range.region, range.start, range.end);
        }

        let trace = tracer.deflate().unwrap();
        let inflated = WarmupTrace::inflate_parts(&trace.meta, &trace.data).unwrap();

        let expected: Vec<AccessRange> = ranges
            .iter()
            .filter(|r| r.region == Region::Meta)
            .chain(ranges.iter().filter(|r| r.region == Region::Data))
            .copied()
            .collect();
        prop_assert_eq!(inflated, expected);
    }

    /// Property: a region with no accesses encodes to nothing
    #[test]
    fn untouched_region_is_empty(ranges in prop::collection::vec(arb_range(), 0..64)) {
        let data_only: Vec<AccessRange> = ranges
            .into_iter()
            .map(|r| AccessRange::new(Region::Data, r.start, r.end))
            .collect();
        let trace = WarmupTrace::from_ranges(&data_only).unwrap();
        prop_assert!(trace.meta.is_empty());
        prop_assert_eq!(trace.data.is_empty(), data_only.is_empty());
    }

    /// Property: sequential scans stay within a few bytes per range
    #[test]
    fn sequential_scans_encode_compactly(scan in arb_sequential_scan()) {
        let trace = WarmupTrace::from_ranges(&scan).unwrap();
        // First gap may need a multi-byte varint; the rest are zero gaps
        prop_assert!(trace.data.len() <= 3 + 5 + scan.len() * 2);
    }
}
