//! Warmup tracing
//!
//! An [`AccessTracer`] records the block ranges a run touches. Deflating it
//! yields a [`WarmupTrace`], a compact per-region encoding that is persisted
//! in the store and inflated on the next cold start to drive a prefetch.
//!
//! Ranges keep their encounter order within each region. Duplicates and
//! overlaps are preserved as recorded.

use alloc::sync::Arc;
use bincode::Options;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::types::{AccessRange, Region};
use crate::{BundleError, BundleResult};

// ----------------------------------------------------------------------------
// Access Tracer
// ----------------------------------------------------------------------------

/// Shared recorder of block accesses for one capture session
#[derive(Debug, Clone, Default)]
pub struct AccessTracer {
    ranges: Arc<Mutex<Vec<AccessRange>>>,
}

impl AccessTracer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an access to `[start, end)` in `region`
    pub fn record(&self, region: Region, start: u64, end: u64) {
        self.ranges.lock().push(AccessRange::new(region, start, end));
    }

    /// Snapshot of everything recorded so far, in encounter order
    pub fn ranges(&self) -> Vec<AccessRange> {
        self.ranges.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.ranges.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.lock().is_empty()
    }

    /// Encode the recorded ranges for persistence
    pub fn deflate(&self) -> BundleResult<WarmupTrace> {
        WarmupTrace::from_ranges(&self.ranges.lock())
    }
}

// ----------------------------------------------------------------------------
// Warmup Trace
// ----------------------------------------------------------------------------

/// Serialized warmup ranges, one opaque byte string per region
///
/// Each region is a varint sequence of `(gap, length)` pairs where `gap` is
/// the signed distance from the previous range's end to this range's start.
/// Access patterns are mostly sequential, so gaps and lengths stay small.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarmupTrace {
    pub meta: Vec<u8>,
    pub data: Vec<u8>,
}

impl WarmupTrace {
    /// Encode ranges, splitting them by region
    pub fn from_ranges(ranges: &[AccessRange]) -> BundleResult<Self> {
        Ok(Self {
            meta: encode_region(ranges, Region::Meta)?,
            data: encode_region(ranges, Region::Data)?,
        })
    }

    /// Decode both regions; meta ranges come first, each region in order
    pub fn inflate(&self) -> BundleResult<Vec<AccessRange>> {
        Self::inflate_parts(&self.meta, &self.data)
    }

    /// Decode from the two persisted region encodings
    pub fn inflate_parts(meta: &[u8], data: &[u8]) -> BundleResult<Vec<AccessRange>> {
        let mut ranges = decode_region(meta, Region::Meta)?;
        ranges.extend(decode_region(data, Region::Data)?);
        Ok(ranges)
    }

    pub fn is_empty(&self) -> bool {
        self.meta.is_empty() && self.data.is_empty()
    }
}

fn codec() -> impl Options {
    bincode::DefaultOptions::new().with_varint_encoding()
}

fn encode_region(ranges: &[AccessRange], region: Region) -> BundleResult<Vec<u8>> {
    let mut previous_end = 0u64;
    let mut pairs: Vec<(i64, u64)> = Vec::new();
    for range in ranges.iter().filter(|range| range.region == region) {
        let gap = i64::try_from(i128::from(range.start) - i128::from(previous_end))
            .map_err(|_| BundleError::malformed("Warmup range gap exceeds 64 bits"))?;
        pairs.push((gap, range.len()));
        previous_end = range.end;
    }

    if pairs.is_empty() {
        return Ok(Vec::new());
    }
    Ok(codec().serialize(&pairs)?)
}

fn decode_region(bytes: &[u8], region: Region) -> BundleResult<Vec<AccessRange>> {
    if bytes.is_empty() {
        return Ok(Vec::new());
    }

    let pairs: Vec<(i64, u64)> = codec().deserialize(bytes)?;
    let mut previous_end = 0u64;
    let mut ranges = Vec::with_capacity(pairs.len());
    for (gap, length) in pairs {
        let start = u64::try_from(i128::from(previous_end) + i128::from(gap))
            .map_err(|_| BundleError::malformed("Warmup range starts outside the region"))?;
        let end = start
            .checked_add(length)
            .ok_or_else(|| BundleError::malformed("Warmup range ends outside the region"))?;
        ranges.push(AccessRange::new(region, start, end));
        previous_end = end;
    }
    Ok(ranges)
}
