//! Coalescing sets of half-open byte ranges.
//!
//! [`RangeSet`] is the bookkeeping structure behind both `present_ranges` and
//! `dirty_ranges` of a cache item: an ordered list of disjoint, non-touching
//! `[start, end)` intervals with a maintained byte total. All mutations are
//! O(log n) to locate the affected span plus the cost of the splice.

use std::fmt;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A half-open byte interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ByteRange {
    /// First byte covered.
    pub start: u64,
    /// One past the last byte covered.
    pub end: u64,
}

impl ByteRange {
    /// Build a range; `end < start` is clamped to the empty range at `start`.
    #[must_use]
    pub fn new(start: u64, end: u64) -> Self {
        Self {
            start,
            end: end.max(start),
        }
    }

    /// Length in bytes.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    /// True when the range covers no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// True when `other` lies entirely inside this range.
    #[must_use]
    pub fn contains(&self, other: &ByteRange) -> bool {
        other.is_empty() || (self.start <= other.start && other.end <= self.end)
    }

    /// True when the two ranges share at least one byte.
    #[must_use]
    pub fn overlaps(&self, other: &ByteRange) -> bool {
        !self.is_empty() && !other.is_empty() && self.start < other.end && other.start < self.end
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// An ordered, coalescing set of [`ByteRange`]s.
///
/// Invariant: ranges are sorted by start, pairwise disjoint, never touching,
/// and never empty. `total` is always the sum of their lengths.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeSet {
    ranges: Vec<ByteRange>,
    total: u64,
}

impl RangeSet {
    /// An empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a range, merging with any touching or overlapping intervals.
    /// Inserting a range already covered is a no-op.
    pub fn insert(&mut self, r: ByteRange) {
        if r.is_empty() {
            return;
        }
        // First stored range that could merge with r (touching counts).
        let i = self.ranges.partition_point(|x| x.end < r.start);
        // One past the last stored range that could merge with r.
        let j = self.ranges.partition_point(|x| x.start <= r.end);
        let mut merged = r;
        for x in &self.ranges[i..j] {
            merged.start = merged.start.min(x.start);
            merged.end = merged.end.max(x.end);
            self.total -= x.len();
        }
        self.total += merged.len();
        self.ranges.splice(i..j, [merged]);
    }

    /// Remove every byte of `r` from the set, splitting intervals as needed.
    pub fn remove(&mut self, r: ByteRange) {
        if r.is_empty() {
            return;
        }
        let i = self.ranges.partition_point(|x| x.end <= r.start);
        let j = self.ranges.partition_point(|x| x.start < r.end);
        if i >= j {
            return;
        }
        let mut keep: Vec<ByteRange> = Vec::with_capacity(2);
        for x in &self.ranges[i..j] {
            self.total -= x.len();
            if x.start < r.start {
                let left = ByteRange::new(x.start, r.start);
                self.total += left.len();
                keep.push(left);
            }
            if x.end > r.end {
                let right = ByteRange::new(r.end, x.end);
                self.total += right.len();
                keep.push(right);
            }
        }
        self.ranges.splice(i..j, keep);
    }

    /// Remove every range of `other` from `self`.
    pub fn subtract(&mut self, other: &RangeSet) {
        for r in &other.ranges {
            self.remove(*r);
        }
    }

    /// Drop all coverage at or beyond `end`.
    pub fn clamp_end(&mut self, end: u64) {
        self.remove(ByteRange::new(end, u64::MAX));
    }

    /// True iff every byte of `r` lies in some stored interval.
    #[must_use]
    pub fn contains(&self, r: &ByteRange) -> bool {
        if r.is_empty() {
            return true;
        }
        // Coalesced, so a covered range must sit inside a single interval.
        let idx = self.ranges.partition_point(|x| x.start <= r.start);
        idx > 0 && self.ranges[idx - 1].end >= r.end
    }

    /// The minimal cover of `r` outside the set, in ascending order.
    #[must_use]
    pub fn missing(&self, r: &ByteRange) -> Vec<ByteRange> {
        let mut gaps = Vec::new();
        if r.is_empty() {
            return gaps;
        }
        let mut cursor = r.start;
        let mut idx = self.ranges.partition_point(|x| x.end <= r.start);
        while idx < self.ranges.len() && self.ranges[idx].start < r.end {
            let x = &self.ranges[idx];
            if x.start > cursor {
                gaps.push(ByteRange::new(cursor, x.start));
            }
            cursor = cursor.max(x.end);
            idx += 1;
        }
        if cursor < r.end {
            gaps.push(ByteRange::new(cursor, r.end));
        }
        gaps
    }

    /// Sum of all interval lengths.
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.total
    }

    /// True when the set covers nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Number of disjoint intervals.
    #[must_use]
    pub fn interval_count(&self) -> usize {
        self.ranges.len()
    }

    /// Iterate the intervals in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = &ByteRange> {
        self.ranges.iter()
    }

    /// Remove all coverage.
    pub fn clear(&mut self) {
        self.ranges.clear();
        self.total = 0;
    }

    /// Keep a zero-length `[0, 0)` marker entry so an empty set still
    /// serializes as one entry. The marker covers no bytes and is dropped
    /// again on deserialization; it exists so a sidecar can record "dirty,
    /// but no surviving byte ranges" (a truncate to zero) without an empty
    /// `dirty` list. No-op unless the set is empty.
    pub fn mark_empty(&mut self) {
        if self.ranges.is_empty() {
            self.ranges.push(ByteRange { start: 0, end: 0 });
        }
    }

    /// Rebuild a set from its serialized form.
    ///
    /// Pairs must be sorted ascending and non-overlapping; reversed or
    /// overlapping pairs are rejected so a corrupt sidecar never produces a
    /// silently wrong set. Touching pairs are coalesced, empty pairs dropped.
    pub fn from_pairs(pairs: impl IntoIterator<Item = (u64, u64)>) -> Result<Self, String> {
        let mut set = Self::new();
        let mut prev_end: Option<u64> = None;
        for (start, end) in pairs {
            if end < start {
                return Err(format!("reversed range [{start}, {end})"));
            }
            if start == end {
                continue;
            }
            if let Some(prev) = prev_end
                && start < prev
            {
                return Err(format!(
                    "overlapping or unsorted range [{start}, {end}) after end {prev}"
                ));
            }
            prev_end = Some(end);
            set.insert(ByteRange::new(start, end));
        }
        Ok(set)
    }
}

impl Serialize for RangeSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.ranges.iter().map(|r| (r.start, r.end)))
    }
}

impl<'de> Deserialize<'de> for RangeSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let pairs = Vec::<(u64, u64)>::deserialize(deserializer)?;
        Self::from_pairs(pairs).map_err(D::Error::custom)
    }
}
