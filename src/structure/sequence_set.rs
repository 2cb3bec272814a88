use std::{collections::BTreeMap, fmt::Debug, hash::Hash};

use num_traits::NumOps;
#[allow(unused_imports)]
use log::{debug, error, trace, warn};

use crate::structure::sequence_number::{FragmentNumber, NumberSet, SequenceNumber};

/// Semantic set of sequence (or fragment) numbers, kept as disjoint,
/// non-adjacent inclusive ranges.
///
/// This is the in-memory companion of the wire-form [`NumberSet`] bitmap:
/// reception records, nack request accumulation and gap computation all
/// operate on this, and convert to/from bitmaps only at the submessage
/// boundary.
///
/// Insertion is idempotent and order-independent. An insert of a range lying
/// entirely below `low()` of a non-empty set is rejected, since everything
/// below `low()` has already been resolved by the owner.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NumberRangeSet<N>
where
  N: Clone + Copy + Debug + Hash + PartialEq + Eq + NumOps + From<i64> + Ord,
  i64: From<N>,
{
  // range start -> range end, inclusive both ends.
  // Invariant: ranges neither overlap nor touch: for consecutive entries
  // (a0,a1), (b0,b1) it holds that a1 + 1 < b0.
  ranges: BTreeMap<i64, i64>,
  marker: std::marker::PhantomData<N>,
}

pub type SequenceSet = NumberRangeSet<SequenceNumber>;
pub type FragmentSet = NumberRangeSet<FragmentNumber>;

/// Wire bitmaps cover at most 8 x 32 bits.
pub const BITMAP_BITS_MAX: i64 = 256;

impl<N> NumberRangeSet<N>
where
  N: Clone + Copy + Debug + Hash + PartialEq + Eq + NumOps + From<i64> + Ord,
  i64: From<N>,
{
  pub fn new() -> Self {
    Self {
      ranges: BTreeMap::new(),
      marker: std::marker::PhantomData,
    }
  }

  pub fn is_empty(&self) -> bool {
    self.ranges.is_empty()
  }

  /// Smallest member.
  pub fn low(&self) -> Option<N> {
    self.ranges.iter().next().map(|(&lo, _)| N::from(lo))
  }

  /// Largest member.
  pub fn high(&self) -> Option<N> {
    self.ranges.iter().next_back().map(|(_, &hi)| N::from(hi))
  }

  /// More than one range, i.e. there are interior holes.
  pub fn disjoint(&self) -> bool {
    self.ranges.len() > 1
  }

  /// Largest X such that every number in [low, X] is a member.
  pub fn cumulative_ack(&self) -> Option<N> {
    self.ranges.iter().next().map(|(_, &hi)| N::from(hi))
  }

  /// Start of the last contiguous range.
  pub fn last_ack(&self) -> Option<N> {
    self.ranges.iter().next_back().map(|(&lo, _)| N::from(lo))
  }

  pub fn contains(&self, n: N) -> bool {
    let n = i64::from(n);
    self
      .ranges
      .range(..=n)
      .next_back()
      .map_or(false, |(_, &hi)| n <= hi)
  }

  pub fn insert(&mut self, n: N) -> bool {
    let n = i64::from(n);
    self.insert_i(n, n)
  }

  /// Insert the inclusive range [lo, hi].
  pub fn insert_range(&mut self, lo: N, hi: N) -> bool {
    let (lo, hi) = (i64::from(lo), i64::from(hi));
    if lo > hi {
      error!("insert_range: negative range [{:?},{:?}]", lo, hi);
      return false;
    }
    self.insert_i(lo, hi)
  }

  fn insert_i(&mut self, lo: i64, hi: i64) -> bool {
    if let Some((&first_lo, _)) = self.ranges.iter().next() {
      if hi < first_lo - 1 {
        // Entirely below everything we track. The owner has already resolved
        // numbers below low(), so this would un-resolve them.
        debug!(
          "rejecting insert of [{},{}] below low {}",
          lo, hi, first_lo
        );
        return false;
      }
    }

    // Find all existing ranges that overlap or touch [lo, hi] and merge.
    let mut new_lo = lo;
    let mut new_hi = hi;

    // Candidate to the left: may swallow us or touch us.
    if let Some((&left_lo, &left_hi)) = self.ranges.range(..=lo).next_back() {
      if left_hi + 1 >= lo {
        new_lo = left_lo;
        new_hi = new_hi.max(left_hi);
      }
    }
    // All ranges starting within (new_lo ..= hi+1] get merged in.
    let swallowed: Vec<i64> = self
      .ranges
      .range(new_lo..=hi.saturating_add(1))
      .map(|(&s_lo, &s_hi)| {
        new_hi = new_hi.max(s_hi);
        s_lo
      })
      .collect();
    for s in swallowed {
      self.ranges.remove(&s);
    }
    self.ranges.insert(new_lo, new_hi);
    true
  }

  /// Insert every member of a received wire set, plus nothing else.
  pub fn insert_from_bitmap(&mut self, wire: &NumberSet<N>) {
    for n in wire.iter() {
      self.insert(n);
    }
  }

  /// Inclusive (lo, hi) pairs of all members.
  pub fn present_ranges(&self) -> Vec<(N, N)> {
    self
      .ranges
      .iter()
      .map(|(&lo, &hi)| (N::from(lo), N::from(hi)))
      .collect()
  }

  /// Inclusive (lo, hi) pairs of the interior holes, i.e. numbers between
  /// low() and high() that are not members.
  pub fn missing_ranges(&self) -> Vec<(N, N)> {
    let mut missing = Vec::new();
    let mut prev_hi: Option<i64> = None;
    for (&lo, &hi) in &self.ranges {
      if let Some(p) = prev_hi {
        missing.push((N::from(p + 1), N::from(lo - 1)));
      }
      prev_hi = Some(hi);
    }
    missing
  }

  /// Build a wire bitmap describing the window [base, end], capped at 256
  /// bits. With `invert == false` bits mark members; with `invert == true`
  /// bits mark non-members (the "still missing" form used in ACKNACK).
  ///
  /// Returns an empty set based at `base` when the window is empty.
  pub fn to_bitmap(&self, base: N, end: N, invert: bool) -> NumberSet<N> {
    let base_i = i64::from(base);
    let end_i = i64::from(end).min(base_i + BITMAP_BITS_MAX - 1);
    if end_i < base_i {
      return NumberSet::new_empty(base);
    }
    let mut members = std::collections::BTreeSet::new();
    for n in base_i..=end_i {
      if self.contains(N::from(n)) != invert {
        members.insert(N::from(n));
      }
    }
    NumberSet::from_base_and_set(base, &members)
  }
}

impl SequenceSet {
  /// Convenience constructor for tests and baselining.
  pub fn from_range(lo: SequenceNumber, hi: SequenceNumber) -> Self {
    let mut s = Self::new();
    s.insert_range(lo, hi);
    s
  }
}
