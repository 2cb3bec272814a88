use std::collections::{BTreeMap, BTreeSet};

#[allow(unused_imports)]
use log::{debug, error, trace, warn};

use crate::{
  rtps::Submessage,
  structure::{
    guid::GUID,
    sequence_number::{FragmentNumber, SequenceNumber},
    sequence_set::{FragmentSet, SequenceSet},
  },
};

/// One sample as stored for retransmission: either a whole DATA submessage
/// or a chain of DATA_FRAG submessages.
#[derive(Debug, Clone)]
pub(crate) struct StoredSample {
  pub data: Option<Submessage>,
  pub frags: BTreeMap<FragmentNumber, Submessage>,
  pub last_frag: Option<FragmentNumber>,
}

impl StoredSample {
  fn new() -> Self {
    Self {
      data: None,
      frags: BTreeMap::new(),
      last_frag: None,
    }
  }
}

/// Bounded per-writer store of sent samples, keyed by sequence number.
///
/// Capacity is fixed at construction; inserting past capacity evicts the
/// oldest entry that is not pinned. `retain_all` pins the current contents
/// for a reader so that a late joiner's repair window does not slide away
/// before it has acknowledged; `release_acked` removes pins and the entry.
///
/// The owning writer keeps this behind its own mutex, distinct from the
/// writer's record mutex: resend paths on the reactor take only this lock.
#[derive(Debug)]
pub(crate) struct SendBuffer {
  capacity: usize,
  samples: BTreeMap<SequenceNumber, StoredSample>,
  // seq -> readers that pinned it
  pins: BTreeMap<SequenceNumber, BTreeSet<GUID>>,
}

impl SendBuffer {
  pub fn new(capacity: usize) -> Self {
    Self {
      capacity: capacity.max(1),
      samples: BTreeMap::new(),
      pins: BTreeMap::new(),
    }
  }

  pub fn is_empty(&self) -> bool {
    self.samples.is_empty()
  }

  pub fn low(&self) -> Option<SequenceNumber> {
    self.samples.keys().next().copied()
  }

  pub fn high(&self) -> Option<SequenceNumber> {
    self.samples.keys().next_back().copied()
  }

  pub fn contains(&self, seq: SequenceNumber) -> bool {
    self.samples.contains_key(&seq)
  }

  pub fn insert(&mut self, seq: SequenceNumber, data: Submessage) {
    let entry = self.samples.entry(seq).or_insert_with(StoredSample::new);
    entry.data = Some(data);
    self.evict_beyond_capacity();
  }

  pub fn insert_fragment(
    &mut self,
    seq: SequenceNumber,
    frag_num: FragmentNumber,
    last: bool,
    frag: Submessage,
  ) {
    let entry = self.samples.entry(seq).or_insert_with(StoredSample::new);
    entry.frags.insert(frag_num, frag);
    if last {
      entry.last_frag = Some(frag_num);
    }
    // Capacity counts samples, not fragments, so only a new sample can
    // push the buffer over.
    self.evict_beyond_capacity();
  }

  fn evict_beyond_capacity(&mut self) {
    while self.samples.len() > self.capacity {
      // The newest entry is the live stream head and is never the victim.
      let newest = match self.samples.keys().next_back() {
        Some(&n) => n,
        None => return,
      };
      let victim = self
        .samples
        .keys()
        .find(|&&seq| seq != newest && !self.pins.contains_key(&seq))
        .copied();
      match victim {
        Some(seq) => {
          trace!("send buffer evicting {:?}", seq);
          self.samples.remove(&seq);
        }
        None => {
          // Everything older is pinned by some late-joining reader. Hold on
          // to the overflow until acks release the pins.
          debug!(
            "send buffer over capacity ({} > {}) but all entries pinned",
            self.samples.len(),
            self.capacity
          );
          return;
        }
      }
    }
  }

  /// Pin every current entry for `reader_guid` so eviction cannot remove it
  /// until the reader acknowledges it.
  pub fn retain_all(&mut self, reader_guid: GUID) {
    for seq in self.samples.keys() {
      self.pins.entry(*seq).or_default().insert(reader_guid);
    }
  }

  /// Remove all pins held by a departing reader.
  pub fn release_reader_pins(&mut self, reader_guid: GUID) {
    self.pins.retain(|_, readers| {
      readers.remove(&reader_guid);
      !readers.is_empty()
    });
  }

  /// Called when `seq` has been acknowledged by all readers: drop the pins
  /// and the entry itself.
  pub fn release_acked(&mut self, seq: SequenceNumber) {
    self.pins.remove(&seq);
    self.samples.remove(&seq);
  }

  /// Collect stored submessages for every present sequence in `[lo, hi]`;
  /// sequences missing from the buffer accumulate into `gaps`.
  pub fn resend_range(
    &self,
    lo: SequenceNumber,
    hi: SequenceNumber,
    gaps: &mut SequenceSet,
  ) -> Vec<Submessage> {
    let mut out = Vec::new();
    for seq in SequenceNumber::range_inclusive(lo, hi) {
      match self.samples.get(&seq) {
        Some(sample) => {
          if let Some(ref data) = sample.data {
            out.push(data.clone());
          } else {
            // fragmented sample: resend the whole chain
            out.extend(sample.frags.values().cloned());
          }
        }
        None => {
          gaps.insert(seq);
        }
      }
    }
    out
  }

  /// Collect only the listed fragments of one stored sample. Returns `None`
  /// when the sample itself is gone from the buffer.
  pub fn resend_fragments_of(
    &self,
    seq: SequenceNumber,
    requested: &FragmentSet,
  ) -> Option<Vec<Submessage>> {
    self.samples.get(&seq).map(|sample| {
      requested
        .present_ranges()
        .iter()
        .flat_map(|&(lo, hi)| FragmentNumber::range_inclusive(lo, hi))
        .filter_map(|f| sample.frags.get(&f).cloned())
        .collect()
    })
  }

  pub fn last_frag_of(&self, seq: SequenceNumber) -> Option<FragmentNumber> {
    self.samples.get(&seq).and_then(|s| s.last_frag)
  }

  /// Stored fragmented samples and their final fragment numbers, for
  /// HEARTBEAT_FRAG generation.
  pub fn fragmented_samples(&self) -> Vec<(SequenceNumber, FragmentNumber)> {
    self
      .samples
      .iter()
      .filter_map(|(seq, s)| s.last_frag.map(|lf| (*seq, lf)))
      .collect()
  }
}
