use std::collections::BTreeMap;

use bytes::Bytes;
#[allow(unused_imports)]
use log::{debug, error, trace, warn};

use crate::{
  link::fragment_assembler::FragmentAssembler,
  structure::{
    guid::GUID,
    sequence_number::{FragmentNumber, SequenceNumber},
    sequence_set::SequenceSet,
    time::Timestamp,
  },
};

/// What a local reader tracks about one associated remote writer.
#[derive(Debug)]
pub(crate) struct WriterRecord {
  pub remote_writer_guid: GUID,

  /// Sequence numbers received or resolved (data, or declared irrelevant by
  /// a GAP, or baselined away by a heartbeat).
  pub recvd: SequenceSet,

  /// Samples withheld from the application until in-order delivery is
  /// possible.
  pub held: BTreeMap<SequenceNumber, Bytes>,

  /// `(firstSN, lastSN)` from the most recent valid heartbeat.
  pub hb_range: (SequenceNumber, SequenceNumber),

  /// Last known fragment number per sample, from HEARTBEAT_FRAG.
  pub frags: BTreeMap<SequenceNumber, FragmentNumber>,

  /// A non-final reply is owed to the writer.
  pub ack_pending: bool,

  /// True until the first valid heartbeat baselines this record.
  pub initial_hb: bool,

  // monotone dedup counters for incoming submessages
  pub heartbeat_recvd_count: i32,
  pub hb_frag_recvd_count: i32,

  // outgoing submessage counters
  pub acknack_count: i32,
  pub nackfrag_count: i32,

  /// Reassembly state for inbound DATA_FRAG; created on first fragment.
  pub fragment_assembler: Option<FragmentAssembler>,

  /// Last time any submessage from this writer arrived.
  pub last_activity: Timestamp,
}

impl WriterRecord {
  pub fn new(remote_writer_guid: GUID) -> Self {
    // Valid sample numbering starts at 1, so sequence 0 is "resolved" from
    // the start. Seeding it keeps low() at 0, which lets out-of-order
    // receptions insert freely below earlier arrivals.
    let mut recvd = SequenceSet::new();
    recvd.insert(SequenceNumber::zero());
    Self {
      remote_writer_guid,
      recvd,
      held: BTreeMap::new(),
      hb_range: (SequenceNumber::zero(), SequenceNumber::zero()),
      frags: BTreeMap::new(),
      ack_pending: false,
      initial_hb: true,
      heartbeat_recvd_count: -1,
      hb_frag_recvd_count: -1,
      acknack_count: 0,
      nackfrag_count: 0,
      fragment_assembler: None,
      last_activity: Timestamp::now(),
    }
  }

  pub fn next_acknack_count(&mut self) -> i32 {
    self.acknack_count += 1;
    self.acknack_count
  }

  pub fn next_nackfrag_count(&mut self) -> i32 {
    self.nackfrag_count += 1;
    self.nackfrag_count
  }

  /// Everything below this is resolved: received, irrelevant, or baselined.
  pub fn cumulative_ack(&self) -> SequenceNumber {
    self.recvd.cumulative_ack().unwrap_or(SequenceNumber::zero())
  }

  /// No actual sample has been resolved yet, only the sequence-0 seed.
  pub fn no_samples_resolved(&self) -> bool {
    self
      .recvd
      .high()
      .map_or(true, |h| h == SequenceNumber::zero())
  }

  /// Lowest resolved actual sample (ignoring the sequence-0 seed).
  pub fn lowest_sample(&self) -> Option<SequenceNumber> {
    let one = SequenceNumber::new(1);
    for (lo, hi) in self.recvd.present_ranges() {
      if hi >= one {
        return Some(if lo > one { lo } else { one });
      }
    }
    None
  }

  pub fn is_partially_received(&self, seq: SequenceNumber) -> bool {
    self
      .fragment_assembler
      .as_ref()
      .map_or(false, |fa| fa.is_partially_received(seq))
  }

  /// Take held samples that have become deliverable: contiguous with the
  /// resolved prefix, in increasing sequence order.
  pub fn take_deliverable(&mut self) -> Vec<(SequenceNumber, Bytes)> {
    let cum = self.cumulative_ack();
    let mut out = Vec::new();
    while let Some((&seq, _)) = self.held.iter().next() {
      if seq <= cum {
        let payload = self.held.remove(&seq).unwrap();
        out.push((seq, payload));
      } else {
        break;
      }
    }
    out
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::structure::guid::EntityKind;

  fn sn(i: i64) -> SequenceNumber {
    SequenceNumber::from(i)
  }

  #[test]
  fn held_samples_promote_in_order() {
    let w = GUID::dummy_test_guid(EntityKind::WRITER_NO_KEY_USER_DEFINED);
    let mut rec = WriterRecord::new(w);

    // 3 arrives first, out of order
    rec.recvd.insert(sn(3));
    rec.held.insert(sn(3), Bytes::from_static(b"three"));
    assert!(rec.take_deliverable().is_empty());

    rec.recvd.insert(sn(1));
    rec.recvd.insert(sn(2));
    let ready = rec.take_deliverable();
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].0, sn(3));
    assert!(rec.held.is_empty());
  }

  #[test]
  fn counters_are_monotone() {
    let w = GUID::dummy_test_guid(EntityKind::WRITER_NO_KEY_USER_DEFINED);
    let mut rec = WriterRecord::new(w);
    let a = rec.next_acknack_count();
    let b = rec.next_acknack_count();
    assert!(b > a);
    let c = rec.next_nackfrag_count();
    let d = rec.next_nackfrag_count();
    assert!(d > c);
  }
}
