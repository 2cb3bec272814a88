use std::{cmp::max, collections::BTreeMap, collections::BTreeSet};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use speedy::Endianness;
use enumflags2::BitFlags;

use crate::{
  link::{
    bundler::MetaSubmessage, fragment_assembler::FragmentAssembler, held_delivery::ReadySample,
    writer_record::WriterRecord,
  },
  messages::submessages::submessages::*,
  structure::{
    guid::GUID,
    sequence_number::{FragmentNumber, FragmentNumberSet, SequenceNumber, SequenceNumberSet},
    time::Timestamp,
  },
};

/// What the reader wants done after a heartbeat has been processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HeartbeatAction {
  Nothing,
  /// First heartbeat from this writer: answer immediately so association
  /// does not wait out the coalescing delay.
  ReplyNow,
  /// Request the (coalescing) heartbeat-response timer.
  ScheduleReply,
}

/// Reliability state of one local reader: its remote writer records and the
/// withhold/deliver decisions, acknack and nackfrag generation.
pub(crate) struct ReliableReader {
  my_guid: GUID,
  pub durable: bool,
  endianness: Endianness,
  pub writers: BTreeMap<GUID, WriterRecord>,
}

impl ReliableReader {
  pub fn new(my_guid: GUID, durable: bool) -> Self {
    Self {
      my_guid,
      durable,
      endianness: Endianness::LittleEndian,
      writers: BTreeMap::new(),
    }
  }

  pub fn guid(&self) -> GUID {
    self.my_guid
  }

  pub fn add_writer(&mut self, writer_guid: GUID) {
    self
      .writers
      .entry(writer_guid)
      .or_insert_with(|| WriterRecord::new(writer_guid));
  }

  pub fn remove_writer(&mut self, writer_guid: GUID) {
    self.writers.remove(&writer_guid);
  }

  pub fn has_writers(&self) -> bool {
    !self.writers.is_empty()
  }

  fn push_delivery(
    &self,
    writer_guid: GUID,
    seq: SequenceNumber,
    payload: bytes::Bytes,
    deliveries: &mut Vec<ReadySample>,
  ) {
    deliveries.push(ReadySample {
      reader: self.my_guid,
      writer: writer_guid,
      seq,
      payload,
    });
  }

  // --------------------------------------------------------------
  // DATA / DATA_FRAG arrival
  // --------------------------------------------------------------

  pub fn handle_data(
    &mut self,
    writer_guid: GUID,
    data: &Data,
    deliveries: &mut Vec<ReadySample>,
  ) {
    let payload = data.serialized_payload.clone().unwrap_or_default();
    let seq = data.writer_sn;

    if !self.writers.contains_key(&writer_guid) {
      // No association: there is no reception record to withhold with, so
      // the sample goes up as-is.
      trace!(
        "DATA from unassociated writer {:?}, delivering directly",
        writer_guid
      );
      self.push_delivery(writer_guid, seq, payload, deliveries);
      return;
    }
    self.accept_sample(writer_guid, seq, payload, deliveries);
  }

  pub fn handle_data_frag(
    &mut self,
    writer_guid: GUID,
    datafrag: &DataFrag,
    deliveries: &mut Vec<ReadySample>,
  ) {
    let seq = datafrag.writer_sn;
    let complete = {
      let record = match self.writers.get_mut(&writer_guid) {
        Some(r) => r,
        None => {
          debug!(
            "DATA_FRAG from unassociated writer {:?}, cannot reassemble",
            writer_guid
          );
          return;
        }
      };
      record.last_activity = Timestamp::now();
      if record.recvd.contains(seq) {
        trace!("duplicate DATA_FRAG for {:?}", seq);
        return;
      }
      let assembler = record
        .fragment_assembler
        .get_or_insert_with(|| FragmentAssembler::new(datafrag.fragment_size));
      assembler.new_datafrag(datafrag)
    };
    if let Some(payload) = complete {
      self.accept_sample(writer_guid, seq, payload, deliveries);
    }
  }

  /// The common withhold-or-deliver decision for a complete sample.
  fn accept_sample(
    &mut self,
    writer_guid: GUID,
    seq: SequenceNumber,
    payload: bytes::Bytes,
    deliveries: &mut Vec<ReadySample>,
  ) {
    let durable = self.durable;
    let deliver_now = {
      let record = match self.writers.get_mut(&writer_guid) {
        Some(r) => r,
        None => return,
      };
      record.last_activity = Timestamp::now();

      if record.recvd.contains(seq) {
        trace!("duplicate sample {:?} from {:?}", seq, writer_guid);
        return;
      }

      let cum = record.cumulative_ack();
      let durable_hold = durable
        && match record.lowest_sample() {
          Some(lowest) => lowest > SequenceNumber::new(1),
          None => seq > SequenceNumber::new(1),
        };
      let hold = record.recvd.disjoint() || cum != seq.previous() || durable_hold;

      record.recvd.insert(seq);
      record.frags.remove(&seq);

      if hold {
        trace!("withholding {:?} from {:?}", seq, writer_guid);
        record.held.insert(seq, payload);
        None
      } else {
        Some(payload)
      }
    };

    if let Some(payload) = deliver_now {
      self.push_delivery(writer_guid, seq, payload, deliveries);
    }
    self.promote_held(writer_guid, deliveries);
  }

  /// Hand over held samples that became contiguous with the resolved
  /// prefix.
  fn promote_held(&mut self, writer_guid: GUID, deliveries: &mut Vec<ReadySample>) {
    let ready = match self.writers.get_mut(&writer_guid) {
      Some(record) => record.take_deliverable(),
      None => return,
    };
    for (seq, payload) in ready {
      self.push_delivery(writer_guid, seq, payload, deliveries);
    }
  }

  // --------------------------------------------------------------
  // GAP arrival
  // --------------------------------------------------------------

  pub fn handle_gap(
    &mut self,
    writer_guid: GUID,
    gap: &Gap,
    deliveries: &mut Vec<ReadySample>,
  ) {
    {
      let record = match self.writers.get_mut(&writer_guid) {
        Some(r) => r,
        None => {
          debug!("GAP from unassociated writer {:?}", writer_guid);
          return;
        }
      };
      record.last_activity = Timestamp::now();

      // Validity, RTPS spec Section 8.3.8.4.3
      if gap.gap_start < SequenceNumber::new(1) || gap.gap_list.base() < SequenceNumber::new(1) {
        debug!(
          "invalid GAP from {:?}: start={:?} list_base={:?}",
          writer_guid,
          gap.gap_start,
          gap.gap_list.base()
        );
        return;
      }

      // The irrelevant set is [gap_start, gap_list.base) plus the bits.
      let contiguous_end = gap.gap_list.base().previous();
      if contiguous_end >= gap.gap_start {
        record.recvd.insert_range(gap.gap_start, contiguous_end);
      }
      for seq in gap.gap_list.iter() {
        record.recvd.insert(seq);
      }
    }
    self.promote_held(writer_guid, deliveries);
  }

  // --------------------------------------------------------------
  // HEARTBEAT / HEARTBEAT_FRAG arrival
  // --------------------------------------------------------------

  pub fn handle_heartbeat(
    &mut self,
    writer_guid: GUID,
    heartbeat: &Heartbeat,
    final_flag: bool,
    liveliness_flag: bool,
    deliveries: &mut Vec<ReadySample>,
  ) -> HeartbeatAction {
    let durable = self.durable;
    let action = {
      let record = match self.writers.get_mut(&writer_guid) {
        Some(r) => r,
        None => {
          debug!("HEARTBEAT from unassociated writer {:?}", writer_guid);
          return HeartbeatAction::Nothing;
        }
      };

      if heartbeat.count <= record.heartbeat_recvd_count {
        trace!(
          "duplicate HEARTBEAT count={} from {:?}",
          heartbeat.count,
          writer_guid
        );
        return HeartbeatAction::Nothing;
      }
      record.heartbeat_recvd_count = heartbeat.count;
      record.last_activity = Timestamp::now();

      let first = heartbeat.first_sn;
      let last = heartbeat.last_sn;
      let prev_last = record.hb_range.1;
      // An empty-range announcement (last < 1) carries no availability
      // information; it is not applied, but a response may still be owed.
      let valid = last >= SequenceNumber::new(1) && first >= SequenceNumber::new(1);

      if valid {
        record.hb_range = (first, last);

        if durable {
          // Below the writer's history low there is nothing to wait for.
          if first > SequenceNumber::new(1) {
            record
              .recvd
              .insert_range(SequenceNumber::zero(), first.previous());
          }
        } else if record.initial_hb {
          // Baseline: what the writer produced before we arrived is not
          // ours to nack. Samples already (even partially) received stay
          // out of the baseline, so their recovery is not cut short.
          let mut baseline_end = last;
          if let Some(lowest) = record.lowest_sample() {
            baseline_end = baseline_end.min(lowest);
          }
          if let Some(lowest_partial) = record
            .fragment_assembler
            .as_ref()
            .and_then(|fa| fa.partially_received_seqs().into_iter().next())
          {
            baseline_end = baseline_end.min(lowest_partial.previous());
          }
          record
            .recvd
            .insert_range(SequenceNumber::zero(), baseline_end);
        }

        // Partial fragments below the writer's low will never complete.
        if let Some(fa) = record.fragment_assembler.as_mut() {
          fa.drop_before(first);
        }

        record.initial_hb = false;
      }

      let cum = record.cumulative_ack();
      let mut should_nack = false;
      if valid {
        let first = heartbeat.first_sn;
        let last = heartbeat.last_sn;
        if record.recvd.disjoint() && cum < last {
          should_nack = true;
        }
        if record.recvd.high().unwrap_or(SequenceNumber::zero()) < last {
          should_nack = true;
        }
        if durable
          && (record.no_samples_resolved()
            || record.lowest_sample().map_or(true, |lowest| lowest > first))
        {
          should_nack = true;
        }
        if let Some(fa) = record.fragment_assembler.as_ref() {
          if fa
            .partially_received_seqs()
            .iter()
            .any(|s| *s >= first && *s <= last)
          {
            should_nack = true;
          }
        }
      }

      if !final_flag || (!liveliness_flag && should_nack) {
        record.ack_pending = true;
        if prev_last == SequenceNumber::zero() && heartbeat.last_sn > SequenceNumber::zero() {
          HeartbeatAction::ReplyNow
        } else {
          HeartbeatAction::ScheduleReply
        }
      } else {
        HeartbeatAction::Nothing
      }
    };
    // A heartbeat can resolve withheld samples via the durable baseline.
    self.promote_held(writer_guid, deliveries);
    action
  }

  /// Returns true when the heartbeat-response timer should be requested.
  pub fn handle_heartbeat_frag(&mut self, writer_guid: GUID, hb_frag: &HeartbeatFrag) -> bool {
    let record = match self.writers.get_mut(&writer_guid) {
      Some(r) => r,
      None => {
        debug!("HEARTBEAT_FRAG from unassociated writer {:?}", writer_guid);
        return false;
      }
    };
    if hb_frag.count <= record.hb_frag_recvd_count {
      return false;
    }
    record.hb_frag_recvd_count = hb_frag.count;
    record.last_activity = Timestamp::now();

    let seq = hb_frag.writer_sn;
    let (hb_low, hb_high) = record.hb_range;
    let outside_hb_range = seq < hb_low || seq > hb_high;
    if outside_hb_range || !record.recvd.contains(seq) {
      record.frags.insert(seq, hb_frag.last_fragment_num);
      record.ack_pending = true;
      true
    } else {
      false
    }
  }

  // --------------------------------------------------------------
  // Acknack / nackfrag generation
  // --------------------------------------------------------------

  /// The heartbeat-response timer fired (or final acks were requested):
  /// produce one ACKNACK per writer owing a reply, plus NACK_FRAGs for
  /// partially received samples.
  pub fn gather_ack_nacks(&mut self, force_final: bool, meta: &mut Vec<MetaSubmessage>) {
    let my_guid = self.my_guid;
    let durable = self.durable;
    let endianness = self.endianness;

    for record in self.writers.values_mut() {
      if !record.ack_pending && !force_final {
        continue;
      }
      let writer_guid = record.remote_writer_guid;
      let (hb_low, hb_high) = record.hb_range;
      let cum = record.cumulative_ack();
      let ack_base = cum.next();

      let one = SequenceNumber::new(1);
      let mut sn_state = if durable
        && record.no_samples_resolved()
        && hb_low >= one
        && hb_high >= hb_low
      {
        // Nothing of the backfill yet: nack the entire advertised range.
        record.recvd.to_bitmap(hb_low, hb_high, true)
      } else if durable
        && hb_low >= one
        && record.lowest_sample().map_or(false, |lowest| lowest > hb_low)
      {
        // The front of the backfill is still missing.
        let lowest = record.lowest_sample().unwrap();
        record.recvd.to_bitmap(hb_low, lowest.previous(), true)
      } else {
        // Ordinary case: everything missing from the cumulative ack up to
        // the later of what we saw and what the writer advertised.
        let end = max(
          record.recvd.high().unwrap_or(SequenceNumber::zero()),
          hb_high,
        );
        record.recvd.to_bitmap(ack_base, end, true)
      };

      // Sequences with partial fragments are the business of NACK_FRAG,
      // not the acknack bitmap.
      let partial: Vec<SequenceNumber> = record
        .fragment_assembler
        .as_ref()
        .map(FragmentAssembler::partially_received_seqs)
        .unwrap_or_default();
      if !partial.is_empty() {
        let filtered: BTreeSet<SequenceNumber> = sn_state
          .iter()
          .filter(|s| !partial.contains(s))
          .collect();
        sn_state = if filtered.is_empty() {
          SequenceNumberSet::new_empty(sn_state.base())
        } else {
          SequenceNumberSet::from_base_and_set(sn_state.base(), &filtered)
        };
      }

      let is_final = force_final || sn_state.is_empty();
      let mut flags = BitFlags::<ACKNACK_Flags>::from_endianness(endianness);
      if is_final {
        flags |= ACKNACK_Flags::Final;
      }
      let acknack = AckNack {
        reader_id: my_guid.entity_id,
        writer_id: writer_guid.entity_id,
        reader_sn_state: sn_state,
        count: record.next_acknack_count(),
      };
      meta.push(MetaSubmessage::new(
        my_guid,
        writer_guid,
        acknack.create_submessage(flags),
      ));

      // NACK_FRAGs: for every unresolved sample with a fragment hint or a
      // partial reassembly, request the missing fragments.
      let mut frag_targets: BTreeSet<SequenceNumber> = partial.iter().copied().collect();
      frag_targets.extend(record.frags.keys().copied());
      let nf_flags = BitFlags::<NACKFRAG_Flags>::from_endianness(endianness);
      for seq in frag_targets {
        if record.recvd.contains(seq) {
          record.frags.remove(&seq);
          continue;
        }
        let mut missing: BTreeSet<FragmentNumber> = record
          .fragment_assembler
          .as_ref()
          .map(|fa| fa.missing_frags_for(seq).collect())
          .unwrap_or_default();
        if let Some(&last_known) = record.frags.get(&seq) {
          if missing.is_empty() {
            // No partial data at all, only the heartbeat-frag hint: every
            // fragment up to the hint is missing.
            missing.extend(
              FragmentNumber::range_inclusive(FragmentNumber::new(1), last_known),
            );
          }
        }
        // Cap to what one submessage can carry.
        let base = match missing.iter().next() {
          Some(&b) => b,
          None => continue,
        };
        let limit = u32::from(base) + 255;
        let capped: BTreeSet<FragmentNumber> = missing
          .into_iter()
          .filter(|f| u32::from(*f) <= limit)
          .collect();
        let nackfrag = NackFrag {
          reader_id: my_guid.entity_id,
          writer_id: writer_guid.entity_id,
          writer_sn: seq,
          fragment_number_state: FragmentNumberSet::from_base_and_set(base, &capped),
          count: record.next_nackfrag_count(),
        };
        meta.push(MetaSubmessage::new(
          my_guid,
          writer_guid,
          nackfrag.create_submessage(nf_flags),
        ));
      }

      record.ack_pending = false;
    }
  }

  /// An acknack with no reception state: announces this reader to a writer
  /// it has not heard from yet, and solicits a heartbeat.
  pub fn gather_preemptive_acknack(&mut self, writer_guid: GUID, meta: &mut Vec<MetaSubmessage>) {
    let my_guid = self.my_guid;
    let endianness = self.endianness;
    if let Some(record) = self.writers.get_mut(&writer_guid) {
      let acknack = AckNack {
        reader_id: my_guid.entity_id,
        writer_id: writer_guid.entity_id,
        reader_sn_state: SequenceNumberSet::new_empty(SequenceNumber::new(1)),
        count: record.next_acknack_count(),
      };
      // Final flag NOT set: this requests an immediate heartbeat.
      meta.push(MetaSubmessage::new(
        my_guid,
        writer_guid,
        acknack.create_submessage(BitFlags::<ACKNACK_Flags>::from_endianness(endianness)),
      ));
    }
  }

  /// Peers silent longer than `deadline` ago.
  pub fn silent_writers(&self, deadline: Timestamp) -> Vec<GUID> {
    self
      .writers
      .values()
      .filter(|r| r.last_activity < deadline)
      .map(|r| r.remote_writer_guid)
      .collect()
  }
}

#[cfg(test)]
mod tests {
  use bytes::Bytes;

  use super::*;
  use crate::{
    rtps::SubmessageBody,
    structure::guid::{EntityId, EntityKind, GuidPrefix},
  };

  fn reader_guid() -> GUID {
    GUID::new(
      GuidPrefix::new(b"reader_test_"),
      EntityId::new([0, 0, 1], EntityKind::READER_NO_KEY_USER_DEFINED),
    )
  }

  fn writer_guid() -> GUID {
    GUID::new(
      GuidPrefix::new(b"writer_test_"),
      EntityId::new([0, 0, 2], EntityKind::WRITER_NO_KEY_USER_DEFINED),
    )
  }

  fn data(seq: i64) -> Data {
    Data {
      reader_id: reader_guid().entity_id,
      writer_id: writer_guid().entity_id,
      writer_sn: SequenceNumber::from(seq),
      inline_qos: None,
      serialized_payload: Some(Bytes::from(format!("sample {seq}"))),
    }
  }

  fn heartbeat(first: i64, last: i64, count: i32) -> Heartbeat {
    Heartbeat {
      reader_id: reader_guid().entity_id,
      writer_id: writer_guid().entity_id,
      first_sn: SequenceNumber::from(first),
      last_sn: SequenceNumber::from(last),
      count,
    }
  }

  fn new_reader() -> ReliableReader {
    let mut r = ReliableReader::new(reader_guid(), false);
    r.add_writer(writer_guid());
    r
  }

  fn delivered_seqs(deliveries: &[ReadySample]) -> Vec<i64> {
    deliveries.iter().map(|d| i64::from(d.seq)).collect()
  }

  #[test]
  fn in_order_samples_deliver_immediately() {
    let mut r = new_reader();
    let mut d = Vec::new();
    for i in 1..=3 {
      r.handle_data(writer_guid(), &data(i), &mut d);
    }
    assert_eq!(delivered_seqs(&d), vec![1, 2, 3]);
  }

  #[test]
  fn out_of_order_samples_are_held_and_promoted() {
    let mut r = new_reader();
    let mut d = Vec::new();
    r.handle_data(writer_guid(), &data(3), &mut d);
    assert!(d.is_empty());
    r.handle_data(writer_guid(), &data(1), &mut d);
    assert_eq!(delivered_seqs(&d), vec![1]);
    r.handle_data(writer_guid(), &data(2), &mut d);
    assert_eq!(delivered_seqs(&d), vec![1, 2, 3]);
  }

  #[test]
  fn duplicates_are_dropped() {
    let mut r = new_reader();
    let mut d = Vec::new();
    r.handle_data(writer_guid(), &data(1), &mut d);
    r.handle_data(writer_guid(), &data(1), &mut d);
    assert_eq!(delivered_seqs(&d), vec![1]);
  }

  #[test]
  fn gap_resolves_skipped_sequences() {
    let mut r = new_reader();
    let mut d = Vec::new();
    r.handle_data(writer_guid(), &data(1), &mut d);
    r.handle_data(writer_guid(), &data(2), &mut d);
    // 5 arrives out of order, 3..4 deliberately skipped
    r.handle_data(writer_guid(), &data(5), &mut d);
    assert_eq!(delivered_seqs(&d), vec![1, 2]);

    let gap = Gap {
      reader_id: reader_guid().entity_id,
      writer_id: writer_guid().entity_id,
      gap_start: SequenceNumber::from(3),
      gap_list: SequenceNumberSet::new_empty(SequenceNumber::from(5)),
    };
    r.handle_gap(writer_guid(), &gap, &mut d);
    assert_eq!(delivered_seqs(&d), vec![1, 2, 5]);
  }

  #[test]
  fn heartbeat_triggers_nack_for_missing() {
    let mut r = new_reader();
    let mut d = Vec::new();
    r.handle_data(writer_guid(), &data(1), &mut d);
    r.handle_data(writer_guid(), &data(2), &mut d);
    r.handle_data(writer_guid(), &data(4), &mut d);
    r.handle_data(writer_guid(), &data(5), &mut d);

    let action = r.handle_heartbeat(writer_guid(), &heartbeat(1, 5, 1), false, false, &mut d);
    assert_eq!(action, HeartbeatAction::ReplyNow);

    let mut meta = Vec::new();
    r.gather_ack_nacks(false, &mut meta);
    assert_eq!(meta.len(), 1);
    match &meta[0].submessage.body {
      SubmessageBody::Reader(ReaderSubmessage::AckNack(an, flags)) => {
        assert_eq!(an.reader_sn_state.base(), SequenceNumber::from(3));
        let missing: Vec<SequenceNumber> = an.reader_sn_state.iter().collect();
        assert_eq!(missing, vec![SequenceNumber::from(3)]);
        assert!(!flags.contains(ACKNACK_Flags::Final));
      }
      other => panic!("expected ACKNACK, got {other:?}"),
    }
  }

  #[test]
  fn complete_reception_produces_final_ack() {
    let mut r = new_reader();
    let mut d = Vec::new();
    for i in 1..=5 {
      r.handle_data(writer_guid(), &data(i), &mut d);
    }
    let action = r.handle_heartbeat(writer_guid(), &heartbeat(1, 5, 1), false, false, &mut d);
    assert_eq!(action, HeartbeatAction::ReplyNow);

    let mut meta = Vec::new();
    r.gather_ack_nacks(false, &mut meta);
    match &meta[0].submessage.body {
      SubmessageBody::Reader(ReaderSubmessage::AckNack(an, flags)) => {
        assert_eq!(an.reader_sn_state.base(), SequenceNumber::from(6));
        assert!(an.reader_sn_state.is_empty());
        assert!(flags.contains(ACKNACK_Flags::Final));
      }
      other => panic!("expected ACKNACK, got {other:?}"),
    }
  }

  #[test]
  fn duplicate_heartbeat_is_ignored() {
    let mut r = new_reader();
    let mut d = Vec::new();
    let a1 = r.handle_heartbeat(writer_guid(), &heartbeat(1, 5, 3), false, false, &mut d);
    assert_ne!(a1, HeartbeatAction::Nothing);
    let a2 = r.handle_heartbeat(writer_guid(), &heartbeat(1, 5, 3), false, false, &mut d);
    assert_eq!(a2, HeartbeatAction::Nothing);
  }

  #[test]
  fn nondurable_baseline_skips_history() {
    let mut r = new_reader();
    let mut d = Vec::new();
    // writer already produced 1..=7 before we joined
    let action = r.handle_heartbeat(writer_guid(), &heartbeat(1, 7, 1), true, false, &mut d);
    // everything baselined: nothing to nack
    assert_eq!(action, HeartbeatAction::Nothing);
    let rec = &r.writers[&writer_guid()];
    assert!(rec.recvd.contains(SequenceNumber::from(7)));

    // live sample 8 delivers in order
    r.handle_data(writer_guid(), &data(8), &mut d);
    assert_eq!(delivered_seqs(&d), vec![8]);
  }

  #[test]
  fn durable_reader_nacks_whole_history() {
    let mut r = ReliableReader::new(reader_guid(), true);
    r.add_writer(writer_guid());
    let mut d = Vec::new();
    let action = r.handle_heartbeat(writer_guid(), &heartbeat(1, 10, 1), true, false, &mut d);
    assert_eq!(action, HeartbeatAction::ReplyNow);

    let mut meta = Vec::new();
    r.gather_ack_nacks(false, &mut meta);
    match &meta[0].submessage.body {
      SubmessageBody::Reader(ReaderSubmessage::AckNack(an, _)) => {
        assert_eq!(an.reader_sn_state.base(), SequenceNumber::from(1));
        let missing: Vec<i64> = an.reader_sn_state.iter().map(i64::from).collect();
        assert_eq!(missing, (1..=10).collect::<Vec<i64>>());
      }
      other => panic!("expected ACKNACK, got {other:?}"),
    }
  }

  #[test]
  fn durable_reader_holds_until_backfill_completes() {
    let mut r = ReliableReader::new(reader_guid(), true);
    r.add_writer(writer_guid());
    let mut d = Vec::new();
    // sample 4 arrives first; a durable reader must not deliver it while
    // 1..3 are still recoverable
    r.handle_data(writer_guid(), &data(4), &mut d);
    assert!(d.is_empty());
    for i in 1..=3 {
      r.handle_data(writer_guid(), &data(i), &mut d);
    }
    assert_eq!(delivered_seqs(&d), vec![1, 2, 3, 4]);
  }

  #[test]
  fn heartbeat_frag_hint_produces_nackfrag() {
    let mut r = new_reader();
    let hb_frag = HeartbeatFrag {
      reader_id: reader_guid().entity_id,
      writer_id: writer_guid().entity_id,
      writer_sn: SequenceNumber::from(7),
      last_fragment_num: FragmentNumber::new(3),
      count: 1,
    };
    assert!(r.handle_heartbeat_frag(writer_guid(), &hb_frag));

    let mut meta = Vec::new();
    r.gather_ack_nacks(false, &mut meta);
    let nackfrags: Vec<&NackFrag> = meta
      .iter()
      .filter_map(|m| match &m.submessage.body {
        SubmessageBody::Reader(ReaderSubmessage::NackFrag(nf, _)) => Some(nf),
        _ => None,
      })
      .collect();
    assert_eq!(nackfrags.len(), 1);
    assert_eq!(nackfrags[0].writer_sn, SequenceNumber::from(7));
    let missing: Vec<u32> = nackfrags[0]
      .fragment_number_state
      .iter()
      .map(u32::from)
      .collect();
    assert_eq!(missing, vec![1, 2, 3]);
  }

  #[test]
  fn unassociated_data_is_delivered_without_withholding() {
    let mut r = ReliableReader::new(reader_guid(), false);
    let mut d = Vec::new();
    r.handle_data(writer_guid(), &data(5), &mut d);
    assert_eq!(delivered_seqs(&d), vec![5]);
  }
}
