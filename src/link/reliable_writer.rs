use std::{
  cmp::max,
  collections::{BTreeMap, BTreeSet},
  sync::{Arc, Mutex},
};

use bytes::Bytes;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use speedy::Endianness;
use enumflags2::BitFlags;

use crate::{
  link::{
    bundler::MetaSubmessage,
    queue_element::{ControlKind, ElementBody, QueueElement},
    reader_record::{DurableSample, ReaderRecord},
    send_buffer::SendBuffer,
  },
  messages::submessages::submessages::*,
  rtps::Submessage,
  structure::{
    duration::Duration,
    guid::{EntityId, GUID},
    sequence_number::{FragmentNumber, SequenceNumber, SequenceNumberSet},
    sequence_set::SequenceSet,
    time::Timestamp,
  },
};

/// Writer-side state transitions that must reach the application, reported
/// out of lock scope.
#[derive(Debug)]
pub(crate) enum WriterEvent {
  Delivered(QueueElement),
  Dropped(QueueElement, bool),
  HandshakeDone { local: GUID, remote: GUID },
}

/// Reliability state of one local writer: its remote reader records, its
/// send buffer, and the submessage generation driven by acks, nacks and
/// timers.
pub(crate) struct ReliableWriter {
  my_guid: GUID,
  pub durable: bool,
  /// Fan nack replies out per reader instead of aggregating. Required for
  /// writers whose outgoing submessages are transformed per reader (the
  /// volatile secure participant writer).
  pub directed_replies: bool,
  endianness: Endianness,

  heartbeat_count: i32,
  heartbeat_frag_count: i32,
  /// Next sequence the application is expected to produce. A jump past
  /// this means the skipped numbers need a GAP.
  expected: SequenceNumber,

  pub readers: BTreeMap<GUID, ReaderRecord>,
  pub send_buff: Arc<Mutex<SendBuffer>>,

  /// Elements awaiting acknowledgement by every associated reader.
  elems_not_acked: BTreeMap<SequenceNumber, QueueElement>,

  max_data_size: usize,
  durable_data_timeout: Duration,
}

impl ReliableWriter {
  pub fn new(
    my_guid: GUID,
    durable: bool,
    nak_depth: usize,
    max_data_size: usize,
    durable_data_timeout: Duration,
    initial_heartbeat_count: i32,
  ) -> Self {
    let directed_replies =
      my_guid.entity_id == EntityId::P2P_BUILTIN_PARTICIPANT_VOLATILE_SECURE_WRITER;
    Self {
      my_guid,
      durable,
      directed_replies,
      endianness: Endianness::LittleEndian,
      heartbeat_count: initial_heartbeat_count,
      heartbeat_frag_count: 0,
      expected: SequenceNumber::new(1),
      readers: BTreeMap::new(),
      send_buff: Arc::new(Mutex::new(SendBuffer::new(nak_depth))),
      elems_not_acked: BTreeMap::new(),
      max_data_size,
      durable_data_timeout,
    }
  }

  pub fn guid(&self) -> GUID {
    self.my_guid
  }

  pub fn heartbeat_count(&self) -> i32 {
    self.heartbeat_count
  }

  fn next_heartbeat_count(&mut self) -> i32 {
    self.heartbeat_count += 1;
    self.heartbeat_count
  }

  pub fn add_reader(&mut self, reader_guid: GUID, durable: bool) {
    if self.readers.contains_key(&reader_guid) {
      return;
    }
    if durable {
      // Keep the current window available until the late joiner has it.
      self.send_buff.lock().unwrap().retain_all(reader_guid);
    }
    self
      .readers
      .insert(reader_guid, ReaderRecord::new(reader_guid, durable));
    info!(
      "writer {:?} associated reader {:?} durable={}",
      self.my_guid, reader_guid, durable
    );
  }

  /// Remove a reader. Returns queue elements whose delivery can no longer
  /// happen (undelivered durable stash), to be reported as dropped.
  pub fn remove_reader(&mut self, reader_guid: GUID) -> Vec<QueueElement> {
    self
      .send_buff
      .lock()
      .unwrap()
      .release_reader_pins(reader_guid);
    match self.readers.remove(&reader_guid) {
      Some(record) => record
        .durable_data
        .into_values()
        .map(|d| d.element)
        .collect(),
      None => Vec::new(),
    }
  }

  pub fn has_readers(&self) -> bool {
    !self.readers.is_empty()
  }

  fn data_flags(&self) -> BitFlags<DATA_Flags> {
    BitFlags::<DATA_Flags>::from_endianness(self.endianness) | DATA_Flags::Data
  }

  fn make_data_submessage(
    &self,
    reader_id: EntityId,
    seq: SequenceNumber,
    payload: &Bytes,
  ) -> Submessage {
    Data {
      reader_id,
      writer_id: self.my_guid.entity_id,
      writer_sn: seq,
      inline_qos: None,
      serialized_payload: Some(payload.clone()),
    }
    .create_submessage(self.data_flags())
  }

  fn make_frag_submessages(
    &self,
    reader_id: EntityId,
    seq: SequenceNumber,
    payload: &Bytes,
  ) -> Vec<(FragmentNumber, bool, Submessage)> {
    let fragment_size = self.max_data_size as u32;
    let data_size = payload.len() as u32;
    // Formula from RTPS spec v2.5 Section "8.3.8.3.5 Logical Interpretation"
    let num_frags = (data_size / fragment_size) + u32::from(data_size % fragment_size != 0);
    let flags = BitFlags::<DATAFRAG_Flags>::from_endianness(self.endianness);

    let mut out = Vec::with_capacity(num_frags as usize);
    for frag_num in 1..=num_frags {
      let from_byte = ((frag_num - 1) * fragment_size) as usize;
      let up_to_before_byte = std::cmp::min((frag_num * fragment_size) as usize, payload.len());
      let submessage = DataFrag {
        reader_id,
        writer_id: self.my_guid.entity_id,
        writer_sn: seq,
        fragment_starting_num: FragmentNumber::new(frag_num),
        fragments_in_submessage: 1,
        data_size,
        fragment_size: fragment_size as u16,
        inline_qos: None,
        serialized_payload: payload.slice(from_byte..up_to_before_byte),
      }
      .create_submessage(flags);
      out.push((FragmentNumber::new(frag_num), frag_num == num_frags, submessage));
    }
    out
  }

  /// A GAP submessage covering the members of `gaps`: the leading
  /// contiguous run as `[gap_start, base)`, the rest as bitmap bits.
  fn gap_from_set(&self, reader_id: EntityId, gaps: &SequenceSet) -> Option<Submessage> {
    let low = gaps.low()?;
    let cum = gaps.cumulative_ack()?;
    let high = gaps.high()?;
    let base = cum.next();
    let gap_list = if high > cum {
      gaps.to_bitmap(base, high, false)
    } else {
      // Nothing beyond the contiguous run; numBits must still be >= 1.
      SequenceNumberSet::new(base, 1)
    };
    let flags = BitFlags::<GAP_Flags>::from_endianness(self.endianness);
    Some(
      Gap {
        reader_id,
        writer_id: self.my_guid.entity_id,
        gap_start: low,
        gap_list,
      }
      .create_submessage(flags),
    )
  }

  fn any_reader_in_backfill(&self) -> bool {
    self
      .readers
      .values()
      .any(|r| r.expecting_durable_data(self.durable_data_timeout))
  }

  /// Emit a GAP for `gaps`. Normally one non-directed submessage reaching
  /// `recipients` (or everyone, if empty); while some durable reader is
  /// still backfilling, converted into directed GAPs to the other readers
  /// so the backfill is not inadvertently advanced.
  fn emit_gap(
    &self,
    gaps: &SequenceSet,
    recipients: BTreeSet<GUID>,
    meta: &mut Vec<MetaSubmessage>,
  ) {
    if gaps.is_empty() {
      return;
    }
    if self.any_reader_in_backfill() {
      for r in self
        .readers
        .values()
        .filter(|r| !r.expecting_durable_data(self.durable_data_timeout))
      {
        if let Some(sm) = self.gap_from_set(r.remote_reader_guid.entity_id, gaps) {
          meta.push(MetaSubmessage::new(self.my_guid, r.remote_reader_guid, sm));
        }
      }
    } else if let Some(sm) = self.gap_from_set(EntityId::UNKNOWN, gaps) {
      meta.push(MetaSubmessage::with_extra_dests(
        self.my_guid,
        GUID::GUID_UNKNOWN,
        recipients,
        sm,
      ));
    }
  }

  // --------------------------------------------------------------
  // Outbound sample customization
  // --------------------------------------------------------------

  /// Process one element from the application queue. Produces the wire
  /// submessages (if any) and updates the send buffer and durable stashes.
  /// Returns true when the heartbeat timer should be (re)enabled.
  pub fn customize_queue_element(
    &mut self,
    element: QueueElement,
    meta: &mut Vec<MetaSubmessage>,
    events: &mut Vec<WriterEvent>,
  ) -> bool {
    match element.body {
      ElementBody::Control(ControlKind::EndHistoricSamples) => {
        let now = Timestamp::now();
        match element.subscription_id {
          Some(sid) => {
            if let Some(r) = self.readers.get_mut(&sid) {
              if r.durable {
                r.durable_timestamp = Some(now);
              }
            }
          }
          None => {
            for r in self.readers.values_mut().filter(|r| r.durable) {
              r.durable_timestamp = Some(now);
            }
          }
        }
        events.push(WriterEvent::Delivered(element));
        true // historic replay staged: heartbeats announce it
      }

      ElementBody::Control(ControlKind::DatawriterLiveliness) => {
        let count = self.next_heartbeat_count();
        let flags = BitFlags::<HEARTBEAT_Flags>::from_endianness(self.endianness)
          | HEARTBEAT_Flags::Final
          | HEARTBEAT_Flags::Liveliness;
        let hb = Heartbeat {
          reader_id: EntityId::UNKNOWN,
          writer_id: self.my_guid.entity_id,
          first_sn: SequenceNumber::new(1),
          last_sn: element.sequence,
          count,
        }
        .create_submessage(flags);
        meta.push(MetaSubmessage::new(self.my_guid, GUID::GUID_UNKNOWN, hb));
        events.push(WriterEvent::Delivered(element));
        false
      }

      ElementBody::Data { ref payload } => {
        let seq = element.sequence;

        // The application skipped sequence numbers: announce the hole so
        // readers do not wait for samples that will never exist.
        if seq > self.expected && self.expected >= SequenceNumber::new(1) {
          let skipped = SequenceSet::from_range(self.expected, seq.previous());
          self.emit_gap(&skipped, BTreeSet::new(), meta);
        }
        if seq >= self.expected {
          self.expected = seq.next();
        }

        // A replayed historical sample directed at one late joiner is not
        // transmitted now: it is stashed and trickled out by the acknack
        // exchange with that reader.
        if element.historic {
          if let Some(sid) = element.subscription_id {
            let submessage = self.make_data_submessage(sid.entity_id, seq, payload);
            if let Some(r) = self.readers.get_mut(&sid) {
              r.durable_data.insert(
                seq,
                DurableSample {
                  submessage,
                  element: element.clone(),
                },
              );
              r.durable_timestamp = Some(Timestamp::now());
              return false;
            }
            // target reader not (yet or anymore) associated: fall through
            // and let it be treated as a live sample.
            debug!(
              "historic sample {:?} for unassociated reader {:?}",
              seq, sid
            );
          }
        }

        let reader_id = element
          .subscription_id
          .map_or(EntityId::UNKNOWN, |sid| sid.entity_id);
        let dst = element.subscription_id.unwrap_or(GUID::GUID_UNKNOWN);

        if payload.len() > self.max_data_size {
          let frags = self.make_frag_submessages(reader_id, seq, payload);
          let mut sb = self.send_buff.lock().unwrap();
          for (frag_num, last, submessage) in frags {
            sb.insert_fragment(seq, frag_num, last, submessage.clone());
            meta.push(MetaSubmessage::new(self.my_guid, dst, submessage));
          }
        } else {
          let submessage = self.make_data_submessage(reader_id, seq, payload);
          self
            .send_buff
            .lock()
            .unwrap()
            .insert(seq, submessage.clone());
          meta.push(MetaSubmessage::new(self.my_guid, dst, submessage));
        }
        self.elems_not_acked.insert(seq, element);
        false
      }
    }
  }

  // --------------------------------------------------------------
  // Heartbeat generation
  // --------------------------------------------------------------

  /// Periodic heartbeat task. Also sweeps expired durable stashes.
  pub fn gather_heartbeats(
    &mut self,
    meta: &mut Vec<MetaSubmessage>,
    events: &mut Vec<WriterEvent>,
  ) {
    let now = Timestamp::now();
    let timeout = self.durable_data_timeout;
    for r in self.readers.values_mut() {
      for element in r.expire_durable_data(now, timeout) {
        events.push(WriterEvent::Dropped(element, false));
      }
    }

    let (sb_low, sb_high, sb_empty) = {
      let sb = self.send_buff.lock().unwrap();
      (sb.low(), sb.high(), sb.is_empty())
    };
    let durable_max = self
      .readers
      .values()
      .filter_map(ReaderRecord::max_durable_seq)
      .max();

    let first_sn = if self.durable {
      SequenceNumber::new(1)
    } else {
      sb_low.unwrap_or(SequenceNumber::new(1))
    };
    let last_sn = max(
      durable_max.unwrap_or(SequenceNumber::zero()),
      sb_high.unwrap_or(SequenceNumber::zero()),
    );

    let pending_requests = self
      .readers
      .values()
      .any(|r| !r.requested_changes.is_empty() || !r.requested_frags.is_empty());
    let is_final = self.elems_not_acked.is_empty() && !pending_requests;

    // Readers that have not completed the handshake yet get a directed,
    // non-final heartbeat to elicit their first acknack.
    let unshaken: Vec<GUID> = self
      .readers
      .values()
      .filter(|r| !r.handshake_done)
      .map(|r| r.remote_reader_guid)
      .collect();
    let hb_flags = BitFlags::<HEARTBEAT_Flags>::from_endianness(self.endianness);
    for reader_guid in unshaken {
      let count = self.next_heartbeat_count();
      let hb = Heartbeat {
        reader_id: reader_guid.entity_id,
        writer_id: self.my_guid.entity_id,
        first_sn,
        last_sn,
        count,
      }
      .create_submessage(hb_flags);
      meta.push(MetaSubmessage::new(self.my_guid, reader_guid, hb));
    }

    // Nothing to announce and nothing owed: stay quiet.
    if sb_empty && durable_max.is_none() && is_final {
      return;
    }

    let count = self.next_heartbeat_count();
    let flags = if is_final {
      hb_flags | HEARTBEAT_Flags::Final
    } else {
      hb_flags
    };
    let hb = Heartbeat {
      reader_id: EntityId::UNKNOWN,
      writer_id: self.my_guid.entity_id,
      first_sn,
      last_sn,
      count,
    }
    .create_submessage(flags);
    meta.push(MetaSubmessage::new(self.my_guid, GUID::GUID_UNKNOWN, hb));

    // Fragmented samples still in flight are announced at the fragment
    // level, so readers can nack individual fragments.
    let fragmented = self.send_buff.lock().unwrap().fragmented_samples();
    let hbf_flags = BitFlags::<HEARTBEATFRAG_Flags>::from_endianness(self.endianness);
    for (seq, last_frag) in fragmented {
      self.heartbeat_frag_count += 1;
      let hbf = HeartbeatFrag {
        reader_id: EntityId::UNKNOWN,
        writer_id: self.my_guid.entity_id,
        writer_sn: seq,
        last_fragment_num: last_frag,
        count: self.heartbeat_frag_count,
      }
      .create_submessage(hbf_flags);
      meta.push(MetaSubmessage::new(self.my_guid, GUID::GUID_UNKNOWN, hbf));
    }
  }

  /// A directed non-final heartbeat for a known-but-not-yet-associated
  /// reader, to get its attention before association completes.
  pub fn gather_preassociation_heartbeat(
    &mut self,
    reader_guid: GUID,
    meta: &mut Vec<MetaSubmessage>,
  ) {
    let (sb_low, sb_high) = {
      let sb = self.send_buff.lock().unwrap();
      (sb.low(), sb.high())
    };
    let count = self.next_heartbeat_count();
    let hb = Heartbeat {
      reader_id: reader_guid.entity_id,
      writer_id: self.my_guid.entity_id,
      first_sn: sb_low.unwrap_or(SequenceNumber::new(1)),
      last_sn: sb_high.unwrap_or(SequenceNumber::zero()),
      count,
    }
    .create_submessage(BitFlags::<HEARTBEAT_Flags>::from_endianness(self.endianness));
    meta.push(MetaSubmessage::new(self.my_guid, reader_guid, hb));
  }

  // --------------------------------------------------------------
  // Acknack / nackfrag arrival
  // --------------------------------------------------------------

  /// Returns true when the nack-reply timer should be requested.
  pub fn handle_acknack(
    &mut self,
    reader_guid: GUID,
    acknack: &AckNack,
    final_flag: bool,
    meta: &mut Vec<MetaSubmessage>,
    events: &mut Vec<WriterEvent>,
  ) -> bool {
    let my_guid = self.my_guid;
    let sb_high = self
      .send_buff
      .lock()
      .unwrap()
      .high()
      .unwrap_or(SequenceNumber::zero());

    // First pass under the record: dedup, handshake, ack bookkeeping, and
    // the durable stash exchange. Gap emission needs `&self`, so it is
    // collected here and emitted after the record borrow ends.
    let mut durable_gaps = SequenceSet::new();
    let mut durable_consumed = false;
    {
      let record = match self.readers.get_mut(&reader_guid) {
        Some(r) => r,
        None => {
          debug!(
            "ACKNACK from unassociated reader {:?} to writer {:?}",
            reader_guid, my_guid
          );
          return false;
        }
      };

      if acknack.count <= record.acknack_recvd_count {
        trace!(
          "duplicate ACKNACK count={} from {:?}",
          acknack.count,
          reader_guid
        );
        return false;
      }
      record.acknack_recvd_count = acknack.count;
      record.last_activity = Timestamp::now();

      if !record.handshake_done {
        record.handshake_done = true;
        events.push(WriterEvent::HandshakeDone {
          local: my_guid,
          remote: reader_guid,
        });
      }

      record.cur_cumulative_ack = acknack.reader_sn_state.base();

      if !record.durable_data.is_empty() {
        // Historic backfill exchange with this reader.
        let durable_max = record.max_durable_seq().unwrap_or(SequenceNumber::zero());
        if record.cur_cumulative_ack > durable_max {
          // The whole stash is acknowledged.
          for (_, ds) in std::mem::take(&mut record.durable_data) {
            events.push(WriterEvent::Delivered(ds.element));
          }
        } else {
          let mut requested: BTreeSet<SequenceNumber> = acknack.reader_sn_state.iter().collect();
          // A non-final acknack whose base sits at the writer's high mark
          // with an empty bitmap asks for exactly that sample.
          let hb_high = max(durable_max, sb_high);
          if requested.is_empty() && !final_flag && acknack.reader_sn_state.base() == hb_high {
            requested.insert(acknack.reader_sn_state.base());
          }

          for seq in requested {
            if let Some(ds) = record.durable_data.get(&seq) {
              meta.push(MetaSubmessage::new(
                my_guid,
                reader_guid,
                ds.submessage.clone(),
              ));
              durable_consumed = true;
            } else if seq <= durable_max {
              // Requested but not stashed and below the stash high: it will
              // never come from here.
              durable_gaps.insert(seq);
            }
          }
        }
      }
    }

    if !durable_gaps.is_empty() {
      if let Some(sm) = self.gap_from_set(reader_guid.entity_id, &durable_gaps) {
        meta.push(MetaSubmessage::new(my_guid, reader_guid, sm));
      }
    }
    if durable_consumed {
      self.process_acked_by_all(events);
      return false;
    }

    // Live (non-durable-stash) path: remember the request for the coalesced
    // nack reply.
    let mut schedule_reply = false;
    if !final_flag || !acknack.reader_sn_state.is_empty() {
      if let Some(record) = self.readers.get_mut(&reader_guid) {
        record.requested_changes.push(acknack.reader_sn_state.clone());
        schedule_reply = true;
      }
    }

    self.process_acked_by_all(events);
    schedule_reply
  }

  /// Returns true when the nack-reply timer should be requested.
  pub fn handle_nackfrag(&mut self, reader_guid: GUID, nackfrag: &NackFrag) -> bool {
    let record = match self.readers.get_mut(&reader_guid) {
      Some(r) => r,
      None => {
        debug!("NACK_FRAG from unassociated reader {:?}", reader_guid);
        return false;
      }
    };
    if nackfrag.count <= record.nackfrag_recvd_count {
      return false;
    }
    record.nackfrag_recvd_count = nackfrag.count;
    record.last_activity = Timestamp::now();

    let entry = record
      .requested_frags
      .entry(nackfrag.writer_sn)
      .or_default();
    entry.insert_from_bitmap(&nackfrag.fragment_number_state);
    true
  }

  /// Everything strictly below the minimum cumulative ack over all readers
  /// is delivered and releasable.
  fn process_acked_by_all(&mut self, events: &mut Vec<WriterEvent>) {
    let min_ack = match self.readers.values().map(|r| r.cur_cumulative_ack).min() {
      Some(m) => m,
      None => return,
    };
    let acked: Vec<SequenceNumber> = self
      .elems_not_acked
      .keys()
      .copied()
      .take_while(|s| *s < min_ack)
      .collect();
    if acked.is_empty() {
      return;
    }
    let mut sb = self.send_buff.lock().unwrap();
    for seq in acked {
      sb.release_acked(seq);
      if let Some(element) = self.elems_not_acked.remove(&seq) {
        events.push(WriterEvent::Delivered(element));
      }
    }
  }

  // --------------------------------------------------------------
  // Nack reply
  // --------------------------------------------------------------

  /// The nack-reply timer fired: answer accumulated requests with resends
  /// and gaps.
  pub fn send_nack_replies(&mut self, meta: &mut Vec<MetaSubmessage>) {
    if self.directed_replies {
      self.send_directed_nack_replies(meta);
      return;
    }

    let my_guid = self.my_guid;

    // 1. Union of requested sequences across readers, and who asked.
    let mut requests = SequenceSet::new();
    let mut recipients: BTreeSet<GUID> = BTreeSet::new();
    for record in self.readers.values_mut() {
      let sets = std::mem::take(&mut record.requested_changes);
      if !sets.is_empty() {
        recipients.insert(record.remote_reader_guid);
      }
      for set in sets {
        for seq in set.iter() {
          requests.insert(seq);
        }
      }
    }

    // 2. Resend what the buffer still has; the rest becomes gaps.
    let mut gaps = SequenceSet::new();
    if !requests.is_empty() {
      let sb = self.send_buff.lock().unwrap();
      if sb.is_empty() {
        gaps = requests.clone();
      } else {
        for (lo, hi) in requests.present_ranges() {
          for sm in sb.resend_range(lo, hi, &mut gaps) {
            meta.push(MetaSubmessage::with_extra_dests(
              my_guid,
              GUID::GUID_UNKNOWN,
              recipients.clone(),
              sm,
            ));
          }
        }
      }
    }

    // 3. Fragment requests, per reader.
    let mut gap_recipients = recipients.clone();
    let frag_requests: Vec<(GUID, Vec<(SequenceNumber, crate::structure::sequence_set::FragmentSet)>)> =
      self
        .readers
        .values_mut()
        .map(|r| {
          (
            r.remote_reader_guid,
            std::mem::take(&mut r.requested_frags).into_iter().collect(),
          )
        })
        .collect();
    {
      let sb = self.send_buff.lock().unwrap();
      for (reader_guid, requested) in frag_requests {
        for (seq, frag_set) in requested {
          match sb.resend_fragments_of(seq, &frag_set) {
            Some(frags) => {
              for sm in frags {
                meta.push(MetaSubmessage::new(my_guid, reader_guid, sm));
              }
            }
            None => {
              gaps.insert(seq);
              gap_recipients.insert(reader_guid);
            }
          }
        }
      }
    }

    // 4. One gap covering everything that is gone.
    self.emit_gap(&gaps, gap_recipients, meta);
  }

  /// Per-reader variant: each reader gets its own resends and gaps, never
  /// aggregated, because each reader's submessages are transformed
  /// independently.
  fn send_directed_nack_replies(&mut self, meta: &mut Vec<MetaSubmessage>) {
    let my_guid = self.my_guid;
    let reader_guids: Vec<GUID> = self.readers.keys().copied().collect();
    for reader_guid in reader_guids {
      let (sets, frag_reqs) = {
        let record = self.readers.get_mut(&reader_guid).unwrap();
        (
          std::mem::take(&mut record.requested_changes),
          std::mem::take(&mut record.requested_frags),
        )
      };
      if sets.is_empty() && frag_reqs.is_empty() {
        continue;
      }
      let mut requests = SequenceSet::new();
      for set in &sets {
        for seq in set.iter() {
          requests.insert(seq);
        }
      }
      let mut gaps = SequenceSet::new();
      {
        let sb = self.send_buff.lock().unwrap();
        if sb.is_empty() {
          gaps = requests.clone();
        } else {
          for (lo, hi) in requests.present_ranges() {
            for sm in sb.resend_range(lo, hi, &mut gaps) {
              meta.push(MetaSubmessage::new(my_guid, reader_guid, sm));
            }
          }
        }
        for (seq, frag_set) in frag_reqs {
          match sb.resend_fragments_of(seq, &frag_set) {
            Some(frags) => {
              for sm in frags {
                meta.push(MetaSubmessage::new(my_guid, reader_guid, sm));
              }
            }
            None => {
              gaps.insert(seq);
            }
          }
        }
      }
      if let Some(sm) = self.gap_from_set(reader_guid.entity_id, &gaps) {
        meta.push(MetaSubmessage::new(my_guid, reader_guid, sm));
      }
    }
  }

  /// Peers silent longer than `deadline` ago.
  pub fn silent_readers(&self, deadline: Timestamp) -> Vec<GUID> {
    self
      .readers
      .values()
      .filter(|r| r.last_activity < deadline)
      .map(|r| r.remote_reader_guid)
      .collect()
  }
}
