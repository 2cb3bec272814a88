use std::collections::BTreeMap;

#[allow(unused_imports)]
use log::{debug, error, trace, warn};

use crate::{
  link::queue_element::QueueElement,
  rtps::Submessage,
  structure::{
    duration::Duration,
    guid::GUID,
    sequence_number::{SequenceNumber, SequenceNumberSet},
    sequence_set::FragmentSet,
    time::Timestamp,
  },
};

/// A sample stashed for one late-joining durable reader: the serialized
/// submessage for resending, plus the queue element to report delivery or
/// drop on.
#[derive(Debug, Clone)]
pub(crate) struct DurableSample {
  pub submessage: Submessage,
  pub element: QueueElement,
}

/// What a local writer tracks about one associated remote reader.
#[derive(Debug)]
pub(crate) struct ReaderRecord {
  pub remote_reader_guid: GUID,

  /// The reader requested historical data at association.
  pub durable: bool,

  /// The first non-preemptive acknack has arrived.
  pub handshake_done: bool,

  /// Base of the latest acknack: the reader has everything below this.
  pub cur_cumulative_ack: SequenceNumber,

  /// Nack requests awaiting the coalesced reply.
  pub requested_changes: Vec<SequenceNumberSet>,

  /// Fragment nack requests awaiting the coalesced reply.
  pub requested_frags: BTreeMap<SequenceNumber, FragmentSet>,

  /// Historical samples stashed for this reader only.
  pub durable_data: BTreeMap<SequenceNumber, DurableSample>,

  /// When the last historical sample was committed to the stash.
  pub durable_timestamp: Option<Timestamp>,

  // monotone dedup counters
  pub acknack_recvd_count: i32,
  pub nackfrag_recvd_count: i32,

  /// Last time any submessage from this reader arrived.
  pub last_activity: Timestamp,
}

impl ReaderRecord {
  pub fn new(remote_reader_guid: GUID, durable: bool) -> Self {
    Self {
      remote_reader_guid,
      durable,
      handshake_done: false,
      cur_cumulative_ack: SequenceNumber::zero(),
      requested_changes: Vec::new(),
      requested_frags: BTreeMap::new(),
      durable_data: BTreeMap::new(),
      durable_timestamp: None,
      acknack_recvd_count: -1,
      nackfrag_recvd_count: -1,
      last_activity: Timestamp::now(),
    }
  }

  /// The reader still awaits historical samples: either the stash is
  /// non-empty, or the end-of-history mark was stamped recently enough that
  /// more may still be queued behind it.
  pub fn expecting_durable_data(&self, timeout: Duration) -> bool {
    self.durable
      && (!self.durable_data.is_empty()
        || self
          .durable_timestamp
          .map_or(false, |ts| Timestamp::now() < ts + timeout))
  }

  /// Remove stash entries older than `timeout` and return their elements,
  /// to be reported as dropped.
  pub fn expire_durable_data(&mut self, now: Timestamp, timeout: Duration) -> Vec<QueueElement> {
    let deadline = match self.durable_timestamp {
      Some(ts) => ts + timeout,
      None => return Vec::new(),
    };
    if now < deadline || self.durable_data.is_empty() {
      return Vec::new();
    }
    warn!(
      "durable data for reader {:?} expired undelivered ({} samples)",
      self.remote_reader_guid,
      self.durable_data.len()
    );
    std::mem::take(&mut self.durable_data)
      .into_values()
      .map(|d| d.element)
      .collect()
  }

  pub fn max_durable_seq(&self) -> Option<SequenceNumber> {
    self.durable_data.keys().next_back().copied()
  }
}

#[cfg(test)]
mod tests {
  use bytes::Bytes;
  use enumflags2::BitFlags;

  use super::*;
  use crate::{
    link::queue_element::QueueElement,
    messages::submessages::submessages::{Data, DATA_Flags},
    structure::guid::{EntityId, EntityKind},
  };

  fn stash_entry(writer: GUID, seq: i64) -> DurableSample {
    let element = QueueElement::new_data(
      writer,
      SequenceNumber::from(seq),
      Bytes::from_static(b"old news"),
    );
    let submessage = Data {
      reader_id: EntityId::UNKNOWN,
      writer_id: writer.entity_id,
      writer_sn: SequenceNumber::from(seq),
      inline_qos: None,
      serialized_payload: Some(Bytes::from_static(b"old news")),
    }
    .create_submessage(DATA_Flags::Endianness | DATA_Flags::Data);
    DurableSample {
      submessage,
      element,
    }
  }

  #[test]
  fn durable_expiry_reports_elements_back() {
    let writer = GUID::dummy_test_guid(EntityKind::WRITER_NO_KEY_USER_DEFINED);
    let reader = GUID::dummy_test_guid(EntityKind::READER_NO_KEY_USER_DEFINED);
    let mut rr = ReaderRecord::new(reader, true);
    rr.durable_data
      .insert(SequenceNumber::from(1), stash_entry(writer, 1));
    rr.durable_data
      .insert(SequenceNumber::from(2), stash_entry(writer, 2));
    rr.durable_timestamp = Some(Timestamp::now());

    let timeout = Duration::from_secs(10);
    assert!(rr.expecting_durable_data(timeout));

    // not expired yet
    assert!(rr.expire_durable_data(Timestamp::now(), timeout).is_empty());

    // well past the deadline
    let later = Timestamp::now() + Duration::from_secs(11);
    let dropped = rr.expire_durable_data(later, timeout);
    assert_eq!(dropped.len(), 2);
    assert!(rr.durable_data.is_empty());
  }
}
