use std::{collections::BTreeMap, convert::TryInto, fmt};

use bit_vec::BitVec;
use bytes::{Bytes, BytesMut};
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::{
  messages::submessages::submessages::DataFrag,
  structure::sequence_number::{FragmentNumber, SequenceNumber},
  structure::time::Timestamp,
};

// This is for the assembly of a single sample
struct AssemblyBuffer {
  buffer_bytes: BytesMut,
  fragment_count: usize,
  received_bitmap: BitVec,

  #[allow(dead_code)]
  created_time: Timestamp,
  modified_time: Timestamp,
}

impl AssemblyBuffer {
  pub fn new(datafrag: &DataFrag) -> Self {
    let data_size: usize = datafrag.data_size.try_into().unwrap();
    let fragment_size: u16 = datafrag.fragment_size;
    debug!(
      "new AssemblyBuffer data_size={} frag_size={}",
      data_size, fragment_size
    );

    // These are validated at DataFrag deserialization
    assert!(fragment_size as usize <= data_size);
    assert!(fragment_size > 0);

    let mut buffer_bytes = BytesMut::with_capacity(data_size);
    buffer_bytes.resize(data_size, 0);

    let fragment_count = usize::from(datafrag.total_number_of_fragments());

    let now = Timestamp::now();

    Self {
      buffer_bytes,
      fragment_count,
      received_bitmap: BitVec::from_elem(fragment_count, false),
      created_time: now,
      modified_time: now,
    }
  }

  pub fn insert_frags(&mut self, datafrag: &DataFrag, frag_size: u16) {
    let frag_size = usize::from(frag_size);
    let frags_in_subm = usize::from(datafrag.fragments_in_submessage);
    let fragment_starting_num: usize = u32::from(datafrag.fragment_starting_num)
      .try_into()
      .unwrap();
    // number of the first fragment in this submessage, indexing from 0
    let start_frag_from_0 = fragment_starting_num - 1;

    let from_byte = start_frag_from_0 * frag_size;

    // The last fragment might be smaller than fragment size.
    // Copy the reported number of fragments, or as much data as there is,
    // whichever ends first, and clamp to the assembly buffer length.
    let to_before_byte = std::cmp::min(
      from_byte + std::cmp::min(frags_in_subm * frag_size, datafrag.serialized_payload.len()),
      self.buffer_bytes.len(),
    );
    let payload_size = to_before_byte - from_byte;

    if fragment_starting_num < self.fragment_count
      && datafrag.serialized_payload.len() < frags_in_subm * frag_size
    {
      error!("Received DATA_FRAG too small. fragment_starting_num={} out of fragment_count={}, frags_in_subm={}, frag_size={} but payload length={}",
        fragment_starting_num, self.fragment_count, frags_in_subm, frag_size,
        datafrag.serialized_payload.len());
    }

    self.buffer_bytes.as_mut()[from_byte..to_before_byte]
      .copy_from_slice(&datafrag.serialized_payload[..payload_size]);

    for f in 0..frags_in_subm {
      self.received_bitmap.set(start_frag_from_0 + f, true);
    }
    self.modified_time = Timestamp::now();
  }

  pub fn is_complete(&self) -> bool {
    self.received_bitmap.all()
  }
}

/// Assembles fragments from a single remote writer, so there is only one
/// sequence of sequence numbers.
pub(crate) struct FragmentAssembler {
  fragment_size: u16, // number of bytes per fragment; fixed per writer
  assembly_buffers: BTreeMap<SequenceNumber, AssemblyBuffer>,
}

impl fmt::Debug for FragmentAssembler {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("FragmentAssembler")
      .field("fragment_size", &self.fragment_size)
      .field(
        "assembly_buffers",
        &self.assembly_buffers.keys().collect::<Vec<_>>(),
      )
      .finish()
  }
}

impl FragmentAssembler {
  pub fn new(fragment_size: u16) -> Self {
    debug!("new FragmentAssembler. frag_size = {}", fragment_size);
    Self {
      fragment_size,
      assembly_buffers: BTreeMap::new(),
    }
  }

  /// Returns the reassembled payload when the last missing fragment arrives,
  /// and disposes of the assembly buffer.
  pub fn new_datafrag(&mut self, datafrag: &DataFrag) -> Option<Bytes> {
    let writer_sn = datafrag.writer_sn;
    let frag_size = self.fragment_size;

    let abuf = self
      .assembly_buffers
      .entry(datafrag.writer_sn)
      .or_insert_with(|| AssemblyBuffer::new(datafrag));

    abuf.insert_frags(datafrag, frag_size);

    if abuf.is_complete() {
      debug!("new_datafrag: sample {:?} completed", writer_sn);
      self
        .assembly_buffers
        .remove(&writer_sn)
        .map(|abuf| abuf.buffer_bytes.freeze())
    } else {
      trace!("new_datafrag: sample {:?} not complete yet", writer_sn);
      None
    }
  }

  /// Sample for which we have some fragments, but not all.
  pub fn is_partially_received(&self, sn: SequenceNumber) -> bool {
    // The buffer map contains a key if and only if we have some frags but
    // not all: completed buffers are removed on completion.
    self.assembly_buffers.contains_key(&sn)
  }

  pub fn partially_received_seqs(&self) -> Vec<SequenceNumber> {
    self.assembly_buffers.keys().copied().collect()
  }

  pub fn missing_frags_for(
    &self,
    seq: SequenceNumber,
  ) -> Box<dyn '_ + Iterator<Item = FragmentNumber>> {
    match self.assembly_buffers.get(&seq) {
      None => Box::new(std::iter::empty()),
      Some(ab) => {
        let iter = (0..ab.fragment_count)
          .filter(move |f| !ab.received_bitmap.get(*f).unwrap_or(true))
          .map(|f| FragmentNumber::new((f + 1).try_into().unwrap()));
        Box::new(iter)
      }
    }
  }

  /// Drop partial samples below the given sequence. Used when a heartbeat
  /// declares them no longer available.
  pub fn drop_before(&mut self, smallest_to_keep: SequenceNumber) {
    self.assembly_buffers = self.assembly_buffers.split_off(&smallest_to_keep);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::structure::guid::EntityId;

  fn frag(
    sn: i64,
    start: u32,
    frag_size: u16,
    data_size: u32,
    payload: Vec<u8>,
  ) -> DataFrag {
    DataFrag {
      reader_id: EntityId::UNKNOWN,
      writer_id: EntityId::default(),
      writer_sn: SequenceNumber::from(sn),
      fragment_starting_num: FragmentNumber::new(start),
      fragments_in_submessage: 1,
      data_size,
      fragment_size: frag_size,
      inline_qos: None,
      serialized_payload: Bytes::from(payload),
    }
  }

  #[test]
  fn out_of_order_fragments_assemble() {
    let mut fa = FragmentAssembler::new(4);
    // sample 7: 10 bytes => fragments of 4, 4, 2
    assert!(fa.new_datafrag(&frag(7, 3, 4, 10, vec![9, 10])).is_none());
    assert!(fa.is_partially_received(SequenceNumber::from(7)));
    let missing: Vec<FragmentNumber> = fa.missing_frags_for(SequenceNumber::from(7)).collect();
    assert_eq!(
      missing,
      vec![FragmentNumber::new(1), FragmentNumber::new(2)]
    );

    assert!(fa
      .new_datafrag(&frag(7, 1, 4, 10, vec![1, 2, 3, 4]))
      .is_none());
    let complete = fa
      .new_datafrag(&frag(7, 2, 4, 10, vec![5, 6, 7, 8]))
      .expect("should be complete");
    assert_eq!(&complete[..], &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
    assert!(!fa.is_partially_received(SequenceNumber::from(7)));
  }

  #[test]
  fn drop_before_discards_stale_partials() {
    let mut fa = FragmentAssembler::new(4);
    fa.new_datafrag(&frag(3, 1, 4, 8, vec![0; 4]));
    fa.new_datafrag(&frag(9, 1, 4, 8, vec![0; 4]));
    fa.drop_before(SequenceNumber::from(5));
    assert!(!fa.is_partially_received(SequenceNumber::from(3)));
    assert!(fa.is_partially_received(SequenceNumber::from(9)));
  }
}
