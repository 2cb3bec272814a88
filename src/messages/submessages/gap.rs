use std::mem::size_of;

use enumflags2::BitFlags;
use speedy::{Readable, Writable};

use crate::{
  messages::submessages::submessages::SubmessageHeader,
  rtps::{Submessage, SubmessageBody},
  structure::{
    guid::EntityId,
    sequence_number::{SequenceNumber, SequenceNumberSet},
  },
};
use super::{
  submessage::WriterSubmessage, submessage_flag::GAP_Flags, submessage_kind::SubmessageKind,
};

/// This Submessage is sent from an RTPS Writer to an RTPS Reader and
/// indicates to the RTPS Reader that a range of sequence numbers
/// is no longer relevant. The irrelevant set is the contiguous range
/// `[gap_start, gap_list.base)` plus the numbers listed in the bitmap of
/// `gap_list`.
#[derive(Debug, PartialEq, Eq, Clone, Readable, Writable)]
pub struct Gap {
  /// Identifies the Reader Entity that is being informed of the
  /// irrelevance of a set of sequence numbers.
  pub reader_id: EntityId,

  /// Identifies the Writer Entity to which the range of sequence
  /// numbers applies.
  pub writer_id: EntityId,

  /// Identifies the first sequence number in the interval of
  /// irrelevant sequence numbers.
  pub gap_start: SequenceNumber,

  /// Base of the bitmap is one past the end of the contiguous interval;
  /// bitmap bits identify an additional list of irrelevant sequence numbers.
  pub gap_list: SequenceNumberSet,
}

impl Gap {
  pub fn create_submessage(self, flags: BitFlags<GAP_Flags>) -> Submessage {
    Submessage {
      header: SubmessageHeader {
        kind: SubmessageKind::GAP,
        flags: flags.bits(),
        content_length: self.len_serialized() as u16,
      },
      body: SubmessageBody::Writer(WriterSubmessage::Gap(self, flags)),
    }
  }

  pub fn len_serialized(&self) -> usize {
    size_of::<EntityId>() * 2 + size_of::<SequenceNumber>() + self.gap_list.len_serialized()
  }
}
