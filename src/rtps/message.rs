use std::io;

#[allow(unused_imports)]
use log::{debug, error, trace, warn};
use speedy::{Context, Endianness, Readable, Writable, Writer};
use enumflags2::BitFlags;
use bytes::Bytes;

use crate::{
  messages::{
    header::Header,
    submessages::{
      submessage::WriterSubmessage,
      submessages::{SubmessageKind, *},
    },
  },
  structure::guid::GuidPrefix,
};
use super::{Submessage, SubmessageBody};

/// One RTPS message: header plus a sequence of submessages, the unit that
/// travels in a UDP datagram.
#[derive(Debug, Clone)]
pub struct Message {
  pub header: Header,
  pub submessages: Vec<Submessage>,
}

impl Message {
  pub fn new(header: Header) -> Self {
    Self {
      header,
      submessages: vec![],
    }
  }

  pub fn add_submessage(&mut self, submessage: Submessage) {
    self.submessages.push(submessage);
  }

  /// Serialized size, header included.
  pub fn len_serialized(&self) -> usize {
    20 + self
      .submessages
      .iter()
      .map(Submessage::len_serialized)
      .sum::<usize>()
  }

  // We implement this instead of Speedy trait Readable, because
  // we need to run-time decide which endianness we input. Speedy requires the
  // top level to fix that.
  pub fn read_from_buffer(buffer: &Bytes) -> io::Result<Self> {
    // The Header deserializes the same regardless of endianness.
    let rtps_header =
      Header::read_from_buffer(buffer).map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
    let mut message = Self::new(rtps_header);
    let mut submessages_left: Bytes = buffer.slice(20..); // header is 20 bytes
                                                          // submessage loop
    while !submessages_left.is_empty() {
      let sub_header = SubmessageHeader::read_from_buffer(&submessages_left)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
      // Try to figure out how large this submessage is.
      let sub_header_length = 4; // 4 bytes
      let proposed_sub_content_length = if sub_header.content_length == 0 {
        // RTPS spec 2.3, section 9.4.5.1.3:
        // In case octetsToNextHeader==0 and the kind of Submessage is
        // NOT PAD or INFO_TS, the Submessage is the last Submessage in the
        // Message and extends up to the end of the Message.
        match sub_header.kind {
          SubmessageKind::PAD | SubmessageKind::INFO_TS => 0,
          _not_pad_or_info_ts => submessages_left.len() - sub_header_length,
        }
      } else {
        sub_header.content_length as usize
      };
      // check if the declared content length makes sense
      let sub_content_length = if sub_header_length + proposed_sub_content_length
        <= submessages_left.len()
      {
        proposed_sub_content_length
      } else {
        return Err(io::Error::new(io::ErrorKind::InvalidInput,
            format!("Submessage header declares length larger than remaining message size: {sub_header_length} + {proposed_sub_content_length} <= {}", submessages_left.len())));
      };

      // split first submessage to new buffer
      let mut sub_buffer = submessages_left.split_to(sub_header_length + sub_content_length);
      // split tail part (content) to new buffer
      let sub_content_buffer = sub_buffer.split_off(sub_header_length);

      let e = endianness_flag(sub_header.flags);
      let mk_w_subm = move |s: WriterSubmessage| {
        Ok(Submessage {
          header: sub_header,
          body: SubmessageBody::Writer(s),
        })
      };
      let mk_r_subm = move |s: ReaderSubmessage| {
        Ok(Submessage {
          header: sub_header,
          body: SubmessageBody::Reader(s),
        })
      };
      let mk_i_subm = move |s: InterpreterSubmessage| {
        Ok(Submessage {
          header: sub_header,
          body: SubmessageBody::Interpreter(s),
        })
      };

      let new_submessage_result: io::Result<Submessage> = match sub_header.kind {
        SubmessageKind::DATA => {
          // Flag-dependent layout, so deserialization is manual.
          let f = BitFlags::<DATA_Flags>::from_bits_truncate(sub_header.flags);
          mk_w_subm(WriterSubmessage::Data(
            Data::deserialize_data(&sub_content_buffer, f)?,
            f,
          ))
        }

        SubmessageKind::DATA_FRAG => {
          let f = BitFlags::<DATAFRAG_Flags>::from_bits_truncate(sub_header.flags);
          mk_w_subm(WriterSubmessage::DataFrag(
            DataFrag::deserialize(&sub_content_buffer, f)?,
            f,
          ))
        }

        SubmessageKind::GAP => {
          let f = BitFlags::<GAP_Flags>::from_bits_truncate(sub_header.flags);
          mk_w_subm(WriterSubmessage::Gap(
            Gap::read_from_buffer_with_ctx(e, &sub_content_buffer)?,
            f,
          ))
        }

        SubmessageKind::ACKNACK => {
          let f = BitFlags::<ACKNACK_Flags>::from_bits_truncate(sub_header.flags);
          mk_r_subm(ReaderSubmessage::AckNack(
            AckNack::read_from_buffer_with_ctx(e, &sub_content_buffer)?,
            f,
          ))
        }

        SubmessageKind::NACK_FRAG => {
          let f = BitFlags::<NACKFRAG_Flags>::from_bits_truncate(sub_header.flags);
          mk_r_subm(ReaderSubmessage::NackFrag(
            NackFrag::read_from_buffer_with_ctx(e, &sub_content_buffer)?,
            f,
          ))
        }

        SubmessageKind::HEARTBEAT => {
          let f = BitFlags::<HEARTBEAT_Flags>::from_bits_truncate(sub_header.flags);
          mk_w_subm(WriterSubmessage::Heartbeat(
            Heartbeat::read_from_buffer_with_ctx(e, &sub_content_buffer)?,
            f,
          ))
        }

        SubmessageKind::HEARTBEAT_FRAG => {
          let f = BitFlags::<HEARTBEATFRAG_Flags>::from_bits_truncate(sub_header.flags);
          mk_w_subm(WriterSubmessage::HeartbeatFrag(
            HeartbeatFrag::read_from_buffer_with_ctx(e, &sub_content_buffer)?,
            f,
          ))
        }

        // interpreter submessages
        SubmessageKind::INFO_DST => {
          let f = BitFlags::<INFODESTINATION_Flags>::from_bits_truncate(sub_header.flags);
          mk_i_subm(InterpreterSubmessage::InfoDestination(
            InfoDestination::read_from_buffer_with_ctx(e, &sub_content_buffer)?,
            f,
          ))
        }
        SubmessageKind::INFO_TS
        | SubmessageKind::INFO_SRC
        | SubmessageKind::INFO_REPLY
        | SubmessageKind::INFO_REPLY_IP4
        | SubmessageKind::PAD => {
          // The delivery engine does not act on these. Skip over.
          continue;
        }
        unknown_kind => {
          let kind = u8::from(unknown_kind);
          if kind >= 0x80 {
            // Kinds 0x80 - 0xFF are vendor-specific.
            trace!(
              "Received vendor-specific submessage kind {:?}",
              unknown_kind
            );
            trace!("Submessage was {:?}", &sub_buffer);
          } else {
            // Kind is 0x00 - 0x7F, so it should be in the standard.
            error!("Received unknown submessage kind {:?}", unknown_kind);
            debug!("Submessage was {:?}", &sub_buffer);
          }
          continue;
        }
      }; // match

      message.submessages.push(new_submessage_result?);
    } // loop

    Ok(message)
  }
}

impl Default for Message {
  fn default() -> Self {
    Self {
      header: Header::new(GuidPrefix::UNKNOWN),
      submessages: vec![],
    }
  }
}

impl<C: Context> Writable<C> for Message {
  fn write_to<T: ?Sized + Writer<C>>(&self, writer: &mut T) -> Result<(), C::Error> {
    writer.write_value(&self.header)?;
    for x in &self.submessages {
      writer.write_value(&x)?;
    }
    Ok(())
  }
}

/// Accumulates submessages for one outgoing RTPS message.
#[derive(Default)]
pub(crate) struct MessageBuilder {
  submessages: Vec<Submessage>,
}

impl MessageBuilder {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn dst_submessage(mut self, endianness: Endianness, guid_prefix: GuidPrefix) -> Self {
    let flags = BitFlags::<INFODESTINATION_Flags>::from_endianness(endianness);
    self
      .submessages
      .push(InfoDestination { guid_prefix }.create_submessage(flags));
    self
  }

  /// Append an already-constructed submessage.
  pub fn submessage(mut self, submessage: Submessage) -> Self {
    self.submessages.push(submessage);
    self
  }

  pub fn add_header_and_build(self, guid_prefix: GuidPrefix) -> Message {
    Message {
      header: Header::new(guid_prefix),
      submessages: self.submessages,
    }
  }
}

#[cfg(test)]
mod tests {
  use bytes::Bytes;
  use speedy::Writable;

  use super::*;
  use crate::structure::{
    guid::{EntityId, GuidPrefix},
    sequence_number::SequenceNumber,
  };

  #[test]
  fn message_builder_roundtrip() {
    let prefix = GuidPrefix::new(b"roundtripper");
    let data = Data {
      reader_id: EntityId::UNKNOWN,
      writer_id: EntityId::default(),
      writer_sn: SequenceNumber::from(3),
      inline_qos: None,
      serialized_payload: Some(Bytes::from_static(b"payload here")),
    };
    let heartbeat = Heartbeat {
      reader_id: EntityId::UNKNOWN,
      writer_id: EntityId::default(),
      first_sn: SequenceNumber::from(1),
      last_sn: SequenceNumber::from(3),
      count: 5,
    };

    let message = MessageBuilder::new()
      .dst_submessage(Endianness::LittleEndian, prefix)
      .submessage(data.create_submessage(DATA_Flags::Endianness | DATA_Flags::Data))
      .submessage(heartbeat.create_submessage(
        BitFlags::<HEARTBEAT_Flags>::from_endianness(Endianness::LittleEndian),
      ))
      .add_header_and_build(prefix);

    let bytes = Bytes::from(
      message
        .write_to_vec_with_ctx(Endianness::LittleEndian)
        .unwrap(),
    );
    assert_eq!(bytes.len(), message.len_serialized());

    let reread = Message::read_from_buffer(&bytes).unwrap();
    assert_eq!(reread.header, message.header);
    assert_eq!(reread.submessages, message.submessages);
  }

  #[test]
  fn truncated_message_is_an_error_not_a_panic() {
    use hex_literal::hex;

    let bits = Bytes::copy_from_slice(&hex!(
      "
      52 54 50 53
      02 02 ff ff 01 0f 45 d2 b3 f5 58 b9 01 00 00 00
      15 0b 18 00 00 00 00 00 00 00 02 c2 00 00 00 00
      7d 00 00 00 00 01 00 00
    "
    ));
    // if we get here without panic, the test passes
    let _ = Message::read_from_buffer(&bits);
  }

  #[test]
  fn submessage_longer_than_message_is_rejected() {
    let prefix = GuidPrefix::UNKNOWN;
    let heartbeat = Heartbeat {
      reader_id: EntityId::UNKNOWN,
      writer_id: EntityId::default(),
      first_sn: SequenceNumber::from(1),
      last_sn: SequenceNumber::from(1),
      count: 1,
    };
    let message = MessageBuilder::new()
      .submessage(heartbeat.create_submessage(
        BitFlags::<HEARTBEAT_Flags>::from_endianness(Endianness::LittleEndian),
      ))
      .add_header_and_build(prefix);
    let mut bytes = message
      .write_to_vec_with_ctx(Endianness::LittleEndian)
      .unwrap();
    // inflate the submessage's declared content length
    bytes[22] = 0xFF;
    assert!(Message::read_from_buffer(&Bytes::from(bytes)).is_err());
  }
}
