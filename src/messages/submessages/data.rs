use std::{convert::TryInto, io};

use bytes::Bytes;
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use speedy::{Context, Endianness, Error, Readable, Writable, Writer};
use enumflags2::BitFlags;

use crate::structure::{guid::EntityId, sequence_number::SequenceNumber};
use super::{
  submessage_flag::{endianness_flag, DATA_Flags},
  submessage_header::SubmessageHeader,
  submessage_kind::SubmessageKind,
};
use crate::rtps::{Submessage, SubmessageBody};
use super::submessage::WriterSubmessage;

// Parameter list sentinel, RTPS spec v2.3 Section 9.6.2.2.1
const PID_SENTINEL: u16 = 0x0001;

/// Walk over a serialized ParameterList and return its raw bytes, sentinel
/// included. The delivery engine forwards inline QoS opaquely; only the list
/// boundary needs to be found.
pub(crate) fn split_raw_parameter_list(
  buffer: &Bytes,
  from: usize,
  endianness: Endianness,
) -> io::Result<Bytes> {
  let mut at = from;
  loop {
    if at + 4 > buffer.len() {
      return Err(io::Error::new(
        io::ErrorKind::InvalidData,
        "ParameterList runs past end of submessage",
      ));
    }
    let (pid, len) = match endianness {
      Endianness::LittleEndian => (
        LittleEndian::read_u16(&buffer[at..]),
        LittleEndian::read_u16(&buffer[at + 2..]),
      ),
      Endianness::BigEndian => (
        BigEndian::read_u16(&buffer[at..]),
        BigEndian::read_u16(&buffer[at + 2..]),
      ),
    };
    at += 4;
    if pid == PID_SENTINEL {
      return Ok(buffer.slice(from..at));
    }
    at += usize::from(len);
  }
}

/// This Submessage is sent from an RTPS Writer (NO_KEY or WITH_KEY)
/// to an RTPS Reader (NO_KEY or WITH_KEY).
///
/// The Submessage notifies the RTPS Reader of a change to
/// a data-object belonging to the RTPS Writer.
///
/// The payload and the optional inline QoS parameter list are carried as
/// raw bytes: the delivery engine does not interpret them, it only moves,
/// stores and retransmits them.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Data {
  /// Identifies the RTPS Reader entity that is being informed of the change
  /// to the data-object.
  pub reader_id: EntityId,

  /// Identifies the RTPS Writer entity that made the change to the
  /// data-object.
  pub writer_id: EntityId,

  /// Uniquely identifies the change and the relative order for all changes
  /// made by the RTPS Writer identified by the writerGuid. Each change
  /// gets a consecutive sequence number. Each RTPS Writer maintains its
  /// own sequence number.
  pub writer_sn: SequenceNumber,

  /// Raw serialized ParameterList, present only if the InlineQosFlag is set
  /// in the header.
  pub inline_qos: Option<Bytes>,

  /// Serialized data (or key, if the KeyFlag is set), opaque to the link.
  pub serialized_payload: Option<Bytes>,
}

impl Data {
  /// DATA submessage cannot be speedy Readable because deserializing it
  /// requires info from the submessage header flags: whether inline QoS
  /// and payload are present.
  pub fn deserialize_data(buffer: &Bytes, flags: BitFlags<DATA_Flags>) -> io::Result<Self> {
    let mut cursor = io::Cursor::new(&buffer);
    let endianness = endianness_flag(flags.bits());
    let map_speedy_err = |p: Error| io::Error::new(io::ErrorKind::Other, p);

    let _extra_flags =
      u16::read_from_stream_unbuffered_with_ctx(endianness, &mut cursor).map_err(map_speedy_err)?;
    let octets_to_inline_qos =
      u16::read_from_stream_unbuffered_with_ctx(endianness, &mut cursor).map_err(map_speedy_err)?;
    let reader_id = EntityId::read_from_stream_unbuffered_with_ctx(endianness, &mut cursor)
      .map_err(map_speedy_err)?;
    let writer_id = EntityId::read_from_stream_unbuffered_with_ctx(endianness, &mut cursor)
      .map_err(map_speedy_err)?;
    let writer_sn = SequenceNumber::read_from_stream_unbuffered_with_ctx(endianness, &mut cursor)
      .map_err(map_speedy_err)?;

    let expect_qos = flags.contains(DATA_Flags::InlineQos);
    let expect_payload = flags.contains(DATA_Flags::Data) || flags.contains(DATA_Flags::Key);

    // The fixed DATA header after the octetsToInlineQos field is
    // readerId (4) + writerId (4) + writerSN (8) = 16 bytes, and
    // octets_to_inline_qos must cover at least that.
    let fixed_header_size: u16 = 16;
    if octets_to_inline_qos < fixed_header_size {
      return Err(io::Error::new(
        io::ErrorKind::InvalidData,
        format!("DATA submessage has invalid octets_to_inline_qos={octets_to_inline_qos}."),
      ));
    }

    // There may be extra data between writerSN and inlineQos if the header is
    // extended in future protocol versions. Skip over it, if any.
    if octets_to_inline_qos > fixed_header_size {
      let extra_octets = octets_to_inline_qos - fixed_header_size;
      cursor.set_position(cursor.position() + u64::from(extra_octets));

      if cursor.position() > buffer.len().try_into().unwrap() {
        return Err(io::Error::new(
          io::ErrorKind::InvalidData,
          format!(
            "DATA submessage octets_to_inline_qos points to byte {}, but submessage len={}.",
            cursor.position(),
            buffer.len()
          ),
        ));
      }
    }

    let inline_qos = if expect_qos {
      let raw = split_raw_parameter_list(buffer, cursor.position() as usize, endianness)?;
      cursor.set_position(cursor.position() + raw.len() as u64);
      Some(raw)
    } else {
      None
    };

    let serialized_payload = if expect_payload {
      Some(buffer.slice(cursor.position() as usize..))
    } else {
      None
    };

    Ok(Self {
      reader_id,
      writer_id,
      writer_sn,
      inline_qos,
      serialized_payload,
    })
  }

  // Serialized length of Data submessage without submessage header.
  // This is compatible with the definition of the "octetsToNextHeader" field
  // in RTPS spec v2.5 Section "9.4.5.1 Submessage Header".
  pub fn len_serialized(&self) -> usize {
    2 + // extraFlags
    2 + // octetsToInlineQos
    4 + // readerId
    4 + // writerId
    8 + // writerSN
    self.inline_qos.as_ref().map(Bytes::len).unwrap_or(0) +
    self.serialized_payload.as_ref().map(Bytes::len).unwrap_or(0)
  }

  pub fn create_submessage(self, flags: BitFlags<DATA_Flags>) -> Submessage {
    Submessage {
      header: SubmessageHeader {
        kind: SubmessageKind::DATA,
        flags: flags.bits(),
        content_length: self.len_serialized() as u16,
      },
      body: SubmessageBody::Writer(WriterSubmessage::Data(self, flags)),
    }
  }
}

impl<C: Context> Writable<C> for Data {
  fn write_to<T: ?Sized + Writer<C>>(&self, writer: &mut T) -> Result<(), C::Error> {
    // extraFlags: all bits zero in this protocol version
    writer.write_u16(0)?;
    // The octetsToInlineQos field contains the number of octets starting from
    // the first octet immediately following this field until the first octet
    // of the inlineQos SubmessageElement. If the inlineQos SubmessageElement
    // is not present, then octetsToInlineQos contains the offset to the next
    // field after where inlineQos would be.
    writer.write_u16(16)?;

    writer.write_value(&self.reader_id)?;
    writer.write_value(&self.writer_id)?;
    writer.write_value(&self.writer_sn)?;
    if let Some(inline_qos) = self.inline_qos.as_ref() {
      writer.write_bytes(inline_qos)?;
    }
    if let Some(serialized_payload) = self.serialized_payload.as_ref() {
      writer.write_bytes(serialized_payload)?;
    }

    Ok(())
  }
}
