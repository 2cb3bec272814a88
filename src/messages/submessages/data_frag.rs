use std::{convert::TryInto, io};

use bytes::Bytes;
use speedy::{Context, Error, Readable, Writable, Writer};
use enumflags2::BitFlags;

use crate::structure::{
  guid::EntityId,
  sequence_number::{FragmentNumber, SequenceNumber},
};
use super::{
  data::split_raw_parameter_list,
  submessage::WriterSubmessage,
  submessage_flag::{endianness_flag, DATAFRAG_Flags},
  submessage_header::SubmessageHeader,
  submessage_kind::SubmessageKind,
};
use crate::rtps::{Submessage, SubmessageBody};

/// The DataFrag Submessage extends the Data Submessage by enabling the
/// serializedData to be fragmented and sent as multiple DataFrag Submessages.
/// The fragments contained in the DataFrag Submessages are then re-assembled
/// by the RTPS Reader.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct DataFrag {
  /// Identifies the RTPS Reader entity that is being informed of the change
  /// to the data-object.
  pub reader_id: EntityId,

  /// Identifies the RTPS Writer entity that made the change to the
  /// data-object.
  pub writer_id: EntityId,

  /// Uniquely identifies the change and the relative order for all changes
  /// made by the RTPS Writer identified by the writerGuid.
  pub writer_sn: SequenceNumber,

  /// Indicates the starting fragment for the series of fragments in
  /// serializedData. Fragment numbering starts with number 1.
  pub fragment_starting_num: FragmentNumber,

  /// The number of consecutive fragments contained in this Submessage,
  /// starting at fragment_starting_num.
  pub fragments_in_submessage: u16,

  /// The total size in bytes of the original data before fragmentation.
  pub data_size: u32,

  /// The size of an individual fragment in bytes. The maximum fragment size
  /// equals 64K.
  pub fragment_size: u16,

  /// Raw serialized ParameterList, present only if the InlineQosFlag is set
  /// in the header.
  pub inline_qos: Option<Bytes>,

  /// Encapsulation of a consecutive series of fragments, starting at
  /// fragment_starting_num for a total of fragments_in_submessage.
  /// Represents part of the new value of the data-object.
  pub serialized_payload: Bytes,
}

impl DataFrag {
  /// Total number of fragments the original sample splits into,
  /// from RTPS spec v2.5 Section "8.3.8.3.5 Logical Interpretation".
  pub fn total_number_of_fragments(&self) -> FragmentNumber {
    let data_size = self.data_size;
    let fragment_size = u32::from(self.fragment_size);
    FragmentNumber::new((data_size / fragment_size) + u32::from(data_size % fragment_size != 0))
  }

  pub fn deserialize(buffer: &Bytes, flags: BitFlags<DATAFRAG_Flags>) -> io::Result<Self> {
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
    let fragment_starting_num =
      FragmentNumber::read_from_stream_unbuffered_with_ctx(endianness, &mut cursor)
        .map_err(map_speedy_err)?;
    let fragments_in_submessage =
      u16::read_from_stream_unbuffered_with_ctx(endianness, &mut cursor).map_err(map_speedy_err)?;
    let fragment_size =
      u16::read_from_stream_unbuffered_with_ctx(endianness, &mut cursor).map_err(map_speedy_err)?;
    let data_size =
      u32::read_from_stream_unbuffered_with_ctx(endianness, &mut cursor).map_err(map_speedy_err)?;

    if fragment_size == 0 || u32::from(fragment_size) > data_size {
      return Err(io::Error::new(
        io::ErrorKind::InvalidData,
        format!(
          "DATA_FRAG with fragment_size={fragment_size} but data_size={data_size}.",
        ),
      ));
    }

    // The fixed DATAFRAG header after the octetsToInlineQos field is
    // readerId (4) + writerId (4) + writerSN (8) + fragmentStartingNum (4) +
    // fragmentsInSubmessage (2) + fragmentSize (2) + sampleSize (4) = 28.
    let fixed_header_size: u16 = 28;
    if octets_to_inline_qos < fixed_header_size {
      return Err(io::Error::new(
        io::ErrorKind::InvalidData,
        format!("DATA_FRAG submessage has invalid octets_to_inline_qos={octets_to_inline_qos}."),
      ));
    }
    if octets_to_inline_qos > fixed_header_size {
      let extra_octets = octets_to_inline_qos - fixed_header_size;
      cursor.set_position(cursor.position() + u64::from(extra_octets));

      if cursor.position() > buffer.len().try_into().unwrap() {
        return Err(io::Error::new(
          io::ErrorKind::InvalidData,
          format!(
            "DATA_FRAG octets_to_inline_qos points to byte {}, but submessage len={}.",
            cursor.position(),
            buffer.len()
          ),
        ));
      }
    }

    let inline_qos = if flags.contains(DATAFRAG_Flags::InlineQos) {
      let raw = split_raw_parameter_list(buffer, cursor.position() as usize, endianness)?;
      cursor.set_position(cursor.position() + raw.len() as u64);
      Some(raw)
    } else {
      None
    };

    let serialized_payload = buffer.slice(cursor.position() as usize..);

    Ok(Self {
      reader_id,
      writer_id,
      writer_sn,
      fragment_starting_num,
      fragments_in_submessage,
      data_size,
      fragment_size,
      inline_qos,
      serialized_payload,
    })
  }

  pub fn len_serialized(&self) -> usize {
    2 + // extraFlags
    2 + // octetsToInlineQos
    4 + // readerId
    4 + // writerId
    8 + // writerSN
    4 + // fragmentStartingNum
    2 + // fragmentsInSubmessage
    2 + // fragmentSize
    4 + // sampleSize
    self.inline_qos.as_ref().map(Bytes::len).unwrap_or(0) +
    self.serialized_payload.len()
  }

  pub fn create_submessage(self, flags: BitFlags<DATAFRAG_Flags>) -> Submessage {
    Submessage {
      header: SubmessageHeader {
        kind: SubmessageKind::DATA_FRAG,
        flags: flags.bits(),
        content_length: self.len_serialized() as u16,
      },
      body: SubmessageBody::Writer(WriterSubmessage::DataFrag(self, flags)),
    }
  }
}

impl<C: Context> Writable<C> for DataFrag {
  fn write_to<T: ?Sized + Writer<C>>(&self, writer: &mut T) -> Result<(), C::Error> {
    writer.write_u16(0)?; // extraFlags
    writer.write_u16(28)?; // octetsToInlineQos
    writer.write_value(&self.reader_id)?;
    writer.write_value(&self.writer_id)?;
    writer.write_value(&self.writer_sn)?;
    writer.write_value(&self.fragment_starting_num)?;
    writer.write_u16(self.fragments_in_submessage)?;
    writer.write_u16(self.fragment_size)?;
    writer.write_u32(self.data_size)?;
    if let Some(inline_qos) = self.inline_qos.as_ref() {
      writer.write_bytes(inline_qos)?;
    }
    writer.write_bytes(&self.serialized_payload)?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use speedy::{Endianness, Writable};

  use super::*;

  #[test]
  fn datafrag_roundtrip() {
    let original = DataFrag {
      reader_id: EntityId::default(),
      writer_id: EntityId::default(),
      writer_sn: SequenceNumber::from(7),
      fragment_starting_num: FragmentNumber::new(2),
      fragments_in_submessage: 1,
      data_size: 3000,
      fragment_size: 1024,
      inline_qos: None,
      serialized_payload: Bytes::from(vec![0xAB; 1024]),
    };
    assert_eq!(original.total_number_of_fragments(), FragmentNumber::new(3));

    let serialized = Bytes::from(
      original
        .write_to_vec_with_ctx(Endianness::LittleEndian)
        .unwrap(),
    );
    assert_eq!(serialized.len(), original.len_serialized());

    let flags = BitFlags::from(DATAFRAG_Flags::Endianness);
    let deserialized = DataFrag::deserialize(&serialized, flags).unwrap();
    assert_eq!(deserialized, original);
  }

  #[test]
  fn datafrag_with_zero_fragment_size_is_rejected() {
    let original = DataFrag {
      reader_id: EntityId::default(),
      writer_id: EntityId::default(),
      writer_sn: SequenceNumber::from(1),
      fragment_starting_num: FragmentNumber::new(1),
      fragments_in_submessage: 1,
      data_size: 100,
      fragment_size: 100,
      inline_qos: None,
      serialized_payload: Bytes::from(vec![0u8; 100]),
    };
    let mut serialized = original
      .write_to_vec_with_ctx(Endianness::LittleEndian)
      .unwrap();
    // corrupt fragmentSize (offset: 2+2+4+4+8+4+2 = 26) to zero
    serialized[26] = 0;
    serialized[27] = 0;
    let flags = BitFlags::from(DATAFRAG_Flags::Endianness);
    assert!(DataFrag::deserialize(&Bytes::from(serialized), flags).is_err());
  }
}
