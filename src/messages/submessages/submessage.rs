use speedy::{Context, Writable, Writer};
use enumflags2::BitFlags;

use crate::messages::submessages::submessages::*;

/// Submessages emitted by a Writer: sample data and availability
/// announcements.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum WriterSubmessage {
  Data(Data, BitFlags<DATA_Flags>),
  DataFrag(DataFrag, BitFlags<DATAFRAG_Flags>),
  Gap(Gap, BitFlags<GAP_Flags>),
  Heartbeat(Heartbeat, BitFlags<HEARTBEAT_Flags>),
  HeartbeatFrag(HeartbeatFrag, BitFlags<HEARTBEATFRAG_Flags>),
}

impl<C: Context> Writable<C> for WriterSubmessage {
  fn write_to<T: ?Sized + Writer<C>>(&self, writer: &mut T) -> Result<(), C::Error> {
    match self {
      Self::Data(s, _) => writer.write_value(s),
      Self::DataFrag(s, _) => writer.write_value(s),
      Self::Gap(s, _) => writer.write_value(s),
      Self::Heartbeat(s, _) => writer.write_value(s),
      Self::HeartbeatFrag(s, _) => writer.write_value(s),
    }
  }
}

/// Submessages emitted by a Reader: acknowledgements and repair requests.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum ReaderSubmessage {
  AckNack(AckNack, BitFlags<ACKNACK_Flags>),
  NackFrag(NackFrag, BitFlags<NACKFRAG_Flags>),
}

impl<C: Context> Writable<C> for ReaderSubmessage {
  fn write_to<T: ?Sized + Writer<C>>(&self, writer: &mut T) -> Result<(), C::Error> {
    match self {
      Self::AckNack(s, _) => writer.write_value(s),
      Self::NackFrag(s, _) => writer.write_value(s),
    }
  }
}

/// Submessages that modify the interpretation of subsequent submessages
/// within the same message.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum InterpreterSubmessage {
  InfoDestination(InfoDestination, BitFlags<INFODESTINATION_Flags>),
}

impl<C: Context> Writable<C> for InterpreterSubmessage {
  fn write_to<T: ?Sized + Writer<C>>(&self, writer: &mut T) -> Result<(), C::Error> {
    match self {
      Self::InfoDestination(s, _) => writer.write_value(s),
    }
  }
}
