use bytes::Bytes;

use crate::structure::{guid::GUID, sequence_number::SequenceNumber};

/// Control samples carry instructions to the delivery engine instead of user
/// payload. They are consumed by the local writer and never transmitted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlKind {
  /// The historical sample replay for a late-joining reader is complete.
  EndHistoricSamples,
  /// The application asserts writer liveliness manually.
  DatawriterLiveliness,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ElementBody {
  Data { payload: Bytes },
  Control(ControlKind),
}

/// One element of the application-side outgoing queue.
///
/// Elements are either user data samples or control samples; the engine
/// distinguishes them by the `body` variant rather than by downcasting.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueElement {
  /// The local writer this element belongs to.
  pub publication_id: GUID,
  /// Directed target reader, if any. `None` addresses all associated
  /// readers.
  pub subscription_id: Option<GUID>,
  /// Sequence number assigned by the application-side queue. Control
  /// samples carry the sequence of the last data sample written.
  pub sequence: SequenceNumber,
  /// A replayed historical sample for a late-joining durable reader. Such
  /// samples are stashed per reader instead of being multicast.
  pub historic: bool,
  pub body: ElementBody,
}

impl QueueElement {
  pub fn new_data(publication_id: GUID, sequence: SequenceNumber, payload: Bytes) -> Self {
    Self {
      publication_id,
      subscription_id: None,
      sequence,
      historic: false,
      body: ElementBody::Data { payload },
    }
  }

  pub fn new_control(
    publication_id: GUID,
    subscription_id: Option<GUID>,
    sequence: SequenceNumber,
    kind: ControlKind,
  ) -> Self {
    Self {
      publication_id,
      subscription_id,
      sequence,
      historic: false,
      body: ElementBody::Control(kind),
    }
  }

  pub fn is_control(&self) -> bool {
    matches!(self.body, ElementBody::Control(_))
  }

  pub fn payload(&self) -> Option<&Bytes> {
    match &self.body {
      ElementBody::Data { payload } => Some(payload),
      ElementBody::Control(_) => None,
    }
  }
}
