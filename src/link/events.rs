use bytes::Bytes;

use crate::{
  link::queue_element::QueueElement,
  structure::{guid::GUID, sequence_number::SequenceNumber},
};

/// Callbacks from the delivery engine to the application layer.
///
/// All methods have empty default implementations so that a handler only
/// implements what it observes. Methods are invoked from the reactor thread
/// with no engine locks held; implementations may call back into the
/// [`DataLink`](crate::DataLink).
#[allow(unused_variables)]
pub trait LinkEventHandler: Send + Sync {
  /// A remote writer has been heard from for a local reader.
  fn writer_exists(&self, writer: GUID, reader: GUID) {}

  /// A remote writer has been silent for too long.
  fn writer_does_not_exist(&self, writer: GUID, reader: GUID) {}

  /// A remote reader has been heard from for a local writer.
  fn reader_exists(&self, reader: GUID, writer: GUID) {}

  /// A remote reader has been silent for too long.
  fn reader_does_not_exist(&self, reader: GUID, writer: GUID) {}

  /// The reliability handshake with a newly associated peer completed (or
  /// failed definitively).
  fn association_started(&self, local: GUID, remote: GUID, ok: bool) {}

  /// An outgoing element was delivered: acknowledged by every associated
  /// reliable reader, or consumed locally for control elements.
  fn data_delivered(&self, element: &QueueElement) {}

  /// An outgoing element was dropped before delivery, e.g. a stashed
  /// historical sample that expired.
  fn data_dropped(&self, element: &QueueElement, by_transport: bool) {}

  /// A received sample is ready for the application, in sequence order per
  /// remote writer.
  fn sample_received(&self, reader: GUID, writer: GUID, seq: SequenceNumber, payload: Bytes) {}
}

/// A handler that ignores every event. Useful as a placeholder.
pub struct NullEventHandler;

impl LinkEventHandler for NullEventHandler {}
