use std::{collections::VecDeque, sync::Mutex};

use bytes::Bytes;
#[allow(unused_imports)]
use log::{debug, trace, warn};

use crate::{
  link::events::LinkEventHandler,
  structure::{guid::GUID, sequence_number::SequenceNumber},
};

/// A received sample whose withholding decision has resolved to "deliver".
#[derive(Debug)]
pub(crate) struct ReadySample {
  pub reader: GUID,
  pub writer: GUID,
  pub seq: SequenceNumber,
  pub payload: Bytes,
}

/// Hands reordered samples to the application, strictly on the reactor
/// thread.
///
/// Receive dispatch runs under endpoint locks and must not call into
/// application code; instead it queues ready samples here, and the reactor
/// drains the queue with no engine locks held. Queuing order is delivery
/// order.
pub(crate) struct HeldDeliveryHandler {
  queue: Mutex<VecDeque<ReadySample>>,
}

impl HeldDeliveryHandler {
  pub fn new() -> Self {
    Self {
      queue: Mutex::new(VecDeque::new()),
    }
  }

  pub fn push_ready(&self, sample: ReadySample) {
    self.queue.lock().unwrap().push_back(sample);
  }

  pub fn has_pending(&self) -> bool {
    !self.queue.lock().unwrap().is_empty()
  }

  /// Deliver everything queued so far. Called only from the reactor thread.
  pub fn drain(&self, handler: &dyn LinkEventHandler) {
    loop {
      // Pop one at a time so a handler that triggers more deliveries does
      // not deadlock against the queue lock.
      let next = self.queue.lock().unwrap().pop_front();
      match next {
        Some(s) => {
          trace!(
            "delivering {:?} from {:?} to {:?}",
            s.seq,
            s.writer,
            s.reader
          );
          handler.sample_received(s.reader, s.writer, s.seq, s.payload);
        }
        None => break,
      }
    }
  }
}
