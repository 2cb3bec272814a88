//! A reliable, best-effort and durable message-delivery engine implementing
//! the [RTPS](https://www.omg.org/spec/DDSI-RTPS/) wire protocol over UDP.
//!
//! This crate is the reliability state machine and submessage scheduler that
//! sits between an application-side queue of outgoing samples and the UDP
//! send/receive datapath. It fragments and retransmits samples, tracks what
//! each remote peer has acknowledged, produces HEARTBEAT and GAP
//! announcements, consumes ACKNACK and NACK_FRAG requests, reorders and
//! holds received samples until in-order delivery is possible, and bundles
//! response submessages into packet-sized datagrams addressed to the correct
//! union of remote locators.
//!
//! Discovery of peers, QoS policy matching, cryptographic plugins and
//! participant lifecycle are *not* here. A higher layer discovers remote
//! endpoints and calls [`DataLink::associated`] with their locators; this
//! crate takes it from there.
//!
//! # Usage sketch
//!
//! * Build a [`LinkConfig`] and a [`DataLink`] around an event handler.
//! * Register local writers and readers, then `associated()` them with
//!   remote peers as discovery reports them.
//! * Feed outgoing samples through [`DataLink::customize_queue_element`].
//! * Feed received RTPS messages into [`DataLink::received`] and poll
//!   [`DataLink::handle_timed_event`] from the reactor.
//! * Implement [`LinkEventHandler`] to observe delivery, drops, in-order
//!   reception and peer liveness.

#[macro_use]
mod checked_impl;
#[cfg(test)]
#[macro_use]
mod serialization_test;

mod messages;
mod network;
mod rtps;
pub(crate) mod structure;

pub mod link;

// Re-exports from crate root to simplify usage
#[doc(inline)]
pub use link::{
  config::LinkConfig,
  data_link::{DataLink, TransportSender, UdpTransport},
  events::{LinkEventHandler, NullEventHandler},
  queue_element::{ControlKind, ElementBody, QueueElement},
};
pub use structure::{
  duration::Duration,
  guid::{EntityId, EntityKind, GuidPrefix, GUID},
  locator::Locator,
  sequence_number::{FragmentNumber, SequenceNumber},
  sequence_set::{FragmentSet, SequenceSet},
  time::Timestamp,
};
