use std::{
  collections::{BTreeMap, BTreeSet},
  net::SocketAddr,
  sync::{Arc, Mutex},
};

use bytes::Bytes;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use mio_extras::timer::Timer;

use crate::{
  link::{
    bundler::{bundle_submessages, MetaSubmessage},
    config::{LinkConfig, PEER_SILENCE_PERIODS},
    events::LinkEventHandler,
    held_delivery::HeldDeliveryHandler,
    queue_element::QueueElement,
    reliable_reader::{HeartbeatAction, ReliableReader},
    reliable_writer::{ReliableWriter, WriterEvent},
  },
  messages::submessages::{
    submessage::{InterpreterSubmessage, ReaderSubmessage, WriterSubmessage},
    submessage_flag::{ACKNACK_Flags, HEARTBEAT_Flags},
  },
  network::udp_sender::UDPSender,
  rtps::{Message, SubmessageBody},
  structure::{
    guid::{EntityId, GuidPrefix, GUID},
    time::Timestamp,
  },
};

/// The datagram output seam. Production use wraps [`UDPSender`]; tests plug
/// in an in-memory implementation.
pub trait TransportSender: Send + Sync {
  fn send(&self, datagram: &Bytes, addresses: &BTreeSet<SocketAddr>);
}

/// Sends datagrams through the UDP sockets.
pub struct UdpTransport {
  sender: UDPSender,
}

impl UdpTransport {
  pub fn new(sender: UDPSender) -> Self {
    Self { sender }
  }
}

impl TransportSender for UdpTransport {
  fn send(&self, datagram: &Bytes, addresses: &BTreeSet<SocketAddr>) {
    for addr in addresses {
      self.sender.send_to_address(datagram, *addr);
    }
  }
}

/// Relay keep-alive tag; the RTPS relay recognizes exactly these bytes.
const RELAY_BEACON: [u8; 8] = *b"OpenDDS\0";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TimedEvent {
  Heartbeat,
  HeartbeatChecker,
  NackReply,
  HeartbeatReply,
  RelayBeacon,
}

/// Where a remote peer can be reached. When an overlay (server-reflexive)
/// address is known and differs from the locally advertised one, the overlay
/// address wins.
#[derive(Debug, Clone)]
pub(crate) struct RemoteInfo {
  pub address: SocketAddr,
  pub overlay_address: Option<SocketAddr>,
  #[allow(dead_code)] // recorded for the outbound path; inline QoS is opaque here
  pub requires_inline_qos: bool,
}

impl RemoteInfo {
  fn effective_address(&self) -> SocketAddr {
    match self.overlay_address {
      Some(overlay) if overlay != self.address => overlay,
      _ => self.address,
    }
  }
}

struct LinkInner {
  writers: BTreeMap<GUID, Arc<Mutex<ReliableWriter>>>,
  readers: BTreeMap<GUID, Arc<Mutex<ReliableReader>>>,

  locators: BTreeMap<GUID, RemoteInfo>,

  // association maps
  writer_to_remote_readers: BTreeMap<GUID, BTreeSet<GUID>>,
  reader_to_remote_writers: BTreeMap<GUID, BTreeSet<GUID>>,
  remote_writer_to_local_readers: BTreeMap<GUID, BTreeSet<GUID>>,

  // peers we are told about before association completes
  interesting_readers: BTreeMap<GUID, BTreeSet<GUID>>,
  interesting_writers: BTreeMap<GUID, BTreeSet<GUID>>,

  // a released writer leaves its heartbeat count here so a reassociation
  // continues the monotone sequence
  preserved_heartbeat_counts: BTreeMap<GUID, i32>,

  timer: Timer<TimedEvent>,
  nack_reply_scheduled: bool,
  heartbeat_reply_scheduled: bool,
}

impl LinkInner {
  fn addresses_for(&self, from: GUID, dst: GUID) -> BTreeSet<SocketAddr> {
    let mut out = BTreeSet::new();
    if dst == GUID::GUID_UNKNOWN {
      // every peer reachable from this endpoint
      let mut peers: BTreeSet<GUID> = BTreeSet::new();
      if let Some(rs) = self.writer_to_remote_readers.get(&from) {
        peers.extend(rs.iter().copied());
      }
      if let Some(ws) = self.reader_to_remote_writers.get(&from) {
        peers.extend(ws.iter().copied());
      }
      if let Some(rs) = self.interesting_readers.get(&from) {
        peers.extend(rs.iter().copied());
      }
      if let Some(ws) = self.interesting_writers.get(&from) {
        peers.extend(ws.iter().copied());
      }
      for peer in peers {
        if let Some(addr) = self.address_of(peer) {
          out.insert(addr);
        }
      }
    } else if let Some(addr) = self.address_of(dst) {
      out.insert(addr);
    }
    out
  }

  fn address_of(&self, remote: GUID) -> Option<SocketAddr> {
    self
      .locators
      .get(&remote)
      .or_else(|| self.locators.get(&remote.participant_guid()))
      .map(RemoteInfo::effective_address)
  }

  fn schedule(&mut self, delay: std::time::Duration, event: TimedEvent) {
    self.timer.set_timeout(delay, event);
  }
}

/// The composition root of the delivery engine.
///
/// Owns the per-endpoint reliability state, the locator table, the timers
/// and the bundling pipeline. Incoming submessages are dispatched to the
/// right endpoint record; produced submessages are funneled through the
/// bundler to the transport.
///
/// Locking is coarse on the maps (`inner`) and fine per endpoint; the order
/// is always DataLink then endpoint then send-buffer, and no callback is
/// invoked with any of these held.
pub struct DataLink {
  config: LinkConfig,
  local_prefix: GuidPrefix,
  handler: Arc<dyn LinkEventHandler>,
  transport: Arc<dyn TransportSender>,
  held_delivery: HeldDeliveryHandler,
  inner: Mutex<LinkInner>,
}

impl DataLink {
  pub fn new(
    config: LinkConfig,
    local_prefix: GuidPrefix,
    handler: Arc<dyn LinkEventHandler>,
    transport: Arc<dyn TransportSender>,
  ) -> Self {
    let mut timer = mio_extras::timer::Builder::default().build();
    let heartbeat_period = config.heartbeat_period.to_std();
    timer.set_timeout(heartbeat_period, TimedEvent::Heartbeat);
    timer.set_timeout(heartbeat_period, TimedEvent::HeartbeatChecker);
    if config.rtps_relay_address.is_some() {
      timer.set_timeout(heartbeat_period, TimedEvent::RelayBeacon);
    }

    Self {
      config,
      local_prefix,
      handler,
      transport,
      held_delivery: HeldDeliveryHandler::new(),
      inner: Mutex::new(LinkInner {
        writers: BTreeMap::new(),
        readers: BTreeMap::new(),
        locators: BTreeMap::new(),
        writer_to_remote_readers: BTreeMap::new(),
        reader_to_remote_writers: BTreeMap::new(),
        remote_writer_to_local_readers: BTreeMap::new(),
        interesting_readers: BTreeMap::new(),
        interesting_writers: BTreeMap::new(),
        preserved_heartbeat_counts: BTreeMap::new(),
        timer,
        nack_reply_scheduled: false,
        heartbeat_reply_scheduled: false,
      }),
    }
  }

  pub fn local_prefix(&self) -> GuidPrefix {
    self.local_prefix
  }

  // --------------------------------------------------------------
  // Registration and association
  // --------------------------------------------------------------

  pub fn register_local_writer(&self, guid: GUID, durable: bool) {
    let mut inner = self.inner.lock().unwrap();
    let initial_count = inner
      .preserved_heartbeat_counts
      .get(&guid)
      .copied()
      .unwrap_or(0);
    inner.writers.entry(guid).or_insert_with(|| {
      Arc::new(Mutex::new(ReliableWriter::new(
        guid,
        durable,
        self.config.nak_depth,
        self.config.max_data_size,
        self.config.durable_data_timeout,
        initial_count,
      )))
    });
  }

  pub fn register_local_reader(&self, guid: GUID, durable: bool) {
    let mut inner = self.inner.lock().unwrap();
    inner
      .readers
      .entry(guid)
      .or_insert_with(|| Arc::new(Mutex::new(ReliableReader::new(guid, durable))));
  }

  /// Record or update how to reach a remote endpoint.
  pub fn add_locator(&self, remote: GUID, address: SocketAddr, requires_inline_qos: bool) {
    let mut inner = self.inner.lock().unwrap();
    inner
      .locators
      .entry(remote)
      .and_modify(|info| {
        info.address = address;
        info.requires_inline_qos = requires_inline_qos;
      })
      .or_insert(RemoteInfo {
        address,
        overlay_address: None,
        requires_inline_qos,
      });
  }

  /// Record a NAT-traversal (server-reflexive) address for a remote peer.
  /// It supersedes the direct address whenever the two differ.
  pub fn add_overlay_address(&self, remote: GUID, address: SocketAddr) {
    let mut inner = self.inner.lock().unwrap();
    if let Some(info) = inner.locators.get_mut(&remote) {
      info.overlay_address = Some(address);
    } else {
      inner.locators.insert(
        remote,
        RemoteInfo {
          address,
          overlay_address: Some(address),
          requires_inline_qos: false,
        },
      );
    }
  }

  /// Complete an association between a local endpoint and a remote peer.
  /// The direction is derived from the local entity kind.
  pub fn associated(&self, local: GUID, remote: GUID, remote_durable: bool) {
    if local.entity_id.kind().is_writer() {
      let writer = {
        let mut inner = self.inner.lock().unwrap();
        inner
          .writer_to_remote_readers
          .entry(local)
          .or_default()
          .insert(remote);
        inner.interesting_readers.entry(local).or_default().remove(&remote);
        inner.writers.get(&local).cloned()
      };
      if let Some(writer) = writer {
        let mut meta = Vec::new();
        {
          let mut w = writer.lock().unwrap();
          w.add_reader(remote, remote_durable);
          // a first, directed heartbeat invites the reader's acknack
          w.gather_preassociation_heartbeat(remote, &mut meta);
        }
        self.flush_meta(meta);
      } else {
        warn!("associated: local writer {:?} is not registered", local);
      }
    } else {
      let reader = {
        let mut inner = self.inner.lock().unwrap();
        inner
          .reader_to_remote_writers
          .entry(local)
          .or_default()
          .insert(remote);
        inner
          .remote_writer_to_local_readers
          .entry(remote)
          .or_default()
          .insert(local);
        inner.interesting_writers.entry(local).or_default().remove(&remote);
        inner.readers.get(&local).cloned()
      };
      if let Some(reader) = reader {
        let mut meta = Vec::new();
        {
          let mut r = reader.lock().unwrap();
          r.add_writer(remote);
          r.gather_preemptive_acknack(remote, &mut meta);
        }
        self.flush_meta(meta);
      } else {
        warn!("associated: local reader {:?} is not registered", local);
      }
    }
  }

  /// Drop the association between a local endpoint and a remote peer.
  /// The last release of an endpoint garbage-collects it; a writer's
  /// heartbeat count is preserved for a possible reassociation.
  pub fn release_reservations(&self, local: GUID, remote: GUID) {
    let mut dropped_elements = Vec::new();
    if local.entity_id.kind().is_writer() {
      let mut inner = self.inner.lock().unwrap();
      if let Some(set) = inner.writer_to_remote_readers.get_mut(&local) {
        set.remove(&remote);
      }
      if let Some(writer) = inner.writers.get(&local).cloned() {
        let (gone, count) = {
          let mut w = writer.lock().unwrap();
          dropped_elements = w.remove_reader(remote);
          (!w.has_readers(), w.heartbeat_count())
        };
        if gone {
          inner.preserved_heartbeat_counts.insert(local, count);
          inner.writers.remove(&local);
          inner.writer_to_remote_readers.remove(&local);
          info!("writer {:?} released, heartbeat count preserved", local);
        }
      }
    } else {
      let mut inner = self.inner.lock().unwrap();
      if let Some(set) = inner.reader_to_remote_writers.get_mut(&local) {
        set.remove(&remote);
      }
      if let Some(set) = inner.remote_writer_to_local_readers.get_mut(&remote) {
        set.remove(&local);
      }
      if let Some(reader) = inner.readers.get(&local).cloned() {
        let gone = {
          let mut r = reader.lock().unwrap();
          r.remove_writer(remote);
          !r.has_writers()
        };
        if gone {
          inner.readers.remove(&local);
          inner.reader_to_remote_writers.remove(&local);
        }
      }
    }
    for element in dropped_elements {
      self.handler.data_dropped(&element, true);
    }
  }

  /// Make a not-yet-associated remote reader a heartbeat recipient of a
  /// local writer.
  pub fn register_for_reader(&self, writer: GUID, reader: GUID, address: SocketAddr) {
    let writer_arc = {
      let mut inner = self.inner.lock().unwrap();
      inner
        .interesting_readers
        .entry(writer)
        .or_default()
        .insert(reader);
      inner.locators.entry(reader).or_insert(RemoteInfo {
        address,
        overlay_address: None,
        requires_inline_qos: false,
      });
      inner.writers.get(&writer).cloned()
    };
    if let Some(writer_arc) = writer_arc {
      let mut meta = Vec::new();
      writer_arc
        .lock()
        .unwrap()
        .gather_preassociation_heartbeat(reader, &mut meta);
      self.flush_meta(meta);
    }
  }

  pub fn unregister_for_reader(&self, writer: GUID, reader: GUID) {
    let mut inner = self.inner.lock().unwrap();
    if let Some(set) = inner.interesting_readers.get_mut(&writer) {
      set.remove(&reader);
    }
  }

  /// Make a not-yet-associated remote writer an acknack recipient of a
  /// local reader.
  pub fn register_for_writer(&self, reader: GUID, writer: GUID, address: SocketAddr) {
    let reader_arc = {
      let mut inner = self.inner.lock().unwrap();
      inner
        .interesting_writers
        .entry(reader)
        .or_default()
        .insert(writer);
      inner.locators.entry(writer).or_insert(RemoteInfo {
        address,
        overlay_address: None,
        requires_inline_qos: false,
      });
      inner.readers.get(&reader).cloned()
    };
    if let Some(reader_arc) = reader_arc {
      let mut meta = Vec::new();
      {
        let mut r = reader_arc.lock().unwrap();
        r.add_writer(writer);
        r.gather_preemptive_acknack(writer, &mut meta);
      }
      self.flush_meta(meta);
    }
  }

  pub fn unregister_for_writer(&self, reader: GUID, writer: GUID) {
    let mut inner = self.inner.lock().unwrap();
    if let Some(set) = inner.interesting_writers.get_mut(&reader) {
      set.remove(&writer);
    }
  }

  // --------------------------------------------------------------
  // Outbound path
  // --------------------------------------------------------------

  /// Feed one element of the application queue through the owning writer.
  pub fn customize_queue_element(&self, element: QueueElement) {
    let writer = {
      let inner = self.inner.lock().unwrap();
      inner.writers.get(&element.publication_id).cloned()
    };
    let writer = match writer {
      Some(w) => w,
      None => {
        warn!(
          "customize_queue_element: unknown writer {:?}",
          element.publication_id
        );
        self.handler.data_dropped(&element, true);
        return;
      }
    };

    let mut meta = Vec::new();
    let mut events = Vec::new();
    let _heartbeat_wanted = writer
      .lock()
      .unwrap()
      .customize_queue_element(element, &mut meta, &mut events);
    // The periodic heartbeat task runs regardless; an explicit enable is
    // unnecessary because the task skips quiet writers.

    self.flush_meta(meta);
    self.dispatch_writer_events(events);
  }

  /// Flush final acknacks for a local reader that is about to detach.
  pub fn send_final_acks(&self, reader_guid: GUID) {
    let reader = {
      let inner = self.inner.lock().unwrap();
      inner.readers.get(&reader_guid).cloned()
    };
    if let Some(reader) = reader {
      let mut meta = Vec::new();
      reader.lock().unwrap().gather_ack_nacks(true, &mut meta);
      self.flush_meta(meta);
    }
  }

  // --------------------------------------------------------------
  // Inbound path
  // --------------------------------------------------------------

  /// Process one received datagram.
  pub fn received(&self, datagram: &Bytes) {
    let message = match Message::read_from_buffer(datagram) {
      Ok(m) => m,
      Err(e) => {
        debug!("discarding undecodable datagram: {e:?}");
        return;
      }
    };
    let src_prefix = message.header.guid_prefix;
    if src_prefix == self.local_prefix {
      return; // our own multicast loopback
    }

    let mut dst_prefix = GuidPrefix::UNKNOWN;
    for submessage in message.submessages {
      if let SubmessageBody::Interpreter(InterpreterSubmessage::InfoDestination(ref dst, _)) =
        submessage.body
      {
        dst_prefix = dst.guid_prefix;
        continue;
      }
      if dst_prefix != GuidPrefix::UNKNOWN && dst_prefix != self.local_prefix {
        // directed at some other participant
        continue;
      }
      match submessage.body {
        SubmessageBody::Writer(WriterSubmessage::Data(data, _)) => {
          self.dispatch_to_readers(src_prefix, data.writer_id, data.reader_id, |reader, dv| {
            reader.handle_data(GUID::new(src_prefix, data.writer_id), &data, dv);
          });
        }
        SubmessageBody::Writer(WriterSubmessage::DataFrag(datafrag, _)) => {
          self.dispatch_to_readers(
            src_prefix,
            datafrag.writer_id,
            datafrag.reader_id,
            |reader, dv| {
              reader.handle_data_frag(GUID::new(src_prefix, datafrag.writer_id), &datafrag, dv);
            },
          );
        }
        SubmessageBody::Writer(WriterSubmessage::Gap(gap, _)) => {
          self.dispatch_to_readers(src_prefix, gap.writer_id, gap.reader_id, |reader, dv| {
            reader.handle_gap(GUID::new(src_prefix, gap.writer_id), &gap, dv);
          });
        }
        SubmessageBody::Writer(WriterSubmessage::Heartbeat(heartbeat, flags)) => {
          self.dispatch_heartbeat(
            src_prefix,
            &heartbeat,
            flags.contains(HEARTBEAT_Flags::Final),
            flags.contains(HEARTBEAT_Flags::Liveliness),
          );
        }
        SubmessageBody::Writer(WriterSubmessage::HeartbeatFrag(hb_frag, _)) => {
          self.dispatch_heartbeat_frag(src_prefix, &hb_frag);
        }
        SubmessageBody::Reader(ReaderSubmessage::AckNack(acknack, flags)) => {
          self.dispatch_acknack(src_prefix, &acknack, flags.contains(ACKNACK_Flags::Final));
        }
        SubmessageBody::Reader(ReaderSubmessage::NackFrag(nackfrag, _)) => {
          self.dispatch_nackfrag(src_prefix, &nackfrag);
        }
        SubmessageBody::Interpreter(_) => {}
      }
    }

    // The withholding decisions above may have released samples.
    self.held_delivery.drain(&*self.handler);
  }

  /// Locate the local readers a writer-to-reader submessage addresses:
  /// either the named one, or, for ENTITYID_UNKNOWN, every local reader
  /// associated with the source writer.
  fn dispatch_to_readers<F>(
    &self,
    src_prefix: GuidPrefix,
    writer_id: EntityId,
    reader_id: EntityId,
    mut action: F,
  ) where
    F: FnMut(&mut ReliableReader, &mut Vec<crate::link::held_delivery::ReadySample>),
  {
    let writer_guid = GUID::new(src_prefix, writer_id);
    let targets: Vec<Arc<Mutex<ReliableReader>>> = {
      let inner = self.inner.lock().unwrap();
      if reader_id == EntityId::UNKNOWN {
        match inner.remote_writer_to_local_readers.get(&writer_guid) {
          Some(locals) => locals
            .iter()
            .filter_map(|guid| inner.readers.get(guid).cloned())
            .collect(),
          None => Vec::new(),
        }
      } else {
        let local = GUID::new(self.local_prefix, reader_id);
        inner.readers.get(&local).into_iter().cloned().collect()
      }
    };
    if targets.is_empty() {
      trace!(
        "no local reader for submessage from {:?} to {:?}",
        writer_guid,
        reader_id
      );
      return;
    }
    let mut deliveries = Vec::new();
    for reader in targets {
      let mut r = reader.lock().unwrap();
      action(&mut r, &mut deliveries);
    }
    for ready in deliveries {
      self.held_delivery.push_ready(ready);
    }
  }

  fn dispatch_heartbeat(
    &self,
    src_prefix: GuidPrefix,
    heartbeat: &crate::messages::submessages::submessages::Heartbeat,
    final_flag: bool,
    liveliness_flag: bool,
  ) {
    let writer_guid = GUID::new(src_prefix, heartbeat.writer_id);
    let targets: Vec<(GUID, Arc<Mutex<ReliableReader>>)> = {
      let inner = self.inner.lock().unwrap();
      if heartbeat.reader_id == EntityId::UNKNOWN {
        match inner.remote_writer_to_local_readers.get(&writer_guid) {
          Some(locals) => locals
            .iter()
            .filter_map(|guid| inner.readers.get(guid).cloned().map(|r| (*guid, r)))
            .collect(),
          None => Vec::new(),
        }
      } else {
        let local = GUID::new(self.local_prefix, heartbeat.reader_id);
        inner
          .readers
          .get(&local)
          .cloned()
          .map(|r| (local, r))
          .into_iter()
          .collect()
      }
    };

    let mut reply_now = false;
    let mut schedule = false;
    let mut first_heartbeats: Vec<GUID> = Vec::new();
    let mut deliveries = Vec::new();
    let mut immediate_meta = Vec::new();

    for (local_guid, reader) in targets {
      let mut r = reader.lock().unwrap();
      let first_from_writer = r
        .writers
        .get(&writer_guid)
        .map_or(false, |rec| rec.heartbeat_recvd_count < 0);
      match r.handle_heartbeat(
        writer_guid,
        heartbeat,
        final_flag,
        liveliness_flag,
        &mut deliveries,
      ) {
        HeartbeatAction::Nothing => {}
        HeartbeatAction::ReplyNow => {
          reply_now = true;
          r.gather_ack_nacks(false, &mut immediate_meta);
        }
        HeartbeatAction::ScheduleReply => schedule = true,
      }
      if first_from_writer
        && r.writers
          .get(&writer_guid)
          .map_or(false, |rec| rec.heartbeat_recvd_count >= 0)
      {
        first_heartbeats.push(local_guid);
      }
    }

    for ready in deliveries {
      self.held_delivery.push_ready(ready);
    }
    if reply_now {
      self.flush_meta(immediate_meta);
    }
    if schedule {
      let mut inner = self.inner.lock().unwrap();
      if !inner.heartbeat_reply_scheduled {
        inner.heartbeat_reply_scheduled = true;
        let delay = self.config.heartbeat_response_delay.to_std();
        inner.schedule(delay, TimedEvent::HeartbeatReply);
      }
    }
    for local in first_heartbeats {
      self.handler.writer_exists(writer_guid, local);
    }
  }

  fn dispatch_heartbeat_frag(
    &self,
    src_prefix: GuidPrefix,
    hb_frag: &crate::messages::submessages::submessages::HeartbeatFrag,
  ) {
    let writer_guid = GUID::new(src_prefix, hb_frag.writer_id);
    let targets: Vec<Arc<Mutex<ReliableReader>>> = {
      let inner = self.inner.lock().unwrap();
      if hb_frag.reader_id == EntityId::UNKNOWN {
        match inner.remote_writer_to_local_readers.get(&writer_guid) {
          Some(locals) => locals
            .iter()
            .filter_map(|guid| inner.readers.get(guid).cloned())
            .collect(),
          None => Vec::new(),
        }
      } else {
        let local = GUID::new(self.local_prefix, hb_frag.reader_id);
        inner.readers.get(&local).into_iter().cloned().collect()
      }
    };
    let mut schedule = false;
    for reader in targets {
      if reader
        .lock()
        .unwrap()
        .handle_heartbeat_frag(writer_guid, hb_frag)
      {
        schedule = true;
      }
    }
    if schedule {
      let mut inner = self.inner.lock().unwrap();
      if !inner.heartbeat_reply_scheduled {
        inner.heartbeat_reply_scheduled = true;
        let delay = self.config.heartbeat_response_delay.to_std();
        inner.schedule(delay, TimedEvent::HeartbeatReply);
      }
    }
  }

  fn dispatch_acknack(
    &self,
    src_prefix: GuidPrefix,
    acknack: &crate::messages::submessages::submessages::AckNack,
    final_flag: bool,
  ) {
    let local = GUID::new(self.local_prefix, acknack.writer_id);
    let reader_guid = GUID::new(src_prefix, acknack.reader_id);
    let writer = {
      let inner = self.inner.lock().unwrap();
      inner.writers.get(&local).cloned()
    };
    let writer = match writer {
      Some(w) => w,
      None => {
        debug!("ACKNACK for unknown local writer {:?}", local);
        return;
      }
    };
    let mut meta = Vec::new();
    let mut events = Vec::new();
    let schedule = writer.lock().unwrap().handle_acknack(
      reader_guid,
      acknack,
      final_flag,
      &mut meta,
      &mut events,
    );
    self.flush_meta(meta);
    self.dispatch_writer_events(events);
    if schedule {
      let mut inner = self.inner.lock().unwrap();
      if !inner.nack_reply_scheduled {
        inner.nack_reply_scheduled = true;
        let delay = self.config.nak_response_delay.to_std();
        inner.schedule(delay, TimedEvent::NackReply);
      }
    }
  }

  fn dispatch_nackfrag(
    &self,
    src_prefix: GuidPrefix,
    nackfrag: &crate::messages::submessages::submessages::NackFrag,
  ) {
    let local = GUID::new(self.local_prefix, nackfrag.writer_id);
    let reader_guid = GUID::new(src_prefix, nackfrag.reader_id);
    let writer = {
      let inner = self.inner.lock().unwrap();
      inner.writers.get(&local).cloned()
    };
    let schedule = match writer {
      Some(w) => w.lock().unwrap().handle_nackfrag(reader_guid, nackfrag),
      None => {
        debug!("NACK_FRAG for unknown local writer {:?}", local);
        false
      }
    };
    if schedule {
      let mut inner = self.inner.lock().unwrap();
      if !inner.nack_reply_scheduled {
        inner.nack_reply_scheduled = true;
        let delay = self.config.nak_response_delay.to_std();
        inner.schedule(delay, TimedEvent::NackReply);
      }
    }
  }

  // --------------------------------------------------------------
  // Timers
  // --------------------------------------------------------------

  /// Service expired timers. Call from the reactor whenever the timer's
  /// poll readiness fires, and after `received()` batches.
  pub fn handle_timed_event(&self) {
    loop {
      let event = { self.inner.lock().unwrap().timer.poll() };
      let event = match event {
        Some(e) => e,
        None => break,
      };
      match event {
        TimedEvent::Heartbeat => {
          {
            let mut inner = self.inner.lock().unwrap();
            let period = self.config.heartbeat_period.to_std();
            inner.schedule(period, TimedEvent::Heartbeat);
          }
          self.heartbeat_tick();
        }
        TimedEvent::HeartbeatChecker => {
          {
            let mut inner = self.inner.lock().unwrap();
            let period = self.config.heartbeat_period.to_std();
            inner.schedule(period, TimedEvent::HeartbeatChecker);
          }
          self.liveness_tick();
        }
        TimedEvent::RelayBeacon => {
          {
            let mut inner = self.inner.lock().unwrap();
            let period = self.config.heartbeat_period.to_std();
            inner.schedule(period, TimedEvent::RelayBeacon);
          }
          self.relay_beacon();
        }
        TimedEvent::NackReply => {
          self.inner.lock().unwrap().nack_reply_scheduled = false;
          self.nack_reply_tick();
        }
        TimedEvent::HeartbeatReply => {
          self.inner.lock().unwrap().heartbeat_reply_scheduled = false;
          self.acknack_reply_tick();
        }
      }
    }
    self.held_delivery.drain(&*self.handler);
  }

  fn heartbeat_tick(&self) {
    let (writers, interesting_readers, readers_with_interests): (
      Vec<Arc<Mutex<ReliableWriter>>>,
      BTreeMap<GUID, BTreeSet<GUID>>,
      Vec<(Arc<Mutex<ReliableReader>>, BTreeSet<GUID>)>,
    ) = {
      let inner = self.inner.lock().unwrap();
      (
        inner.writers.values().cloned().collect(),
        inner.interesting_readers.clone(),
        inner
          .interesting_writers
          .iter()
          .filter(|(_, ws)| !ws.is_empty())
          .filter_map(|(r, ws)| inner.readers.get(r).cloned().map(|arc| (arc, ws.clone())))
          .collect(),
      )
    };

    let mut meta = Vec::new();
    let mut events = Vec::new();
    for writer in writers {
      let mut w = writer.lock().unwrap();
      w.gather_heartbeats(&mut meta, &mut events);
      if let Some(pre) = interesting_readers.get(&w.guid()) {
        for reader in pre {
          w.gather_preassociation_heartbeat(*reader, &mut meta);
        }
      }
    }
    // keep soliciting heartbeats from interesting writers too
    for (reader, writer_guids) in readers_with_interests {
      let mut r = reader.lock().unwrap();
      for w in writer_guids {
        r.gather_preemptive_acknack(w, &mut meta);
      }
    }
    self.flush_meta(meta);
    self.dispatch_writer_events(events);
  }

  fn liveness_tick(&self) {
    let silence = self.config.heartbeat_period * PEER_SILENCE_PERIODS;
    let deadline = Timestamp::now() - silence;

    let (writers, readers): (
      Vec<Arc<Mutex<ReliableWriter>>>,
      Vec<Arc<Mutex<ReliableReader>>>,
    ) = {
      let inner = self.inner.lock().unwrap();
      (
        inner.writers.values().cloned().collect(),
        inner.readers.values().cloned().collect(),
      )
    };

    let mut gone_readers = Vec::new();
    for writer in writers {
      let w = writer.lock().unwrap();
      for silent in w.silent_readers(deadline) {
        gone_readers.push((silent, w.guid()));
      }
    }
    let mut gone_writers = Vec::new();
    for reader in readers {
      let r = reader.lock().unwrap();
      for silent in r.silent_writers(deadline) {
        gone_writers.push((silent, r.guid()));
      }
    }
    for (remote_reader, local_writer) in gone_readers {
      self.handler.reader_does_not_exist(remote_reader, local_writer);
    }
    for (remote_writer, local_reader) in gone_writers {
      self.handler.writer_does_not_exist(remote_writer, local_reader);
    }
  }

  fn nack_reply_tick(&self) {
    let writers: Vec<Arc<Mutex<ReliableWriter>>> = {
      let inner = self.inner.lock().unwrap();
      inner.writers.values().cloned().collect()
    };
    let mut meta = Vec::new();
    for writer in writers {
      writer.lock().unwrap().send_nack_replies(&mut meta);
    }
    self.flush_meta(meta);
  }

  fn acknack_reply_tick(&self) {
    let readers: Vec<Arc<Mutex<ReliableReader>>> = {
      let inner = self.inner.lock().unwrap();
      inner.readers.values().cloned().collect()
    };
    let mut meta = Vec::new();
    for reader in readers {
      reader.lock().unwrap().gather_ack_nacks(false, &mut meta);
    }
    self.flush_meta(meta);
  }

  fn relay_beacon(&self) {
    if let Some(relay) = self.config.rtps_relay_address {
      let mut addrs = BTreeSet::new();
      addrs.insert(relay);
      self
        .transport
        .send(&Bytes::from_static(&RELAY_BEACON), &addrs);
    }
  }

  // --------------------------------------------------------------
  // Output plumbing
  // --------------------------------------------------------------

  fn flush_meta(&self, meta: Vec<MetaSubmessage>) {
    if meta.is_empty() {
      return;
    }
    let bundles = {
      let inner = self.inner.lock().unwrap();
      let resolver = |from: GUID, dst: GUID| inner.addresses_for(from, dst);
      bundle_submessages(
        meta,
        self.local_prefix,
        self.config.max_bundle_size,
        &resolver,
      )
    };
    let relay = self.config.rtps_relay_address;
    for bundle in bundles {
      self.transport.send(&bundle.datagram, &bundle.addresses);
      if let Some(relay_addr) = relay {
        let mut relay_set = BTreeSet::new();
        relay_set.insert(relay_addr);
        self.transport.send(&bundle.datagram, &relay_set);
      }
    }
  }

  fn dispatch_writer_events(&self, events: Vec<WriterEvent>) {
    for event in events {
      match event {
        WriterEvent::Delivered(element) => self.handler.data_delivered(&element),
        WriterEvent::Dropped(element, by_transport) => {
          self.handler.data_dropped(&element, by_transport);
        }
        WriterEvent::HandshakeDone { local, remote } => {
          self.handler.association_started(local, remote, true);
          self.handler.reader_exists(remote, local);
        }
      }
    }
  }
}
