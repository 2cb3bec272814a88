//! End-to-end exercises of the delivery engine: two DataLinks wired
//! together through an in-memory transport, no sockets.

use std::{
  collections::BTreeSet,
  net::SocketAddr,
  sync::{Arc, Mutex},
  thread::sleep,
  time::Duration as StdDuration,
};

use bytes::Bytes;

use rtps_udp_link::{
  DataLink, Duration, EntityId, EntityKind, GuidPrefix, LinkConfig, LinkEventHandler,
  QueueElement, SequenceNumber, TransportSender, GUID,
};

/// Captures outgoing datagrams instead of sending them anywhere.
struct QueueTransport {
  queue: Mutex<Vec<Bytes>>,
}

impl QueueTransport {
  fn new() -> Arc<Self> {
    Arc::new(Self {
      queue: Mutex::new(Vec::new()),
    })
  }

  fn take(&self) -> Vec<Bytes> {
    std::mem::take(&mut *self.queue.lock().unwrap())
  }
}

impl TransportSender for QueueTransport {
  fn send(&self, datagram: &Bytes, _addresses: &BTreeSet<SocketAddr>) {
    self.queue.lock().unwrap().push(datagram.clone());
  }
}

/// Records what the application would observe.
#[derive(Default)]
struct Recorder {
  samples: Mutex<Vec<(GUID, SequenceNumber, Bytes)>>,
  delivered: Mutex<Vec<SequenceNumber>>,
  dropped: Mutex<Vec<SequenceNumber>>,
}

impl LinkEventHandler for Recorder {
  fn sample_received(&self, _reader: GUID, writer: GUID, seq: SequenceNumber, payload: Bytes) {
    self.samples.lock().unwrap().push((writer, seq, payload));
  }
  fn data_delivered(&self, element: &QueueElement) {
    self.delivered.lock().unwrap().push(element.sequence);
  }
  fn data_dropped(&self, element: &QueueElement, _by_transport: bool) {
    self.dropped.lock().unwrap().push(element.sequence);
  }
}

impl Recorder {
  fn sample_seqs(&self) -> Vec<i64> {
    self
      .samples
      .lock()
      .unwrap()
      .iter()
      .map(|(_, s, _)| i64::from(*s))
      .collect()
  }

  fn delivered_seqs(&self) -> Vec<i64> {
    let mut v: Vec<i64> = self
      .delivered
      .lock()
      .unwrap()
      .iter()
      .map(|s| i64::from(*s))
      .collect();
    v.sort_unstable();
    v.dedup();
    v
  }
}

struct Side {
  link: DataLink,
  transport: Arc<QueueTransport>,
  recorder: Arc<Recorder>,
}

fn test_config() -> LinkConfig {
  LinkConfig {
    heartbeat_period: Duration::from_millis(80),
    nak_response_delay: Duration::from_millis(10),
    heartbeat_response_delay: Duration::from_millis(10),
    ..LinkConfig::default()
  }
}

fn make_side(prefix_tag: u8, config: LinkConfig) -> Side {
  let transport = QueueTransport::new();
  let recorder = Arc::new(Recorder::default());
  let link = DataLink::new(
    config,
    GuidPrefix::new(&[prefix_tag; 12]),
    recorder.clone(),
    transport.clone(),
  );
  Side {
    link,
    transport,
    recorder,
  }
}

fn writer_guid(side: &Side) -> GUID {
  GUID::new(
    side.link.local_prefix(),
    EntityId::new([0, 0, 1], EntityKind::WRITER_NO_KEY_USER_DEFINED),
  )
}

fn reader_guid(side: &Side) -> GUID {
  GUID::new(
    side.link.local_prefix(),
    EntityId::new([0, 0, 2], EntityKind::READER_NO_KEY_USER_DEFINED),
  )
}

fn dummy_addr(port: u16) -> SocketAddr {
  SocketAddr::new("127.0.0.1".parse().unwrap(), port)
}

/// Shuttle queued datagrams between the two sides until both are quiet.
fn pump(a: &Side, b: &Side) {
  for _ in 0..32 {
    let from_a = a.transport.take();
    let from_b = b.transport.take();
    if from_a.is_empty() && from_b.is_empty() {
      return;
    }
    for d in from_a {
      b.link.received(&d);
    }
    for d in from_b {
      a.link.received(&d);
    }
  }
  panic!("links did not quiesce");
}

/// Let timers fire and exchange the produced traffic, several rounds.
fn settle(a: &Side, b: &Side, rounds: usize) {
  for _ in 0..rounds {
    sleep(StdDuration::from_millis(120));
    a.link.handle_timed_event();
    b.link.handle_timed_event();
    pump(a, b);
  }
}

/// Two sides with writer W on `a` associated to reader R on `b`.
fn associated_pair(durable: bool) -> (Side, Side) {
  let a = make_side(0xA1, test_config());
  let b = make_side(0xB2, test_config());

  let w = writer_guid(&a);
  let r = reader_guid(&b);

  a.link.register_local_writer(w, durable);
  a.link.add_locator(r, dummy_addr(1111), false);

  b.link.register_local_reader(r, durable);
  b.link.add_locator(w, dummy_addr(2222), false);

  a.link.associated(w, r, durable);
  b.link.associated(r, w, durable);
  pump(&a, &b);
  (a, b)
}

fn write_sample(a: &Side, seq: i64, payload: &[u8]) {
  a.link.customize_queue_element(QueueElement::new_data(
    writer_guid(a),
    SequenceNumber::from(seq),
    Bytes::copy_from_slice(payload),
  ));
}

#[test]
fn reliable_happy_path() {
  let (a, b) = associated_pair(false);

  for i in 1..=5 {
    write_sample(&a, i, format!("sample {i}").as_bytes());
    pump(&a, &b);
  }

  // delivered to the application, in order, gapless
  assert_eq!(b.recorder.sample_seqs(), vec![1, 2, 3, 4, 5]);

  // heartbeat exchange leads to a full acknowledgement
  settle(&a, &b, 3);
  assert_eq!(a.recorder.delivered_seqs(), vec![1, 2, 3, 4, 5]);
}

#[test]
fn lost_sample_is_recovered() {
  let (a, b) = associated_pair(false);

  for i in 1..=5 {
    write_sample(&a, i, b"payload");
    let datagrams = a.transport.take();
    for d in datagrams {
      if i == 3 {
        continue; // the wire eats sample 3
      }
      b.link.received(&d);
    }
  }
  assert_eq!(b.recorder.sample_seqs(), vec![1, 2]);

  // heartbeat -> acknack{3} -> resend -> in-order delivery resumes
  settle(&a, &b, 4);
  assert_eq!(b.recorder.sample_seqs(), vec![1, 2, 3, 4, 5]);
  assert_eq!(a.recorder.delivered_seqs(), vec![1, 2, 3, 4, 5]);
}

#[test]
fn out_of_order_arrival_is_reordered() {
  let (a, b) = associated_pair(false);

  let mut datagrams = Vec::new();
  for i in 1..=3 {
    write_sample(&a, i, b"x");
    datagrams.extend(a.transport.take());
  }
  assert_eq!(datagrams.len(), 3);

  // deliver as 3, 1, 2
  b.link.received(&datagrams[2]);
  assert!(b.recorder.sample_seqs().is_empty());
  b.link.received(&datagrams[0]);
  b.link.received(&datagrams[1]);
  assert_eq!(b.recorder.sample_seqs(), vec![1, 2, 3]);
}

#[test]
fn durable_reader_backfills_history() {
  let a = make_side(0xA1, test_config());
  let b = make_side(0xB2, test_config());

  let w = writer_guid(&a);
  let r = reader_guid(&b);

  a.link.register_local_writer(w, true);
  // ten samples produced before the reader exists
  for i in 1..=10 {
    write_sample(&a, i, format!("old {i}").as_bytes());
  }
  a.transport.take(); // nobody was listening

  b.link.register_local_reader(r, true);
  a.link.add_locator(r, dummy_addr(1111), false);
  b.link.add_locator(w, dummy_addr(2222), false);
  a.link.associated(w, r, true);
  b.link.associated(r, w, true);
  pump(&a, &b);

  settle(&a, &b, 4);
  assert_eq!(
    b.recorder.sample_seqs(),
    (1..=10).collect::<Vec<i64>>()
  );
}

#[test]
fn deliberate_skip_is_gapped() {
  let (a, b) = associated_pair(false);

  write_sample(&a, 1, b"one");
  write_sample(&a, 2, b"two");
  // 3 and 4 never exist
  write_sample(&a, 5, b"five");
  pump(&a, &b);

  assert_eq!(b.recorder.sample_seqs(), vec![1, 2, 5]);

  // and the skip does not leave a dangling nack cycle
  settle(&a, &b, 3);
  assert_eq!(b.recorder.sample_seqs(), vec![1, 2, 5]);
  assert_eq!(a.recorder.delivered_seqs(), vec![1, 2, 5]);
}

#[test]
fn fragmented_sample_with_lost_fragment_is_repaired() {
  let (a, b) = associated_pair(false);

  // 3000 bytes fragments into 1344 + 1344 + 312
  let payload: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
  write_sample(&a, 1, &payload);

  let datagrams = a.transport.take();
  assert_eq!(datagrams.len(), 3);
  // fragment 2 is lost
  b.link.received(&datagrams[0]);
  b.link.received(&datagrams[2]);
  assert!(b.recorder.sample_seqs().is_empty());

  // heartbeat + heartbeat-frag -> nack-frag{2} -> fragment resend
  settle(&a, &b, 4);
  assert_eq!(b.recorder.sample_seqs(), vec![1]);
  let samples = b.recorder.samples.lock().unwrap();
  assert_eq!(samples[0].2.len(), payload.len());
  assert_eq!(&samples[0].2[..], &payload[..]);
}

#[test]
fn duplicate_datagrams_do_not_duplicate_delivery() {
  let (a, b) = associated_pair(false);

  write_sample(&a, 1, b"once");
  let datagrams = a.transport.take();
  for d in &datagrams {
    b.link.received(d);
    b.link.received(d); // redundant path duplicates everything
  }
  assert_eq!(b.recorder.sample_seqs(), vec![1]);
}
