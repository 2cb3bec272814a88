use std::net::{Ipv4Addr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::structure::duration::Duration;

/// Tuning parameters of one [`DataLink`](crate::DataLink).
///
/// The defaults are usable as-is for LAN operation.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
  /// Capacity of the per-writer send buffer, in samples. Samples beyond
  /// this depth are no longer available for retransmission.
  pub nak_depth: usize,

  /// Delay before answering nack requests, to coalesce request storms.
  pub nak_response_delay: Duration,

  /// Delay before answering heartbeats with acknacks, to coalesce reply
  /// storms.
  pub heartbeat_response_delay: Duration,

  /// Period of the writer-side heartbeat task. Also paces the peer-liveness
  /// checker and the relay beacon.
  pub heartbeat_period: Duration,

  /// Maximum age of samples stashed for a late-joining durable reader.
  /// Expired samples are reported back as dropped.
  pub durable_data_timeout: Duration,

  /// Largest serialized payload sent as a single DATA submessage. Larger
  /// samples are split into DATA_FRAG submessages of this fragment size.
  pub max_data_size: usize,

  /// Byte budget of one outgoing datagram produced by the bundler.
  pub max_bundle_size: usize,

  pub use_multicast: bool,
  pub multicast_group_address: Ipv4Addr,
  pub multicast_interface: Option<Ipv4Addr>,
  /// IP TTL for outgoing packets, unicast and multicast.
  pub ttl: Option<u32>,

  /// SO_SNDBUF, if set.
  pub send_buffer_size: Option<usize>,
  /// SO_RCVBUF, if set.
  pub rcv_buffer_size: Option<usize>,

  /// Address of an RTPS relay for NAT traversal. When set, a small beacon
  /// keeps the NAT mapping alive and every outbound bundle is replicated to
  /// the relay.
  pub rtps_relay_address: Option<SocketAddr>,

  /// Accepted for compatibility but not honored here; connection
  /// establishment timeouts belong to the layer that drives association.
  pub passive_connect_duration: Duration,
}

impl Default for LinkConfig {
  fn default() -> Self {
    Self {
      nak_depth: 32,
      nak_response_delay: Duration::from_millis(200),
      heartbeat_response_delay: Duration::from_millis(500),
      heartbeat_period: Duration::from_secs(1),
      durable_data_timeout: Duration::from_secs(60),
      max_data_size: 1344,
      max_bundle_size: 1400,
      use_multicast: true,
      multicast_group_address: Ipv4Addr::new(239, 255, 0, 2),
      multicast_interface: None,
      ttl: None,
      send_buffer_size: None,
      rcv_buffer_size: None,
      rtps_relay_address: None,
      passive_connect_duration: Duration::from_secs(60),
    }
  }
}

/// How many heartbeat periods of silence until a peer is declared gone.
pub(crate) const PEER_SILENCE_PERIODS: i64 = 10;
