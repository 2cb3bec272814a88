use std::{
  collections::{BTreeMap, BTreeSet},
  net::SocketAddr,
};

use bytes::Bytes;
#[allow(unused_imports)]
use log::{debug, error, trace, warn};
use speedy::{Endianness, Writable};
use enumflags2::BitFlags;

use crate::{
  messages::submessages::{
    submessage_flag::{FromEndianness, INFODESTINATION_Flags},
    submessages::InfoDestination,
  },
  rtps::{Message, Submessage},
  structure::guid::{GuidPrefix, GUID},
};

/// A produced submessage tagged with its logical source and destination,
/// pending grouping into datagrams.
///
/// `dst == GUID_UNKNOWN` addresses every peer reachable from `from`;
/// `extra_dests` widens a directed submessage to additional peers (e.g. the
/// union of all readers that requested a repair).
#[derive(Debug, Clone)]
pub(crate) struct MetaSubmessage {
  pub from: GUID,
  pub dst: GUID,
  pub extra_dests: BTreeSet<GUID>,
  pub submessage: Submessage,
}

impl MetaSubmessage {
  pub fn new(from: GUID, dst: GUID, submessage: Submessage) -> Self {
    Self {
      from,
      dst,
      extra_dests: BTreeSet::new(),
      submessage,
    }
  }

  pub fn with_extra_dests(
    from: GUID,
    dst: GUID,
    extra_dests: BTreeSet<GUID>,
    submessage: Submessage,
  ) -> Self {
    Self {
      from,
      dst,
      extra_dests,
      submessage,
    }
  }
}

/// One outgoing datagram and where to send it.
#[derive(Debug)]
pub(crate) struct Bundle {
  pub addresses: BTreeSet<SocketAddr>,
  pub datagram: Bytes,
}

const RTPS_HEADER_SIZE: usize = 20;
const INFO_DST_SIZE: usize = 4 + 12;

/// Group meta-submessages into datagrams.
///
/// Grouping is two-level: first by the set of transport addresses the
/// submessage must reach, then by destination participant, so that one
/// INFO_DST prefix can cover a run of submessages to the same peer.
/// Bundling never reorders submessages of the same (from, dst) pair.
/// `addrs_for` resolves a (from, dst) pair to transport addresses;
/// `dst == GUID_UNKNOWN` means every peer of `from`.
pub(crate) fn bundle_submessages(
  metas: Vec<MetaSubmessage>,
  local_prefix: GuidPrefix,
  max_bundle_size: usize,
  addrs_for: &dyn Fn(GUID, GUID) -> BTreeSet<SocketAddr>,
) -> Vec<Bundle> {
  // addr_set -> dst participant (entity id zeroed) -> submessages in order
  #[allow(clippy::type_complexity)]
  let mut grouped: BTreeMap<BTreeSet<SocketAddr>, BTreeMap<GUID, Vec<Submessage>>> =
    BTreeMap::new();

  for meta in metas {
    // A non-directed submessage with explicit extra destinations goes only
    // to those destinations; expanding it to every peer would turn every
    // repair into a multicast storm.
    let mut addresses = if meta.dst == GUID::GUID_UNKNOWN && !meta.extra_dests.is_empty() {
      BTreeSet::new()
    } else {
      addrs_for(meta.from, meta.dst)
    };
    for extra in &meta.extra_dests {
      addresses.extend(addrs_for(meta.from, *extra));
    }
    if addresses.is_empty() {
      debug!(
        "no addresses for submessage from {:?} to {:?}, dropping",
        meta.from, meta.dst
      );
      continue;
    }
    // Directed submessages are grouped under the destination participant;
    // non-directed ones under GUID_UNKNOWN.
    let dst_participant = if meta.dst == GUID::GUID_UNKNOWN {
      GUID::GUID_UNKNOWN
    } else {
      meta.dst.participant_guid()
    };
    grouped
      .entry(addresses)
      .or_default()
      .entry(dst_participant)
      .or_default()
      .push(meta.submessage);
  }

  let mut bundles = Vec::new();

  for (addresses, by_dst) in grouped {
    let mut current: Vec<Submessage> = Vec::new();
    let mut current_size = RTPS_HEADER_SIZE;

    let mut flush =
      |current: &mut Vec<Submessage>, current_size: &mut usize, bundles: &mut Vec<Bundle>| {
        if !current.is_empty() {
          let message = Message {
            header: crate::messages::header::Header::new(local_prefix),
            submessages: std::mem::take(current),
          };
          match message.write_to_vec_with_ctx(Endianness::LittleEndian) {
            Ok(bytes) => bundles.push(Bundle {
              addresses: addresses.clone(),
              datagram: Bytes::from(bytes),
            }),
            Err(e) => error!("bundle serialization failed: {e:?}"),
          }
        }
        *current_size = RTPS_HEADER_SIZE;
      };

    for (dst, submessages) in by_dst {
      let directed = dst != GUID::GUID_UNKNOWN;
      let mut dst_prefix_written = false;

      for submessage in submessages {
        let sm_size = submessage.len_serialized();

        if directed && !dst_prefix_written {
          if current_size + INFO_DST_SIZE > max_bundle_size {
            flush(&mut current, &mut current_size, &mut bundles);
          }
          current.push(
            InfoDestination {
              guid_prefix: dst.prefix,
            }
            .create_submessage(BitFlags::<INFODESTINATION_Flags>::from_endianness(
              Endianness::LittleEndian,
            )),
          );
          current_size += INFO_DST_SIZE;
          dst_prefix_written = true;
        }

        if current_size + sm_size > max_bundle_size && !current.is_empty() {
          flush(&mut current, &mut current_size, &mut bundles);
          if directed {
            // re-establish the destination in the fresh bundle
            current.push(
              InfoDestination {
                guid_prefix: dst.prefix,
              }
              .create_submessage(BitFlags::<INFODESTINATION_Flags>::from_endianness(
                Endianness::LittleEndian,
              )),
            );
            current_size += INFO_DST_SIZE;
          }
        }
        if RTPS_HEADER_SIZE + sm_size > max_bundle_size {
          warn!(
            "submessage of {} bytes exceeds max_bundle_size {}, sending oversized datagram",
            sm_size, max_bundle_size
          );
        }
        current.push(submessage);
        current_size += sm_size;
      }
      // Next dst group gets its own INFO_DST (or none, if non-directed),
      // but may share the remaining space of this bundle.
    }
    flush(&mut current, &mut current_size, &mut bundles);
  }

  bundles
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    messages::submessages::submessages::{Heartbeat, SubmessageKind, HEARTBEAT_Flags},
    rtps::SubmessageBody,
    structure::{
      guid::{EntityId, EntityKind, GuidPrefix},
      sequence_number::SequenceNumber,
    },
  };

  fn heartbeat_submessage(count: i32) -> Submessage {
    Heartbeat {
      reader_id: EntityId::UNKNOWN,
      writer_id: EntityId::default(),
      first_sn: SequenceNumber::from(1),
      last_sn: SequenceNumber::from(10),
      count,
    }
    .create_submessage(BitFlags::<HEARTBEAT_Flags>::from_endianness(
      Endianness::LittleEndian,
    ))
  }

  fn guid(tag: u8, kind: EntityKind) -> GUID {
    GUID::new(
      GuidPrefix::new(&[tag; 12]),
      EntityId::new([0, 0, tag], kind),
    )
  }

  #[test]
  fn submessages_to_same_addresses_share_a_datagram() {
    let writer = guid(1, EntityKind::WRITER_NO_KEY_USER_DEFINED);
    let addr: SocketAddr = "127.0.0.1:7400".parse().unwrap();
    let resolver = move |_from: GUID, _dst: GUID| {
      let mut s = BTreeSet::new();
      s.insert(addr);
      s
    };

    let metas = vec![
      MetaSubmessage::new(writer, GUID::GUID_UNKNOWN, heartbeat_submessage(1)),
      MetaSubmessage::new(writer, GUID::GUID_UNKNOWN, heartbeat_submessage(2)),
    ];
    let bundles = bundle_submessages(metas, GuidPrefix::new(&[9; 12]), 1400, &resolver);
    assert_eq!(bundles.len(), 1);
    assert!(bundles[0].addresses.contains(&addr));

    let message = Message::read_from_buffer(&bundles[0].datagram).unwrap();
    assert_eq!(message.submessages.len(), 2);
  }

  #[test]
  fn directed_submessages_get_an_info_dst_prefix() {
    let writer = guid(1, EntityKind::WRITER_NO_KEY_USER_DEFINED);
    let reader = guid(2, EntityKind::READER_NO_KEY_USER_DEFINED);
    let addr: SocketAddr = "127.0.0.1:7401".parse().unwrap();
    let resolver = move |_from: GUID, _dst: GUID| {
      let mut s = BTreeSet::new();
      s.insert(addr);
      s
    };

    let metas = vec![MetaSubmessage::new(writer, reader, heartbeat_submessage(1))];
    let bundles = bundle_submessages(metas, GuidPrefix::new(&[9; 12]), 1400, &resolver);
    assert_eq!(bundles.len(), 1);

    let message = Message::read_from_buffer(&bundles[0].datagram).unwrap();
    assert_eq!(message.submessages.len(), 2);
    assert_eq!(
      message.submessages[0].header.kind,
      SubmessageKind::INFO_DST
    );
    match &message.submessages[0].body {
      SubmessageBody::Interpreter(
        crate::messages::submessages::submessage::InterpreterSubmessage::InfoDestination(
          info_dst,
          _,
        ),
      ) => assert_eq!(info_dst.guid_prefix, reader.prefix),
      other => panic!("expected INFO_DST, got {other:?}"),
    }
  }

  #[test]
  fn bundles_respect_the_byte_budget() {
    let writer = guid(1, EntityKind::WRITER_NO_KEY_USER_DEFINED);
    let addr: SocketAddr = "127.0.0.1:7402".parse().unwrap();
    let resolver = move |_from: GUID, _dst: GUID| {
      let mut s = BTreeSet::new();
      s.insert(addr);
      s
    };

    // heartbeat submessage is 32 bytes serialized + 20 byte header.
    // A budget of 100 fits two heartbeats (84) but not three (116).
    let metas: Vec<MetaSubmessage> = (0..5)
      .map(|i| MetaSubmessage::new(writer, GUID::GUID_UNKNOWN, heartbeat_submessage(i)))
      .collect();
    let bundles = bundle_submessages(metas, GuidPrefix::new(&[9; 12]), 100, &resolver);
    assert_eq!(bundles.len(), 3);
    for b in &bundles {
      assert!(b.datagram.len() <= 100);
    }
  }

  #[test]
  fn different_address_sets_never_share_a_datagram() {
    let writer = guid(1, EntityKind::WRITER_NO_KEY_USER_DEFINED);
    let reader_a = guid(2, EntityKind::READER_NO_KEY_USER_DEFINED);
    let reader_b = guid(3, EntityKind::READER_NO_KEY_USER_DEFINED);
    let addr_a: SocketAddr = "127.0.0.1:7403".parse().unwrap();
    let addr_b: SocketAddr = "127.0.0.1:7404".parse().unwrap();
    let resolver = move |_from: GUID, dst: GUID| {
      let mut s = BTreeSet::new();
      if dst == reader_a {
        s.insert(addr_a);
      } else {
        s.insert(addr_b);
      }
      s
    };

    let metas = vec![
      MetaSubmessage::new(writer, reader_a, heartbeat_submessage(1)),
      MetaSubmessage::new(writer, reader_b, heartbeat_submessage(2)),
    ];
    let bundles = bundle_submessages(metas, GuidPrefix::new(&[9; 12]), 1400, &resolver);
    assert_eq!(bundles.len(), 2);
  }

  #[test]
  fn empty_address_set_drops_the_submessage() {
    let writer = guid(1, EntityKind::WRITER_NO_KEY_USER_DEFINED);
    let resolver = move |_from: GUID, _dst: GUID| BTreeSet::new();
    let metas = vec![MetaSubmessage::new(
      writer,
      GUID::GUID_UNKNOWN,
      heartbeat_submessage(1),
    )];
    let bundles = bundle_submessages(metas, GuidPrefix::new(&[9; 12]), 1400, &resolver);
    assert!(bundles.is_empty());
  }
}
