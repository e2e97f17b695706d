//! Property-based tests for the AM PDU codecs and for end-to-end transfer
//! over a lossy link.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use common::Lcid;
use layers::pdcp::{PdcpConfig, PdcpLayer};
use layers::rlc::am::pdu::{DataPduHeader, FramingInfo, Nack, SegmentInfo, StatusPdu};
use layers::rlc::{RlcAm, RlcConfig};
use layers::rrc::RrcLayer;
use proptest::prelude::*;

// ─── Strategies ──────────────────────────────────────────────────────────────

fn data_header() -> impl Strategy<Value = DataPduHeader> {
    (
        any::<bool>(),
        0u8..4,
        0u16..1024,
        prop::option::of((any::<bool>(), 0u16..0x8000)),
        prop::collection::vec(1u16..=0x7FF, 0..8),
    )
        .prop_map(|(poll, fi, sn, segment, li)| DataPduHeader {
            poll,
            fi: FramingInfo::from_bits_truncate(fi),
            sn,
            segment: segment.map(|(last, so)| SegmentInfo { last, so }),
            li,
        })
}

fn nack() -> impl Strategy<Value = Nack> {
    prop_oneof![
        (0u16..1024).prop_map(|sn| Nack::Pdu { sn }),
        (0u16..1024, 0u16..0x8000, 0u16..0x8000)
            .prop_map(|(sn, so_start, so_end)| Nack::Segment { sn, so_start, so_end }),
    ]
}

fn status_pdu() -> impl Strategy<Value = StatusPdu> {
    (0u16..1024, prop::collection::vec(nack(), 0..24))
        .prop_map(|(ack_sn, nacks)| StatusPdu { ack_sn, nacks })
}

// ─── Lossy link ──────────────────────────────────────────────────────────────

const MAX_ROUNDS: usize = 20_000;
const LOSSY_ROUNDS: usize = 100;

fn bearer() -> (Arc<PdcpLayer>, RlcAm) {
    let cfg = RlcConfig {
        max_retx_thresh: 64,
        ..Default::default()
    };
    let pdcp = Arc::new(PdcpLayer::new(PdcpConfig::default()).unwrap());
    let rrc = Arc::new(RrcLayer::new());
    let rlc = RlcAm::new(Lcid(3), cfg, pdcp.clone(), rrc).unwrap();
    (pdcp, rlc)
}

/// Push `sdus` through a link that drops PDUs according to `losses` during
/// the first rounds, returning the SDUs received and the delivered PDCP SNs
fn run_transfer(sdus: &[Vec<u8>], grants: &[usize], losses: &[bool]) -> (Vec<Bytes>, Vec<u32>) {
    let (tx_pdcp, tx) = bearer();
    let (rx_pdcp, rx) = bearer();
    for (i, sdu) in sdus.iter().enumerate() {
        tx.write_sdu(Bytes::from(sdu.clone()), i as u32).unwrap();
    }

    let dropped = |round: usize| round < LOSSY_ROUNDS && losses[round % losses.len()];
    let mut received = Vec::new();
    for round in 0..MAX_ROUNDS {
        let grant = grants[round % grants.len()];

        let pdu = tx.read_pdu(grant);
        if !pdu.is_empty() && !dropped(round) {
            let _ = rx.write_pdu(&pdu);
        }
        let status = rx.read_pdu(grant);
        if !status.is_empty() && !dropped(round + 1) {
            let _ = tx.write_pdu(&status);
        }
        tx.tick();
        rx.tick();

        received.extend(rx_pdcp.take_rx_sdus().into_iter().map(|(_, sdu)| sdu));
        if received.len() == sdus.len() && tx_pdcp.delivered().len() == sdus.len() {
            break;
        }
    }

    let mut delivered = tx_pdcp.delivered();
    delivered.sort_unstable();
    (received, delivered)
}

proptest! {
    #[test]
    fn data_header_roundtrip(header in data_header()) {
        let mut buf = BytesMut::new();
        header.write(&mut buf);
        prop_assert_eq!(buf.len(), header.packed_len());

        // Trailing data field must not be consumed
        buf.extend_from_slice(&[0xAB; 4]);
        let (parsed, header_len) = DataPduHeader::parse(&buf).unwrap();
        prop_assert_eq!(header_len, header.packed_len());
        prop_assert_eq!(parsed, header);
    }

    #[test]
    fn status_pdu_roundtrip(status in status_pdu()) {
        let encoded = status.encode();
        prop_assert_eq!(encoded.len(), status.packed_len());
        prop_assert_eq!(StatusPdu::parse(&encoded).unwrap(), status);
    }

    #[test]
    fn parsers_never_panic(bytes in prop::collection::vec(any::<u8>(), 0..48)) {
        let _ = DataPduHeader::parse(&bytes);
        let _ = StatusPdu::parse(&bytes);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn lossy_transfer_delivers_every_sdu_in_order(
        sdus in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..300), 1..40),
        grants in prop::collection::vec(10usize..150, 1..16),
        losses in prop::collection::vec(prop::bool::weighted(0.2), 1..64),
    ) {
        let (received, delivered) = run_transfer(&sdus, &grants, &losses);
        let expected: Vec<Bytes> = sdus.iter().cloned().map(Bytes::from).collect();
        prop_assert_eq!(received, expected);
        prop_assert_eq!(delivered, (0..sdus.len() as u32).collect::<Vec<_>>());
    }

    #[test]
    fn lossless_transfer_with_tiny_grants(
        sdus in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..64), 1..20),
        grant in 3usize..8,
    ) {
        let (received, _) = run_transfer(&sdus, &[grant], &[false]);
        let expected: Vec<Bytes> = sdus.iter().cloned().map(Bytes::from).collect();
        prop_assert_eq!(received, expected);
    }
}
