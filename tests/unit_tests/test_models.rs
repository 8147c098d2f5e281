// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use hex_literal::hex;
use mesh_node_rs::models::{
    common::{MESH_SEQ_ZERO_MASK, seq_from_seq_zero},
    friendship::{
        clear::FriendClearPdu,
        offer::FriendOfferPdu,
        poll::FriendPollPdu,
        request::{FriendRequestPdu, FriendshipCriteria},
        subscription::{FriendSubscrCnfPdu, FriendSubscrListPdu},
        update::{FriendUpdatePdu, UpdateFlags},
    },
    heartbeat::{FeaturesBitmap, HeartbeatPdu},
    network::NwkPduHeader,
    opcode::{CtlHeaderByte, CtlOpcode},
    transport::{
        ack::SegmentAck,
        segment::{AccHeaderByte, LtrPdu, SegHeader, build_seg_access},
    },
};
use zerocopy::IntoBytes;

#[test]
fn friendship_pdu_wire_sizes() -> Result<()> {
    let crit = FriendshipCriteria {
        rssi_factor: 0,
        recv_win_factor: 0,
        min_queue_size_log: 2,
    };
    assert_eq!(
        FriendRequestPdu::new(crit, 0x64, 0x000BB8, 0x0455, 2, 7)
            .as_bytes()
            .len(),
        10
    );
    assert_eq!(FriendOfferPdu::new(50, 16, -70, 8, 1).as_bytes().len(), 6);
    assert_eq!(FriendPollPdu { fsn: true }.to_bytes().len(), 1);
    assert_eq!(FriendClearPdu::new(0x0455, 7).as_bytes().len(), 4);
    assert_eq!(
        FriendUpdatePdu::new(UpdateFlags::empty(), 0, false)
            .as_bytes()
            .len(),
        6
    );
    assert_eq!(
        FriendSubscrListPdu::new(1, vec![0xC000, 0xC001]).to_bytes().len(),
        1 + 2 * 2
    );
    assert_eq!(FriendSubscrCnfPdu { trans_num: 1 }.to_bytes().len(), 1);
    assert_eq!(
        HeartbeatPdu { init_ttl: 5, features: FeaturesBitmap::RELAY }
            .to_bytes()
            .len(),
        3
    );
    Ok(())
}

#[test]
fn control_opcode_values_match_the_wire() {
    for (op, raw) in [
        (CtlOpcode::SegmentAck, 0x00u8),
        (CtlOpcode::FriendPoll, 0x01),
        (CtlOpcode::FriendUpdate, 0x02),
        (CtlOpcode::FriendRequest, 0x03),
        (CtlOpcode::FriendOffer, 0x04),
        (CtlOpcode::FriendClear, 0x05),
        (CtlOpcode::FriendClearConfirm, 0x06),
        (CtlOpcode::FriendSubscrListAdd, 0x07),
        (CtlOpcode::FriendSubscrListRemove, 0x08),
        (CtlOpcode::FriendSubscrListConfirm, 0x09),
        (CtlOpcode::Heartbeat, 0x0A),
    ] {
        assert_eq!(op as u8, raw);
        let hdr = CtlHeaderByte::try_from(raw).expect("known opcode");
        assert_eq!(hdr.opcode, op);
    }
}

// Helper to decode a whitespace-formatted hex fixture string.
fn fixture(s: &str) -> Vec<u8> {
    let cleaned: String = s.chars().filter(|c| !c.is_whitespace()).collect();
    hex::decode(cleaned).expect("valid hex fixture")
}

#[test]
fn network_header_fields_round_trip() -> Result<()> {
    let hdr = NwkPduHeader::new(false, 0x10, true, 0x04, 0x123456, 0x0003, 0x0042);
    assert_eq!(hdr.as_bytes(), fixture("10 84 12 34 56 00 03 00 42"));

    let parsed = NwkPduHeader::from_bytes(hdr.as_bytes())?;
    assert!(parsed.ctl());
    assert_eq!(parsed.nid(), 0x10);
    assert_eq!(parsed.ttl(), 0x04);
    assert_eq!(parsed.seq(), 0x123456);
    Ok(())
}

#[test]
fn segment_ack_wire_layout() {
    // OBO=0, SeqZero=0x0100, BlockAck acknowledges segments 0..=3.
    let ack = SegmentAck { obo: false, seq_zero: 0x0100, block_ack: 0x0000_000F };
    assert_eq!(ack.to_ltr_pdu(), hex!("00 04 00 0000000f"));
}

#[test]
fn seg_header_max_fields() -> Result<()> {
    let hdr = AccHeaderByte { seg: true, akf: true, aid: 0x3F };
    let seg = SegHeader { szmic: true, seq_zero: 0x1FFF, seg_o: 31, seg_n: 31 };
    let pdu = build_seg_access(hdr, seg, &hex!("aabbccdd"));
    match LtrPdu::parse(false, &pdu)? {
        LtrPdu::SegAccess { hdr: h, seg: s, segment } => {
            assert_eq!(h, hdr);
            assert_eq!(s, seg);
            assert_eq!(segment, hex!("aabbccdd"));
        },
        other => panic!("unexpected parse: {other:?}"),
    }
    Ok(())
}

#[test]
fn seq_zero_window_reconstruction() {
    // Same window.
    assert_eq!(seq_from_seq_zero(0x000123, 0x0100), 0x000100);
    // Wrap from 0x1FFF into the previous window.
    let seq_zero = 0x1FFF;
    let rx_seq = 0x002001;
    let first = seq_from_seq_zero(rx_seq, seq_zero);
    assert_eq!(first & MESH_SEQ_ZERO_MASK, u32::from(seq_zero));
    assert!(first <= rx_seq);
    assert_eq!(first, 0x001FFF);
}
