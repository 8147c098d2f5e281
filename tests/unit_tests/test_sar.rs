// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use bytes::Bytes;
use mesh_node_rs::{
    lower_transport::{
        TransportEffect,
        sar_rx::{DstInfo, SarRx, SegmentedHeader},
        sar_tx::{SarTx, SarTxParams, TxKind},
    },
    models::{
        common::SeqNumber,
        opcode::CtlOpcode,
        transport::{
            ack::SegmentAck,
            segment::{AccHeaderByte, SegHeader},
        },
    },
    network::NwkPduRxInfo,
    node::msg::{MeshMsg, TimerEvent},
    replay::sar_history::SarRxHistory,
};
use tokio::sync::mpsc;

const OWN_ADDR: u16 = 0x0042;

fn rx_info(src: u16, dst: u16, seq: SeqNumber, ttl: u8) -> NwkPduRxInfo {
    NwkPduRxInfo {
        src,
        dst,
        seq,
        ttl,
        ctl: false,
        iv_index: 0,
        net_key_index: 0,
        friend_lpn_addr: None,
        ltr_pdu: Bytes::new(),
        iface: 0,
        rssi: -50,
    }
}

fn own_dst() -> DstInfo {
    DstInfo { is_own_unicast: true, is_subscribed: false, is_lpn: false }
}

fn acc_hdr() -> SegmentedHeader {
    SegmentedHeader::Access {
        hdr: AccHeaderByte { seg: true, akf: true, aid: 0x05 },
        szmic: false,
    }
}

fn seg(seq_zero: u16, seg_o: u8, seg_n: u8) -> SegHeader {
    SegHeader { szmic: false, seq_zero, seg_o, seg_n }
}

/// Pulls Segment ACKs out of the effect list.
fn acks(effects: &[TransportEffect]) -> Vec<SegmentAck> {
    effects
        .iter()
        .filter_map(|e| match e {
            TransportEffect::SendNetwork { ltr_pdu, .. }
                if ltr_pdu[0] == CtlOpcode::SegmentAck as u8 =>
            {
                SegmentAck::parse(&ltr_pdu[1..]).ok()
            },
            _ => None,
        })
        .collect()
}

fn has_access_delivery(effects: &[TransportEffect]) -> bool {
    effects
        .iter()
        .any(|e| matches!(e, TransportEffect::DeliverAccess(_)))
}

/// Advances the paused clock and lets woken timer tasks run.
async fn advance(d: Duration) {
    tokio::time::advance(d).await;
    tokio::task::yield_now().await;
}

#[tokio::test(start_paused = true)]
async fn duplicate_of_completed_transaction_is_reacked() {
    let (tx, _rx) = mpsc::unbounded_channel();
    let mut sar = SarRx::new(2, OWN_ADDR, tx);
    let mut hist = SarRxHistory::new(8);
    let mut seq = 0x100u32;
    let mut alloc = move || {
        seq += 1;
        Some(seq)
    };

    // Four segments from 0x0002, SeqZero 0x0100.
    let mut final_effects = Vec::new();
    for seg_o in 0..4u8 {
        let info = rx_info(0x0002, OWN_ADDR, 0x000100 + u32::from(seg_o), 3);
        let effects = sar.process_segment(
            &mut hist,
            &info,
            acc_hdr(),
            seg(0x0100, seg_o, 3),
            &[seg_o; 12],
            own_dst(),
            5,
            &mut alloc,
        );
        final_effects = effects;
    }
    let final_acks = acks(&final_effects);
    assert_eq!(final_acks.len(), 1, "completion sends exactly one ack");
    assert_eq!(final_acks[0].block_ack, 0x0F);
    assert!(!final_acks[0].obo);
    assert!(has_access_delivery(&final_effects));

    // A duplicate of segment 2 arrives after completion: no reassembly,
    // just the final ack again.
    let info = rx_info(0x0002, OWN_ADDR, 0x000102, 3);
    let effects = sar.process_segment(
        &mut hist,
        &info,
        acc_hdr(),
        seg(0x0100, 2, 3),
        &[2u8; 12],
        own_dst(),
        5,
        &mut alloc,
    );
    let dup_acks = acks(&effects);
    assert_eq!(dup_acks.len(), 1);
    assert_eq!(dup_acks[0].block_ack, 0x0F);
    assert!(!dup_acks[0].obo);
    assert!(!has_access_delivery(&effects));
}

#[tokio::test(start_paused = true)]
async fn single_segment_transaction_completes() {
    let (tx, _rx) = mpsc::unbounded_channel();
    let mut sar = SarRx::new(2, OWN_ADDR, tx);
    let mut hist = SarRxHistory::new(8);
    let mut alloc = || Some(0x999u32);

    let info = rx_info(0x0002, OWN_ADDR, 0x000200, 3);
    let effects = sar.process_segment(
        &mut hist,
        &info,
        acc_hdr(),
        seg(0x0200, 0, 0),
        &[0xAA; 8],
        own_dst(),
        5,
        &mut alloc,
    );
    let final_acks = acks(&effects);
    assert_eq!(final_acks.len(), 1);
    assert_eq!(final_acks[0].block_ack, 0b1);
    assert!(has_access_delivery(&effects));
}

#[tokio::test(start_paused = true)]
async fn thirty_two_segments_fill_the_block_ack() {
    let (tx, _rx) = mpsc::unbounded_channel();
    let mut sar = SarRx::new(2, OWN_ADDR, tx);
    let mut hist = SarRxHistory::new(8);
    let mut seq = 0x400u32;
    let mut alloc = move || {
        seq += 1;
        Some(seq)
    };

    let mut last = Vec::new();
    for seg_o in 0..=31u8 {
        let info = rx_info(0x0002, OWN_ADDR, 0x000400 + u32::from(seg_o), 3);
        last = sar.process_segment(
            &mut hist,
            &info,
            acc_hdr(),
            seg(0x0400, seg_o, 31),
            &[seg_o; 12],
            own_dst(),
            5,
            &mut alloc,
        );
    }
    let final_acks = acks(&last);
    assert_eq!(final_acks.len(), 1);
    assert_eq!(final_acks[0].block_ack, u32::MAX);
    match last
        .iter()
        .find(|e| matches!(e, TransportEffect::DeliverAccess(_)))
    {
        Some(TransportEffect::DeliverAccess(acc)) => {
            assert_eq!(acc.utr_pdu.len(), 32 * 12);
            assert_eq!(acc.seq, 0x000400);
            assert_eq!(acc.gt_seq, 0x00041F);
        },
        _ => panic!("no access delivery"),
    }
}

#[tokio::test(start_paused = true)]
async fn no_free_slot_sends_fast_nack() {
    let (tx, _rx) = mpsc::unbounded_channel();
    let mut sar = SarRx::new(1, OWN_ADDR, tx);
    let mut hist = SarRxHistory::new(8);
    let mut alloc = || Some(0x123u32);

    // Occupy the only slot with an unfinished transaction.
    let info = rx_info(0x0002, OWN_ADDR, 0x000500, 3);
    sar.process_segment(
        &mut hist,
        &info,
        acc_hdr(),
        seg(0x0500, 0, 2),
        &[1u8; 12],
        own_dst(),
        5,
        &mut alloc,
    );

    // Another source wants a slot.
    let info = rx_info(0x0003, OWN_ADDR, 0x000600, 3);
    let effects = sar.process_segment(
        &mut hist,
        &info,
        acc_hdr(),
        seg(0x0600, 0, 1),
        &[2u8; 12],
        own_dst(),
        5,
        &mut alloc,
    );
    let nacks = acks(&effects);
    assert_eq!(nacks.len(), 1);
    assert_eq!(nacks[0].block_ack, 0, "fast-NACK carries an empty BlockAck");
}

#[tokio::test(start_paused = true)]
async fn incomplete_timeout_aborts_and_drops_late_segments(
) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut sar = SarRx::new(2, OWN_ADDR, tx);
    let mut hist = SarRxHistory::new(8);
    let mut alloc = || Some(0x123u32);

    let info = rx_info(0x0002, OWN_ADDR, 0x000700, 3);
    sar.process_segment(
        &mut hist,
        &info,
        acc_hdr(),
        seg(0x0700, 0, 2),
        &[1u8; 12],
        own_dst(),
        5,
        &mut alloc,
    );

    // Let the 10 s incomplete timer fire; the ack timer fires first.
    advance(Duration::from_secs(11)).await;
    let mut aborted = false;
    while let Ok(msg) = rx.try_recv() {
        match msg {
            MeshMsg::Timer(TimerEvent::SarRxIncomplete { slot, generation }) => {
                sar.on_incomplete_timer(slot, generation, &mut hist);
                aborted = true;
            },
            MeshMsg::Timer(TimerEvent::SarRxAck { slot, generation }) => {
                let _ = sar.on_ack_timer(slot, generation, 5, &mut alloc);
            },
            _ => {},
        }
    }
    assert!(aborted, "incomplete timer must fire");

    // A late segment of the aborted transaction dies silently.
    let info = rx_info(0x0002, OWN_ADDR, 0x000701, 3);
    let effects = sar.process_segment(
        &mut hist,
        &info,
        acc_hdr(),
        seg(0x0700, 1, 2),
        &[2u8; 12],
        own_dst(),
        5,
        &mut alloc,
    );
    assert!(effects.is_empty(), "aborted transaction segments drop silently");
}

#[tokio::test(start_paused = true)]
async fn sar_tx_retransmits_only_missing_segments() {
    let (tx, _rx) = mpsc::unbounded_channel();
    let mut sar = SarTx::new(2, tx);
    let mut seq = 0x1000u32;
    let mut alloc = move || {
        seq += 1;
        Some(seq)
    };

    let params = SarTxParams {
        src: OWN_ADDR,
        dst: 0x0002,
        net_key_index: 0,
        friend_lpn_addr: None,
        ttl: 5,
        priority: false,
        kind: TxKind::Access {
            hdr: AccHeaderByte { seg: true, akf: true, aid: 0x05 },
            szmic: false,
        },
    };
    let payload = vec![0x55u8; 30]; // three access segments
    let (first_seq, effects) =
        sar.send(params, &payload, 0x1000, &mut alloc).expect("send");
    assert_eq!(first_seq, 0x1000);
    assert_eq!(
        effects
            .iter()
            .filter(|e| matches!(e, TransportEffect::SendNetwork { .. }))
            .count(),
        3
    );

    // Peer acked only segment 1: segments 0 and 2 go out again.
    let ack = SegmentAck { obo: false, seq_zero: 0x1000, block_ack: 0b010 };
    let effects = sar.on_segment_ack(0x0002, &ack, &mut alloc);
    assert_eq!(
        effects
            .iter()
            .filter(|e| matches!(e, TransportEffect::SendNetwork { .. }))
            .count(),
        2
    );

    // Full BlockAck finishes the transaction.
    let ack = SegmentAck { obo: false, seq_zero: 0x1000, block_ack: 0b111 };
    let effects = sar.on_segment_ack(0x0002, &ack, &mut alloc);
    assert!(matches!(effects[..], [TransportEffect::TxDone { seq: 0x1000 }]));
}

#[tokio::test(start_paused = true)]
async fn sar_tx_rejected_by_empty_block_ack() {
    let (tx, _rx) = mpsc::unbounded_channel();
    let mut sar = SarTx::new(2, tx);
    let mut alloc = || Some(0x2001u32);

    let params = SarTxParams {
        src: OWN_ADDR,
        dst: 0x0002,
        net_key_index: 0,
        friend_lpn_addr: None,
        ttl: 5,
        priority: false,
        kind: TxKind::Control { opcode: CtlOpcode::FriendClear },
    };
    let payload = vec![0x66u8; 20]; // three control segments
    let (first_seq, _) = sar.send(params, &payload, 0x2000, &mut alloc).expect("send");

    let ack = SegmentAck { obo: false, seq_zero: 0x2000, block_ack: 0 };
    let effects = sar.on_segment_ack(0x0002, &ack, &mut alloc);
    assert!(
        matches!(effects[..], [TransportEffect::TxRejected { seq }] if seq == first_seq)
    );
}

#[tokio::test(start_paused = true)]
async fn sar_tx_times_out_after_retry_budget() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut sar = SarTx::new(2, tx);
    let mut seq = 0x3000u32;
    let mut alloc = move || {
        seq += 1;
        Some(seq)
    };

    let params = SarTxParams {
        src: OWN_ADDR,
        dst: 0x0002,
        net_key_index: 0,
        friend_lpn_addr: None,
        ttl: 5,
        priority: false,
        kind: TxKind::Access {
            hdr: AccHeaderByte { seg: true, akf: false, aid: 0 },
            szmic: false,
        },
    };
    let (first_seq, _) =
        sar.send(params, &[0u8; 24], 0x3000, &mut alloc).expect("send");

    // Drain retry timers until the transaction gives up.
    let mut timed_out = false;
    for _ in 0..16 {
        advance(Duration::from_secs(4)).await;
        while let Ok(msg) = rx.try_recv() {
            if let MeshMsg::Timer(TimerEvent::SarTxRetry { slot, generation }) = msg {
                for effect in sar.on_retry_timer(slot, generation, &mut alloc) {
                    if matches!(effect, TransportEffect::TxTimeout { seq } if seq == first_seq)
                    {
                        timed_out = true;
                    }
                }
            }
        }
        if timed_out {
            break;
        }
    }
    assert!(timed_out, "retry budget must end in SarTxTimeout");
}
