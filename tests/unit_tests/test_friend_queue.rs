// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use mesh_node_rs::{
    friend::queue::{EntryFlags, FriendQueue},
    models::{friendship::update::UpdateFlags, transport::ack::SegmentAck},
};

fn data(tag: u8) -> Vec<u8> {
    vec![0x00, tag, tag]
}

/// The queue keeps arrival order, except that eviction skips updates and
/// ack collapse replaces in place.
#[test]
fn fifo_with_update_preserving_eviction() {
    let mut q = FriendQueue::new(4);
    q.add_update(UpdateFlags::empty(), 1);
    assert!(q.add_pdu(0x0002, 0x0455, 1, 1, false, 5, &data(1)));
    assert!(q.add_pdu(0x0002, 0x0455, 1, 2, false, 5, &data(2)));
    assert!(q.add_pdu(0x0002, 0x0455, 1, 3, false, 5, &data(3)));

    // Overflow drops Data1, never the update.
    assert!(q.add_pdu(0x0002, 0x0455, 1, 5, false, 5, &data(5)));
    let flags_then_seqs: Vec<(bool, u32)> = q
        .entries()
        .map(|e| (e.flags.contains(EntryFlags::UPDATE), e.seq))
        .collect();
    assert_eq!(
        flags_then_seqs,
        vec![(true, 0), (false, 2), (false, 3), (false, 5)]
    );
}

#[test]
fn delivery_order_survives_a_full_handshake() {
    let mut q = FriendQueue::new(8);
    for seq in 1..=5u32 {
        q.add_pdu(0x0002, 0x0455, 1, seq, false, 5, &data(seq as u8));
    }
    let mut delivered = Vec::new();
    while let Some(entry) = q.next_to_send() {
        delivered.push(entry.seq);
        q.confirm_delivered();
    }
    assert_eq!(delivered, vec![1, 2, 3, 4, 5]);
    assert!(q.is_empty());
}

#[test]
fn ack_collapse_keeps_one_per_transaction() {
    let mut q = FriendQueue::new(8);
    let mk = |block_ack: u32| {
        SegmentAck { obo: false, seq_zero: 0x0042, block_ack }.to_ltr_pdu()
    };
    assert!(q.add_pdu(0x0002, 0x0455, 1, 10, true, 5, &mk(0b0001)));
    assert!(q.add_pdu(0x0002, 0x0455, 1, 11, true, 5, &mk(0b0011)));
    assert!(q.add_pdu(0x0002, 0x0455, 1, 12, true, 5, &mk(0b0111)));
    assert_eq!(q.len(), 1);
    let head = q.next_to_send().expect("ack entry");
    assert_eq!(head.seq, 12);
    assert_eq!(
        SegmentAck::parse(&head.ltr_pdu[1..]).expect("parse").block_ack,
        0b0111
    );
}
