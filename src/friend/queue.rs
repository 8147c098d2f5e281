// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Friend Queue: the bounded store-and-forward buffer of one friendship.
//!
//! Entries hold complete lower-transport PDUs together with the network
//! metadata needed to replay them under friendship credentials with their
//! original SRC/SEQ/IV. Eviction never touches Friend Updates; Segment ACKs
//! collapse per `(src, dst, SeqZero)`.

use std::collections::VecDeque;

use bitflags::bitflags;
use tracing::{debug, warn};

use crate::models::{
    common::{MeshAddress, SeqNumber},
    friendship::update::{FriendUpdatePdu, UpdateFlags},
    opcode::{CtlOpcode, SEG_MASK},
    transport::ack::SegmentAck,
};

/// Largest LTR PDU a queue entry can carry: a full network PDU minus header
/// and the 32-bit NetMIC.
pub const FRIEND_QUEUE_MAX_LTR_PDU: usize = 16;

/// Offset of the MD octet inside a queued Friend Update LTR PDU.
const UPDATE_MD_OFFSET: usize = 6;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EntryFlags: u8 {
        /// Access or control data PDU.
        const DATA = 1 << 0;
        /// Friend Update; exempt from eviction.
        const UPDATE = 1 << 1;
        /// Segment Acknowledgement; collapsed per transaction.
        const ACK = 1 << 2;
        /// Sent to the LPN, awaiting the FSN toggle.
        const ACK_PEND = 1 << 3;
    }
}

/// One queued PDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub src: MeshAddress,
    pub dst: MeshAddress,
    pub iv_index: u32,
    pub seq: SeqNumber,
    pub ctl: bool,
    pub ttl: u8,
    pub ltr_pdu: Vec<u8>,
    pub flags: EntryFlags,
}

impl QueueEntry {
    /// SeqZero of a queued unsegmented Segment ACK.
    fn ack_seq_zero(&self) -> Option<u16> {
        if !self.flags.contains(EntryFlags::ACK) {
            return None;
        }
        SegmentAck::parse(&self.ltr_pdu[1..]).ok().map(|a| a.seq_zero)
    }
}

#[derive(Debug)]
pub struct FriendQueue {
    entries: VecDeque<QueueEntry>,
    cap: usize,
}

impl FriendQueue {
    pub fn new(cap: usize) -> Self {
        Self { entries: VecDeque::with_capacity(cap), cap }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline]
    pub fn free_count(&self) -> usize {
        self.cap - self.entries.len()
    }

    /// Discards the oldest non-Update entry; `false` when only Updates
    /// remain.
    fn discard_oldest(&mut self) -> bool {
        let Some(pos) = self
            .entries
            .iter()
            .position(|e| !e.flags.contains(EntryFlags::UPDATE))
        else {
            return false;
        };
        debug!("friend queue full, discarding oldest data entry");
        self.entries.remove(pos);
        true
    }

    fn make_room(&mut self) -> bool {
        self.entries.len() < self.cap || self.discard_oldest()
    }

    /// Adds a data or ack PDU. `Ok` entries keep arrival order; a newer ACK
    /// for a transaction replaces the older one in place. `false` means the
    /// queue refused the PDU.
    #[allow(clippy::too_many_arguments)]
    pub fn add_pdu(
        &mut self,
        src: MeshAddress,
        dst: MeshAddress,
        iv_index: u32,
        seq: SeqNumber,
        ctl: bool,
        ttl: u8,
        ltr_pdu: &[u8],
    ) -> bool {
        if ltr_pdu.is_empty() || ltr_pdu.len() > FRIEND_QUEUE_MAX_LTR_PDU {
            return false;
        }
        // TTL 0 and 1 PDUs would die before reaching the LPN's neighbors.
        if ttl <= 1 {
            return false;
        }

        let is_ack = ctl && ltr_pdu[0] == CtlOpcode::SegmentAck as u8
            && ltr_pdu[0] & SEG_MASK == 0;
        let mut flags = EntryFlags::DATA;
        if is_ack {
            flags = EntryFlags::ACK;
            // At most one ACK per (src, dst, SeqZero): a newer SeqAuth wins.
            if let Ok(ack) = SegmentAck::parse(&ltr_pdu[1..]) {
                if let Some(pos) = self.entries.iter().position(|e| {
                    e.src == src
                        && e.dst == dst
                        && e.ack_seq_zero() == Some(ack.seq_zero)
                }) {
                    let old = &self.entries[pos];
                    if (iv_index, seq) > (old.iv_index, old.seq)
                        && !old.flags.contains(EntryFlags::ACK_PEND)
                    {
                        self.entries.remove(pos);
                    } else {
                        return false;
                    }
                }
            }
        }

        if !self.make_room() {
            warn!("friend queue holds only updates, PDU rejected");
            return false;
        }
        self.entries.push_back(QueueEntry {
            src,
            dst,
            iv_index,
            seq,
            ctl,
            ttl,
            ltr_pdu: ltr_pdu.to_vec(),
            flags,
        });
        true
    }

    /// Queues a Friend Update carrying the subnet's security snapshot. The
    /// SRC/SEQ are stamped at emission by the role.
    pub fn add_update(&mut self, flags: UpdateFlags, iv_index: u32) {
        let pdu = FriendUpdatePdu::new(flags, iv_index, false);
        let mut ltr_pdu = Vec::with_capacity(1 + 6);
        ltr_pdu.push(CtlOpcode::FriendUpdate as u8);
        ltr_pdu.extend_from_slice(zerocopy::IntoBytes::as_bytes(&pdu));

        if !self.make_room() {
            warn!("friend queue cannot absorb another update");
            return;
        }
        self.entries.push_back(QueueEntry {
            src: 0,
            dst: 0,
            iv_index,
            seq: 0,
            ctl: true,
            ttl: 0,
            ltr_pdu,
            flags: EntryFlags::UPDATE,
        });
    }

    /// Head of the queue for transmission, marked as pending until the LPN
    /// acknowledges with a toggled FSN. Updates get their MD stamped from
    /// the queue residue.
    pub fn next_to_send(&mut self) -> Option<QueueEntry> {
        let more = self.entries.len() > 1;
        let head = self.entries.front_mut()?;
        head.flags |= EntryFlags::ACK_PEND;
        if head.flags.contains(EntryFlags::UPDATE) {
            head.ltr_pdu[UPDATE_MD_OFFSET] = more as u8;
        }
        Some(head.clone())
    }

    /// Drops the head once the LPN's FSN toggle confirmed it.
    pub fn confirm_delivered(&mut self) {
        if self
            .entries
            .front()
            .is_some_and(|e| e.flags.contains(EntryFlags::ACK_PEND))
        {
            self.entries.pop_front();
        }
    }

    /// In-order view of the queued entries.
    pub fn entries(&self) -> impl Iterator<Item = &QueueEntry> {
        self.entries.iter()
    }
}
