// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! SAR reassembly: a fixed pool of transaction slots keyed by
//! `(src, dst, SegN)`, each with a BlockAck mask, an ack timer and an
//! incomplete timer.

use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, trace, warn};

use crate::{
    lower_transport::{FriendSegment, LtrAccPduInfo, LtrCtlPduInfo, TransportEffect},
    models::{
        common::{MeshAddress, SeqNumber, is_unicast, seq_from_seq_zero},
        opcode::CtlOpcode,
        transport::{
            LTR_MAX_SEG_ACC_PDU_LEN, LTR_MAX_SEG_CTL_PDU_LEN,
            ack::SegmentAck,
            segment::{AccHeaderByte, SegHeader, build_seg_access, build_seg_control},
        },
    },
    network::{NwkPduRxInfo, NwkPduTxInfo},
    node::{
        msg::{MeshMsg, TimerEvent},
        timer::{self, TimerHandle},
    },
    replay::sar_history::{HistoryVerdict, SarRxHistory},
};

/// Incomplete timeout: a transaction silent this long is abandoned.
pub const SAR_RX_INCOMPLETE_TIMEOUT: Duration = Duration::from_secs(10);

/// Ack timer: `150 ms + 50 ms × received TTL`.
#[inline]
pub fn sar_rx_ack_timeout(ttl: u8) -> Duration {
    Duration::from_millis(150 + 50 * u64::from(ttl))
}

/// First LTR octet of the transaction, access or control flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TranKind {
    Access { hdr: AccHeaderByte, szmic: bool },
    Control { opcode: CtlOpcode },
}

impl TranKind {
    #[inline]
    fn seg_size(&self) -> usize {
        match self {
            TranKind::Access { .. } => LTR_MAX_SEG_ACC_PDU_LEN,
            TranKind::Control { .. } => LTR_MAX_SEG_CTL_PDU_LEN,
        }
    }
}

/// One reassembly slot.
struct SarRxTran {
    in_use: bool,
    generation: u64,
    kind: TranKind,
    src: MeshAddress,
    dst: MeshAddress,
    net_key_index: u16,
    iv_index: u32,
    seq_zero: u16,
    seg_n: u8,
    /// Reconstructed first-segment SEQ, the transaction's SeqAuth.
    first_seq: SeqNumber,
    gt_seq: SeqNumber,
    block_ack: u32,
    buf: Vec<u8>,
    last_seg_len: Option<usize>,
    /// Original SegO/SEQ of each accepted fragment, kept for the Friend
    /// Queue hand-off.
    seg_info: Vec<(u8, SeqNumber)>,
    /// Acknowledging on behalf of an LPN.
    obo: bool,
    dst_is_own: bool,
    dst_is_lpn: bool,
    dst_is_subscribed: bool,
    last_rx_ttl: u8,
    iface: crate::node::bearer::IfaceId,
    rssi: i8,
    friend_lpn_addr: Option<MeshAddress>,
    ack_tmr: TimerHandle,
    incomp_tmr: TimerHandle,
}

impl SarRxTran {
    fn empty() -> Self {
        Self {
            in_use: false,
            generation: 0,
            kind: TranKind::Control { opcode: CtlOpcode::SegmentAck },
            src: 0,
            dst: 0,
            net_key_index: 0,
            iv_index: 0,
            seq_zero: 0,
            seg_n: 0,
            first_seq: 0,
            gt_seq: 0,
            block_ack: 0,
            buf: Vec::new(),
            last_seg_len: None,
            seg_info: Vec::new(),
            obo: false,
            dst_is_own: false,
            dst_is_lpn: false,
            dst_is_subscribed: false,
            last_rx_ttl: 0,
            iface: 0,
            rssi: 0,
            friend_lpn_addr: None,
            ack_tmr: TimerHandle::idle(),
            incomp_tmr: TimerHandle::idle(),
        }
    }

    #[inline]
    fn is_complete(&self) -> bool {
        self.block_ack == SegmentAck::full_mask(self.seg_n)
    }

    /// Total reassembled length; valid only once complete.
    fn reassembled_len(&self) -> usize {
        usize::from(self.seg_n) * self.kind.seg_size()
            + self.last_seg_len.unwrap_or(self.kind.seg_size())
    }
}

/// Destination classification supplied by the handler per segment.
#[derive(Debug, Clone, Copy, Default)]
pub struct DstInfo {
    pub is_own_unicast: bool,
    pub is_subscribed: bool,
    /// At least one befriended LPN is a destination.
    pub is_lpn: bool,
}

pub struct SarRx {
    slots: Vec<SarRxTran>,
    msg_tx: UnboundedSender<MeshMsg>,
    /// Source address used on acks sent on behalf of an LPN.
    primary_addr: MeshAddress,
}

impl SarRx {
    pub fn new(
        slot_count: usize,
        primary_addr: MeshAddress,
        msg_tx: UnboundedSender<MeshMsg>,
    ) -> Self {
        Self {
            slots: (0..slot_count).map(|_| SarRxTran::empty()).collect(),
            msg_tx,
            primary_addr,
        }
    }

    /// Processes one received segment. `seq_alloc` yields fresh sequence
    /// numbers for acks; `None` suppresses the ack.
    #[allow(clippy::too_many_arguments)]
    pub fn process_segment(
        &mut self,
        history: &mut SarRxHistory,
        info: &NwkPduRxInfo,
        kind_hdr: SegmentedHeader,
        seg: SegHeader,
        segment: &[u8],
        dst: DstInfo,
        default_ttl: u8,
        seq_alloc: &mut dyn FnMut() -> Option<SeqNumber>,
    ) -> Vec<TransportEffect> {
        let mut effects = Vec::new();
        let ivi_lsb = (info.iv_index & 0x03) as u8;
        let first_seq = seq_from_seq_zero(info.seq, seg.seq_zero);

        // Segment length sanity: only the last fragment may run short.
        let kind = match kind_hdr {
            SegmentedHeader::Access { hdr, szmic } => TranKind::Access { hdr, szmic },
            SegmentedHeader::Control { opcode } => TranKind::Control { opcode },
        };
        let seg_size = kind.seg_size();
        if segment.is_empty()
            || segment.len() > seg_size
            || (seg.seg_o < seg.seg_n && segment.len() != seg_size)
        {
            debug!(len = segment.len(), "malformed segment length, dropped");
            return effects;
        }

        // Freshness history first: completed transactions re-ack, stale die.
        match history.check(info.src, info.seq, seg.seq_zero, ivi_lsb, seg.seg_n) {
            HistoryVerdict::Unknown => {},
            HistoryVerdict::CurrentCompleted { obo } => {
                if is_unicast(info.dst) {
                    self.push_ack_effect(
                        &mut effects,
                        info.src,
                        info.dst,
                        info.net_key_index,
                        seg.seq_zero,
                        SegmentAck::full_mask(seg.seg_n),
                        obo,
                        default_ttl,
                        seq_alloc,
                    );
                }
                return effects;
            },
            HistoryVerdict::CurrentAborted | HistoryVerdict::Outdated => {
                trace!(src = info.src, "stale segment dropped");
                return effects;
            },
        }

        // Locate or allocate the slot.
        let slot_idx = match self.find_slot(info.src, info.dst) {
            Some(idx) => {
                let tran = &self.slots[idx];
                if tran.seq_zero == seg.seq_zero
                    && tran.seg_n == seg.seg_n
                    && (tran.iv_index & 0x03) as u8 == ivi_lsb
                {
                    idx
                } else if first_seq > tran.first_seq || info.iv_index > tran.iv_index {
                    // Newer SeqAuth abandons the in-progress reassembly.
                    self.abort_slot(idx, history);
                    match self.start_slot(idx, history, info, kind, seg, first_seq, dst)
                    {
                        Some(idx) => idx,
                        None => return effects,
                    }
                } else {
                    trace!(src = info.src, "segment of an older transaction dropped");
                    return effects;
                }
            },
            None => {
                let Some(free) = self.slots.iter().position(|t| !t.in_use) else {
                    // No room: unicast destinations get a fast-NACK.
                    if is_unicast(info.dst) {
                        warn!(src = info.src, "no SAR-RX slot, rejecting transaction");
                        self.push_ack_effect(
                            &mut effects,
                            info.src,
                            info.dst,
                            info.net_key_index,
                            seg.seq_zero,
                            0,
                            dst.is_lpn && !dst.is_own_unicast,
                            default_ttl,
                            seq_alloc,
                        );
                    }
                    return effects;
                };
                match self.start_slot(free, history, info, kind, seg, first_seq, dst) {
                    Some(idx) => idx,
                    None => return effects,
                }
            },
        };

        let msg_tx = self.msg_tx.clone();
        let tran = &mut self.slots[slot_idx];
        tran.last_rx_ttl = info.ttl;
        tran.gt_seq = tran.gt_seq.max(info.seq);

        let bit = 1u32 << seg.seg_o;
        let duplicate = tran.block_ack & bit != 0;
        if !duplicate {
            let off = usize::from(seg.seg_o) * seg_size;
            tran.buf[off..off + segment.len()].copy_from_slice(segment);
            tran.block_ack |= bit;
            tran.seg_info.push((seg.seg_o, info.seq));
            if seg.seg_o == seg.seg_n {
                tran.last_seg_len = Some(segment.len());
            }
        }

        if tran.is_complete() {
            self.finish_slot(slot_idx, history, &mut effects, default_ttl, seq_alloc);
        } else {
            // Keep the transaction alive and schedule the block-ack.
            timer::restart(
                &mut tran.incomp_tmr,
                &msg_tx,
                SAR_RX_INCOMPLETE_TIMEOUT,
                TimerEvent::SarRxIncomplete {
                    slot: slot_idx,
                    generation: tran.generation,
                },
            );
            if is_unicast(info.dst) {
                timer::restart(
                    &mut tran.ack_tmr,
                    &msg_tx,
                    sar_rx_ack_timeout(info.ttl),
                    TimerEvent::SarRxAck {
                        slot: slot_idx,
                        generation: tran.generation,
                    },
                );
            }
        }
        effects
    }

    /// Ack timer expiry: send the current BlockAck for a live transaction.
    pub fn on_ack_timer(
        &mut self,
        slot: usize,
        generation: u64,
        default_ttl: u8,
        seq_alloc: &mut dyn FnMut() -> Option<SeqNumber>,
    ) -> Vec<TransportEffect> {
        let mut effects = Vec::new();
        let Some(tran) = self.slots.get_mut(slot) else {
            return effects;
        };
        if !tran.in_use || tran.generation != generation {
            return effects;
        }
        tran.ack_tmr = TimerHandle::idle();
        if is_unicast(tran.dst) {
            let (src, dst, nki, seq_zero, mask, obo) = (
                tran.src,
                tran.dst,
                tran.net_key_index,
                tran.seq_zero,
                tran.block_ack,
                tran.obo,
            );
            self.push_ack_effect(
                &mut effects, src, dst, nki, seq_zero, mask, obo, default_ttl,
                seq_alloc,
            );
        }
        effects
    }

    /// Incomplete timer expiry: abandon the slot and remember the abort.
    pub fn on_incomplete_timer(
        &mut self,
        slot: usize,
        generation: u64,
        history: &mut SarRxHistory,
    ) {
        let Some(tran) = self.slots.get(slot) else {
            return;
        };
        if !tran.in_use || tran.generation != generation {
            return;
        }
        debug!(src = tran.src, seq_zero = tran.seq_zero, "reassembly timed out");
        self.abort_slot(slot, history);
    }

    /// Tears down every slot (node reset).
    pub fn reset(&mut self) {
        for idx in 0..self.slots.len() {
            let tran = &mut self.slots[idx];
            tran.ack_tmr.stop();
            tran.incomp_tmr.stop();
            let generation = tran.generation;
            *tran = SarRxTran::empty();
            tran.generation = generation + 1;
        }
    }

    fn find_slot(&self, src: MeshAddress, dst: MeshAddress) -> Option<usize> {
        self.slots
            .iter()
            .position(|t| t.in_use && t.src == src && t.dst == dst)
    }

    #[allow(clippy::too_many_arguments)]
    fn start_slot(
        &mut self,
        idx: usize,
        history: &mut SarRxHistory,
        info: &NwkPduRxInfo,
        kind: TranKind,
        seg: SegHeader,
        first_seq: SeqNumber,
        dst: DstInfo,
    ) -> Option<usize> {
        let buf_len = (usize::from(seg.seg_n) + 1) * kind.seg_size();
        let generation = self.slots[idx].generation + 1;
        let ivi_lsb = (info.iv_index & 0x03) as u8;

        // A fresh SeqAuth obsoletes older history entries from this source.
        history.cleanup_old(info.src, seg.seq_zero, ivi_lsb);

        self.slots[idx] = SarRxTran {
            in_use: true,
            generation,
            kind,
            src: info.src,
            dst: info.dst,
            net_key_index: info.net_key_index,
            iv_index: info.iv_index,
            seq_zero: seg.seq_zero,
            seg_n: seg.seg_n,
            first_seq,
            gt_seq: info.seq,
            block_ack: 0,
            buf: vec![0u8; buf_len],
            last_seg_len: None,
            seg_info: Vec::with_capacity(usize::from(seg.seg_n) + 1),
            obo: dst.is_lpn && !dst.is_own_unicast,
            dst_is_own: dst.is_own_unicast,
            dst_is_lpn: dst.is_lpn,
            dst_is_subscribed: dst.is_subscribed,
            last_rx_ttl: info.ttl,
            iface: info.iface,
            rssi: info.rssi,
            friend_lpn_addr: info.friend_lpn_addr,
            ack_tmr: TimerHandle::idle(),
            incomp_tmr: TimerHandle::idle(),
        };
        Some(idx)
    }

    fn abort_slot(&mut self, idx: usize, history: &mut SarRxHistory) {
        let tran = &mut self.slots[idx];
        if !tran.in_use {
            return;
        }
        tran.ack_tmr.stop();
        tran.incomp_tmr.stop();
        history.add(
            tran.src,
            tran.first_seq,
            (tran.iv_index & 0x03) as u8,
            tran.seg_n,
            tran.obo,
            false,
        );
        let generation = tran.generation;
        *tran = SarRxTran::empty();
        tran.generation = generation + 1;
    }

    fn finish_slot(
        &mut self,
        idx: usize,
        history: &mut SarRxHistory,
        effects: &mut Vec<TransportEffect>,
        default_ttl: u8,
        seq_alloc: &mut dyn FnMut() -> Option<SeqNumber>,
    ) {
        let tran = &mut self.slots[idx];
        tran.ack_tmr.stop();
        tran.incomp_tmr.stop();

        let total = tran.reassembled_len();
        let payload = bytes::Bytes::copy_from_slice(&tran.buf[..total]);

        if is_unicast(tran.dst) {
            let (src, dst, nki, seq_zero, mask, obo) = (
                tran.src,
                tran.dst,
                tran.net_key_index,
                tran.seq_zero,
                tran.block_ack,
                tran.obo,
            );
            self.push_ack_effect(
                effects, src, dst, nki, seq_zero, mask, obo, default_ttl, seq_alloc,
            );
        }

        let tran = &mut self.slots[idx];
        if tran.dst_is_lpn {
            let mut seg_info = tran.seg_info.clone();
            seg_info.sort_unstable_by_key(|(seg_o, _)| *seg_o);
            let seg_size = tran.kind.seg_size();
            let segments = seg_info
                .iter()
                .map(|(seg_o, seq)| {
                    let off = usize::from(*seg_o) * seg_size;
                    let end = (off + seg_size).min(total);
                    let seg_hdr = SegHeader {
                        szmic: match tran.kind {
                            TranKind::Access { szmic, .. } => szmic,
                            TranKind::Control { .. } => false,
                        },
                        seq_zero: tran.seq_zero,
                        seg_o: *seg_o,
                        seg_n: tran.seg_n,
                    };
                    let ltr_pdu = match tran.kind {
                        TranKind::Access { hdr, .. } => {
                            build_seg_access(hdr, seg_hdr, &tran.buf[off..end])
                        },
                        TranKind::Control { opcode } => {
                            build_seg_control(opcode, seg_hdr, &tran.buf[off..end])
                        },
                    };
                    FriendSegment { seq: *seq, seg_o: *seg_o, ltr_pdu }
                })
                .collect();
            effects.push(TransportEffect::FriendEnqueue {
                src: tran.src,
                dst: tran.dst,
                net_key_index: tran.net_key_index,
                iv_index: tran.iv_index,
                ctl: matches!(tran.kind, TranKind::Control { .. }),
                ttl: tran.last_rx_ttl,
                segments,
            });
        }

        if tran.dst_is_own || tran.dst_is_subscribed {
            match tran.kind {
                TranKind::Access { hdr, szmic } => {
                    effects.push(TransportEffect::DeliverAccess(LtrAccPduInfo {
                        src: tran.src,
                        dst: tran.dst,
                        friend_lpn_addr: tran.friend_lpn_addr,
                        net_key_index: tran.net_key_index,
                        ttl: tran.last_rx_ttl,
                        akf: hdr.akf,
                        aid: hdr.aid,
                        szmic,
                        seq: tran.first_seq,
                        gt_seq: tran.gt_seq,
                        iv_index: tran.iv_index,
                        utr_pdu: payload,
                    }));
                },
                TranKind::Control { opcode } => {
                    effects.push(TransportEffect::DeliverControl(LtrCtlPduInfo {
                        src: tran.src,
                        dst: tran.dst,
                        net_key_index: tran.net_key_index,
                        ttl: tran.last_rx_ttl,
                        opcode,
                        seq: tran.first_seq,
                        gt_seq: tran.gt_seq,
                        iv_index: tran.iv_index,
                        params: payload,
                        iface: tran.iface,
                        rssi: tran.rssi,
                        friend_lpn_addr: tran.friend_lpn_addr,
                    }));
                },
            }
        }

        history.add(
            tran.src,
            tran.first_seq,
            (tran.iv_index & 0x03) as u8,
            tran.seg_n,
            tran.obo,
            true,
        );
        let generation = tran.generation;
        *tran = SarRxTran::empty();
        tran.generation = generation + 1;
    }

    #[allow(clippy::too_many_arguments)]
    fn push_ack_effect(
        &self,
        effects: &mut Vec<TransportEffect>,
        tran_src: MeshAddress,
        tran_dst: MeshAddress,
        net_key_index: u16,
        seq_zero: u16,
        block_ack: u32,
        obo: bool,
        ttl: u8,
        seq_alloc: &mut dyn FnMut() -> Option<SeqNumber>,
    ) -> bool {
        let Some(seq) = seq_alloc() else {
            warn!("no sequence number for segment ack");
            return false;
        };
        let ack = SegmentAck { obo, seq_zero, block_ack };
        // An OBO ack originates from this node, not the LPN it covers.
        let src = if obo { self.primary_addr } else { tran_dst };
        effects.push(TransportEffect::SendNetwork {
            info: NwkPduTxInfo {
                src,
                dst: tran_src,
                ctl: true,
                ttl,
                seq,
                net_key_index,
                friend_lpn_addr: None,
                priority: false,
            },
            ltr_pdu: ack.to_ltr_pdu().to_vec(),
        });
        true
    }
}

/// Parsed first octet of a segmented LTR PDU, as seen by the dispatcher.
#[derive(Debug, Clone, Copy)]
pub enum SegmentedHeader {
    Access { hdr: AccHeaderByte, szmic: bool },
    Control { opcode: CtlOpcode },
}
