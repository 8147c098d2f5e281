// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! SAR segmentation and retransmission.
//!
//! Each transaction splits an upper-transport PDU into `SegN + 1` segments,
//! allocates a fresh SEQ per transmission, and resends unacked segments on
//! an exponential-ish backoff until the peer's BlockAck fills up, the peer
//! rejects, or the retry budget runs out.

use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

use crate::{
    lower_transport::TransportEffect,
    models::{
        common::{MESH_SEQ_ZERO_MASK, MeshAddress, SeqNumber},
        opcode::CtlOpcode,
        transport::{
            LTR_MAX_SEG_ACC_PDU_LEN, LTR_MAX_SEG_CTL_PDU_LEN, LTR_MAX_SEG_N,
            ack::SegmentAck,
            segment::{AccHeaderByte, SegHeader, build_seg_access, build_seg_control},
        },
    },
    network::NwkPduTxInfo,
    node::{
        msg::{MeshMsg, TimerEvent},
        timer::{self, TimerHandle},
    },
};

/// First retry delay; doubles per attempt.
pub const SAR_TX_RETRY_BASE: Duration = Duration::from_millis(200);
/// Transmission bursts before the transaction times out.
pub const SAR_TX_MAX_ATTEMPTS: u8 = 4;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SarTxError {
    #[error("no free SAR-TX transaction slot")]
    NoSlot,
    #[error("payload exceeds the segmented transport limit")]
    TooLarge,
    #[error("sequence number space exhausted")]
    SeqExhausted,
}

/// Access or control flavor of an outgoing transaction.
#[derive(Debug, Clone, Copy)]
pub enum TxKind {
    Access { hdr: AccHeaderByte, szmic: bool },
    Control { opcode: CtlOpcode },
}

impl TxKind {
    #[inline]
    fn seg_size(&self) -> usize {
        match self {
            TxKind::Access { .. } => LTR_MAX_SEG_ACC_PDU_LEN,
            TxKind::Control { .. } => LTR_MAX_SEG_CTL_PDU_LEN,
        }
    }
}

/// Addressing and credentials of one transaction.
#[derive(Debug, Clone, Copy)]
pub struct SarTxParams {
    pub src: MeshAddress,
    pub dst: MeshAddress,
    pub net_key_index: u16,
    pub friend_lpn_addr: Option<MeshAddress>,
    pub ttl: u8,
    pub priority: bool,
    pub kind: TxKind,
}

struct SarTxTran {
    in_use: bool,
    generation: u64,
    params: SarTxParams,
    seq_zero: u16,
    first_seq: SeqNumber,
    chunks: Vec<Vec<u8>>,
    unacked: u32,
    attempts: u8,
    retry_tmr: TimerHandle,
}

impl SarTxTran {
    fn empty() -> Self {
        Self {
            in_use: false,
            generation: 0,
            params: SarTxParams {
                src: 0,
                dst: 0,
                net_key_index: 0,
                friend_lpn_addr: None,
                ttl: 0,
                priority: false,
                kind: TxKind::Control { opcode: CtlOpcode::SegmentAck },
            },
            seq_zero: 0,
            first_seq: 0,
            chunks: Vec::new(),
            unacked: 0,
            attempts: 0,
            retry_tmr: TimerHandle::idle(),
        }
    }

    #[inline]
    fn seg_n(&self) -> u8 {
        (self.chunks.len() - 1) as u8
    }
}

pub struct SarTx {
    slots: Vec<SarTxTran>,
    msg_tx: UnboundedSender<MeshMsg>,
}

impl SarTx {
    pub fn new(slot_count: usize, msg_tx: UnboundedSender<MeshMsg>) -> Self {
        Self {
            slots: (0..slot_count).map(|_| SarTxTran::empty()).collect(),
            msg_tx,
        }
    }

    /// Starts a segmented transaction and returns the first transmission
    /// burst. `first_seq` is the caller-allocated SEQ of segment 0 — the
    /// transaction's SeqAuth, already baked into the payload's nonce.
    pub fn send(
        &mut self,
        params: SarTxParams,
        payload: &[u8],
        first_seq: SeqNumber,
        seq_alloc: &mut dyn FnMut() -> Option<SeqNumber>,
    ) -> Result<(SeqNumber, Vec<TransportEffect>), SarTxError> {
        let seg_size = params.kind.seg_size();
        let max_len = seg_size * (usize::from(LTR_MAX_SEG_N) + 1);
        if payload.is_empty() || payload.len() > max_len {
            return Err(SarTxError::TooLarge);
        }
        let idx = self
            .slots
            .iter()
            .position(|t| !t.in_use)
            .ok_or(SarTxError::NoSlot)?;

        let seq_zero = (first_seq & MESH_SEQ_ZERO_MASK) as u16;
        let chunks: Vec<Vec<u8>> =
            payload.chunks(seg_size).map(|c| c.to_vec()).collect();

        let generation = self.slots[idx].generation + 1;
        self.slots[idx] = SarTxTran {
            in_use: true,
            generation,
            params,
            seq_zero,
            first_seq,
            unacked: SegmentAck::full_mask((chunks.len() - 1) as u8),
            chunks,
            attempts: 0,
            retry_tmr: TimerHandle::idle(),
        };

        let effects = self.transmit_burst(idx, Some(first_seq), seq_alloc);
        Ok((first_seq, effects))
    }

    /// Applies a received Segment ACK from `ack_src`. Bits clear in the
    /// BlockAck trigger an immediate retransmission; an empty BlockAck
    /// aborts the transaction.
    pub fn on_segment_ack(
        &mut self,
        ack_src: MeshAddress,
        ack: &SegmentAck,
        seq_alloc: &mut dyn FnMut() -> Option<SeqNumber>,
    ) -> Vec<TransportEffect> {
        let mut effects = Vec::new();
        let Some(idx) = self.slots.iter().position(|t| {
            t.in_use && t.params.dst == ack_src && t.seq_zero == ack.seq_zero
        }) else {
            debug!(ack_src, seq_zero = ack.seq_zero, "segment ack without transaction");
            return effects;
        };

        if ack.block_ack == 0 {
            // Peer has no room for the transaction.
            let first_seq = self.slots[idx].first_seq;
            self.free_slot(idx);
            effects.push(TransportEffect::TxRejected { seq: first_seq });
            return effects;
        }

        let tran = &mut self.slots[idx];
        tran.unacked &= !ack.block_ack;
        if tran.unacked == 0 {
            let first_seq = tran.first_seq;
            self.free_slot(idx);
            effects.push(TransportEffect::TxDone { seq: first_seq });
            return effects;
        }
        // Resend what the peer still misses.
        self.transmit_burst_into(&mut effects, idx, None, seq_alloc);
        effects
    }

    /// Retry timer expiry: resend unacked segments or give up.
    pub fn on_retry_timer(
        &mut self,
        slot: usize,
        generation: u64,
        seq_alloc: &mut dyn FnMut() -> Option<SeqNumber>,
    ) -> Vec<TransportEffect> {
        let mut effects = Vec::new();
        let Some(tran) = self.slots.get_mut(slot) else {
            return effects;
        };
        if !tran.in_use || tran.generation != generation {
            return effects;
        }
        if tran.attempts >= SAR_TX_MAX_ATTEMPTS {
            warn!(dst = tran.params.dst, seq_zero = tran.seq_zero, "SAR-TX timed out");
            let first_seq = tran.first_seq;
            self.free_slot(slot);
            effects.push(TransportEffect::TxTimeout { seq: first_seq });
            return effects;
        }
        self.transmit_burst_into(&mut effects, slot, None, seq_alloc);
        effects
    }

    pub fn reset(&mut self) {
        for tran in &mut self.slots {
            tran.retry_tmr.stop();
            let generation = tran.generation;
            *tran = SarTxTran::empty();
            tran.generation = generation + 1;
        }
    }

    fn free_slot(&mut self, idx: usize) {
        let tran = &mut self.slots[idx];
        tran.retry_tmr.stop();
        let generation = tran.generation;
        *tran = SarTxTran::empty();
        tran.generation = generation + 1;
    }

    fn transmit_burst(
        &mut self,
        idx: usize,
        first_seq: Option<SeqNumber>,
        seq_alloc: &mut dyn FnMut() -> Option<SeqNumber>,
    ) -> Vec<TransportEffect> {
        let mut effects = Vec::new();
        self.transmit_burst_into(&mut effects, idx, first_seq, seq_alloc);
        effects
    }

    /// Emits every unacked segment. `first_seq` carries the pre-allocated
    /// SEQ of segment 0 on the initial burst.
    fn transmit_burst_into(
        &mut self,
        effects: &mut Vec<TransportEffect>,
        idx: usize,
        mut first_seq: Option<SeqNumber>,
        seq_alloc: &mut dyn FnMut() -> Option<SeqNumber>,
    ) {
        let msg_tx = self.msg_tx.clone();
        let tran = &mut self.slots[idx];
        let seg_n = tran.seg_n();

        for seg_o in 0..=seg_n {
            if tran.unacked & (1 << seg_o) == 0 {
                continue;
            }
            let seq = match first_seq.take() {
                Some(seq) => Some(seq),
                None => seq_alloc(),
            };
            let Some(seq) = seq else {
                warn!("sequence space exhausted mid-burst");
                break;
            };
            let seg_hdr = SegHeader {
                szmic: match tran.params.kind {
                    TxKind::Access { szmic, .. } => szmic,
                    TxKind::Control { .. } => false,
                },
                seq_zero: tran.seq_zero,
                seg_o,
                seg_n,
            };
            let chunk = &tran.chunks[usize::from(seg_o)];
            let ltr_pdu = match tran.params.kind {
                TxKind::Access { hdr, .. } => build_seg_access(hdr, seg_hdr, chunk),
                TxKind::Control { opcode } => build_seg_control(opcode, seg_hdr, chunk),
            };
            effects.push(TransportEffect::SendNetwork {
                info: NwkPduTxInfo {
                    src: tran.params.src,
                    dst: tran.params.dst,
                    ctl: matches!(tran.params.kind, TxKind::Control { .. }),
                    ttl: tran.params.ttl,
                    seq,
                    net_key_index: tran.params.net_key_index,
                    friend_lpn_addr: tran.params.friend_lpn_addr,
                    priority: tran.params.priority,
                },
                ltr_pdu,
            });
        }

        let delay = SAR_TX_RETRY_BASE * (1u32 << tran.attempts.min(4));
        tran.attempts += 1;
        timer::restart(
            &mut tran.retry_tmr,
            &msg_tx,
            delay,
            TimerEvent::SarTxRetry { slot: idx, generation: tran.generation },
        );
    }
}
