// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Lower transport: segmentation on TX, reassembly on RX, block-ack timing.
//!
//! The module is effect-driven: every entry point returns the list of
//! [`TransportEffect`]s the handler must execute (network sends, upward
//! deliveries, friend queue hand-offs, send outcomes). This keeps the SAR
//! state machines pure and the cooperative scheduling visible in one place.

pub mod sar_rx;
pub mod sar_tx;

use bytes::Bytes;

use crate::{
    models::common::{MeshAddress, SeqNumber},
    network::NwkPduTxInfo,
    node::bearer::IfaceId,
};

/// Access PDU handed between upper and lower transport.
#[derive(Debug, Clone)]
pub struct LtrAccPduInfo {
    pub src: MeshAddress,
    pub dst: MeshAddress,
    pub friend_lpn_addr: Option<MeshAddress>,
    pub net_key_index: u16,
    pub ttl: u8,
    pub akf: bool,
    pub aid: u8,
    /// 64-bit TransMIC selector.
    pub szmic: bool,
    /// First-segment SEQ: the SeqAuth SEQ used for the application nonce.
    pub seq: SeqNumber,
    /// Greatest SEQ observed during a segmented reception.
    pub gt_seq: SeqNumber,
    pub iv_index: u32,
    /// Upper transport access PDU: encrypted payload plus TransMIC.
    pub utr_pdu: Bytes,
}

/// Control PDU handed between upper and lower transport.
#[derive(Debug, Clone)]
pub struct LtrCtlPduInfo {
    pub src: MeshAddress,
    pub dst: MeshAddress,
    pub net_key_index: u16,
    pub ttl: u8,
    pub opcode: crate::models::opcode::CtlOpcode,
    pub seq: SeqNumber,
    pub gt_seq: SeqNumber,
    pub iv_index: u32,
    pub params: Bytes,
    pub iface: IfaceId,
    pub rssi: i8,
    /// Friendship credentials carried the PDU on RX.
    pub friend_lpn_addr: Option<MeshAddress>,
}

/// One original segment preserved for a Friend Queue hand-off: the segment's
/// own SEQ and its rebuilt lower-transport PDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FriendSegment {
    pub seq: SeqNumber,
    pub seg_o: u8,
    pub ltr_pdu: Vec<u8>,
}

/// Side effects the handler executes after a lower-transport entry point.
#[derive(Debug)]
pub enum TransportEffect {
    /// Encode and transmit one network PDU.
    SendNetwork { info: NwkPduTxInfo, ltr_pdu: Vec<u8> },
    /// Deliver a complete access PDU to the upper transport.
    DeliverAccess(LtrAccPduInfo),
    /// Deliver a complete control PDU to the upper transport.
    DeliverControl(LtrCtlPduInfo),
    /// Hand a reassembled PDU destined for at least one LPN to the Friend
    /// role, re-split into its original segments.
    FriendEnqueue {
        src: MeshAddress,
        dst: MeshAddress,
        net_key_index: u16,
        iv_index: u32,
        ctl: bool,
        ttl: u8,
        segments: Vec<FriendSegment>,
    },
    /// Segmented TX finished: every segment acknowledged.
    TxDone { seq: SeqNumber },
    /// Segmented TX gave up after the retry budget.
    TxTimeout { seq: SeqNumber },
    /// Peer aborted the transaction with BlockAck = 0.
    TxRejected { seq: SeqNumber },
}
