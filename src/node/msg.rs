// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Messages drained by the node's single cooperative handler.
//!
//! Everything that happens to the core — bearer ingress, timer expiry,
//! application commands — arrives as one [`MeshMsg`]. Processing one message
//! is atomic with respect to every store; contexts other than the handler
//! only ever enqueue.

use bytes::Bytes;

use crate::{
    cfg::enums::FeatureState,
    models::common::MeshAddress,
    node::bearer::IfaceId,
};

/// Top-level handler message.
#[derive(Debug)]
pub enum MeshMsg {
    /// Raw network PDU delivered by a bearer interface.
    BearerRx { iface: IfaceId, pdu: Bytes, rssi: i8 },
    /// Interface lifecycle notification.
    Iface(IfaceEvent),
    /// One-shot timer expiry.
    Timer(TimerEvent),
    /// Application command.
    Command(NodeCommand),
    /// Stops the handler loop.
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IfaceEvent {
    Added(IfaceId),
    Removed(IfaceId),
    Closed(IfaceId),
}

/// Timer expiries. Slot-bound variants carry the slot's generation at arm
/// time; a handler ignores the message when the generation moved on, which
/// is how late expiries for freed slots die.
#[derive(Debug, Clone)]
pub enum TimerEvent {
    SarRxAck { slot: usize, generation: u64 },
    SarRxIncomplete { slot: usize, generation: u64 },
    SarTxRetry { slot: usize, generation: u64 },
    /// One spaced retransmission of an already-encoded relay PDU.
    RelayRetransmit { pdu: Bytes, remaining: u8, interval_ms: u64 },
    FriendRecvDelay { ctx: usize, generation: u64 },
    /// Establishment window between Friend Offer and the first Poll.
    FriendEstablish { ctx: usize, generation: u64 },
    FriendPollTimeout { ctx: usize, generation: u64 },
    FriendClearPeriod { ctx: usize, generation: u64 },
    FriendSubscrCnfDelay { ctx: usize, generation: u64 },
    /// LPN cadence timer: offer window, receive delay, receive window or
    /// sleep, depending on the context's state.
    LpnCadence { ctx: usize, generation: u64 },
    LpnPollTimeout { ctx: usize, generation: u64 },
    HbPublication,
    HbSubPeriod,
}

/// Access-layer send request; `payload` is the opaque `opcode ‖ params`.
#[derive(Debug, Clone)]
pub struct AccessSendReq {
    pub element_index: u8,
    pub dst: MeshAddress,
    /// Label UUID when `dst` is virtual; used as CCM additional data.
    pub label_uuid: Option<[u8; 16]>,
    /// Bound AppKey index; `None` selects the device key (AKF = 0).
    pub app_key_index: Option<u16>,
    pub net_key_index: u16,
    /// `None` falls back to the default TTL.
    pub ttl: Option<u8>,
    /// Use the 64-bit TransMIC (forces segmentation).
    pub szmic64: bool,
    /// Demand segmented delivery with acknowledgement even when the payload
    /// fits one PDU.
    pub ack_required: bool,
    pub payload: Bytes,
}

/// Heartbeat publication parameters, as set by the configuration server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeartbeatPubState {
    pub dst: MeshAddress,
    pub count_log: u8,
    pub period_log: u8,
    pub ttl: u8,
    /// Feature bits whose change triggers an out-of-cycle publication.
    pub features: u16,
    pub net_key_index: u16,
}

/// Heartbeat subscription parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeartbeatSubState {
    pub src: MeshAddress,
    pub dst: MeshAddress,
    pub period_log: u8,
}

/// Application-facing commands; configuration mutations land here so they
/// serialize with PDU processing.
#[derive(Debug, Clone)]
pub enum NodeCommand {
    SendAccess(AccessSendReq),

    AddNetKey { net_key_index: u16, key: [u8; 16] },
    UpdateNetKey { net_key_index: u16, key: [u8; 16] },
    DeleteNetKey { net_key_index: u16 },
    SetKeyRefreshPhase { net_key_index: u16, phase: u8 },

    AddAppKey { app_key_index: u16, net_key_index: u16, key: [u8; 16] },
    UpdateAppKey { app_key_index: u16, key: [u8; 16] },
    DeleteAppKey { app_key_index: u16 },
    BindAppKey { element_index: u8, model_pos: u8, app_key_index: u16 },

    SubscribeAdd { element_index: u8, model_pos: u8, addr: MeshAddress },
    SubscribeAddVirtual { element_index: u8, model_pos: u8, label_uuid: [u8; 16] },
    SubscribeRemove { element_index: u8, model_pos: u8, addr: MeshAddress },

    SetPublication {
        element_index: u8,
        model_pos: u8,
        publication: Option<crate::local_config::elements::ModelPublication>,
    },

    SetFeature { feature: NodeFeature, state: FeatureState },
    SetDefaultTtl { ttl: u8 },

    SetHeartbeatPub(HeartbeatPubState),
    SetHeartbeatSub(HeartbeatSubState),

    EstablishFriendship { net_key_index: u16 },
    TerminateFriendship { net_key_index: u16 },

    /// Subnet IV state observed by the beacon module (external collaborator).
    IvNotification { iv_index: u32, update_in_progress: bool },

    /// Erases NVM and degrades the node to unprovisioned.
    NodeReset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeFeature {
    Relay,
    Proxy,
    Friend,
    LowPower,
}
