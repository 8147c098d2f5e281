// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Events the core surfaces to the application.

use crate::{
    models::{
        common::{MeshAddress, SeqNumber},
        heartbeat::FeaturesBitmap,
    },
    node::bearer::IfaceId,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshEvent {
    NodeStarted {
        primary_addr: MeshAddress,
        element_count: u8,
    },
    InterfaceAdded(IfaceId),
    InterfaceRemoved(IfaceId),
    InterfaceClosed(IfaceId),
    IvUpdated {
        iv_index: u32,
    },
    HeartbeatInfo {
        src: MeshAddress,
        hops: u8,
        min_hops: u8,
        max_hops: u8,
        features: FeaturesBitmap,
    },
    FriendshipEstablished {
        net_key_index: u16,
    },
    FriendshipTerminated {
        net_key_index: u16,
    },
    /// Non-recoverable: the element ran out of sequence numbers.
    SeqExhausted {
        element_index: u8,
    },
    SendFailed {
        seq: SeqNumber,
    },
    SarTxTimeout {
        seq: SeqNumber,
    },
    SarTxRejected {
        seq: SeqNumber,
    },
    /// Reassembled or unsegmented access payload delivered upward.
    AccessRx {
        src: MeshAddress,
        dst: MeshAddress,
        app_key_index: Option<u16>,
        payload: bytes::Bytes,
    },
}
