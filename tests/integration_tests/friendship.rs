// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! End-to-end friendship: establishment, store-and-forward delivery through
//! the Friend Queue, poll retry exhaustion and explicit termination.

use bytes::Bytes;
use mesh_node_rs::{
    cfg::enums::FeatureState,
    node::{
        events::MeshEvent,
        msg::{AccessSendReq, NodeCommand, NodeFeature},
    },
};

use serial_test::serial;

use crate::integration_tests::common::{boot_node, expect_event, sample_config};

const FRIEND_ADDR: u16 = 0x0001;
const LPN_ADDR: u16 = 0x0100;

#[tokio::test(start_paused = true)]
#[serial]
async fn establish_deliver_and_terminate() {
    let mut cfg_friend = sample_config();
    cfg_friend.features.friend = FeatureState::Enabled;
    let mut cfg_lpn = sample_config();
    cfg_lpn.features.low_power = FeatureState::Enabled;

    let mut friend = boot_node(cfg_friend, FRIEND_ADDR, [0x11; 16]);
    let mut lpn = boot_node(cfg_lpn, LPN_ADDR, [0x22; 16]);
    friend.bearer.link(lpn.handle.clone());
    lpn.bearer.link(friend.handle.clone());

    for node in [&friend, &lpn] {
        node.handle.command(NodeCommand::AddAppKey {
            app_key_index: 0,
            net_key_index: 0,
            key: [0x77; 16],
        });
    }

    lpn.handle.command(NodeCommand::EstablishFriendship { net_key_index: 0 });

    expect_event(&mut lpn.events, "LPN establishment", |ev| {
        matches!(ev, MeshEvent::FriendshipEstablished { net_key_index: 0 })
    })
    .await;
    expect_event(&mut friend.events, "friend establishment", |ev| {
        matches!(ev, MeshEvent::FriendshipEstablished { net_key_index: 0 })
    })
    .await;

    // A message for the sleeping LPN parks in the Friend Queue and arrives
    // with the next poll.
    friend.handle.command(NodeCommand::SendAccess(AccessSendReq {
        element_index: 0,
        dst: LPN_ADDR,
        label_uuid: None,
        app_key_index: Some(0),
        net_key_index: 0,
        ttl: None,
        szmic64: false,
        ack_required: false,
        payload: Bytes::from_static(b"\x82\x02\x01"),
    }));

    let ev = expect_event(&mut lpn.events, "queued access delivery", |ev| {
        matches!(ev, MeshEvent::AccessRx { .. })
    })
    .await;
    match ev {
        MeshEvent::AccessRx { src, dst, app_key_index, payload } => {
            assert_eq!(src, FRIEND_ADDR);
            assert_eq!(dst, LPN_ADDR);
            assert_eq!(app_key_index, Some(0));
            assert_eq!(payload.as_ref(), b"\x82\x02\x01");
        },
        other => panic!("unexpected event: {other:?}"),
    }

    // Subscription sync: the LPN subscribes to a group; after the next
    // poll cycle the friend covers it, so group traffic reaches the LPN
    // through the queue.
    lpn.handle.command(NodeCommand::SubscribeAdd {
        element_index: 0,
        model_pos: 0,
        addr: 0xC200,
    });
    tokio::time::sleep(std::time::Duration::from_secs(15)).await;

    friend.handle.command(NodeCommand::SendAccess(AccessSendReq {
        element_index: 0,
        dst: 0xC200,
        label_uuid: None,
        app_key_index: Some(0),
        net_key_index: 0,
        ttl: None,
        szmic64: false,
        ack_required: false,
        payload: Bytes::from_static(b"\x82\x04\x00"),
    }));
    let ev = expect_event(&mut lpn.events, "group delivery via queue", |ev| {
        matches!(ev, MeshEvent::AccessRx { dst: 0xC200, .. })
    })
    .await;
    match ev {
        MeshEvent::AccessRx { src, payload, .. } => {
            assert_eq!(src, FRIEND_ADDR);
            assert_eq!(payload.as_ref(), b"\x82\x04\x00");
        },
        other => panic!("unexpected event: {other:?}"),
    }

    // Explicit teardown: both sides report the loss.
    lpn.handle.command(NodeCommand::TerminateFriendship { net_key_index: 0 });
    expect_event(&mut lpn.events, "LPN termination", |ev| {
        matches!(ev, MeshEvent::FriendshipTerminated { net_key_index: 0 })
    })
    .await;
    expect_event(&mut friend.events, "friend termination", |ev| {
        matches!(ev, MeshEvent::FriendshipTerminated { net_key_index: 0 })
    })
    .await;
}

#[tokio::test(start_paused = true)]
#[serial]
async fn poll_retry_exhaustion_terminates() {
    let mut cfg_friend = sample_config();
    cfg_friend.features.friend = FeatureState::Enabled;
    let mut cfg_lpn = sample_config();
    cfg_lpn.features.low_power = FeatureState::Enabled;

    let mut friend = boot_node(cfg_friend, FRIEND_ADDR, [0x11; 16]);
    let mut lpn = boot_node(cfg_lpn, LPN_ADDR, [0x22; 16]);
    friend.bearer.link(lpn.handle.clone());
    lpn.bearer.link(friend.handle.clone());

    lpn.handle.command(NodeCommand::EstablishFriendship { net_key_index: 0 });
    expect_event(&mut lpn.events, "LPN establishment", |ev| {
        matches!(ev, MeshEvent::FriendshipEstablished { net_key_index: 0 })
    })
    .await;

    // The friend disappears: its feature goes dark so polls die unanswered.
    friend.handle.command(NodeCommand::SetFeature {
        feature: NodeFeature::Friend,
        state: FeatureState::Disabled,
    });
    expect_event(&mut friend.events, "friend-side teardown", |ev| {
        matches!(ev, MeshEvent::FriendshipTerminated { net_key_index: 0 })
    })
    .await;

    // Receive-window retries deplete and the LPN gives up.
    expect_event(&mut lpn.events, "LPN retry exhaustion", |ev| {
        matches!(ev, MeshEvent::FriendshipTerminated { net_key_index: 0 })
    })
    .await;
}
