// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Managed flooding across a three-node line: the middle node relays with a
//! TTL decrement, and the network cache keeps retransmissions from looping.

use std::time::Duration;

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

const NODE_A: u16 = 0x0010;
const NODE_R: u16 = 0x0020;
const NODE_B: u16 = 0x0030;
const GROUP: u16 = 0xC123;

#[tokio::test(start_paused = true)]
#[serial]
async fn relay_bridges_disjoint_neighbors_exactly_once() {
    let cfg = sample_config();
    let mut relay_cfg = cfg.clone();
    relay_cfg.features.relay = FeatureState::Enabled;

    let mut a = boot_node(cfg.clone(), NODE_A, [0xA1; 16]);
    let mut r = boot_node(relay_cfg, NODE_R, [0xB2; 16]);
    let mut b = boot_node(cfg, NODE_B, [0xC3; 16]);

    // Line topology: A ↔ R ↔ B, no direct A ↔ B link.
    a.bearer.link(r.handle.clone());
    r.bearer.link(a.handle.clone());
    r.bearer.link(b.handle.clone());
    b.bearer.link(r.handle.clone());

    for node in [&a, &r, &b] {
        node.handle.command(NodeCommand::AddAppKey {
            app_key_index: 0,
            net_key_index: 0,
            key: [0x77; 16],
        });
    }
    r.handle.command(NodeCommand::SetFeature {
        feature: NodeFeature::Relay,
        state: FeatureState::Enabled,
    });
    b.handle.command(NodeCommand::SubscribeAdd {
        element_index: 0,
        model_pos: 0,
        addr: GROUP,
    });

    a.handle.command(NodeCommand::SendAccess(AccessSendReq {
        element_index: 0,
        dst: GROUP,
        label_uuid: None,
        app_key_index: Some(0),
        net_key_index: 0,
        ttl: Some(3),
        szmic64: false,
        ack_required: false,
        payload: Bytes::from_static(b"\x82\x03\x7f"),
    }));

    // B only hears A through R's relayed copy.
    let ev = expect_event(&mut b.events, "relayed group delivery", |ev| {
        matches!(ev, MeshEvent::AccessRx { .. })
    })
    .await;
    match ev {
        MeshEvent::AccessRx { src, dst, payload, .. } => {
            assert_eq!(src, NODE_A);
            assert_eq!(dst, GROUP);
            assert_eq!(payload.as_ref(), b"\x82\x03\x7f");
        },
        other => panic!("unexpected event: {other:?}"),
    }

    // Retransmissions and cache echoes never produce a second delivery.
    tokio::time::sleep(Duration::from_secs(5)).await;
    loop {
        match b.events.try_recv() {
            Ok(MeshEvent::AccessRx { .. }) => panic!("duplicate delivery at B"),
            Ok(_) => {},
            Err(_) => break,
        }
    }

    // R itself is not subscribed: the group PDU must not surface there.
    loop {
        match r.events.try_recv() {
            Ok(MeshEvent::AccessRx { .. }) => panic!("unexpected delivery at R"),
            Ok(_) => {},
            Err(_) => break,
        }
    }
}

#[tokio::test(start_paused = true)]
#[serial]
async fn ttl_one_reaches_direct_neighbors_but_never_relays() {
    let cfg = sample_config();
    let mut relay_cfg = cfg.clone();
    relay_cfg.features.relay = FeatureState::Enabled;

    let mut a = boot_node(cfg.clone(), NODE_A, [0xA1; 16]);
    let mut r = boot_node(relay_cfg, NODE_R, [0xB2; 16]);
    let mut b = boot_node(cfg, NODE_B, [0xC3; 16]);

    a.bearer.link(r.handle.clone());
    r.bearer.link(a.handle.clone());
    r.bearer.link(b.handle.clone());
    b.bearer.link(r.handle.clone());

    for node in [&a, &r, &b] {
        node.handle.command(NodeCommand::AddAppKey {
            app_key_index: 0,
            net_key_index: 0,
            key: [0x77; 16],
        });
    }
    r.handle.command(NodeCommand::SetFeature {
        feature: NodeFeature::Relay,
        state: FeatureState::Enabled,
    });
    for node in [&r, &b] {
        node.handle.command(NodeCommand::SubscribeAdd {
            element_index: 0,
            model_pos: 0,
            addr: GROUP,
        });
    }

    // A single-hop message: legal at origin, consumed by neighbors, dead to
    // the relay.
    a.handle.command(NodeCommand::SendAccess(AccessSendReq {
        element_index: 0,
        dst: GROUP,
        label_uuid: None,
        app_key_index: Some(0),
        net_key_index: 0,
        ttl: Some(1),
        szmic64: false,
        ack_required: false,
        payload: Bytes::from_static(b"\x82\x05\x01"),
    }));

    let ev = expect_event(&mut r.events, "one-hop group delivery", |ev| {
        matches!(ev, MeshEvent::AccessRx { .. })
    })
    .await;
    match ev {
        MeshEvent::AccessRx { src, dst, payload, .. } => {
            assert_eq!(src, NODE_A);
            assert_eq!(dst, GROUP);
            assert_eq!(payload.as_ref(), b"\x82\x05\x01");
        },
        other => panic!("unexpected event: {other:?}"),
    }

    // R heard it but must not relay it on: B stays silent.
    tokio::time::sleep(Duration::from_secs(5)).await;
    loop {
        match b.events.try_recv() {
            Ok(MeshEvent::AccessRx { .. }) => {
                panic!("TTL 1 PDU crossed a second hop")
            },
            Ok(_) => {},
            Err(_) => break,
        }
    }
}

#[tokio::test(start_paused = true)]
#[serial]
async fn relay_disabled_keeps_segments_local() {
    let cfg = sample_config();

    let mut a = boot_node(cfg.clone(), NODE_A, [0xA1; 16]);
    let r = boot_node(cfg.clone(), NODE_R, [0xB2; 16]); // relay off
    let mut b = boot_node(cfg, NODE_B, [0xC3; 16]);

    a.bearer.link(r.handle.clone());
    r.bearer.link(a.handle.clone());
    r.bearer.link(b.handle.clone());
    b.bearer.link(r.handle.clone());

    for node in [&a, &b] {
        node.handle.command(NodeCommand::AddAppKey {
            app_key_index: 0,
            net_key_index: 0,
            key: [0x77; 16],
        });
    }
    b.handle.command(NodeCommand::SubscribeAdd {
        element_index: 0,
        model_pos: 0,
        addr: GROUP,
    });

    a.handle.command(NodeCommand::SendAccess(AccessSendReq {
        element_index: 0,
        dst: GROUP,
        label_uuid: None,
        app_key_index: Some(0),
        net_key_index: 0,
        ttl: Some(3),
        szmic64: false,
        ack_required: false,
        payload: Bytes::from_static(b"\x82\x03\x7f"),
    }));

    tokio::time::sleep(Duration::from_secs(5)).await;
    loop {
        match b.events.try_recv() {
            Ok(MeshEvent::AccessRx { .. }) => {
                panic!("delivery without a relay in between")
            },
            Ok(_) => {},
            Err(_) => break,
        }
    }
}
