// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Heartbeat publication and subscription between two linked nodes.

use mesh_node_rs::{
    cfg::enums::FeatureState,
    models::heartbeat::FeaturesBitmap,
    node::{
        events::MeshEvent,
        msg::{HeartbeatPubState, HeartbeatSubState, NodeCommand, NodeFeature},
    },
};

use serial_test::serial;

use crate::integration_tests::common::{boot_node, expect_event, sample_config};

const PUBLISHER: u16 = 0x0010;
const SUBSCRIBER: u16 = 0x0030;

#[tokio::test(start_paused = true)]
#[serial]
async fn periodic_heartbeats_reach_the_subscriber() {
    let cfg = sample_config();
    let mut publisher = boot_node(cfg.clone(), PUBLISHER, [0xA1; 16]);
    let mut subscriber = boot_node(cfg, SUBSCRIBER, [0xC3; 16]);
    publisher.bearer.link(subscriber.handle.clone());
    subscriber.bearer.link(publisher.handle.clone());

    subscriber.handle.command(NodeCommand::SetHeartbeatSub(HeartbeatSubState {
        src: PUBLISHER,
        dst: SUBSCRIBER,
        period_log: 7, // 64 s window
    }));
    publisher.handle.command(NodeCommand::SetHeartbeatPub(HeartbeatPubState {
        dst: SUBSCRIBER,
        count_log: 2,  // two messages
        period_log: 2, // two seconds apart
        ttl: 5,
        features: 0,
        net_key_index: 0,
    }));

    for n in 0..2 {
        let ev = expect_event(&mut subscriber.events, "heartbeat info", |ev| {
            matches!(ev, MeshEvent::HeartbeatInfo { .. })
        })
        .await;
        match ev {
            MeshEvent::HeartbeatInfo { src, hops, min_hops, max_hops, .. } => {
                assert_eq!(src, PUBLISHER);
                // One direct hop: InitTTL == received TTL.
                assert_eq!(hops, 1, "heartbeat {n} took more than one hop");
                assert_eq!((min_hops, max_hops), (1, 1));
            },
            other => panic!("unexpected event: {other:?}"),
        }
    }
}

#[tokio::test(start_paused = true)]
#[serial]
async fn feature_flip_publishes_out_of_cycle() {
    let cfg = sample_config();
    let mut publisher = boot_node(cfg.clone(), PUBLISHER, [0xA1; 16]);
    let mut subscriber = boot_node(cfg, SUBSCRIBER, [0xC3; 16]);
    publisher.bearer.link(subscriber.handle.clone());
    subscriber.bearer.link(publisher.handle.clone());

    subscriber.handle.command(NodeCommand::SetHeartbeatSub(HeartbeatSubState {
        src: PUBLISHER,
        dst: SUBSCRIBER,
        period_log: 7,
    }));
    // Periodic publication disabled (countLog 0), feature triggers armed.
    publisher.handle.command(NodeCommand::SetHeartbeatPub(HeartbeatPubState {
        dst: SUBSCRIBER,
        count_log: 0,
        period_log: 0,
        ttl: 5,
        features: FeaturesBitmap::RELAY.bits(),
        net_key_index: 0,
    }));

    publisher.handle.command(NodeCommand::SetFeature {
        feature: NodeFeature::Relay,
        state: FeatureState::Enabled,
    });

    let ev = expect_event(&mut subscriber.events, "feature heartbeat", |ev| {
        matches!(ev, MeshEvent::HeartbeatInfo { .. })
    })
    .await;
    match ev {
        MeshEvent::HeartbeatInfo { features, .. } => {
            assert!(features.contains(FeaturesBitmap::RELAY));
        },
        other => panic!("unexpected event: {other:?}"),
    }
}
