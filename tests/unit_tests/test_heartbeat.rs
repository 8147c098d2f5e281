// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use mesh_node_rs::{
    cfg::enums::FeatureState,
    models::heartbeat::FeaturesBitmap,
    node::msg::{HeartbeatPubState, MeshMsg, NodeFeature, TimerEvent},
    upper_transport::heartbeat::Heartbeat,
};
use tokio::{
    sync::mpsc::unbounded_channel,
    time::Instant,
};

use crate::unit_tests::common::sample_store;

/// Advances the paused clock and lets woken timer tasks run.
async fn advance(d: Duration) {
    tokio::time::advance(d).await;
    tokio::task::yield_now().await;
}

/// Emission instants form an arithmetic progression with period
/// `2^(periodLog-1)` seconds while publication stays enabled.
#[tokio::test(start_paused = true)]
async fn publication_period_law() {
    let mut cfg = sample_store();
    let (tx, mut rx) = unbounded_channel();
    let mut hb = Heartbeat::new(tx);

    cfg.set_heartbeat_pub(HeartbeatPubState {
        dst: 0xC000,
        count_log: 3,  // four messages
        period_log: 3, // four seconds
        ttl: 7,
        features: 0,
        net_key_index: 0,
    });
    hb.on_pub_state_changed(&cfg);

    let start = Instant::now();
    let mut emissions = Vec::new();
    while emissions.len() < 4 {
        advance(Duration::from_millis(500)).await;
        while let Ok(msg) = rx.try_recv() {
            if matches!(msg, MeshMsg::Timer(TimerEvent::HbPublication)) {
                let out = hb.on_pub_timer(&cfg).expect("publication enabled");
                assert_eq!(out.dst, 0xC000);
                assert_eq!(out.pdu.init_ttl, 7);
                emissions.push(Instant::now().duration_since(start));
            }
        }
    }

    for (i, t) in emissions.iter().enumerate() {
        let expected = Duration::from_secs(4 * (i as u64 + 1));
        assert_eq!(*t, expected, "emission {i} off the 4 s grid");
    }

    // The run is over: no further timers fire.
    advance(Duration::from_secs(20)).await;
    assert!(rx.try_recv().is_err(), "count-limited run must stop");
}

#[tokio::test(start_paused = true)]
async fn feature_change_publishes_out_of_cycle() {
    let mut cfg = sample_store();
    let (tx, mut rx) = unbounded_channel();
    let mut hb = Heartbeat::new(tx);

    cfg.set_heartbeat_pub(HeartbeatPubState {
        dst: 0xC000,
        count_log: 0xFF,
        period_log: 5, // sixteen seconds
        ttl: 7,
        features: FeaturesBitmap::RELAY.bits(),
        net_key_index: 0,
    });
    hb.on_pub_state_changed(&cfg);

    // Relay flips before the first period tick.
    cfg.set_feature(NodeFeature::Relay, FeatureState::Enabled)
        .expect("relay enable");
    let out = hb
        .on_feature_changed(&cfg, FeaturesBitmap::RELAY)
        .expect("feature heartbeat");
    assert!(out.pdu.features.contains(FeaturesBitmap::RELAY));

    // The periodic schedule is unaffected: the first tick still lands on
    // the 16 s boundary.
    advance(Duration::from_secs(15)).await;
    assert!(rx.try_recv().is_err());
    advance(Duration::from_secs(2)).await;
    assert!(matches!(
        rx.try_recv(),
        Ok(MeshMsg::Timer(TimerEvent::HbPublication))
    ));
}
