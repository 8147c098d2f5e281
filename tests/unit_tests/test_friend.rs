// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use mesh_node_rs::{
    cfg::enums::FeatureState,
    crypto::stub::StubSecurity,
    friend::FriendRole,
    local_config::store::LocalConfig,
    lower_transport::{TransportEffect, sar_tx::SarTx},
    models::{
        friendship::{
            clear::FriendClearPdu,
            request::{FriendRequestPdu, FriendshipCriteria},
            subscription::FriendSubscrListPdu,
        },
        opcode::CtlOpcode,
    },
    node::{
        events::MeshEvent,
        msg::{MeshMsg, NodeFeature, TimerEvent},
    },
};
use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};

use crate::unit_tests::common::sample_store;

const LPN_ADDR: u16 = 0x0455;
const PREV_FRIEND: u16 = 0x0333;

struct Fixture {
    cfg: LocalConfig,
    friend: FriendRole,
    sar_tx: SarTx,
    msg_rx: UnboundedReceiver<MeshMsg>,
}

fn fixture() -> Fixture {
    let boot = crate::unit_tests::common::sample_config();
    let mut cfg = sample_store();
    cfg.set_feature(NodeFeature::Friend, FeatureState::Enabled)
        .expect("friend feature");
    cfg.keys
        .add_net_key(&StubSecurity, 0, [0x42; 16])
        .expect("net key");
    let (msg_tx, msg_rx) = unbounded_channel();
    Fixture {
        cfg,
        friend: FriendRole::new(&boot, msg_tx.clone()),
        sar_tx: SarTx::new(4, msg_tx),
        msg_rx,
    }
}

fn request(prev: u16, lpn_counter: u16) -> FriendRequestPdu {
    FriendRequestPdu::new(
        FriendshipCriteria {
            rssi_factor: 0,
            recv_win_factor: 0,
            min_queue_size_log: 1,
        },
        0x64,      // 100 ms receive delay
        0x000BB8,  // 5 minutes poll timeout
        prev,
        1,
        lpn_counter,
    )
}

/// Control PDUs (by opcode) among the effects.
fn ctl_sends(effects: &[TransportEffect], opcode: CtlOpcode) -> Vec<Vec<u8>> {
    effects
        .iter()
        .filter_map(|e| match e {
            TransportEffect::SendNetwork { ltr_pdu, .. }
                if ltr_pdu[0] == opcode as u8 =>
            {
                Some(ltr_pdu.clone())
            },
            _ => None,
        })
        .collect()
}

async fn next_timer(msg_rx: &mut UnboundedReceiver<MeshMsg>) -> TimerEvent {
    loop {
        match msg_rx.recv().await {
            Some(MeshMsg::Timer(ev)) => return ev,
            Some(_) => {},
            None => panic!("timer channel closed"),
        }
    }
}

/// Advances the paused clock and lets woken timer tasks run.
async fn advance(d: Duration) {
    tokio::time::advance(d).await;
    tokio::task::yield_now().await;
}

#[tokio::test(start_paused = true)]
async fn offer_delay_follows_the_request_criteria() {
    let mut fx = fixture();
    // Window 50 ms, factors ×1, RSSI −70 dBm:
    // (10 × 50 − 10 × (−70)) / 10 = 120 ms, plus the drift margin.
    fx.friend.on_friend_request(
        &mut fx.cfg,
        &StubSecurity,
        LPN_ADDR,
        0,
        -70,
        &request(0, 7),
    );

    advance(Duration::from_millis(119)).await;
    assert!(fx.msg_rx.try_recv().is_err(), "offer delay still running");
    advance(Duration::from_millis(15)).await;
    match fx.msg_rx.try_recv() {
        Ok(MeshMsg::Timer(TimerEvent::FriendRecvDelay { ctx, generation })) => {
            let mut effects = Vec::new();
            fx.friend.on_recv_delay_timer(
                &mut fx.cfg,
                &mut fx.sar_tx,
                ctx,
                generation,
                &mut effects,
            );
            let offers = ctl_sends(&effects, CtlOpcode::FriendOffer);
            assert_eq!(offers.len(), 1, "exactly one friend offer");
        },
        other => panic!("expected offer delay expiry, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn establishment_clears_previous_friend_with_doubling_retries() {
    let mut fx = fixture();
    fx.friend.on_friend_request(
        &mut fx.cfg,
        &StubSecurity,
        LPN_ADDR,
        0,
        -70,
        &request(PREV_FRIEND, 7),
    );

    // Run the offer delay.
    advance(Duration::from_millis(135)).await;
    let (ctx, generation) = match next_timer(&mut fx.msg_rx).await {
        TimerEvent::FriendRecvDelay { ctx, generation } => (ctx, generation),
        other => panic!("unexpected timer: {other:?}"),
    };
    let mut effects = Vec::new();
    fx.friend
        .on_recv_delay_timer(&mut fx.cfg, &mut fx.sar_tx, ctx, generation, &mut effects);

    // First poll establishes and fires the first clear at t = 0.
    let mut effects = Vec::new();
    let mut events = Vec::new();
    fx.friend.on_friend_poll(
        &mut fx.cfg,
        &mut fx.sar_tx,
        LPN_ADDR,
        0,
        false,
        &mut effects,
        &mut events,
    );
    assert!(events.contains(&MeshEvent::FriendshipEstablished { net_key_index: 0 }));
    let clears = ctl_sends(&effects, CtlOpcode::FriendClear);
    assert_eq!(clears.len(), 1, "clear sent immediately on establishment");
    let clear = FriendClearPdu::from_bytes(&clears[0][1..]).expect("clear pdu");
    assert_eq!(clear.lpn_addr.get(), LPN_ADDR);
    assert_eq!(clear.lpn_counter.get(), 7);

    // Clear retries at 1 s and then 2 s.
    for expected_gap in [1u64, 2] {
        advance(Duration::from_secs(expected_gap)).await;
        let (ctx, generation) = loop {
            match next_timer(&mut fx.msg_rx).await {
                TimerEvent::FriendClearPeriod { ctx, generation } => {
                    break (ctx, generation);
                },
                _ => {},
            }
        };
        let mut effects = Vec::new();
        fx.friend.on_clear_period_timer(
            &mut fx.cfg,
            &mut fx.sar_tx,
            ctx,
            generation,
            &mut effects,
        );
        assert_eq!(
            ctl_sends(&effects, CtlOpcode::FriendClear).len(),
            1,
            "one clear per period"
        );
    }

    // Clear Confirm from the previous friend stops the protocol: the next
    // period expiry sends nothing.
    fx.friend
        .on_clear_confirm(PREV_FRIEND, 0, &FriendClearPdu::new(LPN_ADDR, 7));
    advance(Duration::from_secs(4)).await;
    while let Ok(msg) = fx.msg_rx.try_recv() {
        if let MeshMsg::Timer(TimerEvent::FriendClearPeriod { ctx, generation }) = msg {
            let mut effects = Vec::new();
            fx.friend.on_clear_period_timer(
                &mut fx.cfg,
                &mut fx.sar_tx,
                ctx,
                generation,
                &mut effects,
            );
            assert!(
                ctl_sends(&effects, CtlOpcode::FriendClear).is_empty(),
                "confirmed clear must not retransmit"
            );
        }
    }
}

/// Delivers one poll and runs the receive-delay answer, returning the
/// effects of the delayed transmission.
async fn poll_and_answer(fx: &mut Fixture, fsn: bool) -> Vec<TransportEffect> {
    let mut effects = Vec::new();
    let mut events = Vec::new();
    fx.friend.on_friend_poll(
        &mut fx.cfg,
        &mut fx.sar_tx,
        LPN_ADDR,
        0,
        fsn,
        &mut effects,
        &mut events,
    );
    advance(Duration::from_millis(120)).await;
    let mut answer = Vec::new();
    while let Ok(msg) = fx.msg_rx.try_recv() {
        if let MeshMsg::Timer(TimerEvent::FriendRecvDelay { ctx, generation }) = msg {
            fx.friend.on_recv_delay_timer(
                &mut fx.cfg,
                &mut fx.sar_tx,
                ctx,
                generation,
                &mut answer,
            );
        }
    }
    effects.extend(answer);
    effects
}

#[tokio::test(start_paused = true)]
async fn poll_fsn_handshake_walks_the_queue() {
    let mut fx = fixture();
    fx.friend.on_friend_request(
        &mut fx.cfg,
        &StubSecurity,
        LPN_ADDR,
        0,
        -70,
        &request(0, 7),
    );
    advance(Duration::from_millis(135)).await;
    let (ctx, generation) = match next_timer(&mut fx.msg_rx).await {
        TimerEvent::FriendRecvDelay { ctx, generation } => (ctx, generation),
        other => panic!("unexpected timer: {other:?}"),
    };
    let mut effects = Vec::new();
    fx.friend
        .on_recv_delay_timer(&mut fx.cfg, &mut fx.sar_tx, ctx, generation, &mut effects);

    // Empty queue: the establishing poll is answered with a Friend Update,
    // MD = 0, after the receive delay.
    let effects = poll_and_answer(&mut fx, false).await;
    let updates = ctl_sends(&effects, CtlOpcode::FriendUpdate);
    assert_eq!(updates.len(), 1);
    assert_eq!(*updates[0].last().expect("md byte"), 0);

    // Two data PDUs for the LPN.
    fx.friend
        .enqueue_pdu(0x0002, LPN_ADDR, 0, 0, 0x000100, false, 5, &[0x00, 0xAA, 0xBB]);
    fx.friend
        .enqueue_pdu(0x0002, LPN_ADDR, 0, 0, 0x000101, false, 5, &[0x00, 0xCC, 0xDD]);

    let sent_seq = |effects: &[TransportEffect]| -> Vec<u32> {
        effects
            .iter()
            .filter_map(|e| match e {
                TransportEffect::SendNetwork { info, .. } if info.priority => {
                    Some(info.seq)
                },
                _ => None,
            })
            .collect()
    };

    // Toggled FSN acknowledges the update; the queue head goes out.
    let effects = poll_and_answer(&mut fx, true).await;
    assert_eq!(sent_seq(&effects), vec![0x000100]);

    // Same FSN again: the same entry is retransmitted.
    let effects = poll_and_answer(&mut fx, true).await;
    assert_eq!(sent_seq(&effects), vec![0x000100]);

    // Toggle acknowledges the head; the next entry follows with one hop of
    // TTL spent.
    let effects = poll_and_answer(&mut fx, false).await;
    assert_eq!(sent_seq(&effects), vec![0x000101]);
    for e in &effects {
        if let TransportEffect::SendNetwork { info, .. } = e
            && info.priority
        {
            assert_eq!(info.ttl, 4);
        }
    }
}

#[tokio::test(start_paused = true)]
async fn subscription_list_confirm_is_delayed_and_idempotent() {
    let mut fx = fixture();
    fx.friend.on_friend_request(
        &mut fx.cfg,
        &StubSecurity,
        LPN_ADDR,
        0,
        -70,
        &request(0, 7),
    );
    advance(Duration::from_millis(135)).await;
    let (ctx, generation) = match next_timer(&mut fx.msg_rx).await {
        TimerEvent::FriendRecvDelay { ctx, generation } => (ctx, generation),
        other => panic!("unexpected timer: {other:?}"),
    };
    let mut effects = Vec::new();
    fx.friend
        .on_recv_delay_timer(&mut fx.cfg, &mut fx.sar_tx, ctx, generation, &mut effects);
    let _ = poll_and_answer(&mut fx, false).await;

    let add = FriendSubscrListPdu::new(9, vec![0xC100, 0xC101]);
    fx.friend.on_subscr_list(LPN_ADDR, 0, true, &add);

    // The confirm rides its own receive-delay timer.
    advance(Duration::from_millis(120)).await;
    let mut confirms = Vec::new();
    while let Ok(msg) = fx.msg_rx.try_recv() {
        if let MeshMsg::Timer(TimerEvent::FriendSubscrCnfDelay { ctx, generation }) = msg
        {
            let mut effects = Vec::new();
            fx.friend.on_subscr_cnf_timer(
                &mut fx.cfg,
                &mut fx.sar_tx,
                ctx,
                generation,
                &mut effects,
            );
            confirms.extend(ctl_sends(&effects, CtlOpcode::FriendSubscrListConfirm));
        }
    }
    assert_eq!(confirms.len(), 1);
    assert_eq!(confirms[0][1], 9, "confirm echoes the transaction number");

    // A retransmitted transaction confirms again without reapplying.
    fx.friend.on_subscr_list(LPN_ADDR, 0, true, &add);
    advance(Duration::from_millis(120)).await;
    let mut confirms = Vec::new();
    while let Ok(msg) = fx.msg_rx.try_recv() {
        if let MeshMsg::Timer(TimerEvent::FriendSubscrCnfDelay { ctx, generation }) = msg
        {
            let mut effects = Vec::new();
            fx.friend.on_subscr_cnf_timer(
                &mut fx.cfg,
                &mut fx.sar_tx,
                ctx,
                generation,
                &mut effects,
            );
            confirms.extend(ctl_sends(&effects, CtlOpcode::FriendSubscrListConfirm));
        }
    }
    assert_eq!(confirms.len(), 1);

    // The subscribed group now routes into this LPN's queue.
    fx.friend
        .enqueue_pdu(0x0002, 0xC100, 0, 0, 0x000300, false, 5, &[0x00, 0x11]);
    let effects = poll_and_answer(&mut fx, true).await;
    let delivered: Vec<u32> = effects
        .iter()
        .filter_map(|e| match e {
            TransportEffect::SendNetwork { info, .. }
                if info.priority && info.dst == 0xC100 =>
            {
                Some(info.seq)
            },
            _ => None,
        })
        .collect();
    assert_eq!(delivered, vec![0x000300]);
}

#[tokio::test(start_paused = true)]
async fn invalid_receive_delay_is_rejected() {
    let mut fx = fixture();
    let mut bad = request(0, 7);
    bad.recv_delay_ms = 0x05; // below protocol minimum
    fx.friend
        .on_friend_request(&mut fx.cfg, &StubSecurity, LPN_ADDR, 0, -70, &bad);
    advance(Duration::from_secs(2)).await;
    assert!(fx.msg_rx.try_recv().is_err(), "rejected request arms no timer");
}

#[tokio::test(start_paused = true)]
async fn poll_from_stranger_is_ignored() {
    let mut fx = fixture();
    let mut effects = Vec::new();
    let mut events = Vec::new();
    fx.friend.on_friend_poll(
        &mut fx.cfg,
        &mut fx.sar_tx,
        0x0999,
        0,
        false,
        &mut effects,
        &mut events,
    );
    assert!(effects.is_empty());
    assert!(events.is_empty());
}
