// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Low Power Node role: friend discovery, poll cadence inside receive
//! delay/window budgets, subscription list sync and key/IV absorption.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use crate::{
    cfg::config::Config,
    crypto::{MeshSecurity, k2_p_friendship},
    local_config::{keys::FriendshipCred, store::LocalConfig, store::SubscriptionChange},
    lower_transport::TransportEffect,
    models::{
        common::{MESH_ADDR_GROUP_FRIEND, MESH_ADDR_UNASSIGNED, MeshAddress},
        friendship::{
            SUBSCR_LIST_MAX_ADDR,
            clear::FriendClearPdu,
            offer::FriendOfferPdu,
            poll::FriendPollPdu,
            request::{FriendRequestPdu, FriendshipCriteria},
            subscription::{FriendSubscrCnfPdu, FriendSubscrListPdu},
            update::{FriendUpdatePdu, UpdateFlags},
        },
    },
    node::{
        events::MeshEvent,
        msg::{MeshMsg, TimerEvent},
        timer::{self, TimerHandle},
    },
    state_machine::common::Transition,
    upper_transport::{self},
};

/// Friendship control traffic travels one hop.
const FRIENDSHIP_TTL: u8 = 0;
/// Receive delay before the Friend Offer window opens.
const OFFER_DELAY: Duration = Duration::from_millis(100);
/// Length of the Friend Offer window.
const OFFER_WINDOW: Duration = Duration::from_secs(1);
/// Poll/request/subscription retransmissions before giving up.
const LPN_TX_NUM_RETRIES: u8 = 3;

/// LPN-side friendship states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LpnSmState {
    #[default]
    Idle,
    WaitFriendOffer,
    /// First poll sent, awaiting the establishing Friend Update.
    WaitFriendUpdate,
    Established,
    /// Poll sent, receive window pending or open.
    WaitFriendMessage,
    WaitFriendSubscrCnf,
}

/// Radio cadence inside a state: delay (radio off), window (radio on) or
/// sleep between polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum CadencePhase {
    #[default]
    Sleep,
    Delay,
    Window,
}

/// Subnet security fields absorbed from a Friend Update; the handler feeds
/// them to network management.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubnetAbsorb {
    pub net_key_index: u16,
    pub iv_index: u32,
    pub iv_update: bool,
    pub key_refresh: bool,
}

struct LpnCtx {
    in_use: bool,
    generation: u64,
    state: LpnSmState,
    phase: CadencePhase,
    net_key_index: u16,
    friend_addr: MeshAddress,
    lpn_counter: u16,
    recv_win_ms: u8,
    fsn: bool,
    tx_retries_left: u8,
    establish_retries_left: u8,
    trans_num: u8,
    subscr_pending: VecDeque<(MeshAddress, bool)>,
    inflight_subscr: Option<(bool, Vec<MeshAddress>)>,
    cadence_tmr: TimerHandle,
    poll_timeout_tmr: TimerHandle,
}

impl LpnCtx {
    fn empty() -> Self {
        Self {
            in_use: false,
            generation: 0,
            state: LpnSmState::Idle,
            phase: CadencePhase::Sleep,
            net_key_index: 0,
            friend_addr: MESH_ADDR_UNASSIGNED,
            lpn_counter: 0,
            recv_win_ms: 0,
            fsn: false,
            tx_retries_left: 0,
            establish_retries_left: 0,
            trans_num: 0,
            subscr_pending: VecDeque::new(),
            inflight_subscr: None,
            cadence_tmr: TimerHandle::idle(),
            poll_timeout_tmr: TimerHandle::idle(),
        }
    }

    fn stop_timers(&mut self) {
        self.cadence_tmr.stop();
        self.poll_timeout_tmr.stop();
    }
}

pub struct LpnRole {
    contexts: Vec<LpnCtx>,
    /// Previous friend per subnet, advertised in the next Friend Request.
    history: Vec<(u16, MeshAddress)>,
    lpn_counter: u16,
    criteria: FriendshipCriteria,
    recv_delay_ms: u8,
    poll_timeout_steps: u32,
    sleep_duration: Duration,
    establish_retry_count: u8,
    msg_tx: UnboundedSender<MeshMsg>,
}

impl LpnRole {
    pub fn new(cfg: &Config, msg_tx: UnboundedSender<MeshMsg>) -> Self {
        Self {
            contexts: (0..cfg.sizes.max_num_friendships)
                .map(|_| LpnCtx::empty())
                .collect(),
            history: Vec::new(),
            lpn_counter: crate::utils::random_counter(),
            criteria: FriendshipCriteria {
                rssi_factor: cfg.friendship.rssi_factor,
                recv_win_factor: cfg.friendship.recv_win_factor,
                min_queue_size_log: cfg.friendship.min_queue_size_log,
            },
            recv_delay_ms: cfg.friendship.recv_delay_ms,
            poll_timeout_steps: cfg.friendship.poll_timeout,
            sleep_duration: Duration::from_millis(cfg.friendship.sleep_duration_ms),
            establish_retry_count: cfg.friendship.establish_retry_count,
            msg_tx,
        }
    }

    fn ctx_by_subnet(&self, net_key_index: u16) -> Option<usize> {
        self.contexts
            .iter()
            .position(|c| c.in_use && c.net_key_index == net_key_index)
    }

    fn history_lookup(&self, net_key_index: u16) -> MeshAddress {
        self.history
            .iter()
            .find(|(nki, _)| *nki == net_key_index)
            .map(|(_, addr)| *addr)
            .unwrap_or(MESH_ADDR_UNASSIGNED)
    }

    fn history_store(&mut self, net_key_index: u16, addr: MeshAddress) {
        self.history.retain(|(nki, _)| *nki != net_key_index);
        self.history.push((net_key_index, addr));
    }

    /// Radio gate: non-friendship reception is suppressed while every
    /// active context sleeps or sits in a receive delay.
    pub fn rx_suppressed(&self) -> bool {
        let mut any = false;
        for ctx in self.contexts.iter().filter(|c| c.in_use) {
            any = true;
            if ctx.phase == CadencePhase::Window {
                return false;
            }
        }
        any
    }

    /// Starts (or restarts) friendship establishment on a subnet.
    pub fn establish(
        &mut self,
        cfg: &mut LocalConfig,
        sar_tx: &mut crate::lower_transport::sar_tx::SarTx,
        net_key_index: u16,
        effects: &mut Vec<TransportEffect>,
    ) -> bool {
        if !cfg
            .feature(crate::node::msg::NodeFeature::LowPower)
            .is_enabled()
        {
            warn!("low power feature disabled, cannot establish friendship");
            return false;
        }
        if cfg.keys.net_key(net_key_index).is_err() {
            warn!(net_key_index, "unknown subnet, cannot establish friendship");
            return false;
        }
        if self.ctx_by_subnet(net_key_index).is_some() {
            debug!(net_key_index, "friendship already active on subnet");
            return false;
        }
        let Some(idx) = self.contexts.iter().position(|c| !c.in_use) else {
            warn!("no LPN context available");
            return false;
        };

        let retries = self.establish_retry_count;
        {
            let generation = self.contexts[idx].generation + 1;
            let ctx = &mut self.contexts[idx];
            *ctx = LpnCtx::empty();
            ctx.in_use = true;
            ctx.generation = generation;
            ctx.net_key_index = net_key_index;
            ctx.establish_retries_left = retries;
            Transition::Next(LpnSmState::WaitFriendOffer).apply(&mut ctx.state);
        }
        self.send_friend_request(cfg, sar_tx, idx, effects);
        true
    }

    fn send_friend_request(
        &mut self,
        cfg: &mut LocalConfig,
        sar_tx: &mut crate::lower_transport::sar_tx::SarTx,
        idx: usize,
        effects: &mut Vec<TransportEffect>,
    ) {
        self.lpn_counter = self.lpn_counter.wrapping_add(1);
        let lpn_counter = self.lpn_counter;
        let criteria = self.criteria;
        let recv_delay_ms = self.recv_delay_ms;
        let poll_timeout = self.poll_timeout_steps;
        let prev = self.history_lookup(self.contexts[idx].net_key_index);
        let element_count = cfg.element_count();

        let ctx = &mut self.contexts[idx];
        ctx.lpn_counter = lpn_counter;
        let net_key_index = ctx.net_key_index;

        let req = FriendRequestPdu::new(
            criteria,
            recv_delay_ms,
            poll_timeout,
            prev,
            element_count,
            lpn_counter,
        );
        if let Err(e) = upper_transport::send_control_pdu(
            cfg,
            sar_tx,
            &req,
            MESH_ADDR_GROUP_FRIEND,
            net_key_index,
            FRIENDSHIP_TTL,
            None,
            false,
            effects,
        ) {
            warn!("failed to send friend request: {e:#}");
        }
        self.cadence_at(idx, CadencePhase::Delay, OFFER_DELAY);
        debug!(net_key_index, lpn_counter, "friend request sent");
    }

    fn cadence_at(&mut self, idx: usize, phase: CadencePhase, after: Duration) {
        let msg_tx = self.msg_tx.clone();
        let ctx = &mut self.contexts[idx];
        ctx.phase = phase;
        timer::restart(
            &mut ctx.cadence_tmr,
            &msg_tx,
            after,
            TimerEvent::LpnCadence { ctx: idx, generation: ctx.generation },
        );
    }

    fn send_poll(
        &mut self,
        cfg: &mut LocalConfig,
        sar_tx: &mut crate::lower_transport::sar_tx::SarTx,
        idx: usize,
        effects: &mut Vec<TransportEffect>,
    ) {
        let ctx = &self.contexts[idx];
        let poll = FriendPollPdu { fsn: ctx.fsn };
        let (dst, net_key_index) = (ctx.friend_addr, ctx.net_key_index);
        if let Err(e) = upper_transport::send_control_pdu(
            cfg,
            sar_tx,
            &poll,
            dst,
            net_key_index,
            FRIENDSHIP_TTL,
            Some(dst),
            true,
            effects,
        ) {
            warn!(dst, "failed to send friend poll: {e:#}");
        }
        let recv_delay = Duration::from_millis(u64::from(self.recv_delay_ms));
        self.cadence_at(idx, CadencePhase::Delay, recv_delay);
    }

    /// Friend Offer during discovery. First acceptable offer wins.
    #[allow(clippy::too_many_arguments)]
    pub fn on_friend_offer(
        &mut self,
        cfg: &mut LocalConfig,
        crypto: &dyn MeshSecurity,
        sar_tx: &mut crate::lower_transport::sar_tx::SarTx,
        src: MeshAddress,
        net_key_index: u16,
        offer: &FriendOfferPdu,
        effects: &mut Vec<TransportEffect>,
        events: &mut Vec<MeshEvent>,
    ) {
        let Some(idx) = self.ctx_by_subnet(net_key_index) else {
            return;
        };
        if self.contexts[idx].state != LpnSmState::WaitFriendOffer {
            return;
        }
        let min_queue = self.criteria.min_queue_size();
        if u16::from(offer.queue_size) < min_queue {
            debug!(src, offered = offer.queue_size, "offer queue too small, ignored");
            return;
        }

        let lpn_counter = self.contexts[idx].lpn_counter;
        let p = k2_p_friendship(
            cfg.primary_addr(),
            src,
            lpn_counter,
            offer.friend_counter.get(),
        );
        let (material, new_material) = match cfg.keys.net_key(net_key_index) {
            Ok(entry) => {
                let material = match crypto.k2(&entry.key, &p) {
                    Ok(m) => m,
                    Err(e) => {
                        warn!("friendship key derivation failed: {e:#}");
                        self.terminate(cfg, sar_tx, idx, false, effects, events);
                        return;
                    },
                };
                let new_material = entry
                    .new_key
                    .as_ref()
                    .and_then(|new_key| crypto.k2(new_key, &p).ok());
                (material, new_material)
            },
            Err(_) => return,
        };
        if cfg
            .keys
            .add_friendship_cred(
                net_key_index,
                FriendshipCred { peer_addr: src, material, new_material },
            )
            .is_err()
        {
            return;
        }

        let ctx = &mut self.contexts[idx];
        ctx.cadence_tmr.stop();
        ctx.friend_addr = src;
        ctx.recv_win_ms = offer.recv_win_ms;
        ctx.fsn = false;
        ctx.tx_retries_left = LPN_TX_NUM_RETRIES;
        Transition::Next(LpnSmState::WaitFriendUpdate).apply(&mut ctx.state);
        info!(friend = src, net_key_index, "friend offer accepted");
        self.send_poll(cfg, sar_tx, idx, effects);
    }

    /// Friend Update inside a receive window.
    #[allow(clippy::too_many_arguments)]
    pub fn on_friend_update(
        &mut self,
        cfg: &mut LocalConfig,
        sar_tx: &mut crate::lower_transport::sar_tx::SarTx,
        src: MeshAddress,
        net_key_index: u16,
        update: &FriendUpdatePdu,
        effects: &mut Vec<TransportEffect>,
        events: &mut Vec<MeshEvent>,
    ) -> Option<SubnetAbsorb> {
        let msg_tx = self.msg_tx.clone();
        let Some(idx) = self.ctx_by_subnet(net_key_index) else {
            return None;
        };
        {
            let ctx = &self.contexts[idx];
            if ctx.friend_addr != src
                || !matches!(
                    ctx.state,
                    LpnSmState::WaitFriendUpdate | LpnSmState::WaitFriendMessage
                )
            {
                return None;
            }
        }

        let ctx = &mut self.contexts[idx];
        ctx.cadence_tmr.stop();
        let first = ctx.state == LpnSmState::WaitFriendUpdate;
        if first {
            info!(friend = src, net_key_index, "friendship established");
            events.push(MeshEvent::FriendshipEstablished { net_key_index });
            self.history_store(net_key_index, src);
        }

        let ctx = &mut self.contexts[idx];
        ctx.fsn = !ctx.fsn;
        ctx.tx_retries_left = LPN_TX_NUM_RETRIES;
        timer::restart(
            &mut ctx.poll_timeout_tmr,
            &msg_tx,
            Duration::from_millis(
                u64::from(self.poll_timeout_steps)
                    * crate::models::friendship::POLL_TIMEOUT_STEP_MS,
            ),
            TimerEvent::LpnPollTimeout { ctx: idx, generation: ctx.generation },
        );

        let absorb = SubnetAbsorb {
            net_key_index,
            iv_index: update.iv_index.get(),
            iv_update: update.update_flags().contains(UpdateFlags::IV_UPDATE),
            key_refresh: update.update_flags().contains(UpdateFlags::KEY_REFRESH),
        };

        if update.more_data() {
            // The friend holds more; poll straight through.
            Transition::Next(LpnSmState::WaitFriendMessage)
                .apply(&mut self.contexts[idx].state);
            self.send_poll(cfg, sar_tx, idx, effects);
        } else {
            self.close_burst(cfg, sar_tx, idx, effects);
        }
        Some(absorb)
    }

    /// Any other friendship-credential PDU that landed inside the window.
    pub fn on_friend_message(
        &mut self,
        cfg: &mut LocalConfig,
        sar_tx: &mut crate::lower_transport::sar_tx::SarTx,
        net_key_index: u16,
        effects: &mut Vec<TransportEffect>,
    ) {
        let msg_tx = self.msg_tx.clone();
        let Some(idx) = self.ctx_by_subnet(net_key_index) else {
            return;
        };
        let ctx = &mut self.contexts[idx];
        if ctx.state != LpnSmState::WaitFriendMessage {
            return;
        }
        ctx.cadence_tmr.stop();
        ctx.fsn = !ctx.fsn;
        ctx.tx_retries_left = LPN_TX_NUM_RETRIES;
        timer::restart(
            &mut ctx.poll_timeout_tmr,
            &msg_tx,
            Duration::from_millis(
                u64::from(self.poll_timeout_steps)
                    * crate::models::friendship::POLL_TIMEOUT_STEP_MS,
            ),
            TimerEvent::LpnPollTimeout { ctx: idx, generation: ctx.generation },
        );
        self.close_burst(cfg, sar_tx, idx, effects);
    }

    /// Ends a receive burst: flush subscription work or go to sleep.
    fn close_burst(
        &mut self,
        cfg: &mut LocalConfig,
        sar_tx: &mut crate::lower_transport::sar_tx::SarTx,
        idx: usize,
        effects: &mut Vec<TransportEffect>,
    ) {
        if self.contexts[idx].inflight_subscr.is_some()
            || !self.contexts[idx].subscr_pending.is_empty()
        {
            self.send_subscr_batch(cfg, sar_tx, idx, effects);
            return;
        }
        let sleep = self.sleep_duration;
        Transition::Next(LpnSmState::Established).apply(&mut self.contexts[idx].state);
        self.cadence_at(idx, CadencePhase::Sleep, sleep);
    }

    /// Sends (or resends) the current subscription batch, up to five
    /// same-kind addresses.
    fn send_subscr_batch(
        &mut self,
        cfg: &mut LocalConfig,
        sar_tx: &mut crate::lower_transport::sar_tx::SarTx,
        idx: usize,
        effects: &mut Vec<TransportEffect>,
    ) {
        let ctx = &mut self.contexts[idx];
        if ctx.inflight_subscr.is_none() {
            let Some(&(_, first_add)) = ctx.subscr_pending.front() else {
                return;
            };
            let mut addrs = Vec::with_capacity(SUBSCR_LIST_MAX_ADDR);
            while addrs.len() < SUBSCR_LIST_MAX_ADDR {
                match ctx.subscr_pending.front() {
                    Some(&(addr, add)) if add == first_add => {
                        addrs.push(addr);
                        ctx.subscr_pending.pop_front();
                    },
                    _ => break,
                }
            }
            ctx.inflight_subscr = Some((first_add, addrs));
        }

        let Some((add, addrs)) = ctx.inflight_subscr.clone() else {
            return;
        };
        let pdu = FriendSubscrListPdu::new(ctx.trans_num, addrs);
        let (dst, net_key_index) = (ctx.friend_addr, ctx.net_key_index);
        Transition::Next(LpnSmState::WaitFriendSubscrCnf).apply(&mut ctx.state);

        let result = if add {
            upper_transport::send_control_pdu(
                cfg,
                sar_tx,
                &pdu,
                dst,
                net_key_index,
                FRIENDSHIP_TTL,
                Some(dst),
                true,
                effects,
            )
        } else {
            upper_transport::send_control_pdu(
                cfg,
                sar_tx,
                &crate::models::control::SubscrListRemove(pdu),
                dst,
                net_key_index,
                FRIENDSHIP_TTL,
                Some(dst),
                true,
                effects,
            )
        };
        if let Err(e) = result {
            warn!(dst, "failed to send subscription list update: {e:#}");
        }
        let recv_delay = Duration::from_millis(u64::from(self.recv_delay_ms));
        self.cadence_at(idx, CadencePhase::Delay, recv_delay);
    }

    /// Subscription List Confirm.
    pub fn on_subscr_cnf(
        &mut self,
        cfg: &mut LocalConfig,
        sar_tx: &mut crate::lower_transport::sar_tx::SarTx,
        src: MeshAddress,
        net_key_index: u16,
        cnf: &FriendSubscrCnfPdu,
        effects: &mut Vec<TransportEffect>,
    ) {
        let Some(idx) = self.ctx_by_subnet(net_key_index) else {
            return;
        };
        {
            let ctx = &mut self.contexts[idx];
            if ctx.state != LpnSmState::WaitFriendSubscrCnf
                || ctx.friend_addr != src
                || cnf.trans_num != ctx.trans_num
            {
                return;
            }
            ctx.cadence_tmr.stop();
            ctx.inflight_subscr = None;
            ctx.trans_num = ctx.trans_num.wrapping_add(1);
            ctx.tx_retries_left = LPN_TX_NUM_RETRIES;
        }
        if !self.contexts[idx].subscr_pending.is_empty() {
            self.send_subscr_batch(cfg, sar_tx, idx, effects);
        } else {
            let sleep = self.sleep_duration;
            Transition::Next(LpnSmState::Established)
                .apply(&mut self.contexts[idx].state);
            self.cadence_at(idx, CadencePhase::Sleep, sleep);
        }
    }

    /// Cadence timer drives the radio schedule.
    pub fn on_cadence_timer(
        &mut self,
        cfg: &mut LocalConfig,
        sar_tx: &mut crate::lower_transport::sar_tx::SarTx,
        idx: usize,
        generation: u64,
        effects: &mut Vec<TransportEffect>,
        events: &mut Vec<MeshEvent>,
    ) {
        let Some(ctx) = self.contexts.get(idx) else {
            return;
        };
        if !ctx.in_use || ctx.generation != generation {
            return;
        }
        match (ctx.state, ctx.phase) {
            (LpnSmState::WaitFriendOffer, CadencePhase::Delay) => {
                self.cadence_at(idx, CadencePhase::Window, OFFER_WINDOW);
            },
            (LpnSmState::WaitFriendOffer, CadencePhase::Window) => {
                if self.contexts[idx].establish_retries_left > 0 {
                    self.contexts[idx].establish_retries_left -= 1;
                    self.send_friend_request(cfg, sar_tx, idx, effects);
                } else {
                    debug!("no acceptable friend offer, giving up");
                    self.terminate(cfg, sar_tx, idx, false, effects, events);
                }
            },
            (_, CadencePhase::Delay) => {
                let win =
                    Duration::from_millis(u64::from(self.contexts[idx].recv_win_ms));
                self.cadence_at(idx, CadencePhase::Window, win);
            },
            (LpnSmState::WaitFriendUpdate, CadencePhase::Window)
            | (LpnSmState::WaitFriendMessage, CadencePhase::Window) => {
                if self.contexts[idx].tx_retries_left > 0 {
                    self.contexts[idx].tx_retries_left -= 1;
                    self.send_poll(cfg, sar_tx, idx, effects);
                } else {
                    warn!("receive window retries exhausted, friendship lost");
                    self.terminate(cfg, sar_tx, idx, true, effects, events);
                }
            },
            (LpnSmState::WaitFriendSubscrCnf, CadencePhase::Window) => {
                if self.contexts[idx].tx_retries_left > 0 {
                    self.contexts[idx].tx_retries_left -= 1;
                    self.send_subscr_batch(cfg, sar_tx, idx, effects);
                } else {
                    warn!("subscription confirm retries exhausted, friendship lost");
                    self.terminate(cfg, sar_tx, idx, true, effects, events);
                }
            },
            (LpnSmState::Established, CadencePhase::Sleep) => {
                Transition::Next(LpnSmState::WaitFriendMessage)
                    .apply(&mut self.contexts[idx].state);
                self.send_poll(cfg, sar_tx, idx, effects);
            },
            (state, phase) => {
                debug!(?state, ?phase, "spurious LPN cadence tick ignored");
            },
        }
    }

    /// Poll Timeout supervision fired: the friend stopped answering.
    pub fn on_poll_timeout_timer(
        &mut self,
        cfg: &mut LocalConfig,
        sar_tx: &mut crate::lower_transport::sar_tx::SarTx,
        idx: usize,
        generation: u64,
        effects: &mut Vec<TransportEffect>,
        events: &mut Vec<MeshEvent>,
    ) {
        let Some(ctx) = self.contexts.get(idx) else {
            return;
        };
        if !ctx.in_use || ctx.generation != generation {
            return;
        }
        warn!(friend = ctx.friend_addr, "poll timeout, friendship lost");
        self.terminate(cfg, sar_tx, idx, true, effects, events);
    }

    /// Local configuration observed a subscription change; sync it to every
    /// established friend.
    pub fn on_subscription_change(&mut self, change: SubscriptionChange) {
        let (addr, add) = match change {
            SubscriptionChange::Added(a) => (a, true),
            SubscriptionChange::Removed(a) => (a, false),
        };
        for ctx in &mut self.contexts {
            if ctx.in_use
                && matches!(
                    ctx.state,
                    LpnSmState::Established
                        | LpnSmState::WaitFriendMessage
                        | LpnSmState::WaitFriendSubscrCnf
                )
            {
                ctx.subscr_pending.push_back((addr, add));
            }
        }
    }

    /// Application-requested teardown.
    pub fn terminate_on_subnet(
        &mut self,
        cfg: &mut LocalConfig,
        sar_tx: &mut crate::lower_transport::sar_tx::SarTx,
        net_key_index: u16,
        effects: &mut Vec<TransportEffect>,
        events: &mut Vec<MeshEvent>,
    ) {
        if let Some(idx) = self.ctx_by_subnet(net_key_index) {
            self.terminate(cfg, sar_tx, idx, true, effects, events);
        }
    }

    /// NetKey removal kills the friendship riding it.
    pub fn on_net_key_deleted(
        &mut self,
        cfg: &mut LocalConfig,
        sar_tx: &mut crate::lower_transport::sar_tx::SarTx,
        net_key_index: u16,
        effects: &mut Vec<TransportEffect>,
        events: &mut Vec<MeshEvent>,
    ) {
        // The subnet is gone; a Friend Clear could not be encrypted anyway.
        if let Some(idx) = self.ctx_by_subnet(net_key_index) {
            self.terminate(cfg, sar_tx, idx, false, effects, events);
        }
    }

    /// Low Power feature disabled: every friendship ends with a clear.
    pub fn terminate_all(
        &mut self,
        cfg: &mut LocalConfig,
        sar_tx: &mut crate::lower_transport::sar_tx::SarTx,
        effects: &mut Vec<TransportEffect>,
        events: &mut Vec<MeshEvent>,
    ) {
        for idx in 0..self.contexts.len() {
            if self.contexts[idx].in_use {
                self.terminate(cfg, sar_tx, idx, true, effects, events);
            }
        }
    }

    fn terminate(
        &mut self,
        cfg: &mut LocalConfig,
        sar_tx: &mut crate::lower_transport::sar_tx::SarTx,
        idx: usize,
        send_clear: bool,
        effects: &mut Vec<TransportEffect>,
        events: &mut Vec<MeshEvent>,
    ) {
        let ctx = &mut self.contexts[idx];
        if !ctx.in_use {
            return;
        }
        ctx.stop_timers();
        let net_key_index = ctx.net_key_index;
        let friend_addr = ctx.friend_addr;
        let lpn_counter = ctx.lpn_counter;
        let generation = ctx.generation;
        *ctx = LpnCtx::empty();
        ctx.generation = generation + 1;

        if send_clear && friend_addr != MESH_ADDR_UNASSIGNED {
            let clear = FriendClearPdu::new(cfg.primary_addr(), lpn_counter);
            let ttl = cfg.default_ttl();
            if let Err(e) = upper_transport::send_control_pdu(
                cfg,
                sar_tx,
                &clear,
                friend_addr,
                net_key_index,
                ttl,
                None,
                false,
                effects,
            ) {
                warn!(friend_addr, "failed to send friend clear: {e:#}");
            }
        }
        let _ = cfg.keys.remove_friendship_cred(net_key_index, friend_addr);
        events.push(MeshEvent::FriendshipTerminated { net_key_index });
    }
}
