// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Friend role: per-LPN friendship contexts, the establishment state
//! machine, queue delivery on polls and the previous-friend clear protocol.

pub mod queue;

use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use crate::{
    cfg::config::Config,
    crypto::{MeshSecurity, k2_p_friendship},
    local_config::{
        KeyRefreshPhase,
        keys::FriendshipCred,
        store::LocalConfig,
    },
    lower_transport::{FriendSegment, TransportEffect},
    models::{
        common::{MESH_ADDR_UNASSIGNED, MeshAddress, SeqNumber},
        friendship::{
            MIN_OFFER_DELAY_MS, RSSI_UNAVAILABLE,
            clear::{FriendClearPdu, lpn_counter_matches},
            offer::FriendOfferPdu,
            request::FriendRequestPdu,
            subscription::{FriendSubscrCnfPdu, FriendSubscrListPdu},
            update::{FriendUpdatePdu, UpdateFlags},
        },
        opcode::CtlOpcode,
    },
    network::NwkPduTxInfo,
    node::{
        events::MeshEvent,
        msg::{MeshMsg, TimerEvent},
        timer::{self, TimerHandle},
    },
    state_machine::common::Transition,
    upper_transport::{self},
};

/// Friendship control traffic travels exactly one hop.
const FRIENDSHIP_TTL: u8 = 0;
/// Window between Friend Offer and the first Friend Poll.
const ESTABLISH_TIMEOUT: Duration = Duration::from_secs(1);
/// Scheduler drift margin added to receive-delay timers so the response
/// lands inside the LPN's window, never ahead of it.
const TMR_DRIFT: Duration = Duration::from_millis(10);

/// Establishment state of one friendship, friend side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FriendSmState {
    #[default]
    Idle,
    /// Request accepted, friendship credentials being derived.
    StartKeyDeriv,
    /// Credentials ready, offer delay running.
    WaitRecvDelay,
    /// Offer sent, waiting for the first poll.
    WaitPoll,
    Established,
}

/// Establishment parameters captured from the Friend Request.
#[derive(Debug, Clone, Copy, Default)]
struct EstabInfo {
    poll_timeout_steps: u32,
    prev_friend_addr: MeshAddress,
    friend_counter: u16,
    lpn_counter: u16,
    recv_delay_ms: u8,
    num_elements: u8,
    req_rssi: i8,
}

/// One per-LPN friendship context.
struct FriendLpnCtx {
    in_use: bool,
    generation: u64,
    state: FriendSmState,
    lpn_addr: MeshAddress,
    net_key_index: u16,
    estab: EstabInfo,
    queue: queue::FriendQueue,
    subscr_list: Vec<MeshAddress>,
    /// FSN acknowledged by the last answered poll.
    crt_fsn: Option<bool>,
    /// FSN carried by the poll currently waiting out the receive delay.
    next_fsn: bool,
    /// Last applied subscription transaction number.
    trans_num: Option<u8>,
    /// Confirm to send once the LPN's receive delay elapses.
    pending_subscr_cnf: Option<u8>,
    clear_active: bool,
    clear_dst: MeshAddress,
    clear_period_secs: u64,
    recv_delay_tmr: TimerHandle,
    estab_tmr: TimerHandle,
    poll_tmr: TimerHandle,
    clear_tmr: TimerHandle,
    subscr_cnf_tmr: TimerHandle,
}

impl FriendLpnCtx {
    fn empty(queue_cap: usize, subscr_cap: usize) -> Self {
        Self {
            in_use: false,
            generation: 0,
            state: FriendSmState::Idle,
            lpn_addr: MESH_ADDR_UNASSIGNED,
            net_key_index: 0,
            estab: EstabInfo::default(),
            queue: queue::FriendQueue::new(queue_cap),
            subscr_list: Vec::with_capacity(subscr_cap),
            crt_fsn: None,
            next_fsn: false,
            trans_num: None,
            pending_subscr_cnf: None,
            clear_active: false,
            clear_dst: MESH_ADDR_UNASSIGNED,
            clear_period_secs: 0,
            recv_delay_tmr: TimerHandle::idle(),
            estab_tmr: TimerHandle::idle(),
            poll_tmr: TimerHandle::idle(),
            clear_tmr: TimerHandle::idle(),
            subscr_cnf_tmr: TimerHandle::idle(),
        }
    }

    fn stop_timers(&mut self) {
        self.recv_delay_tmr.stop();
        self.estab_tmr.stop();
        self.poll_tmr.stop();
        self.clear_tmr.stop();
        self.subscr_cnf_tmr.stop();
    }

    #[inline]
    fn poll_timeout(&self) -> Duration {
        Duration::from_millis(
            u64::from(self.estab.poll_timeout_steps)
                * crate::models::friendship::POLL_TIMEOUT_STEP_MS,
        )
    }

    /// True when `dst` addresses this LPN: a unicast within its element
    /// range or a multicast it subscribed through us.
    fn covers_dst(&self, dst: MeshAddress) -> bool {
        if crate::models::common::is_unicast(dst) {
            dst >= self.lpn_addr
                && dst < self.lpn_addr + MeshAddress::from(self.estab.num_elements)
        } else {
            self.subscr_list.contains(&dst)
        }
    }
}

/// Subnet security snapshot for Friend Updates: the key-refresh flag covers
/// phase 2, the IV flag an update in progress.
pub fn subnet_update_flags(cfg: &LocalConfig, net_key_index: u16) -> UpdateFlags {
    let mut flags = UpdateFlags::empty();
    if cfg
        .keys
        .net_key(net_key_index)
        .map(|e| e.phase == KeyRefreshPhase::Phase2)
        .unwrap_or(false)
    {
        flags |= UpdateFlags::KEY_REFRESH;
    }
    if cfg.iv_update_in_progress() {
        flags |= UpdateFlags::IV_UPDATE;
    }
    flags
}

pub struct FriendRole {
    contexts: Vec<FriendLpnCtx>,
    friend_counter: u16,
    recv_window_ms: u8,
    subscr_cap: usize,
    msg_tx: UnboundedSender<MeshMsg>,
}

impl FriendRole {
    pub fn new(cfg: &Config, msg_tx: UnboundedSender<MeshMsg>) -> Self {
        Self {
            contexts: (0..cfg.sizes.max_num_friendships)
                .map(|_| {
                    FriendLpnCtx::empty(
                        cfg.sizes.max_num_friend_queue_entries,
                        cfg.sizes.max_friend_subscr_list_size,
                    )
                })
                .collect(),
            friend_counter: crate::utils::random_counter(),
            recv_window_ms: cfg.friendship.recv_window_ms,
            subscr_cap: cfg.sizes.max_friend_subscr_list_size,
            msg_tx,
        }
    }

    fn ctx_by_lpn(&mut self, lpn_addr: MeshAddress, net_key_index: u16) -> Option<usize> {
        self.contexts.iter().position(|c| {
            c.in_use && c.lpn_addr == lpn_addr && c.net_key_index == net_key_index
        })
    }

    /// Local offer delay from the request criteria and the measured RSSI,
    /// floored at the protocol minimum. Factor encodings are ×10 fixed
    /// point, hence the final division.
    fn offer_delay_ms(&self, recv_win_factor: u8, rssi_factor: u8, rssi: i8) -> u64 {
        let calc = i32::from(10 + 5 * i32::from(recv_win_factor))
            * i32::from(self.recv_window_ms)
            - i32::from(10 + 5 * i32::from(rssi_factor)) * i32::from(rssi);
        if calc < (MIN_OFFER_DELAY_MS * 10) as i32 {
            MIN_OFFER_DELAY_MS
        } else {
            (calc / 10) as u64
        }
    }

    /// Friend Request received on the all-friends address.
    pub fn on_friend_request(
        &mut self,
        cfg: &mut LocalConfig,
        crypto: &dyn MeshSecurity,
        src: MeshAddress,
        net_key_index: u16,
        rssi: i8,
        req: &FriendRequestPdu,
    ) {
        if !cfg.feature(crate::node::msg::NodeFeature::Friend).is_enabled() {
            return;
        }
        let criteria = match req.validate() {
            Ok(c) => c,
            Err(e) => {
                debug!(src, "invalid friend request: {e:#}");
                return;
            },
        };

        // A repeated request from a known LPN restarts the establishment.
        let idx = match self.ctx_by_lpn(src, net_key_index) {
            Some(idx) => {
                self.teardown_ctx(cfg, idx);
                idx
            },
            None => match self.contexts.iter().position(|c| !c.in_use) {
                Some(idx) => idx,
                None => {
                    debug!(src, "no friendship context available");
                    return;
                },
            },
        };

        let delay =
            self.offer_delay_ms(criteria.recv_win_factor, criteria.rssi_factor, rssi);
        let friend_counter = self.friend_counter;

        let ctx = &mut self.contexts[idx];
        ctx.in_use = true;
        ctx.generation += 1;
        ctx.state = FriendSmState::StartKeyDeriv;
        ctx.lpn_addr = src;
        ctx.net_key_index = net_key_index;
        ctx.estab = EstabInfo {
            poll_timeout_steps: req.poll_timeout(),
            prev_friend_addr: req.prev_addr.get(),
            friend_counter,
            lpn_counter: req.lpn_counter.get(),
            recv_delay_ms: req.recv_delay_ms,
            num_elements: req.num_elements,
            req_rssi: rssi,
        };

        // Friendship credentials are derived before the offer goes out;
        // failure aborts silently.
        let p = k2_p_friendship(
            src,
            cfg.primary_addr(),
            req.lpn_counter.get(),
            friend_counter,
        );
        let entry = match cfg.keys.net_key(net_key_index) {
            Ok(e) => e,
            Err(_) => {
                self.contexts[idx].in_use = false;
                return;
            },
        };
        let material = match crypto.k2(&entry.key, &p) {
            Ok(m) => m,
            Err(e) => {
                warn!(src, "friendship key derivation failed: {e:#}");
                self.contexts[idx].in_use = false;
                return;
            },
        };
        let new_material = entry
            .new_key
            .as_ref()
            .and_then(|new_key| crypto.k2(new_key, &p).ok());
        if cfg
            .keys
            .add_friendship_cred(
                net_key_index,
                FriendshipCred { peer_addr: src, material, new_material },
            )
            .is_err()
        {
            self.contexts[idx].in_use = false;
            return;
        }

        let ctx = &mut self.contexts[idx];
        let t = Transition::Next(FriendSmState::WaitRecvDelay);
        t.apply(&mut ctx.state);
        timer::restart(
            &mut ctx.recv_delay_tmr,
            &self.msg_tx,
            Duration::from_millis(delay) + TMR_DRIFT,
            TimerEvent::FriendRecvDelay { ctx: idx, generation: ctx.generation },
        );
        debug!(lpn = src, delay_ms = delay, "friend request accepted, offer delayed");
    }

    /// Receive-delay expiry. During establishment it releases the Friend
    /// Offer; on an established friendship it answers the pending poll.
    pub fn on_recv_delay_timer(
        &mut self,
        cfg: &mut LocalConfig,
        sar_tx: &mut crate::lower_transport::sar_tx::SarTx,
        idx: usize,
        generation: u64,
        effects: &mut Vec<TransportEffect>,
    ) {
        let msg_tx = self.msg_tx.clone();
        let recv_window_ms = self.recv_window_ms;
        let subscr_cap = self.subscr_cap;
        let Some(ctx) = self.contexts.get_mut(idx) else {
            return;
        };
        if !ctx.in_use || ctx.generation != generation {
            return;
        }
        if ctx.state == FriendSmState::Established {
            // A toggled FSN acknowledges the previously delivered PDU.
            if ctx.crt_fsn.is_some_and(|crt| crt != ctx.next_fsn) {
                ctx.queue.confirm_delivered();
                ctx.crt_fsn = Some(ctx.next_fsn);
            }
            self.send_next_pdu(cfg, sar_tx, idx, effects);
            return;
        }
        if ctx.state != FriendSmState::WaitRecvDelay {
            return;
        }

        let offer = FriendOfferPdu::new(
            recv_window_ms,
            ctx.queue.free_count().min(u8::MAX as usize) as u8,
            if ctx.estab.req_rssi == 0 { RSSI_UNAVAILABLE } else { ctx.estab.req_rssi },
            subscr_cap.min(u8::MAX as usize) as u8,
            ctx.estab.friend_counter,
        );
        let dst = ctx.lpn_addr;
        let net_key_index = ctx.net_key_index;
        Transition::Next(FriendSmState::WaitPoll).apply(&mut ctx.state);
        timer::restart(
            &mut ctx.estab_tmr,
            &msg_tx,
            ESTABLISH_TIMEOUT,
            TimerEvent::FriendEstablish { ctx: idx, generation: ctx.generation },
        );

        // Offers ride master credentials; the LPN has no friendship
        // material until it accepts.
        if let Err(e) = upper_transport::send_control_pdu(
            cfg,
            sar_tx,
            &offer,
            dst,
            net_key_index,
            FRIENDSHIP_TTL,
            None,
            false,
            effects,
        ) {
            warn!(lpn = dst, "failed to send friend offer: {e:#}");
        }
        self.friend_counter = self.friend_counter.wrapping_add(1);
    }

    /// Establishment window expired without a poll.
    pub fn on_establish_timer(
        &mut self,
        cfg: &mut LocalConfig,
        idx: usize,
        generation: u64,
    ) {
        let Some(ctx) = self.contexts.get(idx) else {
            return;
        };
        if !ctx.in_use
            || ctx.generation != generation
            || ctx.state != FriendSmState::WaitPoll
        {
            return;
        }
        debug!(lpn = ctx.lpn_addr, "no first poll, friendship abandoned");
        self.teardown_ctx(cfg, idx);
    }

    /// Friend Poll from an LPN.
    #[allow(clippy::too_many_arguments)]
    pub fn on_friend_poll(
        &mut self,
        cfg: &mut LocalConfig,
        sar_tx: &mut crate::lower_transport::sar_tx::SarTx,
        src: MeshAddress,
        net_key_index: u16,
        fsn: bool,
        effects: &mut Vec<TransportEffect>,
        events: &mut Vec<MeshEvent>,
    ) {
        let msg_tx = self.msg_tx.clone();
        let Some(idx) = self.ctx_by_lpn(src, net_key_index) else {
            return;
        };
        let ctx = &mut self.contexts[idx];

        match ctx.state {
            FriendSmState::WaitPoll => {
                ctx.estab_tmr.stop();
                Transition::Next(FriendSmState::Established).apply(&mut ctx.state);
                info!(lpn = src, net_key_index, "friendship established");
                events.push(MeshEvent::FriendshipEstablished { net_key_index });

                // Chase the previous friend until it confirms the clear.
                let prev = ctx.estab.prev_friend_addr;
                if prev != MESH_ADDR_UNASSIGNED
                    && prev != cfg.primary_addr()
                    && prev != src
                {
                    ctx.clear_active = true;
                    ctx.clear_dst = prev;
                    ctx.clear_period_secs = 1;
                    timer::restart(
                        &mut ctx.clear_tmr,
                        &msg_tx,
                        Duration::from_secs(1),
                        TimerEvent::FriendClearPeriod {
                            ctx: idx,
                            generation: ctx.generation,
                        },
                    );
                    self.send_clear(cfg, sar_tx, idx, effects);
                }
            },
            FriendSmState::Established => {},
            _ => return,
        }

        let ctx = &mut self.contexts[idx];
        // Record the poll's FSN; the answer waits out the LPN's receive
        // delay so it lands inside the receive window.
        if ctx.crt_fsn.is_none() {
            ctx.crt_fsn = Some(fsn);
        }
        ctx.next_fsn = fsn;
        let poll_timeout = ctx.poll_timeout();
        let generation = ctx.generation;
        timer::restart(
            &mut ctx.poll_tmr,
            &msg_tx,
            poll_timeout,
            TimerEvent::FriendPollTimeout { ctx: idx, generation },
        );
        timer::restart(
            &mut ctx.recv_delay_tmr,
            &msg_tx,
            Duration::from_millis(u64::from(ctx.estab.recv_delay_ms)) + TMR_DRIFT,
            TimerEvent::FriendRecvDelay { ctx: idx, generation: ctx.generation },
        );
    }

    /// Emits the queue head, or a synthesized Friend Update when empty.
    fn send_next_pdu(
        &mut self,
        cfg: &mut LocalConfig,
        sar_tx: &mut crate::lower_transport::sar_tx::SarTx,
        idx: usize,
        effects: &mut Vec<TransportEffect>,
    ) {
        let ctx = &mut self.contexts[idx];
        let lpn_addr = ctx.lpn_addr;
        let net_key_index = ctx.net_key_index;

        match ctx.queue.next_to_send() {
            None => {
                let update = FriendUpdatePdu::new(
                    subnet_update_flags(cfg, net_key_index),
                    cfg.iv_index(),
                    false,
                );
                if let Err(e) = upper_transport::send_control_pdu(
                    cfg,
                    sar_tx,
                    &update,
                    lpn_addr,
                    net_key_index,
                    FRIENDSHIP_TTL,
                    Some(lpn_addr),
                    true,
                    effects,
                ) {
                    warn!(lpn = lpn_addr, "failed to send friend update: {e:#}");
                }
            },
            Some(entry) if entry.flags.contains(queue::EntryFlags::UPDATE) => {
                // Queued updates are authored by this node at emission time.
                if let Err(e) = upper_transport::send_control(
                    cfg,
                    sar_tx,
                    CtlOpcode::FriendUpdate,
                    &entry.ltr_pdu[1..],
                    lpn_addr,
                    net_key_index,
                    FRIENDSHIP_TTL,
                    Some(lpn_addr),
                    true,
                    effects,
                ) {
                    warn!(lpn = lpn_addr, "failed to send queued update: {e:#}");
                }
            },
            Some(entry) => {
                // Stored PDUs replay their original SRC/SEQ/IV under
                // friendship credentials, TTL spent by one hop.
                effects.push(TransportEffect::SendNetwork {
                    info: NwkPduTxInfo {
                        src: entry.src,
                        dst: entry.dst,
                        ctl: entry.ctl,
                        ttl: entry.ttl - 1,
                        seq: entry.seq,
                        net_key_index,
                        friend_lpn_addr: Some(lpn_addr),
                        priority: true,
                    },
                    ltr_pdu: entry.ltr_pdu,
                });
            },
        }
    }

    fn send_clear(
        &mut self,
        cfg: &mut LocalConfig,
        sar_tx: &mut crate::lower_transport::sar_tx::SarTx,
        idx: usize,
        effects: &mut Vec<TransportEffect>,
    ) {
        let ctx = &self.contexts[idx];
        let clear = FriendClearPdu::new(ctx.lpn_addr, ctx.estab.lpn_counter);
        let (dst, net_key_index) = (ctx.clear_dst, ctx.net_key_index);
        // The previous friend can be several hops away: default TTL,
        // master credentials.
        let ttl = cfg.default_ttl();
        if let Err(e) = upper_transport::send_control_pdu(
            cfg, sar_tx, &clear, dst, net_key_index, ttl, None, false, effects,
        ) {
            warn!(dst, "failed to send friend clear: {e:#}");
        }
    }

    /// Doubling clear retransmission, bounded by twice the poll timeout.
    pub fn on_clear_period_timer(
        &mut self,
        cfg: &mut LocalConfig,
        sar_tx: &mut crate::lower_transport::sar_tx::SarTx,
        idx: usize,
        generation: u64,
        effects: &mut Vec<TransportEffect>,
    ) {
        let msg_tx = self.msg_tx.clone();
        let Some(ctx) = self.contexts.get_mut(idx) else {
            return;
        };
        if !ctx.in_use || ctx.generation != generation || !ctx.clear_active {
            return;
        }
        ctx.clear_period_secs <<= 1;
        let budget_secs = 2 * ctx.poll_timeout().as_secs().max(1);
        if ctx.clear_period_secs >= budget_secs {
            debug!(lpn = ctx.lpn_addr, "clear retransmission window exhausted");
            ctx.clear_active = false;
            return;
        }
        timer::restart(
            &mut ctx.clear_tmr,
            &msg_tx,
            Duration::from_secs(ctx.clear_period_secs),
            TimerEvent::FriendClearPeriod { ctx: idx, generation },
        );
        self.send_clear(cfg, sar_tx, idx, effects);
    }

    /// Friend Clear received: a newer friend asks us to drop the LPN.
    pub fn on_friend_clear(
        &mut self,
        cfg: &mut LocalConfig,
        sar_tx: &mut crate::lower_transport::sar_tx::SarTx,
        src: MeshAddress,
        net_key_index: u16,
        clear: &FriendClearPdu,
        effects: &mut Vec<TransportEffect>,
        events: &mut Vec<MeshEvent>,
    ) {
        let lpn_addr = clear.lpn_addr.get();
        let Some(idx) = self.ctx_by_lpn(lpn_addr, net_key_index) else {
            return;
        };
        let ctx = &self.contexts[idx];
        if !lpn_counter_matches(ctx.estab.lpn_counter, clear.lpn_counter.get()) {
            debug!(lpn = lpn_addr, "friend clear counter mismatch, ignored");
            return;
        }
        let cnf = crate::models::control::FriendClearCnfPdu(FriendClearPdu::new(
            lpn_addr,
            clear.lpn_counter.get(),
        ));
        let ttl = cfg.default_ttl();
        if let Err(e) = upper_transport::send_control_pdu(
            cfg, sar_tx, &cnf, src, net_key_index, ttl, None, false, effects,
        ) {
            warn!(dst = src, "failed to send clear confirm: {e:#}");
        }
        self.teardown_ctx(cfg, idx);
        events.push(MeshEvent::FriendshipTerminated { net_key_index });
    }

    /// Clear Confirm from the previous friend stops the retransmissions.
    pub fn on_clear_confirm(
        &mut self,
        src: MeshAddress,
        net_key_index: u16,
        cnf: &FriendClearPdu,
    ) {
        let lpn_addr = cnf.lpn_addr.get();
        let Some(idx) = self.ctx_by_lpn(lpn_addr, net_key_index) else {
            return;
        };
        let ctx = &mut self.contexts[idx];
        if ctx.clear_active
            && ctx.clear_dst == src
            && cnf.lpn_counter.get() == ctx.estab.lpn_counter
        {
            ctx.clear_active = false;
            ctx.clear_tmr.stop();
            debug!(lpn = lpn_addr, "previous friend confirmed clear");
        }
    }

    /// Poll timeout: the LPN went silent for the negotiated budget.
    pub fn on_poll_timeout_timer(
        &mut self,
        cfg: &mut LocalConfig,
        idx: usize,
        generation: u64,
        events: &mut Vec<MeshEvent>,
    ) {
        let Some(ctx) = self.contexts.get(idx) else {
            return;
        };
        if !ctx.in_use
            || ctx.generation != generation
            || ctx.state != FriendSmState::Established
        {
            return;
        }
        let net_key_index = ctx.net_key_index;
        warn!(lpn = ctx.lpn_addr, "poll timeout, friendship lost");
        self.teardown_ctx(cfg, idx);
        events.push(MeshEvent::FriendshipTerminated { net_key_index });
    }

    /// Subscription list add/remove with a transaction number; duplicates
    /// confirm without reapplying.
    pub fn on_subscr_list(
        &mut self,
        src: MeshAddress,
        net_key_index: u16,
        add: bool,
        pdu: &FriendSubscrListPdu,
    ) {
        let msg_tx = self.msg_tx.clone();
        let subscr_cap = self.subscr_cap;
        let Some(idx) = self.ctx_by_lpn(src, net_key_index) else {
            return;
        };
        let ctx = &mut self.contexts[idx];
        if ctx.state != FriendSmState::Established {
            return;
        }

        if ctx.trans_num != Some(pdu.trans_num) {
            for addr in &pdu.addresses {
                if add {
                    if !ctx.subscr_list.contains(addr) {
                        if ctx.subscr_list.len() >= subscr_cap {
                            warn!(lpn = src, "LPN subscription list full");
                            break;
                        }
                        ctx.subscr_list.push(*addr);
                    }
                } else {
                    ctx.subscr_list.retain(|a| a != addr);
                }
            }
            ctx.trans_num = Some(pdu.trans_num);
        }

        // The confirm leaves after the LPN's receive delay so it lands
        // inside the receive window.
        ctx.pending_subscr_cnf = Some(pdu.trans_num);
        timer::restart(
            &mut ctx.subscr_cnf_tmr,
            &msg_tx,
            Duration::from_millis(u64::from(ctx.estab.recv_delay_ms)) + TMR_DRIFT,
            TimerEvent::FriendSubscrCnfDelay { ctx: idx, generation: ctx.generation },
        );
    }

    /// Delayed Subscription List Confirm.
    pub fn on_subscr_cnf_timer(
        &mut self,
        cfg: &mut LocalConfig,
        sar_tx: &mut crate::lower_transport::sar_tx::SarTx,
        idx: usize,
        generation: u64,
        effects: &mut Vec<TransportEffect>,
    ) {
        let Some(ctx) = self.contexts.get_mut(idx) else {
            return;
        };
        if !ctx.in_use || ctx.generation != generation {
            return;
        }
        let Some(trans_num) = ctx.pending_subscr_cnf.take() else {
            return;
        };
        let (dst, net_key_index) = (ctx.lpn_addr, ctx.net_key_index);
        let cnf = FriendSubscrCnfPdu { trans_num };
        if let Err(e) = upper_transport::send_control_pdu(
            cfg,
            sar_tx,
            &cnf,
            dst,
            net_key_index,
            FRIENDSHIP_TTL,
            Some(dst),
            true,
            effects,
        ) {
            warn!(lpn = dst, "failed to send subscription confirm: {e:#}");
        }
    }

    /// Subnet IV or key-refresh movement: every established LPN gets a
    /// queued Friend Update it will see on its next poll.
    pub fn on_subnet_state_changed(&mut self, cfg: &LocalConfig, net_key_index: u16) {
        let flags = subnet_update_flags(cfg, net_key_index);
        let iv_index = cfg.iv_index();
        for ctx in &mut self.contexts {
            if ctx.in_use
                && ctx.net_key_index == net_key_index
                && ctx.state == FriendSmState::Established
            {
                ctx.queue.add_update(flags, iv_index);
            }
        }
    }

    /// NetKey removal tears down every friendship on the subnet.
    pub fn on_net_key_deleted(
        &mut self,
        cfg: &mut LocalConfig,
        net_key_index: u16,
        events: &mut Vec<MeshEvent>,
    ) {
        for idx in 0..self.contexts.len() {
            let ctx = &self.contexts[idx];
            if ctx.in_use && ctx.net_key_index == net_key_index {
                let established = ctx.state == FriendSmState::Established;
                self.teardown_ctx(cfg, idx);
                if established {
                    events.push(MeshEvent::FriendshipTerminated { net_key_index });
                }
            }
        }
    }

    /// True when at least one established LPN is a destination for `dst`.
    pub fn is_lpn_destination(&self, dst: MeshAddress, net_key_index: u16) -> bool {
        self.contexts.iter().any(|c| {
            c.in_use
                && c.state == FriendSmState::Established
                && c.net_key_index == net_key_index
                && c.covers_dst(dst)
        })
    }

    /// Queues one LTR PDU into every covering LPN's Friend Queue.
    #[allow(clippy::too_many_arguments)]
    pub fn enqueue_pdu(
        &mut self,
        src: MeshAddress,
        dst: MeshAddress,
        net_key_index: u16,
        iv_index: u32,
        seq: SeqNumber,
        ctl: bool,
        ttl: u8,
        ltr_pdu: &[u8],
    ) {
        for ctx in &mut self.contexts {
            if ctx.in_use
                && ctx.state == FriendSmState::Established
                && ctx.net_key_index == net_key_index
                && ctx.covers_dst(dst)
            {
                ctx.queue.add_pdu(src, dst, iv_index, seq, ctl, ttl, ltr_pdu);
            }
        }
    }

    /// Queues every original segment of a reassembled PDU.
    pub fn enqueue_segments(
        &mut self,
        src: MeshAddress,
        dst: MeshAddress,
        net_key_index: u16,
        iv_index: u32,
        ctl: bool,
        ttl: u8,
        segments: &[FriendSegment],
    ) {
        for seg in segments {
            self.enqueue_pdu(
                src,
                dst,
                net_key_index,
                iv_index,
                seg.seq,
                ctl,
                ttl,
                &seg.ltr_pdu,
            );
        }
    }

    /// Friend feature disabled: every friendship dies.
    pub fn terminate_all(&mut self, cfg: &mut LocalConfig, events: &mut Vec<MeshEvent>) {
        for idx in 0..self.contexts.len() {
            let ctx = &self.contexts[idx];
            if ctx.in_use {
                let net_key_index = ctx.net_key_index;
                let established = ctx.state == FriendSmState::Established;
                self.teardown_ctx(cfg, idx);
                if established {
                    events.push(MeshEvent::FriendshipTerminated { net_key_index });
                }
            }
        }
    }

    fn teardown_ctx(&mut self, cfg: &mut LocalConfig, idx: usize) {
        let ctx = &mut self.contexts[idx];
        if !ctx.in_use {
            return;
        }
        ctx.stop_timers();
        let _ = cfg
            .keys
            .remove_friendship_cred(ctx.net_key_index, ctx.lpn_addr);
        let generation = ctx.generation;
        let queue_cap = ctx.queue.free_count() + ctx.queue.len();
        let subscr_cap = self.subscr_cap;
        *ctx = FriendLpnCtx::empty(queue_cap, subscr_cap);
        ctx.generation = generation + 1;
    }

}
