// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The node's single cooperative handler.
//!
//! One task owns every component; everything that happens — bearer ingress,
//! timer expiry, application commands — drains through one queue, so the
//! stores need no locking and each message's side effects are atomic with
//! respect to the next message.

use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

use crate::{
    cfg::config::Config,
    crypto::{Key128, MeshSecurity},
    local_config::{KeyRefreshPhase, store::LocalConfig},
    lower_transport::{LtrAccPduInfo, LtrCtlPduInfo, TransportEffect},
    friend::FriendRole,
    lpn::{LpnRole, SubnetAbsorb},
    models::{
        common::{
            MESH_ADDR_GROUP_FRIEND, MeshAddress, SeqNumber, is_multicast, is_unicast,
        },
        control::ControlPdu,
        opcode::CtlOpcode,
        transport::segment::LtrPdu,
    },
    network::{self, NwkPduRxInfo, NwkPduTxInfo, RELAY_MIN_TTL, cache::NetworkCache},
    node::{
        bearer::{Bearer, IfaceId, IfaceRegistry},
        events::MeshEvent,
        msg::{IfaceEvent, MeshMsg, NodeCommand, NodeFeature, TimerEvent},
        timer,
    },
    nvm::NvmStore,
    replay::{rpl::ReplayProtection, rpl::RplVerdict, sar_history::SarRxHistory},
    lower_transport::sar_rx::{DstInfo, SarRx, SegmentedHeader},
    lower_transport::sar_tx::SarTx,
    upper_transport::{self, heartbeat::Heartbeat},
};

/// Application-facing handle: enqueue-only, safe from any task.
#[derive(Clone)]
pub struct NodeHandle {
    msg_tx: UnboundedSender<MeshMsg>,
    ifaces: Arc<IfaceRegistry>,
}

impl NodeHandle {
    /// Bearer ingress callback: hand one raw network PDU to the core.
    pub fn bearer_rx(&self, iface: IfaceId, pdu: Bytes, rssi: i8) {
        let _ = self.msg_tx.send(MeshMsg::BearerRx { iface, pdu, rssi });
    }

    pub fn iface_event(&self, ev: IfaceEvent) {
        let _ = self.msg_tx.send(MeshMsg::Iface(ev));
    }

    pub fn command(&self, cmd: NodeCommand) {
        let _ = self.msg_tx.send(MeshMsg::Command(cmd));
    }

    pub fn shutdown(&self) {
        let _ = self.msg_tx.send(MeshMsg::Shutdown);
    }

    /// Per-interface destination output filter.
    pub fn output_filter_add(&self, iface: IfaceId, dst: MeshAddress) {
        self.ifaces.filter_add(iface, dst);
    }

    pub fn output_filter_remove(&self, iface: IfaceId, dst: MeshAddress) {
        self.ifaces.filter_remove(iface, dst);
    }
}

/// Everything the handler owns.
pub struct MeshStack {
    cfg: LocalConfig,
    crypto: Arc<dyn MeshSecurity>,
    rpl: ReplayProtection,
    history: SarRxHistory,
    nwk_cache: NetworkCache,
    sar_rx: SarRx,
    sar_tx: SarTx,
    heartbeat: Heartbeat,
    friend: FriendRole,
    lpn: LpnRole,
    ifaces: Arc<IfaceRegistry>,
    bearer: Arc<dyn Bearer>,
    msg_tx: UnboundedSender<MeshMsg>,
    events_tx: UnboundedSender<MeshEvent>,
}

/// Boots the stack and spawns the handler task. Returns the handle and the
/// application event stream.
pub fn start(
    boot: Config,
    primary_addr: MeshAddress,
    device_key: Key128,
    crypto: Arc<dyn MeshSecurity>,
    nvm: Arc<dyn NvmStore>,
    bearer: Arc<dyn Bearer>,
) -> Result<(NodeHandle, mpsc::UnboundedReceiver<MeshEvent>)> {
    boot.validate()?;
    anyhow::ensure!(is_unicast(primary_addr), "primary address must be unicast");

    let (msg_tx, msg_rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let ifaces = Arc::new(IfaceRegistry::new(boot.sizes.nwk_output_filter_size));

    let mut cfg = LocalConfig::new(&boot, primary_addr, device_key, Arc::clone(&nvm));
    cfg.restore_keys(crypto.as_ref());
    let stack = MeshStack {
        cfg,
        rpl: ReplayProtection::new(boot.sizes.rp_list_size, Arc::clone(&nvm)),
        history: SarRxHistory::new(boot.sizes.sar_rx_tran_history_size),
        nwk_cache: NetworkCache::new(
            boot.sizes.nwk_cache_l1_size,
            boot.sizes.nwk_cache_l2_size,
        ),
        sar_rx: SarRx::new(
            boot.sizes.sar_rx_tran_info_size,
            primary_addr,
            msg_tx.clone(),
        ),
        sar_tx: SarTx::new(boot.sizes.sar_tx_max_transactions, msg_tx.clone()),
        heartbeat: Heartbeat::new(msg_tx.clone()),
        friend: FriendRole::new(&boot, msg_tx.clone()),
        lpn: LpnRole::new(&boot, msg_tx.clone()),
        ifaces: Arc::clone(&ifaces),
        bearer,
        crypto,
        msg_tx: msg_tx.clone(),
        events_tx,
    };

    let element_count = stack.cfg.element_count();
    let _ = stack.events_tx.send(MeshEvent::NodeStarted {
        primary_addr,
        element_count,
    });

    tokio::spawn(run_loop(stack, msg_rx));
    Ok((NodeHandle { msg_tx, ifaces }, events_rx))
}

async fn run_loop(mut stack: MeshStack, mut msg_rx: UnboundedReceiver<MeshMsg>) {
    while let Some(msg) = msg_rx.recv().await {
        if matches!(msg, MeshMsg::Shutdown) {
            info!("mesh node handler stopping");
            break;
        }
        stack.handle(msg);
    }
}

impl MeshStack {
    fn emit(&self, ev: MeshEvent) {
        let _ = self.events_tx.send(ev);
    }

    fn handle(&mut self, msg: MeshMsg) {
        match msg {
            MeshMsg::BearerRx { iface, pdu, rssi } => {
                self.handle_bearer_rx(iface, &pdu, rssi);
            },
            MeshMsg::Iface(ev) => self.handle_iface(ev),
            MeshMsg::Timer(ev) => self.handle_timer(ev),
            MeshMsg::Command(cmd) => self.handle_command(cmd),
            MeshMsg::Shutdown => {},
        }
    }

    fn handle_iface(&mut self, ev: IfaceEvent) {
        match ev {
            IfaceEvent::Added(iface) => {
                self.ifaces.add(iface);
                self.emit(MeshEvent::InterfaceAdded(iface));
            },
            IfaceEvent::Removed(iface) => {
                self.ifaces.remove(iface);
                self.emit(MeshEvent::InterfaceRemoved(iface));
            },
            IfaceEvent::Closed(iface) => {
                self.ifaces.remove(iface);
                self.emit(MeshEvent::InterfaceClosed(iface));
            },
        }
    }

    // ── network RX ──────────────────────────────────────────────────────

    fn handle_bearer_rx(&mut self, iface: IfaceId, raw: &Bytes, rssi: i8) {
        // A sleeping low-power radio hears nothing.
        if self.lpn.rx_suppressed() {
            return;
        }
        if !self.ifaces.is_active(iface) {
            debug!(iface, "PDU from unknown interface dropped");
            return;
        }

        // Candidate walk: every NetKey whose NID matches, master material
        // first, then friendship credentials.
        let mut decoded = None;
        'keys: for entry in self.cfg.keys.net_keys() {
            for (friend_lpn_addr, material) in network::rx_candidates(entry) {
                if let Some(pdu) = network::try_decode(
                    self.crypto.as_ref(),
                    material,
                    self.cfg.iv_index(),
                    raw,
                ) {
                    decoded = Some((entry.index, friend_lpn_addr, pdu));
                    break 'keys;
                }
            }
        }
        let Some((net_key_index, friend_lpn_addr, pdu)) = decoded else {
            return;
        };

        if self.nwk_cache.check_and_insert(raw) {
            return;
        }

        let info = NwkPduRxInfo {
            src: pdu.src,
            dst: pdu.dst,
            seq: pdu.seq,
            ttl: pdu.ttl,
            ctl: pdu.ctl,
            iv_index: pdu.iv_index,
            net_key_index,
            friend_lpn_addr,
            ltr_pdu: Bytes::from(pdu.ltr_pdu),
            iface,
            rssi,
        };

        let friend_active =
            self.cfg.feature(NodeFeature::Friend).is_enabled();
        let dst_info = DstInfo {
            is_own_unicast: self.cfg.is_own_unicast(info.dst),
            is_subscribed: is_multicast(info.dst) && self.cfg.is_subscribed(info.dst),
            is_lpn: friend_active
                && self.friend.is_lpn_destination(info.dst, net_key_index),
        };
        // The all-friends group is consumed by the friend role directly.
        let friend_group = info.dst == MESH_ADDR_GROUP_FRIEND && friend_active;

        if dst_info.is_own_unicast
            || dst_info.is_subscribed
            || dst_info.is_lpn
            || friend_group
        {
            self.handle_ltr_rx(&info, dst_info);
        }

        // Relay branch: never for our own unicast traffic, never below
        // TTL 2, never for PDUs we originated.
        if info.ttl >= RELAY_MIN_TTL
            && self.cfg.feature(NodeFeature::Relay).is_enabled()
            && !self.cfg.is_own_unicast(info.src)
            && !(is_unicast(info.dst) && dst_info.is_own_unicast)
        {
            self.relay(&info);
        }
    }

    fn relay(&mut self, info: &NwkPduRxInfo) {
        let Ok(entry) = self.cfg.keys.net_key(info.net_key_index) else {
            return;
        };
        let tx_info = NwkPduTxInfo {
            src: info.src,
            dst: info.dst,
            ctl: info.ctl,
            ttl: info.ttl - 1,
            seq: info.seq,
            net_key_index: info.net_key_index,
            friend_lpn_addr: None,
            priority: false,
        };
        // Relays re-encrypt under the same IV the PDU authenticated with.
        let encoded = match network::encode(
            self.crypto.as_ref(),
            entry.tx_material(),
            info.iv_index,
            &tx_info,
            &info.ltr_pdu,
        ) {
            Ok(pdu) => pdu,
            Err(e) => {
                warn!("relay encode failed: {e:#}");
                return;
            },
        };
        self.nwk_cache.check_and_insert(&encoded);
        self.broadcast(&encoded, tx_info.dst, false);

        let params = self.cfg.relay_retransmit();
        if params.count > 0 {
            timer::schedule(
                &self.msg_tx,
                std::time::Duration::from_millis(params.interval_ms()),
                TimerEvent::RelayRetransmit {
                    pdu: encoded,
                    remaining: params.count,
                    interval_ms: params.interval_ms(),
                },
            );
        }
    }

    /// Emits an encoded PDU on every active interface, honoring the
    /// per-interface output filter.
    fn broadcast(&self, encoded: &Bytes, dst: MeshAddress, priority: bool) {
        for iface in self.ifaces.active() {
            if self.ifaces.is_filtered(iface, dst) {
                continue;
            }
            if let Err(e) = self.bearer.send(iface, encoded.clone(), priority) {
                warn!(iface, "bearer send failed: {e:#}");
            }
        }
    }

    // ── lower transport RX ──────────────────────────────────────────────

    fn handle_ltr_rx(&mut self, info: &NwkPduRxInfo, dst_info: DstInfo) {
        let ltr_pdu = info.ltr_pdu.clone();
        let parsed = match LtrPdu::parse(info.ctl, &ltr_pdu) {
            Ok(p) => p,
            Err(e) => {
                debug!(src = info.src, "malformed transport PDU: {e:#}");
                return;
            },
        };

        match parsed {
            LtrPdu::UnsegAccess { hdr, utr_pdu } => {
                if dst_info.is_lpn {
                    self.friend.enqueue_pdu(
                        info.src,
                        info.dst,
                        info.net_key_index,
                        info.iv_index,
                        info.seq,
                        false,
                        info.ttl,
                        &ltr_pdu,
                    );
                }
                if dst_info.is_own_unicast || dst_info.is_subscribed {
                    let acc = LtrAccPduInfo {
                        src: info.src,
                        dst: info.dst,
                        friend_lpn_addr: info.friend_lpn_addr,
                        net_key_index: info.net_key_index,
                        ttl: info.ttl,
                        akf: hdr.akf,
                        aid: hdr.aid,
                        szmic: false,
                        seq: info.seq,
                        gt_seq: info.seq,
                        iv_index: info.iv_index,
                        utr_pdu: Bytes::copy_from_slice(utr_pdu),
                    };
                    self.deliver_access(&acc);
                }
                self.notify_lpn_data(info);
            },
            LtrPdu::SegAccess { hdr, seg, segment } => {
                let segment = segment.to_vec();
                let effects = self.process_segment(
                    info,
                    SegmentedHeader::Access { hdr, szmic: seg.szmic },
                    seg,
                    &segment,
                    dst_info,
                );
                self.run_effects(effects);
                self.notify_lpn_data(info);
            },
            LtrPdu::UnsegControl { opcode, params } => {
                let params = Bytes::copy_from_slice(params);
                if dst_info.is_lpn {
                    self.friend.enqueue_pdu(
                        info.src,
                        info.dst,
                        info.net_key_index,
                        info.iv_index,
                        info.seq,
                        true,
                        info.ttl,
                        &ltr_pdu,
                    );
                }
                let ctl = LtrCtlPduInfo {
                    src: info.src,
                    dst: info.dst,
                    net_key_index: info.net_key_index,
                    ttl: info.ttl,
                    opcode,
                    seq: info.seq,
                    gt_seq: info.seq,
                    iv_index: info.iv_index,
                    params,
                    iface: info.iface,
                    rssi: info.rssi,
                    friend_lpn_addr: info.friend_lpn_addr,
                };
                self.deliver_control(&ctl);
            },
            LtrPdu::SegControl { opcode, seg, segment } => {
                let segment = segment.to_vec();
                let effects = self.process_segment(
                    info,
                    SegmentedHeader::Control { opcode },
                    seg,
                    &segment,
                    dst_info,
                );
                self.run_effects(effects);
            },
        }
    }

    fn process_segment(
        &mut self,
        info: &NwkPduRxInfo,
        kind: SegmentedHeader,
        seg: crate::models::transport::segment::SegHeader,
        segment: &[u8],
        dst_info: DstInfo,
    ) -> Vec<TransportEffect> {
        let default_ttl = self.cfg.default_ttl();
        let cfg = &mut self.cfg;
        let events_tx = &self.events_tx;
        self.sar_rx.process_segment(
            &mut self.history,
            info,
            kind,
            seg,
            segment,
            dst_info,
            default_ttl,
            &mut || seq_alloc_reporting(cfg, events_tx),
        )
    }

    fn deliver_access(&mut self, acc: &LtrAccPduInfo) {
        match upper_transport::receive_access(
            &self.cfg,
            self.crypto.as_ref(),
            &mut self.rpl,
            acc,
        ) {
            Ok(Some(msg)) => {
                self.emit(MeshEvent::AccessRx {
                    src: msg.src,
                    dst: msg.dst,
                    app_key_index: msg.app_key_index,
                    payload: msg.payload,
                });
            },
            Ok(None) => {},
            Err(e) => debug!("access PDU rejected: {e:#}"),
        }
    }

    fn deliver_control(&mut self, ctl: &LtrCtlPduInfo) {
        // Replay protection covers control messages too.
        if self.rpl.check_and_update(ctl.src, ctl.iv_index, ctl.seq)
            == RplVerdict::Drop
        {
            debug!(src = ctl.src, "control PDU dropped by replay list");
            return;
        }
        if ctl.gt_seq > ctl.seq {
            let _ = self.rpl.check_and_update(ctl.src, ctl.iv_index, ctl.gt_seq);
        }

        let pdu = match ControlPdu::parse(ctl.opcode, &ctl.params) {
            Ok(p) => p,
            Err(e) => {
                debug!(src = ctl.src, opcode = ?ctl.opcode, "bad control PDU: {e:#}");
                return;
            },
        };

        // Point-to-point friendship PDUs must actually address this node.
        let own_dst = self.cfg.is_own_unicast(ctl.dst);
        if !own_dst
            && !matches!(
                &pdu,
                ControlPdu::SegmentAck(_)
                    | ControlPdu::FriendRequest(_)
                    | ControlPdu::Heartbeat(_)
            )
        {
            return;
        }

        let mut effects = Vec::new();
        let mut events = Vec::new();
        match &pdu {
            ControlPdu::SegmentAck(ack) => {
                let cfg = &mut self.cfg;
                let events_tx = &self.events_tx;
                let fx = self.sar_tx.on_segment_ack(ctl.src, ack, &mut || {
                    seq_alloc_reporting(cfg, events_tx)
                });
                effects.extend(fx);
                self.notify_lpn_data_ctl(ctl);
            },
            ControlPdu::FriendRequest(req) => {
                if ctl.dst == MESH_ADDR_GROUP_FRIEND {
                    self.friend.on_friend_request(
                        &mut self.cfg,
                        self.crypto.as_ref(),
                        ctl.src,
                        ctl.net_key_index,
                        ctl.rssi,
                        req,
                    );
                }
            },
            ControlPdu::FriendOffer(offer) => {
                self.lpn.on_friend_offer(
                    &mut self.cfg,
                    self.crypto.as_ref(),
                    &mut self.sar_tx,
                    ctl.src,
                    ctl.net_key_index,
                    offer,
                    &mut effects,
                    &mut events,
                );
            },
            ControlPdu::FriendPoll(poll) => {
                self.friend.on_friend_poll(
                    &mut self.cfg,
                    &mut self.sar_tx,
                    ctl.src,
                    ctl.net_key_index,
                    poll.fsn,
                    &mut effects,
                    &mut events,
                );
            },
            ControlPdu::FriendUpdate(update) => {
                let absorb = self.lpn.on_friend_update(
                    &mut self.cfg,
                    &mut self.sar_tx,
                    ctl.src,
                    ctl.net_key_index,
                    update,
                    &mut effects,
                    &mut events,
                );
                if let Some(absorb) = absorb {
                    self.apply_subnet_absorb(absorb);
                }
            },
            ControlPdu::FriendClear(clear) => {
                self.friend.on_friend_clear(
                    &mut self.cfg,
                    &mut self.sar_tx,
                    ctl.src,
                    ctl.net_key_index,
                    clear,
                    &mut effects,
                    &mut events,
                );
            },
            ControlPdu::FriendClearConfirm(cnf) => {
                self.friend.on_clear_confirm(ctl.src, ctl.net_key_index, &cnf.0);
            },
            ControlPdu::FriendSubscrListAdd(pdu) => {
                self.friend.on_subscr_list(ctl.src, ctl.net_key_index, true, pdu);
            },
            ControlPdu::FriendSubscrListRemove(pdu) => {
                self.friend.on_subscr_list(ctl.src, ctl.net_key_index, false, &pdu.0);
            },
            ControlPdu::FriendSubscrListConfirm(cnf) => {
                self.lpn.on_subscr_cnf(
                    &mut self.cfg,
                    &mut self.sar_tx,
                    ctl.src,
                    ctl.net_key_index,
                    cnf,
                    &mut effects,
                );
            },
            ControlPdu::Heartbeat(hb) => {
                if let Some(ev) =
                    self.heartbeat.on_rx(&self.cfg, ctl.src, ctl.dst, ctl.ttl, hb)
                {
                    events.push(ev);
                }
                self.notify_lpn_data_ctl(ctl);
            },
        }

        self.run_effects(effects);
        for ev in events {
            self.emit(ev);
        }
    }

    /// A PDU that rode friendship credentials counts as friend activity for
    /// the LPN role.
    fn notify_lpn_data(&mut self, info: &NwkPduRxInfo) {
        if info.friend_lpn_addr.is_some() {
            let mut effects = Vec::new();
            self.lpn.on_friend_message(
                &mut self.cfg,
                &mut self.sar_tx,
                info.net_key_index,
                &mut effects,
            );
            self.run_effects(effects);
        }
    }

    fn notify_lpn_data_ctl(&mut self, ctl: &LtrCtlPduInfo) {
        if ctl.friend_lpn_addr.is_some() {
            let mut effects = Vec::new();
            self.lpn.on_friend_message(
                &mut self.cfg,
                &mut self.sar_tx,
                ctl.net_key_index,
                &mut effects,
            );
            self.run_effects(effects);
        }
    }

    /// IV/key state learned from the friend (or the beacon collaborator).
    fn apply_subnet_absorb(&mut self, absorb: SubnetAbsorb) {
        let moved = self.cfg.set_iv_state(absorb.iv_index, absorb.iv_update);
        if moved {
            self.nwk_cache.clear();
            self.rpl.iv_cleanup(absorb.iv_index);
            self.history.iv_cleanup(absorb.iv_index);
            self.emit(MeshEvent::IvUpdated { iv_index: absorb.iv_index });
        }
        let phase = self
            .cfg
            .keys
            .net_key(absorb.net_key_index)
            .map(|e| e.phase)
            .unwrap_or(KeyRefreshPhase::None);
        let target = match (absorb.key_refresh, phase) {
            (true, KeyRefreshPhase::Phase1) => Some(KeyRefreshPhase::Phase2),
            (false, KeyRefreshPhase::Phase2) => Some(KeyRefreshPhase::Phase3),
            _ => None,
        };
        if let Some(target) = target
            && self
                .cfg
                .keys
                .set_key_refresh_phase(absorb.net_key_index, target)
                .is_ok()
        {
            self.cfg.persist_keys();
            self.friend.on_subnet_state_changed(&self.cfg, absorb.net_key_index);
        }
    }

    // ── effects ─────────────────────────────────────────────────────────

    fn run_effects(&mut self, effects: Vec<TransportEffect>) {
        for effect in effects {
            match effect {
                TransportEffect::SendNetwork { info, ltr_pdu } => {
                    self.send_network(&info, &ltr_pdu);
                },
                TransportEffect::DeliverAccess(acc) => self.deliver_access(&acc),
                TransportEffect::DeliverControl(ctl) => self.deliver_control(&ctl),
                TransportEffect::FriendEnqueue {
                    src,
                    dst,
                    net_key_index,
                    iv_index,
                    ctl,
                    ttl,
                    segments,
                } => {
                    self.friend.enqueue_segments(
                        src, dst, net_key_index, iv_index, ctl, ttl, &segments,
                    );
                },
                TransportEffect::TxDone { seq } => {
                    debug!(seq, "segmented transmission acknowledged");
                },
                TransportEffect::TxTimeout { seq } => {
                    self.emit(MeshEvent::SarTxTimeout { seq });
                },
                TransportEffect::TxRejected { seq } => {
                    self.emit(MeshEvent::SarTxRejected { seq });
                },
            }
        }
    }

    /// Network egress: friendship interception first, then encode and
    /// broadcast under the network-transmit schedule.
    fn send_network(&mut self, info: &NwkPduTxInfo, ltr_pdu: &[u8]) {
        // Locally-originated traffic for a befriended LPN lands in its
        // queue; unicast to the LPN goes nowhere else.
        if info.friend_lpn_addr.is_none()
            && self.cfg.feature(NodeFeature::Friend).is_enabled()
            && self.friend.is_lpn_destination(info.dst, info.net_key_index)
        {
            self.friend.enqueue_pdu(
                info.src,
                info.dst,
                info.net_key_index,
                self.cfg.tx_iv_index(),
                info.seq,
                info.ctl,
                info.ttl,
                ltr_pdu,
            );
            if is_unicast(info.dst) {
                return;
            }
        }

        let Ok(entry) = self.cfg.keys.net_key(info.net_key_index) else {
            warn!(net_key_index = info.net_key_index, "TX on unknown subnet");
            return;
        };
        let Some(material) = network::tx_material(entry, info.friend_lpn_addr) else {
            warn!("no credentials for friendship TX");
            return;
        };
        let encoded = match network::encode(
            self.crypto.as_ref(),
            material,
            self.cfg.tx_iv_index(),
            info,
            ltr_pdu,
        ) {
            Ok(pdu) => pdu,
            Err(e) => {
                warn!("network encode failed: {e:#}");
                self.emit(MeshEvent::SendFailed { seq: info.seq });
                return;
            },
        };

        self.nwk_cache.check_and_insert(&encoded);
        self.broadcast(&encoded, info.dst, info.priority);

        let params = self.cfg.network_transmit();
        if params.count > 0 && !info.priority {
            timer::schedule(
                &self.msg_tx,
                std::time::Duration::from_millis(params.interval_ms()),
                TimerEvent::RelayRetransmit {
                    pdu: encoded,
                    remaining: params.count,
                    interval_ms: params.interval_ms(),
                },
            );
        }
    }

    // ── timers ──────────────────────────────────────────────────────────

    fn handle_timer(&mut self, ev: TimerEvent) {
        match ev {
            TimerEvent::SarRxAck { slot, generation } => {
                let default_ttl = self.cfg.default_ttl();
                let cfg = &mut self.cfg;
                let events_tx = &self.events_tx;
                let effects =
                    self.sar_rx.on_ack_timer(slot, generation, default_ttl, &mut || {
                        seq_alloc_reporting(cfg, events_tx)
                    });
                self.run_effects(effects);
            },
            TimerEvent::SarRxIncomplete { slot, generation } => {
                self.sar_rx
                    .on_incomplete_timer(slot, generation, &mut self.history);
            },
            TimerEvent::SarTxRetry { slot, generation } => {
                let cfg = &mut self.cfg;
                let events_tx = &self.events_tx;
                let effects =
                    self.sar_tx.on_retry_timer(slot, generation, &mut || {
                        seq_alloc_reporting(cfg, events_tx)
                    });
                self.run_effects(effects);
            },
            TimerEvent::RelayRetransmit { pdu, remaining, interval_ms } => {
                // Destination and TTL already encoded; filters saw them on
                // the first pass.
                for iface in self.ifaces.active() {
                    if let Err(e) = self.bearer.send(iface, pdu.clone(), false) {
                        warn!(iface, "bearer send failed: {e:#}");
                    }
                }
                if remaining > 1 {
                    timer::schedule(
                        &self.msg_tx,
                        std::time::Duration::from_millis(interval_ms),
                        TimerEvent::RelayRetransmit {
                            pdu,
                            remaining: remaining - 1,
                            interval_ms,
                        },
                    );
                }
            },
            TimerEvent::FriendRecvDelay { ctx, generation } => {
                let mut effects = Vec::new();
                self.friend.on_recv_delay_timer(
                    &mut self.cfg,
                    &mut self.sar_tx,
                    ctx,
                    generation,
                    &mut effects,
                );
                self.run_effects(effects);
            },
            TimerEvent::FriendEstablish { ctx, generation } => {
                self.friend.on_establish_timer(&mut self.cfg, ctx, generation);
            },
            TimerEvent::FriendPollTimeout { ctx, generation } => {
                let mut events = Vec::new();
                self.friend.on_poll_timeout_timer(
                    &mut self.cfg,
                    ctx,
                    generation,
                    &mut events,
                );
                for ev in events {
                    self.emit(ev);
                }
            },
            TimerEvent::FriendClearPeriod { ctx, generation } => {
                let mut effects = Vec::new();
                self.friend.on_clear_period_timer(
                    &mut self.cfg,
                    &mut self.sar_tx,
                    ctx,
                    generation,
                    &mut effects,
                );
                self.run_effects(effects);
            },
            TimerEvent::FriendSubscrCnfDelay { ctx, generation } => {
                let mut effects = Vec::new();
                self.friend.on_subscr_cnf_timer(
                    &mut self.cfg,
                    &mut self.sar_tx,
                    ctx,
                    generation,
                    &mut effects,
                );
                self.run_effects(effects);
            },
            TimerEvent::LpnCadence { ctx, generation } => {
                let mut effects = Vec::new();
                let mut events = Vec::new();
                self.lpn.on_cadence_timer(
                    &mut self.cfg,
                    &mut self.sar_tx,
                    ctx,
                    generation,
                    &mut effects,
                    &mut events,
                );
                self.run_effects(effects);
                for ev in events {
                    self.emit(ev);
                }
            },
            TimerEvent::LpnPollTimeout { ctx, generation } => {
                let mut effects = Vec::new();
                let mut events = Vec::new();
                self.lpn.on_poll_timeout_timer(
                    &mut self.cfg,
                    &mut self.sar_tx,
                    ctx,
                    generation,
                    &mut effects,
                    &mut events,
                );
                self.run_effects(effects);
                for ev in events {
                    self.emit(ev);
                }
            },
            TimerEvent::HbPublication => {
                if let Some(out) = self.heartbeat.on_pub_timer(&self.cfg) {
                    self.send_heartbeat(out);
                }
            },
            TimerEvent::HbSubPeriod => self.heartbeat.on_sub_timer(),
        }
    }

    fn send_heartbeat(&mut self, out: upper_transport::heartbeat::HeartbeatOut) {
        let mut effects = Vec::new();
        if let Err(e) = upper_transport::send_control(
            &mut self.cfg,
            &mut self.sar_tx,
            CtlOpcode::Heartbeat,
            &out.pdu.to_bytes(),
            out.dst,
            out.net_key_index,
            out.ttl,
            None,
            false,
            &mut effects,
        ) {
            warn!("failed to send heartbeat: {e:#}");
        }
        self.run_effects(effects);
    }

    // ── commands ────────────────────────────────────────────────────────

    fn handle_command(&mut self, cmd: NodeCommand) {
        match cmd {
            NodeCommand::SendAccess(req) => {
                let mut effects = Vec::new();
                match upper_transport::send_access(
                    &mut self.cfg,
                    self.crypto.as_ref(),
                    &mut self.sar_tx,
                    &req,
                    &mut effects,
                ) {
                    Ok(_) => self.run_effects(effects),
                    Err(upper_transport::UtrSendError::Config(
                        crate::local_config::LocalCfgError::SeqExhausted,
                    )) => {
                        self.emit(MeshEvent::SeqExhausted {
                            element_index: req.element_index,
                        });
                    },
                    Err(e) => warn!("access send failed: {e:#}"),
                }
            },
            NodeCommand::AddNetKey { net_key_index, key } => {
                match self.cfg.keys.add_net_key(self.crypto.as_ref(), net_key_index, key)
                {
                    Ok(()) => self.cfg.persist_keys(),
                    Err(e) => warn!(net_key_index, "add net key failed: {e}"),
                }
            },
            NodeCommand::UpdateNetKey { net_key_index, key } => {
                match self
                    .cfg
                    .keys
                    .update_net_key(self.crypto.as_ref(), net_key_index, key)
                {
                    Ok(()) => {
                        self.cfg.persist_keys();
                        self.friend.on_subnet_state_changed(&self.cfg, net_key_index);
                    },
                    Err(e) => warn!(net_key_index, "update net key failed: {e}"),
                }
            },
            NodeCommand::DeleteNetKey { net_key_index } => {
                let mut events = Vec::new();
                let mut effects = Vec::new();
                self.friend
                    .on_net_key_deleted(&mut self.cfg, net_key_index, &mut events);
                self.lpn.on_net_key_deleted(
                    &mut self.cfg,
                    &mut self.sar_tx,
                    net_key_index,
                    &mut effects,
                    &mut events,
                );
                match self.cfg.keys.delete_net_key(net_key_index) {
                    Ok(()) => self.cfg.persist_keys(),
                    Err(e) => warn!(net_key_index, "delete net key failed: {e}"),
                }
                self.run_effects(effects);
                for ev in events {
                    self.emit(ev);
                }
            },
            NodeCommand::SetKeyRefreshPhase { net_key_index, phase } => {
                let Some(phase) = KeyRefreshPhase::from_u8(phase) else {
                    warn!(phase, "invalid key refresh phase");
                    return;
                };
                match self.cfg.keys.set_key_refresh_phase(net_key_index, phase) {
                    Ok(()) => {
                        self.cfg.persist_keys();
                        self.friend.on_subnet_state_changed(&self.cfg, net_key_index);
                    },
                    Err(e) => warn!(net_key_index, "key refresh transition failed: {e}"),
                }
            },
            NodeCommand::AddAppKey { app_key_index, net_key_index, key } => {
                match self.cfg.keys.add_app_key(
                    self.crypto.as_ref(),
                    app_key_index,
                    net_key_index,
                    key,
                ) {
                    Ok(()) => self.cfg.persist_keys(),
                    Err(e) => warn!(app_key_index, "add app key failed: {e}"),
                }
            },
            NodeCommand::UpdateAppKey { app_key_index, key } => {
                match self
                    .cfg
                    .keys
                    .update_app_key(self.crypto.as_ref(), app_key_index, key)
                {
                    Ok(()) => self.cfg.persist_keys(),
                    Err(e) => warn!(app_key_index, "update app key failed: {e}"),
                }
            },
            NodeCommand::DeleteAppKey { app_key_index } => {
                match self.cfg.keys.delete_app_key(app_key_index) {
                    Ok(()) => self.cfg.persist_keys(),
                    Err(e) => warn!(app_key_index, "delete app key failed: {e}"),
                }
            },
            NodeCommand::BindAppKey { element_index, model_pos, app_key_index } => {
                let bound = self
                    .cfg
                    .element_mut(element_index)
                    .and_then(|e| e.model_mut(model_pos))
                    .and_then(|m| m.bind_app_key(app_key_index));
                match bound {
                    Ok(()) => self.cfg.persist_model_config(),
                    Err(e) => warn!(element_index, model_pos, "bind failed: {e}"),
                }
            },
            NodeCommand::SubscribeAdd { element_index, model_pos, addr } => {
                match self.cfg.subscribe_add(element_index, model_pos, addr) {
                    Ok(change) => {
                        self.cfg.persist_model_config();
                        if let Some(change) = change {
                            self.lpn.on_subscription_change(change);
                        }
                    },
                    Err(e) => warn!(addr, "subscribe failed: {e}"),
                }
            },
            NodeCommand::SubscribeAddVirtual { element_index, model_pos, label_uuid } => {
                match self.cfg.subscribe_add_virtual(
                    self.crypto.as_ref(),
                    element_index,
                    model_pos,
                    label_uuid,
                ) {
                    Ok(change) => {
                        self.cfg.persist_model_config();
                        if let Some(change) = change {
                            self.lpn.on_subscription_change(change);
                        }
                    },
                    Err(e) => warn!("virtual subscribe failed: {e}"),
                }
            },
            NodeCommand::SubscribeRemove { element_index, model_pos, addr } => {
                match self.cfg.subscribe_remove(element_index, model_pos, addr) {
                    Ok(change) => {
                        self.cfg.persist_model_config();
                        if let Some(change) = change {
                            self.lpn.on_subscription_change(change);
                        }
                    },
                    Err(e) => warn!(addr, "unsubscribe failed: {e}"),
                }
            },
            NodeCommand::SetPublication { element_index, model_pos, publication } => {
                let set = self
                    .cfg
                    .element_mut(element_index)
                    .and_then(|e| e.model_mut(model_pos))
                    .map(|m| m.publication = publication);
                match set {
                    Ok(()) => self.cfg.persist_model_config(),
                    Err(e) => {
                        warn!(element_index, model_pos, "set publication failed: {e}")
                    },
                }
            },
            NodeCommand::SetFeature { feature, state } => {
                match self.cfg.set_feature(feature, state) {
                    Ok(true) => {
                        let changed = match feature {
                            NodeFeature::Relay => {
                                crate::models::heartbeat::FeaturesBitmap::RELAY
                            },
                            NodeFeature::Proxy => {
                                crate::models::heartbeat::FeaturesBitmap::PROXY
                            },
                            NodeFeature::Friend => {
                                crate::models::heartbeat::FeaturesBitmap::FRIEND
                            },
                            NodeFeature::LowPower => {
                                crate::models::heartbeat::FeaturesBitmap::LOW_POWER
                            },
                        };
                        if let Some(out) =
                            self.heartbeat.on_feature_changed(&self.cfg, changed)
                        {
                            self.send_heartbeat(out);
                        }
                        if feature == NodeFeature::Friend && !state.is_enabled() {
                            let mut events = Vec::new();
                            self.friend.terminate_all(&mut self.cfg, &mut events);
                            for ev in events {
                                self.emit(ev);
                            }
                        }
                        if feature == NodeFeature::LowPower && !state.is_enabled() {
                            let mut effects = Vec::new();
                            let mut events = Vec::new();
                            self.lpn.terminate_all(
                                &mut self.cfg,
                                &mut self.sar_tx,
                                &mut effects,
                                &mut events,
                            );
                            self.run_effects(effects);
                            for ev in events {
                                self.emit(ev);
                            }
                        }
                    },
                    Ok(false) => {},
                    Err(e) => warn!("feature change rejected: {e}"),
                }
            },
            NodeCommand::SetDefaultTtl { ttl } => {
                if let Err(e) = self.cfg.set_default_ttl(ttl) {
                    warn!(ttl, "default TTL rejected: {e}");
                }
            },
            NodeCommand::SetHeartbeatPub(state) => {
                self.cfg.set_heartbeat_pub(state);
                self.heartbeat.on_pub_state_changed(&self.cfg);
            },
            NodeCommand::SetHeartbeatSub(state) => {
                self.cfg.set_heartbeat_sub(state);
                self.heartbeat.on_sub_state_changed(&self.cfg);
            },
            NodeCommand::EstablishFriendship { net_key_index } => {
                let mut effects = Vec::new();
                self.lpn.establish(
                    &mut self.cfg,
                    &mut self.sar_tx,
                    net_key_index,
                    &mut effects,
                );
                self.run_effects(effects);
            },
            NodeCommand::TerminateFriendship { net_key_index } => {
                let mut effects = Vec::new();
                let mut events = Vec::new();
                self.lpn.terminate_on_subnet(
                    &mut self.cfg,
                    &mut self.sar_tx,
                    net_key_index,
                    &mut effects,
                    &mut events,
                );
                self.run_effects(effects);
                for ev in events {
                    self.emit(ev);
                }
            },
            NodeCommand::IvNotification { iv_index, update_in_progress } => {
                let subnets: Vec<u16> =
                    self.cfg.keys.net_keys().iter().map(|e| e.index).collect();
                let moved = self.cfg.set_iv_state(iv_index, update_in_progress);
                if moved {
                    self.nwk_cache.clear();
                    self.rpl.iv_cleanup(iv_index);
                    self.history.iv_cleanup(iv_index);
                    self.emit(MeshEvent::IvUpdated { iv_index });
                }
                for nki in subnets {
                    self.friend.on_subnet_state_changed(&self.cfg, nki);
                }
            },
            NodeCommand::NodeReset => {
                info!("node reset: erasing NVM and clearing live state");
                let mut events = Vec::new();
                self.friend.terminate_all(&mut self.cfg, &mut events);
                self.sar_rx.reset();
                self.sar_tx.reset();
                self.history.reset();
                self.rpl.clear();
                self.nwk_cache.clear();
                self.cfg.erase_nvm();
                for ev in events {
                    self.emit(ev);
                }
            },
        }
    }
}

/// Allocates a primary-element SEQ, surfacing exhaustion as an event.
fn seq_alloc_reporting(
    cfg: &mut LocalConfig,
    events_tx: &UnboundedSender<MeshEvent>,
) -> Option<SeqNumber> {
    match cfg.seq_alloc(0) {
        Ok(seq) => Some(seq),
        Err(crate::local_config::LocalCfgError::SeqExhausted) => {
            let _ = events_tx.send(MeshEvent::SeqExhausted { element_index: 0 });
            None
        },
        Err(_) => None,
    }
}
