// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Heartbeat publisher and subscriber.
//!
//! Publication fires every `2^(periodLog−1)` seconds while enabled, plus
//! out-of-cycle whenever a feature named in the configured mask flips.
//! Subscription counts matching heartbeats for one period window and tracks
//! the hop spread.

use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

use crate::{
    local_config::store::LocalConfig,
    models::{
        common::{MESH_ADDR_UNASSIGNED, MeshAddress},
        heartbeat::{FeaturesBitmap, HeartbeatPdu},
    },
    node::{
        events::MeshEvent,
        msg::{MeshMsg, TimerEvent},
        timer::{self, TimerHandle},
    },
};

/// Indefinite publication count.
const COUNT_LOG_INDEFINITE: u8 = 0xFF;

/// One heartbeat ready for control egress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatOut {
    pub dst: MeshAddress,
    pub ttl: u8,
    pub net_key_index: u16,
    pub pdu: HeartbeatPdu,
}

#[inline]
fn period_secs(period_log: u8) -> u64 {
    1u64 << (period_log - 1)
}

fn decode_count(count_log: u8) -> Option<u32> {
    match count_log {
        0 => Some(0),
        COUNT_LOG_INDEFINITE => None,
        n => Some(1u32 << (u32::from(n.min(0x11)) - 1)),
    }
}

pub struct Heartbeat {
    /// Messages left in the current publication run; `None` = indefinite.
    pub_remaining: Option<u32>,
    pub_tmr: TimerHandle,
    sub_active: bool,
    sub_count: u16,
    sub_min_hops: u8,
    sub_max_hops: u8,
    sub_tmr: TimerHandle,
    msg_tx: UnboundedSender<MeshMsg>,
}

impl Heartbeat {
    pub fn new(msg_tx: UnboundedSender<MeshMsg>) -> Self {
        Self {
            pub_remaining: Some(0),
            pub_tmr: TimerHandle::idle(),
            sub_active: false,
            sub_count: 0,
            sub_min_hops: 0x7F,
            sub_max_hops: 0,
            sub_tmr: TimerHandle::idle(),
            msg_tx,
        }
    }

    fn pub_enabled(&self, cfg: &LocalConfig) -> bool {
        let st = cfg.heartbeat_pub();
        st.dst != MESH_ADDR_UNASSIGNED
            && st.period_log != 0
            && st.count_log != 0
            && !matches!(self.pub_remaining, Some(0))
    }

    fn build(cfg: &LocalConfig) -> HeartbeatOut {
        let st = cfg.heartbeat_pub();
        HeartbeatOut {
            dst: st.dst,
            ttl: st.ttl,
            net_key_index: st.net_key_index,
            pdu: HeartbeatPdu {
                init_ttl: st.ttl,
                features: cfg.features_bitmap(),
            },
        }
    }

    /// Publication state was rewritten: reload the counter and the timer.
    pub fn on_pub_state_changed(&mut self, cfg: &LocalConfig) {
        self.pub_tmr.stop();
        self.pub_remaining = decode_count(cfg.heartbeat_pub().count_log);
        if self.pub_enabled(cfg) {
            timer::restart(
                &mut self.pub_tmr,
                &self.msg_tx,
                Duration::from_secs(period_secs(cfg.heartbeat_pub().period_log)),
                TimerEvent::HbPublication,
            );
        }
    }

    /// Period tick: emit one heartbeat and rewind the timer while the run
    /// lasts.
    pub fn on_pub_timer(&mut self, cfg: &LocalConfig) -> Option<HeartbeatOut> {
        if !self.pub_enabled(cfg) {
            return None;
        }
        if let Some(n) = self.pub_remaining.as_mut() {
            *n -= 1;
        }
        if !matches!(self.pub_remaining, Some(0)) {
            timer::restart(
                &mut self.pub_tmr,
                &self.msg_tx,
                Duration::from_secs(period_secs(cfg.heartbeat_pub().period_log)),
                TimerEvent::HbPublication,
            );
        }
        Some(Self::build(cfg))
    }

    /// A feature flipped: publish out-of-cycle when the mask names it. The
    /// periodic timer is untouched.
    pub fn on_feature_changed(
        &self,
        cfg: &LocalConfig,
        changed: FeaturesBitmap,
    ) -> Option<HeartbeatOut> {
        let st = cfg.heartbeat_pub();
        if st.dst == MESH_ADDR_UNASSIGNED {
            return None;
        }
        if FeaturesBitmap::from_bits_truncate(st.features).intersection(changed)
            == FeaturesBitmap::empty()
        {
            return None;
        }
        debug!(?changed, "feature change heartbeat");
        Some(Self::build(cfg))
    }

    /// Subscription state was rewritten: restart the window and counters.
    pub fn on_sub_state_changed(&mut self, cfg: &LocalConfig) {
        self.sub_tmr.stop();
        let st = cfg.heartbeat_sub();
        let enabled = st.src != MESH_ADDR_UNASSIGNED
            && st.dst != MESH_ADDR_UNASSIGNED
            && st.period_log != 0;
        self.sub_active = enabled;
        self.sub_count = 0;
        self.sub_min_hops = 0x7F;
        self.sub_max_hops = 0;
        if enabled {
            timer::restart(
                &mut self.sub_tmr,
                &self.msg_tx,
                Duration::from_secs(period_secs(st.period_log)),
                TimerEvent::HbSubPeriod,
            );
        }
    }

    /// Subscription window elapsed.
    pub fn on_sub_timer(&mut self) {
        self.sub_active = false;
    }

    /// Incoming heartbeat; counts only while the subscription window is
    /// open and the (src, dst) pair matches.
    pub fn on_rx(
        &mut self,
        cfg: &LocalConfig,
        src: MeshAddress,
        dst: MeshAddress,
        received_ttl: u8,
        pdu: &HeartbeatPdu,
    ) -> Option<MeshEvent> {
        let st = cfg.heartbeat_sub();
        if !self.sub_active || src != st.src || dst != st.dst {
            return None;
        }
        let hops = pdu.init_ttl.saturating_sub(received_ttl).saturating_add(1);
        self.sub_count = self.sub_count.saturating_add(1);
        self.sub_min_hops = self.sub_min_hops.min(hops);
        self.sub_max_hops = self.sub_max_hops.max(hops);
        Some(MeshEvent::HeartbeatInfo {
            src,
            hops,
            min_hops: self.sub_min_hops,
            max_hops: self.sub_max_hops,
            features: pdu.features,
        })
    }

    #[inline]
    pub fn sub_count(&self) -> u16 {
        self.sub_count
    }
}
