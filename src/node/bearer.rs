// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Bearer collaborator: a byte pipe per interface.
//!
//! Ingress arrives through [`crate::node::NodeHandle::bearer_rx`]; egress
//! leaves through the [`Bearer`] capability supplied at boot. The registry
//! tracks live interfaces and the per-interface output filter consulted
//! before emission.

use std::collections::HashSet;

use anyhow::Result;
use bytes::Bytes;
use dashmap::DashMap;
use tracing::debug;

use crate::models::common::MeshAddress;

/// Bearer interface identifier.
pub type IfaceId = u8;

/// Egress capability implemented by the host's advertising/GATT transport.
pub trait Bearer: Send + Sync {
    /// Queues one network PDU on an interface. `priority` requests
    /// expedited transmission (friendship traffic inside a receive window).
    fn send(&self, iface: IfaceId, pdu: Bytes, priority: bool) -> Result<()>;
}

#[derive(Debug, Default)]
struct IfaceState {
    /// Destination addresses suppressed on this interface.
    output_filter: HashSet<MeshAddress>,
}

/// Live interface set plus output filters, written from the handler and the
/// application boundary.
#[derive(Default)]
pub struct IfaceRegistry {
    ifaces: DashMap<IfaceId, IfaceState>,
    filter_cap: usize,
}

impl IfaceRegistry {
    pub fn new(filter_cap: usize) -> Self {
        Self { ifaces: DashMap::new(), filter_cap }
    }

    pub fn add(&self, iface: IfaceId) {
        self.ifaces.entry(iface).or_default();
    }

    pub fn remove(&self, iface: IfaceId) {
        self.ifaces.remove(&iface);
    }

    pub fn is_active(&self, iface: IfaceId) -> bool {
        self.ifaces.contains_key(&iface)
    }

    /// Adds `dst` to an interface's output filter; silently capped.
    pub fn filter_add(&self, iface: IfaceId, dst: MeshAddress) {
        if let Some(mut st) = self.ifaces.get_mut(&iface) {
            if st.output_filter.len() < self.filter_cap {
                st.output_filter.insert(dst);
            } else {
                debug!(iface, dst, "output filter full, address not added");
            }
        }
    }

    pub fn filter_remove(&self, iface: IfaceId, dst: MeshAddress) {
        if let Some(mut st) = self.ifaces.get_mut(&iface) {
            st.output_filter.remove(&dst);
        }
    }

    /// True when the PDU to `dst` must not leave on `iface`.
    pub fn is_filtered(&self, iface: IfaceId, dst: MeshAddress) -> bool {
        self.ifaces
            .get(&iface)
            .map(|st| st.output_filter.contains(&dst))
            .unwrap_or(false)
    }

    /// Snapshot of active interface ids.
    pub fn active(&self) -> Vec<IfaceId> {
        self.ifaces.iter().map(|e| *e.key()).collect()
    }
}
