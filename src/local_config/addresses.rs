// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Reference-counted address tables.
//!
//! Two twin tables back every subscription and publication: non-virtual
//! addresses, and virtual addresses carrying their label UUID next to the
//! derived 14-bit hash address. Reference counts let many models share one
//! address; an entry dies when both counts reach zero.

use serde::{Deserialize, Serialize};

use crate::{
    local_config::LocalCfgError,
    models::common::{MESH_LABEL_UUID_SIZE, MeshAddress},
};

/// Which counter an operation touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefKind {
    Publish,
    Subscribe,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddrEntry {
    pub addr: MeshAddress,
    pub publish_refs: u16,
    pub subscribe_refs: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualAddrEntry {
    pub label_uuid: [u8; MESH_LABEL_UUID_SIZE],
    pub addr: MeshAddress,
    pub publish_refs: u16,
    pub subscribe_refs: u16,
}

/// The twin tables, sized at boot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddressLists {
    entries: Vec<AddrEntry>,
    virtual_entries: Vec<VirtualAddrEntry>,
    cap: usize,
    virtual_cap: usize,
}

impl AddressLists {
    pub fn new(cap: usize, virtual_cap: usize) -> Self {
        Self {
            entries: Vec::with_capacity(cap),
            virtual_entries: Vec::with_capacity(virtual_cap),
            cap,
            virtual_cap,
        }
    }

    fn bump(entry_pub: &mut u16, entry_sub: &mut u16, kind: RefKind) {
        match kind {
            RefKind::Publish => *entry_pub += 1,
            RefKind::Subscribe => *entry_sub += 1,
        }
    }

    /// References a non-virtual address, inserting it on first use.
    pub fn add_ref(
        &mut self,
        addr: MeshAddress,
        kind: RefKind,
    ) -> Result<(), LocalCfgError> {
        if let Some(e) = self.entries.iter_mut().find(|e| e.addr == addr) {
            Self::bump(&mut e.publish_refs, &mut e.subscribe_refs, kind);
            return Ok(());
        }
        if self.entries.len() >= self.cap {
            return Err(LocalCfgError::ListFull);
        }
        let mut e = AddrEntry { addr, publish_refs: 0, subscribe_refs: 0 };
        Self::bump(&mut e.publish_refs, &mut e.subscribe_refs, kind);
        self.entries.push(e);
        Ok(())
    }

    /// Drops one reference; the entry disappears with its last reference.
    pub fn release_ref(
        &mut self,
        addr: MeshAddress,
        kind: RefKind,
    ) -> Result<(), LocalCfgError> {
        let idx = self
            .entries
            .iter()
            .position(|e| e.addr == addr)
            .ok_or(LocalCfgError::UnknownIndex)?;
        {
            let e = &mut self.entries[idx];
            match kind {
                RefKind::Publish => {
                    e.publish_refs = e.publish_refs.saturating_sub(1)
                },
                RefKind::Subscribe => {
                    e.subscribe_refs = e.subscribe_refs.saturating_sub(1)
                },
            }
        }
        if self.entries[idx].publish_refs == 0 && self.entries[idx].subscribe_refs == 0 {
            self.entries.swap_remove(idx);
        }
        Ok(())
    }

    /// References a virtual address by label, inserting with the derived
    /// hash address on first use. Returns the table address.
    pub fn add_virtual_ref(
        &mut self,
        label_uuid: [u8; MESH_LABEL_UUID_SIZE],
        derived_addr: MeshAddress,
        kind: RefKind,
    ) -> Result<MeshAddress, LocalCfgError> {
        if let Some(e) = self
            .virtual_entries
            .iter_mut()
            .find(|e| e.label_uuid == label_uuid)
        {
            Self::bump(&mut e.publish_refs, &mut e.subscribe_refs, kind);
            return Ok(e.addr);
        }
        if self.virtual_entries.len() >= self.virtual_cap {
            return Err(LocalCfgError::ListFull);
        }
        let mut e = VirtualAddrEntry {
            label_uuid,
            addr: derived_addr,
            publish_refs: 0,
            subscribe_refs: 0,
        };
        Self::bump(&mut e.publish_refs, &mut e.subscribe_refs, kind);
        self.virtual_entries.push(e);
        Ok(derived_addr)
    }

    pub fn release_virtual_ref(
        &mut self,
        addr: MeshAddress,
        kind: RefKind,
    ) -> Result<(), LocalCfgError> {
        let idx = self
            .virtual_entries
            .iter()
            .position(|e| e.addr == addr)
            .ok_or(LocalCfgError::UnknownIndex)?;
        {
            let e = &mut self.virtual_entries[idx];
            match kind {
                RefKind::Publish => {
                    e.publish_refs = e.publish_refs.saturating_sub(1)
                },
                RefKind::Subscribe => {
                    e.subscribe_refs = e.subscribe_refs.saturating_sub(1)
                },
            }
        }
        if self.virtual_entries[idx].publish_refs == 0
            && self.virtual_entries[idx].subscribe_refs == 0
        {
            self.virtual_entries.swap_remove(idx);
        }
        Ok(())
    }

    /// True when any model subscribes to `addr`, virtual or not.
    pub fn is_subscribed(&self, addr: MeshAddress) -> bool {
        self.entries
            .iter()
            .any(|e| e.addr == addr && e.subscribe_refs > 0)
            || self
                .virtual_entries
                .iter()
                .any(|e| e.addr == addr && e.subscribe_refs > 0)
    }

    /// Label UUIDs matching a (possibly colliding) virtual address.
    pub fn labels_for(&self, addr: MeshAddress) -> Vec<&[u8; MESH_LABEL_UUID_SIZE]> {
        self.virtual_entries
            .iter()
            .filter(|e| e.addr == addr)
            .map(|e| &e.label_uuid)
            .collect()
    }

    /// Subscribed group and virtual addresses, for friendship sync.
    pub fn subscribed_multicast(&self) -> Vec<MeshAddress> {
        let mut out: Vec<MeshAddress> = self
            .entries
            .iter()
            .filter(|e| e.subscribe_refs > 0)
            .map(|e| e.addr)
            .chain(
                self.virtual_entries
                    .iter()
                    .filter(|e| e.subscribe_refs > 0)
                    .map(|e| e.addr),
            )
            .filter(|a| crate::models::common::is_multicast(*a))
            .collect();
        out.sort_unstable();
        out.dedup();
        out
    }
}
