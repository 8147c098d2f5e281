// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! NetKey / AppKey / DeviceKey lists with old/new slots for key refresh.

use serde::{Deserialize, Serialize};

use crate::{
    crypto::{K2_P_MASTER, Key128, MeshSecurity, NetKeyMaterial},
    local_config::{KeyRefreshPhase, LocalCfgError},
    models::common::{MESH_KEY_INDEX_MAX_VAL, MeshAddress},
};

/// Friendship security credentials derived once via k2 at establishment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FriendshipCred {
    /// Primary address of the peer (LPN for the Friend role, Friend for the
    /// LPN role).
    pub peer_addr: MeshAddress,
    /// Address this node uses to select the credentials on TX.
    pub material: NetKeyMaterial,
    /// Material derived from the new key during refresh.
    pub new_material: Option<NetKeyMaterial>,
}

/// One subnet's key state.
#[derive(Debug, Clone)]
pub struct NetKeyEntry {
    pub index: u16,
    pub key: Key128,
    pub new_key: Option<Key128>,
    pub phase: KeyRefreshPhase,
    pub material: NetKeyMaterial,
    pub new_material: Option<NetKeyMaterial>,
    /// Live friendship credentials on this subnet.
    pub friendships: Vec<FriendshipCred>,
}

impl NetKeyEntry {
    /// Material used for TX: new from phase 2 onward.
    pub fn tx_material(&self) -> &NetKeyMaterial {
        match self.phase {
            KeyRefreshPhase::Phase2 => self.new_material.as_ref().unwrap_or(&self.material),
            _ => &self.material,
        }
    }

    /// Key used for TX beacons/derivations, mirroring [`Self::tx_material`].
    pub fn tx_key(&self) -> &Key128 {
        match self.phase {
            KeyRefreshPhase::Phase2 => self.new_key.as_ref().unwrap_or(&self.key),
            _ => &self.key,
        }
    }

    /// Candidate materials for RX trial, old first.
    pub fn rx_materials(&self) -> impl Iterator<Item = &NetKeyMaterial> {
        std::iter::once(&self.material).chain(self.new_material.as_ref())
    }

    pub fn friendship_for(&self, peer_addr: MeshAddress) -> Option<&FriendshipCred> {
        self.friendships.iter().find(|f| f.peer_addr == peer_addr)
    }
}

/// One application key bound to a subnet.
#[derive(Debug, Clone, PartialEq)]
pub struct AppKeyEntry {
    pub index: u16,
    pub net_key_index: u16,
    pub key: Key128,
    pub new_key: Option<Key128>,
    pub aid: u8,
    pub new_aid: Option<u8>,
}

/// Serialized form for NVM snapshots (derived material is recomputed).
#[derive(Debug, Serialize, Deserialize)]
pub struct NetKeySnapshot {
    pub index: u16,
    pub key: Key128,
    pub new_key: Option<Key128>,
    pub phase: KeyRefreshPhase,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AppKeySnapshot {
    pub index: u16,
    pub net_key_index: u16,
    pub key: Key128,
    pub new_key: Option<Key128>,
}

/// Key store: bounded NetKey and AppKey lists plus the device key.
pub struct KeyStore {
    net_keys: Vec<NetKeyEntry>,
    app_keys: Vec<AppKeyEntry>,
    device_key: Key128,
    net_cap: usize,
    app_cap: usize,
}

impl KeyStore {
    pub fn new(net_cap: usize, app_cap: usize, device_key: Key128) -> Self {
        Self {
            net_keys: Vec::with_capacity(net_cap),
            app_keys: Vec::with_capacity(app_cap),
            device_key,
            net_cap,
            app_cap,
        }
    }

    #[inline]
    pub fn device_key(&self) -> &Key128 {
        &self.device_key
    }

    pub fn net_key(&self, index: u16) -> Result<&NetKeyEntry, LocalCfgError> {
        self.net_keys
            .iter()
            .find(|e| e.index == index)
            .ok_or(LocalCfgError::UnknownIndex)
    }

    pub fn net_key_mut(&mut self, index: u16) -> Result<&mut NetKeyEntry, LocalCfgError> {
        self.net_keys
            .iter_mut()
            .find(|e| e.index == index)
            .ok_or(LocalCfgError::UnknownIndex)
    }

    pub fn net_keys(&self) -> &[NetKeyEntry] {
        &self.net_keys
    }

    pub fn app_key(&self, index: u16) -> Result<&AppKeyEntry, LocalCfgError> {
        self.app_keys
            .iter()
            .find(|e| e.index == index)
            .ok_or(LocalCfgError::UnknownIndex)
    }

    /// AppKeys bound to a subnet whose AID matches, for RX key trial.
    pub fn app_keys_by_aid(
        &self,
        net_key_index: u16,
        aid: u8,
    ) -> impl Iterator<Item = (&AppKeyEntry, &Key128)> {
        self.app_keys
            .iter()
            .filter(move |e| e.net_key_index == net_key_index)
            .flat_map(move |e| {
                let mut out = Vec::with_capacity(2);
                if e.aid == aid {
                    out.push((e, &e.key));
                }
                if let (Some(new_aid), Some(new_key)) = (e.new_aid, e.new_key.as_ref())
                    && new_aid == aid
                {
                    out.push((e, new_key));
                }
                out
            })
    }

    pub fn add_net_key(
        &mut self,
        crypto: &dyn MeshSecurity,
        index: u16,
        key: Key128,
    ) -> Result<(), LocalCfgError> {
        if index > MESH_KEY_INDEX_MAX_VAL {
            return Err(LocalCfgError::UnknownIndex);
        }
        if self.net_keys.iter().any(|e| e.index == index) {
            return Err(LocalCfgError::AlreadyExists);
        }
        if self.net_keys.len() >= self.net_cap {
            return Err(LocalCfgError::ListFull);
        }
        let material = crypto
            .k2(&key, &K2_P_MASTER)
            .map_err(|_| LocalCfgError::StateViolation)?;
        self.net_keys.push(NetKeyEntry {
            index,
            key,
            new_key: None,
            phase: KeyRefreshPhase::None,
            material,
            new_material: None,
            friendships: Vec::new(),
        });
        Ok(())
    }

    /// Distributes new key material: enters phase 1.
    pub fn update_net_key(
        &mut self,
        crypto: &dyn MeshSecurity,
        index: u16,
        new_key: Key128,
    ) -> Result<(), LocalCfgError> {
        let material = crypto
            .k2(&new_key, &K2_P_MASTER)
            .map_err(|_| LocalCfgError::StateViolation)?;
        let entry = self.net_key_mut(index)?;
        if entry.phase != KeyRefreshPhase::None {
            return Err(LocalCfgError::StateViolation);
        }
        entry.new_key = Some(new_key);
        entry.new_material = Some(material);
        entry.phase = KeyRefreshPhase::Phase1;
        Ok(())
    }

    /// Applies a key refresh phase transition. Phase 3 commits: the new
    /// material becomes current and the old is erased, on the NetKey and on
    /// every AppKey bound to it.
    pub fn set_key_refresh_phase(
        &mut self,
        index: u16,
        phase: KeyRefreshPhase,
    ) -> Result<(), LocalCfgError> {
        let entry = self.net_key_mut(index)?;
        if !entry.phase.can_transition_to(phase) {
            return Err(LocalCfgError::StateViolation);
        }
        if entry.phase == phase {
            return Ok(());
        }
        match phase {
            KeyRefreshPhase::Phase2 => entry.phase = phase,
            KeyRefreshPhase::Phase3 => {
                if let (Some(new_key), Some(new_material)) =
                    (entry.new_key.take(), entry.new_material.take())
                {
                    entry.key = new_key;
                    entry.material = new_material;
                }
                for f in &mut entry.friendships {
                    if let Some(m) = f.new_material.take() {
                        f.material = m;
                    }
                }
                entry.phase = KeyRefreshPhase::None;
                for app in
                    self.app_keys.iter_mut().filter(|a| a.net_key_index == index)
                {
                    if let Some(new_key) = app.new_key.take() {
                        app.key = new_key;
                    }
                    if let Some(new_aid) = app.new_aid.take() {
                        app.aid = new_aid;
                    }
                }
            },
            _ => return Err(LocalCfgError::StateViolation),
        }
        Ok(())
    }

    /// Deletes a subnet; the caller tears down friendships first.
    pub fn delete_net_key(&mut self, index: u16) -> Result<(), LocalCfgError> {
        let pos = self
            .net_keys
            .iter()
            .position(|e| e.index == index)
            .ok_or(LocalCfgError::UnknownIndex)?;
        self.net_keys.remove(pos);
        self.app_keys.retain(|a| a.net_key_index != index);
        Ok(())
    }

    pub fn add_app_key(
        &mut self,
        crypto: &dyn MeshSecurity,
        index: u16,
        net_key_index: u16,
        key: Key128,
    ) -> Result<(), LocalCfgError> {
        if index > MESH_KEY_INDEX_MAX_VAL {
            return Err(LocalCfgError::UnknownIndex);
        }
        self.net_key(net_key_index)?;
        if self.app_keys.iter().any(|e| e.index == index) {
            return Err(LocalCfgError::AlreadyExists);
        }
        if self.app_keys.len() >= self.app_cap {
            return Err(LocalCfgError::ListFull);
        }
        let aid = crypto.k4(&key).map_err(|_| LocalCfgError::StateViolation)?;
        self.app_keys.push(AppKeyEntry {
            index,
            net_key_index,
            key,
            new_key: None,
            aid,
            new_aid: None,
        });
        Ok(())
    }

    /// New AppKey material; only valid while the bound NetKey is in phase 1.
    pub fn update_app_key(
        &mut self,
        crypto: &dyn MeshSecurity,
        index: u16,
        new_key: Key128,
    ) -> Result<(), LocalCfgError> {
        let new_aid = crypto.k4(&new_key).map_err(|_| LocalCfgError::StateViolation)?;
        let net_phase = {
            let app = self.app_key(index)?;
            self.net_key(app.net_key_index)?.phase
        };
        if net_phase != KeyRefreshPhase::Phase1 {
            return Err(LocalCfgError::StateViolation);
        }
        let app = self
            .app_keys
            .iter_mut()
            .find(|e| e.index == index)
            .ok_or(LocalCfgError::UnknownIndex)?;
        app.new_key = Some(new_key);
        app.new_aid = Some(new_aid);
        Ok(())
    }

    pub fn delete_app_key(&mut self, index: u16) -> Result<(), LocalCfgError> {
        let pos = self
            .app_keys
            .iter()
            .position(|e| e.index == index)
            .ok_or(LocalCfgError::UnknownIndex)?;
        self.app_keys.remove(pos);
        Ok(())
    }

    /// Registers friendship credentials on a subnet, replacing any previous
    /// set for the same peer.
    pub fn add_friendship_cred(
        &mut self,
        net_key_index: u16,
        cred: FriendshipCred,
    ) -> Result<(), LocalCfgError> {
        let entry = self.net_key_mut(net_key_index)?;
        entry.friendships.retain(|f| f.peer_addr != cred.peer_addr);
        entry.friendships.push(cred);
        Ok(())
    }

    pub fn remove_friendship_cred(
        &mut self,
        net_key_index: u16,
        peer_addr: MeshAddress,
    ) -> Result<(), LocalCfgError> {
        let entry = self.net_key_mut(net_key_index)?;
        entry.friendships.retain(|f| f.peer_addr != peer_addr);
        Ok(())
    }

    /// NVM snapshot of the NetKey list.
    pub fn net_key_snapshots(&self) -> Vec<NetKeySnapshot> {
        self.net_keys
            .iter()
            .map(|e| NetKeySnapshot {
                index: e.index,
                key: e.key,
                new_key: e.new_key,
                phase: e.phase,
            })
            .collect()
    }

    /// NVM snapshot of the AppKey list.
    pub fn app_key_snapshots(&self) -> Vec<AppKeySnapshot> {
        self.app_keys
            .iter()
            .map(|e| AppKeySnapshot {
                index: e.index,
                net_key_index: e.net_key_index,
                key: e.key,
                new_key: e.new_key,
            })
            .collect()
    }

    /// Rebuilds the key lists from NVM snapshots, re-deriving NID/AID
    /// material. Entries whose derivation fails are skipped. Refresh phase 2
    /// is re-entered only after the AppKeys are back, since AppKey updates
    /// are only legal in phase 1.
    pub fn restore(
        &mut self,
        crypto: &dyn MeshSecurity,
        net_keys: Vec<NetKeySnapshot>,
        app_keys: Vec<AppKeySnapshot>,
    ) {
        let mut phase2: Vec<u16> = Vec::new();
        for snap in net_keys {
            if self.add_net_key(crypto, snap.index, snap.key).is_err() {
                continue;
            }
            if let Some(new_key) = snap.new_key {
                let _ = self.update_net_key(crypto, snap.index, new_key);
            }
            if snap.phase == KeyRefreshPhase::Phase2 {
                phase2.push(snap.index);
            }
        }
        for snap in app_keys {
            if self
                .add_app_key(crypto, snap.index, snap.net_key_index, snap.key)
                .is_err()
            {
                continue;
            }
            if let Some(new_key) = snap.new_key {
                let _ = self.update_app_key(crypto, snap.index, new_key);
            }
        }
        for index in phase2 {
            let _ = self.set_key_refresh_phase(index, KeyRefreshPhase::Phase2);
        }
    }
}
