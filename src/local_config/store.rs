// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The store facade: elements, address lists, keys, features, transmit
//! parameters, IV state and heartbeat configuration behind typed accessors.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    cfg::{
        config::{Config, TransmitParams},
        enums::FeatureState,
    },
    crypto::{Key128, MeshSecurity},
    local_config::{
        LocalCfgError,
        addresses::{AddressLists, RefKind},
        elements::{Element, ModelPublication},
        keys::KeyStore,
    },
    models::{
        common::{MeshAddress, SeqNumber, is_multicast, is_unicast},
        heartbeat::FeaturesBitmap,
    },
    node::msg::{HeartbeatPubState, HeartbeatSubState, NodeFeature},
    nvm::{
        DATASET_APP_KEYS, DATASET_DEV_KEY, DATASET_HB_PUB, DATASET_IV_STATE,
        DATASET_NET_KEYS, DATASET_PUBLICATIONS, DATASET_SEQ_THRESHOLDS,
        DATASET_SUBSCRIPTIONS, NvmStore,
    },
};

/// Subscription mutation observed by the LPN role for friendship sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionChange {
    Added(MeshAddress),
    Removed(MeshAddress),
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct IvSnapshot {
    iv_index: u32,
    update_in_progress: bool,
}

/// Runtime feature states.
#[derive(Debug, Clone, Copy)]
pub struct Features {
    pub relay: FeatureState,
    pub proxy: FeatureState,
    pub friend: FeatureState,
    pub low_power: FeatureState,
}

pub struct LocalConfig {
    primary_addr: MeshAddress,
    elements: Vec<Element>,
    pub address_lists: AddressLists,
    pub keys: KeyStore,
    features: Features,
    default_ttl: u8,
    network_transmit: TransmitParams,
    relay_retransmit: TransmitParams,
    iv_index: u32,
    iv_update_in_progress: bool,
    hb_pub: HeartbeatPubState,
    hb_sub: HeartbeatSubState,
    seq_threshold: u32,
    nvm: Arc<dyn NvmStore>,
}

impl LocalConfig {
    /// Builds the store from the boot configuration and restores the
    /// freshness-critical datasets from NVM.
    pub fn new(
        cfg: &Config,
        primary_addr: MeshAddress,
        device_key: Key128,
        nvm: Arc<dyn NvmStore>,
    ) -> Self {
        let elements = cfg
            .elements
            .iter()
            .enumerate()
            .map(|(i, e)| Element::from_config(e, primary_addr + i as u16))
            .collect::<Vec<_>>();

        let mut store = Self {
            primary_addr,
            elements,
            address_lists: AddressLists::new(
                cfg.sizes.addr_list_max_size,
                cfg.sizes.virtual_addr_list_max_size,
            ),
            keys: KeyStore::new(
                cfg.sizes.net_key_list_size,
                cfg.sizes.app_key_list_size,
                device_key,
            ),
            features: Features {
                relay: cfg.features.relay,
                proxy: cfg.features.proxy,
                friend: cfg.features.friend,
                low_power: cfg.features.low_power,
            },
            default_ttl: cfg.transmit.default_ttl,
            network_transmit: cfg.transmit.network_transmit,
            relay_retransmit: cfg.transmit.relay_retransmit,
            iv_index: 0,
            iv_update_in_progress: false,
            hb_pub: HeartbeatPubState::default(),
            hb_sub: HeartbeatSubState::default(),
            seq_threshold: cfg.runtime.seq_number_threshold,
            nvm,
        };
        if let Err(e) = store.nvm.write(DATASET_DEV_KEY, &device_key) {
            warn!("failed to persist device key: {e}");
        }
        store.restore();
        store
    }

    fn restore(&mut self) {
        if let Some(raw) = self.nvm.read(DATASET_IV_STATE)
            && let Ok(snap) = serde_json::from_slice::<IvSnapshot>(&raw)
        {
            self.iv_index = snap.iv_index;
            self.iv_update_in_progress = snap.update_in_progress;
        }
        if let Some(raw) = self.nvm.read(DATASET_SEQ_THRESHOLDS)
            && let Ok(ceilings) = serde_json::from_slice::<Vec<SeqNumber>>(&raw)
        {
            // The stored threshold becomes the floor after a restart.
            for (elem, ceiling) in self.elements.iter_mut().zip(ceilings) {
                elem.seq.next = ceiling;
                elem.seq.persisted_ceiling = ceiling;
            }
        }
        if let Some(raw) = self.nvm.read(DATASET_HB_PUB)
            && let Ok(pub_state) = serde_json::from_slice::<SavedHbPub>(&raw)
        {
            self.hb_pub = pub_state.into();
        }
        if let Some(raw) = self.nvm.read(DATASET_SUBSCRIPTIONS)
            && let Ok(snap) = serde_json::from_slice::<SubscriptionSnapshot>(&raw)
        {
            self.address_lists = snap.address_lists;
            for (elem, models) in self.elements.iter_mut().zip(snap.models) {
                for (model, subs) in elem.models.iter_mut().zip(models) {
                    for addr in subs.subscriptions {
                        let _ = model.subscribe(addr);
                    }
                    for bind in subs.app_key_binds {
                        let _ = model.bind_app_key(bind);
                    }
                }
            }
        }
        if let Some(raw) = self.nvm.read(DATASET_PUBLICATIONS)
            && let Ok(pubs) =
                serde_json::from_slice::<Vec<Vec<Option<ModelPublication>>>>(&raw)
        {
            for (elem, models) in self.elements.iter_mut().zip(pubs) {
                for (model, publication) in elem.models.iter_mut().zip(models) {
                    model.publication = publication;
                }
            }
        }
    }

    /// Restores the key lists; runs at boot once the crypto collaborator is
    /// available to re-derive NID/AID material.
    pub fn restore_keys(&mut self, crypto: &dyn MeshSecurity) {
        let net_keys = self
            .nvm
            .read(DATASET_NET_KEYS)
            .and_then(|raw| serde_json::from_slice(&raw).ok())
            .unwrap_or_default();
        let app_keys = self
            .nvm
            .read(DATASET_APP_KEYS)
            .and_then(|raw| serde_json::from_slice(&raw).ok())
            .unwrap_or_default();
        self.keys.restore(crypto, net_keys, app_keys);
    }

    /// Persists both key lists; called after every key mutation.
    pub fn persist_keys(&self) {
        if let Ok(raw) = serde_json::to_vec(&self.keys.net_key_snapshots())
            && let Err(e) = self.nvm.write(DATASET_NET_KEYS, &raw)
        {
            warn!("failed to persist net keys: {e}");
        }
        if let Ok(raw) = serde_json::to_vec(&self.keys.app_key_snapshots())
            && let Err(e) = self.nvm.write(DATASET_APP_KEYS, &raw)
        {
            warn!("failed to persist app keys: {e}");
        }
    }

    /// Persists subscriptions, bind lists and publications.
    pub fn persist_model_config(&self) {
        let snap = SubscriptionSnapshot {
            address_lists: self.address_lists.clone(),
            models: self
                .elements
                .iter()
                .map(|e| {
                    e.models
                        .iter()
                        .map(|m| ModelSnapshot {
                            subscriptions: m.subscriptions.clone(),
                            app_key_binds: m.app_key_binds.clone(),
                        })
                        .collect()
                })
                .collect(),
        };
        if let Ok(raw) = serde_json::to_vec(&snap)
            && let Err(e) = self.nvm.write(DATASET_SUBSCRIPTIONS, &raw)
        {
            warn!("failed to persist subscriptions: {e}");
        }

        let pubs: Vec<Vec<Option<ModelPublication>>> = self
            .elements
            .iter()
            .map(|e| e.models.iter().map(|m| m.publication).collect())
            .collect();
        if let Ok(raw) = serde_json::to_vec(&pubs)
            && let Err(e) = self.nvm.write(DATASET_PUBLICATIONS, &raw)
        {
            warn!("failed to persist publications: {e}");
        }
    }

    fn persist_seq_ceilings(&self) {
        let ceilings: Vec<SeqNumber> =
            self.elements.iter().map(|e| e.seq.persisted_ceiling).collect();
        if let Ok(raw) = serde_json::to_vec(&ceilings)
            && let Err(e) = self.nvm.write(DATASET_SEQ_THRESHOLDS, &raw)
        {
            warn!("failed to persist sequence thresholds: {e}");
        }
    }

    // ── elements ────────────────────────────────────────────────────────

    #[inline]
    pub fn primary_addr(&self) -> MeshAddress {
        self.primary_addr
    }

    #[inline]
    pub fn element_count(&self) -> u8 {
        self.elements.len() as u8
    }

    pub fn element(&self, index: u8) -> Result<&Element, LocalCfgError> {
        self.elements.get(index as usize).ok_or(LocalCfgError::UnknownIndex)
    }

    pub fn element_mut(&mut self, index: u8) -> Result<&mut Element, LocalCfgError> {
        self.elements.get_mut(index as usize).ok_or(LocalCfgError::UnknownIndex)
    }

    /// Element index owning `addr`, if it is one of ours.
    pub fn element_by_addr(&self, addr: MeshAddress) -> Option<u8> {
        if !is_unicast(addr) {
            return None;
        }
        let offset = addr.checked_sub(self.primary_addr)?;
        (usize::from(offset) < self.elements.len()).then_some(offset as u8)
    }

    #[inline]
    pub fn is_own_unicast(&self, addr: MeshAddress) -> bool {
        self.element_by_addr(addr).is_some()
    }

    /// Allocates the next SEQ for an element, re-arming the NVM threshold
    /// ahead of use so a restart can never reuse a value.
    pub fn seq_alloc(&mut self, element_index: u8) -> Result<SeqNumber, LocalCfgError> {
        let threshold = self.seq_threshold;
        let elem = self
            .elements
            .get_mut(element_index as usize)
            .ok_or(LocalCfgError::UnknownIndex)?;
        let seq = elem.seq_alloc()?;
        if seq >= elem.seq.persisted_ceiling {
            elem.seq.persisted_ceiling = seq + threshold;
            self.persist_seq_ceilings();
        }
        Ok(seq)
    }

    // ── subscriptions ───────────────────────────────────────────────────

    /// Subscribes a model to a group/virtual address, reference-counting the
    /// shared table. Returns a change notification when the node-wide
    /// subscription set actually grew.
    pub fn subscribe_add(
        &mut self,
        element_index: u8,
        model_pos: u8,
        addr: MeshAddress,
    ) -> Result<Option<SubscriptionChange>, LocalCfgError> {
        if !is_multicast(addr) {
            return Err(LocalCfgError::InvalidAddress);
        }
        let was_subscribed = self.address_lists.is_subscribed(addr);
        let model = self
            .elements
            .get_mut(element_index as usize)
            .ok_or(LocalCfgError::UnknownIndex)?
            .model_mut(model_pos)?;
        if !model.subscribe(addr)? {
            return Ok(None);
        }
        if let Err(e) = self.address_lists.add_ref(addr, RefKind::Subscribe) {
            // Keep the tables consistent: no partial update is observable.
            self.elements[element_index as usize]
                .model_mut(model_pos)?
                .unsubscribe(addr);
            return Err(e);
        }
        Ok((!was_subscribed).then_some(SubscriptionChange::Added(addr)))
    }

    pub fn subscribe_add_virtual(
        &mut self,
        crypto: &dyn MeshSecurity,
        element_index: u8,
        model_pos: u8,
        label_uuid: [u8; 16],
    ) -> Result<Option<SubscriptionChange>, LocalCfgError> {
        let addr = crypto
            .virtual_address(&label_uuid)
            .map_err(|_| LocalCfgError::InvalidAddress)?;
        let was_subscribed = self.address_lists.is_subscribed(addr);
        let model = self
            .elements
            .get_mut(element_index as usize)
            .ok_or(LocalCfgError::UnknownIndex)?
            .model_mut(model_pos)?;
        if !model.subscribe(addr)? {
            return Ok(None);
        }
        if let Err(e) =
            self.address_lists.add_virtual_ref(label_uuid, addr, RefKind::Subscribe)
        {
            self.elements[element_index as usize]
                .model_mut(model_pos)?
                .unsubscribe(addr);
            return Err(e);
        }
        Ok((!was_subscribed).then_some(SubscriptionChange::Added(addr)))
    }

    pub fn subscribe_remove(
        &mut self,
        element_index: u8,
        model_pos: u8,
        addr: MeshAddress,
    ) -> Result<Option<SubscriptionChange>, LocalCfgError> {
        let model = self
            .elements
            .get_mut(element_index as usize)
            .ok_or(LocalCfgError::UnknownIndex)?
            .model_mut(model_pos)?;
        if !model.unsubscribe(addr) {
            return Err(LocalCfgError::UnknownIndex);
        }
        if crate::models::common::is_virtual(addr) {
            self.address_lists.release_virtual_ref(addr, RefKind::Subscribe)?;
        } else {
            self.address_lists.release_ref(addr, RefKind::Subscribe)?;
        }
        let still = self.address_lists.is_subscribed(addr);
        Ok((!still).then_some(SubscriptionChange::Removed(addr)))
    }

    /// Node-wide subscription test used by the network layer's local
    /// delivery decision.
    #[inline]
    pub fn is_subscribed(&self, addr: MeshAddress) -> bool {
        addr == crate::models::common::MESH_ADDR_GROUP_ALL
            || self.address_lists.is_subscribed(addr)
    }

    // ── features ────────────────────────────────────────────────────────

    pub fn feature(&self, f: NodeFeature) -> FeatureState {
        match f {
            NodeFeature::Relay => self.features.relay,
            NodeFeature::Proxy => self.features.proxy,
            NodeFeature::Friend => self.features.friend,
            NodeFeature::LowPower => self.features.low_power,
        }
    }

    /// Sets a feature state; `Ok(true)` when the value changed (heartbeat
    /// feature triggers key off this).
    pub fn set_feature(
        &mut self,
        f: NodeFeature,
        state: FeatureState,
    ) -> Result<bool, LocalCfgError> {
        let slot = match f {
            NodeFeature::Relay => &mut self.features.relay,
            NodeFeature::Proxy => &mut self.features.proxy,
            NodeFeature::Friend => &mut self.features.friend,
            NodeFeature::LowPower => &mut self.features.low_power,
        };
        if *slot == FeatureState::NotSupported && state != FeatureState::NotSupported {
            return Err(LocalCfgError::StateViolation);
        }
        let changed = *slot != state;
        *slot = state;
        if changed {
            debug!(feature = ?f, state = %state, "feature state changed");
        }
        Ok(changed)
    }

    /// Feature bitmap as carried in heartbeats.
    pub fn features_bitmap(&self) -> FeaturesBitmap {
        let mut bits = FeaturesBitmap::empty();
        if self.features.relay.is_enabled() {
            bits |= FeaturesBitmap::RELAY;
        }
        if self.features.proxy.is_enabled() {
            bits |= FeaturesBitmap::PROXY;
        }
        if self.features.friend.is_enabled() {
            bits |= FeaturesBitmap::FRIEND;
        }
        if self.features.low_power.is_enabled() {
            bits |= FeaturesBitmap::LOW_POWER;
        }
        bits
    }

    // ── transmit parameters ─────────────────────────────────────────────

    #[inline]
    pub fn default_ttl(&self) -> u8 {
        self.default_ttl
    }

    pub fn set_default_ttl(&mut self, ttl: u8) -> Result<(), LocalCfgError> {
        if ttl == 1 || ttl > 0x7F {
            return Err(LocalCfgError::StateViolation);
        }
        self.default_ttl = ttl;
        Ok(())
    }

    #[inline]
    pub fn network_transmit(&self) -> TransmitParams {
        self.network_transmit
    }

    #[inline]
    pub fn relay_retransmit(&self) -> TransmitParams {
        self.relay_retransmit
    }

    // ── IV state ────────────────────────────────────────────────────────

    #[inline]
    pub fn iv_index(&self) -> u32 {
        self.iv_index
    }

    #[inline]
    pub fn iv_update_in_progress(&self) -> bool {
        self.iv_update_in_progress
    }

    /// Applies an IV state observation; `true` when the index moved.
    pub fn set_iv_state(&mut self, iv_index: u32, update_in_progress: bool) -> bool {
        let moved = iv_index != self.iv_index;
        self.iv_index = iv_index;
        self.iv_update_in_progress = update_in_progress;
        let snap = IvSnapshot { iv_index, update_in_progress };
        if let Ok(raw) = serde_json::to_vec(&snap)
            && let Err(e) = self.nvm.write(DATASET_IV_STATE, &raw)
        {
            warn!("failed to persist IV state: {e}");
        }
        moved
    }

    /// IV Index to use on TX: the new value during an update.
    #[inline]
    pub fn tx_iv_index(&self) -> u32 {
        self.iv_index
    }

    // ── heartbeat state ─────────────────────────────────────────────────

    #[inline]
    pub fn heartbeat_pub(&self) -> HeartbeatPubState {
        self.hb_pub
    }

    pub fn set_heartbeat_pub(&mut self, state: HeartbeatPubState) {
        self.hb_pub = state;
        if let Ok(raw) = serde_json::to_vec(&SavedHbPub::from(state))
            && let Err(e) = self.nvm.write(DATASET_HB_PUB, &raw)
        {
            warn!("failed to persist heartbeat publication: {e}");
        }
    }

    #[inline]
    pub fn heartbeat_sub(&self) -> HeartbeatSubState {
        self.hb_sub
    }

    pub fn set_heartbeat_sub(&mut self, state: HeartbeatSubState) {
        self.hb_sub = state;
    }

    // ── lifecycle ───────────────────────────────────────────────────────

    /// Node reset: wipes every core dataset. The caller is responsible for
    /// stopping traffic first.
    pub fn erase_nvm(&self) {
        if let Err(e) = self.nvm.erase_all() {
            warn!("failed to erase NVM: {e}");
        }
    }

    #[inline]
    pub fn nvm(&self) -> &Arc<dyn NvmStore> {
        &self.nvm
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ModelSnapshot {
    subscriptions: Vec<MeshAddress>,
    app_key_binds: Vec<u16>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SubscriptionSnapshot {
    address_lists: AddressLists,
    models: Vec<Vec<ModelSnapshot>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SavedHbPub {
    dst: MeshAddress,
    count_log: u8,
    period_log: u8,
    ttl: u8,
    features: u16,
    net_key_index: u16,
}

impl From<HeartbeatPubState> for SavedHbPub {
    fn from(s: HeartbeatPubState) -> Self {
        Self {
            dst: s.dst,
            count_log: s.count_log,
            period_log: s.period_log,
            ttl: s.ttl,
            features: s.features,
            net_key_index: s.net_key_index,
        }
    }
}

impl From<SavedHbPub> for HeartbeatPubState {
    fn from(s: SavedHbPub) -> Self {
        Self {
            dst: s.dst,
            count_log: s.count_log,
            period_log: s.period_log,
            ttl: s.ttl,
            features: s.features,
            net_key_index: s.net_key_index,
        }
    }
}
