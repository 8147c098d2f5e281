// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Element and model tables. Read-mostly after boot; mutated only by the
//! configuration handlers.

use serde::{Deserialize, Serialize};

use crate::{
    cfg::config::ElementConfig,
    local_config::LocalCfgError,
    models::common::{MESH_SEQ_MAX_VAL, MeshAddress, SeqNumber},
};

/// SIG or vendor model identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelId {
    Sig(u16),
    /// Company id in the high half, model id in the low half.
    Vendor(u32),
}

/// Publication parameters of one model instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelPublication {
    pub addr: MeshAddress,
    pub app_key_index: u16,
    pub ttl: u8,
    /// Encoded period: step resolution in the top 2 bits, steps below.
    pub period: u8,
    pub retransmit_count: u8,
    pub retransmit_interval_steps: u8,
    /// Use friendship credentials when publishing.
    pub friendship_cred: bool,
}

/// One model attached to an element.
#[derive(Debug, Clone)]
pub struct ModelInstance {
    pub model_id: ModelId,
    pub subscriptions: Vec<MeshAddress>,
    pub app_key_binds: Vec<u16>,
    pub publication: Option<ModelPublication>,
    subscr_cap: usize,
    bind_cap: usize,
}

impl ModelInstance {
    fn new(model_id: ModelId, subscr_cap: usize, bind_cap: usize) -> Self {
        Self {
            model_id,
            subscriptions: Vec::with_capacity(subscr_cap),
            app_key_binds: Vec::with_capacity(bind_cap),
            publication: None,
            subscr_cap,
            bind_cap,
        }
    }

    /// Adds a subscription address; idempotent.
    pub fn subscribe(&mut self, addr: MeshAddress) -> Result<bool, LocalCfgError> {
        if self.subscriptions.contains(&addr) {
            return Ok(false);
        }
        if self.subscriptions.len() >= self.subscr_cap {
            return Err(LocalCfgError::ListFull);
        }
        self.subscriptions.push(addr);
        Ok(true)
    }

    /// Removes a subscription; `Ok(true)` when it existed.
    pub fn unsubscribe(&mut self, addr: MeshAddress) -> bool {
        let before = self.subscriptions.len();
        self.subscriptions.retain(|a| *a != addr);
        before != self.subscriptions.len()
    }

    pub fn bind_app_key(&mut self, app_key_index: u16) -> Result<(), LocalCfgError> {
        if self.app_key_binds.contains(&app_key_index) {
            return Ok(());
        }
        if self.app_key_binds.len() >= self.bind_cap {
            return Err(LocalCfgError::ListFull);
        }
        self.app_key_binds.push(app_key_index);
        Ok(())
    }

    pub fn unbind_app_key(&mut self, app_key_index: u16) {
        self.app_key_binds.retain(|i| *i != app_key_index);
    }
}

/// Per-element sequence number state. `next` is the next value to hand out;
/// `persisted_ceiling` is the highest value covered by the NVM threshold.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SeqState {
    pub next: SeqNumber,
    pub persisted_ceiling: SeqNumber,
}

/// One addressable element.
#[derive(Debug, Clone)]
pub struct Element {
    pub addr: MeshAddress,
    pub location: u16,
    pub models: Vec<ModelInstance>,
    pub seq: SeqState,
}

impl Element {
    pub fn from_config(cfg: &ElementConfig, addr: MeshAddress) -> Self {
        let models = cfg
            .sig_models
            .iter()
            .map(|id| ModelId::Sig(*id))
            .chain(cfg.vendor_models.iter().map(|id| ModelId::Vendor(*id)))
            .map(|id| {
                ModelInstance::new(id, cfg.subscr_list_size, cfg.app_key_bind_list_size)
            })
            .collect();
        Self {
            addr,
            location: cfg.location,
            models,
            seq: SeqState { next: 0, persisted_ceiling: 0 },
        }
    }

    pub fn model(&self, pos: u8) -> Result<&ModelInstance, LocalCfgError> {
        self.models.get(pos as usize).ok_or(LocalCfgError::UnknownIndex)
    }

    pub fn model_mut(&mut self, pos: u8) -> Result<&mut ModelInstance, LocalCfgError> {
        self.models.get_mut(pos as usize).ok_or(LocalCfgError::UnknownIndex)
    }

    /// Hands out the next sequence number, or fails permanently at
    /// exhaustion. The caller persists thresholds.
    pub fn seq_alloc(&mut self) -> Result<SeqNumber, LocalCfgError> {
        if self.seq.next > MESH_SEQ_MAX_VAL {
            return Err(LocalCfgError::SeqExhausted);
        }
        let seq = self.seq.next;
        self.seq.next += 1;
        Ok(seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn element() -> Element {
        Element::from_config(
            &ElementConfig {
                location: 1,
                sig_models: vec![0x1000, 0x1001],
                vendor_models: vec![0x00A8_0001],
                subscr_list_size: 2,
                app_key_bind_list_size: 1,
            },
            0x0042,
        )
    }

    #[test]
    fn models_from_config() {
        let e = element();
        assert_eq!(e.models.len(), 3);
        assert_eq!(e.models[0].model_id, ModelId::Sig(0x1000));
        assert_eq!(e.models[2].model_id, ModelId::Vendor(0x00A8_0001));
    }

    #[test]
    fn subscription_caps_and_idempotence() {
        let mut e = element();
        let m = e.model_mut(0).expect("model");
        assert!(m.subscribe(0xC000).expect("sub"));
        assert!(!m.subscribe(0xC000).expect("idempotent"));
        assert!(m.subscribe(0xC001).expect("sub"));
        assert_eq!(m.subscribe(0xC002), Err(LocalCfgError::ListFull));
        assert!(m.unsubscribe(0xC000));
        assert!(!m.unsubscribe(0xC000));
    }

    #[test]
    fn seq_exhaustion_is_fatal() {
        let mut e = element();
        e.seq.next = MESH_SEQ_MAX_VAL;
        assert_eq!(e.seq_alloc().expect("last seq"), MESH_SEQ_MAX_VAL);
        assert_eq!(e.seq_alloc(), Err(LocalCfgError::SeqExhausted));
    }
}
