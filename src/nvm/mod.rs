// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Non-volatile storage collaborator: a byte-blob store keyed by dataset id.
//!
//! The core persists its freshness- and identity-critical state here (IV
//! state, sequence thresholds, replay list, key lists, heartbeat publication)
//! and restores it at boot. Application-layer datasets are opaque.

use anyhow::Result;
use bytes::Bytes;
use dashmap::DashMap;

/// Dataset identifier.
pub type DatasetId = u64;

/// IV Index and update-in-progress flag.
pub const DATASET_IV_STATE: DatasetId = 0x0001;
/// Per-element sequence number thresholds.
pub const DATASET_SEQ_THRESHOLDS: DatasetId = 0x0002;
/// Replay protection list snapshot.
pub const DATASET_RPL: DatasetId = 0x0003;
/// NetKey list with refresh phases.
pub const DATASET_NET_KEYS: DatasetId = 0x0004;
/// AppKey list with bindings.
pub const DATASET_APP_KEYS: DatasetId = 0x0005;
/// Device key.
pub const DATASET_DEV_KEY: DatasetId = 0x0006;
/// Model publication parameters.
pub const DATASET_PUBLICATIONS: DatasetId = 0x0007;
/// Element subscription lists.
pub const DATASET_SUBSCRIPTIONS: DatasetId = 0x0008;
/// Heartbeat publication state.
pub const DATASET_HB_PUB: DatasetId = 0x0009;

/// Storage capability handed to the node at boot.
pub trait NvmStore: Send + Sync {
    fn read(&self, dataset: DatasetId) -> Option<Bytes>;
    fn write(&self, dataset: DatasetId, data: &[u8]) -> Result<()>;
    fn erase(&self, dataset: DatasetId) -> Result<()>;
    /// Node reset: every core dataset is wiped.
    fn erase_all(&self) -> Result<()>;
}

/// Default in-memory store; state survives for the process lifetime only.
#[derive(Debug, Default)]
pub struct InMemoryNvm {
    datasets: DashMap<DatasetId, Bytes>,
}

impl InMemoryNvm {
    pub fn new() -> Self {
        Self::default()
    }
}

impl NvmStore for InMemoryNvm {
    fn read(&self, dataset: DatasetId) -> Option<Bytes> {
        self.datasets.get(&dataset).map(|e| e.value().clone())
    }

    fn write(&self, dataset: DatasetId, data: &[u8]) -> Result<()> {
        self.datasets.insert(dataset, Bytes::copy_from_slice(data));
        Ok(())
    }

    fn erase(&self, dataset: DatasetId) -> Result<()> {
        self.datasets.remove(&dataset);
        Ok(())
    }

    fn erase_all(&self) -> Result<()> {
        self.datasets.clear();
        Ok(())
    }
}
