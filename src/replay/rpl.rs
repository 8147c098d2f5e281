// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Replay Protection List.
//!
//! Bounded map from source unicast address to the highest SeqAuth accepted.
//! A full list refuses new sources: evicting would reopen the replay window
//! for the evicted address.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    models::common::{MeshAddress, SeqAuth, SeqNumber},
    nvm::{DATASET_RPL, NvmStore},
};

/// Outcome of the freshness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RplVerdict {
    Accept,
    Drop,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct RplEntry {
    src: MeshAddress,
    seq_auth: SeqAuth,
}

pub struct ReplayProtection {
    entries: Vec<RplEntry>,
    cap: usize,
    nvm: Arc<dyn NvmStore>,
}

impl ReplayProtection {
    pub fn new(cap: usize, nvm: Arc<dyn NvmStore>) -> Self {
        let mut rpl = Self { entries: Vec::with_capacity(cap), cap, nvm };
        rpl.restore();
        rpl
    }

    fn restore(&mut self) {
        if let Some(raw) = self.nvm.read(DATASET_RPL)
            && let Ok(entries) = serde_json::from_slice::<Vec<RplEntry>>(&raw)
        {
            self.entries = entries;
            self.entries.truncate(self.cap);
        }
    }

    fn persist(&self) {
        if let Ok(raw) = serde_json::to_vec(&self.entries)
            && let Err(e) = self.nvm.write(DATASET_RPL, &raw)
        {
            warn!("failed to persist replay list: {e}");
        }
    }

    /// Accepts iff the received SeqAuth strictly exceeds the stored one for
    /// `src`, then stores it. Unknown sources are admitted while capacity
    /// lasts; a full list refuses them.
    pub fn check_and_update(
        &mut self,
        src: MeshAddress,
        iv_index: u32,
        seq: SeqNumber,
    ) -> RplVerdict {
        let seq_auth = SeqAuth::new(iv_index, seq);
        if let Some(entry) = self.entries.iter_mut().find(|e| e.src == src) {
            if seq_auth <= entry.seq_auth {
                debug!(src, ?seq_auth, "replay drop");
                return RplVerdict::Drop;
            }
            entry.seq_auth = seq_auth;
            self.persist();
            return RplVerdict::Accept;
        }
        if self.entries.len() >= self.cap {
            debug!(src, "replay list full, refusing new source");
            return RplVerdict::Drop;
        }
        self.entries.push(RplEntry { src, seq_auth });
        self.persist();
        RplVerdict::Accept
    }

    /// IV Index roll-over: drops entries two or more IV values behind.
    pub fn iv_cleanup(&mut self, new_iv_index: u32) {
        let before = self.entries.len();
        self.entries
            .retain(|e| new_iv_index.wrapping_sub(e.seq_auth.iv_index) < 2);
        if self.entries.len() != before {
            self.persist();
        }
    }

    /// Node reset only.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.persist();
    }

    #[cfg(test)]
    pub(crate) fn stored(&self, src: MeshAddress) -> Option<SeqAuth> {
        self.entries.iter().find(|e| e.src == src).map(|e| e.seq_auth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nvm::InMemoryNvm;

    fn rpl(cap: usize) -> ReplayProtection {
        ReplayProtection::new(cap, Arc::new(InMemoryNvm::new()))
    }

    #[test]
    fn monotonic_per_source() {
        let mut rpl = rpl(4);
        assert_eq!(rpl.check_and_update(0x0002, 0, 5), RplVerdict::Accept);
        assert_eq!(rpl.check_and_update(0x0002, 0, 5), RplVerdict::Drop);
        assert_eq!(rpl.check_and_update(0x0002, 0, 4), RplVerdict::Drop);
        assert_eq!(rpl.check_and_update(0x0002, 0, 6), RplVerdict::Accept);
        // Higher IV dominates any SEQ.
        assert_eq!(rpl.check_and_update(0x0002, 1, 0), RplVerdict::Accept);
        assert_eq!(rpl.check_and_update(0x0002, 0, 100), RplVerdict::Drop);
        assert_eq!(rpl.stored(0x0002), Some(SeqAuth::new(1, 0)));
    }

    #[test]
    fn full_list_refuses_new_sources() {
        let mut rpl = rpl(1);
        assert_eq!(rpl.check_and_update(0x0002, 0, 1), RplVerdict::Accept);
        assert_eq!(rpl.check_and_update(0x0003, 0, 1), RplVerdict::Drop);
        // The resident source keeps working.
        assert_eq!(rpl.check_and_update(0x0002, 0, 2), RplVerdict::Accept);
    }

    #[test]
    fn iv_rollover_clears_stale_entries() {
        let mut rpl = rpl(4);
        rpl.check_and_update(0x0002, 0, 1);
        rpl.check_and_update(0x0003, 1, 1);
        rpl.iv_cleanup(2);
        assert!(rpl.stored(0x0002).is_none());
        assert!(rpl.stored(0x0003).is_some());
    }

    #[test]
    fn persisted_across_restart() {
        let nvm: Arc<dyn NvmStore> = Arc::new(InMemoryNvm::new());
        let mut first = ReplayProtection::new(4, Arc::clone(&nvm));
        first.check_and_update(0x0002, 0, 9);
        let mut second = ReplayProtection::new(4, nvm);
        assert_eq!(second.check_and_update(0x0002, 0, 9), RplVerdict::Drop);
        assert_eq!(second.check_and_update(0x0002, 0, 10), RplVerdict::Accept);
    }
}
