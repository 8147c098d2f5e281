// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use mesh_node_rs::{
    nvm::InMemoryNvm,
    replay::{
        rpl::{ReplayProtection, RplVerdict},
        sar_history::{HistoryVerdict, SarRxHistory},
    },
};
use rand::RngExt;

/// Accepted SeqAuth values per source never decrease, whatever order the
/// traffic arrives in.
#[test]
fn rpl_monotonicity_under_random_traffic() {
    let mut rpl = ReplayProtection::new(8, Arc::new(InMemoryNvm::new()));
    let mut rng = rand::rng();
    let mut highest: Option<(u32, u32)> = None;

    for _ in 0..2000 {
        let iv: u32 = rng.random_range(0..3);
        let seq: u32 = rng.random_range(0..0x2000);
        let verdict = rpl.check_and_update(0x0002, iv, seq);
        match verdict {
            RplVerdict::Accept => {
                assert!(
                    highest.is_none_or(|h| (iv, seq) > h),
                    "accepted ({iv},{seq}) not above {highest:?}"
                );
                highest = Some((iv, seq));
            },
            RplVerdict::Drop => {
                assert!(
                    highest.is_some_and(|h| (iv, seq) <= h),
                    "dropped ({iv},{seq}) above {highest:?}"
                );
            },
        }
    }
}

#[test]
fn rpl_independent_per_source() {
    let mut rpl = ReplayProtection::new(8, Arc::new(InMemoryNvm::new()));
    assert_eq!(rpl.check_and_update(0x0002, 0, 100), RplVerdict::Accept);
    assert_eq!(rpl.check_and_update(0x0003, 0, 1), RplVerdict::Accept);
    assert_eq!(rpl.check_and_update(0x0003, 0, 2), RplVerdict::Accept);
    assert_eq!(rpl.check_and_update(0x0002, 0, 99), RplVerdict::Drop);
}

/// The history is a bounded FIFO: survivors are always the most recent
/// completions, and a re-received completed transaction asks for a re-ack.
#[test]
fn history_fifo_keeps_newest() {
    let mut hist = SarRxHistory::new(3);
    for i in 0..6u32 {
        let src = 0x0010 + i as u16;
        hist.add(src, 0x000100 * (i + 1), 0, 2, false, true);
    }
    // Only the last three survive.
    for i in 0..3u32 {
        let src = 0x0010 + i as u16;
        assert_eq!(
            hist.check(src, 0x000100 * (i + 1), (0x000100 * (i + 1) & 0x1FFF) as u16, 0, 2),
            HistoryVerdict::Unknown,
            "entry {i} should have been evicted"
        );
    }
    for i in 3..6u32 {
        let src = 0x0010 + i as u16;
        assert_eq!(
            hist.check(src, 0x000100 * (i + 1), (0x000100 * (i + 1) & 0x1FFF) as u16, 0, 2),
            HistoryVerdict::CurrentCompleted { obo: false },
            "entry {i} should still re-ack"
        );
    }
}

#[test]
fn history_obo_flag_survives() {
    let mut hist = SarRxHistory::new(4);
    hist.add(0x0002, 0x000100, 0, 3, true, true);
    assert_eq!(
        hist.check(0x0002, 0x000101, 0x0100, 0, 3),
        HistoryVerdict::CurrentCompleted { obo: true }
    );
}
