// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! One-shot timers that resume state machines by posting a message.
//!
//! Handlers never block: every wait in the stack (receive delay, receive
//! window, ack timer, incomplete timer, poll cadence, retry backoff) is a
//! [`schedule`] whose expiry re-enters the handler queue. Cancellation is
//! cooperative; a cancelled or stale expiry is ignored by the generation
//! check at the receiving slot.

use std::time::Duration;

use tokio::{sync::mpsc::UnboundedSender, time::sleep};
use tokio_util::sync::CancellationToken;

use crate::node::msg::{MeshMsg, TimerEvent};

/// Cancellation handle for a scheduled timer. Dropping the handle does not
/// stop the timer; owners call [`TimerHandle::stop`] on teardown.
#[derive(Debug, Clone, Default)]
pub struct TimerHandle {
    cancel: Option<CancellationToken>,
}

impl TimerHandle {
    /// A handle with no timer behind it; `stop` is a no-op.
    pub fn idle() -> Self {
        Self::default()
    }

    pub fn stop(&mut self) {
        if let Some(token) = self.cancel.take() {
            token.cancel();
        }
    }

    pub fn is_armed(&self) -> bool {
        self.cancel.is_some()
    }
}

/// Arms a one-shot timer that posts `ev` to the handler queue after `delay`,
/// unless stopped first.
pub fn schedule(
    tx: &UnboundedSender<MeshMsg>,
    delay: Duration,
    ev: TimerEvent,
) -> TimerHandle {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let tx = tx.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = token.cancelled() => {},
            _ = sleep(delay) => {
                // The handler may already be gone on shutdown.
                let _ = tx.send(MeshMsg::Timer(ev));
            },
        }
    });
    TimerHandle { cancel: Some(cancel) }
}

/// Restarts a timer slot: stops whatever ran before and arms a fresh one.
pub fn restart(
    slot: &mut TimerHandle,
    tx: &UnboundedSender<MeshMsg>,
    delay: Duration,
    ev: TimerEvent,
) {
    slot.stop();
    *slot = schedule(tx, delay, ev);
}
