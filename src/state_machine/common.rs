// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Event-driven state machine scaffolding shared by the friendship roles.
//!
//! A context never blocks: every handler consumes one event and returns a
//! [`Transition`]; waits are timers whose expiry feeds the next event in.

/// Outcome of feeding one event to a state machine context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition<S> {
    /// Move to a new state.
    Next(S),
    /// Event consumed, state unchanged.
    Stay,
    /// Context is finished; the owner tears it down.
    Done,
}

impl<S> Transition<S> {
    /// Applies the transition to a state slot and reports whether the
    /// context survives.
    pub fn apply(self, state: &mut S) -> bool {
        match self {
            Transition::Next(next) => {
                *state = next;
                true
            },
            Transition::Stay => true,
            Transition::Done => false,
        }
    }
}
