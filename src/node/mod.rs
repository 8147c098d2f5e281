// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Node runtime: the cooperative handler, its message and timer plumbing,
//! the bearer boundary and the application event stream.

pub mod bearer;
pub mod events;
pub mod msg;
pub mod runner;
pub mod timer;

pub use runner::{NodeHandle, start};
