// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

pub mod cfg;
pub mod crypto;
pub mod friend;
pub mod local_config;
pub mod lower_transport;
pub mod lpn;
pub mod models;
pub mod network;
pub mod node;
pub mod nvm;
pub mod replay;
pub mod state_machine;
pub mod upper_transport;
pub mod utils;
