// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use mesh_node_rs::{
    cfg::{cli::resolve_config_path, config::Config},
    local_config::store::LocalConfig,
    nvm::InMemoryNvm,
};

/// Loads the checked-in small-node configuration.
pub fn sample_config() -> Config {
    resolve_config_path("tests/config.yaml")
        .and_then(Config::load_from_file)
        .expect("test config loads")
}

/// Fresh store with the sample config, primary address 0x0042.
pub fn sample_store() -> LocalConfig {
    LocalConfig::new(
        &sample_config(),
        0x0042,
        [0xDD; 16],
        Arc::new(InMemoryNvm::new()),
    )
}
