// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use bytes::Bytes;
use mesh_node_rs::{
    cfg::{
        cli::{config_path_from_args, resolve_config_path},
        config::Config,
        enums::FeatureState,
        logger::init_logger,
    },
    crypto::stub::StubSecurity,
    node::{
        self,
        bearer::{Bearer, IfaceId},
        msg::{IfaceEvent, NodeCommand, NodeFeature},
    },
    nvm::InMemoryNvm,
};
use once_cell::sync::OnceCell;
use tokio::time::sleep;
use tracing::info;

/// Wires two in-process nodes back to back: whatever one node emits, the
/// other receives on the same interface id.
struct CrossBearer {
    peer: OnceCell<node::NodeHandle>,
    rssi: i8,
}

impl CrossBearer {
    fn new(rssi: i8) -> Self {
        Self { peer: OnceCell::new(), rssi }
    }
}

impl Bearer for CrossBearer {
    fn send(&self, iface: IfaceId, pdu: Bytes, _priority: bool) -> Result<()> {
        if let Some(peer) = self.peer.get() {
            peer.bearer_rx(iface, pdu, self.rssi);
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _logger_guard = init_logger("tests/config_logger.yaml")?;

    let cfg_path = config_path_from_args("tests/config.yaml");
    let cfg = resolve_config_path(&cfg_path)
        .and_then(Config::load_from_file)
        .context("failed to resolve or load config")?;

    let crypto = Arc::new(StubSecurity);

    // Friend node at 0x0001, low-power node at 0x0100.
    let friend_bearer = Arc::new(CrossBearer::new(-40));
    let lpn_bearer = Arc::new(CrossBearer::new(-40));

    let mut friend_cfg = cfg.clone();
    friend_cfg.features.friend = FeatureState::Enabled;
    let (friend, mut friend_events) = node::start(
        friend_cfg,
        0x0001,
        [0x11; 16],
        crypto.clone(),
        Arc::new(InMemoryNvm::new()),
        friend_bearer.clone(),
    )?;

    let mut lpn_cfg = cfg.clone();
    lpn_cfg.features.low_power = FeatureState::Enabled;
    let (lpn, mut lpn_events) = node::start(
        lpn_cfg,
        0x0100,
        [0x22; 16],
        crypto,
        Arc::new(InMemoryNvm::new()),
        lpn_bearer.clone(),
    )?;

    let _ = friend_bearer.peer.set(lpn.clone());
    let _ = lpn_bearer.peer.set(friend.clone());

    for handle in [&friend, &lpn] {
        handle.iface_event(IfaceEvent::Added(0));
        handle.command(NodeCommand::AddNetKey { net_key_index: 0, key: [0x42; 16] });
    }
    friend.command(NodeCommand::SetFeature {
        feature: NodeFeature::Friend,
        state: FeatureState::Enabled,
    });
    lpn.command(NodeCommand::SetFeature {
        feature: NodeFeature::LowPower,
        state: FeatureState::Enabled,
    });
    lpn.command(NodeCommand::EstablishFriendship { net_key_index: 0 });

    tokio::spawn(async move {
        while let Some(ev) = friend_events.recv().await {
            info!(?ev, "friend node event");
        }
    });
    tokio::spawn(async move {
        while let Some(ev) = lpn_events.recv().await {
            info!(?ev, "lpn node event");
        }
    });

    sleep(Duration::from_secs(10)).await;

    friend.shutdown();
    lpn.shutdown();
    Ok(())
}
