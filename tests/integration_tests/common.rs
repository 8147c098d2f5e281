// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Shared plumbing for multi-node tests: a link-level bearer that models
//! radio adjacency between in-process nodes.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use mesh_node_rs::{
    cfg::{cli::resolve_config_path, config::Config},
    crypto::stub::StubSecurity,
    node::{
        self, NodeHandle,
        bearer::{Bearer, IfaceId},
        events::MeshEvent,
        msg::{IfaceEvent, NodeCommand},
    },
    nvm::InMemoryNvm,
};
use tokio::sync::mpsc::UnboundedReceiver;

pub fn sample_config() -> Config {
    resolve_config_path("tests/config.yaml")
        .and_then(Config::load_from_file)
        .expect("test config loads")
}

/// One node's radio: whatever it emits reaches its configured neighbors.
#[derive(Default)]
pub struct LinkBearer {
    neighbors: Mutex<Vec<NodeHandle>>,
    rssi: i8,
}

impl LinkBearer {
    pub fn new(rssi: i8) -> Arc<Self> {
        Arc::new(Self { neighbors: Mutex::new(Vec::new()), rssi })
    }

    pub fn link(&self, peer: NodeHandle) {
        self.neighbors.lock().expect("bearer lock").push(peer);
    }
}

impl Bearer for LinkBearer {
    fn send(&self, iface: IfaceId, pdu: Bytes, _priority: bool) -> Result<()> {
        for peer in self.neighbors.lock().expect("bearer lock").iter() {
            peer.bearer_rx(iface, pdu.clone(), self.rssi);
        }
        Ok(())
    }
}

pub struct TestNode {
    pub handle: NodeHandle,
    pub events: UnboundedReceiver<MeshEvent>,
    pub bearer: Arc<LinkBearer>,
}

/// Boots a node with the stub crypto, fresh NVM and one interface.
pub fn boot_node(cfg: Config, primary_addr: u16, device_key: [u8; 16]) -> TestNode {
    let bearer = LinkBearer::new(-45);
    let (handle, events) = node::start(
        cfg,
        primary_addr,
        device_key,
        Arc::new(StubSecurity),
        Arc::new(InMemoryNvm::new()),
        bearer.clone(),
    )
    .expect("node starts");
    handle.iface_event(IfaceEvent::Added(0));
    handle.command(NodeCommand::AddNetKey { net_key_index: 0, key: [0x42; 16] });
    TestNode { handle, events, bearer }
}

/// Waits for a matching event, skipping others, within simulated time.
pub async fn expect_event<F>(
    events: &mut UnboundedReceiver<MeshEvent>,
    what: &str,
    mut matches: F,
) -> MeshEvent
where
    F: FnMut(&MeshEvent) -> bool,
{
    let deadline = Duration::from_secs(120);
    tokio::time::timeout(deadline, async {
        loop {
            match events.recv().await {
                Some(ev) if matches(&ev) => return ev,
                Some(_) => {},
                None => panic!("event channel closed while waiting for {what}"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
}
