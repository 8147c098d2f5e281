// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Heartbeat control PDU (opcode `0x0A`, 3 bytes:
//! RFU(1) ‖ InitTTL(7) ‖ Features(2, BE)).

use anyhow::{Result, ensure};
use bitflags::bitflags;

/// Heartbeat parameter length.
pub const HEARTBEAT_NUM_BYTES: usize = 3;

const INIT_TTL_MASK: u8 = 0x7F;

bitflags! {
    /// Node feature bitmap carried in heartbeats and in the composition data.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FeaturesBitmap: u16 {
        const RELAY = 0x0001;
        const PROXY = 0x0002;
        const FRIEND = 0x0004;
        const LOW_POWER = 0x0008;
    }
}

/// Decoded heartbeat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeartbeatPdu {
    /// TTL the publisher stamped on the network PDU; the hop count is
    /// recovered as `init_ttl - received_ttl + 1`.
    pub init_ttl: u8,
    pub features: FeaturesBitmap,
}

impl HeartbeatPdu {
    pub fn parse(params: &[u8]) -> Result<Self> {
        ensure!(
            params.len() == HEARTBEAT_NUM_BYTES,
            "heartbeat needs {HEARTBEAT_NUM_BYTES} bytes, got {}",
            params.len()
        );
        Ok(Self {
            init_ttl: params[0] & INIT_TTL_MASK,
            features: FeaturesBitmap::from_bits_truncate(u16::from_be_bytes([
                params[1], params[2],
            ])),
        })
    }

    pub fn to_bytes(self) -> [u8; HEARTBEAT_NUM_BYTES] {
        let features = self.features.bits().to_be_bytes();
        [self.init_ttl & INIT_TTL_MASK, features[0], features[1]]
    }
}
