// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Friend Poll PDU (opcode `0x01`, 1 byte: RFU(7) ‖ FSN).

use anyhow::{Result, bail};

const FSN_MASK: u8 = 0x01;

/// Friend Poll parameter length.
pub const FRIEND_POLL_NUM_BYTES: usize = 1;

/// Decoded Friend Poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FriendPollPdu {
    /// Friend Sequence Number, a single-bit delivery acknowledgement toggle.
    pub fsn: bool,
}

impl FriendPollPdu {
    pub fn parse(params: &[u8]) -> Result<Self> {
        if params.len() != FRIEND_POLL_NUM_BYTES {
            bail!("friend poll needs 1 byte, got {}", params.len());
        }
        if params[0] & !FSN_MASK != 0 {
            bail!("friend poll RFU bits set: 0x{:02x}", params[0]);
        }
        Ok(Self { fsn: (params[0] & FSN_MASK) != 0 })
    }

    pub fn to_bytes(self) -> [u8; FRIEND_POLL_NUM_BYTES] {
        [self.fsn as u8]
    }
}
