// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Friend Request PDU (opcode `0x03`, 10 bytes).
//!
//! ```text
//!  octet 0: Criteria = RFU(1) ‖ RSSIFactor(2) ‖ ReceiveWindowFactor(2) ‖ MinQueueSizeLog(3)
//!  octet 1: ReceiveDelay (ms)
//!  octets 2..5: PollTimeout (100 ms units, 3 bytes BE)
//!  octets 5..7: PreviousAddress
//!  octet 7: NumElements
//!  octets 8..10: LPNCounter
//! ```

use anyhow::{Result, bail};
use zerocopy::{
    BigEndian, FromBytes as ZFromBytes, Immutable, IntoBytes, KnownLayout, U16,
};

use crate::models::{
    common::{MESH_ADDR_UNASSIGNED, MeshAddress, is_unicast},
    friendship::{POLL_TIMEOUT_MAX, POLL_TIMEOUT_MIN, RECV_DELAY_MS_MIN},
};

/// Friend Request parameter length.
pub const FRIEND_REQUEST_NUM_BYTES: usize = 10;

const MIN_QUEUE_SIZE_LOG_MASK: u8 = 0x07;
const RECV_WIN_FACTOR_SHIFT: u8 = 3;
const RSSI_FACTOR_SHIFT: u8 = 5;
const FACTOR_MASK: u8 = 0x03;

/// Unpacked Criteria octet. Factors encode ×1, ×1.5, ×2, ×2.5 as 0..=3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FriendshipCriteria {
    pub rssi_factor: u8,
    pub recv_win_factor: u8,
    pub min_queue_size_log: u8,
}

impl FriendshipCriteria {
    pub fn parse(byte: u8) -> Result<Self> {
        let crit = Self {
            rssi_factor: (byte >> RSSI_FACTOR_SHIFT) & FACTOR_MASK,
            recv_win_factor: (byte >> RECV_WIN_FACTOR_SHIFT) & FACTOR_MASK,
            min_queue_size_log: byte & MIN_QUEUE_SIZE_LOG_MASK,
        };
        if crit.min_queue_size_log == 0 {
            bail!("prohibited MinQueueSizeLog 0");
        }
        Ok(crit)
    }

    pub fn to_byte(self) -> u8 {
        ((self.rssi_factor & FACTOR_MASK) << RSSI_FACTOR_SHIFT)
            | ((self.recv_win_factor & FACTOR_MASK) << RECV_WIN_FACTOR_SHIFT)
            | (self.min_queue_size_log & MIN_QUEUE_SIZE_LOG_MASK)
    }

    /// Smallest Friend Queue the LPN will accept.
    #[inline]
    pub fn min_queue_size(self) -> u16 {
        1u16 << self.min_queue_size_log
    }
}

/// Raw Friend Request parameters.
#[repr(C)]
#[derive(Debug, Default, Clone, PartialEq, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct FriendRequestPdu {
    pub criteria: u8,                 // 0
    pub recv_delay_ms: u8,            // 1
    pub poll_timeout: [u8; 3],        // 2..5
    pub prev_addr: U16<BigEndian>,    // 5..7
    pub num_elements: u8,             // 7
    pub lpn_counter: U16<BigEndian>,  // 8..10
}

impl FriendRequestPdu {
    pub fn new(
        criteria: FriendshipCriteria,
        recv_delay_ms: u8,
        poll_timeout: u32,
        prev_addr: MeshAddress,
        num_elements: u8,
        lpn_counter: u16,
    ) -> Self {
        let mut pdu = Self {
            criteria: criteria.to_byte(),
            recv_delay_ms,
            num_elements,
            ..Default::default()
        };
        pdu.set_poll_timeout(poll_timeout);
        pdu.prev_addr.set(prev_addr);
        pdu.lpn_counter.set(lpn_counter);
        pdu
    }

    pub fn from_bytes(buf: &[u8]) -> Result<&Self> {
        let (pdu, rest) = Self::ref_from_prefix(buf)
            .map_err(|e| anyhow::anyhow!("failed to read friend request: {e}"))?;
        if !rest.is_empty() {
            bail!("friend request carries trailing bytes");
        }
        Ok(pdu)
    }

    /// Poll Timeout in 100 ms units.
    #[inline]
    pub fn poll_timeout(&self) -> u32 {
        u32::from_be_bytes([
            0,
            self.poll_timeout[0],
            self.poll_timeout[1],
            self.poll_timeout[2],
        ])
    }

    #[inline]
    pub fn set_poll_timeout(&mut self, steps: u32) {
        let be = steps.to_be_bytes();
        self.poll_timeout = [be[1], be[2], be[3]];
    }

    /// Checks every field constraint a Friend must enforce before
    /// considering the request.
    pub fn validate(&self) -> Result<FriendshipCriteria> {
        let criteria = FriendshipCriteria::parse(self.criteria)?;
        if self.recv_delay_ms < RECV_DELAY_MS_MIN {
            bail!("receive delay {} below minimum", self.recv_delay_ms);
        }
        let pt = self.poll_timeout();
        if !(POLL_TIMEOUT_MIN..=POLL_TIMEOUT_MAX).contains(&pt) {
            bail!("poll timeout 0x{pt:06x} out of range");
        }
        let prev = self.prev_addr.get();
        if prev != MESH_ADDR_UNASSIGNED && !is_unicast(prev) {
            bail!("previous friend address 0x{prev:04x} is not unicast");
        }
        if self.num_elements == 0 {
            bail!("LPN reports zero elements");
        }
        Ok(criteria)
    }
}
