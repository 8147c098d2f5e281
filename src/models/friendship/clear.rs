// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Friend Clear and Friend Clear Confirm PDUs (opcodes `0x05`/`0x06`,
//! 4 bytes each: LPNAddress ‖ LPNCounter, big-endian).

use anyhow::{Result, bail};
use zerocopy::{
    BigEndian, FromBytes as ZFromBytes, Immutable, IntoBytes, KnownLayout, U16,
};

use crate::models::{
    common::{MeshAddress, is_unicast},
    friendship::MAX_LPN_COUNTER_WRAP_DIFF,
};

/// Friend Clear / Clear Confirm parameter length.
pub const FRIEND_CLEAR_NUM_BYTES: usize = 4;

/// Shared layout of Friend Clear and Friend Clear Confirm.
#[repr(C)]
#[derive(Debug, Default, Clone, PartialEq, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct FriendClearPdu {
    pub lpn_addr: U16<BigEndian>,    // 0..2
    pub lpn_counter: U16<BigEndian>, // 2..4
}

impl FriendClearPdu {
    pub fn new(lpn_addr: MeshAddress, lpn_counter: u16) -> Self {
        let mut pdu = Self::default();
        pdu.lpn_addr.set(lpn_addr);
        pdu.lpn_counter.set(lpn_counter);
        pdu
    }

    pub fn from_bytes(buf: &[u8]) -> Result<&Self> {
        let (pdu, rest) = Self::ref_from_prefix(buf)
            .map_err(|e| anyhow::anyhow!("failed to read friend clear: {e}"))?;
        if !rest.is_empty() {
            bail!("friend clear carries trailing bytes");
        }
        if !is_unicast(pdu.lpn_addr.get()) {
            bail!("friend clear LPN address 0x{:04x} is not unicast", pdu.lpn_addr.get());
        }
        Ok(pdu)
    }
}

/// Counter match used when processing a Friend Clear against an active
/// friendship: the received counter must not lag the stored one and may run
/// ahead only within the wrap window.
#[inline]
pub fn lpn_counter_matches(stored: u16, received: u16) -> bool {
    received.wrapping_sub(stored) <= MAX_LPN_COUNTER_WRAP_DIFF
}
