// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Friend Offer PDU (opcode `0x04`, 6 bytes).

use anyhow::{Result, bail};
use zerocopy::{
    BigEndian, FromBytes as ZFromBytes, Immutable, IntoBytes, KnownLayout, U16,
};

/// Friend Offer parameter length.
pub const FRIEND_OFFER_NUM_BYTES: usize = 6;

/// Raw Friend Offer parameters: receive window, queue size, request RSSI,
/// subscription list size, friend counter.
#[repr(C)]
#[derive(Debug, Default, Clone, PartialEq, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct FriendOfferPdu {
    pub recv_win_ms: u8,                // 0
    pub queue_size: u8,                 // 1
    pub rssi: i8,                       // 2
    pub subscr_list_size: u8,           // 3
    pub friend_counter: U16<BigEndian>, // 4..6
}

impl FriendOfferPdu {
    pub fn new(
        recv_win_ms: u8,
        queue_size: u8,
        rssi: i8,
        subscr_list_size: u8,
        friend_counter: u16,
    ) -> Self {
        let mut pdu = Self {
            recv_win_ms,
            queue_size,
            rssi,
            subscr_list_size,
            ..Default::default()
        };
        pdu.friend_counter.set(friend_counter);
        pdu
    }

    pub fn from_bytes(buf: &[u8]) -> Result<&Self> {
        let (pdu, rest) = Self::ref_from_prefix(buf)
            .map_err(|e| anyhow::anyhow!("failed to read friend offer: {e}"))?;
        if !rest.is_empty() {
            bail!("friend offer carries trailing bytes");
        }
        if pdu.recv_win_ms == 0 {
            bail!("prohibited receive window 0");
        }
        Ok(pdu)
    }
}
