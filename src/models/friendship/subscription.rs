// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Friend Subscription List Add/Remove/Confirm PDUs (opcodes
//! `0x07`/`0x08`/`0x09`).
//!
//! Add/Remove carry `TransactionNumber ‖ N × Address(BE)` for `1 ≤ N ≤ 5`;
//! Confirm echoes the transaction number alone.

use anyhow::{Result, bail, ensure};

use crate::models::{
    common::{MeshAddress, is_multicast},
    friendship::SUBSCR_LIST_MAX_ADDR,
};

/// Friend Subscription List Confirm parameter length.
pub const FRIEND_SUBSCR_CNF_NUM_BYTES: usize = 1;

/// Decoded Subscription List Add or Remove.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FriendSubscrListPdu {
    pub trans_num: u8,
    pub addresses: Vec<MeshAddress>,
}

impl FriendSubscrListPdu {
    pub fn new(trans_num: u8, addresses: Vec<MeshAddress>) -> Self {
        debug_assert!(addresses.len() <= SUBSCR_LIST_MAX_ADDR);
        Self { trans_num, addresses }
    }

    pub fn parse(params: &[u8]) -> Result<Self> {
        ensure!(!params.is_empty(), "empty subscription list PDU");
        // Odd total length: 1 transaction byte plus 2 bytes per address.
        if params.len() % 2 != 1 {
            bail!("subscription list length {} not odd", params.len());
        }
        let count = (params.len() - 1) / 2;
        if count == 0 || count > SUBSCR_LIST_MAX_ADDR {
            bail!("subscription list carries {count} addresses");
        }
        let mut addresses = Vec::with_capacity(count);
        for chunk in params[1..].chunks_exact(2) {
            let addr = u16::from_be_bytes([chunk[0], chunk[1]]);
            if !is_multicast(addr) {
                bail!("subscription address 0x{addr:04x} is not group or virtual");
            }
            addresses.push(addr);
        }
        Ok(Self { trans_num: params[0], addresses })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + 2 * self.addresses.len());
        out.push(self.trans_num);
        for addr in &self.addresses {
            out.extend_from_slice(&addr.to_be_bytes());
        }
        out
    }
}

/// Decoded Subscription List Confirm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FriendSubscrCnfPdu {
    pub trans_num: u8,
}

impl FriendSubscrCnfPdu {
    pub fn parse(params: &[u8]) -> Result<Self> {
        ensure!(
            params.len() == FRIEND_SUBSCR_CNF_NUM_BYTES,
            "subscription confirm needs 1 byte, got {}",
            params.len()
        );
        Ok(Self { trans_num: params[0] })
    }

    pub fn to_bytes(self) -> [u8; FRIEND_SUBSCR_CNF_NUM_BYTES] {
        [self.trans_num]
    }
}
