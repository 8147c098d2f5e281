// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Friend Update PDU (opcode `0x02`, 6 bytes: Flags ‖ IVIndex(4, BE) ‖ MD).

use anyhow::{Result, bail};
use bitflags::bitflags;
use zerocopy::{
    BigEndian, FromBytes as ZFromBytes, Immutable, IntoBytes, KnownLayout, U32,
};

/// Friend Update parameter length.
pub const FRIEND_UPDATE_NUM_BYTES: usize = 6;

bitflags! {
    /// Subnet state flags mirrored from the Secure Network Beacon.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct UpdateFlags: u8 {
        /// Key refresh phase 2 in progress on the subnet.
        const KEY_REFRESH = 0x01;
        /// IV update in progress on the subnet.
        const IV_UPDATE = 0x02;
    }
}

/// Raw Friend Update parameters.
#[repr(C)]
#[derive(Debug, Default, Clone, PartialEq, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct FriendUpdatePdu {
    pub flags: u8,                // 0
    pub iv_index: U32<BigEndian>, // 1..5
    pub md: u8,                   // 5
}

impl FriendUpdatePdu {
    pub fn new(flags: UpdateFlags, iv_index: u32, more_data: bool) -> Self {
        let mut pdu = Self {
            flags: flags.bits(),
            md: more_data as u8,
            ..Default::default()
        };
        pdu.iv_index.set(iv_index);
        pdu
    }

    pub fn from_bytes(buf: &[u8]) -> Result<&Self> {
        let (pdu, rest) = Self::ref_from_prefix(buf)
            .map_err(|e| anyhow::anyhow!("failed to read friend update: {e}"))?;
        if !rest.is_empty() {
            bail!("friend update carries trailing bytes");
        }
        if pdu.md > 1 {
            bail!("prohibited MD value {}", pdu.md);
        }
        Ok(pdu)
    }

    #[inline]
    pub fn update_flags(&self) -> UpdateFlags {
        UpdateFlags::from_bits_truncate(self.flags)
    }

    #[inline]
    pub fn more_data(&self) -> bool {
        self.md == 1
    }
}

#[cfg(test)]
mod tests {
    use hex_literal::hex;

    use super::*;

    #[test]
    fn layout_is_bit_exact() {
        let pdu = FriendUpdatePdu::new(UpdateFlags::IV_UPDATE, 0x1122_3344, true);
        assert_eq!(pdu.as_bytes(), hex!("02 11223344 01"));
    }

    #[test]
    fn prohibited_md_rejected() {
        assert!(FriendUpdatePdu::from_bytes(&hex!("00 00000000 02")).is_err());
    }
}
