// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Shared mesh primitives: addresses, sequence numbers and PDU size limits.
//!
//! A mesh address is a 16-bit value partitioned by its top bits:
//!
//! ```text
//! 0x0000             unassigned
//! 0x0001..0x7FFF     unicast (owns sequence numbers)
//! 0x8000..0xBFFF     virtual (derived from a label UUID)
//! 0xC000..0xFFFF     group, top values reserved for fixed groups
//! ```

use serde::{Deserialize, Serialize};

/// 16-bit mesh address.
pub type MeshAddress = u16;

/// 24-bit sequence number carried in every network PDU.
pub type SeqNumber = u32;

/// Unassigned address.
pub const MESH_ADDR_UNASSIGNED: MeshAddress = 0x0000;
/// All-proxies fixed group address.
pub const MESH_ADDR_GROUP_PROXY: MeshAddress = 0xFFFC;
/// All-friends fixed group address.
pub const MESH_ADDR_GROUP_FRIEND: MeshAddress = 0xFFFD;
/// All-relays fixed group address.
pub const MESH_ADDR_GROUP_RELAY: MeshAddress = 0xFFFE;
/// All-nodes fixed group address.
pub const MESH_ADDR_GROUP_ALL: MeshAddress = 0xFFFF;

/// Maximum value of the 24-bit sequence number space.
pub const MESH_SEQ_MAX_VAL: SeqNumber = 0x00FF_FFFF;
/// Mask selecting the low 13 bits of a SEQ, the SeqZero of a transaction.
pub const MESH_SEQ_ZERO_MASK: u32 = 0x0000_1FFF;

/// Network PDU header length: IVI|NID, CTL|TTL, SEQ(3), SRC(2), DST(2).
pub const MESH_NWK_HEADER_LEN: usize = 9;
/// Smallest well-formed network PDU (header + 1-byte LTR PDU + 32-bit NetMIC).
pub const MESH_NWK_MIN_PDU_LEN: usize = 14;
/// Largest network PDU carried by the advertising bearer.
pub const MESH_NWK_MAX_PDU_LEN: usize = 29;
/// NetMIC length for access PDUs.
pub const MESH_NETMIC_SIZE_ACC: usize = 4;
/// NetMIC length for control PDUs.
pub const MESH_NETMIC_SIZE_CTL: usize = 8;

/// 128-bit key size used by every mesh key type.
pub const MESH_KEY_SIZE_128: usize = 16;
/// Label UUID size for virtual addresses.
pub const MESH_LABEL_UUID_SIZE: usize = 16;
/// Highest valid 12-bit key index.
pub const MESH_KEY_INDEX_MAX_VAL: u16 = 0x0FFF;

/// Classification of a mesh address by its top bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressType {
    Unassigned,
    Unicast,
    Virtual,
    Group,
}

/// Returns the [`AddressType`] of `addr`.
#[inline]
pub fn address_type(addr: MeshAddress) -> AddressType {
    match addr {
        0x0000 => AddressType::Unassigned,
        0x0001..=0x7FFF => AddressType::Unicast,
        0x8000..=0xBFFF => AddressType::Virtual,
        _ => AddressType::Group,
    }
}

#[inline]
pub fn is_unicast(addr: MeshAddress) -> bool {
    address_type(addr) == AddressType::Unicast
}

#[inline]
pub fn is_group(addr: MeshAddress) -> bool {
    address_type(addr) == AddressType::Group
}

#[inline]
pub fn is_virtual(addr: MeshAddress) -> bool {
    address_type(addr) == AddressType::Virtual
}

/// Group or virtual, the multicast half of the address space.
#[inline]
pub fn is_multicast(addr: MeshAddress) -> bool {
    matches!(address_type(addr), AddressType::Group | AddressType::Virtual)
}

/// 56-bit freshness tag ordering every transport message: IV Index
/// concatenated with the 24-bit SEQ. Compared as a tuple, never wrapped.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct SeqAuth {
    pub iv_index: u32,
    pub seq: SeqNumber,
}

impl SeqAuth {
    pub fn new(iv_index: u32, seq: SeqNumber) -> Self {
        Self { iv_index, seq }
    }

    /// Low two bits of the IV Index, the granularity at which freshness
    /// caches distinguish IV phases.
    #[inline]
    pub fn ivi_lsb(&self) -> u8 {
        (self.iv_index & 0x03) as u8
    }

    /// SeqZero value derived from this SeqAuth's SEQ.
    #[inline]
    pub fn seq_zero(&self) -> u16 {
        (self.seq & MESH_SEQ_ZERO_MASK) as u16
    }
}

/// Reconstructs the full 24-bit first-segment SEQ from a received segment's
/// SEQ and the 13-bit SeqZero: the largest value not exceeding `seq` whose
/// low 13 bits equal `seq_zero`.
pub fn seq_from_seq_zero(seq: SeqNumber, seq_zero: u16) -> SeqNumber {
    let seq_zero = u32::from(seq_zero) & MESH_SEQ_ZERO_MASK;
    if (seq & MESH_SEQ_ZERO_MASK) >= seq_zero {
        (seq & !MESH_SEQ_ZERO_MASK) | seq_zero
    } else {
        ((seq & !MESH_SEQ_ZERO_MASK) | seq_zero).wrapping_sub(MESH_SEQ_ZERO_MASK + 1)
            & MESH_SEQ_MAX_VAL
    }
}
