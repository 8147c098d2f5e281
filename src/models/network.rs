// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Network PDU header codec.
//!
//! The 9-byte header precedes the encrypted transport PDU and NetMIC:
//!
//! ```text
//! +-----+---------+-----+---------+--------+--------+--------+
//! | IVI |   NID   | CTL |   TTL   | SEQ(3) | SRC(2) | DST(2) |
//! | 1b  |   7b    | 1b  |   7b    |        |   BE   |   BE   |
//! +-----+---------+-----+---------+--------+--------+--------+
//! ```
//!
//! DST travels inside the encrypted region; SEQ, SRC and CTL|TTL are
//! obfuscated on the wire by XOR with a PECB derived from the privacy key.

use anyhow::{Result, bail};
use zerocopy::{
    BigEndian, FromBytes as ZFromBytes, Immutable, IntoBytes, KnownLayout, U16,
};

use crate::models::common::{
    MESH_NWK_HEADER_LEN, MeshAddress, SeqNumber,
};

/// Mask selecting the 7-bit NID from the first header octet.
const NID_MASK: u8 = 0b0111_1111;
/// Mask selecting the IVI bit from the first header octet.
const IVI_MASK: u8 = 0b1000_0000;
/// Mask selecting the 7-bit TTL from the second header octet.
const TTL_MASK: u8 = 0b0111_1111;
/// Mask selecting the CTL bit from the second header octet.
const CTL_MASK: u8 = 0b1000_0000;

/// Span of header bytes covered by obfuscation: CTL|TTL ‖ SEQ ‖ SRC.
pub const OBFUSCATED_SPAN: std::ops::Range<usize> = 1..7;

/// Raw 9-byte network PDU header.
#[repr(C)]
#[derive(Debug, Default, Clone, PartialEq, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct NwkPduHeader {
    pub ivi_nid: u8,          // 0
    pub ctl_ttl: u8,          // 1
    pub seq: [u8; 3],         // 2..5
    pub src: U16<BigEndian>,  // 5..7
    pub dst: U16<BigEndian>,  // 7..9
}

impl NwkPduHeader {
    pub fn new(
        ivi: bool,
        nid: u8,
        ctl: bool,
        ttl: u8,
        seq: SeqNumber,
        src: MeshAddress,
        dst: MeshAddress,
    ) -> Self {
        let mut hdr = Self::default();
        hdr.set_ivi(ivi);
        hdr.set_nid(nid);
        hdr.set_ctl(ctl);
        hdr.set_ttl(ttl);
        hdr.set_seq(seq);
        hdr.src.set(src);
        hdr.dst.set(dst);
        hdr
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < MESH_NWK_HEADER_LEN {
            bail!("network header needs {MESH_NWK_HEADER_LEN} bytes, got {}", buf.len());
        }
        Self::read_from_bytes(&buf[..MESH_NWK_HEADER_LEN])
            .map_err(|e| anyhow::anyhow!("failed to read network header: {e}"))
    }

    pub fn write_to(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() < MESH_NWK_HEADER_LEN {
            bail!("buffer too small for network header: {}", buf.len());
        }
        buf[..MESH_NWK_HEADER_LEN].copy_from_slice(self.as_bytes());
        Ok(())
    }

    #[inline]
    pub fn ivi(&self) -> bool {
        (self.ivi_nid & IVI_MASK) != 0
    }

    #[inline]
    pub fn set_ivi(&mut self, ivi: bool) {
        if ivi {
            self.ivi_nid |= IVI_MASK;
        } else {
            self.ivi_nid &= !IVI_MASK;
        }
    }

    #[inline]
    pub fn nid(&self) -> u8 {
        self.ivi_nid & NID_MASK
    }

    #[inline]
    pub fn set_nid(&mut self, nid: u8) {
        self.ivi_nid = (self.ivi_nid & IVI_MASK) | (nid & NID_MASK);
    }

    /// CTL bit: 1 for control PDUs (64-bit NetMIC), 0 for access PDUs.
    #[inline]
    pub fn ctl(&self) -> bool {
        (self.ctl_ttl & CTL_MASK) != 0
    }

    #[inline]
    pub fn set_ctl(&mut self, ctl: bool) {
        if ctl {
            self.ctl_ttl |= CTL_MASK;
        } else {
            self.ctl_ttl &= !CTL_MASK;
        }
    }

    #[inline]
    pub fn ttl(&self) -> u8 {
        self.ctl_ttl & TTL_MASK
    }

    #[inline]
    pub fn set_ttl(&mut self, ttl: u8) {
        self.ctl_ttl = (self.ctl_ttl & CTL_MASK) | (ttl & TTL_MASK);
    }

    #[inline]
    pub fn seq(&self) -> SeqNumber {
        u32::from_be_bytes([0, self.seq[0], self.seq[1], self.seq[2]])
    }

    #[inline]
    pub fn set_seq(&mut self, seq: SeqNumber) {
        let be = seq.to_be_bytes();
        self.seq = [be[1], be[2], be[3]];
    }
}

/// XORs the privacy ECB over the obfuscated header span, in place. The same
/// operation both obfuscates on TX and deobfuscates on RX.
pub fn apply_obfuscation(pdu: &mut [u8], pecb: &[u8; 6]) {
    debug_assert!(pdu.len() >= MESH_NWK_HEADER_LEN);
    for (b, p) in pdu[OBFUSCATED_SPAN].iter_mut().zip(pecb.iter()) {
        *b ^= *p;
    }
}
