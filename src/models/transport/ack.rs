// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Segment Acknowledgement codec (control opcode `0x00`, never segmented).
//!
//! ```text
//!  octet 0: OBO(1) ‖ SeqZero[12:6]
//!  octet 1: SeqZero[5:0] ‖ RFU(2)
//!  octets 2..6: BlockAck, big-endian, bit i acknowledges segment i
//! ```

use anyhow::{Result, ensure};

use crate::models::opcode::CtlOpcode;

/// Segment-ACK parameter length (excluding the opcode byte).
pub const SEG_ACK_PARAMS_LEN: usize = 6;

/// Mask selecting the OBO bit from octet 0.
const OBO_MASK: u8 = 0b1000_0000;

/// Decoded Segment Acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SegmentAck {
    /// Sent by a Friend on behalf of one of its LPNs.
    pub obo: bool,
    pub seq_zero: u16,
    /// Bit i set ⇔ segment i received.
    pub block_ack: u32,
}

impl SegmentAck {
    /// Every segment of a transaction with last index `seg_n` acknowledged.
    #[inline]
    pub fn full_mask(seg_n: u8) -> u32 {
        if seg_n >= 31 {
            u32::MAX
        } else {
            (1u32 << (seg_n + 1)) - 1
        }
    }

    /// Encodes opcode byte plus parameters, ready for the network layer.
    pub fn to_ltr_pdu(self) -> [u8; 1 + SEG_ACK_PARAMS_LEN] {
        let obo = if self.obo { OBO_MASK } else { 0 };
        let ack = self.block_ack.to_be_bytes();
        [
            CtlOpcode::SegmentAck as u8,
            obo | ((self.seq_zero >> 6) as u8 & 0x7F),
            ((self.seq_zero & 0x3F) as u8) << 2,
            ack[0],
            ack[1],
            ack[2],
            ack[3],
        ]
    }

    /// Parses Segment-ACK parameters (after the opcode byte).
    pub fn parse(params: &[u8]) -> Result<Self> {
        ensure!(
            params.len() == SEG_ACK_PARAMS_LEN,
            "segment ack needs {SEG_ACK_PARAMS_LEN} bytes, got {}",
            params.len()
        );
        let seq_zero =
            ((u16::from(params[0] & 0x7F)) << 6) | u16::from(params[1] >> 2);
        let block_ack =
            u32::from_be_bytes([params[2], params[3], params[4], params[5]]);
        Ok(Self {
            obo: (params[0] & OBO_MASK) != 0,
            seq_zero,
            block_ack,
        })
    }
}
