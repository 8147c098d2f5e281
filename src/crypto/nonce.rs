// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! AES-CCM nonce construction.
//!
//! Every nonce is 13 bytes: a type octet, an ASZMIC/CTL-TTL octet, the
//! 24-bit SEQ, SRC, DST (network nonces pad with zeros) and the 32-bit
//! IV Index, all big-endian.

use crate::models::common::{MeshAddress, SeqNumber};

/// Nonce length for every CCM operation in the stack.
pub const NONCE_LEN: usize = 13;

const NONCE_TYPE_NETWORK: u8 = 0x00;
const NONCE_TYPE_APPLICATION: u8 = 0x01;
const NONCE_TYPE_DEVICE: u8 = 0x02;

fn build(
    nonce_type: u8,
    octet1: u8,
    seq: SeqNumber,
    src: MeshAddress,
    dst: MeshAddress,
    iv_index: u32,
) -> [u8; NONCE_LEN] {
    let seq = seq.to_be_bytes();
    let src = src.to_be_bytes();
    let dst = dst.to_be_bytes();
    let iv = iv_index.to_be_bytes();
    [
        nonce_type, octet1, seq[1], seq[2], seq[3], src[0], src[1], dst[0], dst[1],
        iv[0], iv[1], iv[2], iv[3],
    ]
}

/// Network nonce; `ctl_ttl` is the exact second octet of the PDU header.
pub fn network_nonce(
    ctl_ttl: u8,
    seq: SeqNumber,
    src: MeshAddress,
    iv_index: u32,
) -> [u8; NONCE_LEN] {
    build(NONCE_TYPE_NETWORK, ctl_ttl, seq, src, 0x0000, iv_index)
}

/// Application nonce for AppKey-encrypted access payloads. `seq` is the
/// first-segment SEQ when the PDU was segmented.
pub fn application_nonce(
    aszmic: bool,
    seq: SeqNumber,
    src: MeshAddress,
    dst: MeshAddress,
    iv_index: u32,
) -> [u8; NONCE_LEN] {
    build(NONCE_TYPE_APPLICATION, (aszmic as u8) << 7, seq, src, dst, iv_index)
}

/// Device nonce for DeviceKey-encrypted access payloads (AKF = 0).
pub fn device_nonce(
    aszmic: bool,
    seq: SeqNumber,
    src: MeshAddress,
    dst: MeshAddress,
    iv_index: u32,
) -> [u8; NONCE_LEN] {
    build(NONCE_TYPE_DEVICE, (aszmic as u8) << 7, seq, src, dst, iv_index)
}
