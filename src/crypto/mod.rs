// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Cryptographic collaborator interface.
//!
//! The node treats its primitives (AES-CCM, AES-CMAC-based key derivation,
//! privacy ECB) as opaque capabilities supplied at boot. The stack owns
//! everything around them: nonce layouts ([`nonce`]), k2 `P` input framing,
//! key slot selection and MIC length choice.

pub mod nonce;
pub mod stub;

use crate::models::common::{MESH_KEY_SIZE_128, MeshAddress};

/// A 128-bit mesh key.
pub type Key128 = [u8; MESH_KEY_SIZE_128];

/// Output of `k2`: the per-subnet (or per-friendship) network material.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetKeyMaterial {
    /// 7-bit network identifier advertised in the PDU header.
    pub nid: u8,
    pub encryption_key: Key128,
    pub privacy_key: Key128,
}

/// Master security credentials use `P = 0x00`.
pub const K2_P_MASTER: [u8; 1] = [0x00];

/// Builds the k2 `P` input selecting friendship security credentials.
pub fn k2_p_friendship(
    lpn_addr: MeshAddress,
    friend_addr: MeshAddress,
    lpn_counter: u16,
    friend_counter: u16,
) -> [u8; 9] {
    let lpn = lpn_addr.to_be_bytes();
    let friend = friend_addr.to_be_bytes();
    let lpn_cnt = lpn_counter.to_be_bytes();
    let friend_cnt = friend_counter.to_be_bytes();
    [
        0x01, lpn[0], lpn[1], friend[0], friend[1], lpn_cnt[0], lpn_cnt[1],
        friend_cnt[0], friend_cnt[1],
    ]
}

/// Capabilities the node requires from its crypto provider. Implementations
/// must be pure functions of their inputs.
pub trait MeshSecurity: Send + Sync {
    /// Network key derivation: NID, encryption key and privacy key from a
    /// NetKey and the credential selector `p`.
    fn k2(&self, net_key: &Key128, p: &[u8]) -> anyhow::Result<NetKeyMaterial>;

    /// Application key identifier (6 bits) from an AppKey.
    fn k4(&self, app_key: &Key128) -> anyhow::Result<u8>;

    /// Virtual address derivation from a label UUID; the result must fall in
    /// the virtual range `0x8000..=0xBFFF`.
    fn virtual_address(&self, label_uuid: &[u8; 16]) -> anyhow::Result<MeshAddress>;

    /// AES-CCM authenticated encryption; returns ciphertext with the
    /// `mic_len`-byte MIC appended.
    fn ccm_encrypt(
        &self,
        key: &Key128,
        nonce: &[u8; nonce::NONCE_LEN],
        aad: &[u8],
        payload: &[u8],
        mic_len: usize,
    ) -> Vec<u8>;

    /// AES-CCM authenticated decryption; `None` on MIC mismatch.
    fn ccm_decrypt(
        &self,
        key: &Key128,
        nonce: &[u8; nonce::NONCE_LEN],
        aad: &[u8],
        ciphertext: &[u8],
        mic_len: usize,
    ) -> Option<Vec<u8>>;

    /// Privacy ECB for header obfuscation, derived from the privacy key, the
    /// IV Index and the first seven ciphertext bytes of the PDU.
    fn pecb(
        &self,
        privacy_key: &Key128,
        iv_index: u32,
        ciphertext_sample: &[u8; 7],
    ) -> [u8; 6];
}
