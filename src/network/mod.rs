// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Network layer: PDU encryption, obfuscation and the RX/TX codec paths.
//!
//! The handler drives the pipelines: it walks the NetKey candidates whose
//! NID matches the received IVI|NID octet, tries [`try_decode`] on each, and
//! applies cache, delivery and relay policy on the first success. TX is the
//! mirror image through [`encode`].

pub mod cache;

use anyhow::{Result, ensure};
use bytes::Bytes;

use crate::{
    crypto::{MeshSecurity, NetKeyMaterial, nonce},
    local_config::keys::NetKeyEntry,
    models::{
        common::{
            MESH_NETMIC_SIZE_ACC, MESH_NETMIC_SIZE_CTL, MESH_NWK_HEADER_LEN,
            MESH_NWK_MAX_PDU_LEN, MESH_NWK_MIN_PDU_LEN, MeshAddress, SeqNumber,
            is_unicast,
        },
        network::{NwkPduHeader, apply_obfuscation},
    },
    node::bearer::IfaceId,
};

/// TTL values below this are never relayed.
pub const RELAY_MIN_TTL: u8 = 2;

/// Decoded network PDU handed to the lower transport.
#[derive(Debug, Clone)]
pub struct NwkPduRxInfo {
    pub src: MeshAddress,
    pub dst: MeshAddress,
    pub seq: SeqNumber,
    pub ttl: u8,
    pub ctl: bool,
    /// IV Index the PDU authenticated under.
    pub iv_index: u32,
    pub net_key_index: u16,
    /// Set when friendship credentials matched; names the peer.
    pub friend_lpn_addr: Option<MeshAddress>,
    pub ltr_pdu: Bytes,
    pub iface: IfaceId,
    pub rssi: i8,
}

/// TX parameters for one network PDU.
#[derive(Debug, Clone, Copy)]
pub struct NwkPduTxInfo {
    pub src: MeshAddress,
    pub dst: MeshAddress,
    pub ctl: bool,
    pub ttl: u8,
    pub seq: SeqNumber,
    pub net_key_index: u16,
    /// Select friendship credentials derived with this peer.
    pub friend_lpn_addr: Option<MeshAddress>,
    pub priority: bool,
}

/// Encrypts, packs and obfuscates one network PDU.
pub fn encode(
    crypto: &dyn MeshSecurity,
    material: &NetKeyMaterial,
    iv_index: u32,
    info: &NwkPduTxInfo,
    ltr_pdu: &[u8],
) -> Result<Bytes> {
    let mic_len = if info.ctl { MESH_NETMIC_SIZE_CTL } else { MESH_NETMIC_SIZE_ACC };
    ensure!(
        MESH_NWK_HEADER_LEN + ltr_pdu.len() + mic_len <= MESH_NWK_MAX_PDU_LEN,
        "transport PDU of {} bytes does not fit a network PDU",
        ltr_pdu.len()
    );
    ensure!(!ltr_pdu.is_empty(), "empty transport PDU");

    let hdr = NwkPduHeader::new(
        (iv_index & 1) != 0,
        material.nid,
        info.ctl,
        info.ttl,
        info.seq,
        info.src,
        info.dst,
    );

    // DST plus transport PDU form the encrypted region.
    let mut plain = Vec::with_capacity(2 + ltr_pdu.len());
    plain.extend_from_slice(&info.dst.to_be_bytes());
    plain.extend_from_slice(ltr_pdu);

    let nonce = nonce::network_nonce(hdr.ctl_ttl, info.seq, info.src, iv_index);
    let ciphertext =
        crypto.ccm_encrypt(&material.encryption_key, &nonce, b"", &plain, mic_len);

    let mut pdu = Vec::with_capacity(MESH_NWK_HEADER_LEN - 2 + ciphertext.len());
    pdu.extend_from_slice(&zerocopy::IntoBytes::as_bytes(&hdr)[..7]);
    pdu.extend_from_slice(&ciphertext);

    let mut sample = [0u8; 7];
    sample.copy_from_slice(&pdu[7..14]);
    let pecb = crypto.pecb(&material.privacy_key, iv_index, &sample);
    apply_obfuscation(&mut pdu, &pecb);

    Ok(Bytes::from(pdu))
}

/// Fields recovered by a successful decode trial.
#[derive(Debug, Clone)]
pub struct DecodedPdu {
    pub src: MeshAddress,
    pub dst: MeshAddress,
    pub seq: SeqNumber,
    pub ttl: u8,
    pub ctl: bool,
    pub iv_index: u32,
    pub ltr_pdu: Vec<u8>,
}

/// Attempts deobfuscation and decryption of `raw` under one candidate
/// material. `None` means "not this key" — callers keep trying; every
/// failure across all candidates is a silent drop.
pub fn try_decode(
    crypto: &dyn MeshSecurity,
    material: &NetKeyMaterial,
    current_iv_index: u32,
    raw: &[u8],
) -> Option<DecodedPdu> {
    if raw.len() < MESH_NWK_MIN_PDU_LEN || raw.len() > MESH_NWK_MAX_PDU_LEN {
        return None;
    }
    if raw[0] & 0x7F != material.nid {
        return None;
    }

    // The IVI bit selects between the current index and the previous one.
    let ivi = (raw[0] & 0x80) != 0;
    let iv_index = if (current_iv_index & 1) as u8 == ivi as u8 {
        current_iv_index
    } else {
        current_iv_index.checked_sub(1)?
    };

    let mut sample = [0u8; 7];
    sample.copy_from_slice(&raw[7..14]);
    let pecb = crypto.pecb(&material.privacy_key, iv_index, &sample);

    let mut pdu = raw.to_vec();
    apply_obfuscation(&mut pdu, &pecb);
    let hdr = NwkPduHeader::from_bytes(&pdu).ok()?;

    let mic_len = if hdr.ctl() { MESH_NETMIC_SIZE_CTL } else { MESH_NETMIC_SIZE_ACC };
    if pdu.len() < 7 + 2 + 1 + mic_len {
        return None;
    }

    let nonce = nonce::network_nonce(hdr.ctl_ttl, hdr.seq(), hdr.src.get(), iv_index);
    let plain = crypto.ccm_decrypt(
        &material.encryption_key,
        &nonce,
        b"",
        &pdu[7..],
        mic_len,
    )?;

    let dst = u16::from_be_bytes([plain[0], plain[1]]);
    let src = hdr.src.get();
    if !is_unicast(src) {
        return None;
    }

    Some(DecodedPdu {
        src,
        dst,
        seq: hdr.seq(),
        ttl: hdr.ttl(),
        ctl: hdr.ctl(),
        iv_index,
        ltr_pdu: plain[2..].to_vec(),
    })
}

/// RX credential candidates of one subnet: master material first (both key
/// slots during refresh), then every friendship credential set.
pub fn rx_candidates(
    entry: &NetKeyEntry,
) -> impl Iterator<Item = (Option<MeshAddress>, &NetKeyMaterial)> {
    entry.rx_materials().map(|m| (None, m)).chain(
        entry.friendships.iter().flat_map(|f| {
            std::iter::once((Some(f.peer_addr), &f.material)).chain(
                f.new_material.as_ref().map(|m| (Some(f.peer_addr), m)),
            )
        }),
    )
}

/// Material selection for TX: friendship credentials when the PDU rides a
/// friendship, master otherwise.
pub fn tx_material<'a>(
    entry: &'a NetKeyEntry,
    friend_lpn_addr: Option<MeshAddress>,
) -> Option<&'a NetKeyMaterial> {
    match friend_lpn_addr {
        None => Some(entry.tx_material()),
        Some(peer) => entry.friendship_for(peer).map(|f| {
            match entry.phase {
                crate::local_config::KeyRefreshPhase::Phase2 => {
                    f.new_material.as_ref().unwrap_or(&f.material)
                },
                _ => &f.material,
            }
        }),
    }
}
