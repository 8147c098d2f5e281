// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Upper transport: access PDU encryption, key selection and control PDU
//! egress framing.

pub mod heartbeat;

use anyhow::{Result, bail};
use bytes::Bytes;
use thiserror::Error;
use tracing::debug;

use crate::{
    crypto::{MeshSecurity, nonce},
    local_config::{KeyRefreshPhase, LocalCfgError, store::LocalConfig},
    lower_transport::{
        LtrAccPduInfo, TransportEffect,
        sar_tx::{SarTx, SarTxError, SarTxParams, TxKind},
    },
    models::{
        common::{MeshAddress, SeqNumber, is_virtual},
        control::CtlParams,
        opcode::CtlOpcode,
        transport::{
            LTR_MAX_UNSEG_ACC_PDU_LEN, LTR_MAX_UNSEG_CTL_PDU_LEN,
            segment::{AccHeaderByte, build_unseg_access, build_unseg_control},
        },
    },
    network::NwkPduTxInfo,
    node::msg::AccessSendReq,
    replay::rpl::{ReplayProtection, RplVerdict},
};

/// 32-bit TransMIC length.
const TRANS_MIC_32: usize = 4;
/// 64-bit TransMIC length.
const TRANS_MIC_64: usize = 8;

#[derive(Debug, Error)]
pub enum UtrSendError {
    #[error("configuration error: {0}")]
    Config(#[from] LocalCfgError),
    #[error("segmentation error: {0}")]
    Sar(#[from] SarTxError),
    #[error("{0}")]
    Invalid(String),
}

/// Decrypted access message delivered to the application dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessRxMsg {
    pub src: MeshAddress,
    pub dst: MeshAddress,
    /// `None` when the device key authenticated the message.
    pub app_key_index: Option<u16>,
    pub payload: Bytes,
}

/// Encrypts and sends one access PDU, choosing the key by AKF/AID rules and
/// the transport shape by size and ack demand. Returns the SeqAuth SEQ.
pub fn send_access(
    cfg: &mut LocalConfig,
    crypto: &dyn MeshSecurity,
    sar_tx: &mut SarTx,
    req: &AccessSendReq,
    effects: &mut Vec<TransportEffect>,
) -> Result<SeqNumber, UtrSendError> {
    let src = cfg.element(req.element_index)?.addr;
    // Per-message TTL overrides allow any 7-bit value, TTL=1 included: such
    // a PDU is delivered one hop out and simply never relayed. Only the
    // default TTL carries the != 1 restriction.
    let ttl = match req.ttl {
        Some(t) if t > 0x7F => {
            return Err(UtrSendError::Invalid(format!("TTL {t} does not fit 7 bits")));
        },
        Some(t) => t,
        None => cfg.default_ttl(),
    };
    let iv_index = cfg.tx_iv_index();

    // AKF = 1 picks the bound AppKey (new material from phase 2), AKF = 0
    // the device key.
    let (akf, aid, key) = match req.app_key_index {
        Some(index) => {
            let app = cfg.keys.app_key(index)?;
            let net = cfg.keys.net_key(app.net_key_index)?;
            let (key, aid) = if net.phase == KeyRefreshPhase::Phase2
                && let (Some(new_key), Some(new_aid)) = (app.new_key, app.new_aid)
            {
                (new_key, new_aid)
            } else {
                (app.key, app.aid)
            };
            (true, aid, key)
        },
        None => (false, 0u8, *cfg.keys.device_key()),
    };

    let mic_len = if req.szmic64 { TRANS_MIC_64 } else { TRANS_MIC_32 };
    // A 64-bit TransMIC only exists on segmented PDUs.
    let segmented = req.szmic64
        || req.ack_required
        || req.payload.len() + mic_len > LTR_MAX_UNSEG_ACC_PDU_LEN;

    let seq = cfg.seq_alloc(req.element_index)?;

    let aad: &[u8] = match (&req.label_uuid, is_virtual(req.dst)) {
        (Some(label), true) => label.as_ref(),
        (None, true) => {
            return Err(UtrSendError::Invalid(
                "virtual destination without label UUID".into(),
            ));
        },
        _ => b"",
    };
    let nonce = if akf {
        nonce::application_nonce(req.szmic64, seq, src, req.dst, iv_index)
    } else {
        nonce::device_nonce(req.szmic64, seq, src, req.dst, iv_index)
    };
    let utr_pdu = crypto.ccm_encrypt(&key, &nonce, aad, &req.payload, mic_len);

    let hdr = AccHeaderByte { seg: segmented, akf, aid };
    if !segmented {
        effects.push(TransportEffect::SendNetwork {
            info: NwkPduTxInfo {
                src,
                dst: req.dst,
                ctl: false,
                ttl,
                seq,
                net_key_index: req.net_key_index,
                friend_lpn_addr: None,
                priority: false,
            },
            ltr_pdu: build_unseg_access(hdr, &utr_pdu),
        });
        return Ok(seq);
    }

    let element_index = req.element_index;
    let params = SarTxParams {
        src,
        dst: req.dst,
        net_key_index: req.net_key_index,
        friend_lpn_addr: None,
        ttl,
        priority: false,
        kind: TxKind::Access { hdr, szmic: req.szmic64 },
    };
    let (first_seq, tx_effects) =
        sar_tx.send(params, &utr_pdu, seq, &mut || cfg.seq_alloc(element_index).ok())?;
    effects.extend(tx_effects);
    Ok(first_seq)
}

/// Frames and sends one control PDU from the primary element. Control
/// payloads above the unsegmented limit ride SAR.
#[allow(clippy::too_many_arguments)]
pub fn send_control(
    cfg: &mut LocalConfig,
    sar_tx: &mut SarTx,
    opcode: CtlOpcode,
    params_bytes: &[u8],
    dst: MeshAddress,
    net_key_index: u16,
    ttl: u8,
    friend_lpn_addr: Option<MeshAddress>,
    priority: bool,
    effects: &mut Vec<TransportEffect>,
) -> Result<SeqNumber, UtrSendError> {
    let src = cfg.primary_addr();
    let seq = cfg.seq_alloc(0)?;

    if params_bytes.len() <= LTR_MAX_UNSEG_CTL_PDU_LEN {
        effects.push(TransportEffect::SendNetwork {
            info: NwkPduTxInfo {
                src,
                dst,
                ctl: true,
                ttl,
                seq,
                net_key_index,
                friend_lpn_addr,
                priority,
            },
            ltr_pdu: build_unseg_control(opcode, params_bytes),
        });
        return Ok(seq);
    }

    let params = SarTxParams {
        src,
        dst,
        net_key_index,
        friend_lpn_addr,
        ttl,
        priority,
        kind: TxKind::Control { opcode },
    };
    let (first_seq, tx_effects) =
        sar_tx.send(params, params_bytes, seq, &mut || cfg.seq_alloc(0).ok())?;
    effects.extend(tx_effects);
    Ok(first_seq)
}

/// Typed convenience over [`send_control`] for the control PDU catalogue.
#[allow(clippy::too_many_arguments)]
pub fn send_control_pdu(
    cfg: &mut LocalConfig,
    sar_tx: &mut SarTx,
    pdu: &dyn CtlParams,
    dst: MeshAddress,
    net_key_index: u16,
    ttl: u8,
    friend_lpn_addr: Option<MeshAddress>,
    priority: bool,
    effects: &mut Vec<TransportEffect>,
) -> Result<SeqNumber, UtrSendError> {
    send_control(
        cfg,
        sar_tx,
        pdu.opcode(),
        &pdu.params_to_bytes(),
        dst,
        net_key_index,
        ttl,
        friend_lpn_addr,
        priority,
        effects,
    )
}

/// Decrypts a received access PDU after the replay check. MIC failures and
/// replays drop silently (`Ok(None)`).
pub fn receive_access(
    cfg: &LocalConfig,
    crypto: &dyn MeshSecurity,
    rpl: &mut ReplayProtection,
    info: &LtrAccPduInfo,
) -> Result<Option<AccessRxMsg>> {
    if rpl.check_and_update(info.src, info.iv_index, info.seq) == RplVerdict::Drop {
        debug!(src = info.src, seq = info.seq, "access PDU dropped by replay list");
        return Ok(None);
    }
    // A segmented reception consumed SEQs up to gt_seq; keep the stored
    // SeqAuth at the highest value observed.
    if info.gt_seq > info.seq {
        let _ = rpl.check_and_update(info.src, info.iv_index, info.gt_seq);
    }

    let mic_len = if info.szmic { TRANS_MIC_64 } else { TRANS_MIC_32 };
    if info.utr_pdu.len() <= mic_len {
        bail!("short upper transport PDU: {} bytes", info.utr_pdu.len());
    }

    let labels: Vec<[u8; 16]> = if is_virtual(info.dst) {
        cfg.address_lists
            .labels_for(info.dst)
            .into_iter()
            .copied()
            .collect()
    } else {
        Vec::new()
    };
    let aads: Vec<&[u8]> = if labels.is_empty() {
        vec![b""]
    } else {
        labels.iter().map(|l| l.as_ref()).collect()
    };

    if info.akf {
        let nonce = nonce::application_nonce(
            info.szmic,
            info.seq,
            info.src,
            info.dst,
            info.iv_index,
        );
        for (app, key) in cfg.keys.app_keys_by_aid(info.net_key_index, info.aid) {
            for aad in &aads {
                if let Some(plain) =
                    crypto.ccm_decrypt(key, &nonce, aad, &info.utr_pdu, mic_len)
                {
                    return Ok(Some(AccessRxMsg {
                        src: info.src,
                        dst: info.dst,
                        app_key_index: Some(app.index),
                        payload: Bytes::from(plain),
                    }));
                }
            }
        }
    } else {
        let nonce = nonce::device_nonce(
            info.szmic,
            info.seq,
            info.src,
            info.dst,
            info.iv_index,
        );
        for aad in &aads {
            if let Some(plain) = crypto.ccm_decrypt(
                cfg.keys.device_key(),
                &nonce,
                aad,
                &info.utr_pdu,
                mic_len,
            ) {
                return Ok(Some(AccessRxMsg {
                    src: info.src,
                    dst: info.dst,
                    app_key_index: None,
                    payload: Bytes::from(plain),
                }));
            }
        }
    }

    debug!(src = info.src, "access PDU failed authentication, dropped");
    Ok(None)
}
