// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Typed control-PDU catalogue: one enum over every opcode-tagged payload
//! the upper transport dispatches on.

use anyhow::Result;
use enum_dispatch::enum_dispatch;

use crate::models::{
    friendship::{
        clear::FriendClearPdu,
        offer::FriendOfferPdu,
        poll::FriendPollPdu,
        request::FriendRequestPdu,
        subscription::{FriendSubscrCnfPdu, FriendSubscrListPdu},
        update::FriendUpdatePdu,
    },
    heartbeat::HeartbeatPdu,
    opcode::CtlOpcode,
    transport::ack::SegmentAck,
};

/// Behavior shared by every control payload: its opcode and its wire bytes
/// (parameters only, the opcode byte is framing owned by the transport).
#[enum_dispatch]
pub trait CtlParams {
    fn opcode(&self) -> CtlOpcode;
    fn params_to_bytes(&self) -> Vec<u8>;
}

/// Friend Clear Confirm shares the Friend Clear layout but not its opcode.
#[derive(Debug, Clone, PartialEq)]
pub struct FriendClearCnfPdu(pub FriendClearPdu);

/// Every control PDU this stack understands.
#[enum_dispatch(CtlParams)]
#[derive(Debug, Clone, PartialEq)]
pub enum ControlPdu {
    SegmentAck(SegmentAck),
    FriendPoll(FriendPollPdu),
    FriendUpdate(FriendUpdatePdu),
    FriendRequest(FriendRequestPdu),
    FriendOffer(FriendOfferPdu),
    FriendClear(FriendClearPdu),
    FriendClearConfirm(FriendClearCnfPdu),
    FriendSubscrListAdd(FriendSubscrListPdu),
    FriendSubscrListRemove(SubscrListRemove),
    FriendSubscrListConfirm(FriendSubscrCnfPdu),
    Heartbeat(HeartbeatPdu),
}

/// Subscription List Remove shares the Add layout but not its opcode.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscrListRemove(pub FriendSubscrListPdu);

impl ControlPdu {
    /// Parses control parameters for a known opcode.
    pub fn parse(opcode: CtlOpcode, params: &[u8]) -> Result<Self> {
        Ok(match opcode {
            CtlOpcode::SegmentAck => Self::SegmentAck(SegmentAck::parse(params)?),
            CtlOpcode::FriendPoll => Self::FriendPoll(FriendPollPdu::parse(params)?),
            CtlOpcode::FriendUpdate => {
                Self::FriendUpdate(FriendUpdatePdu::from_bytes(params)?.clone())
            },
            CtlOpcode::FriendRequest => {
                Self::FriendRequest(FriendRequestPdu::from_bytes(params)?.clone())
            },
            CtlOpcode::FriendOffer => {
                Self::FriendOffer(FriendOfferPdu::from_bytes(params)?.clone())
            },
            CtlOpcode::FriendClear => {
                Self::FriendClear(FriendClearPdu::from_bytes(params)?.clone())
            },
            CtlOpcode::FriendClearConfirm => Self::FriendClearConfirm(
                FriendClearCnfPdu(FriendClearPdu::from_bytes(params)?.clone()),
            ),
            CtlOpcode::FriendSubscrListAdd => {
                Self::FriendSubscrListAdd(FriendSubscrListPdu::parse(params)?)
            },
            CtlOpcode::FriendSubscrListRemove => Self::FriendSubscrListRemove(
                SubscrListRemove(FriendSubscrListPdu::parse(params)?),
            ),
            CtlOpcode::FriendSubscrListConfirm => {
                Self::FriendSubscrListConfirm(FriendSubscrCnfPdu::parse(params)?)
            },
            CtlOpcode::Heartbeat => Self::Heartbeat(HeartbeatPdu::parse(params)?),
        })
    }
}

impl CtlParams for SegmentAck {
    fn opcode(&self) -> CtlOpcode {
        CtlOpcode::SegmentAck
    }

    fn params_to_bytes(&self) -> Vec<u8> {
        self.to_ltr_pdu()[1..].to_vec()
    }
}

impl CtlParams for FriendPollPdu {
    fn opcode(&self) -> CtlOpcode {
        CtlOpcode::FriendPoll
    }

    fn params_to_bytes(&self) -> Vec<u8> {
        self.to_bytes().to_vec()
    }
}

impl CtlParams for FriendUpdatePdu {
    fn opcode(&self) -> CtlOpcode {
        CtlOpcode::FriendUpdate
    }

    fn params_to_bytes(&self) -> Vec<u8> {
        zerocopy::IntoBytes::as_bytes(self).to_vec()
    }
}

impl CtlParams for FriendRequestPdu {
    fn opcode(&self) -> CtlOpcode {
        CtlOpcode::FriendRequest
    }

    fn params_to_bytes(&self) -> Vec<u8> {
        zerocopy::IntoBytes::as_bytes(self).to_vec()
    }
}

impl CtlParams for FriendOfferPdu {
    fn opcode(&self) -> CtlOpcode {
        CtlOpcode::FriendOffer
    }

    fn params_to_bytes(&self) -> Vec<u8> {
        zerocopy::IntoBytes::as_bytes(self).to_vec()
    }
}

impl CtlParams for FriendClearPdu {
    fn opcode(&self) -> CtlOpcode {
        CtlOpcode::FriendClear
    }

    fn params_to_bytes(&self) -> Vec<u8> {
        zerocopy::IntoBytes::as_bytes(self).to_vec()
    }
}

impl CtlParams for FriendClearCnfPdu {
    fn opcode(&self) -> CtlOpcode {
        CtlOpcode::FriendClearConfirm
    }

    fn params_to_bytes(&self) -> Vec<u8> {
        zerocopy::IntoBytes::as_bytes(&self.0).to_vec()
    }
}

impl CtlParams for FriendSubscrListPdu {
    fn opcode(&self) -> CtlOpcode {
        CtlOpcode::FriendSubscrListAdd
    }

    fn params_to_bytes(&self) -> Vec<u8> {
        self.to_bytes()
    }
}

impl CtlParams for SubscrListRemove {
    fn opcode(&self) -> CtlOpcode {
        CtlOpcode::FriendSubscrListRemove
    }

    fn params_to_bytes(&self) -> Vec<u8> {
        self.0.to_bytes()
    }
}

impl CtlParams for FriendSubscrCnfPdu {
    fn opcode(&self) -> CtlOpcode {
        CtlOpcode::FriendSubscrListConfirm
    }

    fn params_to_bytes(&self) -> Vec<u8> {
        self.to_bytes().to_vec()
    }
}

impl CtlParams for HeartbeatPdu {
    fn opcode(&self) -> CtlOpcode {
        CtlOpcode::Heartbeat
    }

    fn params_to_bytes(&self) -> Vec<u8> {
        self.to_bytes().to_vec()
    }
}
