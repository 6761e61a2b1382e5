// MIT License - Copyright (c) 2026 Peter Wright
// Reply types

use std::fmt;

use crate::constants::{
    REPLY_ACK, REPLY_BUSY, REPLY_CCRYPT, REPLY_COM, REPLY_FMT, REPLY_ISTATR, REPLY_KEYPAD,
    REPLY_LSTATR, REPLY_MFGREP, REPLY_NAK, REPLY_OSTATR, REPLY_PDCAP, REPLY_PDID,
    REPLY_PIVDATAR, REPLY_RAW, REPLY_RMAC_I, REPLY_RSTATR, REPLY_XRD,
};
use crate::error::{NakCode, OsdpError, Result};
use crate::transport::ConnectionId;

/// Monotonic identifier assigned to each caller command, so that two
/// concurrent commands of the same code to the same address resolve FIFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(pub(crate) u64);

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn#{}", self.0)
    }
}

/// Tag identifying the kind of a decoded reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplyType {
    Ack,
    Nak,
    IdReport,
    DeviceCapabilities,
    LocalStatus,
    InputStatus,
    OutputStatus,
    ReaderStatus,
    RawCardData,
    FormattedCardData,
    KeypadData,
    CommunicationConfig,
    Busy,
    ManufacturerSpecific,
    ExtendedRead,
    PivData,
    /// CCRYPT — secure channel handshake, consumed by the session
    ChallengeResponse,
    /// RMAC_I — secure channel handshake, consumed by the session
    InitialRMac,
}

impl ReplyType {
    /// Parse a reply code byte.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            REPLY_ACK => Some(Self::Ack),
            REPLY_NAK => Some(Self::Nak),
            REPLY_PDID => Some(Self::IdReport),
            REPLY_PDCAP => Some(Self::DeviceCapabilities),
            REPLY_LSTATR => Some(Self::LocalStatus),
            REPLY_ISTATR => Some(Self::InputStatus),
            REPLY_OSTATR => Some(Self::OutputStatus),
            REPLY_RSTATR => Some(Self::ReaderStatus),
            REPLY_RAW => Some(Self::RawCardData),
            REPLY_FMT => Some(Self::FormattedCardData),
            REPLY_KEYPAD => Some(Self::KeypadData),
            REPLY_COM => Some(Self::CommunicationConfig),
            REPLY_CCRYPT => Some(Self::ChallengeResponse),
            REPLY_RMAC_I => Some(Self::InitialRMac),
            REPLY_BUSY => Some(Self::Busy),
            REPLY_PIVDATAR => Some(Self::PivData),
            REPLY_MFGREP => Some(Self::ManufacturerSpecific),
            REPLY_XRD => Some(Self::ExtendedRead),
            _ => None,
        }
    }

    /// The wire reply code.
    pub fn code(&self) -> u8 {
        match self {
            Self::Ack => REPLY_ACK,
            Self::Nak => REPLY_NAK,
            Self::IdReport => REPLY_PDID,
            Self::DeviceCapabilities => REPLY_PDCAP,
            Self::LocalStatus => REPLY_LSTATR,
            Self::InputStatus => REPLY_ISTATR,
            Self::OutputStatus => REPLY_OSTATR,
            Self::ReaderStatus => REPLY_RSTATR,
            Self::RawCardData => REPLY_RAW,
            Self::FormattedCardData => REPLY_FMT,
            Self::KeypadData => REPLY_KEYPAD,
            Self::CommunicationConfig => REPLY_COM,
            Self::Busy => REPLY_BUSY,
            Self::ManufacturerSpecific => REPLY_MFGREP,
            Self::ExtendedRead => REPLY_XRD,
            Self::PivData => REPLY_PIVDATAR,
            Self::ChallengeResponse => REPLY_CCRYPT,
            Self::InitialRMac => REPLY_RMAC_I,
        }
    }
}

/// A decoded reply from a PD, as handed to the dispatcher.
#[derive(Debug, Clone)]
pub struct Reply {
    pub connection_id: ConnectionId,
    pub address: u8,
    pub reply_type: ReplyType,
    /// Present when this reply was correlated to the head of the device's
    /// command queue: the issuing command's code and transaction id.
    pub issuing_command: Option<(u8, TransactionId)>,
    pub payload: Vec<u8>,
    pub sequence: u8,
}

impl Reply {
    /// The NAK error code carried by a NAK reply, if any.
    pub fn nak_code(&self) -> Option<NakCode> {
        if self.reply_type != ReplyType::Nak {
            return None;
        }
        self.payload.first().and_then(|&c| NakCode::from_code(c))
    }
}

/// One fragment of a multi-part reply (PIV data, extended reads).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PivFragment {
    /// Total length of the reassembled message.
    pub whole_length: u16,
    /// Where this fragment's bytes land in the whole message.
    pub offset: u16,
    pub data: Vec<u8>,
}

impl PivFragment {
    /// Parse the fragment header `{whole_length, offset, length}` (all
    /// little-endian u16) followed by the fragment bytes.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        if payload.len() < 6 {
            return Err(OsdpError::FrameInvalid {
                reason: "short fragment header",
            });
        }
        let whole_length = u16::from_le_bytes([payload[0], payload[1]]);
        let offset = u16::from_le_bytes([payload[2], payload[3]]);
        let length = u16::from_le_bytes([payload[4], payload[5]]) as usize;
        if payload.len() < 6 + length {
            return Err(OsdpError::FrameInvalid {
                reason: "fragment shorter than declared",
            });
        }
        Ok(Self {
            whole_length,
            offset,
            data: payload[6..6 + length].to_vec(),
        })
    }

    /// Encode a fragment payload (used by tests and PD simulators).
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(6 + self.data.len());
        out.extend_from_slice(&self.whole_length.to_le_bytes());
        out.extend_from_slice(&self.offset.to_le_bytes());
        out.extend_from_slice(&(self.data.len() as u16).to_le_bytes());
        out.extend_from_slice(&self.data);
        out
    }
}
