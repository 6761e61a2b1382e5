// MIT License - Copyright (c) 2026 Peter Wright
// Error taxonomy

use std::fmt;

use crate::transport::ConnectionId;

/// Error codes a PD reports in the payload of a NAK reply.
///
/// A NAK is a successful protocol outcome, not a transport failure: the PD
/// received and checked the command and is telling us why it refuses it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NakCode {
    /// 0x01 — Message check (checksum/CRC) error
    MessageCheck,
    /// 0x02 — Command length error
    CommandLength,
    /// 0x03 — Unknown command code
    UnknownCommand,
    /// 0x04 — Unexpected sequence number
    SequenceError,
    /// 0x05 — Security block type not supported
    UnsupportedSecurityBlock,
    /// 0x06 — Communication security conditions not met
    SecurityConditionsNotMet,
    /// 0x07 — BIO_TYPE not supported
    BioTypeNotSupported,
    /// 0x08 — BIO_FMT not supported
    BioFormatNotSupported,
    /// 0x09 — Unable to process command
    UnableToProcess,
}

impl NakCode {
    /// Parse a NAK error code byte from a reply payload.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(Self::MessageCheck),
            0x02 => Some(Self::CommandLength),
            0x03 => Some(Self::UnknownCommand),
            0x04 => Some(Self::SequenceError),
            0x05 => Some(Self::UnsupportedSecurityBlock),
            0x06 => Some(Self::SecurityConditionsNotMet),
            0x07 => Some(Self::BioTypeNotSupported),
            0x08 => Some(Self::BioFormatNotSupported),
            0x09 => Some(Self::UnableToProcess),
            _ => None,
        }
    }

    /// The wire value of this code.
    pub fn code(&self) -> u8 {
        match self {
            Self::MessageCheck => 0x01,
            Self::CommandLength => 0x02,
            Self::UnknownCommand => 0x03,
            Self::SequenceError => 0x04,
            Self::UnsupportedSecurityBlock => 0x05,
            Self::SecurityConditionsNotMet => 0x06,
            Self::BioTypeNotSupported => 0x07,
            Self::BioFormatNotSupported => 0x08,
            Self::UnableToProcess => 0x09,
        }
    }

    /// Human-readable description of the error code.
    pub fn description(&self) -> &'static str {
        match self {
            Self::MessageCheck => "Message check error",
            Self::CommandLength => "Command length error",
            Self::UnknownCommand => "Unknown command code",
            Self::SequenceError => "Unexpected sequence number",
            Self::UnsupportedSecurityBlock => "Security block not supported",
            Self::SecurityConditionsNotMet => "Security conditions not met",
            Self::BioTypeNotSupported => "Biometric type not supported",
            Self::BioFormatNotSupported => "Biometric format not supported",
            Self::UnableToProcess => "Unable to process command",
        }
    }
}

impl fmt::Display for NakCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}: {}", self.code(), self.description())
    }
}

/// All errors that can occur in the osdp-acu library.
#[derive(Debug, thiserror::Error)]
pub enum OsdpError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    #[error("Invalid frame: {reason}")]
    FrameInvalid { reason: &'static str },

    #[error("Secure channel failed during {phase}")]
    SecureChannelFailed { phase: &'static str },

    #[error("Command timed out")]
    Timeout,

    #[error("Command cancelled")]
    Cancelled,

    #[error("Fragment out of range: offset {offset} + length {length} exceeds whole length {whole}")]
    FragmentOutOfRange {
        offset: usize,
        length: usize,
        whole: usize,
    },

    #[error("Unknown connection {0}")]
    UnknownConnection(ConnectionId),

    #[error("No device at address {address:#04x}")]
    UnknownDevice { address: u8 },

    #[error("Device {address:#04x} replied NAK ({code:?})")]
    NakReceived { address: u8, code: Option<NakCode> },

    #[error("Connection is not open")]
    NotOpen,

    #[error("Channel closed")]
    ChannelClosed,
}

impl OsdpError {
    /// Whether the bus recovers from this error internally (reconnect or
    /// re-establishment) rather than surfacing it to a caller.
    pub fn is_bus_recoverable(&self) -> bool {
        matches!(
            self,
            OsdpError::Io(_)
                | OsdpError::Serial(_)
                | OsdpError::FrameInvalid { .. }
                | OsdpError::SecureChannelFailed { .. }
                | OsdpError::NotOpen
        )
    }
}

pub type Result<T> = std::result::Result<T, OsdpError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nak_code_roundtrip() {
        for code in 0x01..=0x09u8 {
            let parsed = NakCode::from_code(code).expect("known code");
            assert_eq!(parsed.code(), code);
        }
        assert!(NakCode::from_code(0x00).is_none());
        assert!(NakCode::from_code(0x0A).is_none());
    }

    #[test]
    fn test_recoverable_classification() {
        assert!(OsdpError::FrameInvalid { reason: "x" }.is_bus_recoverable());
        assert!(OsdpError::SecureChannelFailed { phase: "mac" }.is_bus_recoverable());
        assert!(!OsdpError::Timeout.is_bus_recoverable());
        assert!(!OsdpError::UnknownDevice { address: 1 }.is_bus_recoverable());
    }
}
