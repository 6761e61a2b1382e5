// MIT License - Copyright (c) 2026 Peter Wright
// Typed event fan-out

use crate::reply::{PivFragment, Reply, ReplyType};
use crate::transport::ConnectionId;

/// Typed notifications fanned out by the reply dispatcher.
///
/// Every decoded reply produces exactly one event, dispatched after any
/// awaiting caller has been completed. Users subscribe via
/// `ControlPanel::subscribe()` and match on the kinds they care about.
#[derive(Debug, Clone)]
pub enum AcuEvent {
    /// A device crossed the online/offline threshold.
    ConnectionStatusChanged {
        connection_id: ConnectionId,
        address: u8,
        online: bool,
    },
    Ack {
        connection_id: ConnectionId,
        address: u8,
    },
    Nak {
        connection_id: ConnectionId,
        address: u8,
        code: Option<crate::error::NakCode>,
    },
    IdReport {
        connection_id: ConnectionId,
        address: u8,
        payload: Vec<u8>,
    },
    DeviceCapabilities {
        connection_id: ConnectionId,
        address: u8,
        payload: Vec<u8>,
    },
    /// Tamper/power status.
    LocalStatus {
        connection_id: ConnectionId,
        address: u8,
        tamper: bool,
        power_failure: bool,
    },
    InputStatus {
        connection_id: ConnectionId,
        address: u8,
        inputs: Vec<bool>,
    },
    OutputStatus {
        connection_id: ConnectionId,
        address: u8,
        outputs: Vec<bool>,
    },
    ReaderStatus {
        connection_id: ConnectionId,
        address: u8,
        payload: Vec<u8>,
    },
    /// Card read delivered in raw bit-array form.
    RawCardData {
        connection_id: ConnectionId,
        address: u8,
        payload: Vec<u8>,
    },
    /// Card read delivered in character form.
    FormattedCardData {
        connection_id: ConnectionId,
        address: u8,
        payload: Vec<u8>,
    },
    KeypadData {
        connection_id: ConnectionId,
        address: u8,
        digits: Vec<u8>,
    },
    CommunicationConfig {
        connection_id: ConnectionId,
        address: u8,
        payload: Vec<u8>,
    },
    /// The PD is busy; the issuing command stays queued and is retried.
    Busy {
        connection_id: ConnectionId,
        address: u8,
    },
    ManufacturerSpecific {
        connection_id: ConnectionId,
        address: u8,
        payload: Vec<u8>,
    },
    ExtendedRead {
        connection_id: ConnectionId,
        address: u8,
        payload: Vec<u8>,
    },
    /// One fragment of a PIV object read.
    PivData {
        connection_id: ConnectionId,
        address: u8,
        fragment: PivFragment,
    },
}

impl AcuEvent {
    /// Build the typed event for a decoded reply. Returns `None` for a
    /// reply whose payload does not parse (a structurally valid PIV frame
    /// with a malformed fragment header) and for handshake traffic, which
    /// never reaches the dispatcher.
    pub(crate) fn from_reply(reply: &Reply) -> Option<AcuEvent> {
        let connection_id = reply.connection_id;
        let address = reply.address;
        let event = match reply.reply_type {
            ReplyType::Ack => AcuEvent::Ack {
                connection_id,
                address,
            },
            ReplyType::Nak => AcuEvent::Nak {
                connection_id,
                address,
                code: reply.nak_code(),
            },
            ReplyType::IdReport => AcuEvent::IdReport {
                connection_id,
                address,
                payload: reply.payload.clone(),
            },
            ReplyType::DeviceCapabilities => AcuEvent::DeviceCapabilities {
                connection_id,
                address,
                payload: reply.payload.clone(),
            },
            ReplyType::LocalStatus => AcuEvent::LocalStatus {
                connection_id,
                address,
                tamper: reply.payload.first().is_some_and(|&b| b != 0),
                power_failure: reply.payload.get(1).is_some_and(|&b| b != 0),
            },
            ReplyType::InputStatus => AcuEvent::InputStatus {
                connection_id,
                address,
                inputs: reply.payload.iter().map(|&b| b != 0).collect(),
            },
            ReplyType::OutputStatus => AcuEvent::OutputStatus {
                connection_id,
                address,
                outputs: reply.payload.iter().map(|&b| b != 0).collect(),
            },
            ReplyType::ReaderStatus => AcuEvent::ReaderStatus {
                connection_id,
                address,
                payload: reply.payload.clone(),
            },
            ReplyType::RawCardData => AcuEvent::RawCardData {
                connection_id,
                address,
                payload: reply.payload.clone(),
            },
            ReplyType::FormattedCardData => AcuEvent::FormattedCardData {
                connection_id,
                address,
                payload: reply.payload.clone(),
            },
            ReplyType::KeypadData => AcuEvent::KeypadData {
                connection_id,
                address,
                digits: reply.payload.clone(),
            },
            ReplyType::CommunicationConfig => AcuEvent::CommunicationConfig {
                connection_id,
                address,
                payload: reply.payload.clone(),
            },
            ReplyType::Busy => AcuEvent::Busy {
                connection_id,
                address,
            },
            ReplyType::ManufacturerSpecific => AcuEvent::ManufacturerSpecific {
                connection_id,
                address,
                payload: reply.payload.clone(),
            },
            ReplyType::ExtendedRead => AcuEvent::ExtendedRead {
                connection_id,
                address,
                payload: reply.payload.clone(),
            },
            ReplyType::PivData => AcuEvent::PivData {
                connection_id,
                address,
                fragment: PivFragment::parse(&reply.payload).ok()?,
            },
            ReplyType::ChallengeResponse | ReplyType::InitialRMac => return None,
        };
        Some(event)
    }
}

/// Type alias for the broadcast sender.
pub type EventSender = tokio::sync::broadcast::Sender<AcuEvent>;

/// Type alias for the broadcast receiver.
pub type EventReceiver = tokio::sync::broadcast::Receiver<AcuEvent>;

/// Create a new event channel with the given capacity.
pub fn event_channel(capacity: usize) -> (EventSender, EventReceiver) {
    tokio::sync::broadcast::channel(capacity)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(reply_type: ReplyType, payload: Vec<u8>) -> Reply {
        Reply {
            connection_id: ConnectionId::new(3),
            address: 0x11,
            reply_type,
            issuing_command: None,
            payload,
            sequence: 0,
        }
    }

    #[test]
    fn test_local_status_parsing() {
        let event = AcuEvent::from_reply(&reply(ReplyType::LocalStatus, vec![1, 0])).unwrap();
        let AcuEvent::LocalStatus {
            tamper,
            power_failure,
            ..
        } = event
        else {
            panic!("wrong event kind");
        };
        assert!(tamper);
        assert!(!power_failure);
    }

    #[test]
    fn test_piv_fragment_event() {
        let fragment = PivFragment {
            whole_length: 16,
            offset: 0,
            data: vec![1, 2, 3],
        };
        let event =
            AcuEvent::from_reply(&reply(ReplyType::PivData, fragment.encode())).unwrap();
        let AcuEvent::PivData { fragment: f, .. } = event else {
            panic!("wrong event kind");
        };
        assert_eq!(f, fragment);
    }

    #[test]
    fn test_malformed_piv_fragment_yields_no_event() {
        assert!(AcuEvent::from_reply(&reply(ReplyType::PivData, vec![1, 2])).is_none());
    }

    #[test]
    fn test_nak_event_carries_code() {
        let event = AcuEvent::from_reply(&reply(ReplyType::Nak, vec![0x04])).unwrap();
        let AcuEvent::Nak { code, .. } = event else {
            panic!("wrong event kind");
        };
        assert_eq!(code, Some(crate::error::NakCode::SequenceError));
    }
}
