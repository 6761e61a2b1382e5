// MIT License - Copyright (c) 2026 Peter Wright
// Per-device state

use std::collections::VecDeque;
use std::time::Instant;

use tracing::{debug, warn};

use crate::command::Command;
use crate::constants::{CMD_CHLNG, CMD_POLL, CMD_SCRYPT, SCS_11, SCS_13, SCS_15, SCS_17, SCS_18, SEQUENCE_MASK};
use crate::error::{OsdpError, Result};
use crate::frame::{DecodedFrame, Frame, SecurityBlock};
use crate::reply::{Reply, ReplyType, TransactionId};
use crate::secure::{SecureChannelSession, SecureKey, SessionState};
use crate::transport::ConnectionId;

/// A caller command waiting its turn on the wire, paired with the
/// transaction id its pending request was registered under.
#[derive(Debug, Clone)]
pub struct QueuedCommand {
    pub command: Command,
    pub transaction: TransactionId,
}

/// What the device last put on the wire; decides how its reply is
/// classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutboundKind {
    Handshake,
    Command,
    Poll,
}

/// How an accepted reply is to be handled by the bus.
#[derive(Debug)]
pub enum Disposition {
    /// Correlated to the head of the command queue; the queued command was
    /// popped and the reply carries its code and transaction id.
    Delivered(Reply),
    /// A valid reply that matches no queued command (poll responses, card
    /// data, busy indications). Notification only.
    Unsolicited(Reply),
    /// Secure channel handshake traffic, consumed by the session.
    Session,
}

/// Per-device protocol state: framing options, secure session, sequence
/// number, command queue and online bookkeeping.
///
/// The bus guarantees at most one outstanding frame per device: it calls
/// `next_outbound`, then exactly one of `accept_reply` or `on_timeout`
/// before the next `next_outbound`.
pub struct DeviceProxy {
    connection_id: ConnectionId,
    address: u8,
    use_crc: bool,
    default_key: bool,
    secure: Option<SecureChannelSession>,
    sequence: u8,
    queue: VecDeque<QueuedCommand>,
    misses: u32,
    offline_threshold: u32,
    online: bool,
    last_valid_reply_at: Option<Instant>,
    last_outbound: Option<OutboundKind>,
}

impl DeviceProxy {
    pub fn new(
        connection_id: ConnectionId,
        address: u8,
        use_crc: bool,
        secure_key: Option<SecureKey>,
        default_key: bool,
        offline_threshold: u32,
    ) -> Self {
        Self {
            connection_id,
            address,
            use_crc,
            default_key,
            secure: secure_key.map(SecureChannelSession::new),
            sequence: 0,
            queue: VecDeque::new(),
            misses: 0,
            offline_threshold,
            online: false,
            last_valid_reply_at: None,
            last_outbound: None,
        }
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn online(&self) -> bool {
        self.online
    }

    pub fn sequence(&self) -> u8 {
        self.sequence
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn last_valid_reply_at(&self) -> Option<Instant> {
        self.last_valid_reply_at
    }

    pub fn uses_secure_channel(&self) -> bool {
        self.secure.is_some()
    }

    pub fn secure_session_state(&self) -> Option<SessionState> {
        self.secure.as_ref().map(SecureChannelSession::state)
    }

    /// Append a caller command. Commands go out strictly FIFO, one at a
    /// time; on a secure device nothing application-level is transmitted
    /// until the session is established.
    pub fn enqueue(&mut self, command: QueuedCommand) {
        self.queue.push_back(command);
    }

    /// Build the next frame to transmit. Priority: secure channel
    /// establishment, then the queued command head, then a POLL.
    pub fn next_outbound(&mut self) -> Result<Vec<u8>> {
        let established = self.secure.as_ref().is_some_and(SecureChannelSession::is_established);

        let (code, data, security, kind) = if let Some(session) = self.secure.as_mut()
            && !session.is_established()
        {
            match session.state() {
                SessionState::None | SessionState::Broken | SessionState::ChallengeSent => {
                    let rnd_a = session.start_handshake();
                    (
                        CMD_CHLNG,
                        rnd_a.to_vec(),
                        Some(SecurityBlock::handshake(SCS_11, self.default_key)),
                        OutboundKind::Handshake,
                    )
                }
                SessionState::ServerCryptogramSent => (
                    CMD_SCRYPT,
                    session.server_cryptogram().to_vec(),
                    Some(SecurityBlock::handshake(SCS_13, self.default_key)),
                    OutboundKind::Handshake,
                ),
                SessionState::Established => unreachable!("checked above"),
            }
        } else if let Some(head) = self.queue.front() {
            let data = head.command.encode();
            let security = established.then(|| {
                if data.is_empty() {
                    SecurityBlock::mac_only(SCS_15)
                } else {
                    SecurityBlock::encrypted(SCS_17)
                }
            });
            (head.command.code(), data, security, OutboundKind::Command)
        } else {
            let security = established.then(|| SecurityBlock::mac_only(SCS_15));
            (CMD_POLL, Vec::new(), security, OutboundKind::Poll)
        };

        self.last_outbound = Some(kind);
        let frame = Frame {
            address: self.address,
            from_pd: false,
            sequence: self.sequence,
            use_crc: self.use_crc,
            security,
            code,
            data,
        };
        frame.encode(self.secure.as_mut())
    }

    /// Process a decoded frame addressed from this device.
    ///
    /// Verifies the sequence, unwraps secure payloads, advances the
    /// session on handshake replies, and correlates everything else
    /// against the head of the command queue.
    pub fn accept_reply(&mut self, frame: DecodedFrame) -> Result<Disposition> {
        if frame.sequence != self.sequence {
            return Err(OsdpError::FrameInvalid {
                reason: "reply sequence mismatch",
            });
        }

        let payload = if let Some(mac) = frame.mac {
            let Some(session) = self.secure.as_mut() else {
                return Err(OsdpError::FrameInvalid {
                    reason: "unexpected security block",
                });
            };
            let encrypted = frame
                .security
                .as_ref()
                .is_some_and(|s| s.block_type == SCS_18);
            session.unwrap_reply(&frame.mac_input, &mac, &frame.data, encrypted)?
        } else {
            // Once the channel is up, every reply must carry a MAC; a
            // plaintext frame here is spoofable and gets no credit.
            if self
                .secure
                .as_ref()
                .is_some_and(SecureChannelSession::is_established)
            {
                return Err(OsdpError::FrameInvalid {
                    reason: "unsecured reply on established secure channel",
                });
            }
            frame.data
        };

        let Some(reply_type) = ReplyType::from_code(frame.code) else {
            return Err(OsdpError::FrameInvalid {
                reason: "unknown reply code",
            });
        };

        // Handshake replies advance the session and are never surfaced.
        if matches!(
            reply_type,
            ReplyType::ChallengeResponse | ReplyType::InitialRMac
        ) {
            let Some(session) = self.secure.as_mut() else {
                return Err(OsdpError::FrameInvalid {
                    reason: "handshake reply without secure channel",
                });
            };
            match reply_type {
                ReplyType::ChallengeResponse => session.handle_challenge_response(&payload)?,
                _ => session.handle_initial_rmac(&payload)?,
            }
            self.mark_success();
            return Ok(Disposition::Session);
        }

        if self.last_outbound == Some(OutboundKind::Handshake) {
            // The PD answered a CHLNG/SCRYPT with something other than the
            // handshake reply (typically a NAK): give up on the session
            // until the next restart.
            if let Some(session) = self.secure.as_mut() {
                session.break_session();
            }
            warn!(
                "Device {:#04x} rejected secure channel establishment ({:?})",
                self.address, reply_type
            );
            self.mark_success();
            return Ok(Disposition::Session);
        }

        let delivered = self.last_outbound == Some(OutboundKind::Command)
            && reply_type != ReplyType::Busy
            && self
                .queue
                .front()
                .is_some_and(|head| head.command.accepts(reply_type));

        self.mark_success();

        let mut issuing = None;
        if delivered && let Some(head) = self.queue.pop_front() {
            issuing = Some((head.command.code(), head.transaction));
        }

        let reply = Reply {
            connection_id: self.connection_id,
            address: self.address,
            reply_type,
            issuing_command: issuing,
            payload,
            sequence: frame.sequence,
        };
        Ok(if reply.issuing_command.is_some() {
            Disposition::Delivered(reply)
        } else {
            Disposition::Unsolicited(reply)
        })
    }

    /// Record a missed cycle (reply window elapsed or frame invalid).
    pub fn on_timeout(&mut self) {
        let was_handshake = self.last_outbound == Some(OutboundKind::Handshake);
        self.last_outbound = None;
        self.misses = self.misses.saturating_add(1);

        if was_handshake && let Some(session) = self.secure.as_mut() {
            session.break_session();
        }

        if self.online && self.misses >= self.offline_threshold {
            debug!(
                "Device {:#04x}: {} consecutive misses, marking offline",
                self.address, self.misses
            );
            self.online = false;
            self.sequence = 0;
            if let Some(session) = self.secure.as_mut() {
                session.break_session();
            }
        }
    }

    /// Force the device back to its initial state: offline, session torn
    /// down, sequence zeroed, queue cleared.
    pub fn reset(&mut self) {
        self.online = false;
        self.sequence = 0;
        self.misses = 0;
        self.queue.clear();
        self.last_outbound = None;
        if let Some(session) = self.secure.as_mut() {
            session.reset();
        }
    }

    /// Install a new secure channel base key (after a KEYSET exchange);
    /// the session re-establishes under the new key on the next cycle.
    pub fn set_secure_key(&mut self, key: SecureKey) {
        self.default_key = false;
        match self.secure.as_mut() {
            Some(session) => session.set_key(key),
            None => self.secure = Some(SecureChannelSession::new(key)),
        }
    }

    fn mark_success(&mut self) {
        self.misses = 0;
        self.online = true;
        self.last_valid_reply_at = Some(Instant::now());
        self.last_outbound = None;
        self.sequence = (self.sequence + 1) & SEQUENCE_MASK;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{OutputControlCode, PivDataSelector};
    use crate::constants::{
        CMD_ID, CMD_OUT, DEFAULT_OFFLINE_THRESHOLD, REPLY_ACK, REPLY_BUSY, REPLY_CCRYPT,
        REPLY_PDID, REPLY_RAW, REPLY_RMAC_I,
    };
    use crate::frame::FrameAccumulator;
    use crate::secure::{aes_encrypt_block, chained_mac, derive_session_keys};

    fn device() -> DeviceProxy {
        DeviceProxy::new(
            ConnectionId::new(7),
            0x01,
            false,
            None,
            false,
            DEFAULT_OFFLINE_THRESHOLD,
        )
    }

    fn decode_one(bytes: &[u8]) -> DecodedFrame {
        let mut acc = FrameAccumulator::new();
        acc.push(bytes);
        acc.next_frame().unwrap().unwrap()
    }

    /// Build a plain PD reply frame matching the device's current sequence.
    fn pd_reply(device: &DeviceProxy, code: u8, data: &[u8]) -> DecodedFrame {
        let bytes = Frame {
            address: device.address(),
            from_pd: true,
            sequence: device.sequence(),
            use_crc: false,
            security: None,
            code,
            data: data.to_vec(),
        }
        .encode(None)
        .unwrap();
        decode_one(&bytes)
    }

    fn queued(command: Command, id: u64) -> QueuedCommand {
        QueuedCommand {
            command,
            transaction: TransactionId(id),
        }
    }

    #[test]
    fn test_idle_device_polls() {
        let mut dev = device();
        let bytes = dev.next_outbound().unwrap();
        let frame = decode_one(&bytes);
        assert_eq!(frame.code, CMD_POLL);
        assert_eq!(frame.address, 0x01);
        assert!(!frame.from_pd);
    }

    #[test]
    fn test_queued_command_preempts_poll() {
        let mut dev = device();
        dev.enqueue(queued(Command::IdReport, 1));
        let frame = decode_one(&dev.next_outbound().unwrap());
        assert_eq!(frame.code, CMD_ID);
        // Not popped until its reply arrives.
        assert_eq!(dev.queue_len(), 1);
    }

    #[test]
    fn test_delivered_reply_pops_head_fifo() {
        let mut dev = device();
        dev.enqueue(queued(Command::IdReport, 1));
        dev.enqueue(queued(Command::DeviceCapabilities, 2));

        let _ = dev.next_outbound().unwrap();
        let disposition = dev.accept_reply(pd_reply(&dev, REPLY_PDID, &[0u8; 12])).unwrap();
        let Disposition::Delivered(reply) = disposition else {
            panic!("expected Delivered");
        };
        assert_eq!(reply.reply_type, ReplyType::IdReport);
        assert_eq!(reply.issuing_command, Some((CMD_ID, TransactionId(1))));
        assert_eq!(dev.queue_len(), 1);

        // Next cycle serves the second command.
        let frame = decode_one(&dev.next_outbound().unwrap());
        assert_eq!(frame.code, crate::constants::CMD_CAP);
    }

    #[test]
    fn test_sequence_advances_only_on_accepted_reply() {
        let mut dev = device();
        assert_eq!(dev.sequence(), 0);

        let _ = dev.next_outbound().unwrap();
        dev.accept_reply(pd_reply(&dev, REPLY_ACK, &[])).unwrap();
        assert_eq!(dev.sequence(), 1);

        let _ = dev.next_outbound().unwrap();
        dev.on_timeout();
        assert_eq!(dev.sequence(), 1, "timeout must not advance the sequence");

        // Wraps modulo 4.
        for expected in [2, 3, 0, 1] {
            let _ = dev.next_outbound().unwrap();
            dev.accept_reply(pd_reply(&dev, REPLY_ACK, &[])).unwrap();
            assert_eq!(dev.sequence(), expected);
        }
    }

    #[test]
    fn test_sequence_mismatch_rejected() {
        let mut dev = device();
        let _ = dev.next_outbound().unwrap();
        let stale = Frame {
            address: 0x01,
            from_pd: true,
            sequence: (dev.sequence() + 1) & SEQUENCE_MASK,
            use_crc: false,
            security: None,
            code: REPLY_ACK,
            data: Vec::new(),
        }
        .encode(None)
        .unwrap();
        assert!(dev.accept_reply(decode_one(&stale)).is_err());
        assert_eq!(dev.sequence(), 0);
    }

    #[test]
    fn test_online_hysteresis() {
        let mut dev = device();
        assert!(!dev.online());

        // One good reply brings it online.
        let _ = dev.next_outbound().unwrap();
        dev.accept_reply(pd_reply(&dev, REPLY_ACK, &[])).unwrap();
        assert!(dev.online());

        // Four misses: still online. The fifth tips it over.
        for _ in 0..4 {
            let _ = dev.next_outbound().unwrap();
            dev.on_timeout();
            assert!(dev.online());
        }
        let _ = dev.next_outbound().unwrap();
        dev.on_timeout();
        assert!(!dev.online());
        assert_eq!(dev.sequence(), 0, "sequence resets when the link drops");

        // A single reply brings it straight back.
        let _ = dev.next_outbound().unwrap();
        dev.accept_reply(pd_reply(&dev, REPLY_ACK, &[])).unwrap();
        assert!(dev.online());
    }

    #[test]
    fn test_unsolicited_card_data_does_not_touch_queue() {
        let mut dev = device();
        dev.enqueue(queued(
            Command::OutputControl {
                output: 0,
                control: OutputControlCode::TimedOn,
                timer: 10,
            },
            5,
        ));

        let _ = dev.next_outbound().unwrap();
        // Card data is not in OutputControl's reply row.
        let disposition = dev
            .accept_reply(pd_reply(&dev, REPLY_RAW, &[0x01, 26, 0, 0, 0xAB, 0xCD]))
            .unwrap();
        assert!(matches!(disposition, Disposition::Unsolicited(_)));
        assert_eq!(dev.queue_len(), 1, "head stays queued for the next cycle");

        let frame = decode_one(&dev.next_outbound().unwrap());
        assert_eq!(frame.code, CMD_OUT);
    }

    #[test]
    fn test_busy_leaves_command_queued() {
        let mut dev = device();
        dev.enqueue(queued(Command::IdReport, 9));
        let _ = dev.next_outbound().unwrap();
        let disposition = dev.accept_reply(pd_reply(&dev, REPLY_BUSY, &[])).unwrap();
        assert!(matches!(disposition, Disposition::Unsolicited(_)));
        assert_eq!(dev.queue_len(), 1);
    }

    #[test]
    fn test_poll_reply_is_unsolicited() {
        let mut dev = device();
        let _ = dev.next_outbound().unwrap(); // POLL
        let disposition = dev.accept_reply(pd_reply(&dev, REPLY_ACK, &[])).unwrap();
        assert!(matches!(disposition, Disposition::Unsolicited(_)));
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut dev = device();
        dev.enqueue(queued(Command::IdReport, 1));
        let _ = dev.next_outbound().unwrap();
        dev.accept_reply(pd_reply(&dev, REPLY_PDID, &[0u8; 12])).unwrap();
        dev.enqueue(queued(Command::IdReport, 2));

        dev.reset();
        assert!(!dev.online());
        assert_eq!(dev.sequence(), 0);
        assert_eq!(dev.queue_len(), 0);
    }

    #[test]
    fn test_secure_handshake_preempts_and_establishes() {
        let key = [0x42u8; 16];
        let mut dev = DeviceProxy::new(
            ConnectionId::new(1),
            0x0A,
            true,
            Some(SecureKey::new(key)),
            false,
            DEFAULT_OFFLINE_THRESHOLD,
        );
        dev.enqueue(queued(Command::IdReport, 1));

        // Establishment preempts the queued command.
        let chlng = decode_one(&dev.next_outbound().unwrap());
        assert_eq!(chlng.code, CMD_CHLNG);
        assert_eq!(chlng.data.len(), 8);
        let mut rnd_a = [0u8; 8];
        rnd_a.copy_from_slice(&chlng.data);

        // PD side of the handshake, computed with the same primitives.
        let keys = derive_session_keys(&key, &rnd_a);
        let rnd_b = [9u8; 8];
        let mut block = [0u8; 16];
        block[..8].copy_from_slice(&rnd_a);
        block[8..].copy_from_slice(&rnd_b);
        let client = aes_encrypt_block(&keys.s_enc, &block);
        let mut ccrypt_payload = vec![0u8; 8];
        ccrypt_payload.extend_from_slice(&rnd_b);
        ccrypt_payload.extend_from_slice(&client);

        let ccrypt = pd_reply(&dev, REPLY_CCRYPT, &ccrypt_payload);
        assert!(matches!(
            dev.accept_reply(ccrypt).unwrap(),
            Disposition::Session
        ));
        assert_eq!(
            dev.secure_session_state(),
            Some(SessionState::ServerCryptogramSent)
        );

        let scrypt = decode_one(&dev.next_outbound().unwrap());
        assert_eq!(scrypt.code, CMD_SCRYPT);
        block[..8].copy_from_slice(&rnd_b);
        block[8..].copy_from_slice(&rnd_a);
        let server = aes_encrypt_block(&keys.s_enc, &block);
        assert_eq!(scrypt.data, server);

        let rmac_i = aes_encrypt_block(&keys.smac2, &aes_encrypt_block(&keys.smac1, &server));
        let rmac_frame = pd_reply(&dev, REPLY_RMAC_I, &rmac_i);
        assert!(matches!(
            dev.accept_reply(rmac_frame).unwrap(),
            Disposition::Session
        ));
        assert_eq!(dev.secure_session_state(), Some(SessionState::Established));

        // Now the queued command goes out, MAC'd under the session.
        let cmd = decode_one(&dev.next_outbound().unwrap());
        assert_eq!(cmd.code, CMD_ID);
        assert!(cmd.mac.is_some());

        // Its MAC chains from RMAC-I, verifiable from the PD side.
        let expected = chained_mac(&keys, &rmac_i, &cmd.mac_input);
        assert_eq!(cmd.mac.unwrap(), expected[..4]);
    }

    /// Drive a device through the full handshake, returning the PD-side
    /// session keys and the initial chaining vector.
    fn establish_secure(dev: &mut DeviceProxy, key: &[u8; 16]) -> (crate::secure::SessionKeys, [u8; 16]) {
        let chlng = decode_one(&dev.next_outbound().unwrap());
        let mut rnd_a = [0u8; 8];
        rnd_a.copy_from_slice(&chlng.data);

        let keys = derive_session_keys(key, &rnd_a);
        let rnd_b = [7u8; 8];
        let mut block = [0u8; 16];
        block[..8].copy_from_slice(&rnd_a);
        block[8..].copy_from_slice(&rnd_b);
        let client = aes_encrypt_block(&keys.s_enc, &block);
        let mut ccrypt_payload = vec![0u8; 8];
        ccrypt_payload.extend_from_slice(&rnd_b);
        ccrypt_payload.extend_from_slice(&client);
        let ccrypt = pd_reply(dev, REPLY_CCRYPT, &ccrypt_payload);
        dev.accept_reply(ccrypt).unwrap();

        let scrypt = decode_one(&dev.next_outbound().unwrap());
        let scrypt_data: [u8; 16] = scrypt.data.as_slice().try_into().unwrap();
        let rmac_i = aes_encrypt_block(&keys.smac2, &aes_encrypt_block(&keys.smac1, &scrypt_data));
        let rmac_frame = pd_reply(dev, REPLY_RMAC_I, &rmac_i);
        dev.accept_reply(rmac_frame).unwrap();
        assert_eq!(dev.secure_session_state(), Some(SessionState::Established));
        (keys, rmac_i)
    }

    #[test]
    fn test_plaintext_reply_rejected_on_established_session() {
        let key = [0x13u8; 16];
        let mut dev = DeviceProxy::new(
            ConnectionId::new(1),
            0x0A,
            false,
            Some(SecureKey::new(key)),
            false,
            DEFAULT_OFFLINE_THRESHOLD,
        );
        let _ = establish_secure(&mut dev, &key);

        let _ = dev.next_outbound().unwrap();
        let err = dev
            .accept_reply(pd_reply(&dev, REPLY_ACK, &[]))
            .unwrap_err();
        assert!(matches!(err, OsdpError::FrameInvalid { .. }));
    }

    #[test]
    fn test_handshake_timeout_breaks_session() {
        let mut dev = DeviceProxy::new(
            ConnectionId::new(1),
            0x0A,
            false,
            Some(SecureKey::new([1u8; 16])),
            false,
            DEFAULT_OFFLINE_THRESHOLD,
        );
        let _ = dev.next_outbound().unwrap();
        assert_eq!(dev.secure_session_state(), Some(SessionState::ChallengeSent));
        dev.on_timeout();
        assert_eq!(dev.secure_session_state(), Some(SessionState::Broken));

        // Next cycle restarts from a fresh challenge.
        let frame = decode_one(&dev.next_outbound().unwrap());
        assert_eq!(frame.code, CMD_CHLNG);
    }

    #[test]
    fn test_at_most_one_in_flight() {
        let mut dev = device();
        for i in 0..10 {
            dev.enqueue(queued(Command::IdReport, i));
        }
        // However deep the queue, a cycle transmits exactly the head, and
        // it stays queued until its reply lands.
        for remaining in (1..=10u64).rev() {
            let frame = decode_one(&dev.next_outbound().unwrap());
            assert_eq!(frame.code, CMD_ID);
            assert_eq!(dev.queue_len(), remaining as usize);
            let disposition = dev
                .accept_reply(pd_reply(&dev, REPLY_PDID, &[0u8; 12]))
                .unwrap();
            let Disposition::Delivered(reply) = disposition else {
                panic!("expected Delivered");
            };
            assert_eq!(
                reply.issuing_command.unwrap().1,
                TransactionId(10 - remaining)
            );
        }
        assert_eq!(dev.queue_len(), 0);
    }

    #[test]
    fn test_get_piv_data_first_fragment_delivers() {
        let mut dev = device();
        dev.enqueue(queued(
            Command::GetPivData(PivDataSelector {
                object_id: [0x5F, 0xC1, 0x02],
                element_id: 0,
                data_offset: 0,
            }),
            3,
        ));
        let _ = dev.next_outbound().unwrap();
        let fragment = crate::reply::PivFragment {
            whole_length: 300,
            offset: 0,
            data: vec![0u8; 128],
        };
        let disposition = dev
            .accept_reply(pd_reply(&dev, crate::constants::REPLY_PIVDATAR, &fragment.encode()))
            .unwrap();
        assert!(matches!(disposition, Disposition::Delivered(_)));
        assert_eq!(dev.queue_len(), 0);
    }
}
