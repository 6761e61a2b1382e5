// MIT License - Copyright (c) 2026 Peter Wright
// OSDP frame codec

use bitflags::bitflags;

use crate::constants::{
    CRC_TABLE, MAX_FRAME_LEN, MIN_FRAME_LEN, REPLY_ADDRESS_FLAG, SCS_15, SCS_17, SCS_18,
    SEQUENCE_MASK, SOM,
};
use crate::error::{OsdpError, Result};
use crate::secure::SecureChannelSession;

bitflags! {
    /// Flag bits of the frame control byte. The low two bits hold the
    /// sequence number and are masked out separately.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ControlFlags: u8 {
        /// Frame carries a 16-bit CRC instead of an 8-bit checksum.
        const CRC16 = 0x04;
        /// Frame carries a security block.
        const SECURITY = 0x08;
    }
}

/// Security block carried between the frame header and the payload.
///
/// Encoded on the wire as `[length, type, data...]` where `length` counts
/// itself and the type byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityBlock {
    pub block_type: u8,
    pub data: Vec<u8>,
}

impl SecurityBlock {
    /// Block for a handshake frame (CHLNG/SCRYPT). The single data byte
    /// names the base key in use: 0 for the default key, 1 for installed.
    pub fn handshake(block_type: u8, default_key: bool) -> Self {
        Self {
            block_type,
            data: vec![if default_key { 0x00 } else { 0x01 }],
        }
    }

    /// Block for an established-session frame with no encrypted data.
    pub fn mac_only(block_type: u8) -> Self {
        Self {
            block_type,
            data: Vec::new(),
        }
    }

    /// Block for an established-session frame whose data is encrypted.
    pub fn encrypted(block_type: u8) -> Self {
        Self {
            block_type,
            data: Vec::new(),
        }
    }

    fn encoded_len(&self) -> usize {
        2 + self.data.len()
    }

    /// Whether frames carrying this block are MAC'd (established-session
    /// block types; handshake blocks are not).
    pub fn has_mac(&self) -> bool {
        (SCS_15..=SCS_18).contains(&self.block_type)
    }
}

/// An outbound frame before encoding.
#[derive(Debug, Clone)]
pub struct Frame {
    pub address: u8,
    pub from_pd: bool,
    pub sequence: u8,
    pub use_crc: bool,
    pub security: Option<SecurityBlock>,
    pub code: u8,
    pub data: Vec<u8>,
}

impl Frame {
    /// Encode to wire bytes. A session is required when the security block
    /// calls for a MAC or encrypted data; handshake and plaintext frames
    /// pass `None`.
    pub fn encode(&self, session: Option<&mut SecureChannelSession>) -> Result<Vec<u8>> {
        let mut session = session;
        let needs_mac = self.security.as_ref().is_some_and(SecurityBlock::has_mac);
        let needs_encrypt = self
            .security
            .as_ref()
            .is_some_and(|s| matches!(s.block_type, SCS_17 | SCS_18));

        let body = if needs_encrypt {
            let s = session
                .as_deref_mut()
                .ok_or(OsdpError::SecureChannelFailed { phase: "encrypt" })?;
            s.encrypt_data(&self.data)?
        } else {
            self.data.clone()
        };

        let scb_len = self.security.as_ref().map_or(0, SecurityBlock::encoded_len);
        let total = 5
            + scb_len
            + 1
            + body.len()
            + if needs_mac { 4 } else { 0 }
            + if self.use_crc { 2 } else { 1 };

        let mut out = Vec::with_capacity(total);
        out.push(SOM);
        out.push(self.address | if self.from_pd { REPLY_ADDRESS_FLAG } else { 0 });
        out.push((total & 0xFF) as u8);
        out.push((total >> 8) as u8);

        let mut flags = ControlFlags::empty();
        if self.use_crc {
            flags |= ControlFlags::CRC16;
        }
        if self.security.is_some() {
            flags |= ControlFlags::SECURITY;
        }
        out.push(flags.bits() | (self.sequence & SEQUENCE_MASK));

        if let Some(scb) = &self.security {
            out.push(scb.encoded_len() as u8);
            out.push(scb.block_type);
            out.extend_from_slice(&scb.data);
        }

        out.push(self.code);
        out.extend_from_slice(&body);

        if needs_mac {
            let s = session
                .as_deref_mut()
                .ok_or(OsdpError::SecureChannelFailed { phase: "mac" })?;
            let mac = s.compute_mac(&out)?;
            out.extend_from_slice(&mac[..4]);
        }

        if self.use_crc {
            let crc = crc16(&out);
            out.extend_from_slice(&crc.to_le_bytes());
        } else {
            out.push(checksum(&out));
        }

        Ok(out)
    }
}

/// A structurally valid, integrity-checked inbound frame.
///
/// The payload `data` is still encrypted for SCS_18 frames; MAC
/// verification and decryption are the secure session's business, so the
/// bytes the MAC covers are carried along in `mac_input`.
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    pub address: u8,
    pub from_pd: bool,
    pub sequence: u8,
    pub use_crc: bool,
    pub security: Option<SecurityBlock>,
    pub code: u8,
    pub data: Vec<u8>,
    pub mac: Option<[u8; 4]>,
    pub mac_input: Vec<u8>,
}

/// Accumulates connection bytes and yields decoded frames, tolerating
/// arbitrary inter-frame noise by resynchronising on the SOM byte.
#[derive(Debug, Default)]
pub struct FrameAccumulator {
    buf: Vec<u8>,
}

impl FrameAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes read from the connection.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Drop any partially accumulated bytes (stale data from a previous
    /// reply window).
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Try to extract the next complete frame.
    ///
    /// `Ok(None)` means more bytes are needed. `Err` means a frame-sized
    /// chunk was consumed but failed its checksum/CRC or structure; the
    /// accumulator stays usable.
    pub fn next_frame(&mut self) -> Result<Option<DecodedFrame>> {
        loop {
            match self.buf.iter().position(|&b| b == SOM) {
                Some(0) => {}
                Some(pos) => {
                    self.buf.drain(..pos);
                }
                None => {
                    self.buf.clear();
                    return Ok(None);
                }
            }

            if self.buf.len() < 4 {
                return Ok(None);
            }

            let declared = u16::from_le_bytes([self.buf[2], self.buf[3]]) as usize;
            if !(MIN_FRAME_LEN..=MAX_FRAME_LEN).contains(&declared) {
                // Not a plausible frame start; resync past this SOM.
                self.buf.drain(..1);
                continue;
            }

            if self.buf.len() < declared {
                return Ok(None);
            }

            let raw: Vec<u8> = self.buf.drain(..declared).collect();
            return decode(&raw).map(Some);
        }
    }
}

fn decode(raw: &[u8]) -> Result<DecodedFrame> {
    let ctrl = raw[4];
    let flags = ControlFlags::from_bits_truncate(ctrl);
    let use_crc = flags.contains(ControlFlags::CRC16);
    let integrity_len = if use_crc { 2 } else { 1 };

    if raw.len() < 5 + 1 + integrity_len {
        return Err(OsdpError::FrameInvalid {
            reason: "frame shorter than header",
        });
    }
    let body_end = raw.len() - integrity_len;

    if use_crc {
        let expected = crc16(&raw[..body_end]);
        let received = u16::from_le_bytes([raw[body_end], raw[body_end + 1]]);
        if expected != received {
            return Err(OsdpError::FrameInvalid {
                reason: "CRC mismatch",
            });
        }
    } else {
        let expected = checksum(&raw[..body_end]);
        if expected != raw[body_end] {
            return Err(OsdpError::FrameInvalid {
                reason: "checksum mismatch",
            });
        }
    }

    let mut idx = 5;
    let security = if flags.contains(ControlFlags::SECURITY) {
        let scb_len = raw[idx] as usize;
        if scb_len < 2 || idx + scb_len > body_end {
            return Err(OsdpError::FrameInvalid {
                reason: "bad security block length",
            });
        }
        let block = SecurityBlock {
            block_type: raw[idx + 1],
            data: raw[idx + 2..idx + scb_len].to_vec(),
        };
        idx += scb_len;
        Some(block)
    } else {
        None
    };

    let has_mac = security.as_ref().is_some_and(SecurityBlock::has_mac);
    let mac_len = if has_mac { 4 } else { 0 };
    if body_end < idx + 1 + mac_len {
        return Err(OsdpError::FrameInvalid {
            reason: "truncated payload",
        });
    }

    let code = raw[idx];
    let data = raw[idx + 1..body_end - mac_len].to_vec();
    let mac = if has_mac {
        let mut m = [0u8; 4];
        m.copy_from_slice(&raw[body_end - 4..body_end]);
        Some(m)
    } else {
        None
    };

    Ok(DecodedFrame {
        address: raw[1] & !REPLY_ADDRESS_FLAG,
        from_pd: raw[1] & REPLY_ADDRESS_FLAG != 0,
        sequence: ctrl & SEQUENCE_MASK,
        use_crc,
        security,
        code,
        data,
        mac,
        mac_input: raw[..body_end - mac_len].to_vec(),
    })
}

/// CRC-16 over frame bytes (poly 0x1021, init 0x1D0F).
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0x1D0F;
    for &byte in data {
        crc = (crc << 8) ^ CRC_TABLE[(((crc >> 8) ^ byte as u16) & 0xFF) as usize];
    }
    crc
}

/// 8-bit checksum: two's complement of the byte sum, so that the sum of
/// the whole frame including the checksum is zero modulo 256.
pub fn checksum(data: &[u8]) -> u8 {
    0u8.wrapping_sub(data.iter().fold(0u8, |acc, b| acc.wrapping_add(*b)))
}
