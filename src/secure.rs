// MIT License - Copyright (c) 2026 Peter Wright
// Secure channel session

use aes::Aes128;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit, generic_array::GenericArray};
use tracing::debug;
use zeroize::Zeroize;

use crate::error::{OsdpError, Result};

/// Default secure channel base key, used when no installation key has been
/// provisioned. Offers no secrecy; a real deployment installs its own key
/// with a KEYSET command.
pub const SCBK_D: [u8; 16] = *b"0123456789:;<=>?";

/// A 16-byte secure channel base key. Scrubbed from memory on drop.
#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct SecureKey([u8; 16]);

impl SecureKey {
    pub fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl std::fmt::Debug for SecureKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecureKey(..)")
    }
}

/// Session keys derived from the base key and the ACU challenge.
#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub(crate) struct SessionKeys {
    pub s_enc: [u8; 16],
    pub smac1: [u8; 16],
    pub smac2: [u8; 16],
}

/// Secure channel establishment states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    None,
    ChallengeSent,
    ServerCryptogramSent,
    Established,
    Broken,
}

/// Per-device secure channel state machine.
///
/// Drives the CHLNG/CCRYPT/SCRYPT/RMAC_I handshake and, once established,
/// MACs every frame in both directions with a single chaining vector and
/// encrypts/decrypts SCS_17/SCS_18 payloads.
pub struct SecureChannelSession {
    scbk: SecureKey,
    state: SessionState,
    rnd_a: [u8; 8],
    keys: Option<SessionKeys>,
    server_cryptogram: [u8; 16],
    chain: [u8; 16],
}

impl SecureChannelSession {
    pub fn new(key: SecureKey) -> Self {
        Self {
            scbk: key,
            state: SessionState::None,
            rnd_a: [0; 8],
            keys: None,
            server_cryptogram: [0; 16],
            chain: [0; 16],
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == SessionState::Established
    }

    /// Begin (or restart) the handshake: pick a fresh challenge and move to
    /// `ChallengeSent`. Returns the RND.A bytes for the CHLNG command.
    pub fn start_handshake(&mut self) -> [u8; 8] {
        self.keys = None;
        self.chain = [0; 16];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut self.rnd_a);
        self.state = SessionState::ChallengeSent;
        self.rnd_a
    }

    /// Process the PD's CCRYPT reply: derive session keys, verify the
    /// client cryptogram, and compute the server cryptogram for SCRYPT.
    pub fn handle_challenge_response(&mut self, payload: &[u8]) -> Result<()> {
        if self.state != SessionState::ChallengeSent {
            // Not ours to process; an established session must not be torn
            // down by a stray plaintext CCRYPT.
            return Err(OsdpError::SecureChannelFailed {
                phase: "unexpected challenge response",
            });
        }
        if payload.len() != 32 {
            self.state = SessionState::Broken;
            return Err(OsdpError::SecureChannelFailed {
                phase: "challenge response",
            });
        }
        let mut rnd_b = [0u8; 8];
        rnd_b.copy_from_slice(&payload[8..16]);

        let keys = derive_session_keys(self.scbk.as_bytes(), &self.rnd_a);

        let mut block = [0u8; 16];
        block[..8].copy_from_slice(&self.rnd_a);
        block[8..].copy_from_slice(&rnd_b);
        let expected_client = aes_encrypt_block(&keys.s_enc, &block);
        if expected_client[..] != payload[16..32] {
            self.state = SessionState::Broken;
            return Err(OsdpError::SecureChannelFailed {
                phase: "client cryptogram",
            });
        }

        block[..8].copy_from_slice(&rnd_b);
        block[8..].copy_from_slice(&self.rnd_a);
        self.server_cryptogram = aes_encrypt_block(&keys.s_enc, &block);

        self.keys = Some(keys);
        self.state = SessionState::ServerCryptogramSent;
        debug!("Client cryptogram verified, session keys derived");
        Ok(())
    }

    /// The cryptogram to send in the SCRYPT command.
    pub fn server_cryptogram(&self) -> [u8; 16] {
        self.server_cryptogram
    }

    /// Process the PD's RMAC_I reply, seeding the MAC chaining vector and
    /// completing establishment.
    pub fn handle_initial_rmac(&mut self, payload: &[u8]) -> Result<()> {
        if self.state != SessionState::ServerCryptogramSent {
            return Err(OsdpError::SecureChannelFailed {
                phase: "unexpected initial R-MAC",
            });
        }
        let Some(keys) = self.keys.as_ref() else {
            self.state = SessionState::Broken;
            return Err(OsdpError::SecureChannelFailed {
                phase: "initial R-MAC",
            });
        };
        let expected = aes_encrypt_block(
            &keys.smac2,
            &aes_encrypt_block(&keys.smac1, &self.server_cryptogram),
        );
        if payload != expected {
            self.state = SessionState::Broken;
            return Err(OsdpError::SecureChannelFailed {
                phase: "initial R-MAC",
            });
        }
        self.chain = expected;
        self.state = SessionState::Established;
        debug!("Secure channel established");
        Ok(())
    }

    /// MAC an outbound frame and advance the chaining vector. The frame's
    /// first four MAC bytes go on the wire.
    pub fn compute_mac(&mut self, frame: &[u8]) -> Result<[u8; 16]> {
        let Some(keys) = self.keys.as_ref() else {
            return Err(OsdpError::SecureChannelFailed { phase: "mac" });
        };
        let mac = chained_mac(keys, &self.chain, frame);
        self.chain = mac;
        Ok(mac)
    }

    /// Verify a reply MAC, decrypt the payload if the block type says so,
    /// and advance the chaining vector.
    ///
    /// Decryption has to run before the vector advances: the reply's IV is
    /// derived from the command MAC, not from the reply's own.
    pub fn unwrap_reply(
        &mut self,
        covered: &[u8],
        mac: &[u8; 4],
        data: &[u8],
        encrypted: bool,
    ) -> Result<Vec<u8>> {
        let Some(keys) = self.keys.as_ref() else {
            self.state = SessionState::Broken;
            return Err(OsdpError::SecureChannelFailed { phase: "reply mac" });
        };
        let expected = chained_mac(keys, &self.chain, covered);
        if expected[..4] != mac[..] {
            self.state = SessionState::Broken;
            return Err(OsdpError::SecureChannelFailed { phase: "reply mac" });
        }
        let plain = if encrypted {
            let iv = invert(&self.chain);
            cbc_decrypt(&keys.s_enc, &iv, data)?
        } else {
            data.to_vec()
        };
        self.chain = expected;
        Ok(plain)
    }

    /// Encrypt outbound payload data (SCS_17). The IV is the inverted
    /// current chaining vector, so this must run before `compute_mac`.
    pub fn encrypt_data(&self, data: &[u8]) -> Result<Vec<u8>> {
        let Some(keys) = self.keys.as_ref() else {
            return Err(OsdpError::SecureChannelFailed { phase: "encrypt" });
        };
        let iv = invert(&self.chain);
        Ok(cbc_encrypt(&keys.s_enc, &iv, data))
    }

    /// Force the session out of service; the next poll cycle restarts the
    /// handshake from scratch.
    pub fn break_session(&mut self) {
        if self.state != SessionState::None {
            self.state = SessionState::Broken;
        }
        self.keys = None;
    }

    /// Return to the initial state, keeping the base key.
    pub fn reset(&mut self) {
        self.state = SessionState::None;
        self.keys = None;
        self.chain = [0; 16];
    }

    /// Install a new base key and drop any established state.
    pub fn set_key(&mut self, key: SecureKey) {
        self.scbk = key;
        self.reset();
    }

    #[cfg(test)]
    pub(crate) fn session_keys(&self) -> Option<&SessionKeys> {
        self.keys.as_ref()
    }

    #[cfg(test)]
    pub(crate) fn chain_vector(&self) -> [u8; 16] {
        self.chain
    }
}

/// Derive S-ENC / S-MAC1 / S-MAC2 from the base key and RND.A.
pub(crate) fn derive_session_keys(scbk: &[u8; 16], rnd_a: &[u8; 8]) -> SessionKeys {
    let mut seed = [0u8; 16];
    seed[0] = 0x01;
    seed[2..8].copy_from_slice(&rnd_a[..6]);

    seed[1] = 0x82;
    let s_enc = aes_encrypt_block(scbk, &seed);
    seed[1] = 0x01;
    let smac1 = aes_encrypt_block(scbk, &seed);
    seed[1] = 0x02;
    let smac2 = aes_encrypt_block(scbk, &seed);

    SessionKeys { s_enc, smac1, smac2 }
}

pub(crate) fn aes_encrypt_block(key: &[u8; 16], block: &[u8; 16]) -> [u8; 16] {
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut b = GenericArray::clone_from_slice(block);
    cipher.encrypt_block(&mut b);
    b.into()
}

fn aes_decrypt_block(key: &[u8; 16], block: &[u8; 16]) -> [u8; 16] {
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut b = GenericArray::clone_from_slice(block);
    cipher.decrypt_block(&mut b);
    b.into()
}

/// CBC-MAC with the OSDP key split: S-MAC1 for every block except the
/// last, which uses S-MAC2. The result chains into the next frame's IV.
pub(crate) fn chained_mac(keys: &SessionKeys, iv: &[u8; 16], data: &[u8]) -> [u8; 16] {
    let padded = pad_block(data);
    let block_count = padded.len() / 16;
    let mut chain = *iv;
    for (i, block) in padded.chunks_exact(16).enumerate() {
        let mut x = [0u8; 16];
        for (j, byte) in x.iter_mut().enumerate() {
            *byte = block[j] ^ chain[j];
        }
        let key = if i == block_count - 1 {
            &keys.smac2
        } else {
            &keys.smac1
        };
        chain = aes_encrypt_block(key, &x);
    }
    chain
}

/// Pad with 0x80 then zeros to the next 16-byte boundary. Input that is
/// already block-aligned gains a full padding block, so stripping is
/// unambiguous.
fn pad_block(data: &[u8]) -> Vec<u8> {
    let mut padded = data.to_vec();
    padded.push(0x80);
    while padded.len() % 16 != 0 {
        padded.push(0x00);
    }
    padded
}

fn strip_padding(mut data: Vec<u8>) -> Result<Vec<u8>> {
    while let Some(&last) = data.last() {
        match last {
            0x00 => {
                data.pop();
            }
            0x80 => {
                data.pop();
                return Ok(data);
            }
            _ => break,
        }
    }
    Err(OsdpError::SecureChannelFailed { phase: "padding" })
}

pub(crate) fn cbc_encrypt(key: &[u8; 16], iv: &[u8; 16], data: &[u8]) -> Vec<u8> {
    let padded = pad_block(data);
    let mut out = Vec::with_capacity(padded.len());
    let mut chain = *iv;
    for block in padded.chunks_exact(16) {
        let mut x = [0u8; 16];
        for (j, byte) in x.iter_mut().enumerate() {
            *byte = block[j] ^ chain[j];
        }
        chain = aes_encrypt_block(key, &x);
        out.extend_from_slice(&chain);
    }
    out
}

pub(crate) fn cbc_decrypt(key: &[u8; 16], iv: &[u8; 16], data: &[u8]) -> Result<Vec<u8>> {
    if data.is_empty() || data.len() % 16 != 0 {
        return Err(OsdpError::SecureChannelFailed { phase: "decrypt" });
    }
    let mut out = Vec::with_capacity(data.len());
    let mut chain = *iv;
    for block in data.chunks_exact(16) {
        let mut b = [0u8; 16];
        b.copy_from_slice(block);
        let plain = aes_decrypt_block(key, &b);
        for (j, byte) in plain.iter().enumerate() {
            out.push(byte ^ chain[j]);
        }
        chain = b;
    }
    strip_padding(out)
}

fn invert(v: &[u8; 16]) -> [u8; 16] {
    let mut out = [0u8; 16];
    for (i, byte) in v.iter().enumerate() {
        out[i] = !byte;
    }
    out
}
