// MIT License - Copyright (c) 2026 Peter Wright
// Multi-part reply reassembly

use std::collections::HashMap;

use tracing::debug;

use crate::error::{OsdpError, Result};
use crate::reply::{PivFragment, ReplyType};
use crate::transport::ConnectionId;

/// Key for one in-flight multi-part transfer: fragments are reassembled
/// per device and reply kind, not per caller.
pub type ReassemblyKey = (ConnectionId, u8, ReplyType);

/// A single reassembly buffer. Coverage is tracked per byte so overlapping
/// fragments are fine and completion means every byte has been written.
#[derive(Debug)]
struct ReassemblyBuffer {
    data: Vec<u8>,
    covered: Vec<bool>,
}

impl ReassemblyBuffer {
    fn new(whole: usize) -> Self {
        Self {
            data: vec![0; whole],
            covered: vec![false; whole],
        }
    }

    fn apply(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        let end = offset
            .checked_add(bytes.len())
            .ok_or(OsdpError::FragmentOutOfRange {
                offset,
                length: bytes.len(),
                whole: self.data.len(),
            })?;
        if end > self.data.len() {
            return Err(OsdpError::FragmentOutOfRange {
                offset,
                length: bytes.len(),
                whole: self.data.len(),
            });
        }
        self.data[offset..end].copy_from_slice(bytes);
        for flag in &mut self.covered[offset..end] {
            *flag = true;
        }
        Ok(())
    }

    fn is_complete(&self) -> bool {
        self.covered.iter().all(|&c| c)
    }
}

/// Holds the reassembly buffers for every in-flight multi-part transfer.
#[derive(Debug, Default)]
pub struct Reassembler {
    buffers: HashMap<ReassemblyKey, ReassemblyBuffer>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one fragment. Returns the complete message once every byte of
    /// the declared whole length is covered.
    ///
    /// A fragment declaring a different whole length restarts the buffer;
    /// a fragment outside the declared bounds discards it and fails.
    pub fn apply(&mut self, key: ReassemblyKey, fragment: &PivFragment) -> Result<Option<Vec<u8>>> {
        let whole = fragment.whole_length as usize;

        let restart = self
            .buffers
            .get(&key)
            .is_some_and(|buf| buf.data.len() != whole);
        if restart {
            debug!(
                "Reassembly for {:?} restarted: whole length changed to {}",
                key, whole
            );
            self.buffers.remove(&key);
        }

        let buffer = self
            .buffers
            .entry(key)
            .or_insert_with(|| ReassemblyBuffer::new(whole));

        if let Err(e) = buffer.apply(fragment.offset as usize, &fragment.data) {
            self.buffers.remove(&key);
            return Err(e);
        }

        if buffer.is_complete() {
            return Ok(self.buffers.remove(&key).map(|b| b.data));
        }
        Ok(None)
    }

    /// Drop the buffer for one transfer, if any.
    pub fn discard(&mut self, key: &ReassemblyKey) {
        self.buffers.remove(key);
    }

    /// Drop every buffer (shutdown).
    pub fn clear(&mut self) {
        self.buffers.clear();
    }
}
