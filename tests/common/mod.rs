// MIT License - Copyright (c) 2026 Peter Wright
// Shared test fixtures: in-memory connection + scripted PD

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use osdp_acu::constants::{
    CMD_CAP, CMD_ID, CMD_LSTAT, CMD_OUT, CMD_PIVDATA, CMD_POLL, CONFIG_ADDRESS, REPLY_ACK,
    REPLY_LSTATR, REPLY_NAK, REPLY_PDCAP, REPLY_PDID, REPLY_PIVDATAR, REPLY_RAW,
};
use osdp_acu::frame::{Frame, FrameAccumulator};
use osdp_acu::reply::PivFragment;
use osdp_acu::transport::Connection;
use osdp_acu::{OsdpError, Result};

/// In-memory duplex connection for the bus side; the other half goes to
/// the simulated PD. Cannot be reopened once closed.
pub struct TestConnection {
    stream: DuplexStream,
    open: bool,
}

pub fn connection_pair() -> (TestConnection, DuplexStream) {
    let (bus_side, pd_side) = tokio::io::duplex(4096);
    (
        TestConnection {
            stream: bus_side,
            open: true,
        },
        pd_side,
    )
}

impl Connection for TestConnection {
    async fn open(&mut self) -> Result<()> {
        if self.open { Ok(()) } else { Err(OsdpError::NotOpen) }
    }

    async fn close(&mut self) -> Result<()> {
        self.open = false;
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.stream.read(buf).await?)
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        Ok(self.stream.write_all(data).await?)
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

/// A PIV object the simulated PD will serve for the next osdp_PIVDATA
/// command, split into `fragment_size` pieces. The first `delay_polls`
/// polls after the command are acknowledged without a fragment, to
/// stretch the transfer out in time.
pub struct PivServe {
    pub data: Vec<u8>,
    pub fragment_size: usize,
    pub delay_polls: usize,
}

/// Shared knobs for steering the simulated PD from the test body.
#[derive(Clone)]
pub struct PdControl {
    /// While false the PD swallows every frame (a cut read side).
    pub responding: Arc<AtomicBool>,
    /// Card reads to attach to upcoming poll responses, one per poll.
    pub card_events: Arc<Mutex<VecDeque<Vec<u8>>>>,
    /// PIV object for the next osdp_PIVDATA command.
    pub piv: Arc<Mutex<Option<PivServe>>>,
}

impl PdControl {
    pub fn new() -> Self {
        Self {
            responding: Arc::new(AtomicBool::new(true)),
            card_events: Arc::new(Mutex::new(VecDeque::new())),
            piv: Arc::new(Mutex::new(None)),
        }
    }

    pub fn set_responding(&self, responding: bool) {
        self.responding.store(responding, Ordering::SeqCst);
    }

    pub fn push_card_event(&self, payload: Vec<u8>) {
        self.card_events.lock().unwrap().push_back(payload);
    }

    pub fn serve_piv(&self, serve: PivServe) {
        *self.piv.lock().unwrap() = Some(serve);
    }
}

/// Run a well-behaved PD at `address` on the far end of the duplex until
/// the bus side closes. Mirrors the received sequence number and framing
/// mode in every reply.
pub async fn run_pd(mut stream: DuplexStream, address: u8, control: PdControl) {
    let mut accumulator = FrameAccumulator::new();
    let mut buf = [0u8; 512];
    let mut pending_fragments: VecDeque<PivFragment> = VecDeque::new();
    let mut piv_delay = 0usize;

    loop {
        let n = match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        accumulator.push(&buf[..n]);

        loop {
            let frame = match accumulator.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(_) => continue,
            };
            if frame.from_pd || frame.address == CONFIG_ADDRESS {
                continue;
            }
            if frame.address != address || !control.responding.load(Ordering::SeqCst) {
                continue;
            }

            let (code, data): (u8, Vec<u8>) = match frame.code {
                CMD_POLL => {
                    if let Some(card) = control.card_events.lock().unwrap().pop_front() {
                        (REPLY_RAW, card)
                    } else if piv_delay > 0 {
                        piv_delay -= 1;
                        (REPLY_ACK, Vec::new())
                    } else if let Some(fragment) = pending_fragments.pop_front() {
                        (REPLY_PIVDATAR, fragment.encode())
                    } else {
                        (REPLY_ACK, Vec::new())
                    }
                }
                CMD_ID => (
                    REPLY_PDID,
                    vec![0x5C, 0x26, 0x23, 0x01, 0xDE, 0xAD, 0xBE, 0xEF, 0x01, 0x02, 0x03, 0x04],
                ),
                CMD_CAP => (REPLY_PDCAP, vec![0x01, 0x01, 0x01]),
                CMD_LSTAT => (REPLY_LSTATR, vec![0x00, 0x00]),
                CMD_OUT => (REPLY_ACK, Vec::new()),
                CMD_PIVDATA => {
                    let serve = control.piv.lock().unwrap().take();
                    match serve {
                        Some(serve) => {
                            let whole = serve.data.len() as u16;
                            pending_fragments = serve
                                .data
                                .chunks(serve.fragment_size.max(1))
                                .enumerate()
                                .map(|(i, chunk)| PivFragment {
                                    whole_length: whole,
                                    offset: (i * serve.fragment_size) as u16,
                                    data: chunk.to_vec(),
                                })
                                .collect();
                            piv_delay = serve.delay_polls;
                            if piv_delay == 0
                                && let Some(first) = pending_fragments.pop_front()
                            {
                                // First fragment rides the direct reply.
                                (REPLY_PIVDATAR, first.encode())
                            } else {
                                (REPLY_ACK, Vec::new())
                            }
                        }
                        // No data for this selector.
                        None => (REPLY_NAK, vec![0x09]),
                    }
                }
                _ => (REPLY_NAK, vec![0x03]),
            };

            let reply = Frame {
                address,
                from_pd: true,
                sequence: frame.sequence,
                use_crc: frame.use_crc,
                security: None,
                code,
                data,
            }
            .encode(None)
            .expect("plain reply frames always encode");

            if stream.write_all(&reply).await.is_err() {
                return;
            }
        }
    }
}
