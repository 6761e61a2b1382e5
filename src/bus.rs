// MIT License - Copyright (c) 2026 Peter Wright
// Bus poll loop

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::command::Command;
use crate::constants::{
    CONFIG_ADDRESS, DEFAULT_OFFLINE_THRESHOLD, DEFAULT_POLL_INTERVAL, DEFAULT_RECONNECT_DELAY,
    DEFAULT_REPLY_WINDOW,
};
use crate::device::{DeviceProxy, Disposition};
use crate::dispatcher::BusMessage;
use crate::error::{OsdpError, Result};
use crate::frame::{Frame, FrameAccumulator};
use crate::transport::{Connection, ConnectionId};

/// Timing and threshold knobs for one bus.
#[derive(Debug, Clone)]
pub struct BusOptions {
    /// Cadence between poll cycles.
    pub poll_interval: Duration,
    /// How long one device gets to produce a decodable reply.
    pub reply_window: Duration,
    /// Consecutive missed cycles before a device goes offline.
    pub offline_threshold: u32,
    /// Base delay for reconnect backoff after a lost connection.
    pub reconnect_delay: Duration,
}

impl Default for BusOptions {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            reply_window: DEFAULT_REPLY_WINDOW,
            offline_threshold: DEFAULT_OFFLINE_THRESHOLD,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }
}

/// The device roster of one bus, shared between the poll loop and the
/// panel's add/remove calls. The map mutex is held only across roster
/// edits and the per-cycle snapshot, never across I/O.
pub(crate) type Roster = Arc<Mutex<BTreeMap<u8, Arc<Mutex<DeviceProxy>>>>>;

/// Fire-and-forget frames for the broadcast address, drained one per
/// cycle ahead of the regular poll.
pub(crate) type BroadcastQueue = Arc<Mutex<VecDeque<Command>>>;

/// What one exchange with a device produced.
enum CycleOutcome {
    Reply(Disposition),
    Timeout,
    Invalid,
}

/// One polling loop driving one connection.
///
/// Each cycle serves exactly one device, round-robin by address, and has
/// exactly one frame in flight; that single-threading is what makes reply
/// correlation unambiguous.
pub(crate) struct Bus<C: Connection> {
    id: ConnectionId,
    connection: C,
    devices: Roster,
    broadcast: BroadcastQueue,
    sink: mpsc::UnboundedSender<BusMessage>,
    options: BusOptions,
    shutdown: watch::Receiver<bool>,
    accumulator: FrameAccumulator,
}

impl<C: Connection> Bus<C> {
    pub(crate) fn new(
        id: ConnectionId,
        connection: C,
        devices: Roster,
        broadcast: BroadcastQueue,
        sink: mpsc::UnboundedSender<BusMessage>,
        options: BusOptions,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            id,
            connection,
            devices,
            broadcast,
            sink,
            options,
            shutdown,
            accumulator: FrameAccumulator::new(),
        }
    }

    pub(crate) async fn run(mut self) {
        info!("Bus {} starting", self.id);

        if !self.connection.is_open() && !self.reconnect().await {
            info!("Bus {} stopped before its connection opened", self.id);
            return;
        }

        let mut cursor: Option<u8> = None;
        while !*self.shutdown.borrow() {
            let cycle_start = Instant::now();

            if let Err(e) = self.send_pending_broadcast().await {
                warn!("Bus {}: broadcast write failed: {}", self.id, e);
                if !self.reconnect().await {
                    break;
                }
                continue;
            }

            let snapshot: Vec<(u8, Arc<Mutex<DeviceProxy>>)> = {
                let devices = self.devices.lock().await;
                devices
                    .iter()
                    .map(|(addr, dev)| (*addr, dev.clone()))
                    .collect()
            };

            if let Some((address, device)) = next_in_rotation(&snapshot, cursor) {
                cursor = Some(address);
                if let Err(e) = self.poll_device(address, &device).await {
                    warn!("Bus {}: connection failed: {}", self.id, e);
                    if !self.reconnect().await {
                        break;
                    }
                    continue;
                }
            }

            self.sleep_until_next_cycle(cycle_start).await;
        }

        let _ = self.connection.close().await;
        info!("Bus {} stopped", self.id);
    }

    /// One exchange with one device: transmit its next frame, read until a
    /// frame decodes or the reply window closes, update device state, and
    /// forward the result. Errors mean the connection itself failed.
    async fn poll_device(&mut self, address: u8, device: &Arc<Mutex<DeviceProxy>>) -> Result<()> {
        let (was_online, outbound) = {
            let mut dev = device.lock().await;
            (dev.online(), dev.next_outbound())
        };
        let bytes = match outbound {
            Ok(bytes) => bytes,
            Err(e) => {
                // Device-level encode failure; skip this cycle.
                warn!("Bus {}: device {:#04x} produced no frame: {}", self.id, address, e);
                return Ok(());
            }
        };

        self.connection.write(&bytes).await?;
        // Anything left over from an earlier window is stale line noise.
        self.accumulator.clear();

        let outcome = self.await_reply(address, device).await?;

        {
            let mut dev = device.lock().await;
            match outcome {
                CycleOutcome::Reply(Disposition::Delivered(reply))
                | CycleOutcome::Reply(Disposition::Unsolicited(reply)) => {
                    let _ = self.sink.send(BusMessage::Reply(reply));
                }
                CycleOutcome::Reply(Disposition::Session) => {}
                CycleOutcome::Timeout | CycleOutcome::Invalid => dev.on_timeout(),
            }

            let online = dev.online();
            if online != was_online {
                info!(
                    "Bus {}: device {:#04x} is now {}",
                    self.id,
                    address,
                    if online { "online" } else { "offline" }
                );
                let _ = self.sink.send(BusMessage::ConnectionStatus {
                    connection_id: self.id,
                    address,
                    online,
                });
            }
        }
        Ok(())
    }

    /// Read until a frame from `address` decodes or the window elapses.
    async fn await_reply(
        &mut self,
        address: u8,
        device: &Arc<Mutex<DeviceProxy>>,
    ) -> Result<CycleOutcome> {
        let deadline = Instant::now() + self.options.reply_window;
        let mut buf = [0u8; 512];

        loop {
            match self.accumulator.next_frame() {
                Ok(Some(frame)) => {
                    if !frame.from_pd || frame.address != address {
                        // Our own transmit echoed back on the two-wire
                        // line, or crosstalk from another drop.
                        continue;
                    }
                    let mut dev = device.lock().await;
                    match dev.accept_reply(frame) {
                        Ok(disposition) => return Ok(CycleOutcome::Reply(disposition)),
                        Err(e) => {
                            debug!(
                                "Bus {}: invalid reply from {:#04x}: {}",
                                self.id, address, e
                            );
                            return Ok(CycleOutcome::Invalid);
                        }
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    debug!("Bus {}: undecodable frame from {:#04x}: {}", self.id, address, e);
                    return Ok(CycleOutcome::Invalid);
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(CycleOutcome::Timeout);
            }
            match tokio::time::timeout(deadline - now, self.connection.read(&mut buf)).await {
                Ok(Ok(0)) => {
                    return Err(OsdpError::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "connection closed by peer",
                    )));
                }
                Ok(Ok(n)) => self.accumulator.push(&buf[..n]),
                Ok(Err(e)) => return Err(e),
                Err(_) => return Ok(CycleOutcome::Timeout),
            }
        }
    }

    async fn send_pending_broadcast(&mut self) -> Result<()> {
        let command = { self.broadcast.lock().await.pop_front() };
        if let Some(command) = command {
            debug!("Bus {}: broadcasting {:#04x}", self.id, command.code());
            let frame = Frame {
                address: CONFIG_ADDRESS,
                from_pd: false,
                sequence: 0,
                use_crc: false,
                security: None,
                code: command.code(),
                data: command.encode(),
            };
            self.connection.write(&frame.encode(None)?).await?;
        }
        Ok(())
    }

    /// Mark every device offline and retry opening the connection with
    /// exponential backoff until it opens or shutdown is requested.
    async fn reconnect(&mut self) -> bool {
        let snapshot: Vec<(u8, Arc<Mutex<DeviceProxy>>)> = {
            let devices = self.devices.lock().await;
            devices
                .iter()
                .map(|(addr, dev)| (*addr, dev.clone()))
                .collect()
        };
        for (address, device) in snapshot {
            let mut dev = device.lock().await;
            if dev.online() {
                dev.reset();
                let _ = self.sink.send(BusMessage::ConnectionStatus {
                    connection_id: self.id,
                    address,
                    online: false,
                });
            }
        }

        let _ = self.connection.close().await;

        let mut attempt = 0u32;
        loop {
            if *self.shutdown.borrow() {
                return false;
            }
            match self.connection.open().await {
                Ok(()) => {
                    info!("Bus {} connection open", self.id);
                    self.accumulator.clear();
                    return true;
                }
                Err(e) => {
                    let delay = self.options.reconnect_delay * (1 << attempt.min(4));
                    warn!(
                        "Bus {}: connect attempt {} failed ({}), retrying in {:.1}s",
                        self.id,
                        attempt + 1,
                        e,
                        delay.as_secs_f64()
                    );
                    attempt = attempt.saturating_add(1);
                    let mut shutdown = self.shutdown.clone();
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }
    }

    async fn sleep_until_next_cycle(&mut self, cycle_start: Instant) {
        let next = cycle_start + self.options.poll_interval;
        if Instant::now() >= next {
            return;
        }
        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            _ = tokio::time::sleep_until(next) => {}
            _ = shutdown.changed() => {}
        }
    }
}

/// Pick the device after `cursor` in address order, wrapping; `None` only
/// for an empty roster.
fn next_in_rotation(
    snapshot: &[(u8, Arc<Mutex<DeviceProxy>>)],
    cursor: Option<u8>,
) -> Option<(u8, Arc<Mutex<DeviceProxy>>)> {
    if snapshot.is_empty() {
        return None;
    }
    let next = match cursor {
        Some(cursor) => snapshot.iter().find(|(addr, _)| *addr > cursor),
        None => None,
    };
    let (addr, dev) = next.unwrap_or(&snapshot[0]);
    Some((*addr, dev.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::DEFAULT_OFFLINE_THRESHOLD;

    fn proxy(addr: u8) -> Arc<Mutex<DeviceProxy>> {
        Arc::new(Mutex::new(DeviceProxy::new(
            ConnectionId::new(0),
            addr,
            false,
            None,
            false,
            DEFAULT_OFFLINE_THRESHOLD,
        )))
    }

    #[test]
    fn test_round_robin_is_stable_and_wraps() {
        let snapshot = vec![(0x01, proxy(0x01)), (0x05, proxy(0x05)), (0x0A, proxy(0x0A))];

        let mut cursor = None;
        let mut order = Vec::new();
        for _ in 0..7 {
            let (addr, _) = next_in_rotation(&snapshot, cursor).unwrap();
            order.push(addr);
            cursor = Some(addr);
        }
        assert_eq!(order, vec![0x01, 0x05, 0x0A, 0x01, 0x05, 0x0A, 0x01]);
    }

    #[test]
    fn test_rotation_survives_removal() {
        // Cursor points at a removed device: rotation continues from the
        // next higher address.
        let snapshot = vec![(0x01, proxy(0x01)), (0x0A, proxy(0x0A))];
        let (addr, _) = next_in_rotation(&snapshot, Some(0x05)).unwrap();
        assert_eq!(addr, 0x0A);
    }

    #[test]
    fn test_empty_roster_yields_none() {
        assert!(next_in_rotation(&[], None).is_none());
    }
}
