// MIT License - Copyright (c) 2026 Peter Wright
// Control panel

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{BroadcastQueue, Bus, BusOptions, Roster};
use crate::command::{Command, LedControl, OutputControlCode, PivDataSelector};
use crate::constants::{CONFIG_ADDRESS, DEFAULT_COMMAND_TIMEOUT, MAX_ADDRESS};
use crate::device::{DeviceProxy, QueuedCommand};
use crate::dispatcher::{BusMessage, PendingMap, PendingRequest, ReplyDispatcher};
use crate::error::{OsdpError, Result};
use crate::event::{AcuEvent, EventReceiver, EventSender, event_channel};
use crate::multipart::Reassembler;
use crate::reply::{Reply, ReplyType, TransactionId};
use crate::secure::{SCBK_D, SecureKey};
use crate::transport::{Connection, ConnectionId};

/// One registered bus, as seen from the panel.
struct BusHandle {
    devices: Roster,
    broadcast: BroadcastQueue,
    options: BusOptions,
    join: JoinHandle<()>,
}

/// The ACU: owns every bus, correlates replies to callers, reassembles
/// multi-part replies, and fans out typed events.
///
/// # Example
///
/// ```no_run
/// use osdp_acu::{ControlPanel, TcpConnection, AcuEvent};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let panel = ControlPanel::new();
///     let conn = panel
///         .start_connection(TcpConnection::new("192.168.0.50:4000"))
///         .await;
///     panel.add_device(conn, 0x01, true, false, None).await?;
///
///     let mut events = panel.subscribe();
///     tokio::spawn(async move {
///         while let Ok(event) = events.recv().await {
///             println!("Event: {:?}", event);
///         }
///     });
///
///     let id = panel.id_report(conn, 0x01).await?;
///     println!("PD identification: {:02X?}", id.payload);
///
///     panel.shutdown().await;
///     Ok(())
/// }
/// ```
pub struct ControlPanel {
    buses: Arc<Mutex<HashMap<ConnectionId, BusHandle>>>,
    pending: PendingMap,
    events: EventSender,
    sink: mpsc::UnboundedSender<BusMessage>,
    reassembly: Arc<Mutex<Reassembler>>,
    piv_locks: Arc<Mutex<HashMap<(ConnectionId, u8), Arc<Semaphore>>>>,
    next_connection: AtomicU32,
    next_transaction: AtomicU64,
    command_timeout: Duration,
    shutdown_tx: watch::Sender<bool>,
    dispatcher: JoinHandle<()>,
}

impl ControlPanel {
    /// Create a panel with the default 5-second command timeout.
    pub fn new() -> Self {
        Self::with_command_timeout(DEFAULT_COMMAND_TIMEOUT)
    }

    /// Create a panel with a custom command timeout.
    pub fn with_command_timeout(command_timeout: Duration) -> Self {
        let (events, _) = event_channel(256);
        let (sink, sink_rx) = mpsc::unbounded_channel();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (shutdown_tx, _) = watch::channel(false);

        let dispatcher =
            tokio::spawn(ReplyDispatcher::new(pending.clone(), events.clone()).run(sink_rx));

        Self {
            buses: Arc::new(Mutex::new(HashMap::new())),
            pending,
            events,
            sink,
            reassembly: Arc::new(Mutex::new(Reassembler::new())),
            piv_locks: Arc::new(Mutex::new(HashMap::new())),
            next_connection: AtomicU32::new(1),
            next_transaction: AtomicU64::new(1),
            command_timeout,
            shutdown_tx,
            dispatcher,
        }
    }

    /// Subscribe to typed events (reply notifications and
    /// `ConnectionStatusChanged`).
    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    /// Start a bus on `connection` with default timings.
    pub async fn start_connection<C: Connection>(&self, connection: C) -> ConnectionId {
        self.start_connection_with(connection, BusOptions::default())
            .await
    }

    /// Start a bus on `connection` with explicit timings.
    pub async fn start_connection_with<C: Connection>(
        &self,
        connection: C,
        options: BusOptions,
    ) -> ConnectionId {
        let id = ConnectionId::new(self.next_connection.fetch_add(1, Ordering::Relaxed));
        let devices: Roster = Arc::new(Mutex::new(Default::default()));
        let broadcast: BroadcastQueue = Arc::new(Mutex::new(VecDeque::new()));

        let bus = Bus::new(
            id,
            connection,
            devices.clone(),
            broadcast.clone(),
            self.sink.clone(),
            options.clone(),
            self.shutdown_tx.subscribe(),
        );
        let join = tokio::spawn(bus.run());

        self.buses.lock().await.insert(
            id,
            BusHandle {
                devices,
                broadcast,
                options,
                join,
            },
        );
        info!("Connection {} registered", id);
        id
    }

    /// Add a PD to a bus roster. `key` supplies the secure channel base
    /// key; a secure device without one falls back to the default key.
    pub async fn add_device(
        &self,
        connection_id: ConnectionId,
        address: u8,
        use_crc: bool,
        use_secure_channel: bool,
        key: Option<[u8; 16]>,
    ) -> Result<()> {
        if address > MAX_ADDRESS {
            return Err(OsdpError::UnknownDevice { address });
        }
        let (devices, options) = self
            .with_bus(connection_id, |bus| (bus.devices.clone(), bus.options.clone()))
            .await?;

        let default_key = use_secure_channel && key.is_none();
        if default_key {
            warn!(
                "Device {:#04x} on {} uses the default secure channel key; install a real key with set_secure_key",
                address, connection_id
            );
        }
        let secure_key = use_secure_channel.then(|| SecureKey::new(key.unwrap_or(SCBK_D)));

        let proxy = DeviceProxy::new(
            connection_id,
            address,
            use_crc,
            secure_key,
            default_key,
            options.offline_threshold,
        );
        let previous = devices
            .lock()
            .await
            .insert(address, Arc::new(Mutex::new(proxy)));
        if previous.is_some() {
            info!("Device {:#04x} on {} replaced", address, connection_id);
        } else {
            debug!("Device {:#04x} added to {}", address, connection_id);
        }
        Ok(())
    }

    /// Remove a PD from a bus roster. Its key material is scrubbed as the
    /// proxy drops.
    pub async fn remove_device(&self, connection_id: ConnectionId, address: u8) -> Result<()> {
        let devices = self
            .with_bus(connection_id, |bus| bus.devices.clone())
            .await?;
        match devices.lock().await.remove(&address) {
            Some(_) => {
                debug!("Device {:#04x} removed from {}", address, connection_id);
                Ok(())
            }
            None => Err(OsdpError::UnknownDevice { address }),
        }
    }

    /// Whether a device is currently online.
    pub async fn is_online(&self, connection_id: ConnectionId, address: u8) -> Result<bool> {
        let device = self.device(connection_id, address).await?;
        let online = device.lock().await.online();
        Ok(online)
    }

    /// Force a device back to its initial state (offline, secure session
    /// torn down, queue cleared).
    pub async fn reset_device(&self, connection_id: ConnectionId, address: u8) -> Result<()> {
        let device = self.device(connection_id, address).await?;
        device.lock().await.reset();
        Ok(())
    }

    /// Send a command and await its correlated reply.
    ///
    /// Fails with `Timeout` after the panel's command timeout, and
    /// synchronously with `UnknownConnection`/`UnknownDevice` for targets
    /// that are not registered.
    pub async fn send_command(
        &self,
        connection_id: ConnectionId,
        address: u8,
        command: Command,
    ) -> Result<Reply> {
        self.send_command_inner(connection_id, address, command, None)
            .await
    }

    /// `send_command` with a cancellation signal. Cancelling abandons the
    /// pending request; a command already on the wire still completes at
    /// the device, its reply is simply discarded.
    pub async fn send_command_with_cancel(
        &self,
        connection_id: ConnectionId,
        address: u8,
        command: Command,
        cancel: CancellationToken,
    ) -> Result<Reply> {
        self.send_command_inner(connection_id, address, command, Some(cancel))
            .await
    }

    async fn send_command_inner(
        &self,
        connection_id: ConnectionId,
        address: u8,
        command: Command,
        cancel: Option<CancellationToken>,
    ) -> Result<Reply> {
        let device = self.device(connection_id, address).await?;

        let transaction =
            TransactionId(self.next_transaction.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();

        // Register before the command can possibly transmit, so the reply
        // cannot race the registration.
        self.pending.lock().await.insert(
            transaction,
            PendingRequest {
                connection_id,
                address,
                command_code: command.code(),
                deadline: Instant::now().into_std() + self.command_timeout,
                tx,
            },
        );
        device
            .lock()
            .await
            .enqueue(QueuedCommand { command, transaction });

        let result = tokio::select! {
            reply = rx => reply.map_err(|_| OsdpError::ChannelClosed),
            _ = tokio::time::sleep(self.command_timeout) => Err(OsdpError::Timeout),
            _ = wait_cancelled(cancel) => Err(OsdpError::Cancelled),
        };
        if result.is_err() {
            self.pending.lock().await.remove(&transaction);
        }
        result
    }

    /// Queue a fire-and-forget command to the broadcast address. No reply
    /// is correlated; PDs do not answer broadcast frames.
    pub async fn broadcast(&self, connection_id: ConnectionId, command: Command) -> Result<()> {
        let broadcast = self
            .with_bus(connection_id, |bus| bus.broadcast.clone())
            .await?;
        broadcast.lock().await.push_back(command);
        Ok(())
    }

    /// Read a PIV object from a PD, reassembling its fragments.
    ///
    /// PIV transactions are serialised per device: the reassembly buffer
    /// is keyed by device, not by caller, so a second caller suspends on
    /// the per-device lock until the first finishes or `timeout` elapses.
    pub async fn get_piv_data(
        &self,
        connection_id: ConnectionId,
        address: u8,
        selector: PivDataSelector,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        self.get_piv_data_inner(connection_id, address, selector, timeout, None)
            .await
    }

    /// `get_piv_data` with a cancellation signal; cancelling releases the
    /// per-device lock.
    pub async fn get_piv_data_with_cancel(
        &self,
        connection_id: ConnectionId,
        address: u8,
        selector: PivDataSelector,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<Vec<u8>> {
        self.get_piv_data_inner(connection_id, address, selector, timeout, Some(cancel))
            .await
    }

    async fn get_piv_data_inner(
        &self,
        connection_id: ConnectionId,
        address: u8,
        selector: PivDataSelector,
        timeout: Duration,
        cancel: Option<CancellationToken>,
    ) -> Result<Vec<u8>> {
        // Validate the target before touching the lock.
        let _ = self.device(connection_id, address).await?;
        let deadline = Instant::now() + timeout;

        let semaphore = {
            let mut locks = self.piv_locks.lock().await;
            locks
                .entry((connection_id, address))
                .or_insert_with(|| Arc::new(Semaphore::new(1)))
                .clone()
        };

        // The permit rides the whole transaction and is released on every
        // exit path, cancellation included.
        let _permit = tokio::select! {
            permit = semaphore.acquire_owned() => permit.map_err(|_| OsdpError::ChannelClosed)?,
            _ = tokio::time::sleep_until(deadline) => return Err(OsdpError::Timeout),
            _ = wait_cancelled(cancel.clone()) => return Err(OsdpError::Cancelled),
        };

        let key = (connection_id, address, ReplyType::PivData);
        self.reassembly.lock().await.discard(&key);

        // Subscribe before the command transmits; fragments may start
        // arriving on the very next poll cycle.
        let mut events = self.subscribe();

        let kickoff = tokio::time::timeout_at(
            deadline,
            self.send_command_inner(
                connection_id,
                address,
                Command::GetPivData(selector),
                cancel.clone(),
            ),
        )
        .await;
        match kickoff {
            Err(_) => return Err(OsdpError::Timeout),
            Ok(Err(e)) => return Err(e),
            Ok(Ok(reply)) if reply.reply_type == ReplyType::Nak => {
                // The no-data case: the PD has nothing for this selector.
                return Err(OsdpError::NakReceived {
                    address,
                    code: reply.nak_code(),
                });
            }
            Ok(Ok(_)) => {}
        }

        loop {
            let event = tokio::select! {
                event = events.recv() => event,
                _ = tokio::time::sleep_until(deadline) => return Err(OsdpError::Timeout),
                _ = wait_cancelled(cancel.clone()) => return Err(OsdpError::Cancelled),
            };
            match event {
                Ok(AcuEvent::PivData {
                    connection_id: conn,
                    address: addr,
                    fragment,
                }) if conn == connection_id && addr == address => {
                    match self.reassembly.lock().await.apply(key, &fragment) {
                        Ok(Some(whole)) => return Ok(whole),
                        Ok(None) => {}
                        Err(e) => {
                            // Buffer discarded; the transfer can only end
                            // in a timeout now unless the PD restarts it.
                            warn!(
                                "PIV reassembly failed for {:#04x} on {}: {}",
                                address, connection_id, e
                            );
                        }
                    }
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("PIV event receiver lagged, missed {} events", n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    return Err(OsdpError::ChannelClosed);
                }
            }
        }
    }

    // --- Command helpers ---

    /// Request the PD identification report.
    pub async fn id_report(&self, conn: ConnectionId, address: u8) -> Result<Reply> {
        self.send_command(conn, address, Command::IdReport).await
    }

    /// Request the PD capabilities report.
    pub async fn device_capabilities(&self, conn: ConnectionId, address: u8) -> Result<Reply> {
        self.send_command(conn, address, Command::DeviceCapabilities)
            .await
    }

    /// Request tamper/power status.
    pub async fn local_status(&self, conn: ConnectionId, address: u8) -> Result<Reply> {
        self.send_command(conn, address, Command::LocalStatusReport)
            .await
    }

    /// Request input point status.
    pub async fn input_status(&self, conn: ConnectionId, address: u8) -> Result<Reply> {
        self.send_command(conn, address, Command::InputStatusReport)
            .await
    }

    /// Request output point status.
    pub async fn output_status(&self, conn: ConnectionId, address: u8) -> Result<Reply> {
        self.send_command(conn, address, Command::OutputStatusReport)
            .await
    }

    /// Request attached-reader status.
    pub async fn reader_status(&self, conn: ConnectionId, address: u8) -> Result<Reply> {
        self.send_command(conn, address, Command::ReaderStatusReport)
            .await
    }

    /// Drive an output point.
    pub async fn output_control(
        &self,
        conn: ConnectionId,
        address: u8,
        output: u8,
        control: OutputControlCode,
        timer: u16,
    ) -> Result<Reply> {
        self.send_command(
            conn,
            address,
            Command::OutputControl {
                output,
                control,
                timer,
            },
        )
        .await
    }

    /// Set a reader LED.
    pub async fn reader_led_control(
        &self,
        conn: ConnectionId,
        address: u8,
        led: LedControl,
    ) -> Result<Reply> {
        self.send_command(conn, address, Command::ReaderLedControl(led))
            .await
    }

    /// Sound the reader buzzer.
    pub async fn reader_buzzer_control(
        &self,
        conn: ConnectionId,
        address: u8,
        on_time: u8,
        off_time: u8,
        count: u8,
    ) -> Result<Reply> {
        self.send_command(
            conn,
            address,
            Command::ReaderBuzzerControl {
                reader: 0,
                on_time,
                off_time,
                count,
            },
        )
        .await
    }

    /// Show text on the reader display.
    pub async fn text_output(
        &self,
        conn: ConnectionId,
        address: u8,
        row: u8,
        column: u8,
        text: impl Into<String>,
    ) -> Result<Reply> {
        self.send_command(
            conn,
            address,
            Command::TextOutput {
                reader: 0,
                row,
                column,
                text: text.into(),
            },
        )
        .await
    }

    /// Reassign the PD's address and baud rate.
    pub async fn communication_config(
        &self,
        conn: ConnectionId,
        address: u8,
        new_address: u8,
        baud_rate: u32,
    ) -> Result<Reply> {
        self.send_command(
            conn,
            address,
            Command::CommunicationConfig {
                address: new_address,
                baud_rate,
            },
        )
        .await
    }

    /// Vendor-specific command.
    pub async fn manufacturer_specific(
        &self,
        conn: ConnectionId,
        address: u8,
        vendor_code: [u8; 3],
        data: Vec<u8>,
    ) -> Result<Reply> {
        self.send_command(
            conn,
            address,
            Command::ManufacturerSpecific { vendor_code, data },
        )
        .await
    }

    /// Extended write.
    pub async fn extended_write(
        &self,
        conn: ConnectionId,
        address: u8,
        mode: u8,
        command: u8,
        data: Vec<u8>,
    ) -> Result<Reply> {
        self.send_command(conn, address, Command::ExtendedWrite { mode, command, data })
            .await
    }

    /// Install a new secure channel base key on the PD. On ACK the roster
    /// entry switches to the new key and the session re-establishes under
    /// it on the next poll cycle.
    pub async fn set_secure_key(
        &self,
        conn: ConnectionId,
        address: u8,
        key: [u8; 16],
    ) -> Result<()> {
        let reply = self.send_command(conn, address, Command::KeySet { key }).await?;
        match reply.reply_type {
            ReplyType::Ack => {
                let device = self.device(conn, address).await?;
                device.lock().await.set_secure_key(SecureKey::new(key));
                info!("Device {:#04x} on {} accepted new base key", address, conn);
                Ok(())
            }
            _ => Err(OsdpError::NakReceived {
                address,
                code: reply.nak_code(),
            }),
        }
    }

    /// Stop every bus, close connections, drop pending work and scrub
    /// secure channel key material.
    pub async fn shutdown(&self) {
        info!("Control panel shutting down");
        let _ = self.shutdown_tx.send(true);

        let handles: Vec<(ConnectionId, BusHandle)> =
            self.buses.lock().await.drain().collect();
        for (id, handle) in handles {
            if handle.join.await.is_err() {
                warn!("Bus {} task ended abnormally", id);
            }
            // Dropping the roster drops every DeviceProxy; session keys
            // zeroise as they go.
        }

        self.pending.lock().await.clear();
        self.piv_locks.lock().await.clear();
        self.reassembly.lock().await.clear();
        self.dispatcher.abort();
        info!("Control panel stopped");
    }

    async fn with_bus<T>(
        &self,
        connection_id: ConnectionId,
        f: impl FnOnce(&BusHandle) -> T,
    ) -> Result<T> {
        let buses = self.buses.lock().await;
        buses
            .get(&connection_id)
            .map(f)
            .ok_or(OsdpError::UnknownConnection(connection_id))
    }

    async fn device(
        &self,
        connection_id: ConnectionId,
        address: u8,
    ) -> Result<Arc<Mutex<DeviceProxy>>> {
        if address >= CONFIG_ADDRESS {
            return Err(OsdpError::UnknownDevice { address });
        }
        let devices = self
            .with_bus(connection_id, |bus| bus.devices.clone())
            .await?;
        let device = devices.lock().await.get(&address).cloned();
        device.ok_or(OsdpError::UnknownDevice { address })
    }
}

impl Default for ControlPanel {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ControlPanel {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        self.dispatcher.abort();
    }
}

async fn wait_cancelled(token: Option<CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}
