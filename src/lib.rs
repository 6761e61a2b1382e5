// MIT License - Copyright (c) 2026 Peter Wright
//
//! # osdp-acu
//!
//! The Access Control Unit (ACU) side of OSDP: drives one or more RS-485
//! segments (native serial or TCP-wrapped), polls the Peripheral Devices
//! on each, establishes per-device secure channels, and correlates
//! command replies back to awaiting callers.
//!
//! Each connection gets a single-threaded poll loop with exactly one
//! frame in flight, which is what keeps reply correlation unambiguous; a
//! process-wide dispatcher completes awaiting callers first and fans out
//! typed events second.
//!
//! ## Quick Start
//!
//! ```no_run
//! use osdp_acu::{AcuEvent, ControlPanel, TcpConnection};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let panel = ControlPanel::new();
//!     let conn = panel
//!         .start_connection(TcpConnection::new("192.168.0.50:4000"))
//!         .await;
//!
//!     // Reader at address 1, CRC framing, no secure channel.
//!     panel.add_device(conn, 0x01, true, false, None).await?;
//!
//!     let mut events = panel.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             if let AcuEvent::RawCardData { address, payload, .. } = event {
//!                 println!("Card read at {:#04x}: {:02X?}", address, payload);
//!             }
//!         }
//!     });
//!
//!     let id = panel.id_report(conn, 0x01).await?;
//!     println!("PD identification: {:02X?}", id.payload);
//!
//!     tokio::signal::ctrl_c().await?;
//!     panel.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod bus;
pub mod command;
pub mod constants;
pub mod device;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod frame;
pub mod multipart;
pub mod panel;
pub mod reply;
pub mod secure;
pub mod transport;

// Re-exports for convenience
pub use bus::BusOptions;
pub use command::{Command, LedColor, LedControl, OutputControlCode, PivDataSelector};
pub use error::{NakCode, OsdpError, Result};
pub use event::{AcuEvent, EventReceiver};
pub use panel::ControlPanel;
pub use reply::{PivFragment, Reply, ReplyType, TransactionId};
pub use secure::{SCBK_D, SecureKey};
pub use transport::{Connection, ConnectionId, SerialConnection, TcpConnection};
