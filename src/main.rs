// MIT License - Copyright (c) 2026 Peter Wright
// Bus monitor

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::{info, warn};

use osdp_acu::{AcuEvent, ControlPanel, SerialConnection, TcpConnection};

/// Poll an OSDP bus and print device events.
#[derive(Parser)]
#[command(name = "osdp-monitor")]
#[command(about = "Monitor PDs on an OSDP bus")]
struct Cli {
    /// TCP endpoint of a serial bridge (host:port)
    #[arg(long, conflicts_with = "serial")]
    tcp: Option<String>,

    /// Local serial device path (e.g. /dev/ttyUSB0)
    #[arg(long)]
    serial: Option<String>,

    /// Baud rate for the serial device
    #[arg(long, default_value_t = 9600)]
    baud: u32,

    /// Device to poll, as ADDRESS[:crc][:key=HEX32]; repeatable
    #[arg(long = "device", required = true)]
    devices: Vec<String>,
}

/// One parsed `--device` argument.
#[derive(Debug, PartialEq)]
struct DeviceSpec {
    address: u8,
    use_crc: bool,
    key: Option<[u8; 16]>,
}

fn parse_device_spec(spec: &str) -> Result<DeviceSpec> {
    let mut parts = spec.split(':');
    let address_str = parts.next().context("empty device spec")?;
    let address = if let Some(hex) = address_str.strip_prefix("0x") {
        u8::from_str_radix(hex, 16)
    } else {
        address_str.parse()
    }
    .with_context(|| format!("bad device address {address_str:?}"))?;

    let mut use_crc = false;
    let mut key = None;
    for part in parts {
        if part == "crc" {
            use_crc = true;
        } else if let Some(hex) = part.strip_prefix("key=") {
            if hex.len() != 32 {
                bail!("secure channel key must be 32 hex digits");
            }
            let mut bytes = [0u8; 16];
            for (i, byte) in bytes.iter_mut().enumerate() {
                *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
                    .context("bad hex digit in key")?;
            }
            key = Some(bytes);
        } else {
            bail!("unknown device option {part:?}");
        }
    }

    Ok(DeviceSpec {
        address,
        use_crc,
        key,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let specs: Vec<DeviceSpec> = cli
        .devices
        .iter()
        .map(|s| parse_device_spec(s))
        .collect::<Result<_>>()?;

    let panel = ControlPanel::new();
    let conn = match (&cli.tcp, &cli.serial) {
        (Some(addr), None) => {
            info!("Connecting to serial bridge at {addr}");
            panel.start_connection(TcpConnection::new(addr)).await
        }
        (None, Some(path)) => {
            info!("Opening serial port {path} at {} baud", cli.baud);
            panel
                .start_connection(SerialConnection::new(path, cli.baud))
                .await
        }
        _ => bail!("exactly one of --tcp or --serial is required"),
    };

    for spec in &specs {
        panel
            .add_device(conn, spec.address, spec.use_crc, spec.key.is_some(), spec.key)
            .await?;
        info!(
            "Polling device {:#04x} ({}{})",
            spec.address,
            if spec.use_crc { "CRC" } else { "checksum" },
            if spec.key.is_some() { ", secure" } else { "" }
        );
    }

    // Event printer
    let mut events = panel.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(AcuEvent::ConnectionStatusChanged {
                    address, online, ..
                }) => {
                    info!(
                        "Device {:#04x} is {}",
                        address,
                        if online { "online" } else { "offline" }
                    );
                }
                Ok(AcuEvent::RawCardData {
                    address, payload, ..
                }) => {
                    info!("Card read at {:#04x}: {:02X?}", address, payload);
                }
                Ok(AcuEvent::KeypadData {
                    address, digits, ..
                }) => {
                    info!("Keypad input at {:#04x}: {:02X?}", address, digits);
                }
                Ok(AcuEvent::LocalStatus {
                    address,
                    tamper,
                    power_failure,
                    ..
                }) => {
                    info!(
                        "Status of {:#04x}: tamper={} power_failure={}",
                        address, tamper, power_failure
                    );
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Event receiver lagged, missed {n} events");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    // Identify each device once it has had a chance to come up.
    for spec in &specs {
        match panel.id_report(conn, spec.address).await {
            Ok(reply) => info!(
                "Device {:#04x} identification: {:02X?}",
                spec.address, reply.payload
            ),
            Err(e) => warn!("Device {:#04x} identification failed: {}", spec.address, e),
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    panel.shutdown().await;
    printer.abort();
    Ok(())
}
