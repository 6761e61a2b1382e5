// MIT License - Copyright (c) 2026 Peter Wright
// RS-485 serial transport

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, info};

use crate::error::{OsdpError, Result};
use crate::transport::Connection;

/// An RS-485 line behind a local serial device.
pub struct SerialConnection {
    path: String,
    baud_rate: u32,
    port: Option<SerialStream>,
}

impl SerialConnection {
    /// Create an unopened connection; the bus opens it when it starts.
    pub fn new(path: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            path: path.into(),
            baud_rate,
            port: None,
        }
    }

    /// Open immediately and return the opened connection.
    pub async fn connect(path: impl Into<String>, baud_rate: u32) -> Result<Self> {
        let mut conn = Self::new(path, baud_rate);
        conn.open().await?;
        Ok(conn)
    }
}

impl Connection for SerialConnection {
    async fn open(&mut self) -> Result<()> {
        let port = tokio_serial::new(&self.path, self.baud_rate).open_native_async()?;
        info!("Serial port {} opened at {} baud", self.path, self.baud_rate);
        self.port = Some(port);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.port.take().is_some() {
            debug!("Serial port {} closed", self.path);
        }
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.port.as_mut() {
            Some(port) => Ok(port.read(buf).await?),
            None => Err(OsdpError::NotOpen),
        }
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        match self.port.as_mut() {
            Some(port) => {
                port.write_all(data).await?;
                port.flush().await?;
                Ok(())
            }
            None => Err(OsdpError::NotOpen),
        }
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }
}
