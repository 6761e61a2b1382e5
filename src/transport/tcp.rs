// MIT License - Copyright (c) 2026 Peter Wright
// TCP-wrapped serial transport

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::error::{OsdpError, Result};
use crate::transport::Connection;

/// A serial line reachable through a TCP port server (e.g. an RS-485 to
/// Ethernet bridge). Reconnectable: `open` establishes a fresh stream.
pub struct TcpConnection {
    addr: String,
    stream: Option<TcpStream>,
}

impl TcpConnection {
    /// Create an unopened connection; the bus opens it when it starts.
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            stream: None,
        }
    }

    /// Connect immediately and return the opened connection.
    pub async fn connect(addr: impl Into<String>) -> Result<Self> {
        let mut conn = Self::new(addr);
        conn.open().await?;
        Ok(conn)
    }
}

impl Connection for TcpConnection {
    async fn open(&mut self) -> Result<()> {
        let stream = TcpStream::connect(&self.addr).await?;
        // Poll/reply frames are tiny; waiting for full segments would blow
        // straight through the reply window.
        stream.set_nodelay(true)?;
        info!("TCP connection to {} established", self.addr);
        self.stream = Some(stream);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
            debug!("TCP connection to {} closed", self.addr);
        }
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.stream.as_mut() {
            Some(stream) => Ok(stream.read(buf).await?),
            None => Err(OsdpError::NotOpen),
        }
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        match self.stream.as_mut() {
            Some(stream) => Ok(stream.write_all(data).await?),
            None => Err(OsdpError::NotOpen),
        }
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_write_before_open_fail() {
        let mut conn = TcpConnection::new("127.0.0.1:1");
        assert!(!conn.is_open());
        let mut buf = [0u8; 8];
        assert!(matches!(conn.read(&mut buf).await, Err(OsdpError::NotOpen)));
        assert!(matches!(conn.write(&[1]).await, Err(OsdpError::NotOpen)));
    }

    #[tokio::test]
    async fn test_loopback_roundtrip() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            socket.read_exact(&mut buf).await.unwrap();
            socket.write_all(&buf).await.unwrap();
        });

        let mut conn = TcpConnection::connect(addr.to_string()).await.unwrap();
        assert!(conn.is_open());
        conn.write(&[0x53, 0x01, 0x02, 0x03]).await.unwrap();
        let mut buf = [0u8; 4];
        let mut read = 0;
        while read < 4 {
            read += conn.read(&mut buf[read..]).await.unwrap();
        }
        assert_eq!(buf, [0x53, 0x01, 0x02, 0x03]);

        conn.close().await.unwrap();
        assert!(!conn.is_open());
        server.await.unwrap();
    }
}
