#![allow(dead_code)]
//! Test harness utilities for hub integration tests.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use flashsync_common::config::HubConfig;
use flashsync_common::framing::{encode, FrameDecoder};

pub const RECV_TIMEOUT: Duration = Duration::from_secs(3);

/// Config bound to ephemeral localhost ports with short poll intervals.
pub fn test_config(data_dir: &Path) -> HubConfig {
    HubConfig {
        data_dir: data_dir.to_path_buf(),
        command_listen_addr: "127.0.0.1:0".into(),
        transfer_listen_addr: "127.0.0.1:0".into(),
        status_listen_addr: None,
        timesync_listen_addr: None,
        accept_poll: Duration::from_millis(50),
        transfer_io_timeout: Duration::from_secs(2),
        shutdown_join: Duration::from_millis(500),
        ..HubConfig::default()
    }
}

/// A device connection speaking raw framed JSON.
pub struct RawClient {
    stream: TcpStream,
    decoder: FrameDecoder,
    pending: Vec<Value>,
}

impl RawClient {
    pub async fn connect(addr: SocketAddr) -> std::io::Result<Self> {
        Ok(Self {
            stream: TcpStream::connect(addr).await?,
            decoder: FrameDecoder::new(),
            pending: Vec::new(),
        })
    }

    pub async fn send(&mut self, msg: &Value) -> std::io::Result<()> {
        let frame = encode(msg).expect("encode");
        self.send_raw(&frame).await
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.stream.write_all(bytes).await
    }

    /// Next decoded frame; panics on timeout or a malformed frame.
    pub async fn recv(&mut self) -> Value {
        tokio::time::timeout(RECV_TIMEOUT, self.recv_inner())
            .await
            .expect("timed out waiting for a frame")
    }

    async fn recv_inner(&mut self) -> Value {
        loop {
            if !self.pending.is_empty() {
                return self.pending.remove(0);
            }
            let mut buf = [0u8; 4096];
            let n = self.stream.read(&mut buf).await.expect("read");
            assert!(n > 0, "server closed the connection");
            for frame in self.decoder.feed::<Value>(&buf[..n]) {
                self.pending.push(frame.expect("well-formed frame"));
            }
        }
    }

    /// True once the server has closed this connection.
    pub async fn is_closed(&mut self) -> bool {
        let mut buf = [0u8; 64];
        matches!(
            tokio::time::timeout(RECV_TIMEOUT, self.stream.read(&mut buf)).await,
            Ok(Ok(0)) | Ok(Err(_))
        )
    }
}

/// Upload `body` to the transfer receiver with the given header line.
pub async fn upload(addr: SocketAddr, header: &Value, body: &[u8]) {
    let mut stream = TcpStream::connect(addr).await.expect("connect");
    let mut line = serde_json::to_vec(header).unwrap();
    line.push(b'\n');
    stream.write_all(&line).await.unwrap();
    // The receiver may already have rejected the header.
    let _ = stream.write_all(body).await;
    let _ = stream.shutdown().await;
}

/// Poll `cond` every 10ms until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
