//! Connectionless time responder.
//!
//! Any datagram is answered with the hub clock as ASCII decimal
//! nanoseconds since the Unix epoch, taken as soon as the request is read.
//! Devices that only need a quick clock reading use this instead of a full
//! command connection.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use flashsync_common::protocol::now_ns;

/// Handle to a running responder.
pub struct UdpTimeServer {
    stop: Arc<AtomicBool>,
    local_addr: SocketAddr,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl UdpTimeServer {
    /// Bind `listen_addr` and start answering. `poll` bounds how long a
    /// stop request waits for the receive loop.
    pub async fn start(listen_addr: &str, poll: Duration) -> Result<Self> {
        let socket = UdpSocket::bind(listen_addr)
            .await
            .with_context(|| format!("Cannot bind time responder to {listen_addr}"))?;
        let local_addr = socket.local_addr()?;
        let stop = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(serve(socket, stop.clone(), poll));
        info!("UDP time responder listening on {local_addr}");

        Ok(Self {
            stop,
            local_addr,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn stop(&self) {
        if self.stop.swap(true, Ordering::SeqCst) {
            return;
        }
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = task {
            if let Err(e) = handle.await {
                warn!("Time responder ended abnormally: {e}");
            }
        }
    }
}

async fn serve(socket: UdpSocket, stop: Arc<AtomicBool>, poll: Duration) {
    let mut buf = [0u8; 512];
    while !stop.load(Ordering::SeqCst) {
        let peer = match tokio::time::timeout(poll, socket.recv_from(&mut buf)).await {
            Err(_) => continue,
            Ok(Ok((_, peer))) => peer,
            Ok(Err(e)) => {
                // ICMP errors from earlier replies surface here on some platforms.
                debug!("Time responder receive failed: {e}");
                continue;
            }
        };
        let reply = now_ns().to_string();
        if let Err(e) = socket.send_to(reply.as_bytes(), peer).await {
            debug!("Time reply to {peer} failed: {e}");
        }
    }
}
