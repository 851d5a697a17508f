//! Blocking client for the hub's command port.
//!
//! Used by devices, by the `timesync_client` tool and by integration tests.
//! Frames that do not answer the current request (preview broadcasts,
//! stray acks) are queued and handed out by later [`HubClient::recv`] calls.

use std::collections::VecDeque;
use std::io::{ErrorKind, Read};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use serde_json::Value;
use tracing::{debug, warn};

use crate::backoff;
use crate::framing::{write_frame, FrameDecoder};
use crate::protocol::{Envelope, Message};
use crate::timesync::{TimeSyncExchange, TimeSyncReply};

/// Upper bound of the random delay added to each reconnect wait.
const RETRY_JITTER_MS: u64 = 50;

pub struct HubClient {
    stream: TcpStream,
    decoder: FrameDecoder,
    pending: VecDeque<Envelope>,
    timeout: Duration,
    next_id: u64,
}

impl HubClient {
    /// Connect once; `timeout` bounds the connect and every later read.
    pub fn connect(addr: SocketAddr, timeout: Duration) -> Result<Self> {
        let stream = TcpStream::connect_timeout(&addr, timeout)
            .with_context(|| format!("Cannot connect to hub at {addr}"))?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
        Ok(Self {
            stream,
            decoder: FrameDecoder::new(),
            pending: VecDeque::new(),
            timeout,
            next_id: 1,
        })
    }

    /// Connect, retrying on the exponential schedule starting at `base_ms`
    /// with jitter between attempts.
    pub fn connect_with_retry(
        addr: impl ToSocketAddrs,
        timeout: Duration,
        base_ms: u64,
        attempts: u32,
    ) -> Result<Self> {
        let addr = addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| anyhow!("hub address resolved to nothing"))?;

        let mut last_err = match Self::connect(addr, timeout) {
            Ok(client) => return Ok(client),
            Err(e) => e,
        };
        for (attempt, delay_ms) in backoff::schedule(base_ms, i64::from(attempts))
            .into_iter()
            .enumerate()
        {
            let wait = backoff::with_jitter(delay_ms, RETRY_JITTER_MS);
            warn!(
                "Connect to {addr} failed ({last_err:#}), retry {} in {wait:?}",
                attempt + 1
            );
            std::thread::sleep(wait);
            match Self::connect(addr, timeout) {
                Ok(client) => return Ok(client),
                Err(e) => last_err = e,
            }
        }
        Err(last_err.context(format!("giving up on {addr} after {} retries", attempts)))
    }

    /// Send a message, assigning it the next request id when it has none.
    pub fn send(&mut self, mut env: Envelope) -> Result<u64> {
        let id = match env.id {
            Some(id) => id,
            None => {
                let id = self.next_id;
                self.next_id += 1;
                env.id = Some(id);
                id
            }
        };
        write_frame(&mut self.stream, &env).context("Cannot send frame")?;
        Ok(id)
    }

    /// Send an arbitrary JSON value as one frame.
    pub fn send_value(&mut self, value: &Value) -> Result<()> {
        write_frame(&mut self.stream, value).context("Cannot send frame")
    }

    /// Next message from the hub, waiting up to the client timeout.
    pub fn recv(&mut self) -> Result<Envelope> {
        if let Some(env) = self.pending.pop_front() {
            return Ok(env);
        }
        let deadline = Instant::now() + self.timeout;
        let mut buf = [0u8; 8192];
        loop {
            let n = match self.stream.read(&mut buf) {
                Ok(0) => bail!("hub closed the connection"),
                Ok(n) => n,
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    bail!("no reply from hub within {:?}", self.timeout)
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e).context("Cannot read from hub"),
            };
            for frame in self.decoder.feed::<Envelope>(&buf[..n]) {
                match frame {
                    Ok(env) => self.pending.push_back(env),
                    Err(e) => warn!("Dropping undecodable frame from hub: {e}"),
                }
            }
            if let Some(env) = self.pending.pop_front() {
                return Ok(env);
            }
            if Instant::now() >= deadline {
                bail!("no complete frame from hub within {:?}", self.timeout);
            }
        }
    }

    /// Send `env` and wait for the reply carrying the same id. Replies to
    /// other requests and unsolicited events stay queued for [`recv`].
    ///
    /// [`recv`]: HubClient::recv
    pub fn request(&mut self, env: Envelope) -> Result<Envelope> {
        let id = self.send(env)?;
        let mut skipped = Vec::new();
        let reply = loop {
            let msg = match self.recv() {
                Ok(msg) => msg,
                Err(e) => {
                    self.requeue(skipped);
                    return Err(e);
                }
            };
            if msg.id == Some(id) || (msg.id.is_none() && matches!(msg.message, Message::Error { .. }))
            {
                break msg;
            }
            debug!("Queueing unrelated {} frame while waiting for id {id}", msg.kind());
            skipped.push(msg);
        };
        self.requeue(skipped);
        Ok(reply)
    }

    fn requeue(&mut self, skipped: Vec<Envelope>) {
        for msg in skipped.into_iter().rev() {
            self.pending.push_front(msg);
        }
    }
}

impl TimeSyncExchange for HubClient {
    fn exchange(&mut self, seq: u64, t0: i64) -> Result<TimeSyncReply> {
        match self.request(Envelope::time_sync_request(seq, t0))?.message {
            Message::TimeSyncResponse {
                server_timestamp,
                round_trip_time,
                ..
            } => Ok(TimeSyncReply {
                server_timestamp,
                hold_ns: round_trip_time,
            }),
            Message::Error { message, .. } => bail!("hub rejected time_sync: {message}"),
            other => bail!("unexpected reply to time_sync: {other:?}"),
        }
    }
}
