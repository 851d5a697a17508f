//! TCP command server that devices connect to.
//!
//! One task per connection. Each task reads length-prefixed frames, looks
//! up the command in the fixed table and writes exactly one reply per
//! frame. Connections are registered under `device_<ip>_<port>` so the hub
//! can broadcast to every live device.
//!
//! The acceptor and every reader wake at least once per poll interval to
//! check the stop flag, so [`CommandServer::stop`] completes within a
//! bounded time even when peers are silent.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use flashsync_common::config::HubConfig;
use flashsync_common::framing::{encode, FrameDecoder};
use flashsync_common::protocol::{
    now_ns, timestamp_ns, AckStatus, Command, Envelope, Message, FEATURES,
};
use flashsync_common::SyncError;

/// Version string reported by `query_capabilities`.
pub const CAPABILITIES_VERSION: &str = "1.0";

/// Bound on a single reply or broadcast write.
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

type SharedWriter = Arc<tokio::sync::Mutex<OwnedWriteHalf>>;

/// Snapshot of one registered connection.
#[derive(Debug, Clone, Serialize)]
pub struct ClientInfo {
    pub device_id: String,
    pub remote: SocketAddr,
    pub connected_secs: u64,
    pub idle_secs: u64,
}

struct ClientEntry {
    remote: SocketAddr,
    connected_at: Instant,
    last_activity: Instant,
    writer: SharedWriter,
}

/// State shared between the acceptor, the connection tasks and callers.
struct Shared {
    clients: Mutex<HashMap<String, ClientEntry>>,
    stop: AtomicBool,
    active_session: Mutex<Option<String>>,
    transfer_port: u16,
    idle_timeout: Duration,
    poll: Duration,
}

impl Shared {
    fn clients(&self) -> std::sync::MutexGuard<'_, HashMap<String, ClientEntry>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn touch(&self, device_id: &str) {
        if let Some(entry) = self.clients().get_mut(device_id) {
            entry.last_activity = Instant::now();
        }
    }

    fn writers(&self) -> Vec<(String, SharedWriter)> {
        self.clients()
            .iter()
            .map(|(id, entry)| (id.clone(), entry.writer.clone()))
            .collect()
    }
}

/// Handle to a running command server.
pub struct CommandServer {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    acceptor: Mutex<Option<JoinHandle<()>>>,
}

impl CommandServer {
    /// Bind `config.command_listen_addr` and start accepting devices.
    pub async fn start(config: &HubConfig) -> Result<Self> {
        let listener = TcpListener::bind(&config.command_listen_addr)
            .await
            .with_context(|| format!("Cannot bind command server to {}", config.command_listen_addr))?;
        let local_addr = listener.local_addr()?;

        let shared = Arc::new(Shared {
            clients: Mutex::new(HashMap::new()),
            stop: AtomicBool::new(false),
            active_session: Mutex::new(None),
            transfer_port: config.transfer_port,
            idle_timeout: config.client_idle_timeout,
            poll: config.accept_poll,
        });

        let acceptor = tokio::spawn(accept_loop(listener, shared.clone(), config.shutdown_join));
        info!("Command server listening on {local_addr}");

        Ok(Self {
            shared,
            local_addr,
            acceptor: Mutex::new(Some(acceptor)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Registered connections, sorted by device id.
    pub fn clients(&self) -> Vec<ClientInfo> {
        let now = Instant::now();
        let mut list: Vec<ClientInfo> = self
            .shared
            .clients()
            .iter()
            .map(|(id, entry)| ClientInfo {
                device_id: id.clone(),
                remote: entry.remote,
                connected_secs: now.duration_since(entry.connected_at).as_secs(),
                idle_secs: now.duration_since(entry.last_activity).as_secs(),
            })
            .collect();
        list.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        list
    }

    pub fn client_count(&self) -> usize {
        self.shared.clients().len()
    }

    /// Session named by the last `start_recording`, until `stop_recording`.
    pub fn active_session(&self) -> Option<String> {
        self.shared
            .active_session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Send `message` to every registered connection and return how many
    /// writes succeeded. A failed write does not stop the others.
    pub async fn send_broadcast(&self, message: &Envelope) -> usize {
        let frame = match encode(message) {
            Ok(frame) => frame,
            Err(e) => {
                error!("Cannot encode broadcast: {e}");
                return 0;
            }
        };

        let mut delivered = 0;
        for (device_id, writer) in self.shared.writers() {
            match write_frame_bytes(&writer, &frame).await {
                Ok(()) => delivered += 1,
                Err(e) => debug!("Broadcast to {device_id} failed: {e:#}"),
            }
        }
        delivered
    }

    /// Broadcast a `preview_frame` event with a JPEG thumbnail.
    pub async fn broadcast_preview(&self, device_id: &str, jpeg: &[u8], ts_ns: i64) -> usize {
        self.send_broadcast(&Envelope::preview_frame(device_id, jpeg, ts_ns))
            .await
    }

    /// Stop accepting, close every client socket and wait for the
    /// connection tasks. Calling it twice is harmless.
    pub async fn stop(&self) {
        if self.shared.stop.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Stopping command server");

        for (device_id, writer) in self.shared.writers() {
            if let Err(e) = writer.lock().await.shutdown().await {
                debug!("Closing {device_id}: {e}");
            }
        }

        let acceptor = self
            .acceptor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = acceptor {
            if let Err(e) = handle.await {
                warn!("Command acceptor ended abnormally: {e}");
            }
        }
        self.shared.clients().clear();
        info!("Command server stopped");
    }
}

// ── accept / connection tasks ────────────────────────────────────────────

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>, join_timeout: Duration) {
    let mut tasks = JoinSet::new();

    while !shared.stop.load(Ordering::SeqCst) {
        // Reap finished connection tasks.
        while tasks.try_join_next().is_some() {}

        match tokio::time::timeout(shared.poll, listener.accept()).await {
            Err(_) => continue,
            Ok(Ok((stream, remote))) => {
                tasks.spawn(serve_connection(stream, remote, shared.clone()));
            }
            Ok(Err(e)) => {
                warn!("Accept failed: {e}");
                tokio::time::sleep(shared.poll.min(Duration::from_millis(100))).await;
            }
        }
    }
    drop(listener);

    let joined = tokio::time::timeout(join_timeout, async {
        while tasks.join_next().await.is_some() {}
    })
    .await;
    if joined.is_err() {
        warn!("{} connection task(s) still running after {join_timeout:?}, aborting", tasks.len());
        tasks.abort_all();
    }
}

async fn serve_connection(stream: TcpStream, remote: SocketAddr, shared: Arc<Shared>) {
    let device_id = format!("device_{}_{}", remote.ip(), remote.port());
    if let Err(e) = stream.set_nodelay(true) {
        debug!("set_nodelay on {device_id}: {e}");
    }
    let (mut reader, writer) = stream.into_split();
    let writer: SharedWriter = Arc::new(tokio::sync::Mutex::new(writer));

    let now = Instant::now();
    shared.clients().insert(
        device_id.clone(),
        ClientEntry {
            remote,
            connected_at: now,
            last_activity: now,
            writer: writer.clone(),
        },
    );
    info!("Device connected: {device_id}");

    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; 8192];
    let mut last_activity = Instant::now();

    'conn: while !shared.stop.load(Ordering::SeqCst) {
        let n = match tokio::time::timeout(shared.poll, reader.read(&mut buf)).await {
            Err(_) => {
                if last_activity.elapsed() >= shared.idle_timeout {
                    info!("{device_id}: {}", SyncError::IdleTimeout(shared.idle_timeout));
                    break;
                }
                continue;
            }
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                debug!("{device_id}: {}", SyncError::Connection(e.to_string()));
                break;
            }
        };
        let received_ns = now_ns();
        last_activity = Instant::now();
        shared.touch(&device_id);

        for frame in decoder.feed::<Value>(&buf[..n]) {
            let reply = match frame {
                Ok(value) => handle_message(&shared, &value, received_ns),
                Err(e) => Envelope::error(&SyncError::Protocol(e.to_string())),
            };
            let bytes = match encode(&reply) {
                Ok(bytes) => bytes,
                Err(e) => {
                    error!("Cannot encode reply to {device_id}: {e}");
                    continue;
                }
            };
            if let Err(e) = write_frame_bytes(&writer, &bytes).await {
                debug!("{device_id}: reply failed: {e:#}");
                break 'conn;
            }
        }
    }

    shared.clients().remove(&device_id);
    let _ = writer.lock().await.shutdown().await;
    info!("Device disconnected: {device_id}");
}

async fn write_frame_bytes(writer: &SharedWriter, frame: &[u8]) -> Result<()> {
    let mut w = writer.lock().await;
    tokio::time::timeout(WRITE_TIMEOUT, w.write_all(frame))
        .await
        .context("write timed out")??;
    Ok(())
}

// ── dispatch ─────────────────────────────────────────────────────────────

/// Build the reply to one decoded frame. Never fails: problems become an
/// `error` message and the connection stays open.
fn handle_message(shared: &Shared, value: &Value, received_ns: i64) -> Envelope {
    let id = value.get("id").and_then(Value::as_u64);
    let reply = match dispatch(shared, value, received_ns) {
        Ok(reply) => reply,
        Err(e) => {
            warn!("Command rejected: {e}");
            Envelope::error(&e)
        }
    };
    reply.with_id(id)
}

fn dispatch(shared: &Shared, value: &Value, received_ns: i64) -> Result<Envelope, SyncError> {
    if !value.is_object() {
        return Err(SyncError::Protocol("expected a JSON object".into()));
    }
    let command: Command = value
        .get("command")
        .and_then(Value::as_str)
        .ok_or(SyncError::MissingCommand)?
        .parse()?;

    guarded(|| run_command(shared, command, value, received_ns))
}

/// Run a handler, turning a panic into [`SyncError::Handler`].
fn guarded<F>(handler: F) -> Result<Envelope, SyncError>
where
    F: FnOnce() -> Result<Envelope, SyncError>,
{
    catch_unwind(AssertUnwindSafe(handler)).unwrap_or_else(|panic| {
        let msg = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "handler panicked".to_string());
        Err(SyncError::Handler(msg))
    })
}

fn run_command(
    shared: &Shared,
    command: Command,
    value: &Value,
    received_ns: i64,
) -> Result<Envelope, SyncError> {
    let reply = match command {
        Command::QueryCapabilities => Message::Capabilities {
            version: CAPABILITIES_VERSION.to_string(),
            supported_commands: Command::ALL.to_vec(),
            features: FEATURES.iter().map(|f| f.to_string()).collect(),
        },
        Command::StartRecording => {
            let session_id = match value.get("session_id") {
                None | Some(Value::Null) => default_session_id(),
                Some(Value::String(s)) if !s.is_empty() => s.clone(),
                Some(other) => {
                    return Err(SyncError::Handler(format!("invalid session_id: {other}")))
                }
            };
            *shared
                .active_session
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(session_id.clone());
            info!("Recording started: {session_id}");
            ack(command, AckStatus::RecordingStarted).session(session_id)
        }
        Command::StopRecording => {
            let ended = shared
                .active_session
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            info!("Recording stopped: {}", ended.as_deref().unwrap_or("-"));
            ack(command, AckStatus::RecordingStopped).build()
        }
        Command::FlashSync => {
            let flash_timestamp = match value.get("timestamp") {
                None | Some(Value::Null) => Value::from(now_ns()),
                Some(ts) => ts.clone(),
            };
            ack(command, AckStatus::FlashExecuted).flash(flash_timestamp)
        }
        Command::Heartbeat => Message::HeartbeatAck {
            server_time: now_ns(),
            client_time: value.get("timestamp").cloned().unwrap_or(Value::Null),
        },
        Command::TransferFiles => {
            let session_id = value
                .get("session_id")
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| {
                    shared
                        .active_session
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .clone()
                });
            AckBuilder {
                session_id,
                transfer_port: Some(shared.transfer_port),
                ..ack(command, AckStatus::ReadyForTransfer)
            }
            .build()
        }
        Command::TimeSync => {
            let client_timestamp = match ["timestamp", "t0"]
                .iter()
                .find_map(|key| value.get(*key).filter(|v| !v.is_null()))
            {
                None => 0,
                Some(raw) => timestamp_ns(raw).ok_or_else(|| {
                    SyncError::Handler(format!("invalid timestamp: {raw}"))
                })?,
            };
            Message::TimeSyncResponse {
                server_timestamp: received_ns,
                client_timestamp,
                round_trip_time: now_ns().saturating_sub(received_ns).max(0),
                seq: value.get("seq").and_then(Value::as_u64),
            }
        }
    };
    Ok(Envelope::new(reply))
}

/// `session_<unix seconds>` for recordings started without a name.
fn default_session_id() -> String {
    format!("session_{}", chrono::Utc::now().timestamp())
}

struct AckBuilder {
    command: Command,
    status: AckStatus,
    session_id: Option<String>,
    flash_timestamp: Option<Value>,
    transfer_port: Option<u16>,
}

fn ack(command: Command, status: AckStatus) -> AckBuilder {
    AckBuilder {
        command,
        status,
        session_id: None,
        flash_timestamp: None,
        transfer_port: None,
    }
}

impl AckBuilder {
    fn session(mut self, session_id: String) -> Message {
        self.session_id = Some(session_id);
        self.build()
    }

    fn flash(mut self, ts: Value) -> Message {
        self.flash_timestamp = Some(ts);
        self.build()
    }

    fn build(self) -> Message {
        Message::Ack {
            command: self.command,
            status: self.status,
            session_id: self.session_id,
            flash_timestamp: self.flash_timestamp,
            transfer_port: self.transfer_port,
        }
    }
}
