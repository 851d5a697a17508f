//! Receiver for bulk file uploads from devices.
//!
//! Per connection: one JSON header line, then the raw file bytes.
//!
//! ```text
//! {"session_id": "s1", "device_id": "d1", "filename": "rgb/video.mp4", "size": 1048576}\n
//! <size bytes, or everything until the sender closes>
//! ```
//!
//! The file lands in `<data_dir>/<session_id>/<filename>` and one record is
//! appended to that session's manifest.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use flashsync_common::config::HubConfig;
use flashsync_common::protocol::now_ns;
use flashsync_common::session::{
    avoid_reserved, sanitize_relative_path, sanitize_session_id, ManifestRecord, SessionStore,
    DEFAULT_DEVICE_ID, DEFAULT_FILENAME, DEFAULT_SESSION_ID,
};
use flashsync_common::{SyncError, SyncResult};

/// Size of each read while streaming file bytes.
const CHUNK_SIZE: usize = 64 * 1024;

/// Header line sent before the file bytes. Every field is optional.
#[derive(Debug, Default, Deserialize)]
pub struct TransferHeader {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
}

impl TransferHeader {
    fn session_id(&self) -> String {
        match self.session_id.as_deref() {
            Some(s) if !s.is_empty() => sanitize_session_id(s),
            _ => DEFAULT_SESSION_ID.to_string(),
        }
    }

    fn device_id(&self) -> String {
        match self.device_id.as_deref() {
            Some(d) if !d.is_empty() => d.to_string(),
            _ => DEFAULT_DEVICE_ID.to_string(),
        }
    }

    /// Target below the session directory. Never one of the store's own
    /// documents at the session root.
    fn relative_path(&self) -> PathBuf {
        let rel = self
            .filename
            .as_deref()
            .and_then(sanitize_relative_path)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_FILENAME));
        avoid_reserved(rel)
    }
}

#[derive(Debug, Clone, Copy)]
struct Limits {
    header_bytes: usize,
    io_timeout: Duration,
}

/// Handle to a running transfer receiver.
pub struct FileTransferServer {
    stop: Arc<AtomicBool>,
    local_addr: SocketAddr,
    acceptor: Mutex<Option<JoinHandle<()>>>,
}

impl FileTransferServer {
    /// Bind `config.transfer_listen_addr` and start receiving into `store`.
    pub async fn start(config: &HubConfig, store: Arc<SessionStore>) -> Result<Self> {
        let listener = TcpListener::bind(&config.transfer_listen_addr)
            .await
            .with_context(|| {
                format!("Cannot bind transfer server to {}", config.transfer_listen_addr)
            })?;
        let local_addr = listener.local_addr()?;
        std::fs::create_dir_all(store.base_dir()).with_context(|| {
            format!("Cannot create data dir {}", store.base_dir().display())
        })?;

        let stop = Arc::new(AtomicBool::new(false));
        let limits = Limits {
            header_bytes: config.header_limit_bytes,
            io_timeout: config.transfer_io_timeout,
        };
        let acceptor = tokio::spawn(accept_loop(
            listener,
            store,
            limits,
            stop.clone(),
            config.accept_poll,
            config.shutdown_join,
        ));
        info!("File transfer server listening on {local_addr}");

        Ok(Self {
            stop,
            local_addr,
            acceptor: Mutex::new(Some(acceptor)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and wait (bounded) for in-flight transfers.
    pub async fn stop(&self) {
        if self.stop.swap(true, Ordering::SeqCst) {
            return;
        }
        let acceptor = self
            .acceptor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = acceptor {
            if let Err(e) = handle.await {
                warn!("Transfer acceptor ended abnormally: {e}");
            }
        }
        info!("File transfer server stopped");
    }
}

async fn accept_loop(
    listener: TcpListener,
    store: Arc<SessionStore>,
    limits: Limits,
    stop: Arc<AtomicBool>,
    poll: Duration,
    join_timeout: Duration,
) {
    let mut tasks = JoinSet::new();

    while !stop.load(Ordering::SeqCst) {
        while tasks.try_join_next().is_some() {}

        match tokio::time::timeout(poll, listener.accept()).await {
            Err(_) => continue,
            Ok(Ok((stream, remote))) => {
                let store = store.clone();
                tasks.spawn(async move {
                    match receive(stream, &store, limits).await {
                        Ok(record) => info!(
                            "Received {} ({} bytes) from {} [{remote}]",
                            record.filename, record.size, record.device_id
                        ),
                        Err(e) => warn!("Transfer from {remote} failed: {e}"),
                    }
                });
            }
            Ok(Err(e)) => {
                warn!("Accept failed: {e}");
                tokio::time::sleep(poll.min(Duration::from_millis(100))).await;
            }
        }
    }
    drop(listener);

    if tokio::time::timeout(join_timeout, async {
        while tasks.join_next().await.is_some() {}
    })
    .await
    .is_err()
    {
        warn!("{} transfer(s) still running after {join_timeout:?}, aborting", tasks.len());
        tasks.abort_all();
    }
}

/// Handle one upload end to end.
async fn receive(
    stream: TcpStream,
    store: &Arc<SessionStore>,
    limits: Limits,
) -> SyncResult<ManifestRecord> {
    let mut reader = BufReader::new(stream);

    let line = read_header_line(&mut reader, limits).await?;
    let header: TransferHeader =
        serde_json::from_slice(&line).map_err(|e| SyncError::Protocol(e.to_string()))?;

    let session_id = header.session_id();
    let device_id = header.device_id();
    let rel = header.relative_path();

    let session_dir = store.ensure_session_dir(&session_id)?;
    let path = session_dir.join(&rel);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    debug!(
        "Receiving {} for session {session_id} from {device_id} (size={:?})",
        rel.display(),
        header.size
    );

    let written = stream_to_file(&mut reader, &path, header.size, limits.io_timeout).await?;
    if let Some(expected) = header.size.filter(|&n| n != written) {
        warn!(
            "{}: sender closed after {written} of {expected} bytes",
            path.display()
        );
    }

    let record = ManifestRecord {
        filename: manifest_name(&rel),
        size: written,
        device_id,
        received_at_ns: now_ns(),
    };

    // Bookkeeping failures must not discard the data already on disk.
    let manifest_store = store.clone();
    let manifest_record = record.clone();
    let appended = tokio::task::spawn_blocking(move || {
        manifest_store.append_manifest(&session_id, &manifest_record)
    })
    .await;
    match appended {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Manifest update failed for {}: {e}", path.display()),
        Err(e) => warn!("Manifest task failed for {}: {e}", path.display()),
    }

    Ok(record)
}

/// Read up to and excluding the first `\n`, bounded by the header limit.
async fn read_header_line<R>(reader: &mut R, limits: Limits) -> SyncResult<Vec<u8>>
where
    R: AsyncBufReadExt + Unpin,
{
    let mut line = Vec::new();
    let mut bounded = (&mut *reader).take(limits.header_bytes as u64 + 1);
    tokio::time::timeout(limits.io_timeout, bounded.read_until(b'\n', &mut line))
        .await
        .map_err(|_| SyncError::IdleTimeout(limits.io_timeout))??;

    if line.last() == Some(&b'\n') {
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        return Ok(line);
    }
    if line.len() > limits.header_bytes {
        return Err(SyncError::HeaderTooLarge {
            limit: limits.header_bytes,
        });
    }
    Err(SyncError::Connection(
        "connection closed before header line".into(),
    ))
}

/// Copy the body into `path`: exactly `size` bytes if given (fewer if the
/// sender closes early), otherwise until EOF. Returns bytes written.
async fn stream_to_file<R>(
    reader: &mut R,
    path: &Path,
    size: Option<u64>,
    io_timeout: Duration,
) -> SyncResult<u64>
where
    R: AsyncRead + Unpin,
{
    let mut file = tokio::fs::File::create(path).await?;
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut written: u64 = 0;

    loop {
        let want = match size {
            Some(total) if written >= total => break,
            Some(total) => (total - written).min(CHUNK_SIZE as u64) as usize,
            None => CHUNK_SIZE,
        };
        let n = tokio::time::timeout(io_timeout, reader.read(&mut buf[..want]))
            .await
            .map_err(|_| SyncError::IdleTimeout(io_timeout))??;
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n]).await?;
        written += n as u64;
    }

    file.flush().await?;
    Ok(written)
}

/// Manifest filename with `/` separators on every platform.
fn manifest_name(rel: &Path) -> String {
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
