//! Body transfers. Each runs on its own connection, concurrently with the
//! traversal and with each other.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::SyncError;
use crate::protocol::{CHUNK_SIZE, Kind, MetadataRequest, TransferStatus};

/// Everything a transfer needs. Owned outright so the task shares nothing
/// with the traversal.
#[derive(Debug, Clone)]
pub struct TransferJob {
    pub request: MetadataRequest,
    pub source: PathBuf,
    pub addr: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    pub path: String,
    pub bytes: u64,
}

pub async fn run_transfer(job: TransferJob) -> Result<TransferReport, SyncError> {
    let path = job.request.path.clone();
    send(job).await.map_err(|e| match e {
        e @ SyncError::TransferFailure { .. } => e,
        other => SyncError::TransferFailure {
            path,
            reason: other.to_string(),
        },
    })
}

async fn send(job: TransferJob) -> Result<TransferReport, SyncError> {
    let TransferJob {
        request,
        source,
        addr,
    } = job;

    let mut socket = TcpStream::connect(&addr)
        .await
        .map_err(|source| SyncError::Connect {
            addr: addr.clone(),
            source,
        })?;
    socket.set_nodelay(true)?;

    let marker = request.as_transfer();
    socket.write_all(&marker.encode()?).await?;

    let mut bytes = 0;
    if request.kind == Kind::RegularFile && request.size > 0 {
        bytes = send_body(&mut socket, &source, &request).await?;
    }

    let mut status = [0u8; 4];
    socket
        .read_exact(&mut status)
        .await
        .map_err(SyncError::from_read)?;
    match TransferStatus::from_code(u32::from_be_bytes(status))? {
        TransferStatus::Success => {
            debug!(path = %request.path, bytes, "transfer confirmed");
            Ok(TransferReport {
                path: request.path,
                bytes,
            })
        }
        TransferStatus::Failure => Err(SyncError::TransferFailure {
            path: request.path,
            reason: "server reported failure".into(),
        }),
    }
}

/// Stream exactly `request.size` bytes of `source`.
async fn send_body(
    socket: &mut TcpStream,
    source: &Path,
    request: &MetadataRequest,
) -> Result<u64, SyncError> {
    let mut file = File::open(source)
        .await
        .map_err(|e| SyncError::fs("open", source, e))?;
    let current = file
        .metadata()
        .await
        .map_err(|e| SyncError::fs("stat", source, e))?
        .len();
    if current != request.size {
        return Err(file_changed(request));
    }

    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut remaining = request.size;
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let n = file
            .read(&mut buf[..want])
            .await
            .map_err(|e| SyncError::fs("read", source, e))?;
        if n == 0 {
            return Err(file_changed(request));
        }
        socket.write_all(&buf[..n]).await?;
        remaining -= n as u64;
    }
    socket.flush().await?;
    Ok(request.size)
}

fn file_changed(request: &MetadataRequest) -> SyncError {
    SyncError::TransferFailure {
        path: request.path.clone(),
        reason: "file changed while syncing".into(),
    }
}

/// Outcome of every spawned transfer, collected at the final barrier.
#[derive(Debug, Default)]
pub struct TransferResults {
    pub reports: Vec<TransferReport>,
    pub failures: Vec<SyncError>,
}

/// Tracks spawned transfers so the caller can wait for all of them.
pub struct TransferTracker {
    tasks: JoinSet<Result<TransferReport, SyncError>>,
    permits: Arc<Semaphore>,
}

impl TransferTracker {
    pub fn new(max_concurrent: usize) -> Self {
        TransferTracker {
            tasks: JoinSet::new(),
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    /// Start `job` in the background. Never waits, even when the concurrency
    /// limit is reached; the task itself queues for a permit.
    pub fn spawn(&mut self, job: TransferJob) {
        let permits = Arc::clone(&self.permits);
        self.tasks.spawn(async move {
            let _permit = permits
                .acquire_owned()
                .await
                .map_err(|_| SyncError::TransferFailure {
                    path: job.request.path.clone(),
                    reason: "transfer queue closed".into(),
                })?;
            run_transfer(job).await
        });
    }

    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    /// Wait until every spawned transfer has finished, one way or another.
    pub async fn wait_all(mut self) -> TransferResults {
        let mut results = TransferResults::default();
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok(Ok(report)) => {
                    info!(path = %report.path, bytes = report.bytes, "transferred");
                    results.reports.push(report);
                }
                Ok(Err(e)) => {
                    warn!("{}", e);
                    results.failures.push(e);
                }
                Err(e) => {
                    warn!("transfer task did not complete: {}", e);
                    results.failures.push(SyncError::TransferFailure {
                        path: String::new(),
                        reason: e.to_string(),
                    });
                }
            }
        }
        results
    }
}
