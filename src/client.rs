use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use glob::{Pattern, PatternError};
use serde::Serialize;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};
use walkdir::{DirEntry, WalkDir};

use crate::digest::{Digest, digest_file};
use crate::error::{ProtocolError, SyncError};
use crate::protocol::{Decision, Kind, MetadataRequest, encode_path};
use crate::transfer::{TransferJob, TransferTracker, run_transfer};

pub const DEFAULT_MAX_TRANSFERS: usize = 32;

#[derive(Debug, Clone)]
pub struct PushOptions {
    pub source: PathBuf,
    pub host: String,
    pub port: u16,
    pub excludes: Vec<Pattern>,
    pub max_transfers: usize,
}

impl PushOptions {
    pub fn new(source: PathBuf, host: impl Into<String>, port: u16) -> Self {
        PushOptions {
            source,
            host: host.into(),
            port,
            excludes: Vec::new(),
            max_transfers: DEFAULT_MAX_TRANSFERS,
        }
    }

    fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

pub fn compile_excludes(patterns: &[String]) -> Result<Vec<Pattern>, PatternError> {
    patterns.iter().map(|p| Pattern::new(p)).collect()
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct SyncSummary {
    pub entries: u64,
    pub up_to_date: u64,
    pub transferred_files: u64,
    pub created_dirs: u64,
    pub transferred_bytes: u64,
    pub failures: u64,
}

#[derive(Debug, Default)]
pub struct SyncOutcome {
    pub summary: SyncSummary,
    pub failures: Vec<SyncError>,
}

impl SyncOutcome {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// The earliest recorded failure: walk failures in walk order, then
    /// transfer failures in completion order.
    pub fn first_failure(&self) -> Option<&SyncError> {
        self.failures.first()
    }

    fn fail(&mut self, err: SyncError) {
        warn!("{}", err);
        self.summary.failures += 1;
        self.failures.push(err);
    }
}

/// The long-lived connection carrying one request at a time.
struct MetadataChannel {
    socket: TcpStream,
}

impl MetadataChannel {
    async fn connect(addr: &str) -> Result<Self, SyncError> {
        let socket = TcpStream::connect(addr)
            .await
            .map_err(|source| SyncError::Connect {
                addr: addr.to_string(),
                source,
            })?;
        socket.set_nodelay(true)?;
        Ok(MetadataChannel { socket })
    }

    async fn request(&mut self, request: &MetadataRequest) -> Result<Decision, SyncError> {
        self.socket.write_all(&request.encode()?).await?;
        let mut code = [0u8; 4];
        self.socket
            .read_exact(&mut code)
            .await
            .map_err(SyncError::from_read)?;
        Ok(Decision::from_code(u32::from_be_bytes(code))?)
    }

    async fn close(mut self) {
        if let Err(e) = self.socket.shutdown().await {
            debug!("metadata connection shutdown: {}", e);
        }
    }
}

/// Mirror `opts.source` onto the server under the source's own name.
///
/// Per-entry problems are collected in the returned outcome and do not stop
/// the walk. Losing the metadata connection does, and is returned as `Err`.
pub async fn push_tree(opts: &PushOptions) -> Result<SyncOutcome, SyncError> {
    let source = fs::canonicalize(&opts.source)
        .await
        .map_err(|e| SyncError::fs("resolve", &opts.source, e))?;
    let remote_root = source
        .file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| {
            SyncError::fs(
                "resolve",
                &source,
                io::Error::new(io::ErrorKind::InvalidInput, "source has no usable name"),
            )
        })?;

    let addr = opts.addr();
    info!("syncing {} to {} as {}", source.display(), addr, remote_root);
    let mut channel = MetadataChannel::connect(&addr).await?;
    let mut tracker = TransferTracker::new(opts.max_transfers);
    let mut outcome = SyncOutcome::default();

    let walked = walk(
        &mut channel,
        &mut tracker,
        &mut outcome,
        &source,
        &remote_root,
        opts,
    )
    .await;
    channel.close().await;

    // Transfers already running finish even if the walk was cut short.
    debug!("waiting for {} transfer(s)", tracker.in_flight());
    let results = tracker.wait_all().await;
    for report in &results.reports {
        outcome.summary.transferred_files += 1;
        outcome.summary.transferred_bytes += report.bytes;
    }
    for err in results.failures {
        outcome.summary.failures += 1;
        outcome.failures.push(err);
    }

    walked?;
    Ok(outcome)
}

async fn walk(
    channel: &mut MetadataChannel,
    tracker: &mut TransferTracker,
    outcome: &mut SyncOutcome,
    source: &Path,
    remote_root: &str,
    opts: &PushOptions,
) -> Result<(), SyncError> {
    let mut entries = WalkDir::new(source)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !skipped(e, source, &opts.excludes));

    while let Some(next) = entries.next() {
        let entry = match next {
            Ok(entry) => entry,
            Err(e) => {
                let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| source.to_path_buf());
                outcome.fail(SyncError::fs("list", path, e.into()));
                continue;
            }
        };
        let is_dir = entry.file_type().is_dir();

        let request = match build_request(&entry, source, remote_root).await {
            Ok(request) => request,
            Err(e) => {
                outcome.fail(e);
                if is_dir {
                    entries.skip_current_dir();
                }
                continue;
            }
        };

        outcome.summary.entries += 1;
        let decision = channel.request(&request).await?;
        debug!(path = %request.path, ?decision, "decision");

        match decision {
            Decision::UpToDate => outcome.summary.up_to_date += 1,
            Decision::TypeMismatch => {
                outcome.fail(SyncError::TypeMismatch { path: request.path });
                if is_dir {
                    entries.skip_current_dir();
                }
            }
            Decision::NeedBody => {
                let job = TransferJob {
                    request,
                    source: entry.path().to_path_buf(),
                    addr: opts.addr(),
                };
                if is_dir {
                    // children land inside it, so it must exist first
                    match run_transfer(job).await {
                        Ok(report) => {
                            info!(path = %report.path, "created directory");
                            outcome.summary.created_dirs += 1;
                        }
                        Err(e) => {
                            outcome.fail(e);
                            entries.skip_current_dir();
                        }
                    }
                } else {
                    tracker.spawn(job);
                }
            }
        }
    }
    Ok(())
}

/// Hidden and excluded entries are left out together with their subtrees.
fn skipped(entry: &DirEntry, source: &Path, excludes: &[Pattern]) -> bool {
    if entry.file_name().to_string_lossy().starts_with('.') {
        return true;
    }
    match entry.path().strip_prefix(source) {
        Ok(rel) => {
            let rel = rel.to_string_lossy();
            excludes.iter().any(|p| p.matches(&rel))
        }
        Err(_) => false,
    }
}

fn remote_path(entry: &DirEntry, source: &Path, remote_root: &str) -> Result<String, SyncError> {
    let rel = entry.path().strip_prefix(source).unwrap_or(Path::new(""));
    let mut remote = remote_root.to_string();
    for part in rel.components() {
        let part = part.as_os_str().to_str().ok_or_else(|| {
            ProtocolError::InvalidPath(entry.path().to_string_lossy().into_owned())
        })?;
        remote.push('/');
        remote.push_str(part);
    }
    encode_path(&remote)?;
    Ok(remote)
}

async fn build_request(
    entry: &DirEntry,
    source: &Path,
    remote_root: &str,
) -> Result<MetadataRequest, SyncError> {
    let path = entry.path();
    let remote = remote_path(entry, source, remote_root)?;
    let meta = fs::symlink_metadata(path)
        .await
        .map_err(|e| SyncError::fs("stat", path, e))?;

    if meta.is_dir() {
        Ok(MetadataRequest {
            kind: Kind::Directory,
            path: remote,
            mode: meta.mode(),
            digest: Digest::empty(),
            size: 0,
        })
    } else if meta.is_file() {
        let owned = path.to_path_buf();
        let digest = tokio::task::spawn_blocking(move || digest_file(&owned))
            .await
            .map_err(io::Error::other)?
            .map_err(|e| SyncError::fs("digest", path, e))?;
        Ok(MetadataRequest {
            kind: Kind::RegularFile,
            path: remote,
            mode: meta.mode(),
            digest,
            size: meta.len(),
        })
    } else {
        Err(SyncError::UnsupportedType {
            path: path.to_path_buf(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry_for(root: &Path, name: &str) -> DirEntry {
        WalkDir::new(root)
            .into_iter()
            .filter_map(Result::ok)
            .find(|e| e.file_name() == name)
            .unwrap()
    }

    #[test]
    fn test_remote_path_mirrors_layout() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("sub/deeper")).unwrap();
        std::fs::write(tmp.path().join("sub/deeper/f.txt"), b"x").unwrap();

        let entry = entry_for(tmp.path(), "f.txt");
        assert_eq!(
            remote_path(&entry, tmp.path(), "tree").unwrap(),
            "tree/sub/deeper/f.txt"
        );
        let root = entry_for(tmp.path(), tmp.path().file_name().unwrap().to_str().unwrap());
        assert_eq!(remote_path(&root, tmp.path(), "tree").unwrap(), "tree");
    }

    #[test]
    fn test_hidden_and_excluded_are_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join(".secret"), b"x").unwrap();
        std::fs::write(tmp.path().join("keep.txt"), b"x").unwrap();
        std::fs::write(tmp.path().join("drop.tmp"), b"x").unwrap();
        let excludes = compile_excludes(&["*.tmp".to_string()]).unwrap();

        assert!(skipped(&entry_for(tmp.path(), ".secret"), tmp.path(), &[]));
        assert!(!skipped(&entry_for(tmp.path(), "keep.txt"), tmp.path(), &excludes));
        assert!(skipped(&entry_for(tmp.path(), "drop.tmp"), tmp.path(), &excludes));
    }

    #[test]
    fn test_invalid_exclude_pattern() {
        assert!(compile_excludes(&["[".to_string()]).is_err());
    }

    #[tokio::test]
    async fn test_build_request_for_file_and_dir() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("d")).unwrap();
        std::fs::write(tmp.path().join("d/a.txt"), b"0123456789").unwrap();

        let file = build_request(&entry_for(tmp.path(), "a.txt"), tmp.path(), "r")
            .await
            .unwrap();
        assert_eq!(file.kind, Kind::RegularFile);
        assert_eq!(file.path, "r/d/a.txt");
        assert_eq!(file.size, 10);
        assert_eq!(file.digest, digest_file(&tmp.path().join("d/a.txt")).unwrap());

        let dir = build_request(&entry_for(tmp.path(), "d"), tmp.path(), "r")
            .await
            .unwrap();
        assert_eq!(dir.kind, Kind::Directory);
        assert_eq!(dir.digest, Digest::empty());
        assert_eq!(dir.size, 0);
    }

    #[tokio::test]
    async fn test_symlink_is_unsupported() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("target"), b"x").unwrap();
        std::os::unix::fs::symlink(tmp.path().join("target"), tmp.path().join("link")).unwrap();

        let err = build_request(&entry_for(tmp.path(), "link"), tmp.path(), "r")
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::UnsupportedType { .. }));
    }
}
