//! One accepted socket on the receiving side, and what it does with each
//! complete request.

use std::fmt;
use std::fs::{DirBuilder, File, OpenOptions};
use std::io::{self, Write};
use std::net::SocketAddr;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::compare::compare;
use crate::error::{ProtocolError, SyncError};
use crate::parser::{Progress, RequestParser};
use crate::protocol::{
    CHUNK_SIZE, Kind, MetadataRequest, ModeType, TransferStatus, mode_type, permission_bits,
};
use crate::util::resolve_under_root;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Result of one readiness event.
#[derive(Debug)]
pub enum ReadStatus {
    ReadPending,
    RequestComplete(MetadataRequest),
    BodyComplete,
    PeerClosed,
    Failed(SyncError),
}

/// What the multiplexer does with the connection after handling a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Keep,
    Close,
}

/// What a transfer request turned into on disk.
#[derive(Debug)]
pub enum TransferAction {
    DirectoryCreated,
    EmptyFileWritten,
    ReceiveBody(BodySink),
}

/// An open output file waiting for `remaining` more body bytes.
#[derive(Debug)]
pub struct BodySink {
    file: File,
    path: PathBuf,
    remaining: u64,
}

impl BodySink {
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Write one received chunk. Returns true once the declared size is reached.
    pub fn write_chunk(&mut self, chunk: &[u8]) -> Result<bool, SyncError> {
        if chunk.len() as u64 > self.remaining {
            return Err(ProtocolError::ShortField {
                field: "body",
                expected: self.remaining as usize,
                got: chunk.len(),
            }
            .into());
        }
        self.file
            .write_all(chunk)
            .map_err(|e| SyncError::fs("write", &self.path, e))?;
        self.remaining -= chunk.len() as u64;
        if self.remaining == 0 {
            self.file
                .flush()
                .map_err(|e| SyncError::fs("flush", &self.path, e))?;
        }
        Ok(self.remaining == 0)
    }
}

/// Carry out the filesystem side of a transfer request, dispatching on the
/// type bits of `mode`.
pub fn open_transfer(request: &MetadataRequest, target: &Path) -> Result<TransferAction, SyncError> {
    let perms = permission_bits(request.mode);
    match mode_type(request.mode) {
        ModeType::Directory => {
            DirBuilder::new()
                .mode(perms)
                .create(target)
                .map_err(|e| SyncError::fs("mkdir", target, e))?;
            Ok(TransferAction::DirectoryCreated)
        }
        ModeType::RegularFile => {
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(perms)
                .open(target)
                .map_err(|e| SyncError::fs("open", target, e))?;
            if request.size == 0 {
                return Ok(TransferAction::EmptyFileWritten);
            }
            Ok(TransferAction::ReceiveBody(BodySink {
                file,
                path: target.to_path_buf(),
                remaining: request.size,
            }))
        }
        ModeType::Other => Err(ProtocolError::UnsupportedMode {
            path: request.path.clone(),
            mode: request.mode,
        }
        .into()),
    }
}

/// Connection record owned by the multiplexer.
#[derive(Debug)]
pub struct Connection {
    id: ConnId,
    stream: Arc<TcpStream>,
    peer: SocketAddr,
    parser: RequestParser,
    body: Option<BodySink>,
    buf: Vec<u8>,
}

impl Connection {
    pub fn new(id: ConnId, stream: TcpStream, peer: SocketAddr) -> Self {
        Connection {
            id,
            stream: Arc::new(stream),
            peer,
            parser: RequestParser::new(),
            body: None,
            buf: Vec::new(),
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn stream(&self) -> Arc<TcpStream> {
        Arc::clone(&self.stream)
    }

    /// Perform at most one read. Never blocks.
    pub fn read_step(&mut self) -> ReadStatus {
        if self.body.is_some() {
            self.read_body()
        } else {
            self.read_request()
        }
    }

    fn read_request(&mut self) -> ReadStatus {
        let n = match self.stream.try_read(self.parser.unfilled_mut()) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return ReadStatus::ReadPending,
            Err(e) => return ReadStatus::Failed(e.into()),
        };
        match self.parser.advance(n) {
            Ok(Progress::Pending) => ReadStatus::ReadPending,
            Ok(Progress::Complete(request)) => ReadStatus::RequestComplete(request),
            Ok(Progress::PeerClosed) => ReadStatus::PeerClosed,
            Err(e) => ReadStatus::Failed(e.into()),
        }
    }

    fn read_body(&mut self) -> ReadStatus {
        let Some(sink) = self.body.as_mut() else {
            return ReadStatus::ReadPending;
        };
        let want = sink.remaining().min(CHUNK_SIZE as u64) as usize;
        if self.buf.len() < want {
            self.buf.resize(CHUNK_SIZE, 0);
        }
        let n = match self.stream.try_read(&mut self.buf[..want]) {
            Ok(0) => {
                return ReadStatus::Failed(
                    ProtocolError::TruncatedBody {
                        remaining: sink.remaining(),
                    }
                    .into(),
                );
            }
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return ReadStatus::ReadPending,
            Err(e) => return ReadStatus::Failed(e.into()),
        };
        match sink.write_chunk(&self.buf[..n]) {
            Ok(true) => {
                self.body = None;
                ReadStatus::BodyComplete
            }
            Ok(false) => ReadStatus::ReadPending,
            Err(e) => ReadStatus::Failed(e),
        }
    }

    /// Act on a complete request. Metadata requests are answered with a
    /// decision and the connection stays open for the next one; transfer
    /// requests either finish here or switch the connection to body mode.
    pub fn handle_request(
        &mut self,
        root: &Path,
        request: MetadataRequest,
    ) -> Result<Disposition, SyncError> {
        debug!(
            conn = %self.id,
            path = %request.path,
            kind = ?request.kind,
            mode = format_args!("{:o}", request.mode),
            digest = %request.digest,
            size = request.size,
            "request"
        );
        let target = resolve_under_root(root, &request.path)?;

        match request.kind {
            Kind::RegularFile | Kind::Directory => {
                let decision = compare(&request, &target)?;
                debug!(conn = %self.id, path = %request.path, ?decision, "compared");
                self.reply(decision.code())?;
                self.parser.reset();
                Ok(Disposition::Keep)
            }
            Kind::TransferMarker => match open_transfer(&request, &target)? {
                TransferAction::DirectoryCreated => {
                    info!(conn = %self.id, path = %request.path, "created directory");
                    self.reply(TransferStatus::Success.code())?;
                    Ok(Disposition::Close)
                }
                TransferAction::EmptyFileWritten => {
                    info!(conn = %self.id, path = %request.path, "received empty file");
                    self.reply(TransferStatus::Success.code())?;
                    Ok(Disposition::Close)
                }
                TransferAction::ReceiveBody(sink) => {
                    debug!(conn = %self.id, path = %request.path, size = request.size, "receiving body");
                    self.body = Some(sink);
                    Ok(Disposition::Keep)
                }
            },
        }
    }

    /// Confirm a fully received body. The connection is done after this.
    pub fn finish_body(&mut self) -> Result<Disposition, SyncError> {
        self.reply(TransferStatus::Success.code())?;
        Ok(Disposition::Close)
    }

    /// Send a 4-byte reply without waiting. A peer that has stopped draining
    /// its socket loses the connection instead of stalling the loop.
    fn reply(&self, code: u32) -> io::Result<()> {
        let bytes = code.to_be_bytes();
        match self.stream.try_write(&bytes) {
            Ok(n) if n == bytes.len() => Ok(()),
            Ok(n) => Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("reply cut short after {} of {} bytes", n, bytes.len()),
            )),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                "peer is not reading replies",
            )),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::Digest;
    use crate::protocol::Decision;
    use std::os::unix::fs::PermissionsExt;
    use tokio::net::TcpListener;

    fn transfer(path: &str, mode: u32, size: u64) -> MetadataRequest {
        MetadataRequest {
            kind: Kind::TransferMarker,
            path: path.into(),
            mode,
            digest: Digest::empty(),
            size,
        }
    }

    #[test]
    fn test_transfer_creates_directory_with_mode() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("d");
        let action = open_transfer(&transfer("d", 0o040750, 0), &target).unwrap();
        assert!(matches!(action, TransferAction::DirectoryCreated));
        assert!(target.is_dir());
        let mode = std::fs::metadata(&target).unwrap().permissions().mode();
        // umask may only clear bits
        assert_eq!(mode & !0o750 & 0o777, 0);
    }

    #[test]
    fn test_transfer_existing_directory_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("d");
        std::fs::create_dir(&target).unwrap();
        assert!(matches!(
            open_transfer(&transfer("d", 0o040755, 0), &target),
            Err(SyncError::Filesystem { action: "mkdir", .. })
        ));
    }

    #[test]
    fn test_transfer_empty_file() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("empty");
        std::fs::write(&target, b"stale contents").unwrap();
        let action = open_transfer(&transfer("empty", 0o100644, 0), &target).unwrap();
        assert!(matches!(action, TransferAction::EmptyFileWritten));
        assert_eq!(std::fs::read(&target).unwrap(), b"");
    }

    #[test]
    fn test_body_sink_consumes_exactly_size() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("f");
        let TransferAction::ReceiveBody(mut sink) =
            open_transfer(&transfer("f", 0o100644, 10), &target).unwrap()
        else {
            panic!("expected a body sink");
        };
        assert!(!sink.write_chunk(b"0123").unwrap());
        assert_eq!(sink.remaining(), 6);
        assert!(sink.write_chunk(b"456789").unwrap());
        assert!(sink.write_chunk(b"x").is_err());
        drop(sink);
        assert_eq!(std::fs::read(&target).unwrap(), b"0123456789");
    }

    #[test]
    fn test_transfer_rejects_unsupported_mode() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(matches!(
            open_transfer(&transfer("l", 0o120777, 0), &tmp.path().join("l")),
            Err(SyncError::Protocol(ProtocolError::UnsupportedMode { .. }))
        ));
    }

    #[test]
    fn test_transfer_into_missing_parent_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("missing/f");
        assert!(matches!(
            open_transfer(&transfer("missing/f", 0o100644, 3), &target),
            Err(SyncError::Filesystem { action: "open", .. })
        ));
    }

    #[tokio::test]
    async fn test_reply_to_stalled_peer_fails_instead_of_waiting() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let _client = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (stream, peer) = listener.accept().await.unwrap();
        let conn = Connection::new(ConnId(0), stream, peer);

        // fill the send buffer; the client never reads
        let stream = conn.stream();
        stream.writable().await.unwrap();
        let filler = vec![0u8; CHUNK_SIZE];
        loop {
            match stream.try_write(&filler) {
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => panic!("unexpected write error: {e}"),
            }
        }

        let err = conn.reply(Decision::NeedBody.code()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }
}
