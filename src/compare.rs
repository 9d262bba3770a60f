//! Server-side comparison of a metadata request against the local tree.

use std::io;
use std::path::Path;

use crate::digest::{digest_file, digests_equal};
use crate::error::{ProtocolError, SyncError};
use crate::protocol::{Decision, Kind, MetadataRequest};

/// Decide whether `target` needs the body described by `request`.
///
/// Only reads the filesystem. Symlinks are not followed, so a link where a
/// file or directory is expected is a type mismatch.
pub fn compare(request: &MetadataRequest, target: &Path) -> Result<Decision, SyncError> {
    let wants_dir = match request.kind {
        Kind::Directory => true,
        Kind::RegularFile => false,
        Kind::TransferMarker => {
            return Err(ProtocolError::UnknownKind(Kind::TransferMarker.code()).into());
        }
    };

    let meta = match std::fs::symlink_metadata(target) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Decision::NeedBody),
        Err(e) => return Err(SyncError::fs("stat", target, e)),
    };

    if wants_dir {
        return Ok(if meta.is_dir() {
            Decision::UpToDate
        } else {
            Decision::TypeMismatch
        });
    }
    if !meta.is_file() {
        return Ok(Decision::TypeMismatch);
    }
    if meta.len() != request.size {
        return Ok(Decision::NeedBody);
    }
    let local = digest_file(target).map_err(|e| SyncError::fs("digest", target, e))?;
    if digests_equal(&local, &request.digest) {
        Ok(Decision::UpToDate)
    } else {
        Ok(Decision::NeedBody)
    }
}
