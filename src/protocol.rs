//! Wire format shared by the pushing client and the receiving server.
//!
//! A request is a fixed-width record sent field by field:
//!
//! | field  | width | encoding                    |
//! |--------|-------|-----------------------------|
//! | kind   | 4     | u32, big-endian             |
//! | path   | 256   | UTF-8, NUL-padded           |
//! | mode   | 4     | u32, big-endian (`st_mode`) |
//! | digest | 32    | raw SHA-256 bytes           |
//! | size   | 8     | u64, big-endian             |
//!
//! Replies are a single big-endian u32 status code.

use crate::digest::{DIGEST_LEN, Digest};
use crate::error::ProtocolError;

pub const KIND_WIDTH: usize = 4;
pub const PATH_WIDTH: usize = 256;
pub const MODE_WIDTH: usize = 4;
pub const DIGEST_WIDTH: usize = DIGEST_LEN;
pub const SIZE_WIDTH: usize = 8;
pub const REQUEST_LEN: usize = KIND_WIDTH + PATH_WIDTH + MODE_WIDTH + DIGEST_WIDTH + SIZE_WIDTH;

/// Bytes moved per read or write while streaming a file body.
pub const CHUNK_SIZE: usize = 64 * 1024;

const S_IFMT: u32 = 0o170000;
const S_IFDIR: u32 = 0o040000;
const S_IFREG: u32 = 0o100000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    RegularFile,
    Directory,
    /// Same record shape as the metadata request; announces that the body follows.
    TransferMarker,
}

impl Kind {
    pub fn code(self) -> u32 {
        match self {
            Kind::RegularFile => 1,
            Kind::Directory => 2,
            Kind::TransferMarker => 3,
        }
    }

    pub fn from_code(code: u32) -> Result<Self, ProtocolError> {
        match code {
            1 => Ok(Kind::RegularFile),
            2 => Ok(Kind::Directory),
            3 => Ok(Kind::TransferMarker),
            other => Err(ProtocolError::UnknownKind(other)),
        }
    }
}

/// What the server decided about one metadata request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    UpToDate,
    NeedBody,
    TypeMismatch,
}

impl Decision {
    pub fn code(self) -> u32 {
        match self {
            Decision::UpToDate => 0,
            Decision::NeedBody => 1,
            Decision::TypeMismatch => 2,
        }
    }

    pub fn from_code(code: u32) -> Result<Self, ProtocolError> {
        match code {
            0 => Ok(Decision::UpToDate),
            1 => Ok(Decision::NeedBody),
            2 => Ok(Decision::TypeMismatch),
            other => Err(ProtocolError::UnknownStatus(other)),
        }
    }
}

/// Final reply on a transfer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Success,
    Failure,
}

impl TransferStatus {
    pub fn code(self) -> u32 {
        match self {
            TransferStatus::Success => 0,
            TransferStatus::Failure => 2,
        }
    }

    pub fn from_code(code: u32) -> Result<Self, ProtocolError> {
        match code {
            0 => Ok(TransferStatus::Success),
            2 => Ok(TransferStatus::Failure),
            other => Err(ProtocolError::UnknownStatus(other)),
        }
    }
}

/// File type carried in the `mode` type bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeType {
    Directory,
    RegularFile,
    Other,
}

pub fn mode_type(mode: u32) -> ModeType {
    match mode & S_IFMT {
        S_IFDIR => ModeType::Directory,
        S_IFREG => ModeType::RegularFile,
        _ => ModeType::Other,
    }
}

/// Permission bits of `mode`, as applied when creating files and directories.
pub fn permission_bits(mode: u32) -> u32 {
    mode & 0o7777
}

/// One metadata request, describing a single filesystem entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataRequest {
    pub kind: Kind,
    pub path: String,
    pub mode: u32,
    pub digest: Digest,
    pub size: u64,
}

impl MetadataRequest {
    /// The same entry, re-announced on a transfer connection.
    pub fn as_transfer(&self) -> Self {
        MetadataRequest {
            kind: Kind::TransferMarker,
            ..self.clone()
        }
    }

    pub fn is_directory(&self) -> bool {
        match self.kind {
            Kind::Directory => true,
            Kind::RegularFile => false,
            Kind::TransferMarker => mode_type(self.mode) == ModeType::Directory,
        }
    }

    pub fn encode(&self) -> Result<[u8; REQUEST_LEN], ProtocolError> {
        let mut out = [0u8; REQUEST_LEN];
        let mut at = 0;

        out[at..at + KIND_WIDTH].copy_from_slice(&self.kind.code().to_be_bytes());
        at += KIND_WIDTH;

        out[at..at + PATH_WIDTH].copy_from_slice(&encode_path(&self.path)?);
        at += PATH_WIDTH;

        out[at..at + MODE_WIDTH].copy_from_slice(&self.mode.to_be_bytes());
        at += MODE_WIDTH;

        let (digest, size) = if self.is_directory() {
            (Digest::empty(), 0)
        } else {
            (self.digest, self.size)
        };
        out[at..at + DIGEST_WIDTH].copy_from_slice(digest.as_bytes());
        at += DIGEST_WIDTH;

        out[at..at + SIZE_WIDTH].copy_from_slice(&size.to_be_bytes());
        Ok(out)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() != REQUEST_LEN {
            return Err(ProtocolError::ShortField {
                field: "request",
                expected: REQUEST_LEN,
                got: buf.len(),
            });
        }
        let (kind, rest) = buf.split_at(KIND_WIDTH);
        let (path, rest) = rest.split_at(PATH_WIDTH);
        let (mode, rest) = rest.split_at(MODE_WIDTH);
        let (digest, size) = rest.split_at(DIGEST_WIDTH);

        Ok(MetadataRequest {
            kind: decode_kind(kind)?,
            path: decode_path(path)?,
            mode: decode_u32("mode", mode)?,
            digest: decode_digest(digest)?,
            size: decode_u64("size", size)?,
        })
    }
}

fn fixed<const N: usize>(field: &'static str, buf: &[u8]) -> Result<[u8; N], ProtocolError> {
    buf.try_into().map_err(|_| ProtocolError::ShortField {
        field,
        expected: N,
        got: buf.len(),
    })
}

pub fn decode_kind(buf: &[u8]) -> Result<Kind, ProtocolError> {
    Kind::from_code(decode_u32("kind", buf)?)
}

pub fn decode_u32(field: &'static str, buf: &[u8]) -> Result<u32, ProtocolError> {
    Ok(u32::from_be_bytes(fixed(field, buf)?))
}

pub fn decode_u64(field: &'static str, buf: &[u8]) -> Result<u64, ProtocolError> {
    Ok(u64::from_be_bytes(fixed(field, buf)?))
}

pub fn decode_digest(buf: &[u8]) -> Result<Digest, ProtocolError> {
    Ok(Digest::from_bytes(fixed("digest", buf)?))
}

pub fn encode_path(path: &str) -> Result<[u8; PATH_WIDTH], ProtocolError> {
    let bytes = path.as_bytes();
    if bytes.contains(&0) {
        return Err(ProtocolError::InvalidPath(path.to_string()));
    }
    // Keep at least one NUL so the receiver always finds a terminator.
    if bytes.len() >= PATH_WIDTH {
        return Err(ProtocolError::PathTooLong {
            len: bytes.len(),
            max: PATH_WIDTH - 1,
        });
    }
    let mut out = [0u8; PATH_WIDTH];
    out[..bytes.len()].copy_from_slice(bytes);
    Ok(out)
}

pub fn decode_path(buf: &[u8]) -> Result<String, ProtocolError> {
    let buf: [u8; PATH_WIDTH] = fixed("path", buf)?;
    let end = buf.iter().position(|&b| b == 0).unwrap_or(PATH_WIDTH);
    String::from_utf8(buf[..end].to_vec())
        .map_err(|e| ProtocolError::InvalidPath(String::from_utf8_lossy(e.as_bytes()).into_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_request() -> MetadataRequest {
        MetadataRequest {
            kind: Kind::RegularFile,
            path: "root/sub/a.txt".into(),
            mode: 0o100644,
            digest: Digest::from_bytes([7u8; DIGEST_LEN]),
            size: 10,
        }
    }

    #[test]
    fn test_request_round_trip() {
        let req = file_request();
        let decoded = MetadataRequest::decode(&req.encode().unwrap()).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn test_directory_is_canonicalized() {
        let req = MetadataRequest {
            kind: Kind::Directory,
            path: "root/dir".into(),
            mode: 0o040755,
            digest: Digest::from_bytes([9u8; DIGEST_LEN]),
            size: 4096,
        };
        let decoded = MetadataRequest::decode(&req.encode().unwrap()).unwrap();
        assert_eq!(decoded.path, req.path);
        assert_eq!(decoded.mode, req.mode);
        assert_eq!(decoded.digest, Digest::empty());
        assert_eq!(decoded.size, 0);
    }

    #[test]
    fn test_integer_fields_are_full_width_big_endian() {
        let mut req = file_request();
        req.size = 0x0102_0304_0506_0708;
        req.mode = 0o100755;
        let buf = req.encode().unwrap();

        assert_eq!(&buf[..4], &[0, 0, 0, 1]);
        let mode_at = KIND_WIDTH + PATH_WIDTH;
        assert_eq!(&buf[mode_at..mode_at + 4], &0o100755u32.to_be_bytes());
        assert_eq!(&buf[REQUEST_LEN - 8..], &[1, 2, 3, 4, 5, 6, 7, 8]);

        let decoded = MetadataRequest::decode(&buf).unwrap();
        assert_eq!(decoded.size, 0x0102_0304_0506_0708);
    }

    #[test]
    fn test_transfer_marker_keeps_metadata() {
        let req = file_request();
        let marker = req.as_transfer();
        assert_eq!(marker.kind, Kind::TransferMarker);
        let decoded = MetadataRequest::decode(&marker.encode().unwrap()).unwrap();
        assert_eq!(decoded.path, req.path);
        assert_eq!(decoded.digest, req.digest);
        assert_eq!(decoded.size, req.size);
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let mut buf = file_request().encode().unwrap();
        buf[..4].copy_from_slice(&42u32.to_be_bytes());
        assert!(matches!(
            MetadataRequest::decode(&buf),
            Err(ProtocolError::UnknownKind(42))
        ));
    }

    #[test]
    fn test_path_too_long() {
        let mut req = file_request();
        req.path = "x".repeat(PATH_WIDTH);
        assert!(matches!(req.encode(), Err(ProtocolError::PathTooLong { .. })));

        req.path = "x".repeat(PATH_WIDTH - 1);
        assert!(req.encode().is_ok());
    }

    #[test]
    fn test_path_with_nul_is_rejected() {
        assert!(matches!(
            encode_path("a\0b"),
            Err(ProtocolError::InvalidPath(_))
        ));
    }

    #[test]
    fn test_short_buffer_is_rejected() {
        let buf = file_request().encode().unwrap();
        assert!(matches!(
            MetadataRequest::decode(&buf[..REQUEST_LEN - 1]),
            Err(ProtocolError::ShortField { .. })
        ));
        assert!(decode_u32("mode", &[0, 1]).is_err());
    }

    #[test]
    fn test_status_codes() {
        for d in [Decision::UpToDate, Decision::NeedBody, Decision::TypeMismatch] {
            assert_eq!(Decision::from_code(d.code()).unwrap(), d);
        }
        assert!(Decision::from_code(7).is_err());
        assert_eq!(
            TransferStatus::from_code(TransferStatus::Failure.code()).unwrap(),
            TransferStatus::Failure
        );
        assert!(TransferStatus::from_code(1).is_err());
    }

    #[test]
    fn test_mode_type() {
        assert_eq!(mode_type(0o040755), ModeType::Directory);
        assert_eq!(mode_type(0o100644), ModeType::RegularFile);
        assert_eq!(mode_type(0o120777), ModeType::Other);
        assert_eq!(permission_bits(0o100644), 0o644);
    }
}
