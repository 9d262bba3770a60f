//! Incremental request parser.
//!
//! A request arrives one field at a time over a non-blocking socket, possibly
//! split across many reads. [`transition`] is the pure state function; the
//! [`RequestParser`] owns the record buffer and drives it.

use crate::error::ProtocolError;
use crate::protocol::{
    DIGEST_WIDTH, KIND_WIDTH, MODE_WIDTH, MetadataRequest, PATH_WIDTH, REQUEST_LEN, SIZE_WIDTH,
    decode_kind,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    AwaitKind,
    AwaitPath,
    AwaitMode,
    AwaitDigest,
    AwaitSize,
    Ready,
}

impl ParseState {
    pub fn width(self) -> usize {
        match self {
            ParseState::AwaitKind => KIND_WIDTH,
            ParseState::AwaitPath => PATH_WIDTH,
            ParseState::AwaitMode => MODE_WIDTH,
            ParseState::AwaitDigest => DIGEST_WIDTH,
            ParseState::AwaitSize => SIZE_WIDTH,
            ParseState::Ready => 0,
        }
    }

    /// Where this field starts inside the encoded record.
    pub fn offset(self) -> usize {
        match self {
            ParseState::AwaitKind => 0,
            ParseState::AwaitPath => KIND_WIDTH,
            ParseState::AwaitMode => KIND_WIDTH + PATH_WIDTH,
            ParseState::AwaitDigest => KIND_WIDTH + PATH_WIDTH + MODE_WIDTH,
            ParseState::AwaitSize => KIND_WIDTH + PATH_WIDTH + MODE_WIDTH + DIGEST_WIDTH,
            ParseState::Ready => REQUEST_LEN,
        }
    }

    pub fn field_name(self) -> &'static str {
        match self {
            ParseState::AwaitKind => "kind",
            ParseState::AwaitPath => "path",
            ParseState::AwaitMode => "mode",
            ParseState::AwaitDigest => "digest",
            ParseState::AwaitSize => "size",
            ParseState::Ready => "none",
        }
    }

    fn next(self) -> ParseState {
        match self {
            ParseState::AwaitKind => ParseState::AwaitPath,
            ParseState::AwaitPath => ParseState::AwaitMode,
            ParseState::AwaitMode => ParseState::AwaitDigest,
            ParseState::AwaitDigest => ParseState::AwaitSize,
            ParseState::AwaitSize | ParseState::Ready => ParseState::Ready,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// The current field still has bytes outstanding.
    Pending,
    /// The field finished; the state moved on to the next one.
    FieldDone(ParseState),
    /// The last field finished.
    RequestDone,
    /// Orderly close between requests.
    PeerClosed,
}

/// Advance `state`, which already holds `filled` bytes of its field, by a read
/// of `bytes_read` bytes. Returns the new state, how much of the new state's
/// field is filled, and what the caller should do.
pub fn transition(
    state: ParseState,
    filled: usize,
    bytes_read: usize,
) -> Result<(ParseState, usize, Action), ProtocolError> {
    if state == ParseState::Ready {
        return Err(ProtocolError::Unsolicited);
    }
    if bytes_read == 0 {
        return if state == ParseState::AwaitKind && filled == 0 {
            Ok((state, 0, Action::PeerClosed))
        } else {
            Err(ProtocolError::TruncatedRequest(state.field_name()))
        };
    }

    let width = state.width();
    let total = filled + bytes_read;
    if total > width {
        return Err(ProtocolError::ShortField {
            field: state.field_name(),
            expected: width,
            got: total,
        });
    }
    if total < width {
        return Ok((state, total, Action::Pending));
    }

    match state.next() {
        ParseState::Ready => Ok((ParseState::Ready, 0, Action::RequestDone)),
        next => Ok((next, 0, Action::FieldDone(state))),
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Progress {
    Pending,
    Complete(MetadataRequest),
    PeerClosed,
}

/// Per-connection parse state plus the bytes of the request assembled so far.
#[derive(Debug)]
pub struct RequestParser {
    state: ParseState,
    filled: usize,
    record: [u8; REQUEST_LEN],
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestParser {
    pub fn new() -> Self {
        RequestParser {
            state: ParseState::AwaitKind,
            filled: 0,
            record: [0u8; REQUEST_LEN],
        }
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    /// The unread tail of the current field. Reads never cross a field boundary.
    pub fn unfilled_mut(&mut self) -> &mut [u8] {
        let start = self.state.offset() + self.filled;
        let end = self.state.offset() + self.state.width();
        &mut self.record[start..end]
    }

    /// Account for `n` bytes just read into [`Self::unfilled_mut`].
    pub fn advance(&mut self, n: usize) -> Result<Progress, ProtocolError> {
        let (state, filled, action) = transition(self.state, self.filled, n)?;
        self.state = state;
        self.filled = filled;

        match action {
            Action::Pending => Ok(Progress::Pending),
            Action::PeerClosed => Ok(Progress::PeerClosed),
            Action::FieldDone(ParseState::AwaitKind) => {
                // fail fast on garbage rather than waiting for 300 more bytes
                decode_kind(&self.record[..KIND_WIDTH])?;
                Ok(Progress::Pending)
            }
            Action::FieldDone(_) => Ok(Progress::Pending),
            Action::RequestDone => Ok(Progress::Complete(MetadataRequest::decode(&self.record)?)),
        }
    }

    /// Start over for the next request on the same connection.
    pub fn reset(&mut self) {
        self.state = ParseState::AwaitKind;
        self.filled = 0;
        self.record = [0u8; REQUEST_LEN];
    }
}
