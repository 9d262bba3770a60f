//! Incremental directory-tree sync over plain TCP.
//!
//! The client walks a tree and asks the server, entry by entry, whether it is
//! already up to date. Entries that are not get their bodies sent over
//! separate, concurrent connections.

pub mod cli;
pub mod client;
pub mod compare;
pub mod connection;
pub mod digest;
pub mod error;
pub mod logging;
pub mod parser;
pub mod protocol;
pub mod server;
pub mod transfer;
pub mod util;

pub use client::{PushOptions, SyncOutcome, SyncSummary, push_tree};
pub use error::{ProtocolError, SyncError};
pub use server::{run_server, serve};
