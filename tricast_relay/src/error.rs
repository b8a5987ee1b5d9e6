// Error type for the relay server and client.
//
// Connection-level problems on the server (a peer vanishing, a malformed
// frame, a failed relay write) are handled by the thread that owns the
// connection and never surface here. `RelayError` covers what a caller of
// `start_server` or `RelayClient` can actually act on: startup failures and
// client-side I/O.

use std::io;
use std::net::SocketAddrV4;

use thiserror::Error;
use tricast_protocol::{FrameError, HandshakeError};

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("failed to bind {addr}: {source}")]
    Bind { addr: String, source: io::Error },
    #[error("failed to connect to {addr}: {source}")]
    Connect { addr: String, source: io::Error },
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("failed to join group {group}: {source}")]
    JoinGroup { group: SocketAddrV4, source: io::Error },
    #[error("group channel is disabled")]
    GroupDisabled,
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Io(#[from] io::Error),
}
