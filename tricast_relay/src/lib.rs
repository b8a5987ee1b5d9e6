// tricast_relay — text relay over three transports.
//
// Participants exchange UTF-8 text over a reliable TCP channel and a unicast
// UDP channel, both relayed by a central server, and over a multicast group
// that bypasses the server. The server only assigns ids and fans messages
// out; it keeps no history.
//
// Module overview:
// - `registry.rs`:  Shared table of live sessions (id and address indexes),
//                   id allocation, and reliable fan-out. The one structure
//                   touched by many server threads.
// - `server.rs`:    TCP listener, one thread per connection, and the unicast
//                   relay thread. Uses `std::net` with a thread-per-connection
//                   architecture around an `Arc<Registry>`.
// - `client.rs`:    `RelayClient`: handshake, three sockets, one background
//                   receive thread feeding an `mpsc` inbox.
// - `readiness.rs`: `ReadySet`, the one-shot readiness wait the client's
//                   receive thread runs on.
// - `command.rs`:   "/t", "/u", "/m" line commands for the chat binary.
// - `error.rs`:     `RelayError`.
//
// Dependencies: `tricast_protocol` (framing, handshake, labels), `tracing`
// for logging, `thiserror` for error enums, `polling` for the readiness wait,
// `socket2` for the shared multicast socket. The binaries add `clap` and
// `tracing-subscriber`.

pub mod client;
pub mod command;
pub mod error;
pub mod readiness;
pub mod registry;
pub mod server;

pub use client::{ClientConfig, GroupConfig, Incoming, RelayClient};
pub use error::RelayError;
pub use registry::{Exclude, Registry, RegistryError, Session};
pub use server::{ServerConfig, ServerHandle, start_server};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the data if a thread panicked while holding it.
/// Every critical section in this crate leaves its data consistent.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Install the `tracing` subscriber used by the binaries: `RUST_LOG` if set,
/// otherwise `info`.
pub fn init_logging() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
