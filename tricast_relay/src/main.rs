// CLI entry point for the tricast relay server.
//
// Binds the TCP listener and the UDP socket on the same port and serves
// until the process is killed. See `server.rs` for the threading model and
// `registry.rs` for the shared participant table.
//
// Usage:
//   relay [OPTIONS]
//     --host <HOST>   Interface to bind (default: 127.0.0.1)
//     --port <PORT>   TCP and UDP port (default: 8000)
//
// Logging goes through `tracing`; set RUST_LOG (e.g. RUST_LOG=debug) to see
// every relayed message.

use clap::Parser;
use tracing::error;
use tricast_relay::server::{ServerConfig, start_server};

#[derive(Debug, Parser)]
#[command(name = "relay", about = "Relay text between tricast chat clients")]
struct Args {
    /// Interface to bind both sockets on.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
    /// Port shared by the TCP listener and the UDP socket.
    #[arg(long, default_value_t = 8000)]
    port: u16,
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        ServerConfig {
            host: args.host,
            port: args.port,
        }
    }
}

fn main() {
    tricast_relay::init_logging();
    let config = ServerConfig::from(Args::parse());

    let (handle, _addr) = match start_server(config) {
        Ok(result) => result,
        Err(e) => {
            error!("failed to start relay: {e}");
            std::process::exit(1);
        }
    };

    // The process exits on SIGINT/SIGTERM by default; connection threads are
    // torn down with it.
    handle.join();
}
