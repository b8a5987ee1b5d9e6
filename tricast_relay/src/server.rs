// TCP + UDP relay server.
//
// Architecture: thread-per-connection around a shared `Registry`.
//
// - **Accept thread** (`TcpListener::accept()` loop): accepts reliable
//   connections and spawns one connection thread for each.
// - **Connection threads**: drive one participant through its lifecycle.
//   ACCEPTED: wait for the first frame, which is the display name.
//   AUTHENTICATED: register, and write the 8-byte id reply before the
//   session is visible to anyone else. ACTIVE: label every later frame and
//   fan it out to all other sessions. CLOSED: on end-of-stream or a bad
//   frame, remove the session and drop the socket.
// - **Unicast thread**: receives datagrams on the UDP socket (same port as
//   the listener), attributes each to a session by source address, and
//   re-sends the labelled text to every other session's address.
//
// Group traffic never reaches the server.
//
// There is no handshake timeout: a peer that connects and never sends its
// name keeps its connection thread parked in `read_frame` indefinitely. It
// is never registered, so it holds no registry lock and nobody else is
// affected.
//
// Oversized relays: a frame or datagram near the size ceiling can outgrow
// it once labelled. Such a line is dropped once, before the fan-out, and
// no recipient is affected.
//
// Shutdown: `ServerHandle::stop` clears the stop flag the accept and unicast
// loops poll, then shuts the registry down. That closes every registered
// socket, which ends the connection threads' blocking reads, and turns away
// handshakes that complete afterwards.

use std::io::{ErrorKind, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info, warn};
use tricast_protocol::{
    MAX_DATAGRAM_SIZE, Sender, decode_datagram, encode_id_reply, read_frame, relay_line,
};

use crate::error::RelayError;
use crate::registry::{Exclude, Registry, RegistryError, Session};

/// How long the accept loop sleeps when no connection is pending.
const ACCEPT_INTERVAL: Duration = Duration::from_millis(50);

/// Read timeout on the UDP socket, so the unicast loop notices `stop`.
const UNICAST_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Configuration for starting a relay server.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Interface to bind both sockets on.
    pub host: String,
    /// Port for both the TCP listener and the UDP socket. 0 lets the OS pick
    /// a free TCP port; the UDP socket then binds the same number.
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8000,
        }
    }
}

/// Handle returned by `start_server` to control the running server.
pub struct ServerHandle {
    keep_running: Arc<AtomicBool>,
    registry: Arc<Registry>,
    threads: Vec<thread::JoinHandle<()>>,
}

impl ServerHandle {
    /// The live participant table.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Signal the server to stop, disconnect every participant, and wait for
    /// the accept and unicast threads to exit. Connections still in their
    /// handshake are refused when they get to registering.
    pub fn stop(self) {
        self.keep_running.store(false, Ordering::SeqCst);
        self.registry.shut_down();
        for handle in self.threads {
            let _ = handle.join();
        }
        info!("relay stopped");
    }

    /// Block until the accept and unicast threads exit.
    pub fn join(self) {
        for handle in self.threads {
            let _ = handle.join();
        }
    }
}

/// Bind the listener and the UDP socket and start serving on background
/// threads. Returns a handle for stopping the server and the bound address
/// (useful when port 0 is used to let the OS pick a free port).
///
/// A bind failure on either socket is returned before anything is spawned.
pub fn start_server(config: ServerConfig) -> Result<(ServerHandle, SocketAddr), RelayError> {
    let requested = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&requested).map_err(|source| RelayError::Bind {
        addr: requested.clone(),
        source,
    })?;
    let addr = listener.local_addr()?;
    let udp = UdpSocket::bind(addr).map_err(|source| RelayError::Bind {
        addr: addr.to_string(),
        source,
    })?;

    // Non-blocking accept and a UDP read timeout let both loops check
    // keep_running periodically.
    listener.set_nonblocking(true)?;
    udp.set_read_timeout(Some(UNICAST_POLL_INTERVAL))?;

    let keep_running = Arc::new(AtomicBool::new(true));
    let registry = Arc::new(Registry::new());

    let accept_thread = {
        let keep_running = keep_running.clone();
        let registry = registry.clone();
        thread::Builder::new()
            .name("relay-accept".into())
            .spawn(move || accept_loop(listener, registry, keep_running))?
    };
    let unicast_thread = {
        let keep_running = keep_running.clone();
        let registry = registry.clone();
        thread::Builder::new()
            .name("relay-unicast".into())
            .spawn(move || unicast_loop(udp, registry, keep_running))?
    };

    info!(%addr, "relay listening");
    Ok((
        ServerHandle {
            keep_running,
            registry,
            threads: vec![accept_thread, unicast_thread],
        },
        addr,
    ))
}

/// Accept reliable connections until `keep_running` is cleared.
fn accept_loop(listener: TcpListener, registry: Arc<Registry>, keep_running: Arc<AtomicBool>) {
    while keep_running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(e) = stream.set_nonblocking(false) {
                    warn!(%peer, "dropping connection: {e}");
                    continue;
                }
                debug!(%peer, "connection accepted");
                let registry = registry.clone();
                let spawned = thread::Builder::new()
                    .name(format!("relay-conn-{peer}"))
                    .spawn(move || handle_connection(stream, peer, registry));
                if let Err(e) = spawned {
                    warn!(%peer, "could not spawn connection thread: {e}");
                }
            }
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_INTERVAL);
            }
            Err(e) => {
                error!("accept failed, no longer accepting connections: {e}");
                break;
            }
        }
    }
}

/// Drive one reliable connection from handshake to teardown.
fn handle_connection(stream: TcpStream, peer: SocketAddr, registry: Arc<Registry>) {
    let mut reader = match stream.try_clone() {
        Ok(s) => s,
        Err(e) => {
            warn!(%peer, "dropping connection: {e}");
            return;
        }
    };

    // ACCEPTED: the first frame is the display name.
    let display_name = match read_frame(&mut reader) {
        Ok(Some(name)) => name,
        Ok(None) => {
            debug!(%peer, "closed before handshake");
            return;
        }
        Err(e) => {
            warn!(%peer, "bad handshake frame: {e}");
            return;
        }
    };

    // AUTHENTICATED: allocate an id and reply with it.
    let session = match registry.register_with(display_name, peer, stream, |id, stream| {
        stream.write_all(&encode_id_reply(id)?)?;
        Ok(())
    }) {
        Ok(session) => session,
        Err(RegistryError::ShutDown) => {
            debug!(%peer, "server stopping, handshake refused");
            return;
        }
        Err(e) => {
            warn!(%peer, "handshake failed: {e}");
            return;
        }
    };
    info!(
        id = %session.id,
        name = %session.display_name,
        %peer,
        "participant joined"
    );

    // ACTIVE
    relay_reliable(&mut reader, &session, &registry);

    // CLOSED
    registry.remove_session(&session);
    info!(id = %session.id, name = %session.display_name, "participant left");
}

/// Relay every frame read from `reader` to all other sessions until the
/// connection ends.
fn relay_reliable(reader: &mut TcpStream, session: &Arc<Session>, registry: &Registry) {
    let sender = Sender::Known {
        name: &session.display_name,
        id: session.id,
    };
    loop {
        match read_frame(reader) {
            Ok(Some(text)) => {
                let line = relay_line(sender, &text);
                match registry.broadcast_except(Exclude::Id(session.id), &line) {
                    Ok(delivered) => debug!(delivered, "TCP: {line}"),
                    Err(e) => warn!(id = %session.id, "dropping message: {e}"),
                }
            }
            Ok(None) => {
                debug!(id = %session.id, "end of stream");
                return;
            }
            Err(e) => {
                warn!(id = %session.id, "closing connection: {e}");
                return;
            }
        }
    }
}

/// Receive unicast datagrams and fan them out until `keep_running` is
/// cleared.
fn unicast_loop(socket: UdpSocket, registry: Arc<Registry>, keep_running: Arc<AtomicBool>) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    while keep_running.load(Ordering::SeqCst) {
        let (len, source) = match socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(ref e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                continue;
            }
            Err(e) => {
                // ICMP errors from an earlier send_to can surface here on
                // some platforms; they concern one recipient only.
                debug!("unicast receive error: {e}");
                continue;
            }
        };
        let Some(text) = decode_datagram(&buf[..len]) else {
            debug!(%source, "dropping non-UTF-8 datagram");
            continue;
        };

        let session = registry.find_by_address(source);
        let sender = match &session {
            Some(session) => Sender::Known {
                name: &session.display_name,
                id: session.id,
            },
            None => Sender::Unknown,
        };
        let line = relay_line(sender, text);
        if line.len() > MAX_DATAGRAM_SIZE {
            debug!(%source, len = line.len(), "dropping datagram too large to relay");
            continue;
        }
        let delivered = relay_datagram(&socket, &registry, source, &line);
        debug!(delivered, "UDP: {line}");
    }
}

/// Send `line` to the registered address of every session other than the
/// one at `source`. Returns how many datagrams went out.
fn relay_datagram(socket: &UdpSocket, registry: &Registry, source: SocketAddr, line: &str) -> usize {
    let mut sent = 0;
    registry.for_each_except(Exclude::Address(source), |session| {
        match socket.send_to(line.as_bytes(), session.address) {
            Ok(_) => sent += 1,
            Err(e) => warn!(id = %session.id, "unicast relay failed: {e}"),
        }
    });
    sent
}
