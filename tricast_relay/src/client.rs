// Client for the tricast relay.
//
// A client holds three sockets:
// - the reliable TCP connection to the server (framed text);
// - a unicast UDP socket bound to the same local address and port as the
//   TCP connection, so the server can attribute our datagrams to our
//   session by source address and knows where to relay others' datagrams;
// - an optional group UDP socket joined to a multicast group. Group traffic
//   goes straight between clients.
//
// Architecture:
// - `connect()` performs TCP connect, sends the display name frame and reads
//   the 8-byte id reply on the calling thread, then opens the UDP sockets
//   and spawns one background receive thread.
// - The receive thread waits on all three sockets at once (`ReadySet`),
//   reads one message from each ready socket per wake-up, and pushes `Incoming`
//   values into an `mpsc` channel. A closed reliable connection pushes
//   `Incoming::Disconnected` and ends the thread. Datagrams that are not
//   UTF-8 are dropped.
// - Sends run on the caller's thread(s) and take `&self`. The TCP write half
//   sits behind a mutex so frames never interleave; UDP sockets are shared
//   with the receive thread, which is safe for concurrent send and receive.
// - `poll()` drains the inbox without blocking; `recv`/`recv_timeout` block.

use std::io;
use std::net::{Ipv4Addr, Shutdown, SocketAddr, SocketAddrV4, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info, warn};
use tricast_protocol::{
    MAX_DATAGRAM_SIZE, ParticipantId, decode_datagram, group_line, read_frame, read_id_reply,
    write_frame,
};

use crate::error::RelayError;
use crate::lock;
use crate::readiness::ReadySet;

/// How often the receive thread wakes up to check for `close()`.
const RECEIVE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Multicast group shared by all clients.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupConfig {
    pub address: Ipv4Addr,
    pub port: u16,
    /// Local interface to join the group on. `UNSPECIFIED` lets the OS
    /// choose.
    pub interface: Ipv4Addr,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            address: Ipv4Addr::new(224, 0, 0, 1),
            port: 8001,
            interface: Ipv4Addr::UNSPECIFIED,
        }
    }
}

impl GroupConfig {
    pub fn socket_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.address, self.port)
    }
}

/// Configuration for connecting a client.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub server_host: String,
    pub server_port: u16,
    pub display_name: String,
    /// `None` disables the group channel entirely.
    pub group: Option<GroupConfig>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_host: "127.0.0.1".into(),
            server_port: 8000,
            display_name: String::new(),
            group: Some(GroupConfig::default()),
        }
    }
}

/// Something that arrived on one of the three channels.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Incoming {
    Reliable(String),
    Unicast(String),
    Group(String),
    /// The server closed the reliable connection or sent a malformed frame.
    /// Nothing else arrives after this.
    Disconnected,
}

/// A connected relay participant.
pub struct RelayClient {
    id: ParticipantId,
    display_name: String,
    server_addr: SocketAddr,
    writer: Mutex<TcpStream>,
    unicast: Arc<UdpSocket>,
    group: Option<(Arc<UdpSocket>, SocketAddrV4)>,
    inbox: Mutex<Receiver<Incoming>>,
    keep_running: Arc<AtomicBool>,
    receive_thread: Option<JoinHandle<()>>,
}

impl RelayClient {
    /// Connect to the server, perform the handshake, open the datagram
    /// sockets and start the receive thread.
    pub fn connect(config: ClientConfig) -> Result<Self, RelayError> {
        let server = format!("{}:{}", config.server_host, config.server_port);
        let mut stream = TcpStream::connect(&server).map_err(|source| RelayError::Connect {
            addr: server.clone(),
            source,
        })?;
        let server_addr = stream.peer_addr()?;

        write_frame(&mut stream, &config.display_name)?;
        let id = read_id_reply(&mut stream)?;

        let unicast = Arc::new(UdpSocket::bind(stream.local_addr()?)?);
        let group = match &config.group {
            Some(group) => Some((Arc::new(open_group_socket(group)?), group.socket_addr())),
            None => None,
        };

        let (tx, rx) = mpsc::channel();
        let keep_running = Arc::new(AtomicBool::new(true));
        let receiver = Receivers {
            reliable: stream.try_clone()?,
            unicast: unicast.clone(),
            group: group.as_ref().map(|(socket, _)| socket.clone()),
            tx,
            keep_running: keep_running.clone(),
        };
        let receive_thread = thread::Builder::new()
            .name(format!("tricast-recv-{id}"))
            .spawn(move || receiver.run())?;

        info!(%id, name = %config.display_name, %server_addr, "connected to relay");
        Ok(Self {
            id,
            display_name: config.display_name,
            server_addr,
            writer: Mutex::new(stream),
            unicast,
            group,
            inbox: Mutex::new(rx),
            keep_running,
            receive_thread: Some(receive_thread),
        })
    }

    pub fn id(&self) -> ParticipantId {
        self.id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Local address of the unicast socket (same as the TCP local address).
    pub fn unicast_addr(&self) -> io::Result<SocketAddr> {
        self.unicast.local_addr()
    }

    /// Send `text` over the reliable connection; the server relays it to
    /// every other participant.
    pub fn send_reliable(&self, text: &str) -> Result<(), RelayError> {
        let mut writer = lock(&self.writer);
        write_frame(&mut *writer, text)?;
        Ok(())
    }

    /// Send `text` as one datagram to the server, which relays it to every
    /// other participant's unicast socket.
    pub fn send_unicast(&self, text: &str) -> Result<(), RelayError> {
        self.unicast.send_to(text.as_bytes(), self.server_addr)?;
        Ok(())
    }

    /// Multicast `text`, labelled with our name and id, to the group.
    pub fn send_group(&self, text: &str) -> Result<(), RelayError> {
        let (socket, group) = self.group.as_ref().ok_or(RelayError::GroupDisabled)?;
        let line = group_line(&self.display_name, self.id, text);
        socket.send_to(line.as_bytes(), group)?;
        Ok(())
    }

    /// Drain everything received so far (non-blocking).
    pub fn poll(&self) -> Vec<Incoming> {
        lock(&self.inbox).try_iter().collect()
    }

    /// Block until the next message. `None` once the receive thread has
    /// exited and the inbox is empty.
    pub fn recv(&self) -> Option<Incoming> {
        lock(&self.inbox).recv().ok()
    }

    /// Block for at most `timeout` waiting for the next message.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Incoming> {
        lock(&self.inbox).recv_timeout(timeout).ok()
    }

    /// Stop the receive thread and close the reliable connection. The server
    /// sees end-of-stream and drops our session.
    pub fn close(&self) {
        self.keep_running.store(false, Ordering::SeqCst);
        let _ = lock(&self.writer).shutdown(Shutdown::Both);
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        self.close();
        if let Some(handle) = self.receive_thread.take() {
            let _ = handle.join();
        }
    }
}

/// Create the group socket: bound to the group port on all interfaces with
/// address reuse, so several clients on one host can listen at once, and
/// joined to the group.
fn open_group_socket(group: &GroupConfig) -> Result<UdpSocket, RelayError> {
    let join_error = |source| RelayError::JoinGroup {
        group: group.socket_addr(),
        source,
    };
    let socket = bind_reusable(group.port).map_err(join_error)?;
    socket
        .join_multicast_v4(&group.address, &group.interface)
        .map_err(join_error)?;
    if !group.interface.is_unspecified() {
        socket
            .set_multicast_if_v4(&group.interface)
            .map_err(join_error)?;
    }
    socket.set_multicast_loop_v4(true)?;
    Ok(socket.into())
}

/// A UDP socket on `0.0.0.0:port` that other sockets may bind as well.
fn bind_reusable(port: u16) -> io::Result<Socket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket.set_reuse_port(true)?;
    socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into())?;
    Ok(socket)
}

/// Everything the receive thread owns.
struct Receivers {
    reliable: TcpStream,
    unicast: Arc<UdpSocket>,
    group: Option<Arc<UdpSocket>>,
    tx: mpsc::Sender<Incoming>,
    keep_running: Arc<AtomicBool>,
}

/// Outcome of servicing one ready socket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Step {
    Continue,
    Stop,
}

const RELIABLE_KEY: usize = 0;
const UNICAST_KEY: usize = 1;
const GROUP_KEY: usize = 2;

impl Receivers {
    /// Multiplexed receive loop: one wait over all sockets per cycle, then
    /// one message from each socket that was ready.
    fn run(mut self) {
        let mut ready_set = match self.watch_all() {
            Ok(ready_set) => ready_set,
            Err(e) => {
                warn!("cannot watch sockets: {e}");
                self.disconnected();
                return;
            }
        };
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        while self.keep_running.load(Ordering::SeqCst) {
            let ready = match ready_set.wait(Some(RECEIVE_POLL_INTERVAL)) {
                Ok(ready) => ready,
                Err(e) => {
                    warn!("receive wait failed: {e}");
                    self.disconnected();
                    return;
                }
            };
            for key in ready {
                let step = match key {
                    RELIABLE_KEY => self.read_reliable(),
                    UNICAST_KEY => {
                        read_datagram(&self.unicast, &mut buf, &self.tx, Incoming::Unicast)
                    }
                    GROUP_KEY => self.group.as_ref().map_or(Step::Continue, |group| {
                        read_datagram(group, &mut buf, &self.tx, Incoming::Group)
                    }),
                    _ => Step::Continue,
                };
                if step == Step::Stop {
                    return;
                }
                if let Err(e) = self.rearm(&ready_set, key) {
                    warn!("cannot rearm socket: {e}");
                    self.disconnected();
                    return;
                }
            }
        }
    }

    fn watch_all(&self) -> io::Result<ReadySet> {
        let ready_set = ReadySet::new()?;
        ready_set.watch(&self.reliable, RELIABLE_KEY)?;
        ready_set.watch(&*self.unicast, UNICAST_KEY)?;
        if let Some(group) = &self.group {
            ready_set.watch(&**group, GROUP_KEY)?;
        }
        Ok(ready_set)
    }

    fn rearm(&self, ready_set: &ReadySet, key: usize) -> io::Result<()> {
        match key {
            RELIABLE_KEY => ready_set.rearm(&self.reliable, key),
            UNICAST_KEY => ready_set.rearm(&*self.unicast, key),
            GROUP_KEY => match &self.group {
                Some(group) => ready_set.rearm(&**group, key),
                None => Ok(()),
            },
            _ => Ok(()),
        }
    }

    fn read_reliable(&mut self) -> Step {
        match read_frame(&mut self.reliable) {
            Ok(Some(text)) => forward(&self.tx, Incoming::Reliable(text)),
            Ok(None) => {
                self.disconnected();
                Step::Stop
            }
            Err(e) => {
                warn!("malformed frame from server: {e}");
                self.disconnected();
                Step::Stop
            }
        }
    }

    /// Report a lost connection, unless we are the ones closing it.
    fn disconnected(&self) {
        if self.keep_running.load(Ordering::SeqCst) {
            let _ = self.tx.send(Incoming::Disconnected);
        }
    }
}

/// Read one datagram from `socket` and forward it wrapped by `wrap`.
/// Non-UTF-8 payloads and receive errors are dropped.
fn read_datagram(
    socket: &UdpSocket,
    buf: &mut [u8],
    tx: &mpsc::Sender<Incoming>,
    wrap: fn(String) -> Incoming,
) -> Step {
    match socket.recv_from(buf) {
        Ok((len, source)) => match decode_datagram(&buf[..len]) {
            Some(text) => forward(tx, wrap(text.to_owned())),
            None => {
                debug!(%source, "dropping non-UTF-8 datagram");
                Step::Continue
            }
        },
        Err(e) => {
            debug!("datagram receive error: {e}");
            Step::Continue
        }
    }
}

fn forward(tx: &mpsc::Sender<Incoming>, incoming: Incoming) -> Step {
    match tx.send(incoming) {
        Ok(()) => Step::Continue,
        // The client was dropped.
        Err(_) => Step::Stop,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::TcpListener;

    use tricast_protocol::encode_id_reply;

    /// Accept one connection, answer its handshake with `id`, and hand the
    /// server side back to the test.
    fn fake_server(id: u32) -> (SocketAddr, JoinHandle<(TcpStream, String)>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let name = read_frame(&mut stream).unwrap().unwrap();
            stream
                .write_all(&encode_id_reply(ParticipantId(id)).unwrap())
                .unwrap();
            (stream, name)
        });
        (addr, handle)
    }

    fn config_for(addr: SocketAddr, name: &str) -> ClientConfig {
        ClientConfig {
            server_host: addr.ip().to_string(),
            server_port: addr.port(),
            display_name: name.into(),
            group: None,
        }
    }

    #[test]
    fn handshake_sends_name_and_reads_id() {
        let (addr, server) = fake_server(7);
        let client = RelayClient::connect(config_for(addr, "alice")).unwrap();
        let (_stream, name) = server.join().unwrap();

        assert_eq!(name, "alice");
        assert_eq!(client.id(), ParticipantId(7));
        assert_eq!(client.display_name(), "alice");
    }

    #[test]
    fn unicast_socket_shares_tcp_port() {
        let (addr, server) = fake_server(1);
        let client = RelayClient::connect(config_for(addr, "a")).unwrap();
        let (stream, _) = server.join().unwrap();

        // The server's view of our TCP address is where it will relay
        // datagrams to.
        assert_eq!(client.unicast_addr().unwrap(), stream.peer_addr().unwrap());
    }

    #[test]
    fn reliable_frames_arrive_in_inbox() {
        let (addr, server) = fake_server(1);
        let client = RelayClient::connect(config_for(addr, "a")).unwrap();
        let (mut stream, _) = server.join().unwrap();

        write_frame(&mut stream, "bob#2> one").unwrap();
        write_frame(&mut stream, "bob#2> two").unwrap();

        let timeout = Duration::from_secs(5);
        assert_eq!(
            client.recv_timeout(timeout),
            Some(Incoming::Reliable("bob#2> one".into()))
        );
        assert_eq!(
            client.recv_timeout(timeout),
            Some(Incoming::Reliable("bob#2> two".into()))
        );
    }

    #[test]
    fn send_reliable_writes_a_frame() {
        let (addr, server) = fake_server(1);
        let client = RelayClient::connect(config_for(addr, "a")).unwrap();
        let (mut stream, _) = server.join().unwrap();

        client.send_reliable("hello").unwrap();
        assert_eq!(read_frame(&mut stream).unwrap().as_deref(), Some("hello"));
    }

    #[test]
    fn unicast_datagrams_go_to_server_port_and_back() {
        let (addr, server) = fake_server(1);
        let server_udp = UdpSocket::bind(addr).unwrap();
        server_udp
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let client = RelayClient::connect(config_for(addr, "a")).unwrap();
        let (stream, _) = server.join().unwrap();

        client.send_unicast("over udp").unwrap();
        let mut buf = [0u8; 64];
        let (len, source) = server_udp.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"over udp");
        assert_eq!(source, stream.peer_addr().unwrap());

        server_udp.send_to(b"bob#2> back", source).unwrap();
        assert_eq!(
            client.recv_timeout(Duration::from_secs(5)),
            Some(Incoming::Unicast("bob#2> back".into()))
        );
    }

    #[test]
    fn invalid_datagrams_are_dropped() {
        let (addr, server) = fake_server(1);
        let client = RelayClient::connect(config_for(addr, "a")).unwrap();
        let (_stream, _) = server.join().unwrap();

        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
        let target = client.unicast_addr().unwrap();
        peer.send_to(&[0xFF, 0xFE], target).unwrap();
        peer.send_to(b"valid", target).unwrap();

        assert_eq!(
            client.recv_timeout(Duration::from_secs(5)),
            Some(Incoming::Unicast("valid".into()))
        );
    }

    #[test]
    fn server_close_reports_disconnect() {
        let (addr, server) = fake_server(1);
        let client = RelayClient::connect(config_for(addr, "a")).unwrap();
        let (stream, _) = server.join().unwrap();
        drop(stream);

        assert_eq!(
            client.recv_timeout(Duration::from_secs(5)),
            Some(Incoming::Disconnected)
        );
        assert_eq!(client.recv_timeout(Duration::from_millis(100)), None);
    }

    #[test]
    fn oversized_frame_from_server_reports_disconnect() {
        let (addr, server) = fake_server(1);
        let client = RelayClient::connect(config_for(addr, "a")).unwrap();
        let (mut stream, _) = server.join().unwrap();
        stream
            .write_all(&(tricast_protocol::MAX_FRAME_SIZE + 1).to_be_bytes())
            .unwrap();

        assert_eq!(
            client.recv_timeout(Duration::from_secs(5)),
            Some(Incoming::Disconnected)
        );
    }

    #[test]
    fn close_is_quiet() {
        let (addr, server) = fake_server(1);
        let client = RelayClient::connect(config_for(addr, "a")).unwrap();
        let (mut stream, _) = server.join().unwrap();

        client.close();
        assert_eq!(read_frame(&mut stream).unwrap(), None);
        assert_eq!(client.recv_timeout(Duration::from_millis(300)), None);
    }

    #[test]
    fn group_send_without_group_fails() {
        let (addr, server) = fake_server(1);
        let client = RelayClient::connect(config_for(addr, "a")).unwrap();
        let _ = server.join().unwrap();
        assert!(matches!(
            client.send_group("x"),
            Err(RelayError::GroupDisabled)
        ));
    }

    #[test]
    fn group_sockets_share_a_port_and_label_without_space() {
        let group = GroupConfig {
            address: Ipv4Addr::new(239, 255, 42, 98),
            port: 48_311,
            interface: Ipv4Addr::LOCALHOST,
        };
        let (addr_a, server_a) = fake_server(1);
        let ann = RelayClient::connect(ClientConfig {
            group: Some(group.clone()),
            ..config_for(addr_a, "ann")
        })
        .unwrap();
        let (addr_b, server_b) = fake_server(2);
        let bob = RelayClient::connect(ClientConfig {
            group: Some(group),
            ..config_for(addr_b, "bob")
        })
        .unwrap();
        let _sa = server_a.join().unwrap();
        let _sb = server_b.join().unwrap();

        bob.send_group("hi all").unwrap();
        assert_eq!(
            ann.recv_timeout(Duration::from_secs(5)),
            Some(Incoming::Group("bob#2>hi all".into()))
        );
    }

    #[test]
    fn handshake_fails_on_bad_id_reply() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let _ = read_frame(&mut stream).unwrap();
            stream.write_all(b"notanid!").unwrap();
        });
        let result = RelayClient::connect(config_for(addr, "a"));
        server.join().unwrap();
        assert!(matches!(result, Err(RelayError::Handshake(_))));
    }

    #[test]
    fn connect_refused_is_reported() {
        // Bind then drop to get a port with nobody listening.
        let addr = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap();
        let result = RelayClient::connect(config_for(addr, "a"));
        assert!(matches!(result, Err(RelayError::Connect { .. })));
    }
}
