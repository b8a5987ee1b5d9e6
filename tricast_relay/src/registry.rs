// Connection registry for the relay server.
//
// `Registry` is the table of live participants that every server thread
// shares: connection threads insert themselves on handshake and remove
// themselves on disconnect, while the same threads (and the unicast thread)
// walk it to fan messages out. It is the only structure in the server that
// is mutated from more than one thread.
//
// Locking:
// - One `Mutex` guards both indexes (id -> session, address -> id), so an
//   insert or remove is never half-visible.
// - Fan-out snapshots the matching `Arc<Session>`s under the lock and writes
//   with the lock released. A slow or dead peer therefore never blocks
//   registration or removal for anyone else.
// - Each `Session` has its own writer lock. Frames from different relaying
//   threads to the same recipient never interleave, and `remove` closes the
//   session under that lock, so once `remove` returns no further frame
//   reaches that participant even if a snapshot still holds it.
//
// Id allocation lives here too: `register` picks the smallest unused id
// under the same lock that inserts the session, so two handshakes racing
// each other cannot receive the same id.
//
// Fan-out encodes the frame once before touching any recipient. A line that
// cannot be framed is the sender's problem and reaches nobody; only a failed
// socket write evicts a recipient.

use std::collections::{BTreeMap, HashMap};
use std::io::{self, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tracing::{debug, warn};
use tricast_protocol::handshake::MAX_PARTICIPANT_ID;
use tricast_protocol::{FrameError, HandshakeError, ParticipantId, encode_frame};

use crate::lock;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("participant id {0} is already registered")]
    DuplicateId(ParticipantId),
    #[error("address {0} is already registered")]
    DuplicateAddress(SocketAddr),
    #[error("no free participant id")]
    Exhausted,
    #[error("greeting participant failed: {0}")]
    Greeting(#[from] HandshakeError),
    #[error("registry is shut down")]
    ShutDown,
    #[error("session {0} is closed")]
    Closed(ParticipantId),
    #[error("cannot frame message: {0}")]
    Frame(#[from] FrameError),
    #[error("writing to session {id}: {source}")]
    Write { id: ParticipantId, source: io::Error },
}

/// Server-side record of one connected participant.
pub struct Session {
    pub id: ParticipantId,
    pub address: SocketAddr,
    pub display_name: String,
    /// Write side of the reliable connection; `None` once closed.
    connection: Mutex<Option<TcpStream>>,
}

impl Session {
    pub fn new(
        id: ParticipantId,
        address: SocketAddr,
        display_name: String,
        stream: TcpStream,
    ) -> Self {
        Self {
            id,
            address,
            display_name,
            connection: Mutex::new(Some(stream)),
        }
    }

    /// Frame `text` and write it to this participant's reliable connection.
    pub fn send(&self, text: &str) -> Result<(), RegistryError> {
        let frame = encode_frame(text)?;
        self.send_frame(&frame)
    }

    /// Write an already encoded frame. Fails with `Write` only when the
    /// socket itself does.
    pub fn send_frame(&self, frame: &[u8]) -> Result<(), RegistryError> {
        let mut connection = lock(&self.connection);
        let stream = connection.as_mut().ok_or(RegistryError::Closed(self.id))?;
        stream
            .write_all(frame)
            .and_then(|()| stream.flush())
            .map_err(|source| RegistryError::Write {
                id: self.id,
                source,
            })
    }

    /// Shut the reliable connection down. Later `send`s fail with `Closed`,
    /// and the thread reading from this connection sees end-of-stream.
    pub fn close(&self) {
        if let Some(stream) = lock(&self.connection).take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.connection).is_none()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("display_name", &self.display_name)
            .finish_non_exhaustive()
    }
}

/// Which session a fan-out skips.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Exclude {
    Id(ParticipantId),
    Address(SocketAddr),
}

impl Exclude {
    fn matches(&self, session: &Session) -> bool {
        match self {
            Exclude::Id(id) => session.id == *id,
            Exclude::Address(addr) => session.address == *addr,
        }
    }
}

#[derive(Default)]
struct Inner {
    by_id: BTreeMap<ParticipantId, Arc<Session>>,
    by_address: HashMap<SocketAddr, ParticipantId>,
    /// Set by `shut_down`; no session is admitted afterwards.
    shut_down: bool,
}

impl Inner {
    /// Smallest positive id not held by a live session.
    fn next_free_id(&self) -> Result<ParticipantId, RegistryError> {
        let mut candidate = ParticipantId::FIRST.0;
        for id in self.by_id.keys() {
            if id.0 == candidate {
                candidate += 1;
            } else if id.0 > candidate {
                break;
            }
        }
        if candidate > MAX_PARTICIPANT_ID {
            return Err(RegistryError::Exhausted);
        }
        Ok(ParticipantId(candidate))
    }

    fn insert(&mut self, session: Session) -> Result<Arc<Session>, RegistryError> {
        if self.shut_down {
            return Err(RegistryError::ShutDown);
        }
        if self.by_id.contains_key(&session.id) {
            return Err(RegistryError::DuplicateId(session.id));
        }
        if self.by_address.contains_key(&session.address) {
            return Err(RegistryError::DuplicateAddress(session.address));
        }
        let session = Arc::new(session);
        self.by_address.insert(session.address, session.id);
        self.by_id.insert(session.id, Arc::clone(&session));
        Ok(session)
    }

    fn remove(&mut self, id: ParticipantId) -> Option<Arc<Session>> {
        let session = self.by_id.remove(&id)?;
        if self.by_address.get(&session.address) == Some(&id) {
            self.by_address.remove(&session.address);
        }
        Some(session)
    }
}

/// Thread-safe table of live sessions, keyed by id and by address.
#[derive(Default)]
pub struct Registry {
    inner: Mutex<Inner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the smallest free id and insert a session for it.
    pub fn register(
        &self,
        display_name: String,
        address: SocketAddr,
        stream: TcpStream,
    ) -> Result<Arc<Session>, RegistryError> {
        self.register_with(display_name, address, stream, |_, _| Ok(()))
    }

    /// Like `register`, but runs `greet` with the allocated id and the
    /// connection before the session becomes visible to fan-out. The server
    /// writes the id reply here, so no relayed frame can overtake it. If
    /// `greet` fails nothing is inserted.
    pub fn register_with<G>(
        &self,
        display_name: String,
        address: SocketAddr,
        mut stream: TcpStream,
        greet: G,
    ) -> Result<Arc<Session>, RegistryError>
    where
        G: FnOnce(ParticipantId, &mut TcpStream) -> Result<(), HandshakeError>,
    {
        let mut inner = self.lock();
        if inner.shut_down {
            return Err(RegistryError::ShutDown);
        }
        if inner.by_address.contains_key(&address) {
            return Err(RegistryError::DuplicateAddress(address));
        }
        let id = inner.next_free_id()?;
        greet(id, &mut stream)?;
        inner.insert(Session::new(id, address, display_name, stream))
    }

    /// Insert a session built by the caller. Fails if its id or address is
    /// already taken.
    pub fn insert(&self, session: Session) -> Result<Arc<Session>, RegistryError> {
        self.lock().insert(session)
    }

    /// Remove a session and close its connection. Removing an id that is not
    /// registered is a no-op.
    pub fn remove(&self, id: ParticipantId) -> Option<Arc<Session>> {
        let session = self.lock().remove(id)?;
        session.close();
        Some(session)
    }

    /// Remove `session` only if it is still the entry registered under its
    /// id. A connection thread tearing itself down uses this so it cannot
    /// evict a newer participant that has since been given the same id.
    /// The session is closed either way.
    pub fn remove_session(&self, session: &Arc<Session>) -> bool {
        let removed = {
            let mut inner = self.lock();
            match inner.by_id.get(&session.id) {
                Some(current) if Arc::ptr_eq(current, session) => inner.remove(session.id),
                _ => None,
            }
        };
        session.close();
        removed.is_some()
    }

    pub fn find_by_id(&self, id: ParticipantId) -> Option<Arc<Session>> {
        self.lock().by_id.get(&id).cloned()
    }

    pub fn find_by_address(&self, address: SocketAddr) -> Option<Arc<Session>> {
        let inner = self.lock();
        let id = inner.by_address.get(&address)?;
        inner.by_id.get(id).cloned()
    }

    /// Snapshot of every live session except the excluded one, in id order.
    pub fn others(&self, exclude: Exclude) -> Vec<Arc<Session>> {
        self.lock()
            .by_id
            .values()
            .filter(|session| !exclude.matches(session))
            .cloned()
            .collect()
    }

    /// Call `f` on every live session except the excluded one. The registry
    /// lock is not held while `f` runs, so `f` may itself insert or remove.
    pub fn for_each_except<F>(&self, exclude: Exclude, mut f: F)
    where
        F: FnMut(&Arc<Session>),
    {
        for session in self.others(exclude) {
            f(&session);
        }
    }

    /// Send `text` over the reliable connection of every session except the
    /// excluded one. A recipient whose write fails is removed; the remaining
    /// recipients still get the message. Returns how many were reached.
    ///
    /// Text that cannot be framed fails with `Frame` before any recipient
    /// is touched.
    pub fn broadcast_except(&self, exclude: Exclude, text: &str) -> Result<usize, RegistryError> {
        let frame = encode_frame(text)?;
        let mut delivered = 0;
        self.for_each_except(exclude, |session| match session.send_frame(&frame) {
            Ok(()) => delivered += 1,
            Err(RegistryError::Closed(id)) => {
                debug!(%id, "skipping session closed during fan-out");
            }
            Err(e) => {
                warn!(id = %session.id, "dropping participant after failed relay: {e}");
                self.remove_session(session);
            }
        });
        Ok(delivered)
    }

    /// Remove and close every session.
    pub fn clear(&self) {
        let sessions = {
            let mut inner = self.lock();
            inner.by_address.clear();
            std::mem::take(&mut inner.by_id)
        };
        for session in sessions.values() {
            session.close();
        }
    }

    /// Clear the registry and refuse every later `register` or `insert`.
    /// A handshake still in flight when the server stops is turned away
    /// instead of joining an empty room.
    pub fn shut_down(&self) {
        self.lock().shut_down = true;
        self.clear();
    }

    pub fn len(&self) -> usize {
        self.lock().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().by_id.is_empty()
    }

    /// Ids of all live sessions, ascending.
    pub fn ids(&self) -> Vec<ParticipantId> {
        self.lock().by_id.keys().copied().collect()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        lock(&self.inner)
    }
}
