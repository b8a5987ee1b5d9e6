// Readiness wait over several sockets, for the client's receive loop.
//
// `ReadySet` wraps a `polling::Poller`. Each watched socket gets a caller
// chosen key; `wait` blocks until at least one of them is readable or the
// timeout passes and returns the ready keys. Interest is one-shot: a socket
// reported ready is not reported again until the caller `rearm`s it, which
// is done after reading exactly one unit from it. Data still queued at that
// point makes the socket ready again on the next wait, so no channel can
// starve another.
//
// The sockets stay in blocking mode. A readable report guarantees the next
// receive call returns without waiting for the peer.

use std::io;
use std::time::Duration;

use polling::{Event, Poller, Source};

pub struct ReadySet {
    poller: Poller,
    events: Vec<Event>,
}

impl ReadySet {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poller: Poller::new()?,
            events: Vec::new(),
        })
    }

    /// Start watching `source` for readability under `key`.
    pub fn watch(&self, source: impl Source, key: usize) -> io::Result<()> {
        self.poller.add(source, Event::readable(key))
    }

    /// Re-enable a source after it was reported ready.
    pub fn rearm(&self, source: impl Source, key: usize) -> io::Result<()> {
        self.poller.modify(source, Event::readable(key))
    }

    /// Wait until at least one watched source is readable. Returns the ready
    /// keys in ascending order; empty if `timeout` expired or the wait was
    /// interrupted by a signal. `None` waits indefinitely.
    pub fn wait(&mut self, timeout: Option<Duration>) -> io::Result<Vec<usize>> {
        self.events.clear();
        match self.poller.wait(&mut self.events, timeout) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(Vec::new()),
            Err(e) => return Err(e),
        }
        let mut ready: Vec<usize> = self
            .events
            .iter()
            .filter(|event| event.readable)
            .map(|event| event.key)
            .collect();
        ready.sort_unstable();
        ready.dedup();
        Ok(ready)
    }
}
