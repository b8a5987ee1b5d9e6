// Test-only participant for end-to-end relay tests.
//
// Wraps the real `RelayClient` (from `tricast_relay::client`) with a
// synchronous, test-friendly API: blocking waits for the next message on a
// given channel, and a quiet-period check that nothing else arrived. All
// networking goes through the same code paths as the chat binary.
//
// See also: `tests/full_pipeline.rs` for the scenarios.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tricast_protocol::ParticipantId;
use tricast_relay::client::{ClientConfig, GroupConfig, Incoming, RelayClient};

/// Default timeout for blocking waits.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// How long `expect_nothing` listens before concluding the inbox is quiet.
pub const QUIET_PERIOD: Duration = Duration::from_millis(250);

/// A connected participant with blocking receive helpers.
pub struct TestParticipant {
    client: RelayClient,
    /// Messages received while waiting for something else.
    backlog: VecDeque<Incoming>,
}

impl TestParticipant {
    /// Connect to a relay without joining a multicast group.
    pub fn connect(addr: SocketAddr, name: &str) -> Self {
        Self::connect_with_group(addr, name, None)
    }

    /// Connect to a relay and join `group`, if given.
    pub fn connect_with_group(addr: SocketAddr, name: &str, group: Option<GroupConfig>) -> Self {
        let config = ClientConfig {
            server_host: addr.ip().to_string(),
            server_port: addr.port(),
            display_name: name.into(),
            group,
        };
        let client = RelayClient::connect(config).expect("TestParticipant::connect failed");
        Self {
            client,
            backlog: VecDeque::new(),
        }
    }

    pub fn id(&self) -> ParticipantId {
        self.client.id()
    }

    pub fn client(&self) -> &RelayClient {
        &self.client
    }

    pub fn say(&self, text: &str) {
        self.client.send_reliable(text).expect("send_reliable failed");
    }

    pub fn whisper(&self, text: &str) {
        self.client.send_unicast(text).expect("send_unicast failed");
    }

    pub fn shout(&self, text: &str) {
        self.client.send_group(text).expect("send_group failed");
    }

    /// Block until a message matching `pick` arrives; others are kept in the
    /// backlog for later calls.
    fn wait_for<T>(&mut self, what: &str, mut pick: impl FnMut(&Incoming) -> Option<T>) -> T {
        if let Some(pos) = self.backlog.iter().position(|m| pick(m).is_some()) {
            let message = self.backlog.remove(pos).expect("position is in range");
            return pick(&message).expect("matched above");
        }
        let start = Instant::now();
        loop {
            let remaining = WAIT_TIMEOUT
                .checked_sub(start.elapsed())
                .unwrap_or_else(|| panic!("timed out waiting for {what}"));
            let Some(message) = self.client.recv_timeout(remaining) else {
                panic!("timed out waiting for {what}; backlog: {:?}", self.backlog);
            };
            if let Some(found) = pick(&message) {
                return found;
            }
            self.backlog.push_back(message);
        }
    }

    /// Next reliable-channel text.
    pub fn expect_reliable(&mut self) -> String {
        self.wait_for("reliable message", |m| match m {
            Incoming::Reliable(text) => Some(text.clone()),
            _ => None,
        })
    }

    /// Next unicast-channel text.
    pub fn expect_unicast(&mut self) -> String {
        self.wait_for("unicast datagram", |m| match m {
            Incoming::Unicast(text) => Some(text.clone()),
            _ => None,
        })
    }

    /// Next group-channel text.
    pub fn expect_group(&mut self) -> String {
        self.wait_for("group datagram", |m| match m {
            Incoming::Group(text) => Some(text.clone()),
            _ => None,
        })
    }

    /// Block until the client reports that the server went away.
    pub fn expect_disconnected(&mut self) {
        self.wait_for("disconnect", |m| {
            matches!(m, Incoming::Disconnected).then_some(())
        });
    }

    /// Assert that nothing arrives on any channel for `QUIET_PERIOD`.
    pub fn expect_nothing(&mut self) {
        assert!(self.backlog.is_empty(), "unexpected: {:?}", self.backlog);
        if let Some(message) = self.client.recv_timeout(QUIET_PERIOD) {
            panic!("unexpected message: {message:?}");
        }
    }

    /// Close the connection; the server sees end-of-stream.
    pub fn leave(self) {
        self.client.close();
    }
}
