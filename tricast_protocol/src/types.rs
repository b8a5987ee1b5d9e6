// Core ID type shared by the protocol, the server's registry, and the client.
//
// Participant ids are compact positive integers handed out by the server at
// handshake time. The server always picks the smallest id not held by a live
// session, so ids of departed participants come back into use.

use std::fmt;

/// Server-assigned participant id. Always positive for a live session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParticipantId(pub u32);

impl ParticipantId {
    /// The lowest id the server ever assigns.
    pub const FIRST: ParticipantId = ParticipantId(1);
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
