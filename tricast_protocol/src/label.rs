// Sender labels attached to relayed text.
//
// Text never travels with structured metadata; the sender is identified by a
// prefix baked into the message itself:
// - reliable and unicast text relayed by the server: "<name>#<id>> <body>"
// - group datagrams sent by a client:               "<name>#<id>><body>"
//
// The missing space in the group form is deliberate; existing clients print
// exactly these strings. Unicast datagrams whose source address matches no
// session are relayed as "unknown#?> <body>".

use std::fmt;

use crate::types::ParticipantId;

/// Who a relayed unicast datagram came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Sender<'a> {
    Known { name: &'a str, id: ParticipantId },
    Unknown,
}

impl fmt::Display for Sender<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sender::Known { name, id } => write!(f, "{name}#{id}"),
            Sender::Unknown => f.write_str("unknown#?"),
        }
    }
}

/// Label text relayed by the server (reliable or unicast path).
pub fn relay_line(sender: Sender<'_>, body: &str) -> String {
    format!("{sender}> {body}")
}

/// Label a group datagram before a client multicasts it.
pub fn group_line(name: &str, id: ParticipantId, body: &str) -> String {
    format!("{name}#{id}>{body}")
}
