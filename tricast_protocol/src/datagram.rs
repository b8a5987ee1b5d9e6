// Datagram payloads for the unicast and group channels.
//
// A datagram is one message: raw UTF-8 text, no length prefix. Receivers
// size their buffer for the largest possible UDP payload and drop anything
// that does not decode as text.

/// Largest payload a single IPv4 UDP datagram can carry.
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Decode a received datagram. Returns `None` for non-UTF-8 payloads.
pub fn decode_datagram(payload: &[u8]) -> Option<&str> {
    std::str::from_utf8(payload).ok()
}
