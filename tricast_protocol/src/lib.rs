// tricast_protocol — wire protocol shared by the tricast relay server and its
// clients.
//
// The relay moves plain UTF-8 text over three transports: framed TCP
// (reliable), UDP relayed through the server (unicast), and UDP multicast
// straight between clients (group). This crate holds the pieces both ends
// must agree on and has no networking of its own.
//
// Module overview:
// - `types.rs`:     `ParticipantId`, the server-assigned participant number.
// - `framing.rs`:   Length-delimited text frames over any `Read`/`Write`
//                   stream: 4-byte big-endian length, then UTF-8 payload.
// - `datagram.rs`:  Unframed UTF-8 payloads for the two UDP channels.
// - `handshake.rs`: The fixed-width, unframed id reply that ends the
//                   connection handshake.
// - `label.rs`:     Sender prefixes ("alice#1> ...") attached to relayed text.
//
// Design decisions:
// - **Text payloads only.** Frames decode to `String` and nothing else; the
//   relay never deserializes structured data supplied by a peer.
// - **No async runtime.** Uses `std::io::Read`/`Write`, compatible with
//   blocking TCP streams and buffered wrappers alike.

pub mod datagram;
pub mod framing;
pub mod handshake;
pub mod label;
pub mod types;

pub use datagram::{MAX_DATAGRAM_SIZE, decode_datagram};
pub use framing::{FrameError, MAX_FRAME_SIZE, encode_frame, read_frame, write_frame};
pub use handshake::{HandshakeError, ID_REPLY_LEN, encode_id_reply, read_id_reply};
pub use label::{Sender, group_line, relay_line};
pub use types::ParticipantId;

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    /// A full reliable-channel exchange as seen on the wire: name frame from
    /// the client, id reply from the server, then a labelled relay frame.
    #[test]
    fn handshake_then_frames_share_one_stream() {
        let mut client_to_server = Vec::new();
        write_frame(&mut client_to_server, "alice").unwrap();
        write_frame(&mut client_to_server, "hi").unwrap();

        let mut inbound = Cursor::new(client_to_server);
        let name = read_frame(&mut inbound).unwrap().unwrap();
        let body = read_frame(&mut inbound).unwrap().unwrap();

        let id = ParticipantId::FIRST;
        let mut server_to_client = encode_id_reply(id).unwrap().to_vec();
        let line = relay_line(Sender::Known { name: &name, id }, &body);
        write_frame(&mut server_to_client, &line).unwrap();

        let mut outbound = Cursor::new(server_to_client);
        assert_eq!(read_id_reply(&mut outbound).unwrap(), id);
        assert_eq!(
            read_frame(&mut outbound).unwrap().as_deref(),
            Some("alice#1> hi")
        );
        assert_eq!(read_frame(&mut outbound).unwrap(), None);
    }
}
