// Id-assignment reply sent by the server after the display-name frame.
//
// This is the one message on the reliable channel that is not framed: the
// server writes exactly `ID_REPLY_LEN` ASCII bytes holding the decimal id,
// left-padded with '0' (id 7 is "00000007"). The client reads exactly that
// many bytes before switching to framed traffic.

use std::io::{self, Read};

use thiserror::Error;

use crate::types::ParticipantId;

/// Width of the id reply in bytes.
pub const ID_REPLY_LEN: usize = 8;

/// Largest id that fits in the reply.
pub const MAX_PARTICIPANT_ID: u32 = 99_999_999;

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("participant id {0} does not fit in the id reply")]
    IdTooWide(ParticipantId),
    #[error("malformed id reply {0:?}")]
    Malformed(String),
    #[error("reading id reply: {0}")]
    Io(#[from] io::Error),
}

/// Encode `id` as the fixed-width reply.
pub fn encode_id_reply(id: ParticipantId) -> Result<[u8; ID_REPLY_LEN], HandshakeError> {
    if id.0 > MAX_PARTICIPANT_ID {
        return Err(HandshakeError::IdTooWide(id));
    }
    let text = format!("{:0width$}", id.0, width = ID_REPLY_LEN);
    let mut reply = [0u8; ID_REPLY_LEN];
    reply.copy_from_slice(text.as_bytes());
    Ok(reply)
}

/// Parse a fixed-width reply. Surrounding ASCII whitespace and NUL padding
/// are tolerated; anything else that is not a positive decimal is rejected.
pub fn parse_id_reply(reply: &[u8]) -> Result<ParticipantId, HandshakeError> {
    let malformed = || HandshakeError::Malformed(String::from_utf8_lossy(reply).into_owned());
    let text = std::str::from_utf8(reply).map_err(|_| malformed())?;
    let digits = text.trim_matches(|c: char| c.is_ascii_whitespace() || c == '\0');
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(malformed());
    }
    match digits.parse::<u32>() {
        Ok(0) | Err(_) => Err(malformed()),
        Ok(id) => Ok(ParticipantId(id)),
    }
}

/// Read exactly `ID_REPLY_LEN` bytes from `reader` and parse them.
pub fn read_id_reply<R: Read>(reader: &mut R) -> Result<ParticipantId, HandshakeError> {
    let mut reply = [0u8; ID_REPLY_LEN];
    reader.read_exact(&mut reply)?;
    parse_id_reply(&reply)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn reply_is_zero_padded_ascii() {
        assert_eq!(&encode_id_reply(ParticipantId(1)).unwrap(), b"00000001");
        assert_eq!(&encode_id_reply(ParticipantId(1234)).unwrap(), b"00001234");
        assert_eq!(
            &encode_id_reply(ParticipantId(MAX_PARTICIPANT_ID)).unwrap(),
            b"99999999"
        );
    }

    #[test]
    fn rejects_ids_wider_than_reply() {
        let err = encode_id_reply(ParticipantId(MAX_PARTICIPANT_ID + 1)).unwrap_err();
        assert!(matches!(err, HandshakeError::IdTooWide(_)));
    }

    #[test]
    fn reads_reply_and_leaves_rest_of_stream() {
        let mut wire = encode_id_reply(ParticipantId(42)).unwrap().to_vec();
        wire.extend_from_slice(b"next");
        let mut cursor = Cursor::new(wire);
        assert_eq!(read_id_reply(&mut cursor).unwrap(), ParticipantId(42));
        assert_eq!(cursor.position(), ID_REPLY_LEN as u64);
    }

    #[test]
    fn tolerates_space_and_nul_padding() {
        assert_eq!(parse_id_reply(b"3       ").unwrap(), ParticipantId(3));
        assert_eq!(parse_id_reply(b"   17\0\0\0").unwrap(), ParticipantId(17));
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            parse_id_reply(b"12ab5678"),
            Err(HandshakeError::Malformed(_))
        ));
        assert!(matches!(
            parse_id_reply(b"        "),
            Err(HandshakeError::Malformed(_))
        ));
        assert!(matches!(
            parse_id_reply(b"00000000"),
            Err(HandshakeError::Malformed(_))
        ));
        assert!(matches!(
            parse_id_reply(b"-0000001"),
            Err(HandshakeError::Malformed(_))
        ));
    }

    #[test]
    fn short_reply_is_io_error() {
        let mut cursor = Cursor::new(b"0001".to_vec());
        assert!(matches!(
            read_id_reply(&mut cursor),
            Err(HandshakeError::Io(_))
        ));
    }
}
