// Length-delimited text framing over TCP.
//
// Wire format for every message on the reliable channel after the handshake:
// a 4-byte big-endian length prefix followed by that many bytes of UTF-8
// text. Payloads are always text; nothing on the wire is ever decoded into
// anything richer than a `String`.
//
// `read_frame` distinguishes a normal disconnect from a protocol violation:
// - failing to read the length prefix (clean close, reset, short read) is
//   `Ok(None)`, the end-of-stream signal callers treat as a disconnect;
// - an oversized declared length, a truncated payload, or invalid UTF-8 is a
//   `FrameError`. Callers close the connection on those too, but they are
//   worth logging.
//
// `MAX_FRAME_SIZE` (1 MiB) bounds the allocation a peer can force with a
// forged length prefix. Chat lines are far smaller.

use std::io::{self, Read, Write};

use thiserror::Error;

/// Maximum allowed payload size in bytes (1 MiB).
pub const MAX_FRAME_SIZE: u32 = 1024 * 1024;

/// Size of the big-endian length prefix.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// A frame that could not be encoded or decoded.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame too large: {len} bytes (max {max})")]
    TooLarge { len: usize, max: u32 },
    #[error("frame truncated: expected {expected} payload bytes: {source}")]
    Truncated {
        expected: u32,
        #[source]
        source: io::Error,
    },
    #[error("frame payload is not valid UTF-8")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Encode `text` as a single frame: length prefix followed by the UTF-8 bytes.
pub fn encode_frame(text: &str) -> Result<Vec<u8>, FrameError> {
    let len = u32::try_from(text.len())
        .ok()
        .filter(|len| *len <= MAX_FRAME_SIZE)
        .ok_or(FrameError::TooLarge {
            len: text.len(),
            max: MAX_FRAME_SIZE,
        })?;
    let mut buf = Vec::with_capacity(LENGTH_PREFIX_LEN + text.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(text.as_bytes());
    Ok(buf)
}

/// Write one frame and flush. The prefix and payload go out in a single
/// `write_all` so a frame is never split across two writer-lock holders.
pub fn write_frame<W: Write>(writer: &mut W, text: &str) -> Result<(), FrameError> {
    let frame = encode_frame(text)?;
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame.
///
/// Returns `Ok(None)` when the length prefix cannot be read, which is how a
/// closed or reset connection shows up. `read_exact` keeps reading until the
/// full payload has arrived, so partial TCP reads are handled here.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Option<String>, FrameError> {
    let mut len_buf = [0u8; LENGTH_PREFIX_LEN];
    if reader.read_exact(&mut len_buf).is_err() {
        return Ok(None);
    }
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge {
            len: len as usize,
            max: MAX_FRAME_SIZE,
        });
    }
    let mut buf = vec![0u8; len as usize];
    reader
        .read_exact(&mut buf)
        .map_err(|source| FrameError::Truncated {
            expected: len,
            source,
        })?;
    Ok(Some(String::from_utf8(buf)?))
}
