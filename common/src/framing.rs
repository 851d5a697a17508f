//! Length-prefixed framing for JSON messages.
//!
//! Wire format: `<ASCII decimal length>\n<JSON payload>`.
//!
//! The transport may split or merge frames arbitrarily, so decoding works
//! on whatever bytes have arrived so far and hands back the undecoded tail.
//! Older devices send one JSON object per line instead; a header line that
//! starts with `{` is decoded as such a legacy message.

use std::io::{self, Write};

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Largest payload a single frame may declare.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Longest length prefix we will wait on before calling the stream junk.
const MAX_PREFIX_DIGITS: usize = 20;

/// Failure to decode one frame. Frames before and after it are unaffected.
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("invalid length prefix: {0:?}")]
    BadLength(String),

    #[error("frame too large: {0} bytes")]
    TooLarge(usize),

    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// Output of [`decode`].
#[derive(Debug)]
pub struct Decoded<T> {
    /// One entry per frame, in arrival order.
    pub frames: Vec<Result<T, FrameError>>,
    /// Bytes of an incomplete trailing frame.
    pub remainder: Vec<u8>,
}

impl<T> Decoded<T> {
    /// Successfully decoded messages, skipping malformed frames.
    pub fn messages(&self) -> impl Iterator<Item = &T> {
        self.frames.iter().filter_map(|f| f.as_ref().ok())
    }
}

/// Serialize `msg` into one self-delimiting frame.
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, FrameError> {
    let payload = serde_json::to_vec(msg)?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(payload.len()));
    }
    let mut frame = Vec::with_capacity(payload.len() + 12);
    frame.extend_from_slice(payload.len().to_string().as_bytes());
    frame.push(b'\n');
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decode every complete frame in `buffer`.
///
/// A partially received frame is never an error: it comes back untouched in
/// [`Decoded::remainder`] and decodes once the rest of it is appended.
pub fn decode<T: DeserializeOwned>(buffer: &[u8]) -> Decoded<T> {
    let (frames, consumed) = decode_prefix(buffer);
    Decoded {
        frames,
        remainder: buffer[consumed..].to_vec(),
    }
}

/// Decode complete frames from the front of `buffer`, returning them with
/// the number of bytes consumed.
fn decode_prefix<T: DeserializeOwned>(buffer: &[u8]) -> (Vec<Result<T, FrameError>>, usize) {
    let mut frames = Vec::new();
    let mut pos = 0;

    while pos < buffer.len() {
        let rest = &buffer[pos..];
        let Some(nl) = rest.iter().position(|&b| b == b'\n') else {
            // A length prefix can only be so long.
            if rest.len() > MAX_PREFIX_DIGITS && rest.iter().all(u8::is_ascii_digit) {
                frames.push(Err(FrameError::BadLength(preview(rest))));
                pos = buffer.len();
            }
            break;
        };

        let line = &rest[..nl];
        let line = line.strip_suffix(b"\r").unwrap_or(line);

        if !line.is_empty() && line.iter().all(u8::is_ascii_digit) {
            let len = match std::str::from_utf8(line).ok().and_then(|s| s.parse::<usize>().ok()) {
                Some(len) => len,
                None => {
                    frames.push(Err(FrameError::BadLength(preview(line))));
                    pos += nl + 1;
                    continue;
                }
            };
            if len > MAX_FRAME_LEN {
                frames.push(Err(FrameError::TooLarge(len)));
                pos += nl + 1;
                continue;
            }
            let start = pos + nl + 1;
            let end = start + len;
            if end > buffer.len() {
                // Payload still in flight.
                break;
            }
            frames.push(serde_json::from_slice(&buffer[start..end]).map_err(FrameError::from));
            pos = end;
        } else if line.iter().all(u8::is_ascii_whitespace) {
            // Blank keep-alive line.
            pos += nl + 1;
        } else if line.trim_ascii_start().starts_with(b"{") {
            frames.push(serde_json::from_slice(line).map_err(FrameError::from));
            pos += nl + 1;
        } else {
            frames.push(Err(FrameError::BadLength(preview(line))));
            pos += nl + 1;
        }
    }

    (frames, pos)
}

fn preview(bytes: &[u8]) -> String {
    let shown = &bytes[..bytes.len().min(32)];
    String::from_utf8_lossy(shown).into_owned()
}

/// Incremental decoder that keeps the undecoded tail between reads.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append freshly read bytes and return every frame they complete.
    pub fn feed<T: DeserializeOwned>(&mut self, bytes: &[u8]) -> Vec<Result<T, FrameError>> {
        self.buf.extend_from_slice(bytes);
        let (mut frames, consumed) = decode_prefix(&self.buf);
        self.buf.drain(..consumed);

        // An unterminated legacy line cannot grow forever.
        if self.buf.len() > MAX_FRAME_LEN + MAX_PREFIX_DIGITS + 1 {
            frames.push(Err(FrameError::TooLarge(self.buf.len())));
            self.buf.clear();
        }
        frames
    }

    /// Number of buffered bytes not yet forming a complete frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

/// Write one frame to a blocking stream.
pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, msg: &T) -> io::Result<()> {
    let frame = encode(msg).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    writer.write_all(&frame)?;
    writer.flush()
}
