use bytes::BytesMut;
use serde::Serialize;
use serde_json::Value;

use crate::Error;

/// Upper bound on a single line. A 1 MiB application payload grows by the
/// AEAD tag, base64 and the JSON envelope; 8 MiB leaves comfortable room
/// while still bounding a hostile sender.
pub const MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

/// Encode one value as a newline-terminated JSON line.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, Error> {
    let mut line = serde_json::to_vec(value).map_err(|_| Error::EncodeFailed)?;
    line.push(b'\n');
    Ok(line)
}

/// Incremental decoder for the newline-delimited JSON stream.
///
/// Feed it raw socket bytes in whatever chunks they arrive; it emits one
/// JSON value per `\n`-terminated line. A line that fails to parse is
/// consumed and reported as [`Error::InvalidJson`] so the caller can send
/// the protocol's error notice and keep reading.
///
/// # Example
///
/// ```
/// use m2m_codec::frame::FrameDecoder;
///
/// let mut decoder = FrameDecoder::default();
/// decoder.extend(b"{\"a\"");
/// assert!(decoder.next().unwrap().is_none());
///
/// decoder.extend(b":1}\n{\"b\":2}\n");
/// assert_eq!(decoder.next().unwrap().unwrap()["a"], 1);
/// assert_eq!(decoder.next().unwrap().unwrap()["b"], 2);
/// assert!(decoder.next().unwrap().is_none());
/// ```
#[derive(Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Mutable access to the internal buffer, for read loops that want to
    /// fill it directly with `read_buf`.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    /// Pop the next complete frame, or `None` when more bytes are needed.
    pub fn next(&mut self) -> Result<Option<Value>, Error> {
        let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') else {
            if self.buffer.len() > MAX_FRAME_LEN {
                return Err(Error::FrameTooLarge);
            }

            return Ok(None);
        };

        if pos > MAX_FRAME_LEN {
            return Err(Error::FrameTooLarge);
        }

        let line = self.buffer.split_to(pos + 1);
        match serde_json::from_slice::<Value>(&line[..pos]) {
            Ok(Value::Object(map)) => Ok(Some(Value::Object(map))),
            _ => Err(Error::InvalidJson),
        }
    }
}
