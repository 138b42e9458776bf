//! CRLF-framed line codec over the control socket.
//!
//! `find_crlf`/`MAX_LINE_LENGTH`/`split_to` produce a raw `String` line;
//! `ControlChannel` (in `connection.rs`) is the layer that turns lines into
//! `ControlLine`s and applies the post-authentication SASL-wrap + base64
//! step.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

/// Lines longer than this are a protocol error rather than silently
/// accumulated forever.
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

#[derive(Debug, Default)]
pub struct LineCodec;

impl Decoder for LineCodec {
    type Item = String;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(pos) = find_crlf(src) else {
            if src.len() > MAX_LINE_LENGTH {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("line exceeds {MAX_LINE_LENGTH} bytes without a CRLF"),
                ));
            }
            return Ok(None);
        };

        let mut line = src.split_to(pos + 2);
        line.truncate(line.len() - 2);

        String::from_utf8(line.to_vec())
            .map(Some)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

impl Encoder<String> for LineCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(item.as_bytes());
        dst.extend_from_slice(b"\r\n");
        Ok(())
    }
}

/// Returns the index of the `\r` in the first `\r\n` pair found in `src`, if
/// any.
fn find_crlf(src: &BytesMut) -> Option<usize> {
    let mut iter = src.iter().enumerate().peekable();
    while let Some((idx, byte)) = iter.next() {
        if *byte == b'\r' {
            if let Some((_, &b'\n')) = iter.peek() {
                return Some(idx);
            }
        }
    }
    None
}
