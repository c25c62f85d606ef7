//! RFC 3261 stream framing: header block terminated by a blank line,
//! body length taken from Content-Length.

use bytes::{Buf, BytesMut};
use sipline_core::Packet;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{Error, Result};

/// Safety cap to avoid pathological allocations from oversized messages.
pub const DEFAULT_MAX_MESSAGE: usize = 64 * 1024;

/// Framing codec for SIP over stream transports (tcp/tls).
#[derive(Debug, Clone)]
pub struct SipCodec {
    max_message: usize,
}

impl Default for SipCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE)
    }
}

impl SipCodec {
    pub fn new(max_message: usize) -> Self {
        Self { max_message }
    }
}

/// Offset just past the head/body separator, if complete.
fn find_head_end(buf: &[u8]) -> Option<usize> {
    let mut i = 0;
    while i < buf.len() {
        if buf[i] == b'\n' {
            if buf.get(i + 1) == Some(&b'\n') {
                return Some(i + 2);
            }
            if buf.get(i + 1) == Some(&b'\r') && buf.get(i + 2) == Some(&b'\n') {
                return Some(i + 3);
            }
        }
        i += 1;
    }
    None
}

/// Scan the (unparsed) header block for Content-Length. Missing means 0,
/// which is what RFC 3261 §20.14 lets a stream receiver assume.
fn scan_content_length(head: &[u8]) -> Result<usize> {
    let text = std::str::from_utf8(head)
        .map_err(|_| Error::Message(sipline_core::Error::parse("header block is not UTF-8")))?;
    for line in text.split('\n').skip(1) {
        let line = line.trim_end_matches('\r');
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        if name.eq_ignore_ascii_case("Content-Length") || name.eq_ignore_ascii_case("l") {
            let value = value.trim();
            return value.parse().map_err(|_| {
                Error::Message(sipline_core::Error::parse(format!(
                    "bad Content-Length {value:?}"
                )))
            });
        }
    }
    Ok(0)
}

impl Decoder for SipCodec {
    type Item = Packet;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>> {
        // Swallow CRLF keep-alives between messages; a message never
        // starts with a blank line.
        while src.starts_with(b"\r\n") {
            src.advance(2);
        }

        let Some(head_end) = find_head_end(src) else {
            if src.len() > self.max_message {
                return Err(Error::Oversized(self.max_message));
            }
            return Ok(None);
        };

        let body_len = scan_content_length(&src[..head_end])?;
        let total = head_end + body_len;
        if total > self.max_message {
            return Err(Error::Oversized(self.max_message));
        }
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let frame = src.split_to(total);
        let packet = Packet::parse(&frame)?;
        Ok(Some(packet))
    }
}

impl Encoder<Packet> for SipCodec {
    type Error = Error;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<()> {
        let wire = item.to_bytes();
        if wire.len() > self.max_message {
            return Err(Error::Oversized(self.max_message));
        }
        dst.extend_from_slice(&wire);
        Ok(())
    }
}
