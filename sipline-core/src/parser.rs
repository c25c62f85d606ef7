//! Wire-format parser: bytes in, [`Packet`] out.
//!
//! Permissive where RFC 3261 allows it: bare-LF line endings, folded
//! header lines, compact header names. Strict on the start line and on
//! Content-Length overruns.

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::message::{Method, Packet, Request, Response};
use crate::Headers;

/// Expand RFC 3261 compact header names to their canonical form.
fn canonical_name(name: &str) -> &str {
    if name.len() != 1 {
        return name;
    }
    match name.as_bytes()[0].to_ascii_lowercase() {
        b'v' => "Via",
        b'f' => "From",
        b't' => "To",
        b'i' => "Call-ID",
        b'm' => "Contact",
        b'l' => "Content-Length",
        b'c' => "Content-Type",
        b'e' => "Content-Encoding",
        b's' => "Subject",
        b'k' => "Supported",
        _ => name,
    }
}

/// Offset just past the head/body separator, plus the head slice.
fn split_head(input: &[u8]) -> Option<(&[u8], usize)> {
    let mut i = 0;
    while i < input.len() {
        match input[i] {
            b'\n' if input.get(i + 1) == Some(&b'\n') => return Some((&input[..i], i + 2)),
            b'\n' if input.get(i + 1) == Some(&b'\r') && input.get(i + 2) == Some(&b'\n') => {
                return Some((&input[..i], i + 3))
            }
            _ => {}
        }
        i += 1;
    }
    None
}

fn parse_start_line(line: &str) -> Result<Packet> {
    if let Some(rest) = line.strip_prefix("SIP/2.0 ") {
        let (code, reason) = rest
            .split_once(' ')
            .map(|(c, r)| (c, r.trim()))
            .unwrap_or((rest.trim(), ""));
        let code: u16 = code
            .parse()
            .map_err(|_| Error::parse(format!("bad status code {code:?}")))?;
        if !(100..700).contains(&code) {
            return Err(Error::parse(format!("status code {code} out of range")));
        }
        return Ok(Packet::Response(Response::new(code, reason)));
    }

    let mut pieces = line.split_ascii_whitespace();
    let (method, uri, version) = (pieces.next(), pieces.next(), pieces.next());
    let (Some(method), Some(uri), Some(version)) = (method, uri, version) else {
        return Err(Error::parse(format!("malformed start line {line:?}")));
    };
    if version != "SIP/2.0" {
        return Err(Error::parse(format!("unsupported version {version:?}")));
    }
    let method: Method = method.parse()?;
    let uri = uri.parse()?;
    Ok(Packet::Request(Request::new(method, uri)))
}

/// Parse one SIP message from `input`.
///
/// The body is taken from the Content-Length header when present; a
/// declared length beyond the available bytes is an error, surplus bytes
/// after the declared length are ignored (trailing datagram padding).
pub fn parse_packet(input: &[u8]) -> Result<Packet> {
    let (head, body_start) = split_head(input)
        .ok_or_else(|| Error::parse("message has no header/body separator"))?;
    let head = std::str::from_utf8(head).map_err(|_| Error::parse("header block is not UTF-8"))?;

    let mut lines = Vec::<String>::new();
    for raw in head.split('\n') {
        let raw = raw.strip_suffix('\r').unwrap_or(raw);
        if raw.starts_with([' ', '\t']) {
            // Folded continuation of the previous line.
            match lines.last_mut() {
                Some(prev) => {
                    prev.push(' ');
                    prev.push_str(raw.trim());
                }
                None => return Err(Error::parse("continuation before first header")),
            }
        } else {
            lines.push(raw.to_owned());
        }
    }

    let mut iter = lines.into_iter().filter(|l| !l.trim().is_empty());
    let start = iter
        .next()
        .ok_or_else(|| Error::parse("empty message"))?;
    let mut packet = parse_start_line(&start)?;

    let mut headers = Headers::new();
    for line in iter {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| Error::parse(format!("header line without colon {line:?}")))?;
        let name = name.trim();
        if name.is_empty() || name.contains(char::is_whitespace) {
            return Err(Error::parse(format!("invalid header name {name:?}")));
        }
        headers.push(canonical_name(name), value.trim().to_owned());
    }

    let available = &input[body_start..];
    let body = match headers.get("Content-Length") {
        Some(cl) => {
            let len: usize = cl
                .trim()
                .parse()
                .map_err(|_| Error::parse(format!("bad Content-Length {cl:?}")))?;
            if len > available.len() {
                return Err(Error::parse(format!(
                    "Content-Length {len} exceeds available {}",
                    available.len()
                )));
            }
            Bytes::copy_from_slice(&available[..len])
        }
        None => Bytes::copy_from_slice(available),
    };

    match &mut packet {
        Packet::Request(r) => {
            r.headers = headers;
            r.body = body;
        }
        Packet::Response(r) => {
            r.headers = headers;
            r.body = body;
        }
    }
    Ok(packet)
}

impl Packet {
    /// See [`parse_packet`].
    pub fn parse(input: &[u8]) -> Result<Packet> {
        parse_packet(input)
    }
}
