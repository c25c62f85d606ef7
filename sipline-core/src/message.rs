use std::fmt;
use std::str::FromStr;

use bytes::{BufMut, Bytes, BytesMut};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::headers::{Headers, Via};
use crate::uri::SipUri;

/// SIP request method.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Invite,
    Ack,
    Bye,
    Cancel,
    Register,
    Options,
    Info,
    Message,
    Notify,
    Subscribe,
    Refer,
    Update,
    Prack,
    Publish,
    Other(String),
}

impl Method {
    pub fn as_str(&self) -> &str {
        match self {
            Method::Invite => "INVITE",
            Method::Ack => "ACK",
            Method::Bye => "BYE",
            Method::Cancel => "CANCEL",
            Method::Register => "REGISTER",
            Method::Options => "OPTIONS",
            Method::Info => "INFO",
            Method::Message => "MESSAGE",
            Method::Notify => "NOTIFY",
            Method::Subscribe => "SUBSCRIBE",
            Method::Refer => "REFER",
            Method::Update => "UPDATE",
            Method::Prack => "PRACK",
            Method::Publish => "PUBLISH",
            Method::Other(s) => s,
        }
    }

    pub fn is_invite(&self) -> bool {
        matches!(self, Method::Invite)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let m = match s.to_ascii_uppercase().as_str() {
            "INVITE" => Method::Invite,
            "ACK" => Method::Ack,
            "BYE" => Method::Bye,
            "CANCEL" => Method::Cancel,
            "REGISTER" => Method::Register,
            "OPTIONS" => Method::Options,
            "INFO" => Method::Info,
            "MESSAGE" => Method::Message,
            "NOTIFY" => Method::Notify,
            "SUBSCRIBE" => Method::Subscribe,
            "REFER" => Method::Refer,
            "UPDATE" => Method::Update,
            "PRACK" => Method::Prack,
            "PUBLISH" => Method::Publish,
            other => {
                if other.is_empty() || !other.chars().all(|c| c.is_ascii_alphanumeric()) {
                    return Err(Error::parse(format!("invalid method {s:?}")));
                }
                Method::Other(other.to_owned())
            }
        };
        Ok(m)
    }
}

/// Parsed CSeq header: sequence number plus method.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CSeq {
    pub seq: u32,
    pub method: Method,
}

impl fmt::Display for CSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.seq, self.method)
    }
}

impl FromStr for CSeq {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (seq, method) = s
            .trim()
            .split_once(char::is_whitespace)
            .ok_or_else(|| Error::header(format!("malformed CSeq {s:?}")))?;
        Ok(CSeq {
            seq: seq
                .parse()
                .map_err(|_| Error::header(format!("bad CSeq number {seq:?}")))?,
            method: method.trim().parse()?,
        })
    }
}

/// An outbound or inbound SIP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    pub uri: SipUri,
    pub headers: Headers,
    pub body: Bytes,
}

impl Request {
    pub fn new(method: Method, uri: SipUri) -> Self {
        Self {
            method,
            uri,
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }
}

/// An outbound or inbound SIP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub code: u16,
    pub reason: String,
    pub headers: Headers,
    pub body: Bytes,
}

impl Response {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    /// Build a response for `req`, copying Via, Record-Route, From, To,
    /// Call-ID and CSeq. A To-tag is stamped when the request carried
    /// none, derived from the Call-ID so retransmitted requests produce
    /// the identical response.
    pub fn for_request(req: &Request, code: u16, reason: &str) -> Response {
        let mut resp = Response::new(code, reason);
        for name in ["Via", "Record-Route"] {
            for value in req.headers.values(name) {
                resp.headers.push(name, value);
            }
        }
        for name in ["From", "To", "Call-ID", "CSeq"] {
            if let Some(value) = req.headers.get(name) {
                resp.headers.push(name, value.to_owned());
            }
        }
        if code > 100 {
            if let Some(to) = resp.headers.get("To").map(str::to_owned) {
                if !to.to_ascii_lowercase().contains(";tag=") {
                    let callid = req.headers.get("Call-ID").unwrap_or_default();
                    let tag = short_digest(callid.as_bytes());
                    resp.headers.set("To", format!("{to};tag={tag}"));
                }
            }
        }
        resp
    }

    pub fn is_provisional(&self) -> bool {
        self.code < 200
    }

    pub fn is_final(&self) -> bool {
        self.code >= 200
    }
}

/// Default reason phrase for the status codes this stack emits.
pub fn status_reason(code: u16) -> &'static str {
    match code {
        100 => "Trying",
        180 => "Ringing",
        200 => "OK",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        423 => "Interval Too Brief",
        480 => "Temporarily Unavailable",
        481 => "Call/Transaction Does Not Exist",
        482 => "Loop Detected",
        486 => "Busy Here",
        500 => "Server Internal Error",
        503 => "Service Unavailable",
        _ => "",
    }
}

/// A SIP message, request or response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Request(Request),
    Response(Response),
}

impl Packet {
    pub fn is_request(&self) -> bool {
        matches!(self, Packet::Request(_))
    }

    pub fn is_response(&self) -> bool {
        matches!(self, Packet::Response(_))
    }

    pub fn headers(&self) -> &Headers {
        match self {
            Packet::Request(r) => &r.headers,
            Packet::Response(r) => &r.headers,
        }
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        match self {
            Packet::Request(r) => &mut r.headers,
            Packet::Response(r) => &mut r.headers,
        }
    }

    pub fn body(&self) -> &Bytes {
        match self {
            Packet::Request(r) => &r.body,
            Packet::Response(r) => &r.body,
        }
    }

    /// Request method, for requests.
    pub fn method(&self) -> Option<&Method> {
        match self {
            Packet::Request(r) => Some(&r.method),
            Packet::Response(_) => None,
        }
    }

    /// Status code, for responses.
    pub fn code(&self) -> Option<u16> {
        match self {
            Packet::Request(_) => None,
            Packet::Response(r) => Some(r.code),
        }
    }

    pub fn callid(&self) -> Option<&str> {
        self.headers().get("Call-ID")
    }

    pub fn cseq(&self) -> Option<CSeq> {
        self.headers().get("CSeq")?.parse().ok()
    }

    /// Parsed topmost Via.
    pub fn top_via(&self) -> Option<Via> {
        self.headers().top_value("Via")?.parse().ok()
    }

    /// Transaction key in canonical string form: Call-ID plus CSeq.
    ///
    /// This profile is stable across the outbound path (the Via, and with
    /// it the branch, is only stamped when the packet reaches its leg) and
    /// responses echo both headers, so one key matches a request to its
    /// response on any hop.
    pub fn tid(&self) -> Option<String> {
        let callid = self.callid()?;
        let cseq = self.cseq()?;
        Some(format!("{callid}|{cseq}"))
    }

    /// Serialize for the wire. Content-Length is always emitted and
    /// always computed from the body.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(if self.body().is_empty() { 800 } else { 1500 });
        match self {
            Packet::Request(r) => {
                buf.put_slice(r.method.as_str().as_bytes());
                buf.put_u8(b' ');
                buf.put_slice(r.uri.to_string().as_bytes());
                buf.put_slice(b" SIP/2.0\r\n");
            }
            Packet::Response(r) => {
                buf.put_slice(format!("SIP/2.0 {} {}\r\n", r.code, r.reason).as_bytes());
            }
        }
        for header in self.headers().iter() {
            if header.is("Content-Length") {
                continue;
            }
            buf.put_slice(header.name.as_bytes());
            buf.put_slice(b": ");
            buf.put_slice(header.value.as_bytes());
            buf.put_slice(b"\r\n");
        }
        buf.put_slice(format!("Content-Length: {}\r\n\r\n", self.body().len()).as_bytes());
        buf.put_slice(self.body());
        buf.freeze()
    }
}

/// Short hex digest used for deterministic tags and branch nonces.
pub fn short_digest(input: &[u8]) -> String {
    let digest = Sha256::digest(input);
    let mut out = String::with_capacity(16);
    for byte in &digest[..8] {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn register_request() -> Request {
        let mut req = Request::new(Method::Register, "sip:example.com".parse().unwrap());
        req.headers.push("Via", "SIP/2.0/UDP 1.2.3.4:5060;branch=z9hG4bKabc.1");
        req.headers.push("From", "<sip:ua@example.com>;tag=f1");
        req.headers.push("To", "<sip:ua@example.com>");
        req.headers.push("Call-ID", "cid-77@1.2.3.4");
        req.headers.push("CSeq", "2 REGISTER");
        req
    }

    #[test]
    fn cseq_roundtrip() {
        let cseq: CSeq = "314159  INVITE".parse().unwrap();
        assert_eq!(cseq.seq, 314159);
        assert_eq!(cseq.method, Method::Invite);
        assert_eq!(cseq.to_string(), "314159 INVITE");
    }

    #[test]
    fn unknown_method_is_preserved() {
        let m: Method = "FOO1".parse().unwrap();
        assert_eq!(m, Method::Other("FOO1".into()));
        assert!("IN VITE".parse::<Method>().is_err());
    }

    #[test]
    fn tid_is_callid_and_cseq() {
        let pkt = Packet::Request(register_request());
        assert_eq!(pkt.tid().as_deref(), Some("cid-77@1.2.3.4|2 REGISTER"));
    }

    #[test]
    fn response_copies_core_headers_and_tags_to() {
        let req = register_request();
        let resp = Response::for_request(&req, 200, "OK");
        assert_eq!(resp.headers.get("Call-ID"), Some("cid-77@1.2.3.4"));
        assert_eq!(resp.headers.get("CSeq"), Some("2 REGISTER"));
        assert!(resp.headers.get("To").unwrap().contains(";tag="));
        // Same request, same tag.
        let again = Response::for_request(&req, 200, "OK");
        assert_eq!(resp.headers.get("To"), again.headers.get("To"));
    }

    #[test]
    fn trying_gets_no_to_tag() {
        let req = register_request();
        let resp = Response::for_request(&req, 100, "Trying");
        assert!(!resp.headers.get("To").unwrap().contains(";tag="));
    }

    #[test]
    fn serializer_emits_content_length() {
        let mut req = register_request();
        req.headers.push("Content-Length", "999");
        req.body = Bytes::from_static(b"v=0");
        let wire = Packet::Request(req).to_bytes();
        let text = std::str::from_utf8(&wire).unwrap();
        assert!(text.starts_with("REGISTER sip:example.com SIP/2.0\r\n"));
        assert!(text.contains("Content-Length: 3\r\n\r\nv=0"));
        assert!(!text.contains("999"));
    }
}
