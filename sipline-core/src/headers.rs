use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::uri::Params;

/// A single header field, name kept as written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

/// Ordered header list with case-insensitive name matching.
///
/// Values of repeatable headers (Via, Route, Contact, ...) may be stored
/// one per field or comma-concatenated; `values` and `pop_value` operate
/// on individual elements either way.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<Header>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Header> {
        self.0.iter()
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push(Header::new(name, value));
    }

    /// First field value for this name, comma-joined elements included.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.iter().find(|h| h.is(name)).map(|h| h.value.as_str())
    }

    /// Every individual value element for this name, splitting
    /// comma-concatenated fields (quote- and angle-bracket-aware).
    pub fn values(&self, name: &str) -> Vec<String> {
        self.0
            .iter()
            .filter(|h| h.is(name))
            .flat_map(|h| split_comma_values(&h.value))
            .collect()
    }

    /// Replace the first field of this name and drop any others.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.0.iter().position(|h| h.is(name)) {
            Some(idx) => {
                self.0[idx].value = value;
                let mut i = self.0.len();
                while i > idx + 1 {
                    i -= 1;
                    if self.0[i].is(name) {
                        self.0.remove(i);
                    }
                }
            }
            None => self.push(name.to_owned(), value),
        }
    }

    pub fn remove_all(&mut self, name: &str) {
        self.0.retain(|h| !h.is(name));
    }

    /// Insert a value element on top of the first field with this name,
    /// as its own field. Falls back to the top of the list so a new Via
    /// always becomes the topmost Via.
    pub fn insert_top(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        let idx = self.0.iter().position(|h| h.is(name)).unwrap_or(0);
        self.0.insert(idx, Header::new(name.to_owned(), value));
    }

    /// Remove and return the topmost value element for this name. A
    /// comma-joined field loses its first element only.
    pub fn pop_value(&mut self, name: &str) -> Option<String> {
        let idx = self.0.iter().position(|h| h.is(name))?;
        let mut elements = split_comma_values(&self.0[idx].value);
        if elements.is_empty() {
            self.0.remove(idx);
            return None;
        }
        let top = elements.remove(0);
        if elements.is_empty() {
            self.0.remove(idx);
        } else {
            self.0[idx].value = elements.join(", ");
        }
        Some(top)
    }

    /// Topmost value element for this name, without removing it.
    pub fn top_value(&self, name: &str) -> Option<String> {
        let field = self.get(name)?;
        split_comma_values(field).into_iter().next()
    }
}

/// Split a header field on top-level commas, leaving quoted strings and
/// `<...>` bracketed URIs intact.
pub fn split_comma_values(s: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut quoted = false;
    let mut escaped = false;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if quoted => escaped = true,
            '"' => quoted = !quoted,
            '<' if !quoted => depth += 1,
            '>' if !quoted => depth = depth.saturating_sub(1),
            ',' if !quoted && depth == 0 => {
                let piece = s[start..i].trim();
                if !piece.is_empty() {
                    out.push(piece.to_owned());
                }
                start = i + 1;
            }
            _ => {}
        }
    }
    let piece = s[start..].trim();
    if !piece.is_empty() {
        out.push(piece.to_owned());
    }
    out
}

/// A parsed Via header value: `SIP/2.0/UDP host:port;params`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Via {
    /// Transport token from the sent-protocol, e.g. `UDP`.
    pub transport: String,
    pub host: String,
    pub port: Option<u16>,
    pub params: Params,
}

impl Via {
    pub fn new(transport: &str, host: impl Into<String>, port: Option<u16>, branch: &str) -> Self {
        let mut params = Params::new();
        params.set("branch", Some(branch));
        Self {
            transport: transport.to_owned(),
            host: host.into(),
            port,
            params,
        }
    }

    pub fn branch(&self) -> Option<&str> {
        self.params.value("branch")
    }

    /// RFC 3581: record the observed source address.
    pub fn set_received(&mut self, ip: IpAddr) {
        self.params.set("received", Some(&ip.to_string()));
    }

    /// `rport` present without a value yet.
    pub fn wants_rport(&self) -> bool {
        matches!(self.params.get("rport"), Some(None))
    }

    pub fn set_rport(&mut self, port: u16) {
        self.params.set("rport", Some(&port.to_string()));
    }
}

impl fmt::Display for Via {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIP/2.0/{} {}", self.transport, self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        write!(f, "{}", self.params)
    }
}

impl FromStr for Via {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (proto, rest) = s
            .split_once(char::is_whitespace)
            .ok_or_else(|| Error::header(format!("malformed Via {s:?}")))?;
        let mut parts = proto.split('/');
        let (name, version, transport) = (parts.next(), parts.next(), parts.next());
        if name != Some("SIP") || version != Some("2.0") {
            return Err(Error::header(format!("unsupported Via protocol {proto:?}")));
        }
        let transport = transport
            .ok_or_else(|| Error::header(format!("missing Via transport in {s:?}")))?
            .to_owned();

        let rest = rest.trim();
        let (hostport, params) = match rest.split_once(';') {
            Some((hp, tail)) => (hp.trim(), Params::parse(tail)?),
            None => (rest, Params::new()),
        };
        let (host, port) = crate::uri::split_host_port(hostport)?;

        Ok(Via {
            transport,
            host: host.to_owned(),
            port,
            params,
        })
    }
}
