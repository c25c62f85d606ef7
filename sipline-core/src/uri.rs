use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use crate::addr::TransportProto;
use crate::error::{Error, Result};

/// Ordered `;name=value` parameter list with case-insensitive names.
///
/// Used for URI parameters, Via parameters and header parameters alike.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params(Vec<(String, Option<String>)>);

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True if a parameter with this name is present, valued or not.
    pub fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|(n, _)| n.eq_ignore_ascii_case(name))
    }

    /// `Some(Some(v))` for `;name=v`, `Some(None)` for a bare `;name`.
    pub fn get(&self, name: &str) -> Option<Option<&str>> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_deref())
    }

    /// The value of `;name=value`, if the parameter carries one.
    pub fn value(&self, name: &str) -> Option<&str> {
        self.get(name).flatten()
    }

    /// Replace the first parameter of this name, or append it.
    pub fn set(&mut self, name: &str, value: Option<&str>) {
        let value = value.map(str::to_owned);
        if let Some(slot) = self.0.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(name)) {
            slot.1 = value;
        } else {
            self.0.push((name.to_owned(), value));
        }
    }

    pub fn remove(&mut self, name: &str) {
        self.0.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    /// Parse `a=b;c;d=e` (no leading semicolon).
    pub fn parse(s: &str) -> Result<Params> {
        let mut params = Params::new();
        for piece in s.split(';') {
            let piece = piece.trim();
            if piece.is_empty() {
                continue;
            }
            match piece.split_once('=') {
                Some((n, v)) => params.0.push((n.trim().to_owned(), Some(v.trim().to_owned()))),
                None => params.0.push((piece.to_owned(), None)),
            }
        }
        Ok(params)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_deref()))
    }
}

impl fmt::Display for Params {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.0 {
            match value {
                Some(v) => write!(f, ";{name}={v}")?,
                None => write!(f, ";{name}")?,
            }
        }
        Ok(())
    }
}

/// URI scheme; `sips:` forces TLS end to end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Sip,
    Sips,
}

impl Scheme {
    pub fn default_proto(self) -> TransportProto {
        match self {
            Scheme::Sip => TransportProto::Udp,
            Scheme::Sips => TransportProto::Tls,
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Scheme::Sip => "sip",
            Scheme::Sips => "sips",
        })
    }
}

impl FromStr for Scheme {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sip" => Ok(Scheme::Sip),
            "sips" => Ok(Scheme::Sips),
            other => Err(Error::uri(format!("unknown scheme {other:?}"))),
        }
    }
}

/// A SIP or SIPS URI: `sip:user@host:port;params`.
///
/// URI headers (`?key=value`) are not retained; nothing at this layer
/// consumes them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipUri {
    pub scheme: Scheme,
    pub user: Option<String>,
    pub host: String,
    pub port: Option<u16>,
    pub params: Params,
}

impl SipUri {
    pub fn new(scheme: Scheme, host: impl Into<String>, port: Option<u16>) -> Self {
        Self {
            scheme,
            user: None,
            host: host.into(),
            port,
            params: Params::new(),
        }
    }

    /// The host part as an IP literal, if it is one. Brackets around an
    /// IPv6 literal are stripped.
    pub fn host_ip(&self) -> Option<IpAddr> {
        let host = self.host.trim_start_matches('[').trim_end_matches(']');
        host.parse().ok()
    }

    pub fn port_or_default(&self, proto: TransportProto) -> u16 {
        self.port.unwrap_or_else(|| proto.default_port())
    }

    /// The `;transport=` parameter, when present and recognized.
    pub fn transport_param(&self) -> Option<TransportProto> {
        self.params.value("transport")?.parse().ok()
    }

    /// Canonical address-of-record: `user@host` with the host lowercased,
    /// ports and parameters dropped.
    pub fn aor(&self) -> String {
        let host = self.host.to_ascii_lowercase();
        match &self.user {
            Some(user) => format!("{user}@{host}"),
            None => host,
        }
    }
}

impl fmt::Display for SipUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.scheme)?;
        if let Some(user) = &self.user {
            write!(f, "{user}@")?;
        }
        f.write_str(&self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        write!(f, "{}", self.params)
    }
}

impl FromStr for SipUri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (scheme, rest) = s
            .split_once(':')
            .ok_or_else(|| Error::uri(format!("missing scheme in {s:?}")))?;
        let scheme: Scheme = scheme.parse()?;

        // Drop URI headers.
        let rest = rest.split('?').next().unwrap_or(rest);
        let (core, params) = match rest.split_once(';') {
            Some((core, tail)) => (core, Params::parse(tail)?),
            None => (rest, Params::new()),
        };

        let (user, hostport) = match core.rsplit_once('@') {
            Some((user, hostport)) => (Some(user.to_owned()), hostport),
            None => (None, core),
        };

        let (host, port) = split_host_port(hostport)?;
        if host.is_empty() {
            return Err(Error::uri(format!("empty host in {s:?}")));
        }

        Ok(SipUri {
            scheme,
            user,
            host: host.to_owned(),
            port,
            params,
        })
    }
}

/// Split `host[:port]`, leaving IPv6 brackets on the host.
pub(crate) fn split_host_port(s: &str) -> Result<(&str, Option<u16>)> {
    let s = s.trim();
    if let Some(end) = s.strip_prefix('[').and_then(|_| s.find(']')) {
        let host = &s[..=end];
        let rest = &s[end + 1..];
        let port = match rest.strip_prefix(':') {
            Some(p) => Some(parse_port(p)?),
            None if rest.is_empty() => None,
            None => return Err(Error::uri(format!("trailing junk after {host:?}"))),
        };
        return Ok((host, port));
    }
    match s.rsplit_once(':') {
        Some((host, port)) => Ok((host, Some(parse_port(port)?))),
        None => Ok((s, None)),
    }
}

fn parse_port(s: &str) -> Result<u16> {
    s.parse()
        .map_err(|_| Error::uri(format!("invalid port {s:?}")))
}

/// A `name-addr` as it appears in From / To / Contact / Route headers:
/// optional display name, a URI, and header parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameAddr {
    pub display: Option<String>,
    pub uri: SipUri,
    pub params: Params,
}

impl NameAddr {
    pub fn new(uri: SipUri) -> Self {
        Self {
            display: None,
            uri,
            params: Params::new(),
        }
    }

    /// Parse either `"Name" <sip:u@h>;p=v` or the bare `sip:u@h;p=v` form.
    /// Without angle brackets the parameters after the first semicolon are
    /// header parameters, per RFC 3261 §20.10.
    pub fn parse(s: &str) -> Result<NameAddr> {
        let s = s.trim();
        if let Some(open) = s.find('<') {
            let close = s[open..]
                .find('>')
                .map(|i| open + i)
                .ok_or_else(|| Error::header(format!("unterminated name-addr {s:?}")))?;
            let display = s[..open].trim();
            let display = display.trim_matches('"').trim();
            let uri: SipUri = s[open + 1..close].parse()?;
            let tail = s[close + 1..].trim_start_matches(';');
            let params = Params::parse(tail)?;
            Ok(NameAddr {
                display: (!display.is_empty()).then(|| display.to_owned()),
                uri,
                params,
            })
        } else {
            let (core, tail) = match s.split_once(';') {
                Some((core, tail)) => (core, tail),
                None => (s, ""),
            };
            Ok(NameAddr {
                display: None,
                uri: core.parse()?,
                params: Params::parse(tail)?,
            })
        }
    }

    /// The `;expires=` header parameter, parsed.
    pub fn expires(&self) -> Option<u64> {
        self.params.value("expires")?.parse().ok()
    }
}

impl fmt::Display for NameAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(display) = &self.display {
            write!(f, "\"{display}\" ")?;
        }
        write!(f, "<{}>{}", self.uri, self.params)
    }
}
