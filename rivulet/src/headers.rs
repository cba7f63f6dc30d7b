//! Request and response header types.
//!
//! Headers are an ordered mapping of name to a list of values. Names keep the
//! case they were given; lookups are case-insensitive.

use std::fmt;

/// Ordered header map (name -> values).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: Vec<(String, Vec<String>)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a value, merging into an existing entry of the same name.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.position(&name) {
            Some(idx) => self.entries[idx].1.push(value),
            None => self.entries.push((name, vec![value])),
        }
    }

    /// Replace all values for `name`, keeping its position if present.
    pub fn set(&mut self, name: impl Into<String>, values: Vec<String>) {
        let name = name.into();
        match self.position(&name) {
            Some(idx) => self.entries[idx].1 = values,
            None => self.entries.push((name, values)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&[String]> {
        self.position(name).map(|idx| self.entries[idx].1.as_slice())
    }

    /// First value for `name`.
    pub fn first(&self, name: &str) -> Option<&str> {
        self.get(name)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    pub fn remove(&mut self, name: &str) -> Option<Vec<String>> {
        self.position(name).map(|idx| self.entries.remove(idx).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries
            .iter()
            .map(|(name, values)| (name.as_str(), values.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|(k, _)| k.eq_ignore_ascii_case(name))
    }
}

impl FromIterator<(String, String)> for HeaderMap {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        let mut map = HeaderMap::new();
        for (name, value) in iter {
            map.append(name, value);
        }
        map
    }
}

/// Request method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Patch,
    Options,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Patch => "PATCH",
            Method::Options => "OPTIONS",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request scheme. `Https` upstreams are reached over TLS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }

    pub fn is_tls(self) -> bool {
        self == Scheme::Https
    }
}

/// Request pseudo-headers plus the header map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHeaders {
    method: Method,
    scheme: Scheme,
    authority: String,
    path: String,
    headers: HeaderMap,
}

impl RequestHeaders {
    pub fn method(&self) -> Method {
        self.method
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// `host[:port]` of the upstream.
    pub fn authority(&self) -> &str {
        &self.authority
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }
}

/// Builder for [`RequestHeaders`].
///
/// ```
/// use rivulet::{Method, RequestHeadersBuilder, Scheme};
///
/// let headers = RequestHeadersBuilder::new(Method::Get, Scheme::Http, "127.0.0.1:8080", "/")
///     .add("accept", "text/plain")
///     .build();
/// assert_eq!(headers.headers().first("Accept"), Some("text/plain"));
/// ```
#[derive(Debug, Clone)]
pub struct RequestHeadersBuilder {
    inner: RequestHeaders,
}

impl RequestHeadersBuilder {
    pub fn new(
        method: Method,
        scheme: Scheme,
        authority: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        RequestHeadersBuilder {
            inner: RequestHeaders {
                method,
                scheme,
                authority: authority.into(),
                path: path.into(),
                headers: HeaderMap::new(),
            },
        }
    }

    pub fn add(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.inner.headers.append(name, value);
        self
    }

    pub fn set(mut self, name: impl Into<String>, values: Vec<String>) -> Self {
        self.inner.headers.set(name, values);
        self
    }

    pub fn build(self) -> RequestHeaders {
        self.inner
    }
}

/// Response status and headers delivered with the headers event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHeaders {
    status: u16,
    headers: HeaderMap,
}

impl ResponseHeaders {
    pub(crate) fn new(status: u16, headers: HeaderMap) -> Self {
        ResponseHeaders { status, headers }
    }

    pub fn http_status(&self) -> u16 {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }
}

/// Split `host[:port]` (or `[v6]:port`) into host and port.
pub(crate) fn split_authority(authority: &str, default_port: u16) -> Option<(String, u16)> {
    let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
        let (host, after) = rest.split_once(']')?;
        let port = match after {
            "" => default_port,
            _ => after.strip_prefix(':')?.parse().ok()?,
        };
        (host, port)
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') => (host, port.parse().ok()?),
            Some(_) => return None,
            None => (authority, default_port),
        }
    };
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port))
}
