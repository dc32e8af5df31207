//! Incoming HTTP request type.
//!
//! A [`Request`] is fully buffered on the listener thread before it is queued,
//! so handlers running on the host thread never touch the socket.

use std::borrow::Cow;
use std::net::SocketAddr;
use std::str;

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Uri};

use crate::method::Method;

/// A read-only HTTP request handed to route handlers.
#[derive(Debug)]
pub struct Request {
    method: String,
    uri: Uri,
    path: String,
    query: Vec<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
    remote_addr: Option<SocketAddr>,
}

impl Request {
    /// Builds a request for `method` and a request target such as
    /// `/login?name=saeed`. An unparsable target falls back to `/`.
    ///
    /// Useful for exercising handlers without a socket.
    pub fn new(method: impl Into<String>, target: &str) -> Self {
        let uri = target.parse::<Uri>().unwrap_or_else(|_| Uri::from_static("/"));
        Self::from_parts(method.into(), uri, HeaderMap::new(), Bytes::new(), None)
    }

    pub(crate) fn from_parts(
        method: String,
        uri: Uri,
        headers: HeaderMap,
        body: Bytes,
        remote_addr: Option<SocketAddr>,
    ) -> Self {
        let query = uri
            .query()
            .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
            .unwrap_or_default();
        let path = decode_path(uri.path()).into_owned();
        Self { method, uri, path, query, headers, body, remote_addr }
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// The method exactly as it appeared on the request line.
    pub fn method(&self) -> &str { &self.method }

    /// The method as a routable verb, if it is one.
    pub fn verb(&self) -> Option<Method> { self.method.parse().ok() }

    pub fn uri(&self) -> &Uri { &self.uri }
    /// The percent-decoded path, as routes are matched against it.
    pub fn path(&self) -> &str { &self.path }

    /// The path exactly as it appeared on the request line.
    pub fn raw_path(&self) -> &str { self.uri.path() }

    pub fn headers(&self) -> &HeaderMap { &self.headers }
    pub fn body(&self) -> &[u8] { &self.body }
    pub fn remote_addr(&self) -> Option<SocketAddr> { self.remote_addr }

    /// Case-insensitive header lookup. Non-UTF-8 values are treated as absent.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Returns the first query parameter named `key`, percent-decoded.
    pub fn query(&self, key: &str) -> Option<&str> {
        self.query.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    pub fn query_pairs(&self) -> &[(String, String)] { &self.query }

    /// The body as a reader.
    pub fn body_reader(&self) -> &[u8] { &self.body }

    /// The body decoded as UTF-8.
    pub fn text(&self) -> Result<&str, str::Utf8Error> {
        str::from_utf8(&self.body)
    }
}

/// Percent-decodes a request path. A path that does not decode to UTF-8 is
/// kept as sent.
pub(crate) fn decode_path(raw: &str) -> Cow<'_, str> {
    urlencoding::decode(raw).unwrap_or(Cow::Borrowed(raw))
}
