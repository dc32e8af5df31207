//! Outgoing HTTP response type.
//!
//! A [`Response`] is filled in by a handler on the host thread and delivered
//! to the waiting connection when it is closed. Once closed, every further
//! status change, header write or body write fails with
//! [`Error::ResponseClosed`].

use std::io;

use bytes::Bytes;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::StatusCode;
use http_body_util::Full;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::Error;

/// The wire form handed back to hyper.
pub(crate) type HttpResponse = http::Response<Full<Bytes>>;

/// Receiving end of a response that is still being written.
pub(crate) type PendingResponse = oneshot::Receiver<HttpResponse>;

// ── ContentType ───────────────────────────────────────────────────────────────

/// Common content-type values for [`Response::set_content_type`].
pub enum ContentType {
    Html,         // text/html; charset=utf-8
    Json,         // application/json
    OctetStream,  // application/octet-stream
    Text,         // text/plain; charset=utf-8
}

impl ContentType {
    fn as_static(&self) -> HeaderValue {
        HeaderValue::from_static(match self {
            Self::Html        => "text/html; charset=utf-8",
            Self::Json        => "application/json",
            Self::OctetStream => "application/octet-stream",
            Self::Text        => "text/plain; charset=utf-8",
        })
    }
}

// ── Response ─────────────────────────────────────────────────────────────────

/// A mutable HTTP response: status, headers and a buffered output stream.
///
/// ```rust
/// use std::io::Write;
/// use tickserve::{ContentType, Response};
///
/// let mut res = Response::new();
/// res.set_content_type(ContentType::Text).unwrap();
/// res.write_all(b"hello").unwrap();
/// res.close().unwrap();
/// assert!(res.write_all(b"late").is_err());
/// ```
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    body: Vec<u8>,
    closed: bool,
    reply: Option<oneshot::Sender<HttpResponse>>,
}

impl Default for Response {
    fn default() -> Self { Self::new() }
}

impl Response {
    /// A detached response (`200 OK`, no headers, empty body).
    ///
    /// Closing it only marks it closed; nothing is sent anywhere. Use it to
    /// exercise handlers directly.
    pub fn new() -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Vec::new(),
            closed: false,
            reply: None,
        }
    }

    /// A response wired to a connection waiting on the returned receiver.
    pub(crate) fn channel() -> (Self, PendingResponse) {
        let (tx, rx) = oneshot::channel();
        let mut res = Self::new();
        res.reply = Some(tx);
        (res, rx)
    }

    pub fn status(&self) -> StatusCode { self.status }
    pub fn headers(&self) -> &HeaderMap { &self.headers }
    pub fn body(&self) -> &[u8] { &self.body }
    pub fn is_closed(&self) -> bool { self.closed }

    pub fn set_status(&mut self, status: StatusCode) -> Result<(), Error> {
        self.ensure_open()?;
        self.status = status;
        Ok(())
    }

    /// Sets `name` to `value`, replacing any previous values.
    pub fn set_header(&mut self, name: &str, value: &str) -> Result<(), Error> {
        let (name, value) = parse_header(name, value)?;
        self.insert_header(name, value)
    }

    /// Adds a value for `name`, keeping the previous ones.
    pub fn append_header(&mut self, name: &str, value: &str) -> Result<(), Error> {
        self.ensure_open()?;
        let (name, value) = parse_header(name, value)?;
        self.headers.append(name, value);
        Ok(())
    }

    pub(crate) fn insert_header(&mut self, name: HeaderName, value: HeaderValue) -> Result<(), Error> {
        self.ensure_open()?;
        self.headers.insert(name, value);
        Ok(())
    }

    pub fn set_content_type(&mut self, content_type: ContentType) -> Result<(), Error> {
        self.insert_header(header::CONTENT_TYPE, content_type.as_static())
    }

    /// Finishes the response and sends it to the client.
    ///
    /// Closing twice is an error. If the client has already gone away the
    /// response is dropped silently.
    pub fn close(&mut self) -> Result<(), Error> {
        self.ensure_open()?;
        self.closed = true;
        if let Some(reply) = self.reply.take() {
            let mut res = http::Response::new(Full::new(Bytes::from(std::mem::take(&mut self.body))));
            *res.status_mut() = self.status;
            *res.headers_mut() = std::mem::take(&mut self.headers);
            if reply.send(res).is_err() {
                debug!(status = %self.status, "client disconnected before the response was sent");
            }
        }
        Ok(())
    }

    // ── Shortcuts: each writes a complete response and closes it ──────────────

    /// `200 OK`, `text/plain`.
    pub fn write_text(&mut self, text: &str) -> Result<(), Error> {
        self.finish(StatusCode::OK, ContentType::Text, text.as_bytes())
    }

    /// `200 OK`, `application/json`. The body is sent as given.
    pub fn write_json(&mut self, json: impl AsRef<[u8]>) -> Result<(), Error> {
        self.finish(StatusCode::OK, ContentType::Json, json.as_ref())
    }

    /// `200 OK` with no body.
    pub fn ok(&mut self) -> Result<(), Error> {
        self.set_status(StatusCode::OK)?;
        self.close()
    }

    /// `400 Bad Request`, with an optional plain-text message.
    pub fn bad_request(&mut self, message: Option<&str>) -> Result<(), Error> {
        match message {
            Some(m) => self.finish(StatusCode::BAD_REQUEST, ContentType::Text, m.as_bytes()),
            None => {
                self.set_status(StatusCode::BAD_REQUEST)?;
                self.close()
            }
        }
    }

    /// `500 Internal Server Error` with a plain-text message.
    pub fn internal_error(&mut self, message: &str) -> Result<(), Error> {
        self.finish(StatusCode::INTERNAL_SERVER_ERROR, ContentType::Text, message.as_bytes())
    }

    fn finish(&mut self, status: StatusCode, content_type: ContentType, body: &[u8]) -> Result<(), Error> {
        self.set_status(status)?;
        self.set_content_type(content_type)?;
        self.body.extend_from_slice(body);
        self.close()
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.closed { Err(Error::ResponseClosed) } else { Ok(()) }
    }
}

/// The response body is its output stream.
impl io::Write for Response {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.ensure_open().map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e))?;
        self.body.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> { Ok(()) }
}

/// `404 Not Found`, empty body. Written by the listener for unmatched requests.
pub(crate) fn not_found() -> HttpResponse {
    let mut res = http::Response::new(Full::new(Bytes::new()));
    *res.status_mut() = StatusCode::NOT_FOUND;
    res
}

fn parse_header(name: &str, value: &str) -> Result<(HeaderName, HeaderValue), Error> {
    let parsed_name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|_| Error::InvalidHeader(name.to_owned()))?;
    let parsed_value = HeaderValue::from_str(value)
        .map_err(|_| Error::InvalidHeader(format!("{name}: {value}")))?;
    Ok((parsed_name, parsed_value))
}
