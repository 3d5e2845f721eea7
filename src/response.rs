use std::{fmt, marker::PhantomData};

use bytes::Bytes;
use http::{HeaderMap, StatusCode, Version};
use serde::de::DeserializeOwned;

use crate::error::{HttpError, Result};

/// Status line and headers of a response.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub version: Version,
    pub headers: HeaderMap,
}

impl ResponseHead {
    /// The peer asked to close the channel after this response.
    pub fn connection_close(&self) -> bool {
        let tokens = self
            .headers
            .get_all(http::header::CONNECTION)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .map(str::trim);
        let mut close = false;
        let mut keep_alive = false;
        for token in tokens {
            close |= token.eq_ignore_ascii_case("close");
            keep_alive |= token.eq_ignore_ascii_case("keep-alive");
        }
        close || (self.version == Version::HTTP_10 && !keep_alive)
    }
}

/// A completed response with a body decoded by a [`ResponseBodyConsumer`].
#[derive(Clone)]
pub struct HttpResponse<T> {
    head: ResponseHead,
    body: T,
}

impl<T> HttpResponse<T> {
    pub(crate) fn new(head: ResponseHead, body: T) -> Self {
        Self { head, body }
    }

    #[inline]
    pub fn status(&self) -> StatusCode {
        self.head.status
    }

    #[inline]
    pub fn version(&self) -> Version {
        self.head.version
    }

    #[inline]
    pub fn headers(&self) -> &HeaderMap {
        &self.head.headers
    }

    /// First value of `name`, if present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.head.headers.get(name).and_then(|v| v.to_str().ok())
    }

    #[inline]
    pub fn body(&self) -> &T {
        &self.body
    }

    #[inline]
    pub fn into_body(self) -> T {
        self.body
    }
}

impl<T: fmt::Debug> fmt::Debug for HttpResponse<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.head.status)
            .field("version", &self.head.version)
            .field("headers", &self.head.headers)
            .field("body", &self.body)
            .finish()
    }
}

/// Turns the raw, already de-framed and decompressed, response body into a
/// typed value. Runs on the I/O thread, so it must not block.
pub trait ResponseBodyConsumer: Send + Sync + 'static {
    type Output: Send + 'static;

    fn consume(&self, head: &ResponseHead, body: Bytes) -> Result<Self::Output>;
}

/// Decodes the body as UTF-8, replacing invalid sequences.
#[derive(Debug, Default, Clone, Copy)]
pub struct StringBodyConsumer;

impl ResponseBodyConsumer for StringBodyConsumer {
    type Output = String;

    fn consume(&self, _head: &ResponseHead, body: Bytes) -> Result<String> {
        Ok(match String::from_utf8(body.to_vec()) {
            Ok(s) => s,
            Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
        })
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BytesBodyConsumer;

impl ResponseBodyConsumer for BytesBodyConsumer {
    type Output = Bytes;

    #[inline]
    fn consume(&self, _head: &ResponseHead, body: Bytes) -> Result<Bytes> {
        Ok(body)
    }
}

/// Reads the body to the end and throws it away.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardBodyConsumer;

impl ResponseBodyConsumer for DiscardBodyConsumer {
    type Output = ();

    #[inline]
    fn consume(&self, _head: &ResponseHead, _body: Bytes) -> Result<()> {
        Ok(())
    }
}

/// Deserializes the body as JSON.
pub struct JsonBodyConsumer<T>(PhantomData<fn() -> T>);

impl<T> JsonBodyConsumer<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for JsonBodyConsumer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for JsonBodyConsumer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("JsonBodyConsumer")
    }
}

impl<T: DeserializeOwned + Send + 'static> ResponseBodyConsumer for JsonBodyConsumer<T> {
    type Output = T;

    fn consume(&self, _head: &ResponseHead, body: Bytes) -> Result<T> {
        serde_json::from_slice(&body).map_err(|e| HttpError::BodyConsumer(e.to_string()))
    }
}
