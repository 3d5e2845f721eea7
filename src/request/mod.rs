//! Declarative request construction.
//!
//! [`HttpRequestBuilder`] accumulates configuration; `build` freezes it into
//! an immutable [`RequestSpec`] wrapped in an executable [`BuiltRequest`].
//! The builder stays usable afterwards and later changes never reach
//! requests that were already built.
mod body;
pub(crate) mod headers;
mod uri;

use std::{fmt, io::Read, path::PathBuf, sync::Arc, time::Duration};

pub use body::{BodyDescriptor, BodyKind, CustomBody};
pub(crate) use body::{PreparedBody, RequestBody};
use bytes::Bytes;
use http::{HeaderName, HeaderValue, Method, Version};
pub use uri::{resolve, resolve_location, ResolvedTarget, ServerInfo};

use crate::{
    caller,
    client::ClientShared,
    error::{HttpError, Result},
    executor::CallbackExecutor,
    future::{HttpCallback, ResponseFuture},
    response::{ResponseBodyConsumer, StringBodyConsumer},
};

/// Immutable description of one request.
pub struct RequestSpec<T> {
    pub(crate) method: Method,
    pub(crate) uri: String,
    pub(crate) version: Version,
    pub(crate) headers: Vec<(HeaderName, HeaderValue)>,
    pub(crate) query: Vec<(String, String)>,
    pub(crate) body: BodyDescriptor,
    pub(crate) idle_timeout: Option<Duration>,
    pub(crate) total_timeout: Option<Duration>,
    pub(crate) follow_redirects: bool,
    pub(crate) max_redirects: u32,
    pub(crate) accept_compressed: bool,
    pub(crate) keep_alive: bool,
    pub(crate) consumer: Arc<dyn ResponseBodyConsumer<Output = T>>,
    pub(crate) executor: Arc<dyn CallbackExecutor>,
}

impl<T> RequestSpec<T> {
    #[inline]
    pub fn method(&self) -> &Method {
        &self.method
    }

    #[inline]
    pub fn uri(&self) -> &str {
        &self.uri
    }

    #[inline]
    pub fn version(&self) -> Version {
        self.version
    }

    #[inline]
    pub fn headers(&self) -> &[(HeaderName, HeaderValue)] {
        &self.headers
    }

    #[inline]
    pub fn query_parameters(&self) -> &[(String, String)] {
        &self.query
    }

    #[inline]
    pub fn body(&self) -> &BodyDescriptor {
        &self.body
    }

    #[inline]
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout
    }

    #[inline]
    pub fn total_timeout(&self) -> Option<Duration> {
        self.total_timeout
    }

    #[inline]
    pub fn follow_redirects(&self) -> bool {
        self.follow_redirects
    }

    #[inline]
    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    #[inline]
    pub fn accept_compressed_response(&self) -> bool {
        self.accept_compressed
    }
}

impl<T> fmt::Debug for RequestSpec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestSpec")
            .field("method", &self.method)
            .field("uri", &self.uri)
            .field("version", &self.version)
            .field("headers", &self.headers)
            .field("query", &self.query)
            .field("body", &self.body)
            .finish_non_exhaustive()
    }
}

/// Fluent, mutable request configuration.
pub struct HttpRequestBuilder {
    shared: Arc<ClientShared>,
    method: Method,
    uri: String,
    version: Version,
    headers: Vec<(HeaderName, HeaderValue)>,
    query: Vec<(String, String)>,
    body: BodyDescriptor,
    idle_timeout: Option<Duration>,
    total_timeout: Option<Duration>,
    follow_redirects: bool,
    max_redirects: u32,
    accept_compressed: bool,
    keep_alive: bool,
    executor: Option<Arc<dyn CallbackExecutor>>,
    error: Option<HttpError>,
}

impl HttpRequestBuilder {
    pub(crate) fn new(shared: Arc<ClientShared>, method: Method, uri: impl Into<String>) -> Self {
        let config = &shared.config;
        Self {
            method,
            uri: uri.into(),
            version: Version::HTTP_11,
            headers: Vec::new(),
            query: Vec::new(),
            body: BodyDescriptor {
                body: None,
                content_type: None,
                charset: config.request_body_charset.clone(),
            },
            idle_timeout: config.idle_timeout(),
            total_timeout: config.total_request_timeout(),
            follow_redirects: config.follow_redirects,
            max_redirects: config.max_redirects,
            accept_compressed: config.accept_compressed_response,
            keep_alive: config.keep_alive,
            executor: None,
            error: None,
            shared,
        }
    }

    fn fail(&mut self, error: HttpError) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    fn set_body(&mut self, body: RequestBody) -> &mut Self {
        if let Some(existing) = self.body.kind() {
            let both_forms = existing == BodyKind::Form && body.kind() == BodyKind::Form;
            if !both_forms {
                self.fail(HttpError::Configuration(format!(
                    "already defined request body as type {existing}"
                )));
                return self;
            }
        }
        self.body.body = Some(body);
        self
    }

    /// HTTP/1.0 or HTTP/1.1.
    pub fn version(&mut self, version: Version) -> &mut Self {
        if version != Version::HTTP_10 && version != Version::HTTP_11 {
            self.fail(HttpError::Configuration(format!(
                "unsupported protocol version {version:?}"
            )));
        } else {
            self.version = version;
        }
        self
    }

    pub fn add_header(&mut self, name: &str, value: &str) -> &mut Self {
        let name = HeaderName::from_bytes(name.as_bytes());
        let value = HeaderValue::from_str(value);
        match (name, value) {
            (Ok(name), Ok(value)) => self.headers.push((name, value)),
            (Err(e), _) => self.fail(HttpError::Configuration(format!("invalid header name: {e}"))),
            (_, Err(e)) => {
                self.fail(HttpError::Configuration(format!("invalid header value: {e}")))
            }
        }
        self
    }

    pub fn add_headers<'a>(
        &mut self,
        headers: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> &mut Self {
        for (name, value) in headers {
            self.add_header(name, value);
        }
        self
    }

    pub fn add_query_parameter(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> &mut Self {
        self.query.push((name.into(), value.into()));
        self
    }

    pub fn add_query_parameters<K: Into<String>, V: Into<String>>(
        &mut self,
        params: impl IntoIterator<Item = (K, V)>,
    ) -> &mut Self {
        self.query
            .extend(params.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn content(&mut self, content: impl Into<Bytes>) -> &mut Self {
        self.set_body(RequestBody::Bytes(content.into()))
    }

    pub fn content_file(&mut self, path: impl Into<PathBuf>) -> &mut Self {
        self.set_body(RequestBody::File(path.into()))
    }

    /// Body of unknown length, sent chunked. The reader is drained on the
    /// caller thread when the request is executed and can only be sent once.
    pub fn content_stream(&mut self, reader: impl Read + Send + 'static) -> &mut Self {
        self.set_body(RequestBody::stream(reader))
    }

    pub fn content_custom(&mut self, body: impl CustomBody) -> &mut Self {
        self.set_body(RequestBody::Custom(Arc::new(body)))
    }

    pub fn add_form_parameter(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> &mut Self {
        self.add_form_parameters([(name.into(), value.into())])
    }

    pub fn add_form_parameters<K: Into<String>, V: Into<String>>(
        &mut self,
        params: impl IntoIterator<Item = (K, V)>,
    ) -> &mut Self {
        let mut merged = match &self.body.body {
            Some(RequestBody::Form(existing)) => existing.clone(),
            _ => Vec::new(),
        };
        merged.extend(params.into_iter().map(|(k, v)| (k.into(), v.into())));
        self.set_body(RequestBody::Form(merged))
    }

    pub fn content_type(&mut self, content_type: impl Into<String>) -> &mut Self {
        self.body.content_type = Some(content_type.into());
        self
    }

    pub fn body_charset(&mut self, charset: impl Into<String>) -> &mut Self {
        self.body.charset = Some(charset.into());
        self
    }

    /// `Duration::ZERO` disables the idle timeout.
    pub fn idle_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.idle_timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    /// `Duration::ZERO` disables the total timeout.
    pub fn total_request_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.total_timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    pub fn follow_redirects(&mut self, follow: bool) -> &mut Self {
        self.follow_redirects = follow;
        self
    }

    pub fn max_redirects(&mut self, max: u32) -> &mut Self {
        self.max_redirects = max;
        self
    }

    pub fn accept_compressed_response(&mut self, accept: bool) -> &mut Self {
        self.accept_compressed = accept;
        self
    }

    pub fn keep_alive(&mut self, keep_alive: bool) -> &mut Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Where callbacks for this request run. Defaults to the client's executor.
    pub fn callback_executor(&mut self, executor: Arc<dyn CallbackExecutor>) -> &mut Self {
        self.executor = Some(executor);
        self
    }

    /// Freeze into a request whose body is decoded as a `String`.
    pub fn build(&self) -> Result<BuiltRequest<String>> {
        self.build_with(StringBodyConsumer)
    }

    /// Freeze into a request whose body is decoded by `consumer`.
    pub fn build_with<C: ResponseBodyConsumer>(
        &self,
        consumer: C,
    ) -> Result<BuiltRequest<C::Output>> {
        if let Some(e) = &self.error {
            return Err(e.clone());
        }
        let spec = RequestSpec {
            method: self.method.clone(),
            uri: self.uri.clone(),
            version: self.version,
            headers: self.headers.clone(),
            query: self.query.clone(),
            body: self.body.clone(),
            idle_timeout: self.idle_timeout,
            total_timeout: self.total_timeout,
            follow_redirects: self.follow_redirects,
            max_redirects: self.max_redirects,
            accept_compressed: self.accept_compressed,
            keep_alive: self.keep_alive,
            consumer: Arc::new(consumer),
            executor: self
                .executor
                .clone()
                .unwrap_or_else(|| self.shared.callback_executor.clone()),
        };
        Ok(BuiltRequest {
            spec: Arc::new(spec),
            shared: self.shared.clone(),
        })
    }
}

/// A frozen request that can be executed any number of times.
pub struct BuiltRequest<T> {
    spec: Arc<RequestSpec<T>>,
    shared: Arc<ClientShared>,
}

impl<T> Clone for BuiltRequest<T> {
    fn clone(&self) -> Self {
        Self {
            spec: self.spec.clone(),
            shared: self.shared.clone(),
        }
    }
}

impl<T: Send + 'static> BuiltRequest<T> {
    #[inline]
    pub fn spec(&self) -> &RequestSpec<T> {
        &self.spec
    }

    /// Submit without blocking; the outcome arrives through the future.
    pub fn execute(&self) -> ResponseFuture<T> {
        caller::execute(&self.shared, self.spec.clone(), None)
    }

    /// Submit and also deliver the outcome to `callback` on the callback
    /// executor before the future resolves.
    pub fn execute_with_callback(&self, callback: impl HttpCallback<T>) -> ResponseFuture<T> {
        caller::execute(&self.shared, self.spec.clone(), Some(Arc::new(callback)))
    }
}

impl<T> fmt::Debug for BuiltRequest<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.spec.fmt(f)
    }
}
