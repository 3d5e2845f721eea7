//! The client facade. An [`HttpClient`] owns the I/O threads, the callback
//! executor, the back pressure gate and the event bus; every request and
//! WebSocket session built from it shares them.
use std::{
    fmt,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use http::Method;
use smol_str::SmolStr;

use crate::{
    backpressure::{BackPressure, NoBackPressure},
    config::ClientConfig,
    connectors::ResolveOverrides,
    error::{HttpError, Result},
    event::{EventBus, EventEmitter, LoggingEventBus},
    executor::{CallbackExecutor, ThreadPoolExecutor},
    request::HttpRequestBuilder,
    runtime::{IoSettings, IoWorkers},
    websocket::WebSocketBuilder,
};

const DEFAULT_THREAD_NAME: &str = "monoio-client";

/// State shared by a client and everything created from it.
pub(crate) struct ClientShared {
    pub(crate) config: ClientConfig,
    pub(crate) back_pressure: Arc<dyn BackPressure>,
    pub(crate) event_bus: Arc<dyn EventBus>,
    pub(crate) callback_executor: Arc<dyn CallbackExecutor>,
    pub(crate) workers: IoWorkers,
    pub(crate) user_agent: Arc<str>,
    owned_executor: Option<Arc<ThreadPoolExecutor>>,
    sequence: Arc<AtomicU64>,
    ids: AtomicU64,
}

impl ClientShared {
    #[inline]
    pub(crate) fn next_id(&self) -> u64 {
        self.ids.fetch_add(1, Ordering::Relaxed)
    }

    /// An emitter for a fresh execution or session id.
    pub(crate) fn emitter(&self) -> EventEmitter {
        EventEmitter::new(self.event_bus.clone(), self.sequence.clone(), self.next_id())
    }

    fn shutdown(&self) {
        self.workers.shutdown();
        if let Some(executor) = &self.owned_executor {
            executor.shutdown();
        }
    }
}

pub struct HttpClientBuilder {
    config: ClientConfig,
    back_pressure: Option<Arc<dyn BackPressure>>,
    event_bus: Option<Arc<dyn EventBus>>,
    callback_executor: Option<Arc<dyn CallbackExecutor>>,
    overrides: ResolveOverrides,
    thread_name: String,
}

impl Default for HttpClientBuilder {
    fn default() -> Self {
        Self {
            config: ClientConfig::default(),
            back_pressure: None,
            event_bus: None,
            callback_executor: None,
            overrides: ResolveOverrides::new(),
            thread_name: DEFAULT_THREAD_NAME.to_string(),
        }
    }
}

impl HttpClientBuilder {
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn io_threads(mut self, threads: usize) -> Self {
        self.config.io_threads = threads;
        self
    }

    pub fn callback_threads(mut self, threads: usize) -> Self {
        self.config.callback_threads = threads;
        self
    }

    pub fn back_pressure(mut self, back_pressure: impl BackPressure + 'static) -> Self {
        self.back_pressure = Some(Arc::new(back_pressure));
        self
    }

    pub fn event_bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    /// Run callbacks on `executor` instead of the client's own thread pool.
    /// The client does not shut a supplied executor down.
    pub fn callback_executor(mut self, executor: Arc<dyn CallbackExecutor>) -> Self {
        self.callback_executor = Some(executor);
        self
    }

    /// Connect to `addr` whenever a request targets `host:port`, bypassing DNS.
    pub fn resolve(mut self, host: &str, port: u16, addr: SocketAddr) -> Self {
        let host = host.trim_start_matches('[').trim_end_matches(']');
        self.overrides
            .insert((SmolStr::new(host.to_ascii_lowercase()), port), addr);
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    /// Prefix for the names of the I/O and callback threads.
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    pub fn build(self) -> Result<HttpClient> {
        self.config.validate()?;
        let (callback_executor, owned_executor) = match self.callback_executor {
            Some(executor) => (executor, None),
            None => {
                let pool = Arc::new(
                    ThreadPoolExecutor::new(
                        self.config.callback_threads,
                        &format!("{}-callback", self.thread_name),
                    )
                    .map_err(|e| {
                        HttpError::Configuration(format!("cannot start callback threads: {e}"))
                    })?,
                );
                (pool.clone() as Arc<dyn CallbackExecutor>, Some(pool))
            }
        };
        let settings = IoSettings {
            overrides: Arc::new(self.overrides),
            connect_timeout: self.config.connect_timeout(),
            max_idle: self.config.max_idle_connections_per_key,
            idle_ttl: self.config.idle_connection_ttl(),
        };
        let workers = IoWorkers::start(self.config.io_threads, &self.thread_name, settings)
            .map_err(|e| HttpError::Configuration(format!("cannot start i/o threads: {e}")))?;
        #[cfg(feature = "logging")]
        tracing::debug!(
            "client started with {} i/o threads and {} callback threads",
            self.config.io_threads,
            self.config.callback_threads
        );

        let shared = ClientShared {
            user_agent: Arc::from(self.config.user_agent.as_str()),
            back_pressure: self
                .back_pressure
                .unwrap_or_else(|| Arc::new(NoBackPressure::new())),
            event_bus: self.event_bus.unwrap_or_else(|| Arc::new(LoggingEventBus)),
            callback_executor,
            workers,
            owned_executor,
            sequence: Arc::new(AtomicU64::new(0)),
            ids: AtomicU64::new(0),
            config: self.config,
        };
        Ok(HttpClient {
            shared: Arc::new(shared),
        })
    }
}

/// Entry point for building and executing HTTP requests and WebSocket
/// sessions.
///
/// Dropping the client (or calling [`shutdown`](Self::shutdown)) cancels
/// everything still in flight with [`HttpError::ClientShutdown`].
pub struct HttpClient {
    shared: Arc<ClientShared>,
}

impl HttpClient {
    #[inline]
    pub fn builder() -> HttpClientBuilder {
        HttpClientBuilder::default()
    }

    /// A client with the default configuration.
    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    pub fn create_request(&self, method: Method, uri: impl Into<String>) -> HttpRequestBuilder {
        HttpRequestBuilder::new(self.shared.clone(), method, uri)
    }

    #[inline]
    pub fn create_get(&self, uri: impl Into<String>) -> HttpRequestBuilder {
        self.create_request(Method::GET, uri)
    }

    #[inline]
    pub fn create_post(&self, uri: impl Into<String>) -> HttpRequestBuilder {
        self.create_request(Method::POST, uri)
    }

    #[inline]
    pub fn create_put(&self, uri: impl Into<String>) -> HttpRequestBuilder {
        self.create_request(Method::PUT, uri)
    }

    #[inline]
    pub fn create_delete(&self, uri: impl Into<String>) -> HttpRequestBuilder {
        self.create_request(Method::DELETE, uri)
    }

    #[inline]
    pub fn create_head(&self, uri: impl Into<String>) -> HttpRequestBuilder {
        self.create_request(Method::HEAD, uri)
    }

    #[inline]
    pub fn create_options(&self, uri: impl Into<String>) -> HttpRequestBuilder {
        self.create_request(Method::OPTIONS, uri)
    }

    #[inline]
    pub fn create_patch(&self, uri: impl Into<String>) -> HttpRequestBuilder {
        self.create_request(Method::PATCH, uri)
    }

    pub fn create_web_socket(&self, uri: impl Into<String>) -> WebSocketBuilder {
        WebSocketBuilder::new(self.shared.clone(), uri)
    }

    /// Executions currently holding a back pressure slot.
    #[inline]
    pub fn in_flight(&self) -> usize {
        self.shared.back_pressure.in_flight()
    }

    #[inline]
    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    /// Cancel live executions, stop the I/O threads and the client-owned
    /// callback threads. Requests executed afterwards fail with
    /// `ClientShutdown`. Idempotent.
    pub fn shutdown(&self) {
        self.shared.shutdown();
    }
}

impl Drop for HttpClient {
    fn drop(&mut self) {
        self.shared.shutdown();
    }
}

impl fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpClient")
            .field("config", &self.shared.config)
            .field("back_pressure", &self.shared.back_pressure.describe())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}
