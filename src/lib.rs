//! Asynchronous HTTP/1.1 and WebSocket client on the monoio runtime.
//!
//! Requests are described with an [`HttpRequestBuilder`], frozen into a
//! [`BuiltRequest`] and executed on a small pool of I/O threads. Outcomes
//! come back through a [`ResponseFuture`] and, optionally, an
//! [`HttpCallback`] run on the callback executor.
mod caller;
mod client;
mod config;
mod error;
mod http;
mod runtime;
#[cfg(test)]
mod test_util;

pub mod backpressure;
pub mod connectors;
pub mod event;
pub mod executor;
pub mod future;
pub mod key;
pub mod pool;
pub mod request;
pub mod response;
pub mod websocket;

pub use backpressure::{
    BackPressure, EvictingBackPressure, EvictionScope, NoBackPressure, RejectingBackPressure,
};
pub use client::{HttpClient, HttpClientBuilder};
pub use config::{ClientConfig, DEFAULT_USER_AGENT};
pub use error::{HttpError, Result};
pub use future::{HttpCallback, ResponseFuture, ResultFuture};
pub use request::{BodyKind, BuiltRequest, CustomBody, HttpRequestBuilder, RequestSpec};
pub use response::{
    BytesBodyConsumer, DiscardBodyConsumer, HttpResponse, JsonBodyConsumer, ResponseBodyConsumer,
    StringBodyConsumer,
};
pub use websocket::{WebSocketBuilder, WebSocketListener, WebSocketSession, WebSocketState};
