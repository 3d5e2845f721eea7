use std::{sync::Arc, time::Duration};

use thiserror::Error as ThisError;

/// Every failure an execution or a WebSocket session can surface.
///
/// The type is `Clone` so one terminal outcome can be observed by both the
/// callback and the future; I/O errors are shared behind an `Arc`.
#[derive(ThisError, Debug, Clone)]
pub enum HttpError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("invalid uri {uri:?}: {reason}")]
    UriSyntax { uri: String, reason: String },
    #[error("request rejected by back pressure policy {policy}")]
    BackPressureRejected { policy: String },
    #[error("request evicted by back pressure policy {policy}")]
    BackPressureEvicted { policy: String },
    #[error("connection to {addr} failed: {source}")]
    Connection {
        addr: String,
        #[source]
        source: Arc<std::io::Error>,
    },
    #[error("connect to {addr} timed out after {timeout:?}")]
    ConnectTimeout { addr: String, timeout: Duration },
    #[error("tls error: {0}")]
    Tls(String),
    #[error("io error {0}")]
    Io(#[source] Arc<std::io::Error>),
    #[error("no i/o activity for {0:?}")]
    IdleTimeout(Duration),
    #[error("request did not complete within {0:?}")]
    TotalTimeout(Duration),
    #[error("redirect limit of {limit} exceeded")]
    RedirectLimitExceeded { limit: u32 },
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("websocket session is {state}, cannot {action}")]
    WebSocketState {
        state: &'static str,
        action: &'static str,
    },
    #[error("failed to decode response body: {0}")]
    BodyConsumer(String),
    #[error("execution cancelled")]
    Cancelled,
    #[error("client is shut down")]
    ClientShutdown,
}

pub type Result<T, E = HttpError> = std::result::Result<T, E>;

/// Errors raised by the HTTP/1.x codec.
pub(crate) type CodecError = monoio_http::common::error::HttpError;

impl HttpError {
    #[inline]
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::IdleTimeout(_) | Self::TotalTimeout(_) | Self::ConnectTimeout { .. }
        )
    }

    #[inline]
    pub fn is_backpressure(&self) -> bool {
        matches!(
            self,
            Self::BackPressureRejected { .. } | Self::BackPressureEvicted { .. }
        )
    }

    pub(crate) fn uri(uri: impl Into<String>, reason: impl ToString) -> Self {
        Self::UriSyntax {
            uri: uri.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn protocol(reason: impl ToString) -> Self {
        Self::Protocol(reason.to_string())
    }

    pub(crate) fn connection(addr: impl ToString, source: std::io::Error) -> Self {
        Self::Connection {
            addr: addr.to_string(),
            source: Arc::new(source),
        }
    }
}

impl From<std::io::Error> for HttpError {
    #[inline]
    fn from(e: std::io::Error) -> Self {
        Self::Io(Arc::new(e))
    }
}

impl From<monoio_rustls::TlsError> for HttpError {
    #[inline]
    fn from(e: monoio_rustls::TlsError) -> Self {
        Self::Tls(e.to_string())
    }
}

impl From<http::Error> for HttpError {
    #[inline]
    fn from(e: http::Error) -> Self {
        Self::Configuration(e.to_string())
    }
}

impl From<CodecError> for HttpError {
    /// Transport failures inside the codec stay I/O errors; everything else
    /// is a malformed message.
    fn from(e: CodecError) -> Self {
        let mut source: Option<&(dyn std::error::Error + 'static)> = Some(&e);
        while let Some(err) = source {
            if let Some(io) = err.downcast_ref::<std::io::Error>() {
                return Self::Io(Arc::new(std::io::Error::new(io.kind(), e.to_string())));
            }
            source = err.source();
        }
        Self::Protocol(e.to_string())
    }
}

impl From<httparse::Error> for HttpError {
    #[inline]
    fn from(e: httparse::Error) -> Self {
        Self::Protocol(format!("malformed response head: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_timeouts_and_backpressure() {
        assert!(HttpError::IdleTimeout(Duration::from_millis(5)).is_timeout());
        assert!(HttpError::TotalTimeout(Duration::from_millis(5)).is_timeout());
        assert!(!HttpError::Cancelled.is_timeout());

        let evicted = HttpError::BackPressureEvicted {
            policy: "evicting(capacity=1, scope=in-flight)".into(),
        };
        assert!(evicted.is_backpressure());
        assert!(evicted.to_string().contains("evicting(capacity=1"));
    }

    #[test]
    fn io_errors_are_shared_on_clone() {
        let err: HttpError = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe").into();
        let copy = err.clone();
        match (err, copy) {
            (HttpError::Io(a), HttpError::Io(b)) => assert!(Arc::ptr_eq(&a, &b)),
            _ => panic!("expected io errors"),
        }
    }
}
