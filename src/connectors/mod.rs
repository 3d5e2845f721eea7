//! Transport connectors: plain TCP, TLS over TCP, and a unified connector
//! that picks one of them per [`Key`](crate::key::Key).
mod tcp_connector;
mod tls_connector;

use std::{future::Future, time::Duration};

use monoio::time::error::Elapsed;

pub use tcp_connector::{ResolveOverrides, TcpConnector};
pub use tls_connector::{MonoioTlsConnector, Stream, TlsConnector, TlsStream, UnifiedConnector};

pub trait Connector<K> {
    type Connection;
    type Error;

    fn connect(&self, key: K) -> impl Future<Output = Result<Self::Connection, Self::Error>>;
}

pub trait ConnectorExt<K>: Connector<K> {
    fn connect_with_timeout(
        &self,
        key: K,
        timeout: Duration,
    ) -> impl Future<Output = Result<Result<Self::Connection, Self::Error>, Elapsed>>;
}

impl<K, T: Connector<K>> ConnectorExt<K> for T {
    #[inline]
    fn connect_with_timeout(
        &self,
        key: K,
        timeout: Duration,
    ) -> impl Future<Output = Result<Result<Self::Connection, Self::Error>, Elapsed>> {
        monoio::time::timeout(timeout, self.connect(key))
    }
}
