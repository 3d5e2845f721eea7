use std::fmt::Debug;

use monoio::{
    io::{AsyncReadRent, AsyncWriteRent, Split},
    net::TcpStream,
};
pub use monoio_rustls::TlsConnector as MonoioTlsConnector;
use rustls::pki_types::ServerName;

use super::{Connector, TcpConnector};
use crate::{error::HttpError, key::Key};

pub type TlsStream<C> = monoio_rustls::ClientTlsStream<C>;

/// A connector for establishing TLS connections over an inner connector.
#[derive(Clone)]
pub struct TlsConnector<C> {
    inner_connector: C,
    tls_connector: MonoioTlsConnector,
}

impl<C: Debug> std::fmt::Debug for TlsConnector<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TlsConnector, inner: {:?}", self.inner_connector)
    }
}

impl<C> TlsConnector<C> {
    pub const fn new(inner_connector: C, tls_connector: MonoioTlsConnector) -> Self {
        Self {
            inner_connector,
            tls_connector,
        }
    }

    /// Webpki roots, no client auth, ALPN restricted to `http/1.1`.
    #[inline]
    pub fn new_with_tls_default(inner_connector: C) -> Self {
        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let mut cfg = rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();
        cfg.alpn_protocols = vec![b"http/1.1".to_vec()];

        TlsConnector::new(inner_connector, cfg.into())
    }

    #[inline]
    pub fn inner_connector(&self) -> &C {
        &self.inner_connector
    }

    #[inline]
    async fn handshake<IO>(
        &self,
        server_name: &ServerName<'static>,
        io: IO,
    ) -> Result<TlsStream<IO>, HttpError>
    where
        IO: AsyncReadRent + AsyncWriteRent,
    {
        self.tls_connector
            .connect(server_name.clone(), io)
            .await
            .map_err(Into::into)
    }
}

impl<C: Default> Default for TlsConnector<C> {
    #[inline]
    fn default() -> Self {
        TlsConnector::new_with_tls_default(Default::default())
    }
}

/// Opens a plain or TLS stream depending on whether the key carries a
/// server name.
#[derive(Clone, Debug, Default)]
pub struct UnifiedConnector(TlsConnector<TcpConnector>);

impl UnifiedConnector {
    #[inline]
    pub fn new(tcp: TcpConnector) -> Self {
        Self(TlsConnector::new_with_tls_default(tcp))
    }
}

impl Connector<Key> for UnifiedConnector {
    type Connection = Stream;
    type Error = HttpError;

    async fn connect(&self, key: Key) -> Result<Self::Connection, Self::Error> {
        let tcp = self
            .0
            .inner_connector
            .connect(&key)
            .await
            .map_err(|e| HttpError::connection(&key, e))?;
        match &key.server_name {
            Some(sn) => {
                let tls = self.0.handshake(sn, tcp).await?;
                #[cfg(feature = "logging")]
                tracing::debug!("tls established with {key}");
                Ok(Stream::Tls(tls))
            }
            None => Ok(Stream::Plain(tcp)),
        }
    }
}

/// A transport channel: plain TCP or TLS over TCP.
#[derive(Debug)]
pub enum Stream {
    Plain(TcpStream),
    Tls(TlsStream<TcpStream>),
}

impl AsyncReadRent for Stream {
    #[inline]
    async fn read<T: monoio::buf::IoBufMut>(&mut self, buf: T) -> monoio::BufResult<usize, T> {
        match self {
            Stream::Plain(inner) => inner.read(buf).await,
            Stream::Tls(inner) => inner.read(buf).await,
        }
    }

    #[inline]
    async fn readv<T: monoio::buf::IoVecBufMut>(&mut self, buf: T) -> monoio::BufResult<usize, T> {
        match self {
            Stream::Plain(inner) => inner.readv(buf).await,
            Stream::Tls(inner) => inner.readv(buf).await,
        }
    }
}

impl AsyncWriteRent for Stream {
    #[inline]
    async fn write<T: monoio::buf::IoBuf>(&mut self, buf: T) -> monoio::BufResult<usize, T> {
        match self {
            Stream::Plain(inner) => inner.write(buf).await,
            Stream::Tls(inner) => inner.write(buf).await,
        }
    }

    #[inline]
    async fn writev<T: monoio::buf::IoVecBuf>(
        &mut self,
        buf_vec: T,
    ) -> monoio::BufResult<usize, T> {
        match self {
            Stream::Plain(inner) => inner.writev(buf_vec).await,
            Stream::Tls(inner) => inner.writev(buf_vec).await,
        }
    }

    #[inline]
    async fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Stream::Plain(inner) => inner.flush().await,
            Stream::Tls(inner) => inner.flush().await,
        }
    }

    #[inline]
    async fn shutdown(&mut self) -> std::io::Result<()> {
        match self {
            Stream::Plain(inner) => inner.shutdown().await,
            Stream::Tls(inner) => inner.shutdown().await,
        }
    }
}

unsafe impl Split for Stream {}
