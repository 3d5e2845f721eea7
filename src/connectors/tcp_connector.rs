use std::{
    collections::HashMap,
    io,
    net::{SocketAddr, ToSocketAddrs},
    sync::Arc,
};

use monoio::net::TcpStream;
use smol_str::SmolStr;

use super::Connector;
use crate::key::Key;

/// Host/port pairs pinned to a socket address, skipping DNS.
pub type ResolveOverrides = HashMap<(SmolStr, u16), SocketAddr>;

#[derive(Default, Clone, Debug)]
pub struct TcpConnector {
    overrides: Arc<ResolveOverrides>,
}

impl TcpConnector {
    #[inline]
    pub fn with_overrides(overrides: Arc<ResolveOverrides>) -> Self {
        Self { overrides }
    }

    fn lookup(&self, key: &Key) -> io::Result<Vec<SocketAddr>> {
        if let Some(addr) = self.overrides.get(&(key.host.clone(), key.port)) {
            return Ok(vec![*addr]);
        }
        let addrs: Vec<SocketAddr> = key.to_socket_addrs()?.collect();
        if addrs.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no address resolved for {key}"),
            ));
        }
        Ok(addrs)
    }
}

impl<'a> Connector<&'a Key> for TcpConnector {
    type Connection = TcpStream;
    type Error = io::Error;

    async fn connect(&self, key: &'a Key) -> Result<Self::Connection, Self::Error> {
        let mut last_err = None;
        for addr in self.lookup(key)? {
            match TcpStream::connect_addr(addr).await {
                Ok(io) => {
                    // we will ignore the set nodelay error
                    let _ = io.set_nodelay(true);
                    return Ok(io);
                }
                Err(e) => {
                    #[cfg(feature = "logging")]
                    tracing::debug!("connect to {addr} for {key} failed: {e}");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| io::Error::from(io::ErrorKind::AddrNotAvailable)))
    }
}
