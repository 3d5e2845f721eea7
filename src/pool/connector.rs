use super::{ConnectionPool, PoolKey, Poolable, Pooled};
use crate::connectors::Connector;

/// A connector that serves idle channels from its pool before opening new ones.
#[derive(Debug)]
pub struct PooledConnector<C, K, T> {
    transport_connector: C,
    pool: ConnectionPool<K, T>,
}

impl<C, K, T> PooledConnector<C, K, T> {
    #[inline]
    pub const fn new(transport_connector: C, pool: ConnectionPool<K, T>) -> Self {
        Self {
            transport_connector,
            pool,
        }
    }

    #[inline]
    pub fn transport_connector(&self) -> &C {
        &self.transport_connector
    }

    #[inline]
    pub fn pool(&self) -> &ConnectionPool<K, T> {
        &self.pool
    }
}

impl<C, K: PoolKey, T: Poolable + 'static> Connector<K> for PooledConnector<C, K, T>
where
    C: Connector<K, Connection = T>,
{
    type Connection = Pooled<K, T>;
    type Error = C::Error;

    #[inline]
    async fn connect(&self, key: K) -> Result<Self::Connection, Self::Error> {
        if let Some(conn) = self.pool.get(&key) {
            return Ok(conn);
        }
        let key_owned = key.to_owned();
        let io = self.transport_connector.connect(key).await?;
        Ok(self.pool.link(key_owned, io))
    }
}
