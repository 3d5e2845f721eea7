use std::ops::{Deref, DerefMut};

use super::Poolable;
use crate::connectors::Connector;

/// Wraps a channel with a flag saying whether it may go back to the pool.
///
/// The orchestrator clears the flag as soon as it takes a channel and sets it
/// again only after a response was read to its end with keep-alive in effect.
#[derive(Debug)]
pub struct Reuse<T> {
    inner: T,
    reuse: bool,
}

impl<T> Reuse<T> {
    #[inline]
    pub const fn new(inner: T, reuse: bool) -> Self {
        Self { inner, reuse }
    }

    #[inline]
    pub fn into_inner(self) -> T {
        self.inner
    }

    #[inline]
    pub fn set_reuse(&mut self, reuse: bool) {
        self.reuse = reuse;
    }
}

impl<T> Poolable for Reuse<T> {
    #[inline]
    fn is_open(&self) -> bool {
        self.reuse
    }
}

impl<T> Deref for Reuse<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T> DerefMut for Reuse<T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}

#[derive(Default, Debug, Clone)]
pub struct ReuseConnector<C>(pub C);

impl<C, K> Connector<K> for ReuseConnector<C>
where
    C: Connector<K>,
{
    type Connection = Reuse<C::Connection>;
    type Error = C::Error;

    #[inline]
    async fn connect(&self, key: K) -> Result<Self::Connection, Self::Error> {
        Ok(Reuse::new(self.0.connect(key).await?, true))
    }
}
