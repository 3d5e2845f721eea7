//! Keyed pool of idle transport channels for one I/O thread.
//!
//! A channel is handed out as [`Pooled`]; dropping the handle puts the
//! channel back under its key if it still reports [`Poolable::is_open`],
//! otherwise the channel is closed. Channels are `!Send`, so each I/O
//! thread owns a separate pool.
mod connector;
mod reuse;
use std::{
    cell::RefCell,
    collections::{HashMap, VecDeque},
    fmt::Debug,
    hash::Hash,
    ops::{Deref, DerefMut},
    rc::{Rc, Weak},
    time::{Duration, Instant},
};

pub use connector::PooledConnector;
pub use reuse::{Reuse, ReuseConnector};

pub(crate) const DEFAULT_KEEPALIVE_CONNS: usize = 256;
pub(crate) const DEFAULT_POOL_SIZE: usize = 32;
// https://datatracker.ietf.org/doc/html/rfc6335
pub(crate) const MAX_KEEPALIVE_CONNS: usize = 16384;

pub trait Poolable {
    fn is_open(&self) -> bool;
}

type SharedPool<K, IO> = Rc<RefCell<PoolInner<K, IO>>>;
type WeakPool<K, IO> = Weak<RefCell<PoolInner<K, IO>>>;

pub trait PoolKey: Eq + Hash + Clone + 'static {}
impl<T: Eq + Hash + Clone + 'static> PoolKey for T {}

// Partly borrow from hyper-util. All rights reserved.
pub struct Pooled<K: PoolKey, T: Poolable> {
    value: Option<T>,
    is_reused: bool,
    key: Option<K>,
    pool: Option<WeakPool<K, T>>,
}

impl<T: Poolable, K: PoolKey> Pooled<K, T> {
    #[inline]
    pub(crate) const fn new(key: K, value: T, is_reused: bool, pool: WeakPool<K, T>) -> Self {
        Self {
            value: Some(value),
            is_reused,
            key: Some(key),
            pool: Some(pool),
        }
    }

    /// Whether the channel came out of the idle set rather than a fresh connect.
    #[inline]
    pub fn is_reused(&self) -> bool {
        self.is_reused
    }

    #[inline]
    fn as_ref(&self) -> &T {
        self.value.as_ref().expect("not dropped")
    }

    #[inline]
    fn as_mut(&mut self) -> &mut T {
        self.value.as_mut().expect("not dropped")
    }
}

impl<T: Poolable, K: PoolKey> Deref for Pooled<K, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        self.as_ref()
    }
}

impl<T: Poolable, K: PoolKey> DerefMut for Pooled<K, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        self.as_mut()
    }
}

impl<T: Poolable, K: PoolKey> Drop for Pooled<K, T> {
    fn drop(&mut self) {
        let Some(value) = self.value.take() else {
            return;
        };
        if !value.is_open() {
            // Dropping the value here closes the channel.
            #[cfg(feature = "logging")]
            tracing::trace!("pooled channel not reusable, closing");
            return;
        }
        let (Some(key), Some(pool)) = (self.key.take(), self.pool.as_ref().and_then(Weak::upgrade))
        else {
            return;
        };
        pool.borrow_mut().push(key, value);
    }
}

pub(crate) struct Idle<IO> {
    pub(crate) conn: IO,
    idle_at: Instant,
}

impl<IO> Idle<IO> {
    #[inline]
    pub(crate) fn new(io: IO) -> Self {
        Self {
            conn: io,
            idle_at: Instant::now(),
        }
    }

    #[inline]
    pub(crate) fn expired(&self, max_elapsed: Option<Duration>) -> bool {
        match max_elapsed {
            Some(e) => self.idle_at.elapsed() > e,
            None => false,
        }
    }
}

pub(crate) struct PoolInner<K, IO> {
    idle_conns: HashMap<K, VecDeque<Idle<IO>>>,
    max_idle: usize,
    idle_dur: Option<Duration>,
}

impl<K: PoolKey, IO> PoolInner<K, IO> {
    fn new(max_idle: Option<usize>, idle_dur: Option<Duration>) -> Self {
        let max_idle = max_idle
            .map(|n| n.min(MAX_KEEPALIVE_CONNS))
            .unwrap_or(DEFAULT_KEEPALIVE_CONNS);
        Self {
            idle_conns: HashMap::with_capacity(DEFAULT_POOL_SIZE),
            max_idle,
            idle_dur,
        }
    }

    fn push(&mut self, key: K, conn: IO) {
        if self.max_idle == 0 {
            return;
        }
        let queue = self.idle_conns.entry(key).or_default();
        while queue.len() >= self.max_idle {
            let _ = queue.pop_front();
        }
        queue.push_back(Idle::new(conn));
    }

    fn pop(&mut self, key: &K) -> Option<IO> {
        let queue = self.idle_conns.get_mut(key)?;
        // Most recently returned channels are the least likely to be stale.
        while let Some(idle) = queue.pop_back() {
            if !idle.expired(self.idle_dur) {
                return Some(idle.conn);
            }
        }
        None
    }

    fn clear_expired(&mut self) {
        let idle_dur = self.idle_dur;
        self.idle_conns.retain(|_, values| {
            values.retain(|entry| !entry.expired(idle_dur));
            !values.is_empty()
        });
    }
}

pub struct ConnectionPool<K, T> {
    shared: SharedPool<K, T>,
}

impl<K, T> Clone for ConnectionPool<K, T> {
    #[inline]
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<K, T> Debug for ConnectionPool<K, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool").finish_non_exhaustive()
    }
}

impl<K: PoolKey, T: 'static> ConnectionPool<K, T> {
    /// `idle_interval` is both the idle TTL of a channel and how often the
    /// reaper runs (never more often than once a second). The reaper needs a
    /// monoio runtime with the timer enabled.
    pub fn new_with_idle_interval(
        idle_interval: Option<Duration>,
        max_idle: Option<usize>,
    ) -> Self {
        const MIN_INTERVAL: Duration = Duration::from_secs(1);

        let shared = Rc::new(RefCell::new(PoolInner::new(max_idle, idle_interval)));
        if let Some(idle_interval) = idle_interval {
            let weak = Rc::downgrade(&shared);
            monoio::spawn(reap_idle(weak, idle_interval.max(MIN_INTERVAL)));
        }
        Self { shared }
    }

    #[inline]
    pub fn new(max_idle: Option<usize>) -> Self {
        Self {
            shared: Rc::new(RefCell::new(PoolInner::new(max_idle, None))),
        }
    }
}

impl<K: PoolKey, T: Poolable + 'static> ConnectionPool<K, T> {
    /// Take an idle channel for `key`, skipping any past the idle TTL.
    #[inline]
    pub fn get(&self, key: &K) -> Option<Pooled<K, T>> {
        let conn = self.shared.borrow_mut().pop(key)?;
        #[cfg(feature = "logging")]
        tracing::trace!("reusing idle pooled channel");
        Some(Pooled::new(
            key.to_owned(),
            conn,
            true,
            Rc::downgrade(&self.shared),
        ))
    }

    #[inline]
    pub fn put(&self, key: K, conn: T) {
        self.shared.borrow_mut().push(key, conn);
    }

    #[inline]
    pub fn link(&self, key: K, conn: T) -> Pooled<K, T> {
        #[cfg(feature = "logging")]
        tracing::debug!("linked new connection to the pool");

        Pooled::new(key, conn, false, Rc::downgrade(&self.shared))
    }

    #[inline]
    pub fn idle_connection_count(&self) -> usize {
        self.shared
            .borrow()
            .idle_conns
            .values()
            .map(VecDeque::len)
            .sum()
    }
}

async fn reap_idle<K: PoolKey, T>(pool: WeakPool<K, T>, every: Duration) {
    let mut interval = monoio::time::interval(every);
    loop {
        interval.tick().await;
        let Some(inner) = pool.upgrade() else {
            #[cfg(feature = "logging")]
            tracing::debug!("pool dropped, idle task exit");
            return;
        };
        inner.borrow_mut().clear_expired();
        #[cfg(feature = "logging")]
        tracing::trace!("pool clear expired");
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    struct Chan {
        id: u32,
        open: Rc<Cell<bool>>,
    }

    impl Poolable for Chan {
        fn is_open(&self) -> bool {
            self.open.get()
        }
    }

    fn chan(id: u32) -> (Chan, Rc<Cell<bool>>) {
        let open = Rc::new(Cell::new(true));
        (
            Chan {
                id,
                open: open.clone(),
            },
            open,
        )
    }

    #[monoio::test(enable_timer = true)]
    async fn returns_open_channels_on_drop() {
        let pool: ConnectionPool<&'static str, Chan> = ConnectionPool::new(None);
        let (c, _) = chan(1);
        let pooled = pool.link("a", c);
        assert!(!pooled.is_reused());
        drop(pooled);
        assert_eq!(pool.idle_connection_count(), 1);

        let again = pool.get(&"a").unwrap();
        assert!(again.is_reused());
        assert_eq!(again.id, 1);
        assert_eq!(pool.idle_connection_count(), 0);
        assert!(pool.get(&"b").is_none());
    }

    #[monoio::test(enable_timer = true)]
    async fn closed_channels_are_not_returned() {
        let pool: ConnectionPool<&'static str, Chan> = ConnectionPool::new(None);
        let (c, open) = chan(1);
        let pooled = pool.link("a", c);
        open.set(false);
        drop(pooled);
        assert_eq!(pool.idle_connection_count(), 0);
    }

    #[monoio::test(enable_timer = true)]
    async fn one_idle_channel_is_never_handed_out_twice() {
        let pool: ConnectionPool<&'static str, Chan> = ConnectionPool::new(None);
        pool.put("a", chan(7).0);
        let first = pool.get(&"a");
        let second = pool.get(&"a");
        assert!(first.is_some());
        assert!(second.is_none());
    }

    #[monoio::test(enable_timer = true)]
    async fn bounded_by_max_idle() {
        let pool: ConnectionPool<&'static str, Chan> = ConnectionPool::new(Some(2));
        for id in 0..5 {
            pool.put("a", chan(id).0);
        }
        assert_eq!(pool.idle_connection_count(), 2);
        assert_eq!(pool.get(&"a").unwrap().id, 4);
    }

    #[monoio::test(enable_timer = true)]
    async fn expired_channels_are_skipped() {
        let pool: ConnectionPool<&'static str, Chan> =
            ConnectionPool::new_with_idle_interval(Some(Duration::from_millis(20)), None);
        pool.put("a", chan(1).0);
        monoio::time::sleep(Duration::from_millis(50)).await;
        assert!(pool.get(&"a").is_none());
    }
}
