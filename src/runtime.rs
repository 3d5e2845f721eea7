//! I/O threads. Each runs its own monoio runtime, connection pool and
//! connectors; work arrives as [`Job`]s over a cross-thread channel.
use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    future::Future,
    io,
    pin::Pin,
    rc::Rc,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};

use crate::{
    connectors::{ResolveOverrides, TcpConnector, UnifiedConnector},
    future::{CancelReason, CancelToken},
    http::{HttpChannel, HttpChannelConnector},
    key::Key,
    pool::{ConnectionPool, PooledConnector, Reuse, ReuseConnector},
};

type HttpChannels = ReuseConnector<HttpChannelConnector<UnifiedConnector>>;
pub(crate) type HttpConnector = PooledConnector<HttpChannels, Key, Reuse<HttpChannel>>;
pub(crate) type LocalTask = Pin<Box<dyn Future<Output = ()>>>;

/// Per-thread state shared by every execution on that thread.
pub(crate) struct IoContext {
    /// Pooled HTTP/1.x channels.
    pub(crate) http: HttpConnector,
    /// Unpooled channels; a WebSocket owns its channel until it closes.
    pub(crate) raw: UnifiedConnector,
    pub(crate) connect_timeout: Duration,
}

impl IoContext {
    fn new(settings: &IoSettings) -> Self {
        let unified =
            UnifiedConnector::new(TcpConnector::with_overrides(settings.overrides.clone()));
        let pool =
            ConnectionPool::new_with_idle_interval(settings.idle_ttl, Some(settings.max_idle));
        Self {
            http: PooledConnector::new(ReuseConnector(HttpChannelConnector(unified.clone())), pool),
            raw: unified,
            connect_timeout: settings.connect_timeout,
        }
    }
}

#[derive(Clone)]
pub(crate) struct IoSettings {
    pub(crate) overrides: Arc<ResolveOverrides>,
    pub(crate) connect_timeout: Duration,
    pub(crate) max_idle: usize,
    pub(crate) idle_ttl: Option<Duration>,
}

/// Work for an I/O thread. The token lets the thread cancel it on shutdown.
pub(crate) struct Job {
    token: Arc<CancelToken>,
    run: Box<dyn FnOnce(Rc<IoContext>) -> LocalTask + Send>,
}

impl Job {
    pub(crate) fn new<F>(token: Arc<CancelToken>, run: F) -> Self
    where
        F: FnOnce(Rc<IoContext>) -> LocalTask + Send + 'static,
    {
        Self {
            token,
            run: Box::new(run),
        }
    }
}

/// Live jobs on one I/O thread.
#[derive(Default)]
struct Registry {
    live: RefCell<HashMap<u64, Arc<CancelToken>>>,
    next: Cell<u64>,
    drained: RefCell<Option<local_sync::oneshot::Sender<()>>>,
}

impl Registry {
    fn insert(&self, token: Arc<CancelToken>) -> u64 {
        let id = self.next.get();
        self.next.set(id + 1);
        self.live.borrow_mut().insert(id, token);
        id
    }

    fn remove(&self, id: u64) {
        let empty = {
            let mut live = self.live.borrow_mut();
            live.remove(&id);
            live.is_empty()
        };
        if empty {
            if let Some(tx) = self.drained.borrow_mut().take() {
                let _ = tx.send(());
            }
        }
    }

    /// Cancel everything still running and wait until it has finished.
    async fn drain(&self) {
        let tokens: Vec<_> = self.live.borrow().values().cloned().collect();
        if tokens.is_empty() {
            return;
        }
        let (tx, rx) = local_sync::oneshot::channel();
        *self.drained.borrow_mut() = Some(tx);
        #[cfg(feature = "logging")]
        tracing::debug!("cancelling {} in-flight jobs for shutdown", tokens.len());
        for token in tokens {
            token.cancel(CancelReason::Shutdown);
        }
        let _ = rx.await;
    }
}

async fn serve(settings: IoSettings, mut rx: mpsc::UnboundedReceiver<Job>) {
    let ctx = Rc::new(IoContext::new(&settings));
    let registry = Rc::new(Registry::default());
    while let Some(job) = rx.recv().await {
        let id = registry.insert(job.token);
        let task = (job.run)(ctx.clone());
        let registry = registry.clone();
        monoio::spawn(async move {
            task.await;
            registry.remove(id);
        });
    }
    registry.drain().await;
    #[cfg(feature = "logging")]
    tracing::debug!("i/o worker drained");
}

fn run_worker(
    settings: IoSettings,
    rx: mpsc::UnboundedReceiver<Job>,
    ready: oneshot::Sender<io::Result<()>>,
) {
    let mut rt = match monoio::RuntimeBuilder::<monoio::FusionDriver>::new()
        .enable_timer()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    let _ = ready.send(Ok(()));
    rt.block_on(serve(settings, rx));
}

/// The fixed set of I/O threads, fed round-robin.
pub(crate) struct IoWorkers {
    senders: RwLock<Vec<mpsc::UnboundedSender<Job>>>,
    next: AtomicUsize,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl IoWorkers {
    pub(crate) fn start(threads: usize, name: &str, settings: IoSettings) -> io::Result<Self> {
        let workers = Self {
            senders: RwLock::new(Vec::with_capacity(threads)),
            next: AtomicUsize::new(0),
            handles: Mutex::new(Vec::with_capacity(threads)),
        };
        for idx in 0..threads {
            let (tx, rx) = mpsc::unbounded_channel();
            let (ready_tx, ready_rx) = oneshot::channel();
            let settings = settings.clone();
            let handle = thread::Builder::new()
                .name(format!("{name}-io-{idx}"))
                .spawn(move || run_worker(settings, rx, ready_tx))?;
            workers.handles.lock().push(handle);
            match ready_rx.blocking_recv() {
                Ok(Ok(())) => workers.senders.write().push(tx),
                Ok(Err(e)) => {
                    workers.shutdown();
                    return Err(e);
                }
                Err(_) => {
                    workers.shutdown();
                    return Err(io::Error::other("i/o worker exited during startup"));
                }
            }
        }
        Ok(workers)
    }

    /// Hand `job` to the next I/O thread. Dropping a job resolves it with
    /// `ClientShutdown`, which is what happens when the workers are gone.
    pub(crate) fn dispatch(&self, job: Job) -> bool {
        let senders = self.senders.read();
        if senders.is_empty() {
            return false;
        }
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % senders.len();
        senders[idx].send(job).is_ok()
    }

    /// Stop accepting jobs, cancel live ones and join the threads.
    pub(crate) fn shutdown(&self) {
        self.senders.write().clear();
        let current = thread::current().id();
        for handle in self.handles.lock().drain(..) {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use super::*;

    fn settings() -> IoSettings {
        IoSettings {
            overrides: Arc::new(ResolveOverrides::new()),
            connect_timeout: Duration::from_secs(1),
            max_idle: 8,
            idle_ttl: None,
        }
    }

    #[test]
    fn jobs_run_on_worker_threads() {
        let workers = IoWorkers::start(2, "rt-test", settings()).unwrap();
        let (tx, rx) = std::sync::mpsc::channel();
        for _ in 0..4 {
            let tx = tx.clone();
            let job = Job::new(Arc::new(CancelToken::new()), move |_ctx| {
                Box::pin(async move {
                    let name = thread::current().name().map(str::to_owned);
                    tx.send(name).unwrap();
                })
            });
            assert!(workers.dispatch(job));
        }
        for _ in 0..4 {
            let name = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
            assert!(name.starts_with("rt-test-io-"), "{name}");
        }
        workers.shutdown();
    }

    #[test]
    fn shutdown_cancels_live_jobs() {
        let workers = IoWorkers::start(1, "rt-test", settings()).unwrap();
        let token = Arc::new(CancelToken::new());
        let observed = Arc::new(AtomicBool::new(false));
        let (started_tx, started_rx) = std::sync::mpsc::channel();
        let job = {
            let token = token.clone();
            let observed = observed.clone();
            Job::new(token.clone(), move |_ctx| {
                Box::pin(async move {
                    started_tx.send(()).unwrap();
                    let reason = token.cancelled().await;
                    observed.store(reason == CancelReason::Shutdown, Ordering::SeqCst);
                })
            })
        };
        assert!(workers.dispatch(job));
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        workers.shutdown();
        assert!(observed.load(Ordering::SeqCst));

        let late = Job::new(Arc::new(CancelToken::new()), |_ctx| Box::pin(async {}));
        assert!(!workers.dispatch(late));
    }
}
