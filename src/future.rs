//! One-shot delivery of a terminal outcome to a callback and a future.
use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};
use tokio::sync::{oneshot, Notify};

use crate::{
    error::{HttpError, Result},
    executor::CallbackExecutor,
    response::HttpResponse,
};

/// Receives the outcome of an HTTP execution on the callback executor.
pub trait HttpCallback<T>: Send + Sync + 'static {
    fn on_completed(&self, response: &HttpResponse<T>);
    fn on_error(&self, error: &HttpError);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum CancelReason {
    Cancelled,
    Evicted(String),
    Shutdown,
}

impl CancelReason {
    pub(crate) fn into_error(self) -> HttpError {
        match self {
            CancelReason::Cancelled => HttpError::Cancelled,
            CancelReason::Evicted(policy) => HttpError::BackPressureEvicted { policy },
            CancelReason::Shutdown => HttpError::ClientShutdown,
        }
    }
}

#[derive(Debug)]
enum TokenState {
    Active,
    Cancelled(CancelReason),
    Finished,
}

/// Cross-thread cancellation signal for one execution.
pub(crate) struct CancelToken {
    state: Mutex<TokenState>,
    notify: Notify,
}

impl CancelToken {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(TokenState::Active),
            notify: Notify::new(),
        }
    }

    /// Request cancellation. Returns false if the execution already finished
    /// or was cancelled before.
    pub(crate) fn cancel(&self, reason: CancelReason) -> bool {
        {
            let mut state = self.state.lock();
            if !matches!(*state, TokenState::Active) {
                return false;
            }
            *state = TokenState::Cancelled(reason);
        }
        self.notify.notify_one();
        true
    }

    /// Mark the outcome as produced; later cancellations become no-ops.
    pub(crate) fn finish(&self) {
        let mut state = self.state.lock();
        if matches!(*state, TokenState::Active) {
            *state = TokenState::Finished;
        }
    }

    pub(crate) fn reason(&self) -> Option<CancelReason> {
        match &*self.state.lock() {
            TokenState::Cancelled(reason) => Some(reason.clone()),
            _ => None,
        }
    }

    /// Resolves once the token is cancelled.
    pub(crate) async fn cancelled(&self) -> CancelReason {
        loop {
            if let Some(reason) = self.reason() {
                return reason;
            }
            self.notify.notified().await;
        }
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CancelToken").field(&*self.state.lock()).finish()
    }
}

type Observer<V> = Box<dyn FnOnce(&Result<V>) + Send>;

/// Set once the outcome was sent or can no longer arrive.
#[derive(Debug, Default)]
struct Ready {
    done: Mutex<bool>,
    cond: Condvar,
}

impl Ready {
    fn wait_until(&self, deadline: Instant) {
        let mut done = self.done.lock();
        while !*done {
            if self.cond.wait_until(&mut done, deadline).timed_out() {
                return;
            }
        }
    }
}

/// Marks [`Ready`] when dropped. Travels with the sender, so it fires after
/// the send or when the sender is lost.
struct ReadyOnDrop(Arc<Ready>);

impl Drop for ReadyOnDrop {
    fn drop(&mut self) {
        *self.0.done.lock() = true;
        self.0.cond.notify_all();
    }
}

/// Write side of the one-shot result cell.
///
/// `complete` consumes the slot, so a second delivery cannot be expressed.
/// A slot dropped without completing (runtime torn down) delivers
/// `ClientShutdown` so no observer waits forever.
pub(crate) struct ResultSlot<V: Send + 'static> {
    tx: Option<oneshot::Sender<Result<V>>>,
    ready: Option<ReadyOnDrop>,
    observer: Option<Observer<V>>,
    executor: Arc<dyn CallbackExecutor>,
}

impl<V: Send + 'static> ResultSlot<V> {
    pub(crate) fn complete(mut self, outcome: Result<V>) {
        self.deliver(outcome);
    }

    fn deliver(&mut self, outcome: Result<V>) {
        let Some(tx) = self.tx.take() else {
            return;
        };
        let ready = self.ready.take();
        match self.observer.take() {
            Some(observer) => self.executor.execute(Box::new(move || {
                observer(&outcome);
                let _ = tx.send(outcome);
                drop(ready);
            })),
            None => {
                let _ = tx.send(outcome);
                drop(ready);
            }
        }
    }
}

impl<V: Send + 'static> Drop for ResultSlot<V> {
    fn drop(&mut self) {
        if self.tx.is_some() {
            self.deliver(Err(HttpError::ClientShutdown));
        }
    }
}

/// Read side of the one-shot result cell.
///
/// Await it from async code, or [`join`](Self::join) from a plain caller
/// thread. Never join from an I/O thread.
#[must_use = "dropping the future does not cancel the execution; call cancel()"]
pub struct ResultFuture<V> {
    rx: oneshot::Receiver<Result<V>>,
    ready: Arc<Ready>,
    token: Arc<CancelToken>,
}

pub type ResponseFuture<T> = ResultFuture<HttpResponse<T>>;

impl<V: Send + 'static> ResultFuture<V> {
    /// Block the calling thread until the outcome is available.
    pub fn join(self) -> Result<V> {
        self.rx
            .blocking_recv()
            .unwrap_or(Err(HttpError::ClientShutdown))
    }

    /// Block for at most `timeout`; on expiry the future is handed back.
    pub fn join_timeout(mut self, timeout: Duration) -> std::result::Result<Result<V>, Self> {
        self.ready.wait_until(Instant::now() + timeout);
        match self.rx.try_recv() {
            Ok(outcome) => Ok(outcome),
            Err(oneshot::error::TryRecvError::Closed) => Ok(Err(HttpError::ClientShutdown)),
            Err(oneshot::error::TryRecvError::Empty) => Err(self),
        }
    }

    /// Cancel the execution. Returns false when the outcome was already
    /// produced, in which case nothing changes.
    pub fn cancel(&self) -> bool {
        self.token.cancel(CancelReason::Cancelled)
    }

    pub(crate) fn token(&self) -> &Arc<CancelToken> {
        &self.token
    }
}

impl<V> Future for ResultFuture<V> {
    type Output = Result<V>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        Pin::new(&mut this.rx)
            .poll(cx)
            .map(|r| r.unwrap_or(Err(HttpError::ClientShutdown)))
    }
}

impl<V> fmt::Debug for ResultFuture<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultFuture")
            .field("token", &self.token)
            .finish_non_exhaustive()
    }
}

/// Create a linked slot and future. `observer`, when given, runs on
/// `executor` before the future resolves.
pub(crate) fn result_channel<V: Send + 'static>(
    executor: Arc<dyn CallbackExecutor>,
    observer: Option<Observer<V>>,
) -> (ResultSlot<V>, ResultFuture<V>) {
    let (tx, rx) = oneshot::channel();
    let ready = Arc::new(Ready::default());
    let slot = ResultSlot {
        tx: Some(tx),
        ready: Some(ReadyOnDrop(ready.clone())),
        observer,
        executor,
    };
    let future = ResultFuture {
        rx,
        ready,
        token: Arc::new(CancelToken::new()),
    };
    (slot, future)
}

/// Adapt an [`HttpCallback`] into a slot observer.
pub(crate) fn callback_observer<T: Send + 'static>(
    callback: Arc<dyn HttpCallback<T>>,
) -> Observer<HttpResponse<T>> {
    Box::new(move |outcome| match outcome {
        Ok(response) => callback.on_completed(response),
        Err(e) => callback.on_error(e),
    })
}
