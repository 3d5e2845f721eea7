//! Execution contexts for user callbacks. I/O threads never run user code;
//! they hand finished outcomes to a [`CallbackExecutor`].
use std::{
    collections::VecDeque,
    io,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
    thread,
};

use parking_lot::Mutex;
use tokio::sync::mpsc;

pub type Task = Box<dyn FnOnce() + Send + 'static>;

pub trait CallbackExecutor: Send + Sync + 'static {
    fn execute(&self, task: Task);
}

fn run_guarded(task: Task) {
    if let Err(_panic) = catch_unwind(AssertUnwindSafe(task)) {
        #[cfg(feature = "logging")]
        tracing::error!("callback panicked");
    }
}

/// A fixed set of named threads draining one shared queue.
pub struct ThreadPoolExecutor {
    tx: Mutex<Option<mpsc::UnboundedSender<Task>>>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl ThreadPoolExecutor {
    pub fn new(threads: usize, name: &str) -> io::Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel::<Task>();
        let rx = Arc::new(Mutex::new(rx));
        let mut workers = Vec::with_capacity(threads);
        for idx in 0..threads.max(1) {
            let rx = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("{name}-{idx}"))
                .spawn(move || loop {
                    let task = rx.lock().blocking_recv();
                    match task {
                        Some(task) => run_guarded(task),
                        None => break,
                    }
                })?;
            workers.push(handle);
        }
        Ok(Self {
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
        })
    }

    /// Stop accepting tasks, let queued ones finish and join the threads.
    /// Safe to call from one of the pool's own threads; that thread is
    /// simply not joined.
    pub fn shutdown(&self) {
        drop(self.tx.lock().take());
        let current = thread::current().id();
        for handle in self.workers.lock().drain(..) {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
    }
}

impl CallbackExecutor for ThreadPoolExecutor {
    fn execute(&self, task: Task) {
        let rejected = match self.tx.lock().as_ref() {
            Some(tx) => tx.send(task).err().map(|e| e.0),
            None => Some(task),
        };
        // Outcomes must still be observed after shutdown.
        if let Some(task) = rejected {
            #[cfg(feature = "logging")]
            tracing::warn!("callback executor shut down, running callback inline");
            run_guarded(task);
        }
    }
}

impl Drop for ThreadPoolExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[derive(Default)]
struct OrderedState {
    queue: VecDeque<Task>,
    running: bool,
}

/// Runs tasks one at a time, in submission order, on top of another executor.
/// Used to give each WebSocket session a single logical dispatch sequence.
#[derive(Clone)]
pub struct OrderedExecutor {
    inner: Arc<dyn CallbackExecutor>,
    state: Arc<Mutex<OrderedState>>,
}

impl OrderedExecutor {
    pub fn new(inner: Arc<dyn CallbackExecutor>) -> Self {
        Self {
            inner,
            state: Arc::new(Mutex::new(OrderedState::default())),
        }
    }

    fn drain(state: &Mutex<OrderedState>) {
        loop {
            let task = {
                let mut st = state.lock();
                match st.queue.pop_front() {
                    Some(task) => task,
                    None => {
                        st.running = false;
                        return;
                    }
                }
            };
            run_guarded(task);
        }
    }
}

impl CallbackExecutor for OrderedExecutor {
    fn execute(&self, task: Task) {
        {
            let mut st = self.state.lock();
            st.queue.push_back(task);
            if st.running {
                return;
            }
            st.running = true;
        }
        let state = self.state.clone();
        self.inner.execute(Box::new(move || Self::drain(&state)));
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::mpsc as std_mpsc, time::Duration};

    use super::*;

    #[test]
    fn runs_tasks_on_named_threads() {
        let pool = ThreadPoolExecutor::new(2, "cb").unwrap();
        let (tx, rx) = std_mpsc::channel();
        pool.execute(Box::new(move || {
            let name = thread::current().name().map(str::to_owned);
            tx.send(name).unwrap();
        }));
        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
        assert!(name.starts_with("cb-"));
    }

    #[test]
    fn survives_a_panicking_callback() {
        let pool = ThreadPoolExecutor::new(1, "cb").unwrap();
        pool.execute(Box::new(|| panic!("boom")));
        let (tx, rx) = std_mpsc::channel();
        pool.execute(Box::new(move || tx.send(1).unwrap()));
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 1);
    }

    #[test]
    fn runs_inline_after_shutdown() {
        let pool = ThreadPoolExecutor::new(1, "cb").unwrap();
        pool.shutdown();
        let (tx, rx) = std_mpsc::channel();
        pool.execute(Box::new(move || tx.send(7).unwrap()));
        assert_eq!(rx.try_recv().unwrap(), 7);
    }

    #[test]
    fn ordered_executor_preserves_submission_order() {
        let pool: Arc<dyn CallbackExecutor> = Arc::new(ThreadPoolExecutor::new(4, "cb").unwrap());
        let ordered = OrderedExecutor::new(pool);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = std_mpsc::channel();
        for i in 0..200 {
            let seen = seen.clone();
            let tx = tx.clone();
            ordered.execute(Box::new(move || {
                seen.lock().push(i);
                if i == 199 {
                    tx.send(()).unwrap();
                }
            }));
        }
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(*seen.lock(), (0..200).collect::<Vec<_>>());
    }
}
