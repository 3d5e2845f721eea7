//! Admission control in front of the connection pools.
//!
//! Every execution is admitted exactly once and released exactly once through
//! an [`AdmissionGuard`]. Policies differ only in what happens at capacity.
use std::{
    collections::VecDeque,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;

use crate::{
    error::{HttpError, Result},
    future::{CancelReason, CancelToken},
};

const ACTIVE: u8 = 0;
const RELEASED: u8 = 1;
const EVICTED: u8 = 2;

/// One admitted execution as seen by the back pressure policy.
pub struct Admission {
    id: u64,
    state: AtomicU8,
    writing: AtomicBool,
    token: Arc<CancelToken>,
}

impl Admission {
    pub(crate) fn new(id: u64, token: Arc<CancelToken>) -> Arc<Self> {
        Arc::new(Self {
            id,
            state: AtomicU8::new(ACTIVE),
            writing: AtomicBool::new(false),
            token,
        })
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The execution started putting its request on the wire.
    #[inline]
    pub(crate) fn mark_writing(&self) {
        self.writing.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_writing(&self) -> bool {
        self.writing.load(Ordering::Acquire)
    }

    /// Flip ACTIVE to RELEASED; true only for the first caller.
    #[inline]
    fn try_release(&self) -> bool {
        self.state
            .compare_exchange(ACTIVE, RELEASED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[inline]
    fn try_evict(&self) -> bool {
        self.state
            .compare_exchange(ACTIVE, EVICTED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl fmt::Debug for Admission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Admission")
            .field("id", &self.id)
            .field("state", &self.state.load(Ordering::Relaxed))
            .field("writing", &self.is_writing())
            .finish()
    }
}

/// A pluggable admission policy. Implementations must be safe under
/// concurrent `acquire` from many caller threads.
pub trait BackPressure: Send + Sync + 'static {
    /// Admit `admission` or fail with a back pressure error naming the policy.
    fn acquire(&self, admission: &Arc<Admission>) -> Result<()>;
    /// Give back the slot held by `admission`. Called exactly once per
    /// successful `acquire`; must not decrement for an evicted admission.
    fn release(&self, admission: &Admission);
    fn in_flight(&self) -> usize;
    fn describe(&self) -> String;
}

/// Counts executions without bounding them.
#[derive(Debug, Default)]
pub struct NoBackPressure {
    in_flight: AtomicUsize,
}

impl NoBackPressure {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BackPressure for NoBackPressure {
    fn acquire(&self, _admission: &Arc<Admission>) -> Result<()> {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn release(&self, admission: &Admission) {
        if admission.try_release() {
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
        }
    }

    fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    fn describe(&self) -> String {
        "unbounded".to_string()
    }
}

/// Fails new executions once `capacity` are in flight.
#[derive(Debug)]
pub struct RejectingBackPressure {
    capacity: usize,
    in_flight: AtomicUsize,
}

impl RejectingBackPressure {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            in_flight: AtomicUsize::new(0),
        }
    }
}

impl BackPressure for RejectingBackPressure {
    fn acquire(&self, _admission: &Arc<Admission>) -> Result<()> {
        let mut current = self.in_flight.load(Ordering::Acquire);
        loop {
            if current >= self.capacity {
                #[cfg(feature = "logging")]
                tracing::debug!("rejecting admission, {current} in flight");
                return Err(HttpError::BackPressureRejected {
                    policy: self.describe(),
                });
            }
            match self.in_flight.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    fn release(&self, admission: &Admission) {
        if admission.try_release() {
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
        }
    }

    fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    fn describe(&self) -> String {
        format!("rejecting(capacity={})", self.capacity)
    }
}

/// Which admitted executions an evicting policy may preempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvictionScope {
    /// The oldest admitted execution, whatever it is doing.
    #[default]
    InFlight,
    /// Only executions that have not started writing their request. When none
    /// qualify, the newcomer is rejected instead.
    AwaitingConnection,
}

impl fmt::Display for EvictionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvictionScope::InFlight => f.write_str("in-flight"),
            EvictionScope::AwaitingConnection => f.write_str("awaiting-connection"),
        }
    }
}

/// Makes room for a new execution by failing the oldest one.
///
/// The victim's slot passes straight to the newcomer, so the counter does not
/// move on eviction.
#[derive(Debug)]
pub struct EvictingBackPressure {
    capacity: usize,
    scope: EvictionScope,
    in_flight: AtomicUsize,
    admitted: Mutex<VecDeque<Arc<Admission>>>,
}

impl EvictingBackPressure {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            scope: EvictionScope::default(),
            in_flight: AtomicUsize::new(0),
            admitted: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn with_scope(mut self, scope: EvictionScope) -> Self {
        self.scope = scope;
        self
    }
}

impl BackPressure for EvictingBackPressure {
    fn acquire(&self, admission: &Arc<Admission>) -> Result<()> {
        let mut admitted = self.admitted.lock();
        if admitted.len() < self.capacity {
            admitted.push_back(admission.clone());
            self.in_flight.fetch_add(1, Ordering::AcqRel);
            return Ok(());
        }

        let scope = self.scope;
        let victim = admitted
            .iter()
            .position(|a| scope == EvictionScope::InFlight || !a.is_writing());
        let Some(victim) = victim.and_then(|idx| admitted.remove(idx)) else {
            return Err(HttpError::BackPressureRejected {
                policy: self.describe(),
            });
        };
        admitted.push_back(admission.clone());
        drop(admitted);

        if victim.try_evict() {
            #[cfg(feature = "logging")]
            tracing::debug!(
                "admission {} evicted to make room for {}",
                victim.id,
                admission.id
            );
            victim.token.cancel(CancelReason::Evicted(self.describe()));
        } else {
            // The victim released concurrently and already gave its slot back.
            self.in_flight.fetch_add(1, Ordering::AcqRel);
        }
        Ok(())
    }

    fn release(&self, admission: &Admission) {
        if admission.try_release() {
            let mut admitted = self.admitted.lock();
            admitted.retain(|a| a.id != admission.id);
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
        }
    }

    fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    fn describe(&self) -> String {
        format!("evicting(capacity={}, scope={})", self.capacity, self.scope)
    }
}

/// Releases its admission when dropped, on every path out of an execution.
pub(crate) struct AdmissionGuard {
    back_pressure: Arc<dyn BackPressure>,
    admission: Arc<Admission>,
}

impl AdmissionGuard {
    pub(crate) fn new(back_pressure: Arc<dyn BackPressure>, admission: Arc<Admission>) -> Self {
        Self {
            back_pressure,
            admission,
        }
    }

    #[inline]
    pub(crate) fn admission(&self) -> &Arc<Admission> {
        &self.admission
    }
}

impl fmt::Debug for AdmissionGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionGuard")
            .field("policy", &self.back_pressure.describe())
            .field("admission", &self.admission)
            .finish()
    }
}

impl Drop for AdmissionGuard {
    fn drop(&mut self) {
        self.back_pressure.release(&self.admission);
    }
}

/// Admit `admission` under `back_pressure`, returning the guard that owns the slot.
pub(crate) fn admit(
    back_pressure: &Arc<dyn BackPressure>,
    admission: Arc<Admission>,
) -> Result<AdmissionGuard> {
    back_pressure.acquire(&admission)?;
    Ok(AdmissionGuard::new(back_pressure.clone(), admission))
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    fn admission(id: u64) -> (Arc<Admission>, Arc<CancelToken>) {
        let token = Arc::new(CancelToken::new());
        (Admission::new(id, token.clone()), token)
    }

    #[test]
    fn rejecting_fails_at_capacity_and_recovers() {
        let bp: Arc<dyn BackPressure> = Arc::new(RejectingBackPressure::new(1));
        let first = admit(&bp, admission(1).0).unwrap();
        let err = admit(&bp, admission(2).0).unwrap_err();
        match err {
            HttpError::BackPressureRejected { policy } => {
                assert_eq!(policy, "rejecting(capacity=1)")
            }
            other => panic!("unexpected {other:?}"),
        }
        drop(first);
        assert_eq!(bp.in_flight(), 0);
        assert!(admit(&bp, admission(3).0).is_ok());
    }

    #[test]
    fn guards_describe_their_policy() {
        let bp: Arc<dyn BackPressure> = Arc::new(RejectingBackPressure::new(1));
        let guard = admit(&bp, admission(9).0).unwrap();
        let shown = format!("{guard:?}");
        assert!(shown.contains("rejecting(capacity=1)"), "{shown}");
    }

    #[test]
    fn release_is_counted_once() {
        let bp = Arc::new(NoBackPressure::new());
        let (a, _) = admission(1);
        bp.acquire(&a).unwrap();
        bp.release(&a);
        bp.release(&a);
        assert_eq!(bp.in_flight(), 0);
    }

    #[test]
    fn evicting_cancels_oldest_and_transfers_its_slot() {
        let bp: Arc<dyn BackPressure> = Arc::new(EvictingBackPressure::new(1));
        let (a, a_token) = admission(1);
        let a_guard = admit(&bp, a).unwrap();
        let (b, b_token) = admission(2);
        let b_guard = admit(&bp, b).unwrap();

        assert_eq!(bp.in_flight(), 1);
        match a_token.reason() {
            Some(CancelReason::Evicted(policy)) => {
                assert_eq!(policy, "evicting(capacity=1, scope=in-flight)")
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(b_token.reason().is_none());

        // The victim's own release must not free the newcomer's slot.
        drop(a_guard);
        assert_eq!(bp.in_flight(), 1);
        drop(b_guard);
        assert_eq!(bp.in_flight(), 0);
    }

    #[test]
    fn awaiting_connection_scope_spares_writers() {
        let bp: Arc<dyn BackPressure> = Arc::new(
            EvictingBackPressure::new(1).with_scope(EvictionScope::AwaitingConnection),
        );
        let (a, a_token) = admission(1);
        let _a_guard = admit(&bp, a.clone()).unwrap();
        a.mark_writing();
        let err = admit(&bp, admission(2).0).unwrap_err();
        assert!(matches!(err, HttpError::BackPressureRejected { .. }));
        assert!(a_token.reason().is_none());
        assert_eq!(bp.in_flight(), 1);
    }

    #[test]
    fn concurrent_admission_never_exceeds_capacity() {
        let bp: Arc<dyn BackPressure> = Arc::new(RejectingBackPressure::new(8));
        let admitted = Arc::new(Mutex::new(Vec::new()));
        let handles: Vec<_> = (0..16)
            .map(|t| {
                let bp = bp.clone();
                let admitted = admitted.clone();
                thread::spawn(move || {
                    for i in 0..100 {
                        if let Ok(guard) = admit(&bp, admission(t * 1000 + i).0) {
                            admitted.lock().push(guard);
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(admitted.lock().len(), 8);
        assert_eq!(bp.in_flight(), 8);
        admitted.lock().clear();
        assert_eq!(bp.in_flight(), 0);
    }
}
