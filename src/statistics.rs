use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

#[derive(Default)]
struct Counters {
    accepted: AtomicUsize,
    rejected: AtomicUsize,
    active: AtomicUsize,
    messages: AtomicUsize,
}

/// Process-wide connection counters.
///
/// Cheap to clone and update from any worker; read at shutdown for the
/// final report and by tests checking admission behavior.
///
/// # Test
///
/// ```
/// use rdma_broker::statistics::Statistics;
///
/// let statistics = Statistics::default();
///
/// statistics.on_accepted();
/// statistics.worker_started();
///
/// assert_eq!(statistics.accepted(), 1);
/// assert_eq!(statistics.active(), 1);
///
/// statistics.worker_finished();
/// assert_eq!(statistics.active(), 0);
/// ```
#[derive(Default, Clone)]
pub struct Statistics(Arc<Counters>);

impl Statistics {
    pub fn on_accepted(&self) {
        self.0.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_rejected(&self) {
        self.0.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_message(&self) {
        self.0.messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn worker_started(&self) {
        self.0.active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn worker_finished(&self) {
        self.0.active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn accepted(&self) -> usize {
        self.0.accepted.load(Ordering::Relaxed)
    }

    pub fn rejected(&self) -> usize {
        self.0.rejected.load(Ordering::Relaxed)
    }

    pub fn active(&self) -> usize {
        self.0.active.load(Ordering::Relaxed)
    }

    pub fn messages(&self) -> usize {
        self.0.messages.load(Ordering::Relaxed)
    }
}
