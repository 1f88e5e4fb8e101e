//! Worker coordination.
//!
//! The scheduler mediates the drainer, the reorganization worker and the
//! flush path without any component holding references into another:
//!
//! - reorganization requests go through a priority queue (priority first,
//!   FIFO within a priority). The writer files High requests when a
//!   secondary log runs low on free segments; the periodic survey files
//!   Low requests for logs above the activation threshold.
//! - every secondary log has a [`LogGate`]: an `IDLE → WRITING → IDLE` /
//!   `IDLE → REORG → IDLE` state machine handing out exclusive tokens, so
//!   a secondary-buffer flush never overlaps a segment copy on the same
//!   log.
//! - a pending High request is visible through an atomic, letting the
//!   reorganizer poll for preemption mid-segment without touching the
//!   queue lock on the fast path.

use chunklog_core::RangeKey;
use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashSet;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// Urgency of a reorganization request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ReorgPriority {
    /// Survey found the log above the activation threshold.
    Low,
    /// The writer is running out of free segments.
    High,
}

#[derive(Debug)]
struct Request {
    key: RangeKey,
    priority: ReorgPriority,
    seq: u64,
}

impl PartialEq for Request {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Request {}

// Max-heap: higher priority first, then older (lower seq) first.
impl Ord for Request {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.priority
            .cmp(&other.priority)
            .then(other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Request {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// What the reorganization worker should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerTick {
    Reorganize(RangeKey, ReorgPriority),
    /// No request arrived within the survey interval.
    Survey,
    Shutdown,
}

struct QueueState {
    heap: BinaryHeap<Request>,
    /// Deduplicates identical outstanding requests.
    enqueued: FxHashSet<(RangeKey, ReorgPriority)>,
}

pub struct Scheduler {
    queue: Mutex<QueueState>,
    queue_cv: Condvar,
    seq: AtomicU64,
    high_pending: AtomicUsize,
    shutdown: AtomicBool,
}

impl Scheduler {
    pub fn new() -> Self {
        Scheduler {
            queue: Mutex::new(QueueState {
                heap: BinaryHeap::new(),
                enqueued: FxHashSet::default(),
            }),
            queue_cv: Condvar::new(),
            seq: AtomicU64::new(0),
            high_pending: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
        }
    }

    /// File a reorganization request; duplicates collapse.
    pub fn request_reorganization(&self, key: RangeKey, priority: ReorgPriority) {
        if self.shutdown.load(Ordering::Acquire) {
            return;
        }
        let mut queue = self.queue.lock();
        if !queue.enqueued.insert((key, priority)) {
            return;
        }
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        queue.heap.push(Request { key, priority, seq });
        if priority == ReorgPriority::High {
            self.high_pending.fetch_add(1, Ordering::Release);
        }
        self.queue_cv.notify_one();
    }

    /// Block for the next request, or time out into a survey pass.
    pub fn wait_next(&self, survey_interval: Duration) -> SchedulerTick {
        let mut queue = self.queue.lock();
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                return SchedulerTick::Shutdown;
            }
            if let Some(request) = queue.heap.pop() {
                queue.enqueued.remove(&(request.key, request.priority));
                if request.priority == ReorgPriority::High {
                    self.high_pending.fetch_sub(1, Ordering::Release);
                }
                return SchedulerTick::Reorganize(request.key, request.priority);
            }
            if self
                .queue_cv
                .wait_for(&mut queue, survey_interval)
                .timed_out()
            {
                return SchedulerTick::Survey;
            }
        }
    }

    /// Should a low-priority compaction of `current` step aside? True when
    /// a High request for a *different* range is queued.
    pub fn should_preempt(&self, current: RangeKey) -> bool {
        if self.high_pending.load(Ordering::Acquire) == 0 {
            return false;
        }
        let queue = self.queue.lock();
        queue
            .heap
            .iter()
            .any(|r| r.priority == ReorgPriority::High && r.key != current)
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        let _queue = self.queue.lock();
        self.queue_cv.notify_all();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

// ---- per-log exclusive tokens ----------------------------------------------

/// What a gate token is held for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatePurpose {
    Writing,
    Reorg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GateState {
    Idle,
    Writing,
    Reorg,
}

/// Exclusive-access state machine of one secondary log.
pub struct LogGate {
    state: Mutex<GateState>,
    cv: Condvar,
}

impl LogGate {
    pub fn new() -> Self {
        LogGate {
            state: Mutex::new(GateState::Idle),
            cv: Condvar::new(),
        }
    }

    /// Block until the log is idle, then hold it for `purpose`.
    pub fn acquire(&self, purpose: GatePurpose) -> GateToken<'_> {
        let mut state = self.state.lock();
        while *state != GateState::Idle {
            self.cv.wait(&mut state);
        }
        *state = match purpose {
            GatePurpose::Writing => GateState::Writing,
            GatePurpose::Reorg => GateState::Reorg,
        };
        GateToken { gate: self }
    }
}

impl Default for LogGate {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII token; releases the gate back to idle on drop.
pub struct GateToken<'a> {
    gate: &'a LogGate,
}

impl Drop for GateToken<'_> {
    fn drop(&mut self) {
        let mut state = self.gate.state.lock();
        *state = GateState::Idle;
        self.gate.cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn key(range: u16) -> RangeKey {
        RangeKey::new(1, range)
    }

    #[test]
    fn high_priority_pops_first() {
        let scheduler = Scheduler::new();
        scheduler.request_reorganization(key(1), ReorgPriority::Low);
        scheduler.request_reorganization(key(2), ReorgPriority::Low);
        scheduler.request_reorganization(key(3), ReorgPriority::High);

        assert_eq!(
            scheduler.wait_next(Duration::from_millis(10)),
            SchedulerTick::Reorganize(key(3), ReorgPriority::High)
        );
        // FIFO within a priority.
        assert_eq!(
            scheduler.wait_next(Duration::from_millis(10)),
            SchedulerTick::Reorganize(key(1), ReorgPriority::Low)
        );
        assert_eq!(
            scheduler.wait_next(Duration::from_millis(10)),
            SchedulerTick::Reorganize(key(2), ReorgPriority::Low)
        );
    }

    #[test]
    fn duplicate_requests_collapse() {
        let scheduler = Scheduler::new();
        scheduler.request_reorganization(key(1), ReorgPriority::Low);
        scheduler.request_reorganization(key(1), ReorgPriority::Low);
        assert!(matches!(
            scheduler.wait_next(Duration::from_millis(10)),
            SchedulerTick::Reorganize(_, _)
        ));
        assert_eq!(
            scheduler.wait_next(Duration::from_millis(10)),
            SchedulerTick::Survey
        );
    }

    #[test]
    fn empty_queue_times_out_into_survey() {
        let scheduler = Scheduler::new();
        assert_eq!(
            scheduler.wait_next(Duration::from_millis(10)),
            SchedulerTick::Survey
        );
    }

    #[test]
    fn preemption_only_for_other_ranges() {
        let scheduler = Scheduler::new();
        assert!(!scheduler.should_preempt(key(1)));

        scheduler.request_reorganization(key(1), ReorgPriority::High);
        // The pending High request is for the range being compacted.
        assert!(!scheduler.should_preempt(key(1)));
        assert!(scheduler.should_preempt(key(2)));
    }

    #[test]
    fn shutdown_wakes_the_worker() {
        let scheduler = Arc::new(Scheduler::new());
        let s = Arc::clone(&scheduler);
        let worker = std::thread::spawn(move || s.wait_next(Duration::from_secs(60)));
        std::thread::sleep(Duration::from_millis(50));
        scheduler.shutdown();
        assert_eq!(worker.join().unwrap(), SchedulerTick::Shutdown);
    }

    #[test]
    fn gate_is_exclusive() {
        let gate = Arc::new(LogGate::new());
        let token = gate.acquire(GatePurpose::Writing);

        let gate2 = Arc::clone(&gate);
        let waiter = std::thread::spawn(move || {
            let _token = gate2.acquire(GatePurpose::Reorg);
        });
        std::thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());

        drop(token);
        waiter.join().unwrap();
    }
}
