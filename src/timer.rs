//! Timer scheduling for delay-driven decorators
//!
//! The core never blocks, so anything time-based (retry back-off,
//! deadlines) goes through a [`TimerDriver`]: schedule a callback after a
//! delay, cancel it, and read the driver's notion of "now".
//!
//! Two drivers ship with the crate:
//! - [`ManualTimers`] — a virtual clock advanced explicitly by the
//!   caller. Fully deterministic; what every timing test uses, and
//!   embeddable in any event loop that can pump elapsed time.
//! - [`TokioTimers`] — real time on a current-thread tokio runtime
//!   (task trees are deliberately `!Send`, so timers spawn onto a
//!   [`tokio::task::LocalSet`]).

use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

/// Handle identifying a scheduled timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

/// Scheduler for one-shot delayed callbacks
pub trait TimerDriver {
    /// Arrange for `callback` to run once `delay` has elapsed.
    fn schedule(&self, delay: Duration, callback: Box<dyn FnOnce()>) -> TimerId;

    /// Cancel a scheduled timer; a no-op if it already fired.
    fn cancel(&self, timer: TimerId);

    /// The driver's current time.
    ///
    /// Elapsed-time accounting (e.g. a deadline paused and resumed) must
    /// use this rather than `Instant::now()` so it stays consistent with
    /// virtual clocks.
    fn now(&self) -> Instant;
}

/// Shared handle to a timer driver
pub type TimerDriverRef = Rc<dyn TimerDriver>;

/// Scheduled entry for the manual driver's priority queue.
///
/// Reverse ordering so `BinaryHeap` acts as a min-heap: earliest due
/// time first, insertion order breaking ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ScheduledTimer {
    due: Duration,
    seq: u64,
    id: u64,
}

impl PartialOrd for ScheduledTimer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledTimer {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct ManualState {
    epoch: Instant,
    elapsed: Duration,
    next_id: u64,
    next_seq: u64,
    queue: BinaryHeap<ScheduledTimer>,
    callbacks: HashMap<u64, Box<dyn FnOnce()>>,
}

/// Virtual-clock timer driver
///
/// Nothing fires until [`ManualTimers::advance`] moves the clock; due
/// callbacks then run synchronously, in deadline order, with the clock
/// positioned at each callback's own due time (so callbacks scheduling
/// follow-up timers see a consistent "now").
pub struct ManualTimers {
    state: RefCell<ManualState>,
}

impl ManualTimers {
    /// Create a driver with its clock at zero elapsed time.
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            state: RefCell::new(ManualState {
                epoch: Instant::now(),
                elapsed: Duration::ZERO,
                next_id: 1,
                next_seq: 1,
                queue: BinaryHeap::new(),
                callbacks: HashMap::new(),
            }),
        })
    }

    /// Total virtual time advanced so far.
    pub fn elapsed(&self) -> Duration {
        self.state.borrow().elapsed
    }

    /// Advance the clock, firing every timer that falls due.
    pub fn advance(&self, delta: Duration) {
        let target = self.state.borrow().elapsed + delta;
        loop {
            let fired = {
                let mut state = self.state.borrow_mut();
                match state.queue.peek().copied() {
                    Some(entry) if entry.due <= target => {
                        state.queue.pop();
                        // Position the clock at the deadline before the
                        // callback runs; later timers still pending.
                        if entry.due > state.elapsed {
                            state.elapsed = entry.due;
                        }
                        state.callbacks.remove(&entry.id)
                    }
                    _ => break,
                }
            };
            // Cancelled timers leave a stale heap entry behind.
            if let Some(callback) = fired {
                callback();
            }
        }
        let mut state = self.state.borrow_mut();
        if target > state.elapsed {
            state.elapsed = target;
        }
    }

    /// Number of timers still pending.
    pub fn pending(&self) -> usize {
        self.state.borrow().callbacks.len()
    }
}

impl TimerDriver for ManualTimers {
    fn schedule(&self, delay: Duration, callback: Box<dyn FnOnce()>) -> TimerId {
        let mut state = self.state.borrow_mut();
        let id = state.next_id;
        state.next_id += 1;
        let seq = state.next_seq;
        state.next_seq += 1;
        let due = state.elapsed + delay;
        state.queue.push(ScheduledTimer { due, seq, id });
        state.callbacks.insert(id, callback);
        TimerId(id)
    }

    fn cancel(&self, timer: TimerId) {
        self.state.borrow_mut().callbacks.remove(&timer.0);
    }

    fn now(&self) -> Instant {
        let state = self.state.borrow();
        state.epoch + state.elapsed
    }
}

struct TokioState {
    next_id: u64,
    handles: HashMap<u64, tokio::task::JoinHandle<()>>,
}

/// Real-time timer driver backed by tokio
///
/// Must be used from within a [`tokio::task::LocalSet`] on a
/// current-thread runtime: callbacks touch `Rc`-held task state and are
/// spawned with `spawn_local`.
pub struct TokioTimers {
    state: RefCell<TokioState>,
    weak_self: RefCell<Weak<TokioTimers>>,
}

impl TokioTimers {
    /// Create a driver.
    pub fn new() -> Rc<Self> {
        let driver = Rc::new(Self {
            state: RefCell::new(TokioState {
                next_id: 1,
                handles: HashMap::new(),
            }),
            weak_self: RefCell::new(Weak::new()),
        });
        *driver.weak_self.borrow_mut() = Rc::downgrade(&driver);
        driver
    }
}

impl TimerDriver for TokioTimers {
    fn schedule(&self, delay: Duration, callback: Box<dyn FnOnce()>) -> TimerId {
        let id = {
            let mut state = self.state.borrow_mut();
            let id = state.next_id;
            state.next_id += 1;
            id
        };
        let weak = self.weak_self.borrow().clone();
        let handle = tokio::task::spawn_local(async move {
            tokio::time::sleep(delay).await;
            callback();
            if let Some(driver) = weak.upgrade() {
                driver.state.borrow_mut().handles.remove(&id);
            }
        });
        self.state.borrow_mut().handles.insert(id, handle);
        TimerId(id)
    }

    fn cancel(&self, timer: TimerId) {
        if let Some(handle) = self.state.borrow_mut().handles.remove(&timer.0) {
            handle.abort();
        }
    }

    fn now(&self) -> Instant {
        Instant::now()
    }
}
