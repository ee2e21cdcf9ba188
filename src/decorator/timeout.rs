//! Timeout decorator

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::TaskResult;
use crate::event::TaskEventKind;
use crate::state::TaskState;
use crate::task::{Task, TaskCore, TaskExt, TaskRef};
use crate::timer::{TimerDriver, TimerDriverRef, TimerId};

/// Enforces a wall-clock deadline on its child
///
/// A deadline timer runs beside the child; whichever settles first wins.
/// If the timer fires, the child is interrupted and the decorator errors
/// with a timeout message. Time spent running is accumulated across
/// interrupt/resume, so pausing the decorator does not stretch the total
/// budget; resuming with nothing left errors immediately.
pub struct Timeout {
    core: TaskCore,
    child: TaskRef,
    duration: Duration,
    timers: TimerDriverRef,
    /// Budget consumed by previous (interrupted) stretches of this run.
    consumed: Cell<Duration>,
    started_at: Cell<Option<Instant>>,
    pending: Cell<Option<TimerId>>,
    weak_self: RefCell<Weak<Timeout>>,
}

impl Timeout {
    /// Wrap `child` with a deadline.
    pub fn new(child: TaskRef, duration: Duration, timers: TimerDriverRef) -> Rc<Self> {
        let timeout = Rc::new(Self {
            core: TaskCore::new(None),
            child,
            duration,
            timers,
            consumed: Cell::new(Duration::ZERO),
            started_at: Cell::new(None),
            pending: Cell::new(None),
            weak_self: RefCell::new(Weak::new()),
        });
        *timeout.weak_self.borrow_mut() = Rc::downgrade(&timeout);
        let timeout_dyn: Rc<dyn Task> = timeout.clone();
        let weak: Weak<dyn Task> = Rc::downgrade(&timeout_dyn);
        timeout.core.bind(weak);
        timeout
    }

    /// The configured deadline.
    #[must_use]
    pub fn duration(&self) -> Duration {
        self.duration
    }

    fn attach(&self) {
        let key = self.core.id().raw();
        let weak = self.weak_self.borrow().clone();
        self.child
            .core()
            .on_keyed(TaskEventKind::Completed, key, move |event| {
                if let Some(timeout) = weak.upgrade() {
                    if timeout.core.state() == TaskState::Running {
                        timeout.cancel_pending();
                        timeout.detach();
                        let _ = timeout.core.complete(event.data.clone());
                    }
                }
            });
        let weak = self.weak_self.borrow().clone();
        self.child
            .core()
            .on_keyed(TaskEventKind::Errored, key, move |event| {
                if let Some(timeout) = weak.upgrade() {
                    if timeout.core.state() == TaskState::Running {
                        timeout.cancel_pending();
                        timeout.detach();
                        let message = event
                            .message
                            .clone()
                            .unwrap_or_else(|| "task errored".to_string());
                        let _ = timeout.core.error(event.data.clone(), message);
                    }
                }
            });
    }

    fn detach(&self) {
        let key = self.core.id().raw();
        self.child.core().off_key(TaskEventKind::Completed, key);
        self.child.core().off_key(TaskEventKind::Errored, key);
    }

    fn cancel_pending(&self) {
        if let Some(timer) = self.pending.take() {
            self.timers.cancel(timer);
        }
    }

    fn on_deadline(&self) {
        self.pending.set(None);
        if self.core.state() != TaskState::Running {
            return;
        }
        debug!(task = %self.core.id(), duration = ?self.duration, "deadline reached");
        self.detach();
        if self.child.core().state() == TaskState::Running {
            let _ = self.child.interrupt();
        }
        let _ = self
            .core
            .error(None, format!("timed out after {:?}", self.duration));
    }
}

impl Task for Timeout {
    fn core(&self) -> &TaskCore {
        &self.core
    }

    fn run_impl(self: Rc<Self>) -> TaskResult<()> {
        // Resuming an interrupted run keeps the budget already spent;
        // any other entry starts the clock over.
        if self.core.resumed_from() != TaskState::Interrupted {
            self.consumed.set(Duration::ZERO);
        }
        if self.child.core().state() == TaskState::Completed {
            return self.core.complete(self.child.core().data());
        }
        let remaining = self.duration.saturating_sub(self.consumed.get());
        if remaining.is_zero() {
            return self
                .core
                .error(None, format!("timed out after {:?}", self.duration));
        }
        self.attach();
        let weak = self.weak_self.borrow().clone();
        let timer = self.timers.schedule(
            remaining,
            Box::new(move || {
                if let Some(timeout) = weak.upgrade() {
                    timeout.on_deadline();
                }
            }),
        );
        self.pending.set(Some(timer));
        self.started_at.set(Some(self.timers.now()));
        self.child.run()?;
        Ok(())
    }

    fn interrupt_impl(self: Rc<Self>) {
        self.cancel_pending();
        if let Some(started) = self.started_at.take() {
            let elapsed = self.timers.now().saturating_duration_since(started);
            self.consumed.set(self.consumed.get() + elapsed);
        }
        self.detach();
        if self.child.core().state() == TaskState::Running {
            let _ = self.child.interrupt();
        }
    }

    fn reset_impl(self: Rc<Self>) {
        self.cancel_pending();
        self.consumed.set(Duration::ZERO);
        self.started_at.set(None);
        self.detach();
        let _ = self.child.reset();
    }

    fn operations_count(&self) -> usize {
        self.child.operations_count()
    }

    fn completed_operations_count(&self) -> usize {
        self.child.completed_operations_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::leaf::{FnTask, ManualTask};
    use crate::timer::ManualTimers;

    #[test]
    fn test_deadline_interrupts_stuck_child() {
        let timers = ManualTimers::new();
        let child = ManualTask::new();
        let timeout = Timeout::new(child.handle(), Duration::from_millis(100), timers.clone());

        timeout.run().unwrap();
        assert_eq!(child.state(), TaskState::Running);

        timers.advance(Duration::from_millis(99));
        assert_eq!(timeout.state(), TaskState::Running);

        timers.advance(Duration::from_millis(1));
        assert_eq!(timeout.state(), TaskState::Errored);
        assert_eq!(child.state(), TaskState::Interrupted);
        assert_eq!(
            timeout.error_message(),
            Some("timed out after 100ms".to_string())
        );
    }

    #[test]
    fn test_child_completion_cancels_deadline() {
        let timers = ManualTimers::new();
        let child = ManualTask::new();
        let timeout = Timeout::new(child.handle(), Duration::from_millis(100), timers.clone());

        timeout.run().unwrap();
        child.finish(Some(serde_json::json!("done"))).unwrap();
        assert_eq!(timeout.state(), TaskState::Completed);
        assert_eq!(timeout.data(), Some(serde_json::json!("done")));
        assert_eq!(timers.pending(), 0);

        // Nothing left to fire.
        timers.advance(Duration::from_millis(200));
        assert_eq!(timeout.state(), TaskState::Completed);
    }

    #[test]
    fn test_child_error_propagates() {
        let timers = ManualTimers::new();
        let child = FnTask::new(|| Err("inner failure".to_string()));
        let timeout = Timeout::new(child, Duration::from_millis(100), timers.clone());

        timeout.run().unwrap();
        assert_eq!(timeout.state(), TaskState::Errored);
        assert_eq!(
            timeout.error_message(),
            Some("inner failure".to_string())
        );
    }

    #[test]
    fn test_elapsed_time_survives_interrupt() {
        let timers = ManualTimers::new();
        let child = ManualTask::new();
        let timeout = Timeout::new(child.handle(), Duration::from_millis(100), timers.clone());

        timeout.run().unwrap();
        timers.advance(Duration::from_millis(60));
        timeout.interrupt().unwrap();

        // A long pause does not stretch the budget.
        timers.advance(Duration::from_millis(500));
        timeout.run().unwrap();
        assert_eq!(timeout.state(), TaskState::Running);

        // Only 40ms of budget remain.
        timers.advance(Duration::from_millis(40));
        assert_eq!(timeout.state(), TaskState::Errored);
    }

    #[test]
    fn test_fresh_run_restores_budget() {
        let timers = ManualTimers::new();
        let child = ManualTask::new();
        let timeout = Timeout::new(child.handle(), Duration::from_millis(100), timers.clone());

        timeout.run().unwrap();
        timers.advance(Duration::from_millis(100));
        assert_eq!(timeout.state(), TaskState::Errored);

        // Re-running after an error starts a full new budget.
        timeout.run().unwrap();
        timers.advance(Duration::from_millis(99));
        assert_eq!(timeout.state(), TaskState::Running);
        child.finish(None).unwrap();
        assert_eq!(timeout.state(), TaskState::Completed);
    }
}
