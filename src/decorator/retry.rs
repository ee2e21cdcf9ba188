//! Retry decorator

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::time::Duration;

use tracing::debug;

use crate::error::TaskResult;
use crate::event::TaskEventKind;
use crate::state::TaskState;
use crate::task::{Task, TaskCore, TaskExt, TaskRef};
use crate::timer::{TimerDriver, TimerDriverRef, TimerId};

/// Default retry budget.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Re-runs its child on error, up to a budget
///
/// A child error with budget left triggers another attempt, either
/// synchronously or after a configured delay; once the budget is spent
/// the child's last payload and message become the decorator's own
/// error. Interrupting the decorator resets the counter, so a resumed
/// run gets a fresh budget.
pub struct Retry {
    core: TaskCore,
    child: TaskRef,
    max_retries: u32,
    delay: Option<(Duration, TimerDriverRef)>,
    retries: Cell<u32>,
    pending: Cell<Option<TimerId>>,
    weak_self: RefCell<Weak<Retry>>,
}

impl Retry {
    /// Wrap `child` with the default budget and synchronous retries.
    pub fn new(child: TaskRef) -> Rc<Self> {
        Self::build(child, DEFAULT_MAX_RETRIES, None)
    }

    /// Wrap `child` with an explicit budget and synchronous retries.
    pub fn with_max_retries(child: TaskRef, max_retries: u32) -> Rc<Self> {
        Self::build(child, max_retries, None)
    }

    /// Wrap `child` with a delay between attempts.
    pub fn with_delay(
        child: TaskRef,
        max_retries: u32,
        delay: Duration,
        timers: TimerDriverRef,
    ) -> Rc<Self> {
        Self::build(child, max_retries, Some((delay, timers)))
    }

    fn build(
        child: TaskRef,
        max_retries: u32,
        delay: Option<(Duration, TimerDriverRef)>,
    ) -> Rc<Self> {
        let retry = Rc::new(Self {
            core: TaskCore::new(None),
            child,
            max_retries,
            delay,
            retries: Cell::new(0),
            pending: Cell::new(None),
            weak_self: RefCell::new(Weak::new()),
        });
        *retry.weak_self.borrow_mut() = Rc::downgrade(&retry);
        let retry_dyn: Rc<dyn Task> = retry.clone();
        let weak: Weak<dyn Task> = Rc::downgrade(&retry_dyn);
        retry.core.bind(weak);
        retry
    }

    /// Retries performed in the current (or last) run.
    #[must_use]
    pub fn retries(&self) -> u32 {
        self.retries.get()
    }

    /// The configured budget.
    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    fn attach(&self) {
        let key = self.core.id().raw();
        let weak = self.weak_self.borrow().clone();
        self.child
            .core()
            .on_keyed(TaskEventKind::Completed, key, move |event| {
                if let Some(retry) = weak.upgrade() {
                    if retry.core.state() == TaskState::Running {
                        retry.detach();
                        let _ = retry.core.complete(event.data.clone());
                    }
                }
            });
        let weak = self.weak_self.borrow().clone();
        self.child
            .core()
            .on_keyed(TaskEventKind::Errored, key, move |event| {
                if let Some(retry) = weak.upgrade() {
                    retry.on_child_errored(event.data.clone(), event.message.clone());
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
            if let Some((_, timers)) = &self.delay {
                timers.cancel(timer);
            }
        }
    }

    fn on_child_errored(
        &self,
        data: Option<serde_json::Value>,
        message: Option<String>,
    ) {
        if self.core.state() != TaskState::Running {
            return;
        }
        if self.retries.get() < self.max_retries {
            self.retries.set(self.retries.get() + 1);
            debug!(
                task = %self.core.id(),
                attempt = self.retries.get(),
                max = self.max_retries,
                "retrying child"
            );
            match &self.delay {
                None => {
                    let _ = self.child.run();
                }
                Some((delay, timers)) => {
                    let weak = self.weak_self.borrow().clone();
                    let timer = timers.schedule(
                        *delay,
                        Box::new(move || {
                            if let Some(retry) = weak.upgrade() {
                                retry.pending.set(None);
                                if retry.core.state() == TaskState::Running {
                                    let _ = retry.child.run();
                                }
                            }
                        }),
                    );
                    self.pending.set(Some(timer));
                }
            }
        } else {
            self.detach();
            let message = message.unwrap_or_else(|| "retry budget exhausted".to_string());
            let _ = self.core.error(data, message);
        }
    }
}

impl Task for Retry {
    fn core(&self) -> &TaskCore {
        &self.core
    }

    fn run_impl(self: Rc<Self>) -> TaskResult<()> {
        self.retries.set(0);
        if self.child.core().state() == TaskState::Completed {
            return self.core.complete(self.child.core().data());
        }
        self.attach();
        self.child.run()?;
        Ok(())
    }

    fn interrupt_impl(self: Rc<Self>) {
        self.retries.set(0);
        self.cancel_pending();
        self.detach();
        if self.child.core().state() == TaskState::Running {
            let _ = self.child.interrupt();
        }
    }

    fn reset_impl(self: Rc<Self>) {
        self.retries.set(0);
        self.cancel_pending();
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
    fn test_retry_bound_is_respected() {
        let attempts = Rc::new(Cell::new(0u32));
        let counter = Rc::clone(&attempts);
        let child = FnTask::new(move || {
            counter.set(counter.get() + 1);
            Err("always fails".to_string())
        });
        let retry = Retry::with_max_retries(child, 2);

        retry.run().unwrap();
        assert_eq!(retry.state(), TaskState::Errored);
        // Initial attempt plus two retries.
        assert_eq!(attempts.get(), 3);
        assert_eq!(retry.retries(), 2);
        assert_eq!(retry.error_message(), Some("always fails".to_string()));
    }

    #[test]
    fn test_retry_succeeds_after_transient_errors() {
        let attempts = Rc::new(Cell::new(0u32));
        let counter = Rc::clone(&attempts);
        let child = FnTask::new(move || {
            counter.set(counter.get() + 1);
            if counter.get() < 3 {
                Err("transient".to_string())
            } else {
                Ok(Some(serde_json::json!("third time lucky")))
            }
        });
        let retry = Retry::new(child);

        retry.run().unwrap();
        assert_eq!(retry.state(), TaskState::Completed);
        assert_eq!(retry.data(), Some(serde_json::json!("third time lucky")));
        assert_eq!(retry.retries(), 2);
        assert_eq!(attempts.get(), 3);
    }

    #[test]
    fn test_delayed_retry_waits_for_timer() {
        let timers = ManualTimers::new();
        let attempts = Rc::new(Cell::new(0u32));
        let counter = Rc::clone(&attempts);
        let child = FnTask::new(move || {
            counter.set(counter.get() + 1);
            Err("flaky".to_string())
        });
        let retry = Retry::with_delay(child, 1, Duration::from_millis(50), timers.clone());

        retry.run().unwrap();
        assert_eq!(attempts.get(), 1);
        assert_eq!(retry.state(), TaskState::Running);

        timers.advance(Duration::from_millis(49));
        assert_eq!(attempts.get(), 1);

        timers.advance(Duration::from_millis(1));
        assert_eq!(attempts.get(), 2);
        assert_eq!(retry.state(), TaskState::Errored);
    }

    #[test]
    fn test_interrupt_resets_counter_and_cancels_timer() {
        let timers = ManualTimers::new();
        let attempts = Rc::new(Cell::new(0u32));
        let counter = Rc::clone(&attempts);
        let child = FnTask::new(move || {
            counter.set(counter.get() + 1);
            Err("flaky".to_string())
        });
        let retry = Retry::with_delay(child, 3, Duration::from_millis(10), timers.clone());

        retry.run().unwrap();
        assert_eq!(retry.retries(), 1);

        retry.interrupt().unwrap();
        assert_eq!(retry.retries(), 0);

        // The cancelled timer never re-runs the child.
        timers.advance(Duration::from_millis(20));
        assert_eq!(attempts.get(), 1);
        assert_eq!(retry.state(), TaskState::Interrupted);
    }

    #[test]
    fn test_completed_child_completes_immediately() {
        let child = ManualTask::new();
        child.run().unwrap();
        child.finish(Some(serde_json::json!(1))).unwrap();

        let retry = Retry::new(child.handle());
        retry.run().unwrap();
        assert_eq!(retry.state(), TaskState::Completed);
        assert_eq!(retry.data(), Some(serde_json::json!(1)));
    }
}
