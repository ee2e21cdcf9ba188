//! Failsafe decorator

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::error::TaskResult;
use crate::event::TaskEventKind;
use crate::state::TaskState;
use crate::task::{Task, TaskCore, TaskExt, TaskRef};

/// Converts child errors into successful completions
///
/// Makes a branch best-effort: the child's completion payload is
/// forwarded, but a child error completes the decorator with no payload.
/// The child itself still ends up `Errored` and can be inspected.
pub struct Failsafe {
    core: TaskCore,
    child: TaskRef,
    weak_self: RefCell<Weak<Failsafe>>,
}

impl Failsafe {
    /// Wrap `child`.
    pub fn new(child: TaskRef) -> Rc<Self> {
        let failsafe = Rc::new(Self {
            core: TaskCore::new(None),
            child,
            weak_self: RefCell::new(Weak::new()),
        });
        *failsafe.weak_self.borrow_mut() = Rc::downgrade(&failsafe);
        let failsafe_dyn: Rc<dyn Task> = failsafe.clone();
        let weak: Weak<dyn Task> = Rc::downgrade(&failsafe_dyn);
        failsafe.core.bind(weak);
        failsafe
    }

    /// The wrapped task.
    #[must_use]
    pub fn child(&self) -> &TaskRef {
        &self.child
    }

    fn attach(&self) {
        let key = self.core.id().raw();
        let weak = self.weak_self.borrow().clone();
        self.child
            .core()
            .on_keyed(TaskEventKind::Completed, key, move |event| {
                if let Some(failsafe) = weak.upgrade() {
                    if failsafe.core.state() == TaskState::Running {
                        failsafe.detach();
                        let _ = failsafe.core.complete(event.data.clone());
                    }
                }
            });
        let weak = self.weak_self.borrow().clone();
        self.child
            .core()
            .on_keyed(TaskEventKind::Errored, key, move |_| {
                if let Some(failsafe) = weak.upgrade() {
                    if failsafe.core.state() == TaskState::Running {
                        // Swallow the failure; the payload is dropped.
                        failsafe.detach();
                        let _ = failsafe.core.complete(None);
                    }
                }
            });
    }

    fn detach(&self) {
        let key = self.core.id().raw();
        self.child.core().off_key(TaskEventKind::Completed, key);
        self.child.core().off_key(TaskEventKind::Errored, key);
    }
}

impl Task for Failsafe {
    fn core(&self) -> &TaskCore {
        &self.core
    }

    fn run_impl(self: Rc<Self>) -> TaskResult<()> {
        if self.child.core().state() == TaskState::Completed {
            return self.core.complete(self.child.core().data());
        }
        self.attach();
        self.child.run()?;
        Ok(())
    }

    fn interrupt_impl(self: Rc<Self>) {
        self.detach();
        if self.child.core().state() == TaskState::Running {
            let _ = self.child.interrupt();
        }
    }

    fn reset_impl(self: Rc<Self>) {
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

    #[test]
    fn test_error_becomes_completion() {
        let child = FnTask::new(|| Err("doomed".to_string()));
        let failsafe = Failsafe::new(child.clone());

        failsafe.run().unwrap();
        assert_eq!(failsafe.state(), TaskState::Completed);
        assert_eq!(failsafe.data(), None);
        assert_eq!(failsafe.error_message(), None);
        // The child's own failure is still observable.
        assert_eq!(child.state(), TaskState::Errored);
    }

    #[test]
    fn test_success_payload_is_forwarded() {
        let child = FnTask::new(|| Ok(Some(serde_json::json!(42))));
        let failsafe = Failsafe::new(child);

        failsafe.run().unwrap();
        assert_eq!(failsafe.state(), TaskState::Completed);
        assert_eq!(failsafe.data(), Some(serde_json::json!(42)));
    }

    #[test]
    fn test_interrupt_cascades() {
        let child = ManualTask::new();
        let failsafe = Failsafe::new(child.handle());

        failsafe.run().unwrap();
        failsafe.interrupt().unwrap();
        assert_eq!(child.state(), TaskState::Interrupted);

        // A stale child error after interruption is ignored.
        child.run().unwrap();
        child.fail(None, "late").unwrap();
        assert_eq!(failsafe.state(), TaskState::Interrupted);
    }
}
