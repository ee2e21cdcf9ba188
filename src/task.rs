//! Task state machine
//!
//! The lifecycle contract every unit of work satisfies: leaves,
//! serial/parallel composites, dependency graphs, and decorators are all
//! driven through the same [`Task`] trait and [`TaskExt`] engine.
//!
//! Execution is single-threaded and cooperative. All transitions happen
//! on the caller's stack, and listeners fire inline, so a child task can
//! settle synchronously inside its own `run()` call and re-enter its
//! container's scheduling pass. Container code must therefore re-check
//! its own state after every child call instead of trusting loop-local
//! knowledge; that rule is load-bearing everywhere in this crate.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use serde_json::Value;
use tracing::trace;

use crate::error::{TaskError, TaskResult};
use crate::event::{ListenerId, ListenerTable, TaskEvent, TaskEventKind};
use crate::id::{next_task_id, TaskId};
use crate::state::TaskState;

/// Shared handle to a task object
pub type TaskRef = Rc<dyn Task>;

/// The outstanding "paused for another task" relation.
struct InterruptWait {
    target: Weak<dyn Task>,
    completed: ListenerId,
    errored: ListenerId,
}

/// Shared lifecycle state embedded in every task implementation.
///
/// Concrete tasks own one `TaskCore`, return it from [`Task::core`], and
/// settle themselves through [`TaskCore::complete`] and
/// [`TaskCore::error`]. Everything else (state checks, event dispatch,
/// payload bookkeeping) lives here so implementations only contain their
/// actual behavior.
pub struct TaskCore {
    id: TaskId,
    name: Option<String>,
    state: Cell<TaskState>,
    resumed_from: Cell<TaskState>,
    data: RefCell<Option<Value>>,
    error_message: RefCell<Option<String>>,
    listeners: RefCell<ListenerTable>,
    wait: RefCell<Option<InterruptWait>>,
    self_ref: RefCell<Option<Weak<dyn Task>>>,
}

impl TaskCore {
    /// Create a core with an id from the process-wide generator.
    #[must_use]
    pub fn new(name: Option<String>) -> Self {
        Self {
            id: next_task_id(),
            name,
            state: Cell::new(TaskState::Initialized),
            resumed_from: Cell::new(TaskState::Initialized),
            data: RefCell::new(None),
            error_message: RefCell::new(None),
            listeners: RefCell::new(ListenerTable::new()),
            wait: RefCell::new(None),
            self_ref: RefCell::new(None),
        }
    }

    /// Bind the owning task object.
    ///
    /// Constructors call this right after wrapping the task in an `Rc`;
    /// the weak reference is what lets `interrupt_for` re-run the task
    /// later without creating a reference cycle.
    pub fn bind(&self, task: Weak<dyn Task>) {
        *self.self_ref.borrow_mut() = Some(task);
    }

    /// The task's unique id.
    #[must_use]
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// The task's debug name, if any.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> TaskState {
        self.state.get()
    }

    /// The state this task was in when the current run started.
    ///
    /// Lets hooks distinguish a resume from `Interrupted` (keep
    /// accumulated progress) from a fresh run (start over).
    #[must_use]
    pub fn resumed_from(&self) -> TaskState {
        self.resumed_from.get()
    }

    /// Completion or error payload of the last settled run.
    #[must_use]
    pub fn data(&self) -> Option<Value> {
        self.data.borrow().clone()
    }

    /// Error message of the last errored run.
    #[must_use]
    pub fn error_message(&self) -> Option<String> {
        self.error_message.borrow().clone()
    }

    /// Settle the task successfully.
    ///
    /// Only valid while `Running`; stores the payload, then fires
    /// `Completed` followed by `Finished`.
    pub fn complete(&self, data: Option<Value>) -> TaskResult<()> {
        if self.state.get() != TaskState::Running {
            return Err(TaskError::InvalidStateTransition {
                from: self.state.get(),
                to: TaskState::Completed,
            });
        }
        *self.data.borrow_mut() = data;
        self.state.set(TaskState::Completed);
        trace!(task = %self.id, "task completed");
        self.fire(TaskEventKind::Completed);
        self.fire(TaskEventKind::Finished);
        Ok(())
    }

    /// Settle the task with an error.
    ///
    /// Only valid while `Running`; stores payload and message, then
    /// fires `Errored` followed by `Finished`.
    pub fn error(&self, data: Option<Value>, message: impl Into<String>) -> TaskResult<()> {
        if self.state.get() != TaskState::Running {
            return Err(TaskError::InvalidStateTransition {
                from: self.state.get(),
                to: TaskState::Errored,
            });
        }
        let message = message.into();
        *self.data.borrow_mut() = data;
        *self.error_message.borrow_mut() = Some(message.clone());
        self.state.set(TaskState::Errored);
        trace!(task = %self.id, %message, "task errored");
        self.fire(TaskEventKind::Errored);
        self.fire(TaskEventKind::Finished);
        Ok(())
    }

    /// Register a listener; every call appends a fresh entry.
    pub fn on(&self, kind: TaskEventKind, callback: impl Fn(&TaskEvent) + 'static) -> ListenerId {
        self.listeners
            .borrow_mut()
            .insert(kind, None, Rc::new(callback))
            .0
    }

    /// Register a listener under a key; duplicate keys are suppressed
    /// and the first registration wins (and keeps its dispatch slot).
    pub fn on_keyed(
        &self,
        kind: TaskEventKind,
        key: u64,
        callback: impl Fn(&TaskEvent) + 'static,
    ) -> ListenerId {
        self.listeners
            .borrow_mut()
            .insert(kind, Some(key), Rc::new(callback))
            .0
    }

    /// Remove a listener by id. Returns whether anything was removed.
    pub fn off(&self, kind: TaskEventKind, id: ListenerId) -> bool {
        self.listeners.borrow_mut().remove_id(kind, id)
    }

    /// Remove a keyed listener. Returns whether anything was removed.
    pub fn off_key(&self, kind: TaskEventKind, key: u64) -> bool {
        self.listeners.borrow_mut().remove_key(kind, key)
    }

    pub(crate) fn set_state(&self, state: TaskState) {
        self.state.set(state);
    }

    pub(crate) fn set_resumed_from(&self, state: TaskState) {
        self.resumed_from.set(state);
    }

    /// Drop payload and error message (entering a fresh run or a reset).
    pub(crate) fn clear_outcome(&self) {
        *self.data.borrow_mut() = None;
        *self.error_message.borrow_mut() = None;
    }

    /// Yank the task back to `Running` without firing `Started`.
    ///
    /// Used by the interrupt-for relation when the awaited task errors:
    /// the paused task is forced back in flight so it can be errored
    /// through the ordinary settle path.
    pub(crate) fn force_running(&self) {
        self.clear_outcome();
        self.state.set(TaskState::Running);
    }

    pub(crate) fn self_ref(&self) -> Option<Weak<dyn Task>> {
        self.self_ref.borrow().clone()
    }

    pub(crate) fn set_interrupt_wait(
        &self,
        target: &TaskRef,
        completed: ListenerId,
        errored: ListenerId,
    ) {
        *self.wait.borrow_mut() = Some(InterruptWait {
            target: Rc::downgrade(target),
            completed,
            errored,
        });
    }

    /// Detach the outstanding interrupt-for relation, if any.
    pub(crate) fn clear_interrupt_wait(&self) {
        let wait = self.wait.borrow_mut().take();
        if let Some(wait) = wait {
            if let Some(target) = wait.target.upgrade() {
                target.core().off(TaskEventKind::Completed, wait.completed);
                target.core().off(TaskEventKind::Errored, wait.errored);
            }
        }
    }

    /// Dispatch an event to a snapshot of the current listeners.
    ///
    /// No borrow is held while callbacks run, so listeners are free to
    /// mutate the registry or drive this task reentrantly.
    pub(crate) fn fire(&self, kind: TaskEventKind) {
        let event = TaskEvent {
            kind,
            task: self.id,
            state: self.state.get(),
            data: self.data.borrow().clone(),
            message: self.error_message.borrow().clone(),
        };
        let callbacks = self.listeners.borrow().snapshot(kind);
        for callback in callbacks {
            callback(&event);
        }
    }
}

/// A unit of work
///
/// Implementations embed a [`TaskCore`] and provide the three hooks.
/// `run_impl` must arrange for [`TaskCore::complete`] or
/// [`TaskCore::error`] to be called eventually — synchronously before it
/// returns, or later from a timer or another task's listener. An `Err`
/// from `run_impl` is a usage error: the engine both errors the task and
/// propagates the `Err` to the `run()` caller.
///
/// The trait is object-safe and single-threaded; task trees are wired
/// out of [`TaskRef`]s (`Rc<dyn Task>`).
pub trait Task {
    /// The embedded lifecycle state.
    fn core(&self) -> &TaskCore;

    /// Start doing the actual work.
    fn run_impl(self: Rc<Self>) -> TaskResult<()>;

    /// Cancel in-flight work (timers, children). Default: nothing.
    fn interrupt_impl(self: Rc<Self>) {}

    /// Drop per-run state beyond what the engine clears. Default: nothing.
    fn reset_impl(self: Rc<Self>) {}

    /// Total number of operations for progress reporting.
    ///
    /// Leaves count as one; containers sum over their children.
    fn operations_count(&self) -> usize {
        1
    }

    /// Completed operations for progress reporting.
    fn completed_operations_count(&self) -> usize {
        usize::from(self.core().state() == TaskState::Completed)
    }
}

/// Lifecycle engine for any `Rc`-held task.
///
/// Blanket-implemented for `Rc<T>` so the same calls work on concrete
/// handles (`Rc<Composite>`) and erased ones ([`TaskRef`]).
pub trait TaskExt {
    /// Start or resume the task.
    ///
    /// Fails with [`TaskError::AlreadyRunning`] while `Running`; a
    /// successful no-op when `Completed`. Otherwise clears the previous
    /// outcome and interrupt-for relation, enters `Running`, fires
    /// `Started`, and invokes the task's `run_impl`.
    fn run(&self) -> TaskResult<()>;

    /// Cooperatively cancel a running task. Resumable via [`TaskExt::run`].
    fn interrupt(&self) -> TaskResult<()>;

    /// Return a non-running task to `Initialized`.
    ///
    /// A no-op (without invoking the reset hook) when already
    /// `Initialized`.
    fn reset(&self) -> TaskResult<()>;

    /// Pause this task until `other` settles.
    ///
    /// Interrupts `self`, then arranges for `other`'s completion to
    /// re-run `self`, and for `other`'s error to error `self` with
    /// `other`'s payload. Only one relation can be outstanding; a second
    /// call replaces the first. `other` is not started by this call.
    fn interrupt_for(&self, other: &TaskRef) -> TaskResult<()>;

    /// Register an anonymous listener.
    fn on(&self, kind: TaskEventKind, callback: impl Fn(&TaskEvent) + 'static) -> ListenerId;
    /// Remove a listener by id.
    fn off(&self, kind: TaskEventKind, id: ListenerId) -> bool;

    /// Listener sugar for `Started`.
    fn started(&self, callback: impl Fn(&TaskEvent) + 'static) -> ListenerId;
    /// Listener sugar for `Interrupted`.
    fn interrupted(&self, callback: impl Fn(&TaskEvent) + 'static) -> ListenerId;
    /// Listener sugar for `Completed`.
    fn completed(&self, callback: impl Fn(&TaskEvent) + 'static) -> ListenerId;
    /// Listener sugar for `Errored`.
    fn errored(&self, callback: impl Fn(&TaskEvent) + 'static) -> ListenerId;
    /// Listener sugar for `Finished` (fires after either outcome).
    fn finished(&self, callback: impl Fn(&TaskEvent) + 'static) -> ListenerId;

    /// Current lifecycle state.
    fn state(&self) -> TaskState;
    /// Payload of the last settled run.
    fn data(&self) -> Option<Value>;
    /// Error message of the last errored run.
    fn error_message(&self) -> Option<String>;
    /// Unique id.
    fn id(&self) -> TaskId;
    /// Debug name, if any.
    fn name(&self) -> Option<String>;
}

impl<T: Task + ?Sized> TaskExt for Rc<T> {
    fn run(&self) -> TaskResult<()> {
        let core = self.core();
        let prior = core.state();
        match prior {
            TaskState::Running => return Err(TaskError::AlreadyRunning { id: core.id() }),
            TaskState::Completed => return Ok(()),
            _ => {}
        }
        core.clear_interrupt_wait();
        core.clear_outcome();
        core.set_resumed_from(prior);
        core.set_state(TaskState::Running);
        trace!(task = %core.id(), from = %prior, "task running");
        core.fire(TaskEventKind::Started);
        // A Started listener may have interrupted or settled the task.
        if core.state() != TaskState::Running {
            return Ok(());
        }
        if let Err(err) = Rc::clone(self).run_impl() {
            if core.state() == TaskState::Running {
                let _ = core.error(None, err.to_string());
            }
            return Err(err);
        }
        Ok(())
    }

    fn interrupt(&self) -> TaskResult<()> {
        let core = self.core();
        if core.state() != TaskState::Running {
            return Err(TaskError::InvalidStateTransition {
                from: core.state(),
                to: TaskState::Interrupted,
            });
        }
        core.set_state(TaskState::Interrupted);
        trace!(task = %core.id(), "task interrupted");
        Rc::clone(self).interrupt_impl();
        core.fire(TaskEventKind::Interrupted);
        Ok(())
    }

    fn reset(&self) -> TaskResult<()> {
        let core = self.core();
        match core.state() {
            TaskState::Running => Err(TaskError::InvalidStateTransition {
                from: TaskState::Running,
                to: TaskState::Initialized,
            }),
            TaskState::Initialized => Ok(()),
            _ => {
                core.clear_interrupt_wait();
                core.clear_outcome();
                core.set_state(TaskState::Initialized);
                trace!(task = %core.id(), "task reset");
                Rc::clone(self).reset_impl();
                Ok(())
            }
        }
    }

    fn interrupt_for(&self, other: &TaskRef) -> TaskResult<()> {
        match self.core().state() {
            TaskState::Running => self.interrupt()?,
            // Already paused: just replace the outstanding relation.
            TaskState::Interrupted => {}
            state => {
                return Err(TaskError::InvalidStateTransition {
                    from: state,
                    to: TaskState::Interrupted,
                })
            }
        }
        let core = self.core();
        core.clear_interrupt_wait();
        let Some(me) = core.self_ref() else {
            return Ok(());
        };
        let key = core.id().raw();

        let on_completed = {
            let me = me.clone();
            move |_event: &TaskEvent| {
                if let Some(me) = me.upgrade() {
                    if me.core().state() == TaskState::Interrupted {
                        me.core().clear_interrupt_wait();
                        let _ = me.run();
                    }
                }
            }
        };
        let on_errored = move |event: &TaskEvent| {
            if let Some(me) = me.upgrade() {
                if me.core().state() == TaskState::Interrupted {
                    me.core().clear_interrupt_wait();
                    me.core().force_running();
                    let message = event
                        .message
                        .clone()
                        .unwrap_or_else(|| "interrupting task errored".to_string());
                    let _ = me.core().error(event.data.clone(), message);
                }
            }
        };

        let completed = other
            .core()
            .on_keyed(TaskEventKind::Completed, key, on_completed);
        let errored = other.core().on_keyed(TaskEventKind::Errored, key, on_errored);
        core.set_interrupt_wait(other, completed, errored);
        Ok(())
    }

    fn on(&self, kind: TaskEventKind, callback: impl Fn(&TaskEvent) + 'static) -> ListenerId {
        self.core().on(kind, callback)
    }

    fn off(&self, kind: TaskEventKind, id: ListenerId) -> bool {
        self.core().off(kind, id)
    }

    fn started(&self, callback: impl Fn(&TaskEvent) + 'static) -> ListenerId {
        self.core().on(TaskEventKind::Started, callback)
    }

    fn interrupted(&self, callback: impl Fn(&TaskEvent) + 'static) -> ListenerId {
        self.core().on(TaskEventKind::Interrupted, callback)
    }

    fn completed(&self, callback: impl Fn(&TaskEvent) + 'static) -> ListenerId {
        self.core().on(TaskEventKind::Completed, callback)
    }

    fn errored(&self, callback: impl Fn(&TaskEvent) + 'static) -> ListenerId {
        self.core().on(TaskEventKind::Errored, callback)
    }

    fn finished(&self, callback: impl Fn(&TaskEvent) + 'static) -> ListenerId {
        self.core().on(TaskEventKind::Finished, callback)
    }

    fn state(&self) -> TaskState {
        self.core().state()
    }

    fn data(&self) -> Option<Value> {
        self.core().data()
    }

    fn error_message(&self) -> Option<String> {
        self.core().error_message()
    }

    fn id(&self) -> TaskId {
        self.core().id()
    }

    fn name(&self) -> Option<String> {
        self.core().name().map(str::to_owned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::leaf::{FnTask, ManualTask};
    use std::cell::RefCell;

    #[test]
    fn test_initial_state() {
        let task = ManualTask::new();
        assert_eq!(task.state(), TaskState::Initialized);
        assert_eq!(task.data(), None);
        assert_eq!(task.error_message(), None);
    }

    #[test]
    fn test_run_complete_lifecycle() {
        let task = ManualTask::new();
        task.run().unwrap();
        assert_eq!(task.state(), TaskState::Running);

        task.finish(Some(serde_json::json!({"n": 1}))).unwrap();
        assert_eq!(task.state(), TaskState::Completed);
        assert_eq!(task.data(), Some(serde_json::json!({"n": 1})));
    }

    #[test]
    fn test_run_while_running_fails() {
        let task = ManualTask::new();
        task.run().unwrap();
        assert!(matches!(
            task.run(),
            Err(TaskError::AlreadyRunning { .. })
        ));
    }

    #[test]
    fn test_run_on_completed_is_noop() {
        let fired = Rc::new(RefCell::new(0));
        let task = ManualTask::new();
        let f = Rc::clone(&fired);
        task.started(move |_| *f.borrow_mut() += 1);

        task.run().unwrap();
        task.finish(None).unwrap();
        task.run().unwrap();
        assert_eq!(task.state(), TaskState::Completed);
        assert_eq!(*fired.borrow(), 1);
    }

    #[test]
    fn test_interrupt_requires_running() {
        let task = ManualTask::new();
        assert!(matches!(
            task.interrupt(),
            Err(TaskError::InvalidStateTransition { .. })
        ));
    }

    #[test]
    fn test_rerun_clears_outcome() {
        let task = FnTask::new(|| Err("boom".to_string()));
        let _ = task.run();
        assert_eq!(task.state(), TaskState::Errored);
        assert_eq!(task.error_message(), Some("boom".to_string()));

        // Observe the cleared outcome from inside the Started event.
        let observed = Rc::new(RefCell::new(None));
        let o = Rc::clone(&observed);
        task.started(move |event| *o.borrow_mut() = Some(event.message.clone()));
        let _ = task.run();
        assert_eq!(*observed.borrow(), Some(None));
    }

    #[test]
    fn test_reset_is_idempotent_and_skips_hook() {
        let runs = Rc::new(RefCell::new(0));
        let r = Rc::clone(&runs);
        let task = FnTask::new(move || {
            *r.borrow_mut() += 1;
            Ok(None)
        });

        // Already initialized: nothing happens.
        task.reset().unwrap();
        assert_eq!(task.state(), TaskState::Initialized);

        task.run().unwrap();
        assert_eq!(task.state(), TaskState::Completed);
        task.reset().unwrap();
        assert_eq!(task.state(), TaskState::Initialized);
        assert_eq!(task.data(), None);
        assert_eq!(*runs.borrow(), 1);
    }

    #[test]
    fn test_reset_while_running_fails() {
        let task = ManualTask::new();
        task.run().unwrap();
        assert!(task.reset().is_err());
    }

    #[test]
    fn test_event_order_on_completion() {
        let order = Rc::new(RefCell::new(Vec::new()));
        let task = ManualTask::new();
        for kind in [
            TaskEventKind::Started,
            TaskEventKind::Completed,
            TaskEventKind::Finished,
        ] {
            let order = Rc::clone(&order);
            task.on(kind, move |event| order.borrow_mut().push(event.kind));
        }

        task.run().unwrap();
        task.finish(None).unwrap();
        assert_eq!(
            *order.borrow(),
            vec![
                TaskEventKind::Started,
                TaskEventKind::Completed,
                TaskEventKind::Finished
            ]
        );
    }

    #[test]
    fn test_off_removes_listener() {
        let fired = Rc::new(RefCell::new(0));
        let task = ManualTask::new();
        let f = Rc::clone(&fired);
        let id = task.started(move |_| *f.borrow_mut() += 1);
        assert!(task.off(TaskEventKind::Started, id));

        task.run().unwrap();
        assert_eq!(*fired.borrow(), 0);
    }

    #[test]
    fn test_interrupt_for_rerun_on_completion() {
        let paused = ManualTask::new();
        let gate = ManualTask::new();
        let gate_ref: TaskRef = gate.clone();

        paused.run().unwrap();
        paused.interrupt_for(&gate_ref).unwrap();
        assert_eq!(paused.state(), TaskState::Interrupted);

        gate.run().unwrap();
        gate.finish(None).unwrap();
        assert_eq!(paused.state(), TaskState::Running);
    }

    #[test]
    fn test_interrupt_for_error_propagates_payload() {
        let paused = ManualTask::new();
        let gate = ManualTask::new();
        let gate_ref: TaskRef = gate.clone();

        paused.run().unwrap();
        paused.interrupt_for(&gate_ref).unwrap();

        gate.run().unwrap();
        gate.fail(Some(serde_json::json!(7)), "gate broke").unwrap();
        assert_eq!(paused.state(), TaskState::Errored);
        assert_eq!(paused.data(), Some(serde_json::json!(7)));
        assert_eq!(paused.error_message(), Some("gate broke".to_string()));
    }

    #[test]
    fn test_interrupt_for_second_call_replaces_first() {
        let paused = ManualTask::new();
        let first = ManualTask::new();
        let second = ManualTask::new();
        let first_ref: TaskRef = first.clone();
        let second_ref: TaskRef = second.clone();

        paused.run().unwrap();
        paused.interrupt_for(&first_ref).unwrap();
        // Rewiring while already paused replaces the first relation.
        paused.interrupt_for(&second_ref).unwrap();

        first.run().unwrap();
        first.finish(None).unwrap();
        assert_eq!(paused.state(), TaskState::Interrupted);

        second.run().unwrap();
        second.finish(None).unwrap();
        assert_eq!(paused.state(), TaskState::Running);
    }
}
