//! Serial / parallel composite executor
//!
//! Runs a queue of child tasks either one at a time in insertion order
//! (serial) or all at once (parallel), and settles itself from the
//! children's outcomes. Children can settle synchronously inside their
//! own `run()` call, so every scheduling step re-checks the composite's
//! state before continuing.

use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::rc::{Rc, Weak};

use serde_json::Value;
use tracing::debug;

use crate::error::{TaskError, TaskResult};
use crate::event::TaskEventKind;
use crate::id::TaskId;
use crate::state::TaskState;
use crate::task::{Task, TaskCore, TaskExt, TaskRef};

/// Execution mode for a [`Composite`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompositeMode {
    /// Start every queued child at once; settle when all have settled.
    Parallel,
    /// Run children strictly in insertion order, one at a time.
    Serial,
}

/// Container running children all-at-once or one-at-a-time
///
/// Completion policy: in parallel mode the composite waits for *every*
/// child to complete or error before settling — one child's error does
/// not cut the others short. In serial mode the first child error errors
/// the composite immediately (that child's payload and message are
/// forwarded) and un-started children stay `Initialized`. Re-running an
/// errored or interrupted composite resumes: already-completed children
/// are never re-run.
pub struct Composite {
    core: TaskCore,
    mode: CompositeMode,
    children: RefCell<Vec<TaskRef>>,
    /// Next child to start (serial mode only).
    cursor: Cell<usize>,
    /// Children that reached `Completed` this run.
    done: RefCell<HashSet<TaskId>>,
    /// Children that reached `Errored` this run.
    failed: RefCell<HashSet<TaskId>>,
    weak_self: RefCell<Weak<Composite>>,
}

impl Composite {
    /// Create an empty composite.
    pub fn new(mode: CompositeMode) -> Rc<Self> {
        Self::build(None, mode)
    }

    /// Create an empty named composite.
    pub fn named(name: impl Into<String>, mode: CompositeMode) -> Rc<Self> {
        Self::build(Some(name.into()), mode)
    }

    fn build(name: Option<String>, mode: CompositeMode) -> Rc<Self> {
        let composite = Rc::new(Self {
            core: TaskCore::new(name),
            mode,
            children: RefCell::new(Vec::new()),
            cursor: Cell::new(0),
            done: RefCell::new(HashSet::new()),
            failed: RefCell::new(HashSet::new()),
            weak_self: RefCell::new(Weak::new()),
        });
        *composite.weak_self.borrow_mut() = Rc::downgrade(&composite);
        let composite_dyn: Rc<dyn Task> = composite.clone();
        let weak: Weak<dyn Task> = Rc::downgrade(&composite_dyn);
        composite.core.bind(weak);
        composite
    }

    /// The composite's execution mode.
    #[must_use]
    pub fn mode(&self) -> CompositeMode {
        self.mode
    }

    /// Number of queued children.
    #[must_use]
    pub fn len(&self) -> usize {
        self.children.borrow().len()
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.children.borrow().is_empty()
    }

    /// Append a child.
    ///
    /// While the composite is running, an eligible child starts
    /// immediately: always in parallel mode, and in serial mode when it
    /// lands exactly at the cursor.
    pub fn add(&self, task: TaskRef) -> TaskResult<()> {
        let id = task.core().id();
        if self.position(id).is_some() {
            return Err(TaskError::DuplicateTask { id });
        }
        self.children.borrow_mut().push(task.clone());
        debug!(composite = %self.core.id(), child = %id, "child added");

        if self.core.state() == TaskState::Running {
            match self.mode {
                CompositeMode::Parallel => self.start_or_mark(&task),
                CompositeMode::Serial => {
                    if self.cursor.get() + 1 == self.children.borrow().len() {
                        self.run_next_serial();
                    }
                }
            }
        }
        Ok(())
    }

    /// Append several children.
    pub fn add_all(&self, tasks: impl IntoIterator<Item = TaskRef>) -> TaskResult<()> {
        for task in tasks {
            self.add(task)?;
        }
        Ok(())
    }

    /// Remove a child.
    ///
    /// A removed child that was `Running` or `Interrupted` counts as
    /// finished for scheduling, so the composite keeps making progress;
    /// the child itself is left as-is, only detached.
    pub fn remove(&self, task: &TaskRef) -> TaskResult<()> {
        let id = task.core().id();
        let Some(index) = self.position(id) else {
            return Err(TaskError::NotFound { id });
        };
        self.detach(task);
        self.children.borrow_mut().remove(index);
        self.done.borrow_mut().remove(&id);
        self.failed.borrow_mut().remove(&id);
        debug!(composite = %self.core.id(), child = %id, "child removed");

        if self.mode == CompositeMode::Serial && index < self.cursor.get() {
            self.cursor.set(self.cursor.get() - 1);
        }
        if self.core.state() == TaskState::Running {
            match self.mode {
                CompositeMode::Parallel => self.try_settle_parallel(),
                CompositeMode::Serial => {
                    if index == self.cursor.get() {
                        self.run_next_serial();
                    }
                }
            }
        }
        Ok(())
    }

    /// Interrupt running children and drop the whole queue.
    ///
    /// Children are detached in reverse order so draining never
    /// auto-starts a "next" child. With `do_not_complete` the composite
    /// stays running on an empty queue — the escape hatch for subclass
    /// behavior that only learns its real child set mid-run and wants to
    /// repopulate; otherwise an emptied running composite completes.
    pub fn flush_queue(&self, do_not_complete: bool) {
        let children: Vec<TaskRef> = self.children.borrow().clone();
        for child in children.iter().rev() {
            self.detach(child);
            if child.core().state() == TaskState::Running {
                let _ = child.interrupt();
            }
        }
        self.children.borrow_mut().clear();
        self.done.borrow_mut().clear();
        self.failed.borrow_mut().clear();
        self.cursor.set(0);
        debug!(composite = %self.core.id(), flushed = children.len(), "queue flushed");

        if !do_not_complete && self.core.state() == TaskState::Running {
            let _ = self.core.complete(None);
        }
    }

    fn position(&self, id: TaskId) -> Option<usize> {
        self.children
            .borrow()
            .iter()
            .position(|c| c.core().id() == id)
    }

    fn attach(&self, child: &TaskRef) {
        let key = self.core.id().raw();
        let id = child.core().id();
        let weak = self.weak_self.borrow().clone();
        child.core().on_keyed(TaskEventKind::Completed, key, move |_| {
            if let Some(composite) = weak.upgrade() {
                composite.on_child_completed(id);
            }
        });
        let weak = self.weak_self.borrow().clone();
        child.core().on_keyed(TaskEventKind::Errored, key, move |event| {
            if let Some(composite) = weak.upgrade() {
                composite.on_child_errored(id, event.data.clone(), event.message.clone());
            }
        });
    }

    fn detach(&self, child: &TaskRef) {
        let key = self.core.id().raw();
        child.core().off_key(TaskEventKind::Completed, key);
        child.core().off_key(TaskEventKind::Errored, key);
    }

    fn detach_all(&self) {
        let children: Vec<TaskRef> = self.children.borrow().clone();
        for child in &children {
            self.detach(child);
        }
    }

    /// Start a child, or just account for it if it already completed.
    fn start_or_mark(&self, child: &TaskRef) {
        if child.core().state() == TaskState::Completed {
            self.done.borrow_mut().insert(child.core().id());
            self.try_settle_parallel();
            return;
        }
        self.attach(child);
        if let Err(err) = child.run() {
            debug!(composite = %self.core.id(), child = %child.core().id(), %err, "child failed to start");
        }
    }

    /// Advance the serial cursor to the next incomplete child and start
    /// it; completes the composite when the queue is exhausted.
    fn run_next_serial(&self) {
        loop {
            if self.core.state() != TaskState::Running {
                return;
            }
            let next = {
                let children = self.children.borrow();
                children.get(self.cursor.get()).cloned()
            };
            let Some(child) = next else {
                let _ = self.core.complete(None);
                return;
            };
            if child.core().state() == TaskState::Completed {
                self.done.borrow_mut().insert(child.core().id());
                self.cursor.set(self.cursor.get() + 1);
                continue;
            }
            self.attach(&child);
            if let Err(err) = child.run() {
                debug!(composite = %self.core.id(), child = %child.core().id(), %err, "child failed to start");
            }
            return;
        }
    }

    /// Parallel settle check: every child accounted for → settle.
    fn try_settle_parallel(&self) {
        if self.core.state() != TaskState::Running {
            return;
        }
        let total = self.children.borrow().len();
        let all_settled = {
            let done = self.done.borrow();
            let failed = self.failed.borrow();
            self.children
                .borrow()
                .iter()
                .all(|c| done.contains(&c.core().id()) || failed.contains(&c.core().id()))
        };
        if !all_settled {
            return;
        }
        let failures = self.failed.borrow().len();
        if failures > 0 {
            self.detach_all();
            let _ = self
                .core
                .error(None, format!("{failures} of {total} tasks errored"));
        } else {
            let _ = self.core.complete(None);
        }
    }

    fn on_child_completed(&self, id: TaskId) {
        if self.core.state() != TaskState::Running {
            return;
        }
        self.done.borrow_mut().insert(id);
        match self.mode {
            CompositeMode::Parallel => self.try_settle_parallel(),
            CompositeMode::Serial => {
                self.cursor.set(self.cursor.get() + 1);
                self.run_next_serial();
            }
        }
    }

    fn on_child_errored(&self, id: TaskId, data: Option<Value>, message: Option<String>) {
        if self.core.state() != TaskState::Running {
            return;
        }
        self.failed.borrow_mut().insert(id);
        match self.mode {
            CompositeMode::Parallel => self.try_settle_parallel(),
            CompositeMode::Serial => {
                // First error halts the queue; forward the child's outcome.
                self.detach_all();
                let message =
                    message.unwrap_or_else(|| format!("task '{id}' errored"));
                let _ = self.core.error(data, message);
            }
        }
    }
}

impl Task for Composite {
    fn core(&self) -> &TaskCore {
        &self.core
    }

    fn run_impl(self: Rc<Self>) -> TaskResult<()> {
        self.failed.borrow_mut().clear();
        // Re-derive completion from child state: children completed in a
        // previous run are never re-run, and the errored set alone can't
        // be trusted across runs.
        let children: Vec<TaskRef> = self.children.borrow().clone();
        {
            let mut done = self.done.borrow_mut();
            done.clear();
            for child in &children {
                if child.core().state() == TaskState::Completed {
                    done.insert(child.core().id());
                }
            }
        }
        if children
            .iter()
            .all(|c| c.core().state() == TaskState::Completed)
        {
            return self.core.complete(None);
        }

        match self.mode {
            CompositeMode::Serial => {
                self.cursor.set(0);
                self.run_next_serial();
            }
            CompositeMode::Parallel => {
                for child in &children {
                    if self.core.state() != TaskState::Running {
                        break;
                    }
                    if child.core().state() == TaskState::Completed {
                        continue;
                    }
                    self.attach(child);
                    if let Err(err) = child.run() {
                        debug!(composite = %self.core.id(), child = %child.core().id(), %err, "child failed to start");
                    }
                }
            }
        }
        Ok(())
    }

    fn interrupt_impl(self: Rc<Self>) {
        let children: Vec<TaskRef> = self.children.borrow().clone();
        for child in &children {
            self.detach(child);
            if child.core().state() == TaskState::Running {
                let _ = child.interrupt();
            }
        }
    }

    fn reset_impl(self: Rc<Self>) {
        self.done.borrow_mut().clear();
        self.failed.borrow_mut().clear();
        self.cursor.set(0);
    }

    fn operations_count(&self) -> usize {
        self.children
            .borrow()
            .iter()
            .map(|c| c.operations_count())
            .sum()
    }

    fn completed_operations_count(&self) -> usize {
        self.children
            .borrow()
            .iter()
            .map(|c| c.completed_operations_count())
            .sum()
    }
}
