//! Basic leaf tasks
//!
//! Timer-, network-, and event-source-driven leaves live with the
//! embedder; these two cover the common cases and everything the crate's
//! own tests need: a closure that settles synchronously, and a task that
//! stays in flight until its owner settles it.

use std::rc::{Rc, Weak};

use serde_json::Value;

use crate::error::TaskResult;
use crate::task::{Task, TaskCore, TaskRef};

/// Work performed by an [`FnTask`]: `Ok` completes with the payload,
/// `Err` errors with the message.
pub type LeafJob = dyn Fn() -> Result<Option<Value>, String>;

/// A leaf that runs a closure synchronously.
pub struct FnTask {
    core: TaskCore,
    job: Box<LeafJob>,
}

impl FnTask {
    /// Create a leaf from a closure.
    pub fn new(job: impl Fn() -> Result<Option<Value>, String> + 'static) -> Rc<Self> {
        Self::build(None, job)
    }

    /// Create a named leaf from a closure.
    pub fn named(
        name: impl Into<String>,
        job: impl Fn() -> Result<Option<Value>, String> + 'static,
    ) -> Rc<Self> {
        Self::build(Some(name.into()), job)
    }

    /// A leaf that completes immediately with no payload.
    pub fn noop() -> Rc<Self> {
        Self::new(|| Ok(None))
    }

    fn build(
        name: Option<String>,
        job: impl Fn() -> Result<Option<Value>, String> + 'static,
    ) -> Rc<Self> {
        let task = Rc::new(Self {
            core: TaskCore::new(name),
            job: Box::new(job),
        });
        let task_dyn: Rc<dyn Task> = task.clone();
        let weak: Weak<dyn Task> = Rc::downgrade(&task_dyn);
        task.core.bind(weak);
        task
    }
}

impl Task for FnTask {
    fn core(&self) -> &TaskCore {
        &self.core
    }

    fn run_impl(self: Rc<Self>) -> TaskResult<()> {
        match (self.job)() {
            Ok(data) => self.core.complete(data),
            Err(message) => self.core.error(None, message),
        }
    }
}

/// A leaf that stays `Running` until its owner settles it.
///
/// Models deferred work (timers, I/O callbacks, user input): `run()`
/// returns immediately and the owner later calls [`ManualTask::finish`]
/// or [`ManualTask::fail`].
pub struct ManualTask {
    core: TaskCore,
}

impl ManualTask {
    /// Create an unnamed manual leaf.
    pub fn new() -> Rc<Self> {
        Self::build(None)
    }

    /// Create a named manual leaf.
    pub fn named(name: impl Into<String>) -> Rc<Self> {
        Self::build(Some(name.into()))
    }

    fn build(name: Option<String>) -> Rc<Self> {
        let task = Rc::new(Self {
            core: TaskCore::new(name),
        });
        let task_dyn: Rc<dyn Task> = task.clone();
        let weak: Weak<dyn Task> = Rc::downgrade(&task_dyn);
        task.core.bind(weak);
        task
    }

    /// Settle the task successfully. Fails unless the task is running.
    pub fn finish(&self, data: Option<Value>) -> TaskResult<()> {
        self.core.complete(data)
    }

    /// Settle the task with an error. Fails unless the task is running.
    pub fn fail(&self, data: Option<Value>, message: impl Into<String>) -> TaskResult<()> {
        self.core.error(data, message)
    }

    /// Erased handle, convenient when wiring containers.
    pub fn handle(self: &Rc<Self>) -> TaskRef {
        self.clone()
    }
}

impl Task for ManualTask {
    fn core(&self) -> &TaskCore {
        &self.core
    }

    fn run_impl(self: Rc<Self>) -> TaskResult<()> {
        // Stays in flight until finish()/fail().
        Ok(())
    }
}
