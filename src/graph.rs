//! Dependency-ordered task executor
//!
//! Members run as soon as every task blocking them has completed. The
//! scheduling pass is re-entered from completion listeners, and a member
//! can settle synchronously inside its own `run()` call, so the pass
//! re-checks the graph's state and membership at every step instead of
//! iterating a stale snapshot.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::{Rc, Weak};

use tracing::debug;

use crate::error::{TaskError, TaskResult};
use crate::event::TaskEventKind;
use crate::id::TaskId;
use crate::state::TaskState;
use crate::task::{Task, TaskCore, TaskExt, TaskRef};

/// Container running members in dependency (DAG) order
///
/// Members are kept in insertion order next to an id-keyed blocker map.
/// Validation is static and happens before any mutation: no member may
/// block on itself, and every blocker must already be a member. Full
/// cycle detection across chains is not performed; a cross-member cycle
/// simply never becomes ready, which the completion policy surfaces as
/// an error as soon as anything else fails — and callers are expected
/// not to build one.
///
/// Error policy: the first member error interrupts every still-running
/// member and errors the graph without forwarding a payload — a graph
/// failure is a structural fact about the run, not attributable to one
/// member. Re-running retries only members that have not completed.
pub struct Graph {
    core: TaskCore,
    members: RefCell<Vec<TaskRef>>,
    /// Member id -> ids of tasks that must complete before it starts.
    blockers: RefCell<HashMap<TaskId, Vec<TaskId>>>,
    /// Members that errored during the current run. A member's state
    /// flag alone cannot distinguish "errored this pass" from "errored
    /// a previous run", so this set is the authority.
    failed: RefCell<HashSet<TaskId>>,
    weak_self: RefCell<Weak<Graph>>,
}

impl Graph {
    /// Create an empty graph.
    pub fn new() -> Rc<Self> {
        Self::build(None)
    }

    /// Create an empty named graph.
    pub fn named(name: impl Into<String>) -> Rc<Self> {
        Self::build(Some(name.into()))
    }

    fn build(name: Option<String>) -> Rc<Self> {
        let graph = Rc::new(Self {
            core: TaskCore::new(name),
            members: RefCell::new(Vec::new()),
            blockers: RefCell::new(HashMap::new()),
            failed: RefCell::new(HashSet::new()),
            weak_self: RefCell::new(Weak::new()),
        });
        *graph.weak_self.borrow_mut() = Rc::downgrade(&graph);
        let graph_dyn: Rc<dyn Task> = graph.clone();
        let weak: Weak<dyn Task> = Rc::downgrade(&graph_dyn);
        graph.core.bind(weak);
        graph
    }

    /// Number of member tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.members.borrow().len()
    }

    /// Whether the graph has no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.borrow().is_empty()
    }

    /// Add an unblocked member.
    pub fn add(&self, task: TaskRef) -> TaskResult<()> {
        self.add_with_blockers(task, &[])
    }

    /// Add a member that must wait for `blockers` to complete.
    ///
    /// Fails before mutating anything: on a duplicate member, a
    /// self-dependency, or a blocker that is not already a member. While
    /// the graph is running, an immediately-ready member starts at once.
    pub fn add_with_blockers(&self, task: TaskRef, blockers: &[TaskRef]) -> TaskResult<()> {
        let id = task.core().id();
        let blocker_ids: Vec<TaskId> = blockers.iter().map(|b| b.core().id()).collect();
        self.validate_new_member(id, &blocker_ids)?;

        self.members.borrow_mut().push(task);
        self.blockers.borrow_mut().insert(id, blocker_ids);
        debug!(graph = %self.core.id(), member = %id, "member added");

        if self.core.state() == TaskState::Running {
            self.run_all_ready_tasks();
        }
        Ok(())
    }

    /// Add a member blocked by every task currently in the graph — a
    /// barrier.
    pub fn add_to_end(&self, task: TaskRef) -> TaskResult<()> {
        let blockers: Vec<TaskRef> = self.members.borrow().clone();
        self.add_with_blockers(task, &blockers)
    }

    /// Remove a member.
    ///
    /// Fails when the task is absent, or when other members still list
    /// it as a blocker — dependents must be removed or rewired first.
    pub fn remove(&self, task: &TaskRef) -> TaskResult<()> {
        let id = task.core().id();
        let Some(index) = self.position(id) else {
            return Err(TaskError::NotFound { id });
        };
        let dependents: Vec<TaskId> = {
            let blockers = self.blockers.borrow();
            self.members
                .borrow()
                .iter()
                .map(|m| m.core().id())
                .filter(|mid| {
                    blockers
                        .get(mid)
                        .is_some_and(|b| b.contains(&id))
                })
                .collect()
        };
        if !dependents.is_empty() {
            return Err(TaskError::DependentsExist { id, dependents });
        }

        self.detach(task);
        self.members.borrow_mut().remove(index);
        self.blockers.borrow_mut().remove(&id);
        self.failed.borrow_mut().remove(&id);
        debug!(graph = %self.core.id(), member = %id, "member removed");

        if self.core.state() == TaskState::Running {
            self.complete_or_run_next();
        }
        Ok(())
    }

    /// Add blockers to an existing member at runtime.
    ///
    /// Rejected when the member is already running.
    pub fn add_blockers_to(&self, task: &TaskRef, blockers: &[TaskRef]) -> TaskResult<()> {
        let id = task.core().id();
        if self.position(id).is_none() {
            return Err(TaskError::NotFound { id });
        }
        if task.core().state() == TaskState::Running {
            return Err(TaskError::BlockedWhileRunning { id });
        }
        let blocker_ids: Vec<TaskId> = blockers.iter().map(|b| b.core().id()).collect();
        for blocker in &blocker_ids {
            if *blocker == id {
                return Err(TaskError::SelfDependency { id });
            }
            if self.position(*blocker).is_none() {
                return Err(TaskError::UnknownBlocker {
                    id,
                    blocker: *blocker,
                });
            }
        }
        let mut map = self.blockers.borrow_mut();
        let list = map.entry(id).or_default();
        for blocker in blocker_ids {
            if !list.contains(&blocker) {
                list.push(blocker);
            }
        }
        Ok(())
    }

    /// Remove blockers from an existing member.
    ///
    /// While the graph is running this can make the member ready, in
    /// which case it starts immediately.
    pub fn remove_blockers_from(&self, task: &TaskRef, blockers: &[TaskRef]) -> TaskResult<()> {
        let id = task.core().id();
        if self.position(id).is_none() {
            return Err(TaskError::NotFound { id });
        }
        {
            let removed: HashSet<TaskId> = blockers.iter().map(|b| b.core().id()).collect();
            let mut map = self.blockers.borrow_mut();
            if let Some(list) = map.get_mut(&id) {
                list.retain(|b| !removed.contains(b));
            }
        }
        if self.core.state() == TaskState::Running {
            self.run_all_ready_tasks();
        }
        Ok(())
    }

    /// Blockers currently registered for a member.
    #[must_use]
    pub fn blockers_of(&self, task: &TaskRef) -> Vec<TaskId> {
        self.blockers
            .borrow()
            .get(&task.core().id())
            .cloned()
            .unwrap_or_default()
    }

    fn validate_new_member(&self, id: TaskId, blockers: &[TaskId]) -> TaskResult<()> {
        if self.position(id).is_some() {
            return Err(TaskError::DuplicateTask { id });
        }
        for blocker in blockers {
            if *blocker == id {
                return Err(TaskError::SelfDependency { id });
            }
            if self.position(*blocker).is_none() {
                return Err(TaskError::UnknownBlocker {
                    id,
                    blocker: *blocker,
                });
            }
        }
        Ok(())
    }

    fn position(&self, id: TaskId) -> Option<usize> {
        self.members
            .borrow()
            .iter()
            .position(|m| m.core().id() == id)
    }

    fn member_by_id(&self, id: TaskId) -> Option<TaskRef> {
        self.members
            .borrow()
            .iter()
            .find(|m| m.core().id() == id)
            .cloned()
    }

    fn blockers_complete(&self, id: TaskId) -> bool {
        let blocker_ids = self
            .blockers
            .borrow()
            .get(&id)
            .cloned()
            .unwrap_or_default();
        blocker_ids.iter().all(|blocker| {
            self.member_by_id(*blocker)
                .is_some_and(|m| m.core().state() == TaskState::Completed)
        })
    }

    fn attach(&self, member: &TaskRef) {
        let key = self.core.id().raw();
        let id = member.core().id();
        let weak = self.weak_self.borrow().clone();
        member.core().on_keyed(TaskEventKind::Completed, key, move |_| {
            if let Some(graph) = weak.upgrade() {
                graph.on_member_completed(id);
            }
        });
        let weak = self.weak_self.borrow().clone();
        member.core().on_keyed(TaskEventKind::Errored, key, move |_| {
            if let Some(graph) = weak.upgrade() {
                graph.on_member_errored(id);
            }
        });
    }

    fn detach(&self, member: &TaskRef) {
        let key = self.core.id().raw();
        member.core().off_key(TaskEventKind::Completed, key);
        member.core().off_key(TaskEventKind::Errored, key);
    }

    fn detach_all(&self) {
        let members: Vec<TaskRef> = self.members.borrow().clone();
        for member in &members {
            self.detach(member);
        }
    }

    fn all_members_completed(&self) -> bool {
        self.members
            .borrow()
            .iter()
            .all(|m| m.core().state() == TaskState::Completed)
    }

    /// Start every member whose blockers have all completed.
    ///
    /// Starting a member can settle it synchronously, which re-enters
    /// this pass (and can finish or error the whole graph), so the loop
    /// re-reads membership and re-checks the graph's own state on every
    /// step, and never restarts a member recorded in the failed set even
    /// if its state flag looks eligible.
    fn run_all_ready_tasks(&self) {
        let mut index = 0;
        loop {
            if self.core.state() != TaskState::Running {
                return;
            }
            let member = {
                let members = self.members.borrow();
                members.get(index).cloned()
            };
            let Some(member) = member else {
                return;
            };
            index += 1;

            let id = member.core().id();
            let state = member.core().state();
            if state == TaskState::Running || state == TaskState::Completed {
                continue;
            }
            if self.failed.borrow().contains(&id) {
                continue;
            }
            if !self.blockers_complete(id) {
                continue;
            }
            self.attach(&member);
            debug!(graph = %self.core.id(), member = %id, "member ready");
            if let Err(err) = member.run() {
                debug!(graph = %self.core.id(), member = %id, %err, "member failed to start");
            }
        }
    }

    /// Completion policy, invoked after every member settles.
    fn complete_or_run_next(&self) {
        if self.core.state() != TaskState::Running {
            return;
        }
        if self.all_members_completed() {
            let _ = self.core.complete(None);
            return;
        }
        if self.failed.borrow().is_empty() {
            self.run_all_ready_tasks();
            return;
        }
        // Something errored this run: stop the in-flight members and
        // fail the whole graph. No payload is forwarded.
        let running: Vec<TaskRef> = self
            .members
            .borrow()
            .iter()
            .filter(|m| m.core().state() == TaskState::Running)
            .cloned()
            .collect();
        for member in &running {
            let _ = member.interrupt();
        }
        self.detach_all();
        let failures = self.failed.borrow().len();
        debug!(graph = %self.core.id(), failures, "graph errored");
        let _ = self.core.error(None, "task graph errored");
    }

    fn on_member_completed(&self, id: TaskId) {
        if self.core.state() != TaskState::Running {
            return;
        }
        debug!(graph = %self.core.id(), member = %id, "member completed");
        self.complete_or_run_next();
    }

    fn on_member_errored(&self, id: TaskId) {
        if self.core.state() != TaskState::Running {
            return;
        }
        self.failed.borrow_mut().insert(id);
        self.complete_or_run_next();
    }
}

impl Task for Graph {
    fn core(&self) -> &TaskCore {
        &self.core
    }

    fn run_impl(self: Rc<Self>) -> TaskResult<()> {
        self.failed.borrow_mut().clear();
        if self.all_members_completed() {
            return self.core.complete(None);
        }
        self.run_all_ready_tasks();
        Ok(())
    }

    fn interrupt_impl(self: Rc<Self>) {
        let members: Vec<TaskRef> = self.members.borrow().clone();
        for member in &members {
            self.detach(member);
            if member.core().state() == TaskState::Running {
                let _ = member.interrupt();
            }
        }
    }

    fn reset_impl(self: Rc<Self>) {
        self.failed.borrow_mut().clear();
    }

    fn operations_count(&self) -> usize {
        self.members
            .borrow()
            .iter()
            .map(|m| m.operations_count())
            .sum()
    }

    fn completed_operations_count(&self) -> usize {
        self.members
            .borrow()
            .iter()
            .map(|m| m.completed_operations_count())
            .sum()
    }
}
