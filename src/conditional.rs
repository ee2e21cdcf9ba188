//! Priority-based outcome resolution
//!
//! A [`Conditional`] runs prioritized groups of condition tasks and,
//! once enough of them have settled, picks the highest-priority
//! satisfied outcome task and runs it to completion. Conditions execute
//! inside an inner dependency graph, each wrapped in a
//! [`Failsafe`](crate::decorator::Failsafe) so a failing condition can
//! never fail the conditional itself — it only disqualifies the branches
//! that depend on it.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use tracing::debug;

use crate::decorator::Failsafe;
use crate::error::{TaskError, TaskResult};
use crate::event::TaskEventKind;
use crate::graph::Graph;
use crate::leaf::{FnTask, ManualTask};
use crate::state::TaskState;
use crate::task::{Task, TaskCore, TaskExt, TaskRef};

/// One candidate branch: an outcome and its prerequisite conditions.
#[derive(Clone)]
struct Branch {
    outcome: TaskRef,
    conditions: Vec<TaskRef>,
}

/// Chooses and runs one outcome task out of a prioritized set
///
/// Branches are examined in registration order. The default resolution
/// waits for every condition to settle, then selects the first branch
/// none of whose conditions errored. A branch registered with no
/// conditions is the default outcome — at most one may exist, and it is
/// only selected when nothing else qualifies. If no branch qualifies the
/// conditional errors.
///
/// In choose-first-available mode, resolution also runs after each
/// individual condition settles and picks the first branch whose
/// conditions have all completed; remaining conditions are interrupted
/// and discarded as soon as a choice is made.
pub struct Conditional {
    core: TaskCore,
    branches: RefCell<Vec<Branch>>,
    first_available: Cell<bool>,
    /// Inner executor, rebuilt on every run.
    graph: RefCell<Option<Rc<Graph>>>,
    /// Failsafe wrappers around this run's conditions, in branch order.
    wrappers: RefCell<Vec<TaskRef>>,
    /// Barrier member blocked by every condition wrapper.
    barrier: RefCell<Option<TaskRef>>,
    chosen: RefCell<Option<TaskRef>>,
    weak_self: RefCell<Weak<Conditional>>,
}

impl Conditional {
    /// Create an empty conditional.
    pub fn new() -> Rc<Self> {
        Self::build(None)
    }

    /// Create an empty named conditional.
    pub fn named(name: impl Into<String>) -> Rc<Self> {
        Self::build(Some(name.into()))
    }

    fn build(name: Option<String>) -> Rc<Self> {
        let conditional = Rc::new(Self {
            core: TaskCore::new(name),
            branches: RefCell::new(Vec::new()),
            first_available: Cell::new(false),
            graph: RefCell::new(None),
            wrappers: RefCell::new(Vec::new()),
            barrier: RefCell::new(None),
            chosen: RefCell::new(None),
            weak_self: RefCell::new(Weak::new()),
        });
        *conditional.weak_self.borrow_mut() = Rc::downgrade(&conditional);
        let conditional_dyn: Rc<dyn Task> = conditional.clone();
        let weak: Weak<dyn Task> = Rc::downgrade(&conditional_dyn);
        conditional.core.bind(weak);
        conditional
    }

    /// Resolve as soon as any branch's conditions have all completed,
    /// instead of waiting for every condition to settle.
    pub fn choose_first_available(&self, enabled: bool) {
        self.first_available.set(enabled);
    }

    /// Register a branch. Registration order is priority order.
    ///
    /// An empty condition list registers the default outcome; only one
    /// default may exist. Condition and outcome tasks must not be shared
    /// with other active containers.
    pub fn add_outcome(&self, outcome: TaskRef, conditions: Vec<TaskRef>) -> TaskResult<()> {
        if conditions.is_empty()
            && self
                .branches
                .borrow()
                .iter()
                .any(|b| b.conditions.is_empty())
        {
            return Err(TaskError::DuplicateDefaultOutcome);
        }
        self.branches.borrow_mut().push(Branch {
            outcome,
            conditions,
        });
        Ok(())
    }

    /// The outcome selected by the current (or last) run, if any.
    #[must_use]
    pub fn chosen_outcome(&self) -> Option<TaskRef> {
        self.chosen.borrow().clone()
    }

    fn key(&self) -> u64 {
        self.core.id().raw()
    }

    /// Early resolution hook (choose-first-available mode), invoked as
    /// each condition wrapper completes.
    fn on_condition_settled(&self) {
        if self.core.state() != TaskState::Running {
            return;
        }
        if self.chosen.borrow().is_some() {
            return;
        }
        let branches = self.branches.borrow().clone();
        for branch in &branches {
            if branch.conditions.is_empty() {
                continue;
            }
            if branch
                .conditions
                .iter()
                .all(|c| c.core().state() == TaskState::Completed)
            {
                self.choose_early(branch.outcome.clone());
                return;
            }
        }
    }

    /// Final resolution, invoked when every condition has settled.
    fn on_all_conditions_settled(&self) {
        if self.core.state() != TaskState::Running {
            return;
        }
        if self.chosen.borrow().is_some() {
            return;
        }
        let branches = self.branches.borrow().clone();
        let mut default_outcome = None;
        for branch in &branches {
            if branch.conditions.is_empty() {
                default_outcome = Some(branch.outcome.clone());
                continue;
            }
            if branch
                .conditions
                .iter()
                .all(|c| c.core().state() != TaskState::Errored)
            {
                self.choose(branch.outcome.clone());
                return;
            }
        }
        if let Some(outcome) = default_outcome {
            debug!(task = %self.core.id(), "falling back to default outcome");
            self.choose(outcome);
            return;
        }
        let _ = self.core.error(None, "no outcome available");
    }

    fn choose(&self, outcome: TaskRef) {
        debug!(task = %self.core.id(), outcome = %outcome.core().id(), "outcome chosen");
        *self.chosen.borrow_mut() = Some(outcome.clone());
        self.append_outcome(outcome);
    }

    /// Early choice: discard the rest of the race before appending the
    /// outcome. A placeholder member keeps the inner graph from
    /// completing in the middle of the mutation.
    fn choose_early(&self, outcome: TaskRef) {
        debug!(task = %self.core.id(), outcome = %outcome.core().id(), "outcome chosen early");
        *self.chosen.borrow_mut() = Some(outcome.clone());
        let Some(graph) = self.graph.borrow().clone() else {
            return;
        };

        let placeholder = ManualTask::new();
        let placeholder_ref: TaskRef = placeholder.clone();
        let _ = graph.add(placeholder_ref.clone());

        // The barrier depends on every wrapper, so it goes first.
        let barrier = self.barrier.borrow_mut().take();
        if let Some(barrier) = barrier {
            barrier
                .core()
                .off_key(TaskEventKind::Completed, self.key());
            let _ = graph.remove(&barrier);
        }
        let wrappers = self.wrappers.borrow().clone();
        for wrapper in &wrappers {
            if wrapper.core().state().is_settled() {
                continue;
            }
            wrapper
                .core()
                .off_key(TaskEventKind::Completed, self.key());
            if wrapper.core().state() == TaskState::Running {
                let _ = wrapper.interrupt();
            }
            let _ = graph.remove(wrapper);
        }

        self.append_outcome(outcome);
        let _ = graph.remove(&placeholder_ref);
        let _ = placeholder.interrupt();
    }

    fn append_outcome(&self, outcome: TaskRef) {
        // An outcome that already completed in an earlier run stays
        // completed; the graph would never emit an event for it.
        if outcome.core().state() == TaskState::Completed {
            let data = outcome.core().data();
            let _ = self.core.complete(data);
            return;
        }
        if let Some(graph) = self.graph.borrow().clone() {
            let _ = graph.add(outcome);
        }
    }

    fn on_graph_completed(&self) {
        if self.core.state() != TaskState::Running {
            return;
        }
        let data = self
            .chosen
            .borrow()
            .as_ref()
            .and_then(|outcome| outcome.core().data());
        let _ = self.core.complete(data);
    }

    fn on_graph_errored(&self, message: Option<String>) {
        if self.core.state() != TaskState::Running {
            return;
        }
        let message = message.unwrap_or_else(|| "conditional outcome errored".to_string());
        let _ = self.core.error(None, message);
    }
}

impl Task for Conditional {
    fn core(&self) -> &TaskCore {
        &self.core
    }

    fn run_impl(self: Rc<Self>) -> TaskResult<()> {
        if self.branches.borrow().is_empty() {
            return Err(TaskError::NoOutcomes);
        }
        *self.chosen.borrow_mut() = None;
        let key = self.key();

        // Fresh inner graph each run; condition and outcome tasks keep
        // their own state across runs.
        let graph = Graph::new();
        *self.graph.borrow_mut() = Some(graph.clone());

        let branches = self.branches.borrow().clone();
        let mut wrapped = std::collections::HashSet::new();
        let mut wrappers: Vec<TaskRef> = Vec::new();
        for branch in &branches {
            for condition in &branch.conditions {
                // A condition shared between branches runs once.
                if !wrapped.insert(condition.core().id()) {
                    continue;
                }
                let wrapper: TaskRef = Failsafe::new(condition.clone());
                if self.first_available.get() {
                    let weak = self.weak_self.borrow().clone();
                    wrapper
                        .core()
                        .on_keyed(TaskEventKind::Completed, key, move |_| {
                            if let Some(conditional) = weak.upgrade() {
                                conditional.on_condition_settled();
                            }
                        });
                }
                wrappers.push(wrapper);
            }
        }
        *self.wrappers.borrow_mut() = wrappers.clone();

        let weak = self.weak_self.borrow().clone();
        graph
            .core()
            .on_keyed(TaskEventKind::Completed, key, move |_| {
                if let Some(conditional) = weak.upgrade() {
                    conditional.on_graph_completed();
                }
            });
        let weak = self.weak_self.borrow().clone();
        graph
            .core()
            .on_keyed(TaskEventKind::Errored, key, move |event| {
                if let Some(conditional) = weak.upgrade() {
                    conditional.on_graph_errored(event.message.clone());
                }
            });

        // The barrier completes once every wrapper has settled; the
        // resolution listener is registered before the graph ever sees
        // the barrier, so resolution runs ahead of the graph's own
        // completion check for the same event.
        let barrier: TaskRef = FnTask::noop();
        let weak = self.weak_self.borrow().clone();
        barrier
            .core()
            .on_keyed(TaskEventKind::Completed, key, move |_| {
                if let Some(conditional) = weak.upgrade() {
                    conditional.on_all_conditions_settled();
                }
            });
        *self.barrier.borrow_mut() = Some(barrier.clone());

        for wrapper in &wrappers {
            graph.add(wrapper.clone())?;
        }
        graph.add_with_blockers(barrier, &wrappers)?;
        graph.run()?;
        Ok(())
    }

    fn interrupt_impl(self: Rc<Self>) {
        let graph = self.graph.borrow().clone();
        if let Some(graph) = graph {
            if graph.core().state() == TaskState::Running {
                let _ = graph.interrupt();
            }
        }
    }

    fn reset_impl(self: Rc<Self>) {
        *self.graph.borrow_mut() = None;
        *self.barrier.borrow_mut() = None;
        self.wrappers.borrow_mut().clear();
        *self.chosen.borrow_mut() = None;
    }

    fn operations_count(&self) -> usize {
        let conditions: usize = self
            .branches
            .borrow()
            .iter()
            .flat_map(|b| &b.conditions)
            .map(|c| c.operations_count())
            .sum();
        let outcome: usize = self
            .chosen
            .borrow()
            .as_ref()
            .map(|o| o.operations_count())
            .unwrap_or(0);
        conditions + outcome
    }

    fn completed_operations_count(&self) -> usize {
        let conditions: usize = self
            .branches
            .borrow()
            .iter()
            .flat_map(|b| &b.conditions)
            .map(|c| c.completed_operations_count())
            .sum();
        let outcome: usize = self
            .chosen
            .borrow()
            .as_ref()
            .map(|o| o.completed_operations_count())
            .unwrap_or(0);
        conditions + outcome
    }
}
