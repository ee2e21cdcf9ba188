//! Task events and listener registry
//!
//! Events fire synchronously, on the caller's own stack, in listener
//! registration order. The callback list is snapshotted before dispatch,
//! so listeners registered while an event is being delivered do not see
//! that event, and listeners removed mid-dispatch still receive it. Any
//! callback that can be invalidated by a nested transition must re-check
//! its own guards ("is the container still running") rather than assume
//! the world it was registered in.

use std::rc::Rc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::id::TaskId;
use crate::state::TaskState;

/// Kinds of lifecycle events a task can emit
///
/// `Finished` fires after either `Completed` or `Errored`, so a single
/// listener can observe "the task settled" without subscribing twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskEventKind {
    /// The task entered `Running`
    Started,
    /// The task was cooperatively cancelled
    Interrupted,
    /// The task finished successfully
    Completed,
    /// The task finished with an error
    Errored,
    /// The task settled (fires after `Completed` or `Errored`)
    Finished,
}

impl TaskEventKind {
    pub(crate) fn slot(self) -> usize {
        match self {
            TaskEventKind::Started => 0,
            TaskEventKind::Interrupted => 1,
            TaskEventKind::Completed => 2,
            TaskEventKind::Errored => 3,
            TaskEventKind::Finished => 4,
        }
    }
}

const EVENT_KINDS: usize = 5;

/// Snapshot of a task at the moment an event fired
#[derive(Debug, Clone)]
pub struct TaskEvent {
    /// What happened
    pub kind: TaskEventKind,
    /// The task the event belongs to
    pub task: TaskId,
    /// State at dispatch time
    pub state: TaskState,
    /// Completion or error payload, if any
    pub data: Option<Value>,
    /// Error message, if any
    pub message: Option<String>,
}

/// Handle identifying a registered listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// A single registered callback
struct ListenerEntry {
    id: ListenerId,
    key: Option<u64>,
    callback: Rc<dyn Fn(&TaskEvent)>,
}

/// Per-task listener registry
///
/// Keyed registration is the identity mechanism: registering a second
/// callback under an existing `(kind, key)` pair is suppressed and the
/// first registration keeps its position in the dispatch order.
/// Containers key their child subscriptions by their own task id, which
/// makes re-subscription across runs idempotent.
pub(crate) struct ListenerTable {
    next_id: u64,
    slots: [Vec<ListenerEntry>; EVENT_KINDS],
}

impl ListenerTable {
    pub(crate) fn new() -> Self {
        Self {
            next_id: 1,
            slots: std::array::from_fn(|_| Vec::new()),
        }
    }

    /// Register a callback; `key` enables suppression of duplicates.
    ///
    /// Returns the listener id and whether a new entry was inserted.
    pub(crate) fn insert(
        &mut self,
        kind: TaskEventKind,
        key: Option<u64>,
        callback: Rc<dyn Fn(&TaskEvent)>,
    ) -> (ListenerId, bool) {
        let slot = &mut self.slots[kind.slot()];
        if let Some(k) = key {
            if let Some(existing) = slot.iter().find(|e| e.key == Some(k)) {
                return (existing.id, false);
            }
        }
        let id = ListenerId(self.next_id);
        self.next_id += 1;
        slot.push(ListenerEntry { id, key, callback });
        (id, true)
    }

    pub(crate) fn remove_id(&mut self, kind: TaskEventKind, id: ListenerId) -> bool {
        let slot = &mut self.slots[kind.slot()];
        let before = slot.len();
        slot.retain(|e| e.id != id);
        slot.len() != before
    }

    pub(crate) fn remove_key(&mut self, kind: TaskEventKind, key: u64) -> bool {
        let slot = &mut self.slots[kind.slot()];
        let before = slot.len();
        slot.retain(|e| e.key != Some(key));
        slot.len() != before
    }

    /// Clone the callback list for dispatch without holding the table.
    pub(crate) fn snapshot(&self, kind: TaskEventKind) -> Vec<Rc<dyn Fn(&TaskEvent)>> {
        self.slots[kind.slot()]
            .iter()
            .map(|e| Rc::clone(&e.callback))
            .collect()
    }
}
