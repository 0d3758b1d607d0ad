//! Registry of suspended coroutine work items
//!
//! Every coroutine posted to the scheduler becomes a work item, identified by
//! a WorkId. Work items go through the following states:
//!
//! - Active -> Suspended (the step awaited a nested unit of work)
//! - Suspended -> Active (the nested unit completed)
//! - Active -> Done (the step completed, the item leaves the registry)
//!
//! Canceling a work item removes it from the registry in any state. A
//! suspended parent of a canceled item is resumed, while a suspended parent of
//! a failed item is made active with the failure, which its next step handles. While a
//! step runs, the coroutine is temporarily taken out of its registry entry,
//! so that the registry lock is never held across user code.

use crate::coroutine::{Coroutine, Nested, Step};
use crate::error::AggregateError;
use crate::executor::Job;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};


/// Typed identifier of a work item
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkId(u64);
//
impl fmt::Debug for WorkId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "WorkId({})", self.0)
    }
}
//
impl fmt::Display for WorkId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}


/// Status of a work item
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkStatus {
    /// The item will be stepped on the next tick
    Active,

    /// The item waits for a nested unit of work. If that unit is itself a
    /// work item, its identifier is recorded.
    Suspended {
        /// Nested work item being awaited, if any
        awaiting: Option<WorkId>,
    },

    /// The item is not in the registry anymore, either because it completed
    /// or because it was canceled
    Done,
}


/// Result of stepping a type-erased work item
pub(crate) enum ErasedStep {
    /// Step again on the next tick
    Yielded,

    /// Suspend until the nested unit of work is done
    Await(Nested),

    /// Exhausted, run this job once the item left the registry
    Finished(Job),
}


/// Type-erased coroutine, together with its completion callback
pub(crate) trait ErasedWork: Send {
    /// Advance the underlying coroutine by one step
    fn step(&mut self) -> ErasedStep;

    /// Let the underlying coroutine handle the failure of its nested item
    fn fail(&mut self, error: AggregateError) -> ErasedStep;
}


/// ErasedWork implementation for any coroutine
pub(crate) struct WorkCell<C: Coroutine> {
    /// Coroutine being driven
    coroutine: C,

    /// Called with the final value, once
    on_complete: Option<Box<dyn FnOnce(C::Output) + Send + 'static>>,
}
//
impl<C: Coroutine> WorkCell<C> {
    pub(crate) fn new<F>(coroutine: C, on_complete: F) -> Self
        where F: FnOnce(C::Output) + Send + 'static
    {
        Self {
            coroutine,
            on_complete: Some(Box::new(on_complete)),
        }
    }

    /// Translate a step of the coroutine
    fn erase(&mut self, step: Step<C::Output>) -> ErasedStep {
        match step {
            Step::Yield => ErasedStep::Yielded,
            Step::Await(nested) => ErasedStep::Await(nested),
            Step::Complete(output) => {
                let on_complete = self.on_complete.take();
                ErasedStep::Finished(Box::new(move || {
                    if let Some(on_complete) = on_complete {
                        on_complete(output);
                    }
                }))
            }
        }
    }
}
//
impl<C: Coroutine> ErasedWork for WorkCell<C> {
    fn step(&mut self) -> ErasedStep {
        let step = self.coroutine.resume();
        self.erase(step)
    }

    fn fail(&mut self, error: AggregateError) -> ErasedStep {
        let step = self.coroutine.nested_failed(error);
        self.erase(step)
    }
}


/// Registry entry
struct Entry {
    /// Current status, never Done while in the registry
    status: WorkStatus,

    /// None while the item is being stepped
    body: Option<Box<dyn ErasedWork>>,

    /// Failure of the nested item, handed to the next step
    fault: Option<AggregateError>,
}


/// Mutex-protected registry of work items, ordered by creation
pub(crate) struct WorkRegistry {
    /// Identifier of the next work item
    next_id: AtomicU64,

    /// Work items which are not done yet
    entries: Mutex<BTreeMap<WorkId, Entry>>,
}
//
impl WorkRegistry {
    pub(crate) fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// Reserve an identifier for a work item which will be inserted later
    pub(crate) fn allocate_id(&self) -> WorkId {
        WorkId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Register a new, active work item
    pub(crate) fn insert(&self, id: WorkId, body: Box<dyn ErasedWork>) {
        self.entries.lock().insert(id, Entry {
            status: WorkStatus::Active,
            body: Some(body),
            fault: None,
        });
    }

    /// Current status of a work item
    pub(crate) fn status(&self, id: WorkId) -> WorkStatus {
        self.entries.lock()
                    .get(&id)
                    .map_or(WorkStatus::Done, |entry| entry.status)
    }

    /// Identifiers of all registered work items, in creation order
    pub(crate) fn ids(&self) -> Vec<WorkId> {
        self.entries.lock().keys().copied().collect()
    }

    /// Take out the body of an active work item, in order to step it,
    /// along with the failure of its nested item if there was one
    pub(crate) fn begin_step(&self, id: WorkId)
                             -> Option<(Box<dyn ErasedWork>, Option<AggregateError>)> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(&id)?;
        match entry.status {
            WorkStatus::Active => {
                let body = entry.body.take()?;
                Some((body, entry.fault.take()))
            }
            _ => None,
        }
    }

    /// Put back the body of a stepped work item with a new status
    ///
    /// Returns the body back if the item was canceled while it was being
    /// stepped, so that the caller can drop it outside of the lock.
    ///
    pub(crate) fn end_step(&self,
                           id: WorkId,
                           body: Box<dyn ErasedWork>,
                           status: WorkStatus)
                           -> Result<(), Box<dyn ErasedWork>> {
        let mut entries = self.entries.lock();
        match entries.get_mut(&id) {
            Some(entry) => {
                entry.status = status;
                entry.body = Some(body);
                Ok(())
            }
            None => Err(body),
        }
    }

    /// Remove a work item whose last step completed
    ///
    /// Returns false if it was canceled in the meantime.
    ///
    pub(crate) fn finish(&self, id: WorkId) -> bool {
        self.entries.lock().remove(&id).is_some()
    }

    /// Make a suspended work item active again
    pub(crate) fn resume(&self, id: WorkId) -> bool {
        let mut entries = self.entries.lock();
        match entries.get_mut(&id) {
            Some(entry) if matches!(entry.status, WorkStatus::Suspended { .. }) => {
                entry.status = WorkStatus::Active;
                true
            }
            _ => false,
        }
    }

    /// Make a suspended work item active again, handing it a failure
    pub(crate) fn fail(&self, id: WorkId, error: AggregateError) -> bool {
        let mut entries = self.entries.lock();
        match entries.get_mut(&id) {
            Some(entry) if matches!(entry.status, WorkStatus::Suspended { .. }) => {
                entry.status = WorkStatus::Active;
                entry.fault = Some(error);
                true
            }
            _ => false,
        }
    }

    /// Work item suspended on a nested work item, if any
    pub(crate) fn parent_of(&self, child: WorkId) -> Option<WorkId> {
        let awaiting = WorkStatus::Suspended { awaiting: Some(child) };
        self.entries.lock()
                    .iter()
                    .find(|(_, entry)| entry.status == awaiting)
                    .map(|(id, _)| *id)
    }

    /// Evict a work item, along with the nested work items it awaits
    ///
    /// Returns None if the item was not registered, and otherwise the evicted
    /// bodies, so that they can be dropped unlocked. Items which are being
    /// stepped have no body to hand back.
    ///
    pub(crate) fn remove(&self, id: WorkId) -> Option<Vec<Box<dyn ErasedWork>>> {
        let mut evicted = Vec::new();
        let mut entries = self.entries.lock();
        if !entries.contains_key(&id) {
            return None;
        }
        let mut next = Some(id);
        while let Some(id) = next.take() {
            if let Some(entry) = entries.remove(&id) {
                if let WorkStatus::Suspended { awaiting } = entry.status {
                    next = awaiting;
                }
                evicted.extend(entry.body);
            }
        }
        Some(evicted)
    }

    /// Evict everything, e.g. on scheduler shutdown
    pub(crate) fn clear(&self) -> Vec<Box<dyn ErasedWork>> {
        let entries = std::mem::take(&mut *self.entries.lock());
        entries.into_values().filter_map(|entry| entry.body).collect()
    }

    /// Number of (active, suspended) work items
    pub(crate) fn counts(&self) -> (usize, usize) {
        let entries = self.entries.lock();
        let suspended = entries.values()
                               .filter(|e| e.status != WorkStatus::Active)
                               .count();
        (entries.len() - suspended, suspended)
    }
}
