//! Per-connection identity and state table.
//!
//! A [`Line`] is one logical connection. It carries one state slot per chain
//! index; each tunnel installs its connection state into its own slot and
//! frees it when the connection ends. A freed slot reads as absent, so a
//! tunnel that re-checks its slot after calling a neighbor can tell whether
//! the connection was torn down underneath it.
//!
//! Lines are worker-affine (`!Send`). The line itself is destroyed when the
//! last handle is dropped: every context referencing it is gone and the
//! transport has released it.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use tracing::trace;

use crate::worker::WorkerStats;

/// Lifecycle stage of a line. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LineStage {
    New,
    Established,
    Closing,
}

struct LineInner {
    id: u64,
    worker_id: usize,
    stage: Cell<LineStage>,
    slots: RefCell<Vec<Option<Box<dyn Any>>>>,
    stats: Rc<WorkerStats>,
}

/// Handle to one connection. Cloning shares the same line.
#[derive(Clone)]
pub struct Line {
    inner: Rc<LineInner>,
}

impl Line {
    pub(crate) fn new(id: u64, worker_id: usize, slots: usize, stats: Rc<WorkerStats>) -> Self {
        stats.line_created();
        let mut table = Vec::with_capacity(slots);
        table.resize_with(slots, || None);
        Self {
            inner: Rc::new(LineInner {
                id,
                worker_id,
                stage: Cell::new(LineStage::New),
                slots: RefCell::new(table),
                stats,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// The worker this line is bound to.
    pub fn worker_id(&self) -> usize {
        self.inner.worker_id
    }

    pub fn stage(&self) -> LineStage {
        self.inner.stage.get()
    }

    /// Move the line forward to `stage`. Earlier stages are ignored.
    pub fn advance(&self, stage: LineStage) {
        if stage > self.inner.stage.get() {
            self.inner.stage.set(stage);
        }
    }

    /// Mark the line as being torn down.
    pub fn close(&self) {
        self.advance(LineStage::Closing);
    }

    pub fn is_closing(&self) -> bool {
        self.stage() == LineStage::Closing
    }

    /// Install `state` into slot `index`.
    ///
    /// # Panics
    ///
    /// Panics if the slot is already occupied: two tunnels share an index or a
    /// tunnel initialized the same connection twice.
    pub fn install<T: Any>(&self, index: usize, state: T) {
        let mut slots = self.inner.slots.borrow_mut();
        if slots.len() <= index {
            slots.resize_with(index + 1, || None);
        }
        assert!(
            slots[index].is_none(),
            "line {}: state slot {} is already occupied",
            self.inner.id,
            index
        );
        slots[index] = Some(Box::new(state));
    }

    /// Whether slot `index` currently holds state.
    pub fn is_alive(&self, index: usize) -> bool {
        self.inner
            .slots
            .borrow()
            .get(index)
            .is_some_and(Option::is_some)
    }

    /// Run `f` against the state in slot `index`.
    ///
    /// Returns `None` when the slot is empty. `f` must not call into another
    /// tunnel: the state table stays borrowed while it runs.
    ///
    /// # Panics
    ///
    /// Panics if the slot holds a different type than `T`.
    pub fn with_state<T: Any, R>(&self, index: usize, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut slots = self.inner.slots.borrow_mut();
        let state = slots.get_mut(index)?.as_mut()?;
        let state = state
            .downcast_mut::<T>()
            .unwrap_or_else(|| panic!("line {}: slot {} holds another tunnel's state", self.inner.id, index));
        Some(f(state))
    }

    /// Remove and return the state in slot `index`, leaving the slot empty.
    pub fn free_state<T: Any>(&self, index: usize) -> Option<T> {
        let state = self.inner.slots.borrow_mut().get_mut(index)?.take()?;
        match state.downcast::<T>() {
            Ok(state) => Some(*state),
            Err(_) => panic!(
                "line {}: slot {} holds another tunnel's state",
                self.inner.id, index
            ),
        }
    }

    /// Number of occupied slots.
    pub fn live_slots(&self) -> usize {
        self.inner
            .slots
            .borrow()
            .iter()
            .filter(|slot| slot.is_some())
            .count()
    }

    pub fn same_as(&self, other: &Line) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Drop for LineInner {
    fn drop(&mut self) {
        self.stats.line_destroyed();
        let leaked = self.slots.get_mut().iter().filter(|s| s.is_some()).count();
        trace!(line = self.id, worker = self.worker_id, leaked, "line destroyed");
        if !std::thread::panicking() && !self.stats.is_abandoned() {
            debug_assert_eq!(
                leaked, 0,
                "line {} destroyed while {} tunnel state(s) were never freed",
                self.id, leaked
            );
        }
    }
}

impl fmt::Debug for Line {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Line")
            .field("id", &self.inner.id)
            .field("worker", &self.inner.worker_id)
            .field("stage", &self.inner.stage.get())
            .finish()
    }
}
