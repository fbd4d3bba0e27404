//! Per-worker context handed to every tunnel entry point.
//!
//! A worker is one OS thread running one single-threaded event loop. Lines,
//! buffers and continuation tasks created on a worker stay on it, so nothing
//! reachable from a [`Worker`] needs locking.

use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

use crate::buffer::BufferPool;
use crate::defaults::{DEFAULT_BUFFER_SIZE, DEFAULT_POOL_MAX_FREE};
use crate::io::IoHandle;
use crate::line::Line;

/// Connection bookkeeping for one worker.
#[derive(Debug, Default)]
pub struct WorkerStats {
    lines_created: Cell<u64>,
    lines_destroyed: Cell<u64>,
    abandoned: Cell<bool>,
}

impl WorkerStats {
    pub(crate) fn line_created(&self) {
        self.lines_created.set(self.lines_created.get() + 1);
    }

    pub(crate) fn line_destroyed(&self) {
        self.lines_destroyed.set(self.lines_destroyed.get() + 1);
    }

    pub fn lines_created(&self) -> u64 {
        self.lines_created.get()
    }

    pub fn lines_destroyed(&self) -> u64 {
        self.lines_destroyed.get()
    }

    /// Lines created on this worker that have not been destroyed yet.
    pub fn live_lines(&self) -> u64 {
        self.lines_created.get() - self.lines_destroyed.get()
    }

    /// The worker is being torn down with lines still open; their tunnel
    /// state is dropped with them.
    pub fn abandon(&self) {
        self.abandoned.set(true);
    }

    pub fn is_abandoned(&self) -> bool {
        self.abandoned.get()
    }
}

struct WorkerInner {
    id: usize,
    pool: BufferPool,
    stats: Rc<WorkerStats>,
    next_line: Cell<u64>,
    next_io: Cell<u64>,
}

/// Handle to the current worker's resources.
#[derive(Clone)]
pub struct Worker {
    inner: Rc<WorkerInner>,
}

impl Worker {
    /// Worker with the default buffer pool geometry.
    pub fn new(id: usize) -> Self {
        Self::with_pool(id, BufferPool::new(DEFAULT_BUFFER_SIZE, DEFAULT_POOL_MAX_FREE))
    }

    pub fn with_pool(id: usize, pool: BufferPool) -> Self {
        Self {
            inner: Rc::new(WorkerInner {
                id,
                pool,
                stats: Rc::new(WorkerStats::default()),
                next_line: Cell::new(0),
                next_io: Cell::new(0),
            }),
        }
    }

    pub fn id(&self) -> usize {
        self.inner.id
    }

    pub fn pool(&self) -> &BufferPool {
        &self.inner.pool
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.inner.stats
    }

    /// Create a line bound to this worker with room for `slots` tunnel states.
    pub fn new_line(&self, slots: usize) -> Line {
        let seq = self.inner.next_line.get();
        self.inner.next_line.set(seq + 1);
        // worker id in the top bits keeps ids unique process-wide
        let id = ((self.inner.id as u64) << 40) | seq;
        Line::new(id, self.inner.id, slots, self.inner.stats.clone())
    }

    /// Create read controls for a transport owned by this worker.
    pub fn new_io(&self) -> IoHandle {
        let seq = self.inner.next_io.get();
        self.inner.next_io.set(seq + 1);
        IoHandle::new(((self.inner.id as u64) << 40) | seq)
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.inner.id)
            .field("pool", &self.inner.pool)
            .field("live_lines", &self.inner.stats.live_lines())
            .finish()
    }
}
