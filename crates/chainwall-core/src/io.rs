//! Read-side flow control for one transport.
//!
//! An [`IoHandle`] is attached to every context produced by a transport's read
//! path. A tunnel that cannot keep up with writing those bytes pauses reads on
//! the handle; the transport's read task parks until the handle is resumed or
//! closed. Closing also stops every other task working on the transport.

use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

struct IoState {
    id: u64,
    read_paused: Cell<bool>,
    resumed: Notify,
    closed: CancellationToken,
}

/// Cheap, clonable handle to a transport's read controls.
#[derive(Clone)]
pub struct IoHandle {
    state: Rc<IoState>,
}

impl IoHandle {
    pub fn new(id: u64) -> Self {
        Self {
            state: Rc::new(IoState {
                id,
                read_paused: Cell::new(false),
                resumed: Notify::new(),
                closed: CancellationToken::new(),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.state.id
    }

    /// Stop pulling bytes from this transport.
    pub fn pause_read(&self) {
        self.state.read_paused.set(true);
    }

    /// Start pulling bytes again.
    pub fn resume_read(&self) {
        if self.state.read_paused.replace(false) {
            self.state.resumed.notify_one();
        }
    }

    pub fn is_read_paused(&self) -> bool {
        self.state.read_paused.get()
    }

    /// Mark the transport closed. Wakes every task waiting on the handle.
    pub fn close(&self) {
        self.state.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.is_cancelled()
    }

    /// Wait until reads were resumed or the transport was closed.
    ///
    /// Wakeups can be spurious; callers re-check the flags.
    pub async fn changed(&self) {
        tokio::select! {
            _ = self.state.resumed.notified() => {}
            _ = self.state.closed.cancelled() => {}
        }
    }

    /// Wait until the transport is closed.
    pub async fn closed(&self) {
        self.state.closed.cancelled().await;
    }

    pub fn same_as(&self, other: &IoHandle) -> bool {
        Rc::ptr_eq(&self.state, &other.state)
    }
}

impl fmt::Debug for IoHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoHandle")
            .field("id", &self.state.id)
            .field("read_paused", &self.state.read_paused.get())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pause_and_resume() {
        let io = IoHandle::new(7);
        assert!(!io.is_read_paused());
        io.pause_read();
        assert!(io.is_read_paused());
        io.resume_read();
        assert!(!io.is_read_paused());
        assert_eq!(io.id(), 7);
    }

    #[tokio::test]
    async fn resume_wakes_waiter() {
        let io = IoHandle::new(1);
        io.pause_read();
        // resume before waiting stores a permit for the next waiter
        io.resume_read();
        tokio::time::timeout(std::time::Duration::from_secs(1), io.changed())
            .await
            .expect("resume should wake the read task");
    }

    #[tokio::test]
    async fn close_wakes_waiter() {
        let io = IoHandle::new(1);
        io.close();
        assert!(io.is_closed());
        tokio::time::timeout(std::time::Duration::from_secs(1), io.changed())
            .await
            .expect("close should wake the read task");
    }

    #[tokio::test]
    async fn close_wakes_every_waiter() {
        let io = IoHandle::new(1);
        let a = io.clone();
        let b = io.clone();
        let waiters = async move {
            tokio::join!(a.closed(), b.changed());
        };
        io.close();
        tokio::time::timeout(std::time::Duration::from_secs(1), waiters)
            .await
            .expect("close should wake all waiters");
    }
}
