//! Pooled byte buffers.
//!
//! Each worker owns one [`BufferPool`]. A [`Buffer`] remembers the pool it came
//! from and hands its storage back when dropped, so releasing a buffer is the
//! same operation as discarding the context that carried it. The pool handle is
//! `!Send`: buffers never leave the worker that allocated them.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::rc::{Rc, Weak};

use bytes::{Buf, BytesMut};

struct PoolShared {
    free: RefCell<Vec<BytesMut>>,
    buffer_size: usize,
    max_free: usize,
    allocated: Cell<u64>,
    reused: Cell<u64>,
}

impl PoolShared {
    fn recycle(&self, mut data: BytesMut) {
        data.clear();
        // Reclaims the bytes consumed from the head while the storage is unique.
        if data.capacity() < self.buffer_size {
            data.reserve(self.buffer_size);
        }
        let mut free = self.free.borrow_mut();
        if free.len() < self.max_free {
            free.push(data);
        }
    }
}

/// Per-worker free list of reusable byte buffers.
#[derive(Clone)]
pub struct BufferPool {
    shared: Rc<PoolShared>,
}

impl BufferPool {
    /// Create a pool handing out buffers of at least `buffer_size` bytes and
    /// keeping at most `max_free` idle buffers around.
    pub fn new(buffer_size: usize, max_free: usize) -> Self {
        Self {
            shared: Rc::new(PoolShared {
                free: RefCell::new(Vec::new()),
                buffer_size,
                max_free,
                allocated: Cell::new(0),
                reused: Cell::new(0),
            }),
        }
    }

    /// Acquire a buffer with the pool's default capacity.
    pub fn get(&self) -> Buffer {
        self.get_with_capacity(self.shared.buffer_size)
    }

    /// Acquire a buffer able to hold at least `len` bytes without growing.
    pub fn get_with_capacity(&self, len: usize) -> Buffer {
        let recycled = self.shared.free.borrow_mut().pop();
        let data = match recycled {
            Some(mut data) => {
                self.shared.reused.set(self.shared.reused.get() + 1);
                if data.capacity() < len {
                    data.reserve(len);
                }
                data
            }
            None => {
                self.shared.allocated.set(self.shared.allocated.get() + 1);
                BytesMut::with_capacity(len.max(self.shared.buffer_size))
            }
        };
        Buffer {
            data,
            pool: Rc::downgrade(&self.shared),
        }
    }

    /// Copy `bytes` into a freshly acquired buffer.
    pub fn copy_from(&self, bytes: &[u8]) -> Buffer {
        let mut buf = self.get_with_capacity(bytes.len());
        buf.extend_from_slice(bytes);
        buf
    }

    /// Default capacity of buffers handed out by [`get`](Self::get).
    pub fn buffer_size(&self) -> usize {
        self.shared.buffer_size
    }

    /// Number of idle buffers waiting for reuse.
    pub fn free_count(&self) -> usize {
        self.shared.free.borrow().len()
    }

    /// Number of buffers allocated from the system allocator so far.
    pub fn allocated(&self) -> u64 {
        self.shared.allocated.get()
    }

    /// Number of acquisitions served from the free list.
    pub fn reused(&self) -> u64 {
        self.shared.reused.get()
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("buffer_size", &self.shared.buffer_size)
            .field("free", &self.free_count())
            .field("allocated", &self.allocated())
            .field("reused", &self.reused())
            .finish()
    }
}

/// A pooled byte region.
///
/// The readable bytes are `self[..]`. Head trimming ([`consume`](Self::consume))
/// moves the read cursor without copying; tail trimming
/// ([`truncate`](Self::truncate)) shortens the region; growth
/// ([`reserve`](Self::reserve)) keeps existing content.
pub struct Buffer {
    data: BytesMut,
    pool: Weak<PoolShared>,
}

impl Buffer {
    /// A buffer that is not attached to any pool. Its storage is freed on drop.
    pub fn detached(bytes: &[u8]) -> Self {
        Self {
            data: BytesMut::from(bytes),
            pool: Weak::new(),
        }
    }

    /// Drop `n` bytes from the front.
    ///
    /// # Panics
    ///
    /// Panics if `n > self.len()`.
    pub fn consume(&mut self, n: usize) {
        self.data.advance(n);
    }

    /// Keep only the first `len` bytes.
    pub fn truncate(&mut self, len: usize) {
        self.data.truncate(len);
    }

    /// Make room for at least `additional` more bytes at the tail.
    pub fn reserve(&mut self, additional: usize) {
        self.data.reserve(additional);
    }

    /// Append bytes at the tail, growing if needed.
    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Bytes that can be appended before the buffer has to grow.
    pub fn remaining_capacity(&self) -> usize {
        self.data.capacity() - self.data.len()
    }

    /// Total capacity of the underlying storage.
    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    /// Mutable access to the underlying storage, for readers that fill
    /// spare capacity directly (`try_read_buf`, `io::Write`).
    pub fn bytes_mut(&mut self) -> &mut BytesMut {
        &mut self.data
    }
}

impl Deref for Buffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for Buffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl std::io::Write for Buffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.data.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.recycle(std::mem::take(&mut self.data));
        }
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("len", &self.data.len())
            .field("capacity", &self.data.capacity())
            .finish()
    }
}
