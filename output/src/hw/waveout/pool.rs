//! Transfer buffers shared between the writer and the driver's completion
//! callback.
//!
//! Free buffers sit in a lock-free bounded queue. The writer pops one, fills
//! it and hands ownership to the device; the completion callback pushes it
//! back. A buffer is owned by exactly one side at any time, so it can never
//! be queued twice.

use crossbeam::queue::ArrayQueue;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    Free,
    Prepared,
    Queued,
}

pub struct TransferBuffer {
    data: Box<[u8]>,
    len: usize,
    state: BufferState,
    /// The driver registered this memory and must release it before reuse.
    #[cfg(windows)]
    pub(crate) prepared: bool,
    #[cfg(windows)]
    pub(crate) header: windows_sys::Win32::Media::Audio::WAVEHDR,
}

// The header only points into `data`, which moves with the box.
#[cfg(windows)]
unsafe impl Send for TransferBuffer {}

impl TransferBuffer {
    fn new(size: usize) -> Self {
        Self {
            data: vec![0; size].into_boxed_slice(),
            len: 0,
            state: BufferState::Free,
            #[cfg(windows)]
            prepared: false,
            // SAFETY: WAVEHDR is plain data; all-zero is its unprepared state.
            #[cfg(windows)]
            header: unsafe { std::mem::zeroed() },
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn state(&self) -> BufferState {
        self.state
    }

    /// Copies as much of `src` as fits and returns the byte count.
    pub fn fill(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.data.len());
        self.data[..n].copy_from_slice(&src[..n]);
        self.len = n;
        self.state = BufferState::Prepared;
        n
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.len]
    }

    #[cfg(windows)]
    pub(crate) fn data_mut_ptr(&mut self) -> *mut u8 {
        self.data.as_mut_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn mark_queued(&mut self) {
        debug_assert_eq!(self.state, BufferState::Prepared, "buffer queued twice");
        self.state = BufferState::Queued;
    }
}

pub struct BufferPool {
    free: ArrayQueue<Box<TransferBuffer>>,
    total: usize,
    buffer_bytes: usize,
    in_use: AtomicUsize,
}

impl BufferPool {
    pub fn new(count: usize, buffer_bytes: usize) -> Arc<Self> {
        let count = count.max(1);
        let buffer_bytes = buffer_bytes.max(1);
        let free = ArrayQueue::new(count);
        for _ in 0..count {
            let _ = free.push(Box::new(TransferBuffer::new(buffer_bytes)));
        }
        Arc::new(Self {
            free,
            total: count,
            buffer_bytes,
            in_use: AtomicUsize::new(0),
        })
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn buffer_bytes(&self) -> usize {
        self.buffer_bytes
    }

    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    pub fn free_len(&self) -> usize {
        self.free.len()
    }

    pub fn try_acquire(&self) -> Option<Box<TransferBuffer>> {
        let buffer = self.free.pop()?;
        self.in_use.fetch_add(1, Ordering::AcqRel);
        Some(buffer)
    }

    /// Pops a free buffer, sleeping in `backoff` steps while none is free.
    pub fn acquire(&self, backoff: Duration) -> Box<TransferBuffer> {
        loop {
            if let Some(buffer) = self.try_acquire() {
                return buffer;
            }
            thread::sleep(backoff);
        }
    }

    /// Returns a buffer to the free list. Safe to call from the driver's
    /// completion context: it only pushes and counts.
    pub fn release(&self, mut buffer: Box<TransferBuffer>) {
        buffer.state = BufferState::Free;
        buffer.len = 0;
        self.in_use.fetch_sub(1, Ordering::AcqRel);
        // Capacity equals the number of buffers, so the push cannot fail.
        let _ = self.free.push(buffer);
    }

    /// Waits until every buffer is back or `timeout` expires; returns whether
    /// the pool drained.
    pub fn wait_idle(&self, backoff: Duration, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.in_use() > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(backoff);
        }
        true
    }

    /// Visits every free buffer, e.g. to release driver registrations.
    pub fn for_each_free(&self, mut f: impl FnMut(&mut TransferBuffer)) {
        let mut taken = Vec::with_capacity(self.free.len());
        while let Some(mut buffer) = self.free.pop() {
            f(&mut buffer);
            taken.push(buffer);
        }
        for buffer in taken {
            let _ = self.free.push(buffer);
        }
    }
}
