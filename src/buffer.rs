//! Size-classed buffer pool with scoped, move-only handles.
//!
//! Grounded on `libamqpprox/amqpprox_bufferpool.h`/`amqpprox_buffer.h`: a
//! fixed ladder of size classes, each backed by a free list; a request that
//! doesn't fit any class spills to a plain heap allocation and is tracked
//! separately so operators can see the pool isn't sized correctly.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::frame::DEFAULT_MAX_FRAME_SIZE;

/// Default size-class ladder, matching the original's `32, 64, ..., max frame size`.
pub fn default_size_classes(max_frame_size: usize) -> Vec<usize> {
    let mut classes = vec![32, 64, 128, 256, 512, 1024, 4096, 16384, 32768, 65536];
    if classes.last().copied().unwrap_or(0) < max_frame_size {
        classes.push(max_frame_size);
    }
    classes
}

#[derive(Debug, Default)]
struct ClassCounters {
    current_allocation: AtomicU64,
    high_water_mark: AtomicU64,
}

impl ClassCounters {
    fn record_acquire(&self) {
        let new = self.current_allocation.fetch_add(1, Ordering::Relaxed) + 1;
        self.high_water_mark.fetch_max(new, Ordering::Relaxed);
    }

    fn record_release(&self) {
        self.current_allocation.fetch_sub(1, Ordering::Relaxed);
    }
}

struct SizeClass {
    size: usize,
    free_list: Mutex<Vec<Box<[u8]>>>,
    counters: ClassCounters,
}

/// A single statistics row returned by [`BufferPool::statistics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassStatistics {
    pub class_size: usize,
    pub current_allocation: u64,
    pub high_water_mark: u64,
}

pub struct BufferPool {
    classes: Vec<SizeClass>,
    spillover: AtomicU64,
}

impl BufferPool {
    pub fn new(size_classes: impl IntoIterator<Item = usize>) -> Arc<Self> {
        let mut classes: Vec<usize> = size_classes.into_iter().collect();
        classes.sort_unstable();
        classes.dedup();
        Arc::new(Self {
            classes: classes
                .into_iter()
                .map(|size| SizeClass {
                    size,
                    free_list: Mutex::new(Vec::new()),
                    counters: ClassCounters::default(),
                })
                .collect(),
            spillover: AtomicU64::new(0),
        })
    }

    pub fn with_default_classes() -> Arc<Self> {
        Self::new(default_size_classes(DEFAULT_MAX_FRAME_SIZE))
    }

    /// Acquire a buffer able to hold at least `size` bytes.
    pub fn acquire(self: &Arc<Self>, size: usize) -> BufferHandle {
        if let Some((index, class_size)) = self
            .classes
            .iter()
            .enumerate()
            .find(|(_, c)| c.size >= size)
            .map(|(i, c)| (i, c.size))
        {
            let class = &self.classes[index];
            let storage = class
                .free_list
                .lock()
                .pop()
                .unwrap_or_else(|| vec![0u8; class_size].into_boxed_slice());
            class.counters.record_acquire();
            return BufferHandle {
                pool: Some(Arc::clone(self)),
                class_index: Some(index),
                storage,
                len: 0,
            };
        }

        self.spillover.fetch_add(1, Ordering::Relaxed);
        BufferHandle {
            pool: Some(Arc::clone(self)),
            class_index: None,
            storage: vec![0u8; size].into_boxed_slice(),
            len: 0,
        }
    }

    fn release(&self, class_index: Option<usize>, storage: Box<[u8]>) {
        if let Some(index) = class_index {
            let class = &self.classes[index];
            class.free_list.lock().push(storage);
            class.counters.record_release();
        }
        // Heap-spillover buffers are simply dropped; the spillover counter
        // is a high-water indicator, not a live count.
    }

    pub fn statistics(&self) -> Vec<ClassStatistics> {
        self.classes
            .iter()
            .map(|c| ClassStatistics {
                class_size: c.size,
                current_allocation: c.counters.current_allocation.load(Ordering::Relaxed),
                high_water_mark: c.counters.high_water_mark.load(Ordering::Relaxed),
            })
            .collect()
    }

    pub fn spillover_count(&self) -> u64 {
        self.spillover.load(Ordering::Relaxed)
    }
}

/// A scoped, move-only buffer. Released back to its size class (or simply
/// dropped, if heap-spilled) when it goes out of scope.
pub struct BufferHandle {
    pool: Option<Arc<BufferPool>>,
    class_index: Option<usize>,
    storage: Box<[u8]>,
    /// Bytes currently considered valid/written; callers grow this as they
    /// fill the buffer, mirroring the original's "offset" high-water mark.
    len: usize,
}

impl BufferHandle {
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.storage[..self.len]
    }

    pub fn spare_capacity(&mut self) -> &mut [u8] {
        &mut self.storage[self.len..]
    }

    /// Mark `additional` more bytes (written into [`Self::spare_capacity`])
    /// as valid.
    pub fn advance(&mut self, additional: usize) {
        assert!(self.len + additional <= self.storage.len());
        self.len += additional;
    }

    pub fn set_len(&mut self, len: usize) {
        assert!(len <= self.storage.len());
        self.len = len;
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }
}

impl Drop for BufferHandle {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            let storage = std::mem::replace(&mut self.storage, Box::new([]));
            pool.release(self.class_index, storage);
        }
    }
}

impl std::fmt::Debug for BufferHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferHandle")
            .field("capacity", &self.capacity())
            .field("len", &self.len)
            .field("class_index", &self.class_index)
            .finish()
    }
}
