// Copyright 2026 Oxide Computer Company
//! Multi-producer, multi-consumer blocking queue.
//!
//! All workers of the queued engine share one work queue and one done queue
//! instead of a chain of per-link channels.  Unlike [`channel`], the queue is
//! unbounded and has no pollable descriptor; readers sleep on a condition
//! variable.
//!
//! [`channel`]: crate::channel
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use crate::transport::{Closed, Sink, Source};

struct Inner<T> {
    items: VecDeque<T>,
    writers: usize,
    readers: usize,
}

struct Shared<T> {
    inner: Mutex<Inner<T>>,
    bell: Condvar,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().expect("queue lock poisoned")
    }
}

pub struct QueueWriter<T> {
    shared: Arc<Shared<T>>,
}

pub struct QueueReader<T> {
    shared: Arc<Shared<T>>,
}

/// Creates an open, empty queue with one writer and one reader handle.
/// Both may be cloned; the queue closes when the last writer is dropped.
pub fn sync_queue<T>() -> (QueueWriter<T>, QueueReader<T>) {
    let shared = Arc::new(Shared {
        inner: Mutex::new(Inner {
            items: VecDeque::new(),
            writers: 1,
            readers: 1,
        }),
        bell: Condvar::new(),
    });
    (
        QueueWriter {
            shared: shared.clone(),
        },
        QueueReader { shared },
    )
}

impl<T> QueueWriter<T> {
    pub fn push(&self, item: T) -> Result<(), Closed<T>> {
        let mut inner = self.shared.lock();
        if inner.readers == 0 {
            return Err(Closed(item));
        }
        inner.items.push_back(item);
        drop(inner);
        self.shared.bell.notify_one();
        Ok(())
    }
}

impl<T> Clone for QueueWriter<T> {
    fn clone(&self) -> Self {
        self.shared.lock().writers += 1;
        QueueWriter {
            shared: self.shared.clone(),
        }
    }
}

impl<T> Drop for QueueWriter<T> {
    fn drop(&mut self) {
        let mut inner = self.shared.lock();
        inner.writers -= 1;
        if inner.writers == 0 {
            drop(inner);
            self.shared.bell.notify_all();
        }
    }
}

impl<T> QueueReader<T> {
    /// Blocks until an item is available, or returns `None` once the queue is
    /// closed and drained.
    pub fn pop(&self) -> Option<T> {
        let mut inner = self.shared.lock();
        loop {
            if let Some(item) = inner.items.pop_front() {
                return Some(item);
            }
            if inner.writers == 0 {
                return None;
            }
            inner = self
                .shared
                .bell
                .wait(inner)
                .expect("queue lock poisoned");
        }
    }

    /// Takes an item if one is waiting, without blocking.
    pub fn try_pop(&self) -> Option<T> {
        self.shared.lock().items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.shared.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Clone for QueueReader<T> {
    fn clone(&self) -> Self {
        self.shared.lock().readers += 1;
        QueueReader {
            shared: self.shared.clone(),
        }
    }
}

impl<T> Drop for QueueReader<T> {
    fn drop(&mut self) {
        self.shared.lock().readers -= 1;
    }
}

impl<T: Send> Source<T> for QueueReader<T> {
    fn recv(&self) -> Option<T> {
        self.pop()
    }
}

impl<T: Send> Sink<T> for QueueWriter<T> {
    fn send(&self, item: T) -> Result<(), Closed<T>> {
        self.push(item)
    }
}
