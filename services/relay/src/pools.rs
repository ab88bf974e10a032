//! Shared free-list pools for buffers and compression contexts.
//!
//! Acquiring may allocate; releasing never blocks. Values are reset on
//! acquire, so a pooled object never leaks state from its previous user.
//! Compression contexts in particular must not be shared across concurrent
//! writers — each connection checks one out for its lifetime.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

use flate2::{Compress, Decompress};

/// Types that can be returned to a pool and made like-new on reuse.
pub trait Reclaim {
    fn reclaim(&mut self);
}

impl Reclaim for String {
    fn reclaim(&mut self) {
        self.clear();
    }
}

impl<T> Reclaim for Vec<T> {
    fn reclaim(&mut self) {
        self.clear();
    }
}

impl Reclaim for Compress {
    fn reclaim(&mut self) {
        self.reset();
    }
}

impl Reclaim for Decompress {
    fn reclaim(&mut self) {
        // Raw deflate streams only; the codec never negotiates zlib wrapping.
        self.reset(false);
    }
}

struct Inner<T> {
    free: Mutex<Vec<T>>,
    make: fn() -> T,
}

/// A concurrency-safe free list of `T`.
pub struct Pool<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Reclaim> Pool<T> {
    pub fn new(make: fn() -> T) -> Self {
        Self {
            inner: Arc::new(Inner {
                free: Mutex::new(Vec::new()),
                make,
            }),
        }
    }

    /// Takes a value from the free list, or allocates one. The value is
    /// reset before it is handed out; dropping the guard returns it.
    pub fn acquire(&self) -> Pooled<T> {
        let mut value = self
            .inner
            .free
            .lock()
            .expect("pool lock poisoned")
            .pop()
            .unwrap_or_else(|| (self.inner.make)());
        value.reclaim();
        Pooled {
            value: Some(value),
            inner: Arc::clone(&self.inner),
        }
    }
}

/// RAII guard for a pooled value.
pub struct Pooled<T: Reclaim> {
    value: Option<T>,
    inner: Arc<Inner<T>>,
}

impl<T: Reclaim> Deref for Pooled<T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.value.as_ref().expect("pooled value already released")
    }
}

impl<T: Reclaim> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.value.as_mut().expect("pooled value already released")
    }
}

impl<T: Reclaim> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            if let Ok(mut free) = self.inner.free.lock() {
                free.push(value);
            }
        }
    }
}
