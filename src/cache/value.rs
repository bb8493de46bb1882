//! Refcount-managed cache values.
//!
//! Block payloads are allocated directly from the system allocator rather
//! than inside `Vec`-backed structures the rest of the crate uses. Each
//! allocation carries an atomic reference count in a header placed in
//! front of the payload:
//!
//! ```text
//! +--------------------+----------------------+
//! | Header {refs, len} | payload (len bytes)  |
//! +--------------------+----------------------+
//! ```
//!
//! `CacheValue` is a thin pointer to the header. Cloning increments the
//! count; dropping the last clone returns the allocation. A cache hit
//! hands the caller a clone, so evicting the entry never invalidates a
//! value a reader is still holding.

use std::alloc::{alloc, dealloc, Layout};
use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::atomic::{fence, AtomicUsize, Ordering};

use crate::error::{Error, Result};

#[repr(C)]
struct Header {
    refs: AtomicUsize,
    len: usize,
}

/// A shared, immutable byte buffer allocated outside the crate's normal
/// ownership structures.
pub struct CacheValue {
    ptr: NonNull<Header>,
}

// The payload is immutable after construction and the refcount is atomic.
unsafe impl Send for CacheValue {}
unsafe impl Sync for CacheValue {}

impl CacheValue {
    /// Copies `data` into a fresh refcounted allocation.
    ///
    /// Returns `CacheFull` if the allocator refuses, so callers can degrade
    /// to uncached reads instead of aborting.
    pub fn new(data: &[u8]) -> Result<Self> {
        let (layout, offset) = Self::layout(data.len())?;
        // SAFETY: layout has non-zero size (the header is always present).
        let raw = unsafe { alloc(layout) };
        let Some(ptr) = NonNull::new(raw.cast::<Header>()) else {
            return Err(Error::CacheFull);
        };
        unsafe {
            ptr.as_ptr().write(Header {
                refs: AtomicUsize::new(1),
                len: data.len(),
            });
            let payload = raw.add(offset);
            std::ptr::copy_nonoverlapping(data.as_ptr(), payload, data.len());
        }
        Ok(Self { ptr })
    }

    fn layout(len: usize) -> Result<(Layout, usize)> {
        let header = Layout::new::<Header>();
        let payload = Layout::array::<u8>(len).map_err(|_| Error::CacheFull)?;
        let (layout, offset) = header.extend(payload).map_err(|_| Error::CacheFull)?;
        Ok((layout.pad_to_align(), offset))
    }

    fn header(&self) -> &Header {
        // SAFETY: ptr is valid for the lifetime of any clone.
        unsafe { self.ptr.as_ref() }
    }

    pub fn len(&self) -> usize {
        self.header().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        let len = self.header().len;
        let (_, offset) = Self::layout(len).expect("layout computed at allocation");
        // SAFETY: the payload begins `offset` bytes into the allocation and
        // holds exactly `len` initialized bytes.
        unsafe {
            let base = self.ptr.as_ptr().cast::<u8>().add(offset);
            std::slice::from_raw_parts(base, len)
        }
    }

    /// Current reference count; exposed for tests and leak diagnostics.
    pub fn ref_count(&self) -> usize {
        self.header().refs.load(Ordering::Acquire)
    }
}

impl Clone for CacheValue {
    fn clone(&self) -> Self {
        self.header().refs.fetch_add(1, Ordering::Relaxed);
        Self { ptr: self.ptr }
    }
}

impl Drop for CacheValue {
    fn drop(&mut self) {
        if self.header().refs.fetch_sub(1, Ordering::Release) != 1 {
            return;
        }
        fence(Ordering::Acquire);
        let len = self.header().len;
        let (layout, _) = Self::layout(len).expect("layout computed at allocation");
        // SAFETY: we are the last holder; nothing can access the
        // allocation after this point.
        unsafe { dealloc(self.ptr.as_ptr().cast::<u8>(), layout) };
    }
}

impl Deref for CacheValue {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl std::fmt::Debug for CacheValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheValue")
            .field("len", &self.len())
            .field("refs", &self.ref_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let value = CacheValue::new(b"hello blocks").expect("Failed to allocate");
        assert_eq!(value.as_slice(), b"hello blocks");
        assert_eq!(value.len(), 12);
        assert_eq!(value.ref_count(), 1);
    }

    #[test]
    fn test_empty_value() {
        let value = CacheValue::new(b"").expect("Failed to allocate");
        assert!(value.is_empty());
        assert_eq!(value.as_slice(), b"");
    }

    #[test]
    fn test_clone_tracks_refs() {
        let value = CacheValue::new(b"abc").expect("Failed to allocate");
        let clone = value.clone();
        assert_eq!(value.ref_count(), 2);
        assert_eq!(clone.as_slice(), b"abc");
        drop(value);
        assert_eq!(clone.ref_count(), 1);
        assert_eq!(clone.as_slice(), b"abc");
    }

    #[test]
    fn test_concurrent_clone_drop() {
        use std::sync::Arc;
        use std::thread;

        let value = Arc::new(CacheValue::new(&vec![7u8; 4096]).expect("Failed to allocate"));
        let mut handles = vec![];
        for _ in 0..4 {
            let value = value.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    let local = CacheValue::clone(&value);
                    assert_eq!(local.len(), 4096);
                }
            }));
        }
        for handle in handles {
            handle.join().expect("Thread panicked");
        }
        assert_eq!(value.ref_count(), 1);
    }
}
