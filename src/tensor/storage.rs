use std::cell::UnsafeCell;
use std::sync::Arc;

/// Ref-counted byte buffer backing one or more tensor views.
///
/// Access is deliberately unguarded: the net scheduler orders operators so
/// that no two concurrently running chains write the same blob, and every
/// reader of a blob runs after its writer. Dataset append paths that bypass
/// the scheduler take their own mutex before touching storage.
#[derive(Clone)]
pub struct Storage {
    inner: Arc<StorageInner>,
}

struct StorageInner {
    bytes: UnsafeCell<Vec<u8>>,
}

// Safety: callers uphold the ordering contract above; the buffer itself is
// plain bytes.
unsafe impl Send for StorageInner {}
unsafe impl Sync for StorageInner {}

impl Storage {
    pub fn with_len(nbytes: usize) -> Self {
        Self {
            inner: Arc::new(StorageInner {
                bytes: UnsafeCell::new(vec![0u8; nbytes]),
            }),
        }
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            inner: Arc::new(StorageInner {
                bytes: UnsafeCell::new(bytes),
            }),
        }
    }

    pub fn len(&self) -> usize {
        unsafe { (*self.inner.bytes.get()).len() }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        unsafe { (*self.inner.bytes.get()).capacity() }
    }

    pub fn as_bytes(&self) -> &[u8] {
        unsafe { &*self.inner.bytes.get() }
    }

    #[allow(clippy::mut_from_ref)]
    pub fn as_bytes_mut(&self) -> &mut [u8] {
        unsafe { &mut *self.inner.bytes.get() }
    }

    /// Grow the buffer to at least `nbytes`, reserving `growth_pct` percent
    /// extra on reallocation so repeated appends stay amortized. New bytes
    /// are zeroed.
    pub fn grow_to(&self, nbytes: usize, growth_pct: usize) {
        let bytes = unsafe { &mut *self.inner.bytes.get() };
        if nbytes <= bytes.len() {
            return;
        }
        if nbytes > bytes.capacity() {
            let amortized = bytes.len() + bytes.len() * growth_pct / 100;
            bytes.reserve_exact(nbytes.max(amortized) - bytes.len());
        }
        bytes.resize(nbytes, 0);
    }

    /// Shrink or extend the logical length without amortization.
    pub fn set_len_zeroed(&self, nbytes: usize) {
        let bytes = unsafe { &mut *self.inner.bytes.get() };
        bytes.resize(nbytes, 0);
    }

    pub fn ptr_eq(&self, other: &Storage) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage").field("len", &self.len()).finish()
    }
}
