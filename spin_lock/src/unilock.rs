//! Uniprocessor spinlock.
//!
//! With a single logical processor there is never a second core to race
//! with: the only way `lock()` could ever contend is a reentrant call from
//! the same core (or from an interrupt handler the caller failed to mask
//! with [`crate::SpinLock`]'s caller-side discipline). Spinning in that case
//! would hang forever, so this variant reports it immediately instead.

use core::cell::{Cell, UnsafeCell};
use core::ops::{Deref, DerefMut};

/// An enumeration of possible errors associated while trying to acquire a lock,
/// from the [`try_lock`] method on a [`SpinLock`].
///
/// [`try_lock`]: SpinLock::try_lock
pub enum TryLockError {
    /// The lock could not be acquired at this time because the operation would
    /// otherwise block.
    WouldBlock,
}

/// A mutual exclusion primitive protecting data shared within a single
/// logical processor. See the module docs for why this does not spin.
pub struct SpinLock<T: ?Sized> {
    locked: Cell<bool>,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Creates a new spinlock in an unlocked state ready for use.
    #[inline]
    pub const fn new(t: T) -> SpinLock<T> {
        SpinLock {
            locked: Cell::new(false),
            data: UnsafeCell::new(t),
        }
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// Acquires the lock.
    ///
    /// # Panics
    /// Panics on reentrant acquisition, since there is no second core that
    /// could ever release it.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        match self.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => {
                panic!("deadlock: reentrant SpinLock::lock() on a uniprocessor build")
            }
        }
    }

    /// Attempts to acquire this lock without blocking.
    pub fn try_lock(&self) -> Result<SpinLockGuard<'_, T>, TryLockError> {
        if self.locked.replace(true) {
            Err(TryLockError::WouldBlock)
        } else {
            Ok(SpinLockGuard { lock: self })
        }
    }

    /// Consumes this spinlock, returning the underlying data.
    pub fn into_inner(self) -> T
    where
        T: Sized,
    {
        self.data.into_inner()
    }
}

impl<T: ?Sized + Default> Default for SpinLock<T> {
    fn default() -> SpinLock<T> {
        SpinLock::new(Default::default())
    }
}

impl<T: ?Sized> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

/// An RAII implementation of a "scoped lock" of a spinlock. See
/// [`SpinLock::lock`] and [`SpinLock::try_lock`].
pub struct SpinLockGuard<'a, T: ?Sized + 'a> {
    lock: &'a SpinLock<T>,
}

impl<T: ?Sized> !Send for SpinLockGuard<'_, T> {}
unsafe impl<T: ?Sized + Sync> Sync for SpinLockGuard<'_, T> {}

impl<T: ?Sized> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.set(false);
    }
}
