//! Interior-mutable cell for realtime-thread state

use std::cell::UnsafeCell;

/// State that is only touched from the realtime thread, one graph phase at
/// a time.
///
/// The processing graph guarantees that within one phase every item is
/// processed by exactly one worker, and that command execution never
/// overlaps with item processing.  `RtCell` makes that discipline explicit:
/// the accessors are `unsafe` and the caller asserts that it is the only
/// accessor for the duration of the borrow.
pub struct RtCell<T>(UnsafeCell<T>);

// Safe because all access is confined to the realtime thread and its
// workers, which never alias the same item within a phase.
unsafe impl<T: Send> Send for RtCell<T> {}
unsafe impl<T: Send> Sync for RtCell<T> {}

impl<T> RtCell<T> {
    pub fn new(value: T) -> Self {
        Self(UnsafeCell::new(value))
    }

    /// Mutable access from the realtime thread.
    ///
    /// # Safety
    /// The caller must be the only accessor of this cell for the lifetime
    /// of the returned reference (single item in a single graph phase, or a
    /// command executing between phases).
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get(&self) -> &mut T {
        &mut *self.0.get()
    }

    /// Shared access from the realtime thread.
    ///
    /// # Safety
    /// No other thread may mutate this cell for the lifetime of the
    /// returned reference.
    pub unsafe fn get_ref(&self) -> &T {
        &*self.0.get()
    }

    /// Exclusive access through a unique reference; always safe.
    pub fn get_mut(&mut self) -> &mut T {
        self.0.get_mut()
    }

    pub fn into_inner(self) -> T {
        self.0.into_inner()
    }
}

impl<T: Default> Default for RtCell<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}
