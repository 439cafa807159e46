//! Synchronization primitives, switchable between `std` and `loom`.
//!
//! Building with `RUSTFLAGS="--cfg loom"` swaps every atomic and `UnsafeCell`
//! for loom's checked versions so the queue can be run under loom's model
//! checker. Normal builds resolve straight to `std`.

#[cfg(loom)]
pub(crate) use loom::cell::UnsafeCell;
#[cfg(loom)]
pub(crate) use loom::sync::atomic;

#[cfg(not(loom))]
pub(crate) use std::sync::atomic;

/// Mirror of `loom::cell::UnsafeCell`'s closure-based API over
/// `std::cell::UnsafeCell`.
#[cfg(not(loom))]
pub(crate) struct UnsafeCell<T>(std::cell::UnsafeCell<T>);

#[cfg(not(loom))]
impl<T> UnsafeCell<T> {
    pub(crate) fn new(data: T) -> UnsafeCell<T> {
        UnsafeCell(std::cell::UnsafeCell::new(data))
    }

    pub(crate) fn with_mut<R>(&self, f: impl FnOnce(*mut T) -> R) -> R {
        f(self.0.get())
    }
}
