//! # Kernel synchronization primitives
//!
//! A [`Mutex`] owns its data and delegates the locking protocol to a raw lock.
//! [`TicketMutex`] serves waiters in arrival order; it guards the mapping
//! database's physframes and object mapping lists.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod mutex;
mod raw_ticket;

pub use mutex::{Mutex, MutexGuard};
pub use raw_ticket::RawTicket;

pub type TicketMutex<T> = Mutex<T, RawTicket>;

impl<T> TicketMutex<T> {
    #[must_use]
    pub const fn new(value: T) -> Self {
        Self::from_raw(RawTicket::new(), value)
    }
}

pub trait RawLock {
    fn raw_lock(&self);
    fn raw_try_lock(&self) -> bool;
    /// Held, or waited for, by somebody.
    fn raw_is_locked(&self) -> bool;
}

pub trait RawUnlock {
    /// # Safety
    /// The caller must hold the lock.
    unsafe fn raw_unlock(&self);
}
