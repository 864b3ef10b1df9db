//! # Frame locks
//!
//! Every physframe and every kernel object's mapping list sits behind a ticket
//! lock from `kernel-sync`. The guard returned by [`FrameLock::lock`] is what
//! the rest of the crate calls a *frame*; [`FrameLock::try_lock`] serves the
//! inspection paths that must never spin.

use kernel_sync::{MutexGuard, RawTicket, TicketMutex};

pub type FrameLock<T> = TicketMutex<T>;

pub type FrameLockGuard<'a, T> = MutexGuard<'a, T, RawTicket>;
