// Copyright (c) 2025 The emu-sync Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Host-side synchronization substrate for guest kernel object emulation.
//!
//! The guest kernel's own mutex, condition variable and shared memory
//! syscalls are emulated on top of three host primitives provided by this
//! crate:
//!
//! - [`SharedLock`]: a fair, mostly-lock-free reader/writer lock protecting
//!   kernel-object tables and other hot shared state.
//! - [`Shared`] / [`AtomicShared`]: a reference-counted handle to immutable
//!   data plus an atomically-swappable pointer word that publishes and
//!   retires object records without taking any lock on the read path.
//! - [`BoundedQueue`]: a fixed-capacity FIFO used for ordered work hand-off
//!   between emulation worker threads, with blocking push/pop/peek that
//!   honor a caller-supplied abort predicate so waiters drain promptly when
//!   emulation is stopped.
//!
//! [`IpcRegistry`] composes the three: a process-wide 64-bit key to object
//! handle mapping guarded by one `SharedLock`.
//!
//! All primitives are designed for an arbitrary number of preemptible
//! native threads. Each one keeps its coordination state in a single
//! bit-packed atomic word mutated by compare-and-swap; the mutex and
//! condition variables inside `SharedLock` and `BoundedQueue` exist solely
//! to park and wake contended threads and never guard the hot path.

#[macro_use]
extern crate slog;

pub mod bounded_queue;
pub mod error;
pub mod registry;
pub mod shared_lock;
pub mod shared_ptr;

pub use bounded_queue::BoundedQueue;
pub use error::{Canceled, PushCanceled, RegistryError};
pub use registry::IpcRegistry;
pub use shared_lock::{SharedLock, SharedReadGuard, SharedWriteGuard};
pub use shared_ptr::{AtomicShared, Shared};

/// Convenience macro to obtain the scoped logger with a per-subsystem field.
#[macro_export]
macro_rules! sl {
    () => {
        slog_scope::logger().new(o!("subsystem" => "emu-sync"))
    };
}
