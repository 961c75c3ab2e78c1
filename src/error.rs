// Copyright (c) 2025 The emu-sync Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Error types shared by the synchronization primitives.
//!
//! Only recoverable conditions are expressed as errors: a blocking wait
//! abandoned because the caller's abort predicate fired, and registry key
//! collisions or misses. Invariant violations (releasing a lock that is not
//! held, waiter counter overflow) indicate a bug in a collaborator and
//! panic instead.

use std::fmt;

use thiserror::Error;

/// A blocking queue operation was abandoned because the abort predicate
/// returned true while waiting.
///
/// The shared structure is left in a consistent state; the caller decides
/// what to do next (typically it is tearing the emulator down).
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("wait canceled by abort predicate")]
pub struct Canceled;

/// A blocking push was abandoned; the rejected value is handed back.
#[derive(Error)]
#[error("push wait canceled by abort predicate")]
pub struct PushCanceled<T>(pub T);

impl<T> PushCanceled<T> {
    /// Consume the error, recovering the value that was not enqueued.
    pub fn into_inner(self) -> T {
        self.0
    }
}

// Manual impl so the payload type does not need to be `Debug`.
impl<T> fmt::Debug for PushCanceled<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PushCanceled(..)")
    }
}

/// Errors returned by [`IpcRegistry`](crate::registry::IpcRegistry)
/// operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("ipc key {0:#x} is already bound to a live object")]
    KeyBound(u64),
    #[error("ipc key {0:#x} is not bound")]
    KeyNotBound(u64),
}
