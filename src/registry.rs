// Copyright (c) 2025 The emu-sync Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Process-wide IPC object registry.
//!
//! Guest syscalls that share kernel objects across emulated processes do
//! so through a 64-bit key. The registry maps such keys to [`Shared`]
//! handles and is guarded by one [`SharedLock`]: lookups take a read
//! lease, insertion and removal take the write lock. It is owned by the
//! emulator's top-level context and passed by reference to whoever needs
//! it; there is deliberately no compile-time singleton.

use std::collections::HashMap;

use crate::shared_lock::SharedLock;
use crate::shared_ptr::Shared;
use crate::sl;
use crate::RegistryError;

pub type Result<T> = std::result::Result<T, RegistryError>;

/// Mapping from 64-bit IPC keys to live kernel-object handles.
#[derive(Debug)]
pub struct IpcRegistry<T> {
    objects: SharedLock<HashMap<u64, Shared<T>>>,
}

impl<T> IpcRegistry<T> {
    /// Create an empty registry.
    pub fn new() -> Self {
        IpcRegistry {
            objects: SharedLock::new(HashMap::new()),
        }
    }

    /// Bind `key` to `handle`.
    ///
    /// Fails without modifying the registry when the key is already bound
    /// to a live object.
    pub fn insert(&self, key: u64, handle: Shared<T>) -> Result<()> {
        let mut objects = self.objects.write();
        if objects.contains_key(&key) {
            return Err(RegistryError::KeyBound(key));
        }
        objects.insert(key, handle);
        debug!(sl!(), "ipc key {:#x} bound", key);
        Ok(())
    }

    /// Look up `key`, returning a new owning handle to the object.
    pub fn get(&self, key: u64) -> Option<Shared<T>> {
        self.objects.read().get(&key).cloned()
    }

    /// Look up `key`, binding the handle produced by `make` when the key
    /// is free.
    ///
    /// `make` runs without any registry lock held; when another thread
    /// wins the race the freshly made handle is released and the winner's
    /// object returned.
    pub fn get_or_insert_with<F>(&self, key: u64, make: F) -> Shared<T>
    where
        F: FnOnce() -> Shared<T>,
    {
        if let Some(handle) = self.get(key) {
            return handle;
        }
        let fresh = make();
        let mut objects = self.objects.write();
        match objects.get(&key) {
            Some(existing) => existing.clone(),
            None => {
                objects.insert(key, fresh.clone());
                debug!(sl!(), "ipc key {:#x} bound", key);
                fresh
            }
        }
    }

    /// Unbind `key`, returning the stored handle so the caller controls
    /// when the reference is released.
    pub fn remove(&self, key: u64) -> Result<Shared<T>> {
        let handle = self
            .objects
            .write()
            .remove(&key)
            .ok_or(RegistryError::KeyNotBound(key))?;
        debug!(sl!(), "ipc key {:#x} unbound", key);
        Ok(handle)
    }

    /// True while `key` is bound.
    pub fn contains(&self, key: u64) -> bool {
        self.objects.read().contains_key(&key)
    }

    /// Number of live bindings.
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    /// True when no binding is live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for IpcRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn insert_get_remove() {
        crate::test_logging::init();
        let registry = IpcRegistry::new();
        registry.insert(0x10, Shared::new("vm_page")).unwrap();
        assert!(registry.contains(0x10));
        assert_eq!(registry.len(), 1);

        let handle = registry.get(0x10).unwrap();
        assert_eq!(*handle, "vm_page");
        assert!(registry.get(0x11).is_none());

        let removed = registry.remove(0x10).unwrap();
        assert!(removed.ptr_eq(&handle));
        assert!(registry.is_empty());
        assert_eq!(
            registry.remove(0x10).unwrap_err(),
            RegistryError::KeyNotBound(0x10)
        );
    }

    #[test]
    fn duplicate_key_is_rejected() {
        crate::test_logging::init();
        let registry = IpcRegistry::new();
        registry.insert(7, Shared::new(1u32)).unwrap();
        assert_eq!(
            registry.insert(7, Shared::new(2u32)),
            Err(RegistryError::KeyBound(7))
        );
        assert_eq!(*registry.get(7).unwrap(), 1);
    }

    #[test]
    fn get_or_insert_returns_one_identity() {
        crate::test_logging::init();
        let registry = Arc::new(IpcRegistry::new());
        let mut handles = Vec::new();
        let mut threads = Vec::new();
        for i in 0..8u64 {
            let registry = registry.clone();
            threads.push(thread::spawn(move || {
                registry.get_or_insert_with(0x55, move || Shared::new(i))
            }));
        }
        for t in threads {
            handles.push(t.join().unwrap());
        }
        for pair in handles.windows(2) {
            assert!(pair[0].ptr_eq(&pair[1]));
        }
        assert_eq!(registry.len(), 1);
    }
}
