//! Fault State Store
//!
//! TigerStyle: One independent dial per hook.
//!
//! Each entry is its own atomic, so reads are never torn, but there is no
//! ordering between entries. The control plane may turn any dial while
//! filesystem calls are in flight.

use crate::fault::{HookId, FAULT_CODE_NONE, HOOKS_COUNT};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

/// Store shared between the hook engine and the control plane
pub type SharedFaultStore = Arc<FaultStore>;

/// Per-hook fault codes.
#[derive(Debug)]
pub struct FaultStore {
    codes: [AtomicU16; HOOKS_COUNT],
}

impl FaultStore {
    /// Create a store with every hook set to "no fault".
    #[must_use]
    pub fn new() -> Self {
        Self {
            codes: std::array::from_fn(|_| AtomicU16::new(FAULT_CODE_NONE)),
        }
    }

    /// Create a shared store.
    #[must_use]
    pub fn shared() -> SharedFaultStore {
        Arc::new(Self::new())
    }

    /// Current code for `hook`.
    #[must_use]
    pub fn get(&self, hook: HookId) -> u16 {
        self.codes[hook.index()].load(Ordering::Relaxed)
    }

    /// Overwrite the code for `hook`. Any value is accepted.
    pub fn set(&self, hook: HookId, code: u16) {
        self.codes[hook.index()].store(code, Ordering::Relaxed);
    }

    /// Look up by operator-facing name, e.g. `"PreOpen"`.
    #[must_use]
    pub fn get_by_name(&self, name: &str) -> Option<u16> {
        HookId::from_name(name).map(|hook| self.get(hook))
    }

    /// Set by operator-facing name. Returns false for an unknown name.
    pub fn set_by_name(&self, name: &str, code: u16) -> bool {
        match HookId::from_name(name) {
            Some(hook) => {
                self.set(hook, code);
                true
            }
            None => false,
        }
    }

    /// Read every entry. Entries are read one at a time, not as a unit.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(HookId, u16)> {
        HookId::all().map(|hook| (hook, self.get(hook))).collect()
    }

    /// Set every entry back to "no fault".
    pub fn reset(&self) {
        for hook in HookId::all() {
            self.set(hook, FAULT_CODE_NONE);
        }
    }

    /// Hooks whose code is non-zero.
    pub fn active(&self) -> impl Iterator<Item = (HookId, u16)> + '_ {
        HookId::all()
            .map(|hook| (hook, self.get(hook)))
            .filter(|(_, code)| *code != FAULT_CODE_NONE)
    }
}

impl Default for FaultStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::Operation;

    #[test]
    fn test_initial_codes_are_zero() {
        let store = FaultStore::new();
        for hook in HookId::all() {
            assert_eq!(store.get(hook), 0);
        }
        assert_eq!(store.snapshot().len(), HOOKS_COUNT);
        assert_eq!(store.active().count(), 0);
    }

    #[test]
    fn test_set_overwrites_one_entry() {
        let store = FaultStore::new();
        let hook = HookId::pre(Operation::Write);

        store.set(hook, 5);
        store.set(hook, 5);

        assert_eq!(store.get(hook), 5);
        assert_eq!(store.get(HookId::post(Operation::Write)), 0);
        assert_eq!(store.active().collect::<Vec<_>>(), vec![(hook, 5)]);
    }

    #[test]
    fn test_no_range_validation() {
        let store = FaultStore::new();
        let hook = HookId::post(Operation::Fsync);
        store.set(hook, u16::MAX);
        assert_eq!(store.get(hook), u16::MAX);
    }

    #[test]
    fn test_by_name() {
        let store = FaultStore::new();
        assert!(store.set_by_name("PostMkdir", 17));
        assert_eq!(store.get(HookId::post(Operation::Mkdir)), 17);
        assert_eq!(store.get_by_name("PostMkdir"), Some(17));
        assert!(!store.set_by_name("PostUnlink", 1));
        assert_eq!(store.get_by_name("PostUnlink"), None);
    }

    #[test]
    fn test_reset() {
        let store = FaultStore::new();
        for hook in HookId::all() {
            store.set(hook, 1);
        }
        store.reset();
        assert!(store.snapshot().iter().all(|(_, code)| *code == 0));
    }

    #[test]
    fn test_concurrent_writers_touch_only_their_entry() {
        let store = FaultStore::shared();
        let handles: Vec<_> = HookId::all()
            .map(|hook| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        store.set(hook, hook.index() as u16 + 1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        for hook in HookId::all() {
            assert_eq!(store.get(hook), hook.index() as u16 + 1);
        }
    }
}
