//! Capability Table
//!
//! TigerStyle: Which errors each hook may inject, as one static table.
//!
//! The table is deliberately irregular. A fault code naming an error that is
//! not listed for the hook falls through to pass-through.

use crate::fault::{Errno, HookId, Operation, Phase, OPERATIONS_COUNT};

use Errno::{EACCES, EEXIST, EIO, ENOSPC, EPERM};

/// Enabled errors, indexed `[operation][phase]`.
static ENABLED_ERRORS: [[&[Errno]; 2]; OPERATIONS_COUNT] = [
    // Open
    [&[EIO, EACCES, EPERM], &[EIO, EPERM]],
    // Read
    [&[EIO, EPERM], &[EIO, EPERM]],
    // Write
    [&[EIO, EPERM], &[EIO, EPERM, ENOSPC]],
    // Mkdir
    [&[EIO, EEXIST, EPERM], &[EIO, EEXIST, EPERM]],
    // Rmdir
    [&[EIO, EACCES, EPERM], &[EIO, EPERM]],
    // OpenDir
    [&[EIO, EACCES, EPERM], &[EIO, EPERM]],
    // Fsync
    [&[EIO, EPERM], &[EIO, EPERM]],
];

/// Errors `hook` is allowed to inject.
#[must_use]
pub fn enabled_errors(hook: HookId) -> &'static [Errno] {
    ENABLED_ERRORS[hook.operation.index()][hook.phase.index()]
}

/// Whether `hook` injects `errno` when its code selects it.
#[must_use]
pub fn is_enabled(hook: HookId, errno: Errno) -> bool {
    enabled_errors(hook).contains(&errno)
}

/// Convenience for `enabled_errors(HookId::new(operation, phase))`.
#[must_use]
pub fn enabled_for(operation: Operation, phase: Phase) -> &'static [Errno] {
    enabled_errors(HookId::new(operation, phase))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sorted(errors: &[Errno]) -> Vec<u16> {
        let mut codes: Vec<u16> = errors.iter().map(|e| e.code()).collect();
        codes.sort_unstable();
        codes
    }

    #[test]
    fn test_table_matches_contract() {
        let expected: [(Operation, &[Errno], &[Errno]); OPERATIONS_COUNT] = [
            (Operation::Open, &[EIO, EACCES, EPERM], &[EIO, EPERM]),
            (Operation::Read, &[EIO, EPERM], &[EIO, EPERM]),
            (Operation::Write, &[EIO, EPERM], &[EIO, EPERM, ENOSPC]),
            (Operation::Mkdir, &[EIO, EEXIST, EPERM], &[EIO, EEXIST, EPERM]),
            (Operation::Rmdir, &[EIO, EACCES, EPERM], &[EIO, EPERM]),
            (Operation::OpenDir, &[EIO, EACCES, EPERM], &[EIO, EPERM]),
            (Operation::Fsync, &[EIO, EPERM], &[EIO, EPERM]),
        ];

        for (op, pre, post) in expected {
            assert_eq!(sorted(enabled_for(op, Phase::Pre)), sorted(pre), "Pre{op:?}");
            assert_eq!(sorted(enabled_for(op, Phase::Post)), sorted(post), "Post{op:?}");
        }
    }

    #[test]
    fn test_asymmetric_entries() {
        assert!(is_enabled(HookId::pre(Operation::Open), EACCES));
        assert!(!is_enabled(HookId::post(Operation::Open), EACCES));
        assert!(is_enabled(HookId::post(Operation::Write), ENOSPC));
        assert!(!is_enabled(HookId::pre(Operation::Write), ENOSPC));
        assert!(is_enabled(HookId::post(Operation::Mkdir), EEXIST));
    }

    #[test]
    fn test_every_hook_enables_eio_and_eperm() {
        for hook in HookId::all() {
            assert!(is_enabled(hook, EIO), "{hook}");
            assert!(is_enabled(hook, EPERM), "{hook}");
        }
    }

    #[test]
    fn test_enospc_only_on_post_write() {
        let hooks: Vec<HookId> = HookId::all().filter(|h| is_enabled(*h, ENOSPC)).collect();
        assert_eq!(hooks, vec![HookId::post(Operation::Write)]);
    }
}
