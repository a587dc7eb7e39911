//! Fault Vocabulary
//!
//! TigerStyle: Explicit types for hooks, error identifiers, and the 16-bit
//! fault code.
//!
//! A fault code is read per hook and resolves to one of three outcomes:
//! - `0` or any unrecognized value: pass through
//! - a POSIX error number enabled for that hook: inject the error
//! - any value above `SLOW_FAULT_THRESHOLD`: sleep `code ^ SLOW_FAULT_THRESHOLD`
//!   seconds, then pass through

use std::fmt;
use std::time::Duration;

// =============================================================================
// TigerStyle Constants
// =============================================================================

/// Code meaning "no fault"
pub const FAULT_CODE_NONE: u16 = 0;

/// Bit 15. Codes strictly above this encode a delay in seconds.
pub const SLOW_FAULT_THRESHOLD: u16 = 1 << 15;

/// Number of supported operations
pub const OPERATIONS_COUNT: usize = 7;

/// Number of hooks (every operation has a pre and a post hook)
pub const HOOKS_COUNT: usize = OPERATIONS_COUNT * 2;

// =============================================================================
// Operation / Phase / HookId
// =============================================================================

/// Filesystem operations that carry a hook pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Open,
    Read,
    Write,
    Mkdir,
    Rmdir,
    OpenDir,
    Fsync,
}

impl Operation {
    /// All operations in table order.
    pub const ALL: [Operation; OPERATIONS_COUNT] = [
        Self::Open,
        Self::Read,
        Self::Write,
        Self::Mkdir,
        Self::Rmdir,
        Self::OpenDir,
        Self::Fsync,
    ];

    /// Row index into per-operation tables.
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Get display name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "Open",
            Self::Read => "Read",
            Self::Write => "Write",
            Self::Mkdir => "Mkdir",
            Self::Rmdir => "Rmdir",
            Self::OpenDir => "OpenDir",
            Self::Fsync => "Fsync",
        }
    }
}

/// Whether a hook runs before or after the real operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Pre,
    Post,
}

impl Phase {
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pre => "Pre",
            Self::Post => "Post",
        }
    }
}

/// Identifies one of the 14 hooks, e.g. `PreOpen` or `PostFsync`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId {
    pub operation: Operation,
    pub phase: Phase,
}

impl HookId {
    /// Create a hook identifier.
    #[must_use]
    pub const fn new(operation: Operation, phase: Phase) -> Self {
        Self { operation, phase }
    }

    #[must_use]
    pub const fn pre(operation: Operation) -> Self {
        Self::new(operation, Phase::Pre)
    }

    #[must_use]
    pub const fn post(operation: Operation) -> Self {
        Self::new(operation, Phase::Post)
    }

    /// Iterate all hooks: `PreOpen, PostOpen, PreRead, ...`
    pub fn all() -> impl Iterator<Item = HookId> {
        Operation::ALL
            .into_iter()
            .flat_map(|op| [Self::pre(op), Self::post(op)])
    }

    /// Dense index in `0..HOOKS_COUNT`, matching the order of [`HookId::all`].
    #[must_use]
    pub const fn index(self) -> usize {
        self.operation.index() * 2 + self.phase.index()
    }

    /// Operator-facing identifier, e.g. `"PreOpenDir"`.
    #[must_use]
    pub fn name(&self) -> String {
        format!("{}{}", self.phase.as_str(), self.operation.as_str())
    }

    /// Parse an operator-facing identifier such as `"PostWrite"`.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::all().find(|hook| hook.name() == name)
    }
}

impl fmt::Display for HookId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.phase.as_str(), self.operation.as_str())
    }
}

// =============================================================================
// Errno
// =============================================================================

/// POSIX error identifiers the engine knows how to inject.
///
/// The discriminants are the Linux error numbers and double as the fault codes
/// an operator sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Errno {
    EPERM = 1,
    EIO = 5,
    EACCES = 13,
    EEXIST = 17,
    ENOSPC = 28,
}

impl Errno {
    /// Every recognized identifier, whether or not any hook enables it.
    pub const ALL: [Errno; 5] = [
        Self::EPERM,
        Self::EIO,
        Self::EACCES,
        Self::EEXIST,
        Self::ENOSPC,
    ];

    /// The fault code selecting this error.
    #[must_use]
    pub const fn code(self) -> u16 {
        self as u16
    }

    /// The raw OS error number (as FUSE replies expect).
    #[must_use]
    pub const fn raw(self) -> i32 {
        self as i32
    }

    #[must_use]
    pub fn from_code(code: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|e| e.code() == code)
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EPERM => "EPERM",
            Self::EIO => "EIO",
            Self::EACCES => "EACCES",
            Self::EEXIST => "EEXIST",
            Self::ENOSPC => "ENOSPC",
        }
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<Errno> for std::io::Error {
    fn from(errno: Errno) -> Self {
        std::io::Error::from_raw_os_error(errno.raw())
    }
}

// =============================================================================
// Outcome
// =============================================================================

/// What a fault code resolves to for a particular hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// No fault
    Pass,
    /// Block the calling context, then pass through
    Delay(Duration),
    /// Short-circuit with this error
    Inject(Errno),
}

impl FaultOutcome {
    /// Resolve `code` against the errors a hook has enabled.
    #[must_use]
    pub fn resolve(code: u16, enabled: &[Errno]) -> Self {
        if code > SLOW_FAULT_THRESHOLD {
            return Self::Delay(slow_fault_delay(code));
        }
        match Errno::from_code(code) {
            Some(errno) if enabled.contains(&errno) => Self::Inject(errno),
            _ => Self::Pass,
        }
    }
}

impl fmt::Display for FaultOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pass => f.write_str("PASS"),
            Self::Delay(d) => write!(f, "TIMEOUT({}s)", d.as_secs()),
            Self::Inject(errno) => write!(f, "{errno}"),
        }
    }
}

/// Delay encoded by a slow-fault code. The threshold is a single bit, so the
/// delay is the code with that bit cleared.
#[must_use]
pub fn slow_fault_delay(code: u16) -> Duration {
    Duration::from_secs(u64::from(code ^ SLOW_FAULT_THRESHOLD))
}

/// Slow-fault code for a delay of `secs` seconds.
///
/// # Panics
/// Panics if `secs` is zero or does not fit below bit 15.
#[must_use]
pub fn slow_fault_code(secs: u16) -> u16 {
    assert!(
        secs > 0 && secs < SLOW_FAULT_THRESHOLD,
        "slow fault delay must be in 1..{}, got {}",
        SLOW_FAULT_THRESHOLD,
        secs
    );
    SLOW_FAULT_THRESHOLD | secs
}

// =============================================================================
// Verdict
// =============================================================================

/// A hook's answer to the interception framework.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Perform the real operation / trust its result
    Proceed,
    /// Use this error instead of the real operation's outcome
    ShortCircuit(Errno),
}

impl Verdict {
    #[must_use]
    pub fn is_short_circuit(&self) -> bool {
        matches!(self, Self::ShortCircuit(_))
    }

    /// The injected error, if any.
    #[must_use]
    pub fn error(&self) -> Option<Errno> {
        match self {
            Self::Proceed => None,
            Self::ShortCircuit(errno) => Some(*errno),
        }
    }
}

impl From<FaultOutcome> for Verdict {
    fn from(outcome: FaultOutcome) -> Self {
        match outcome {
            FaultOutcome::Inject(errno) => Self::ShortCircuit(errno),
            FaultOutcome::Pass | FaultOutcome::Delay(_) => Self::Proceed,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hook_index_is_dense() {
        let indices: Vec<usize> = HookId::all().map(HookId::index).collect();
        assert_eq!(indices, (0..HOOKS_COUNT).collect::<Vec<_>>());
    }

    #[test]
    fn test_hook_names() {
        let names: Vec<String> = HookId::all().map(|h| h.name()).collect();
        assert_eq!(
            names,
            vec![
                "PreOpen", "PostOpen", "PreRead", "PostRead", "PreWrite", "PostWrite",
                "PreMkdir", "PostMkdir", "PreRmdir", "PostRmdir", "PreOpenDir",
                "PostOpenDir", "PreFsync", "PostFsync",
            ]
        );
        for hook in HookId::all() {
            assert_eq!(HookId::from_name(&hook.name()), Some(hook));
            assert_eq!(hook.to_string(), hook.name());
        }
        assert_eq!(HookId::from_name("PreUnlink"), None);
    }

    #[test]
    fn test_errno_numbers_match_os() {
        assert_eq!(Errno::EPERM.raw(), libc::EPERM);
        assert_eq!(Errno::EIO.raw(), libc::EIO);
        assert_eq!(Errno::EACCES.raw(), libc::EACCES);
        assert_eq!(Errno::EEXIST.raw(), libc::EEXIST);
        assert_eq!(Errno::ENOSPC.raw(), libc::ENOSPC);
    }

    #[test]
    fn test_resolve_pass_and_inject() {
        let enabled = [Errno::EIO, Errno::EPERM];
        assert_eq!(FaultOutcome::resolve(0, &enabled), FaultOutcome::Pass);
        assert_eq!(
            FaultOutcome::resolve(5, &enabled),
            FaultOutcome::Inject(Errno::EIO)
        );
        // Recognized but not enabled here
        assert_eq!(FaultOutcome::resolve(13, &enabled), FaultOutcome::Pass);
        // Unrecognized
        assert_eq!(FaultOutcome::resolve(2, &enabled), FaultOutcome::Pass);
    }

    #[test]
    fn test_resolve_slow_fault_boundary() {
        // Exactly the threshold is not a slow fault
        assert_eq!(
            FaultOutcome::resolve(SLOW_FAULT_THRESHOLD, &[]),
            FaultOutcome::Pass
        );
        assert_eq!(
            FaultOutcome::resolve(SLOW_FAULT_THRESHOLD + 1, &[]),
            FaultOutcome::Delay(Duration::from_secs(1))
        );
        assert_eq!(
            FaultOutcome::resolve(40000, &[]),
            FaultOutcome::Delay(Duration::from_secs(7232))
        );
        assert_eq!(
            FaultOutcome::resolve(u16::MAX, &[]),
            FaultOutcome::Delay(Duration::from_secs(32767))
        );
    }

    #[test]
    fn test_slow_fault_code_roundtrip() {
        assert_eq!(slow_fault_code(3), 32771);
        assert_eq!(slow_fault_delay(slow_fault_code(3)), Duration::from_secs(3));
    }

    #[test]
    #[should_panic(expected = "slow fault delay")]
    fn test_slow_fault_code_zero() {
        let _ = slow_fault_code(0);
    }

    #[test]
    fn test_outcome_display() {
        assert_eq!(FaultOutcome::Pass.to_string(), "PASS");
        assert_eq!(
            FaultOutcome::Delay(Duration::from_secs(2)).to_string(),
            "TIMEOUT(2s)"
        );
        assert_eq!(FaultOutcome::Inject(Errno::ENOSPC).to_string(), "ENOSPC");
    }

    #[test]
    fn test_verdict_from_outcome() {
        assert_eq!(Verdict::from(FaultOutcome::Pass), Verdict::Proceed);
        assert_eq!(
            Verdict::from(FaultOutcome::Delay(Duration::from_secs(1))),
            Verdict::Proceed
        );
        let v = Verdict::from(FaultOutcome::Inject(Errno::EIO));
        assert!(v.is_short_circuit());
        assert_eq!(v.error(), Some(Errno::EIO));
    }
}
