//! Fault Injection Hooks
//!
//! TigerStyle: One pre/post hook pair per operation, all driven by the same
//! table lookup.
//!
//! Flow for every hook:
//! 1. Read the hook's code from the [`FaultStore`]
//! 2. Resolve it against the hook's enabled errors
//! 3. Sleep (slow fault), short-circuit (injected error), or pass through
//! 4. Emit one diagnostic event
//!
//! The [`Hook`] trait is the contract the interception driver consumes. Every
//! method defaults to pass-through, so a driver can run with no faults at all.

use crate::fault::{FaultOutcome, HookId, Operation, Verdict};
use crate::policy::enabled_errors;
use crate::store::SharedFaultStore;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

// =============================================================================
// Context
// =============================================================================

/// Created by a pre-hook and handed back to the matching post-hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookContext {
    /// Operation this call belongs to
    pub operation: Operation,
    /// Target path, relative to the backing directory
    pub path: PathBuf,
    /// Correlates the pre and post events of one call in the logs
    pub call_id: Uuid,
}

impl HookContext {
    /// Create a context for a new call.
    pub fn new(operation: Operation, path: &Path) -> Self {
        Self {
            operation,
            path: path.to_path_buf(),
            call_id: Uuid::new_v4(),
        }
    }
}

// =============================================================================
// Hook Contract
// =============================================================================

/// Callbacks invoked around each real filesystem operation.
///
/// `ret` on post-hooks is the real operation's result: `0` on success, the
/// positive OS error number on failure.
pub trait Hook: Send + Sync {
    /// Called once before the filesystem starts serving.
    fn init(&self) {}

    fn pre_open(&self, path: &Path, _flags: i32) -> (Verdict, HookContext) {
        (Verdict::Proceed, HookContext::new(Operation::Open, path))
    }

    fn post_open(&self, _ret: i32, _ctx: &HookContext) -> Verdict {
        Verdict::Proceed
    }

    /// Returned data, if any, is served instead of performing the real read.
    fn pre_read(
        &self,
        path: &Path,
        _length: u32,
        _offset: i64,
    ) -> (Option<Vec<u8>>, Verdict, HookContext) {
        (None, Verdict::Proceed, HookContext::new(Operation::Read, path))
    }

    /// Returns the buffer the caller should see.
    fn post_read(
        &self,
        _ret: i32,
        buf: Vec<u8>,
        _ctx: &HookContext,
    ) -> (Option<Vec<u8>>, Verdict) {
        (Some(buf), Verdict::Proceed)
    }

    fn pre_write(&self, path: &Path, _buf: &[u8], _offset: i64) -> (Verdict, HookContext) {
        (Verdict::Proceed, HookContext::new(Operation::Write, path))
    }

    fn post_write(&self, _ret: i32, _ctx: &HookContext) -> Verdict {
        Verdict::Proceed
    }

    fn pre_mkdir(&self, path: &Path, _mode: u32) -> (Verdict, HookContext) {
        (Verdict::Proceed, HookContext::new(Operation::Mkdir, path))
    }

    fn post_mkdir(&self, _ret: i32, _ctx: &HookContext) -> Verdict {
        Verdict::Proceed
    }

    fn pre_rmdir(&self, path: &Path) -> (Verdict, HookContext) {
        (Verdict::Proceed, HookContext::new(Operation::Rmdir, path))
    }

    fn post_rmdir(&self, _ret: i32, _ctx: &HookContext) -> Verdict {
        Verdict::Proceed
    }

    fn pre_open_dir(&self, path: &Path) -> (Verdict, HookContext) {
        (Verdict::Proceed, HookContext::new(Operation::OpenDir, path))
    }

    fn post_open_dir(&self, _ret: i32, _ctx: &HookContext) -> Verdict {
        Verdict::Proceed
    }

    fn pre_fsync(&self, path: &Path, _flags: u32) -> (Verdict, HookContext) {
        (Verdict::Proceed, HookContext::new(Operation::Fsync, path))
    }

    fn post_fsync(&self, _ret: i32, _ctx: &HookContext) -> Verdict {
        Verdict::Proceed
    }
}

/// Hook that never injects anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHook;

impl Hook for NoopHook {}

// =============================================================================
// Sleeper
// =============================================================================

/// Blocks the calling context for a slow fault.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

/// Sleeps the current OS thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

// =============================================================================
// Fault Injection Hook
// =============================================================================

/// Hook engine that injects faults according to a [`FaultStore`].
///
/// [`FaultStore`]: crate::store::FaultStore
#[derive(Clone)]
pub struct FaultHook {
    store: SharedFaultStore,
    sleeper: Arc<dyn Sleeper>,
}

impl FaultHook {
    /// Create an engine reading `store` and sleeping the calling thread.
    pub fn new(store: SharedFaultStore) -> Self {
        Self::with_sleeper(store, Arc::new(ThreadSleeper))
    }

    /// Create an engine with a custom sleeper.
    pub fn with_sleeper(store: SharedFaultStore, sleeper: Arc<dyn Sleeper>) -> Self {
        Self { store, sleeper }
    }

    /// The store this engine reads.
    pub fn store(&self) -> &SharedFaultStore {
        &self.store
    }

    /// Read, resolve, and act on the code for `hook`.
    ///
    /// A slow fault blocks here and then resolves to [`Verdict::Proceed`].
    pub fn evaluate(&self, hook: HookId, ctx: &HookContext) -> Verdict {
        let code = self.store.get(hook);
        let outcome = FaultOutcome::resolve(code, enabled_errors(hook));

        if let FaultOutcome::Delay(duration) = outcome {
            self.sleeper.sleep(duration);
        }

        tracing::info!(
            hook = %hook,
            path = %ctx.path.display(),
            call_id = %ctx.call_id,
            code = code,
            outcome = %outcome,
            "hook evaluated"
        );

        outcome.into()
    }

    fn pre(&self, operation: Operation, path: &Path) -> (Verdict, HookContext) {
        let ctx = HookContext::new(operation, path);
        let verdict = self.evaluate(HookId::pre(operation), &ctx);
        (verdict, ctx)
    }

    /// The dial comes from `operation`, never from the context.
    fn post(&self, operation: Operation, ctx: &HookContext, ret: i32) -> Verdict {
        let hook = HookId::post(operation);
        tracing::debug!(
            hook = %hook,
            call_id = %ctx.call_id,
            ret = ret,
            "real operation returned"
        );
        self.evaluate(hook, ctx)
    }
}

impl std::fmt::Debug for FaultHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaultHook")
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl Hook for FaultHook {
    fn init(&self) {
        let active: Vec<String> = self
            .store
            .active()
            .map(|(hook, code)| format!("{hook}={code}"))
            .collect();
        tracing::info!(active = ?active, "fault hook initialized");
    }

    fn pre_open(&self, path: &Path, _flags: i32) -> (Verdict, HookContext) {
        self.pre(Operation::Open, path)
    }

    fn post_open(&self, ret: i32, ctx: &HookContext) -> Verdict {
        self.post(Operation::Open, ctx, ret)
    }

    fn pre_read(
        &self,
        path: &Path,
        _length: u32,
        _offset: i64,
    ) -> (Option<Vec<u8>>, Verdict, HookContext) {
        let (verdict, ctx) = self.pre(Operation::Read, path);
        (None, verdict, ctx)
    }

    fn post_read(&self, ret: i32, buf: Vec<u8>, ctx: &HookContext) -> (Option<Vec<u8>>, Verdict) {
        match self.post(Operation::Read, ctx, ret) {
            Verdict::Proceed => (Some(buf), Verdict::Proceed),
            // The real data is discarded
            verdict @ Verdict::ShortCircuit(_) => (None, verdict),
        }
    }

    fn pre_write(&self, path: &Path, _buf: &[u8], _offset: i64) -> (Verdict, HookContext) {
        self.pre(Operation::Write, path)
    }

    fn post_write(&self, ret: i32, ctx: &HookContext) -> Verdict {
        self.post(Operation::Write, ctx, ret)
    }

    fn pre_mkdir(&self, path: &Path, _mode: u32) -> (Verdict, HookContext) {
        self.pre(Operation::Mkdir, path)
    }

    fn post_mkdir(&self, ret: i32, ctx: &HookContext) -> Verdict {
        self.post(Operation::Mkdir, ctx, ret)
    }

    fn pre_rmdir(&self, path: &Path) -> (Verdict, HookContext) {
        self.pre(Operation::Rmdir, path)
    }

    fn post_rmdir(&self, ret: i32, ctx: &HookContext) -> Verdict {
        self.post(Operation::Rmdir, ctx, ret)
    }

    fn pre_open_dir(&self, path: &Path) -> (Verdict, HookContext) {
        self.pre(Operation::OpenDir, path)
    }

    fn post_open_dir(&self, ret: i32, ctx: &HookContext) -> Verdict {
        self.post(Operation::OpenDir, ctx, ret)
    }

    fn pre_fsync(&self, path: &Path, _flags: u32) -> (Verdict, HookContext) {
        self.pre(Operation::Fsync, path)
    }

    fn post_fsync(&self, ret: i32, ctx: &HookContext) -> Verdict {
        self.post(Operation::Fsync, ctx, ret)
    }
}

// =============================================================================
// Tests
// =============================================================================
