//! qfs - Fault-Injecting Passthrough Filesystem
//!
//! TigerStyle: Make a real directory misbehave on demand.
//!
//! qfs mounts a backing directory through FUSE and runs a pre-hook and a
//! post-hook around open, read, write, mkdir, rmdir, opendir and fsync. Each
//! hook reads a 16-bit fault code that an operator sets over HTTP:
//!
//! - `0`: pass through
//! - a POSIX error number the hook allows: fail with that error
//! - above `32768`: stall for `code ^ 32768` seconds, then pass through
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────┐  POST /status  ┌───────────────┐
//! │ control plane │ ─────────────► │  FaultStore   │  14 atomic u16 dials
//! └───────────────┘                └───────┬───────┘
//!                                          │ get
//! ┌───────────────┐ pre/post hooks ┌───────▼───────┐
//! │ fuse/HookedFs │ ◄───────────── │   FaultHook   │  capability table
//! └───────┬───────┘                └───────────────┘
//!         │ std::fs
//!   backing directory
//! ```
//!
//! # Usage
//!
//! ```rust
//! use qfs::{Errno, FaultHook, FaultStore, Hook, HookId, Operation, Verdict};
//! use std::path::Path;
//!
//! let store = FaultStore::shared();
//! let hook = FaultHook::new(store.clone());
//!
//! store.set(HookId::pre(Operation::Write), Errno::EIO.code());
//! let (verdict, _ctx) = hook.pre_write(Path::new("data.bin"), b"payload", 0);
//! assert_eq!(verdict, Verdict::ShortCircuit(Errno::EIO));
//! ```

pub mod config;
pub mod control;
pub mod fault;
pub mod fuse;
pub mod hooks;
pub mod logging;
pub mod passthrough;
pub mod policy;
pub mod store;

// Re-export common types
pub use config::{Config, ConfigError};
pub use control::{ControlError, FaultUpdate};
pub use fault::{Errno, FaultOutcome, HookId, Operation, Phase, Verdict, SLOW_FAULT_THRESHOLD};
pub use hooks::{FaultHook, Hook, HookContext, NoopHook, Sleeper, ThreadSleeper};
pub use passthrough::{FsError, FsResult, HookedFs};
pub use store::{FaultStore, SharedFaultStore};

/// Application name
pub const APP_NAME: &str = "qfs";

/// Application version
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");
