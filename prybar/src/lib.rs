//! User-mode dynamic analysis for Windows-compatible targets.
//!
//! The crate drives the platform debug-event loop on a dedicated thread,
//! keeps software and hardware breakpoints transparent to the target,
//! patches and freezes memory, scans readable regions by successive
//! refinement, and lifts code into basic-block graphs. The OS surface is
//! confined to [`os::Platform`], so everything above it also runs against
//! the scripted simulator in [`os::sim`].

pub mod breakpoint;
pub mod context;
pub mod debugger;
pub mod disasm;
pub mod error;
pub mod flow;
pub mod inject;
pub mod os;
pub mod patcher;
pub mod process;
pub mod scanner;

pub use crate::debugger::{Debugger, EventHooks, EventLogger, NoHooks, Settings};
pub use crate::error::{Error, Result};
pub use crate::process::Process;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, riding over poisoning: the protected state stays usable
/// even if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
