//! # Rewind Runtime
//!
//! A process-wide memory runtime that turns execution into a sequence of
//! **epochs**: bounded intervals during which the heap and registered global
//! data are checkpointed and screened for memory-safety violations. At each
//! epoch boundary a single committer thread verifies every live allocation's
//! guard bytes and every quarantined block's poison; a clean epoch commits
//! (snapshots refresh, quarantine drains), a corrupted one rolls the heap and
//! globals back to the epoch-begin image and arms hardware watchpoints on the
//! corrupted addresses so the replay pinpoints the faulting store.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         REWIND RUNTIME                            │
//! ├──────────────────────────────────────────────────────────────────┤
//! │                                                                   │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐          │
//! │  │  Front End   │   │    Epoch     │   │  Rendezvous  │          │
//! │  │ (memory.rs)  │──►│  (epoch.rs)  │◄──│(rendezvous.rs)│          │
//! │  └──────┬───────┘   └──────┬───────┘   └──────────────┘          │
//! │         │                  │                                      │
//! │  ┌──────┴───────┐   ┌──────┴───────┐   ┌──────────────┐          │
//! │  │   Guards     │   │  Snapshots   │   │ Watchpoints  │          │
//! │  │(sentinel.rs) │   │ (heap.rs /   │   │(watchpoint.rs)│          │
//! │  │              │   │ snapshot.rs) │   │              │          │
//! │  └──────────────┘   └──────────────┘   └──────────────┘          │
//! │                                                                   │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Detection summary
//!
//! - **Heap buffer overflow**: guard bytes after every allocation's requested
//!   extent, verified at `free` and at each epoch end; recoverable by
//!   rollback plus watchpoint-armed replay.
//! - **Double free / invalid free**: object-header checks at `free`; fatal,
//!   with a call-stack dump.
//! - **Use-after-free**: freed blocks are poisoned and quarantined until the
//!   epoch commits; disturbed poison rolls the epoch back.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use rewind_runtime::{Runtime, RuntimeConfig};
//!
//! let rt = Runtime::new(RuntimeConfig::default())?;
//!
//! let p = rt.malloc(64);
//! // ... mutate up to 64 bytes ...
//! rt.free(p);
//!
//! // Cooperative epoch boundary between units of work:
//! rt.checkpoint();
//!
//! // Or end the epoch explicitly from a scheduler:
//! rt.epoch_end();
//! ```
//!
//! Worker threads call [`Runtime::register_thread`] once and
//! [`Runtime::checkpoint`] between units of work; the thread that triggers an
//! epoch end acts as the committer while the rest park at the barrier.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod epoch;
pub mod fault;
pub mod header;
pub mod heap;
pub mod log;
pub mod memory;
pub mod phase;
pub mod quarantine;
pub mod rendezvous;
pub mod sentinel;
pub mod signal;
pub mod snapshot;
pub mod sync;
pub mod watchpoint;

pub use config::{ConfigError, RuntimeConfig, RuntimeConfigBuilder};
pub use epoch::{Runtime, RuntimeError, RuntimeStats, ThreadRegistry};
pub use fault::{FaultKind, FaultReport};
pub use heap::{HeapError, ManagedHeap};
pub use log::LogLevel;
pub use memory::{AccessError, FreeOutcome, MemoryManager};
pub use phase::{EpochPhase, PhaseState};
pub use quarantine::{FreeRecord, Quarantine};
pub use rendezvous::Rendezvous;
pub use snapshot::{BackupStore, GlobalRegions, ShadowRegion};
pub use watchpoint::{LoggingAssist, Watchpoint, WatchpointAssist, WatchpointRegistry};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

/// Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The process-wide runtime, when initialized through [`init`].
static GLOBAL: OnceLock<Runtime> = OnceLock::new();

/// Claimed by the first `init` call.
static INIT_CLAIMED: AtomicBool = AtomicBool::new(false);

/// Initialize the process-wide runtime. Fails if called twice.
pub fn init(config: RuntimeConfig) -> Result<&'static Runtime, RuntimeError> {
    if INIT_CLAIMED.swap(true, Ordering::SeqCst) {
        return Err(RuntimeError::AlreadyInitialized);
    }
    match Runtime::new(config) {
        Ok(runtime) => Ok(GLOBAL.get_or_init(|| runtime)),
        Err(err) => {
            INIT_CLAIMED.store(false, Ordering::SeqCst);
            Err(err)
        }
    }
}

/// The process-wide runtime, if [`init`] has run.
pub fn global() -> Option<&'static Runtime> {
    GLOBAL.get()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_is_set() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_global_init_once() {
        let config = RuntimeConfig::builder().heap_size(1 << 20).build();
        let first = init(config).unwrap();
        assert!(std::ptr::eq(first, global().unwrap()));

        let p = first.malloc(16);
        assert!(!p.is_null());
        first.free(p);
    }
}
