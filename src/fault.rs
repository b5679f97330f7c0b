//! Fatal Fault Reporting
//!
//! Double frees, invalid frees and internal invariant breaches are not
//! recoverable by rollback; they terminate the process with a diagnostic
//! call-stack dump. This module captures the report, runs any registered
//! hooks, and aborts.
//!
//! Tests flip [`panic_on_fatal`] so the fatal path raises a catchable panic
//! instead of tearing down the test harness.

use std::backtrace::Backtrace;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use crate::log;

/// Counter for fatal faults raised (normally at most one per process).
static FAULT_COUNT: AtomicU64 = AtomicU64::new(0);

/// When set, `fatal` panics instead of aborting.
static PANIC_ON_FATAL: AtomicBool = AtomicBool::new(false);

/// Registered fault hooks.
static FAULT_HOOKS: OnceLock<Mutex<Vec<Arc<dyn Fn(&FaultReport) + Send + Sync>>>> =
    OnceLock::new();

fn get_fault_hooks() -> &'static Mutex<Vec<Arc<dyn Fn(&FaultReport) + Send + Sync>>> {
    FAULT_HOOKS.get_or_init(|| Mutex::new(Vec::new()))
}

/// The category of a fatal fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// A block was freed twice within one lifetime.
    DoubleFree,
    /// A pointer with corrupted or missing allocation metadata was freed.
    InvalidFree,
    /// An internal consistency check failed.
    InvariantBreach,
}

impl FaultKind {
    /// Short name for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            FaultKind::DoubleFree => "double-free",
            FaultKind::InvalidFree => "invalid-free",
            FaultKind::InvariantBreach => "invariant-breach",
        }
    }
}

/// A report describing a fatal fault.
#[derive(Debug, Clone)]
pub struct FaultReport {
    /// Fault category.
    pub kind: FaultKind,
    /// Human-readable description.
    pub message: String,
    /// Address involved, if any.
    pub address: Option<usize>,
    /// Captured call stack.
    pub backtrace: String,
    /// Name of the faulting thread, if it has one.
    pub thread_name: Option<String>,
}

/// Register a hook invoked with the report before the process terminates.
pub fn add_fault_hook<F>(hook: F)
where
    F: Fn(&FaultReport) + Send + Sync + 'static,
{
    if let Ok(mut hooks) = get_fault_hooks().lock() {
        hooks.push(Arc::new(hook));
    }
}

/// Remove all registered fault hooks.
pub fn clear_fault_hooks() {
    if let Ok(mut hooks) = get_fault_hooks().lock() {
        hooks.clear();
    }
}

/// Make `fatal` panic instead of aborting. Intended for tests.
pub fn panic_on_fatal(enabled: bool) {
    PANIC_ON_FATAL.store(enabled, Ordering::SeqCst);
}

/// Number of fatal faults raised so far.
pub fn fault_count() -> u64 {
    FAULT_COUNT.load(Ordering::SeqCst)
}

/// Raise a fatal fault: capture the call stack, dump diagnostics, run hooks,
/// and terminate the process.
pub fn fatal(kind: FaultKind, message: impl Into<String>, address: Option<usize>) -> ! {
    FAULT_COUNT.fetch_add(1, Ordering::SeqCst);

    let message = message.into();
    let report = FaultReport {
        kind,
        message: message.clone(),
        address,
        backtrace: Backtrace::force_capture().to_string(),
        thread_name: std::thread::current().name().map(|s| s.to_string()),
    };

    let mut entry = log::entry(log::LogLevel::Error, format!("{}: {}", kind.as_str(), message));
    if let Some(addr) = address {
        entry = entry.field_addr("addr", addr);
    }
    entry.emit();
    eprintln!("{}: {}", kind.as_str(), report.message);
    if let Some(addr) = address {
        eprintln!("  at address {:#x}", addr);
    }
    eprintln!("call stack:\n{}", report.backtrace);

    if let Ok(hooks) = get_fault_hooks().lock() {
        for hook in hooks.iter() {
            hook(&report);
        }
    }

    if PANIC_ON_FATAL.load(Ordering::SeqCst) {
        panic!("{}: {}", kind.as_str(), report.message);
    }
    std::process::abort();
}
