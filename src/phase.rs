//! Epoch Phase State Machine
//!
//! A single process-wide phase word drives the epoch machinery. Transitions
//! happen only under the rendezvous mutex; everyone else reads the word with
//! relaxed ordering, which is sound because the barrier forces each thread to
//! re-check after being woken.
//!
//! Permitted transitions:
//!
//! ```text
//! Init ──► NormalExecution ──► EpochEnd ──► EpochBegin ──► NormalExecution ...
//!                                   │
//!                                   └─► Rollback ──► EpochBegin ──► NormalExecution ...
//! ```
//!
//! Any other transition is an internal invariant breach and fatal.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};

use crate::fault::{self, FaultKind};

/// Phase of the epoch state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EpochPhase {
    /// Before the first epoch begins.
    Init = 0,
    /// Mutators running user work.
    NormalExecution = 1,
    /// All threads converging on the barrier; committer checking.
    EpochEnd = 2,
    /// Restoring the epoch-begin memory image.
    Rollback = 3,
    /// Releasing mutators into the next epoch.
    EpochBegin = 4,
}

impl EpochPhase {
    /// Get the phase from a u8.
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(EpochPhase::Init),
            1 => Some(EpochPhase::NormalExecution),
            2 => Some(EpochPhase::EpochEnd),
            3 => Some(EpochPhase::Rollback),
            4 => Some(EpochPhase::EpochBegin),
            _ => None,
        }
    }

    /// Short name for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            EpochPhase::Init => "init",
            EpochPhase::NormalExecution => "normal",
            EpochPhase::EpochEnd => "epoch-end",
            EpochPhase::Rollback => "rollback",
            EpochPhase::EpochBegin => "epoch-begin",
        }
    }

    fn may_transition_to(self, to: EpochPhase) -> bool {
        use EpochPhase::*;
        matches!(
            (self, to),
            (Init, NormalExecution)
                | (NormalExecution, EpochEnd)
                | (EpochEnd, EpochBegin)
                | (EpochEnd, Rollback)
                | (Rollback, EpochBegin)
                | (EpochBegin, NormalExecution)
        )
    }
}

impl std::fmt::Display for EpochPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Process-wide phase state: the phase word, the sticky rollback flag, and
/// the epoch-end counter.
pub struct PhaseState {
    phase: AtomicU8,
    has_rolled_back: AtomicBool,
    num_of_ends: AtomicU64,
}

impl Default for PhaseState {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseState {
    /// Create a state machine in `Init`.
    pub const fn new() -> Self {
        Self {
            phase: AtomicU8::new(EpochPhase::Init as u8),
            has_rolled_back: AtomicBool::new(false),
            num_of_ends: AtomicU64::new(0),
        }
    }

    /// Current phase.
    pub fn current(&self) -> EpochPhase {
        EpochPhase::from_u8(self.phase.load(Ordering::Relaxed))
            .unwrap_or(EpochPhase::NormalExecution)
    }

    /// Whether the machine is still in `Init`.
    pub fn is_init(&self) -> bool {
        self.current() == EpochPhase::Init
    }

    /// Whether mutators are in normal execution.
    pub fn is_normal(&self) -> bool {
        self.current() == EpochPhase::NormalExecution
    }

    /// Whether the epoch is ending.
    pub fn is_epoch_end(&self) -> bool {
        self.current() == EpochPhase::EpochEnd
    }

    /// Whether a rollback is in progress.
    pub fn is_rollback(&self) -> bool {
        self.current() == EpochPhase::Rollback
    }

    /// Whether the next epoch is being released.
    pub fn is_epoch_begin(&self) -> bool {
        self.current() == EpochPhase::EpochBegin
    }

    /// Whether any rollback has ever occurred. Monotone.
    pub fn has_rolled_back(&self) -> bool {
        self.has_rolled_back.load(Ordering::Acquire)
    }

    /// Number of epoch ends so far.
    pub fn num_of_ends(&self) -> u64 {
        self.num_of_ends.load(Ordering::Relaxed)
    }

    /// Move to `to`. Must be called with the rendezvous mutex held; a
    /// transition outside the permitted set is fatal.
    pub fn transition(&self, to: EpochPhase) {
        let from = self.current();
        if !from.may_transition_to(to) {
            fault::fatal(
                FaultKind::InvariantBreach,
                format!("illegal phase transition {} -> {}", from, to),
                None,
            );
        }
        if to == EpochPhase::EpochEnd {
            self.num_of_ends.fetch_add(1, Ordering::Relaxed);
        }
        if to == EpochPhase::Rollback {
            self.has_rolled_back.store(true, Ordering::Release);
        }
        self.phase.store(to as u8, Ordering::SeqCst);
        crate::log::trace(format!("phase {} -> {}", from, to));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let state = PhaseState::new();
        assert!(state.is_init());
        assert!(!state.has_rolled_back());
        assert_eq!(state.num_of_ends(), 0);
    }

    #[test]
    fn test_commit_cycle() {
        let state = PhaseState::new();
        state.transition(EpochPhase::NormalExecution);
        state.transition(EpochPhase::EpochEnd);
        assert_eq!(state.num_of_ends(), 1);
        state.transition(EpochPhase::EpochBegin);
        state.transition(EpochPhase::NormalExecution);
        assert!(state.is_normal());
        assert!(!state.has_rolled_back());
    }

    #[test]
    fn test_rollback_cycle_sets_sticky_flag() {
        let state = PhaseState::new();
        state.transition(EpochPhase::NormalExecution);
        state.transition(EpochPhase::EpochEnd);
        state.transition(EpochPhase::Rollback);
        assert!(state.has_rolled_back());
        state.transition(EpochPhase::EpochBegin);
        state.transition(EpochPhase::NormalExecution);
        // The flag never clears.
        assert!(state.has_rolled_back());
    }

    #[test]
    fn test_num_of_ends_counts_each_end() {
        let state = PhaseState::new();
        state.transition(EpochPhase::NormalExecution);
        for _ in 0..3 {
            state.transition(EpochPhase::EpochEnd);
            state.transition(EpochPhase::EpochBegin);
            state.transition(EpochPhase::NormalExecution);
        }
        assert_eq!(state.num_of_ends(), 3);
    }

    #[test]
    fn test_illegal_transition_is_fatal() {
        crate::fault::panic_on_fatal(true);
        let state = PhaseState::new();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            state.transition(EpochPhase::Rollback);
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_phase_from_u8_roundtrip() {
        for v in 0..=4u8 {
            assert_eq!(EpochPhase::from_u8(v).unwrap() as u8, v);
        }
        assert_eq!(EpochPhase::from_u8(9), None);
    }
}
