//! Thread Rendezvous Barrier
//!
//! The many-to-one meeting point between mutators and the committer at an
//! epoch boundary. One mutex and two condition variables: the committer
//! sleeps on `committer_cv` until every mutator has parked (and again until
//! every mutator has left), mutators sleep on `waiters_cv` until the phase
//! moves past `EpochEnd`.
//!
//! All phase transitions happen while holding the mutex here, which is what
//! makes the phase word safe to read without it elsewhere.

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::fault::{self, FaultKind};
use crate::phase::{EpochPhase, PhaseState};

#[derive(Debug, Default)]
pub(crate) struct RendezvousInner {
    waiters: usize,
    waiters_total: usize,
}

/// The committer/mutator barrier.
pub struct Rendezvous {
    inner: Mutex<RendezvousInner>,
    committer_cv: Condvar,
    waiters_cv: Condvar,
}

impl Default for Rendezvous {
    fn default() -> Self {
        Self::new()
    }
}

impl Rendezvous {
    /// Create an empty barrier.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RendezvousInner::default()),
            committer_cv: Condvar::new(),
            waiters_cv: Condvar::new(),
        }
    }

    /// Number of mutators currently parked.
    pub fn waiters(&self) -> usize {
        self.inner.lock().waiters
    }

    /// Take the barrier mutex. Phase transitions outside the protocol
    /// methods below (initial epoch begin) go through this guard.
    pub(crate) fn lock(&self) -> MutexGuard<'_, RendezvousInner> {
        self.inner.lock()
    }

    /// Committer entry: promote the phase to `EpochEnd` and sleep until all
    /// `total` mutators have parked. Returns `false` if another thread beat
    /// this one to the committer role, in which case the caller parked as a
    /// mutator instead and the epoch boundary is already behind it.
    pub fn arrive_as_committer(&self, phase: &PhaseState, total: usize) -> bool {
        loop {
            {
                let mut inner = self.inner.lock();
                match phase.current() {
                    EpochPhase::NormalExecution => {
                        phase.transition(EpochPhase::EpochEnd);
                        inner.waiters_total = total;
                        while inner.waiters != inner.waiters_total {
                            self.committer_cv.wait(&mut inner);
                        }
                        return true;
                    }
                    EpochPhase::EpochEnd => {
                        // Someone else is committing this boundary.
                        drop(inner);
                        self.park(phase);
                        return false;
                    }
                    // A release or rollback is mid-flight; wait for normal
                    // execution to resume before trying again.
                    _ => {}
                }
            }
            std::thread::yield_now();
        }
    }

    /// Mutator entry at an epoch boundary: park until the committer releases
    /// the next epoch. A no-op if the boundary has already passed.
    pub fn park(&self, phase: &PhaseState) {
        let mut inner = self.inner.lock();
        if !phase.is_epoch_end() {
            return;
        }

        inner.waiters += 1;
        if inner.waiters > inner.waiters_total {
            fault::fatal(
                FaultKind::InvariantBreach,
                format!(
                    "rendezvous waiters {} exceed total {}",
                    inner.waiters, inner.waiters_total
                ),
                None,
            );
        }
        if inner.waiters == inner.waiters_total {
            self.committer_cv.notify_one();
        }

        while phase.is_epoch_end() {
            self.waiters_cv.wait(&mut inner);
        }

        inner.waiters -= 1;
        if inner.waiters == 0 {
            self.committer_cv.notify_one();
        }
    }

    /// Committer exit: release every parked mutator into the next epoch and
    /// wait for the barrier to empty. On return the phase is
    /// `NormalExecution` and `waiters == 0`.
    pub fn release(&self, phase: &PhaseState) {
        let mut inner = self.inner.lock();
        phase.transition(EpochPhase::EpochBegin);
        self.waiters_cv.notify_all();
        while inner.waiters != 0 {
            self.committer_cv.wait(&mut inner);
        }
        phase.transition(EpochPhase::NormalExecution);
    }

    /// Signal-path divergence: mark the system as rolling back and wake any
    /// parked mutators so they fall through onto the restored image. Unlike
    /// [`release`](Self::release), the caller finishes the restore before
    /// invoking this.
    pub fn broadcast_rollback(&self, phase: &PhaseState) {
        let _inner = self.inner.lock();
        if phase.is_normal() {
            // Route through the boundary so the transition set stays exact.
            phase.transition(EpochPhase::EpochEnd);
        }
        phase.transition(EpochPhase::Rollback);
        self.waiters_cv.notify_all();
    }

    /// Mark the phase as rolling back while mutators stay parked. Committer
    /// path: the restore runs after this, the release after that.
    pub fn mark_rollback(&self, phase: &PhaseState) {
        let _inner = self.inner.lock();
        phase.transition(EpochPhase::Rollback);
    }
}
