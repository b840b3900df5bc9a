// Copyright 2023 The Epic Development Community
// SPDX-License-Identifier: BSD-3-Clause

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Condvar, Mutex};

/// A reusable phased barrier with an abort flag.
///
/// Trimming threads call [`wait`](TrimBarrier::wait) between rounds; when the abort flag is
/// raised every thread observes it at its next wait and unwinds normally. Aborting is a regular
/// outcome, not an error.
pub struct TrimBarrier {
    n_threads: usize,
    state: Mutex<BarrierState>,
    condvar: Condvar,
    aborted: AtomicBool,
}

struct BarrierState {
    arrived: usize,
    phase: u64,
}

impl TrimBarrier {
    pub fn new(n_threads: usize) -> Self {
        assert!(n_threads > 0);
        Self {
            n_threads,
            state: Mutex::new(BarrierState { arrived: 0, phase: 0 }),
            condvar: Condvar::new(),
            aborted: AtomicBool::new(false),
        }
    }

    /// Block until all threads arrive (or the barrier is aborted). Returns false when aborted.
    pub fn wait(&self) -> bool {
        let mut state = self.state.lock();
        let phase = state.phase;
        state.arrived += 1;
        if state.arrived == self.n_threads {
            state.arrived = 0;
            state.phase = state.phase.wrapping_add(1);
            self.condvar.notify_all();
        } else {
            while state.phase == phase && !self.is_aborted() {
                self.condvar.wait(&mut state);
            }
        }
        !self.is_aborted()
    }

    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        let _state = self.state.lock();
        self.condvar.notify_all();
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Reset for a fresh solve. Only valid while no thread is waiting.
    pub fn clear(&self) {
        self.aborted.store(false, Ordering::SeqCst);
        let mut state = self.state.lock();
        state.arrived = 0;
    }
}
