// Copyright 2023 The Epic Development Community
// SPDX-License-Identifier: BSD-3-Clause

//! A convenient shutdown signal for threads.
//!
//! `Shutdown` is the trigger half; any number of cloned [`ShutdownSignal`]s can poll or block on
//! it. Triggering is idempotent and wakes every blocked waiter.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::{Condvar, Mutex};

#[derive(Default)]
struct Inner {
    triggered: AtomicBool,
    lock: Mutex<()>,
    condvar: Condvar,
}

/// The trigger half of a shutdown signal. Dropping the `Shutdown` also triggers it.
pub struct Shutdown {
    inner: Arc<Inner>,
    on_drop: bool,
}

impl Shutdown {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner::default()),
            on_drop: true,
        }
    }

    /// Convert this instance into one that does not trigger on drop.
    pub fn keep_alive_on_drop(mut self) -> Self {
        self.on_drop = false;
        self
    }

    pub fn trigger(&self) {
        self.inner.triggered.store(true, Ordering::SeqCst);
        let _guard = self.inner.lock.lock();
        self.inner.condvar.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::SeqCst)
    }

    pub fn to_signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            inner: self.inner.clone(),
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Shutdown {
    fn drop(&mut self) {
        if self.on_drop {
            self.trigger();
        }
    }
}

/// Receiver half of a shutdown signal. Cheap to clone and share between threads.
#[derive(Clone)]
pub struct ShutdownSignal {
    inner: Arc<Inner>,
}

impl ShutdownSignal {
    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::SeqCst)
    }

    /// Block the calling thread until the shutdown is triggered.
    pub fn wait(&self) {
        let mut guard = self.inner.lock.lock();
        while !self.is_triggered() {
            self.inner.condvar.wait(&mut guard);
        }
    }

    /// Block until triggered or until `timeout` elapses. Returns true if triggered.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut guard = self.inner.lock.lock();
        if self.is_triggered() {
            return true;
        }
        self.inner.condvar.wait_for(&mut guard, timeout);
        self.is_triggered()
    }
}

#[cfg(test)]
mod test {
    use std::thread;

    use super::*;

    #[test]
    fn trigger_wakes_waiters() {
        let shutdown = Shutdown::new();
        let signal = shutdown.to_signal();
        assert!(!signal.is_triggered());

        let handle = thread::spawn(move || {
            signal.wait();
            true
        });
        shutdown.trigger();
        assert!(handle.join().unwrap());
        assert!(shutdown.is_triggered());
        // Triggering again is a no-op
        shutdown.trigger();
    }

    #[test]
    fn signal_on_drop() {
        let signal = {
            let shutdown = Shutdown::new();
            shutdown.to_signal()
        };
        assert!(signal.is_triggered());
    }

    #[test]
    fn wait_timeout_expires() {
        let shutdown = Shutdown::new();
        let signal = shutdown.to_signal();
        assert!(!signal.wait_timeout(Duration::from_millis(10)));
        shutdown.trigger();
        assert!(signal.wait_timeout(Duration::from_millis(10)));
    }
}
