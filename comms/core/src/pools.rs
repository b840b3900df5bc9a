// Copyright 2023 The Epic Development Community
// SPDX-License-Identifier: BSD-3-Clause

use std::thread;

use crossbeam_channel::{unbounded, Sender};
use log::*;
use parking_lot::Mutex;

const LOG_TARGET: &str = "comms::pools";

type Job = Box<dyn FnOnce() + Send>;

/// A fixed-size worker pool draining a job queue. `stop` completes pending work before joining.
pub struct WorkerPool {
    name: &'static str,
    tx: Mutex<Option<Sender<Job>>>,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(name: &'static str, size: usize) -> Self {
        let size = size.max(1);
        let (tx, rx) = unbounded::<Job>();
        let mut handles = Vec::with_capacity(size);
        for i in 0..size {
            let rx = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("{}-{}", name, i))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        job();
                    }
                })
                .expect("spawn pool worker");
            handles.push(handle);
        }
        debug!(target: LOG_TARGET, "{} pool started with {} workers", name, size);
        Self {
            name,
            tx: Mutex::new(Some(tx)),
            handles: Mutex::new(handles),
        }
    }

    pub fn execute(&self, job: impl FnOnce() + Send + 'static) {
        if let Some(tx) = self.tx.lock().as_ref() {
            let _ = tx.send(Box::new(job));
        }
    }

    /// Close the queue, let the workers finish everything already queued and join them.
    pub fn stop(&self) {
        self.tx.lock().take();
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
        debug!(target: LOG_TARGET, "{} pool stopped", self.name);
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod test {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;

    #[test]
    fn completes_queued_work_before_stopping() {
        let counter = Arc::new(AtomicUsize::new(0));
        let pool = WorkerPool::new("test", 3);
        for _ in 0..100 {
            let counter = counter.clone();
            pool.execute(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.stop();
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn zero_size_gets_one_worker() {
        let pool = WorkerPool::new("min", 0);
        let (tx, rx) = crossbeam_channel::bounded(1);
        pool.execute(move || {
            let _ = tx.send(42);
        });
        assert_eq!(rx.recv().unwrap(), 42);
    }
}
