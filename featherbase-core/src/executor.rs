// src/executor.rs
//! Serialized operation queue.
//!
//! One worker thread consumes jobs from a FIFO channel, so at most one core
//! operation runs at a time and every operation observes the effects of the
//! ones queued before it. The queue starts in buffer mode: jobs are held
//! until the datastore finishes loading, except jobs pushed with
//! `force_queuing` (the load itself).

use std::collections::VecDeque;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{bounded, unbounded, Sender};
use parking_lot::Mutex;

type Job = Box<dyn FnOnce() + Send + 'static>;

struct PendingState {
    buffering: bool,
    buffer: VecDeque<Job>,
}

pub struct Executor {
    sender: Mutex<Option<Sender<Job>>>,
    pending: Mutex<PendingState>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Executor {
    pub fn new() -> Self {
        let (sender, receiver) = unbounded::<Job>();
        let worker = thread::Builder::new()
            .name("featherbase-executor".to_string())
            .spawn(move || {
                for job in receiver {
                    job();
                }
            })
            .expect("failed to spawn the executor worker thread");
        Executor {
            sender: Mutex::new(Some(sender)),
            pending: Mutex::new(PendingState {
                buffering: true,
                buffer: VecDeque::new(),
            }),
            worker: Mutex::new(Some(worker)),
        }
    }

    pub fn is_buffering(&self) -> bool {
        self.pending.lock().buffering
    }

    /// Enqueue a job. While buffering, jobs are held unless `force_queuing`
    /// is set. The pending lock is held across the send so submission order
    /// is the execution order.
    pub fn push(&self, job: Job, force_queuing: bool) {
        let mut pending = self.pending.lock();
        if pending.buffering && !force_queuing {
            pending.buffer.push_back(job);
            return;
        }
        if let Some(sender) = self.sender.lock().as_ref() {
            let _ = sender.send(job);
        }
    }

    /// Leave buffer mode and release the held jobs in submission order.
    pub fn process_buffer(&self) {
        let mut pending = self.pending.lock();
        pending.buffering = false;
        let sender = self.sender.lock();
        if let Some(sender) = sender.as_ref() {
            while let Some(job) = pending.buffer.pop_front() {
                let _ = sender.send(job);
            }
        }
    }

    /// Run `f` on the worker and block until its result is back.
    ///
    /// Must not be called from the worker thread itself: the queue admits one
    /// job at a time, so the nested job would never start.
    pub fn submit<R, F>(&self, force_queuing: bool, f: F) -> R
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        let (reply_tx, reply_rx) = bounded(1);
        self.push(
            Box::new(move || {
                let _ = reply_tx.send(f());
            }),
            force_queuing,
        );
        reply_rx
            .recv()
            .expect("executor worker terminated while an operation was queued")
    }
}

impl Default for Executor {
    fn default() -> Self {
        Executor::new()
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        // Closing the channel stops the worker after the jobs already queued.
        self.sender.lock().take();
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}
