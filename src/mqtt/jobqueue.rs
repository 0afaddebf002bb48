//! Bounded job queue (part of C5): decouples MQTT delivery callbacks and
//! outbound publish/subscribe calls from the caller's own task, the way the
//! original's condvar-guarded `std::queue` + worker `std::thread`s did.
//!
//! `submit` blocks the caller until there is room in the channel or the
//! queue has been stopped, giving the same backpressure the bounded
//! `std::queue` + condvar gave the original; the workers are a fixed pool of
//! `tokio::spawn` tasks sharing one receiver.

use crate::error::{Error, ErrorKind, Result};
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;

type Job = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send + 'static>;

pub struct JobQueue {
    sender: std::sync::Mutex<Option<mpsc::Sender<Job>>>,
    capacity: usize,
    receiver: Arc<AsyncMutex<mpsc::Receiver<Job>>>,
    workers: std::sync::Mutex<Vec<JoinHandle<()>>>,
    active: Arc<AtomicUsize>,
    idle: Arc<Notify>,
    stopped: Arc<AtomicBool>,
}

impl JobQueue {
    /// Builds a queue with capacity `capacity` and spawns `workers` worker
    /// tasks immediately.
    pub fn new(capacity: usize, workers: usize) -> Arc<Self> {
        let capacity = capacity.max(1);
        let (sender, receiver) = mpsc::channel(capacity);
        let this = Arc::new(Self {
            sender: std::sync::Mutex::new(Some(sender)),
            capacity,
            receiver: Arc::new(AsyncMutex::new(receiver)),
            workers: std::sync::Mutex::new(Vec::new()),
            active: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new(Notify::new()),
            stopped: Arc::new(AtomicBool::new(false)),
        });

        let mut handles = Vec::with_capacity(workers.max(1));
        for _ in 0..workers.max(1) {
            let receiver = this.receiver.clone();
            let active = this.active.clone();
            let idle = this.idle.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let job = {
                        let mut rx = receiver.lock().await;
                        rx.recv().await
                    };
                    match job {
                        Some(job) => {
                            active.fetch_add(1, Ordering::SeqCst);
                            job().await;
                            if active.fetch_sub(1, Ordering::SeqCst) == 1 {
                                idle.notify_waiters();
                            }
                        }
                        None => break,
                    }
                }
            }));
        }
        *this.workers.lock().unwrap() = handles;
        this
    }

    /// Enqueues `job`; blocks until there is room or the queue has stopped.
    /// The worker that picks this job up awaits it to completion before
    /// taking its next job, so submitted work is genuinely serialized.
    pub async fn submit<F>(&self, job: impl FnOnce() -> F + Send + 'static) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let sender = {
            let guard = self.sender.lock().unwrap();
            match guard.as_ref() {
                Some(sender) => sender.clone(),
                None => return Err(Error::new(ErrorKind::QueueStopped)),
            }
        };
        let job: Job = Box::new(move || Box::pin(job()));
        sender.send(job).await.map_err(|_| Error::new(ErrorKind::QueueStopped))
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn remaining_capacity(&self) -> usize {
        self.sender.lock().unwrap().as_ref().map(|s| s.capacity()).unwrap_or(self.capacity)
    }

    pub fn queue_size(&self) -> usize {
        self.capacity - self.remaining_capacity()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.lock().unwrap().len()
    }

    /// Blocks until the queue is empty and no worker is mid-job.
    pub async fn wait_for_all(&self) {
        loop {
            if self.active.load(Ordering::SeqCst) == 0 && self.remaining_capacity() == self.capacity {
                return;
            }
            let notified = self.idle.notified();
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(std::time::Duration::from_millis(20)) => {}
            }
        }
    }

    /// Prevents further submits; workers drain the remaining queue and exit.
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.sender.lock().unwrap().take();
        let handles = std::mem::take(&mut *self.workers.lock().unwrap());
        for handle in handles {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn submits_run_and_wait_for_all_returns() {
        let queue = JobQueue::new(4, 2);
        let counter = Arc::new(AtomicU32::new(0));
        for _ in 0..10 {
            let counter = counter.clone();
            queue.submit(move || async move { counter.fetch_add(1, Ordering::SeqCst); }).await.unwrap();
        }
        queue.wait_for_all().await;
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn submit_after_stop_fails() {
        let queue = JobQueue::new(2, 1);
        queue.stop().await;
        let err = queue.submit(|| async {}).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::QueueStopped);
    }
}
