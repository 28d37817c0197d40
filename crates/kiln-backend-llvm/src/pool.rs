//! Host streams: ordered submission queues backed by worker threads.
//!
//! Each logical stream owns one worker so that kernels and asynchronous
//! copies submitted to it execute in order, while separate streams run
//! concurrently (this is what parallel dispatch builds on). Large kernels
//! additionally fan out across scoped threads inside their job. The
//! thread machinery is deliberately hidden behind this module's small
//! surface; the rest of the backend only submits jobs and waits on
//! tickets.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use kiln::{JitError, Result};

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

struct Progress {
    completed: Mutex<u64>,
    signal: Condvar,
}

struct StreamInner {
    sender: Sender<Job>,
    submitted: AtomicU64,
    progress: Arc<Progress>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Default)]
pub(crate) struct StreamPool {
    streams: Mutex<HashMap<usize, Arc<StreamInner>>>,
    next_id: AtomicUsize,
}

impl StreamPool {
    pub fn create(&self) -> usize {
        let (sender, receiver) = channel::<Job>();
        let progress = Arc::new(Progress {
            completed: Mutex::new(0),
            signal: Condvar::new(),
        });

        let worker_progress = Arc::clone(&progress);
        let worker = std::thread::Builder::new()
            .name("kiln-stream".into())
            .spawn(move || {
                while let Ok(job) = receiver.recv() {
                    job();
                    let mut completed = worker_progress
                        .completed
                        .lock()
                        .expect("stream progress poisoned");
                    *completed += 1;
                    worker_progress.signal.notify_all();
                }
            })
            .expect("failed to spawn stream worker");

        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.streams.lock().expect("stream pool poisoned").insert(
            id,
            Arc::new(StreamInner {
                sender,
                submitted: AtomicU64::new(0),
                progress,
                worker: Mutex::new(Some(worker)),
            }),
        );
        id
    }

    fn stream(&self, id: usize) -> Result<Arc<StreamInner>> {
        self.streams
            .lock()
            .expect("stream pool poisoned")
            .get(&id)
            .cloned()
            .ok_or_else(|| JitError::Driver(format!("unknown host stream {id}")))
    }

    pub fn destroy(&self, id: usize) {
        let stream = match self.streams.lock().expect("stream pool poisoned").remove(&id) {
            Some(stream) => stream,
            None => return,
        };
        let _ = self.sync_inner(&stream);
        let handle = stream.worker.lock().expect("stream worker poisoned").take();
        // Dropping the last reference closes the channel, which stops the
        // worker loop.
        drop(stream);
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    /// Submits a job, returning its completion ticket.
    pub fn submit(&self, id: usize, job: Job) -> Result<u64> {
        let stream = self.stream(id)?;
        let ticket = stream.submitted.fetch_add(1, Ordering::SeqCst) + 1;
        stream
            .sender
            .send(job)
            .map_err(|_| JitError::Driver("host stream worker terminated".into()))?;
        Ok(ticket)
    }

    /// Whether the stream has no queued or running work.
    pub fn idle(&self, id: usize) -> Result<bool> {
        let stream = self.stream(id)?;
        let submitted = stream.submitted.load(Ordering::SeqCst);
        let completed = *stream
            .progress
            .completed
            .lock()
            .expect("stream progress poisoned");
        Ok(completed >= submitted)
    }

    /// Current ticket value; everything submitted so far completes once
    /// progress reaches it.
    pub fn ticket(&self, id: usize) -> Result<u64> {
        Ok(self.stream(id)?.submitted.load(Ordering::SeqCst))
    }

    pub fn reached(&self, id: usize, ticket: u64) -> Result<bool> {
        let stream = self.stream(id)?;
        let completed = *stream
            .progress
            .completed
            .lock()
            .expect("stream progress poisoned");
        Ok(completed >= ticket)
    }

    /// Blocks until the stream has completed at least `ticket` jobs.
    pub fn wait(&self, id: usize, ticket: u64) -> Result<()> {
        let stream = self.stream(id)?;
        let mut completed = stream
            .progress
            .completed
            .lock()
            .expect("stream progress poisoned");
        while *completed < ticket {
            completed = stream
                .progress
                .signal
                .wait(completed)
                .expect("stream progress poisoned");
        }
        Ok(())
    }

    /// Blocks until every job submitted to the stream has completed.
    pub fn sync(&self, id: usize) -> Result<()> {
        let stream = self.stream(id)?;
        self.sync_inner(&stream)
    }

    fn sync_inner(&self, stream: &StreamInner) -> Result<()> {
        let target = stream.submitted.load(Ordering::SeqCst);
        let mut completed = stream
            .progress
            .completed
            .lock()
            .expect("stream progress poisoned");
        while *completed < target {
            completed = stream
                .progress
                .signal
                .wait(completed)
                .expect("stream progress poisoned");
        }
        Ok(())
    }

    /// Blocks until every stream is idle.
    pub fn sync_all(&self) -> Result<()> {
        let ids: Vec<usize> = self
            .streams
            .lock()
            .expect("stream pool poisoned")
            .keys()
            .copied()
            .collect();
        for id in ids {
            self.sync(id)?;
        }
        Ok(())
    }
}

/// Number of worker threads used when a single kernel is split.
pub(crate) fn worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn jobs_on_one_stream_run_in_order() {
        let pool = StreamPool::default();
        let id = pool.create();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..16 {
            let log = Arc::clone(&log);
            pool.submit(id, Box::new(move || log.lock().unwrap().push(i)))
                .unwrap();
        }
        pool.sync(id).unwrap();
        assert_eq!(*log.lock().unwrap(), (0..16).collect::<Vec<_>>());
        pool.destroy(id);
    }

    #[test]
    fn tickets_track_completion() {
        let pool = StreamPool::default();
        let id = pool.create();
        let counter = Arc::new(AtomicU32::new(0));
        {
            let counter = Arc::clone(&counter);
            pool.submit(id, Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        }
        let ticket = pool.ticket(id).unwrap();
        pool.sync(id).unwrap();
        assert!(pool.reached(id, ticket).unwrap());
        assert!(pool.idle(id).unwrap());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        pool.destroy(id);
    }

    #[test]
    fn destroy_waits_for_queued_work() {
        let pool = StreamPool::default();
        let id = pool.create();
        let done = Arc::new(AtomicU32::new(0));
        {
            let done = Arc::clone(&done);
            pool.submit(id, Box::new(move || {
                std::thread::sleep(std::time::Duration::from_millis(20));
                done.store(1, Ordering::SeqCst);
            }))
            .unwrap();
        }
        pool.destroy(id);
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }
}
