use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use sha1::{Digest, Sha1};
use tracing::{debug, trace};

use crate::chunks::ChunkHandle;
use crate::signal::CallbackKey;

type Responder = Box<dyn FnOnce(ChunkHandle, [u8; 20]) + Send>;

struct Job {
    key: CallbackKey,
    chunk: ChunkHandle,
    respond: Responder,
}

#[derive(Default)]
struct Queue {
    jobs: VecDeque<Job>,
    shutdown: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    wake: Condvar,
}

/// FIFO hash pipeline: chunks queued here are digested on a dedicated
/// worker thread, results delivered through the job's responder (which
/// typically posts into the download's callback inbox).
///
/// The worker blocks only on its queue. `remove` drops queued entries by
/// key; a result that raced removal is still delivered and the receiver
/// treats unknown chunks as no-ops.
pub struct HashQueue {
    shared: Arc<Shared>,
    worker: Option<std::thread::JoinHandle<()>>,
}

impl HashQueue {
    pub fn spawn() -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue::default()),
            wake: Condvar::new(),
        });
        let worker_shared = shared.clone();
        let worker = std::thread::Builder::new()
            .name("riptide-hash".into())
            .spawn(move || hash_worker(worker_shared))
            .expect("failed to spawn hash thread");
        HashQueue {
            shared,
            worker: Some(worker),
        }
    }

    pub fn push(
        &self,
        key: CallbackKey,
        chunk: ChunkHandle,
        respond: impl FnOnce(ChunkHandle, [u8; 20]) + Send + 'static,
    ) {
        let mut q = self.shared.queue.lock();
        q.jobs.push_back(Job {
            key,
            chunk,
            respond: Box::new(respond),
        });
        trace!(pending = q.jobs.len(), "queued chunk for hashing");
        drop(q);
        self.shared.wake.notify_one();
    }

    /// Drops all queued entries for `key`. Idempotent; an in-progress hash
    /// is not interrupted.
    pub fn remove(&self, key: CallbackKey) {
        let mut q = self.shared.queue.lock();
        let before = q.jobs.len();
        q.jobs.retain(|j| j.key != key);
        if before != q.jobs.len() {
            debug!(dropped = before - q.jobs.len(), "removed queued hash jobs");
        }
    }

    pub fn pending(&self) -> usize {
        self.shared.queue.lock().jobs.len()
    }
}

impl Drop for HashQueue {
    fn drop(&mut self) {
        {
            let mut q = self.shared.queue.lock();
            q.shutdown = true;
            q.jobs.clear();
        }
        self.shared.wake.notify_one();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn hash_worker(shared: Arc<Shared>) {
    loop {
        let job = {
            let mut q = shared.queue.lock();
            loop {
                if q.shutdown {
                    return;
                }
                if let Some(job) = q.jobs.pop_front() {
                    break job;
                }
                shared.wake.wait(&mut q);
            }
        };

        let digest = job.chunk.with_data(|data| {
            let mut hasher = Sha1::new();
            hasher.update(data);
            let out: [u8; 20] = hasher.finalize().into();
            out
        });
        (job.respond)(job.chunk, digest);
    }
}

/// Digest helper for callers that already hold the bytes (tests, initial
/// checks of short torrents).
pub fn sha1_digest(data: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}
