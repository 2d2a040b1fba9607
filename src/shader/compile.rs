//! Background shader compilation.
//!
//! Collections are compiled on a small pool of worker threads fed through a
//! `flume` channel. Every job signals the [`CompletionEvent`] installed in its
//! cache entry, whether compilation succeeded or not.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use super::RootSignature;
use super::collection_cache::ShaderCollectionEntry;
use crate::backend::RayTracingBackend;
use crate::stats::{self, RayTracingStats};

// ─── CompletionEvent ─────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct EventState {
    done: Mutex<bool>,
    signal: Condvar,
}

/// One-shot event signaled when a collection has finished compiling.
#[derive(Debug, Clone, Default)]
pub struct CompletionEvent {
    state: Arc<EventState>,
}

impl CompletionEvent {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// An event that is already complete.
    #[must_use]
    pub fn completed() -> Self {
        let event = Self::new();
        event.signal();
        event
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        *self.state.done.lock()
    }

    pub fn signal(&self) {
        let mut done = self.state.done.lock();
        *done = true;
        self.state.signal.notify_all();
    }

    /// Blocks until the event is signaled.
    pub fn wait(&self) {
        let mut done = self.state.done.lock();
        while !*done {
            self.state.signal.wait(&mut done);
        }
    }

    /// Blocks until every event is signaled.
    pub fn wait_all<'a>(events: impl IntoIterator<Item = &'a CompletionEvent>) {
        for event in events {
            event.wait();
        }
    }
}

// ─── CompilePool ─────────────────────────────────────────────────────────────

pub(crate) struct CompileJob {
    pub entry: Arc<ShaderCollectionEntry>,
    pub global_root_signature: Arc<RootSignature>,
}

struct CompileContext {
    backend: Arc<dyn RayTracingBackend>,
    stats: Arc<RayTracingStats>,
}

impl CompileContext {
    fn run(&self, job: &CompileJob) {
        let start = Instant::now();
        job.entry
            .compile(&self.backend, &job.global_root_signature);
        stats::add(&self.stats.compiled_shaders, 1);
        stats::add(&self.stats.created_collections, 1);
        job.entry.finish(start.elapsed());
    }
}

pub(crate) struct CompilePool {
    sender: Option<flume::Sender<CompileJob>>,
    workers: Vec<JoinHandle<()>>,
    context: Arc<CompileContext>,
}

impl CompilePool {
    pub fn new(
        num_threads: usize,
        backend: Arc<dyn RayTracingBackend>,
        stats: Arc<RayTracingStats>,
    ) -> Self {
        let (sender, receiver) = flume::unbounded::<CompileJob>();
        let context = Arc::new(CompileContext { backend, stats });

        let workers = (0..num_threads.max(1))
            .filter_map(|index| {
                let receiver = receiver.clone();
                let context = Arc::clone(&context);
                std::thread::Builder::new()
                    .name(format!("rt-compile-{index}"))
                    .spawn(move || {
                        while let Ok(job) = receiver.recv() {
                            context.run(&job);
                        }
                    })
                    .map_err(|e| log::warn!("Failed to spawn shader compile worker: {e}"))
                    .ok()
            })
            .collect::<Vec<_>>();

        log::debug!("Ray tracing compile pool started with {} workers", workers.len());

        Self {
            sender: Some(sender),
            workers,
            context,
        }
    }

    /// Queues a job. Runs it inline if no worker thread is available.
    pub fn submit(&self, job: CompileJob) {
        let job = match &self.sender {
            Some(sender) if !self.workers.is_empty() => match sender.send(job) {
                Ok(()) => return,
                Err(flume::SendError(job)) => job,
            },
            _ => job,
        };
        self.context.run(&job);
    }
}

impl Drop for CompilePool {
    fn drop(&mut self) {
        self.sender.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completed_event_does_not_block() {
        let event = CompletionEvent::completed();
        assert!(event.is_complete());
        event.wait();
    }

    #[test]
    fn event_wakes_waiters() {
        let event = CompletionEvent::new();
        let waiter = {
            let event = event.clone();
            std::thread::spawn(move || event.wait())
        };
        event.signal();
        waiter.join().unwrap();
        assert!(event.is_complete());
    }
}
