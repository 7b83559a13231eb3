// Copyright (C) 2026 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! Process-wide sample registry: dedup tables, the loader worker pool, and
//! the collector thread. Created by the first pool, torn down by the last.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};
use rayon::ThreadPoolBuilder;
use tracing::{debug, info};

use super::data::FileData;
use super::FileId;
use crate::config;
use crate::sync::{now_micros, Semaphore};

/// Number of streaming workers. One is enough to keep voice startup off
/// the disk; the chunk budget keeps one heavy sample from starving others.
const NUM_LOADER_THREADS: usize = 1;

/// Shared pool running the streaming jobs. Backed by a dedicated Rayon
/// thread pool.
pub(crate) struct LoaderPool {
    pool: rayon::ThreadPool,
}

impl LoaderPool {
    fn new(num_threads: usize) -> Result<Self, String> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(num_threads.max(1))
            .thread_name(|i| format!("samplepool-loader-{i}"))
            .build()
            .map_err(|e| e.to_string())?;
        Ok(Self { pool })
    }

    /// Spawns a one-shot job on the pool, returning a waitable handle.
    pub(crate) fn spawn<F>(&self, job: F) -> JobHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let state = Arc::new(JobState::default());
        let job_state = state.clone();
        self.pool.spawn(move || {
            job();
            let mut done = job_state.done.lock();
            *done = true;
            job_state.condvar.notify_all();
        });
        JobHandle { state }
    }
}

#[derive(Default)]
struct JobState {
    done: Mutex<bool>,
    condvar: Condvar,
}

/// Completion handle for a spawned loader job.
pub(crate) struct JobHandle {
    state: Arc<JobState>,
}

impl JobHandle {
    /// Blocks until the job has run.
    pub(crate) fn wait(&self) {
        let mut done = self.state.done.lock();
        while !*done {
            self.state.condvar.wait(&mut done);
        }
    }

    pub(crate) fn is_finished(&self) -> bool {
        *self.state.done.lock()
    }
}

/// Registry state shared with the collector thread.
pub(crate) struct GlobalShared {
    /// Prefix-cached samples, deduplicated process-wide. Weak entries: the
    /// owning pools hold the strong references.
    preloaded: Mutex<HashMap<FileId, Weak<FileData>>>,
    /// Fully loaded samples.
    loaded: Mutex<HashMap<FileId, Weak<FileData>>>,
    /// Ticking wake-up for the collector, also posted by `stop_render` as
    /// a fast-path kick.
    garbage_barrier: Semaphore,
    collector_running: AtomicBool,
    /// Number of render passes in flight; the collector never runs while
    /// rendering is active.
    running_render: AtomicU32,
}

static GLOBAL: Lazy<Mutex<Weak<GlobalPool>>> = Lazy::new(|| Mutex::new(Weak::new()));

/// The process-wide pool singleton. Obtained through a weak cache so it
/// exists exactly while at least one `FilePool` does.
pub struct GlobalPool {
    shared: Arc<GlobalShared>,
    loader: LoaderPool,
    collector: Mutex<Option<JoinHandle<()>>>,
}

impl GlobalPool {
    /// Returns the live singleton, creating it on first use.
    pub fn get() -> Arc<GlobalPool> {
        let mut cached = GLOBAL.lock();
        if let Some(global) = cached.upgrade() {
            return global;
        }

        let global = Arc::new(GlobalPool::new(NUM_LOADER_THREADS));
        *cached = Arc::downgrade(&global);
        global
    }

    fn new(num_threads: usize) -> GlobalPool {
        let shared = Arc::new(GlobalShared {
            preloaded: Mutex::new(HashMap::new()),
            loaded: Mutex::new(HashMap::new()),
            garbage_barrier: Semaphore::new(0),
            collector_running: AtomicBool::new(true),
            running_render: AtomicU32::new(0),
        });

        let loader = LoaderPool::new(num_threads).expect("failed to build the loader thread pool");

        let collector_shared = shared.clone();
        let collector = thread::Builder::new()
            .name("samplepool-collector".into())
            .spawn(move || collector_loop(collector_shared))
            .expect("failed to spawn the sample collector thread");

        info!(workers = num_threads, "Sample registry started");
        GlobalPool {
            shared,
            loader,
            collector: Mutex::new(Some(collector)),
        }
    }

    pub(crate) fn loader(&self) -> &LoaderPool {
        &self.loader
    }

    pub(crate) fn preloaded_files(&self) -> &Mutex<HashMap<FileId, Weak<FileData>>> {
        &self.shared.preloaded
    }

    pub(crate) fn loaded_files(&self) -> &Mutex<HashMap<FileId, Weak<FileData>>> {
        &self.shared.loaded
    }

    pub(crate) fn start_render(&self) {
        self.shared.running_render.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn stop_render(&self) {
        self.shared.running_render.fetch_sub(1, Ordering::AcqRel);
        self.shared.garbage_barrier.post();
    }

    /// Number of live prefix-cached samples across all pools.
    pub fn num_preloaded_samples(&self) -> usize {
        self.shared
            .preloaded
            .lock()
            .values()
            .filter(|entry| entry.strong_count() > 0)
            .count()
    }

    /// Number of live fully loaded samples across all pools.
    pub fn num_loaded_samples(&self) -> usize {
        self.shared
            .loaded
            .lock()
            .values()
            .filter(|entry| entry.strong_count() > 0)
            .count()
    }

    /// Runs one collector pass immediately, ignoring the idle-period gate
    /// of the collector thread (each entry's own idle check still applies).
    #[cfg(test)]
    pub(crate) fn collect_now(&self) {
        collect_into(&self.shared);
    }
}

impl Drop for GlobalPool {
    fn drop(&mut self) {
        self.shared.collector_running.store(false, Ordering::Release);
        self.shared.garbage_barrier.post();
        if let Some(collector) = self.collector.lock().take() {
            let _ = collector.join();
        }
        // Drain stray stop_render kicks.
        while self.shared.garbage_barrier.try_wait() {}
        info!("Sample registry stopped");
    }
}

fn collector_loop(shared: Arc<GlobalShared>) {
    let mut last_pass = Instant::now();
    loop {
        shared.garbage_barrier.timed_wait(config::FILE_CLEARING_PERIOD);
        if !shared.collector_running.load(Ordering::Acquire) {
            break;
        }

        // Never disturb active rendering with eviction work.
        if shared.running_render.load(Ordering::Acquire) != 0 {
            continue;
        }

        let now = Instant::now();
        if now.duration_since(last_pass) < config::FILE_CLEARING_PERIOD {
            continue;
        }
        last_pass = now;

        collect_into(&shared);
    }
}

/// One eviction pass. Map locks are only tried, never waited on, so the
/// collector cannot stall an interactive preload.
fn collect_into(shared: &GlobalShared) {
    let now = now_micros();

    if let Some(mut preloaded) = shared.preloaded.try_lock() {
        preloaded.retain(|id, entry| {
            let data = match entry.upgrade() {
                Some(data) => data,
                None => return false,
            };
            if data.can_remove() {
                debug!(file = %id, "Dropping released sample from the registry");
                return false;
            }
            if data.try_evict(now) {
                debug!(file = %id, "Evicted idle sample body");
            }
            true
        });
    }

    if let Some(mut loaded) = shared.loaded.try_lock() {
        loaded.retain(|id, entry| {
            let data = match entry.upgrade() {
                Some(data) => data,
                None => return false,
            };
            if data.can_remove() {
                debug!(file = %id, "Dropping released sample from the registry");
                return false;
            }
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[test]
    fn test_singleton_is_shared() {
        let a = GlobalPool::get();
        let b = GlobalPool::get();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_job_handle_completion() {
        let global = GlobalPool::get();
        let counter = Arc::new(AtomicUsize::new(0));

        let job_counter = counter.clone();
        let handle = global.loader().spawn(move || {
            job_counter.fetch_add(1, Ordering::SeqCst);
        });

        handle.wait();
        assert!(handle.is_finished());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
