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

//! The sample file pool.
//!
//! Each synthesizer owns one `FilePool`. Preloading decodes a bounded
//! prefix of every sample an instrument references so a voice can start
//! with zero disk latency; `get_promise` then streams the remainder in the
//! background while the voice plays from the prefix. Sample data is
//! deduplicated across pools through a process-wide registry, and a
//! collector thread reclaims bodies that have sat idle.

mod data;
mod global;
mod stream;

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use crossbeam_queue::ArrayQueue;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config;
use crate::reader::{self, ReaderError, SampleReader, WavetableInfo};
use crate::sync::Semaphore;

pub use data::{FileData, FileDataHolder, Status};
pub use global::GlobalPool;

use global::JobHandle;

/// Identifies a logical audio source within the pool: a file name plus
/// whether it plays back reversed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileId {
    filename: String,
    reverse: bool,
}

impl FileId {
    pub fn new(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            reverse: false,
        }
    }

    pub fn reversed(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            reverse: true,
        }
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn is_reverse(&self) -> bool {
        self.reverse
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.filename)?;
        if self.reverse {
            write!(f, " (reversed)")?;
        }
        Ok(())
    }
}

/// A forward loop within a sample, in frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopRange {
    pub start: u64,
    pub end: u64,
}

/// Decoded metadata of a sample. Immutable once the entry is initialized.
#[derive(Debug, Clone, PartialEq)]
pub struct FileInformation {
    /// Index of the last frame.
    pub end: u64,
    pub sample_rate: f64,
    /// Always 1 or 2.
    pub num_channels: u16,
    /// MIDI key at which the sample plays untransposed, if the file says.
    pub root_key: Option<u8>,
    pub loop_range: Option<LoopRange>,
    pub wavetable: Option<WavetableInfo>,
}

impl FileInformation {
    /// Total number of frames in the sample.
    pub fn num_frames(&self) -> u64 {
        self.end + 1
    }
}

/// Rewrites a sample path before it is opened and runs any caller-supplied
/// pre-open action. Returning None marks the sample as not found.
pub trait PathResolver: Send + Sync {
    fn resolve(&self, path: &std::path::Path) -> Option<PathBuf>;
}

/// Identifies one pool in the per-sample owner accounting.
pub(crate) type PoolId = u64;

/// Global pool ID counter so owner registrations stay unique across pools.
static POOL_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

fn next_pool_id() -> PoolId {
    POOL_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// A stream request traveling from the render thread to the dispatcher.
/// The weak id expires when the owning region is deleted, turning the
/// request into a no-op.
pub(crate) struct QueuedFileData {
    pub(crate) id: Weak<FileId>,
    pub(crate) data: Arc<FileData>,
}

/// Pool state shared with the dispatcher thread and the stream jobs.
pub(crate) struct PoolShared {
    root_directory: RwLock<PathBuf>,
    resolver: Option<Arc<dyn PathResolver>>,
    free_wheeling: AtomicBool,
    pub(crate) files_to_load: ArrayQueue<QueuedFileData>,
    pub(crate) dispatch_barrier: Semaphore,
    dispatch_running: AtomicBool,
    loading_jobs: Mutex<Vec<JobHandle>>,
    global: Arc<GlobalPool>,
}

impl PoolShared {
    /// Opens a decoder for `id` under the pool's root, after the resolver
    /// hook has had its say.
    pub(crate) fn open_reader(&self, id: &FileId) -> Result<Box<dyn SampleReader>, ReaderError> {
        let path = self.resolve_path(id.filename());
        reader::open_file(&path, id.is_reverse())
    }

    fn resolve_path(&self, filename: &str) -> PathBuf {
        let path = self.root_directory.read().join(filename);
        match &self.resolver {
            Some(resolver) => resolver.resolve(&path).unwrap_or(path),
            None => path,
        }
    }

    pub(crate) fn free_wheeling(&self) -> bool {
        self.free_wheeling.load(Ordering::Acquire)
    }
}

/// Per-synthesizer facade over the shared sample cache.
///
/// All operations take `&self`: control threads preload and configure
/// while a render thread calls `get_promise` concurrently. Only
/// `get_promise` and holder reads are real-time safe.
pub struct FilePool {
    id: PoolId,
    preload_size: AtomicU64,
    load_in_ram: AtomicBool,
    /// Strong references to the prefix-cached entries this pool wants.
    preloaded: RwLock<HashMap<FileId, Arc<FileData>>>,
    /// Strong references to fully loaded entries.
    loaded: RwLock<HashMap<FileId, Arc<FileData>>>,
    shared: Arc<PoolShared>,
    global: Arc<GlobalPool>,
    dispatch_thread: Mutex<Option<JoinHandle<()>>>,
}

impl FilePool {
    /// Creates a pool resolving sample names under `root_directory`.
    pub fn new(root_directory: impl Into<PathBuf>) -> FilePool {
        Self::build(root_directory.into(), None)
    }

    /// Creates a pool with a path-resolution hook consulted before every
    /// open.
    pub fn with_resolver(
        root_directory: impl Into<PathBuf>,
        resolver: Arc<dyn PathResolver>,
    ) -> FilePool {
        Self::build(root_directory.into(), Some(resolver))
    }

    fn build(root_directory: PathBuf, resolver: Option<Arc<dyn PathResolver>>) -> FilePool {
        let global = GlobalPool::get();
        let shared = Arc::new(PoolShared {
            root_directory: RwLock::new(root_directory),
            resolver,
            free_wheeling: AtomicBool::new(false),
            files_to_load: ArrayQueue::new(config::STREAM_QUEUE_CAPACITY),
            dispatch_barrier: Semaphore::new(0),
            dispatch_running: AtomicBool::new(true),
            loading_jobs: Mutex::new(Vec::new()),
            global: global.clone(),
        });

        let dispatch_shared = shared.clone();
        let dispatch_thread = thread::Builder::new()
            .name("samplepool-dispatch".into())
            .spawn(move || dispatching_job(dispatch_shared))
            .expect("failed to spawn the sample dispatcher thread");

        FilePool {
            id: next_pool_id(),
            preload_size: AtomicU64::new(config::DEFAULT_PRELOAD_SIZE),
            load_in_ram: AtomicBool::new(false),
            preloaded: RwLock::new(HashMap::new()),
            loaded: RwLock::new(HashMap::new()),
            shared,
            global,
            dispatch_thread: Mutex::new(Some(dispatch_thread)),
        }
    }

    /// Checks that `file_id` refers to an openable sample, rewriting its
    /// filename through the resolver hook if one is installed.
    pub fn check_sample_id(&self, file_id: &mut FileId) -> bool {
        if self.loaded.read().contains_key(file_id) {
            return true;
        }

        let path = self.shared.root_directory.read().join(file_id.filename());
        match &self.shared.resolver {
            Some(resolver) => match resolver.resolve(&path) {
                Some(resolved) => {
                    if resolved != path {
                        debug!(
                            from = %path.display(),
                            to = %resolved.display(),
                            "Resolved sample path"
                        );
                        file_id.filename = resolved.to_string_lossy().into_owned();
                    }
                    true
                }
                None => false,
            },
            None => path.exists(),
        }
    }

    /// Returns the metadata of a sample, from the cache when the pool
    /// already holds it, from the decoder otherwise. Samples with channel
    /// counts other than 1 or 2 are rejected.
    pub fn get_file_information(&self, file_id: &FileId) -> Option<FileInformation> {
        if let Some(information) = self.existing_file_information(file_id) {
            return Some(information);
        }

        let path = self.shared.resolve_path(file_id.filename());
        if !path.exists() {
            return None;
        }

        match reader::open_file(&path, file_id.is_reverse()) {
            Ok(decoder) => reader_information(decoder.as_ref()),
            Err(e) => {
                debug!(file = %file_id, error = %e, "Could not open sample");
                None
            }
        }
    }

    fn existing_file_information(&self, file_id: &FileId) -> Option<FileInformation> {
        if let Some(data) = self.loaded.read().get(file_id) {
            return Some(data.information().clone());
        }
        self.preloaded
            .read()
            .get(file_id)
            .map(|data| data.information().clone())
    }

    /// Synchronously decodes the prefix of a sample so voices can start on
    /// it with zero disk latency, registering this pool as an owner.
    /// Entries are deduplicated against this pool's own tables and the
    /// global registry before anything is read. The prefix covers
    /// `max_offset` plus the configured preload size.
    pub fn preload_file(&self, file_id: &FileId, max_offset: u64) -> bool {
        // Lookups are scoped so no map lock is held while waiting on an
        // entry another pool is still initializing.
        let locally_loaded = self.loaded.read().get(file_id).cloned();
        if let Some(data) = locally_loaded {
            if data.add_secondary_owner(self.id) {
                return true;
            }
        }

        {
            let registry = self.global.loaded_files().lock();
            if let Some(data) = registry.get(file_id).and_then(Weak::upgrade) {
                if data.add_secondary_owner(self.id) {
                    drop(registry);
                    self.loaded.write().insert(file_id.clone(), data);
                    return true;
                }
            }
        }

        let Some(information) = self.get_file_information(file_id) else {
            return false;
        };

        let mut decoder = match self.shared.open_reader(file_id) {
            Ok(decoder) => decoder,
            Err(e) => {
                warn!(file = %file_id, error = %e, "Could not open sample for preloading");
                return false;
            }
        };

        let frames = decoder.frames();
        let frames_to_load = if self.load_in_ram.load(Ordering::Acquire) {
            frames
        } else {
            frames.min(max_offset.saturating_add(self.preload_size()))
        };

        let locally_preloaded = self.preloaded.read().get(file_id).cloned();
        if let Some(data) = locally_preloaded {
            if data.add_secondary_owner(self.id) {
                self.grow_preload(&data, decoder.as_mut(), frames, frames_to_load, max_offset);
                return true;
            }
        }

        let mut registry = self.global.preloaded_files().lock();
        if let Some(data) = registry.get(file_id).and_then(Weak::upgrade) {
            if data.add_secondary_owner(self.id) {
                self.preloaded.write().insert(file_id.clone(), data.clone());
                drop(registry);
                self.grow_preload(&data, decoder.as_mut(), frames, frames_to_load, max_offset);
                // Correct the status for this preload length.
                if matches!(data.status(), Status::Preloaded | Status::FullLoaded) {
                    data.set_status(if frames == frames_to_load {
                        Status::FullLoaded
                    } else {
                        Status::Preloaded
                    });
                }
                return true;
            }
        }

        // Miss: create and register the entry before the synchronous read
        // so concurrent pools adopt it instead of decoding it twice.
        let data = Arc::new(FileData::new(information, max_offset));
        registry.insert(file_id.clone(), Arc::downgrade(&data));
        self.preloaded.write().insert(file_id.clone(), data.clone());
        data.add_owner(self.id);
        drop(registry);

        let prefix = stream::read_from_file(decoder.as_mut(), frames_to_load);
        debug!(
            file = %file_id,
            frames = frames_to_load,
            memory_kb = prefix.memory_size() / 1024,
            "Preloaded sample"
        );
        data.init_with(
            if frames == frames_to_load {
                Status::FullLoaded
            } else {
                Status::Preloaded
            },
            prefix,
        );
        true
    }

    /// Grows an adopted entry's prefix when this preload asks for more
    /// than is resident. The prefix never shrinks here.
    fn grow_preload(
        &self,
        data: &FileData,
        decoder: &mut dyn SampleReader,
        frames: u64,
        frames_to_load: u64,
        max_offset: u64,
    ) {
        data.raise_max_offset(max_offset);
        if frames_to_load > data.preloaded_frames() {
            data.replace_preloaded(stream::read_from_file(decoder, frames_to_load));
            if frames == frames_to_load && data.status() != Status::FullLoaded {
                data.set_status(Status::FullLoaded);
            }
        }
    }

    /// Loads a sample in its entirety, bypassing the preload machinery.
    pub fn load_file(&self, file_id: &FileId) -> Option<FileDataHolder> {
        let information = self.get_file_information(file_id)?;

        let locally_loaded = self.loaded.read().get(file_id).cloned();
        if let Some(data) = locally_loaded {
            if data.add_secondary_owner(self.id) {
                return Some(FileDataHolder::new(data));
            }
        }

        let mut registry = self.global.loaded_files().lock();
        if let Some(data) = registry.get(file_id).and_then(Weak::upgrade) {
            if data.add_secondary_owner(self.id) {
                self.loaded.write().insert(file_id.clone(), data.clone());
                return Some(FileDataHolder::new(data));
            }
        }

        let mut decoder = match self.shared.open_reader(file_id) {
            Ok(decoder) => decoder,
            Err(e) => {
                warn!(file = %file_id, error = %e, "Could not open sample for loading");
                return None;
            }
        };

        let frames = decoder.frames();
        let data = Arc::new(FileData::new(information, 0));
        registry.insert(file_id.clone(), Arc::downgrade(&data));
        self.loaded.write().insert(file_id.clone(), data.clone());
        data.add_owner(self.id);
        drop(registry);

        data.init_with(
            Status::FullLoaded,
            stream::read_from_file(decoder.as_mut(), frames),
        );
        Some(FileDataHolder::new(data))
    }

    /// Loads a sample from an in-memory file image.
    pub fn load_from_ram(&self, file_id: &FileId, bytes: &[u8]) -> Option<FileDataHolder> {
        let locally_loaded = self.loaded.read().get(file_id).cloned();
        if let Some(data) = locally_loaded {
            if data.add_secondary_owner(self.id) {
                return Some(FileDataHolder::new(data));
            }
        }

        let mut registry = self.global.loaded_files().lock();
        if let Some(data) = registry.get(file_id).and_then(Weak::upgrade) {
            if data.add_secondary_owner(self.id) {
                self.loaded.write().insert(file_id.clone(), data.clone());
                return Some(FileDataHolder::new(data));
            }
        }

        let mut decoder = match reader::open_memory(bytes.to_vec(), file_id.is_reverse()) {
            Ok(decoder) => decoder,
            Err(e) => {
                warn!(file = %file_id, error = %e, "Could not open in-memory sample");
                return None;
            }
        };
        let information = reader_information(decoder.as_ref())?;

        let frames = decoder.frames();
        let data = Arc::new(FileData::new(information, 0));
        registry.insert(file_id.clone(), Arc::downgrade(&data));
        self.loaded.write().insert(file_id.clone(), data.clone());
        data.add_owner(self.id);
        drop(registry);

        data.init_with(
            Status::FullLoaded,
            stream::read_from_file(decoder.as_mut(), frames),
        );
        debug!(file = %file_id, frames, "Added an in-memory sample");
        Some(FileDataHolder::new(data))
    }

    /// Requests playback of a sample from the render thread. Returns a
    /// holder over the cached data and, the first time, queues a streaming
    /// job for the body. Real-time safe: atomics, one bounded queue push,
    /// and one semaphore post. Returns None when the sample was never
    /// preloaded or the job queue is saturated (the voice then plays the
    /// prefix only).
    pub fn get_promise(&self, file_id: &Arc<FileId>) -> Option<FileDataHolder> {
        if let Some(data) = self.loaded.read().get(file_id.as_ref()) {
            return Some(FileDataHolder::new(data.clone()));
        }

        let data = match self.preloaded.read().get(file_id.as_ref()) {
            Some(data) => data.clone(),
            None => {
                debug!(file = %file_id, "Sample was never preloaded");
                return None;
            }
        };

        if data.status() == Status::Preloaded {
            let queued = QueuedFileData {
                id: Arc::downgrade(file_id),
                data: data.clone(),
            };
            if self.shared.files_to_load.push(queued).is_err() {
                debug!(file = %file_id, "Stream queue is saturated");
                return None;
            }
            data.try_transition(Status::Preloaded, Status::PendingStreaming);
            self.shared.dispatch_barrier.post();
        }

        Some(FileDataHolder::new(data))
    }

    /// Re-decodes every preloaded prefix for a new preload size. Not
    /// real-time safe.
    pub fn set_preload_size(&self, preload_size: u64) {
        self.preload_size.store(preload_size, Ordering::Release);
        if self.load_in_ram.load(Ordering::Acquire) {
            return;
        }

        let preloaded = self.preloaded.read();
        for (file_id, data) in preloaded.iter() {
            let mut decoder = match self.shared.open_reader(file_id) {
                Ok(decoder) => decoder,
                Err(e) => {
                    warn!(file = %file_id, error = %e, "Could not reopen sample to resize preload");
                    continue;
                }
            };

            let frames = decoder.frames();
            let frames_to_load = frames.min(data.max_offset().saturating_add(preload_size));
            data.replace_preloaded(stream::read_from_file(decoder.as_mut(), frames_to_load));

            let full = frames == frames_to_load;
            let status = data.status();
            if full && status != Status::FullLoaded {
                data.set_status(Status::FullLoaded);
            } else if !full && status == Status::FullLoaded {
                data.try_transition(Status::FullLoaded, Status::Preloaded);
            }
        }
    }

    pub fn preload_size(&self) -> u64 {
        self.preload_size.load(Ordering::Acquire)
    }

    /// Switches between fully resident and prefix-only caching. Going true
    /// loads every preloaded sample to its full length; going false trims
    /// back to the configured preload size.
    pub fn set_ram_loading(&self, load_in_ram: bool) {
        if self.load_in_ram.swap(load_in_ram, Ordering::AcqRel) == load_in_ram {
            return;
        }

        if !load_in_ram {
            self.set_preload_size(self.preload_size());
            return;
        }

        let preloaded = self.preloaded.read();
        for (file_id, data) in preloaded.iter() {
            let mut decoder = match self.shared.open_reader(file_id) {
                Ok(decoder) => decoder,
                Err(e) => {
                    warn!(file = %file_id, error = %e, "Could not reopen sample for RAM loading");
                    continue;
                }
            };

            let frames = decoder.frames();
            if frames > data.preloaded_frames() {
                data.replace_preloaded(stream::read_from_file(decoder.as_mut(), frames));
            }
            data.set_status(Status::FullLoaded);
        }
        info!(samples = preloaded.len(), "Loaded all preloaded samples into RAM");
    }

    /// Phase one of the two-phase release: flags every entry as unwanted
    /// by this pool. A subsequent preload pass flips still-wanted entries
    /// back before `remove_unused_preloaded_data` sweeps the rest, which
    /// is how an instrument reload keeps its shared buffers.
    pub fn reset_preload_call_counts(&self) {
        for data in self.preloaded.read().values() {
            data.prepare_for_removing_owner(self.id);
        }
        for data in self.loaded.read().values() {
            data.prepare_for_removing_owner(self.id);
        }
    }

    /// Phase two: drops every entry still flagged unwanted and commits the
    /// owner removal to the global accounting.
    pub fn remove_unused_preloaded_data(&self) {
        self.preloaded
            .write()
            .retain(|id, data| !data.check_and_remove_owner(self.id, id));
        self.loaded
            .write()
            .retain(|id, data| !data.check_and_remove_owner(self.id, id));
    }

    /// Releases everything this pool holds and drains its stream queue.
    pub fn clear(&self) {
        self.reset_preload_call_counts();
        self.remove_unused_preloaded_data();
        debug_assert!(self.preloaded.read().is_empty());
        debug_assert!(self.loaded.read().is_empty());
        while self.shared.files_to_load.pop().is_some() {}
    }

    /// Marks a render pass as running, pausing the collector.
    pub fn start_render(&self) {
        self.global.start_render();
    }

    /// Marks a render pass as finished and kicks the collector.
    pub fn stop_render(&self) {
        self.global.stop_render();
    }

    /// Unbounded streaming budget for offline rendering.
    pub fn set_free_wheeling(&self, free_wheeling: bool) {
        self.shared
            .free_wheeling
            .store(free_wheeling, Ordering::Release);
    }

    /// Blocks until every stream job dispatched so far has run.
    pub fn wait_for_background_loading(&self) {
        let mut jobs = self.shared.loading_jobs.lock();
        for job in jobs.iter() {
            job.wait();
        }
        jobs.clear();
    }

    /// Number of prefix-cached samples this pool holds.
    pub fn actual_num_preloaded_samples(&self) -> usize {
        self.preloaded.read().len()
    }

    /// Number of fully loaded samples this pool holds.
    pub fn num_loaded_samples(&self) -> usize {
        self.loaded.read().len()
    }

    /// Number of live prefix-cached samples across all pools.
    pub fn global_num_preloaded_samples(&self) -> usize {
        self.global.num_preloaded_samples()
    }

    /// Number of live fully loaded samples across all pools.
    pub fn global_num_loaded_samples(&self) -> usize {
        self.global.num_loaded_samples()
    }

    pub fn set_root_directory(&self, root_directory: impl Into<PathBuf>) {
        *self.shared.root_directory.write() = root_directory.into();
    }

    pub fn root_directory(&self) -> PathBuf {
        self.shared.root_directory.read().clone()
    }

    #[cfg(test)]
    pub(crate) fn preloaded_entry(&self, file_id: &FileId) -> Option<Arc<FileData>> {
        self.preloaded.read().get(file_id).cloned()
    }

    #[cfg(test)]
    pub(crate) fn global(&self) -> &Arc<GlobalPool> {
        &self.global
    }
}

impl Drop for FilePool {
    fn drop(&mut self) {
        self.clear();

        self.shared.dispatch_running.store(false, Ordering::Release);
        self.shared.dispatch_barrier.post();
        if let Some(dispatcher) = self.dispatch_thread.lock().take() {
            let _ = dispatcher.join();
        }

        self.wait_for_background_loading();
    }
}

impl fmt::Debug for FilePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilePool")
            .field("preloaded", &self.preloaded.read().len())
            .field("loaded", &self.loaded.read().len())
            .field("preload_size", &self.preload_size())
            .field("load_in_ram", &self.load_in_ram.load(Ordering::Relaxed))
            .finish()
    }
}

/// Dispatcher loop: one thread per pool that turns queued stream requests
/// into loader jobs and garbage-collects finished job handles.
fn dispatching_job(shared: Arc<PoolShared>) {
    loop {
        shared.dispatch_barrier.wait();
        if !shared.dispatch_running.load(Ordering::Acquire) {
            break;
        }

        let mut jobs = shared.loading_jobs.lock();
        if let Some(queued) = shared.files_to_load.pop() {
            // A dead weak means the owning region was deleted; a status
            // other than PendingStreaming means someone else handled it.
            if queued.id.strong_count() > 0 && queued.data.status() == Status::PendingStreaming {
                let job_shared = shared.clone();
                jobs.push(
                    shared
                        .global
                        .loader()
                        .spawn(move || stream::loading_job(&job_shared, queued)),
                );
            }
        }

        jobs.retain(|job| !job.is_finished());
    }
}

/// Builds the cached metadata from an open decoder. Rejects channel
/// layouts the voice renderer cannot play.
fn reader_information(decoder: &dyn SampleReader) -> Option<FileInformation> {
    let channels = decoder.channels();
    if channels != 1 && channels != 2 {
        warn!(channels, "Rejecting sample with unsupported channel count");
        return None;
    }

    let end = decoder.frames().saturating_sub(1);
    let mut information = FileInformation {
        end,
        sample_rate: f64::from(decoder.sample_rate()),
        num_channels: channels,
        root_key: None,
        loop_range: None,
        wavetable: None,
    };

    if let Some(instrument) = decoder.instrument_info() {
        information.root_key = Some(instrument.root_key.min(127));
        if let Some((start, loop_end)) = instrument.loop_range {
            information.loop_range = Some(LoopRange {
                start,
                end: loop_end.saturating_sub(1).min(end),
            });
        }
    }
    information.wavetable = decoder.wavetable_info();

    Some(information)
}
