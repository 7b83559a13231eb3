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

//! Per-sample cache entry: status automaton, owner accounting, and the
//! reader-count guard that render threads hold during playback.

use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::debug;

use super::{FileId, FileInformation, PoolId};
use crate::buffer::SampleBuffer;
use crate::config;
use crate::sync::now_micros;

/// Lifecycle of a cached sample.
///
/// Forward transitions are driven by preload, promise, and the streaming
/// worker; only the collector moves an entry backward (`Done` to
/// `Preloaded` when it evicts the streamed body).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    /// Created but not yet initialized by its preloading thread.
    Invalid = 0,
    /// The prefix is resident; the body is not.
    Preloaded = 1,
    /// A stream job is queued for this entry.
    PendingStreaming = 2,
    /// A worker is currently filling the body.
    Streaming = 3,
    /// The body is fully streamed.
    Done = 4,
    /// The prefix alone covers the entire file; streaming never happens.
    FullLoaded = 5,
}

impl Status {
    fn from_u8(value: u8) -> Status {
        match value {
            1 => Status::Preloaded,
            2 => Status::PendingStreaming,
            3 => Status::Streaming,
            4 => Status::Done,
            5 => Status::FullLoaded,
            _ => Status::Invalid,
        }
    }
}

/// Which pools currently want this entry. The call count is two units per
/// registered pool (one for existing, one for the active flag) so that an
/// entry survives the window between a pool flagging release and sweeping.
#[derive(Default)]
struct OwnerMap {
    owners: HashMap<PoolId, bool>,
    preload_call_count: u32,
}

impl OwnerMap {
    fn register(&mut self, owner: PoolId) {
        match self.owners.get_mut(&owner) {
            Some(active) => {
                if !*active {
                    *active = true;
                    self.preload_call_count += 1;
                }
            }
            None => {
                self.owners.insert(owner, true);
                self.preload_call_count += 2;
            }
        }
    }
}

/// A cached sample shared by every pool that preloaded it, the global
/// registry, the collector, and any live holders.
pub struct FileData {
    information: FileInformation,
    /// Largest sample start offset any voice may request. Only grows.
    max_offset: AtomicU64,
    /// Synchronously decoded prefix. Writers only install replacements on
    /// the control plane; readers hold an `Arc` snapshot, so a voice can
    /// never observe a prefix shrinking under it.
    preloaded: RwLock<Arc<SampleBuffer>>,
    /// Lazily streamed body. See the `Sync` safety note for the protocol.
    streamed: UnsafeCell<SampleBuffer>,
    /// Frames of `streamed` that are initialized and published.
    available_frames: AtomicU64,
    status: AtomicU8,
    /// Live `FileDataHolder` count.
    reader_count: AtomicU32,
    /// Monotonic µs timestamp of the last reader-count drop to zero.
    last_viewer_left_at: AtomicU64,
    owners: Mutex<OwnerMap>,
    ready: Mutex<bool>,
    ready_cond: Condvar,
    /// Serializes eviction against holder construction. Held only for a
    /// counter increment or a buffer move.
    garbage_mutex: Mutex<()>,
}

// SAFETY: every field except `streamed` is an atomic, a lock, or immutable.
// `streamed` is governed by a publication protocol: the single worker that
// wins the `PendingStreaming -> Streaming` CAS is the only writer, it only
// reshapes the buffer while `available_frames` is zero, and it publishes
// initialized frames with a release fetch_add. Readers access frames below
// an acquire load of `available_frames` and only while their holder keeps
// `reader_count` nonzero. The collector takes the buffer only under
// `garbage_mutex` with `reader_count == 0`.
unsafe impl Sync for FileData {}

impl FileData {
    pub(crate) fn new(information: FileInformation, max_offset: u64) -> Self {
        Self {
            information,
            max_offset: AtomicU64::new(max_offset),
            preloaded: RwLock::new(Arc::new(SampleBuffer::new())),
            streamed: UnsafeCell::new(SampleBuffer::new()),
            available_frames: AtomicU64::new(0),
            status: AtomicU8::new(Status::Invalid as u8),
            reader_count: AtomicU32::new(0),
            last_viewer_left_at: AtomicU64::new(0),
            owners: Mutex::new(OwnerMap::default()),
            ready: Mutex::new(false),
            ready_cond: Condvar::new(),
            garbage_mutex: Mutex::new(()),
        }
    }

    /// One-shot initializer run by the thread that created the entry.
    /// Publishes the prefix, leaves `Invalid`, and releases every waiter
    /// blocked in `add_secondary_owner` or a stream job.
    pub(crate) fn init_with(&self, status: Status, prefix: SampleBuffer) {
        debug_assert_eq!(self.status(), Status::Invalid);
        *self.preloaded.write() = Arc::new(prefix);
        self.set_status(status);

        let mut ready = self.ready.lock();
        *ready = true;
        self.ready_cond.notify_all();
    }

    /// Waits until `init_with` has run. Returns false on timeout.
    pub(crate) fn wait_ready(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut ready = self.ready.lock();
        while !*ready {
            if self.ready_cond.wait_until(&mut ready, deadline).timed_out() {
                return *ready;
            }
        }
        true
    }

    pub fn information(&self) -> &FileInformation {
        &self.information
    }

    pub fn max_offset(&self) -> u64 {
        self.max_offset.load(Ordering::Acquire)
    }

    /// Raises the recorded max offset; concurrent preloads can only grow it.
    pub(crate) fn raise_max_offset(&self, max_offset: u64) {
        self.max_offset.fetch_max(max_offset, Ordering::AcqRel);
    }

    pub fn status(&self) -> Status {
        Status::from_u8(self.status.load(Ordering::Acquire))
    }

    pub(crate) fn set_status(&self, status: Status) {
        self.status.store(status as u8, Ordering::Release);
    }

    /// Single CAS step of the automaton. Returns whether this caller won
    /// the transition.
    pub(crate) fn try_transition(&self, from: Status, to: Status) -> bool {
        self.status
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Snapshot of the preloaded prefix. The snapshot stays valid for as
    /// long as the caller holds it, even across a prefix replacement.
    pub fn preloaded_data(&self) -> Arc<SampleBuffer> {
        self.preloaded.read().clone()
    }

    pub(crate) fn preloaded_frames(&self) -> u64 {
        self.preloaded.read().num_frames() as u64
    }

    /// Installs a re-decoded prefix. Control plane only.
    pub(crate) fn replace_preloaded(&self, prefix: SampleBuffer) {
        *self.preloaded.write() = Arc::new(prefix);
    }

    pub fn available_frames(&self) -> u64 {
        self.available_frames.load(Ordering::Acquire)
    }

    /// Publishes `frames` newly initialized body frames.
    pub(crate) fn publish_streamed_frames(&self, frames: u64) {
        self.available_frames.fetch_add(frames, Ordering::Release);
    }

    /// Exclusive access to the streamed body.
    ///
    /// # Safety
    ///
    /// Only the worker that won the `Streaming` CAS may call this, and it
    /// must not reshape the buffer unless `available_frames` is zero.
    pub(crate) unsafe fn streamed_buffer_mut(&self) -> &mut SampleBuffer {
        &mut *self.streamed.get()
    }

    /// Registers `owner` on a brand-new entry. Never blocks; callable only
    /// between creation and `init_with`.
    pub(crate) fn add_owner(&self, owner: PoolId) {
        self.owners.lock().register(owner);
    }

    /// Registers `owner` on an existing entry, waiting for initialization
    /// to finish first. Returns false if the wait timed out or the entry
    /// is already fully released (being collected); the caller then
    /// creates a fresh entry instead.
    pub(crate) fn add_secondary_owner(&self, owner: PoolId) -> bool {
        if !self.wait_ready(config::READY_WAIT) {
            return false;
        }

        let mut owners = self.owners.lock();
        if owners.preload_call_count == 0 {
            return false;
        }
        owners.register(owner);
        true
    }

    /// Phase one of the two-phase release: flags `owner` as no longer
    /// wanting the entry without dropping its registration.
    pub(crate) fn prepare_for_removing_owner(&self, owner: PoolId) {
        let mut owners = self.owners.lock();
        if let Some(active) = owners.owners.get_mut(&owner) {
            if *active {
                *active = false;
                owners.preload_call_count -= 1;
            }
        }
    }

    /// Phase two: drops `owner`'s registration if it is still flagged
    /// inactive. Returns whether the registration was removed.
    pub(crate) fn check_and_remove_owner(&self, owner: PoolId, id: &FileId) -> bool {
        let mut owners = self.owners.lock();
        if owners.owners.get(&owner) == Some(&false) {
            owners.owners.remove(&owner);
            owners.preload_call_count -= 1;
            debug!(file = %id, "Removed pool from sample owners");
            return true;
        }
        false
    }

    /// Whether no pool holds any claim on this entry.
    pub fn can_remove(&self) -> bool {
        self.owners.lock().preload_call_count == 0
    }

    #[cfg(test)]
    pub(crate) fn preload_call_count(&self) -> u32 {
        self.owners.lock().preload_call_count
    }

    /// Collector eviction step: drops the streamed body if the entry has
    /// been idle past the clearing period and nobody is reading it.
    /// Returns whether an eviction happened.
    pub(crate) fn try_evict(&self, now: u64) -> bool {
        if self.available_frames() == 0 || self.reader_count.load(Ordering::Acquire) != 0 {
            return false;
        }

        let status = self.status();
        if matches!(status, Status::Invalid | Status::Streaming) {
            return false;
        }

        let idle = now.saturating_sub(self.last_viewer_left_at.load(Ordering::Acquire));
        if idle < config::FILE_CLEARING_PERIOD.as_micros() as u64 {
            return false;
        }

        let garbage;
        {
            let _guard = match self.garbage_mutex.try_lock() {
                Some(guard) => guard,
                None => return false,
            };
            if self.reader_count.load(Ordering::Acquire) != 0 {
                return false;
            }

            self.available_frames.store(0, Ordering::Release);
            // A full preload still covers everything; only streamed
            // entries fall back to Preloaded.
            if status != Status::FullLoaded {
                self.set_status(Status::Preloaded);
            }
            // SAFETY: reader_count is zero under garbage_mutex, so no
            // reader can be touching the body, and no streamer can be
            // active (status is not Streaming).
            garbage = std::mem::take(unsafe { &mut *self.streamed.get() });
        }
        // The buffer itself is freed outside the lock.
        drop(garbage);
        true
    }

    fn begin_read(&self) {
        // Taken so a brand-new reader cannot race an in-flight eviction;
        // held for a single increment.
        let _guard = self.garbage_mutex.lock();
        self.reader_count.fetch_add(1, Ordering::AcqRel);
    }

    fn end_read(&self) {
        if self.reader_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.last_viewer_left_at
                .store(now_micros(), Ordering::Release);
        }
    }

    #[cfg(test)]
    pub(crate) fn reader_count(&self) -> u32 {
        self.reader_count.load(Ordering::Acquire)
    }

    /// Pretends the last reader left `by` ago, so collector tests need not
    /// wait out the clearing period.
    #[cfg(test)]
    pub(crate) fn backdate_last_viewer(&self, by: Duration) {
        let stamp = now_micros().saturating_sub(by.as_micros() as u64);
        self.last_viewer_left_at.store(stamp, Ordering::Release);
    }
}

impl std::fmt::Debug for FileData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileData")
            .field("status", &self.status())
            .field("available_frames", &self.available_frames())
            .field("preloaded_frames", &self.preloaded_frames())
            .field("readers", &self.reader_count.load(Ordering::Relaxed))
            .finish()
    }
}

/// Scoped read access to a cached sample. Each holder (and each clone) is
/// one reader-count unit; the streamed body cannot be evicted while any
/// holder is alive.
pub struct FileDataHolder {
    data: Arc<FileData>,
}

impl FileDataHolder {
    pub(crate) fn new(data: Arc<FileData>) -> Self {
        data.begin_read();
        Self { data }
    }

    pub fn information(&self) -> &FileInformation {
        self.data.information()
    }

    pub fn status(&self) -> Status {
        self.data.status()
    }

    pub fn available_frames(&self) -> u64 {
        self.data.available_frames()
    }

    /// Snapshot of the preloaded prefix.
    pub fn preloaded_data(&self) -> Arc<SampleBuffer> {
        self.data.preloaded_data()
    }

    /// The published portion of the streamed body for one channel. Empty
    /// until the streamer has made progress.
    pub fn streamed_frames(&self, channel: usize) -> &[f32] {
        let available = self.data.available_frames();
        if available == 0 {
            return &[];
        }

        // SAFETY: this holder keeps reader_count nonzero, so the collector
        // cannot take the buffer; frames below `available` were published
        // with release ordering and are never rewritten.
        let buffer = unsafe { &*self.data.streamed.get() };
        if channel >= buffer.num_channels() {
            return &[];
        }
        let samples = buffer.channel(channel);
        &samples[..(available as usize).min(samples.len())]
    }

    #[cfg(test)]
    pub(crate) fn data(&self) -> &Arc<FileData> {
        &self.data
    }
}

impl Clone for FileDataHolder {
    fn clone(&self) -> Self {
        Self::new(self.data.clone())
    }
}

impl Drop for FileDataHolder {
    fn drop(&mut self) {
        self.data.end_read();
    }
}

impl std::fmt::Debug for FileDataHolder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileDataHolder")
            .field("data", &*self.data)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_information(frames: u64) -> FileInformation {
        FileInformation {
            end: frames.saturating_sub(1),
            sample_rate: 44100.0,
            num_channels: 1,
            root_key: None,
            loop_range: None,
            wavetable: None,
        }
    }

    fn initialized_data(frames: u64) -> Arc<FileData> {
        let data = Arc::new(FileData::new(test_information(frames), 0));
        let mut prefix = SampleBuffer::new();
        prefix.resize_frames(frames as usize);
        prefix.add_channels(1);
        data.init_with(Status::Preloaded, prefix);
        data
    }

    #[test]
    fn test_owner_accounting() {
        let data = initialized_data(8);

        data.add_owner(1);
        assert_eq!(data.preload_call_count(), 2);

        // Registering the same pool twice is a no-op.
        assert!(data.add_secondary_owner(1));
        assert_eq!(data.preload_call_count(), 2);

        assert!(data.add_secondary_owner(2));
        assert_eq!(data.preload_call_count(), 4);

        data.prepare_for_removing_owner(1);
        assert_eq!(data.preload_call_count(), 3);

        // Re-registering an inactive owner restores a single unit.
        data.add_owner(1);
        assert_eq!(data.preload_call_count(), 4);

        data.prepare_for_removing_owner(1);
        assert!(data.check_and_remove_owner(1, &FileId::new("a.wav")));
        assert_eq!(data.preload_call_count(), 2);

        // An active owner is not removable.
        assert!(!data.check_and_remove_owner(2, &FileId::new("a.wav")));

        data.prepare_for_removing_owner(2);
        assert!(data.check_and_remove_owner(2, &FileId::new("a.wav")));
        assert_eq!(data.preload_call_count(), 0);
        assert!(data.can_remove());

        // A fully released entry rejects late secondary owners.
        assert!(!data.add_secondary_owner(3));
    }

    #[test]
    fn test_wait_ready() {
        let data = FileData::new(test_information(8), 0);
        assert!(!data.wait_ready(Duration::from_millis(5)));

        data.init_with(Status::FullLoaded, SampleBuffer::new());
        assert!(data.wait_ready(Duration::from_millis(5)));
        assert_eq!(data.status(), Status::FullLoaded);
    }

    #[test]
    fn test_status_transitions() {
        let data = initialized_data(8);
        assert!(data.try_transition(Status::Preloaded, Status::PendingStreaming));
        // Someone else already took it.
        assert!(!data.try_transition(Status::Preloaded, Status::PendingStreaming));
        assert!(data.try_transition(Status::PendingStreaming, Status::Streaming));
        assert!(data.try_transition(Status::Streaming, Status::Done));
    }

    #[test]
    fn test_holder_tracks_readers() {
        let data = initialized_data(8);
        assert_eq!(data.reader_count(), 0);

        let holder = FileDataHolder::new(data.clone());
        assert_eq!(data.reader_count(), 1);

        let clone = holder.clone();
        assert_eq!(data.reader_count(), 2);

        drop(holder);
        assert_eq!(data.reader_count(), 1);

        let before = data.last_viewer_left_at.load(Ordering::Acquire);
        drop(clone);
        assert_eq!(data.reader_count(), 0);
        assert!(data.last_viewer_left_at.load(Ordering::Acquire) >= before);
    }

    #[test]
    fn test_streamed_publication() {
        let data = initialized_data(8);
        let holder = FileDataHolder::new(data.clone());
        assert!(holder.streamed_frames(0).is_empty());

        // Simulate the streaming worker.
        assert!(data.try_transition(Status::Preloaded, Status::PendingStreaming));
        assert!(data.try_transition(Status::PendingStreaming, Status::Streaming));
        unsafe {
            let body = data.streamed_buffer_mut();
            body.add_channels(1);
            body.resize_frames(8);
            body.channel_mut(0)[..4].copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);
        }
        data.publish_streamed_frames(4);

        assert_eq!(holder.streamed_frames(0), &[1.0, 2.0, 3.0, 4.0]);
        assert!(holder.streamed_frames(1).is_empty());
    }

    #[test]
    fn test_evict_requires_idle_and_unread() {
        let data = initialized_data(8);
        data.add_owner(1);
        data.set_status(Status::Done);
        unsafe {
            let body = data.streamed_buffer_mut();
            body.add_channels(1);
            body.resize_frames(8);
        }
        data.publish_streamed_frames(8);

        // Recently viewed: kept.
        assert!(!data.try_evict(now_micros()));

        data.backdate_last_viewer(config::FILE_CLEARING_PERIOD * 2);

        // A live reader blocks eviction.
        let holder = FileDataHolder::new(data.clone());
        assert!(!data.try_evict(now_micros()));
        drop(holder);

        data.backdate_last_viewer(config::FILE_CLEARING_PERIOD * 2);
        assert!(data.try_evict(now_micros()));
        assert_eq!(data.available_frames(), 0);
        assert_eq!(data.status(), Status::Preloaded);

        // Nothing left to evict.
        assert!(!data.try_evict(now_micros()));
    }

    #[test]
    fn test_evict_keeps_full_loaded_status() {
        let data = Arc::new(FileData::new(test_information(8), 0));
        let mut prefix = SampleBuffer::new();
        prefix.resize_frames(8);
        prefix.add_channels(1);
        data.init_with(Status::FullLoaded, prefix);

        unsafe {
            let body = data.streamed_buffer_mut();
            body.add_channels(1);
            body.resize_frames(8);
        }
        data.publish_streamed_frames(8);
        data.backdate_last_viewer(config::FILE_CLEARING_PERIOD * 2);

        assert!(data.try_evict(now_micros()));
        assert_eq!(data.status(), Status::FullLoaded);
    }
}
