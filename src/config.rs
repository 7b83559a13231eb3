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

//! Tuning constants for the sample file pool.

use std::time::Duration;

/// Number of frames the streaming worker reads per chunk.
pub const FILE_CHUNK_SIZE: u64 = 1024;

/// Number of chunks a streaming job may read per dispatch before yielding
/// the worker back to the pool. Ignored when free-wheeling.
pub const CHUNKS_PER_DISPATCH: u32 = 4;

/// How long a sample body must sit idle before the collector evicts it.
/// Also the collector's tick period.
pub const FILE_CLEARING_PERIOD: Duration = Duration::from_secs(10);

/// Upper bound on simultaneously sounding voices per synthesizer. Only
/// used here to size the stream-job queue.
pub const MAX_VOICES: usize = 64;

/// Capacity of the bounded queue between the render thread and the
/// dispatcher. A full queue makes `get_promise` fall back to the preload.
pub const STREAM_QUEUE_CAPACITY: usize = MAX_VOICES * 16;

/// Default number of frames preloaded past a region's max start offset.
pub const DEFAULT_PRELOAD_SIZE: u64 = 8192;

/// How long `add_secondary_owner` waits for an entry that another pool is
/// still initializing.
pub const READY_WAIT: Duration = Duration::from_secs(10);

/// How long a streaming job waits for an entry to leave `Invalid` before
/// abandoning it.
pub const INIT_WAIT: Duration = Duration::from_millis(200);

/// Default priority of the streaming workers, as a percentage of the
/// SCHED_RR priority range.
const DEFAULT_LOADER_PRIORITY_PERCENT: u8 = 50;

/// Reads SAMPLEPOOL_LOADER_PRIORITY (0-100); called once per worker thread
/// so env access stays off the render path.
pub fn loader_priority_percent() -> u8 {
    std::env::var("SAMPLEPOOL_LOADER_PRIORITY")
        .ok()
        .and_then(|v| {
            let n = v.parse::<u8>().ok()?;
            (n <= 100).then_some(n)
        })
        .unwrap_or(DEFAULT_LOADER_PRIORITY_PERCENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_capacity_scales_with_voices() {
        assert_eq!(STREAM_QUEUE_CAPACITY, MAX_VOICES * 16);
    }

    #[test]
    fn test_loader_priority_defaults_without_env() {
        std::env::remove_var("SAMPLEPOOL_LOADER_PRIORITY");
        assert_eq!(loader_priority_percent(), DEFAULT_LOADER_PRIORITY_PERCENT);
    }
}
