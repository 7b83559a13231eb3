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

//! Background streaming of sample bodies, in bounded chunks so one heavy
//! sample cannot monopolize a worker.

use std::cell::Cell;

use thread_priority::{ThreadPriority, ThreadPriorityValue};
use tracing::{debug, warn};

use super::data::{FileData, FileDataHolder, Status};
use super::{PoolShared, QueuedFileData};
use crate::buffer::SampleBuffer;
use crate::config;
use crate::reader::SampleReader;

/// Decodes the first `frames` frames of `reader` into a fresh
/// channel-major buffer. Decode errors are logged and leave the remainder
/// of the buffer silent.
pub(crate) fn read_from_file(reader: &mut dyn SampleReader, frames: u64) -> SampleBuffer {
    let mut output = SampleBuffer::new();
    read_base_file(reader, &mut output, frames);
    output
}

fn read_base_file(reader: &mut dyn SampleReader, output: &mut SampleBuffer, frames: u64) {
    let channels = reader.channels() as usize;
    let frames = frames as usize;
    output.reset();
    output.resize_frames(frames);
    output.add_channels(channels);

    let chunk_frames = config::FILE_CHUNK_SIZE as usize;
    let mut block = vec![0.0f32; chunk_frames * channels];
    let mut frame = 0usize;
    while frame < frames {
        let this_chunk = chunk_frames.min(frames - frame);
        let frames_read = match reader.read_next_block(&mut block[..this_chunk * channels], this_chunk)
        {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "Error while reading sample data");
                break;
            }
        };

        deinterleave(&block, output, frame, frames_read, channels);
        frame += frames_read;
    }
}

fn deinterleave(
    block: &[f32],
    output: &mut SampleBuffer,
    at_frame: usize,
    frames: usize,
    channels: usize,
) {
    for channel in 0..channels {
        let out = &mut output.channel_mut(channel)[at_frame..at_frame + frames];
        for (i, sample) in out.iter_mut().enumerate() {
            *sample = block[i * channels + channel];
        }
    }
}

/// Streams the body of `data` from `reader`, resuming at the published
/// frame count. Returns false when the chunk budget ran out with input
/// remaining; the caller then re-queues the job.
///
/// The caller must hold the `Streaming` status token.
pub(crate) fn stream_from_file(
    reader: &mut dyn SampleReader,
    data: &FileData,
    free_wheeling: bool,
) -> bool {
    let total_frames = reader.frames() as usize;
    let channels = reader.channels() as usize;
    let chunk_frames = config::FILE_CHUNK_SIZE as usize;

    if data.available_frames() == 0 {
        // SAFETY: we hold the Streaming token and no frames are published,
        // so no reader can be touching the body while it is reshaped.
        let body = unsafe { data.streamed_buffer_mut() };
        body.reset();
        body.resize_frames(total_frames);
        body.add_channels(channels);
    }

    let mut input_frame = data.available_frames() as usize;
    let seekable = reader.seekable();
    if seekable {
        if let Err(e) = reader.seek(input_frame as u64) {
            warn!(error = %e, "Could not seek in sample; abandoning the stream");
            return true;
        }
    }

    // Non-seekable input cannot resume, so it has to be finished in one go.
    let mut budget = if free_wheeling || !seekable {
        u32::MAX
    } else {
        config::CHUNKS_PER_DISPATCH
    };

    let mut block = vec![0.0f32; chunk_frames * channels];
    let mut input_eof = false;
    while !input_eof && input_frame < total_frames {
        if budget == 0 {
            return false;
        }
        budget -= 1;

        let this_chunk = chunk_frames.min(total_frames - input_frame);
        let frames_read = match reader.read_next_block(&mut block[..this_chunk * channels], this_chunk)
        {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "Error while streaming sample data");
                break;
            }
        };
        if frames_read < this_chunk {
            input_eof = true;
        }

        // SAFETY: single streaming writer; only frames at or past
        // `input_frame` are touched, which no reader can see yet.
        let body = unsafe { data.streamed_buffer_mut() };
        deinterleave(&block, body, input_frame, frames_read, channels);
        input_frame += frames_read;
        data.publish_streamed_frames(frames_read as u64);
    }

    true
}

/// One dispatch of background streaming for a queued entry. Runs on a
/// loader worker.
pub(crate) fn loading_job(shared: &PoolShared, queued: QueuedFileData) {
    raise_worker_priority();

    // A dead weak means the owning region was deleted; nothing to do.
    let id = match queued.id.upgrade() {
        Some(id) => id,
        None => return,
    };

    let mut reader = match shared.open_reader(&id) {
        Ok(reader) => reader,
        Err(e) => {
            warn!(file = %id, error = %e, "Could not open sample for streaming");
            return;
        }
    };

    // Keeps the body alive for the duration of the job.
    let _holder = FileDataHolder::new(queued.data.clone());

    if !queued.data.wait_ready(config::INIT_WAIT) {
        warn!(file = %id, "Sample stuck uninitialized; abandoning the stream job");
        return;
    }

    // Already streaming, done, or released in the meantime.
    if queued.data.status() != Status::PendingStreaming {
        return;
    }
    // Someone else got the token.
    if !queued
        .data
        .try_transition(Status::PendingStreaming, Status::Streaming)
    {
        return;
    }

    let completed = stream_from_file(reader.as_mut(), &queued.data, shared.free_wheeling());

    if completed {
        queued.data.try_transition(Status::Streaming, Status::Done);
        debug!(
            file = %id,
            frames = queued.data.available_frames(),
            "Sample streaming complete"
        );
    } else if queued
        .data
        .try_transition(Status::Streaming, Status::PendingStreaming)
    {
        // Budget exhausted: hand the remainder back to the dispatcher.
        if shared.files_to_load.push(queued).is_ok() {
            shared.dispatch_barrier.post();
        }
    }
}

/// Raises the worker to a fraction of the SCHED_RR range, once per thread,
/// so streaming keeps up with playback without competing with the render
/// threads themselves.
fn raise_worker_priority() {
    thread_local! {
        static PRIORITY_SET: Cell<bool> = Cell::new(false);
    }

    PRIORITY_SET.with(|set| {
        if set.get() {
            return;
        }
        set.set(true);

        let percent = config::loader_priority_percent().min(99);
        let value = match ThreadPriorityValue::try_from(percent) {
            Ok(value) => value,
            Err(_) => return,
        };
        let priority = ThreadPriority::Crossplatform(value);

        #[cfg(unix)]
        {
            use thread_priority::unix::{
                set_thread_priority_and_policy, thread_native_id, RealtimeThreadSchedulePolicy,
                ThreadSchedulePolicy,
            };
            if let Err(e) = set_thread_priority_and_policy(
                thread_native_id(),
                priority,
                ThreadSchedulePolicy::Realtime(RealtimeThreadSchedulePolicy::RoundRobin),
            ) {
                debug!(error = %e, "Could not raise streaming worker priority");
            }
        }

        #[cfg(not(unix))]
        {
            if let Err(e) = thread_priority::set_current_thread_priority(priority) {
                debug!(error = ?e, "Could not raise streaming worker priority");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::super::FileInformation;
    use super::*;
    use crate::reader::open_file;
    use crate::testutil::{ramp, write_wav};

    use tempfile::tempdir;

    fn information(frames: u64) -> FileInformation {
        FileInformation {
            end: frames - 1,
            sample_rate: 44100.0,
            num_channels: 1,
            root_key: None,
            loop_range: None,
            wavetable: None,
        }
    }

    #[test]
    fn test_read_from_file_prefix() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ramp.wav");
        let samples = ramp(2048);
        write_wav(&path, vec![samples.clone()], 44100).unwrap();

        let mut reader = open_file(&path, false).unwrap();
        let prefix = read_from_file(reader.as_mut(), 100);
        assert_eq!(prefix.num_channels(), 1);
        assert_eq!(prefix.num_frames(), 100);
        assert_eq!(prefix.channel(0), &samples[..100]);
    }

    #[test]
    fn test_read_from_file_stereo() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stereo.wav");
        let left = ramp(64);
        let right: Vec<f32> = ramp(64).iter().map(|s| -s).collect();
        write_wav(&path, vec![left.clone(), right.clone()], 44100).unwrap();

        let mut reader = open_file(&path, false).unwrap();
        let buffer = read_from_file(reader.as_mut(), 64);
        assert_eq!(buffer.num_channels(), 2);
        assert_eq!(buffer.channel(0), &left[..]);
        assert_eq!(buffer.channel(1), &right[..]);
    }

    #[test]
    fn test_stream_yields_on_budget_and_resumes() {
        let total = config::FILE_CHUNK_SIZE * u64::from(config::CHUNKS_PER_DISPATCH) * 2;
        let dir = tempdir().unwrap();
        let path = dir.path().join("long.wav");
        let samples = ramp(total as usize);
        write_wav(&path, vec![samples.clone()], 44100).unwrap();

        let data = Arc::new(FileData::new(information(total), 0));
        data.init_with(Status::Preloaded, SampleBuffer::new());
        assert!(data.try_transition(Status::Preloaded, Status::PendingStreaming));
        assert!(data.try_transition(Status::PendingStreaming, Status::Streaming));

        let mut reader = open_file(&path, false).unwrap();
        assert!(!stream_from_file(reader.as_mut(), &data, false));
        assert_eq!(
            data.available_frames(),
            config::FILE_CHUNK_SIZE * u64::from(config::CHUNKS_PER_DISPATCH)
        );

        // The next dispatch opens its own reader and picks up where the
        // first one stopped.
        let mut reader = open_file(&path, false).unwrap();
        assert!(stream_from_file(reader.as_mut(), &data, false));
        assert_eq!(data.available_frames(), total);

        let holder = FileDataHolder::new(data.clone());
        assert_eq!(holder.streamed_frames(0), &samples[..]);
    }

    #[test]
    fn test_free_wheeling_streams_everything_at_once() {
        let total = config::FILE_CHUNK_SIZE * u64::from(config::CHUNKS_PER_DISPATCH) * 3;
        let dir = tempdir().unwrap();
        let path = dir.path().join("long.wav");
        write_wav(&path, vec![ramp(total as usize)], 44100).unwrap();

        let data = Arc::new(FileData::new(information(total), 0));
        data.init_with(Status::Preloaded, SampleBuffer::new());
        assert!(data.try_transition(Status::Preloaded, Status::PendingStreaming));
        assert!(data.try_transition(Status::PendingStreaming, Status::Streaming));

        let mut reader = open_file(&path, false).unwrap();
        assert!(stream_from_file(reader.as_mut(), &data, true));
        assert_eq!(data.available_frames(), total);
    }
}
