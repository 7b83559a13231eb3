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

//! Audio decoding seam consumed by the pool.
//!
//! The pool only ever talks to the `SampleReader` trait; the WAV
//! implementation below is the single codec this crate ships. Additional
//! formats plug in at this seam.

use std::path::Path;

mod wav;

/// Error types for sample reader operations.
#[derive(Debug, thiserror::Error)]
pub enum ReaderError {
    #[error("audio file error: {0}")]
    Wav(#[from] hound::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unsupported channel count: {0}")]
    UnsupportedChannelCount(u16),
}

/// Sampler metadata embedded in an audio file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstrumentInfo {
    /// MIDI key at which the sample plays back untransposed.
    pub root_key: u8,
    /// First forward loop as `(start, end)` frame positions, if any.
    pub loop_range: Option<(u64, u64)>,
}

/// Wavetable metadata embedded in an audio file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WavetableInfo {
    /// Number of frames in one wavetable cycle.
    pub table_size: u32,
}

/// A positioned decoder over one audio source. Blocks are interleaved
/// float frames.
pub trait SampleReader: Send {
    /// Total number of frames in the source.
    fn frames(&self) -> u64;

    /// Number of channels in the source.
    fn channels(&self) -> u16;

    /// Sample rate of the source.
    fn sample_rate(&self) -> u32;

    /// Whether `seek` is supported. Non-seekable sources must be consumed
    /// front to back.
    fn seekable(&self) -> bool;

    /// Repositions the reader at the given frame.
    fn seek(&mut self, frame: u64) -> Result<(), ReaderError>;

    /// Reads up to `frames` interleaved frames into `out`, returning the
    /// number of whole frames read. `out` must hold at least
    /// `frames * channels` samples.
    fn read_next_block(&mut self, out: &mut [f32], frames: usize) -> Result<usize, ReaderError>;

    /// Sampler metadata, if the source carries any.
    fn instrument_info(&self) -> Option<InstrumentInfo> {
        None
    }

    /// Wavetable metadata, if the source carries any.
    fn wavetable_info(&self) -> Option<WavetableInfo> {
        None
    }
}

/// Opens an audio file, optionally reversed. Reversed sources are fully
/// decoded up front and served back to front.
pub fn open_file(path: &Path, reverse: bool) -> Result<Box<dyn SampleReader>, ReaderError> {
    if reverse {
        Ok(Box::new(wav::open_file_reversed(path)?))
    } else {
        Ok(Box::new(wav::open_file(path)?))
    }
}

/// Opens an in-memory audio file, optionally reversed.
pub fn open_memory(data: Vec<u8>, reverse: bool) -> Result<Box<dyn SampleReader>, ReaderError> {
    if reverse {
        Ok(Box::new(wav::open_memory_reversed(data)?))
    } else {
        Ok(Box::new(wav::open_memory(data)?))
    }
}
