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

use std::fs::File;
use std::io::{BufReader, Cursor, Read, Seek, SeekFrom};
use std::path::Path;

use hound::WavReader;
use tracing::debug;

use super::{InstrumentInfo, ReaderError, SampleReader, WavetableInfo};

// Sanity cap on metadata chunk payloads; smpl/clm chunks are tiny.
const MAX_METADATA_CHUNK: usize = 4096;

/// Streaming WAV reader serving interleaved float blocks.
pub(super) struct WavBlockReader<R: Read + Seek> {
    reader: WavReader<R>,
    frames: u64,
    channels: u16,
    sample_rate: u32,
    float_format: bool,
    // Scales integer samples into [-1.0, 1.0].
    int_scale: f32,
    instrument: Option<InstrumentInfo>,
    wavetable: Option<WavetableInfo>,
}

impl<R: Read + Seek + Send> WavBlockReader<R> {
    fn new(
        reader: WavReader<R>,
        instrument: Option<InstrumentInfo>,
        wavetable: Option<WavetableInfo>,
    ) -> Result<Self, ReaderError> {
        let spec = reader.spec();
        if spec.channels != 1 && spec.channels != 2 {
            return Err(ReaderError::UnsupportedChannelCount(spec.channels));
        }

        Ok(Self {
            frames: u64::from(reader.duration()),
            channels: spec.channels,
            sample_rate: spec.sample_rate,
            float_format: spec.sample_format == hound::SampleFormat::Float,
            int_scale: 1.0 / (1i64 << (spec.bits_per_sample - 1)) as f32,
            reader,
            instrument,
            wavetable,
        })
    }
}

impl<R: Read + Seek + Send> SampleReader for WavBlockReader<R> {
    fn frames(&self) -> u64 {
        self.frames
    }

    fn channels(&self) -> u16 {
        self.channels
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn seekable(&self) -> bool {
        true
    }

    fn seek(&mut self, frame: u64) -> Result<(), ReaderError> {
        self.reader.seek(frame as u32)?;
        Ok(())
    }

    fn read_next_block(&mut self, out: &mut [f32], frames: usize) -> Result<usize, ReaderError> {
        let channels = self.channels as usize;
        let want = (frames * channels).min(out.len());

        let mut read = 0;
        if self.float_format {
            for sample in self.reader.samples::<f32>().take(want) {
                out[read] = sample?;
                read += 1;
            }
        } else {
            for sample in self.reader.samples::<i32>().take(want) {
                out[read] = sample? as f32 * self.int_scale;
                read += 1;
            }
        }

        // A truncated trailing frame is dropped rather than served half-filled.
        Ok(read / channels)
    }

    fn instrument_info(&self) -> Option<InstrumentInfo> {
        self.instrument
    }

    fn wavetable_info(&self) -> Option<WavetableInfo> {
        self.wavetable
    }
}

/// Fully decoded WAV source served back to front. Loop metadata is not
/// carried over; loop points do not survive reversal.
pub(super) struct ReversedWavReader {
    // Interleaved samples in original file order.
    samples: Vec<f32>,
    frames: u64,
    channels: u16,
    sample_rate: u32,
    // Position within the reversed stream, in frames.
    position: u64,
}

impl ReversedWavReader {
    fn from_forward(mut forward: impl SampleReader) -> Result<Self, ReaderError> {
        let frames = forward.frames();
        let channels = forward.channels();
        let sample_rate = forward.sample_rate();

        let mut samples = vec![0.0f32; frames as usize * channels as usize];
        let mut filled = 0usize;
        loop {
            let remaining = frames as usize - filled;
            if remaining == 0 {
                break;
            }
            let read =
                forward.read_next_block(&mut samples[filled * channels as usize..], remaining)?;
            if read == 0 {
                break;
            }
            filled += read;
        }

        Ok(Self {
            samples,
            frames: filled as u64,
            channels,
            sample_rate,
            position: 0,
        })
    }
}

impl SampleReader for ReversedWavReader {
    fn frames(&self) -> u64 {
        self.frames
    }

    fn channels(&self) -> u16 {
        self.channels
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn seekable(&self) -> bool {
        true
    }

    fn seek(&mut self, frame: u64) -> Result<(), ReaderError> {
        self.position = frame.min(self.frames);
        Ok(())
    }

    fn read_next_block(&mut self, out: &mut [f32], frames: usize) -> Result<usize, ReaderError> {
        let channels = self.channels as usize;
        let available = (self.frames - self.position) as usize;
        let count = frames.min(available).min(out.len() / channels);

        for i in 0..count {
            let source_frame = (self.frames - 1 - (self.position + i as u64)) as usize;
            let source = &self.samples[source_frame * channels..(source_frame + 1) * channels];
            out[i * channels..(i + 1) * channels].copy_from_slice(source);
        }

        self.position += count as u64;
        Ok(count)
    }
}

pub(super) fn open_file(path: &Path) -> Result<impl SampleReader, ReaderError> {
    let metadata = match File::open(path) {
        Ok(file) => scan_riff_metadata(&mut BufReader::new(file)).unwrap_or_default(),
        Err(e) => return Err(e.into()),
    };
    WavBlockReader::new(WavReader::open(path)?, metadata.0, metadata.1)
}

pub(super) fn open_file_reversed(path: &Path) -> Result<impl SampleReader, ReaderError> {
    ReversedWavReader::from_forward(open_file(path)?)
}

pub(super) fn open_memory(data: Vec<u8>) -> Result<impl SampleReader, ReaderError> {
    let metadata = scan_riff_metadata(&mut Cursor::new(&data)).unwrap_or_default();
    WavBlockReader::new(WavReader::new(Cursor::new(data))?, metadata.0, metadata.1)
}

pub(super) fn open_memory_reversed(data: Vec<u8>) -> Result<impl SampleReader, ReaderError> {
    ReversedWavReader::from_forward(open_memory(data)?)
}

/// Walks the RIFF chunk list looking for sampler (`smpl`) and wavetable
/// (`clm `) metadata. Unknown or malformed chunks are skipped.
fn scan_riff_metadata<R: Read + Seek>(
    reader: &mut R,
) -> std::io::Result<(Option<InstrumentInfo>, Option<WavetableInfo>)> {
    let mut header = [0u8; 12];
    reader.read_exact(&mut header)?;
    if &header[0..4] != b"RIFF" || &header[8..12] != b"WAVE" {
        return Ok((None, None));
    }

    let mut instrument = None;
    let mut wavetable = None;

    let mut chunk_header = [0u8; 8];
    while reader.read_exact(&mut chunk_header).is_ok() {
        let size = u32::from_le_bytes([
            chunk_header[4],
            chunk_header[5],
            chunk_header[6],
            chunk_header[7],
        ]) as usize;
        // Chunks are word-aligned; odd sizes carry a pad byte.
        let padded = size + (size & 1);

        match &chunk_header[0..4] {
            b"smpl" if size <= MAX_METADATA_CHUNK => {
                instrument = parse_smpl_chunk(&read_chunk(reader, size, padded)?);
            }
            b"clm " if size <= MAX_METADATA_CHUNK => {
                wavetable = parse_clm_chunk(&read_chunk(reader, size, padded)?);
            }
            _ => {
                reader.seek(SeekFrom::Current(padded as i64))?;
            }
        }
    }

    if instrument.is_some() || wavetable.is_some() {
        debug!(
            has_instrument = instrument.is_some(),
            has_wavetable = wavetable.is_some(),
            "Found RIFF sampler metadata"
        );
    }
    Ok((instrument, wavetable))
}

fn read_chunk<R: Read + Seek>(
    reader: &mut R,
    size: usize,
    padded: usize,
) -> std::io::Result<Vec<u8>> {
    let mut data = vec![0u8; size];
    reader.read_exact(&mut data)?;
    if padded > size {
        reader.seek(SeekFrom::Current((padded - size) as i64))?;
    }
    Ok(data)
}

fn chunk_u32(data: &[u8], offset: usize) -> Option<u32> {
    data.get(offset..offset + 4)
        .map(|bytes| u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// smpl layout: MIDI unity note at byte 12, loop count at byte 28, loop
/// records of 24 bytes from byte 36 with start/end at record bytes 8/12.
fn parse_smpl_chunk(data: &[u8]) -> Option<InstrumentInfo> {
    let unity_note = chunk_u32(data, 12)?;
    let loop_count = chunk_u32(data, 28)?;

    let mut loop_range = None;
    if loop_count > 0 {
        let start = chunk_u32(data, 36 + 8)?;
        let end = chunk_u32(data, 36 + 12)?;
        loop_range = Some((u64::from(start), u64::from(end)));
    }

    Some(InstrumentInfo {
        root_key: unity_note.min(127) as u8,
        loop_range,
    })
}

/// clm chunks hold ASCII of the form `<!>2048 …` where the leading number
/// is the wavetable cycle length.
fn parse_clm_chunk(data: &[u8]) -> Option<WavetableInfo> {
    let text = std::str::from_utf8(data).ok()?;
    let rest = text.strip_prefix("<!>")?;
    let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
    digits
        .parse()
        .ok()
        .map(|table_size| WavetableInfo { table_size })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::write_wav;

    use tempfile::tempdir;

    #[test]
    fn test_reads_blocks_in_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ramp.wav");
        let samples: Vec<f32> = (0..256).map(|i| i as f32 / 256.0).collect();
        write_wav(&path, vec![samples.clone()], 44100).unwrap();

        let mut reader = open_file(&path).unwrap();
        assert_eq!(reader.frames(), 256);
        assert_eq!(reader.channels(), 1);
        assert_eq!(reader.sample_rate(), 44100);

        let mut out = vec![0.0f32; 100];
        assert_eq!(reader.read_next_block(&mut out, 100).unwrap(), 100);
        assert_eq!(out[0], samples[0]);
        assert_eq!(out[99], samples[99]);

        assert_eq!(reader.read_next_block(&mut out, 100).unwrap(), 100);
        assert_eq!(out[0], samples[100]);

        // Final partial block.
        assert_eq!(reader.read_next_block(&mut out, 100).unwrap(), 56);
        assert_eq!(reader.read_next_block(&mut out, 100).unwrap(), 0);
    }

    #[test]
    fn test_seek_repositions() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ramp.wav");
        let samples: Vec<f32> = (0..64).map(|i| i as f32).collect();
        write_wav(&path, vec![samples], 48000).unwrap();

        let mut reader = open_file(&path).unwrap();
        reader.seek(32).unwrap();
        let mut out = vec![0.0f32; 4];
        assert_eq!(reader.read_next_block(&mut out, 4).unwrap(), 4);
        assert_eq!(out, vec![32.0, 33.0, 34.0, 35.0]);
    }

    #[test]
    fn test_stereo_interleaving() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stereo.wav");
        let left = vec![0.1f32, 0.2, 0.3];
        let right = vec![-0.1f32, -0.2, -0.3];
        write_wav(&path, vec![left, right], 44100).unwrap();

        let mut reader = open_file(&path).unwrap();
        assert_eq!(reader.channels(), 2);

        let mut out = vec![0.0f32; 6];
        assert_eq!(reader.read_next_block(&mut out, 3).unwrap(), 3);
        assert_eq!(out, vec![0.1, -0.1, 0.2, -0.2, 0.3, -0.3]);
    }

    #[test]
    fn test_reversed_serves_back_to_front() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ramp.wav");
        let samples: Vec<f32> = (0..8).map(|i| i as f32).collect();
        write_wav(&path, vec![samples], 44100).unwrap();

        let mut reader = open_file_reversed(&path).unwrap();
        assert_eq!(reader.frames(), 8);

        let mut out = vec![0.0f32; 8];
        assert_eq!(reader.read_next_block(&mut out, 8).unwrap(), 8);
        assert_eq!(out, vec![7.0, 6.0, 5.0, 4.0, 3.0, 2.0, 1.0, 0.0]);

        reader.seek(6).unwrap();
        assert_eq!(reader.read_next_block(&mut out, 8).unwrap(), 2);
        assert_eq!(&out[..2], &[1.0, 0.0]);
    }

    #[test]
    fn test_memory_reader_matches_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ramp.wav");
        let samples: Vec<f32> = (0..16).map(|i| i as f32 / 16.0).collect();
        write_wav(&path, vec![samples.clone()], 44100).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        let mut reader = open_memory(bytes).unwrap();
        assert_eq!(reader.frames(), 16);

        let mut out = vec![0.0f32; 16];
        assert_eq!(reader.read_next_block(&mut out, 16).unwrap(), 16);
        assert_eq!(out, samples);
    }

    #[test]
    fn test_rejects_unsupported_channel_count() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("quad.wav");
        write_wav(&path, vec![vec![0.0f32; 4]; 4], 44100).unwrap();

        match open_file(&path) {
            Err(ReaderError::UnsupportedChannelCount(4)) => {}
            other => panic!("expected channel count rejection, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_parses_smpl_chunk() {
        let mut data = vec![0u8; 60];
        data[12..16].copy_from_slice(&60u32.to_le_bytes()); // unity note
        data[28..32].copy_from_slice(&1u32.to_le_bytes()); // loop count
        data[44..48].copy_from_slice(&100u32.to_le_bytes()); // loop start
        data[48..52].copy_from_slice(&200u32.to_le_bytes()); // loop end

        let info = parse_smpl_chunk(&data).unwrap();
        assert_eq!(info.root_key, 60);
        assert_eq!(info.loop_range, Some((100, 200)));
    }

    #[test]
    fn test_parses_clm_chunk() {
        let info = parse_clm_chunk(b"<!>2048 10 1000000 wavetable").unwrap();
        assert_eq!(info.table_size, 2048);
        assert!(parse_clm_chunk(b"no marker").is_none());
    }
}
