mod format;

use crate::arena::{Arena, BufferId};
use crate::error::{PetalSonicError, Result};
pub use format::{AudioFormat, SampleEncoding};
use std::sync::Arc;
use std::time::Duration;

/// Typed PCM storage matching an [`AudioFormat`]'s encoding.
#[derive(Debug, Clone)]
pub enum SampleData {
    U8(Vec<u8>),
    I16(Vec<i16>),
    F32(Vec<f32>),
}

impl SampleData {
    pub fn encoding(&self) -> SampleEncoding {
        match self {
            Self::U8(_) => SampleEncoding::U8,
            Self::I16(_) => SampleEncoding::I16,
            Self::F32(_) => SampleEncoding::F32,
        }
    }

    /// Number of individual samples across all channels.
    pub fn len(&self) -> usize {
        match self {
            Self::U8(v) => v.len(),
            Self::I16(v) => v.len(),
            Self::F32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sample `index` mapped to `[-1, 1]`.
    #[inline]
    pub(crate) fn sample_f32(&self, index: usize) -> f32 {
        match self {
            Self::U8(v) => (v[index] as f32 - 128.0) / 128.0,
            Self::I16(v) => v[index] as f32 / 32768.0,
            Self::F32(v) => v[index],
        }
    }
}

/// Immutable PCM data that voices queue.
///
/// Buffers are shared as `Arc<AudioBuffer>`; every queue entry holding one
/// counts as an attachment, and a registered buffer cannot be deleted while
/// attached.
#[derive(Debug)]
pub struct AudioBuffer {
    format: AudioFormat,
    data: SampleData,
    total_frames: usize,
}

impl AudioBuffer {
    /// Wraps `data` laid out as `format` describes.
    ///
    /// # Errors
    ///
    /// Returns [`PetalSonicError::AudioFormat`] if the format is unsupported, the
    /// storage encoding disagrees with it, or the sample count is not a whole
    /// number of frames.
    pub fn new(format: AudioFormat, data: SampleData) -> Result<Self> {
        format.validate()?;
        if data.encoding() != format.encoding {
            return Err(PetalSonicError::AudioFormat(format!(
                "Sample data is {:?} but format declares {:?}",
                data.encoding(),
                format.encoding
            )));
        }
        let channels = format.channels as usize;
        if data.len() % channels != 0 {
            return Err(PetalSonicError::AudioFormat(format!(
                "{} samples do not divide into {} channels",
                data.len(),
                channels
            )));
        }

        Ok(Self {
            format,
            total_frames: data.len() / channels,
            data,
        })
    }

    /// Decodes little-endian PCM bytes.
    pub fn from_bytes(format: AudioFormat, bytes: &[u8]) -> Result<Self> {
        let width = format.encoding.bytes_per_sample();
        if bytes.len() % width != 0 {
            return Err(PetalSonicError::AudioFormat(format!(
                "{} bytes is not a whole number of {}-bit samples",
                bytes.len(),
                format.encoding.bits_per_sample()
            )));
        }
        let data = match format.encoding {
            SampleEncoding::U8 => SampleData::U8(bytes.to_vec()),
            SampleEncoding::I16 => SampleData::I16(
                bytes
                    .chunks_exact(2)
                    .map(|b| i16::from_le_bytes([b[0], b[1]]))
                    .collect(),
            ),
            SampleEncoding::F32 => SampleData::F32(
                bytes
                    .chunks_exact(4)
                    .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                    .collect(),
            ),
        };
        Self::new(format, data)
    }

    /// A zero-length buffer. Queued copies are skipped during render.
    pub fn empty(format: AudioFormat) -> Result<Self> {
        let data = match format.encoding {
            SampleEncoding::U8 => SampleData::U8(Vec::new()),
            SampleEncoding::I16 => SampleData::I16(Vec::new()),
            SampleEncoding::F32 => SampleData::F32(Vec::new()),
        };
        Self::new(format, data)
    }

    pub fn format(&self) -> &AudioFormat {
        &self.format
    }

    pub fn data(&self) -> &SampleData {
        &self.data
    }

    pub fn sample_rate(&self) -> u32 {
        self.format.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.format.channels
    }

    pub fn total_frames(&self) -> usize {
        self.total_frames
    }

    pub fn size_in_bytes(&self) -> usize {
        self.total_frames * self.format.bytes_per_frame()
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.total_frames as f64 / self.format.sample_rate as f64)
    }

    pub fn is_empty(&self) -> bool {
        self.total_frames == 0
    }

    /// Index into the sample storage of `frame` on `channel`.
    #[inline]
    pub(crate) fn sample_index(&self, frame: usize, channel: usize) -> usize {
        if self.format.interleaved {
            frame * self.format.channels as usize + channel
        } else {
            channel * self.total_frames + frame
        }
    }

    /// Planar float samples of one channel, when stored that way.
    pub(crate) fn canonical_plane(&self, channel: usize) -> Option<&[f32]> {
        if !self.format.is_canonical() {
            return None;
        }
        let SampleData::F32(samples) = &self.data else {
            return None;
        };
        let start = channel * self.total_frames;
        samples.get(start..start + self.total_frames)
    }

    /// Touches one word per page so the first render does not fault the data in.
    pub(crate) fn warm(&self) {
        const STRIDE: usize = 1024;
        let len = self.data.len();
        let mut acc = 0.0f32;
        let mut index = 0;
        while index < len {
            acc += self.data.sample_f32(index);
            index += STRIDE;
        }
        std::hint::black_box(acc);
    }
}

/// Context-wide storage of the buffers applications create.
#[derive(Default)]
pub struct BufferRegistry {
    buffers: Arena<BufferId, Arc<AudioBuffer>>,
}

impl BufferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, buffer: AudioBuffer) -> BufferId {
        let id = self.buffers.insert(Arc::new(buffer));
        log::debug!("Registered buffer {}", id);
        id
    }

    pub fn get(&self, id: BufferId) -> Option<&Arc<AudioBuffer>> {
        self.buffers.get(id)
    }

    /// Number of voice queue entries currently holding the buffer.
    pub fn attachment_count(&self, id: BufferId) -> Option<usize> {
        self.buffers.get(id).map(|b| Arc::strong_count(b) - 1)
    }

    /// Deletes a buffer that no voice queues any more.
    ///
    /// # Errors
    ///
    /// - [`PetalSonicError::InvalidValue`] for an unknown id.
    /// - [`PetalSonicError::InvalidOperation`] while any queue still holds it.
    pub fn remove(&mut self, id: BufferId) -> Result<()> {
        let attachments = self
            .attachment_count(id)
            .ok_or_else(|| PetalSonicError::InvalidValue(format!("Unknown buffer {}", id)))?;
        if attachments > 0 {
            return Err(PetalSonicError::InvalidOperation(format!(
                "Buffer {} is still attached to {} queue entries",
                id, attachments
            )));
        }
        self.buffers.remove(id);
        log::debug!("Deleted buffer {}", id);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }
}
