//! Per-voice cache of format converters.
//!
//! Every non-canonical input format a voice queues gets exactly one
//! [`Converter`], looked up by structural equality of its [`AudioFormat`].
//! Canonical data never touches the registry.

use crate::arena::{Arena, ConverterToken};
use crate::audio_data::{AudioBuffer, AudioFormat};
use crate::error::{PetalSonicError, Result};

/// Converts one input format to planar `f32` at the same sample rate.
#[derive(Debug)]
pub struct Converter {
    input: AudioFormat,
    output: AudioFormat,
    frames_converted: u64,
}

impl Converter {
    pub fn new(input: AudioFormat) -> Result<Self> {
        input
            .validate()
            .map_err(|e| PetalSonicError::Resource(format!("Cannot build converter: {}", e)))?;
        Ok(Self {
            input,
            output: input.canonical(),
            frames_converted: 0,
        })
    }

    pub fn input_format(&self) -> &AudioFormat {
        &self.input
    }

    pub fn output_format(&self) -> &AudioFormat {
        &self.output
    }

    /// Frames produced since creation or the last [`reset`](Self::reset).
    pub fn frames_converted(&self) -> u64 {
        self.frames_converted
    }

    /// Drops any stream position so the next pull starts clean.
    pub fn reset(&mut self) {
        self.frames_converted = 0;
    }

    /// Converts `frames` frames of `buffer` starting at `start_frame` into
    /// `out[..][out_offset..]`, one plane per output channel.
    ///
    /// Output channels beyond the source's repeat its last channel.
    pub fn convert<B: AsMut<[f32]>>(
        &mut self,
        buffer: &AudioBuffer,
        start_frame: usize,
        frames: usize,
        out: &mut [B],
        out_offset: usize,
    ) {
        debug_assert_eq!(buffer.format(), &self.input);
        let src_channels = buffer.channels() as usize;
        let data = buffer.data();
        for (channel, dest) in out.iter_mut().enumerate() {
            let src_channel = channel.min(src_channels - 1);
            let dest = &mut dest.as_mut()[out_offset..out_offset + frames];
            for (i, sample) in dest.iter_mut().enumerate() {
                *sample = data.sample_f32(buffer.sample_index(start_frame + i, src_channel));
            }
        }
        self.frames_converted += frames as u64;
    }
}

struct RegistryEntry {
    format: AudioFormat,
    token: ConverterToken,
}

/// Maps input formats to live converters for one voice.
#[derive(Default)]
pub struct ConverterRegistry {
    entries: Vec<RegistryEntry>,
    converters: Arena<ConverterToken, Converter>,
}

impl ConverterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_converter_for_format(&self, format: &AudioFormat) -> Option<ConverterToken> {
        self.entries
            .iter()
            .find(|entry| entry.format == *format)
            .map(|entry| entry.token)
    }

    pub fn create_and_register(&mut self, format: AudioFormat) -> Result<ConverterToken> {
        let converter = Converter::new(format)?;
        let token = self.converters.insert(converter);
        self.entries.push(RegistryEntry { format, token });
        log::debug!(
            "Created converter {} for {} Hz, {} ch, {:?}, interleaved={}",
            token,
            format.sample_rate,
            format.channels,
            format.encoding,
            format.interleaved
        );
        Ok(token)
    }

    /// Token for `format`, creating the converter on first use.
    /// Canonical formats need none and yield `Ok(None)`.
    pub fn token_for(&mut self, format: &AudioFormat) -> Result<Option<ConverterToken>> {
        if format.is_canonical() {
            return Ok(None);
        }
        match self.get_converter_for_format(format) {
            Some(token) => Ok(Some(token)),
            None => self.create_and_register(*format).map(Some),
        }
    }

    pub fn get_mut(&mut self, token: ConverterToken) -> Option<&mut Converter> {
        self.converters.get_mut(token)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn dispose_all(&mut self) {
        if !self.entries.is_empty() {
            log::debug!("Disposing {} converters", self.entries.len());
        }
        self.entries.clear();
        self.converters.clear();
    }
}

impl Drop for ConverterRegistry {
    fn drop(&mut self) {
        self.dispose_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio_data::{SampleData, SampleEncoding};

    #[test]
    fn test_identical_formats_share_a_converter() {
        let mut registry = ConverterRegistry::new();
        let a = registry.token_for(&AudioFormat::stereo_i16(44100)).unwrap();
        let b = registry.token_for(&AudioFormat::stereo_i16(44100)).unwrap();
        let c = registry.token_for(&AudioFormat::mono_i16(22050)).unwrap();

        assert!(a.is_some());
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_canonical_bypasses_registry() {
        let mut registry = ConverterRegistry::new();
        assert_eq!(registry.token_for(&AudioFormat::mono_f32(48000)).unwrap(), None);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_dispose_all_invalidates_tokens() {
        let mut registry = ConverterRegistry::new();
        let token = registry
            .create_and_register(AudioFormat::stereo_i16(44100))
            .unwrap();
        registry.dispose_all();
        assert!(registry.get_mut(token).is_none());
        assert_eq!(registry.get_converter_for_format(&AudioFormat::stereo_i16(44100)), None);
    }

    #[test]
    fn test_unsupported_format_is_resource_error() {
        let mut registry = ConverterRegistry::new();
        let format = AudioFormat::new(44100, 6, SampleEncoding::I16, true);
        assert!(matches!(
            registry.create_and_register(format),
            Err(PetalSonicError::Resource(_))
        ));
    }

    #[test]
    fn test_convert_interleaved_i16_to_planar() {
        let format = AudioFormat::stereo_i16(44100);
        let buffer = AudioBuffer::new(
            format,
            SampleData::I16(vec![16384, -16384, 8192, -8192, 0, 32767]),
        )
        .unwrap();
        let mut converter = Converter::new(format).unwrap();
        let mut out = vec![vec![0.0f32; 3]; 2];
        converter.convert(&buffer, 1, 2, &mut out, 1);

        assert_eq!(out[0], vec![0.0, 0.25, 0.0]);
        assert_eq!(out[1][0], 0.0);
        assert_eq!(out[1][1], -0.25);
        assert!((out[1][2] - 32767.0 / 32768.0).abs() < 1e-6);
        assert_eq!(converter.frames_converted(), 2);
        converter.reset();
        assert_eq!(converter.frames_converted(), 0);
    }

    #[test]
    fn test_convert_u8_mono_to_stereo_output() {
        let format = AudioFormat::new(8000, 1, SampleEncoding::U8, false);
        let buffer = AudioBuffer::new(format, SampleData::U8(vec![128, 192, 64])).unwrap();
        let mut converter = Converter::new(format).unwrap();
        let mut out = vec![vec![0.0f32; 3]; 2];
        converter.convert(&buffer, 0, 3, &mut out, 0);

        assert_eq!(out[0], vec![0.0, 0.5, -0.5]);
        assert_eq!(out[1], out[0]);
    }
}
