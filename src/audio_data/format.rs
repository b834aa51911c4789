use crate::error::{PetalSonicError, Result};

/// Storage encoding of one PCM sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampleEncoding {
    /// Unsigned 8-bit, offset binary (128 is silence)
    U8,
    /// Signed 16-bit
    I16,
    /// 32-bit float in [-1, 1]
    F32,
}

impl SampleEncoding {
    pub fn bytes_per_sample(self) -> usize {
        match self {
            Self::U8 => 1,
            Self::I16 => 2,
            Self::F32 => 4,
        }
    }

    pub fn bits_per_sample(self) -> u32 {
        self.bytes_per_sample() as u32 * 8
    }
}

/// Describes the layout of the PCM data handed to a buffer.
///
/// Two formats compare equal only when every field matches; this is the
/// signature voices use to share converters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub encoding: SampleEncoding,
    /// Frames stored as `L R L R ...` instead of one plane per channel.
    pub interleaved: bool,
}

impl AudioFormat {
    pub fn new(sample_rate: u32, channels: u16, encoding: SampleEncoding, interleaved: bool) -> Self {
        Self {
            sample_rate,
            channels,
            encoding,
            interleaved,
        }
    }

    pub fn mono_f32(sample_rate: u32) -> Self {
        Self::new(sample_rate, 1, SampleEncoding::F32, false)
    }

    pub fn mono_i16(sample_rate: u32) -> Self {
        Self::new(sample_rate, 1, SampleEncoding::I16, false)
    }

    pub fn stereo_i16(sample_rate: u32) -> Self {
        Self::new(sample_rate, 2, SampleEncoding::I16, true)
    }

    pub fn bytes_per_frame(&self) -> usize {
        self.encoding.bytes_per_sample() * self.channels as usize
    }

    /// Float, one plane per channel, at the buffer's own rate.
    pub fn is_canonical(&self) -> bool {
        self.encoding == SampleEncoding::F32 && (self.channels == 1 || !self.interleaved)
    }

    /// The format every converter produces for this input.
    pub fn canonical(&self) -> Self {
        Self::new(self.sample_rate, self.channels, SampleEncoding::F32, false)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(PetalSonicError::AudioFormat(
                "Sample rate must be greater than 0".to_string(),
            ));
        }
        if !(1..=2).contains(&self.channels) {
            return Err(PetalSonicError::AudioFormat(format!(
                "Only mono and stereo buffers are supported, got {} channels",
                self.channels
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_detection() {
        assert!(AudioFormat::mono_f32(44100).is_canonical());
        assert!(AudioFormat::new(44100, 1, SampleEncoding::F32, true).is_canonical());
        assert!(AudioFormat::new(44100, 2, SampleEncoding::F32, false).is_canonical());
        assert!(!AudioFormat::new(44100, 2, SampleEncoding::F32, true).is_canonical());
        assert!(!AudioFormat::mono_i16(44100).is_canonical());
    }

    #[test]
    fn test_frame_sizes() {
        assert_eq!(AudioFormat::stereo_i16(48000).bytes_per_frame(), 4);
        assert_eq!(AudioFormat::mono_f32(48000).bytes_per_frame(), 4);
        assert_eq!(
            AudioFormat::new(8000, 2, SampleEncoding::U8, true).bytes_per_frame(),
            2
        );
        assert_eq!(SampleEncoding::I16.bits_per_sample(), 16);
    }

    #[test]
    fn test_validate() {
        assert!(AudioFormat::mono_f32(0).validate().is_err());
        assert!(AudioFormat::new(44100, 3, SampleEncoding::I16, true).validate().is_err());
        assert!(AudioFormat::stereo_i16(44100).validate().is_ok());
    }
}
