//! Configuration for PetalSonic

use crate::error::{PetalSonicError, Result};
use crate::spatial::DistanceModel;

/// Which render strategy new voices use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RenderStrategyKind {
    /// Pick from the mixer's capabilities.
    #[default]
    Auto,
    /// Hand converted frames to the bus and let the mixer resample.
    Direct,
    /// Resample inside the voice with linear interpolation.
    Interpolating,
}

/// Configuration descriptor for a PetalSonic context
#[derive(Debug, Clone)]
pub struct PetalSonicContextDesc {
    /// Output sample rate of the mixer and the device stream
    pub sample_rate: u32,
    /// Number of frames rendered per cycle
    pub block_size: usize,
    /// Number of output channels (1 or 2)
    pub channels: u16,
    /// Number of mixer buses, i.e. how many voices can play at once
    pub max_buses: usize,
    /// Requested capacity of the engine ring buffer in frames (rounded up to a power of two)
    pub ring_buffer_frames: usize,
    /// Capacity of each voice's deferred command channel
    pub command_capacity: usize,
    pub render_strategy: RenderStrategyKind,
    pub distance_model: DistanceModel,
    pub doppler_factor: f32,
    pub speed_of_sound: f32,
}

impl Default for PetalSonicContextDesc {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            block_size: 512,
            channels: 2,
            max_buses: 64,
            ring_buffer_frames: 4096,
            command_capacity: 64,
            render_strategy: RenderStrategyKind::Auto,
            distance_model: DistanceModel::InverseClamped,
            doppler_factor: 1.0,
            speed_of_sound: 343.3,
        }
    }
}

impl PetalSonicContextDesc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sample_rate(mut self, rate: u32) -> Self {
        self.sample_rate = rate;
        self
    }

    pub fn block_size(mut self, size: usize) -> Self {
        self.block_size = size;
        self
    }

    pub fn channels(mut self, channels: u16) -> Self {
        self.channels = channels;
        self
    }

    pub fn max_buses(mut self, max: usize) -> Self {
        self.max_buses = max;
        self
    }

    pub fn ring_buffer_frames(mut self, frames: usize) -> Self {
        self.ring_buffer_frames = frames;
        self
    }

    pub fn command_capacity(mut self, capacity: usize) -> Self {
        self.command_capacity = capacity;
        self
    }

    pub fn render_strategy(mut self, kind: RenderStrategyKind) -> Self {
        self.render_strategy = kind;
        self
    }

    pub fn distance_model(mut self, model: DistanceModel) -> Self {
        self.distance_model = model;
        self
    }

    pub fn doppler_factor(mut self, factor: f32) -> Self {
        self.doppler_factor = factor;
        self
    }

    pub fn speed_of_sound(mut self, speed: f32) -> Self {
        self.speed_of_sound = speed;
        self
    }

    /// Checks the descriptor before a context is built from it.
    ///
    /// # Errors
    ///
    /// Returns [`PetalSonicError::Configuration`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(PetalSonicError::Configuration(
                "sample_rate must be greater than 0".into(),
            ));
        }
        if self.block_size == 0 {
            return Err(PetalSonicError::Configuration(
                "block_size must be greater than 0".into(),
            ));
        }
        if !(1..=2).contains(&self.channels) {
            return Err(PetalSonicError::Configuration(format!(
                "channels must be 1 or 2, got {}",
                self.channels
            )));
        }
        if self.max_buses == 0 {
            return Err(PetalSonicError::Configuration(
                "max_buses must be greater than 0".into(),
            ));
        }
        if self.ring_buffer_frames < self.block_size * 2 {
            return Err(PetalSonicError::Configuration(format!(
                "ring_buffer_frames ({}) must hold at least two blocks of {} frames",
                self.ring_buffer_frames, self.block_size
            )));
        }
        if self.command_capacity == 0 {
            return Err(PetalSonicError::Configuration(
                "command_capacity must be greater than 0".into(),
            ));
        }
        if self.doppler_factor < 0.0 {
            return Err(PetalSonicError::Configuration(
                "doppler_factor must not be negative".into(),
            ));
        }
        if self.speed_of_sound <= 0.0 {
            return Err(PetalSonicError::Configuration(
                "speed_of_sound must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_desc_is_valid() {
        assert!(PetalSonicContextDesc::default().validate().is_ok());
    }

    #[test]
    fn test_builder_overrides() {
        let desc = PetalSonicContextDesc::new()
            .sample_rate(44100)
            .block_size(256)
            .channels(1)
            .render_strategy(RenderStrategyKind::Interpolating);
        assert_eq!(desc.sample_rate, 44100);
        assert_eq!(desc.block_size, 256);
        assert_eq!(desc.channels, 1);
        assert_eq!(desc.render_strategy, RenderStrategyKind::Interpolating);
    }

    #[test]
    fn test_invalid_desc() {
        assert!(PetalSonicContextDesc::new().sample_rate(0).validate().is_err());
        assert!(PetalSonicContextDesc::new().channels(3).validate().is_err());
        assert!(
            PetalSonicContextDesc::new()
                .block_size(1024)
                .ring_buffer_frames(1024)
                .validate()
                .is_err()
        );
        assert!(PetalSonicContextDesc::new().speed_of_sound(0.0).validate().is_err());
    }
}
