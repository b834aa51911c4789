//! Mixer input buses.
//!
//! A playing voice owns one bus. Each block the voice publishes its gain,
//! direction and pitch to the bus and writes its frames into the bus input; the
//! [`SoftwareMixer`](crate::mixer::SoftwareMixer) then resamples, pans and sums
//! every bus that received data.

use crate::error::{PetalSonicError, Result};
use crate::spatial::DistanceModel;
use rubato::{FastFixedOut, PolynomialDegree, Resampler};
use std::fmt;

/// How far pitch and doppler may move a bus away from its nominal rate.
const MAX_RELATIVE_RATIO: f64 = 16.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BusId(usize);

impl BusId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for BusId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bus({})", self.0)
    }
}

/// What the mixer can do for the voices feeding it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MixerCapabilities {
    /// Mono buses may run at any source rate and pitch
    pub resamples_mono_bus: bool,
}

/// Parameters a voice publishes to its bus every block.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BusParams {
    /// Gain in [0, 1] before any mixer-side distance attenuation
    pub gain: f32,
    pub azimuth: f32,
    pub elevation: f32,
    pub distance: f32,
    /// Pitch times doppler shift
    pub pitch_scale: f32,
    pub spatialized: bool,
    pub distance_model: DistanceModel,
    pub reference_distance: f32,
    pub max_distance: f32,
    pub rolloff_factor: f32,
}

impl Default for BusParams {
    fn default() -> Self {
        Self {
            gain: 1.0,
            azimuth: 0.0,
            elevation: 0.0,
            distance: 0.0,
            pitch_scale: 1.0,
            spatialized: false,
            distance_model: DistanceModel::None,
            reference_distance: 1.0,
            max_distance: f32::MAX,
            rolloff_factor: 1.0,
        }
    }
}

pub struct Bus {
    in_use: bool,
    rendered: bool,
    source_rate: u32,
    channels: u16,
    params: BusParams,
    resampler: Option<FastFixedOut<f32>>,
    base_ratio: f64,
    input: Vec<Vec<f32>>,
    resampled: Vec<Vec<f32>>,
    block_size: usize,
    output_rate: u32,
}

impl Bus {
    fn new(block_size: usize, output_rate: u32) -> Self {
        Self {
            in_use: false,
            rendered: false,
            source_rate: output_rate,
            channels: 1,
            params: BusParams::default(),
            resampler: None,
            base_ratio: 1.0,
            input: vec![vec![0.0; block_size]],
            resampled: Vec::new(),
            block_size,
            output_rate,
        }
    }

    pub fn is_in_use(&self) -> bool {
        self.in_use
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn source_rate(&self) -> u32 {
        self.source_rate
    }

    pub fn params(&self) -> &BusParams {
        &self.params
    }

    /// Whether the mixer converts this bus's rate and pitch.
    pub fn resamples(&self) -> bool {
        self.resampler.is_some()
    }

    fn configure(&mut self, source_rate: u32, channels: u16, resample: bool) -> Result<()> {
        if !resample {
            if self.resampler.take().is_some() || self.channels != channels {
                self.input = vec![vec![0.0; self.block_size]; channels as usize];
            }
            self.source_rate = source_rate;
            self.channels = channels;
            return Ok(());
        }

        let unchanged = self.resampler.is_some()
            && self.source_rate == source_rate
            && self.channels == channels;
        if unchanged {
            if let Some(resampler) = self.resampler.as_mut() {
                resampler.reset();
            }
            return Ok(());
        }

        let ratio = self.output_rate as f64 / source_rate as f64;
        let resampler = FastFixedOut::<f32>::new(
            ratio,
            MAX_RELATIVE_RATIO,
            PolynomialDegree::Cubic,
            self.block_size,
            channels as usize,
        )
        .map_err(|e| PetalSonicError::Resource(format!("Failed to create bus resampler: {}", e)))?;

        self.input = vec![vec![0.0; resampler.input_frames_max()]; channels as usize];
        self.resampled = vec![vec![0.0; resampler.output_frames_max()]; channels as usize];
        self.resampler = Some(resampler);
        self.base_ratio = ratio;
        self.source_rate = source_rate;
        self.channels = channels;
        Ok(())
    }

    /// Applies the published pitch and returns how many input frames the bus
    /// wants for the next output block.
    pub(crate) fn begin_block(&mut self) -> usize {
        self.rendered = false;
        let Some(resampler) = self.resampler.as_mut() else {
            return self.block_size;
        };

        let pitch_scale = (self.params.pitch_scale as f64).max(f64::EPSILON);
        let margin = MAX_RELATIVE_RATIO * 0.999;
        let ratio = (self.base_ratio / pitch_scale)
            .clamp(self.base_ratio / margin, self.base_ratio * margin);
        if let Err(e) = resampler.set_resample_ratio(ratio, true) {
            log::trace!("Bus resample ratio {} rejected: {}", ratio, e);
        }
        resampler.input_frames_next()
    }

    /// Planes the voice writes its frames into.
    pub(crate) fn input_mut(&mut self) -> &mut [Vec<f32>] {
        &mut self.input
    }

    pub(crate) fn mark_rendered(&mut self) {
        self.rendered = true;
    }

    /// Output-rate planes for this block, or `None` if the bus got no data.
    pub(crate) fn take_block(&mut self) -> Option<&[Vec<f32>]> {
        if !self.in_use || !self.rendered {
            return None;
        }
        self.rendered = false;

        let Self {
            resampler,
            input,
            resampled,
            block_size,
            ..
        } = self;
        match resampler {
            Some(resampler) => match resampler.process_into_buffer(input, resampled, None) {
                Ok((_, written)) => {
                    for plane in resampled.iter_mut() {
                        let end = (*block_size).min(plane.len());
                        if written < end {
                            plane[written..end].fill(0.0);
                        }
                    }
                    Some(resampled.as_slice())
                }
                Err(e) => {
                    log::warn!("Bus resampling failed: {}", e);
                    None
                }
            },
            None => Some(input.as_slice()),
        }
    }
}

/// Fixed set of buses shared by all voices of a context.
pub struct BusPool {
    buses: Vec<Bus>,
}

impl BusPool {
    pub fn new(count: usize, block_size: usize, output_rate: u32) -> Self {
        Self {
            buses: (0..count).map(|_| Bus::new(block_size, output_rate)).collect(),
        }
    }

    /// Claims a free bus.
    ///
    /// # Errors
    ///
    /// [`PetalSonicError::Resource`] when every bus is playing.
    pub fn acquire(&mut self) -> Result<BusId> {
        let Some(index) = self.buses.iter().position(|bus| !bus.in_use) else {
            log::warn!("All {} mixer buses are in use", self.buses.len());
            return Err(PetalSonicError::Resource(format!(
                "All {} mixer buses are in use",
                self.buses.len()
            )));
        };
        let bus = &mut self.buses[index];
        bus.in_use = true;
        bus.rendered = false;
        bus.params = BusParams::default();
        Ok(BusId(index))
    }

    pub fn release(&mut self, id: BusId) {
        if let Some(bus) = self.buses.get_mut(id.0) {
            bus.in_use = false;
            bus.rendered = false;
            if let Some(resampler) = bus.resampler.as_mut() {
                resampler.reset();
            }
        }
    }

    /// Sets the source format the bus will receive.
    pub fn configure(
        &mut self,
        id: BusId,
        source_rate: u32,
        channels: u16,
        resample: bool,
    ) -> Result<()> {
        let bus = self
            .buses
            .get_mut(id.0)
            .ok_or_else(|| PetalSonicError::InvalidValue(format!("Unknown {}", id)))?;
        bus.configure(source_rate, channels, resample)
    }

    pub fn publish(&mut self, id: BusId, params: BusParams) {
        if let Some(bus) = self.buses.get_mut(id.0) {
            bus.params = params;
        }
    }

    pub fn get(&self, id: BusId) -> Option<&Bus> {
        self.buses.get(id.0)
    }

    pub(crate) fn get_mut(&mut self, id: BusId) -> Option<&mut Bus> {
        self.buses.get_mut(id.0)
    }

    pub(crate) fn buses_mut(&mut self) -> impl Iterator<Item = &mut Bus> {
        self.buses.iter_mut()
    }

    pub fn capacity(&self) -> usize {
        self.buses.len()
    }

    pub fn in_use(&self) -> usize {
        self.buses.iter().filter(|bus| bus.in_use).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_until_exhausted() {
        let mut pool = BusPool::new(2, 64, 48000);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_ne!(a, b);
        assert!(matches!(pool.acquire(), Err(PetalSonicError::Resource(_))));

        pool.release(a);
        assert_eq!(pool.in_use(), 1);
        assert_eq!(pool.acquire().unwrap(), a);
    }

    #[test]
    fn test_unresampled_bus_passes_input_through() {
        let mut pool = BusPool::new(1, 4, 48000);
        let id = pool.acquire().unwrap();
        pool.configure(id, 48000, 1, false).unwrap();

        let bus = pool.get_mut(id).unwrap();
        assert_eq!(bus.begin_block(), 4);
        bus.input_mut()[0].copy_from_slice(&[0.1, 0.2, 0.3, 0.4]);
        assert!(bus.take_block().is_none());

        bus.mark_rendered();
        let block = bus.take_block().unwrap();
        assert_eq!(block[0], vec![0.1, 0.2, 0.3, 0.4]);
    }

    #[test]
    fn test_resampled_bus_asks_for_more_input_at_higher_rate() {
        let mut pool = BusPool::new(1, 256, 48000);
        let id = pool.acquire().unwrap();
        pool.configure(id, 96000, 1, true).unwrap();
        assert!(pool.get(id).unwrap().resamples());

        let bus = pool.get_mut(id).unwrap();
        let frames = bus.begin_block();
        assert!(frames > 400, "expected about 512 frames, got {}", frames);

        bus.mark_rendered();
        let block = bus.take_block().unwrap();
        assert!(block[0].len() >= 256);
    }
}
