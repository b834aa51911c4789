// Mixer module - sums every bus that received data this block into the
// interleaved output, applying distance attenuation and panning.

use crate::bus::{BusPool, MixerCapabilities};
use crate::spatial::distance_gain;
use std::f32::consts::FRAC_PI_4;

/// Reference mixer behind the bus interface.
pub struct SoftwareMixer {
    channels: u16,
    block_size: usize,
}

impl SoftwareMixer {
    pub fn new(channels: u16, block_size: usize) -> Self {
        Self {
            channels,
            block_size,
        }
    }

    pub fn capabilities(&self) -> MixerCapabilities {
        MixerCapabilities {
            resamples_mono_bus: true,
        }
    }

    /// Mixes all rendered buses into `out`, overwriting it.
    ///
    /// Returns the number of buses that contributed.
    pub fn mix(&mut self, buses: &mut BusPool, out: &mut [f32], master_gain: f32) -> usize {
        out.fill(0.0);
        let channels = self.channels as usize;
        let frames = (out.len() / channels).min(self.block_size);
        let mut mixed = 0;

        for bus in buses.buses_mut() {
            let params = *bus.params();
            let bus_channels = bus.channels() as usize;
            let Some(block) = bus.take_block() else {
                continue;
            };

            let attenuation = if params.spatialized && params.distance_model.handled_by_mixer() {
                distance_gain(
                    params.distance_model,
                    params.distance,
                    params.reference_distance,
                    params.max_distance,
                    params.rolloff_factor,
                )
            } else {
                1.0
            };
            let gain = params.gain * attenuation * master_gain;
            if gain <= 0.0 {
                continue;
            }

            let (left_gain, right_gain) = if bus_channels == 1 && params.spatialized {
                pan_gains(params.azimuth)
            } else {
                (1.0, 1.0)
            };

            for frame in 0..frames {
                let left = block[0][frame];
                let right = block[bus_channels.min(block.len()) - 1][frame];
                let index = frame * channels;
                if channels == 1 {
                    out[index] += gain * 0.5 * (left + right);
                } else {
                    out[index] += gain * left_gain * left;
                    out[index + 1] += gain * right_gain * right;
                }
            }
            mixed += 1;
        }

        if mixed > 0 {
            log::trace!("Mixed {} buses into {} frames", mixed, frames);
        }
        mixed
    }
}

/// Equal-power left/right gains for an azimuth in degrees.
/// Sources behind the listener fold onto the frontal arc.
pub fn pan_gains(azimuth: f32) -> (f32, f32) {
    let folded = if azimuth > 90.0 {
        180.0 - azimuth
    } else if azimuth < -90.0 {
        -180.0 - azimuth
    } else {
        azimuth
    };
    let pan = (folded / 90.0).clamp(-1.0, 1.0);
    let theta = (pan + 1.0) * FRAC_PI_4;
    (theta.cos(), theta.sin())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusParams;
    use crate::spatial::DistanceModel;

    fn approx(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-4
    }

    #[test]
    fn test_pan_gains() {
        let (l, r) = pan_gains(0.0);
        assert!(approx(l, r));
        assert!(approx(l * l + r * r, 1.0));

        let (l, r) = pan_gains(90.0);
        assert!(approx(l, 0.0));
        assert!(approx(r, 1.0));

        let (l, r) = pan_gains(-90.0);
        assert!(approx(l, 1.0));
        assert!(approx(r, 0.0));

        // directly behind sounds centred
        let (l, r) = pan_gains(180.0);
        assert!(approx(l, r));
    }

    #[test]
    fn test_mix_sums_buses_with_gain() {
        let mut buses = BusPool::new(2, 4, 48000);
        for gain in [0.5, 0.25] {
            let id = buses.acquire().unwrap();
            buses.configure(id, 48000, 2, false).unwrap();
            buses.publish(
                id,
                BusParams {
                    gain,
                    ..BusParams::default()
                },
            );
            let bus = buses.get_mut(id).unwrap();
            bus.begin_block();
            bus.input_mut()[0].fill(1.0);
            bus.input_mut()[1].fill(-1.0);
            bus.mark_rendered();
        }

        let mut mixer = SoftwareMixer::new(2, 4);
        let mut out = vec![9.0f32; 8];
        assert_eq!(mixer.mix(&mut buses, &mut out, 1.0), 2);
        assert!(approx(out[0], 0.75));
        assert!(approx(out[1], -0.75));

        // nothing rendered since the last mix
        assert_eq!(mixer.mix(&mut buses, &mut out, 1.0), 0);
        assert!(out.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_mix_applies_inverse_distance() {
        let mut buses = BusPool::new(1, 2, 48000);
        let id = buses.acquire().unwrap();
        buses.configure(id, 48000, 1, false).unwrap();
        buses.publish(
            id,
            BusParams {
                spatialized: true,
                distance: 2.0,
                distance_model: DistanceModel::Inverse,
                ..BusParams::default()
            },
        );
        let bus = buses.get_mut(id).unwrap();
        bus.begin_block();
        bus.input_mut()[0].fill(1.0);
        bus.mark_rendered();

        let mut mixer = SoftwareMixer::new(1, 2);
        let mut out = vec![0.0f32; 2];
        mixer.mix(&mut buses, &mut out, 1.0);
        assert!(approx(out[0], 0.5));
    }
}
