//! Distance, cone, azimuth and doppler math.
//!
//! Everything here is a pure function of listener and voice parameters; the
//! render path calls [`spatialize`] once per block and hands the result to the
//! voice's bus.

use crate::math::{Vec3, orthonormal_basis};
use crate::voice::VoiceParams;

const MIN_DOPPLER: f32 = 0.125;
const MAX_DOPPLER: f32 = 16.0;

/// How gain falls off with distance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DistanceModel {
    None,
    Inverse,
    #[default]
    InverseClamped,
    Linear,
    LinearClamped,
    Exponent,
    ExponentClamped,
}

impl DistanceModel {
    /// Inverse models are evaluated by the mixer from the published distance.
    pub fn handled_by_mixer(self) -> bool {
        matches!(self, Self::Inverse | Self::InverseClamped)
    }

    fn is_clamped(self) -> bool {
        matches!(
            self,
            Self::InverseClamped | Self::LinearClamped | Self::ExponentClamped
        )
    }
}

/// Listener pose and motion in world space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ListenerState {
    pub position: Vec3,
    pub velocity: Vec3,
    pub at: Vec3,
    pub up: Vec3,
    /// Master gain applied to the whole mix
    pub gain: f32,
}

impl Default for ListenerState {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            velocity: Vec3::ZERO,
            at: -Vec3::Z,
            up: Vec3::Y,
            gain: 1.0,
        }
    }
}

/// Context-wide settings that shape the spatial math.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpatialEnvironment {
    pub distance_model: DistanceModel,
    pub doppler_factor: f32,
    pub speed_of_sound: f32,
}

impl Default for SpatialEnvironment {
    fn default() -> Self {
        Self {
            distance_model: DistanceModel::default(),
            doppler_factor: 1.0,
            speed_of_sound: 343.3,
        }
    }
}

/// Output of [`spatialize`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpatialResult {
    /// Bus gain in [0, 1], excluding any attenuation left to the mixer
    pub gain: f32,
    /// Mixer angle in degrees, 0 straight ahead, positive to the right
    pub azimuth: f32,
    pub elevation: f32,
    pub distance: f32,
    pub doppler: f32,
}

/// Listener-relative azimuth and elevation of `relative` (source minus listener).
pub fn azimuth_elevation(relative: Vec3, at: Vec3, up: Vec3) -> (f32, f32) {
    let Some((right, look, true_up)) = orthonormal_basis(at, up) else {
        return (0.0, 0.0);
    };
    let to_source = relative.normalize_or_zero();
    if to_source == Vec3::ZERO {
        return (0.0, 0.0);
    }

    let up_projection = to_source.dot(true_up);
    let projected = (to_source - up_projection * true_up).normalize_or_zero();
    let mut angle = projected.dot(right).clamp(-1.0, 1.0).acos().to_degrees();
    if angle.is_nan() {
        angle = 0.0;
    }
    if projected.dot(look) < 0.0 {
        angle = 360.0 - angle;
    }
    let azimuth = if (0.0..=270.0).contains(&angle) {
        90.0 - angle
    } else {
        450.0 - angle
    };

    let mut elevation = 90.0 - to_source.dot(true_up).clamp(-1.0, 1.0).acos().to_degrees();
    if elevation.is_nan() {
        elevation = 0.0;
    }
    (azimuth, elevation.clamp(-90.0, 90.0))
}

/// Doppler pitch scaler for a source at `relative` to the listener.
pub fn doppler_shift(
    relative: Vec3,
    listener_velocity: Vec3,
    source_velocity: Vec3,
    doppler_factor: f32,
    speed_of_sound: f32,
) -> f32 {
    if doppler_factor <= 0.0 {
        return 1.0;
    }
    if listener_velocity == Vec3::ZERO && source_velocity == Vec3::ZERO {
        return 1.0;
    }
    let direction = relative.normalize_or_zero();
    if direction == Vec3::ZERO {
        return 1.0;
    }

    let limit = speed_of_sound / doppler_factor;
    let listener_speed = (-direction.dot(listener_velocity)).min(limit);
    let source_speed = (-direction.dot(source_velocity)).min(limit);
    let shift = (speed_of_sound - doppler_factor * listener_speed)
        / (speed_of_sound - doppler_factor * source_speed);
    if !shift.is_finite() {
        return MAX_DOPPLER;
    }
    shift.clamp(MIN_DOPPLER, MAX_DOPPLER)
}

/// Attenuation for `distance` under `model`.
pub fn distance_gain(
    model: DistanceModel,
    distance: f32,
    reference_distance: f32,
    max_distance: f32,
    rolloff_factor: f32,
) -> f32 {
    let distance = if model.is_clamped() {
        distance.max(reference_distance).min(max_distance)
    } else {
        distance
    };

    let gain = match model {
        DistanceModel::None => 1.0,
        DistanceModel::Inverse | DistanceModel::InverseClamped => {
            let denominator = reference_distance + rolloff_factor * (distance - reference_distance);
            if denominator <= 0.0 {
                1.0
            } else {
                reference_distance / denominator
            }
        }
        DistanceModel::Linear | DistanceModel::LinearClamped => {
            let span = max_distance - reference_distance;
            if span <= 0.0 {
                1.0
            } else {
                1.0 - rolloff_factor * (distance - reference_distance) / span
            }
        }
        DistanceModel::Exponent | DistanceModel::ExponentClamped => {
            (distance / reference_distance).powf(-rolloff_factor)
        }
    };
    if gain.is_finite() { gain.max(0.0) } else { 1.0 }
}

/// Directional gain of a sound cone pointing along `direction`.
pub fn cone_gain(
    source_position: Vec3,
    listener_position: Vec3,
    direction: Vec3,
    inner_angle: f32,
    outer_angle: f32,
    outer_gain: f32,
) -> f32 {
    if direction == Vec3::ZERO || (inner_angle == 360.0 && outer_angle == 360.0) {
        return 1.0;
    }
    let to_listener = (listener_position - source_position).normalize_or_zero();
    let angle = to_listener
        .dot(direction.normalize_or_zero())
        .clamp(-1.0, 1.0)
        .acos()
        .to_degrees()
        .abs();
    let inner = inner_angle.abs() / 2.0;
    let outer = outer_angle.abs() / 2.0;

    if angle <= inner {
        1.0
    } else if angle >= outer {
        outer_gain
    } else {
        let x = (angle - inner) / (outer - inner);
        (1.0 - x) + outer_gain * x
    }
}

/// Combines gain stages and clamps into `[min_gain, max_gain]` and then `[0, 1]`.
pub fn bus_gain(gain: f32, cone: f32, attenuation: f32, min_gain: f32, max_gain: f32) -> f32 {
    let mut value = gain * cone * attenuation;
    if min_gain > value {
        value = min_gain;
    } else if max_gain < value {
        value = max_gain;
    }
    value.clamp(0.0, 1.0)
}

/// Computes bus gain, direction and doppler for one voice.
///
/// Only mono sources are positioned; `spatial == false` yields a centred,
/// unattenuated result that still honours the voice's gain limits.
pub fn spatialize(
    listener: &ListenerState,
    params: &VoiceParams,
    env: &SpatialEnvironment,
    spatial: bool,
) -> SpatialResult {
    if !spatial {
        return SpatialResult {
            gain: bus_gain(params.gain, 1.0, 1.0, params.min_gain, params.max_gain),
            azimuth: 0.0,
            elevation: 0.0,
            distance: 0.0,
            doppler: 1.0,
        };
    }

    let relative = if params.source_relative {
        params.position
    } else {
        params.position - listener.position
    };
    let distance = relative.length();
    let (azimuth, elevation) = azimuth_elevation(relative, listener.at, listener.up);
    let doppler = doppler_shift(
        relative,
        listener.velocity,
        params.velocity,
        env.doppler_factor,
        env.speed_of_sound,
    );

    let attenuation = if env.distance_model.handled_by_mixer() {
        1.0
    } else {
        distance_gain(
            env.distance_model,
            distance,
            params.reference_distance,
            params.max_distance,
            params.rolloff_factor,
        )
    };
    let listener_position = if params.source_relative {
        Vec3::ZERO
    } else {
        listener.position
    };
    let cone = cone_gain(
        params.position,
        listener_position,
        params.direction,
        params.cone_inner_angle,
        params.cone_outer_angle,
        params.cone_outer_gain,
    );

    SpatialResult {
        gain: bus_gain(params.gain, cone, attenuation, params.min_gain, params.max_gain),
        azimuth,
        elevation,
        distance,
        doppler,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-4
    }

    #[test]
    fn test_azimuth_quadrants() {
        let at = -Vec3::Z;
        let up = Vec3::Y;
        let (front, _) = azimuth_elevation(Vec3::new(0.0, 0.0, -1.0), at, up);
        let (right, _) = azimuth_elevation(Vec3::new(1.0, 0.0, 0.0), at, up);
        let (left, _) = azimuth_elevation(Vec3::new(-1.0, 0.0, 0.0), at, up);
        let (_, above) = azimuth_elevation(Vec3::new(0.0, 1.0, 0.0), at, up);
        assert!(approx(front, 0.0));
        assert!(approx(right, 90.0));
        assert!(approx(left, -90.0));
        assert!(approx(above, 90.0));
    }

    #[test]
    fn test_distance_models() {
        assert!(approx(distance_gain(DistanceModel::None, 10.0, 1.0, 100.0, 1.0), 1.0));
        assert!(approx(distance_gain(DistanceModel::Inverse, 2.0, 1.0, 100.0, 1.0), 0.5));
        assert!(approx(distance_gain(DistanceModel::Linear, 50.5, 1.0, 100.0, 1.0), 0.5));
        assert!(approx(distance_gain(DistanceModel::Exponent, 4.0, 1.0, 100.0, 0.5), 0.5));
        // clamped variants never boost inside the reference distance
        assert!(approx(distance_gain(DistanceModel::ExponentClamped, 0.25, 1.0, 100.0, 1.0), 1.0));
        assert!(approx(distance_gain(DistanceModel::LinearClamped, 500.0, 1.0, 100.0, 1.0), 0.0));
    }

    #[test]
    fn test_cone_gain() {
        let dir = Vec3::new(0.0, 0.0, 1.0);
        let source = Vec3::ZERO;
        let in_front = Vec3::new(0.0, 0.0, 5.0);
        let behind = Vec3::new(0.0, 0.0, -5.0);
        let side = Vec3::new(5.0, 0.0, 0.0);

        assert!(approx(cone_gain(source, in_front, dir, 60.0, 240.0, 0.2), 1.0));
        assert!(approx(cone_gain(source, behind, dir, 60.0, 240.0, 0.2), 0.2));
        // 90 degrees sits halfway between 30 and 120
        let mid = cone_gain(source, side, dir, 60.0, 240.0, 0.2);
        assert!(approx(mid, 1.0 - (60.0 / 90.0) * 0.8));
        assert!(approx(cone_gain(source, behind, Vec3::ZERO, 60.0, 240.0, 0.2), 1.0));
    }

    #[test]
    fn test_doppler_direction_and_clamp() {
        let relative = Vec3::new(0.0, 0.0, -10.0);
        let approaching = doppler_shift(relative, Vec3::new(0.0, 0.0, -10.0), Vec3::ZERO, 1.0, 343.3);
        let receding = doppler_shift(relative, Vec3::new(0.0, 0.0, 10.0), Vec3::ZERO, 1.0, 343.3);
        assert!(approaching > 1.0);
        assert!(receding < 1.0);

        let supersonic = doppler_shift(relative, Vec3::ZERO, Vec3::new(0.0, 0.0, 400.0), 1.0, 343.3);
        assert_eq!(supersonic, MAX_DOPPLER);
        assert_eq!(doppler_shift(relative, Vec3::X, Vec3::ZERO, 0.0, 343.3), 1.0);
    }

    #[test]
    fn test_bus_gain_clamps() {
        assert!(approx(bus_gain(2.0, 1.0, 1.0, 0.0, 1.0), 1.0));
        assert!(approx(bus_gain(0.1, 1.0, 1.0, 0.3, 1.0), 0.3));
        assert!(approx(bus_gain(0.8, 0.5, 0.5, 0.0, 1.0), 0.2));
        assert_eq!(bus_gain(0.0, 1.0, 1.0, 0.0, 1.0), 0.0);
    }

    #[test]
    fn test_spatialize_stereo_is_centred() {
        let params = VoiceParams {
            position: Vec3::new(10.0, 0.0, 0.0),
            gain: 0.5,
            ..VoiceParams::default()
        };
        let result = spatialize(
            &ListenerState::default(),
            &params,
            &SpatialEnvironment::default(),
            false,
        );
        assert_eq!(result.azimuth, 0.0);
        assert_eq!(result.doppler, 1.0);
        assert!(approx(result.gain, 0.5));
    }

    #[test]
    fn test_spatialize_linear_model() {
        let params = VoiceParams {
            position: Vec3::new(0.0, 0.0, -50.5),
            max_distance: 100.0,
            ..VoiceParams::default()
        };
        let env = SpatialEnvironment {
            distance_model: DistanceModel::Linear,
            ..SpatialEnvironment::default()
        };
        let result = spatialize(&ListenerState::default(), &params, &env, true);
        assert!(approx(result.gain, 0.5));
        assert!(approx(result.distance, 50.5));
        assert!(approx(result.azimuth, 0.0));
    }
}
