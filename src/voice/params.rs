use crate::error::{PetalSonicError, Result};
use crate::math::Vec3;

/// Per-voice gain, pitch and 3D parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoiceParams {
    pub gain: f32,
    pub min_gain: f32,
    pub max_gain: f32,
    pub pitch: f32,
    pub position: Vec3,
    pub velocity: Vec3,
    pub direction: Vec3,
    /// Position is relative to the listener rather than the world
    pub source_relative: bool,
    pub reference_distance: f32,
    pub max_distance: f32,
    pub rolloff_factor: f32,
    pub cone_inner_angle: f32,
    pub cone_outer_angle: f32,
    pub cone_outer_gain: f32,
    pub looping: bool,
}

impl Default for VoiceParams {
    fn default() -> Self {
        Self {
            gain: 1.0,
            min_gain: 0.0,
            max_gain: 1.0,
            pitch: 1.0,
            position: Vec3::ZERO,
            velocity: Vec3::ZERO,
            direction: Vec3::ZERO,
            source_relative: false,
            reference_distance: 1.0,
            max_distance: f32::MAX,
            rolloff_factor: 1.0,
            cone_inner_angle: 360.0,
            cone_outer_angle: 360.0,
            cone_outer_gain: 0.0,
            looping: false,
        }
    }
}

fn invalid(name: &str, value: f32, expected: &str) -> PetalSonicError {
    PetalSonicError::InvalidValue(format!("{} {} must be {}", name, value, expected))
}

pub(crate) fn check_non_negative(name: &str, value: f32) -> Result<()> {
    if value.is_nan() || value < 0.0 {
        return Err(invalid(name, value, ">= 0"));
    }
    Ok(())
}

pub(crate) fn check_positive(name: &str, value: f32) -> Result<()> {
    if value.is_nan() || value <= 0.0 {
        return Err(invalid(name, value, "> 0"));
    }
    Ok(())
}

pub(crate) fn check_unit(name: &str, value: f32) -> Result<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(invalid(name, value, "within [0, 1]"));
    }
    Ok(())
}

pub(crate) fn check_angle(name: &str, value: f32) -> Result<()> {
    if !(0.0..=360.0).contains(&value) {
        return Err(invalid(name, value, "within [0, 360] degrees"));
    }
    Ok(())
}

pub(crate) fn check_finite(name: &str, value: Vec3) -> Result<()> {
    if !value.is_finite() {
        return Err(PetalSonicError::InvalidValue(format!(
            "{} {:?} must be finite",
            name, value
        )));
    }
    Ok(())
}
