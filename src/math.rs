//! Math types for PetalSonic

pub use glam::Vec3;

/// Right, forward and up unit vectors for an at/up orientation pair.
///
/// Returns `None` when `at` is zero or parallel to `up`.
pub fn orthonormal_basis(at: Vec3, up: Vec3) -> Option<(Vec3, Vec3, Vec3)> {
    let forward = at.try_normalize()?;
    let right = forward.cross(up).try_normalize()?;
    Some((right, forward, right.cross(forward)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_orientation() {
        let (right, forward, up) = orthonormal_basis(-Vec3::Z, Vec3::Y).unwrap();
        assert!(right.abs_diff_eq(Vec3::X, 1e-6));
        assert!(forward.abs_diff_eq(-Vec3::Z, 1e-6));
        assert!(up.abs_diff_eq(Vec3::Y, 1e-6));
    }

    #[test]
    fn test_skewed_up_is_straightened() {
        let (_, _, up) = orthonormal_basis(-Vec3::Z, Vec3::new(0.0, 1.0, -1.0)).unwrap();
        assert!(up.abs_diff_eq(Vec3::Y, 1e-6));
    }

    #[test]
    fn test_degenerate_pairs() {
        assert!(orthonormal_basis(Vec3::ZERO, Vec3::Y).is_none());
        assert!(orthonormal_basis(Vec3::Y, Vec3::Y * 2.0).is_none());
    }
}
