//! Rotation primitives and least-squares plane fitting
//!
//! The frame transforms only ever need one kind of rotation: the smallest one
//! that carries a measured direction (gravity, a plane normal) onto a
//! reference direction. The plane fitter works in world coordinates where the
//! wall is roughly `z = const`, so the explicit form `z = a*x + b*y + c` is
//! well conditioned.

use nalgebra::{Matrix2, Point3, Rotation3, Unit, Vector2, Vector3};
use serde::{Deserialize, Serialize};

use crate::error::{KeystoneError, Result};

/// Relative cross-product magnitude under which two vectors count as parallel
const PARALLEL_EPS: f64 = 1e-12;

/// Relative determinant under which the xy spread of a point cloud is a line
const COLLINEAR_EPS: f64 = 1e-12;

/// Result of aligning one direction onto another
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Alignment {
    /// The rotation about `from x to` that carries `from` onto `to`
    Rotation(Rotation3<f64>),
    /// Same direction already, the rotation axis is undefined
    Parallel,
    /// Opposite directions, the rotation axis is undefined
    AntiParallel,
}

/// Minimal rotation carrying `from` onto `to`.
///
/// Axis is `from x to`, angle is the angle between the vectors (its sine is
/// the normalized cross-product magnitude). Zero-length input is rejected.
pub fn minimal_rotation(from: &Vector3<f64>, to: &Vector3<f64>) -> Result<Alignment> {
    let norms = from.norm() * to.norm();
    if !norms.is_finite() || norms <= 0.0 {
        return Err(KeystoneError::DegenerateRotation("zero-length direction"));
    }

    let axis = from.cross(to);
    let sin = axis.norm() / norms;
    if sin <= PARALLEL_EPS {
        return Ok(if from.dot(to) > 0.0 {
            Alignment::Parallel
        } else {
            Alignment::AntiParallel
        });
    }

    // atan2 agrees with asin(sin) below 90 degrees and stays exact beyond it
    let angle = axis.norm().atan2(from.dot(to));
    Ok(Alignment::Rotation(Rotation3::from_axis_angle(
        &Unit::new_normalize(axis),
        angle,
    )))
}

/// A plane `z = a*x + b*y + c`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Plane {
    pub a: f64,
    pub b: f64,
    pub c: f64,
}

impl Plane {
    pub fn new(a: f64, b: f64, c: f64) -> Self {
        Self { a, b, c }
    }

    /// Least-squares fit minimizing `sum (a*x + b*y + c - z)^2`.
    ///
    /// Solved on centered coordinates, which is the same minimizer as the
    /// raw normal equations but does not lose precision to a large offset.
    pub fn fit(points: &[Point3<f64>]) -> Result<Self> {
        if points.len() < 3 {
            return Err(KeystoneError::TooFewKeypoints {
                stage: "plane fit",
                needed: 3,
                got: points.len(),
            });
        }

        let n = points.len() as f64;
        let mean = points
            .iter()
            .fold(Vector3::zeros(), |acc, p| acc + p.coords)
            / n;

        let (mut sxx, mut sxy, mut syy, mut sxz, mut syz) = (0.0, 0.0, 0.0, 0.0, 0.0);
        for p in points {
            let d = p.coords - mean;
            sxx += d.x * d.x;
            sxy += d.x * d.y;
            syy += d.y * d.y;
            sxz += d.x * d.z;
            syz += d.y * d.z;
        }

        let m = Matrix2::new(sxx, sxy, sxy, syy);
        let trace = sxx + syy;
        if !(trace > 0.0) || m.determinant() <= COLLINEAR_EPS * trace * trace {
            return Err(KeystoneError::CollinearKeypoints { stage: "plane fit" });
        }
        let inv = m
            .try_inverse()
            .ok_or(KeystoneError::Singular("plane normal equations"))?;
        let ab = inv * Vector2::new(sxz, syz);

        let plane = Self::new(ab.x, ab.y, mean.z - ab.x * mean.x - ab.y * mean.y);
        tracing::debug!(
            "Fitted plane: {:.4}x + {:.4}y + {:.4} = z",
            plane.a,
            plane.b,
            plane.c
        );
        Ok(plane)
    }

    /// Normal `(a, b, -1)`, not normalized
    pub fn normal(&self) -> Vector3<f64> {
        Vector3::new(self.a, self.b, -1.0)
    }

    pub fn z_at(&self, x: f64, y: f64) -> f64 {
        self.a * x + self.b * y + self.c
    }

    /// Rotation that turns the plane normal onto `(0, 0, -|n|)`.
    ///
    /// A plane already facing the reference axis yields the identity.
    pub fn wall_alignment(&self) -> Result<Rotation3<f64>> {
        let normal = self.normal();
        let reference = Vector3::new(0.0, 0.0, -normal.norm());
        match minimal_rotation(&normal, &reference)? {
            Alignment::Rotation(r) => Ok(r),
            Alignment::Parallel => Ok(Rotation3::identity()),
            Alignment::AntiParallel => Err(KeystoneError::DegenerateRotation(
                "plane normal opposes the wall reference",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rotate(alignment: Alignment, v: &Vector3<f64>) -> Vector3<f64> {
        match alignment {
            Alignment::Rotation(r) => r * v,
            other => panic!("expected a rotation, got {:?}", other),
        }
    }

    #[test]
    fn test_minimal_rotation_maps_direction() {
        let from = Vector3::new(0.01, 9.8, 0.01);
        let to = Vector3::new(2.5, 7.0, 0.45);
        let rotated = rotate(minimal_rotation(&from, &to).unwrap(), &from);
        let expected = to.normalize() * from.norm();
        assert!((rotated - expected).norm() < 1e-9);
    }

    #[test]
    fn test_minimal_rotation_obtuse_angle() {
        let from = Vector3::new(1.0, 0.0, 0.0);
        let to = Vector3::new(-1.0, 1.0, 0.0);
        let rotated = rotate(minimal_rotation(&from, &to).unwrap(), &from);
        assert!((rotated - to.normalize()).norm() < 1e-9);
    }

    #[test]
    fn test_minimal_rotation_parallel_cases() {
        let v = Vector3::new(0.0, 9.8, 0.0);
        assert_eq!(
            minimal_rotation(&v, &(v * 2.0)).unwrap(),
            Alignment::Parallel
        );
        assert_eq!(minimal_rotation(&v, &-v).unwrap(), Alignment::AntiParallel);
        assert_eq!(
            minimal_rotation(&Vector3::zeros(), &v).unwrap_err().kind(),
            crate::error::ErrorKind::DegenerateRotation
        );
    }

    #[test]
    fn test_plane_fit_exact() {
        let truth = Plane::new(0.1, -0.2, 1500.0);
        let points: Vec<_> = (0..5)
            .flat_map(|i| (0..4).map(move |j| (i as f64 * 50.0, j as f64 * 40.0)))
            .map(|(x, y)| Point3::new(x, y, truth.z_at(x, y)))
            .collect();

        let plane = Plane::fit(&points).unwrap();
        assert!((plane.a - truth.a).abs() < 1e-9);
        assert!((plane.b - truth.b).abs() < 1e-9);
        assert!((plane.c - truth.c).abs() < 1e-6);
    }

    #[test]
    fn test_plane_fit_rejects_collinear() {
        let points: Vec<_> = (0..6)
            .map(|i| Point3::new(i as f64, 2.0 * i as f64, 10.0))
            .collect();
        assert_eq!(
            Plane::fit(&points).unwrap_err(),
            KeystoneError::CollinearKeypoints { stage: "plane fit" }
        );
        assert!(matches!(
            Plane::fit(&points[..2]),
            Err(KeystoneError::TooFewKeypoints { .. })
        ));
    }

    #[test]
    fn test_wall_alignment_flattens_plane() {
        let plane = Plane::new(0.3, -0.1, 2000.0);
        let r = plane.wall_alignment().unwrap();
        let a = r * Vector3::new(0.0, 0.0, plane.z_at(0.0, 0.0));
        let b = r * Vector3::new(100.0, -40.0, plane.z_at(100.0, -40.0));
        assert!((a.z - b.z).abs() < 1e-9);
    }

    #[test]
    fn test_wall_alignment_frontal_is_identity() {
        let plane = Plane::new(0.0, 0.0, 1000.0);
        assert_eq!(plane.wall_alignment().unwrap(), Rotation3::identity());
    }
}
