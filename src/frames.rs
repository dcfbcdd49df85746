//! Coordinate frame conversions
//!
//! Frames used throughout the crate:
//! - projector: the usual pinhole frame, x right, y down, z out of the lens
//! - camera: same convention, placed by the camera-in-projector extrinsics
//! - world: projector origin, rotated so the measured gravity matches the
//!   reading taken while the device stood level
//! - wall: 2D frame embedded in the fitted wall plane, y pointing down

use nalgebra::{Point2, Point3, Rotation3, Vector3};

use crate::calibration::Resolution;
use crate::error::{KeystoneError, Result};
use crate::geometry::{minimal_rotation, Alignment, Plane};
use crate::inscribed::Quadrilateral;
use crate::transform::Homography;

/// Rotation carrying the measured gravity onto the reference gravity.
///
/// Parallel or anti-parallel readings leave the rotation axis undefined and
/// are errors.
pub fn gravity_alignment(
    measured: &Vector3<f64>,
    reference: &Vector3<f64>,
) -> Result<Rotation3<f64>> {
    match minimal_rotation(measured, reference)? {
        Alignment::Rotation(r) => Ok(r),
        Alignment::Parallel => Err(KeystoneError::DegenerateRotation(
            "measured gravity is parallel to the reference",
        )),
        Alignment::AntiParallel => Err(KeystoneError::DegenerateRotation(
            "measured gravity is opposite to the reference",
        )),
    }
}

/// Rotate projector-frame points into the gravity-aligned world frame.
///
/// Returns the rotation used alongside the rotated points.
pub fn projector_to_world(
    points: &[Point3<f64>],
    measured_gravity: &Vector3<f64>,
    reference_gravity: &Vector3<f64>,
) -> Result<(Rotation3<f64>, Vec<Point3<f64>>)> {
    let rotation = gravity_alignment(measured_gravity, reference_gravity)?;
    let world = points.iter().map(|p| rotation * p).collect();
    Ok((rotation, world))
}

/// Fit the wall plane through world-frame points
pub fn fit_plane(world_points: &[Point3<f64>]) -> Result<Plane> {
    Plane::fit(world_points)
}

/// Rotate world points so the plane faces the reference axis, then drop z
pub fn world_to_wall(world_points: &[Point3<f64>], plane: &Plane) -> Result<Vec<Point2<f64>>> {
    let rotation = plane.wall_alignment()?;
    Ok(world_points
        .iter()
        .map(|p| {
            let q = rotation * p;
            Point2::new(q.x, q.y)
        })
        .collect())
}

/// Homography `H` with `projector ~ H * wall`
pub fn estimate_wall_to_projector(
    wall_points: &[Point2<f64>],
    projector_points: &[Point2<f64>],
) -> Result<Homography> {
    Homography::estimate(wall_points, projector_points)
}

/// Where the four projector screen corners land on the wall
pub fn screen_corners_to_wall(h: &Homography, resolution: &Resolution) -> Result<Quadrilateral> {
    let projector_to_wall = h.inverted();
    let corners = resolution.screen_corners();
    let mut wall = [Point2::origin(); 4];
    for (dst, corner) in wall.iter_mut().zip(corners.iter()) {
        *dst = projector_to_wall.transform_point(corner)?;
    }
    tracing::debug!("Screen corners on the wall: {:?}", wall);
    Ok(Quadrilateral::new(wall))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Matrix3;

    #[test]
    fn test_projector_to_world_aligns_gravity() {
        let measured = Vector3::new(0.01, 9.8, 0.01);
        let reference = Vector3::new(2.5, 7.0, 0.45);
        let points = vec![Point3::new(0.0, 0.0, 1000.0), Point3::new(100.0, -50.0, 1200.0)];

        let (rotation, world) = projector_to_world(&points, &measured, &reference).unwrap();
        let g = rotation * measured;
        assert!((g.normalize() - reference.normalize()).norm() < 1e-9);
        // Rigid: distances survive
        let before = (points[1] - points[0]).norm();
        let after = (world[1] - world[0]).norm();
        assert!((before - after).abs() < 1e-9);
    }

    #[test]
    fn test_parallel_gravity_is_rejected_without_nan() {
        let g = Vector3::new(0.0, 9.8, 0.0);
        let err = projector_to_world(&[Point3::new(1.0, 2.0, 3.0)], &g, &g).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::DegenerateRotation);
    }

    #[test]
    fn test_world_to_wall_preserves_in_plane_distances() {
        let plane = Plane::new(0.2, -0.1, 1800.0);
        let world: Vec<_> = [(0.0, 0.0), (300.0, 0.0), (0.0, 200.0), (150.0, 120.0)]
            .iter()
            .map(|&(x, y)| Point3::new(x, y, plane.z_at(x, y)))
            .collect();

        let wall = world_to_wall(&world, &plane).unwrap();
        for i in 0..world.len() {
            for j in (i + 1)..world.len() {
                let d3 = (world[i] - world[j]).norm();
                let d2 = (wall[i] - wall[j]).norm();
                assert!((d3 - d2).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn test_screen_corners_to_wall_identity() {
        let h = Homography::from_matrix(Matrix3::identity()).unwrap();
        let quad = screen_corners_to_wall(&h, &Resolution::new(1920, 1080)).unwrap();
        assert_eq!(quad.a(), Point2::new(0.0, 0.0));
        assert_eq!(quad.c(), Point2::new(1920.0, 1080.0));
    }

    #[test]
    fn test_screen_corners_map_back_to_projector() {
        let h = Homography::from_matrix(Matrix3::new(
            1.3, 0.05, 200.0, -0.02, 1.25, 90.0, 1e-5, 2e-5, 1.0,
        ))
        .unwrap();
        let resolution = Resolution::new(1920, 1080);
        let quad = screen_corners_to_wall(&h, &resolution).unwrap();
        for (wall, screen) in quad.corners().iter().zip(resolution.screen_corners().iter()) {
            assert!((h.transform_point(wall).unwrap() - screen).norm() < 1e-6);
        }
    }
}
