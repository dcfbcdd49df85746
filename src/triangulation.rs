//! Two-view triangulation of matched keypoints
//!
//! The projector is treated as an inverse camera: a keypoint drawn at projector
//! pixel `p` and photographed at camera pixel `c` is the 3D point whose
//! projections through both devices are `p` and `c`. Points come out in the
//! projector frame.

use nalgebra::{Matrix3, Matrix3x4, Matrix4, Point2, Point3};

use crate::calibration::{Extrinsics, Intrinsics};
use crate::error::{KeystoneError, Result};

/// Projection matrices of the projector (at the origin) and the camera
#[derive(Debug, Clone, PartialEq)]
pub struct StereoRig {
    pub projector: Matrix3x4<f64>,
    pub camera: Matrix3x4<f64>,
}

impl StereoRig {
    /// `Kp [I | 0]` and `Kc [R | t]^-1`, where `[R | t]` places the camera in
    /// the projector frame.
    pub fn new(
        projector: &Intrinsics,
        camera: &Intrinsics,
        camera_in_projector: &Extrinsics,
    ) -> Self {
        let mut projector_rt = Matrix3x4::zeros();
        projector_rt
            .fixed_view_mut::<3, 3>(0, 0)
            .copy_from(&Matrix3::identity());

        let r_t = camera_in_projector.rotation.matrix().transpose();
        let t = -(r_t * camera_in_projector.translation);
        let mut camera_rt = Matrix3x4::zeros();
        camera_rt.fixed_view_mut::<3, 3>(0, 0).copy_from(&r_t);
        camera_rt.fixed_view_mut::<3, 1>(0, 3).copy_from(&t);

        Self {
            projector: projector.matrix() * projector_rt,
            camera: camera.matrix() * camera_rt,
        }
    }

    /// Triangulate every correspondence, preserving order
    pub fn triangulate(
        &self,
        projector_points: &[Point2<f64>],
        camera_points: &[Point2<f64>],
    ) -> Result<Vec<Point3<f64>>> {
        if projector_points.len() != camera_points.len() {
            return Err(KeystoneError::KeypointMismatch {
                left: projector_points.len(),
                right: camera_points.len(),
            });
        }
        projector_points
            .iter()
            .zip(camera_points)
            .map(|(p, c)| self.triangulate_point(p, c))
            .collect()
    }

    /// Linear (DLT) triangulation of a single correspondence
    pub fn triangulate_point(&self, p: &Point2<f64>, c: &Point2<f64>) -> Result<Point3<f64>> {
        let mut a = Matrix4::zeros();
        for (row, (pixel, cam)) in [(p, &self.projector), (c, &self.camera)]
            .into_iter()
            .enumerate()
        {
            a.set_row(2 * row, &(cam.row(2) * pixel.x - cam.row(0)));
            a.set_row(2 * row + 1, &(cam.row(2) * pixel.y - cam.row(1)));
        }

        let svd = a.svd(false, true);
        let v_t = svd
            .v_t
            .ok_or(KeystoneError::Singular("triangulation system"))?;
        let smallest = svd
            .singular_values
            .iamin();
        let x = v_t.row(smallest);

        let w = x[3];
        if w.abs() <= f64::EPSILON * x.norm() || !w.is_finite() {
            return Err(KeystoneError::Singular("triangulation (point at infinity)"));
        }
        Ok(Point3::new(x[0] / w, x[1] / w, x[2] / w))
    }
}
