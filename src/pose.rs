//! Wall pose in the projector frame
//!
//! The wall-to-projector homography is induced by the wall plane, which sits at
//! `z = 0` in its own 2D frame. With the projector intrinsics `K`,
//! `K^-1 H ~ [r1 r2 t]` gives the wall's pose directly.

use nalgebra::{Isometry3, Matrix3, Rotation3, Translation3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

use crate::calibration::Intrinsics;
use crate::error::{KeystoneError, Result};
use crate::transform::Homography;

/// Rigid pose of the wall plane relative to the projector
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WallPose {
    /// Maps wall coordinates (z = 0 on the wall) into the projector frame
    pub wall_in_projector: Isometry3<f64>,
}

impl WallPose {
    /// Decompose a wall-to-projector homography
    pub fn from_homography(intrinsics: &Intrinsics, h: &Homography) -> Result<Self> {
        let k_inv = intrinsics
            .matrix()
            .try_inverse()
            .ok_or(KeystoneError::Singular("projector intrinsics"))?;
        let m = h.matrix();

        let k_inv_h1 = k_inv * m.column(0);
        let k_inv_h2 = k_inv * m.column(1);
        let norm1 = k_inv_h1.norm();
        let norm2 = k_inv_h2.norm();
        if norm1 <= 1e-12 || norm2 <= 1e-12 {
            return Err(KeystoneError::Singular("homography for pose extraction"));
        }
        let lambda = 2.0 / (norm1 + norm2);

        let mut r1 = k_inv_h1 * lambda;
        let mut r2 = k_inv_h2 * lambda;
        let mut t = (k_inv * m.column(2)) * lambda;
        // The wall is in front of the projector
        if t.z < 0.0 {
            r1 = -r1;
            r2 = -r2;
            t = -t;
        }
        let r3 = r1.cross(&r2);
        if r3.norm() <= 1e-12 {
            return Err(KeystoneError::Singular("homography for pose extraction"));
        }

        let r = Matrix3::from_columns(&[r1, r2, r3]);
        let svd = r.svd(true, true);
        let (u, v_t) = match (svd.u, svd.v_t) {
            (Some(u), Some(v_t)) => (u, v_t),
            _ => return Err(KeystoneError::Singular("rotation projection")),
        };
        let mut r_orth = u * v_t;
        if r_orth.determinant() < 0.0 {
            let mut u = u;
            u.column_mut(2).neg_mut();
            r_orth = u * v_t;
        }

        let rotation =
            UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(r_orth));
        let pose = Self {
            wall_in_projector: Isometry3::from_parts(Translation3::from(t), rotation),
        };
        tracing::debug!(
            "Wall pose: distance {:.1}, rpy {:?}",
            pose.distance(),
            pose.roll_pitch_yaw_degrees()
        );
        Ok(pose)
    }

    /// Projector pose expressed in the wall frame
    pub fn projector_in_wall(&self) -> Isometry3<f64> {
        self.wall_in_projector.inverse()
    }

    /// Distance from the projector center to the wall origin
    pub fn distance(&self) -> f64 {
        self.wall_in_projector.translation.vector.norm()
    }

    /// Wall normal in the projector frame
    pub fn normal(&self) -> Vector3<f64> {
        self.wall_in_projector.rotation * Vector3::z()
    }

    /// Roll, pitch and yaw of the wall rotation, in degrees
    pub fn roll_pitch_yaw_degrees(&self) -> [f64; 3] {
        let (roll, pitch, yaw) = self.wall_in_projector.rotation.euler_angles();
        [roll.to_degrees(), pitch.to_degrees(), yaw.to_degrees()]
    }
}
