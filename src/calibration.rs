//! Calibration constants of the projector/camera pair
//!
//! These are fixed for the lifetime of a correction session: intrinsics and
//! lens distortion of both devices, where the camera sits relative to the
//! projector, the projector's native resolution and the accelerometer reading
//! taken while the device stood level.

use nalgebra::{Matrix3, Point2, Rotation3, Vector3};
use serde::{Deserialize, Serialize};

use crate::backproject::ShrinkPolicy;
use crate::error::{KeystoneError, Result};
use crate::inscribed::FitMode;

/// Pinhole intrinsics
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Intrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

impl Intrinsics {
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64) -> Self {
        Self { fx, fy, cx, cy }
    }

    /// The 3x3 camera matrix `K`
    pub fn matrix(&self) -> Matrix3<f64> {
        Matrix3::new(self.fx, 0.0, self.cx, 0.0, self.fy, self.cy, 0.0, 0.0, 1.0)
    }

    /// Pixel -> normalized image coordinates
    #[inline]
    pub fn normalize(&self, u: f64, v: f64) -> (f64, f64) {
        ((u - self.cx) / self.fx, (v - self.cy) / self.fy)
    }

    /// Normalized image coordinates -> pixel
    #[inline]
    pub fn denormalize(&self, x: f64, y: f64) -> (f64, f64) {
        (self.fx * x + self.cx, self.fy * y + self.cy)
    }

    fn validate(&self, device: &str) -> Result<()> {
        let finite = [self.fx, self.fy, self.cx, self.cy]
            .iter()
            .all(|v| v.is_finite());
        if !finite || self.fx.abs() < f64::EPSILON || self.fy.abs() < f64::EPSILON {
            return Err(KeystoneError::InvalidCalibration(format!(
                "{} intrinsics are not invertible",
                device
            )));
        }
        Ok(())
    }
}

/// Brown-Conrady lens distortion (k1, k2, p1, p2, k3)
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Distortion {
    pub k1: f64,
    pub k2: f64,
    pub p1: f64,
    pub p2: f64,
    pub k3: f64,
}

impl Distortion {
    pub fn new(k1: f64, k2: f64, p1: f64, p2: f64, k3: f64) -> Self {
        Self { k1, k2, p1, p2, k3 }
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }

    /// Apply the distortion model to normalized image coordinates
    #[inline]
    pub fn distort(&self, x: f64, y: f64) -> (f64, f64) {
        let r2 = x * x + y * y;
        let radial = 1.0 + self.k1 * r2 + self.k2 * r2 * r2 + self.k3 * r2 * r2 * r2;
        let xd = x * radial + 2.0 * self.p1 * x * y + self.p2 * (r2 + 2.0 * x * x);
        let yd = y * radial + self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * x * y;
        (xd, yd)
    }
}

/// Intrinsics plus distortion of one optical device
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraModel {
    pub intrinsics: Intrinsics,
    #[serde(default)]
    pub distortion: Distortion,
}

impl CameraModel {
    /// Where an ideal (undistorted) pixel is found in the raw image
    #[inline]
    pub fn distort_pixel(&self, u: f64, v: f64) -> (f64, f64) {
        let (x, y) = self.intrinsics.normalize(u, v);
        let (xd, yd) = self.distortion.distort(x, y);
        self.intrinsics.denormalize(xd, yd)
    }
}

/// Rigid pose of one frame expressed in another
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Extrinsics {
    pub rotation: Rotation3<f64>,
    pub translation: Vector3<f64>,
}

/// Projector native resolution in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn aspect_ratio(&self) -> f64 {
        self.width as f64 / self.height as f64
    }

    /// Screen corners, in top-left, top-right, bottom-right, bottom-left order
    pub fn screen_corners(&self) -> [Point2<f64>; 4] {
        let (w, h) = (self.width as f64, self.height as f64);
        [
            Point2::new(0.0, 0.0), // Top-left
            Point2::new(w, 0.0),   // Top-right
            Point2::new(w, h),     // Bottom-right
            Point2::new(0.0, h),   // Bottom-left
        ]
    }

    /// Strictly inside the open pixel range on both axes
    #[inline]
    pub fn contains(&self, p: &Point2<f64>) -> bool {
        0.0 < p.x && p.x < self.width as f64 && 0.0 < p.y && p.y < self.height as f64
    }
}

/// The four projector screen corners, in output order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Corner {
    TopLeft,
    TopRight,
    BottomRight,
    BottomLeft,
}

impl Corner {
    pub const ALL: [Corner; 4] = [
        Corner::TopLeft,
        Corner::TopRight,
        Corner::BottomRight,
        Corner::BottomLeft,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Corner::TopLeft => "Top Left",
            Corner::TopRight => "Top Right",
            Corner::BottomRight => "Bottom Right",
            Corner::BottomLeft => "Bottom Left",
        }
    }
}

/// Everything a correction run needs besides the captured data
#[derive(Debug, Clone, PartialEq)]
pub struct Calibration {
    pub projector: CameraModel,
    pub resolution: Resolution,
    pub camera: CameraModel,
    /// Camera pose in the projector frame
    pub camera_in_projector: Extrinsics,
    /// Accelerometer reading (projector frame) while level
    pub reference_gravity: Vector3<f64>,
    pub mode: FitMode,
    pub shrink: ShrinkPolicy,
}

impl Calibration {
    /// Check the constants before any run uses them
    pub fn validate(&self) -> Result<()> {
        self.projector.intrinsics.validate("projector")?;
        self.camera.intrinsics.validate("camera")?;

        if self.resolution.width == 0 || self.resolution.height == 0 {
            return Err(KeystoneError::InvalidCalibration(format!(
                "projector resolution {}x{} is empty",
                self.resolution.width, self.resolution.height
            )));
        }

        let r = self.camera_in_projector.rotation.matrix();
        let orthonormal = (r.transpose() * r - Matrix3::identity()).norm() < 1e-6;
        if !orthonormal || (r.determinant() - 1.0).abs() > 1e-6 {
            return Err(KeystoneError::InvalidCalibration(
                "camera rotation is not a proper rotation matrix".to_string(),
            ));
        }
        if !self.camera_in_projector.translation.iter().all(|v| v.is_finite()) {
            return Err(KeystoneError::InvalidCalibration(
                "camera translation is not finite".to_string(),
            ));
        }

        let g = self.reference_gravity.norm();
        if !g.is_finite() || g <= 0.0 {
            return Err(KeystoneError::InvalidCalibration(
                "reference gravity must be a non-zero vector".to_string(),
            ));
        }

        self.shrink.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Calibration {
        Calibration {
            projector: CameraModel {
                intrinsics: Intrinsics::new(2283.8, 2288.0, 989.3, 1079.4),
                distortion: Distortion::default(),
            },
            resolution: Resolution::new(1920, 1080),
            camera: CameraModel {
                intrinsics: Intrinsics::new(600.3, 600.4, 323.2, 202.1),
                distortion: Distortion::default(),
            },
            camera_in_projector: Extrinsics {
                rotation: Rotation3::identity(),
                translation: Vector3::new(-68.8, 0.4, 8.0),
            },
            reference_gravity: Vector3::new(2.5, 7.0, 0.45),
            mode: FitMode::Biggest,
            shrink: ShrinkPolicy::default(),
        }
    }

    #[test]
    fn test_screen_corners_order() {
        let res = Resolution::new(1920, 1080);
        let corners = res.screen_corners();
        assert_eq!(corners[0], Point2::new(0.0, 0.0));
        assert_eq!(corners[1], Point2::new(1920.0, 0.0));
        assert_eq!(corners[2], Point2::new(1920.0, 1080.0));
        assert_eq!(corners[3], Point2::new(0.0, 1080.0));
        assert!((res.aspect_ratio() - 16.0 / 9.0).abs() < 1e-12);
    }

    #[test]
    fn test_contains_is_open_interval() {
        let res = Resolution::new(100, 50);
        assert!(res.contains(&Point2::new(0.5, 0.5)));
        assert!(!res.contains(&Point2::new(0.0, 10.0)));
        assert!(!res.contains(&Point2::new(10.0, 50.0)));
    }

    #[test]
    fn test_distort_pixel_round_trip_at_center() {
        let model = CameraModel {
            intrinsics: Intrinsics::new(600.0, 600.0, 320.0, 240.0),
            distortion: Distortion::new(0.25, -1.5, 0.0, 0.0, 1.8),
        };
        let (u, v) = model.distort_pixel(320.0, 240.0);
        assert!((u - 320.0).abs() < 1e-12);
        assert!((v - 240.0).abs() < 1e-12);

        // Barrel/pincushion moves off-center points along the radius
        let (u, v) = model.distort_pixel(420.0, 240.0);
        assert!((v - 240.0).abs() < 1e-12);
        assert!(u != 420.0);
    }

    #[test]
    fn test_validate() {
        assert!(sample().validate().is_ok());

        let mut cal = sample();
        cal.resolution = Resolution::new(0, 1080);
        assert!(matches!(
            cal.validate(),
            Err(KeystoneError::InvalidCalibration(_))
        ));

        let mut cal = sample();
        cal.camera_in_projector.rotation =
            Rotation3::from_matrix_unchecked(Matrix3::from_diagonal(&Vector3::new(1.0, 1.0, 2.0)));
        assert!(cal.validate().is_err());

        let mut cal = sample();
        cal.reference_gravity = Vector3::zeros();
        assert!(cal.validate().is_err());
    }
}
