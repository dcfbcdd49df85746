//! Mapping the inscribed rectangle back into projector pixels
//!
//! The rectangle is shrunk about its center until all four corners land
//! strictly inside the projector frame, then rounded to whole pixels.

use nalgebra::Point2;
use serde::{Deserialize, Serialize};

use crate::calibration::Resolution;
use crate::error::{KeystoneError, Result};
use crate::inscribed::Quadrilateral;
use crate::transform::Homography;

/// How the rectangle is shrunk when it spills over the projector frame
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ShrinkPolicy {
    /// Multiplier applied to each half-dimension per step
    pub factor: f64,
    /// Give up after this many steps
    pub max_iterations: usize,
}

impl Default for ShrinkPolicy {
    fn default() -> Self {
        Self {
            factor: 0.98,
            max_iterations: 200,
        }
    }
}

impl ShrinkPolicy {
    pub fn validate(&self) -> Result<()> {
        if !(self.factor > 0.0 && self.factor < 1.0) {
            return Err(KeystoneError::InvalidCalibration(format!(
                "shrink factor {} must lie in (0, 1)",
                self.factor
            )));
        }
        if self.max_iterations == 0 {
            return Err(KeystoneError::InvalidCalibration(
                "shrink iteration cap must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// The corrected display area in projector pixels
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackProjection {
    /// Wall rectangle after shrinking
    pub rect: Quadrilateral,
    /// Its corners in projector pixels, before rounding
    pub corners: [Point2<f64>; 4],
    /// Rounded corners, clamped to `[1, W-1] x [1, H-1]`
    pub pixels: [[i32; 2]; 4],
    /// `pixels` minus the matching screen corner
    pub offsets: [[i32; 2]; 4],
    /// Shrink steps applied
    pub iterations: usize,
}

fn project(rect: &Quadrilateral, h: &Homography) -> Result<[Point2<f64>; 4]> {
    let mut out = [Point2::origin(); 4];
    for (dst, p) in out.iter_mut().zip(rect.corners()) {
        *dst = h.transform_point(p)?;
    }
    Ok(out)
}

/// Map `rect` (wall frame) through `h` and fit it inside `resolution`
pub fn back_project_and_clamp(
    rect: &Quadrilateral,
    h: &Homography,
    resolution: &Resolution,
    policy: &ShrinkPolicy,
) -> Result<BackProjection> {
    policy.validate()?;

    let center = rect.centroid();
    let (width, height) = rect.extent();
    let mut current = *rect;
    let mut corners = project(&current, h)?;
    let mut iterations = 0;
    let mut scale = 1.0;

    while !corners.iter().all(|p| resolution.contains(p)) {
        if iterations == policy.max_iterations {
            return Err(KeystoneError::ShrinkDidNotConverge { iterations });
        }
        iterations += 1;
        scale *= policy.factor;

        let (w, hgt) = (width * scale, height * scale);
        current = Quadrilateral::rectangle(
            Point2::new(center.x - w / 2.0, center.y - hgt / 2.0),
            w,
            hgt,
        );
        corners = project(&current, h)?;
    }

    if iterations > 0 {
        tracing::debug!(
            "Shrunk display area {} times (scale {:.4}) to fit the projector",
            iterations,
            scale
        );
    }

    let max_x = resolution.width as i32 - 1;
    let max_y = resolution.height as i32 - 1;
    let screen = resolution.screen_corners();
    let mut pixels = [[0i32; 2]; 4];
    let mut offsets = [[0i32; 2]; 4];
    for i in 0..4 {
        let x = (corners[i].x.round() as i32).clamp(1, max_x.max(1));
        let y = (corners[i].y.round() as i32).clamp(1, max_y.max(1));
        pixels[i] = [x, y];
        offsets[i] = [x - screen[i].x as i32, y - screen[i].y as i32];
    }

    Ok(BackProjection {
        rect: current,
        corners,
        pixels,
        offsets,
        iterations,
    })
}
