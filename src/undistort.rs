//! Lens distortion removal for captured frames and keypoints

use image::GrayImage;
use nalgebra::Point2;
use rayon::prelude::*;

use crate::calibration::CameraModel;

/// Fixed-point iterations used to invert the distortion model
const UNDISTORT_ITERATIONS: usize = 20;

/// Resample `image` so it follows the ideal pinhole model.
///
/// Each output pixel looks up where the lens put it in the raw frame. Pixels
/// whose source falls outside the frame come out black.
pub fn undistort_image(image: &GrayImage, model: &CameraModel) -> GrayImage {
    if model.distortion.is_zero() {
        return image.clone();
    }

    let (width, height) = image.dimensions();
    let (w, h) = (width as usize, height as usize);
    let src = image.as_raw();
    let mut dst = vec![0u8; w * h];

    if w > 0 {
        dst.par_chunks_mut(w).enumerate().for_each(|(v, row)| {
            for (u, out) in row.iter_mut().enumerate() {
                let (x, y) = model.distort_pixel(u as f64, v as f64);
                *out = bilinear_sample(src, w, h, x, y).unwrap_or(0);
            }
        });
    }

    GrayImage::from_raw(width, height, dst).unwrap_or_else(|| GrayImage::new(width, height))
}

/// Bilinear interpolation in a single-channel buffer; `None` outside
#[inline]
fn bilinear_sample(src: &[u8], width: usize, height: usize, x: f64, y: f64) -> Option<u8> {
    if !(x >= 0.0 && y >= 0.0 && x <= (width - 1) as f64 && y <= (height - 1) as f64) {
        return None;
    }

    let x0 = x.floor() as usize;
    let y0 = y.floor() as usize;
    let x1 = (x0 + 1).min(width - 1);
    let y1 = (y0 + 1).min(height - 1);

    let fx = x - x0 as f64;
    let fy = y - y0 as f64;

    let p00 = src[y0 * width + x0] as f64;
    let p10 = src[y0 * width + x1] as f64;
    let p01 = src[y1 * width + x0] as f64;
    let p11 = src[y1 * width + x1] as f64;

    let value = p00 * (1.0 - fx) * (1.0 - fy)
        + p10 * fx * (1.0 - fy)
        + p01 * (1.0 - fx) * fy
        + p11 * fx * fy;

    Some(value.round().clamp(0.0, 255.0) as u8)
}

/// Ideal pixel position of a point observed at `p` in the raw frame
pub fn undistort_point(p: &Point2<f64>, model: &CameraModel) -> Point2<f64> {
    if model.distortion.is_zero() {
        return *p;
    }

    let d = &model.distortion;
    let (xd, yd) = model.intrinsics.normalize(p.x, p.y);
    let (mut x, mut y) = (xd, yd);
    for _ in 0..UNDISTORT_ITERATIONS {
        let r2 = x * x + y * y;
        let radial = 1.0 + d.k1 * r2 + d.k2 * r2 * r2 + d.k3 * r2 * r2 * r2;
        let dx = 2.0 * d.p1 * x * y + d.p2 * (r2 + 2.0 * x * x);
        let dy = d.p1 * (r2 + 2.0 * y * y) + 2.0 * d.p2 * x * y;
        x = (xd - dx) / radial;
        y = (yd - dy) / radial;
    }

    let (u, v) = model.intrinsics.denormalize(x, y);
    Point2::new(u, v)
}

/// Undistort a whole keypoint set, preserving order
pub fn undistort_points(points: &[Point2<f64>], model: &CameraModel) -> Vec<Point2<f64>> {
    points.iter().map(|p| undistort_point(p, model)).collect()
}
