//! Planar perspective transformation (homography)
//!
//! This module estimates the 3x3 projective mapping between two planes from
//! point correspondences and applies it in both directions. The pipeline uses
//! it for the wall -> projector-image mapping.

use nalgebra::{DMatrix, Matrix2, Matrix3, Point2, Vector3};

use crate::error::{KeystoneError, Result};

/// Relative determinant below which a homography counts as singular
const SINGULAR_EPS: f64 = 1e-12;

/// Homogeneous weight below which a mapped point is at infinity
const W_EPS: f64 = 1e-12;

/// Perspective transformation matrix (3x3 homography)
#[derive(Debug, Clone, PartialEq)]
pub struct Homography {
    /// Forward mapping, normalized so that `h33 == 1` when possible
    matrix: Matrix3<f64>,
    /// Inverse matrix for reverse mapping
    inverse: Matrix3<f64>,
}

impl Homography {
    /// Wrap an existing matrix, rejecting singular ones
    pub fn from_matrix(matrix: Matrix3<f64>) -> Result<Self> {
        let scale = matrix.norm();
        if !scale.is_finite()
            || scale <= 0.0
            || matrix.determinant().abs() <= SINGULAR_EPS * scale.powi(3)
        {
            return Err(KeystoneError::Singular("homography"));
        }
        let inverse = matrix
            .try_inverse()
            .ok_or(KeystoneError::Singular("homography"))?;
        Ok(Self { matrix, inverse })
    }

    /// Estimate `H` with `dst ~ H * src` from N >= 4 correspondences.
    ///
    /// Normalized Direct Linear Transform: both point sets are shifted to zero
    /// mean and scaled to an average distance of sqrt(2), `A h = 0` is solved
    /// through the SVD of the design matrix, and the result is de-normalized.
    pub fn estimate(src: &[Point2<f64>], dst: &[Point2<f64>]) -> Result<Self> {
        let n = src.len();
        if n != dst.len() {
            return Err(KeystoneError::KeypointMismatch {
                left: n,
                right: dst.len(),
            });
        }
        if n < 4 {
            return Err(KeystoneError::TooFewKeypoints {
                stage: "homography",
                needed: 4,
                got: n,
            });
        }

        let (src_n, t_src) = normalize_points(src)?;
        let (dst_n, t_dst) = normalize_points(dst)?;

        // Two rows per correspondence, padded to 9x9 for exactly four points
        let rows = (2 * n).max(9);
        let mut a = DMatrix::<f64>::zeros(rows, 9);
        for (i, (s, d)) in src_n.iter().zip(dst_n.iter()).enumerate() {
            let (x, y) = (s.x, s.y);
            let (u, v) = (d.x, d.y);
            let r0 = 2 * i;
            let r1 = r0 + 1;

            a[(r0, 0)] = -x;
            a[(r0, 1)] = -y;
            a[(r0, 2)] = -1.0;
            a[(r0, 6)] = u * x;
            a[(r0, 7)] = u * y;
            a[(r0, 8)] = u;

            a[(r1, 3)] = -x;
            a[(r1, 4)] = -y;
            a[(r1, 5)] = -1.0;
            a[(r1, 6)] = v * x;
            a[(r1, 7)] = v * y;
            a[(r1, 8)] = v;
        }

        let svd = a.svd(false, true);
        let v_t = svd.v_t.ok_or(KeystoneError::Singular("homography design matrix"))?;
        // Singular values are not guaranteed to be sorted
        let smallest = svd
            .singular_values
            .iter()
            .enumerate()
            .min_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .ok_or(KeystoneError::Singular("homography design matrix"))?;
        let h = v_t.row(smallest);

        let h_n = Matrix3::new(h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], h[8]);
        let t_dst_inv = t_dst
            .try_inverse()
            .ok_or(KeystoneError::Singular("point normalization"))?;
        let mut matrix = t_dst_inv * h_n * t_src;

        let scale = matrix[(2, 2)];
        if scale.abs() > f64::EPSILON {
            matrix /= scale;
        }

        Self::from_matrix(matrix)
    }

    pub fn matrix(&self) -> &Matrix3<f64> {
        &self.matrix
    }

    /// The reverse mapping as its own transform
    pub fn inverted(&self) -> Homography {
        Homography {
            matrix: self.inverse,
            inverse: self.matrix,
        }
    }

    /// Transform a point from source to destination coordinates
    #[inline]
    pub fn transform_point(&self, p: &Point2<f64>) -> Result<Point2<f64>> {
        apply_homography(&self.matrix, p)
    }

    /// Transform a point from destination to source coordinates (inverse)
    #[inline]
    pub fn inverse_transform_point(&self, p: &Point2<f64>) -> Result<Point2<f64>> {
        apply_homography(&self.inverse, p)
    }

    /// Largest distance between mapped `src` and `dst`, in destination units
    pub fn max_reprojection_error(&self, src: &[Point2<f64>], dst: &[Point2<f64>]) -> Result<f64> {
        src.iter().zip(dst).try_fold(0.0f64, |worst, (s, d)| {
            let mapped = self.transform_point(s)?;
            Ok(worst.max((mapped - d).norm()))
        })
    }
}

/// Apply a homography matrix to a point
#[inline]
fn apply_homography(h: &Matrix3<f64>, p: &Point2<f64>) -> Result<Point2<f64>> {
    let q = h * Vector3::new(p.x, p.y, 1.0);
    if q.z.abs() < W_EPS {
        return Err(KeystoneError::Singular("projection (point maps to infinity)"));
    }
    Ok(Point2::new(q.x / q.z, q.y / q.z))
}

/// Hartley normalization: zero mean, average distance sqrt(2).
///
/// Fails on coincident or collinear points, for which no homography exists.
fn normalize_points(points: &[Point2<f64>]) -> Result<(Vec<Point2<f64>>, Matrix3<f64>)> {
    let n = points.len() as f64;
    let centroid = points
        .iter()
        .fold(nalgebra::Vector2::zeros(), |acc, p| acc + p.coords)
        / n;

    let mut cov = Matrix2::zeros();
    let mut mean_dist = 0.0;
    for p in points {
        let d = p.coords - centroid;
        cov += d * d.transpose();
        mean_dist += d.norm();
    }
    mean_dist /= n;

    let trace = cov.trace();
    if mean_dist <= f64::EPSILON || cov.determinant() <= 1e-12 * trace * trace {
        return Err(KeystoneError::CollinearKeypoints {
            stage: "homography",
        });
    }

    let scale = std::f64::consts::SQRT_2 / mean_dist;
    let t = Matrix3::new(
        scale,
        0.0,
        -scale * centroid.x,
        0.0,
        scale,
        -scale * centroid.y,
        0.0,
        0.0,
        1.0,
    );
    let normalized = points
        .iter()
        .map(|p| Point2::from((p.coords - centroid) * scale))
        .collect();

    Ok((normalized, t))
}
