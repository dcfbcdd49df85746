//! Keypoint sources
//!
//! The pipeline needs two ordered, index-matched keypoint sets: where each
//! pattern feature was drawn in projector pixels, and where the camera saw
//! it. Detection itself is pluggable; files hold `[[x, y], ...]` arrays.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use image::GrayImage;
use nalgebra::Point2;

use crate::error::KeystoneError;

/// Finds the test-pattern features in a captured frame
pub trait KeypointDetector {
    /// Camera-pixel keypoints, in the same order as the projector pattern
    fn detect(&mut self, image: &GrayImage) -> crate::error::Result<Vec<Point2<f64>>>;
}

/// Detector returning a fixed set, for replaying recorded captures
#[derive(Debug, Clone, Default)]
pub struct StaticDetector {
    points: Vec<Point2<f64>>,
}

impl StaticDetector {
    pub fn new(points: Vec<Point2<f64>>) -> Self {
        Self { points }
    }
}

impl KeypointDetector for StaticDetector {
    fn detect(&mut self, _image: &GrayImage) -> crate::error::Result<Vec<Point2<f64>>> {
        if self.points.is_empty() {
            return Err(KeystoneError::Detection("no keypoints recorded".to_string()));
        }
        Ok(self.points.clone())
    }
}

/// Read keypoints from a JSON file of `[x, y]` pairs
pub fn load_keypoints(path: &Path) -> Result<Vec<Point2<f64>>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read keypoints: {}", path.display()))?;
    parse_keypoints(&content)
        .with_context(|| format!("Failed to parse keypoints: {}", path.display()))
}

fn parse_keypoints(content: &str) -> Result<Vec<Point2<f64>>> {
    let pairs: Vec<[f64; 2]> = serde_json::from_str(content)?;
    if let Some(bad) = pairs.iter().find(|[x, y]| !(x.is_finite() && y.is_finite())) {
        anyhow::bail!("keypoint {:?} is not finite", bad);
    }
    Ok(pairs.into_iter().map(|[x, y]| Point2::new(x, y)).collect())
}

/// Write keypoints in the same format `load_keypoints` reads
pub fn save_keypoints(path: &Path, points: &[Point2<f64>]) -> Result<()> {
    let pairs: Vec<[f64; 2]> = points.iter().map(|p| [p.x, p.y]).collect();
    let content = serde_json::to_string_pretty(&pairs)?;
    fs::write(path, content)
        .with_context(|| format!("Failed to write keypoints: {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_keypoints() {
        let points = parse_keypoints("[[1.5, 2.0], [300, 400.25]]").unwrap();
        assert_eq!(points, vec![Point2::new(1.5, 2.0), Point2::new(300.0, 400.25)]);
        assert!(parse_keypoints("[[1.0]]").is_err());
        assert!(parse_keypoints("{\"x\": 1}").is_err());
    }

    #[test]
    fn test_keypoint_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("camera.json");
        let points = vec![Point2::new(10.0, 20.0), Point2::new(-3.25, 7.5)];
        save_keypoints(&path, &points).unwrap();
        assert_eq!(load_keypoints(&path).unwrap(), points);
        assert!(load_keypoints(&dir.path().join("missing.json")).is_err());
    }

    #[test]
    fn test_static_detector() {
        let image = GrayImage::new(4, 4);
        let mut empty = StaticDetector::default();
        assert!(matches!(
            empty.detect(&image),
            Err(KeystoneError::Detection(_))
        ));
        let mut detector = StaticDetector::new(vec![Point2::new(1.0, 2.0)]);
        assert_eq!(detector.detect(&image).unwrap().len(), 1);
    }
}
