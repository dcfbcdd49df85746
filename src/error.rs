//! Error types for the correction pipeline
//!
//! Every failure is terminal for the current run. The variants are grouped
//! into five broad kinds so callers can decide whether re-capturing makes sense.

use thiserror::Error;

/// Broad classification of pipeline failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Too few or degenerate keypoints, bad calibration input
    Input,
    /// A rotation between two vectors is undefined
    DegenerateRotation,
    /// The wall quadrilateral fits none of the inscribed-rectangle cases
    GeometryClassification,
    /// The boundary shrink loop ran out of iterations
    Convergence,
    /// Non-invertible matrix or rank-deficient system
    NumericSingularity,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum KeystoneError {
    #[error("{stage}: need at least {needed} keypoints, got {got}")]
    TooFewKeypoints {
        stage: &'static str,
        needed: usize,
        got: usize,
    },

    #[error("keypoint sets differ in length: {left} vs {right}")]
    KeypointMismatch { left: usize, right: usize },

    #[error("{stage}: keypoints are collinear")]
    CollinearKeypoints { stage: &'static str },

    #[error("keypoint detection failed: {0}")]
    Detection(String),

    #[error("invalid calibration: {0}")]
    InvalidCalibration(String),

    #[error("degenerate rotation: {0}")]
    DegenerateRotation(&'static str),

    #[error("quadrilateral is not convex")]
    NonConvexQuadrilateral,

    #[error("quadrilateral matches no inscribed-rectangle case")]
    UnclassifiedQuadrilateral,

    #[error("display area did not fit the projector after {iterations} shrink steps")]
    ShrinkDidNotConverge { iterations: usize },

    #[error("singular {0}")]
    Singular(&'static str),
}

impl KeystoneError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            KeystoneError::TooFewKeypoints { .. }
            | KeystoneError::KeypointMismatch { .. }
            | KeystoneError::CollinearKeypoints { .. }
            | KeystoneError::Detection(_)
            | KeystoneError::InvalidCalibration(_) => ErrorKind::Input,
            KeystoneError::DegenerateRotation(_) => ErrorKind::DegenerateRotation,
            KeystoneError::NonConvexQuadrilateral | KeystoneError::UnclassifiedQuadrilateral => {
                ErrorKind::GeometryClassification
            }
            KeystoneError::ShrinkDidNotConverge { .. } => ErrorKind::Convergence,
            KeystoneError::Singular(_) => ErrorKind::NumericSingularity,
        }
    }
}

pub type Result<T> = std::result::Result<T, KeystoneError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        let err = KeystoneError::TooFewKeypoints {
            stage: "homography",
            needed: 4,
            got: 3,
        };
        assert_eq!(err.kind(), ErrorKind::Input);
        assert_eq!(
            err.to_string(),
            "homography: need at least 4 keypoints, got 3"
        );
        assert_eq!(
            KeystoneError::ShrinkDidNotConverge { iterations: 5 }.kind(),
            ErrorKind::Convergence
        );
        assert_eq!(
            KeystoneError::Singular("homography").kind(),
            ErrorKind::NumericSingularity
        );
    }
}
