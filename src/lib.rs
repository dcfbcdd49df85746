//! Keystone - automatic keystone correction for projectors
//!
//! A camera rigidly mounted next to the projector photographs a projected
//! test pattern. From the matched keypoints, the device's gravity reading and
//! the pair's calibration, the pipeline reconstructs the wall, finds the
//! largest level rectangle with the projector's aspect ratio inside the
//! projected area and reports how far each projector corner must move.

pub mod backproject;
pub mod calibration;
pub mod config;
pub mod error;
pub mod frames;
pub mod geometry;
pub mod inscribed;
pub mod keypoints;
pub mod pose;
pub mod session;
pub mod transform;
pub mod triangulation;
pub mod undistort;

pub use calibration::{Calibration, Corner};
pub use error::{ErrorKind, KeystoneError};
pub use inscribed::FitMode;
pub use session::{
    compute_correction, CorrectionResult, CorrectionSession, PipelineObserver, SessionState,
};
