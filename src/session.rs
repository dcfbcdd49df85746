//! Correction pipeline and session state
//!
//! [`compute_correction`] is the whole pipeline as a pure function of the
//! calibration and one capture. [`CorrectionSession`] wraps it with the
//! current inputs and the last good result, and only replaces them once a
//! run has fully succeeded.

use image::GrayImage;
use nalgebra::{Point2, Point3, Rotation3, Vector3};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::backproject::{back_project_and_clamp, BackProjection};
use crate::calibration::Calibration;
use crate::error::{KeystoneError, Result};
use crate::frames::{
    estimate_wall_to_projector, fit_plane, projector_to_world, screen_corners_to_wall,
    world_to_wall,
};
use crate::geometry::Plane;
use crate::inscribed::{inscribe, InscribedRectangle, Quadrilateral};
use crate::keypoints::KeypointDetector;
use crate::pose::WallPose;
use crate::triangulation::StereoRig;
use crate::undistort::undistort_image;

/// Fewest correspondences a homography can be estimated from
const MIN_KEYPOINTS: usize = 4;

/// Receives intermediate values of a run; none of them affect the result
pub trait PipelineObserver {
    fn on_world_points(&mut self, _points: &[Point3<f64>]) {}
    fn on_plane(&mut self, _plane: &Plane) {}
    fn on_wall_keypoints(&mut self, _points: &[Point2<f64>]) {}
    fn on_screen_quadrilateral(&mut self, _quad: &Quadrilateral) {}
    fn on_inscribed(&mut self, _inscribed: &InscribedRectangle) {}
    fn on_back_projection(&mut self, _projection: &BackProjection) {}
}

/// Observer that ignores everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl PipelineObserver for NoopObserver {}

/// Everything one successful run produces
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectionResult {
    /// Per-corner pixel offsets, top-left, top-right, bottom-right, bottom-left
    pub offsets: [[i32; 2]; 4],
    /// Corrected corners in projector pixels, same order
    pub corners: [[i32; 2]; 4],
    /// Fitted wall plane in the world frame
    pub plane: Plane,
    /// Projector frame on the wall
    pub screen: Quadrilateral,
    /// Inscribed rectangle on the wall, before shrinking
    pub inscribed: InscribedRectangle,
    /// Final wall rectangle after fitting inside the projector frame
    pub display: Quadrilateral,
    /// Wall relative to the projector
    pub pose: WallPose,
    /// Rotation taking projector coordinates to the gravity-aligned world
    pub attitude: Rotation3<f64>,
    /// Worst keypoint reprojection error of the wall homography, in pixels
    pub reprojection_error: f64,
}

/// Run the full pipeline on one set of matched keypoints
pub fn compute_correction(
    calibration: &Calibration,
    projector_keypoints: &[Point2<f64>],
    camera_keypoints: &[Point2<f64>],
    gravity: &Vector3<f64>,
    observer: &mut dyn PipelineObserver,
) -> Result<CorrectionResult> {
    if projector_keypoints.len() != camera_keypoints.len() {
        return Err(KeystoneError::KeypointMismatch {
            left: projector_keypoints.len(),
            right: camera_keypoints.len(),
        });
    }
    if projector_keypoints.len() < MIN_KEYPOINTS {
        return Err(KeystoneError::TooFewKeypoints {
            stage: "detection",
            needed: MIN_KEYPOINTS,
            got: projector_keypoints.len(),
        });
    }

    let rig = StereoRig::new(
        &calibration.projector.intrinsics,
        &calibration.camera.intrinsics,
        &calibration.camera_in_projector,
    );
    let points = rig.triangulate(projector_keypoints, camera_keypoints)?;

    let (attitude, world) = projector_to_world(&points, gravity, &calibration.reference_gravity)?;
    observer.on_world_points(&world);

    let plane = fit_plane(&world)?;
    observer.on_plane(&plane);

    let wall = world_to_wall(&world, &plane)?;
    observer.on_wall_keypoints(&wall);

    let h = estimate_wall_to_projector(&wall, projector_keypoints)?;
    let reprojection_error = h.max_reprojection_error(&wall, projector_keypoints)?;
    debug!("Wall homography reprojection error: {:.3} px", reprojection_error);

    let screen = screen_corners_to_wall(&h, &calibration.resolution)?;
    observer.on_screen_quadrilateral(&screen);

    let inscribed = inscribe(&screen, calibration.resolution.aspect_ratio(), calibration.mode)?;
    observer.on_inscribed(&inscribed);

    let projection = back_project_and_clamp(
        &inscribed.rect,
        &h,
        &calibration.resolution,
        &calibration.shrink,
    )?;
    observer.on_back_projection(&projection);

    let pose = WallPose::from_homography(&calibration.projector.intrinsics, &h)?;

    Ok(CorrectionResult {
        offsets: projection.offsets,
        corners: projection.pixels,
        plane,
        screen,
        inscribed,
        display: projection.rect,
        pose,
        attitude,
        reprojection_error,
    })
}

/// Where a session stands
#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    /// No run attempted yet
    Uninitialized,
    /// Last successful result
    Ready(CorrectionResult),
    /// Every run so far has failed; holds the latest error
    Failed(KeystoneError),
}

/// The inputs a published result was computed from
#[derive(Debug, Clone)]
struct Capture {
    /// Undistorted camera frame
    image: GrayImage,
    gravity: Vector3<f64>,
    keypoints: Vec<Point2<f64>>,
}

/// Long-lived correction state for one projector/camera pair
pub struct CorrectionSession<D: KeypointDetector> {
    calibration: Calibration,
    detector: D,
    observer: Box<dyn PipelineObserver + Send>,
    projector_keypoints: Vec<Point2<f64>>,
    /// Inputs awaiting `correct()`
    pending: Option<(GrayImage, Vector3<f64>)>,
    capture: Option<Capture>,
    state: SessionState,
}

impl<D: KeypointDetector> CorrectionSession<D> {
    /// Prepare a session without running it.
    ///
    /// The projector pattern is undistorted and its keypoints detected once;
    /// `image` is the first camera capture and `gravity` its accelerometer
    /// reading.
    pub fn new(
        calibration: Calibration,
        mut detector: D,
        pattern: &GrayImage,
        image: &GrayImage,
        gravity: Vector3<f64>,
    ) -> Result<Self> {
        calibration.validate()?;

        let pattern = undistort_image(pattern, &calibration.projector);
        let projector_keypoints = detector.detect(&pattern)?;
        if projector_keypoints.len() < MIN_KEYPOINTS {
            return Err(KeystoneError::TooFewKeypoints {
                stage: "pattern detection",
                needed: MIN_KEYPOINTS,
                got: projector_keypoints.len(),
            });
        }
        debug!("Projector pattern: {} keypoints", projector_keypoints.len());

        let image = undistort_image(image, &calibration.camera);
        Ok(Self {
            calibration,
            detector,
            observer: Box::new(NoopObserver),
            projector_keypoints,
            pending: Some((image, gravity)),
            capture: None,
            state: SessionState::Uninitialized,
        })
    }

    /// Prepare a session and run the first correction
    pub fn open(
        calibration: Calibration,
        detector: D,
        pattern: &GrayImage,
        image: &GrayImage,
        gravity: Vector3<f64>,
    ) -> Result<Self> {
        let mut session = Self::new(calibration, detector, pattern, image, gravity)?;
        session.correct()?;
        Ok(session)
    }

    pub fn with_observer(mut self, observer: impl PipelineObserver + Send + 'static) -> Self {
        self.observer = Box::new(observer);
        self
    }

    pub fn calibration(&self) -> &Calibration {
        &self.calibration
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Last successful result, if any
    pub fn result(&self) -> Option<&CorrectionResult> {
        match &self.state {
            SessionState::Ready(result) => Some(result),
            _ => None,
        }
    }

    /// Gravity reading behind the published result
    pub fn gravity(&self) -> Option<&Vector3<f64>> {
        self.capture.as_ref().map(|c| &c.gravity)
    }

    /// Undistorted frame behind the published result
    pub fn image(&self) -> Option<&GrayImage> {
        self.capture.as_ref().map(|c| &c.image)
    }

    /// Camera keypoints behind the published result
    pub fn camera_keypoints(&self) -> Option<&[Point2<f64>]> {
        self.capture.as_ref().map(|c| c.keypoints.as_slice())
    }

    pub fn projector_keypoints(&self) -> &[Point2<f64>] {
        &self.projector_keypoints
    }

    /// Run the pipeline on the current capture
    pub fn correct(&mut self) -> Result<CorrectionResult> {
        let (image, gravity) = match (&self.pending, &self.capture) {
            (Some((image, gravity)), _) => (image.clone(), *gravity),
            (None, Some(capture)) => (capture.image.clone(), capture.gravity),
            (None, None) => {
                return Err(KeystoneError::Detection("no capture to correct".to_string()))
            }
        };
        self.run(image, gravity)
    }

    /// Replace the capture with a new frame and gravity reading, then rerun
    pub fn update(&mut self, image: &GrayImage, gravity: Vector3<f64>) -> Result<CorrectionResult> {
        let image = undistort_image(image, &self.calibration.camera);
        self.run(image, gravity)
    }

    fn run(&mut self, image: GrayImage, gravity: Vector3<f64>) -> Result<CorrectionResult> {
        let outcome = self.detector.detect(&image).and_then(|keypoints| {
            let result = compute_correction(
                &self.calibration,
                &self.projector_keypoints,
                &keypoints,
                &gravity,
                self.observer.as_mut(),
            )?;
            Ok((keypoints, result))
        });

        match outcome {
            Ok((keypoints, result)) => {
                info!("Keystone offsets: {:?}", result.offsets);
                self.pending = None;
                self.capture = Some(Capture {
                    image,
                    gravity,
                    keypoints,
                });
                self.state = SessionState::Ready(result.clone());
                Ok(result)
            }
            Err(e) => {
                warn!("Correction failed: {}", e);
                if !matches!(self.state, SessionState::Ready(_)) {
                    self.state = SessionState::Failed(e.clone());
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backproject::ShrinkPolicy;
    use crate::calibration::{CameraModel, Distortion, Extrinsics, Intrinsics, Resolution};
    use crate::error::ErrorKind;
    use crate::inscribed::FitMode;
    use nalgebra::Vector4;
    use std::sync::{Arc, Mutex};

    const PATTERN_WIDTH: u32 = 16;

    fn calibration() -> Calibration {
        Calibration {
            projector: CameraModel {
                intrinsics: Intrinsics::new(2283.82693, 2288.05040, 989.334268, 1079.39241),
                distortion: Distortion::default(),
            },
            resolution: Resolution::new(1920, 1080),
            camera: CameraModel {
                intrinsics: Intrinsics::new(600.32380483, 600.39865037, 323.20302011, 202.07122001),
                distortion: Distortion::new(0.25, -1.5, -4.3e-4, 5.4e-3, 1.8),
            },
            camera_in_projector: Extrinsics {
                rotation: Rotation3::from_euler_angles(0.154, -0.023, 0.011),
                translation: Vector3::new(-68.82968479, 0.40231569, 7.98265215),
            },
            reference_gravity: Vector3::new(2.5, 7.0, 0.45),
            mode: FitMode::Biggest,
            shrink: ShrinkPolicy::default(),
        }
    }

    /// Plane through `n . X = d` (projector frame), sampled at a pixel grid
    fn scene(
        cal: &Calibration,
        normal: Vector3<f64>,
        d: f64,
    ) -> (Vec<Point2<f64>>, Vec<Point2<f64>>) {
        let n = normal.normalize();
        let k_inv = cal.projector.intrinsics.matrix().try_inverse().unwrap();
        let rig = StereoRig::new(
            &cal.projector.intrinsics,
            &cal.camera.intrinsics,
            &cal.camera_in_projector,
        );

        let mut projector = Vec::new();
        let mut camera = Vec::new();
        for row in 0..4 {
            for col in 0..5 {
                let p = Point2::new(200.0 + 380.0 * col as f64, 150.0 + 250.0 * row as f64);
                let ray = k_inv * Vector3::new(p.x, p.y, 1.0);
                let x = ray * (d / n.dot(&ray));
                let c = rig.camera * Vector4::new(x.x, x.y, x.z, 1.0);
                projector.push(p);
                camera.push(Point2::new(c.x / c.z, c.y / c.z));
            }
        }
        (projector, camera)
    }

    fn tilted_wall() -> Vector3<f64> {
        Vector3::new(0.2, -0.1, 1.0)
    }

    fn measured_gravity() -> Vector3<f64> {
        Vector3::new(0.01, 9.8, 0.01)
    }

    /// Pattern frames are `PATTERN_WIDTH` wide, camera frames are not
    struct SceneDetector {
        projector: Vec<Point2<f64>>,
        camera: Arc<Mutex<Vec<Point2<f64>>>>,
    }

    impl KeypointDetector for SceneDetector {
        fn detect(&mut self, image: &GrayImage) -> Result<Vec<Point2<f64>>> {
            if image.width() == PATTERN_WIDTH {
                Ok(self.projector.clone())
            } else {
                Ok(self.camera.lock().unwrap().clone())
            }
        }
    }

    fn session(
        gravity: Vector3<f64>,
    ) -> (CorrectionSession<SceneDetector>, Arc<Mutex<Vec<Point2<f64>>>>) {
        let cal = calibration();
        let (projector, camera) = scene(&cal, tilted_wall(), 2000.0);
        let camera = Arc::new(Mutex::new(camera));
        let detector = SceneDetector {
            projector,
            camera: camera.clone(),
        };
        let pattern = GrayImage::new(PATTERN_WIDTH, 9);
        let image = GrayImage::new(8, 6);
        let session = CorrectionSession::new(cal, detector, &pattern, &image, gravity).unwrap();
        (session, camera)
    }

    #[test]
    fn test_compute_correction_on_synthetic_scene() {
        let cal = calibration();
        let (projector, camera) = scene(&cal, tilted_wall(), 2000.0);
        let result =
            compute_correction(&cal, &projector, &camera, &measured_gravity(), &mut NoopObserver)
                .unwrap();

        assert!(result.reprojection_error < 1e-3, "{}", result.reprojection_error);

        // Corners stay strictly inside the frame, offsets are relative to the
        // matching screen corner
        let screen = cal.resolution.screen_corners();
        for i in 0..4 {
            let [x, y] = result.corners[i];
            assert!(x >= 1 && x <= 1919 && y >= 1 && y <= 1079, "{:?}", result.corners);
            assert_eq!(result.offsets[i][0], x - screen[i].x as i32);
            assert_eq!(result.offsets[i][1], y - screen[i].y as i32);
        }

        // The display rectangle keeps the projector aspect ratio
        let (w, h) = result.display.extent();
        assert!((w / h - 16.0 / 9.0).abs() < 1e-9);

        // Wall pose: distance and normal of the synthetic plane
        let n = tilted_wall().normalize();
        assert!((result.pose.distance() - 2000.0).abs() < 1e-3, "{}", result.pose.distance());
        assert!((result.pose.normal().dot(&n).abs() - 1.0).abs() < 1e-9);

        // Attitude carries the measured gravity onto the reference
        let g = result.attitude * measured_gravity();
        assert!((g.normalize() - cal.reference_gravity.normalize()).norm() < 1e-9);
    }

    #[test]
    fn test_observer_sees_every_stage() {
        #[derive(Default)]
        struct Recorder {
            stages: Vec<&'static str>,
        }
        impl PipelineObserver for Recorder {
            fn on_world_points(&mut self, _: &[Point3<f64>]) {
                self.stages.push("world");
            }
            fn on_plane(&mut self, _: &Plane) {
                self.stages.push("plane");
            }
            fn on_wall_keypoints(&mut self, _: &[Point2<f64>]) {
                self.stages.push("wall");
            }
            fn on_screen_quadrilateral(&mut self, _: &Quadrilateral) {
                self.stages.push("screen");
            }
            fn on_inscribed(&mut self, _: &InscribedRectangle) {
                self.stages.push("inscribed");
            }
            fn on_back_projection(&mut self, _: &BackProjection) {
                self.stages.push("projection");
            }
        }

        let cal = calibration();
        let (projector, camera) = scene(&cal, tilted_wall(), 2000.0);
        let mut recorder = Recorder::default();
        let with = compute_correction(&cal, &projector, &camera, &measured_gravity(), &mut recorder)
            .unwrap();
        let without =
            compute_correction(&cal, &projector, &camera, &measured_gravity(), &mut NoopObserver)
                .unwrap();

        assert_eq!(
            recorder.stages,
            vec!["world", "plane", "wall", "screen", "inscribed", "projection"]
        );
        assert_eq!(with, without);
    }

    #[test]
    fn test_compute_correction_input_errors() {
        let cal = calibration();
        let (projector, camera) = scene(&cal, tilted_wall(), 2000.0);

        let gravity = measured_gravity();

        let err =
            compute_correction(&cal, &projector[..3], &camera[..3], &gravity, &mut NoopObserver)
                .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Input);

        let err = compute_correction(&cal, &projector, &camera[..5], &gravity, &mut NoopObserver)
            .unwrap_err();
        assert!(matches!(err, KeystoneError::KeypointMismatch { .. }));

        // A reading equal to the reference gives no rotation axis
        let reference = cal.reference_gravity;
        let err = compute_correction(&cal, &projector, &camera, &reference, &mut NoopObserver)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DegenerateRotation);
    }

    #[test]
    fn test_session_correct_then_update_is_idempotent() {
        let (mut session, _) = session(measured_gravity());
        assert_eq!(session.state(), &SessionState::Uninitialized);

        let first = session.correct().unwrap();
        let image = GrayImage::new(8, 6);
        let second = session.update(&image, measured_gravity()).unwrap();
        let third = session.update(&image, measured_gravity()).unwrap();

        assert_eq!(first.offsets, second.offsets);
        assert_eq!(second.offsets, third.offsets);
        for (a, b) in first.display.corners().iter().zip(third.display.corners()) {
            assert!((a - b).norm() < 1e-9);
        }
        assert_eq!(session.gravity(), Some(&measured_gravity()));
    }

    #[test]
    fn test_failed_update_keeps_last_result() {
        let (mut session, camera) = session(measured_gravity());
        let good = session.correct().unwrap();
        let image = GrayImage::new(8, 6);

        // Degenerate gravity
        let reference = session.calibration().reference_gravity;
        let err = session.update(&image, reference).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DegenerateRotation);
        assert_eq!(session.result(), Some(&good));
        assert_eq!(session.gravity(), Some(&measured_gravity()));

        // Detection finds too little
        let saved = camera.lock().unwrap().clone();
        camera.lock().unwrap().truncate(2);
        let err = session.update(&image, Vector3::new(0.5, 9.7, 0.2)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Input);
        assert_eq!(session.result(), Some(&good));
        assert_eq!(session.camera_keypoints(), Some(saved.as_slice()));

        // A later good capture is published
        camera.lock().unwrap().clone_from(&saved);
        let next = session.update(&image, Vector3::new(0.5, 9.7, 0.2)).unwrap();
        assert_eq!(session.result(), Some(&next));
        assert_eq!(session.gravity(), Some(&Vector3::new(0.5, 9.7, 0.2)));
    }

    #[test]
    fn test_first_failure_marks_session_failed() {
        let reference = calibration().reference_gravity;
        let (mut session, _) = session(reference * 2.0);
        assert!(session.correct().is_err());
        assert!(matches!(session.state(), SessionState::Failed(_)));
        assert!(session.result().is_none());

        // Recovers on a usable reading
        let image = GrayImage::new(8, 6);
        session.update(&image, measured_gravity()).unwrap();
        assert!(session.result().is_some());
    }
}
