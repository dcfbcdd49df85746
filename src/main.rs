//! Keystone - compute projector keystone offsets from a captured pattern
//!
//! Reads matched projector/camera keypoints and an accelerometer reading,
//! runs the correction pipeline and prints the pixel offset of each projector
//! corner.

use anyhow::{Context, Result};
use clap::Parser;
use nalgebra::{Point2, Point3, Vector3};
use std::path::PathBuf;
use tracing::{debug, info, Level};
use tracing_subscriber::FmtSubscriber;

use keystone::backproject::BackProjection;
use keystone::config::Config;
use keystone::geometry::Plane;
use keystone::inscribed::{InscribedRectangle, Quadrilateral};
use keystone::keypoints::{load_keypoints, save_keypoints};
use keystone::undistort::undistort_points;
use keystone::{compute_correction, Corner, FitMode, PipelineObserver};

/// Keystone - projector keystone correction from a camera capture
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "keystone.toml")]
    config: PathBuf,

    /// Pattern keypoints in projector pixels (JSON [[x, y], ...])
    #[arg(long)]
    projector_points: PathBuf,

    /// Matching keypoints in camera pixels (JSON [[x, y], ...])
    #[arg(long)]
    camera_points: PathBuf,

    /// Camera keypoints were taken from the raw (distorted) frame
    #[arg(long)]
    raw_camera_points: bool,

    /// Write the camera keypoints the pipeline used (after undistortion)
    #[arg(long)]
    save_camera_points: Option<PathBuf>,

    /// Current accelerometer reading, projector frame
    #[arg(short, long, value_parser = parse_vector, allow_hyphen_values = true)]
    gravity: Vector3<f64>,

    /// Override the fit mode from the config (biggest or sharpest)
    #[arg(short, long)]
    mode: Option<FitMode>,

    /// Write the full result as JSON
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn parse_vector(s: &str) -> std::result::Result<Vector3<f64>, String> {
    let parts = s
        .split(',')
        .map(|p| p.trim().parse::<f64>().map_err(|e| format!("'{}': {}", p.trim(), e)))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    match parts.as_slice() {
        [x, y, z] => Ok(Vector3::new(*x, *y, *z)),
        _ => Err(format!("expected x,y,z, got {} components", parts.len())),
    }
}

/// Logs every pipeline stage at debug level
struct TracingObserver;

impl PipelineObserver for TracingObserver {
    fn on_world_points(&mut self, points: &[Point3<f64>]) {
        debug!("{} keypoints in the world frame", points.len());
    }

    fn on_plane(&mut self, plane: &Plane) {
        debug!("Wall plane: z = {:.6}x + {:.6}y + {:.3}", plane.a, plane.b, plane.c);
    }

    fn on_wall_keypoints(&mut self, points: &[Point2<f64>]) {
        debug!("{} keypoints on the wall", points.len());
    }

    fn on_screen_quadrilateral(&mut self, quad: &Quadrilateral) {
        for (corner, p) in Corner::ALL.iter().zip(quad.corners()) {
            debug!("Projected frame {}: ({:.2}, {:.2})", corner.label(), p.x, p.y);
        }
    }

    fn on_inscribed(&mut self, inscribed: &InscribedRectangle) {
        debug!(
            "Inscribed rectangle {:.2} x {:.2} ({:?})",
            inscribed.width(),
            inscribed.height(),
            inscribed.classification.case
        );
    }

    fn on_back_projection(&mut self, projection: &BackProjection) {
        debug!(
            "Corrected corners {:?} after {} shrink steps",
            projection.pixels, projection.iterations
        );
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let _subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .init();

    info!("Keystone v{}", env!("CARGO_PKG_VERSION"));

    // Load or create configuration
    let mut config = Config::load_or_create(&args.config)?;
    if let Some(mode) = args.mode {
        config.correction.mode = mode;
    }
    let calibration = config
        .calibration()
        .with_context(|| format!("Invalid calibration in {:?}", args.config))?;

    let projector_points = load_keypoints(&args.projector_points)?;
    let mut camera_points = load_keypoints(&args.camera_points)?;
    if args.raw_camera_points {
        camera_points = undistort_points(&camera_points, &calibration.camera);
    }
    if let Some(path) = &args.save_camera_points {
        save_keypoints(path, &camera_points)?;
        info!("Wrote camera keypoints to {:?}", path);
    }
    info!(
        "{} projector / {} camera keypoints, gravity ({:.3}, {:.3}, {:.3}), mode {}",
        projector_points.len(),
        camera_points.len(),
        args.gravity.x,
        args.gravity.y,
        args.gravity.z,
        calibration.mode.as_str()
    );

    let result = compute_correction(
        &calibration,
        &projector_points,
        &camera_points,
        &args.gravity,
        &mut TracingObserver,
    )
    .context("Keystone correction failed")?;

    for (corner, [dx, dy]) in Corner::ALL.iter().zip(result.offsets) {
        println!("{:<13} {:>6} {:>6}", corner.label(), dx, dy);
    }

    let t = result.pose.wall_in_projector.translation.vector;
    let [roll, pitch, yaw] = result.pose.roll_pitch_yaw_degrees();
    println!(
        "Wall at ({:.1}, {:.1}, {:.1}), distance {:.1}, roll {:.2} pitch {:.2} yaw {:.2}",
        t.x,
        t.y,
        t.z,
        result.pose.distance(),
        roll,
        pitch,
        yaw
    );

    if let Some(path) = &args.output {
        let json = serde_json::to_string_pretty(&result).context("Failed to serialize result")?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write result to {:?}", path))?;
        info!("Wrote result to {:?}", path);
    }

    Ok(())
}
