//! Configuration management for keystone

use anyhow::{Context, Result};
use nalgebra::{Matrix3, Rotation3, Vector3};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::backproject::ShrinkPolicy;
use crate::calibration::{
    CameraModel, Calibration, Distortion, Extrinsics, Intrinsics, Resolution,
};
use crate::inscribed::FitMode;

/// Projector optics and native resolution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectorConfig {
    pub width: u32,
    pub height: u32,
    pub intrinsics: Intrinsics,
    #[serde(default)]
    pub distortion: Distortion,
}

impl Default for ProjectorConfig {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            intrinsics: Intrinsics::new(2283.82693, 2288.05040, 989.334268, 1079.39241),
            distortion: Distortion::new(
                0.03103913,
                0.02877732,
                -0.00038886,
                0.00115072,
                -0.31241419,
            ),
        }
    }
}

/// Camera optics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    pub intrinsics: Intrinsics,
    #[serde(default)]
    pub distortion: Distortion,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            intrinsics: Intrinsics::new(600.32380483, 600.39865037, 323.20302011, 202.07122001),
            distortion: Distortion::new(
                0.248974585,
                -1.49624210,
                -4.27611936e-4,
                5.42105284e-3,
                1.84425912,
            ),
        }
    }
}

/// Camera pose in the projector frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtrinsicsConfig {
    /// Row-major 3x3 rotation
    pub rotation: [[f64; 3]; 3],
    pub translation: [f64; 3],
}

impl Default for ExtrinsicsConfig {
    fn default() -> Self {
        Self {
            rotation: [
                [0.99970737, -0.00727533, 0.02307026],
                [0.01073077, 0.98810691, -0.15339354],
                [-0.0216799, 0.15359621, 0.98789584],
            ],
            translation: [-68.82968479, 0.40231569, 7.98265215],
        }
    }
}

/// Accelerometer reading taken while the projector stood level
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GravityConfig {
    pub reference: [f64; 3],
}

impl Default for GravityConfig {
    fn default() -> Self {
        Self {
            reference: [2.5, 7.0, 0.45],
        }
    }
}

/// How the corrected image is chosen
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrectionConfig {
    #[serde(default)]
    pub mode: FitMode,
    #[serde(default = "default_shrink_factor")]
    pub shrink_factor: f64,
    #[serde(default = "default_max_shrink_iterations")]
    pub max_shrink_iterations: usize,
}

fn default_shrink_factor() -> f64 {
    ShrinkPolicy::default().factor
}

fn default_max_shrink_iterations() -> usize {
    ShrinkPolicy::default().max_iterations
}

impl Default for CorrectionConfig {
    fn default() -> Self {
        Self {
            mode: FitMode::default(),
            shrink_factor: default_shrink_factor(),
            max_shrink_iterations: default_max_shrink_iterations(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub projector: ProjectorConfig,

    #[serde(default)]
    pub camera: CameraConfig,

    #[serde(default)]
    pub extrinsics: ExtrinsicsConfig,

    #[serde(default)]
    pub gravity: GravityConfig,

    #[serde(default)]
    pub correction: CorrectionConfig,
}

impl Config {
    /// Load configuration from a file, or create default if it doesn't exist
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {:?}", path))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config from {:?}", path))?;
            tracing::info!("Loaded configuration from {:?}", path);
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path)?;
            tracing::info!("Created default configuration at {:?}", path);
            Ok(config)
        }
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .context("Failed to serialize configuration")?;

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory {:?}", parent))?;
        }

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        tracing::info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Validated calibration constants for a correction session
    pub fn calibration(&self) -> crate::error::Result<Calibration> {
        let r = &self.extrinsics.rotation;
        let rotation = Matrix3::new(
            r[0][0], r[0][1], r[0][2],
            r[1][0], r[1][1], r[1][2],
            r[2][0], r[2][1], r[2][2],
        );

        let calibration = Calibration {
            projector: CameraModel {
                intrinsics: self.projector.intrinsics,
                distortion: self.projector.distortion,
            },
            resolution: Resolution::new(self.projector.width, self.projector.height),
            camera: CameraModel {
                intrinsics: self.camera.intrinsics,
                distortion: self.camera.distortion,
            },
            camera_in_projector: Extrinsics {
                rotation: Rotation3::from_matrix_unchecked(rotation),
                translation: Vector3::from(self.extrinsics.translation),
            },
            reference_gravity: Vector3::from(self.gravity.reference),
            mode: self.correction.mode,
            shrink: ShrinkPolicy {
                factor: self.correction.shrink_factor,
                max_iterations: self.correction.max_shrink_iterations,
            },
        };
        calibration.validate()?;
        Ok(calibration)
    }
}
