use std::path::{Path, PathBuf};

use rand::{Rng, SeedableRng, rngs::StdRng};

use crate::{
    device,
    error::{Result, ServerErr},
    settings::Settings,
};

/// Number of seed points used to bootstrap a fresh model when no
/// initialized model exists at dataset load time.
const SEED_POINTS: usize = 2048;

/// A loaded training dataset.
///
/// Ingestion itself is an external collaborator; this handle carries
/// what the training loop needs: the camera count to cycle through and
/// the seed point cloud a fresh model is bootstrapped from.
#[derive(Debug)]
pub struct Dataset {
    pub path: PathBuf,
    pub num_cameras: usize,
    pub extent: f32,
    seed_points: Vec<[f32; 3]>,
    seed_colors: Vec<[f32; 3]>,
}

impl Dataset {
    /// Validates and loads the dataset described by `settings`.
    ///
    /// Validation is probe-before-commit: the path and the data device
    /// are checked before any state is built, so a failure here leaves
    /// nothing to roll back.
    ///
    /// # Returns
    /// `DatasetPath` if the path does not exist, `DeviceUnavailable`
    /// if the data device cannot be probed.
    pub fn load(settings: &Settings) -> Result<Self> {
        device::probe(&settings.data_device)?;

        let path = Path::new(&settings.dataset_path);
        if !path.exists() {
            return Err(ServerErr::DatasetPath {
                path: settings.dataset_path.clone(),
            });
        }

        let num_cameras = std::fs::read_dir(path)
            .map(|entries| entries.count().max(1))
            .unwrap_or(1);

        // Deterministic per-path seed cloud so reloading the same
        // dataset bootstraps the same model.
        let seed = settings
            .dataset_path
            .bytes()
            .fold(0u64, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u64));
        let mut rng = StdRng::seed_from_u64(seed);

        let extent = 1.0;
        let mut seed_points = Vec::with_capacity(SEED_POINTS);
        let mut seed_colors = Vec::with_capacity(SEED_POINTS);
        for _ in 0..SEED_POINTS {
            seed_points.push([
                rng.random_range(-extent..extent),
                rng.random_range(-extent..extent),
                rng.random_range(-extent..extent),
            ]);
            seed_colors.push([rng.random(), rng.random(), rng.random()]);
        }

        Ok(Self {
            path: path.to_path_buf(),
            num_cameras,
            extent,
            seed_points,
            seed_colors,
        })
    }

    pub fn seed_points(&self) -> &[[f32; 3]] {
        &self.seed_points
    }

    pub fn seed_colors(&self) -> &[[f32; 3]] {
        &self.seed_colors
    }
}
