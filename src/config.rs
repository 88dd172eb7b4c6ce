use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

/// Everything the batch driver needs to know up front.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConverterConfig {
    /// Root holding one `scene_{id:05}/run_00` directory per episode.
    pub input_root: PathBuf,
    /// Directory receiving `episode_{id}.hdf5`.
    pub output_root: PathBuf,
    /// Extension of record files inside an episode directory (default: "pkl").
    pub record_extension: String,
    /// Episodes converted concurrently; 0 or 1 converts sequentially.
    pub jobs: usize,
    /// Reject episodes whose shapes disagree with `task`.
    pub strict: bool,
    pub task: TaskConfig,
}

/// Declared geometry of the task the episodes were recorded for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    /// Expected timesteps per episode (default: 360).
    pub episode_len: usize,
    /// Width of qpos/qvel (default: 6).
    pub state_dim: usize,
    /// Width of action (default: 6).
    pub action_dim: usize,
    pub cam_height: usize,
    pub cam_width: usize,
    pub cam_channels: usize,
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            input_root: PathBuf::from("dataset/output/data"),
            output_root: PathBuf::from("dataset/output/hdf5/task1"),
            record_extension: "pkl".to_string(),
            jobs: 1,
            strict: false,
            task: TaskConfig::default(),
        }
    }
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            episode_len: 360,
            state_dim: 6,
            action_dim: 6,
            cam_height: 480,
            cam_width: 640,
            cam_channels: 3,
        }
    }
}

impl ConverterConfig {
    /// Loads a JSON config; keys left out keep their defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("failed to open config {}", path.display()))?;
        serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("failed to parse config {}", path.display()))
    }

    pub fn input_dir(&self, episode_id: u32) -> PathBuf {
        self.input_root
            .join(format!("scene_{:05}", episode_id))
            .join("run_00")
    }

    pub fn output_file(&self, episode_id: u32) -> PathBuf {
        self.output_root.join(format!("episode_{}.hdf5", episode_id))
    }
}
