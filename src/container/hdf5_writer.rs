use super::base_writer::BaseEpisodeWriter;
use super::layout::{ACTION, CAMERA, IMAGES, OBSERVATIONS, QPOS, QVEL, SIM_ATTR};
use crate::episode::Episode;
use crate::error::{ConvertError, WriteError};
use ndarray::Array2;
use std::fs;
use std::path::Path;
use tracing::debug;

/// Writes one HDF5 file per episode.
///
/// The image stream is chunked one frame per chunk so loaders can pull any
/// single timestep without touching its neighbours. The small numeric
/// datasets are stored contiguously.
///
/// A failure part way through leaves whatever was already written on disk.
#[derive(Debug, Clone, Copy, Default)]
pub struct Hdf5EpisodeWriter;

impl Hdf5EpisodeWriter {
    pub fn new() -> Self {
        Hdf5EpisodeWriter
    }
}

impl BaseEpisodeWriter for Hdf5EpisodeWriter {
    fn write(&self, episode: &Episode, path: &Path) -> Result<(), ConvertError> {
        write_container(episode, path).map_err(|source| ConvertError::WriteFailure {
            path: path.to_path_buf(),
            source,
        })
    }
}

fn write_container(episode: &Episode, path: &Path) -> Result<(), WriteError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = hdf5::File::create(path)?;
    file.new_attr::<bool>().create(SIM_ATTR)?.write_scalar(&true)?;

    let observations = file.create_group(OBSERVATIONS)?;
    observations
        .new_dataset_builder()
        .with_data(&storage_precision(&episode.qpos))
        .create(QPOS)?;
    observations
        .new_dataset_builder()
        .with_data(&storage_precision(&episode.qvel))
        .create(QVEL)?;

    let (height, width, channels) = episode.frame_shape();
    observations
        .create_group(IMAGES)?
        .new_dataset_builder()
        .with_data(&episode.images)
        .chunk((1, height, width, channels))
        .create(CAMERA)?;

    file.new_dataset_builder()
        .with_data(&storage_precision(&episode.action))
        .create(ACTION)?;

    file.close()?;
    debug!(path = %path.display(), timesteps = episode.len(), "container written");
    Ok(())
}

// Lossy on purpose: every numeric dataset is float32 on disk, whatever the
// producer pickled.
fn storage_precision(values: &Array2<f64>) -> Array2<f32> {
    values.mapv(|v| v as f32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::layout::{ACTION_PATH, CAMERA_PATH, QPOS_PATH, QVEL_PATH};
    use ndarray::{array, Array4};
    use tempfile::tempdir;

    fn episode(len: usize) -> Episode {
        let qpos = Array2::from_shape_fn((len, 3), |(t, j)| t as f64 + j as f64 * 0.1);
        let direction = Array2::from_shape_fn((len, 2), |(t, j)| -(t as f64) - j as f64);
        let action = ndarray::concatenate(ndarray::Axis(1), &[qpos.view(), direction.view()])
            .unwrap();
        Episode {
            qvel: qpos.mapv(|v| v * 0.5),
            qpos,
            action,
            images: Array4::from_shape_fn((len, 4, 6, 3), |(t, y, x, c)| {
                (t * 7 + y * 5 + x * 3 + c) as u8
            }),
        }
    }

    #[test]
    fn test_writer_layout_and_dtypes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("task1/episode_0.hdf5");
        let episode = episode(5);
        Hdf5EpisodeWriter::new().write(&episode, &path).unwrap();

        let file = hdf5::File::open(&path).unwrap();
        assert!(file.attr("sim").unwrap().read_scalar::<bool>().unwrap());
        assert_eq!(file.member_names().unwrap(), vec!["action", "observations"]);

        let qpos = file.dataset(QPOS_PATH).unwrap();
        assert!(qpos.dtype().unwrap().is::<f32>());
        assert_eq!(qpos.shape(), vec![5, 3]);
        assert_eq!(qpos.read_2d::<f32>().unwrap(), episode.qpos.mapv(|v| v as f32));

        let qvel = file.dataset(QVEL_PATH).unwrap();
        assert!(qvel.dtype().unwrap().is::<f32>());
        assert_eq!(qvel.shape(), vec![5, 3]);

        let action = file.dataset(ACTION_PATH).unwrap();
        assert!(action.dtype().unwrap().is::<f32>());
        assert_eq!(action.shape(), vec![5, 5]);
        let action = action.read_2d::<f32>().unwrap();
        assert_eq!(action.row(2).to_vec(), vec![2.0, 2.1, 2.2, -2.0, -3.0]);

        let camera = file.dataset(CAMERA_PATH).unwrap();
        assert!(camera.dtype().unwrap().is::<u8>());
        assert_eq!(camera.shape(), vec![5, 4, 6, 3]);
        assert_eq!(camera.read::<u8, ndarray::Ix4>().unwrap(), episode.images);
    }

    #[test]
    fn test_writer_chunks_one_frame_per_chunk() {
        let dir = tempdir().unwrap();
        for len in [1, 4, 17] {
            let path = dir.path().join(format!("episode_{}.hdf5", len));
            Hdf5EpisodeWriter::new().write(&episode(len), &path).unwrap();

            let file = hdf5::File::open(&path).unwrap();
            let camera = file.dataset(CAMERA_PATH).unwrap();
            assert_eq!(camera.chunk(), Some(vec![1, 4, 6, 3]));
        }
    }

    #[test]
    fn test_writer_truncates_existing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("episode_3.hdf5");
        Hdf5EpisodeWriter::new().write(&episode(8), &path).unwrap();
        Hdf5EpisodeWriter::new().write(&episode(2), &path).unwrap();

        let file = hdf5::File::open(&path).unwrap();
        assert_eq!(file.dataset(QPOS_PATH).unwrap().shape(), vec![2, 3]);
        assert_eq!(file.dataset(CAMERA_PATH).unwrap().shape(), vec![2, 4, 6, 3]);
    }

    #[test]
    fn test_writer_narrows_to_float32() {
        let narrowed = storage_precision(&array![[0.1f64, 1e-12], [123456789.123, -2.5]]);
        assert_eq!(narrowed, array![[0.1f32, 1e-12], [123456792.0, -2.5]]);
    }

    #[test]
    fn test_writer_reports_write_failure() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("not_a_dir");
        std::fs::write(&blocker, b"").unwrap();
        let path = blocker.join("episode_0.hdf5");

        let err = Hdf5EpisodeWriter::new().write(&episode(1), &path).unwrap_err();
        assert_eq!(err.kind(), "WriteFailure");
        assert!(!path.exists());
    }
}
