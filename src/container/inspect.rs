use super::layout::{ACTION_PATH, CAMERA_PATH, QPOS_PATH, QVEL_PATH, SIM_ATTR};
use crate::error::ConvertError;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};

/// What a written episode container holds, read back from disk.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContainerSummary {
    pub path: PathBuf,
    /// Members of the root group.
    pub keys: Vec<String>,
    pub sim: bool,
    pub qpos: DatasetSummary,
    pub qvel: DatasetSummary,
    pub action: DatasetSummary,
    pub images: DatasetSummary,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatasetSummary {
    pub shape: Vec<usize>,
    pub dtype: String,
    pub chunk: Option<Vec<usize>>,
}

impl ContainerSummary {
    /// Timestep count, if every dataset agrees on it.
    pub fn timesteps(&self) -> Option<usize> {
        let t = *self.qpos.shape.first()?;
        [&self.qvel, &self.action, &self.images]
            .iter()
            .all(|ds| ds.shape.first() == Some(&t))
            .then_some(t)
    }
}

pub fn inspect_container(path: &Path) -> Result<ContainerSummary, ConvertError> {
    read_summary(path).map_err(|source| ConvertError::UnreadableContainer {
        path: path.to_path_buf(),
        source,
    })
}

fn read_summary(path: &Path) -> hdf5::Result<ContainerSummary> {
    let file = hdf5::File::open(path)?;
    Ok(ContainerSummary {
        path: path.to_path_buf(),
        keys: file.member_names()?,
        sim: file.attr(SIM_ATTR)?.read_scalar::<bool>()?,
        qpos: dataset_summary(&file, QPOS_PATH)?,
        qvel: dataset_summary(&file, QVEL_PATH)?,
        action: dataset_summary(&file, ACTION_PATH)?,
        images: dataset_summary(&file, CAMERA_PATH)?,
    })
}

fn dataset_summary(file: &hdf5::File, name: &str) -> hdf5::Result<DatasetSummary> {
    let dataset = file.dataset(name)?;
    let dtype = dataset.dtype()?;
    let dtype = if dtype.is::<f32>() {
        "float32".to_string()
    } else if dtype.is::<u8>() {
        "uint8".to_string()
    } else {
        format!("{:?}", dtype.to_descriptor()?)
    };
    Ok(DatasetSummary {
        shape: dataset.shape(),
        dtype,
        chunk: dataset.chunk(),
    })
}

impl fmt::Display for ContainerSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.path.display())?;
        writeln!(f, "keys: {:?}", self.keys)?;
        writeln!(f, "sim: {}", self.sim)?;
        for (name, ds) in [
            (QPOS_PATH, &self.qpos),
            (QVEL_PATH, &self.qvel),
            (ACTION_PATH, &self.action),
            (CAMERA_PATH, &self.images),
        ] {
            write!(f, "{}: {:?} {}", name, ds.shape, ds.dtype)?;
            if let Some(chunk) = &ds.chunk {
                write!(f, " chunks={:?}", chunk)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
