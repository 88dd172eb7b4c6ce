use super::arrays::Episode;
use crate::error::ConvertError;
use crate::misc::shape::Shape;
use crate::record::{BaseRecordReader, Field, TimestepRecord};
use ndarray::{Array2, Array4};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Collects timestep records in order and stacks them into an [`Episode`].
///
/// The first record fixes the shape of every field; each later record is
/// checked against it before anything is appended.
pub struct EpisodeAccumulator {
    dir: PathBuf,
    shapes: Option<RecordShapes>,
    qpos: Vec<f64>,
    qvel: Vec<f64>,
    action: Vec<f64>,
    images: Vec<u8>,
    len: usize,
}

#[derive(Debug, Clone, Copy)]
struct RecordShapes {
    state_dim: usize,
    direction_dim: usize,
    frame: (usize, usize, usize),
}

/// Record files in `dir` with the given extension, in lexicographic filename order.
///
/// Filename order is timestep order: producers zero-pad their indices.
pub fn discover_records(dir: &Path, extension: &str) -> Result<Vec<PathBuf>, ConvertError> {
    let unreadable = |source: std::io::Error| ConvertError::UnreadableInput {
        path: dir.to_path_buf(),
        source,
    };
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).map_err(unreadable)? {
        let path = entry.map_err(unreadable)?.path();
        if path.is_file() && path.extension().map_or(false, |ext| ext == extension) {
            files.push(path);
        }
    }
    files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(files)
}

impl EpisodeAccumulator {
    pub fn new(dir: &Path) -> Self {
        EpisodeAccumulator {
            dir: dir.to_path_buf(),
            shapes: None,
            qpos: Vec::new(),
            qvel: Vec::new(),
            action: Vec::new(),
            images: Vec::new(),
            len: 0,
        }
    }

    /// Reads every record under `dir` and stacks them.
    pub fn from_directory<R>(dir: &Path, reader: &R) -> Result<Episode, ConvertError>
    where
        R: BaseRecordReader + ?Sized,
    {
        let files = discover_records(dir, reader.extension())?;
        if files.is_empty() {
            return Err(ConvertError::EmptyEpisode {
                dir: dir.to_path_buf(),
            });
        }
        debug!(records = files.len(), dir = %dir.display(), "discovered records");

        let mut accumulator = EpisodeAccumulator::new(dir);
        for path in &files {
            let record = reader.read(path)?;
            accumulator.push(record, path)?;
        }
        accumulator.finish()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Appends one timestep. `path` only labels errors.
    pub fn push(&mut self, record: TimestepRecord, path: &Path) -> Result<(), ConvertError> {
        let shapes = match self.shapes {
            Some(shapes) => shapes,
            None => {
                let shapes = RecordShapes::of(&record);
                // qpos and qvel share one [T, P] layout
                if record.velocity.len() != shapes.state_dim {
                    return Err(self.mismatch(
                        path,
                        Field::Velocity,
                        Shape::from([shapes.state_dim]),
                        &record,
                    ));
                }
                self.shapes = Some(shapes);
                shapes
            }
        };
        self.check(&shapes, &record, path)?;

        let action = record.action();
        self.qpos.extend(record.position.iter());
        self.qvel.extend(record.velocity.iter());
        self.action.extend(action.iter());
        self.images.extend(record.image.iter());
        self.len += 1;
        Ok(())
    }

    /// Converts the accumulated timesteps into contiguous per-episode arrays.
    pub fn finish(self) -> Result<Episode, ConvertError> {
        let shapes = match self.shapes {
            Some(shapes) if self.len > 0 => shapes,
            _ => return Err(ConvertError::EmptyEpisode { dir: self.dir }),
        };
        let (height, width, channels) = shapes.frame;
        let action_dim = shapes.state_dim + shapes.direction_dim;
        Ok(Episode {
            qpos: Array2::from_shape_vec((self.len, shapes.state_dim), self.qpos)?,
            qvel: Array2::from_shape_vec((self.len, shapes.state_dim), self.qvel)?,
            action: Array2::from_shape_vec((self.len, action_dim), self.action)?,
            images: Array4::from_shape_vec((self.len, height, width, channels), self.images)?,
        })
    }

    fn check(
        &self,
        shapes: &RecordShapes,
        record: &TimestepRecord,
        path: &Path,
    ) -> Result<(), ConvertError> {
        let expected = [
            (Field::Position, Shape::from([shapes.state_dim])),
            (Field::Direction, Shape::from([shapes.direction_dim])),
            (Field::Velocity, Shape::from([shapes.state_dim])),
            (
                Field::Image,
                Shape::from([shapes.frame.0, shapes.frame.1, shapes.frame.2]),
            ),
        ];
        for (field, shape) in expected {
            if record.shape_of(field) != shape {
                return Err(self.mismatch(path, field, shape, record));
            }
        }
        Ok(())
    }

    fn mismatch(
        &self,
        path: &Path,
        field: Field,
        expected: Shape,
        record: &TimestepRecord,
    ) -> ConvertError {
        ConvertError::ShapeMismatch {
            path: path.to_path_buf(),
            index: self.len,
            field,
            expected,
            actual: record.shape_of(field),
        }
    }
}

impl RecordShapes {
    fn of(record: &TimestepRecord) -> Self {
        RecordShapes {
            state_dim: record.position.len(),
            direction_dim: record.direction.len(),
            frame: record.image.dim(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::misc::fixtures::{write_episode, RecordFixture};
    use crate::record::PickleRecordReader;
    use ndarray::{array, Array3};
    use tempfile::tempdir;

    fn record(position: f64, frame: (usize, usize, usize)) -> TimestepRecord {
        TimestepRecord {
            position: array![position, position + 1.0],
            direction: array![-position],
            velocity: array![0.5, 0.25],
            image: Array3::from_elem(frame, position as u8),
        }
    }

    #[test]
    fn test_accumulator_stacks_records_in_order() {
        let mut accumulator = EpisodeAccumulator::new(Path::new("run_00"));
        for t in 0..3 {
            accumulator
                .push(record(t as f64, (2, 2, 3)), Path::new("x.pkl"))
                .unwrap();
        }
        assert_eq!(accumulator.len(), 3);

        let episode = accumulator.finish().unwrap();
        assert_eq!(episode.len(), 3);
        assert_eq!(episode.qpos, array![[0.0, 1.0], [1.0, 2.0], [2.0, 3.0]]);
        assert_eq!(episode.qvel.shape(), &[3, 2]);
        assert_eq!(
            episode.action,
            array![[0.0, 1.0, -0.0], [1.0, 2.0, -1.0], [2.0, 3.0, -2.0]]
        );
        assert_eq!(episode.images.shape(), &[3, 2, 2, 3]);
        assert_eq!(episode.images[[2, 1, 1, 2]], 2);
    }

    #[test]
    fn test_accumulator_finish_empty() {
        let accumulator = EpisodeAccumulator::new(Path::new("run_00"));
        assert!(accumulator.is_empty());
        assert_eq!(accumulator.finish().unwrap_err().kind(), "EmptyEpisode");
    }

    #[test]
    fn test_accumulator_rejects_velocity_width() {
        let mut accumulator = EpisodeAccumulator::new(Path::new("run_00"));
        let mut first = record(0.0, (2, 2, 3));
        first.velocity = array![0.0, 0.0, 0.0];
        let err = accumulator.push(first, Path::new("0000.pkl")).unwrap_err();
        match err {
            ConvertError::ShapeMismatch {
                index,
                field,
                expected,
                actual,
                ..
            } => {
                assert_eq!(index, 0);
                assert_eq!(field, Field::Velocity);
                assert_eq!(expected, Shape::from([2]));
                assert_eq!(actual, Shape::from([3]));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_accumulator_rejects_direction_width_change() {
        let mut accumulator = EpisodeAccumulator::new(Path::new("run_00"));
        accumulator
            .push(record(0.0, (2, 2, 3)), Path::new("0000.pkl"))
            .unwrap();
        let mut second = record(1.0, (2, 2, 3));
        second.direction = array![1.0, 1.0];
        let err = accumulator.push(second, Path::new("0001.pkl")).unwrap_err();
        assert_eq!(err.kind(), "ShapeMismatch");
        assert_eq!(accumulator.len(), 1);
    }

    #[test]
    fn test_discover_records_sorts_lexicographically() {
        let dir = tempdir().unwrap();
        for name in ["0010.pkl", "0002.pkl", "0001.pkl", "notes.txt", "0003.pkl.bak"] {
            fs::write(dir.path().join(name), b"").unwrap();
        }
        fs::create_dir(dir.path().join("nested.pkl")).unwrap();

        let files = discover_records(dir.path(), "pkl").unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["0001.pkl", "0002.pkl", "0010.pkl"]);
    }

    #[test]
    fn test_discover_records_missing_directory() {
        let dir = tempdir().unwrap();
        let err = discover_records(&dir.path().join("scene_00008/run_00"), "pkl").unwrap_err();
        assert_eq!(err.kind(), "UnreadableInput");
    }

    #[test]
    fn test_from_directory_empty_episode() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("readme.txt"), b"no records here").unwrap();
        let err = EpisodeAccumulator::from_directory(dir.path(), &PickleRecordReader::new())
            .unwrap_err();
        assert_eq!(err.kind(), "EmptyEpisode");
    }

    #[test]
    fn test_from_directory_round_trip() {
        let dir = tempdir().unwrap();
        let fixtures = write_episode(dir.path(), 6, 4, 3, (3, 5, 3));

        let episode =
            EpisodeAccumulator::from_directory(dir.path(), &PickleRecordReader::new()).unwrap();
        assert_eq!(episode.len(), 6);
        assert_eq!(episode.state_dim(), 4);
        assert_eq!(episode.action_dim(), 7);
        assert_eq!(episode.frame_shape(), (3, 5, 3));
        for (t, fixture) in fixtures.iter().enumerate() {
            let expected: Vec<f64> = fixture
                .position
                .iter()
                .chain(fixture.direction.iter())
                .copied()
                .collect();
            assert_eq!(episode.action.row(t).to_vec(), expected);
            assert_eq!(episode.qpos.row(t).to_vec(), fixture.position);
            assert_eq!(episode.qvel.row(t).to_vec(), fixture.velocity);
            assert_eq!(episode.images[[t, 2, 4, 1]], fixture.image[2][4][1]);
        }
    }

    #[test]
    fn test_from_directory_rejects_resized_frame() {
        let dir = tempdir().unwrap();
        write_episode(dir.path(), 5, 2, 2, (4, 4, 3));
        let mut rng = rand::thread_rng();
        RecordFixture::random(&mut rng, 2, 2, (2, 4, 3)).write(&dir.path().join("0002.pkl"));

        let err = EpisodeAccumulator::from_directory(dir.path(), &PickleRecordReader::new())
            .unwrap_err();
        match err {
            ConvertError::ShapeMismatch {
                path,
                index,
                field,
                expected,
                actual,
            } => {
                assert_eq!(path, dir.path().join("0002.pkl"));
                assert_eq!(index, 2);
                assert_eq!(field, Field::Image);
                assert_eq!(expected, Shape::from([4, 4, 3]));
                assert_eq!(actual, Shape::from([2, 4, 3]));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
