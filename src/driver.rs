use crate::config::ConverterConfig;
use crate::container::{BaseEpisodeWriter, Hdf5EpisodeWriter};
use crate::episode::EpisodeAccumulator;
use crate::error::ConvertError;
use crate::record::{BaseRecordReader, PickleRecordReader};
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use serde::Serialize;
use std::ops::RangeInclusive;
use std::path::PathBuf;
use tracing::{error, info, info_span, warn};

/// Converts a range of episode IDs, one container per episode.
///
/// A failing episode is logged and recorded in the report; it never stops
/// the sweep.
pub struct BatchDriver<R = PickleRecordReader, W = Hdf5EpisodeWriter> {
    config: ConverterConfig,
    reader: R,
    writer: W,
    show_progress: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EpisodeSummary {
    pub episode_id: u32,
    pub timesteps: usize,
    pub output: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EpisodeFailure {
    pub episode_id: u32,
    pub kind: &'static str,
    pub message: String,
}

/// Outcome of a sweep, both lists ordered by episode ID.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchReport {
    pub converted: Vec<EpisodeSummary>,
    pub failed: Vec<EpisodeFailure>,
}

impl BatchDriver {
    pub fn new(config: ConverterConfig) -> Self {
        let reader = PickleRecordReader::with_extension(&config.record_extension);
        BatchDriver::with_components(config, reader, Hdf5EpisodeWriter::new())
    }
}

impl<R, W> BatchDriver<R, W>
where
    R: BaseRecordReader + Sync,
    W: BaseEpisodeWriter + Sync,
{
    pub fn with_components(config: ConverterConfig, reader: R, writer: W) -> Self {
        BatchDriver {
            config,
            reader,
            writer,
            show_progress: false,
        }
    }

    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    /// Reads, stacks and writes a single episode.
    pub fn convert_episode(&self, episode_id: u32) -> Result<EpisodeSummary, ConvertError> {
        let input_dir = self.config.input_dir(episode_id);
        let output = self.config.output_file(episode_id);

        let episode = EpisodeAccumulator::from_directory(&input_dir, &self.reader)?;
        if self.config.strict {
            episode.check_against(&self.config.task)?;
            if episode.len() != self.config.task.episode_len {
                warn!(
                    timesteps = episode.len(),
                    expected = self.config.task.episode_len,
                    "episode length differs from the task configuration"
                );
            }
        }
        self.writer.write(&episode, &output)?;

        Ok(EpisodeSummary {
            episode_id,
            timesteps: episode.len(),
            output,
        })
    }

    pub fn run(&self, episode_ids: RangeInclusive<u32>) -> BatchReport {
        let ids: Vec<u32> = episode_ids.collect();
        let jobs = self.config.jobs.max(1);
        info!(episodes = ids.len(), jobs, "starting conversion");

        let progress = self.progress_bar(ids.len());
        let convert = |&episode_id: &u32| {
            let result = self.convert_logged(episode_id);
            progress.inc(1);
            (episode_id, result)
        };

        let outcomes: Vec<_> = if jobs > 1 {
            match rayon::ThreadPoolBuilder::new().num_threads(jobs).build() {
                Ok(pool) => pool.install(|| ids.par_iter().map(convert).collect()),
                Err(err) => {
                    warn!(error = %err, "failed to build thread pool, converting sequentially");
                    ids.iter().map(convert).collect()
                }
            }
        } else {
            ids.iter().map(convert).collect()
        };
        progress.finish_and_clear();

        let report = BatchReport::from_outcomes(outcomes);
        info!(
            converted = report.converted.len(),
            failed = report.failed.len(),
            "conversion finished"
        );
        report
    }

    fn convert_logged(&self, episode_id: u32) -> Result<EpisodeSummary, ConvertError> {
        let span = info_span!("episode", id = episode_id);
        let _enter = span.enter();
        match self.convert_episode(episode_id) {
            Ok(summary) => {
                info!(
                    timesteps = summary.timesteps,
                    output = %summary.output.display(),
                    "episode converted"
                );
                Ok(summary)
            }
            Err(err) => {
                error!(kind = err.kind(), error = %err.chain(), "episode conversion failed");
                Err(err)
            }
        }
    }

    fn progress_bar(&self, len: usize) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }
        let bar = ProgressBar::new(len as u64);
        if let Ok(style) =
            ProgressStyle::with_template("[{elapsed_precise}] {bar:40} {pos}/{len} episodes")
        {
            bar.set_style(style);
        }
        bar
    }
}

impl BatchReport {
    fn from_outcomes(outcomes: Vec<(u32, Result<EpisodeSummary, ConvertError>)>) -> Self {
        let mut report = BatchReport::default();
        for (episode_id, outcome) in outcomes {
            match outcome {
                Ok(summary) => report.converted.push(summary),
                Err(err) => report.failed.push(EpisodeFailure {
                    episode_id,
                    kind: err.kind(),
                    message: err.chain(),
                }),
            }
        }
        report
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TaskConfig;
    use crate::container::inspect_container;
    use crate::episode::Episode;
    use crate::error::WriteError;
    use crate::misc::fixtures::{write_episode, RecordFixture};
    use std::fs;
    use std::path::Path;
    use tempfile::{tempdir, TempDir};

    fn setup() -> (TempDir, ConverterConfig) {
        let root = tempdir().unwrap();
        let config = ConverterConfig {
            input_root: root.path().join("data"),
            output_root: root.path().join("hdf5/task1"),
            ..Default::default()
        };
        (root, config)
    }

    fn write_scene(config: &ConverterConfig, id: u32, len: usize) -> Vec<RecordFixture> {
        write_episode(&config.input_dir(id), len, 6, 3, (6, 8, 3))
    }

    #[test]
    fn test_run_converts_present_scene_and_reports_missing_one() {
        let (_root, config) = setup();
        write_scene(&config, 7, 10);
        let driver = BatchDriver::new(config.clone());

        let report = driver.run(7..=8);

        assert_eq!(report.converted.len(), 1);
        assert_eq!(report.converted[0].episode_id, 7);
        assert_eq!(report.converted[0].timesteps, 10);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].episode_id, 8);
        assert_eq!(report.failed[0].kind, "UnreadableInput");
        assert!(!report.is_complete());

        let outputs: Vec<_> = fs::read_dir(&config.output_root)
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(outputs, vec!["episode_7.hdf5"]);

        let summary = inspect_container(&config.output_file(7)).unwrap();
        assert_eq!(summary.timesteps(), Some(10));
        assert_eq!(summary.qpos.shape, vec![10, 6]);
        assert_eq!(summary.action.shape, vec![10, 9]);
        assert_eq!(summary.images.chunk, Some(vec![1, 6, 8, 3]));
    }

    #[test]
    fn test_action_rows_match_position_and_direction() {
        let (_root, config) = setup();
        let fixtures = write_scene(&config, 0, 4);
        BatchDriver::new(config.clone()).convert_episode(0).unwrap();

        let file = hdf5::File::open(config.output_file(0)).unwrap();
        let qpos = file.dataset("observations/qpos").unwrap().read_2d::<f32>().unwrap();
        let action = file.dataset("action").unwrap().read_2d::<f32>().unwrap();
        for (t, fixture) in fixtures.iter().enumerate() {
            let mut expected = qpos.row(t).to_vec();
            expected.extend(fixture.direction.iter().map(|&v| v as f32));
            assert_eq!(action.row(t).to_vec(), expected);
        }
    }

    #[test]
    fn test_empty_scene_writes_nothing() {
        let (_root, config) = setup();
        fs::create_dir_all(config.input_dir(3)).unwrap();
        write_scene(&config, 4, 2);

        let report = BatchDriver::new(config.clone()).run(3..=4);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].episode_id, 3);
        assert_eq!(report.failed[0].kind, "EmptyEpisode");
        assert!(!config.output_file(3).exists());
        assert!(config.output_file(4).exists());
    }

    #[test]
    fn test_shape_mismatch_fails_only_that_episode() {
        let (_root, config) = setup();
        write_scene(&config, 1, 5);
        let mut rng = rand::thread_rng();
        RecordFixture::random(&mut rng, 6, 3, (4, 8, 3))
            .write(&config.input_dir(1).join("0002.pkl"));
        write_scene(&config, 2, 3);

        let report = BatchDriver::new(config.clone()).run(1..=2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].kind, "ShapeMismatch");
        assert!(report.failed[0].message.contains("0002.pkl"));
        assert!(!config.output_file(1).exists());
        assert_eq!(report.converted[0].episode_id, 2);
    }

    #[test]
    fn test_parallel_run_matches_sequential_outcome() {
        let (_root, mut config) = setup();
        for id in [0, 1, 2, 4, 5] {
            write_scene(&config, id, id as usize + 1);
        }
        config.jobs = 3;

        let report = BatchDriver::new(config.clone()).run(0..=5);
        let converted: Vec<_> = report
            .converted
            .iter()
            .map(|s| (s.episode_id, s.timesteps))
            .collect();
        assert_eq!(converted, vec![(0, 1), (1, 2), (2, 3), (4, 5), (5, 6)]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].episode_id, 3);
        for id in [0, 1, 2, 4, 5] {
            let summary = inspect_container(&config.output_file(id)).unwrap();
            assert_eq!(summary.timesteps(), Some(id as usize + 1));
        }
    }

    #[test]
    fn test_strict_mode_rejects_undeclared_geometry() {
        let (_root, mut config) = setup();
        write_scene(&config, 0, 2);
        config.strict = true;
        config.task = TaskConfig {
            episode_len: 2,
            state_dim: 6,
            action_dim: 9,
            cam_height: 480,
            cam_width: 640,
            cam_channels: 3,
        };

        let err = BatchDriver::new(config.clone()).convert_episode(0).unwrap_err();
        assert_eq!(err.kind(), "ConfigMismatch");
        assert!(!config.output_file(0).exists());

        config.task.cam_height = 6;
        config.task.cam_width = 8;
        assert!(BatchDriver::new(config).convert_episode(0).is_ok());
    }

    struct FailingWriter {
        fail_on: u32,
        inner: Hdf5EpisodeWriter,
    }

    impl BaseEpisodeWriter for FailingWriter {
        fn write(&self, episode: &Episode, path: &Path) -> Result<(), ConvertError> {
            let target = format!("episode_{}.hdf5", self.fail_on);
            if path.file_name().map_or(false, |name| name == target.as_str()) {
                return Err(ConvertError::WriteFailure {
                    path: path.to_path_buf(),
                    source: WriteError::Io(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        "disk full",
                    )),
                });
            }
            self.inner.write(episode, path)
        }
    }

    #[test]
    fn test_write_failure_does_not_abort_batch() {
        let (_root, config) = setup();
        for id in 10..=12 {
            write_scene(&config, id, 2);
        }
        let driver = BatchDriver::with_components(
            config.clone(),
            PickleRecordReader::new(),
            FailingWriter {
                fail_on: 11,
                inner: Hdf5EpisodeWriter::new(),
            },
        );

        let report = driver.run(10..=12);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].episode_id, 11);
        assert_eq!(report.failed[0].kind, "WriteFailure");
        assert!(report.failed[0].message.ends_with("disk full"));
        assert_eq!(report.converted.len(), 2);
    }

    #[test]
    fn test_report_serializes_to_json() {
        let report = BatchReport {
            converted: vec![EpisodeSummary {
                episode_id: 7,
                timesteps: 10,
                output: PathBuf::from("hdf5/episode_7.hdf5"),
            }],
            failed: vec![EpisodeFailure {
                episode_id: 8,
                kind: "UnreadableInput",
                message: "cannot read input directory".to_string(),
            }],
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["converted"][0]["timesteps"], 10);
        assert_eq!(json["failed"][0]["kind"], "UnreadableInput");
    }
}
