use rand::Rng;
use serde::Serialize;
use serde_pickle::SerOptions;
use std::fs::{self, File};
use std::path::Path;

/// A timestep record as a producer would pickle it.
#[derive(Debug, Clone, Serialize)]
pub struct RecordFixture {
    pub position: Vec<f64>,
    pub direction: Vec<f64>,
    pub velocity: Vec<f64>,
    pub image: Vec<Vec<Vec<u8>>>,
}

impl RecordFixture {
    pub fn random<R: Rng>(
        rng: &mut R,
        state_dim: usize,
        direction_dim: usize,
        frame: (usize, usize, usize),
    ) -> Self {
        let (height, width, channels) = frame;
        RecordFixture {
            position: (0..state_dim).map(|_| rng.gen_range(-1.0..1.0)).collect(),
            direction: (0..direction_dim).map(|_| rng.gen_range(-1.0..1.0)).collect(),
            velocity: (0..state_dim).map(|_| rng.gen_range(-0.1..0.1)).collect(),
            image: (0..height)
                .map(|_| {
                    (0..width)
                        .map(|_| (0..channels).map(|_| rng.gen()).collect())
                        .collect()
                })
                .collect(),
        }
    }

    pub fn write(&self, path: &Path) {
        let mut file = File::create(path).unwrap();
        serde_pickle::to_writer(&mut file, self, SerOptions::new()).unwrap();
    }
}

/// Writes `len` random records as `0000.pkl`, `0001.pkl`, ... into `dir`.
pub fn write_episode(
    dir: &Path,
    len: usize,
    state_dim: usize,
    direction_dim: usize,
    frame: (usize, usize, usize),
) -> Vec<RecordFixture> {
    fs::create_dir_all(dir).unwrap();
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|t| {
            let record = RecordFixture::random(&mut rng, state_dim, direction_dim, frame);
            record.write(&dir.join(format!("{:04}.pkl", t)));
            record
        })
        .collect()
}
