mod base_reader;
mod numpy;
mod pickle_reader;
mod timestep;
mod unpickle;

pub use base_reader::BaseRecordReader;
pub use pickle_reader::PickleRecordReader;
pub use timestep::{Field, TimestepRecord};
