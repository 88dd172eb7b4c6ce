mod base_writer;
mod hdf5_writer;
mod inspect;
pub mod layout;

pub use base_writer::BaseEpisodeWriter;
pub use hdf5_writer::Hdf5EpisodeWriter;
pub use inspect::{inspect_container, ContainerSummary, DatasetSummary};
