mod accumulator;
mod arrays;

pub use accumulator::{discover_records, EpisodeAccumulator};
pub use arrays::Episode;
