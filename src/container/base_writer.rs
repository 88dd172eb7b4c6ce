use crate::episode::Episode;
use crate::error::ConvertError;
use std::path::Path;

pub trait BaseEpisodeWriter {
    /// Persists `episode` at `path`, replacing any existing file.
    fn write(&self, episode: &Episode, path: &Path) -> Result<(), ConvertError>;
}
