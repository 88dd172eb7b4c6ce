use super::timestep::TimestepRecord;
use crate::error::ConvertError;
use std::path::Path;

pub trait BaseRecordReader {
    /// File extension (without the dot) that marks a record file.
    fn extension(&self) -> &str;
    fn read(&self, path: &Path) -> Result<TimestepRecord, ConvertError>;
}
