use std::error::Error as StdError;
use std::path::PathBuf;

use crate::misc::shape::Shape;
use crate::record::Field;

/// Everything that can go wrong while converting a single episode.
///
/// None of these abort a batch: the driver reports the failing episode and
/// moves on to the next ID.
#[derive(thiserror::Error, Debug)]
pub enum ConvertError {
    #[error("no record files found in {}", dir.display())]
    EmptyEpisode { dir: PathBuf },

    #[error("cannot read input directory {}", path.display())]
    UnreadableInput {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed record {}: {reason}", path.display())]
    MalformedRecord { path: PathBuf, reason: String },

    #[error(
        "record {index} ({}) has {field} shape {actual}, expected {expected}",
        path.display()
    )]
    ShapeMismatch {
        path: PathBuf,
        index: usize,
        field: Field,
        expected: Shape,
        actual: Shape,
    },

    #[error("{field} shape {actual} does not match the task configuration ({expected})")]
    ConfigMismatch {
        field: Field,
        expected: Shape,
        actual: Shape,
    },

    #[error(transparent)]
    Layout(#[from] ndarray::ShapeError),

    #[error("failed to write container {}", path.display())]
    WriteFailure {
        path: PathBuf,
        #[source]
        source: WriteError,
    },

    #[error("cannot read container {}", path.display())]
    UnreadableContainer {
        path: PathBuf,
        #[source]
        source: hdf5::Error,
    },
}

#[derive(thiserror::Error, Debug)]
pub enum WriteError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Hdf5(#[from] hdf5::Error),
}

impl ConvertError {
    /// Stable name of the failure class, used in batch reports.
    pub fn kind(&self) -> &'static str {
        match self {
            ConvertError::EmptyEpisode { .. } => "EmptyEpisode",
            ConvertError::UnreadableInput { .. } => "UnreadableInput",
            ConvertError::MalformedRecord { .. } => "MalformedRecord",
            ConvertError::ShapeMismatch { .. } | ConvertError::Layout(_) => "ShapeMismatch",
            ConvertError::ConfigMismatch { .. } => "ConfigMismatch",
            ConvertError::WriteFailure { .. } => "WriteFailure",
            ConvertError::UnreadableContainer { .. } => "UnreadableContainer",
        }
    }

    pub(crate) fn malformed(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        ConvertError::MalformedRecord {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// The error message followed by every underlying cause, `: `-separated.
    pub fn chain(&self) -> String {
        let mut message = self.to_string();
        let mut source = StdError::source(self);
        while let Some(cause) = source {
            message.push_str(": ");
            message.push_str(&cause.to_string());
            source = cause.source();
        }
        message
    }
}
