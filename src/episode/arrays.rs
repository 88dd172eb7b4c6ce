use crate::config::TaskConfig;
use crate::error::ConvertError;
use crate::misc::shape::Shape;
use crate::record::Field;
use ndarray::{Array2, Array4};

/// All timesteps of one episode, stacked along axis 0.
///
/// Numeric arrays keep the precision they were read with; narrowing to
/// storage precision is the writer's job.
#[derive(Debug, Clone, PartialEq)]
pub struct Episode {
    /// T x P
    pub qpos: Array2<f64>,
    /// T x P
    pub qvel: Array2<f64>,
    /// T x (P + D)
    pub action: Array2<f64>,
    /// T x H x W x C
    pub images: Array4<u8>,
}

impl Episode {
    /// Number of timesteps.
    pub fn len(&self) -> usize {
        self.qpos.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn state_dim(&self) -> usize {
        self.qpos.ncols()
    }

    pub fn action_dim(&self) -> usize {
        self.action.ncols()
    }

    pub fn frame_shape(&self) -> (usize, usize, usize) {
        let (_, height, width, channels) = self.images.dim();
        (height, width, channels)
    }

    /// Cross-checks widths and camera geometry against the declared task.
    ///
    /// Episode length is not checked here; recorded episodes routinely run
    /// shorter or longer than the nominal length.
    pub fn check_against(&self, task: &TaskConfig) -> Result<(), ConvertError> {
        if self.state_dim() != task.state_dim {
            return Err(ConvertError::ConfigMismatch {
                field: Field::Position,
                expected: Shape::from([task.state_dim]),
                actual: Shape::from([self.state_dim()]),
            });
        }
        if self.action_dim() != task.action_dim {
            return Err(ConvertError::ConfigMismatch {
                field: Field::Action,
                expected: Shape::from([task.action_dim]),
                actual: Shape::from([self.action_dim()]),
            });
        }
        let (height, width, channels) = self.frame_shape();
        if (height, width, channels) != (task.cam_height, task.cam_width, task.cam_channels) {
            return Err(ConvertError::ConfigMismatch {
                field: Field::Image,
                expected: Shape::from([task.cam_height, task.cam_width, task.cam_channels]),
                actual: Shape::from([height, width, channels]),
            });
        }
        Ok(())
    }
}
