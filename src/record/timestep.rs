use crate::misc::shape::Shape;
use ndarray::{Array1, Array3};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Position,
    Direction,
    Velocity,
    Image,
    Action,
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Field::Position => "position",
            Field::Direction => "direction",
            Field::Velocity => "velocity",
            Field::Image => "image",
            Field::Action => "action",
        };
        f.write_str(name)
    }
}

/// One timestep of an episode, validated and typed.
#[derive(Debug, Clone, PartialEq)]
pub struct TimestepRecord {
    pub position: Array1<f64>,
    pub direction: Array1<f64>,
    pub velocity: Array1<f64>,
    /// height x width x channels
    pub image: Array3<u8>,
}

impl TimestepRecord {
    /// `position` followed by `direction`.
    pub fn action(&self) -> Array1<f64> {
        self.position
            .iter()
            .chain(self.direction.iter())
            .copied()
            .collect()
    }

    pub fn shape_of(&self, field: Field) -> Shape {
        match field {
            Field::Position => Shape::from(self.position.shape()),
            Field::Direction => Shape::from(self.direction.shape()),
            Field::Velocity => Shape::from(self.velocity.shape()),
            Field::Image => Shape::from(self.image.shape()),
            Field::Action => Shape::from([self.position.len() + self.direction.len()]),
        }
    }
}
