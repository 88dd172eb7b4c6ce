mod misc;

pub mod config;
pub mod container;
pub mod driver;
pub mod episode;
pub mod error;
pub mod record;

pub use misc::shape::Shape;
