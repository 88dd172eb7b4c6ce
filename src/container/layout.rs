//! Group and dataset names of an episode container.
//!
//! Training loaders open these paths directly; renaming any of them breaks
//! every consumer of already-written episodes.

/// Boolean attribute on the root group.
pub const SIM_ATTR: &str = "sim";

pub const OBSERVATIONS: &str = "observations";
pub const IMAGES: &str = "images";

pub const QPOS: &str = "qpos";
pub const QVEL: &str = "qvel";
pub const CAMERA: &str = "camera";
pub const ACTION: &str = "action";

pub const QPOS_PATH: &str = "observations/qpos";
pub const QVEL_PATH: &str = "observations/qvel";
pub const CAMERA_PATH: &str = "observations/images/camera";
pub const ACTION_PATH: &str = "action";
