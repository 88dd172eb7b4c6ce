#[cfg(test)]
pub mod fixtures;
pub mod shape;
