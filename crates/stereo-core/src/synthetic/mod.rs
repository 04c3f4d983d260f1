//! Deterministic synthetic data for tests and demos.

pub mod noise;
pub mod planar;
