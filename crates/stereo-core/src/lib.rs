//! Core math and geometry primitives for the stereo depth toolbox.
//!
//! This crate contains:
//! - linear algebra type aliases (`Real`, `Vec2`, `Pt3`, ...),
//! - the pinhole + Brown-Conrady camera model shared by both rig cameras,
//! - stereo extrinsics and rectification geometry containers,
//! - planar target observations consumed by the calibration crates,
//! - deterministic synthetic data generators.
//!
//! Camera pipeline:
//! `pixel = K ∘ distortion ∘ projection(point_c)`

/// Linear algebra type aliases and helpers.
pub mod math;
/// Camera models and distortion utilities.
pub mod models;
/// Synthetic targets, poses and noise for tests and demos.
pub mod synthetic;
/// Observation, extrinsics and rectification types.
pub mod types;

pub use math::*;
pub use models::*;
pub use types::*;
