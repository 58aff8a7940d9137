//! Adversarial perturbation engine, frequency watermark codec, and
//! verification harness for artwork protection.
//!
//! Module map (component numbering follows the design doc):
//! - [`config`] / [`job`] / [`error`] — data model (C-independent).
//! - [`encoders`] — C2 Encoder Bank (frozen CLIP + SigLIP).
//! - [`target`] — C3 Target Builder.
//! - [`lpips`] — C1 Perceptual Loss Module.
//! - [`engine`] — C4 Adversarial Perturbation Engine.
//! - [`watermark`] — C5 Frequency Watermark Codec.
//! - [`overlay`] — visible tiled-text watermark used by the orchestrator.
//! - [`orchestrator`] — C6 Protection Pipeline Orchestrator.
//! - [`verification`] — C7 Verification Harness.
//! - [`image_io`] — decode/encode, EXIF, ICC, alpha split/rejoin, storage key layout.
//! - [`tensor_ops`] — differentiable resize and small tensor helpers.

pub mod config;
pub mod encoders;
pub mod engine;
pub mod error;
pub mod image_io;
pub mod job;
pub mod lpips;
pub mod orchestrator;
pub mod overlay;
pub mod target;
pub mod tensor_ops;
pub mod verification;
pub mod watermark;

pub use config::{Configuration, Intensity, IntensityPreset, TargetModel};
pub use error::{Result, ShieldError};
pub use job::{JobState, JobStatus, ProtectionRequest, ProtectionResult};
