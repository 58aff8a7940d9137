//! Encoder Bank (C2, spec §4.1): frozen CLIP ViT-L/14 and hand-rolled
//! SigLIP-SO400M/14-384 behind one facade, `clip_image`/`clip_text`/
//! `siglip_image`/`siglip_text`.
//!
//! Both encoders are loaded once per process and never mutated (invariant I2):
//! weights are pulled into plain `Tensor`s via `VarBuilder`, never wrapped in a
//! `Var`, so `candle`'s autograd never attaches a gradient tape node to a
//! parameter, no matter how many times the perturbation engine differentiates
//! through a forward pass.

mod clip;
mod siglip;

use candle_core::{DType, Device, Tensor};
use hf_hub::api::sync::Api;
use tracing::info;

use crate::error::{Result, ShieldError};

pub use clip::ClipEncoder;
pub use siglip::SiglipEncoder;

/// Weight precision policy from spec §3 "pin weights to half precision on GPU,
/// single precision on CPU".
pub fn encoder_dtype(device: &Device) -> DType {
    if device.is_cuda() {
        DType::F16
    } else {
        DType::F32
    }
}

pub struct EncoderBank {
    clip: ClipEncoder,
    siglip: SiglipEncoder,
    device: Device,
}

impl EncoderBank {
    /// Download (or reuse the local HF cache for) both encoders and build the
    /// frozen forward-pass wrappers. Idempotent from the caller's perspective:
    /// repeated construction just re-resolves the same cached files.
    pub fn load(device: Device) -> Result<Self> {
        let dtype = encoder_dtype(&device);
        info!(?dtype, "loading encoder bank");
        let api = Api::new().map_err(|e| ShieldError::EngineLoadFailed(e.to_string()))?;

        let clip = ClipEncoder::load(&api, &device, dtype)
            .map_err(|e| ShieldError::EngineLoadFailed(format!("clip: {e}")))?;
        let siglip = SiglipEncoder::load(&api, &device, dtype)
            .map_err(|e| ShieldError::EngineLoadFailed(format!("siglip: {e}")))?;

        Ok(Self {
            clip,
            siglip,
            device,
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// `x`: `(N, 3, H, W)` in `[0,1]`. Returns L2-normalized `(N, 768)`.
    pub fn clip_image(&self, x: &Tensor) -> Result<Tensor> {
        self.clip
            .embed_image(x)
            .map_err(|e| ShieldError::EngineStepFailed {
                step: 0,
                reason: format!("clip_image: {e}"),
            })
    }

    /// Returns L2-normalized `(N, 768)`.
    pub fn clip_text(&self, prompts: &[String]) -> Result<Tensor> {
        self.clip
            .embed_text(prompts)
            .map_err(|e| ShieldError::EngineLoadFailed(format!("clip_text: {e}")))
    }

    /// `x`: `(N, 3, H, W)` in `[0,1]`. Returns L2-normalized `(N, 1152)`.
    pub fn siglip_image(&self, x: &Tensor) -> Result<Tensor> {
        self.siglip
            .embed_image(x)
            .map_err(|e| ShieldError::EngineStepFailed {
                step: 0,
                reason: format!("siglip_image: {e}"),
            })
    }

    /// Returns L2-normalized `(N, 1152)`.
    pub fn siglip_text(&self, prompts: &[String]) -> Result<Tensor> {
        self.siglip
            .embed_text(prompts)
            .map_err(|e| ShieldError::EngineLoadFailed(format!("siglip_text: {e}")))
    }
}
