//! Stage V3 pixel audit: SDXL-Turbo img2img reconstruction attack
//! (spec §4.7 V3).
//!
//! Grounded on the `candle_transformers::models::stable_diffusion` img2img
//! pattern: encode the source through the VAE to get an initial latent,
//! partially renoise it according to `strength` by skipping the early
//! portion of the scheduler's timestep list, then run the usual UNet
//! denoising loop before decoding back to pixels.

use candle_core::{DType, Device, Tensor};
use candle_transformers::models::stable_diffusion::{self, StableDiffusionConfig};
use hf_hub::api::sync::Api;
use image::RgbImage;
use tokenizers::Tokenizer;

use crate::error::{Result, ShieldError};

const SDXL_TURBO_REPO: &str = "stabilityai/sdxl-turbo";
const SDXL_VAE_FIX_REPO: &str = "madebyollin/sdxl-vae-fp16-fix";

fn stage_err(reason: impl Into<String>) -> ShieldError {
    ShieldError::VerifierStageFailed {
        stage: "pixel_audit_sdxl".to_string(),
        reason: reason.into(),
    }
}

/// Held across both the pixel-audit and semantic-audit stages, since SDXL's
/// UNet and VAE are only needed for V3 (spec §4.7 "V3: SDXL-Turbo img2img").
pub struct SdxlAttack {
    sd_config: StableDiffusionConfig,
    clip: stable_diffusion::clip::ClipTextTransformer,
    clip2: stable_diffusion::clip::ClipTextTransformer,
    tokenizer: Tokenizer,
    tokenizer2: Tokenizer,
    vae: stable_diffusion::vae::AutoEncoderKL,
    unet: stable_diffusion::unet_2d::UNet2DConditionModel,
    device: Device,
    dtype: DType,
}

impl SdxlAttack {
    pub fn load(api: &Api, device: &Device, dtype: DType) -> anyhow::Result<Self> {
        let repo = api.model(SDXL_TURBO_REPO.to_string());
        let vae_repo = api.model(SDXL_VAE_FIX_REPO.to_string());

        let sd_config = StableDiffusionConfig::sdxl_turbo(None, None, None);

        let tokenizer_path = repo.get("tokenizer/tokenizer.json")?;
        let tokenizer = Tokenizer::from_file(tokenizer_path).map_err(|e| anyhow::anyhow!("{e}"))?;
        let tokenizer2_path = repo.get("tokenizer_2/tokenizer.json")?;
        let tokenizer2 = Tokenizer::from_file(tokenizer2_path).map_err(|e| anyhow::anyhow!("{e}"))?;

        let clip_weights = repo.get("text_encoder/model.safetensors")?;
        let clip = sd_config.build_clip_transformer(
            &sd_config.clip,
            clip_weights,
            device,
            dtype,
        )?;
        let clip2_weights = repo.get("text_encoder_2/model.safetensors")?;
        let clip2 = sd_config.build_clip_transformer(
            sd_config
                .clip2
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("sdxl-turbo config missing clip2"))?,
            clip2_weights,
            device,
            dtype,
        )?;

        let vae_weights = vae_repo.get("diffusion_pytorch_model.safetensors")?;
        let vae = sd_config.build_vae(vae_weights, device, dtype)?;

        let unet_weights = repo.get("unet/diffusion_pytorch_model.safetensors")?;
        let unet = sd_config.build_unet(unet_weights, device, 4, dtype)?;

        Ok(Self {
            sd_config,
            clip,
            clip2,
            tokenizer,
            tokenizer2,
            vae,
            unet,
            device: device.clone(),
            dtype,
        })
    }

    fn tokenize(&self, tokenizer: &Tokenizer, prompt: &str) -> Result<Tensor> {
        let mut ids = tokenizer
            .encode(prompt, true)
            .map_err(|e| stage_err(format!("tokenize: {e}")))?
            .get_ids()
            .to_vec();
        ids.resize(77, 0);
        Tensor::new(&ids[..], &self.device)
            .map_err(ShieldError::from)?
            .unsqueeze(0)
            .map_err(ShieldError::from)
    }

    /// Dual CLIP text embeddings with classifier-free guidance concatenation
    /// (spec §4.7 V3: "guidance 0.0" — SDXL-Turbo is distilled for CFG-free
    /// sampling, so the unconditional branch is never actually mixed in, but
    /// the tensor shape is kept uniform with the non-Turbo UNet path).
    fn text_embeddings(&self, prompt: &str) -> Result<Tensor> {
        let tokens = self.tokenize(&self.tokenizer, prompt)?;
        let tokens2 = self.tokenize(&self.tokenizer2, prompt)?;

        let emb1 = self.clip.forward(&tokens).map_err(ShieldError::from)?;
        let emb2 = self.clip2.forward(&tokens2).map_err(ShieldError::from)?;
        Tensor::cat(&[&emb1, &emb2], candle_core::D::Minus1).map_err(ShieldError::from)
    }

    /// Img2img reconstruction at the spec's attack strength (spec §4.7 V3
    /// "strength 0.6, 2 steps, guidance 0.0").
    pub fn img2img(&self, source: &RgbImage, prompt: &str, strength: f64) -> Result<RgbImage> {
        let n_steps = 2usize;
        let scheduler = self.sd_config.build_scheduler(n_steps).map_err(ShieldError::from)?;
        let text_embeddings = self.text_embeddings(prompt)?.to_dtype(self.dtype).map_err(ShieldError::from)?;

        let init_image = image_to_sd_tensor(source, &self.device)?.to_dtype(self.dtype).map_err(ShieldError::from)?;
        let init_latent_dist = self.vae.encode(&init_image).map_err(ShieldError::from)?;
        let vae_scale = 0.13025;
        let init_latents = (init_latent_dist.sample().map_err(ShieldError::from)? * vae_scale).map_err(ShieldError::from)?;

        let timesteps = scheduler.timesteps();
        let t_start = timesteps.len().saturating_sub(
            ((timesteps.len() as f64) * strength).round() as usize,
        );

        let noise = init_latents.randn_like(0.0, 1.0).map_err(ShieldError::from)?;
        let mut latents = scheduler
            .add_noise(&init_latents, noise, timesteps[t_start])
            .map_err(ShieldError::from)?;

        for (index, &timestep) in timesteps.iter().enumerate() {
            if index < t_start {
                continue;
            }
            let latent_model_input = scheduler.scale_model_input(latents.clone(), timestep).map_err(ShieldError::from)?;
            let noise_pred = self
                .unet
                .forward(&latent_model_input, timestep as f64, &text_embeddings)
                .map_err(ShieldError::from)?;
            latents = scheduler.step(&noise_pred, timestep, &latents).map_err(ShieldError::from)?;
        }

        let decoded = self.vae.decode(&(&latents / vae_scale).map_err(ShieldError::from)?).map_err(ShieldError::from)?;
        sd_tensor_to_rgb(&decoded)
    }
}

fn image_to_sd_tensor(img: &RgbImage, device: &Device) -> Result<Tensor> {
    let (w, h) = img.dimensions();
    let data = img.as_raw();
    let tensor = Tensor::from_vec(data.clone(), (h as usize, w as usize, 3), device)
        .map_err(ShieldError::from)?
        .permute((2, 0, 1))
        .map_err(ShieldError::from)?
        .to_dtype(DType::F32)
        .map_err(ShieldError::from)?;
    (tensor * (2.0 / 255.0))
        .map_err(ShieldError::from)?
        .broadcast_sub(&Tensor::new(1f32, device).map_err(ShieldError::from)?)
        .map_err(ShieldError::from)?
        .unsqueeze(0)
        .map_err(ShieldError::from)
}

fn sd_tensor_to_rgb(img: &Tensor) -> Result<RgbImage> {
    let img = ((img / 2.0).map_err(ShieldError::from)? + 0.5).map_err(ShieldError::from)?;
    let img = (img.clamp(0f32, 1f32).map_err(ShieldError::from)? * 255.0)
        .map_err(ShieldError::from)?
        .to_dtype(DType::U8)
        .map_err(ShieldError::from)?;
    let img = img.squeeze(0).map_err(ShieldError::from)?;
    let (_, h, w) = img.dims3().map_err(ShieldError::from)?;
    let data = img
        .permute((1, 2, 0))
        .map_err(ShieldError::from)?
        .flatten_all()
        .map_err(ShieldError::from)?
        .to_vec1::<u8>()
        .map_err(ShieldError::from)?;
    RgbImage::from_raw(w as u32, h as u32, data)
        .ok_or_else(|| stage_err("decoded latent had an unexpected byte length"))
}
