//! Stage V2 pixel audit: Flux.1-schnell img2img and txt2img reconstruction
//! attacks (spec §4.7 V2).
//!
//! Grounded on the Flux generation pipeline pattern — dual T5/CLIP text
//! encoding, `flux::model::Flux` transformer, `flux::autoencoder::AutoEncoder`
//! latent codec, Euler-method sampling via `flux::sampling` — the same shape
//! `candle-examples`' `flux` example and downstream forks (e.g. imagent's
//! `flux_wip`) use to drive the model from Rust.

use candle_core::{DType, Device, Tensor};
use candle_transformers::models::{clip as candle_clip, flux, t5};
use hf_hub::api::sync::Api;
use image::RgbImage;
use tokenizers::Tokenizer;

use crate::error::{Result, ShieldError};

const FLUX_REPO: &str = "black-forest-labs/FLUX.1-schnell";
const T5_REPO: &str = "google/t5-v1_1-xxl";
const CLIP_REPO: &str = "openai/clip-vit-large-patch14";

fn stage_err(reason: impl Into<String>) -> ShieldError {
    ShieldError::VerifierStageFailed {
        stage: "pixel_audit_flux".to_string(),
        reason: reason.into(),
    }
}

/// T5-v1.1-XXL config for the Flux text conditioning tower (spec §4.7 "T5 +
/// CLIP dual text encoding feeding the Flux transformer").
fn t5_config() -> t5::Config {
    t5::Config {
        vocab_size: 32128,
        d_model: 4096,
        d_kv: 64,
        d_ff: 10240,
        num_layers: 24,
        num_heads: 64,
        relative_attention_num_buckets: 32,
        relative_attention_max_distance: 128,
        dropout_rate: 0.1,
        layer_norm_epsilon: 1e-6,
        feed_forward_proj: "gated-gelu".to_string(),
        tie_word_embeddings: false,
        is_decoder: false,
        is_encoder_decoder: true,
        use_cache: false,
        pad_token_id: 0,
        eos_token_id: 1,
        decoder_start_token_id: Some(0),
    }
}

fn clip_text_config() -> candle_clip::text_model::ClipTextConfig {
    candle_clip::text_model::ClipTextConfig {
        vocab_size: 49408,
        embed_dim: 768,
        activation: candle_clip::text_model::Activation::QuickGelu,
        intermediate_size: 3072,
        max_position_embeddings: 77,
        pad_with: Some("!".to_string()),
        num_hidden_layers: 12,
        num_attention_heads: 12,
        projection_dim: 768,
    }
}

/// Flux's fixed KL-VAE shape (same for schnell and dev), matched by field
/// rather than via a version-keyed constructor the upstream crate doesn't
/// expose.
fn autoencoder_config() -> flux::autoencoder::Config {
    flux::autoencoder::Config {
        resolution: 256,
        in_channels: 3,
        ch: 128,
        out_ch: 3,
        ch_mult: vec![1, 2, 4, 4],
        num_res_blocks: 2,
        z_channels: 16,
        scale_factor: 0.3611,
        shift_factor: 0.1159,
    }
}

pub struct FluxAttack {
    flux_model: flux::model::Flux,
    autoencoder: flux::autoencoder::AutoEncoder,
    t5_encoder: t5::T5EncoderModel,
    clip_encoder: candle_clip::text_model::ClipTextTransformer,
    t5_tokenizer: Tokenizer,
    clip_tokenizer: Tokenizer,
    device: Device,
    dtype: DType,
}

impl FluxAttack {
    pub fn load(api: &Api, device: &Device, dtype: DType) -> anyhow::Result<Self> {
        let flux_repo = api.model(FLUX_REPO.to_string());
        let t5_repo = api.model(T5_REPO.to_string());
        let clip_repo = api.model(CLIP_REPO.to_string());

        let t5_tokenizer_path = t5_repo.get("tokenizer.json")?;
        let t5_tokenizer = Tokenizer::from_file(t5_tokenizer_path).map_err(|e| anyhow::anyhow!("{e}"))?;
        let clip_tokenizer_path = clip_repo.get("tokenizer.json")?;
        let clip_tokenizer =
            Tokenizer::from_file(clip_tokenizer_path).map_err(|e| anyhow::anyhow!("{e}"))?;

        let t5_weights = t5_repo.get("model.safetensors")?;
        let t5_vb = unsafe {
            candle_nn::VarBuilder::from_mmaped_safetensors(&[t5_weights], dtype, device)?
        };
        let t5_encoder = t5::T5EncoderModel::load(t5_vb, &t5_config())?;

        let clip_weights = clip_repo.get("model.safetensors")?;
        let clip_vb = unsafe {
            candle_nn::VarBuilder::from_mmaped_safetensors(&[clip_weights], dtype, device)?
        };
        let clip_encoder =
            candle_clip::text_model::ClipTextTransformer::new(clip_vb, &clip_text_config())?;

        let flux_weights = flux_repo.get("flux1-schnell.safetensors")?;
        let flux_vb = unsafe {
            candle_nn::VarBuilder::from_mmaped_safetensors(&[flux_weights], dtype, device)?
        };
        let flux_model = flux::model::Flux::new(&flux::model::Config::schnell(), flux_vb)?;

        let ae_weights = flux_repo.get("ae.safetensors")?;
        let ae_vb = unsafe {
            candle_nn::VarBuilder::from_mmaped_safetensors(&[ae_weights], dtype, device)?
        };
        let autoencoder = flux::autoencoder::AutoEncoder::new(&autoencoder_config(), ae_vb)?;

        Ok(Self {
            flux_model,
            autoencoder,
            t5_encoder,
            clip_encoder,
            t5_tokenizer,
            clip_tokenizer,
            device: device.clone(),
            dtype,
        })
    }

    fn encode_prompt(&mut self, prompt: &str, max_len: usize) -> Result<(Tensor, Tensor)> {
        let t5_ids = self
            .t5_tokenizer
            .encode(prompt, true)
            .map_err(|e| stage_err(format!("t5 tokenize: {e}")))?
            .get_ids()
            .to_vec();
        let mut t5_ids = t5_ids;
        t5_ids.resize(max_len, 0);
        let t5_tensor = Tensor::new(&t5_ids[..], &self.device)
            .map_err(ShieldError::from)?
            .unsqueeze(0)
            .map_err(ShieldError::from)?;
        let t5_emb = self
            .t5_encoder
            .forward(&t5_tensor)
            .map_err(ShieldError::from)?;

        let clip_ids = self
            .clip_tokenizer
            .encode(prompt, true)
            .map_err(|e| stage_err(format!("clip tokenize: {e}")))?
            .get_ids()
            .to_vec();
        let mut clip_ids = clip_ids;
        clip_ids.resize(77, 0);
        let clip_tensor = Tensor::new(&clip_ids[..], &self.device)
            .map_err(ShieldError::from)?
            .unsqueeze(0)
            .map_err(ShieldError::from)?;
        let clip_emb = self
            .clip_encoder
            .forward(&clip_tensor)
            .map_err(ShieldError::from)?;

        Ok((t5_emb.to_dtype(self.dtype).map_err(ShieldError::from)?, clip_emb))
    }

    /// Euler-method denoising loop (spec §4.7 V2: "strength 0.6, 4 steps,
    /// guidance 0.0" for img2img; txt2img at `max_sequence_length=256`).
    fn denoise(
        &self,
        mut img: Tensor,
        t5_emb: &Tensor,
        clip_emb: &Tensor,
        steps: usize,
        guidance: f64,
        img_h: usize,
        img_w: usize,
        skip_from: usize,
    ) -> Result<Tensor> {
        let latent_h = img_h / 8;
        let latent_w = img_w / 8;
        let seq_len = (latent_h / 2) * (latent_w / 2);

        let state = flux::sampling::State::new(t5_emb, clip_emb, &img).map_err(ShieldError::from)?;
        let timesteps = flux::sampling::get_schedule(steps, Some((seq_len, 0.5, 1.15)));

        let guidance_tensor = Tensor::full(guidance as f32, (1,), &self.device).map_err(ShieldError::from)?;

        for window in timesteps[skip_from..].windows(2) {
            let (t_curr, t_prev) = (window[0], window[1]);
            let t_vec = Tensor::full(t_curr as f32, (1,), &self.device).map_err(ShieldError::from)?;
            let pred = self
                .flux_model
                .forward(
                    &img,
                    &state.img_ids,
                    &state.txt,
                    &state.txt_ids,
                    &t_vec,
                    &state.vec,
                    Some(&guidance_tensor),
                )
                .map_err(ShieldError::from)?;
            img = (img + (pred * (t_prev - t_curr))?).map_err(ShieldError::from)?;
        }

        let _ = latent_w;
        Ok(img)
    }

    fn decode_latent(&self, latent: &Tensor, h: usize, w: usize) -> Result<RgbImage> {
        let latent_h = h / 8;
        let latent_w = w / 8;
        let unpacked = flux::sampling::unpack(latent, latent_h, latent_w).map_err(ShieldError::from)?;
        let decoded = self
            .autoencoder
            .decode(&unpacked)
            .map_err(ShieldError::from)?;
        tensor_to_rgb(&decoded)
    }

    /// Img2img reconstruction at the spec's attack strength: partially
    /// renoise the source latent then run a short Euler schedule back to
    /// image space.
    pub fn img2img(&mut self, source: &RgbImage, prompt: &str, strength: f64) -> Result<RgbImage> {
        let (w, h) = (source.width() as usize, source.height() as usize);
        let (t5_emb, clip_emb) = self.encode_prompt(prompt, 256)?;

        let source_tensor = rgb_to_tensor(source, &self.device)?.to_dtype(self.dtype).map_err(ShieldError::from)?;
        let init_latent = self
            .autoencoder
            .encode(&source_tensor)
            .map_err(ShieldError::from)?;
        let packed = flux::sampling::pack(&init_latent).map_err(ShieldError::from)?;

        let steps = 4usize;
        let skip_from = steps - ((steps as f64) * strength).round() as usize;
        let skip_from = skip_from.min(steps.saturating_sub(1));

        let denoised = self.denoise(packed, &t5_emb, &clip_emb, steps, 0.0, h, w, skip_from)?;
        self.decode_latent(&denoised, h, w)
    }

    /// Pure generation from the caption (spec §4.7 V2 "reconstruction from
    /// the semantic caption alone").
    pub fn txt2img(&mut self, prompt: &str, width: usize, height: usize) -> Result<RgbImage> {
        let (t5_emb, clip_emb) = self.encode_prompt(prompt, 256)?;
        let latent_h = height / 8;
        let latent_w = width / 8;
        let noise = Tensor::randn(0f32, 1f32, (1, 16, latent_h, latent_w), &self.device)
            .map_err(ShieldError::from)?
            .to_dtype(self.dtype)
            .map_err(ShieldError::from)?;
        let packed = flux::sampling::pack(&noise).map_err(ShieldError::from)?;
        let denoised = self.denoise(packed, &t5_emb, &clip_emb, 4, 0.0, height, width, 0)?;
        self.decode_latent(&denoised, height, width)
    }
}

fn rgb_to_tensor(img: &RgbImage, device: &Device) -> Result<Tensor> {
    let (w, h) = img.dimensions();
    let data = img.as_raw();
    let tensor = Tensor::from_vec(data.clone(), (h as usize, w as usize, 3), device)
        .map_err(ShieldError::from)?
        .permute((2, 0, 1))
        .map_err(ShieldError::from)?
        .to_dtype(DType::F32)
        .map_err(ShieldError::from)?;
    ((tensor / 255.0).map_err(ShieldError::from)? * 2.0 - 1.0)
        .map_err(ShieldError::from)?
        .unsqueeze(0)
        .map_err(ShieldError::from)
}

fn tensor_to_rgb(img: &Tensor) -> Result<RgbImage> {
    let img = ((img.clamp(-1f32, 1f32).map_err(ShieldError::from)? + 1.0).map_err(ShieldError::from)? * 127.5)
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
