//! SigLIP-SO400M/14-384 wrapper (spec §4.1), hand-rolled on `candle_nn`
//! primitives — `candle_transformers` in this corpus ships no SigLIP config,
//! so the vision/text towers are built directly: patch embedding → pre-norm
//! transformer encoder → attention-pooling head (vision) or last-token
//! pooling (text), matching the published SigLIP architecture shape.

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use candle_nn::{
    conv2d_no_bias, embedding, layer_norm, linear, Conv2d, Conv2dConfig, Embedding, LayerNorm,
    Linear, Module, VarBuilder,
};
use hf_hub::api::sync::Api;
use tokenizers::Tokenizer;

use crate::tensor_ops::{bilinear_resize, l2_normalize};

const MODEL_ID: &str = "google/siglip-so400m-patch14-384";
const IMAGE_SIZE: usize = 384;
const PATCH_SIZE: usize = 14;
const HIDDEN_SIZE: usize = 1152;
const INTERMEDIATE_SIZE: usize = 4304;
const NUM_LAYERS: usize = 27;
const NUM_HEADS: usize = 16;
const HEAD_DIM: usize = HIDDEN_SIZE / NUM_HEADS;
const TEXT_VOCAB_SIZE: usize = 32000;
const TEXT_MAX_POSITIONS: usize = 64;
const LN_EPS: f64 = 1e-6;

struct Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
}

impl Attention {
    fn load(vb: VarBuilder) -> candle_core::Result<Self> {
        Ok(Self {
            q_proj: linear(HIDDEN_SIZE, HIDDEN_SIZE, vb.pp("q_proj"))?,
            k_proj: linear(HIDDEN_SIZE, HIDDEN_SIZE, vb.pp("k_proj"))?,
            v_proj: linear(HIDDEN_SIZE, HIDDEN_SIZE, vb.pp("v_proj"))?,
            out_proj: linear(HIDDEN_SIZE, HIDDEN_SIZE, vb.pp("out_proj"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let (b, n, _) = x.dims3()?;
        let shape = (b, n, NUM_HEADS, HEAD_DIM);
        let q = self.q_proj.forward(x)?.reshape(shape)?.transpose(1, 2)?;
        let k = self.k_proj.forward(x)?.reshape(shape)?.transpose(1, 2)?;
        let v = self.v_proj.forward(x)?.reshape(shape)?.transpose(1, 2)?;

        let scale = (HEAD_DIM as f64).powf(-0.5);
        let attn = (q.contiguous()?.matmul(&k.transpose(2, 3)?.contiguous()?)? * scale)?;
        let attn = candle_nn::ops::softmax_last_dim(&attn)?;
        let out = attn.matmul(&v.contiguous()?)?;
        let out = out.transpose(1, 2)?.reshape((b, n, HIDDEN_SIZE))?;
        self.out_proj.forward(&out)
    }
}

struct Mlp {
    fc1: Linear,
    fc2: Linear,
}

impl Mlp {
    fn load(vb: VarBuilder) -> candle_core::Result<Self> {
        Ok(Self {
            fc1: linear(HIDDEN_SIZE, INTERMEDIATE_SIZE, vb.pp("fc1"))?,
            fc2: linear(INTERMEDIATE_SIZE, HIDDEN_SIZE, vb.pp("fc2"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        self.fc2.forward(&self.fc1.forward(x)?.gelu()?)
    }
}

struct EncoderLayer {
    layer_norm1: LayerNorm,
    self_attn: Attention,
    layer_norm2: LayerNorm,
    mlp: Mlp,
}

impl EncoderLayer {
    fn load(vb: VarBuilder) -> candle_core::Result<Self> {
        Ok(Self {
            layer_norm1: layer_norm(HIDDEN_SIZE, LN_EPS, vb.pp("layer_norm1"))?,
            self_attn: Attention::load(vb.pp("self_attn"))?,
            layer_norm2: layer_norm(HIDDEN_SIZE, LN_EPS, vb.pp("layer_norm2"))?,
            mlp: Mlp::load(vb.pp("mlp"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let residual = x;
        let x = self.self_attn.forward(&self.layer_norm1.forward(x)?)?;
        let x = (residual + x)?;
        let residual = &x;
        let mlp_out = self.mlp.forward(&self.layer_norm2.forward(&x)?)?;
        residual + mlp_out
    }
}

struct Encoder {
    layers: Vec<EncoderLayer>,
}

impl Encoder {
    fn load(vb: VarBuilder) -> candle_core::Result<Self> {
        let mut layers = Vec::with_capacity(NUM_LAYERS);
        let vb = vb.pp("layers");
        for i in 0..NUM_LAYERS {
            layers.push(EncoderLayer::load(vb.pp(i))?);
        }
        Ok(Self { layers })
    }

    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let mut x = x.clone();
        for layer in &self.layers {
            x = layer.forward(&x)?;
        }
        Ok(x)
    }
}

/// Attention-pooling head: a single learnable probe attends over the patch
/// tokens to collapse `(N, num_patches, hidden)` into `(N, hidden)`, matching
/// SigLIP's `MultiheadAttentionPoolingHead` rather than a plain mean-pool.
struct AttentionPool {
    probe: Tensor,
    attn: Attention,
    layer_norm: LayerNorm,
    mlp: Mlp,
}

impl AttentionPool {
    fn load(vb: VarBuilder) -> candle_core::Result<Self> {
        Ok(Self {
            probe: vb.get((1, 1, HIDDEN_SIZE), "probe")?,
            attn: Attention::load(vb.pp("attention"))?,
            layer_norm: layer_norm(HIDDEN_SIZE, LN_EPS, vb.pp("layernorm"))?,
            mlp: Mlp::load(vb.pp("mlp"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let (b, _, _) = x.dims3()?;
        let probe = self.probe.broadcast_as((b, 1, HIDDEN_SIZE))?;
        let joint = Tensor::cat(&[&probe, x], 1)?;
        let pooled = self.attn.forward(&joint)?.narrow(1, 0, 1)?;
        let residual = &pooled;
        let mlp_out = self.mlp.forward(&self.layer_norm.forward(&pooled)?)?;
        (residual + mlp_out)?.squeeze(1)
    }
}

struct VisionTower {
    patch_embed: Conv2d,
    position_embedding: Embedding,
    encoder: Encoder,
    post_layernorm: LayerNorm,
    head: AttentionPool,
    num_patches_per_side: usize,
}

impl VisionTower {
    fn load(vb: VarBuilder) -> candle_core::Result<Self> {
        let conv_cfg = Conv2dConfig {
            stride: PATCH_SIZE,
            ..Default::default()
        };
        let patch_embed = conv2d_no_bias(3, HIDDEN_SIZE, PATCH_SIZE, conv_cfg, vb.pp("embeddings.patch_embedding"))?;
        let num_patches_per_side = IMAGE_SIZE / PATCH_SIZE;
        let num_patches = num_patches_per_side * num_patches_per_side;
        let position_embedding = embedding(num_patches, HIDDEN_SIZE, vb.pp("embeddings.position_embedding"))?;
        let encoder = Encoder::load(vb.pp("encoder"))?;
        let post_layernorm = layer_norm(HIDDEN_SIZE, LN_EPS, vb.pp("post_layernorm"))?;
        let head = AttentionPool::load(vb.pp("head"))?;
        Ok(Self {
            patch_embed,
            position_embedding,
            encoder,
            post_layernorm,
            head,
            num_patches_per_side,
        })
    }

    fn forward(&self, pixel_values: &Tensor) -> candle_core::Result<Tensor> {
        let patches = self.patch_embed.forward(pixel_values)?; // (N, hidden, ps, ps)
        let (n, c, h, w) = patches.dims4()?;
        let patches = patches.reshape((n, c, h * w))?.transpose(1, 2)?; // (N, num_patches, hidden)
        let num_patches = self.num_patches_per_side * self.num_patches_per_side;
        let positions = Tensor::arange(0u32, num_patches as u32, patches.device())?;
        let pos_embed = self.position_embedding.forward(&positions)?.unsqueeze(0)?;
        let x = patches.broadcast_add(&pos_embed)?;
        let x = self.encoder.forward(&x)?;
        let x = self.post_layernorm.forward(&x)?;
        self.head.forward(&x)
    }
}

struct TextTower {
    token_embedding: Embedding,
    position_embedding: Embedding,
    encoder: Encoder,
    final_layer_norm: LayerNorm,
    head: Linear,
}

impl TextTower {
    fn load(vb: VarBuilder) -> candle_core::Result<Self> {
        Ok(Self {
            token_embedding: embedding(TEXT_VOCAB_SIZE, HIDDEN_SIZE, vb.pp("embeddings.token_embedding"))?,
            position_embedding: embedding(TEXT_MAX_POSITIONS, HIDDEN_SIZE, vb.pp("embeddings.position_embedding"))?,
            encoder: Encoder::load(vb.pp("encoder"))?,
            final_layer_norm: layer_norm(HIDDEN_SIZE, LN_EPS, vb.pp("final_layer_norm"))?,
            head: linear(HIDDEN_SIZE, HIDDEN_SIZE, vb.pp("head"))?,
        })
    }

    fn forward(&self, input_ids: &Tensor) -> candle_core::Result<Tensor> {
        let (_, seq_len) = input_ids.dims2()?;
        let tokens = self.token_embedding.forward(input_ids)?;
        let positions = Tensor::arange(0u32, seq_len as u32, input_ids.device())?;
        let pos_embed = self.position_embedding.forward(&positions)?.unsqueeze(0)?;
        let x = tokens.broadcast_add(&pos_embed)?;
        let x = self.encoder.forward(&x)?;
        let x = self.final_layer_norm.forward(&x)?;
        // SigLIP pools the last token's hidden state (right-padded sequences,
        // no causal mask needed since the encoder is bidirectional).
        let last = x.narrow(1, seq_len - 1, 1)?.squeeze(1)?;
        self.head.forward(&last)
    }
}

pub struct SiglipEncoder {
    vision: VisionTower,
    text: TextTower,
    tokenizer: Tokenizer,
    device: Device,
    dtype: DType,
}

impl SiglipEncoder {
    pub fn load(api: &Api, device: &Device, dtype: DType) -> Result<Self> {
        let repo = api.model(MODEL_ID.to_string());
        let weights = repo.get("model.safetensors")?;
        let tokenizer_path = repo.get("tokenizer.json")?;

        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights], dtype, device)? };
        let vision = VisionTower::load(vb.pp("vision_model"))?;
        let text = TextTower::load(vb.pp("text_model"))?;
        let tokenizer =
            Tokenizer::from_file(tokenizer_path).map_err(|e| anyhow::anyhow!("{e}"))?;

        Ok(Self {
            vision,
            text,
            tokenizer,
            device: device.clone(),
            dtype,
        })
    }

    /// Resize to 384x384 bilinear, normalize to `[-1,1]`, run the frozen
    /// vision tower, L2-normalize the 1152-dim embedding.
    pub fn embed_image(&self, x: &Tensor) -> Result<Tensor> {
        let resized = bilinear_resize(x, IMAGE_SIZE, IMAGE_SIZE, &self.device)?;
        let normalized = ((resized * 2.0)? - 1.0)?.to_dtype(self.dtype)?;
        let features = self.vision.forward(&normalized)?;
        l2_normalize(&features.to_dtype(DType::F32)?).map_err(Into::into)
    }

    pub fn embed_text(&self, prompts: &[String]) -> Result<Tensor> {
        let mut rows = Vec::with_capacity(prompts.len());
        for prompt in prompts {
            let encoding = self
                .tokenizer
                .encode(prompt.as_str(), true)
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            let mut ids: Vec<u32> = encoding.get_ids().to_vec();
            // SigLIP text tokenization pads/truncates to a fixed max length
            // rather than CLIP's default (shorter) padding (spec §4.1).
            ids.truncate(TEXT_MAX_POSITIONS);
            ids.resize(TEXT_MAX_POSITIONS, 1); // pad id
            rows.push(ids);
        }
        let flat: Vec<u32> = rows.into_iter().flatten().collect();
        let input_ids = Tensor::from_vec(flat, (prompts.len(), TEXT_MAX_POSITIONS), &self.device)?;
        let features = self.text.forward(&input_ids)?;
        l2_normalize(&features.to_dtype(DType::F32)?).map_err(Into::into)
    }
}
