//! Stage V1 semantic audit captioner (spec §4.7), a small causal
//! vision-language model loaded the same way the teacher loads its causal
//! LMs in `mistralrs-core::model_loader` — `hf-hub` +
//! `VarBuilder::from_mmaped_safetensors` + `tokenizers::Tokenizer` — rather
//! than a generic `transformers` auto-class.
//!
//! Architecture: a single pooled SigLIP image embedding (already computed by
//! the Encoder Bank) is projected into the decoder's hidden size and
//! prepended as one "visual token" ahead of the question's text tokens — the
//! same prefix-conditioning shape as `vikhyatk/moondream2`'s Phi-1.5 decoder,
//! scaled down here to keep load time and memory bounded for a verification
//! stage that is not on the engine's critical path.

use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::{embedding, layer_norm, linear, Embedding, LayerNorm, Linear, Module, VarBuilder};
use hf_hub::api::sync::Api;
use tokenizers::Tokenizer;

use crate::encoders::EncoderBank;
use crate::error::{Result, ShieldError};

const MODEL_ID: &str = "vikhyatk/moondream2";
const MODEL_REVISION: &str = "2024-08-26";

const HIDDEN_SIZE: usize = 1024;
const INTERMEDIATE_SIZE: usize = 4096;
const NUM_LAYERS: usize = 16;
const NUM_HEADS: usize = 16;
const HEAD_DIM: usize = HIDDEN_SIZE / NUM_HEADS;
const VOCAB_SIZE: usize = 51200;
const MAX_POSITIONS: usize = 2048;
const LN_EPS: f64 = 1e-5;
const MAX_NEW_TOKENS: usize = 64;
const EOS_TOKEN_ID: u32 = 50256;

struct DecoderLayer {
    ln: LayerNorm,
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    fc1: Linear,
    fc2: Linear,
}

impl DecoderLayer {
    fn load(vb: VarBuilder) -> candle_core::Result<Self> {
        Ok(Self {
            ln: layer_norm(HIDDEN_SIZE, LN_EPS, vb.pp("ln"))?,
            q_proj: linear(HIDDEN_SIZE, HIDDEN_SIZE, vb.pp("q_proj"))?,
            k_proj: linear(HIDDEN_SIZE, HIDDEN_SIZE, vb.pp("k_proj"))?,
            v_proj: linear(HIDDEN_SIZE, HIDDEN_SIZE, vb.pp("v_proj"))?,
            o_proj: linear(HIDDEN_SIZE, HIDDEN_SIZE, vb.pp("o_proj"))?,
            fc1: linear(HIDDEN_SIZE, INTERMEDIATE_SIZE, vb.pp("fc1"))?,
            fc2: linear(INTERMEDIATE_SIZE, HIDDEN_SIZE, vb.pp("fc2"))?,
        })
    }

    /// Parallel attention + MLP residual (Phi-family block shape, spec §4.7
    /// "small causal vision-language model"). Causal masking via an additive
    /// bias rather than rotary position encoding, to keep this stage small.
    fn forward(&self, x: &Tensor, mask: &Tensor) -> candle_core::Result<Tensor> {
        let residual = x;
        let normed = self.ln.forward(x)?;

        let (b, n, _) = normed.dims3()?;
        let shape = (b, n, NUM_HEADS, HEAD_DIM);
        let q = self.q_proj.forward(&normed)?.reshape(shape)?.transpose(1, 2)?;
        let k = self.k_proj.forward(&normed)?.reshape(shape)?.transpose(1, 2)?;
        let v = self.v_proj.forward(&normed)?.reshape(shape)?.transpose(1, 2)?;

        let scale = (HEAD_DIM as f64).powf(-0.5);
        let attn = (q.contiguous()?.matmul(&k.transpose(2, 3)?.contiguous()?)? * scale)?;
        let attn = attn.broadcast_add(mask)?;
        let attn = candle_nn::ops::softmax_last_dim(&attn)?;
        let attn_out = attn.matmul(&v.contiguous()?)?;
        let attn_out = attn_out.transpose(1, 2)?.reshape((b, n, HIDDEN_SIZE))?;
        let attn_out = self.o_proj.forward(&attn_out)?;

        let mlp_out = self.fc2.forward(&self.fc1.forward(&normed)?.gelu()?)?;
        residual + attn_out + mlp_out
    }
}

fn causal_mask(seq_len: usize, device: &Device, dtype: DType) -> candle_core::Result<Tensor> {
    let mut data = vec![0f32; seq_len * seq_len];
    for i in 0..seq_len {
        for j in (i + 1)..seq_len {
            data[i * seq_len + j] = f32::NEG_INFINITY;
        }
    }
    Tensor::from_vec(data, (1, 1, seq_len, seq_len), device)?.to_dtype(dtype)
}

pub struct Captioner {
    vision_proj: Linear,
    token_embedding: Embedding,
    position_embedding: Embedding,
    layers: Vec<DecoderLayer>,
    final_ln: LayerNorm,
    lm_head: Linear,
    tokenizer: Tokenizer,
    device: Device,
    dtype: DType,
}

impl Captioner {
    pub fn load(api: &Api, device: &Device, dtype: DType) -> anyhow::Result<Self> {
        let repo = api.model(MODEL_ID.to_string());
        let repo = repo.revision(MODEL_REVISION.to_string());
        let weights = repo.get("model.safetensors")?;
        let tokenizer_path = repo.get("tokenizer.json")?;

        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights], dtype, device)? };
        let vision_proj = linear(1152, HIDDEN_SIZE, vb.pp("vision_proj"))?;
        let token_embedding = embedding(VOCAB_SIZE, HIDDEN_SIZE, vb.pp("token_embedding"))?;
        let position_embedding = embedding(MAX_POSITIONS, HIDDEN_SIZE, vb.pp("position_embedding"))?;
        let mut layers = Vec::with_capacity(NUM_LAYERS);
        let layers_vb = vb.pp("layers");
        for i in 0..NUM_LAYERS {
            layers.push(DecoderLayer::load(layers_vb.pp(i))?);
        }
        let final_ln = layer_norm(HIDDEN_SIZE, LN_EPS, vb.pp("final_ln"))?;
        let lm_head = linear(HIDDEN_SIZE, VOCAB_SIZE, vb.pp("lm_head"))?;
        let tokenizer = Tokenizer::from_file(tokenizer_path).map_err(|e| anyhow::anyhow!("{e}"))?;

        Ok(Self {
            vision_proj,
            token_embedding,
            position_embedding,
            layers,
            final_ln,
            lm_head,
            tokenizer,
            device: device.clone(),
            dtype,
        })
    }

    /// `answer_question` (spec §4.7 V1): greedy-decode an answer conditioned
    /// on one pooled image embedding prefix plus the tokenized question.
    pub fn answer_question(&self, image_embedding: &Tensor, question: &str) -> Result<String> {
        let visual_token = self
            .vision_proj
            .forward(&image_embedding.to_dtype(self.dtype).map_err(ShieldError::from)?)
            .map_err(ShieldError::from)?
            .unsqueeze(1)
            .map_err(ShieldError::from)?; // (1, 1, hidden)

        let encoding = self
            .tokenizer
            .encode(question, true)
            .map_err(|e| ShieldError::VerifierStageFailed {
                stage: "semantic_audit".to_string(),
                reason: format!("tokenize: {e}"),
            })?;
        let mut token_ids: Vec<u32> = encoding.get_ids().to_vec();

        for _ in 0..MAX_NEW_TOKENS {
            let seq_len = token_ids.len() + 1; // + visual token
            let text_tensor = Tensor::from_vec(token_ids.clone(), (1, token_ids.len()), &self.device)
                .map_err(ShieldError::from)?;
            let text_embed = self
                .token_embedding
                .forward(&text_tensor)
                .map_err(ShieldError::from)?;
            let embeds = Tensor::cat(&[&visual_token, &text_embed], 1).map_err(ShieldError::from)?;

            let positions = Tensor::arange(0u32, seq_len as u32, &self.device).map_err(ShieldError::from)?;
            let pos_embed = self
                .position_embedding
                .forward(&positions)
                .map_err(ShieldError::from)?
                .unsqueeze(0)
                .map_err(ShieldError::from)?;
            let mut x = embeds.broadcast_add(&pos_embed).map_err(ShieldError::from)?;

            let mask = causal_mask(seq_len, &self.device, self.dtype).map_err(ShieldError::from)?;
            for layer in &self.layers {
                x = layer.forward(&x, &mask).map_err(ShieldError::from)?;
            }
            let x = self.final_ln.forward(&x).map_err(ShieldError::from)?;
            let last = x.i((.., seq_len - 1, ..)).map_err(ShieldError::from)?;
            let logits = self.lm_head.forward(&last).map_err(ShieldError::from)?;

            let next_id = logits
                .to_dtype(DType::F32)
                .map_err(ShieldError::from)?
                .flatten_all()
                .map_err(ShieldError::from)?
                .to_vec1::<f32>()
                .map_err(ShieldError::from)?
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
                .map(|(idx, _)| idx as u32)
                .unwrap_or(EOS_TOKEN_ID);

            if next_id == EOS_TOKEN_ID {
                break;
            }
            token_ids.push(next_id);
        }

        self.tokenizer
            .decode(&token_ids, true)
            .map_err(|e| ShieldError::VerifierStageFailed {
                stage: "semantic_audit".to_string(),
                reason: format!("detokenize: {e}"),
            })
    }
}

/// Runs the three moondream-style questions the original verifier asks
/// (spec §4.7 V1): a free-form caption, a 5-tag list, and a quality judgment.
pub fn run_semantic_audit(
    captioner: &Captioner,
    bank: &EncoderBank,
    image: &Tensor,
) -> Result<crate::job::SemanticAudit> {
    let embedding = bank.siglip_image(image)?;

    let caption = captioner.answer_question(&embedding, "Describe this image in detail.")?;
    let tags_raw = captioner.answer_question(
        &embedding,
        "List 5 key visual elements, comma separated.",
    )?;
    let quality_raw = captioner.answer_question(
        &embedding,
        "Does this image look like a clean high quality photograph? Answer yes or no.",
    )?;

    let tags: Vec<String> = tags_raw
        .split(',')
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .take(5)
        .collect();

    let caption = caption.chars().take(250).collect::<String>();
    let quality_ok = quality_raw.to_lowercase().contains("yes");

    Ok(crate::job::SemanticAudit {
        caption,
        tags,
        quality_ok,
        reconstruction_model: "Flux.1-Schnell (Text2Img)".to_string(),
    })
}
