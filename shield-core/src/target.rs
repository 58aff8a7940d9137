//! Target Builder (C3, spec §4.2): computes the four detached unit vectors
//! the Adversarial Perturbation Engine attacks against, once per job.

use candle_core::{Result, Tensor};

use crate::encoders::EncoderBank;

/// `e_clip_self`, `e_siglip_self`, `t_clip`, `t_siglip` — all detached, never
/// receive gradients (spec §4.2 "All targets are detached").
pub struct Targets {
    pub e_clip_self: Tensor,
    pub e_siglip_self: Tensor,
    pub t_clip: Tensor,
    pub t_siglip: Tensor,
}

impl Targets {
    /// `base_work`: `(1, 3, 512, 512)` in `[0,1]`. `decoy_prompts` is the
    /// configured (or default) decoy concept list.
    pub fn build(
        bank: &EncoderBank,
        base_work: &Tensor,
        decoy_prompts: &[String],
    ) -> crate::error::Result<Self> {
        let e_clip_self = bank.clip_image(base_work)?.detach();
        let e_siglip_self = bank.siglip_image(base_work)?.detach();

        let t_clip = mean_unit_vector(bank.clip_text(decoy_prompts)?)?.detach();
        let t_siglip = mean_unit_vector(bank.siglip_text(decoy_prompts)?)?.detach();

        Ok(Self {
            e_clip_self,
            e_siglip_self,
            t_clip,
            t_siglip,
        })
    }
}

/// Mean-pool a batch of per-prompt embeddings then re-normalize to a unit
/// vector (spec §4.2 "L2-normalized mean of text embeddings across prompts").
fn mean_unit_vector(embeddings: Tensor) -> Result<Tensor> {
    let mean = embeddings.mean(0)?.unsqueeze(0)?;
    crate::tensor_ops::l2_normalize(&mean)
}
