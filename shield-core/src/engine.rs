//! Adversarial Perturbation Engine (C4, spec §4.4) — the core of the core.
//!
//! Maintains `delta` as a `candle_core::Var` so `candle`'s autograd can track
//! gradients on it alone: the encoders and LPIPS backbone are loaded as plain
//! (non-`Var`) tensors, so no gradient tape node is ever created for a frozen
//! parameter (invariant I2), while `delta` accumulates one throughout the
//! step's forward pass.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use candle_core::{DType, Device, Tensor, Var};
use hf_hub::api::sync::Api;
use image::RgbImage;
use once_cell::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::config::{Configuration, IntensityPreset};
use crate::encoders::EncoderBank;
use crate::error::{Result, ShieldError};
use crate::job::EngineMetrics;
use crate::lpips::Lpips;
use crate::target::Targets;
use crate::tensor_ops::{bicubic_resize_plane, cosine_similarity_mean, l2_normalize, to_signed_domain};

pub const WORK_SIZE: usize = 512;

/// Wall-clock ceiling for one PGD run (spec §5 "perturbation <= 30 min").
pub const PERTURBATION_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30 * 60);

/// C4 state machine (spec §4.4 "IDLE -> LOADING -> READY -> RUNNING -> DONE").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Loading,
    Ready,
    Running,
    Done,
}

struct EngineModels {
    bank: EncoderBank,
    lpips: Lpips,
}

/// Holds the frozen encoders and LPIPS backbone for one container's lifetime
/// and drives the PGD loop. `_ensure_loaded` is idempotent (spec §4.4); a
/// single `running` flag enforces "RUNNING is single-step; no re-entrancy
/// within a container" without holding a lock for the duration of a job.
pub struct PerturbationEngine {
    device: Device,
    state: Mutex<EngineState>,
    running: AtomicBool,
    models: OnceCell<EngineModels>,
}

impl PerturbationEngine {
    pub fn new(device: Device) -> Self {
        Self {
            device,
            state: Mutex::new(EngineState::Idle),
            running: AtomicBool::new(false),
            models: OnceCell::new(),
        }
    }

    pub fn state(&self) -> EngineState {
        *self.state.lock().expect("engine state mutex poisoned")
    }

    /// Loads CLIP, SigLIP, and the LPIPS backbone once per container. Safe to
    /// call on every job; subsequent calls are a no-op.
    fn ensure_loaded(&self) -> Result<&EngineModels> {
        self.models.get_or_try_init(|| {
            *self.state.lock().expect("engine state mutex poisoned") = EngineState::Loading;
            info!("loading perturbation engine models");
            let bank = EncoderBank::load(self.device.clone())?;
            let api = Api::new().map_err(|e| ShieldError::EngineLoadFailed(e.to_string()))?;
            let dtype = crate::encoders::encoder_dtype(&self.device);
            let lpips = Lpips::load(&api, &self.device, dtype)
                .map_err(|e| ShieldError::EngineLoadFailed(format!("lpips: {e}")))?;
            *self.state.lock().expect("engine state mutex poisoned") = EngineState::Ready;
            Ok(EngineModels { bank, lpips })
        })
    }

    /// Run one protection job to completion (spec §4.4 contract). `base_full`
    /// is the decoded, resolution-capped source image.
    pub fn protect(&self, base_full: &RgbImage, config: &Configuration) -> Result<EngineOutput> {
        let models = self.ensure_loaded()?;

        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ShieldError::EngineFatal(
                "perturbation engine is not re-entrant within a container".to_string(),
            ));
        }
        *self.state.lock().expect("engine state mutex poisoned") = EngineState::Running;

        let result = (|| {
            let base_full_tensor = image_to_tensor(base_full, &self.device)?;
            let base_work = crate::tensor_ops::bilinear_resize(
                &base_full_tensor,
                WORK_SIZE,
                WORK_SIZE,
                &self.device,
            )?;
            let targets = Targets::build(&models.bank, &base_work, &config.decoy_prompts)?;
            let preset = config.resolved_pgd_params();
            run(
                &models.bank,
                &models.lpips,
                &targets,
                base_full,
                &base_work,
                &preset,
                config.apply_poison,
                config.apply_concept_poison,
                &self.device,
            )
        })();

        self.running.store(false, Ordering::SeqCst);
        *self.state.lock().expect("engine state mutex poisoned") = EngineState::Done;
        result
    }

    /// Async wrapper enforcing the wall-clock ceiling (spec §5). The PGD loop
    /// itself is CPU/GPU-bound and must not occupy an async executor thread,
    /// so it runs inside `spawn_blocking` (matching the teacher's pattern of
    /// keeping model inference off the reactor in `mistralrs-core`).
    pub async fn protect_with_timeout(
        self: std::sync::Arc<Self>,
        base_full: RgbImage,
        config: Configuration,
    ) -> Result<EngineOutput> {
        let task = tokio::task::spawn_blocking(move || self.protect(&base_full, &config));
        match tokio::time::timeout(PERTURBATION_TIMEOUT, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(ShieldError::EngineFatal(format!(
                "perturbation task panicked: {join_err}"
            ))),
            Err(_) => Err(ShieldError::EngineFatal(
                "perturbation engine exceeded its 30 minute wall-clock ceiling".to_string(),
            )),
        }
    }
}

/// Output of one full PGD run: the finalized image at the original resolution
/// plus the metrics record spec §4.4 optionally returns.
pub struct EngineOutput {
    pub image: RgbImage,
    pub metrics: EngineMetrics,
}

/// Decode a full-resolution RGB image into the `(1,3,H,W)` `[0,1]` tensor
/// working domain (spec §4.4 "Decode to RGB in [0,1]").
pub fn image_to_tensor(img: &RgbImage, device: &Device) -> Result<Tensor> {
    let (w, h) = img.dimensions();
    let mut planes = vec![0f32; 3 * h as usize * w as usize];
    let plane_len = (h * w) as usize;
    for (x, y, px) in img.enumerate_pixels() {
        let idx = (y * w + x) as usize;
        for c in 0..3 {
            planes[c * plane_len + idx] = px[c] as f32 / 255.0;
        }
    }
    Tensor::from_vec(planes, (1, 3, h as usize, w as usize), device).map_err(Into::into)
}

/// Run the PGD attack to completion (spec §4.4 PGD step, loss composition,
/// finalization). `base_full` is the original-resolution decoded image;
/// `base_work` is its 512x512 bilinear downsample, the tensor the attack
/// actually iterates on.
pub fn run(
    bank: &EncoderBank,
    lpips: &Lpips,
    targets: &Targets,
    base_full: &RgbImage,
    base_work: &Tensor,
    preset: &IntensityPreset,
    apply_poison: bool,
    apply_concept_poison: bool,
    device: &Device,
) -> Result<EngineOutput> {
    let started = Instant::now();
    let delta = Var::zeros((1, 3, WORK_SIZE, WORK_SIZE), DType::F32, device)?;

    let mut final_loss = 0f32;
    let mut steps_executed = 0usize;

    for step in 0..preset.steps {
        match pgd_step(
            bank,
            lpips,
            targets,
            base_work,
            &delta,
            preset,
            apply_poison,
            apply_concept_poison,
            step,
        ) {
            Ok(loss) => {
                final_loss = loss;
                steps_executed += 1;
            }
            Err(e) => {
                // Recoverable per spec §7 ENGINE_STEP_FAILED: delta keeps its
                // last valid projected state and the loop continues.
                warn!(step, error = %e, "PGD step failed, retaining last delta");
            }
        }
        if step % 25 == 0 {
            debug!(step, loss = final_loss, "pgd progress");
        }
    }

    let delta_final = delta.as_tensor().detach();
    let (w, h) = base_full.dimensions();
    let final_image = finalize(base_full, &delta_final, w, h)?;

    Ok(EngineOutput {
        image: final_image,
        metrics: EngineMetrics {
            final_loss,
            steps_executed,
            epsilon: preset.epsilon,
            wall_time_secs: started.elapsed().as_secs_f64(),
        },
    })
}

/// One PGD iteration: forward, backward, FGSM-sign update, dual projection
/// (spec §4.4 "PGD step"). Returns the scalar loss value on success.
fn pgd_step(
    bank: &EncoderBank,
    lpips: &Lpips,
    targets: &Targets,
    base_work: &Tensor,
    delta: &Var,
    preset: &IntensityPreset,
    apply_poison: bool,
    apply_concept_poison: bool,
    step: usize,
) -> Result<f32> {
    let adv = base_work.broadcast_add(delta.as_tensor())?.clamp(0f32, 1f32)?;

    let e_c = l2_normalize(&bank.clip_image(&adv)?)?;
    let e_s = l2_normalize(&bank.siglip_image(&adv)?)?;

    let cos_c_self = cosine_similarity_mean(&e_c, &targets.e_clip_self)?;
    let cos_s_self = cosine_similarity_mean(&e_s, &targets.e_siglip_self)?;
    let cos_c_txt = cosine_similarity_mean(&e_c, &targets.t_clip)?;
    let cos_s_txt = cosine_similarity_mean(&e_s, &targets.t_siglip)?;

    let l_perc = lpips.distance(&to_signed_domain(&adv)?, &to_signed_domain(base_work)?)?;

    let device = adv.device();
    let zero = Tensor::new(0f32, device)?;

    let l_pixel = if apply_poison {
        ((cos_c_self + cos_s_self)? * preset.w_repel as f64)?
    } else {
        zero.clone()
    };
    let l_concept = if apply_concept_poison {
        let one = Tensor::new(1f32, device)?;
        let attract = ((one.broadcast_sub(&cos_c_txt)? + one.broadcast_sub(&cos_s_txt)?)?
            * preset.w_attract as f64)?;
        attract
    } else {
        zero
    };

    let l_total = (l_pixel + (l_concept * 10.0)?)?;
    let l_total = (l_total + (l_perc * preset.w_lpips as f64)?)?;

    let loss_value = l_total.to_dtype(DType::F32)?.to_vec0::<f32>()?;
    if !loss_value.is_finite() {
        return Err(ShieldError::EngineStepFailed {
            step,
            reason: "non-finite loss".to_string(),
        });
    }

    let grads = l_total.backward()?;
    let grad = grads
        .get(delta.as_tensor())
        .ok_or_else(|| ShieldError::EngineStepFailed {
            step,
            reason: "no gradient recorded for delta".to_string(),
        })?;

    let grad_vals = grad.flatten_all()?.to_vec1::<f32>()?;
    if grad_vals.iter().any(|v| !v.is_finite()) {
        return Err(ShieldError::EngineStepFailed {
            step,
            reason: "non-finite gradient".to_string(),
        });
    }

    let sign = grad.sign()?;
    let stepped = (delta.as_tensor() - (sign * preset.alpha_step as f64)?)?;
    let projected = stepped.clamp(-preset.epsilon, preset.epsilon)?;
    let lower = (base_work * -1.0)?;
    let upper = Tensor::new(1f32, device)?.broadcast_sub(base_work)?;
    let projected = projected.maximum(&lower)?.minimum(&upper)?;

    delta.set(&projected)?;
    Ok(loss_value)
}

/// Finalize: upscale `delta` bicubically (no corner align) to the original
/// resolution, add to the undownsampled image, clamp, re-encode (spec §4.4
/// "Finalization").
fn finalize(base_full: &RgbImage, delta: &Tensor, width: u32, height: u32) -> Result<RgbImage> {
    let flat = delta.flatten_all()?.to_vec1::<f32>()?;
    let plane_len = WORK_SIZE * WORK_SIZE;
    let mut full = RgbImage::new(width, height);

    let mut upscaled_planes = Vec::with_capacity(3);
    for c in 0..3 {
        let plane = &flat[c * plane_len..(c + 1) * plane_len];
        upscaled_planes.push(bicubic_resize_plane(
            plane,
            WORK_SIZE,
            WORK_SIZE,
            height as usize,
            width as usize,
        ));
    }

    for (x, y, px) in full.enumerate_pixels_mut() {
        let idx = (y * width + x) as usize;
        let base_px = base_full.get_pixel(x, y);
        let mut out = [0u8; 3];
        for c in 0..3 {
            let base_val = base_px[c] as f32 / 255.0;
            let value = (base_val + upscaled_planes[c][idx]).clamp(0.0, 1.0);
            out[c] = (value * 255.0).round() as u8;
        }
        *px = image::Rgb(out);
    }
    Ok(full)
}
