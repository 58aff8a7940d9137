//! Verification Harness (C7, spec §4.7): runs the three reconstruction
//! attacks the original protection claims to survive, and reports whether
//! each one still produces a faithful copy.
//!
//! Grounded on `original_source/modal/poisoning/main.py`'s `VerifierEngine`:
//! the same load -> run -> unload sequencing per model (there called
//! `_load_moondream`/`_unload_moondream`, `_load_flux`/`_unload_flux`,
//! `_load_sdxl`/`_unload_sdxl`), the same three stages in the same order, and
//! the same fields folded into one `VerificationReport`.
//!
//! candle has no equivalent of `enable_sequential_cpu_offload` /
//! `enable_model_cpu_offload` — there is no layer-streaming hook in the
//! `VarBuilder` loading path. [`OffloadPolicy`] is the closest honest
//! approximation: it holds at most one stage's models at a time and drops
//! them (freeing device memory) before the next stage loads, rather than
//! genuinely streaming layers in and out of a forward pass.

mod captioner;
mod flux_attack;
mod sdxl_attack;

use std::sync::Mutex;
use std::time::Duration;

use candle_core::Device;
use hf_hub::api::sync::Api;
use image::RgbImage;
use tracing::{info, warn};

use crate::encoders::EncoderBank;
use crate::error::{Result, ShieldError};
use crate::job::{PixelAudit, VerificationReport, WatermarkAudit};
use crate::watermark;

use captioner::Captioner;
use flux_attack::FluxAttack;
use sdxl_attack::SdxlAttack;

/// Wall-clock ceiling per verification stage (spec §5 "verification stages
/// <= 10 min each").
pub const VERIFIER_STAGE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

const ATTACK_PROMPT: &str = "a high quality photograph, sharp focus, detailed";
const ATTACK_STRENGTH: f64 = 0.6;
const ATTACK_GUIDANCE: f64 = 0.0;

/// No-op marker type documenting that the original's attention-kernel patch
/// (working around a GQA shape bug in a specific `torch.sdpa` build) has no
/// candle counterpart: candle's attention implementations here are plain
/// `matmul`+`softmax`, which never hit that bug in the first place.
pub struct CompatibilityShim;

impl CompatibilityShim {
    pub fn apply() -> Self {
        CompatibilityShim
    }
}

/// Lazily loads each verification model on first use, in the caller's stage
/// order, and frees it once the stage's forward passes are done (the
/// candle-side analogue of the original's explicit load/unload pair per
/// model — see module docs).
struct OffloadPolicy {
    api: Api,
    device: Device,
    dtype: candle_core::DType,
}

impl OffloadPolicy {
    fn new(device: Device) -> anyhow::Result<Self> {
        Ok(Self {
            api: Api::new()?,
            device: device.clone(),
            dtype: crate::encoders::encoder_dtype(&device),
        })
    }

    fn load_captioner(&self) -> anyhow::Result<Captioner> {
        Captioner::load(&self.api, &self.device, self.dtype)
    }

    fn load_flux(&self) -> anyhow::Result<FluxAttack> {
        FluxAttack::load(&self.api, &self.device, self.dtype)
    }

    fn load_sdxl(&self) -> anyhow::Result<SdxlAttack> {
        SdxlAttack::load(&self.api, &self.device, self.dtype)
    }
}

/// Holds the shared Encoder Bank (used by the captioner for its SigLIP image
/// embedding) and drives the three verification stages. One instance per
/// container, like [`crate::engine::PerturbationEngine`].
pub struct VerifierHandle {
    device: Device,
    bank: Mutex<Option<std::sync::Arc<EncoderBank>>>,
    _shim: CompatibilityShim,
}

impl VerifierHandle {
    pub fn new(device: Device) -> Self {
        Self {
            device,
            bank: Mutex::new(None),
            _shim: CompatibilityShim::apply(),
        }
    }

    fn encoder_bank(&self) -> Result<std::sync::Arc<EncoderBank>> {
        let mut guard = self.bank.lock().expect("verifier encoder bank mutex poisoned");
        if let Some(bank) = guard.as_ref() {
            return Ok(bank.clone());
        }
        let bank = std::sync::Arc::new(EncoderBank::load(self.device.clone())?);
        *guard = Some(bank.clone());
        Ok(bank)
    }

    /// Run all applicable verification stages against the protected image
    /// and assemble one report (spec §4.7 "Output: one `VerificationReport`").
    fn verify(&self, image: &RgbImage, watermark_key: Option<String>) -> Result<VerificationReport> {
        let watermark_audit = watermark_key.as_ref().and_then(|key| {
            match watermark::detect_score(image, key) {
                Ok(score) => Some(WatermarkAudit {
                    detected: score >= 2.0,
                    score,
                }),
                Err(e) => {
                    warn!(error = %e, "watermark detection failed during verification");
                    None
                }
            }
        });

        let policy = OffloadPolicy::new(self.device.clone())
            .map_err(|e| ShieldError::VerifierStageFailed {
                stage: "load".to_string(),
                reason: e.to_string(),
            })?;

        let semantic_audit = {
            info!("verification: loading semantic captioner (V1)");
            let bank = self.encoder_bank()?;
            let image_tensor = crate::engine::image_to_tensor(image, &self.device)?;
            let work = crate::tensor_ops::bilinear_resize(&image_tensor, 384, 384, &self.device)?;
            match policy.load_captioner() {
                Ok(captioner) => match captioner::run_semantic_audit(&captioner, &bank, &work) {
                    Ok(audit) => Some(audit),
                    Err(e) => {
                        warn!(error = %e, "semantic audit stage failed");
                        None
                    }
                },
                Err(e) => {
                    warn!(error = %e, "failed to load semantic captioner");
                    None
                }
            }
        };
        // `policy.load_captioner()`'s return value (and the vision tower
        // activations it produced) are dropped here before V2 loads,
        // freeing device memory the way `_unload_moondream` did.

        let caption_prompt = semantic_audit
            .as_ref()
            .map(|a| a.caption.clone())
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| ATTACK_PROMPT.to_string());

        let mut primary_attack_url = None;
        let mut flux_success = false;
        {
            info!("verification: loading Flux.1-schnell (V2)");
            match policy.load_flux() {
                Ok(mut flux) => {
                    match flux.img2img(image, &caption_prompt, ATTACK_STRENGTH) {
                        Ok(attack_image) => {
                            flux_success = evaluate_reconstruction(&attack_image, image);
                            primary_attack_url = Some(encode_data_uri(&attack_image));
                        }
                        Err(e) => warn!(error = %e, "flux img2img attack failed"),
                    }
                    if let Err(e) = flux.txt2img(&caption_prompt, image.width() as usize, image.height() as usize) {
                        warn!(error = %e, "flux txt2img attack failed");
                    }
                }
                Err(e) => warn!(error = %e, "failed to load flux attacker"),
            }
        }

        let mut secondary_attack_url = None;
        let mut sdxl_success = false;
        {
            info!("verification: loading SDXL-Turbo (V3)");
            match policy.load_sdxl() {
                Ok(sdxl) => match sdxl.img2img(image, &caption_prompt, ATTACK_STRENGTH) {
                    Ok(attack_image) => {
                        sdxl_success = evaluate_reconstruction(&attack_image, image);
                        secondary_attack_url = Some(encode_data_uri(&attack_image));
                    }
                    Err(e) => warn!(error = %e, "sdxl img2img attack failed"),
                },
                Err(e) => warn!(error = %e, "failed to load sdxl attacker"),
            }
        }

        let pixel_audit = Some(PixelAudit {
            perceived_quality: semantic_audit
                .as_ref()
                .map(|a| if a.quality_ok { "clean".to_string() } else { "degraded".to_string() })
                .unwrap_or_else(|| "unknown".to_string()),
            attack_prompt: caption_prompt,
            attack_strength: ATTACK_STRENGTH as f32,
            attack_guidance: ATTACK_GUIDANCE as f32,
            primary_model: "Flux.1-Schnell".to_string(),
            secondary_model: "SDXL-Turbo".to_string(),
            flux_success,
            sdxl_success,
        });

        Ok(VerificationReport {
            semantic_audit,
            pixel_audit,
            watermark_audit,
            primary_attack_url,
            secondary_attack_url,
            semantic_attack_url: None,
            error: None,
        })
    }

    /// Async wrapper enforcing the per-run wall-clock ceiling (spec §5). Runs
    /// on a blocking thread for the same reason the perturbation engine does.
    pub async fn verify_with_timeout(
        self: std::sync::Arc<Self>,
        image: RgbImage,
        watermark_key: Option<String>,
    ) -> Result<VerificationReport> {
        let task = tokio::task::spawn_blocking(move || self.verify(&image, watermark_key));
        match tokio::time::timeout(VERIFIER_STAGE_TIMEOUT * 3, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(ShieldError::VerifierStageFailed {
                stage: "verification".to_string(),
                reason: format!("task panicked: {join_err}"),
            }),
            Err(_) => Err(ShieldError::VerifierStageFailed {
                stage: "verification".to_string(),
                reason: "verification harness exceeded its wall-clock ceiling".to_string(),
            }),
        }
    }
}

/// Cheap stand-in for the original's "does the attack still look like the
/// same artwork" pixel comparison: a mean absolute difference threshold.
/// Real perceptual comparison is already the perturbation engine's job (the
/// LPIPS backbone); re-loading it here for one scalar would cost another
/// full model load per verification run for no material benefit.
fn evaluate_reconstruction(attack: &RgbImage, original: &RgbImage) -> bool {
    if attack.dimensions() != original.dimensions() {
        return false;
    }
    let mut total = 0u64;
    let mut count = 0u64;
    for (a, b) in attack.pixels().zip(original.pixels()) {
        for c in 0..3 {
            total += (a[c] as i32 - b[c] as i32).unsigned_abs() as u64;
            count += 1;
        }
    }
    let mean_abs_diff = total as f64 / count as f64;
    // A successful reconstruction attack looks close to the original; a
    // mean channel difference under this threshold means the protection
    // failed to survive the attack.
    mean_abs_diff < 40.0
}

fn encode_data_uri(img: &RgbImage) -> String {
    use base64::Engine;
    let mut bytes = Vec::new();
    let encoder = image::codecs::png::PngEncoder::new(&mut bytes);
    let _ = image::ImageEncoder::write_image(
        encoder,
        img.as_raw(),
        img.width(),
        img.height(),
        image::ExtendedColorType::Rgb8,
    );
    format!(
        "data:image/png;base64,{}",
        base64::engine::general_purpose::STANDARD.encode(bytes)
    )
}
