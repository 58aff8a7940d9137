//! Protection Pipeline Orchestrator (C6, spec §4.6).
//!
//! Sequences: decode -> EXIF-transpose -> capture ICC -> alpha split -> cap
//! resolution -> (C4 if any poison flag) -> (C5 if `apply_watermark`) ->
//! (visible overlay if `apply_visual_watermark`) -> alpha rejoin -> encode PNG
//! -> (optional C7) -> best-effort webhook callback.
//!
//! Grounded on `original_source/modal/poisoning/main.py`'s `ModelService.process_job`:
//! the same stage order, the same `job_states[...].update({"message": ...})`
//! timeline (here `JobState::advance`), and the same object key layout.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use candle_core::Device;
use image::{GenericImageView, RgbaImage};
use tracing::{info, warn};

use crate::config::Configuration;
use crate::engine::PerturbationEngine;
use crate::error::{Result, ShieldError};
use crate::image_io::{self, DecodedImage};
use crate::job::{EngineMetrics, JobState, JobStatus, ProtectionRequest, ProtectionResult};
use crate::overlay;
use crate::verification::VerifierHandle;
use crate::watermark;

/// Object store bucket selection (spec §4.6, §6 "two buckets (prod, dev);
/// selected by `is_preview`"). The orchestrator is agnostic to the concrete
/// object store implementation; callers hand it a `Publisher`.
pub trait Publisher: Send + Sync {
    /// Upload `bytes` under `key` in the bucket selected by `is_preview`,
    /// returning a publicly reachable URL.
    fn publish(&self, key: &str, bytes: &[u8], content_type: &str, is_preview: bool) -> Result<String>;
}

/// Storage key layout for the protected output and verification artifacts
/// (spec §4.6 "Object key layout").
pub struct ObjectKeys {
    pub protected: String,
    pub verified_pixel: String,
    pub verified_sdxl: String,
    pub verified_semantic: String,
}

impl ObjectKeys {
    pub fn new(owner: &str, hash: &str) -> Self {
        Self {
            protected: format!("{owner}/{hash}/protected.png"),
            verified_pixel: format!("{owner}/{hash}/verified/pixel.png"),
            verified_sdxl: format!("{owner}/{hash}/verified/sdxl.png"),
            verified_semantic: format!("{owner}/{hash}/verified/semantic.png"),
        }
    }
}

/// Runs one job end to end. Owns no state across jobs; all per-container
/// state (encoder weights, verifier model slots) lives in the handles passed
/// in, which the caller constructs once and shares across orchestrator runs.
pub struct Orchestrator {
    pub engine: Arc<PerturbationEngine>,
    pub verifier: Arc<VerifierHandle>,
    pub publisher: Arc<dyn Publisher>,
    pub device: Device,
}

impl Orchestrator {
    pub fn new(
        engine: Arc<PerturbationEngine>,
        verifier: Arc<VerifierHandle>,
        publisher: Arc<dyn Publisher>,
        device: Device,
    ) -> Self {
        Self {
            engine,
            verifier,
            publisher,
            device,
        }
    }

    /// Run the full pipeline for `request` against `raw_bytes` (the already
    /// downloaded input; download itself is out of scope per spec §1).
    /// `job` is mutated with a stage timeline as the pipeline progresses
    /// (spec §4.6 "mutates the JobState with a short human message").
    pub async fn run(
        &self,
        request: &ProtectionRequest,
        raw_bytes: &[u8],
        job: &mut JobState,
    ) -> ProtectionResult {
        let started = Instant::now();
        job.advance(JobStatus::Processing, "decode", "Decoding input image");

        match self.run_inner(request, raw_bytes, job).await {
            Ok(result) => result,
            Err(err) => {
                warn!(artwork_id = %request.artwork_id, error = %err, "protection job failed");
                ProtectionResult {
                    artwork_id: request.artwork_id.clone(),
                    status: JobStatus::Failed,
                    protected_image_url: None,
                    protected_image_key: None,
                    processing_time_secs: started.elapsed().as_secs_f64(),
                    file_metadata: HashMap::new(),
                    error_message: Some(err.to_string()),
                    applied_protections: Vec::new(),
                    verification_report: None,
                    engine_metrics: None,
                }
            }
        }
    }

    async fn run_inner(
        &self,
        request: &ProtectionRequest,
        raw_bytes: &[u8],
        job: &mut JobState,
    ) -> Result<ProtectionResult> {
        let started = Instant::now();
        let config = &request.config;

        let decoded = image_io::decode(raw_bytes)?;
        let DecodedImage {
            mut rgb,
            alpha,
            icc_profile,
        } = decoded;

        rgb = image_io::cap_resolution(&rgb, config.max_res);
        let alpha = alpha.map(|a| image_io::resize_alpha(&a, rgb.width(), rgb.height()));

        let mut applied_protections = Vec::new();
        let mut engine_metrics: Option<EngineMetrics> = None;

        if config.apply_poison || config.apply_concept_poison {
            job.advance(
                JobStatus::Processing,
                "perturbation",
                "Generating adversarial noise (GPU)",
            );
            let output = self
                .engine
                .clone()
                .protect_with_timeout(rgb.clone(), config.clone())
                .await?;
            rgb = output.image;
            engine_metrics = Some(output.metrics);
            if config.apply_poison {
                applied_protections.push("poison_ivy".to_string());
            }
            if config.apply_concept_poison {
                applied_protections.push("concept_cloak".to_string());
            }
        }

        let mut watermark_key = None;
        if config.apply_watermark {
            job.advance(
                JobStatus::Processing,
                "watermark",
                "Injecting invisible watermark",
            );
            let key = config.resolved_secret_key();
            match watermark::embed(&rgb, &key, config.alpha) {
                Ok(watermarked) => {
                    rgb = watermarked;
                    watermark_key = Some(key);
                    applied_protections.push("ai_watermark".to_string());
                }
                Err(e) => {
                    // Recoverable per spec §7: degrade to "protected without
                    // watermark" rather than failing the job.
                    warn!(artwork_id = %request.artwork_id, error = %e, "watermark embedding failed, continuing without it");
                }
            }
        }

        let mut rgba = image_io::rejoin_alpha(&rgb, &alpha.clone().unwrap_or_else(|| {
            image::GrayImage::from_pixel(rgb.width(), rgb.height(), image::Luma([255]))
        }));

        if config.apply_visual_watermark {
            match overlay::apply(&rgba, &config.watermark_text) {
                Ok(overlaid) => {
                    rgba = overlaid;
                    applied_protections.push("visual_watermark".to_string());
                }
                Err(e) => {
                    warn!(artwork_id = %request.artwork_id, error = %e, "visual watermark overlay failed, continuing without it");
                }
            }
        }

        let final_rgb = drop_alpha(&rgba);
        let final_rgba = rgba;

        let should_verify =
            config.apply_verification || request.verify_protection || request.is_preview;

        let mut verification_report = None;
        if should_verify {
            if applied_protections.is_empty() {
                verification_report = Some(crate::job::VerificationReport {
                    error: Some(
                        "Verification ignored: no protection methods were applied to this image."
                            .to_string(),
                    ),
                    ..Default::default()
                });
            } else {
                job.advance(
                    JobStatus::Processing,
                    "verification",
                    "Running verification audit",
                );
                match self
                    .verifier
                    .clone()
                    .verify_with_timeout(final_rgb.clone(), watermark_key.clone())
                    .await
                {
                    Ok(report) => {
                        applied_protections.push("verification_audit".to_string());
                        verification_report = Some(report);
                    }
                    Err(e) => {
                        warn!(artwork_id = %request.artwork_id, error = %e, "verification audit failed");
                        verification_report = Some(crate::job::VerificationReport {
                            error: Some(e.to_string()),
                            ..Default::default()
                        });
                    }
                }
            }
        }

        job.advance(JobStatus::Processing, "encode", "Encoding result");
        let out_bytes = if alpha.is_some() {
            image_io::encode_png_rgba(&final_rgba, icc_profile.as_deref())?
        } else {
            image_io::encode_png_rgb(&final_rgb, icc_profile.as_deref())?
        };

        job.advance(JobStatus::Processing, "upload", "Uploading protected image");
        let hash = image_io::resolve_hash(&request.image_url, raw_bytes);
        let keys = ObjectKeys::new(&request.owner_id, &hash);
        let protected_image_url = self
            .publisher
            .publish(&keys.protected, &out_bytes, "image/png", request.is_preview)
            .map_err(|e| ShieldError::UploadFailed(e.to_string()))?;

        let mut file_metadata = HashMap::new();
        file_metadata.insert(
            "size".to_string(),
            serde_json::Value::from(out_bytes.len() as u64),
        );
        file_metadata.insert(
            "width".to_string(),
            serde_json::Value::from(final_rgb.width()),
        );
        file_metadata.insert(
            "height".to_string(),
            serde_json::Value::from(final_rgb.height()),
        );
        file_metadata.insert(
            "target_models".to_string(),
            serde_json::to_value(&config.target_models).unwrap_or_default(),
        );

        info!(
            artwork_id = %request.artwork_id,
            stages = ?applied_protections,
            "protection job completed"
        );

        Ok(ProtectionResult {
            artwork_id: request.artwork_id.clone(),
            status: JobStatus::Completed,
            protected_image_url: Some(protected_image_url),
            protected_image_key: Some(keys.protected),
            processing_time_secs: started.elapsed().as_secs_f64(),
            file_metadata,
            error_message: None,
            applied_protections,
            verification_report,
            engine_metrics,
        })
    }
}

fn drop_alpha(img: &RgbaImage) -> image::RgbImage {
    let (w, h) = img.dimensions();
    let mut out = image::RgbImage::new(w, h);
    for (x, y, px) in img.enumerate_pixels() {
        out.put_pixel(x, y, image::Rgb([px[0], px[1], px[2]]));
    }
    out
}

/// Best-effort webhook callback ([SUPPLEMENT], spec SPEC_FULL.md §3). Never
/// changes `job.status`; failures are logged only.
pub async fn notify_callback(request: &ProtectionRequest, result: &ProtectionResult) {
    let Some(url) = request.callback_url.as_ref() else {
        return;
    };
    let client = reqwest::Client::new();
    let mut builder = client.post(url).json(result);
    if let Some(secret) = request.webhook_secret.as_ref() {
        builder = builder.bearer_auth(secret);
    }
    match builder
        .timeout(std::time::Duration::from_secs(10))
        .send()
        .await
    {
        Ok(resp) if !resp.status().is_success() => {
            warn!(artwork_id = %request.artwork_id, status = %resp.status(), "callback webhook returned non-success");
        }
        Err(e) => {
            warn!(artwork_id = %request.artwork_id, error = %e, "callback webhook failed");
        }
        Ok(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_keys_match_spec_layout() {
        let keys = ObjectKeys::new("owner123", &"a".repeat(64));
        assert_eq!(keys.protected, format!("owner123/{}/protected.png", "a".repeat(64)));
        assert_eq!(
            keys.verified_pixel,
            format!("owner123/{}/verified/pixel.png", "a".repeat(64))
        );
    }

    #[test]
    fn drop_alpha_preserves_rgb_channels() {
        let rgba = RgbaImage::from_pixel(2, 2, image::Rgba([10, 20, 30, 128]));
        let rgb = drop_alpha(&rgba);
        assert_eq!(rgb.get_pixel(0, 0), &image::Rgb([10, 20, 30]));
    }
}
