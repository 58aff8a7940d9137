//! Error taxonomy for the protection pipeline (spec §7).
//!
//! Every kind here is one the orchestrator can name in `ProtectionResult.error_message`.
//! Only the `is_fatal` kinds transition a job to `failed`; the rest are recovered
//! in-place by the stage that raised them.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ShieldError {
    #[error("failed to download input image: HTTP {status}")]
    DownloadFailed { status: u16 },

    #[error("failed to decode image bytes: {0}")]
    DecodeFailed(String),

    #[error("failed to load an engine model: {0}")]
    EngineLoadFailed(String),

    #[error("PGD step {step} failed: {reason}")]
    EngineStepFailed { step: usize, reason: String },

    #[error("adversarial perturbation engine failed fatally: {0}")]
    EngineFatal(String),

    #[error("watermark embedding failed: {0}")]
    WatermarkFailed(String),

    #[error("failed to upload result: {0}")]
    UploadFailed(String),

    #[error("verifier stage '{stage}' failed: {reason}")]
    VerifierStageFailed { stage: String, reason: String },

    #[error("unauthorized: bearer token mismatch")]
    AuthRejected,
}

impl From<candle_core::Error> for ShieldError {
    /// Tensor-level failures inside the engine (shape mismatch, OOM, backend
    /// error) are not recoverable mid-step the way a non-finite gradient is;
    /// they surface as fatal engine errors.
    fn from(e: candle_core::Error) -> Self {
        ShieldError::EngineFatal(e.to_string())
    }
}

impl ShieldError {
    /// Only fatal kinds propagate to the outer job and flip `JobState` to `failed`.
    /// `EngineStepFailed`, `WatermarkFailed`, and `VerifierStageFailed` are recovered
    /// in place by their caller and never reach this check as a job-ending error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ShieldError::DownloadFailed { .. }
                | ShieldError::DecodeFailed(_)
                | ShieldError::EngineLoadFailed(_)
                | ShieldError::EngineFatal(_)
                | ShieldError::UploadFailed(_)
                | ShieldError::AuthRejected
        )
    }

    pub fn kind_tag(&self) -> &'static str {
        match self {
            ShieldError::DownloadFailed { .. } => "DOWNLOAD_FAILED",
            ShieldError::DecodeFailed(_) => "DECODE_FAILED",
            ShieldError::EngineLoadFailed(_) => "ENGINE_LOAD_FAILED",
            ShieldError::EngineStepFailed { .. } => "ENGINE_STEP_FAILED",
            ShieldError::EngineFatal(_) => "ENGINE_FATAL",
            ShieldError::WatermarkFailed(_) => "WATERMARK_FAILED",
            ShieldError::UploadFailed(_) => "UPLOAD_FAILED",
            ShieldError::VerifierStageFailed { .. } => "VERIFIER_STAGE_FAILED",
            ShieldError::AuthRejected => "AUTH_REJECTED",
        }
    }
}

pub type Result<T> = std::result::Result<T, ShieldError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverable_kinds_are_not_fatal() {
        assert!(!ShieldError::EngineStepFailed { step: 3, reason: "nan loss".to_string() }.is_fatal());
        assert!(!ShieldError::WatermarkFailed("mask mismatch".to_string()).is_fatal());
        assert!(!ShieldError::VerifierStageFailed {
            stage: "flux".to_string(),
            reason: "oom".to_string(),
        }
        .is_fatal());
    }

    #[test]
    fn load_and_transport_kinds_are_fatal() {
        assert!(ShieldError::DownloadFailed { status: 404 }.is_fatal());
        assert!(ShieldError::DecodeFailed("bad png".to_string()).is_fatal());
        assert!(ShieldError::EngineLoadFailed("missing weights".to_string()).is_fatal());
        assert!(ShieldError::EngineFatal("cuda oom".to_string()).is_fatal());
        assert!(ShieldError::UploadFailed("disk full".to_string()).is_fatal());
        assert!(ShieldError::AuthRejected.is_fatal());
    }

    #[test]
    fn kind_tags_match_spec_error_codes() {
        assert_eq!(ShieldError::DownloadFailed { status: 500 }.kind_tag(), "DOWNLOAD_FAILED");
        assert_eq!(ShieldError::AuthRejected.kind_tag(), "AUTH_REJECTED");
        assert_eq!(
            ShieldError::VerifierStageFailed {
                stage: "sdxl".to_string(),
                reason: "timeout".to_string()
            }
            .kind_tag(),
            "VERIFIER_STAGE_FAILED"
        );
    }
}
