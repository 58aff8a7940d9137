//! `ProtectionRequest` / `ProtectionResult` / `JobState` data model (spec §3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::config::Configuration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectionRequest {
    pub artwork_id: String,
    pub owner_id: String,
    pub image_url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub config: Configuration,
    #[serde(default)]
    pub is_preview: bool,
    #[serde(default)]
    pub verify_protection: bool,
    /// [SUPPLEMENT] best-effort webhook, see spec.md original_source/modal/main.py.
    #[serde(default)]
    pub callback_url: Option<String>,
    #[serde(default)]
    pub webhook_secret: Option<String>,
}

fn default_method() -> String {
    "poisoning".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

/// Metrics returned by the Adversarial Perturbation Engine on success (spec §4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineMetrics {
    pub final_loss: f32,
    pub steps_executed: usize,
    pub epsilon: f32,
    pub wall_time_secs: f64,
}

/// Verification report (spec §4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SemanticAudit {
    pub caption: String,
    pub tags: Vec<String>,
    pub quality_ok: bool,
    pub reconstruction_model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PixelAudit {
    pub perceived_quality: String,
    pub attack_prompt: String,
    pub attack_strength: f32,
    pub attack_guidance: f32,
    pub primary_model: String,
    pub secondary_model: String,
    pub flux_success: bool,
    pub sdxl_success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatermarkAudit {
    pub detected: bool,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VerificationReport {
    pub semantic_audit: Option<SemanticAudit>,
    pub pixel_audit: Option<PixelAudit>,
    pub watermark_audit: Option<WatermarkAudit>,
    pub primary_attack_url: Option<String>,
    pub secondary_attack_url: Option<String>,
    pub semantic_attack_url: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectionResult {
    pub artwork_id: String,
    pub status: JobStatus,
    pub protected_image_url: Option<String>,
    pub protected_image_key: Option<String>,
    pub processing_time_secs: f64,
    pub file_metadata: HashMap<String, serde_json::Value>,
    pub error_message: Option<String>,
    pub applied_protections: Vec<String>,
    pub verification_report: Option<VerificationReport>,
    pub engine_metrics: Option<EngineMetrics>,
}

/// One entry in a job's stage timeline (spec §4.6 "mutates the JobState with a
/// short human message"; [SUPPLEMENT] kept as a timeline rather than a single
/// field, matching `original_source`'s `JobLogger`/`job_states[...].update(...)`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageEvent {
    pub at: DateTime<Utc>,
    pub stage: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobState {
    pub artwork_id: String,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub events: Vec<StageEvent>,
    pub result: Option<ProtectionResult>,
    pub error: Option<String>,
}

impl JobState {
    pub fn queued(artwork_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            artwork_id: artwork_id.into(),
            status: JobStatus::Queued,
            started_at: now,
            updated_at: now,
            events: Vec::new(),
            result: None,
            error: None,
        }
    }

    /// Mutates status/message and appends a timeline entry. Last-write-wins: callers
    /// hold no lock across calls (spec §3 "readers see last-write-wins semantics").
    pub fn advance(&mut self, status: JobStatus, stage: &str, message: impl Into<String>) {
        self.status = status;
        self.updated_at = Utc::now();
        self.events.push(StageEvent {
            at: self.updated_at,
            stage: stage.to_string(),
            message: message.into(),
        });
    }

    pub fn finish(&mut self, result: ProtectionResult) {
        self.status = result.status;
        self.updated_at = Utc::now();
        self.error = result.error_message.clone();
        self.result = Some(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_result(status: JobStatus) -> ProtectionResult {
        ProtectionResult {
            artwork_id: "art-1".to_string(),
            status,
            protected_image_url: Some("file:///tmp/out.png".to_string()),
            protected_image_key: Some("owner/hash/protected.png".to_string()),
            processing_time_secs: 1.5,
            file_metadata: HashMap::new(),
            error_message: None,
            applied_protections: vec!["poison".to_string(), "watermark".to_string()],
            verification_report: None,
            engine_metrics: None,
        }
    }

    #[test]
    fn queued_job_starts_with_no_events_or_result() {
        let job = JobState::queued("art-1");
        assert_eq!(job.status, JobStatus::Queued);
        assert!(job.events.is_empty());
        assert!(job.result.is_none());
    }

    #[test]
    fn advance_appends_a_timeline_entry_and_updates_status() {
        let mut job = JobState::queued("art-1");
        job.advance(JobStatus::Processing, "fetch", "Fetching input image");
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.events.len(), 1);
        assert_eq!(job.events[0].stage, "fetch");
    }

    #[test]
    fn finish_sets_status_and_error_from_result() {
        let mut job = JobState::queued("art-1");
        job.advance(JobStatus::Processing, "engine", "Running perturbation");
        job.finish(sample_result(JobStatus::Completed));
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.error.is_none());
        assert!(job.result.is_some());
        assert_eq!(job.events.len(), 1, "finish does not itself append a timeline entry");
    }

    #[test]
    fn finish_with_failed_result_propagates_error_message() {
        let mut job = JobState::queued("art-1");
        let mut result = sample_result(JobStatus::Failed);
        result.error_message = Some("ENGINE_FATAL: cuda oom".to_string());
        job.finish(result);
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("ENGINE_FATAL: cuda oom"));
    }

    #[test]
    fn protection_request_defaults_method_and_flags() {
        let json = serde_json::json!({
            "artwork_id": "art-1",
            "owner_id": "owner-1",
            "image_url": "https://example.com/a.png",
        });
        let request: ProtectionRequest = serde_json::from_value(json).unwrap();
        assert_eq!(request.method, "poisoning");
        assert!(!request.is_preview);
        assert!(!request.verify_protection);
        assert!(request.callback_url.is_none());
    }
}
