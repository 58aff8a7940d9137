//! `shield-cli`: local operator entry point (spec SPEC_FULL.md §1, analogous
//! to the teacher's `mistralrs-bench`/interactive mode) for running one
//! protection job against a file on disk without standing up `shield-server`.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use shield_core::config::Intensity;
use shield_core::engine::PerturbationEngine;
use shield_core::orchestrator::{Orchestrator, Publisher};
use shield_core::verification::VerifierHandle;
use shield_core::{Configuration, JobState, ProtectionRequest};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "shield-cli", about = "Run a protection job against a local file")]
struct Args {
    /// Input image path.
    input: PathBuf,

    /// Output PNG path.
    #[arg(short, long, default_value = "protected.png")]
    output: PathBuf,

    #[arg(long, value_enum, default_value = "medium")]
    intensity: IntensityArg,

    #[arg(long, default_value_t = true)]
    poison: bool,

    #[arg(long, default_value_t = false)]
    concept_poison: bool,

    #[arg(long, default_value_t = true)]
    watermark: bool,

    #[arg(long, default_value_t = false)]
    visual_watermark: bool,

    #[arg(long)]
    secret_key: Option<String>,

    #[arg(long, default_value_t = false)]
    verify: bool,

    #[arg(long, default_value = "cli-owner")]
    owner_id: String,

    #[arg(long, default_value_t = false)]
    cuda: bool,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum IntensityArg {
    Low,
    Medium,
    High,
}

impl From<IntensityArg> for Intensity {
    fn from(value: IntensityArg) -> Self {
        match value {
            IntensityArg::Low => Intensity::Low,
            IntensityArg::Medium => Intensity::Medium,
            IntensityArg::High => Intensity::High,
        }
    }
}

/// Writes the published image straight to the `--output` path; there is no
/// bucket selection or key layout to honor outside the HTTP service.
struct FileOutput {
    path: PathBuf,
}

impl Publisher for FileOutput {
    fn publish(
        &self,
        _key: &str,
        bytes: &[u8],
        _content_type: &str,
        _is_preview: bool,
    ) -> shield_core::Result<String> {
        std::fs::write(&self.path, bytes)
            .map_err(|e| shield_core::ShieldError::UploadFailed(e.to_string()))?;
        Ok(self.path.display().to_string())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let device = if args.cuda {
        candle_core::Device::new_cuda(0)?
    } else {
        candle_core::Device::Cpu
    };

    let raw_bytes = std::fs::read(&args.input)?;

    let config = Configuration {
        apply_poison: args.poison,
        apply_concept_poison: args.concept_poison,
        apply_watermark: args.watermark,
        apply_visual_watermark: args.visual_watermark,
        secret_key: args.secret_key,
        intensity: args.intensity.into(),
        apply_verification: args.verify,
        ..Configuration::default()
    };

    let request = ProtectionRequest {
        artwork_id: "cli-job".to_string(),
        owner_id: args.owner_id,
        image_url: args.input.display().to_string(),
        method: "poisoning".to_string(),
        config,
        is_preview: false,
        verify_protection: args.verify,
        callback_url: None,
        webhook_secret: None,
    };

    let publisher = Arc::new(FileOutput { path: args.output.clone() });
    let engine = Arc::new(PerturbationEngine::new(device.clone()));
    let verifier = Arc::new(VerifierHandle::new(device.clone()));
    let orchestrator = Orchestrator::new(engine, verifier, publisher, device);

    let mut job_state = JobState::queued(request.artwork_id.clone());
    let result = orchestrator.run(&request, &raw_bytes, &mut job_state).await;

    println!("{}", serde_json::to_string_pretty(&result)?);

    if result.status != shield_core::JobStatus::Completed {
        anyhow::bail!("protection job failed: {:?}", result.error_message);
    }

    println!("wrote protected image to {}", args.output.display());
    Ok(())
}
