//! Bounded job dispatcher (spec §5 "concurrency & resource model"):
//! a `tokio::sync::mpsc`-fed pool of `max_containers` workers, mirroring the
//! teacher's `Request`/`mpsc::channel` dispatch pattern in
//! `mistralrs-core`. Each worker pulls one job at a time and runs it to
//! completion before pulling the next, giving the same "one GPU, one job"
//! concurrency ceiling spec §5 describes.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use shield_core::error::ShieldError;
use shield_core::orchestrator::Orchestrator;
use shield_core::{JobState, JobStatus, ProtectionRequest};

use crate::settings::ServerSettings;
use crate::store::InMemoryJobStateStore;

pub struct Job {
    pub request: ProtectionRequest,
}

pub struct Dispatcher {
    tx: mpsc::Sender<Job>,
}

impl Dispatcher {
    pub fn spawn(
        max_containers: usize,
        orchestrator: Arc<Orchestrator>,
        job_store: Arc<InMemoryJobStateStore>,
        settings: Arc<ServerSettings>,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<Job>(max_containers.max(1) * 4);
        let rx = Arc::new(Mutex::new(rx));

        for worker_id in 0..max_containers.max(1) {
            let rx = rx.clone();
            let orchestrator = orchestrator.clone();
            let job_store = job_store.clone();
            let settings = settings.clone();
            tokio::spawn(async move {
                info!(worker_id, "dispatcher worker started");
                loop {
                    let job = { rx.lock().await.recv().await };
                    let Some(job) = job else {
                        break;
                    };
                    run_job(job, &orchestrator, &job_store, &settings).await;
                }
                info!(worker_id, "dispatcher worker stopped");
            });
        }

        Self { tx }
    }

    /// Enqueue a job; fails only if every worker has panicked and the
    /// channel's receiver half was dropped.
    pub async fn submit(&self, job: Job) -> Result<(), mpsc::error::SendError<Job>> {
        self.tx.send(job).await
    }
}

/// HTTP GET against the image URL (spec §6 "Input fetch"); a bearer token is
/// attached when the URL matches the internal asset proxy path.
async fn fetch_image(request: &ProtectionRequest, settings: &ServerSettings) -> Result<Vec<u8>, ShieldError> {
    let client = reqwest::Client::new();
    let mut builder = client.get(&request.image_url);
    if request.image_url.contains("/api/assets/") {
        builder = builder.bearer_auth(&settings.auth_token);
    }

    let response = builder
        .send()
        .await
        .map_err(|_| ShieldError::DownloadFailed { status: 0 })?;

    if !response.status().is_success() {
        return Err(ShieldError::DownloadFailed {
            status: response.status().as_u16(),
        });
    }

    response
        .bytes()
        .await
        .map(|b| b.to_vec())
        .map_err(|_| ShieldError::DownloadFailed { status: 0 })
}

async fn run_job(
    job: Job,
    orchestrator: &Orchestrator,
    job_store: &InMemoryJobStateStore,
    settings: &ServerSettings,
) {
    let Job { request } = job;
    let mut state = JobState::queued(request.artwork_id.clone());
    state.advance(JobStatus::Processing, "fetch", "Fetching input image");
    job_store.insert(state.clone());

    let raw_bytes = match fetch_image(&request, settings).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(artwork_id = %request.artwork_id, error = %e, "input fetch failed");
            state.advance(JobStatus::Failed, "fetch", e.to_string());
            job_store.insert(state);
            return;
        }
    };

    let result = orchestrator.run(&request, &raw_bytes, &mut state).await;

    state.finish(result.clone());
    job_store.insert(state);

    shield_core::orchestrator::notify_callback(&request, &result).await;
}
