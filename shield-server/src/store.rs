//! Object storage and job-state plumbing (spec §6 "plumbing; the engine must
//! be specifiable without them"). Defined as traits with a process-local
//! default implementation good enough to run the full request lifecycle
//! without a real R2/S3 account — no `aws-sdk-s3`/`rust-s3` dependency is
//! grounded anywhere in this corpus, so a production object store is left as
//! a trait boundary rather than guessed at.

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use shield_core::orchestrator::Publisher;
use shield_core::{JobState, ShieldError};

/// Two-bucket object store selected by `is_preview` (spec §4.6, §6).
pub struct LocalDiskStore {
    prod_root: PathBuf,
    dev_root: PathBuf,
    public_url_base: Option<String>,
}

impl LocalDiskStore {
    pub fn new(root: impl Into<PathBuf>, public_url_base: Option<String>) -> anyhow::Result<Self> {
        let root = root.into();
        let prod_root = root.join("prod");
        let dev_root = root.join("dev");
        std::fs::create_dir_all(&prod_root)?;
        std::fs::create_dir_all(&dev_root)?;
        Ok(Self {
            prod_root,
            dev_root,
            public_url_base,
        })
    }
}

impl Publisher for LocalDiskStore {
    fn publish(
        &self,
        key: &str,
        bytes: &[u8],
        _content_type: &str,
        is_preview: bool,
    ) -> shield_core::Result<String> {
        let root = if is_preview { &self.dev_root } else { &self.prod_root };
        let path = root.join(key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ShieldError::UploadFailed(e.to_string()))?;
        }
        std::fs::write(&path, bytes).map_err(|e| ShieldError::UploadFailed(e.to_string()))?;

        let bucket = if is_preview { "dev" } else { "prod" };
        Ok(match &self.public_url_base {
            Some(base) => format!("{}/{}/{}", base.trim_end_matches('/'), bucket, key),
            None => format!("file://{}", path.display()),
        })
    }
}

/// Process-wide key-value map `shield-job-states` (spec §6 "Persistent
/// state"), keyed by artwork id.
#[derive(Default)]
pub struct InMemoryJobStateStore {
    inner: DashMap<String, JobState>,
}

impl InMemoryJobStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, job: JobState) {
        self.inner.insert(job.artwork_id.clone(), job);
    }

    pub fn get(&self, artwork_id: &str) -> Option<JobState> {
        self.inner.get(artwork_id).map(|r| r.value().clone())
    }

    /// Bulk read with the spec's `ack_ids` eviction behavior: `ack_ids`
    /// remove their entries from the state map after reading them once.
    pub fn bulk_read(
        &self,
        artwork_ids: &[String],
        ack_ids: &[String],
    ) -> std::collections::HashMap<String, JobState> {
        let mut out = std::collections::HashMap::with_capacity(artwork_ids.len());
        for id in artwork_ids {
            if let Some(state) = self.inner.get(id) {
                out.insert(id.clone(), state.value().clone());
            }
        }
        for id in ack_ids {
            self.inner.remove(id);
        }
        out
    }
}

pub type SharedJobStateStore = Arc<InMemoryJobStateStore>;
