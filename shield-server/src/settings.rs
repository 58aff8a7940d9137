//! C9 Configuration Loading: typed settings assembled from defaults, an
//! optional TOML file, then environment variables (highest precedence),
//! mirroring spec §6's `Environment` table.

use serde::Deserialize;

/// Process-wide server settings (spec §6 `Environment`). Field names map
/// 1:1 onto the spec's environment variables via `config`'s `Environment`
/// source (e.g. `R2_ENDPOINT` -> `r2_endpoint`).
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// `MODAL_AUTH_TOKEN` / `AUTH_TOKEN` (spec §6); required to accept a
    /// submission, compared against the request's bearer token.
    pub auth_token: String,
    #[serde(default)]
    pub r2_endpoint: Option<String>,
    #[serde(default)]
    pub r2_access_key_id: Option<String>,
    #[serde(default)]
    pub r2_secret_access_key: Option<String>,
    #[serde(default)]
    pub r2_public_url: Option<String>,
    #[serde(default)]
    pub app_url: Option<String>,
    #[serde(default)]
    pub hf_token: Option<String>,
    /// Bound on concurrently running jobs (spec §5 "per-container GPU
    /// concurrency limit"). Each job occupies one dispatcher slot for its
    /// full PGD + verification lifetime.
    #[serde(default = "default_max_containers")]
    pub max_containers: usize,
    /// Root directory for `LocalDiskStore`'s process-local object store
    /// ([AMBIENT], spec §6 "good enough to run the full request lifecycle
    /// without a real R2/S3 account").
    #[serde(default = "default_storage_root")]
    pub storage_root: String,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_max_containers() -> usize {
    1
}

fn default_storage_root() -> String {
    "./shield-storage".to_string()
}

impl ServerSettings {
    /// Defaults -> `shield.toml` (if present) -> environment (spec §9
    /// "do not permit ad-hoc access"; this is the one place settings are
    /// assembled).
    pub fn load() -> anyhow::Result<Self> {
        let settings = config::Config::builder()
            .set_default("bind_addr", default_bind_addr())?
            .set_default("max_containers", default_max_containers() as i64)?
            .set_default("storage_root", default_storage_root())?
            .add_source(config::File::with_name("shield").required(false))
            .add_source(
                config::Environment::default()
                    .try_parsing(true)
                    .separator("__"),
            )
            .build()?;
        Ok(settings.try_deserialize()?)
    }
}

/// Device/model-cache settings consumed by `shield-core`'s engine and
/// verifier handles. Kept separate from [`ServerSettings`] since a CLI
/// invocation (`shield-cli`) needs these without the HTTP-only fields.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineSettings {
    #[serde(default)]
    pub cuda: bool,
    #[serde(default)]
    pub cuda_device_ordinal: usize,
}

impl EngineSettings {
    pub fn load() -> anyhow::Result<Self> {
        let settings = config::Config::builder()
            .set_default("cuda", false)?
            .set_default("cuda_device_ordinal", 0i64)?
            .add_source(config::File::with_name("shield").required(false))
            .add_source(config::Environment::default().try_parsing(true))
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    pub fn device(&self) -> anyhow::Result<candle_core::Device> {
        if self.cuda {
            Ok(candle_core::Device::new_cuda(self.cuda_device_ordinal)?)
        } else {
            Ok(candle_core::Device::Cpu)
        }
    }
}
