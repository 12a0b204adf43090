use std::env;
use std::path::PathBuf;

/// Environment-driven configuration, read once at startup.
///
/// The image-host values are only handed back to clients via
/// `assets.uploadConfig`; the daemon itself never talks to the image host.
#[derive(Debug, Clone, Default)]
pub struct EnvConfig {
    pub image_host_account: Option<String>,
    pub image_host_upload_preset: Option<String>,
    pub outbox_dir: Option<PathBuf>,
}

fn env_nonempty(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl EnvConfig {
    pub fn from_env() -> Self {
        let cfg = Self {
            image_host_account: env_nonempty("TUTORD_IMAGE_HOST_ID"),
            image_host_upload_preset: env_nonempty("TUTORD_IMAGE_UPLOAD_PRESET"),
            outbox_dir: env_nonempty("TUTORD_OUTBOX_DIR").map(PathBuf::from),
        };
        if cfg.image_host_account.is_none() {
            tracing::debug!("TUTORD_IMAGE_HOST_ID not set; uploads disabled");
        }
        cfg
    }
}
