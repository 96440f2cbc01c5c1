use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvVar {
    WrapperConfig,
    OcisBin,
    OcisUrl,
    WrapperRetry,
    AdminUsername,
    AdminPassword,
    WrapperPort,
}

impl EnvVar {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WrapperConfig => "OCISWRAPPER_CONFIG",
            Self::OcisBin => "OCIS_BIN",
            Self::OcisUrl => "OCIS_URL",
            Self::WrapperRetry => "OCISWRAPPER_RETRY",
            Self::AdminUsername => "ADMIN_USERNAME",
            Self::AdminPassword => "ADMIN_PASSWORD",
            Self::WrapperPort => "OCISWRAPPER_PORT",
        }
    }
}

const FALLBACK_CONFIG_DIR: &str = "~/.config";
const WRAPPER_SUBDIR: &str = "ociswrapper";

/// Non-empty value of an environment variable.
fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Path of the wrapper config file ($OCISWRAPPER_CONFIG or ~/.config/ociswrapper/config.toml)
pub fn config_path() -> PathBuf {
    let path = env_opt(EnvVar::WrapperConfig.as_str())
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from(FALLBACK_CONFIG_DIR))
                .join(WRAPPER_SUBDIR)
                .join("config.toml")
        });
    tracing::trace!(path = %path.display(), "Resolved config path");
    path
}

/// Supervised binary override ($OCIS_BIN)
pub fn bin() -> Option<PathBuf> {
    let val = env_opt(EnvVar::OcisBin.as_str()).map(PathBuf::from);
    tracing::trace!(value = ?val, "OCIS_BIN env var");
    val
}

/// Readiness base URL override ($OCIS_URL)
pub fn url() -> Option<String> {
    let val = env_opt(EnvVar::OcisUrl.as_str());
    tracing::trace!(value = ?val, "OCIS_URL env var");
    val
}

/// Crash-retry limit override ($OCISWRAPPER_RETRY)
pub fn retry() -> Option<u32> {
    env_opt(EnvVar::WrapperRetry.as_str()).and_then(|s| s.parse().ok())
}

/// Admin user for authenticated readiness probes ($ADMIN_USERNAME)
pub fn admin_username() -> Option<String> {
    env_opt(EnvVar::AdminUsername.as_str())
}

/// Admin password for authenticated readiness probes ($ADMIN_PASSWORD)
pub fn admin_password() -> Option<String> {
    env_opt(EnvVar::AdminPassword.as_str())
}

/// Control API port override ($OCISWRAPPER_PORT)
pub fn port() -> Option<u16> {
    env_opt(EnvVar::WrapperPort.as_str()).and_then(|s| s.parse().ok())
}
