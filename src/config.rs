use crate::clienv;
use crate::error::{Result, WrapperError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_BIN: &str = "/usr/bin/ocis";
const DEFAULT_URL: &str = "https://localhost:9200";
const DEFAULT_RETRY: u32 = 5;
const DEFAULT_PORT: u16 = 5200;

/// Basic-auth credentials used by the readiness probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Waits and deadlines used by the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timings {
    /// How long `stop` may wait for supervised processes to disappear
    pub shutdown_timeout: Duration,
    /// How long the HTTP readiness probe may poll
    pub readiness_timeout: Duration,
    /// How long to wait for `<bin> list` to succeed
    pub services_list_timeout: Duration,
    pub poll_interval: Duration,
    /// Pause before relaunching a crashed parent
    pub retry_backoff: Duration,
    /// Upper bound on waiting for a single stopped service to exit
    pub service_stop_grace: Duration,
    /// Hard deadline for interactive commands
    pub command_timeout: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            shutdown_timeout: Duration::from_secs(30),
            readiness_timeout: Duration::from_secs(30),
            services_list_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(500),
            retry_backoff: Duration::from_millis(500),
            service_stop_grace: Duration::from_secs(30),
            command_timeout: Duration::from_secs(5),
        }
    }
}

/// `[timings]` table of the config file, values in milliseconds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimingsFile {
    pub shutdown_timeout: Option<u64>,
    pub readiness_timeout: Option<u64>,
    pub services_list_timeout: Option<u64>,
    pub poll_interval: Option<u64>,
    pub retry_backoff: Option<u64>,
    pub service_stop_grace: Option<u64>,
    pub command_timeout: Option<u64>,
}

impl Timings {
    fn with_file(mut self, file: &TimingsFile) -> Self {
        let ms = Duration::from_millis;
        if let Some(v) = file.shutdown_timeout {
            self.shutdown_timeout = ms(v);
        }
        if let Some(v) = file.readiness_timeout {
            self.readiness_timeout = ms(v);
        }
        if let Some(v) = file.services_list_timeout {
            self.services_list_timeout = ms(v);
        }
        if let Some(v) = file.poll_interval {
            self.poll_interval = ms(v);
        }
        if let Some(v) = file.retry_backoff {
            self.retry_backoff = ms(v);
        }
        if let Some(v) = file.service_stop_grace {
            self.service_stop_grace = ms(v);
        }
        if let Some(v) = file.command_timeout {
            self.command_timeout = ms(v);
        }
        self
    }
}

/// One source of settings. Sources are merged field by field, first one wins.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigLayer {
    pub bin: Option<PathBuf>,
    pub url: Option<String>,
    pub retry: Option<u32>,
    pub admin_username: Option<String>,
    pub admin_password: Option<String>,
    pub port: Option<u16>,
    pub skip_ocis_run: Option<bool>,
    #[serde(default)]
    pub timings: TimingsFile,
}

impl ConfigLayer {
    pub fn from_env() -> Self {
        Self {
            bin: clienv::bin(),
            url: clienv::url(),
            retry: clienv::retry(),
            admin_username: clienv::admin_username(),
            admin_password: clienv::admin_password(),
            port: clienv::port(),
            skip_ocis_run: None,
            timings: TimingsFile::default(),
        }
    }

    /// Load a TOML config file; a missing file is an empty layer.
    pub fn load(path: &Path) -> Result<Self> {
        tracing::trace!(path = %path.display(), "Loading wrapper config");

        if !path.exists() {
            tracing::trace!("Config file does not exist, using defaults");
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).map_err(|e| {
            WrapperError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;

        toml::from_str(&content).map_err(|e| {
            WrapperError::Config(format!("Failed to parse {}: {}", path.display(), e))
        })
    }

    fn or(self, other: Self) -> Self {
        Self {
            bin: self.bin.or(other.bin),
            url: self.url.or(other.url),
            retry: self.retry.or(other.retry),
            admin_username: self.admin_username.or(other.admin_username),
            admin_password: self.admin_password.or(other.admin_password),
            port: self.port.or(other.port),
            skip_ocis_run: self.skip_ocis_run.or(other.skip_ocis_run),
            timings: TimingsFile {
                shutdown_timeout: self.timings.shutdown_timeout.or(other.timings.shutdown_timeout),
                readiness_timeout: self
                    .timings
                    .readiness_timeout
                    .or(other.timings.readiness_timeout),
                services_list_timeout: self
                    .timings
                    .services_list_timeout
                    .or(other.timings.services_list_timeout),
                poll_interval: self.timings.poll_interval.or(other.timings.poll_interval),
                retry_backoff: self.timings.retry_backoff.or(other.timings.retry_backoff),
                service_stop_grace: self
                    .timings
                    .service_stop_grace
                    .or(other.timings.service_stop_grace),
                command_timeout: self.timings.command_timeout.or(other.timings.command_timeout),
            },
        }
    }
}

/// Fully resolved wrapper settings.
#[derive(Debug, Clone)]
pub struct WrapperConfig {
    /// Path of the supervised binary
    pub bin: PathBuf,
    /// Base URL of the supervised system, used for readiness probes
    pub url: String,
    /// Maximum consecutive automatic relaunches of a crashed parent
    pub retry: u32,
    pub credentials: Option<Credentials>,
    /// Port the control API listens on
    pub port: u16,
    /// Do not launch the parent when the wrapper starts
    pub skip_ocis_run: bool,
    pub timings: Timings,
}

impl WrapperConfig {
    /// Settings for `bin` with every other value at its default.
    pub fn for_bin(bin: impl Into<PathBuf>) -> Self {
        Self::from_layers([ConfigLayer {
            bin: Some(bin.into()),
            ..ConfigLayer::default()
        }])
    }

    /// Merge layers in priority order, highest first.
    pub fn from_layers(layers: impl IntoIterator<Item = ConfigLayer>) -> Self {
        let merged = layers
            .into_iter()
            .fold(ConfigLayer::default(), |acc, layer| acc.or(layer));

        let credentials = match (merged.admin_username, merged.admin_password) {
            (Some(username), Some(password)) => Some(Credentials { username, password }),
            _ => None,
        };

        Self {
            bin: merged.bin.unwrap_or_else(|| PathBuf::from(DEFAULT_BIN)),
            url: merged
                .url
                .unwrap_or_else(|| DEFAULT_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            retry: merged.retry.unwrap_or(DEFAULT_RETRY),
            credentials,
            port: merged.port.unwrap_or(DEFAULT_PORT),
            skip_ocis_run: merged.skip_ocis_run.unwrap_or(false),
            timings: Timings::default().with_file(&merged.timings),
        }
    }

    /// Resolve settings as flags > environment > config file > defaults.
    pub fn resolve(flags: ConfigLayer, config_file: Option<&Path>) -> Result<Self> {
        let path = config_file
            .map(Path::to_path_buf)
            .unwrap_or_else(clienv::config_path);
        let file = ConfigLayer::load(&path)?;
        let config = Self::from_layers([flags, ConfigLayer::from_env(), file]);

        tracing::debug!(
            bin = %config.bin.display(),
            url = %config.url,
            retry = config.retry,
            port = config.port,
            "Wrapper config resolved"
        );
        Ok(config)
    }
}
