use clap::{Args, Parser, Subcommand};
use ociswrapper::config::ConfigLayer;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "ociswrapper")]
#[command(version)]
#[command(about = "Wrapper to run and control an oCIS server remotely", long_about = None)]
pub(crate) struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Start oCIS and serve the control API
    Serve(ServeArgs),
}

#[derive(Args, Debug, Default)]
pub(crate) struct ServeArgs {
    /// Full oCIS binary path (default: /usr/bin/ocis). Can also be set via OCIS_BIN.
    #[arg(long)]
    pub bin: Option<PathBuf>,

    /// oCIS server url (default: https://localhost:9200). Can also be set via OCIS_URL.
    #[arg(long)]
    pub url: Option<String>,

    /// Number of retries to start oCIS server (default: 5)
    #[arg(long)]
    pub retry: Option<u32>,

    /// admin username for oCIS server
    #[arg(long)]
    pub admin_username: Option<String>,

    /// admin password for oCIS server
    #[arg(long)]
    pub admin_password: Option<String>,

    /// Wrapper API server port (default: 5200)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Address the wrapper API binds to
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,

    /// Skip oCIS server startup
    #[arg(long)]
    pub skip_ocis_run: bool,

    /// Wrapper config file (default: <config dir>/ociswrapper/config.toml)
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl ServeArgs {
    /// Command-line values as the highest-priority config layer.
    pub fn layer(&self) -> ConfigLayer {
        ConfigLayer {
            bin: self.bin.clone(),
            url: self.url.clone(),
            retry: self.retry,
            admin_username: self.admin_username.clone(),
            admin_password: self.admin_password.clone(),
            port: self.port,
            // An absent flag must not mask the config file
            skip_ocis_run: self.skip_ocis_run.then_some(true),
            timings: Default::default(),
        }
    }
}
