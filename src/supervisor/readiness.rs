use crate::config::{Credentials, Timings, WrapperConfig};
use crate::error::{Result, WrapperError};
use reqwest::StatusCode;
use std::path::PathBuf;
use std::time::Instant;
use tokio::process::Command;
use tracing::{debug, info, warn};

const REQUEST_ID_HEADER: &str = "X-Request-ID";
const REQUEST_ID_PREFIX: &str = "ociswrapper-";

/// Polls the supervised system until it is ready to accept requests.
pub struct ReadinessProber {
    bin: PathBuf,
    url: String,
    credentials: Option<Credentials>,
    timings: Timings,
    client: reqwest::Client,
}

impl ReadinessProber {
    pub fn new(config: &WrapperConfig) -> Result<Self> {
        // The supervised server runs with self-signed certificates in test setups.
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(config.timings.readiness_timeout)
            .build()?;

        Ok(Self {
            bin: config.bin.clone(),
            url: config.url.clone(),
            credentials: config.credentials.clone(),
            timings: config.timings.clone(),
            client,
        })
    }

    /// Endpoint probed for readiness: an authenticated drive listing when
    /// admin credentials are known, the public capabilities otherwise.
    pub fn probe_url(&self) -> String {
        match self.credentials {
            Some(_) => format!("{}/graph/v1.0/me/drives", self.url),
            None => format!("{}/ocs/v1.php/cloud/capabilities?format=json", self.url),
        }
    }

    /// Wait until `<bin> list` succeeds, meaning every sub-service is enumerable.
    ///
    /// Returns `false` on timeout; callers continue with the HTTP probe regardless.
    pub async fn wait_all_services(&self) -> bool {
        let started = Instant::now();
        loop {
            let output = Command::new(&self.bin)
                .arg("list")
                .kill_on_drop(true)
                .output();

            match tokio::time::timeout(self.timings.services_list_timeout, output).await {
                Ok(Ok(output)) if output.status.success() => {
                    info!("All services are up");
                    return true;
                }
                Ok(Ok(output)) => {
                    debug!(code = ?output.status.code(), "Service listing not ready yet");
                }
                Ok(Err(e)) => debug!("Failed to run service listing: {}", e),
                Err(_) => debug!("Service listing did not finish in time"),
            }

            if started.elapsed() >= self.timings.services_list_timeout {
                warn!(
                    "{} seconds timeout waiting for the service listing",
                    self.timings.services_list_timeout.as_secs()
                );
                return false;
            }
            tokio::time::sleep(self.timings.poll_interval).await;
        }
    }

    fn request(&self) -> reqwest::RequestBuilder {
        let request_id = format!("{}{}", REQUEST_ID_PREFIX, uuid::Uuid::new_v4());
        let builder = self
            .client
            .get(self.probe_url())
            .header(REQUEST_ID_HEADER, request_id);

        match &self.credentials {
            Some(creds) => builder.basic_auth(&creds.username, Some(&creds.password)),
            None => builder,
        }
    }

    /// Wait for the service listing, then poll the HTTP endpoint until it
    /// answers 200 or the readiness timeout elapses.
    pub async fn wait_for_connection(&self) -> Result<String> {
        self.wait_all_services().await;

        let started = Instant::now();
        let timeout = self.timings.readiness_timeout;

        loop {
            let remaining = timeout.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                warn!(
                    "{} seconds timeout waiting for oCIS server",
                    timeout.as_secs()
                );
                return Err(WrapperError::NotReady(
                    "Timeout waiting for oCIS server to start".to_string(),
                ));
            }

            match tokio::time::timeout(remaining, self.request().send()).await {
                Ok(Ok(res)) if res.status() == StatusCode::OK => {
                    info!("oCIS server is ready to accept requests");
                    return Ok("oCIS server is up and running".to_string());
                }
                Ok(Ok(res)) => debug!(status = %res.status(), "Readiness probe not OK yet"),
                Ok(Err(e)) => debug!("Readiness probe failed: {}", e),
                Err(_) => continue,
            }

            tokio::time::sleep(self.timings.poll_interval).await;
        }
    }
}
