use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use reqwest::blocking::Client;
use tracing::{debug, warn};

/// Liveness check of the managed service. A failed gate is an expected
/// outcome, so `check` reports it as `false` instead of an error.
pub trait HealthProbe: Send + Sync {
    /// One attempt. Non-success status, timeout, and refused connections are
    /// all failures.
    fn probe_once(&self, endpoint: &str) -> Result<()>;

    fn pause(&self, interval: Duration) {
        thread::sleep(interval);
    }

    fn check(&self, endpoint: &str, retries: u32, interval: Duration) -> bool {
        let attempts = retries.max(1);
        for attempt in 1..=attempts {
            match self.probe_once(endpoint) {
                Ok(()) => {
                    debug!(endpoint, attempt, "health check passed");
                    return true;
                }
                Err(err) => {
                    warn!(endpoint, attempt, attempts, error = %err, "health check failed");
                }
            }
            if attempt < attempts {
                self.pause(interval);
            }
        }
        false
    }
}

pub struct HttpHealthProbe {
    client: Client,
}

impl HttpHealthProbe {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build health check HTTP client")?;
        Ok(Self { client })
    }
}

impl HealthProbe for HttpHealthProbe {
    fn probe_once(&self, endpoint: &str) -> Result<()> {
        let response = self
            .client
            .get(endpoint)
            .send()
            .with_context(|| format!("health endpoint unreachable: {endpoint}"))?;
        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("health endpoint returned HTTP {status}"));
        }
        Ok(())
    }
}
