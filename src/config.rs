//! Runtime configuration.
//!
//! A [`Config`] value is built once at startup and injected into the
//! dispatcher, the callback handler and the server. Nothing below this
//! module reads the environment.

use std::path::PathBuf;
use std::time::Duration;

use config::Environment;
use serde::{Deserialize, Serialize};

use crate::error::{BeamcheckError, Result};

/// Default delay before the local simulation writes a result.
pub const DEFAULT_SIM_DELAY_MS: u64 = 7000;

/// Configuration for the workflow core and the server binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// External computation service endpoint. When absent the dispatcher
    /// runs the local simulation instead.
    pub service_url: Option<String>,

    /// Delay before the local simulation computes the result (milliseconds)
    pub sim_delay_ms: u64,

    /// Callback URL sent to the external service; `{id}` or `:id` is replaced
    /// by the request identifier
    pub callback_url_template: Option<String>,

    /// Shared secret required on inbound callbacks and forwarded in the
    /// callback descriptor
    pub callback_token: Option<String>,

    /// Token attached to outbound triggers as `x-async-token`
    pub trigger_token: Option<String>,

    /// Outbound connect timeout (milliseconds)
    pub connect_timeout_ms: u64,

    /// Outbound total request timeout (milliseconds)
    pub request_timeout_ms: u64,

    /// Capacity of the dispatch job queue
    pub queue_capacity: usize,

    /// Maximum number of dispatch jobs running at once
    pub max_in_flight: usize,

    /// How long shutdown waits for in-flight jobs before aborting them (milliseconds)
    pub shutdown_grace_ms: u64,

    /// Client poll interval (milliseconds)
    pub poll_interval_ms: u64,

    /// Server listen address
    pub bind_addr: String,

    /// PostgreSQL connection string (used with the `postgres` feature)
    pub database_url: Option<String>,

    /// JSON file seeding the beam catalog
    pub catalog_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_url: None,
            sim_delay_ms: DEFAULT_SIM_DELAY_MS,
            callback_url_template: None,
            callback_token: None,
            trigger_token: None,
            connect_timeout_ms: 2000,
            request_timeout_ms: 5000,
            queue_capacity: 256,
            max_in_flight: 32,
            shutdown_grace_ms: 10_000,
            poll_interval_ms: 3000,
            bind_addr: "0.0.0.0:3000".to_string(),
            database_url: None,
            catalog_path: None,
        }
    }
}

impl Config {
    /// Load from `BEAMCHECK__*` environment variables layered over defaults,
    /// e.g. `BEAMCHECK__SERVICE_URL`, `BEAMCHECK__SIM_DELAY_MS`.
    pub fn from_env() -> Result<Self> {
        Self::from_source(Environment::with_prefix("BEAMCHECK").separator("__"))
    }

    fn from_source<S>(source: S) -> Result<Self>
    where
        S: config::Source + Send + Sync + 'static,
    {
        let loaded: Config = config::Config::builder()
            .add_source(source)
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| BeamcheckError::Other(anyhow::anyhow!("Failed to load config: {}", e)))?;
        let config = loaded.normalized();
        config.validate()?;

        tracing::info!(
            external = config.service_url.is_some(),
            sim_delay_ms = config.sim_delay_ms,
            callback_auth = config.callback_token.is_some(),
            "Configuration loaded"
        );
        Ok(config)
    }

    /// Blank strings count as absent.
    pub fn normalized(mut self) -> Self {
        for field in [
            &mut self.service_url,
            &mut self.callback_url_template,
            &mut self.callback_token,
            &mut self.trigger_token,
            &mut self.database_url,
        ] {
            *field = field
                .take()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty());
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(BeamcheckError::Validation(
                "queue_capacity must be positive".to_string(),
            ));
        }
        if self.max_in_flight == 0 {
            return Err(BeamcheckError::Validation(
                "max_in_flight must be positive".to_string(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(BeamcheckError::Validation(
                "poll_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn sim_delay(&self) -> Duration {
        Duration::from_millis(self.sim_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
