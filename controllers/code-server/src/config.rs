//! Operator configuration.
//!
//! `Options` is read once from the environment at startup and then shared
//! read-only (`Arc<Options>`) by every component.

use crate::error::ControllerError;
use std::env;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_DOMAIN_NAME: &str = "pool1.playground.osinfra.cn";
pub const DEFAULT_EXPORTER_IMAGE: &str = "ghcr.io/artificial-aidan/active-exporter:latest";
pub const DEFAULT_HTTPS_SECRET_NAME: &str = "code-server-secret";
pub const DEFAULT_LXD_CLIENT_SECRET_NAME: &str = "lxd-client-secret";

/// Process-wide operator settings.
#[derive(Debug, Clone, PartialEq)]
pub struct Options {
    /// Ingress hosts are `<name>.<domain_name>`
    pub domain_name: String,
    /// Liveness exporter sidecar image, unless a resource overrides it
    pub exporter_image: String,
    pub probe_interval: Duration,
    /// Consecutive probe failures before an instance becomes Inactive
    pub max_probe_retry: u32,
    /// Shared TLS secret mounted by workloads and used by ingresses
    pub https_secret_name: String,
    /// Secret (in `operator_namespace`) holding the LXD client certificate
    pub lxd_client_secret_name: String,
    pub enable_user_ingress: bool,
    /// Reconcile worker count
    pub max_concurrency: usize,
    /// `None` watches all namespaces
    pub watch_namespace: Option<String>,
    pub operator_namespace: String,
    pub probe_timeout: Duration,
    /// Upper bound on concurrent probes within one tick
    pub probe_fanout: usize,
    pub exporter_port: u16,
    pub probe_path: String,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
    /// Failed reconcile attempts before a `ReconcileError` condition is recorded
    pub max_reconcile_retries: u32,
    /// LXD backend endpoint; the backend is disabled when unset
    pub lxd_server_url: Option<String>,
    pub lxd_accept_invalid_certs: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            domain_name: DEFAULT_DOMAIN_NAME.to_string(),
            exporter_image: DEFAULT_EXPORTER_IMAGE.to_string(),
            probe_interval: Duration::from_secs(20),
            max_probe_retry: 10,
            https_secret_name: DEFAULT_HTTPS_SECRET_NAME.to_string(),
            lxd_client_secret_name: DEFAULT_LXD_CLIENT_SECRET_NAME.to_string(),
            enable_user_ingress: false,
            max_concurrency: 10,
            watch_namespace: None,
            operator_namespace: "default".to_string(),
            probe_timeout: Duration::from_secs(5),
            probe_fanout: 16,
            exporter_port: 8000,
            probe_path: "/metrics".to_string(),
            backoff_min: Duration::from_secs(1),
            backoff_max: Duration::from_secs(300),
            max_reconcile_retries: 10,
            lxd_server_url: None,
            lxd_accept_invalid_certs: false,
        }
    }
}

impl Options {
    /// Load options from environment variables.
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load options through an arbitrary variable lookup (tests pass a map).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ControllerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Options::default();
        let string = |key: &str, default: String| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or(default)
        };
        let optional = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let options = Options {
            domain_name: string("DOMAIN_NAME", defaults.domain_name),
            exporter_image: string("EXPORTER_IMAGE", defaults.exporter_image),
            probe_interval: Duration::from_secs(parse(
                &lookup,
                "PROBE_INTERVAL_SECONDS",
                defaults.probe_interval.as_secs(),
            )?),
            max_probe_retry: parse(&lookup, "MAX_PROBE_RETRY", defaults.max_probe_retry)?,
            https_secret_name: string("HTTPS_SECRET_NAME", defaults.https_secret_name),
            lxd_client_secret_name: string("LXD_CLIENT_SECRET_NAME", defaults.lxd_client_secret_name),
            enable_user_ingress: parse_bool(&lookup, "ENABLE_USER_INGRESS", defaults.enable_user_ingress)?,
            max_concurrency: parse(&lookup, "MAX_CONCURRENCY", defaults.max_concurrency)?,
            watch_namespace: optional("WATCH_NAMESPACE"),
            operator_namespace: string("OPERATOR_NAMESPACE", defaults.operator_namespace),
            probe_timeout: Duration::from_secs(parse(
                &lookup,
                "PROBE_TIMEOUT_SECONDS",
                defaults.probe_timeout.as_secs(),
            )?),
            probe_fanout: parse(&lookup, "PROBE_FANOUT", defaults.probe_fanout)?,
            exporter_port: parse(&lookup, "EXPORTER_PORT", defaults.exporter_port)?,
            probe_path: string("PROBE_PATH", defaults.probe_path),
            backoff_min: Duration::from_secs(parse(
                &lookup,
                "RECONCILE_BACKOFF_MIN_SECONDS",
                defaults.backoff_min.as_secs(),
            )?),
            backoff_max: Duration::from_secs(parse(
                &lookup,
                "RECONCILE_BACKOFF_MAX_SECONDS",
                defaults.backoff_max.as_secs(),
            )?),
            max_reconcile_retries: parse(&lookup, "RECONCILE_MAX_RETRIES", defaults.max_reconcile_retries)?,
            lxd_server_url: optional("LXD_SERVER_URL"),
            lxd_accept_invalid_certs: parse_bool(
                &lookup,
                "LXD_ACCEPT_INVALID_CERTS",
                defaults.lxd_accept_invalid_certs,
            )?,
        };

        options.validate()?;
        Ok(options)
    }

    /// Reject settings the control loop cannot run with.
    pub fn validate(&self) -> Result<(), ControllerError> {
        if self.probe_interval.is_zero() {
            return Err(ControllerError::InvalidConfig(
                "PROBE_INTERVAL_SECONDS must be greater than 0".to_string(),
            ));
        }
        if self.probe_timeout.is_zero() {
            return Err(ControllerError::InvalidConfig(
                "PROBE_TIMEOUT_SECONDS must be greater than 0".to_string(),
            ));
        }
        if self.max_probe_retry < 1 {
            return Err(ControllerError::InvalidConfig(
                "MAX_PROBE_RETRY must be at least 1".to_string(),
            ));
        }
        if self.max_concurrency < 1 {
            return Err(ControllerError::InvalidConfig(
                "MAX_CONCURRENCY must be at least 1".to_string(),
            ));
        }
        if self.probe_fanout < 1 {
            return Err(ControllerError::InvalidConfig(
                "PROBE_FANOUT must be at least 1".to_string(),
            ));
        }
        if self.backoff_min > self.backoff_max {
            return Err(ControllerError::InvalidConfig(format!(
                "reconcile backoff floor {:?} exceeds ceiling {:?}",
                self.backoff_min, self.backoff_max
            )));
        }
        if !self.probe_path.starts_with('/') {
            return Err(ControllerError::InvalidConfig(format!(
                "PROBE_PATH must start with '/': {}",
                self.probe_path
            )));
        }
        Ok(())
    }
}

fn parse<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ControllerError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty()) {
        Some(raw) => raw
            .parse()
            .map_err(|e| ControllerError::InvalidConfig(format!("{} ({}): {}", key, raw, e))),
        None => Ok(default),
    }
}

fn parse_bool<F>(lookup: &F, key: &str, default: bool) -> Result<bool, ControllerError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key).map(|v| v.trim().to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) if v.is_empty() => Ok(default),
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => Ok(true),
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => Ok(false),
        Some(v) => Err(ControllerError::InvalidConfig(format!(
            "{} must be a boolean, got {}",
            key, v
        ))),
    }
}
