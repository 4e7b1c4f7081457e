// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for the store operator.

use std::path::PathBuf;
use std::time::Duration;

use crate::store::STORE_ID_MAX_LEN;

/// Maximum length of a Kubernetes namespace name (DNS label).
const NAMESPACE_MAX_LEN: usize = 63;

/// Policy for moving `Failed` stores back into `Provisioning`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Only an explicit external retry signal re-enters provisioning.
    Manual,
    /// Explicit signal, plus the resume pass run at controller start.
    Resume,
    /// Resume behaviour plus exponential-backoff retries within a run.
    Automatic {
        /// Delay before the first automatic retry; doubles per attempt.
        backoff: Duration,
        /// Provisioning attempts allowed before automatic retries stop.
        max_attempts: u32,
    },
}

impl RetryPolicy {
    /// Whether the controller-start resume pass retries failed stores.
    pub fn retries_on_resume(&self) -> bool {
        !matches!(self, RetryPolicy::Manual)
    }
}

/// Naming and templating settings shared by the engine handlers.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Base domain used to derive per-store hosts.
    pub base_domain: String,
    /// URL scheme for derived store URLs.
    pub url_scheme: String,
    /// Ingress class passed to the chart.
    pub ingress_class: String,
    /// Optional storage class override for persistent volumes.
    pub storage_class: Option<String>,
    /// Chart reference for the WooCommerce engine.
    pub woocommerce_chart: String,
    /// Chart reference for the Medusa engine.
    pub medusa_chart: String,
    /// Time helm may spend waiting for a release to become ready.
    pub install_timeout: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            base_domain: "127.0.0.1.nip.io".to_string(),
            url_scheme: "http".to_string(),
            ingress_class: "nginx".to_string(),
            storage_class: None,
            woocommerce_chart: "/charts/woocommerce".to_string(),
            medusa_chart: "/charts/medusa".to_string(),
            install_timeout: Duration::from_secs(900),
        }
    }
}

/// Operator configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Database URL of the store registry.
    pub database_url: String,
    /// Upper bound on stores executing heavy provisioning steps at once.
    pub max_concurrent_provisions: usize,
    /// Deadline for a single provisioning attempt.
    pub max_provision: Duration,
    /// Capacity of the per-store event timeline.
    pub max_status_events: usize,
    /// Maximum concurrent reconciliation passes.
    pub workers: usize,
    /// Interval between full resyncs of every store record.
    pub resync_interval: Duration,
    /// Prefix for per-store namespaces.
    pub namespace_prefix: String,
    /// Name of the per-store admin credential secret.
    pub admin_secret_name: String,
    /// Path or name of the helm executable.
    pub helm_bin: PathBuf,
    /// Retry policy for failed stores.
    pub retry_policy: RetryPolicy,
    /// Orphan sweeper interval (`None` disables the sweeper).
    pub orphan_sweep_interval: Option<Duration>,
    /// Engine handler settings.
    pub engines: EngineSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            max_concurrent_provisions: 2,
            max_provision: Duration::from_secs(900),
            max_status_events: 20,
            workers: 4,
            resync_interval: Duration::from_secs(60),
            namespace_prefix: "store-".to_string(),
            admin_secret_name: "store-admin".to_string(),
            helm_bin: PathBuf::from("helm"),
            retry_policy: RetryPolicy::Resume,
            orphan_sweep_interval: Some(Duration::from_secs(600)),
            engines: EngineSettings::default(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    ///
    /// Required:
    /// - `STORE_OPERATOR_DATABASE_URL` (falls back to `DATABASE_URL`)
    ///
    /// Everything else falls back to the defaults of [`Config::default`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();

        let database_url = lookup("STORE_OPERATOR_DATABASE_URL")
            .or_else(|| lookup("DATABASE_URL"))
            .ok_or(ConfigError::MissingEnvVar(
                "STORE_OPERATOR_DATABASE_URL or DATABASE_URL",
            ))?;

        let max_concurrent_provisions: usize =
            parse_or(&lookup, "MAX_CONCURRENT_PROVISIONS", 2, "must be a positive integer")?;
        if max_concurrent_provisions == 0 {
            return Err(ConfigError::Invalid(
                "MAX_CONCURRENT_PROVISIONS",
                "must be at least 1",
            ));
        }

        let max_provision_secs: u64 =
            parse_or(&lookup, "MAX_PROVISION_SECONDS", 900, "must be an integer number of seconds")?;
        if max_provision_secs == 0 {
            return Err(ConfigError::Invalid(
                "MAX_PROVISION_SECONDS",
                "must be at least 1",
            ));
        }

        let max_status_events: usize =
            parse_or(&lookup, "MAX_STATUS_EVENTS", 20, "must be a positive integer")?;
        if max_status_events == 0 {
            return Err(ConfigError::Invalid("MAX_STATUS_EVENTS", "must be at least 1"));
        }

        let workers: usize = parse_or(&lookup, "OPERATOR_WORKERS", 4, "must be a positive integer")?;
        let resync_secs: u64 =
            parse_or(&lookup, "RESYNC_INTERVAL_SECS", 60, "must be an integer number of seconds")?;

        let namespace_prefix =
            lookup("STORE_NS_PREFIX").unwrap_or_else(|| defaults.namespace_prefix.clone());
        if namespace_prefix.len() + STORE_ID_MAX_LEN > NAMESPACE_MAX_LEN {
            return Err(ConfigError::Invalid(
                "STORE_NS_PREFIX",
                "prefix plus store id must fit in 63 characters",
            ));
        }

        let retry_policy = match lookup("RETRY_POLICY")
            .unwrap_or_else(|| "resume".to_string())
            .to_ascii_lowercase()
            .as_str()
        {
            "manual" => RetryPolicy::Manual,
            "resume" => RetryPolicy::Resume,
            "automatic" | "auto" => RetryPolicy::Automatic {
                backoff: Duration::from_secs(parse_or(
                    &lookup,
                    "RETRY_BACKOFF_SECS",
                    30,
                    "must be an integer number of seconds",
                )?),
                max_attempts: parse_or(&lookup, "RETRY_MAX_ATTEMPTS", 3, "must be a positive integer")?,
            },
            _ => {
                return Err(ConfigError::Invalid(
                    "RETRY_POLICY",
                    "must be one of manual, resume, automatic",
                ));
            }
        };

        let sweep_secs: u64 = parse_or(
            &lookup,
            "ORPHAN_SWEEP_INTERVAL_SECS",
            600,
            "must be an integer number of seconds",
        )?;

        let max_provision = Duration::from_secs(max_provision_secs);
        let engines = EngineSettings {
            base_domain: lookup("BASE_DOMAIN").unwrap_or(defaults.engines.base_domain),
            url_scheme: lookup("URL_SCHEME").unwrap_or(defaults.engines.url_scheme),
            ingress_class: lookup("INGRESS_CLASS").unwrap_or(defaults.engines.ingress_class),
            storage_class: lookup("STORAGE_CLASS").filter(|s| !s.is_empty()),
            woocommerce_chart: lookup("CHART_WOOCOMMERCE")
                .unwrap_or(defaults.engines.woocommerce_chart),
            medusa_chart: lookup("CHART_MEDUSA").unwrap_or(defaults.engines.medusa_chart),
            install_timeout: max_provision,
        };

        Ok(Self {
            database_url,
            max_concurrent_provisions,
            max_provision,
            max_status_events,
            workers: workers.max(1),
            resync_interval: Duration::from_secs(resync_secs.max(1)),
            namespace_prefix,
            admin_secret_name: lookup("STORE_ADMIN_SECRET_NAME")
                .unwrap_or(defaults.admin_secret_name),
            helm_bin: lookup("HELM_BIN")
                .map(PathBuf::from)
                .unwrap_or(defaults.helm_bin),
            retry_policy,
            orphan_sweep_interval: (sweep_secs > 0).then(|| Duration::from_secs(sweep_secs)),
            engines,
        })
    }
}

fn parse_or<F, T>(
    lookup: &F,
    var: &'static str,
    default: T,
    reason: &'static str,
) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(var) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid(var, reason)),
        None => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// An environment variable has an invalid value.
    #[error("Invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
