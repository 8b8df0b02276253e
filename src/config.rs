//! Process configuration.
//!
//! Everything comes from the environment in one place and is injected into
//! components by the composition root; no global mutable state. The same
//! variables configure every process on a site, so the REST service and the
//! coordinator always agree on identities and endpoints.

use std::env;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use camino::Utf8PathBuf;

use crate::hasher::HashAlgorithm;
use crate::logging::{LogConfig, Verbosity};
use crate::record::now_epoch;
use crate::rest::RetryPolicy;

#[derive(Debug, Clone)]
pub struct Config {
    /// Local REST service endpoint.
    pub rest_api_host: String,
    pub rest_api_port: u16,
    /// Authority endpoint.
    pub core_api_host: String,
    pub core_api_port: u16,
    /// This site's identity (at most 5 characters; it tags log entries).
    pub site_name: String,
    /// The authority's identity. Equality with `site_name` makes this the
    /// core site.
    pub core_name: String,
    /// Absolute root of the mounted baseline tree.
    pub baseline: String,

    pub db_path: Utf8PathBuf,
    pub pipeline_db_path: Utf8PathBuf,
    pub hash_algorithm: HashAlgorithm,
    pub log_level: Verbosity,
    pub debug: bool,

    /// Rehash phase budget, minutes.
    pub max_runtime_min: u64,
    /// Share of a directory's children picked up per routine pass.
    pub update_percent: u32,

    pub max_retries: u32,
    pub retry_delay: Duration,
    pub long_delay: Duration,
    pub liveness_attempts: u32,
    pub liveness_delay: Duration,
}

fn required(name: &str) -> Result<String> {
    env::var(name).with_context(|| format!("Required environment variable {name} is not set"))
}

fn optional(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T: std::str::FromStr>(name: &str, default: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    let raw = optional(name, default);
    raw.parse()
        .map_err(|e| anyhow::anyhow!("Invalid value '{raw}' for {name}: {e}"))
}

impl Config {
    pub fn from_env() -> Result<Config> {
        let site_name = required("SITE_NAME")?;
        if site_name.is_empty() || site_name.len() > 5 {
            bail!("SITE_NAME must be 1 to 5 characters, got '{site_name}'");
        }
        let baseline = required("BASELINE")?;
        if !baseline.starts_with('/') {
            bail!("BASELINE must be an absolute path, got '{baseline}'");
        }

        Ok(Config {
            rest_api_host: required("REST_API_HOST")?,
            rest_api_port: parse_env("REST_API_PORT", "8080")?,
            core_api_host: required("CORE_API_HOST")?,
            core_api_port: parse_env("CORE_API_PORT", "8080")?,
            site_name,
            core_name: required("CORE_NAME")?,
            baseline: baseline.trim_end_matches('/').to_string(),
            db_path: Utf8PathBuf::from(optional("DB_PATH", "basewatch.db")),
            pipeline_db_path: Utf8PathBuf::from(optional("PIPELINE_DB_PATH", "pipeline.db")),
            hash_algorithm: parse_env("HASH_ALGORITHM", "sha1")?,
            log_level: parse_env("LOG_LEVEL", "info")?,
            debug: optional("DEBUG", "false").eq_ignore_ascii_case("true"),
            max_runtime_min: parse_env("MAX_RUNTIME_MIN", "10")?,
            update_percent: parse_env("UPDATE_PERCENT", "10")?,
            max_retries: parse_env("MAX_RETRIES", "3")?,
            retry_delay: Duration::from_secs(parse_env("RETRY_DELAY_SECS", "5")?),
            long_delay: Duration::from_secs(parse_env("LONG_DELAY_SECS", "30")?),
            liveness_attempts: 5,
            liveness_delay: Duration::from_secs(parse_env("LIVENESS_DELAY_SECS", "30")?),
        })
    }

    /// This site is the designated authority.
    pub fn is_core(&self) -> bool {
        self.site_name == self.core_name
    }

    pub fn local_base_url(&self) -> String {
        base_url(&self.rest_api_host, self.rest_api_port)
    }

    pub fn core_base_url(&self) -> String {
        base_url(&self.core_api_host, self.core_api_port)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            retry_delay: self.retry_delay,
            long_delay: self.long_delay,
        }
    }

    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            level: if self.debug {
                Verbosity::Debug
            } else {
                self.log_level
            },
            ..LogConfig::default()
        }
    }

    /// Opaque tag grouping the records and log entries of one coordinator
    /// run.
    pub fn new_session_id(&self) -> String {
        format!("{}-{}", self.site_name, now_epoch())
    }
}

/// Port 443 implicitly selects https.
fn base_url(host: &str, port: u16) -> String {
    if port == 443 {
        format!("https://{host}")
    } else {
        format!("http://{host}:{port}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn https_selected_by_port_443() {
        assert_eq!(base_url("core.example", 443), "https://core.example");
        assert_eq!(base_url("10.0.0.5", 8080), "http://10.0.0.5:8080");
    }
}
