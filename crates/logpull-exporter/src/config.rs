// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Environment-driven exporter configuration, resolved once at startup.

use std::net::SocketAddr;
use std::time::Duration;

use logpull::Auth;

use crate::duration::{parse_duration, ParseDurationError};

pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:9299";
pub const DEFAULT_LOG_PERIOD: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("must specify exactly one of CLOUDFLARE_API_TOKEN, CLOUDFLARE_API_KEY or CLOUDFLARE_API_USER_SERVICE_KEY")]
    AmbiguousCredentials,

    #[error("CLOUDFLARE_API_KEY specified without CLOUDFLARE_API_EMAIL; both must be provided")]
    MissingEmail,

    #[error("a comma-separated list of zone names must be specified in CLOUDFLARE_ZONE_NAMES")]
    MissingZoneNames,

    #[error("invalid EXPORTER_LISTEN_ADDR: {0}")]
    InvalidListenAddr(std::net::AddrParseError),

    #[error("invalid EXPORTER_LOG_PERIOD: {0}")]
    InvalidLogPeriod(ParseDurationError),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    /// Credential scheme for the Logpull API, exactly one of the three.
    pub auth: Auth,
    /// Human-readable zone names; resolved to opaque zone ids before any
    /// scrape occurs.
    pub zone_names: Vec<String>,
    /// Width of the log window requested on each scrape.
    pub log_period: Duration,
    /// When set, enables the Loki forwarding pump.
    pub loki_url: Option<String>,
    pub log_level: String,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let non_empty = |name: &str| var(name).filter(|value| !value.is_empty());

        let listen_addr = non_empty("EXPORTER_LISTEN_ADDR")
            .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string())
            .parse()
            .map_err(ConfigError::InvalidListenAddr)?;

        let api_token = non_empty("CLOUDFLARE_API_TOKEN");
        let api_key = non_empty("CLOUDFLARE_API_KEY");
        let api_email = non_empty("CLOUDFLARE_API_EMAIL");
        let user_service_key = non_empty("CLOUDFLARE_API_USER_SERVICE_KEY");

        let auth = match (api_token, api_key, user_service_key) {
            (Some(token), None, None) => Auth::Token(token),
            (None, Some(key), None) => match api_email {
                Some(email) => Auth::KeyEmail { key, email },
                None => return Err(ConfigError::MissingEmail),
            },
            (None, None, Some(key)) => Auth::UserServiceKey(key),
            _ => return Err(ConfigError::AmbiguousCredentials),
        };

        let zone_names: Vec<String> = non_empty("CLOUDFLARE_ZONE_NAMES")
            .unwrap_or_default()
            .split(',')
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .collect();
        if zone_names.is_empty() {
            return Err(ConfigError::MissingZoneNames);
        }

        let log_period = match non_empty("EXPORTER_LOG_PERIOD") {
            Some(value) => parse_duration(&value).map_err(ConfigError::InvalidLogPeriod)?,
            None => DEFAULT_LOG_PERIOD,
        };

        let loki_url =
            non_empty("EXPORTER_LOKI_URL").map(|url| url.trim_end_matches('/').to_string());

        let log_level = non_empty("EXPORTER_LOG_LEVEL")
            .map(|level| level.to_lowercase())
            .unwrap_or_else(|| "info".to_string());

        Ok(Config {
            listen_addr,
            auth,
            zone_names,
            log_period,
            loki_url,
            log_level,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_vars(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn accepts_token_credentials() {
        let config = from_vars(&[
            ("CLOUDFLARE_API_TOKEN", "token"),
            ("CLOUDFLARE_ZONE_NAMES", "example.org"),
        ])
        .unwrap();

        assert!(matches!(config.auth, Auth::Token(token) if token == "token"));
        assert_eq!(config.zone_names, vec!["example.org"]);
        assert_eq!(config.log_period, DEFAULT_LOG_PERIOD);
        assert_eq!(config.listen_addr, DEFAULT_LISTEN_ADDR.parse().unwrap());
        assert!(config.loki_url.is_none());
    }

    #[test]
    fn accepts_key_email_credentials() {
        let config = from_vars(&[
            ("CLOUDFLARE_API_KEY", "key"),
            ("CLOUDFLARE_API_EMAIL", "user@example.org"),
            ("CLOUDFLARE_ZONE_NAMES", "example.org"),
        ])
        .unwrap();

        assert!(matches!(config.auth, Auth::KeyEmail { .. }));
    }

    #[test]
    fn rejects_key_without_email() {
        let err = from_vars(&[
            ("CLOUDFLARE_API_KEY", "key"),
            ("CLOUDFLARE_ZONE_NAMES", "example.org"),
        ])
        .unwrap_err();

        assert!(matches!(err, ConfigError::MissingEmail));
    }

    #[test]
    fn rejects_zero_credentials() {
        let err = from_vars(&[("CLOUDFLARE_ZONE_NAMES", "example.org")]).unwrap_err();
        assert!(matches!(err, ConfigError::AmbiguousCredentials));
    }

    #[test]
    fn rejects_multiple_credentials() {
        let err = from_vars(&[
            ("CLOUDFLARE_API_TOKEN", "token"),
            ("CLOUDFLARE_API_USER_SERVICE_KEY", "service-key"),
            ("CLOUDFLARE_ZONE_NAMES", "example.org"),
        ])
        .unwrap_err();

        assert!(matches!(err, ConfigError::AmbiguousCredentials));
    }

    #[test]
    fn rejects_missing_zone_names() {
        let err = from_vars(&[("CLOUDFLARE_API_TOKEN", "token")]).unwrap_err();
        assert!(matches!(err, ConfigError::MissingZoneNames));
    }

    #[test]
    fn splits_and_trims_zone_names() {
        let config = from_vars(&[
            ("CLOUDFLARE_API_TOKEN", "token"),
            ("CLOUDFLARE_ZONE_NAMES", "example.org, example.net ,,example.com"),
        ])
        .unwrap();

        assert_eq!(
            config.zone_names,
            vec!["example.org", "example.net", "example.com"]
        );
    }

    #[test]
    fn parses_log_period_and_loki_url() {
        let config = from_vars(&[
            ("CLOUDFLARE_API_TOKEN", "token"),
            ("CLOUDFLARE_ZONE_NAMES", "example.org"),
            ("EXPORTER_LOG_PERIOD", "5m"),
            ("EXPORTER_LOKI_URL", "http://loki:3100/"),
        ])
        .unwrap();

        assert_eq!(config.log_period, Duration::from_secs(300));
        assert_eq!(config.loki_url.as_deref(), Some("http://loki:3100"));
    }

    #[test]
    fn rejects_invalid_log_period() {
        let err = from_vars(&[
            ("CLOUDFLARE_API_TOKEN", "token"),
            ("CLOUDFLARE_ZONE_NAMES", "example.org"),
            ("EXPORTER_LOG_PERIOD", "sideways"),
        ])
        .unwrap_err();

        assert!(matches!(err, ConfigError::InvalidLogPeriod(_)));
    }
}
