//! Client configuration parsed from environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use reqwest::Url;

use crate::connection::ReconnectPolicy;

pub const DEFAULT_API_BASE_URL: &str = "http://127.0.0.1:8000";
pub const DEFAULT_WS_PATH: &str = "/ws";
pub const DEFAULT_REFRESH_PATH: &str = "/api/auth/refresh";
pub const DEFAULT_LOGIN_PATH: &str = "/api/auth/login";
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 3000;
pub const DEFAULT_RECONNECT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_EXPIRY_SKEW_SECS: i64 = 30;

/// Base URLs baked in at build time, overridable at runtime.
const BUILD_API_BASE_URL: Option<&str> = option_env!("COURIER_API_BASE_URL");
const BUILD_WS_BASE_URL: Option<&str> = option_env!("COURIER_WS_BASE_URL");

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid base URL for {key}: {value}")]
    InvalidBaseUrl { key: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub api_base_url: String,
    pub ws_base_url: String,
    pub ws_path: String,
    pub refresh_path: String,
    pub login_path: String,
    pub reconnect: ReconnectPolicy,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub expiry_skew_secs: i64,
    /// Rebuild the realtime URL from the current credential before each
    /// automatic reconnect instead of reusing it verbatim.
    pub reresolve_token_on_reconnect: bool,
    /// Persist credentials here; memory only when unset.
    pub credentials_path: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let api_base_url = BUILD_API_BASE_URL.unwrap_or(DEFAULT_API_BASE_URL).trim_end_matches('/').to_owned();
        let ws_base_url = match BUILD_WS_BASE_URL {
            Some(ws) => ws.trim_end_matches('/').to_owned(),
            None => ws_base_from_api(&api_base_url).unwrap_or_else(|_| "ws://127.0.0.1:8000".to_owned()),
        };
        Self {
            api_base_url,
            ws_base_url,
            ws_path: DEFAULT_WS_PATH.to_owned(),
            refresh_path: DEFAULT_REFRESH_PATH.to_owned(),
            login_path: DEFAULT_LOGIN_PATH.to_owned(),
            reconnect: ReconnectPolicy {
                delay: Duration::from_millis(DEFAULT_RECONNECT_DELAY_MS),
                max_attempts: DEFAULT_RECONNECT_MAX_ATTEMPTS,
            },
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            expiry_skew_secs: DEFAULT_EXPIRY_SKEW_SECS,
            reresolve_token_on_reconnect: false,
            credentials_path: None,
        }
    }
}

impl ClientConfig {
    /// Build config from environment variables.
    ///
    /// Optional:
    /// - `COURIER_API_BASE_URL`: build-time value or `http://127.0.0.1:8000`
    /// - `COURIER_WS_BASE_URL`: derived from the API base (`http` → `ws`)
    /// - `COURIER_WS_PATH`: default `/ws`
    /// - `COURIER_REFRESH_PATH`: default `/api/auth/refresh`
    /// - `COURIER_LOGIN_PATH`: default `/api/auth/login`
    /// - `COURIER_RECONNECT_DELAY_MS`: default 3000
    /// - `COURIER_RECONNECT_MAX_ATTEMPTS`: default 5
    /// - `COURIER_REQUEST_TIMEOUT_SECS`: default 30
    /// - `COURIER_CONNECT_TIMEOUT_SECS`: default 10
    /// - `COURIER_EXPIRY_SKEW_SECS`: default 30
    /// - `COURIER_RERESOLVE_TOKEN_ON_RECONNECT`: default false
    /// - `COURIER_CREDENTIALS_PATH`: unset keeps credentials in memory
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidBaseUrl`] for a base URL with the wrong
    /// scheme. Unparseable numbers fall back to their defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| match std::env::var(key) {
            Ok(value) => Some(value),
            Err(_) => None,
        })
    }

    /// Same as [`ClientConfig::from_env`] with an injectable variable source.
    ///
    /// # Errors
    ///
    /// See [`ClientConfig::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let api_base_url = match lookup("COURIER_API_BASE_URL") {
            Some(raw) => normalize_base("COURIER_API_BASE_URL", &raw, &["http://", "https://"])?,
            None => normalize_base("COURIER_API_BASE_URL", &defaults.api_base_url, &["http://", "https://"])?,
        };
        let ws_base_url = match lookup("COURIER_WS_BASE_URL") {
            Some(raw) => normalize_base("COURIER_WS_BASE_URL", &raw, &["ws://", "wss://"])?,
            None if BUILD_WS_BASE_URL.is_some() && lookup("COURIER_API_BASE_URL").is_none() => defaults.ws_base_url,
            None => ws_base_from_api(&api_base_url)?,
        };

        let parse = |key: &str, default| lookup_parse(&lookup, key, default);
        let reconnect = ReconnectPolicy {
            delay: Duration::from_millis(parse("COURIER_RECONNECT_DELAY_MS", DEFAULT_RECONNECT_DELAY_MS)),
            max_attempts: lookup_parse(&lookup, "COURIER_RECONNECT_MAX_ATTEMPTS", DEFAULT_RECONNECT_MAX_ATTEMPTS),
        };

        Ok(Self {
            api_base_url,
            ws_base_url,
            ws_path: lookup("COURIER_WS_PATH").unwrap_or(defaults.ws_path),
            refresh_path: lookup("COURIER_REFRESH_PATH").unwrap_or(defaults.refresh_path),
            login_path: lookup("COURIER_LOGIN_PATH").unwrap_or(defaults.login_path),
            reconnect,
            request_timeout: Duration::from_secs(parse("COURIER_REQUEST_TIMEOUT_SECS", DEFAULT_REQUEST_TIMEOUT_SECS)),
            connect_timeout: Duration::from_secs(parse("COURIER_CONNECT_TIMEOUT_SECS", DEFAULT_CONNECT_TIMEOUT_SECS)),
            expiry_skew_secs: lookup_parse(&lookup, "COURIER_EXPIRY_SKEW_SECS", DEFAULT_EXPIRY_SKEW_SECS),
            reresolve_token_on_reconnect: lookup_bool(&lookup, "COURIER_RERESOLVE_TOKEN_ON_RECONNECT", false),
            credentials_path: lookup("COURIER_CREDENTIALS_PATH")
                .filter(|path| !path.trim().is_empty())
                .map(PathBuf::from),
        })
    }

    #[must_use]
    pub fn refresh_url(&self) -> String {
        join_path(&self.api_base_url, &self.refresh_path)
    }

    #[must_use]
    pub fn login_url(&self) -> String {
        join_path(&self.api_base_url, &self.login_path)
    }

    /// Realtime target for `access_token`: `{ws_base}{ws_path}?token=...`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidBaseUrl`] when the WebSocket base does
    /// not parse as a URL.
    pub fn realtime_url(&self, access_token: &str) -> Result<String, ConfigError> {
        let base = join_path(&self.ws_base_url, &self.ws_path);
        let mut url = Url::parse(&base).map_err(|_| ConfigError::InvalidBaseUrl {
            key: "COURIER_WS_BASE_URL",
            value: self.ws_base_url.clone(),
        })?;
        url.query_pairs_mut().append_pair("token", access_token);
        Ok(url.to_string())
    }
}

/// Map an HTTP API base onto the matching WebSocket scheme.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidBaseUrl`] unless `api` is `http(s)://`.
pub fn ws_base_from_api(api: &str) -> Result<String, ConfigError> {
    let api = api.trim_end_matches('/');
    if let Some(rest) = api.strip_prefix("https://") {
        Ok(format!("wss://{rest}"))
    } else if let Some(rest) = api.strip_prefix("http://") {
        Ok(format!("ws://{rest}"))
    } else {
        Err(ConfigError::InvalidBaseUrl {
            key: "COURIER_API_BASE_URL",
            value: api.to_owned(),
        })
    }
}

fn normalize_base(key: &'static str, raw: &str, schemes: &[&str]) -> Result<String, ConfigError> {
    let trimmed = raw.trim().trim_end_matches('/');
    let has_host = schemes
        .iter()
        .any(|scheme| trimmed.strip_prefix(scheme).is_some_and(|rest| !rest.is_empty()));
    if has_host {
        Ok(trimmed.to_owned())
    } else {
        Err(ConfigError::InvalidBaseUrl {
            key,
            value: raw.to_owned(),
        })
    }
}

fn join_path(base: &str, path: &str) -> String {
    if path.is_empty() || path.starts_with('/') {
        format!("{base}{path}")
    } else {
        format!("{base}/{path}")
    }
}

fn lookup_parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: FromStr + Copy,
{
    let Some(raw) = lookup(key) else {
        return default;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => value,
        Err(_) => {
            tracing::warn!(%key, value = %raw, "ignoring unparseable config value");
            default
        }
    }
}

fn lookup_bool(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> bool {
    let Some(raw) = lookup(key) else {
        return default;
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" | "" => false,
        _ => {
            tracing::warn!(%key, value = %raw, "ignoring unparseable boolean config value");
            default
        }
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
