//! Service configuration from environment variables.

use crate::error::{Result, SignallingError};
use crate::matchmaker::MatchmakerConfig;
use crate::router::RelayOptions;
use serde_json::{Map, Value};
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Configuration for the signalling service.
#[derive(Debug, Clone)]
pub struct SignallingConfig {
    /// Player-facing HTTP/WebSocket port.
    pub http_port: u16,
    /// Streamer WebSocket port.
    pub streamer_port: u16,
    /// SFU WebSocket port.
    pub sfu_port: u16,
    /// Address advertised to the matchmaker.
    pub public_ip: String,
    pub use_matchmaker: bool,
    pub matchmaker_address: String,
    pub matchmaker_port: u16,
    pub matchmaker_retry_interval: Duration,
    pub matchmaker_keepalive_interval: Duration,
    /// Maximum concurrent regular players, -1 for unlimited.
    pub max_player_count: i64,
    pub log_verbose: bool,
    /// JSON object handed to peers in the `config` greeting.
    pub peer_connection_options: Value,
    /// Prometheus exporter port; no exporter when unset.
    pub metrics_port: Option<u16>,
}

impl Default for SignallingConfig {
    fn default() -> Self {
        Self {
            http_port: 80,
            streamer_port: 8888,
            sfu_port: 8889,
            public_ip: "127.0.0.1".to_string(),
            use_matchmaker: false,
            matchmaker_address: "127.0.0.1".to_string(),
            matchmaker_port: 9999,
            matchmaker_retry_interval: Duration::from_secs(5),
            matchmaker_keepalive_interval: Duration::from_secs(30),
            max_player_count: -1,
            log_verbose: false,
            peer_connection_options: Value::Object(Map::new()),
            metrics_port: None,
        }
    }
}

impl SignallingConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Read configuration through `lookup`, falling back to defaults for
    /// unset variables. Set but malformed values are an error.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let peer_connection_options = match get("PEER_CONNECTION_OPTIONS") {
            Some(raw) => match serde_json::from_str::<Value>(&raw) {
                Ok(value @ Value::Object(_)) => value,
                Ok(_) => {
                    return Err(SignallingError::Config(
                        "PEER_CONNECTION_OPTIONS must be a JSON object".to_string(),
                    ))
                }
                Err(e) => {
                    return Err(SignallingError::Config(format!(
                        "PEER_CONNECTION_OPTIONS is not valid JSON: {}",
                        e
                    )))
                }
            },
            None => defaults.peer_connection_options,
        };

        Ok(Self {
            http_port: parse(&get, "HTTP_PORT", defaults.http_port)?,
            streamer_port: parse(&get, "STREAMER_PORT", defaults.streamer_port)?,
            sfu_port: parse(&get, "SFU_PORT", defaults.sfu_port)?,
            public_ip: get("PUBLIC_IP").unwrap_or(defaults.public_ip),
            use_matchmaker: parse_bool(&get, "USE_MATCHMAKER", defaults.use_matchmaker)?,
            matchmaker_address: get("MATCHMAKER_ADDRESS").unwrap_or(defaults.matchmaker_address),
            matchmaker_port: parse(&get, "MATCHMAKER_PORT", defaults.matchmaker_port)?,
            matchmaker_retry_interval: Duration::from_secs(parse(
                &get,
                "MATCHMAKER_RETRY_INTERVAL",
                defaults.matchmaker_retry_interval.as_secs(),
            )?),
            matchmaker_keepalive_interval: Duration::from_secs(parse(
                &get,
                "MATCHMAKER_KEEPALIVE_INTERVAL",
                defaults.matchmaker_keepalive_interval.as_secs(),
            )?),
            max_player_count: parse(&get, "MAX_PLAYER_COUNT", defaults.max_player_count)?,
            log_verbose: parse_bool(&get, "LOG_VERBOSE", defaults.log_verbose)?,
            peer_connection_options,
            metrics_port: get("METRICS_PORT")
                .map(|raw| parse_value("METRICS_PORT", &raw))
                .transpose()?,
        })
    }

    pub fn relay_options(&self) -> RelayOptions {
        RelayOptions {
            max_player_count: self.max_player_count,
            peer_connection_options: self.peer_connection_options.clone(),
            log_verbose: self.log_verbose,
        }
    }

    /// Matchmaker link settings; the advertised port is the player port.
    pub fn matchmaker_config(&self) -> MatchmakerConfig {
        MatchmakerConfig {
            address: self.matchmaker_address.clone(),
            port: self.matchmaker_port,
            public_address: self.public_ip.clone(),
            public_port: self.http_port,
            retry_interval: self.matchmaker_retry_interval,
            keepalive_interval: self.matchmaker_keepalive_interval,
        }
    }
}

fn parse<T, F>(get: &F, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => parse_value(key, &raw),
        None => Ok(default),
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| SignallingError::Config(format!("{} = {:?}: {}", key, raw, e)))
}

fn parse_bool<F>(get: &F, key: &str, default: bool) -> Result<bool>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = get(key) else {
        return Ok(default);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(SignallingError::Config(format!(
            "{} = {:?}: expected true or false",
            key, raw
        ))),
    }
}
