use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::{HermesError, HermesResult};
use crate::event_log::EventLogConfig;

pub const DEFAULT_CONFIG_FILE: &str = "hermes.toml";
pub const ENV_PREFIX: &str = "HERMES_";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HermesConfig {
    pub env: String,
    pub http_addr: String,
    /// Path of the sled database holding logs and traces.
    pub data_dir: PathBuf,
    /// Upload body ceiling in bytes; 0 disables the limit.
    pub max_upload_size_bytes: u64,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub trace: TraceConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub endpoints: BTreeMap<String, EndpointConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default = "default_true")]
    pub json: bool,
    #[serde(default = "default_ring")]
    pub ring_capacity: usize,
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,
    #[serde(default = "default_sink_queue")]
    pub sink_queue: usize,
    #[serde(default = "default_stream_backlog")]
    pub stream_backlog: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TraceConfig {
    #[serde(default = "default_ring")]
    pub ring_capacity: usize,
    #[serde(default = "default_summary_window")]
    pub summary_window: usize,
    #[serde(default = "default_recent_limit")]
    pub recent_limit: usize,
    #[serde(default = "default_recent_limit")]
    pub errors_limit: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransferConfig {
    #[serde(default = "default_progress_interval")]
    pub progress_interval_ms: u64,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointKind {
    Fs,
    Memory,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct EndpointConfig {
    pub kind: EndpointKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<PathBuf>,
}

fn default_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_ring() -> usize {
    1000
}

fn default_subscriber_buffer() -> usize {
    100
}

fn default_sink_queue() -> usize {
    1024
}

fn default_stream_backlog() -> usize {
    50
}

fn default_summary_window() -> usize {
    500
}

fn default_recent_limit() -> usize {
    200
}

fn default_progress_interval() -> u64 {
    300
}

fn default_buffer_size() -> usize {
    64 * 1024
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: true,
            ring_capacity: default_ring(),
            subscriber_buffer: default_subscriber_buffer(),
            sink_queue: default_sink_queue(),
            stream_backlog: default_stream_backlog(),
        }
    }
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            ring_capacity: default_ring(),
            summary_window: default_summary_window(),
            recent_limit: default_recent_limit(),
            errors_limit: default_recent_limit(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            progress_interval_ms: default_progress_interval(),
            buffer_size: default_buffer_size(),
        }
    }
}

impl Default for HermesConfig {
    fn default() -> Self {
        let mut endpoints = BTreeMap::new();
        endpoints.insert(
            "local".to_string(),
            EndpointConfig {
                kind: EndpointKind::Fs,
                root: Some(PathBuf::from("data/objects")),
            },
        );
        Self {
            env: "dev".to_string(),
            http_addr: "0.0.0.0:8080".to_string(),
            data_dir: PathBuf::from("data/hermes.db"),
            max_upload_size_bytes: 0,
            log: LogConfig::default(),
            trace: TraceConfig::default(),
            transfer: TransferConfig::default(),
            endpoints,
        }
    }
}

impl LogConfig {
    pub fn event_log(&self) -> EventLogConfig {
        EventLogConfig {
            ring_capacity: self.ring_capacity,
            subscriber_buffer: self.subscriber_buffer,
            sink_queue: self.sink_queue,
        }
    }
}

impl TransferConfig {
    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }
}

impl HermesConfig {
    pub fn upload_limit(&self) -> Option<u64> {
        (self.max_upload_size_bytes > 0).then_some(self.max_upload_size_bytes)
    }

    pub fn validate(&self) -> HermesResult<()> {
        let positive = [
            ("log.ring_capacity", self.log.ring_capacity as u64),
            ("log.subscriber_buffer", self.log.subscriber_buffer as u64),
            ("log.sink_queue", self.log.sink_queue as u64),
            ("trace.ring_capacity", self.trace.ring_capacity as u64),
            ("trace.summary_window", self.trace.summary_window as u64),
            ("trace.recent_limit", self.trace.recent_limit as u64),
            ("trace.errors_limit", self.trace.errors_limit as u64),
            ("transfer.progress_interval_ms", self.transfer.progress_interval_ms),
            ("transfer.buffer_size", self.transfer.buffer_size as u64),
        ];
        if let Some((key, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(HermesError::config(format!("{key} must be greater than zero")));
        }
        if self.endpoints.is_empty() {
            return Err(HermesError::config("at least one endpoint must be configured"));
        }
        for (name, endpoint) in &self.endpoints {
            if endpoint.kind == EndpointKind::Fs && endpoint.root.is_none() {
                return Err(HermesError::config(format!(
                    "endpoint {name}: fs endpoints need a root"
                )));
            }
        }
        Ok(())
    }
}

/// Defaults, then the TOML file, then `HERMES_*` environment variables.
pub fn figment(config_path: Option<&Path>) -> Figment {
    let file = config_path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
    Figment::from(Serialized::defaults(HermesConfig::default()))
        .merge(Toml::file(file))
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
}

pub fn load_config(config_path: Option<&Path>) -> HermesResult<HermesConfig> {
    if let Some(path) = config_path {
        if !path.exists() {
            return Err(HermesError::config(format!(
                "config file {} does not exist",
                path.display()
            )));
        }
    }

    let config: HermesConfig = figment(config_path)
        .extract()
        .map_err(|e| HermesError::config(e.to_string()))?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn defaults_are_valid() {
        Jail::expect_with(|_| {
            let config = load_config(None).expect("defaults load");
            assert_eq!(config.http_addr, "0.0.0.0:8080");
            assert_eq!(config.log.ring_capacity, 1000);
            assert_eq!(config.trace.summary_window, 500);
            assert_eq!(config.transfer.progress_interval(), Duration::from_millis(300));
            assert_eq!(config.upload_limit(), None);
            assert_eq!(config.endpoints["local"].kind, EndpointKind::Fs);
            Ok(())
        });
    }

    #[test]
    fn file_then_env_layering() {
        Jail::expect_with(|jail| {
            jail.create_file(
                DEFAULT_CONFIG_FILE,
                r#"
                    max_upload_size_bytes = 1024

                    [log]
                    level = "error"
                    json = false

                    [endpoints.scratch]
                    kind = "memory"
                "#,
            )?;
            jail.set_env("HERMES_LOG__LEVEL", "debug");
            jail.set_env("HERMES_TRANSFER__BUFFER_SIZE", "4096");

            let config = load_config(None).expect("layered config loads");
            assert_eq!(config.log.level, "debug");
            assert!(!config.log.json);
            assert_eq!(config.transfer.buffer_size, 4096);
            assert_eq!(config.upload_limit(), Some(1024));
            assert_eq!(config.endpoints["scratch"].kind, EndpointKind::Memory);
            assert!(config.endpoints.contains_key("local"));
            Ok(())
        });
    }

    #[test]
    fn zero_capacities_are_rejected() {
        Jail::expect_with(|jail| {
            jail.set_env("HERMES_TRACE__SUMMARY_WINDOW", "0");
            let err = load_config(None).unwrap_err();
            assert!(err.to_string().contains("trace.summary_window"));
            Ok(())
        });
    }

    #[test]
    fn fs_endpoint_without_root_is_rejected() {
        Jail::expect_with(|jail| {
            jail.create_file("custom.toml", "[endpoints.broken]\nkind = \"fs\"\n")?;
            let err = load_config(Some(Path::new("custom.toml"))).unwrap_err();
            assert!(err.to_string().contains("broken"));
            Ok(())
        });
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        Jail::expect_with(|_| {
            assert!(load_config(Some(Path::new("nope.toml"))).is_err());
            Ok(())
        });
    }
}
