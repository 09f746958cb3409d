//! Agent configuration.
//!
//! A `key = value` file with `#` comments, overridable per key through
//! `WALLMON_*` environment variables. Values may be quoted and may end with a
//! `;`, so libconfig-style files written by the installer load unchanged.

use std::path::{Path, PathBuf};
use std::time::Duration;

use uuid::Uuid;

use crate::error::ConfigError;
use crate::filter;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/wallmon.conf";
const DEFAULT_LOG_LEVEL: &str = "info";
/// libpcap snap length; comfortably larger than any header window.
const DEFAULT_PCAP_BUFFER_SIZE: i32 = 32768;
/// Capture read timeout, which also bounds shutdown latency.
pub const CAPTURE_TIMEOUT: Duration = Duration::from_secs(1);

/// Everything the capture pipeline needs from the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureSettings {
    pub system_id: Uuid,
    pub server_url: String,
    pub monitor_url: String,
    pub management_interface: Option<String>,
    pub filter_server_traffic: bool,
    pub strict_filter: bool,
    pub snaplen: i32,
    pub read_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub system_uuid: Option<String>,
    pub server_url: Option<String>,
    pub monitor_url: Option<String>,
    pub network_interface: Option<String>,
    pub ignore_server_packets: bool,
    pub strict_filter: bool,
    pub collector_key: Option<String>,
    pub collector_key_file: Option<PathBuf>,
    pub log_level: String,
    pub pcap_buffer_size: i32,
    /// File the values were read from, if it existed.
    pub source: Option<PathBuf>,
    /// Keys present in the file that the agent does not know.
    pub ignored_keys: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            system_uuid: None,
            server_url: None,
            monitor_url: None,
            network_interface: None,
            ignore_server_packets: true,
            strict_filter: false,
            collector_key: None,
            collector_key_file: None,
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            pcap_buffer_size: DEFAULT_PCAP_BUFFER_SIZE,
            source: None,
            ignored_keys: Vec::new(),
        }
    }
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        _ => Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
        }),
    }
}

/// Strip a trailing `;` and surrounding double quotes.
fn unquote(value: &str) -> &str {
    let value = value.trim().trim_end_matches(';').trim_end();
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

impl Config {
    /// Load `path` (if it exists) and apply environment overrides.
    ///
    /// Nothing is logged here since logging is configured from the result;
    /// callers report `source` and `ignored_keys` once it is.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            let mut config = Self::parse(&content)?;
            config.source = Some(path.to_path_buf());
            config
        } else {
            Self::default()
        };

        config.apply_overrides(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Parse configuration file contents.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        for (index, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (key, value) = line
                .split_once('=')
                .ok_or(ConfigError::Syntax { line: index + 1 })?;
            config.set(key.trim(), unquote(value))?;
        }

        Ok(config)
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "system_uuid" => self.system_uuid = non_empty(value),
            "server_url" => self.server_url = non_empty(value),
            "monitor_url" => self.monitor_url = non_empty(value),
            "network_interface" => self.network_interface = non_empty(value),
            "ignore_server_packets" => {
                self.ignore_server_packets = parse_bool("ignore_server_packets", value)?
            }
            "strict_filter" => self.strict_filter = parse_bool("strict_filter", value)?,
            "collector_key" => self.collector_key = non_empty(value),
            "collector_key_file" => self.collector_key_file = non_empty(value).map(PathBuf::from),
            "log_level" => self.log_level = value.to_string(),
            "pcap_buffer_size" => {
                self.pcap_buffer_size = value
                    .parse::<i32>()
                    .ok()
                    .filter(|size| *size > 0)
                    .ok_or_else(|| ConfigError::Invalid {
                        key: "pcap_buffer_size",
                        value: value.to_string(),
                    })?;
            }
            _ => self.ignored_keys.push(key.to_string()),
        }
        Ok(())
    }

    /// Apply `WALLMON_<KEY>` overrides looked up through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        const KEYS: [&str; 8] = [
            "system_uuid",
            "server_url",
            "monitor_url",
            "network_interface",
            "ignore_server_packets",
            "strict_filter",
            "collector_key",
            "collector_key_file",
        ];

        for key in KEYS {
            let name = format!("WALLMON_{}", key.to_ascii_uppercase());
            if let Some(value) = lookup(&name) {
                self.set(key, value.trim())?;
            }
        }
        Ok(())
    }

    /// Validate the configuration and project what the capture pipeline needs.
    pub fn capture_settings(&self) -> Result<CaptureSettings, ConfigError> {
        let uuid = self
            .system_uuid
            .as_deref()
            .ok_or(ConfigError::Missing("system_uuid"))?;
        let system_id = Uuid::parse_str(uuid).map_err(|_| ConfigError::Invalid {
            key: "system_uuid",
            value: uuid.to_string(),
        })?;

        let server_url = self
            .server_url
            .clone()
            .ok_or(ConfigError::Missing("server_url"))?;
        filter::url_host(&server_url).map_err(|_| ConfigError::Invalid {
            key: "server_url",
            value: server_url.clone(),
        })?;

        let monitor_url = self
            .monitor_url
            .clone()
            .ok_or(ConfigError::Missing("monitor_url"))?;
        filter::url_host(&monitor_url).map_err(|_| ConfigError::Invalid {
            key: "monitor_url",
            value: monitor_url.clone(),
        })?;

        Ok(CaptureSettings {
            system_id,
            server_url,
            monitor_url,
            management_interface: self.network_interface.clone(),
            filter_server_traffic: self.ignore_server_packets,
            strict_filter: self.strict_filter,
            snaplen: self.pcap_buffer_size,
            read_timeout: CAPTURE_TIMEOUT,
        })
    }

    /// The collector's Z85 CURVE public key, inline or read from `collector_key_file`.
    pub fn collector_key(&self) -> Result<String, ConfigError> {
        if let Some(key) = &self.collector_key {
            return Ok(key.clone());
        }

        let path = self
            .collector_key_file
            .as_ref()
            .ok_or(ConfigError::Missing("collector_key"))?;
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;

        non_empty(content.trim()).ok_or(ConfigError::Invalid {
            key: "collector_key_file",
            value: path.display().to_string(),
        })
    }

    /// Check everything the agent needs before it starts capturing.
    pub fn validate(&self) -> Result<CaptureSettings, ConfigError> {
        let settings = self.capture_settings()?;
        self.collector_key()?;
        Ok(settings)
    }

    /// Filter directive for tracing-subscriber when RUST_LOG is unset.
    pub fn tracing_filter(&self) -> &str {
        &self.log_level
    }
}
