//! The declarative TOML configuration.
//!
//! `${NAME}` references are substituted from the environment before parsing.
//! Every module section is typed by its `module_type` and unknown options
//! are rejected; live reload is deliberately unsupported, restart instead.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("undefined environment variable ${{{0}}}")]
    Env(String),

    #[error("cannot parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub log_level: Option<String>,
    /// Global default tick interval, seconds.
    pub flush_interval: Option<u64>,
    pub max_flush_interval: Option<u64>,
    pub randomize_startup: Option<bool>,
    pub self_report: Option<bool>,
    pub add_timestamps: Option<bool>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub modules: BTreeMap<String, ModuleConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "module_type")]
pub enum ModuleConfig {
    #[serde(rename = "statsd_server")]
    StatsdServer(StatsdModule),
    #[serde(rename = "jsond_server")]
    JsondServer(JsondModule),
    #[serde(rename = "linux_stats")]
    LinuxStats(LinuxStatsModule),
    #[serde(rename = "docker_stats")]
    DockerStats(DockerStatsModule),
    #[serde(rename = "systemd_journal")]
    SystemdJournal(JournalModule),
    #[serde(rename = "carbon_client")]
    CarbonClient(CarbonModule),
    #[serde(rename = "influxdb_client")]
    InfluxdbClient(InfluxdbModule),
    #[serde(rename = "prometheus_exporter")]
    PrometheusExporter(PrometheusModule),
    #[serde(rename = "elasticsearch_client")]
    ElasticsearchClient(ElasticsearchModule),
}

impl ModuleConfig {
    pub fn is_source(&self) -> bool {
        matches!(
            self,
            ModuleConfig::StatsdServer(_)
                | ModuleConfig::JsondServer(_)
                | ModuleConfig::LinuxStats(_)
                | ModuleConfig::DockerStats(_)
                | ModuleConfig::SystemdJournal(_)
        )
    }

    pub fn is_inactive(&self) -> bool {
        self.common().module_inactive.unwrap_or(false)
    }

    /// The source's destination restriction, when declared.
    pub fn destinations(&self) -> Option<&[String]> {
        match self {
            ModuleConfig::StatsdServer(m) => m.destinations.as_deref(),
            ModuleConfig::JsondServer(m) => m.destinations.as_deref(),
            ModuleConfig::LinuxStats(m) => m.destinations.as_deref(),
            ModuleConfig::DockerStats(m) => m.destinations.as_deref(),
            ModuleConfig::SystemdJournal(m) => m.destinations.as_deref(),
            _ => None,
        }
    }

    pub fn common(&self) -> CommonOptions {
        match self {
            ModuleConfig::StatsdServer(m) => m.common_options(),
            ModuleConfig::JsondServer(m) => m.common_options(),
            ModuleConfig::LinuxStats(m) => m.common_options(),
            ModuleConfig::DockerStats(m) => m.common_options(),
            ModuleConfig::SystemdJournal(m) => m.common_options(),
            ModuleConfig::CarbonClient(m) => m.common_options(),
            ModuleConfig::InfluxdbClient(m) => m.common_options(),
            ModuleConfig::PrometheusExporter(m) => m.common_options(),
            ModuleConfig::ElasticsearchClient(m) => m.common_options(),
        }
    }
}

/// The per-module options every module type understands, resolved against
/// the top-level defaults by [`ConfigFile::effective`].
#[derive(Debug, Default, Clone)]
pub struct CommonOptions {
    pub module_inactive: Option<bool>,
    pub flush_interval: Option<u64>,
    pub max_flush_interval: Option<u64>,
    pub randomize_startup: Option<bool>,
    pub self_report: Option<bool>,
    pub add_timestamps: Option<bool>,
    pub chunk_size: Option<usize>,
    pub buffer_limit: Option<usize>,
    pub socket_timeout: Option<f64>,
    pub metadata: Option<BTreeMap<String, String>>,
}

/// Effective per-worker settings after applying global defaults.
#[derive(Debug, Clone)]
pub struct EffectiveOptions {
    pub flush_interval: u64,
    pub max_flush_interval: Option<u64>,
    pub randomize_startup: bool,
    pub self_report: bool,
    pub add_timestamps: bool,
    pub chunk_size: usize,
    pub buffer_limit: usize,
    pub socket_timeout: Option<f64>,
    pub metadata: BTreeMap<String, String>,
}

impl ConfigFile {
    pub fn effective(&self, common: &CommonOptions) -> EffectiveOptions {
        EffectiveOptions {
            flush_interval: common
                .flush_interval
                .or(self.flush_interval)
                .unwrap_or(10)
                .max(1),
            max_flush_interval: common.max_flush_interval.or(self.max_flush_interval),
            randomize_startup: common
                .randomize_startup
                .or(self.randomize_startup)
                .unwrap_or(true),
            self_report: common.self_report.or(self.self_report).unwrap_or(false),
            add_timestamps: common
                .add_timestamps
                .or(self.add_timestamps)
                .unwrap_or(false),
            chunk_size: common.chunk_size.unwrap_or(300).max(1),
            buffer_limit: common.buffer_limit.unwrap_or(10000).max(100),
            socket_timeout: common.socket_timeout,
            metadata: common.metadata.clone().unwrap_or_else(|| self.metadata.clone()),
        }
    }
}

macro_rules! common_options {
    ($module:ty) => {
        impl $module {
            pub fn common_options(&self) -> CommonOptions {
                CommonOptions {
                    module_inactive: self.module_inactive,
                    flush_interval: self.flush_interval,
                    max_flush_interval: self.max_flush_interval,
                    randomize_startup: self.randomize_startup,
                    self_report: self.self_report,
                    add_timestamps: self.add_timestamps,
                    chunk_size: self.chunk_size,
                    buffer_limit: self.buffer_limit,
                    socket_timeout: self.socket_timeout,
                    metadata: self.metadata.clone(),
                }
            }
        }
    };
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StatsdModule {
    pub local_host: Option<String>,
    pub destinations: Option<Vec<String>>,
    pub timestamp_window: Option<f64>,
    pub percentile_thresholds: Option<Vec<f64>>,
    pub counters_bucket: Option<String>,
    pub counters_timeout: Option<f64>,
    pub gauges_bucket: Option<String>,
    pub gauges_timeout: Option<f64>,
    pub sets_bucket: Option<String>,
    pub sets_timeout: Option<f64>,
    pub timers_bucket: Option<String>,
    pub timers_timeout: Option<f64>,
    pub histograms_bucket: Option<String>,
    pub histograms_timeout: Option<f64>,
    #[serde(default)]
    pub histograms: Vec<HistogramRuleConfig>,
    pub module_inactive: Option<bool>,
    pub flush_interval: Option<u64>,
    pub max_flush_interval: Option<u64>,
    pub randomize_startup: Option<bool>,
    pub self_report: Option<bool>,
    pub add_timestamps: Option<bool>,
    pub chunk_size: Option<usize>,
    pub buffer_limit: Option<usize>,
    pub socket_timeout: Option<f64>,
    pub metadata: Option<BTreeMap<String, String>>,
}
common_options!(StatsdModule);

/// One histogram selector: metadata matchers (full-match regexes) and the
/// ordered buckets, each open-ended unless `under` is given.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HistogramRuleConfig {
    #[serde(rename = "match")]
    pub matches: BTreeMap<String, String>,
    pub buckets: Vec<HistogramBucketConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HistogramBucketConfig {
    pub name: String,
    pub under: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JsondModule {
    pub local_host: Option<String>,
    pub destinations: Option<Vec<String>>,
    pub timestamp_window: Option<f64>,
    pub module_inactive: Option<bool>,
    pub flush_interval: Option<u64>,
    pub max_flush_interval: Option<u64>,
    pub randomize_startup: Option<bool>,
    pub self_report: Option<bool>,
    pub add_timestamps: Option<bool>,
    pub chunk_size: Option<usize>,
    pub buffer_limit: Option<usize>,
    pub socket_timeout: Option<f64>,
    pub metadata: Option<BTreeMap<String, String>>,
}
common_options!(JsondModule);

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LinuxStatsModule {
    pub destinations: Option<Vec<String>>,
    pub interface_whitelist: Option<Vec<String>>,
    pub interface_blacklist: Option<Vec<String>>,
    pub disk_whitelist: Option<Vec<String>>,
    pub disk_blacklist: Option<Vec<String>>,
    pub filesystem_whitelist: Option<Vec<String>>,
    pub filesystem_blacklist: Option<Vec<String>>,
    pub module_inactive: Option<bool>,
    pub flush_interval: Option<u64>,
    pub max_flush_interval: Option<u64>,
    pub randomize_startup: Option<bool>,
    pub self_report: Option<bool>,
    pub add_timestamps: Option<bool>,
    pub chunk_size: Option<usize>,
    pub buffer_limit: Option<usize>,
    pub socket_timeout: Option<f64>,
    pub metadata: Option<BTreeMap<String, String>>,
}
common_options!(LinuxStatsModule);

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DockerStatsModule {
    pub destinations: Option<Vec<String>>,
    pub docker_socket: Option<String>,
    pub api_version: Option<String>,
    #[serde(default)]
    pub env_mapping: BTreeMap<String, String>,
    pub module_inactive: Option<bool>,
    pub flush_interval: Option<u64>,
    pub max_flush_interval: Option<u64>,
    pub randomize_startup: Option<bool>,
    pub self_report: Option<bool>,
    pub add_timestamps: Option<bool>,
    pub chunk_size: Option<usize>,
    pub buffer_limit: Option<usize>,
    pub socket_timeout: Option<f64>,
    pub metadata: Option<BTreeMap<String, String>>,
}
common_options!(DockerStatsModule);

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JournalModule {
    pub destinations: Option<Vec<String>>,
    pub timestamp_window: Option<f64>,
    pub event_map: Option<BTreeMap<String, String>>,
    pub module_inactive: Option<bool>,
    pub flush_interval: Option<u64>,
    pub max_flush_interval: Option<u64>,
    pub randomize_startup: Option<bool>,
    pub self_report: Option<bool>,
    pub add_timestamps: Option<bool>,
    pub chunk_size: Option<usize>,
    pub buffer_limit: Option<usize>,
    pub socket_timeout: Option<f64>,
    pub metadata: Option<BTreeMap<String, String>>,
}
common_options!(JournalModule);

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CarbonModule {
    pub remote_hosts: Vec<String>,
    pub name_mapping: Vec<String>,
    pub push_count_limit: Option<usize>,
    pub push_time_limit: Option<f64>,
    pub module_inactive: Option<bool>,
    pub flush_interval: Option<u64>,
    pub max_flush_interval: Option<u64>,
    pub randomize_startup: Option<bool>,
    pub self_report: Option<bool>,
    pub add_timestamps: Option<bool>,
    pub chunk_size: Option<usize>,
    pub buffer_limit: Option<usize>,
    pub socket_timeout: Option<f64>,
    pub metadata: Option<BTreeMap<String, String>>,
}
common_options!(CarbonModule);

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InfluxdbModule {
    pub remote_hosts: Vec<String>,
    pub push_count_limit: Option<usize>,
    pub push_time_limit: Option<f64>,
    pub module_inactive: Option<bool>,
    pub flush_interval: Option<u64>,
    pub max_flush_interval: Option<u64>,
    pub randomize_startup: Option<bool>,
    pub self_report: Option<bool>,
    pub add_timestamps: Option<bool>,
    pub chunk_size: Option<usize>,
    pub buffer_limit: Option<usize>,
    pub socket_timeout: Option<f64>,
    pub metadata: Option<BTreeMap<String, String>>,
}
common_options!(InfluxdbModule);

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PrometheusModule {
    pub local_host: Option<String>,
    pub http_path: Option<String>,
    pub http_timeout: Option<f64>,
    pub values_timeout: Option<f64>,
    pub module_inactive: Option<bool>,
    pub flush_interval: Option<u64>,
    pub max_flush_interval: Option<u64>,
    pub randomize_startup: Option<bool>,
    pub self_report: Option<bool>,
    pub add_timestamps: Option<bool>,
    pub chunk_size: Option<usize>,
    pub buffer_limit: Option<usize>,
    pub socket_timeout: Option<f64>,
    pub metadata: Option<BTreeMap<String, String>>,
}
common_options!(PrometheusModule);

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ElasticsearchModule {
    pub remote_hosts: Vec<String>,
    pub index_name: Option<String>,
    pub use_compression: Option<bool>,
    pub push_count_limit: Option<usize>,
    pub push_time_limit: Option<f64>,
    pub module_inactive: Option<bool>,
    pub flush_interval: Option<u64>,
    pub max_flush_interval: Option<u64>,
    pub randomize_startup: Option<bool>,
    pub self_report: Option<bool>,
    pub add_timestamps: Option<bool>,
    pub chunk_size: Option<usize>,
    pub buffer_limit: Option<usize>,
    pub socket_timeout: Option<f64>,
    pub metadata: Option<BTreeMap<String, String>>,
}
common_options!(ElasticsearchModule);

/// Load, substitute and validate the config file.
pub fn load_config(path: &Path) -> Result<ConfigFile, ConfigError> {
    let raw = std::fs::read_to_string(path)?;
    let substituted = substitute_env(&raw, |name| std::env::var(name).ok())?;
    let config: ConfigFile = toml::from_str(&substituted)?;
    validate(&config)?;
    Ok(config)
}

/// The embedded fallback config: statsd in, Prometheus out.
pub fn load_default_config() -> Result<ConfigFile, ConfigError> {
    let config: ConfigFile = toml::from_str(include_str!("../default.toml"))?;
    validate(&config)?;
    Ok(config)
}

/// Replace every `${NAME}` with its environment value. A reference to an
/// unset variable aborts startup; a config half-filled with empty strings is
/// worse than no config.
pub fn substitute_env<F>(raw: &str, lookup: F) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let pattern = regex::Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("env pattern");
    let mut result = String::with_capacity(raw.len());
    let mut last = 0;

    for captures in pattern.captures_iter(raw) {
        let whole = captures.get(0).unwrap();
        let name = &captures[1];
        result.push_str(&raw[last..whole.start()]);
        match lookup(name) {
            Some(value) => result.push_str(&value),
            None => return Err(ConfigError::Env(name.to_string())),
        }
        last = whole.end();
    }
    result.push_str(&raw[last..]);
    Ok(result)
}

fn validate(config: &ConfigFile) -> Result<(), ConfigError> {
    let active: Vec<(&String, &ModuleConfig)> = config
        .modules
        .iter()
        .filter(|(_, m)| !m.is_inactive())
        .collect();

    if !active.iter().any(|(_, m)| m.is_source()) {
        return Err(ConfigError::Invalid("no source modules configured".into()));
    }
    if !active.iter().any(|(_, m)| !m.is_source()) {
        return Err(ConfigError::Invalid(
            "no destination modules configured".into(),
        ));
    }

    for (name, module) in &active {
        if let Some(destinations) = module.destinations() {
            for destination in destinations {
                let known = active
                    .iter()
                    .any(|(n, m)| !m.is_source() && *n == destination);
                if !known {
                    return Err(ConfigError::Invalid(format!(
                        "{name} routes to unknown destination {destination}"
                    )));
                }
            }
        }
    }
    Ok(())
}
