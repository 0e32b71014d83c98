//! Module construction: translate the config into supervised worker specs,
//! one pipe per (source, destination) pair.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use bucky3_clients::carbon::{CarbonClient, CarbonConfig};
use bucky3_clients::elasticsearch::{ElasticsearchClient, ElasticsearchConfig};
use bucky3_clients::influxdb::{InfluxdbClient, InfluxdbConfig};
use bucky3_clients::prometheus::{self, PrometheusConfig, PrometheusExporter};
use bucky3_collectors::docker::{DockerStatsCollector, DockerStatsConfig};
use bucky3_collectors::filters::NameFilter;
use bucky3_collectors::jsond::{self, JsondConfig, JsondServer};
use bucky3_collectors::linux::{LinuxStatsCollector, LinuxStatsConfig};
use bucky3_core::clock::ClockSource;
use bucky3_core::connector::{bind_tcp, bind_udp};
use bucky3_core::error::CoreError;
use bucky3_core::pipe::{FanIn, PipeReceiver, PipeSender, pipe};
use bucky3_core::push::PushBuffer;
use bucky3_core::resolver::resolve_local;
use bucky3_core::scheduler::FlushScheduler;
use bucky3_core::worker::{DestinationInput, ShutdownFlag, SourceOutput, WorkerRunner};
use bucky3_statsd::aggregator::{AggregatorConfig, HistogramRule, KindConfig};
use bucky3_statsd::server::{self, StatsdConfig, StatsdServer};
use thiserror::Error;
use tracing::error;

use crate::config::{ConfigFile, EffectiveOptions, ModuleConfig};

#[derive(Error, Debug)]
pub enum WiringError {
    #[error("{0}")]
    Core(#[from] CoreError),

    #[error("invalid histogram rule: {0}")]
    Histogram(#[from] regex::Error),

    #[error("module {0}: {1}")]
    Module(String, String),
}

/// Spawns a fresh instance of one worker. Called by the supervisor at
/// startup and after every crash.
pub type WorkerFactory = Arc<dyn Fn(ShutdownFlag) -> JoinHandle<()> + Send + Sync>;

pub struct WorkerSpec {
    pub name: String,
    pub factory: WorkerFactory,
}

/// Build the full worker set: validated modules, pre-flight bind checks and
/// per-pair pipes.
pub fn build_workers(
    config: &ConfigFile,
    clock: &ClockSource,
) -> Result<Vec<WorkerSpec>, WiringError> {
    let active: Vec<(&String, &ModuleConfig)> = config
        .modules
        .iter()
        .filter(|(_, module)| !module.is_inactive())
        .collect();

    let destination_names: Vec<&String> = active
        .iter()
        .filter(|(_, module)| !module.is_source())
        .map(|(name, _)| *name)
        .collect();

    // One pipe per (source, destination) pair; shared pipes would interleave
    // chunks from different sources.
    let mut senders_by_source: BTreeMap<&String, Vec<PipeSender>> = BTreeMap::new();
    let mut receivers_by_destination: BTreeMap<&String, Vec<PipeReceiver>> = BTreeMap::new();
    for &(source_name, module) in active.iter().filter(|(_, m)| m.is_source()) {
        let selected: Vec<&String> = match module.destinations() {
            Some(selected) => destination_names
                .iter()
                .copied()
                .filter(|n| selected.contains(*n))
                .collect(),
            None => destination_names.clone(),
        };
        for destination_name in selected {
            let (tx, rx) = pipe();
            senders_by_source.entry(source_name).or_default().push(tx);
            receivers_by_destination
                .entry(destination_name)
                .or_default()
                .push(rx);
        }
    }

    let mut specs = Vec::new();
    for &(name, module) in &active {
        let effective = config.effective(&module.common());
        let spec = if module.is_source() {
            let senders = senders_by_source.remove(name).unwrap_or_default();
            build_source(name, module, effective, clock, senders)?
        } else {
            let receivers = receivers_by_destination.remove(name).unwrap_or_default();
            build_destination(name, module, effective, clock, receivers)?
        };
        specs.push(spec);
    }
    Ok(specs)
}

fn seconds(value: Option<f64>) -> Option<Duration> {
    value.map(Duration::from_secs_f64)
}

fn push_buffer<T>(
    effective: &EffectiveOptions,
    push_count_limit: Option<usize>,
    push_time_limit: Option<f64>,
) -> PushBuffer<T> {
    PushBuffer::new(
        effective.buffer_limit,
        effective.chunk_size,
        push_count_limit,
        seconds(push_time_limit),
        Duration::from_secs(effective.flush_interval),
    )
}

fn runner(
    name: &str,
    clock: &ClockSource,
    effective: &EffectiveOptions,
    shutdown: ShutdownFlag,
) -> WorkerRunner {
    WorkerRunner::new(
        name,
        clock.clone(),
        FlushScheduler::new(effective.flush_interval, effective.max_flush_interval),
        shutdown,
        effective.randomize_startup,
        effective.self_report,
    )
}

fn spawn_worker<F>(name: &str, body: F) -> JoinHandle<()>
where
    F: FnOnce() + Send + 'static,
{
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(body)
        .expect("spawn worker thread")
}

/// The local bind address must be resolvable and bindable up front; getting
/// this wrong is a configuration error the process should die on, not
/// something to retry forever.
fn preflight_udp(local_host: &str, default_port: u16) -> Result<(), CoreError> {
    let addr = resolve_local(local_host, default_port)?;
    if addr.port() != 0 {
        bind_udp(addr)?;
    }
    Ok(())
}

fn preflight_tcp(local_host: &str, default_port: u16) -> Result<(), CoreError> {
    let addr = resolve_local(local_host, default_port)?;
    if addr.port() != 0 {
        bind_tcp(addr)?;
    }
    Ok(())
}

fn build_source(
    name: &str,
    module: &ModuleConfig,
    effective: EffectiveOptions,
    clock: &ClockSource,
    senders: Vec<PipeSender>,
) -> Result<WorkerSpec, WiringError> {
    let name = name.to_string();
    let clock = clock.clone();

    let factory: WorkerFactory = match module {
        ModuleConfig::StatsdServer(module) => {
            let mut cfg = statsd_config(module)?;
            cfg.add_timestamps = effective.add_timestamps;
            preflight_udp(&cfg.local_host, server::DEFAULT_PORT)?;
            let worker_name = name.clone();
            Arc::new(move |shutdown: ShutdownFlag| {
                let worker_name = worker_name.clone();
                let cfg = cfg.clone();
                let clock = clock.clone();
                let effective = effective.clone();
                let senders = senders.clone();
                spawn_worker(&worker_name.clone(), move || {
                    let output =
                        SourceOutput::new(senders, effective.metadata.clone(), effective.chunk_size);
                    match StatsdServer::new(
                        &worker_name,
                        cfg,
                        clock.clone(),
                        output,
                        shutdown.clone(),
                    ) {
                        Ok(server) => {
                            runner(&worker_name, &clock, &effective, shutdown).run(server)
                        }
                        Err(e) => error!("{worker_name} failed to start: {e}"),
                    }
                })
            })
        }

        ModuleConfig::JsondServer(module) => {
            let cfg = JsondConfig {
                local_host: module
                    .local_host
                    .clone()
                    .unwrap_or_else(|| "0.0.0.0".to_string()),
                timestamp_window: module.timestamp_window.unwrap_or(600.0),
            };
            preflight_udp(&cfg.local_host, jsond::DEFAULT_PORT)?;
            let worker_name = name.clone();
            Arc::new(move |shutdown: ShutdownFlag| {
                let worker_name = worker_name.clone();
                let cfg = cfg.clone();
                let clock = clock.clone();
                let effective = effective.clone();
                let senders = senders.clone();
                spawn_worker(&worker_name.clone(), move || {
                    let output =
                        SourceOutput::new(senders, effective.metadata.clone(), effective.chunk_size);
                    match JsondServer::new(
                        &worker_name,
                        cfg,
                        clock.clone(),
                        output,
                        shutdown.clone(),
                    ) {
                        Ok(server) => {
                            runner(&worker_name, &clock, &effective, shutdown).run(server)
                        }
                        Err(e) => error!("{worker_name} failed to start: {e}"),
                    }
                })
            })
        }

        ModuleConfig::LinuxStats(module) => {
            let cfg = LinuxStatsConfig {
                interface_filter: NameFilter::new(
                    module.interface_whitelist.as_deref(),
                    module.interface_blacklist.as_deref(),
                )?,
                disk_filter: NameFilter::new(
                    module.disk_whitelist.as_deref(),
                    module.disk_blacklist.as_deref(),
                )?,
                filesystem_filter: NameFilter::new(
                    module.filesystem_whitelist.as_deref(),
                    module.filesystem_blacklist.as_deref(),
                )?,
                add_timestamps: effective.add_timestamps,
            };
            let worker_name = name.clone();
            Arc::new(move |shutdown: ShutdownFlag| {
                let worker_name = worker_name.clone();
                let cfg = cfg.clone();
                let clock = clock.clone();
                let effective = effective.clone();
                let senders = senders.clone();
                spawn_worker(&worker_name.clone(), move || {
                    let output =
                        SourceOutput::new(senders, effective.metadata.clone(), effective.chunk_size);
                    let collector = LinuxStatsCollector::new(&worker_name, cfg, output);
                    runner(&worker_name, &clock, &effective, shutdown).run(collector);
                })
            })
        }

        ModuleConfig::DockerStats(module) => {
            let mut cfg = DockerStatsConfig::default();
            if let Some(socket) = &module.docker_socket {
                cfg.docker_socket = socket.clone();
            }
            if let Some(api_version) = &module.api_version {
                cfg.api_version = api_version.clone();
            }
            cfg.env_mapping = module.env_mapping.clone();
            cfg.add_timestamps = effective.add_timestamps;
            let worker_name = name.clone();
            Arc::new(move |shutdown: ShutdownFlag| {
                let worker_name = worker_name.clone();
                let cfg = cfg.clone();
                let clock = clock.clone();
                let effective = effective.clone();
                let senders = senders.clone();
                spawn_worker(&worker_name.clone(), move || {
                    let output =
                        SourceOutput::new(senders, effective.metadata.clone(), effective.chunk_size);
                    let collector = DockerStatsCollector::new(&worker_name, cfg, output);
                    runner(&worker_name, &clock, &effective, shutdown).run(collector);
                })
            })
        }

        #[cfg(feature = "journal")]
        ModuleConfig::SystemdJournal(module) => {
            let cfg = bucky3_collectors::journal::JournalConfig {
                event_map: module.event_map.clone(),
                timestamp_window: module.timestamp_window.unwrap_or(600.0),
            };
            let worker_name = name.clone();
            Arc::new(move |shutdown: ShutdownFlag| {
                let worker_name = worker_name.clone();
                let cfg = cfg.clone();
                let clock = clock.clone();
                let effective = effective.clone();
                let senders = senders.clone();
                spawn_worker(&worker_name.clone(), move || {
                    let output =
                        SourceOutput::new(senders, effective.metadata.clone(), effective.chunk_size);
                    match bucky3_collectors::journal::JournalCollector::new(
                        &worker_name,
                        cfg,
                        clock.clone(),
                        output,
                    ) {
                        Ok(collector) => {
                            runner(&worker_name, &clock, &effective, shutdown).run(collector)
                        }
                        Err(e) => error!("{worker_name} failed to start: {e}"),
                    }
                })
            })
        }

        #[cfg(not(feature = "journal"))]
        ModuleConfig::SystemdJournal(_) => {
            return Err(WiringError::Module(
                name,
                "systemd_journal requires the 'journal' build feature".to_string(),
            ));
        }

        _ => unreachable!("destination module routed to build_source"),
    };

    Ok(WorkerSpec {
        name: name.to_string(),
        factory,
    })
}

fn statsd_config(module: &crate::config::StatsdModule) -> Result<StatsdConfig, WiringError> {
    let kind = |bucket: &Option<String>, timeout: &Option<f64>, default: &KindConfig| KindConfig {
        bucket: bucket.clone().unwrap_or_else(|| default.bucket.clone()),
        timeout: timeout.unwrap_or(default.timeout),
    };

    let defaults = AggregatorConfig::default();
    let mut histogram_rules = Vec::new();
    for rule in &module.histograms {
        histogram_rules.push(HistogramRule::new(
            rule.matches.clone().into_iter().collect(),
            rule.buckets
                .iter()
                .map(|bucket| (bucket.name.clone(), bucket.under))
                .collect(),
        )?);
    }

    Ok(StatsdConfig {
        local_host: module
            .local_host
            .clone()
            .unwrap_or_else(|| "0.0.0.0".to_string()),
        aggregator: AggregatorConfig {
            counters: kind(
                &module.counters_bucket,
                &module.counters_timeout,
                &defaults.counters,
            ),
            gauges: kind(&module.gauges_bucket, &module.gauges_timeout, &defaults.gauges),
            sets: kind(&module.sets_bucket, &module.sets_timeout, &defaults.sets),
            timers: kind(&module.timers_bucket, &module.timers_timeout, &defaults.timers),
            histograms: kind(
                &module.histograms_bucket,
                &module.histograms_timeout,
                &defaults.histograms,
            ),
            percentile_thresholds: module
                .percentile_thresholds
                .clone()
                .unwrap_or(defaults.percentile_thresholds),
            histogram_rules,
            timestamp_window: module.timestamp_window.unwrap_or(600.0),
        },
        add_timestamps: false,
    })
}

fn build_destination(
    name: &str,
    module: &ModuleConfig,
    effective: EffectiveOptions,
    clock: &ClockSource,
    receivers: Vec<PipeReceiver>,
) -> Result<WorkerSpec, WiringError> {
    let name = name.to_string();
    let clock = clock.clone();

    let factory: WorkerFactory = match module {
        ModuleConfig::CarbonClient(module) => {
            let cfg = CarbonConfig {
                remote_hosts: module.remote_hosts.clone(),
                name_mapping: module.name_mapping.clone(),
                socket_timeout: seconds(effective.socket_timeout),
            };
            let limits = (module.push_count_limit, module.push_time_limit);
            let worker_name = name.clone();
            Arc::new(move |shutdown: ShutdownFlag| {
                let worker_name = worker_name.clone();
                let cfg = cfg.clone();
                let clock = clock.clone();
                let effective = effective.clone();
                let receivers = receivers.clone();
                spawn_worker(&worker_name.clone(), move || {
                    let input = DestinationInput::new(
                        FanIn::new(receivers),
                        effective.metadata.clone(),
                    );
                    let client = CarbonClient::new(
                        &worker_name,
                        cfg,
                        clock.clone(),
                        input,
                        push_buffer(&effective, limits.0, limits.1),
                    );
                    runner(&worker_name, &clock, &effective, shutdown).run(client);
                })
            })
        }

        ModuleConfig::InfluxdbClient(module) => {
            let cfg = InfluxdbConfig {
                remote_hosts: module.remote_hosts.clone(),
                socket_timeout: seconds(effective.socket_timeout),
            };
            let limits = (module.push_count_limit, module.push_time_limit);
            let worker_name = name.clone();
            Arc::new(move |shutdown: ShutdownFlag| {
                let worker_name = worker_name.clone();
                let cfg = cfg.clone();
                let clock = clock.clone();
                let effective = effective.clone();
                let receivers = receivers.clone();
                spawn_worker(&worker_name.clone(), move || {
                    let input = DestinationInput::new(
                        FanIn::new(receivers),
                        effective.metadata.clone(),
                    );
                    let client = InfluxdbClient::new(
                        &worker_name,
                        cfg,
                        clock.clone(),
                        input,
                        push_buffer(&effective, limits.0, limits.1),
                    );
                    runner(&worker_name, &clock, &effective, shutdown).run(client);
                })
            })
        }

        ModuleConfig::PrometheusExporter(module) => {
            let cfg = PrometheusConfig {
                local_host: module
                    .local_host
                    .clone()
                    .unwrap_or_else(|| "0.0.0.0".to_string()),
                http_path: module
                    .http_path
                    .clone()
                    .unwrap_or_else(|| "metrics".to_string()),
                values_timeout: module.values_timeout.unwrap_or(60.0),
                chunk_size: effective.chunk_size,
                http_timeout: seconds(module.http_timeout).unwrap_or(Duration::from_secs(3)),
            };
            preflight_tcp(&cfg.local_host, prometheus::DEFAULT_PORT)?;
            let worker_name = name.clone();
            Arc::new(move |shutdown: ShutdownFlag| {
                let worker_name = worker_name.clone();
                let cfg = cfg.clone();
                let clock = clock.clone();
                let effective = effective.clone();
                let receivers = receivers.clone();
                spawn_worker(&worker_name.clone(), move || {
                    let input = DestinationInput::new(
                        FanIn::new(receivers),
                        effective.metadata.clone(),
                    );
                    match PrometheusExporter::new(
                        &worker_name,
                        cfg,
                        clock.clone(),
                        input,
                        shutdown.clone(),
                    ) {
                        Ok(exporter) => {
                            runner(&worker_name, &clock, &effective, shutdown).run(exporter)
                        }
                        Err(e) => error!("{worker_name} failed to start: {e}"),
                    }
                })
            })
        }

        ModuleConfig::ElasticsearchClient(module) => {
            let cfg = ElasticsearchConfig {
                remote_hosts: module.remote_hosts.clone(),
                index_name: module.index_name.clone(),
                use_compression: module.use_compression.unwrap_or(true),
                socket_timeout: seconds(effective.socket_timeout),
            };
            let limits = (module.push_count_limit, module.push_time_limit);
            let worker_name = name.clone();
            Arc::new(move |shutdown: ShutdownFlag| {
                let worker_name = worker_name.clone();
                let cfg = cfg.clone();
                let clock = clock.clone();
                let effective = effective.clone();
                let receivers = receivers.clone();
                spawn_worker(&worker_name.clone(), move || {
                    let input = DestinationInput::new(
                        FanIn::new(receivers),
                        effective.metadata.clone(),
                    );
                    let client = ElasticsearchClient::new(
                        &worker_name,
                        cfg,
                        clock.clone(),
                        input,
                        push_buffer(&effective, limits.0, limits.1),
                    );
                    runner(&worker_name, &clock, &effective, shutdown).run(client);
                })
            })
        }

        _ => unreachable!("source module routed to build_destination"),
    };

    Ok(WorkerSpec { name, factory })
}
