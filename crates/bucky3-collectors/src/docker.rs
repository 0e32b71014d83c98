//! Docker container stats collector.
//!
//! Container metadata comes from the local Docker API (the stats endpoint
//! itself is far too slow to poll), resource usage comes straight from the
//! cgroup filesystem and the container's /proc netns view. Works only
//! against a local dockerd.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::sync::atomic::Ordering::Relaxed;

use bucky3_core::sample::{Metadata, Sample, Scalar, Timestamp, Values};
use bucky3_core::selfreport::{WorkerHealth, self_report_sample};
use bucky3_core::worker::{SourceOutput, Worker};
use regex::Regex;
use serde_json::Value;
use tracing::{debug, warn};

use crate::procfs;

#[derive(Clone)]
pub struct DockerStatsConfig {
    pub docker_socket: String,
    pub api_version: String,
    /// Container environment variables lifted into sample metadata,
    /// env name → metadata key.
    pub env_mapping: BTreeMap<String, String>,
    pub add_timestamps: bool,
}

impl Default for DockerStatsConfig {
    fn default() -> Self {
        Self {
            docker_socket: "/var/run/docker.sock".to_string(),
            api_version: "1.22".to_string(),
            env_mapping: BTreeMap::new(),
            add_timestamps: false,
        }
    }
}

pub struct DockerStatsCollector {
    name: String,
    cfg: DockerStatsConfig,
    env_regex: Regex,
    system_memory: i64,
    output: SourceOutput,
}

impl DockerStatsCollector {
    pub fn new(name: &str, cfg: DockerStatsConfig, output: SourceOutput) -> Self {
        // Same character set the statsd metadata matching accepts.
        let env_regex = Regex::new(
            r"^([a-zA-Z][a-zA-Z0-9_]*)=([a-zA-Z0-9_:=\-\+@\?#\./%<>\*;&\[\]]+)$",
        )
        .expect("env regex");

        let system_memory = std::fs::read_to_string("/proc/meminfo")
            .ok()
            .map(|content| procfs::parse_meminfo(&content))
            .and_then(|memory| match memory.get("total_bytes") {
                Some(Scalar::Int(v)) => Some(*v),
                _ => None,
            })
            .unwrap_or(0);

        Self {
            name: name.to_string(),
            cfg,
            env_regex,
            system_memory,
            output,
        }
    }

    fn api_get(&self, path: &str) -> std::io::Result<Value> {
        let url = format!("/v{}{}", self.cfg.api_version, path);
        let body = unix_http_get(&self.cfg.docker_socket, &url)?;
        serde_json::from_slice(&body).map_err(std::io::Error::other)
    }

    fn collect_container(
        &self,
        container_id: &str,
        container_info: &Value,
        timestamp: Option<Timestamp>,
    ) -> std::io::Result<()> {
        let inspect = self.api_get(&format!("/containers/{container_id}/json?size=true"))?;
        let container_metadata = self.extract_metadata(container_id, container_info, &inspect);

        // Missing cgroup files mean the container went away mid-scan; skip
        // it without failing the whole pass.
        let collected = (|| -> std::io::Result<()> {
            self.read_df_stats(timestamp, &container_metadata, &inspect);
            self.read_cpu_stats(container_id, timestamp, &container_metadata, &inspect)?;
            self.read_memory_stats(container_id, timestamp, &container_metadata, &inspect)?;
            self.read_interface_stats(timestamp, &container_metadata, &inspect);
            Ok(())
        })();
        if let Err(e) = collected {
            if e.kind() == std::io::ErrorKind::NotFound {
                debug!("container {container_id} vanished mid-scan");
            } else {
                return Err(e);
            }
        }
        Ok(())
    }

    fn read_df_stats(
        &self,
        timestamp: Option<Timestamp>,
        container_metadata: &Metadata,
        inspect: &Value,
    ) {
        let total = inspect.get("SizeRootFs").and_then(Value::as_i64).unwrap_or(0);
        let used = inspect.get("SizeRw").and_then(Value::as_i64).unwrap_or(0);
        self.output.buffer_metric(
            "docker_filesystem",
            Values::map([("total_bytes", total), ("used_bytes", used)]),
            timestamp,
            container_metadata.clone(),
        );
    }

    fn read_cpu_stats(
        &self,
        container_id: &str,
        timestamp: Option<Timestamp>,
        container_metadata: &Metadata,
        inspect: &Value,
    ) -> std::io::Result<()> {
        let path = format!("/sys/fs/cgroup/cpu/docker/{container_id}/cpuacct.usage_percpu");
        let usage = std::fs::read_to_string(path)?;
        let counters: Vec<i64> = usage
            .split_whitespace()
            .filter_map(|t| t.parse().ok())
            .collect();

        for (cpu, value) in counters.iter().enumerate() {
            let mut meta = container_metadata.clone();
            meta.insert("name".to_string(), format!("cpu{cpu}"));
            self.output.buffer_metric(
                "docker_cpu",
                Values::map([("usage", *value)]),
                timestamp,
                meta,
            );
        }

        // Docker reports CPU counters in nanosecs but quota/period in
        // microsecs; limit_ps is normalized to nanosecs-per-sec so it lines
        // up with the usage counters.
        let host_config = inspect.get("HostConfig").cloned().unwrap_or(Value::Null);
        let get = |key: &str| host_config.get(key).and_then(Value::as_i64).unwrap_or(0);
        let mut limit_ps = get("NanoCpus");
        if limit_ps == 0 {
            let cpu_period = match get("CpuPeriod") {
                0 => 1000000,
                period => period,
            };
            let cpu_quota = match get("CpuQuota") {
                0 => cpu_period * counters.len() as i64,
                quota => quota,
            };
            limit_ps = (1000000000.0 * cpu_quota as f64 / cpu_period as f64).round() as i64;
        }
        self.output.buffer_metric(
            "docker_cpu",
            Values::map([("limit_ps", limit_ps)]),
            timestamp,
            container_metadata.clone(),
        );
        Ok(())
    }

    fn read_memory_stats(
        &self,
        container_id: &str,
        timestamp: Option<Timestamp>,
        container_metadata: &Metadata,
        inspect: &Value,
    ) -> std::io::Result<()> {
        let path = format!("/sys/fs/cgroup/memory/docker/{container_id}/memory.usage_in_bytes");
        let used: i64 = std::fs::read_to_string(path)?
            .trim()
            .parse()
            .map_err(std::io::Error::other)?;

        let limit = match inspect.pointer("/HostConfig/Memory").and_then(Value::as_i64) {
            Some(0) | None => self.system_memory,
            Some(limit) => limit,
        };
        self.output.buffer_metric(
            "docker_memory",
            Values::map([("used_bytes", used), ("limit_bytes", limit)]),
            timestamp,
            container_metadata.clone(),
        );
        Ok(())
    }

    fn read_interface_stats(
        &self,
        timestamp: Option<Timestamp>,
        container_metadata: &Metadata,
        inspect: &Value,
    ) {
        let Some(root_pid) = inspect.pointer("/State/Pid").and_then(Value::as_i64) else {
            return;
        };
        let Ok(net_dev) = std::fs::read_to_string(format!("/proc/{root_pid}/net/dev")) else {
            return;
        };
        for (interface, counters) in procfs::parse_net_dev(&net_dev) {
            let mut meta = container_metadata.clone();
            meta.insert("name".to_string(), interface);
            self.output
                .buffer_metric("docker_interface", Values::Map(counters), timestamp, meta);
        }
    }

    fn extract_metadata(
        &self,
        container_id: &str,
        container_info: &Value,
        inspect: &Value,
    ) -> Metadata {
        let mut container_metadata = Metadata::new();

        if !self.cfg.env_mapping.is_empty() {
            let env = inspect
                .pointer("/Config/Env")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            for entry in env {
                let Some(entry) = entry.as_str() else { continue };
                let Some(captures) = self.env_regex.captures(entry) else {
                    continue;
                };
                let (env_name, env_value) = (&captures[1], &captures[2]);
                if let Some(key) = self.cfg.env_mapping.get(env_name) {
                    container_metadata.insert(key.clone(), env_value.to_string());
                }
            }
        }

        if let Some(name) = container_info
            .get("Names")
            .and_then(Value::as_array)
            .and_then(|names| names.first())
            .and_then(Value::as_str)
        {
            container_metadata.insert("docker_name".to_string(), name.to_string());
        }
        if let Some(labels) = inspect.pointer("/Config/Labels").and_then(Value::as_object) {
            for (key, value) in labels {
                if let Some(value) = value.as_str() {
                    container_metadata.insert(key.clone(), value.to_string());
                }
            }
        }
        container_metadata.insert(
            "docker_id".to_string(),
            container_id.chars().take(12).collect(),
        );
        container_metadata
    }
}

impl Worker for DockerStatsCollector {
    fn flush(&mut self, timestamp: Timestamp) -> bool {
        let timestamp = self.cfg.add_timestamps.then_some(timestamp);

        let scan = (|| -> std::io::Result<()> {
            debug!("starting containers scan");
            let containers = self.api_get("/containers/json")?;
            let mut containers = containers.as_array().cloned().unwrap_or_default();
            containers.sort_by_key(|c| {
                c.get("Id").and_then(Value::as_str).unwrap_or("").to_string()
            });

            for container_info in &containers {
                let Some(container_id) = container_info.get("Id").and_then(Value::as_str) else {
                    continue;
                };
                self.collect_container(container_id, container_info, timestamp)?;
            }
            debug!("finished containers scan");
            Ok(())
        })();

        match scan {
            Ok(()) => self.output.flush_chunks(),
            Err(e) => {
                warn!("docker error, is it running? {e}");
                self.output.flush_chunks();
                false
            }
        }
    }

    fn self_report(&mut self, timestamp: Timestamp, health: WorkerHealth) {
        let mut fields = health.into_fields();
        fields.insert(
            "metrics_produced".to_string(),
            Scalar::Int(self.output.counters().metrics_produced.load(Relaxed) as i64),
        );
        fields.insert(
            "metrics_dropped".to_string(),
            Scalar::Int(self.output.counters().metrics_dropped.load(Relaxed) as i64),
        );

        let Sample {
            bucket,
            values,
            timestamp,
            metadata,
        } = self_report_sample(&self.name, timestamp, fields);
        self.output.buffer_metric(&bucket, values, timestamp, metadata);
    }
}

/// One-shot HTTP/1.0 GET over the Docker unix socket. The 1.0 dialect makes
/// dockerd close the connection after the response, so the body is simply
/// everything after the header block.
fn unix_http_get(socket_path: &str, url: &str) -> std::io::Result<Vec<u8>> {
    let mut stream = UnixStream::connect(socket_path)?;
    write!(stream, "GET {url} HTTP/1.0\r\nHost: docker\r\n\r\n")?;

    let mut response = Vec::new();
    stream.read_to_end(&mut response)?;
    parse_http_response(&response)
}

fn parse_http_response(response: &[u8]) -> std::io::Result<Vec<u8>> {
    let split = response
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .ok_or_else(|| std::io::Error::other("malformed HTTP response"))?;

    let head = String::from_utf8_lossy(&response[..split]);
    let status_line = head.lines().next().unwrap_or_default();
    let status: u16 = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| std::io::Error::other("malformed HTTP status line"))?;
    if status != 200 {
        return Err(std::io::Error::other(format!("docker error code {status}")));
    }

    Ok(response[split + 4..].to_vec())
}
