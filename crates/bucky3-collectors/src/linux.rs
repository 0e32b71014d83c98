//! Periodic /proc & /sys system-stats collector.

use std::ffi::CString;
use std::sync::atomic::Ordering::Relaxed;

use bucky3_core::sample::{Metadata, Sample, Scalar, Timestamp, Values, metadata};
use bucky3_core::selfreport::{WorkerHealth, self_report_sample};
use bucky3_core::worker::{SourceOutput, Worker};
use tracing::debug;

use crate::filters::NameFilter;
use crate::procfs;

#[derive(Clone)]
pub struct LinuxStatsConfig {
    pub interface_filter: NameFilter,
    pub disk_filter: NameFilter,
    pub filesystem_filter: NameFilter,
    pub add_timestamps: bool,
}

/// Reads `/proc/stat`, `loadavg`, `meminfo`, `net/dev`, `mounts` (+statvfs),
/// `diskstats` and the snmp/netstat protocol counters once per flush.
/// Counter-like fields are emitted as-is; rates are derived downstream.
pub struct LinuxStatsCollector {
    name: String,
    cfg: LinuxStatsConfig,
    output: SourceOutput,
}

impl LinuxStatsCollector {
    pub fn new(name: &str, cfg: LinuxStatsConfig, output: SourceOutput) -> Self {
        Self {
            name: name.to_string(),
            cfg,
            output,
        }
    }

    fn read_activity_stats(&self, timestamp: Option<Timestamp>) {
        let Ok(stat) = std::fs::read_to_string("/proc/stat") else {
            return;
        };
        let stats = procfs::parse_stat(&stat);
        for (cpu_name, counters) in stats.cpus {
            self.output.buffer_metric(
                "system_cpu",
                Values::Map(counters),
                timestamp,
                metadata([("name", cpu_name.as_str())]),
            );
        }

        let mut activity = stats.activity;
        if let Some(load) = std::fs::read_to_string("/proc/loadavg")
            .ok()
            .as_deref()
            .and_then(procfs::parse_loadavg)
        {
            activity.insert("load".to_string(), Scalar::Float(load));
        }
        if !activity.is_empty() {
            self.output
                .buffer_metric("system_activity", Values::Map(activity), timestamp, Metadata::new());
        }
    }

    fn read_memory_stats(&self, timestamp: Option<Timestamp>) {
        let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") else {
            return;
        };
        let memory = procfs::parse_meminfo(&meminfo);
        if !memory.is_empty() {
            self.output
                .buffer_metric("system_memory", Values::Map(memory), timestamp, Metadata::new());
        }
    }

    fn read_interface_stats(&self, timestamp: Option<Timestamp>) {
        let Ok(net_dev) = std::fs::read_to_string("/proc/net/dev") else {
            return;
        };
        for (interface, counters) in procfs::parse_net_dev(&net_dev) {
            if self.cfg.interface_filter.accepts(&interface) {
                self.output.buffer_metric(
                    "system_interface",
                    Values::Map(counters),
                    timestamp,
                    metadata([("name", interface.as_str())]),
                );
            }
        }
    }

    fn read_disk_stats(&self, timestamp: Option<Timestamp>) {
        let Ok(diskstats) = std::fs::read_to_string("/proc/diskstats") else {
            return;
        };
        for (disk, counters) in procfs::parse_diskstats(&diskstats) {
            if self.cfg.disk_filter.accepts(&disk) {
                self.output.buffer_metric(
                    "system_disk",
                    Values::Map(counters),
                    timestamp,
                    metadata([("name", disk.as_str())]),
                );
            }
        }
    }

    fn read_filesystem_stats(&self, timestamp: Option<Timestamp>) {
        let Ok(mounts) = std::fs::read_to_string("/proc/mounts") else {
            return;
        };
        for line in mounts.lines() {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.len() != 6 || !tokens[1].starts_with('/') {
                continue;
            }
            let (device, mount_path, filesystem) = (tokens[0], tokens[1], tokens[2]);
            if !self.cfg.filesystem_filter.accepts(filesystem) {
                continue;
            }
            let Some(stats) = statvfs(mount_path) else {
                continue;
            };
            // Zero inodes marks special filesystems not worth reporting.
            if stats.total_inodes == 0 {
                continue;
            }
            self.output.buffer_metric(
                "system_filesystem",
                Values::map([
                    ("free_bytes", stats.free_bytes),
                    ("total_bytes", stats.total_bytes),
                    ("free_inodes", stats.free_inodes),
                    ("total_inodes", stats.total_inodes),
                ]),
                timestamp,
                metadata([
                    ("device", device),
                    ("name", mount_path),
                    ("type", filesystem),
                ]),
            );
        }
    }

    fn read_protocol_stats(&self, timestamp: Option<Timestamp>) {
        // IPv6 has its own file with a different syntax; not covered here.
        let snmp = std::fs::read_to_string("/proc/net/snmp").unwrap_or_default();
        let netstat = std::fs::read_to_string("/proc/net/netstat").unwrap_or_default();
        for (protocol, counters) in procfs::parse_protocols([snmp.as_str(), netstat.as_str()]) {
            self.output.buffer_metric(
                "system_protocol",
                Values::Map(counters),
                timestamp,
                metadata([("name", protocol.as_str())]),
            );
        }
    }
}

impl Worker for LinuxStatsCollector {
    fn flush(&mut self, timestamp: Timestamp) -> bool {
        let timestamp = self.cfg.add_timestamps.then_some(timestamp);
        debug!("{} scanning /proc", self.name);
        self.read_activity_stats(timestamp);
        self.read_memory_stats(timestamp);
        self.read_interface_stats(timestamp);
        self.read_filesystem_stats(timestamp);
        self.read_disk_stats(timestamp);
        self.read_protocol_stats(timestamp);
        self.output.flush_chunks()
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

struct FilesystemStats {
    free_bytes: i64,
    total_bytes: i64,
    free_inodes: i64,
    total_inodes: i64,
}

#[allow(unsafe_code)]
fn statvfs(path: &str) -> Option<FilesystemStats> {
    let c_path = CString::new(path).ok()?;
    let mut stats: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stats) };
    if rc != 0 {
        return None;
    }
    let block_size = stats.f_bsize as i64;
    Some(FilesystemStats {
        free_bytes: stats.f_bavail as i64 * block_size,
        total_bytes: stats.f_blocks as i64 * block_size,
        free_inodes: stats.f_favail as i64,
        total_inodes: stats.f_files as i64,
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bucky3_core::pipe::{FanIn, FanInEvent, pipe};

    use super::*;

    // The parsers carry the format knowledge and are tested against
    // fixtures in procfs.rs; here the worker runs against the live /proc
    // of the test machine.
    #[test]
    #[cfg(target_os = "linux")]
    fn collects_from_live_proc() {
        let (tx, rx) = pipe();
        let cfg = LinuxStatsConfig {
            interface_filter: NameFilter::default(),
            disk_filter: NameFilter::default(),
            filesystem_filter: NameFilter::default(),
            add_timestamps: true,
        };
        let mut collector =
            LinuxStatsCollector::new("linuxstats", cfg, SourceOutput::new(vec![tx], Metadata::new(), 300));

        assert!(collector.flush(100.0));

        let mut fan_in = FanIn::new(vec![rx]);
        let mut buckets = std::collections::BTreeSet::new();
        while let FanInEvent::Batch(batch) = fan_in.poll(Duration::from_millis(50)) {
            for sample in batch {
                assert_eq!(sample.timestamp, Some(100.0));
                buckets.insert(sample.bucket);
            }
        }
        assert!(buckets.contains("system_cpu"));
        assert!(buckets.contains("system_memory"));
        assert!(buckets.contains("system_interface"));
    }
}
