//! systemd journal log collector.
//!
//! Follows the local journal and turns entries into `logs` samples. Only
//! built with the `journal` cargo feature, which links against libsystemd.

use std::collections::BTreeMap;
use std::sync::atomic::Ordering::Relaxed;
use std::time::Duration;

use bucky3_core::clock::ClockSource;
use bucky3_core::sample::{Metadata, Sample, Scalar, Timestamp, Values};
use bucky3_core::selfreport::{WorkerHealth, self_report_sample};
use bucky3_core::worker::{PollOutcome, SourceOutput, Worker};
use systemd::journal::{Journal, JournalRecord, JournalSeek, OpenOptions};
use tracing::warn;

/// Bucket journal events land in.
const LOGS_BUCKET: &str = "logs";

const DEFAULT_EVENT_MAP: [(&str, &str); 10] = [
    ("MESSAGE", "message"),
    ("SYSLOG_IDENTIFIER", "identifier"),
    ("_EXE", "command"),
    ("_HOSTNAME", "host"),
    ("_MACHINE_ID", "machine_id"),
    ("_BOOT_ID", "boot_id"),
    ("_PID", "pid"),
    ("_UID", "uid"),
    ("_GID", "gid"),
    ("_SYSTEMD_UNIT", "systemd_unit"),
];

#[derive(Clone)]
pub struct JournalConfig {
    /// Journal field → emitted field. Defaults mirror the common syslog
    /// vocabulary.
    pub event_map: Option<BTreeMap<String, String>>,
    /// How far back to start reading on startup, seconds.
    pub timestamp_window: f64,
}

pub struct JournalCollector {
    name: String,
    event_map: BTreeMap<String, String>,
    journal: Journal,
    clock: ClockSource,
    output: SourceOutput,
}

impl JournalCollector {
    pub fn new(
        name: &str,
        cfg: JournalConfig,
        clock: ClockSource,
        output: SourceOutput,
    ) -> Result<Self, systemd::Error> {
        let mut journal = OpenOptions::default().local_only(true).open()?;
        let start = clock.epoch_timestamp() - cfg.timestamp_window;
        journal.seek(JournalSeek::ClockRealtime {
            usec: (start.max(0.0) * 1e6) as u64,
        })?;

        let event_map = cfg.event_map.unwrap_or_else(|| {
            DEFAULT_EVENT_MAP
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect()
        });

        Ok(Self {
            name: name.to_string(),
            event_map,
            journal,
            clock,
            output,
        })
    }

    fn handle_event(&self, event: &JournalRecord) {
        let mut fields = BTreeMap::new();
        for (journal_field, emitted_field) in &self.event_map {
            if let Some(value) = event.get(journal_field) {
                fields.insert(emitted_field.clone(), Scalar::Str(value.clone()));
            }
        }

        if let Some(facility) = event.get("SYSLOG_FACILITY") {
            fields.insert(
                "facility".to_string(),
                Scalar::Str(facility_label(facility).to_string()),
            );
        }
        if let Some(priority) = event.get("PRIORITY") {
            fields.insert(
                "severity".to_string(),
                Scalar::Str(severity_label(priority).to_string()),
            );
        }

        let timestamp = event
            .get("_SOURCE_REALTIME_TIMESTAMP")
            .or_else(|| event.get("__REALTIME_TIMESTAMP"))
            .and_then(|usec| usec.parse::<f64>().ok())
            .map(|usec| usec / 1e6)
            .unwrap_or_else(|| self.clock.epoch_timestamp());

        self.output.buffer_metric(
            LOGS_BUCKET,
            Values::Map(fields),
            Some(timestamp),
            Metadata::new(),
        );
    }
}

impl Worker for JournalCollector {
    fn flush(&mut self, _timestamp: Timestamp) -> bool {
        self.output.flush_chunks()
    }

    fn poll(&mut self, wait: Duration) -> PollOutcome {
        match self.journal.await_next_entry(Some(wait)) {
            Ok(Some(event)) => {
                self.handle_event(&event);
                // Drain whatever else is already in the journal.
                while let Ok(Some(event)) = self.journal.next_entry() {
                    self.handle_event(&event);
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!("journal read failed: {e}");
                return PollOutcome::Exit;
            }
        }
        PollOutcome::Continue
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

/// Syslog facility number → label, the unknowns mapping to "user".
fn facility_label(facility: &str) -> &'static str {
    match facility {
        "0" => "kernel",
        "2" | "7" => "mail",
        "3" | "6" | "9" => "daemon",
        "4" | "10" => "auth",
        "5" => "syslog",
        _ => "user",
    }
}

/// Syslog priority number → label, the unknowns mapping to "info".
fn severity_label(priority: &str) -> &'static str {
    match priority {
        "0" | "1" | "2" => "critical",
        "3" => "error",
        "4" => "warning",
        "7" => "debug",
        _ => "info",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn facility_and_severity_labels() {
        assert_eq!(facility_label("0"), "kernel");
        assert_eq!(facility_label("4"), "auth");
        assert_eq!(facility_label("10"), "auth");
        assert_eq!(facility_label("1"), "user");
        assert_eq!(facility_label("23"), "user");

        assert_eq!(severity_label("0"), "critical");
        assert_eq!(severity_label("2"), "critical");
        assert_eq!(severity_label("3"), "error");
        assert_eq!(severity_label("4"), "warning");
        assert_eq!(severity_label("5"), "info");
        assert_eq!(severity_label("6"), "info");
        assert_eq!(severity_label("7"), "debug");
    }
}
