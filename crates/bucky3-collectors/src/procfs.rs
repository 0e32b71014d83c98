//! Parsers for the /proc text formats shared by the Linux and Docker
//! collectors. Pure functions over file contents so they can be exercised
//! against captured fixtures.

use std::collections::BTreeMap;

use bucky3_core::sample::Scalar;

pub const CPU_FIELDS: [&str; 8] = [
    "user",
    "nice",
    "system",
    "idle",
    "wait",
    "interrupt",
    "softirq",
    "steal",
];

// See Documentation/admin-guide/iostats.rst
pub const DISK_FIELDS: [&str; 11] = [
    "read_ops",
    "read_merged",
    "read_sectors",
    "read_time",
    "write_ops",
    "write_merged",
    "write_sectors",
    "write_time",
    "in_progress",
    "io_time",
    "weighted_time",
];

const INTERFACE_FIELDS: [Option<&str>; 12] = [
    Some("rx_bytes"),
    Some("rx_packets"),
    Some("rx_errors"),
    Some("rx_dropped"),
    None,
    None,
    None,
    None,
    Some("tx_bytes"),
    Some("tx_packets"),
    Some("tx_errors"),
    Some("tx_dropped"),
];

const MEMORY_FIELDS: [(&str, &str); 10] = [
    ("MemTotal:", "total_bytes"),
    ("MemFree:", "free_bytes"),
    ("MemAvailable:", "available_bytes"),
    ("Shmem:", "shared_bytes"),
    ("Cached:", "cached_bytes"),
    ("Slab:", "slab_bytes"),
    ("Mapped:", "mapped_bytes"),
    ("SwapTotal:", "swap_total_bytes"),
    ("SwapFree:", "swap_free_bytes"),
    ("SwapCached:", "swap_cached_bytes"),
];

pub type Fields = BTreeMap<String, Scalar>;

fn fields<'a, I>(entries: I) -> Fields
where
    I: IntoIterator<Item = (&'a str, i64)>,
{
    entries
        .into_iter()
        .map(|(k, v)| (k.to_string(), Scalar::Int(v)))
        .collect()
}

/// Per-cpu counters and the global activity numbers from `/proc/stat`.
pub struct ActivityStats {
    /// `(cpu_name, counters)` for each `cpuN` line.
    pub cpus: Vec<(String, Fields)>,
    /// switches/forks/running/interrupts.
    pub activity: Fields,
}

pub fn parse_stat(content: &str) -> ActivityStats {
    let mut cpus = Vec::new();
    let mut activity = Fields::new();

    for line in content.lines() {
        let mut tokens = line.split_whitespace();
        let Some(name) = tokens.next() else { continue };

        if let Some(rest) = name.strip_prefix("cpu") {
            // The aggregate "cpu" line is skipped, per-cpu lines kept.
            if rest.is_empty() {
                continue;
            }
            let counters = fields(
                CPU_FIELDS
                    .iter()
                    .zip(tokens.filter_map(|t| t.parse::<i64>().ok()))
                    .map(|(k, v)| (*k, v)),
            );
            cpus.push((name.to_string(), counters));
        } else if let Some(value) = tokens.next().and_then(|t| t.parse::<i64>().ok()) {
            match name {
                "ctxt" => activity.insert("switches".to_string(), Scalar::Int(value)),
                "processes" => activity.insert("forks".to_string(), Scalar::Int(value)),
                "procs_running" => activity.insert("running".to_string(), Scalar::Int(value)),
                "intr" => activity.insert("interrupts".to_string(), Scalar::Int(value)),
                _ => None,
            };
        }
    }

    ActivityStats { cpus, activity }
}

/// The 1-minute load average from `/proc/loadavg`.
pub fn parse_loadavg(content: &str) -> Option<f64> {
    let tokens: Vec<&str> = content.split_whitespace().collect();
    if tokens.len() == 5 {
        tokens[0].parse().ok()
    } else {
        None
    }
}

/// Selected fields of `/proc/meminfo`, converted from kB to bytes.
pub fn parse_meminfo(content: &str) -> Fields {
    let mut memory = Fields::new();
    for line in content.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() != 3 || !tokens[2].eq_ignore_ascii_case("kb") {
            continue;
        }
        if let Some((_, name)) = MEMORY_FIELDS.iter().find(|(k, _)| *k == tokens[0]) {
            if let Ok(value) = tokens[1].parse::<i64>() {
                memory.insert(name.to_string(), Scalar::Int(value * 1024));
            }
        }
    }
    memory
}

/// Per-interface counters from `/proc/net/dev`.
pub fn parse_net_dev(content: &str) -> Vec<(String, Fields)> {
    let mut interfaces = Vec::new();
    for line in content.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() != 17 || !tokens[0].ends_with(':') {
            continue;
        }
        let name = tokens[0].trim_end_matches(':').to_string();
        let counters = fields(
            INTERFACE_FIELDS
                .iter()
                .zip(&tokens[1..])
                .filter_map(|(field, token)| {
                    field.and_then(|f| token.parse::<i64>().ok().map(|v| (f, v)))
                }),
        );
        interfaces.push((name, counters));
    }
    interfaces
}

/// Per-disk counters from `/proc/diskstats`; sectors are also exposed as
/// bytes (512-byte sectors).
pub fn parse_diskstats(content: &str) -> Vec<(String, Fields)> {
    let mut disks = Vec::new();
    for line in content.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() < 14 {
            continue;
        }
        let name = tokens[2].to_string();
        let mut counters = fields(
            DISK_FIELDS
                .iter()
                .zip(&tokens[3..])
                .filter_map(|(field, token)| token.parse::<i64>().ok().map(|v| (*field, v))),
        );
        if let Some(Scalar::Int(sectors)) = counters.get("read_sectors") {
            counters.insert("read_bytes".to_string(), Scalar::Int(sectors * 512));
        }
        if let Some(Scalar::Int(sectors)) = counters.get("write_sectors") {
            counters.insert("write_bytes".to_string(), Scalar::Int(sectors * 512));
        }
        disks.push((name, counters));
    }
    disks
}

const PROTOCOL_FIELDS: [(&str, (&str, &str)); 30] = [
    ("Ip:InReceives", ("ip", "rx_packets")),
    ("Ip:InDiscards", ("ip", "rx_dropped")),
    ("IpExt:InOctets", ("ip", "rx_bytes")),
    ("Ip:OutRequests", ("ip", "tx_packets")),
    ("Ip:OutDiscards", ("ip", "tx_dropped")),
    ("IpExt:OutOctets", ("ip", "tx_bytes")),
    ("Icmp:InMsgs", ("icmp", "rx_packets")),
    ("Icmp:InErrors", ("icmp", "rx_errors")),
    ("Icmp:OutMsgs", ("icmp", "tx_packets")),
    ("Icmp:OutErrors", ("icmp", "tx_errors")),
    ("Udp:InDatagrams", ("udp", "rx_packets")),
    ("Udp:InErrors", ("udp", "rx_errors")),
    ("Udp:OutDatagrams", ("udp", "tx_packets")),
    ("Udp:RcvbufErrors", ("udp", "rcvbuf_errors")),
    ("Udp:SndbufErrors", ("udp", "sndbuf_errors")),
    ("Tcp:OutSegs", ("tcp", "tx_packets")),
    ("Tcp:InSegs", ("tcp", "rx_packets")),
    ("Tcp:RetransSegs", ("tcp", "retr_packets")),
    ("Tcp:ActiveOpens", ("tcp", "tx_opens")),
    ("Tcp:PassiveOpens", ("tcp", "rx_opens")),
    ("Tcp:EstabResets", ("tcp", "conn_resets")),
    ("Tcp:CurrEstab", ("tcp", "conn_count")),
    ("Tcp:OutRsts", ("tcp", "rx_resets")),
    ("TcpExt:ListenOverflows", ("tcp", "listen_overflows")),
    ("TcpExt:ListenDrops", ("tcp", "listen_drops")),
    ("TcpExt:TCPTimeouts", ("tcp", "timeouts")),
    ("TcpExt:TCPBacklogDrop", ("tcp", "backlog_drops")),
    ("TcpExt:TCPKeepAlive", ("tcp", "keep_alives")),
    ("TcpExt:SyncookiesRecv", ("tcp", "rx_syncookies")),
    ("TcpExt:SyncookiesSent", ("tcp", "tx_syncookies")),
];

/// Selected protocol counters from the header/value line pairs of
/// `/proc/net/snmp` and `/proc/net/netstat`, grouped per protocol.
pub fn parse_protocols<'a, I>(contents: I) -> BTreeMap<String, Fields>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut headers: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut protocols: BTreeMap<String, Fields> = BTreeMap::new();

    for content in contents {
        for line in content.lines() {
            let mut tokens = line.split_whitespace();
            let Some(name) = tokens.next() else { continue };
            let tokens: Vec<&str> = tokens.collect();

            match headers.get(name) {
                None => {
                    headers.insert(
                        name.to_string(),
                        tokens.iter().map(|t| t.to_string()).collect(),
                    );
                }
                Some(columns) => {
                    for (column, token) in columns.iter().zip(&tokens) {
                        let key = format!("{name}{column}");
                        let Some((_, (protocol, field))) =
                            PROTOCOL_FIELDS.iter().find(|(k, _)| *k == key)
                        else {
                            continue;
                        };
                        if let Ok(value) = token.parse::<i64>() {
                            protocols
                                .entry(protocol.to_string())
                                .or_default()
                                .insert(field.to_string(), Scalar::Int(value));
                        }
                    }
                }
            }
        }
    }
    protocols
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stat_parses_cpus_and_activity() {
        let content = "\
cpu  100 200 300 400 500 600 700 800 0 0
cpu0 10 20 30 40 50 60 70 80 0 0
cpu1 11 21 31 41 51 61 71 81 0 0
intr 12345 1 2 3
ctxt 999
btime 1500000000
processes 4242
procs_running 3
procs_blocked 0
";
        let stats = parse_stat(content);
        assert_eq!(stats.cpus.len(), 2);

        let (name, counters) = &stats.cpus[0];
        assert_eq!(name, "cpu0");
        assert_eq!(counters.get("user"), Some(&Scalar::Int(10)));
        assert_eq!(counters.get("steal"), Some(&Scalar::Int(80)));

        assert_eq!(stats.activity.get("switches"), Some(&Scalar::Int(999)));
        assert_eq!(stats.activity.get("forks"), Some(&Scalar::Int(4242)));
        assert_eq!(stats.activity.get("running"), Some(&Scalar::Int(3)));
        assert_eq!(stats.activity.get("interrupts"), Some(&Scalar::Int(12345)));
    }

    #[test]
    fn loadavg_first_field() {
        assert_eq!(parse_loadavg("0.25 0.50 0.75 2/345 6789\n"), Some(0.25));
        assert_eq!(parse_loadavg("garbage"), None);
    }

    #[test]
    fn meminfo_selected_fields_in_bytes() {
        let content = "\
MemTotal:       16384000 kB
MemFree:         8192000 kB
HugePages_Total:       0
Dirty:               100 kB
SwapFree:        1024000 kB
";
        let memory = parse_meminfo(content);
        assert_eq!(
            memory.get("total_bytes"),
            Some(&Scalar::Int(16384000 * 1024))
        );
        assert_eq!(memory.get("free_bytes"), Some(&Scalar::Int(8192000 * 1024)));
        assert_eq!(
            memory.get("swap_free_bytes"),
            Some(&Scalar::Int(1024000 * 1024))
        );
        assert!(!memory.contains_key("Dirty:"));
        assert_eq!(memory.len(), 3);
    }

    #[test]
    fn net_dev_skips_headers() {
        let content = "\
Inter-|   Receive                                                |  Transmit
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed
    lo: 1000     10    0    0    0     0          0         0     1000     10    0    0    0     0       0          0
  eth0: 5000     50    1    2    0     0          0         0     7000     70    3    4    0     0       0          0
";
        let interfaces = parse_net_dev(content);
        assert_eq!(interfaces.len(), 2);

        let (name, counters) = &interfaces[1];
        assert_eq!(name, "eth0");
        assert_eq!(counters.get("rx_bytes"), Some(&Scalar::Int(5000)));
        assert_eq!(counters.get("rx_errors"), Some(&Scalar::Int(1)));
        assert_eq!(counters.get("rx_dropped"), Some(&Scalar::Int(2)));
        assert_eq!(counters.get("tx_bytes"), Some(&Scalar::Int(7000)));
        assert_eq!(counters.get("tx_dropped"), Some(&Scalar::Int(4)));
        assert_eq!(counters.len(), 8);
    }

    #[test]
    fn diskstats_with_byte_derivation() {
        let content = "\
   8       0 sda 100 5 2048 300 200 10 4096 400 0 500 600
 253       0 dm-0 1 0 8 1 1 0 8 1 0 1 1 0 0 0 0 0 0
";
        let disks = parse_diskstats(content);
        assert_eq!(disks.len(), 2);

        let (name, counters) = &disks[0];
        assert_eq!(name, "sda");
        assert_eq!(counters.get("read_ops"), Some(&Scalar::Int(100)));
        assert_eq!(counters.get("read_bytes"), Some(&Scalar::Int(2048 * 512)));
        assert_eq!(counters.get("write_bytes"), Some(&Scalar::Int(4096 * 512)));
        assert_eq!(counters.get("weighted_time"), Some(&Scalar::Int(600)));
    }

    #[test]
    fn protocol_counters_across_files() {
        let snmp = "\
Ip: Forwarding DefaultTTL InReceives InDiscards OutRequests OutDiscards
Ip: 1 64 1000 5 900 2
Tcp: ActiveOpens PassiveOpens EstabResets CurrEstab InSegs OutSegs RetransSegs
Tcp: 10 20 3 42 5000 4000 7
";
        let netstat = "\
TcpExt: ListenOverflows ListenDrops TCPTimeouts
TcpExt: 1 2 33
IpExt: InOctets OutOctets
IpExt: 123456 654321
";
        let protocols = parse_protocols([snmp, netstat]);

        let ip = protocols.get("ip").unwrap();
        assert_eq!(ip.get("rx_packets"), Some(&Scalar::Int(1000)));
        assert_eq!(ip.get("rx_dropped"), Some(&Scalar::Int(5)));
        assert_eq!(ip.get("rx_bytes"), Some(&Scalar::Int(123456)));
        assert_eq!(ip.get("tx_bytes"), Some(&Scalar::Int(654321)));

        let tcp = protocols.get("tcp").unwrap();
        assert_eq!(tcp.get("conn_count"), Some(&Scalar::Int(42)));
        assert_eq!(tcp.get("timeouts"), Some(&Scalar::Int(33)));
        assert_eq!(tcp.get("retr_packets"), Some(&Scalar::Int(7)));
    }
}
