//! Device discovery.
//!
//! Network adapters sweep the configured subnets with [`SubnetScanner`];
//! serial adapters probe enumerated ports; Modbus reports its static
//! endpoints. [`discover_all`] runs every adapter concurrently and
//! deduplicates the results by device id.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use tokio::net::TcpStream;

use gridmind_core::DeviceDescriptor;

use crate::adapter::AdapterSet;

/// Largest sweep accepted from a single range entry.
const MAX_RANGE_HOSTS: usize = 65_536;

/// Discovery error.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("Invalid IP range: {0}")]
    InvalidIpRange(String),
}

/// Parse an IP range into host addresses.
///
/// Accepted forms:
/// - `192.168.1.0/24` (CIDR; network and broadcast addresses skipped below /31)
/// - `192.168.1.10-20` or `192.168.1.10-192.168.1.20` (inclusive range)
/// - `192.168.1.7` (single host)
pub fn parse_ip_range(range: &str) -> Result<Vec<IpAddr>, DiscoveryError> {
    let range = range.trim();
    let invalid = || DiscoveryError::InvalidIpRange(range.to_string());

    if let Some((base, prefix)) = range.split_once('/') {
        let base: Ipv4Addr = base.parse().map_err(|_| invalid())?;
        let prefix: u32 = prefix.parse().map_err(|_| invalid())?;
        if prefix > 32 {
            return Err(invalid());
        }
        let size = 1u64 << (32 - prefix);
        if size as usize > MAX_RANGE_HOSTS {
            return Err(invalid());
        }
        let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
        let network = u32::from(base) & mask;
        let (first, last) = if prefix >= 31 {
            (0, size - 1)
        } else {
            (1, size - 2)
        };
        return Ok((first..=last)
            .map(|i| IpAddr::V4(Ipv4Addr::from(network + i as u32)))
            .collect());
    }

    if let Some((start, end)) = range.split_once('-') {
        let start: Ipv4Addr = start.trim().parse().map_err(|_| invalid())?;
        let end: Ipv4Addr = match end.trim().parse::<Ipv4Addr>() {
            Ok(full) => full,
            Err(_) => {
                let last: u8 = end.trim().parse().map_err(|_| invalid())?;
                let o = start.octets();
                Ipv4Addr::new(o[0], o[1], o[2], last)
            }
        };
        let (a, b) = (u32::from(start), u32::from(end));
        if b < a || (b - a) as usize >= MAX_RANGE_HOSTS {
            return Err(invalid());
        }
        return Ok((a..=b).map(|ip| IpAddr::V4(Ipv4Addr::from(ip))).collect());
    }

    let addr: IpAddr = range.parse().map_err(|_| invalid())?;
    Ok(vec![addr])
}

/// TCP connect sweep over a set of hosts.
#[derive(Debug, Clone)]
pub struct SubnetScanner {
    hosts: Vec<IpAddr>,
    concurrency: usize,
    probe_timeout: Duration,
}

impl SubnetScanner {
    /// Build a scanner from range strings; invalid entries are logged and skipped.
    pub fn new(ranges: &[String], concurrency: usize, probe_timeout: Duration) -> Self {
        let mut hosts = Vec::new();
        for range in ranges {
            match parse_ip_range(range) {
                Ok(mut parsed) => hosts.append(&mut parsed),
                Err(e) => tracing::warn!(category = "discovery", error = %e, "Skipping subnet"),
            }
        }
        hosts.sort();
        hosts.dedup();
        Self {
            hosts,
            concurrency: concurrency.max(1),
            probe_timeout,
        }
    }

    pub fn hosts(&self) -> &[IpAddr] {
        &self.hosts
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// Hosts accepting TCP connections on `port`.
    pub async fn scan_port(&self, port: u16) -> Vec<IpAddr> {
        let timeout = self.probe_timeout;
        let open = stream::iter(self.hosts.clone())
            .map(|addr| async move {
                let socket_addr = SocketAddr::new(addr, port);
                match tokio::time::timeout(timeout, TcpStream::connect(socket_addr)).await {
                    Ok(Ok(_)) => Some(addr),
                    _ => None,
                }
            })
            .buffer_unordered(self.concurrency)
            .collect::<Vec<_>>()
            .await;

        let mut hosts: Vec<IpAddr> = open.into_iter().flatten().collect();
        hosts.sort();
        hosts
    }
}

/// Outcome of one discovery pass.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryReport {
    /// Unique devices found, in id order
    pub devices: Vec<DeviceDescriptor>,
    /// Adapter failures (non-fatal)
    pub errors: Vec<String>,
    pub duration: Duration,
}

/// Run every adapter's discovery concurrently and merge the results.
///
/// When two adapters report the same id, the first adapter registered wins.
pub async fn discover_all(adapters: &AdapterSet) -> DiscoveryReport {
    let started = Instant::now();
    let results = futures::future::join_all(adapters.all().iter().map(|adapter| async move {
        (adapter.name().to_string(), adapter.discover().await)
    }))
    .await;

    let mut seen: HashMap<String, DeviceDescriptor> = HashMap::new();
    let mut errors = Vec::new();
    for (name, result) in results {
        match result {
            Ok(found) => {
                tracing::debug!(category = "discovery", adapter = %name, count = found.len(), "Adapter discovery finished");
                for descriptor in found {
                    seen.entry(descriptor.id.clone()).or_insert(descriptor);
                }
            }
            Err(e) => {
                tracing::warn!(category = "discovery", adapter = %name, error = %e, "Adapter discovery failed");
                errors.push(format!("{}: {}", name, e));
            }
        }
    }

    let mut devices: Vec<DeviceDescriptor> = seen.into_values().collect();
    devices.sort_by(|a, b| a.id.cmp(&b.id));
    DiscoveryReport {
        devices,
        errors,
        duration: started.elapsed(),
    }
}

/// Normalize a hardware address into an id fragment: `AA:BB:CC:DD:EE:FF` → `aabbccddeeff`.
pub fn mac_fragment(mac: &str) -> String {
    mac.chars()
        .filter(|c| c.is_ascii_hexdigit())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}
