//! Protocol adapters.

#[cfg(feature = "http")]
pub mod http;
pub mod kasa;
pub mod modbus;
pub mod optical;
pub mod p1;

use std::sync::Arc;

#[cfg(feature = "http")]
pub use http::HttpAdapter;
pub use kasa::KasaAdapter;
pub use modbus::ModbusAdapter;
pub use optical::OpticalAdapter;
pub use p1::P1Adapter;

use crate::adapter::{AdapterResult, AdapterSet};
use crate::config::{AdaptersConfig, DiscoveryConfig};
use crate::discovery::SubnetScanner;
use crate::transport::SharedSerialOpener;

/// Build the enabled adapters from configuration.
pub fn build_adapters(
    adapters: &AdaptersConfig,
    discovery: &DiscoveryConfig,
    opener: SharedSerialOpener,
) -> AdapterResult<AdapterSet> {
    let scanner = SubnetScanner::new(
        &discovery.subnets,
        discovery.scan_concurrency,
        discovery.probe_timeout(),
    );
    let mut set = AdapterSet::new();

    #[cfg(feature = "http")]
    if adapters.http.enabled {
        set.register(Arc::new(HttpAdapter::new(&adapters.http)?.with_scanner(scanner.clone())));
    }
    #[cfg(not(feature = "http"))]
    if adapters.http.enabled {
        tracing::warn!("HTTP adapter enabled but built without the `http` feature");
    }

    if adapters.kasa.enabled {
        set.register(Arc::new(KasaAdapter::new(&adapters.kasa).with_scanner(scanner)));
    }
    if adapters.modbus.enabled {
        set.register(Arc::new(ModbusAdapter::new(&adapters.modbus, opener.clone())));
    }
    if adapters.optical.enabled {
        set.register(Arc::new(
            OpticalAdapter::new(&adapters.optical, opener.clone()).with_enumeration(discovery.enumerate_serial),
        ));
    }
    if adapters.p1.enabled {
        set.register(Arc::new(
            P1Adapter::new(&adapters.p1, opener).with_enumeration(discovery.enumerate_serial),
        ));
    }

    tracing::info!(
        adapters = ?set.all().iter().map(|a| a.name().to_string()).collect::<Vec<_>>(),
        "Protocol adapters ready"
    );
    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::DuplexOpener;
    use gridmind_core::Protocol;

    #[test]
    fn test_disabled_adapters_skipped() {
        let mut config = AdaptersConfig::default();
        config.kasa.enabled = false;
        config.p1.enabled = false;

        let set = build_adapters(&config, &DiscoveryConfig::default(), Arc::new(DuplexOpener::new())).unwrap();
        assert!(set.for_protocol(Protocol::Kasa).is_none());
        assert!(set.for_protocol(Protocol::DsmrP1).is_none());
        assert!(set.for_protocol(Protocol::ModbusRtu).is_some());
        assert!(set.for_protocol(Protocol::Iec62056).is_some());
    }
}
