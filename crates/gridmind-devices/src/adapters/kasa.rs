//! Kasa smart plug adapter (TCP 9999, XOR stream cipher).

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;

use gridmind_core::{
    Capability, Device, DeviceCommand, DeviceDescriptor, DeviceType, Protocol, Reading,
    TransportAddress,
};

use crate::adapter::{with_timeout, AdapterError, AdapterResult, DeviceAdapter};
use crate::config::KasaAdapterConfig;
use crate::discovery::{mac_fragment, SubnetScanner};
use crate::protocol::xor_cipher;

const IDENTIFY_CONCURRENCY: usize = 16;

/// Adapter for TP-Link Kasa plugs and dimmers.
pub struct KasaAdapter {
    port: u16,
    timeout: Duration,
    scanner: Option<SubnetScanner>,
}

impl KasaAdapter {
    pub fn new(config: &KasaAdapterConfig) -> Self {
        Self {
            port: config.port,
            timeout: Duration::from_millis(config.timeout_ms),
            scanner: None,
        }
    }

    pub fn with_scanner(mut self, scanner: SubnetScanner) -> Self {
        self.scanner = Some(scanner);
        self
    }

    /// One request/response exchange on a fresh connection.
    async fn exchange(&self, target: &str, request: &Value) -> AdapterResult<Value> {
        with_timeout(self.timeout, async {
            let mut stream = TcpStream::connect(target)
                .await
                .map_err(|e| AdapterError::Transport(format!("{}: {}", target, e)))?;
            xor_cipher::write_message(&mut stream, request.to_string().as_bytes()).await?;
            let reply = xor_cipher::read_message(&mut stream).await?;
            Ok(serde_json::from_slice::<Value>(&reply)?)
        })
        .await
    }

    fn target(device: &Device) -> AdapterResult<String> {
        match &device.address {
            TransportAddress::Tcp { .. } => device
                .address
                .socket_target()
                .ok_or_else(|| AdapterError::Configuration("missing socket target".into())),
            other => Err(AdapterError::Configuration(format!(
                "{} is not a TCP address",
                other
            ))),
        }
    }

    async fn sysinfo(&self, target: &str) -> AdapterResult<Value> {
        let reply = self
            .exchange(target, &json!({"system": {"get_sysinfo": {}}}))
            .await?;
        let info = reply
            .pointer("/system/get_sysinfo")
            .cloned()
            .ok_or_else(|| AdapterError::protocol("reply lacks system.get_sysinfo"))?;
        check_err_code(&info)?;
        Ok(info)
    }

    async fn identify(&self, host: IpAddr) -> Option<DeviceDescriptor> {
        let target = format!("{}:{}", host, self.port);
        match self.sysinfo(&target).await {
            Ok(info) => sysinfo_descriptor(
                &info,
                TransportAddress::Tcp {
                    host: host.to_string(),
                    port: self.port,
                },
            ),
            Err(e) => {
                tracing::debug!(category = "discovery", host = %host, error = %e, "Not a Kasa device");
                None
            }
        }
    }
}

/// Devices answer `err_code != 0` for unsupported modules or bad arguments.
fn check_err_code(section: &Value) -> AdapterResult<()> {
    match section.get("err_code").and_then(Value::as_i64) {
        Some(0) | None => Ok(()),
        Some(code) => {
            let msg = section
                .get("err_msg")
                .and_then(Value::as_str)
                .unwrap_or("device error");
            Err(AdapterError::Protocol(format!("err_code {}: {}", code, msg)))
        }
    }
}

/// Parse an `emeter.get_realtime` section in either firmware shape.
pub fn parse_realtime(device_id: &str, realtime: &Value) -> AdapterResult<Reading> {
    check_err_code(realtime)?;
    let field = |key: &str| realtime.get(key).and_then(Value::as_f64);

    // Hardware v2+: milli-units and watt-hours
    if let Some(mw) = field("power_mw") {
        let mut reading = Reading::new(device_id, Utc::now(), mw / 1000.0);
        if let Some(mv) = field("voltage_mv") {
            reading = reading.with_voltage(mv / 1000.0);
        }
        if let Some(ma) = field("current_ma") {
            reading = reading.with_current(ma / 1000.0);
        }
        if let Some(wh) = field("total_wh") {
            reading = reading.with_energy(wh / 1000.0);
        }
        return Ok(reading);
    }

    // Hardware v1: base units and kWh
    let power = field("power").ok_or_else(|| AdapterError::protocol("realtime has no power field"))?;
    let mut reading = Reading::new(device_id, Utc::now(), power);
    if let Some(v) = field("voltage") {
        reading = reading.with_voltage(v);
    }
    if let Some(a) = field("current") {
        reading = reading.with_current(a);
    }
    if let Some(kwh) = field("total") {
        reading = reading.with_energy(kwh);
    }
    Ok(reading)
}

/// Build a descriptor from `system.get_sysinfo`.
pub fn sysinfo_descriptor(info: &Value, address: TransportAddress) -> Option<DeviceDescriptor> {
    let mac = info
        .get("mac")
        .or_else(|| info.get("mic_mac"))
        .and_then(Value::as_str)
        .map(mac_fragment)
        .filter(|m| !m.is_empty());
    let key = match mac {
        Some(mac) => mac,
        None => info.get("deviceId").and_then(Value::as_str)?.to_ascii_lowercase(),
    };

    let dimmable = info.get("brightness").is_some();
    let model = info.get("model").and_then(Value::as_str);
    let bulb = model.map(|m| m.starts_with("KL") || m.starts_with("LB")).unwrap_or(false);
    let device_type = if dimmable || bulb {
        DeviceType::Lighting
    } else {
        DeviceType::SmartPlug
    };

    let mut descriptor = DeviceDescriptor::new(format!("kasa-{}", key), device_type, Protocol::Kasa, address)
        .with_capability(Capability::Switch)
        .with_manufacturer("tp-link");
    if dimmable {
        descriptor = descriptor.with_capability(Capability::Dimmer);
    }
    if let Some(alias) = info.get("alias").and_then(Value::as_str) {
        descriptor = descriptor.with_name(alias);
    }
    if let Some(model) = model {
        descriptor = descriptor.with_model(model);
    }
    if let Some(fw) = info.get("sw_ver").and_then(Value::as_str) {
        descriptor = descriptor.with_firmware(fw);
    }
    Some(descriptor)
}

#[async_trait]
impl DeviceAdapter for KasaAdapter {
    fn name(&self) -> &str {
        "kasa"
    }

    fn protocols(&self) -> &[Protocol] {
        &[Protocol::Kasa]
    }

    async fn discover(&self) -> AdapterResult<Vec<DeviceDescriptor>> {
        let scanner = match &self.scanner {
            Some(scanner) if !scanner.is_empty() => scanner,
            _ => return Ok(Vec::new()),
        };
        let hosts = scanner.scan_port(self.port).await;
        let found = stream::iter(hosts)
            .map(|host| self.identify(host))
            .buffer_unordered(IDENTIFY_CONCURRENCY)
            .collect::<Vec<_>>()
            .await;
        Ok(found.into_iter().flatten().collect())
    }

    async fn read_telemetry(&self, device: &Device) -> AdapterResult<Reading> {
        let target = Self::target(device)?;
        let reply = self
            .exchange(&target, &json!({"emeter": {"get_realtime": {}}}))
            .await?;
        let emeter = reply
            .get("emeter")
            .ok_or_else(|| AdapterError::protocol("reply lacks emeter"))?;
        // Plugs without metering answer {"emeter":{"err_code":-1,...}}
        check_err_code(emeter)?;
        let realtime = emeter
            .get("get_realtime")
            .ok_or_else(|| AdapterError::protocol("reply lacks emeter.get_realtime"))?;
        parse_realtime(&device.id, realtime)
    }

    async fn send_command(&self, device: &Device, command: &DeviceCommand) -> AdapterResult<()> {
        let target = Self::target(device)?;
        let (request, pointer) = match command {
            DeviceCommand::TurnOn | DeviceCommand::TurnOff | DeviceCommand::Toggle => {
                let on = match command {
                    DeviceCommand::TurnOn => true,
                    DeviceCommand::TurnOff => false,
                    _ => {
                        let info = self.sysinfo(&target).await?;
                        info.get("relay_state").and_then(Value::as_i64) != Some(1)
                    }
                };
                (
                    json!({"system": {"set_relay_state": {"state": on as u8}}}),
                    "/system/set_relay_state",
                )
            }
            DeviceCommand::SetBrightness { level } => (
                json!({"smartlife.iot.dimmer": {"set_brightness": {"brightness": level}}}),
                "/smartlife.iot.dimmer/set_brightness",
            ),
            other => {
                return Err(AdapterError::CommandRejected(format!(
                    "Kasa does not support {}",
                    other.action_name()
                )))
            }
        };

        let reply = self.exchange(&target, &request).await?;
        let section = reply
            .pointer(pointer)
            .ok_or_else(|| AdapterError::Protocol(format!("reply lacks {}", pointer)))?;
        check_err_code(section).map_err(|e| AdapterError::CommandRejected(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::net::TcpListener;

    /// Fake plug answering each connection from a handler.
    async fn fake_plug<F>(handler: F) -> (u16, Arc<Mutex<Vec<Value>>>)
    where
        F: Fn(&Value) -> Value + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        tokio::spawn(async move {
            loop {
                let (mut socket, _) = listener.accept().await.unwrap();
                let request = xor_cipher::read_message(&mut socket).await.unwrap();
                let request: Value = serde_json::from_slice(&request).unwrap();
                let reply = handler(&request);
                log.lock().unwrap().push(request);
                xor_cipher::write_message(&mut socket, reply.to_string().as_bytes())
                    .await
                    .unwrap();
            }
        });
        (port, seen)
    }

    fn plug(port: u16) -> Device {
        Device::from_descriptor(DeviceDescriptor::new(
            "kasa-1",
            DeviceType::SmartPlug,
            Protocol::Kasa,
            TransportAddress::Tcp {
                host: "127.0.0.1".into(),
                port,
            },
        ))
    }

    fn adapter(port: u16) -> KasaAdapter {
        KasaAdapter::new(&KasaAdapterConfig {
            port,
            timeout_ms: 1000,
            ..Default::default()
        })
    }

    #[test]
    fn test_parse_realtime_both_shapes() {
        let v2 = json!({"power_mw": 1_250_500, "voltage_mv": 230_100, "current_ma": 5_430, "total_wh": 1520, "err_code": 0});
        let reading = parse_realtime("k", &v2).unwrap();
        assert!((reading.power_w - 1250.5).abs() < 1e-9);
        assert_eq!(reading.energy_kwh, 1.52);

        let v1 = json!({"power": 12.3, "voltage": 229.9, "current": 0.06, "total": 0.4, "err_code": 0});
        let reading = parse_realtime("k", &v1).unwrap();
        assert_eq!(reading.power_w, 12.3);
        assert_eq!(reading.energy_kwh, 0.4);

        let unsupported = json!({"err_code": -1, "err_msg": "module not support"});
        assert!(matches!(parse_realtime("k", &unsupported), Err(AdapterError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_read_telemetry_over_cipher() {
        let (port, _) = fake_plug(|_| {
            json!({"emeter": {"get_realtime": {"power_mw": 60000, "voltage_mv": 231000, "err_code": 0}}})
        })
        .await;

        let reading = adapter(port).read_telemetry(&plug(port)).await.unwrap();
        assert_eq!(reading.power_w, 60.0);
        assert_eq!(reading.voltage_v, 231.0);
    }

    #[tokio::test]
    async fn test_toggle_reads_relay_state_first() {
        let (port, seen) = fake_plug(|req| {
            if req.pointer("/system/get_sysinfo").is_some() {
                json!({"system": {"get_sysinfo": {"relay_state": 1, "err_code": 0}}})
            } else {
                json!({"system": {"set_relay_state": {"err_code": 0}}})
            }
        })
        .await;

        adapter(port).send_command(&plug(port), &DeviceCommand::Toggle).await.unwrap();
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1], json!({"system": {"set_relay_state": {"state": 0}}}));
    }

    #[tokio::test]
    async fn test_device_error_rejects_command() {
        let (port, _) = fake_plug(|_| {
            json!({"smartlife.iot.dimmer": {"set_brightness": {"err_code": -2, "err_msg": "member not support"}}})
        })
        .await;

        let err = adapter(port)
            .send_command(&plug(port), &DeviceCommand::SetBrightness { level: 30 })
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::CommandRejected(_)));
    }

    #[test]
    fn test_sysinfo_descriptor() {
        let info = json!({
            "alias": "Kettle", "model": "HS110(EU)", "sw_ver": "1.5.4",
            "mac": "50:C7:BF:01:02:03", "deviceId": "8006ABC", "relay_state": 0
        });
        let address = TransportAddress::Tcp {
            host: "10.0.0.5".into(),
            port: 9999,
        };
        let descriptor = sysinfo_descriptor(&info, address).unwrap();
        assert_eq!(descriptor.id, "kasa-50c7bf010203");
        assert_eq!(descriptor.name, "Kettle");
        assert_eq!(descriptor.device_type, DeviceType::SmartPlug);
        assert!(descriptor.capabilities.contains(&Capability::Switch));
    }
}
