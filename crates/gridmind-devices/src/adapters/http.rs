//! HTTP/JSON adapter for Tasmota and Shelly (gen1) firmware.
//!
//! Both dialects are plain GET requests with the command in the query string.
//!
//! | | Tasmota | Shelly |
//! |---|---|---|
//! | telemetry | `/cm?cmnd=Status 8` | `/status` |
//! | identity | `/cm?cmnd=Status 0` | `/shelly` |
//! | relay | `/cm?cmnd=Power On` | `/relay/0?turn=on` |
//! | dimmer | `/cm?cmnd=Dimmer 40` | `/light/0?brightness=40` |

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use reqwest::Client;
use serde_json::Value;

use gridmind_core::{
    Capability, Device, DeviceCommand, DeviceDescriptor, DeviceType, Protocol, Reading,
    TransportAddress,
};

use crate::adapter::{AdapterError, AdapterResult, DeviceAdapter};
use crate::config::HttpAdapterConfig;
use crate::discovery::{mac_fragment, SubnetScanner};

/// Concurrent identity probes after a port sweep.
const IDENTIFY_CONCURRENCY: usize = 16;

/// Adapter for HTTP-controlled plugs, relays and dimmers.
pub struct HttpAdapter {
    client: Client,
    port: u16,
    timeout_ms: u64,
    scanner: Option<SubnetScanner>,
}

impl HttpAdapter {
    pub fn new(config: &HttpAdapterConfig) -> AdapterResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| AdapterError::Configuration(format!("HTTP client: {}", e)))?;
        Ok(Self {
            client,
            port: config.port,
            timeout_ms: config.timeout_ms,
            scanner: None,
        })
    }

    /// Sweep these hosts during discovery.
    pub fn with_scanner(mut self, scanner: SubnetScanner) -> Self {
        self.scanner = Some(scanner);
        self
    }

    fn base_url(device: &Device) -> AdapterResult<String> {
        match &device.address {
            TransportAddress::Http { host, port } => Ok(format!("http://{}:{}", host, port)),
            other => Err(AdapterError::Configuration(format!(
                "{} is not an HTTP address",
                other
            ))),
        }
    }

    async fn get_json(&self, url: &str, query: &[(&str, &str)]) -> AdapterResult<Value> {
        let response = self
            .client
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(|e| map_request_error(e, self.timeout_ms))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(AdapterError::Transport(format!("HTTP {} from {}", status, url)));
        }
        if !status.is_success() {
            return Err(AdapterError::CommandRejected(format!("HTTP {} from {}", status, url)));
        }
        response
            .json::<Value>()
            .await
            .map_err(|e| AdapterError::Protocol(format!("JSON parse error: {}", e)))
    }

    async fn tasmota(&self, base: &str, command: &str) -> AdapterResult<Value> {
        let body = self.get_json(&format!("{}/cm", base), &[("cmnd", command)]).await?;
        if body.get("Command").and_then(Value::as_str) == Some("Unknown") {
            return Err(AdapterError::CommandRejected(format!("Tasmota rejected '{}'", command)));
        }
        Ok(body)
    }

    /// Identify the firmware behind `host`, trying Tasmota first.
    async fn identify(&self, host: IpAddr) -> Option<DeviceDescriptor> {
        let base = format!("http://{}:{}", host, self.port);
        let address = TransportAddress::Http {
            host: host.to_string(),
            port: self.port,
        };

        if let Ok(status) = self.tasmota(&base, "Status 0").await {
            if let Some(descriptor) = tasmota_descriptor(&status, address.clone()) {
                return Some(descriptor);
            }
        }
        match self.get_json(&format!("{}/shelly", base), &[]).await {
            Ok(info) => shelly_descriptor(&info, address),
            Err(_) => None,
        }
    }

    async fn tasmota_command(&self, base: &str, command: &DeviceCommand) -> AdapterResult<()> {
        let cmnd = match command {
            DeviceCommand::TurnOn => "Power On".to_string(),
            DeviceCommand::TurnOff => "Power Off".to_string(),
            DeviceCommand::Toggle => "Power Toggle".to_string(),
            DeviceCommand::SetBrightness { level } => format!("Dimmer {}", level),
            DeviceCommand::SetColor { hex } => format!("Color {}", hex.trim_start_matches('#')),
            other => {
                return Err(AdapterError::CommandRejected(format!(
                    "Tasmota does not support {}",
                    other.action_name()
                )))
            }
        };
        self.tasmota(base, &cmnd).await.map(|_| ())
    }

    async fn shelly_command(&self, base: &str, command: &DeviceCommand) -> AdapterResult<()> {
        match command {
            DeviceCommand::TurnOn | DeviceCommand::TurnOff | DeviceCommand::Toggle => {
                let turn = match command {
                    DeviceCommand::TurnOn => "on",
                    DeviceCommand::TurnOff => "off",
                    _ => "toggle",
                };
                self.get_json(&format!("{}/relay/0", base), &[("turn", turn)]).await?;
            }
            DeviceCommand::SetBrightness { level } => {
                let level = level.to_string();
                self.get_json(&format!("{}/light/0", base), &[("brightness", level.as_str())])
                    .await?;
            }
            DeviceCommand::SetColor { hex } => {
                let (r, g, b) = split_rgb(hex)?;
                let (r, g, b) = (r.to_string(), g.to_string(), b.to_string());
                self.get_json(
                    &format!("{}/color/0", base),
                    &[("red", r.as_str()), ("green", g.as_str()), ("blue", b.as_str())],
                )
                .await?;
            }
            other => {
                return Err(AdapterError::CommandRejected(format!(
                    "Shelly does not support {}",
                    other.action_name()
                )))
            }
        }
        Ok(())
    }
}

fn map_request_error(e: reqwest::Error, timeout_ms: u64) -> AdapterError {
    if e.is_timeout() {
        AdapterError::Timeout(timeout_ms)
    } else if e.is_decode() {
        AdapterError::Protocol(e.to_string())
    } else {
        AdapterError::Transport(format!("HTTP request failed: {}", e))
    }
}

fn split_rgb(hex: &str) -> AdapterResult<(u8, u8, u8)> {
    let digits = hex.trim_start_matches('#');
    let channel = |i: usize| {
        digits
            .get(i..i + 2)
            .and_then(|s| u8::from_str_radix(s, 16).ok())
            .ok_or_else(|| AdapterError::CommandRejected(format!("invalid color '{}'", hex)))
    };
    Ok((channel(0)?, channel(2)?, channel(4)?))
}

/// Tasmota multi-channel meters report `Power` as an array.
fn number_or_sum(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::Array(items) => {
            let values: Vec<f64> = items.iter().filter_map(Value::as_f64).collect();
            if values.is_empty() {
                None
            } else {
                Some(values.iter().sum())
            }
        }
        _ => None,
    }
}

/// Parse a `Status 8` response.
pub fn parse_tasmota_status(device_id: &str, body: &Value) -> AdapterResult<Reading> {
    let sns = body
        .get("StatusSNS")
        .ok_or_else(|| AdapterError::protocol("missing StatusSNS"))?;
    let energy = sns
        .get("ENERGY")
        .ok_or_else(|| AdapterError::protocol("device has no energy monitor"))?;
    let power = energy
        .get("Power")
        .and_then(number_or_sum)
        .ok_or_else(|| AdapterError::protocol("ENERGY.Power missing"))?;

    let mut reading = Reading::new(device_id, Utc::now(), power);
    if let Some(v) = energy.get("Voltage").and_then(number_or_sum) {
        reading = reading.with_voltage(v);
    }
    if let Some(a) = energy.get("Current").and_then(number_or_sum) {
        reading = reading.with_current(a);
    }
    if let Some(kwh) = energy.get("Total").and_then(Value::as_f64) {
        reading = reading.with_energy(kwh);
    }
    if let Some(pf) = energy.get("Factor").and_then(number_or_sum) {
        reading = reading.with_power_factor(pf);
    }
    if let Some(hz) = energy.get("Frequency").and_then(number_or_sum) {
        reading = reading.with_frequency(hz);
    }
    let temperature = sns
        .as_object()
        .into_iter()
        .flat_map(|sensors| sensors.values())
        .find_map(|sensor| sensor.get("Temperature").and_then(Value::as_f64));
    if let Some(t) = temperature {
        reading = reading.with_temperature(t);
    }
    Ok(reading)
}

/// Parse a Shelly `/status` response.
pub fn parse_shelly_status(device_id: &str, body: &Value) -> AdapterResult<Reading> {
    let mut reading = if let Some(meter) = body.get("meters").and_then(|m| m.get(0)) {
        let power = meter
            .get("power")
            .and_then(Value::as_f64)
            .ok_or_else(|| AdapterError::protocol("meters[0].power missing"))?;
        let mut reading = Reading::new(device_id, Utc::now(), power);
        // watt-minutes
        if let Some(total) = meter.get("total").and_then(Value::as_f64) {
            reading = reading.with_energy(total / 60_000.0);
        }
        reading
    } else if let Some(emeter) = body.get("emeters").and_then(|m| m.get(0)) {
        let power = emeter
            .get("power")
            .and_then(Value::as_f64)
            .ok_or_else(|| AdapterError::protocol("emeters[0].power missing"))?;
        let mut reading = Reading::new(device_id, Utc::now(), power);
        if let Some(v) = emeter.get("voltage").and_then(Value::as_f64) {
            reading = reading.with_voltage(v);
        }
        if let Some(a) = emeter.get("current").and_then(Value::as_f64) {
            reading = reading.with_current(a);
        }
        if let Some(pf) = emeter.get("pf").and_then(Value::as_f64) {
            reading = reading.with_power_factor(pf);
        }
        if let Some(wh) = emeter.get("total").and_then(Value::as_f64) {
            reading = reading.with_energy(wh / 1000.0);
        }
        reading
    } else {
        return Err(AdapterError::protocol("status has no meters or emeters"));
    };

    let temperature = body.get("temperature").and_then(Value::as_f64).or_else(|| {
        body.get("tmp")
            .and_then(|t| t.get("tC"))
            .and_then(Value::as_f64)
    });
    if let Some(t) = temperature {
        reading = reading.with_temperature(t);
    }
    Ok(reading)
}

/// Build a descriptor from a `Status 0` response.
pub fn tasmota_descriptor(body: &Value, address: TransportAddress) -> Option<DeviceDescriptor> {
    let mac = body.pointer("/StatusNET/Mac").and_then(Value::as_str)?;
    let id = format!("tasmota-{}", mac_fragment(mac));
    let sts = body.get("StatusSTS");
    let dimmable = sts.and_then(|s| s.get("Dimmer")).is_some();

    let device_type = if dimmable {
        DeviceType::Lighting
    } else {
        DeviceType::SmartPlug
    };
    let mut descriptor = DeviceDescriptor::new(id, device_type, Protocol::Tasmota, address)
        .with_capability(Capability::Switch)
        .with_manufacturer("tasmota");
    if dimmable {
        descriptor = descriptor.with_capability(Capability::Dimmer);
    }
    if sts.and_then(|s| s.get("Color")).is_some() {
        descriptor = descriptor.with_capability(Capability::Color);
    }
    if let Some(name) = body.pointer("/Status/DeviceName").and_then(Value::as_str) {
        descriptor = descriptor.with_name(name);
    }
    if let Some(version) = body.pointer("/StatusFWR/Version").and_then(Value::as_str) {
        descriptor = descriptor.with_firmware(version);
    }
    Some(descriptor)
}

/// Build a descriptor from a Shelly `/shelly` response.
pub fn shelly_descriptor(body: &Value, address: TransportAddress) -> Option<DeviceDescriptor> {
    let mac = body.get("mac").and_then(Value::as_str)?;
    let model = body.get("type").and_then(Value::as_str).unwrap_or("unknown");
    let id = format!("shelly-{}", mac_fragment(mac));

    let lighting = ["SHDM", "SHBLB", "SHRGBW", "SHVIN"]
        .iter()
        .any(|prefix| model.starts_with(prefix));
    let device_type = if lighting {
        DeviceType::Lighting
    } else if model.starts_with("SHEM") {
        DeviceType::Meter
    } else {
        DeviceType::SmartPlug
    };

    let mut descriptor = DeviceDescriptor::new(id, device_type, Protocol::Shelly, address)
        .with_capability(Capability::Switch)
        .with_manufacturer("shelly")
        .with_model(model);
    if lighting {
        descriptor = descriptor.with_capability(Capability::Dimmer);
    }
    if model.starts_with("SHRGBW") || model.starts_with("SHBLB") {
        descriptor = descriptor.with_capability(Capability::Color);
    }
    if let Some(fw) = body.get("fw").and_then(Value::as_str) {
        descriptor = descriptor.with_firmware(fw);
    }
    Some(descriptor)
}

#[async_trait]
impl DeviceAdapter for HttpAdapter {
    fn name(&self) -> &str {
        "http"
    }

    fn protocols(&self) -> &[Protocol] {
        &[Protocol::Tasmota, Protocol::Shelly]
    }

    async fn discover(&self) -> AdapterResult<Vec<DeviceDescriptor>> {
        let scanner = match &self.scanner {
            Some(scanner) if !scanner.is_empty() => scanner,
            _ => return Ok(Vec::new()),
        };
        let hosts = scanner.scan_port(self.port).await;
        tracing::debug!(category = "discovery", adapter = "http", open = hosts.len(), "Port sweep finished");

        let found = stream::iter(hosts)
            .map(|host| self.identify(host))
            .buffer_unordered(IDENTIFY_CONCURRENCY)
            .collect::<Vec<_>>()
            .await;
        Ok(found.into_iter().flatten().collect())
    }

    async fn read_telemetry(&self, device: &Device) -> AdapterResult<Reading> {
        let base = Self::base_url(device)?;
        match device.protocol {
            Protocol::Tasmota => {
                let body = self.tasmota(&base, "Status 8").await?;
                parse_tasmota_status(&device.id, &body)
            }
            Protocol::Shelly => {
                let body = self.get_json(&format!("{}/status", base), &[]).await?;
                parse_shelly_status(&device.id, &body)
            }
            other => Err(AdapterError::Configuration(format!("http adapter cannot read {}", other))),
        }
    }

    async fn send_command(&self, device: &Device, command: &DeviceCommand) -> AdapterResult<()> {
        let base = Self::base_url(device)?;
        match device.protocol {
            Protocol::Tasmota => self.tasmota_command(&base, command).await,
            Protocol::Shelly => self.shelly_command(&base, command).await,
            other => Err(AdapterError::Configuration(format!("http adapter cannot drive {}", other))),
        }
    }
}
