//! OBIS data-line parser shared by the IEC 62056-21 and DSMR P1 adapters.
//!
//! A data line looks like `1-0:1.8.0(001234.567*kWh)`. The medium/channel
//! prefix (`1-0:`) is optional; IEC optical readouts usually omit it. Lines
//! with several value groups (DSMR gas: `(timestamp)(value*m3)`) keep the
//! last group.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use gridmind_core::Reading;

use crate::adapter::{AdapterError, AdapterResult};

/// One parsed OBIS data line.
#[derive(Debug, Clone, PartialEq)]
pub struct ObisLine {
    /// Full identifier as received, e.g. `1-0:32.7.0`
    pub code: String,
    /// `C.D.E` part of the identifier, e.g. `32.7.0`
    pub short_code: String,
    /// Whether the line describes an electricity register
    pub electricity: bool,
    pub raw_value: String,
    pub value: Option<f64>,
    pub unit: Option<String>,
}

impl ObisLine {
    /// Parse one line. Returns `None` for header, terminator, and blank lines.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        let open = line.find('(')?;
        let code = line[..open].trim();
        if code.is_empty() || code.starts_with('/') || code.starts_with('!') {
            return None;
        }

        let group_start = line.rfind('(')?;
        let group_end = line[group_start..].find(')')? + group_start;
        let inner = &line[group_start + 1..group_end];

        let (raw_value, unit) = match inner.split_once('*') {
            Some((v, u)) => (v.trim(), Some(u.trim().to_string())),
            None => (inner.trim(), None),
        };

        let (medium, short_code) = match code.split_once(':') {
            Some((m, s)) => (Some(m), s),
            None => (None, code),
        };
        let short_code = short_code.trim_end_matches("*255").trim_end_matches(".255");
        let electricity = medium.map(|m| m.starts_with("1-")).unwrap_or(true);

        Some(Self {
            code: code.to_string(),
            short_code: short_code.to_string(),
            electricity,
            raw_value: raw_value.to_string(),
            value: raw_value.parse::<f64>().ok(),
            unit,
        })
    }

    /// Value normalized to W / kWh / V / A / Hz.
    pub fn normalized(&self) -> Option<f64> {
        let v = self.value?;
        let unit = self.unit.as_deref().unwrap_or("").to_ascii_lowercase();
        Some(match unit.as_str() {
            "kw" | "kvar" => v * 1000.0,
            "wh" => v / 1000.0,
            "mwh" => v * 1000.0,
            _ => v,
        })
    }
}

/// All electricity registers of one readout, keyed by short code.
#[derive(Debug, Clone, Default)]
pub struct ObisReadout {
    pub lines: HashMap<String, ObisLine>,
    /// Meter identification from the `/XXX5...` header, if present
    pub identification: Option<String>,
}

impl ObisReadout {
    /// Parse a readout body. Stops at the `!` terminator.
    pub fn parse(text: &str) -> Self {
        let mut readout = Self::default();
        for line in text.lines() {
            let line = line.trim_matches(|c: char| c == '\u{2}' || c.is_whitespace());
            if line.starts_with('!') {
                break;
            }
            if let Some(id) = line.strip_prefix('/') {
                readout.identification = Some(id.trim().to_string());
                continue;
            }
            if let Some(parsed) = ObisLine::parse(line) {
                if parsed.electricity {
                    readout.lines.insert(parsed.short_code.clone(), parsed);
                }
            }
        }
        readout
    }

    pub fn get(&self, short_code: &str) -> Option<f64> {
        self.lines.get(short_code).and_then(ObisLine::normalized)
    }

    fn sum_of(&self, codes: &[&str]) -> Option<f64> {
        let values: Vec<f64> = codes.iter().filter_map(|c| self.get(c)).collect();
        if values.is_empty() {
            None
        } else {
            Some(values.iter().sum())
        }
    }

    /// Net active power: import minus export when both are reported.
    pub fn active_power(&self) -> Option<f64> {
        if let Some(import) = self.get("1.7.0") {
            return Some(import - self.get("2.7.0").unwrap_or(0.0));
        }
        if let Some(total) = self.get("16.7.0") {
            return Some(total);
        }
        let import = self.sum_of(&["21.7.0", "41.7.0", "61.7.0"])?;
        let export = self.sum_of(&["22.7.0", "42.7.0", "62.7.0"]).unwrap_or(0.0);
        Some(import - export)
    }

    /// Cumulative imported energy, summing tariff registers when no total exists.
    pub fn import_energy(&self) -> Option<f64> {
        self.get("1.8.0").or_else(|| {
            let tariffs: Vec<f64> = self
                .lines
                .iter()
                .filter(|(code, _)| code.starts_with("1.8.") && code.as_str() != "1.8.0")
                .filter_map(|(_, line)| line.normalized())
                .collect();
            if tariffs.is_empty() {
                None
            } else {
                Some(tariffs.iter().sum())
            }
        })
    }

    pub fn voltage(&self) -> Option<f64> {
        let live: Vec<f64> = ["32.7.0", "52.7.0", "72.7.0"]
            .iter()
            .filter_map(|c| self.get(c))
            .filter(|v| *v > 1.0)
            .collect();
        if live.is_empty() {
            None
        } else {
            Some(live.iter().sum::<f64>() / live.len() as f64)
        }
    }

    pub fn current(&self) -> Option<f64> {
        self.sum_of(&["31.7.0", "51.7.0", "71.7.0"])
    }

    /// Convert into a normalized reading. Fails when no power register exists.
    pub fn to_reading(&self, device_id: &str, timestamp: DateTime<Utc>) -> AdapterResult<Reading> {
        let power = self
            .active_power()
            .ok_or_else(|| AdapterError::protocol("readout has no active power register"))?;

        let mut reading = Reading::new(device_id, timestamp, power);
        if let Some(v) = self.voltage() {
            reading = reading.with_voltage(v);
        }
        if let Some(a) = self.current() {
            reading = reading.with_current(a);
        }
        if let Some(kwh) = self.import_energy() {
            reading = reading.with_energy(kwh);
        }
        if let Some(hz) = self.get("14.7.0") {
            reading = reading.with_frequency(hz);
        }
        if let Some(pf) = self.get("13.7.0").or_else(|| self.get("33.7.0")) {
            reading = reading.with_power_factor(pf.abs());
        }
        Ok(reading)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_line_variants() {
        let line = ObisLine::parse("1-0:1.8.1(001234.567*kWh)").unwrap();
        assert_eq!(line.short_code, "1.8.1");
        assert_eq!(line.value, Some(1234.567));
        assert_eq!(line.unit.as_deref(), Some("kWh"));
        assert!(line.electricity);

        let line = ObisLine::parse("32.7.0(229.8*V)").unwrap();
        assert_eq!(line.normalized(), Some(229.8));

        let gas = ObisLine::parse("0-1:24.2.1(101209112500W)(12785.123*m3)").unwrap();
        assert!(!gas.electricity);
        assert_eq!(gas.value, Some(12785.123));

        assert!(ObisLine::parse("!").is_none());
        assert!(ObisLine::parse("/ISk5MT174-0001").is_none());
    }

    #[test]
    fn test_kw_normalized_to_watts() {
        let line = ObisLine::parse("1-0:1.7.0(01.193*kW)").unwrap();
        assert_eq!(line.normalized(), Some(1193.0));
    }

    #[test]
    fn test_readout_to_reading() {
        let text = "/ISK5\\2M550T-1012\r\n\r\n\
            1-0:1.8.1(000671.578*kWh)\r\n\
            1-0:1.8.2(000842.472*kWh)\r\n\
            1-0:1.7.0(00.650*kW)\r\n\
            1-0:2.7.0(00.150*kW)\r\n\
            1-0:32.7.0(230.0*V)\r\n\
            1-0:31.7.0(003*A)\r\n\
            0-1:24.2.1(101209112500W)(12785.123*m3)\r\n\
            !1F28\r\n";
        let readout = ObisReadout::parse(text);
        assert_eq!(readout.identification.as_deref(), Some("ISK5\\2M550T-1012"));
        assert!(!readout.lines.contains_key("24.2.1"));

        let reading = readout.to_reading("p1", Utc::now()).unwrap();
        assert!((reading.power_w - 500.0).abs() < 1e-9);
        assert!((reading.energy_kwh - 1514.05).abs() < 1e-9);
        assert_eq!(reading.voltage_v, 230.0);
        assert_eq!(reading.current_a, 3.0);
    }

    #[test]
    fn test_readout_without_power_is_protocol_error() {
        let readout = ObisReadout::parse("1.8.0(100.0*kWh)\n!\n");
        assert!(matches!(
            readout.to_reading("m", Utc::now()),
            Err(AdapterError::Protocol(_))
        ));
    }
}
