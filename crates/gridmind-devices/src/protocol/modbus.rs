//! Modbus framing for RTU (serial, CRC16) and TCP (MBAP header).
//!
//! Only the function codes the meter and control paths need are modeled:
//! read input/holding registers, write single coil, write single register.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::crc16::{append_crc, verify_crc};
use crate::adapter::{AdapterError, AdapterResult};

pub const FN_READ_HOLDING: u8 = 0x03;
pub const FN_READ_INPUT: u8 = 0x04;
pub const FN_WRITE_COIL: u8 = 0x05;
pub const FN_WRITE_REGISTER: u8 = 0x06;

/// Registers per read request allowed by the standard.
pub const MAX_READ_REGISTERS: u16 = 125;

/// A Modbus request PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    ReadInputRegisters { address: u16, count: u16 },
    ReadHoldingRegisters { address: u16, count: u16 },
    WriteSingleCoil { address: u16, on: bool },
    WriteSingleRegister { address: u16, value: u16 },
}

/// A decoded response PDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Registers(Vec<u16>),
    /// Write echoed back by the slave
    Written { address: u16, value: u16 },
}

impl Request {
    pub fn function(&self) -> u8 {
        match self {
            Self::ReadInputRegisters { .. } => FN_READ_INPUT,
            Self::ReadHoldingRegisters { .. } => FN_READ_HOLDING,
            Self::WriteSingleCoil { .. } => FN_WRITE_COIL,
            Self::WriteSingleRegister { .. } => FN_WRITE_REGISTER,
        }
    }

    /// `[function][address BE16][count-or-value BE16]`
    pub fn encode_pdu(&self) -> Vec<u8> {
        let (address, word) = match *self {
            Self::ReadInputRegisters { address, count }
            | Self::ReadHoldingRegisters { address, count } => (address, count),
            Self::WriteSingleCoil { address, on } => (address, if on { 0xFF00 } else { 0x0000 }),
            Self::WriteSingleRegister { address, value } => (address, value),
        };
        let mut pdu = Vec::with_capacity(5);
        pdu.push(self.function());
        pdu.extend_from_slice(&address.to_be_bytes());
        pdu.extend_from_slice(&word.to_be_bytes());
        pdu
    }

    fn validate(&self) -> AdapterResult<()> {
        match *self {
            Self::ReadInputRegisters { count, .. } | Self::ReadHoldingRegisters { count, .. }
                if count == 0 || count > MAX_READ_REGISTERS =>
            {
                Err(AdapterError::Configuration(format!(
                    "register count {} outside 1-{}",
                    count, MAX_READ_REGISTERS
                )))
            }
            _ => Ok(()),
        }
    }

    /// Decode the response PDU that answers this request.
    pub fn parse_response(&self, pdu: &[u8]) -> AdapterResult<Response> {
        let function = *pdu
            .first()
            .ok_or_else(|| AdapterError::protocol("empty Modbus response"))?;

        if function == self.function() | 0x80 {
            let code = pdu.get(1).copied().unwrap_or(0);
            return Err(AdapterError::Protocol(format!(
                "Modbus exception 0x{:02X} ({}) for function 0x{:02X}",
                code,
                exception_name(code),
                self.function()
            )));
        }
        if function != self.function() {
            return Err(AdapterError::Protocol(format!(
                "unexpected function 0x{:02X}, expected 0x{:02X}",
                function,
                self.function()
            )));
        }

        match *self {
            Self::ReadInputRegisters { count, .. } | Self::ReadHoldingRegisters { count, .. } => {
                let byte_count = *pdu
                    .get(1)
                    .ok_or_else(|| AdapterError::protocol("missing byte count"))?
                    as usize;
                if byte_count != count as usize * 2 || pdu.len() != 2 + byte_count {
                    return Err(AdapterError::Protocol(format!(
                        "byte count {} does not match {} registers",
                        byte_count, count
                    )));
                }
                Ok(Response::Registers(
                    pdu[2..]
                        .chunks_exact(2)
                        .map(|w| u16::from_be_bytes([w[0], w[1]]))
                        .collect(),
                ))
            }
            Self::WriteSingleCoil { .. } | Self::WriteSingleRegister { .. } => {
                if pdu.len() != 5 || pdu[..] != self.encode_pdu()[..] {
                    return Err(AdapterError::protocol("write echo mismatch"));
                }
                Ok(Response::Written {
                    address: u16::from_be_bytes([pdu[1], pdu[2]]),
                    value: u16::from_be_bytes([pdu[3], pdu[4]]),
                })
            }
        }
    }
}

fn exception_name(code: u8) -> &'static str {
    match code {
        0x01 => "illegal function",
        0x02 => "illegal data address",
        0x03 => "illegal data value",
        0x04 => "slave device failure",
        0x06 => "slave device busy",
        _ => "unknown",
    }
}

/// RTU frame: `[slave][pdu][CRC16 LE]`.
pub fn rtu_frame(slave: u8, request: &Request) -> AdapterResult<Vec<u8>> {
    request.validate()?;
    let mut frame = Vec::with_capacity(8);
    frame.push(slave);
    frame.extend_from_slice(&request.encode_pdu());
    append_crc(&mut frame);
    Ok(frame)
}

/// Check address and CRC of an RTU response and decode it.
pub fn parse_rtu_response(slave: u8, request: &Request, frame: &[u8]) -> AdapterResult<Response> {
    if frame.len() < 5 {
        return Err(AdapterError::protocol("RTU response too short"));
    }
    if !verify_crc(frame) {
        return Err(AdapterError::protocol("CRC mismatch"));
    }
    if frame[0] != slave {
        return Err(AdapterError::Protocol(format!(
            "response from slave {}, expected {}",
            frame[0], slave
        )));
    }
    request.parse_response(&frame[1..frame.len() - 2])
}

/// TCP frame: MBAP header `[tid BE16][0x0000][len BE16][unit]` followed by the PDU.
pub fn tcp_frame(transaction_id: u16, unit: u8, request: &Request) -> AdapterResult<Vec<u8>> {
    request.validate()?;
    let pdu = request.encode_pdu();
    let mut frame = Vec::with_capacity(7 + pdu.len());
    frame.extend_from_slice(&transaction_id.to_be_bytes());
    frame.extend_from_slice(&0u16.to_be_bytes());
    frame.extend_from_slice(&((pdu.len() + 1) as u16).to_be_bytes());
    frame.push(unit);
    frame.extend_from_slice(&pdu);
    Ok(frame)
}

/// Check the MBAP header of a TCP response and decode it.
pub fn parse_tcp_response(
    transaction_id: u16,
    unit: u8,
    request: &Request,
    frame: &[u8],
) -> AdapterResult<Response> {
    if frame.len() < 8 {
        return Err(AdapterError::protocol("MBAP response too short"));
    }
    let tid = u16::from_be_bytes([frame[0], frame[1]]);
    let protocol = u16::from_be_bytes([frame[2], frame[3]]);
    let len = u16::from_be_bytes([frame[4], frame[5]]) as usize;
    if tid != transaction_id {
        return Err(AdapterError::Protocol(format!(
            "transaction id {} does not match {}",
            tid, transaction_id
        )));
    }
    if protocol != 0 {
        return Err(AdapterError::protocol("non-Modbus protocol id in MBAP"));
    }
    if len != frame.len() - 6 {
        return Err(AdapterError::protocol("MBAP length mismatch"));
    }
    if frame[6] != unit {
        return Err(AdapterError::Protocol(format!(
            "response from unit {}, expected {}",
            frame[6], unit
        )));
    }
    request.parse_response(&frame[7..])
}

/// Read one RTU response from a byte stream, sized by its own header.
pub async fn read_rtu_frame<R>(io: &mut R) -> AdapterResult<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut head = [0u8; 3];
    io.read_exact(&mut head).await?;
    let function = head[1];
    let remaining = if function & 0x80 != 0 {
        // exception code already read, CRC left
        2
    } else {
        match function {
            FN_READ_INPUT | FN_READ_HOLDING => head[2] as usize + 2,
            FN_WRITE_COIL | FN_WRITE_REGISTER => 5,
            other => {
                return Err(AdapterError::Protocol(format!(
                    "unsupported function 0x{:02X} in response",
                    other
                )))
            }
        }
    };
    let mut frame = head.to_vec();
    frame.resize(3 + remaining, 0);
    io.read_exact(&mut frame[3..]).await?;
    Ok(frame)
}

/// Read one MBAP-framed response from a byte stream.
pub async fn read_tcp_frame<R>(io: &mut R) -> AdapterResult<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 6];
    io.read_exact(&mut header).await?;
    let len = u16::from_be_bytes([header[4], header[5]]) as usize;
    if len < 2 || len > 254 {
        return Err(AdapterError::Protocol(format!("invalid MBAP length {}", len)));
    }
    let mut frame = header.to_vec();
    frame.resize(6 + len, 0);
    io.read_exact(&mut frame[6..]).await?;
    Ok(frame)
}

/// Send an RTU request and wait for its response.
pub async fn rtu_transact<S>(io: &mut S, slave: u8, request: &Request) -> AdapterResult<Response>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let frame = rtu_frame(slave, request)?;
    io.write_all(&frame).await?;
    io.flush().await?;
    let response = read_rtu_frame(io).await?;
    parse_rtu_response(slave, request, &response)
}

/// Send a TCP request and wait for its response.
pub async fn tcp_transact<S>(
    io: &mut S,
    transaction_id: u16,
    unit: u8,
    request: &Request,
) -> AdapterResult<Response>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let frame = tcp_frame(transaction_id, unit, request)?;
    io.write_all(&frame).await?;
    io.flush().await?;
    let response = read_tcp_frame(io).await?;
    parse_tcp_response(transaction_id, unit, request, &response)
}

/// IEEE-754 float from two registers, high word first.
pub fn decode_f32(high: u16, low: u16) -> f32 {
    f32::from_bits(((high as u32) << 16) | low as u32)
}

/// Encode a float into two registers, high word first.
pub fn encode_f32(value: f32) -> [u16; 2] {
    let bits = value.to_bits();
    [(bits >> 16) as u16, bits as u16]
}

/// Named float32 input registers of a three-phase energy meter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeterRegister {
    VoltageL1,
    VoltageL2,
    VoltageL3,
    CurrentL1,
    CurrentL2,
    CurrentL3,
    TotalPower,
    PowerFactor,
    Frequency,
    ImportEnergy,
    ExportEnergy,
}

impl MeterRegister {
    pub const ALL: [MeterRegister; 11] = [
        Self::VoltageL1,
        Self::VoltageL2,
        Self::VoltageL3,
        Self::CurrentL1,
        Self::CurrentL2,
        Self::CurrentL3,
        Self::TotalPower,
        Self::PowerFactor,
        Self::Frequency,
        Self::ImportEnergy,
        Self::ExportEnergy,
    ];

    /// Start address of the two-register value.
    pub fn address(&self) -> u16 {
        match self {
            Self::VoltageL1 => 0x0000,
            Self::VoltageL2 => 0x0002,
            Self::VoltageL3 => 0x0004,
            Self::CurrentL1 => 0x0006,
            Self::CurrentL2 => 0x0008,
            Self::CurrentL3 => 0x000A,
            Self::TotalPower => 0x0034,
            Self::PowerFactor => 0x003E,
            Self::Frequency => 0x0046,
            Self::ImportEnergy => 0x0048,
            Self::ExportEnergy => 0x004A,
        }
    }
}

/// One read request covering every meter register.
pub fn meter_block() -> Request {
    Request::ReadInputRegisters {
        address: 0x0000,
        count: MeterRegister::ExportEnergy.address() + 2,
    }
}

/// Values decoded from a [`meter_block`] response.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MeterValues {
    pub voltage: [f64; 3],
    pub current: [f64; 3],
    pub total_power_w: f64,
    pub power_factor: f64,
    pub frequency_hz: f64,
    pub import_kwh: f64,
    pub export_kwh: f64,
}

impl MeterValues {
    /// Decode registers starting at address 0.
    pub fn from_registers(registers: &[u16]) -> AdapterResult<Self> {
        let value = |reg: MeterRegister| -> AdapterResult<f64> {
            let at = reg.address() as usize;
            match (registers.get(at), registers.get(at + 1)) {
                (Some(&hi), Some(&lo)) => {
                    let v = decode_f32(hi, lo) as f64;
                    if v.is_finite() {
                        Ok(v)
                    } else {
                        Err(AdapterError::Protocol(format!("{:?} is not finite", reg)))
                    }
                }
                _ => Err(AdapterError::Protocol(format!("{:?} missing from block", reg))),
            }
        };

        Ok(Self {
            voltage: [
                value(MeterRegister::VoltageL1)?,
                value(MeterRegister::VoltageL2)?,
                value(MeterRegister::VoltageL3)?,
            ],
            current: [
                value(MeterRegister::CurrentL1)?,
                value(MeterRegister::CurrentL2)?,
                value(MeterRegister::CurrentL3)?,
            ],
            total_power_w: value(MeterRegister::TotalPower)?,
            power_factor: value(MeterRegister::PowerFactor)?,
            frequency_hz: value(MeterRegister::Frequency)?,
            import_kwh: value(MeterRegister::ImportEnergy)?,
            export_kwh: value(MeterRegister::ExportEnergy)?,
        })
    }

    /// Mean of the energized phases (single-phase meters report zeros on L2/L3).
    pub fn voltage(&self) -> f64 {
        let live: Vec<f64> = self.voltage.iter().copied().filter(|v| *v > 1.0).collect();
        if live.is_empty() {
            0.0
        } else {
            live.iter().sum::<f64>() / live.len() as f64
        }
    }

    pub fn current(&self) -> f64 {
        self.current.iter().map(|c| c.abs()).sum()
    }
}
