use std::ops::Range;

use serde::Serialize;
use thiserror::Error;
use types::RawValue;

/// Fixed SunSpec register map for a SolarEdge inverter with up to two
/// attached meters. These are protocol constants, kept verbatim so they can
/// be cross-checked against the vendor register map.
pub mod registers {
    pub const INVERTER_COMMON_BASE: u16 = 40_000;
    pub const INVERTER_COMMON_REGS: u16 = 70;
    pub const INVERTER_TELEMETRY_BASE: u16 = 40_069;
    pub const INVERTER_TELEMETRY_REGS: u16 = 40;
    pub const METER_COMMON_BASE: u16 = 40_121;
    pub const METER_COMMON_REGS: u16 = 65;
    pub const METER_TELEMETRY_BASE: u16 = 40_188;
    pub const METER_TELEMETRY_REGS: u16 = 105;
    /// Address stride between consecutive meters.
    pub const METER_STRIDE: u16 = 174;
}

const SUNSPEC_ID0: u16 = 0x5375;
const SUNSPEC_ID1: u16 = 0x6e53;
const COMMON_DID: u16 = 1;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unexpected block length: got {got} registers, expected {expected}")]
    Length { expected: usize, got: usize },
    #[error("missing SunSpec sentinel at block start")]
    Sentinel,
    #[error("unexpected model id {0}")]
    UnexpectedModel(u16),
}

/// A raw register value paired with the signed power-of-ten exponent that
/// converts it into a physical measurement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScaledValue {
    pub raw: RawValue,
    pub scale: i16,
}

impl ScaledValue {
    pub fn new(raw: RawValue, scale: i16) -> Self {
        Self { raw, scale }
    }

    /// Converted measurement: `raw × 10^scale`.
    pub fn value(&self) -> f64 {
        self.raw.as_f64() * 10f64.powi(i32::from(self.scale))
    }
}

/// One shared scale-factor exponent covering a group of raw fields.
///
/// The exponent register is read once per group and stamped onto every
/// sibling field, so a decoded raw value cannot be separated from its
/// exponent.
#[derive(Debug, Clone, Copy)]
pub struct ScaleGroup {
    scale: i16,
}

impl ScaleGroup {
    pub fn new(scale: i16) -> Self {
        Self { scale }
    }

    pub fn u16(&self, raw: u16) -> ScaledValue {
        ScaledValue::new(RawValue::U16(raw), self.scale)
    }

    pub fn i16(&self, raw: i16) -> ScaledValue {
        ScaledValue::new(RawValue::I16(raw), self.scale)
    }

    pub fn u32(&self, raw: u32) -> ScaledValue {
        ScaledValue::new(RawValue::U32(raw), self.scale)
    }
}

/// Identification block shared by inverters and meters. Decoded once at
/// startup and again after a reconnect; informational only.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommonBlock {
    pub manufacturer: String,
    pub model: String,
    /// Present on meter common blocks only.
    pub option: Option<String>,
    pub version: String,
    pub serial: String,
    /// Present on the inverter common block only.
    pub device_address: Option<u16>,
}

/// One telemetry sample from the inverter block at 40069.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InverterBlock {
    pub did: u16,
    pub length: u16,
    pub ac_current: ScaledValue,
    pub ac_current_a: ScaledValue,
    pub ac_current_b: ScaledValue,
    pub ac_current_c: ScaledValue,
    pub ac_voltage_ab: ScaledValue,
    pub ac_voltage_bc: ScaledValue,
    pub ac_voltage_ca: ScaledValue,
    pub ac_voltage_an: ScaledValue,
    pub ac_voltage_bn: ScaledValue,
    pub ac_voltage_cn: ScaledValue,
    pub ac_power: ScaledValue,
    pub ac_frequency: ScaledValue,
    pub ac_apparent_power: ScaledValue,
    pub ac_reactive_power: ScaledValue,
    pub ac_power_factor: ScaledValue,
    pub ac_lifetime_energy: ScaledValue,
    pub dc_current: ScaledValue,
    pub dc_voltage: ScaledValue,
    pub dc_power: ScaledValue,
    pub heatsink_temperature: ScaledValue,
    pub status: u16,
    pub vendor_status: u16,
}

impl InverterBlock {
    pub fn operating_state(&self) -> OperatingState {
        OperatingState::from_code(self.status)
    }
}

/// SunSpec inverter operating states (model 10x `St` field).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OperatingState {
    Off,
    Sleeping,
    Starting,
    Producing,
    Throttled,
    ShuttingDown,
    Fault,
    Standby,
    Unknown(u16),
}

impl OperatingState {
    pub fn from_code(code: u16) -> Self {
        match code {
            1 => OperatingState::Off,
            2 => OperatingState::Sleeping,
            3 => OperatingState::Starting,
            4 => OperatingState::Producing,
            5 => OperatingState::Throttled,
            6 => OperatingState::ShuttingDown,
            7 => OperatingState::Fault,
            8 => OperatingState::Standby,
            other => OperatingState::Unknown(other),
        }
    }
}

/// One telemetry sample from a meter block at 40188 (+ stride).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MeterBlock {
    pub did: u16,
    pub length: u16,
    pub ac_current: ScaledValue,
    pub ac_current_a: ScaledValue,
    pub ac_current_b: ScaledValue,
    pub ac_current_c: ScaledValue,
    pub ac_voltage_ln: ScaledValue,
    pub ac_voltage_an: ScaledValue,
    pub ac_voltage_bn: ScaledValue,
    pub ac_voltage_cn: ScaledValue,
    pub ac_voltage_ll: ScaledValue,
    pub ac_voltage_ab: ScaledValue,
    pub ac_voltage_bc: ScaledValue,
    pub ac_voltage_ca: ScaledValue,
    pub ac_frequency: ScaledValue,
    pub ac_power: ScaledValue,
    pub ac_power_a: ScaledValue,
    pub ac_power_b: ScaledValue,
    pub ac_power_c: ScaledValue,
    pub ac_apparent_power: ScaledValue,
    pub ac_apparent_power_a: ScaledValue,
    pub ac_apparent_power_b: ScaledValue,
    pub ac_apparent_power_c: ScaledValue,
    pub ac_reactive_power: ScaledValue,
    pub ac_reactive_power_a: ScaledValue,
    pub ac_reactive_power_b: ScaledValue,
    pub ac_reactive_power_c: ScaledValue,
    pub ac_power_factor: ScaledValue,
    pub ac_power_factor_a: ScaledValue,
    pub ac_power_factor_b: ScaledValue,
    pub ac_power_factor_c: ScaledValue,
    pub exported_energy: ScaledValue,
    pub exported_energy_a: ScaledValue,
    pub exported_energy_b: ScaledValue,
    pub exported_energy_c: ScaledValue,
    pub imported_energy: ScaledValue,
    pub imported_energy_a: ScaledValue,
    pub imported_energy_b: ScaledValue,
    pub imported_energy_c: ScaledValue,
}

/// Fixed register-map position of one configured meter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeterBinding {
    /// 1-based meter index; also the metric name prefix (`meter1_`, ...).
    pub index: u8,
    pub common_base: u16,
    pub telemetry_base: u16,
}

impl MeterBinding {
    pub fn new(index: u8) -> Self {
        let offset = u16::from(index.saturating_sub(1)) * registers::METER_STRIDE;
        Self {
            index,
            common_base: registers::METER_COMMON_BASE + offset,
            telemetry_base: registers::METER_TELEMETRY_BASE + offset,
        }
    }
}

/// Bindings for `count` meters, indexed from 1.
pub fn meter_bindings(count: u8) -> Vec<MeterBinding> {
    (1..=count).map(MeterBinding::new).collect()
}

/// Decodes the inverter common block (70 registers at 40000), including the
/// leading "SunS" sentinel.
pub fn decode_inverter_common(regs: &[u16]) -> Result<CommonBlock, DecodeError> {
    expect_len(regs, registers::INVERTER_COMMON_REGS as usize)?;
    if regs[0] != SUNSPEC_ID0 || regs[1] != SUNSPEC_ID1 {
        return Err(DecodeError::Sentinel);
    }
    let did = u16_at(regs, 2);
    if did != COMMON_DID {
        return Err(DecodeError::UnexpectedModel(did));
    }

    Ok(CommonBlock {
        manufacturer: string_at(regs, 4..20),
        model: string_at(regs, 20..36),
        option: None,
        version: string_at(regs, 44..52),
        serial: string_at(regs, 52..68),
        device_address: Some(u16_at(regs, 68)),
    })
}

/// Decodes a meter common block (65 registers); meters carry no "SunS"
/// sentinel of their own, the block starts directly at the model id.
pub fn decode_meter_common(regs: &[u16]) -> Result<CommonBlock, DecodeError> {
    expect_len(regs, registers::METER_COMMON_REGS as usize)?;
    let did = u16_at(regs, 0);
    if did != COMMON_DID {
        return Err(DecodeError::UnexpectedModel(did));
    }

    Ok(CommonBlock {
        manufacturer: string_at(regs, 2..18),
        model: string_at(regs, 18..34),
        option: Some(string_at(regs, 34..42)),
        version: string_at(regs, 42..50),
        serial: string_at(regs, 50..65),
        device_address: None,
    })
}

/// Decodes the inverter telemetry block (40 registers at 40069). Output is
/// the untouched raw integers plus raw exponents; conversion happens at
/// [`ScaledValue::value`] so raw and converted values stay independently
/// observable.
pub fn decode_inverter(regs: &[u16]) -> Result<InverterBlock, DecodeError> {
    expect_len(regs, registers::INVERTER_TELEMETRY_REGS as usize)?;
    let did = u16_at(regs, 0);
    if !(101..=103).contains(&did) {
        return Err(DecodeError::UnexpectedModel(did));
    }

    let current = ScaleGroup::new(i16_at(regs, 6));
    let voltage = ScaleGroup::new(i16_at(regs, 13));
    let power = ScaleGroup::new(i16_at(regs, 15));
    let frequency = ScaleGroup::new(i16_at(regs, 17));
    let apparent = ScaleGroup::new(i16_at(regs, 19));
    let reactive = ScaleGroup::new(i16_at(regs, 21));
    let power_factor = ScaleGroup::new(i16_at(regs, 23));
    let energy = ScaleGroup::new(i16_at(regs, 26));
    let dc_current = ScaleGroup::new(i16_at(regs, 28));
    let dc_voltage = ScaleGroup::new(i16_at(regs, 30));
    let dc_power = ScaleGroup::new(i16_at(regs, 32));
    let temperature = ScaleGroup::new(i16_at(regs, 37));

    Ok(InverterBlock {
        did,
        length: u16_at(regs, 1),
        ac_current: current.u16(u16_at(regs, 2)),
        ac_current_a: current.u16(u16_at(regs, 3)),
        ac_current_b: current.u16(u16_at(regs, 4)),
        ac_current_c: current.u16(u16_at(regs, 5)),
        ac_voltage_ab: voltage.u16(u16_at(regs, 7)),
        ac_voltage_bc: voltage.u16(u16_at(regs, 8)),
        ac_voltage_ca: voltage.u16(u16_at(regs, 9)),
        ac_voltage_an: voltage.u16(u16_at(regs, 10)),
        ac_voltage_bn: voltage.u16(u16_at(regs, 11)),
        ac_voltage_cn: voltage.u16(u16_at(regs, 12)),
        ac_power: power.i16(i16_at(regs, 14)),
        ac_frequency: frequency.u16(u16_at(regs, 16)),
        ac_apparent_power: apparent.i16(i16_at(regs, 18)),
        ac_reactive_power: reactive.i16(i16_at(regs, 20)),
        ac_power_factor: power_factor.i16(i16_at(regs, 22)),
        ac_lifetime_energy: energy.u32(u32_at(regs, 24)),
        dc_current: dc_current.u16(u16_at(regs, 27)),
        dc_voltage: dc_voltage.u16(u16_at(regs, 29)),
        dc_power: dc_power.i16(i16_at(regs, 31)),
        heatsink_temperature: temperature.i16(i16_at(regs, 34)),
        status: u16_at(regs, 38),
        vendor_status: u16_at(regs, 39),
    })
}

/// Decodes a meter telemetry block (105 registers). Exported and imported
/// energy accumulators share the single energy scale factor at offset 54.
pub fn decode_meter(regs: &[u16]) -> Result<MeterBlock, DecodeError> {
    expect_len(regs, registers::METER_TELEMETRY_REGS as usize)?;
    let did = u16_at(regs, 0);
    if !(201..=204).contains(&did) {
        return Err(DecodeError::UnexpectedModel(did));
    }

    let current = ScaleGroup::new(i16_at(regs, 6));
    let voltage = ScaleGroup::new(i16_at(regs, 15));
    let frequency = ScaleGroup::new(i16_at(regs, 17));
    let power = ScaleGroup::new(i16_at(regs, 22));
    let apparent = ScaleGroup::new(i16_at(regs, 27));
    let reactive = ScaleGroup::new(i16_at(regs, 32));
    let power_factor = ScaleGroup::new(i16_at(regs, 37));
    let energy = ScaleGroup::new(i16_at(regs, 54));

    Ok(MeterBlock {
        did,
        length: u16_at(regs, 1),
        ac_current: current.i16(i16_at(regs, 2)),
        ac_current_a: current.i16(i16_at(regs, 3)),
        ac_current_b: current.i16(i16_at(regs, 4)),
        ac_current_c: current.i16(i16_at(regs, 5)),
        ac_voltage_ln: voltage.i16(i16_at(regs, 7)),
        ac_voltage_an: voltage.i16(i16_at(regs, 8)),
        ac_voltage_bn: voltage.i16(i16_at(regs, 9)),
        ac_voltage_cn: voltage.i16(i16_at(regs, 10)),
        ac_voltage_ll: voltage.i16(i16_at(regs, 11)),
        ac_voltage_ab: voltage.i16(i16_at(regs, 12)),
        ac_voltage_bc: voltage.i16(i16_at(regs, 13)),
        ac_voltage_ca: voltage.i16(i16_at(regs, 14)),
        ac_frequency: frequency.i16(i16_at(regs, 16)),
        ac_power: power.i16(i16_at(regs, 18)),
        ac_power_a: power.i16(i16_at(regs, 19)),
        ac_power_b: power.i16(i16_at(regs, 20)),
        ac_power_c: power.i16(i16_at(regs, 21)),
        ac_apparent_power: apparent.i16(i16_at(regs, 23)),
        ac_apparent_power_a: apparent.i16(i16_at(regs, 24)),
        ac_apparent_power_b: apparent.i16(i16_at(regs, 25)),
        ac_apparent_power_c: apparent.i16(i16_at(regs, 26)),
        ac_reactive_power: reactive.i16(i16_at(regs, 28)),
        ac_reactive_power_a: reactive.i16(i16_at(regs, 29)),
        ac_reactive_power_b: reactive.i16(i16_at(regs, 30)),
        ac_reactive_power_c: reactive.i16(i16_at(regs, 31)),
        ac_power_factor: power_factor.i16(i16_at(regs, 33)),
        ac_power_factor_a: power_factor.i16(i16_at(regs, 34)),
        ac_power_factor_b: power_factor.i16(i16_at(regs, 35)),
        ac_power_factor_c: power_factor.i16(i16_at(regs, 36)),
        exported_energy: energy.u32(u32_at(regs, 38)),
        exported_energy_a: energy.u32(u32_at(regs, 40)),
        exported_energy_b: energy.u32(u32_at(regs, 42)),
        exported_energy_c: energy.u32(u32_at(regs, 44)),
        imported_energy: energy.u32(u32_at(regs, 46)),
        imported_energy_a: energy.u32(u32_at(regs, 48)),
        imported_energy_b: energy.u32(u32_at(regs, 50)),
        imported_energy_c: energy.u32(u32_at(regs, 52)),
    })
}

fn expect_len(regs: &[u16], expected: usize) -> Result<(), DecodeError> {
    if regs.len() != expected {
        return Err(DecodeError::Length {
            expected,
            got: regs.len(),
        });
    }
    Ok(())
}

fn u16_at(regs: &[u16], index: usize) -> u16 {
    regs[index]
}

fn i16_at(regs: &[u16], index: usize) -> i16 {
    regs[index] as i16
}

fn u32_at(regs: &[u16], index: usize) -> u32 {
    (u32::from(regs[index]) << 16) | u32::from(regs[index + 1])
}

/// Fixed-width text field: two ASCII bytes per register, trailing NULs then
/// surrounding whitespace trimmed.
fn string_at(regs: &[u16], range: Range<usize>) -> String {
    let mut bytes = Vec::with_capacity(range.len() * 2);
    for &reg in &regs[range] {
        bytes.push((reg >> 8) as u8);
        bytes.push((reg & 0x00ff) as u8);
    }
    let end = bytes
        .iter()
        .rposition(|&byte| byte != 0)
        .map_or(0, |pos| pos + 1);
    String::from_utf8_lossy(&bytes[..end]).trim().to_string()
}
