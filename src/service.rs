//! PV-inverter service layout on the bus: path names, display formatters,
//! static identity registration and the published snapshot.

use crate::bus::{BusError, BusValue, PathSpec, ServiceBus};
use crate::config::DeviceConfig;
use crate::frame::TelemetryFrame;
use serde::{Deserialize, Serialize};

pub const SERVICE_BASE_NAME: &str = "com.victronenergy.pvinverter";
/// Product id reserved for third-party meters.
pub const PRODUCT_ID: i64 = 0xFFFF;

pub const PATH_AC_ENERGY_FORWARD: &str = "/Ac/Energy/Forward";
pub const PATH_AC_POWER: &str = "/Ac/Power";
pub const PATH_AC_CURRENT: &str = "/Ac/Current";
pub const PATH_AC_VOLTAGE: &str = "/Ac/Voltage";
pub const PATH_L1_VOLTAGE: &str = "/Ac/L1/Voltage";
pub const PATH_L2_VOLTAGE: &str = "/Ac/L2/Voltage";
pub const PATH_L3_VOLTAGE: &str = "/Ac/L3/Voltage";
pub const PATH_L1_CURRENT: &str = "/Ac/L1/Current";
pub const PATH_L2_CURRENT: &str = "/Ac/L2/Current";
pub const PATH_L3_CURRENT: &str = "/Ac/L3/Current";
pub const PATH_L1_POWER: &str = "/Ac/L1/Power";
pub const PATH_L2_POWER: &str = "/Ac/L2/Power";
pub const PATH_L3_POWER: &str = "/Ac/L3/Power";
pub const PATH_UPDATE_INDEX: &str = "/UpdateIndex";
pub const PATH_CONNECTED: &str = "/Connected";

const PHASE_VOLTAGE_PATHS: [&str; 3] = [PATH_L1_VOLTAGE, PATH_L2_VOLTAGE, PATH_L3_VOLTAGE];
const PHASE_CURRENT_PATHS: [&str; 3] = [PATH_L1_CURRENT, PATH_L2_CURRENT, PATH_L3_CURRENT];
const PHASE_POWER_PATHS: [&str; 3] = [PATH_L1_POWER, PATH_L2_POWER, PATH_L3_POWER];

pub fn service_name(device_instance: u32) -> String {
    format!("{}.http_{:02}", SERVICE_BASE_NAME, device_instance)
}

fn format_with_unit(value: &BusValue, decimals: usize, unit: &str) -> String {
    match value.as_f64() {
        Some(v) => format!("{:.*}{}", decimals, v, unit),
        None => format!("{}{}", value, unit),
    }
}

pub fn format_kwh(value: &BusValue) -> String {
    format_with_unit(value, 2, "KWh")
}

pub fn format_amps(value: &BusValue) -> String {
    format_with_unit(value, 1, "A")
}

pub fn format_watts(value: &BusValue) -> String {
    format_with_unit(value, 1, "W")
}

pub fn format_volts(value: &BusValue) -> String {
    format_with_unit(value, 1, "V")
}

/// Register the management, identity and AC paths for one inverter.
pub fn register_service<B: ServiceBus + ?Sized>(
    bus: &mut B,
    device: &DeviceConfig,
) -> Result<(), BusError> {
    bus.add_path("/Mgmt/ProcessName", PathSpec::fixed(env!("CARGO_PKG_NAME")))?;
    bus.add_path(
        "/Mgmt/ProcessVersion",
        PathSpec::fixed(format!("{} (Rust)", env!("CARGO_PKG_VERSION"))),
    )?;
    bus.add_path("/Mgmt/Connection", PathSpec::fixed(device.connection.as_str()))?;

    bus.add_path("/DeviceInstance", PathSpec::fixed(i64::from(device.instance)))?;
    bus.add_path("/ProductId", PathSpec::fixed(PRODUCT_ID))?;
    bus.add_path("/ProductName", PathSpec::fixed(device.product_name.as_str()))?;
    bus.add_path("/CustomName", PathSpec::fixed(device.custom_name.as_str()))?;
    bus.add_path(PATH_CONNECTED, PathSpec::fixed(1i64))?;
    bus.add_path("/Latency", PathSpec::fixed(BusValue::Empty))?;
    bus.add_path("/FirmwareVersion", PathSpec::fixed(1.0f64))?;
    bus.add_path("/HardwareVersion", PathSpec::fixed(1i64))?;
    bus.add_path("/Position", PathSpec::fixed(i64::from(device.position)))?;
    bus.add_path("/Serial", PathSpec::fixed(device.serial.as_str()))?;
    bus.add_path(PATH_UPDATE_INDEX, PathSpec::fixed(0i64))?;
    // Lets VRM detect the service as a PV inverter.
    bus.add_path("/StatusCode", PathSpec::fixed(0i64))?;

    let zero = || BusValue::Int(0);
    bus.add_path(PATH_AC_ENERGY_FORWARD, PathSpec::writable(BusValue::Empty, format_kwh))?;
    bus.add_path(PATH_AC_POWER, PathSpec::writable(zero(), format_watts))?;
    bus.add_path(PATH_AC_CURRENT, PathSpec::writable(zero(), format_amps))?;
    bus.add_path(PATH_AC_VOLTAGE, PathSpec::writable(zero(), format_volts))?;
    for path in PHASE_VOLTAGE_PATHS {
        bus.add_path(path, PathSpec::writable(zero(), format_volts))?;
    }
    for path in PHASE_CURRENT_PATHS {
        bus.add_path(path, PathSpec::writable(zero(), format_amps))?;
    }
    for path in PHASE_POWER_PATHS {
        bus.add_path(path, PathSpec::writable(zero(), format_watts))?;
    }

    Ok(())
}

/// Everything one publish cycle writes, committed to the bus in one batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishedState {
    pub phase_voltage: [f64; 3],
    pub phase_current: [f64; 3],
    pub phase_power: [f64; 3],
    pub power: f64,
    pub energy_kwh: f64,
    pub revision: u8,
    pub connected: bool,
}

impl PublishedState {
    pub fn from_frame(frame: &TelemetryFrame, revision: u8) -> Self {
        Self {
            phase_voltage: frame.phase_voltages(),
            phase_current: frame.phase_currents(),
            phase_power: frame.phase_powers(),
            power: frame.spotacpower,
            energy_kwh: frame.energy_kwh(),
            revision,
            connected: true,
        }
    }

    /// Bus writes for this snapshot. The revision goes last in the batch.
    pub fn updates(&self) -> Vec<(&'static str, BusValue)> {
        let mut updates = Vec::with_capacity(13);
        for (i, path) in PHASE_VOLTAGE_PATHS.iter().enumerate() {
            updates.push((*path, BusValue::Float(self.phase_voltage[i])));
        }
        for (i, path) in PHASE_CURRENT_PATHS.iter().enumerate() {
            updates.push((*path, BusValue::Float(self.phase_current[i])));
        }
        for (i, path) in PHASE_POWER_PATHS.iter().enumerate() {
            updates.push((*path, BusValue::Float(self.phase_power[i])));
        }
        updates.push((PATH_AC_ENERGY_FORWARD, BusValue::Float(self.energy_kwh)));
        updates.push((PATH_AC_POWER, BusValue::Float(self.power)));
        updates.push((PATH_CONNECTED, BusValue::Int(i64::from(self.connected))));
        updates.push((PATH_UPDATE_INDEX, BusValue::from(self.revision)));
        updates
    }
}
