use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Raw energy counter unit (Wh) per published unit (kWh).
pub const ENERGY_SCALE: f64 = 1000.0;

/// One decoded inverter payload.
///
/// Field names follow the SMA spot-value naming used on the wire. Unknown
/// fields in the payload are ignored; every field below is required.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryFrame {
    pub spotacvoltage1: f64,
    pub spotacvoltage2: f64,
    pub spotacvoltage3: f64,
    pub spotacamperage1: f64,
    pub spotacamperage2: f64,
    pub spotacamperage3: f64,
    pub spotacpower1: f64,
    pub spotacpower2: f64,
    pub spotacpower3: f64,
    /// Aggregate AC power over all phases (W).
    pub spotacpower: f64,
    /// Cumulative energy counter (Wh).
    pub total: f64,
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("empty payload")]
    Empty,
    #[error("payload is not a JSON object: {0}")]
    NotAnObject(#[source] serde_json::Error),
    #[error("invalid frame: {0}")]
    InvalidField(#[source] serde_json::Error),
}

impl TelemetryFrame {
    /// Decode a broker payload. The payload must be a JSON object carrying
    /// every required field as a number; anything else rejects the whole frame.
    pub fn decode(payload: &[u8]) -> Result<Self, FrameError> {
        if payload.is_empty() {
            return Err(FrameError::Empty);
        }

        let object: Map<String, Value> =
            serde_json::from_slice(payload).map_err(FrameError::NotAnObject)?;

        serde_json::from_value(Value::Object(object)).map_err(FrameError::InvalidField)
    }

    /// Cumulative energy in kWh.
    pub fn energy_kwh(&self) -> f64 {
        self.total / ENERGY_SCALE
    }

    pub fn phase_voltages(&self) -> [f64; 3] {
        [self.spotacvoltage1, self.spotacvoltage2, self.spotacvoltage3]
    }

    pub fn phase_currents(&self) -> [f64; 3] {
        [self.spotacamperage1, self.spotacamperage2, self.spotacamperage3]
    }

    pub fn phase_powers(&self) -> [f64; 3] {
        [self.spotacpower1, self.spotacpower2, self.spotacpower3]
    }
}
