//! Path-keyed value store standing in for the system service bus.
//!
//! [`ServiceBus`] is the contract the bridge writes against; [`LocalBus`] is
//! the in-process implementation the daemon runs with. Every access happens
//! on the bus loop task, so the trait takes `&mut self` and needs no locking.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use tracing::{debug, info};

/// Renders a value for display (`"230.1V"`, `"12.35KWh"`, ...).
pub type TextFormatter = fn(&BusValue) -> String;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BusValue {
    Empty,
    Int(i64),
    Float(f64),
    Text(String),
}

impl BusValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            BusValue::Int(v) => Some(*v as f64),
            BusValue::Float(v) => Some(*v),
            BusValue::Empty | BusValue::Text(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            BusValue::Int(v) => Some(*v),
            BusValue::Float(v) if v.fract() == 0.0 => Some(*v as i64),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, BusValue::Empty)
    }
}

impl fmt::Display for BusValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusValue::Empty => write!(f, "--"),
            BusValue::Int(v) => write!(f, "{}", v),
            BusValue::Float(v) => write!(f, "{}", v),
            BusValue::Text(v) => write!(f, "{}", v),
        }
    }
}

impl From<i64> for BusValue {
    fn from(v: i64) -> Self {
        BusValue::Int(v)
    }
}

impl From<u8> for BusValue {
    fn from(v: u8) -> Self {
        BusValue::Int(i64::from(v))
    }
}

impl From<f64> for BusValue {
    fn from(v: f64) -> Self {
        BusValue::Float(v)
    }
}

impl From<&str> for BusValue {
    fn from(v: &str) -> Self {
        BusValue::Text(v.to_string())
    }
}

impl From<String> for BusValue {
    fn from(v: String) -> Self {
        BusValue::Text(v)
    }
}

/// Registration parameters for one path.
#[derive(Debug, Clone)]
pub struct PathSpec {
    pub initial: BusValue,
    pub formatter: Option<TextFormatter>,
    pub writable: bool,
}

impl PathSpec {
    /// Read-only path without a formatter.
    pub fn fixed(initial: impl Into<BusValue>) -> Self {
        Self {
            initial: initial.into(),
            formatter: None,
            writable: false,
        }
    }

    /// Externally writable path rendered through `formatter`.
    pub fn writable(initial: BusValue, formatter: TextFormatter) -> Self {
        Self {
            initial,
            formatter: Some(formatter),
            writable: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusEntry {
    pub path: String,
    pub value: BusValue,
    pub text: String,
    pub writable: bool,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum BusError {
    #[error("unknown path {0}")]
    UnknownPath(String),
    #[error("path {0} already registered")]
    DuplicatePath(String),
    #[error("path {0} is not writable")]
    NotWritable(String),
    #[error("bus write failed: {0}")]
    WriteFailed(String),
}

/// Hook run for every write arriving from the far side of the bus.
/// Returning `false` rejects the write and leaves the stored value alone.
pub trait WriteHandler: Send {
    fn on_external_write(&self, path: &str, value: &BusValue) -> bool {
        debug!("someone else updated {} to {}", path, value);
        true
    }
}

/// Accepts every external write after logging it.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

impl WriteHandler for AcceptAll {}

pub trait ServiceBus {
    fn service_name(&self) -> &str;

    fn add_path(&mut self, path: &str, spec: PathSpec) -> Result<(), BusError>;

    fn get(&self, path: &str) -> Result<BusValue, BusError>;

    fn set(&mut self, path: &str, value: BusValue) -> Result<(), BusError>;

    /// Apply every update or none of them.
    fn set_many(&mut self, updates: &[(&str, BusValue)]) -> Result<(), BusError>;

    /// Display text for a path, using its formatter when one is registered.
    fn text(&self, path: &str) -> Result<String, BusError>;

    /// Write from an outside actor. Goes through the write handler; returns
    /// whether the change was accepted.
    fn write_external(&mut self, path: &str, value: BusValue) -> Result<bool, BusError>;

    fn entries(&self) -> Vec<BusEntry>;
}

struct BusItem {
    value: BusValue,
    formatter: Option<TextFormatter>,
    writable: bool,
}

impl BusItem {
    fn text(&self) -> String {
        match (self.formatter, &self.value) {
            (_, BusValue::Empty) => String::new(),
            (Some(format), value) => format(value),
            (None, value) => value.to_string(),
        }
    }
}

pub struct LocalBus {
    service_name: String,
    items: BTreeMap<String, BusItem>,
    handler: Box<dyn WriteHandler>,
    writes: u64,
}

impl LocalBus {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self::with_handler(service_name, Box::new(AcceptAll))
    }

    pub fn with_handler(service_name: impl Into<String>, handler: Box<dyn WriteHandler>) -> Self {
        let service_name = service_name.into();
        info!("registered bus service {}", service_name);
        Self {
            service_name,
            items: BTreeMap::new(),
            handler,
            writes: 0,
        }
    }

    /// Number of committed writes (single sets and batches each count once).
    pub fn write_count(&self) -> u64 {
        self.writes
    }

    fn item(&self, path: &str) -> Result<&BusItem, BusError> {
        self.items
            .get(path)
            .ok_or_else(|| BusError::UnknownPath(path.to_string()))
    }
}

impl fmt::Debug for LocalBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalBus")
            .field("service_name", &self.service_name)
            .field("paths", &self.items.len())
            .field("writes", &self.writes)
            .finish()
    }
}

impl ServiceBus for LocalBus {
    fn service_name(&self) -> &str {
        &self.service_name
    }

    fn add_path(&mut self, path: &str, spec: PathSpec) -> Result<(), BusError> {
        if self.items.contains_key(path) {
            return Err(BusError::DuplicatePath(path.to_string()));
        }
        self.items.insert(
            path.to_string(),
            BusItem {
                value: spec.initial,
                formatter: spec.formatter,
                writable: spec.writable,
            },
        );
        Ok(())
    }

    fn get(&self, path: &str) -> Result<BusValue, BusError> {
        self.item(path).map(|item| item.value.clone())
    }

    fn set(&mut self, path: &str, value: BusValue) -> Result<(), BusError> {
        let item = self
            .items
            .get_mut(path)
            .ok_or_else(|| BusError::UnknownPath(path.to_string()))?;
        item.value = value;
        self.writes += 1;
        Ok(())
    }

    fn set_many(&mut self, updates: &[(&str, BusValue)]) -> Result<(), BusError> {
        if let Some((missing, _)) = updates.iter().find(|(path, _)| !self.items.contains_key(*path)) {
            return Err(BusError::UnknownPath((*missing).to_string()));
        }

        for (path, value) in updates {
            if let Some(item) = self.items.get_mut(*path) {
                item.value = value.clone();
            }
        }
        self.writes += 1;
        Ok(())
    }

    fn text(&self, path: &str) -> Result<String, BusError> {
        self.item(path).map(BusItem::text)
    }

    fn write_external(&mut self, path: &str, value: BusValue) -> Result<bool, BusError> {
        if !self.item(path)?.writable {
            return Err(BusError::NotWritable(path.to_string()));
        }

        if !self.handler.on_external_write(path, &value) {
            return Ok(false);
        }

        self.set(path, value)?;
        Ok(true)
    }

    fn entries(&self) -> Vec<BusEntry> {
        self.items
            .iter()
            .map(|(path, item)| BusEntry {
                path: path.clone(),
                value: item.value.clone(),
                text: item.text(),
                writable: item.writable,
            })
            .collect()
    }
}
