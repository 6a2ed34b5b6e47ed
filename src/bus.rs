//! Path based value bus, modelled after the Venus OS D-Bus service API:
//! a device registers named paths, sets values on them, and gets a callback
//! when somebody else writes one of its writable paths.

use crate::error::BusError;
use serde_derive::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BusValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for BusValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusValue::Int(v) => write!(f, "{v}"),
            BusValue::Float(v) => write!(f, "{v}"),
            BusValue::Text(v) => write!(f, "{v}"),
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
        BusValue::Int(v.into())
    }
}

impl From<u32> for BusValue {
    fn from(v: u32) -> Self {
        BusValue::Int(v.into())
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

/// Called with the path and proposed value on an external write.
/// Returning `false` rejects the write.
pub type ChangeCallback = Box<dyn FnMut(&str, &BusValue) -> bool + Send>;

/// A write to one of our paths that originated on the bus.
#[derive(Debug, Clone, PartialEq)]
pub struct BusWrite {
    pub path: String,
    pub value: BusValue,
}

pub trait BusService {
    fn add_path(&mut self, path: &str, initial: BusValue) -> Result<(), BusError>;

    fn add_writable_path(
        &mut self,
        path: &str,
        initial: BusValue,
        on_change: ChangeCallback,
    ) -> Result<(), BusError>;

    fn set_value(&mut self, path: &str, value: BusValue) -> Result<(), BusError>;

    fn value(&self, path: &str) -> Option<&BusValue>;

    /// Applies a write coming from another bus participant.
    /// Returns whether the write was accepted.
    fn write_from_bus(&mut self, path: &str, value: BusValue) -> Result<bool, BusError>;

    /// Retries values the transport could not take yet. Called once per cycle.
    fn flush(&mut self) {}
}

struct PathEntry {
    value: BusValue,
    on_change: Option<ChangeCallback>,
}

impl PathEntry {
    fn writable(&self) -> bool {
        self.on_change.is_some()
    }
}

/// In-process path registry. Holds the last value of every declared path.
#[derive(Default)]
pub struct LocalBus {
    paths: BTreeMap<String, PathEntry>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn paths(&self) -> impl Iterator<Item = (&str, &BusValue)> {
        self.paths.iter().map(|(p, e)| (p.as_str(), &e.value))
    }

    pub fn is_writable(&self, path: &str) -> bool {
        self.paths.get(path).is_some_and(PathEntry::writable)
    }

    /// Stores `value` and reports whether it differs from the previous one.
    pub fn replace(&mut self, path: &str, value: BusValue) -> Result<bool, BusError> {
        let entry = self
            .paths
            .get_mut(path)
            .ok_or_else(|| BusError::UnknownPath(path.to_string()))?;
        let changed = entry.value != value;
        entry.value = value;
        Ok(changed)
    }

    fn insert(
        &mut self,
        path: &str,
        value: BusValue,
        on_change: Option<ChangeCallback>,
    ) -> Result<(), BusError> {
        if self.paths.contains_key(path) {
            return Err(BusError::DuplicatePath(path.to_string()));
        }
        self.paths
            .insert(path.to_string(), PathEntry { value, on_change });
        Ok(())
    }
}

impl BusService for LocalBus {
    fn add_path(&mut self, path: &str, initial: BusValue) -> Result<(), BusError> {
        self.insert(path, initial, None)
    }

    fn add_writable_path(
        &mut self,
        path: &str,
        initial: BusValue,
        on_change: ChangeCallback,
    ) -> Result<(), BusError> {
        self.insert(path, initial, Some(on_change))
    }

    fn set_value(&mut self, path: &str, value: BusValue) -> Result<(), BusError> {
        self.replace(path, value).map(|_| ())
    }

    fn value(&self, path: &str) -> Option<&BusValue> {
        self.paths.get(path).map(|e| &e.value)
    }

    fn write_from_bus(&mut self, path: &str, value: BusValue) -> Result<bool, BusError> {
        let entry = self
            .paths
            .get_mut(path)
            .ok_or_else(|| BusError::UnknownPath(path.to_string()))?;
        let Some(on_change) = entry.on_change.as_mut() else {
            return Ok(false);
        };
        if !on_change(path, &value) {
            return Ok(false);
        }
        entry.value = value;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_err;

    fn accept_all() -> ChangeCallback {
        Box::new(|_, _| true)
    }

    #[test]
    fn test_add_and_set_value() {
        let mut bus = LocalBus::new();
        bus.add_path("/Connected", 1u8.into()).unwrap();
        bus.add_writable_path("/Ac/Power", 0u8.into(), accept_all())
            .unwrap();

        assert_eq!(bus.value("/Connected"), Some(&BusValue::Int(1)));
        bus.set_value("/Ac/Power", 812.5.into()).unwrap();
        assert_eq!(bus.value("/Ac/Power"), Some(&BusValue::Float(812.5)));
    }

    #[test]
    fn test_duplicate_path_is_rejected() {
        let mut bus = LocalBus::new();
        bus.add_path("/ProductName", "Meter".into()).unwrap();
        let err = bus.add_path("/ProductName", "Other".into()).unwrap_err();
        assert!(matches!(err, BusError::DuplicatePath(p) if p == "/ProductName"));
        assert_eq!(bus.value("/ProductName"), Some(&BusValue::from("Meter")));
    }

    #[test]
    fn test_set_unknown_path() {
        let mut bus = LocalBus::new();
        let err = bus.set_value("/Ac/Power", 1.0.into()).unwrap_err();
        assert!(matches!(err, BusError::UnknownPath(_)));
        assert_eq!(bus.value("/Ac/Power"), None);
    }

    #[test]
    fn test_replace_reports_change() {
        let mut bus = LocalBus::new();
        bus.add_path("/UpdateIndex", 0u8.into()).unwrap();
        assert!(!bus.replace("/UpdateIndex", 0u8.into()).unwrap());
        assert!(bus.replace("/UpdateIndex", 1u8.into()).unwrap());
    }

    #[test]
    fn test_external_write_is_accepted_by_callback() {
        let mut bus = LocalBus::new();
        bus.add_writable_path("/Ac/L1/Voltage", 0u8.into(), accept_all())
            .unwrap();

        assert!(bus.write_from_bus("/Ac/L1/Voltage", 240.0.into()).unwrap());
        assert_eq!(bus.value("/Ac/L1/Voltage"), Some(&BusValue::Float(240.0)));
    }

    #[test]
    fn test_external_write_to_read_only_path() {
        let mut bus = LocalBus::new();
        bus.add_path("/DeviceInstance", 0u8.into()).unwrap();

        assert!(!bus.write_from_bus("/DeviceInstance", 7u8.into()).unwrap());
        assert_eq!(bus.value("/DeviceInstance"), Some(&BusValue::Int(0)));
        assert!(!bus.is_writable("/DeviceInstance"));
    }

    #[test]
    fn test_external_write_rejected_by_callback() {
        let mut bus = LocalBus::new();
        bus.add_writable_path("/Ac/Power", 5u8.into(), Box::new(|_, _| false))
            .unwrap();

        assert!(!bus.write_from_bus("/Ac/Power", 100u8.into()).unwrap());
        assert_eq!(bus.value("/Ac/Power"), Some(&BusValue::Int(5)));
    }

    #[test]
    fn test_external_write_unknown_path() {
        let mut bus = LocalBus::new();
        assert_err!(bus.write_from_bus("/Nope", 1u8.into()));
    }

    #[test]
    fn test_paths_are_ordered() {
        let mut bus = LocalBus::new();
        bus.add_path("/b", 1u8.into()).unwrap();
        bus.add_path("/a", 2u8.into()).unwrap();
        let paths: Vec<&str> = bus.paths().map(|(p, _)| p).collect();
        assert_eq!(paths, vec!["/a", "/b"]);
    }

    #[test]
    fn test_value_json_shape() {
        assert_eq!(serde_json::to_string(&BusValue::Int(3)).unwrap(), "3");
        assert_eq!(serde_json::to_string(&BusValue::Float(1.5)).unwrap(), "1.5");
        assert_eq!(
            serde_json::from_str::<BusValue>("\"Fronius\"").unwrap(),
            BusValue::from("Fronius")
        );
        assert_eq!(serde_json::from_str::<BusValue>("42").unwrap(), BusValue::Int(42));
    }
}
