//! Fronius Grid Bridge Library
//!
//! Polls a Fronius Smart Meter through the Solar API and republishes its
//! measurements as a virtual grid meter on the Venus OS bus.

pub mod bus;
pub mod config;
pub mod error;
pub mod fronius_api;
pub mod meter_bridge;
pub mod meter_reading;
pub mod mqtt_bus;
pub mod service;
pub mod update_index;

// Re-export commonly used types for easier access
pub use bus::{BusService, BusValue, BusWrite, LocalBus};
pub use config::BridgeConfig;
pub use fronius_api::FroniusMeter;
pub use meter_bridge::{CycleOutcome, DeviceIdentity, MeterBridge};
pub use meter_reading::{EnergyUnit, MeterProfile, MeterReading};
pub use mqtt_bus::MqttBus;
