use crate::error::ConfigError;
use crate::meter_bridge::DeviceIdentity;
use crate::meter_reading::{EnergyUnit, MeterProfile, DEFAULT_SINGLE_PHASE_MODEL};
use crate::mqtt_bus::MqttSettings;
use clap::{Parser, Subcommand};
use std::time::Duration;

/// Every option can also be given through the environment variable next to it.
#[derive(Debug, Clone, Parser)]
#[command(name = "fronius_grid_bridge")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Publishes a Fronius Smart Meter as a grid meter on the Venus OS bus")]
pub struct BridgeConfig {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Base URL of the Fronius Solar API
    #[arg(long, env = "METER_URL", default_value = "http://192.168.21.176", global = true)]
    pub meter_url: String,

    /// Solar API device id of the meter
    #[arg(long, env = "METER_DEVICE_ID", default_value_t = 1, global = true)]
    pub meter_device_id: u32,

    /// Upper bound for one meter request in milliseconds
    #[arg(long, env = "METER_TIMEOUT_MS", default_value_t = 150, global = true)]
    pub request_timeout_ms: u64,

    /// Polling period in milliseconds
    #[arg(long, env = "POLL_INTERVAL_MS", default_value_t = 200, global = true)]
    pub poll_interval_ms: u64,

    /// Unit of the meter's energy counters: `wh` or `kwh`
    #[arg(long, env = "METER_ENERGY_UNIT", default_value = "wh", global = true)]
    pub energy_unit: EnergyUnit,

    /// Model string of the single-phase meter variant
    #[arg(long, env = "METER_SINGLE_PHASE_MODEL", default_value = DEFAULT_SINGLE_PHASE_MODEL, global = true)]
    pub single_phase_model: String,

    #[arg(
        long,
        env = "BUS_SERVICE_NAME",
        default_value = "com.victronenergy.grid.cgwacs_ttyUSB0_mb1",
        global = true
    )]
    pub service_name: String,

    #[arg(long, env = "BUS_DEVICE_INSTANCE", default_value_t = 0, global = true)]
    pub device_instance: u32,

    /// Product id announced on the bus (45069 is the value dbus-cgwacs uses)
    #[arg(long, env = "BUS_PRODUCT_ID", default_value_t = 45069, global = true)]
    pub product_id: u32,

    #[arg(long, env = "BUS_PRODUCT_NAME", default_value = "Fronius Smart Meter", global = true)]
    pub product_name: String,

    #[arg(
        long,
        env = "BUS_CONNECTION",
        default_value = "Fronius Smart Meter service",
        global = true
    )]
    pub connection: String,

    /// Portal id used in the MQTT topics
    #[arg(long, env = "BUS_PORTAL_ID", default_value = "fronius", global = true)]
    pub portal_id: String,

    #[arg(long, env = "MQTT_HOST", default_value = "localhost", global = true)]
    pub mqtt_host: String,

    #[arg(long, env = "MQTT_PORT", default_value_t = 1883, global = true)]
    pub mqtt_port: u16,

    #[arg(long, env = "MQTT_USERNAME", global = true)]
    pub mqtt_username: Option<String>,

    #[arg(long, env = "MQTT_PASSWORD", hide_env_values = true, global = true)]
    pub mqtt_password: Option<String>,

    #[arg(long, env = "MQTT_KEEP_ALIVE_SECS", default_value_t = 30, global = true)]
    pub mqtt_keep_alive_secs: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Poll the meter and publish it on the bus (default)
    #[default]
    Run,
    /// Read the meter once, print the reading as JSON and exit
    Snapshot,
}

impl BridgeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        // The HTTP client is built without TLS support
        if !self.meter_url.starts_with("http://") {
            return Err(ConfigError::MeterUrl(self.meter_url.clone()));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Zero("poll interval"));
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::Zero("request timeout"));
        }
        if self.mqtt_keep_alive_secs == 0 {
            return Err(ConfigError::Zero("MQTT keep-alive"));
        }
        Ok(())
    }

    pub fn command(&self) -> Command {
        self.command.unwrap_or_default()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn meter_profile(&self) -> MeterProfile {
        MeterProfile {
            energy_unit: self.energy_unit,
            single_phase_model: self.single_phase_model.clone(),
        }
    }

    pub fn device_identity(&self) -> DeviceIdentity {
        DeviceIdentity {
            product_id: self.product_id,
            product_name: self.product_name.clone(),
            connection: self.connection.clone(),
            ..DeviceIdentity::new(&self.service_name, self.device_instance)
        }
    }

    pub fn mqtt_settings(&self) -> MqttSettings {
        MqttSettings {
            host: self.mqtt_host.clone(),
            port: self.mqtt_port,
            username: self.mqtt_username.clone(),
            password: self.mqtt_password.clone(),
            keep_alive: Duration::from_secs(self.mqtt_keep_alive_secs),
        }
    }
}
