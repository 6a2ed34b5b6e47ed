use crate::bus::{BusService, BusValue, BusWrite};
use crate::error::{BusError, CycleError, FetchError};
use crate::fronius_api::FroniusMeter;
use crate::meter_reading::{MeterProfile, MeterReading};
use crate::update_index::UpdateIndex;
use tracing::{debug, info, warn};

pub const AC_POWER: &str = "/Ac/Power";
pub const PHASE_VOLTAGE: [&str; 3] = ["/Ac/L1/Voltage", "/Ac/L2/Voltage", "/Ac/L3/Voltage"];
pub const PHASE_CURRENT: [&str; 3] = ["/Ac/L1/Current", "/Ac/L2/Current", "/Ac/L3/Current"];
pub const PHASE_POWER: [&str; 3] = ["/Ac/L1/Power", "/Ac/L2/Power", "/Ac/L3/Power"];
/// Energy bought from the grid
pub const ENERGY_FORWARD: &str = "/Ac/Energy/Forward";
/// Energy sold to the grid
pub const ENERGY_REVERSE: &str = "/Ac/Energy/Reverse";
pub const UPDATE_INDEX: &str = "/UpdateIndex";

pub const DATA_PATHS: [&str; 12] = [
    AC_POWER,
    PHASE_VOLTAGE[0],
    PHASE_VOLTAGE[1],
    PHASE_VOLTAGE[2],
    PHASE_CURRENT[0],
    PHASE_CURRENT[1],
    PHASE_CURRENT[2],
    PHASE_POWER[0],
    PHASE_POWER[1],
    PHASE_POWER[2],
    ENERGY_FORWARD,
    ENERGY_REVERSE,
];

/// Identity and management values announced for the virtual grid meter.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceIdentity {
    pub service_name: String,
    pub device_instance: u32,
    pub product_id: u32,
    pub product_name: String,
    pub connection: String,
    pub firmware_version: f64,
    pub hardware_version: i64,
}

impl DeviceIdentity {
    pub fn new(service_name: &str, device_instance: u32) -> Self {
        Self {
            service_name: service_name.to_string(),
            device_instance,
            // value used in ac_sensor_bridge.cpp of dbus-cgwacs
            product_id: 45069,
            product_name: "Fronius Smart Meter".to_string(),
            connection: "Fronius Smart Meter service".to_string(),
            firmware_version: 0.1,
            hardware_version: 0,
        }
    }
}

#[derive(Debug)]
pub enum CycleOutcome {
    Published(MeterReading),
    Failed(CycleError),
}

impl CycleOutcome {
    pub fn is_published(&self) -> bool {
        matches!(self, CycleOutcome::Published(_))
    }
}

/// Polls the meter and mirrors its readings onto a bus device.
pub struct MeterBridge<B> {
    meter: FroniusMeter,
    profile: MeterProfile,
    bus: B,
    update_index: UpdateIndex,
}

impl<B: BusService> MeterBridge<B> {
    /// Registers the device paths on `bus`. Any registration failure means the
    /// deployment is broken and is returned to the caller.
    pub fn new(
        meter: FroniusMeter,
        profile: MeterProfile,
        identity: &DeviceIdentity,
        mut bus: B,
    ) -> Result<Self, BusError> {
        debug!(
            "{} /DeviceInstance = {}",
            identity.service_name, identity.device_instance
        );
        register_identity(&mut bus, identity)?;
        for path in DATA_PATHS {
            bus.add_writable_path(path, BusValue::Int(0), Box::new(accept_change))?;
        }
        bus.add_path(UPDATE_INDEX, BusValue::Int(0))?;

        info!(
            service = %identity.service_name,
            meter = %meter.realtime_data_url(),
            energy_unit = ?profile.energy_unit,
            "Registered grid meter on the bus"
        );
        Ok(Self {
            meter,
            profile,
            bus,
            update_index: UpdateIndex::new(),
        })
    }

    /// Runs one fetch/transform/publish cycle. Never fails: errors degrade to
    /// a 0 W total power and are reported through the outcome.
    pub async fn update(&mut self) -> CycleOutcome {
        let outcome = match self.read_meter().await {
            Ok(reading) => match self.publish(&reading) {
                Ok(()) => CycleOutcome::Published(reading),
                Err(e) => CycleOutcome::Failed(e.into()),
            },
            Err(e) => CycleOutcome::Failed(e.into()),
        };

        if let CycleOutcome::Failed(err) = &outcome {
            warn!(kind = err.kind(), error = %err, "Meter cycle failed, publishing 0W");
            self.publish_fallback();
        }

        let index = self.update_index.advance();
        if let Err(e) = self.bus.set_value(UPDATE_INDEX, index.into()) {
            warn!(error = %e, "Can't publish update index");
        }
        self.bus.flush();
        outcome
    }

    async fn read_meter(&self) -> Result<MeterReading, FetchError> {
        let data = self.meter.read_realtime_data().await?;
        MeterReading::from_realtime_data(&data, &self.profile)
    }

    pub fn publish(&mut self, reading: &MeterReading) -> Result<(), BusError> {
        // positive: consumption, negative: feed into grid
        self.bus.set_value(AC_POWER, reading.total_power.into())?;
        for (line, phase) in reading.phases.iter().enumerate() {
            self.bus
                .set_value(PHASE_VOLTAGE[line], phase.voltage.into())?;
            self.bus
                .set_value(PHASE_CURRENT[line], phase.current.into())?;
            self.bus.set_value(PHASE_POWER[line], phase.power.into())?;
        }
        self.bus
            .set_value(ENERGY_FORWARD, reading.energy_forward.into())?;
        self.bus
            .set_value(ENERGY_REVERSE, reading.energy_reverse.into())?;
        info!("House Consumption: {}", reading.total_power);
        Ok(())
    }

    /// Zeroes the total power only. The other paths keep their last good
    /// values.
    fn publish_fallback(&mut self) {
        if let Err(e) = self.bus.set_value(AC_POWER, BusValue::Float(0.0)) {
            warn!(error = %e, "Can't publish fallback power");
        }
    }

    /// Applies a write made by another bus participant.
    pub fn handle_external_write(&mut self, write: BusWrite) -> bool {
        match self.bus.write_from_bus(&write.path, write.value) {
            Ok(true) => true,
            Ok(false) => {
                info!(path = %write.path, "Rejected bus write to read-only path");
                false
            }
            Err(e) => {
                warn!(error = %e, "Ignoring bus write");
                false
            }
        }
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn update_index(&self) -> u8 {
        self.update_index.value()
    }
}

fn register_identity<B: BusService>(bus: &mut B, identity: &DeviceIdentity) -> Result<(), BusError> {
    // Management objects, as specified in the ccgx dbus-api document
    bus.add_path("/Mgmt/ProcessName", env!("CARGO_PKG_NAME").into())?;
    bus.add_path(
        "/Mgmt/ProcessVersion",
        format!("{} (Rust)", env!("CARGO_PKG_VERSION")).into(),
    )?;
    bus.add_path("/Mgmt/Connection", identity.connection.as_str().into())?;

    // Mandatory objects
    bus.add_path("/DeviceInstance", identity.device_instance.into())?;
    bus.add_path("/ProductId", identity.product_id.into())?;
    bus.add_path("/ProductName", identity.product_name.as_str().into())?;
    bus.add_path("/FirmwareVersion", identity.firmware_version.into())?;
    bus.add_path("/HardwareVersion", identity.hardware_version.into())?;
    bus.add_path("/Connected", BusValue::Int(1))?;
    Ok(())
}

/// Data paths are informational mirrors, so every external write is accepted.
pub fn accept_change(path: &str, value: &BusValue) -> bool {
    debug!("someone else updated {path} to {value}");
    true
}
