//! Normalised meter measurements, built fresh from every realtime response.

use crate::error::FetchError;
use crate::fronius_api::MeterRealtimeData;
use serde_derive::{Deserialize, Serialize};
use std::str::FromStr;

/// Model string reported by the single-phase Fronius meter.
pub const DEFAULT_SINGLE_PHASE_MODEL: &str = "Smart Meter 63A-1";

/// Unit the meter firmware uses for its cumulative energy counters.
/// The bus always expects kWh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnergyUnit {
    Wh,
    KWh,
}

impl EnergyUnit {
    pub fn to_kwh(self, raw: f64) -> f64 {
        match self {
            EnergyUnit::Wh => raw / 1000.0,
            EnergyUnit::KWh => raw,
        }
    }
}

impl FromStr for EnergyUnit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "wh" => Ok(EnergyUnit::Wh),
            "kwh" => Ok(EnergyUnit::KWh),
            other => Err(format!("unknown energy unit `{other}`, expected wh or kwh")),
        }
    }
}

/// Per-deployment knowledge about the meter hardware and firmware.
#[derive(Debug, Clone, PartialEq)]
pub struct MeterProfile {
    pub energy_unit: EnergyUnit,
    pub single_phase_model: String,
}

impl Default for MeterProfile {
    fn default() -> Self {
        Self {
            energy_unit: EnergyUnit::Wh,
            single_phase_model: DEFAULT_SINGLE_PHASE_MODEL.to_string(),
        }
    }
}

impl MeterProfile {
    pub fn is_single_phase(&self, model: Option<&str>) -> bool {
        model.is_some_and(|m| m.trim() == self.single_phase_model.trim())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseReading {
    pub voltage: f64,
    pub current: f64,
    pub power: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeterReading {
    /// Positive: consumption from the grid, negative: feed into the grid
    pub total_power: f64,
    pub phases: [PhaseReading; 3],
    pub energy_forward: f64,
    pub energy_reverse: f64,
    pub model: Option<String>,
}

impl MeterReading {
    pub fn from_realtime_data(
        data: &MeterRealtimeData,
        profile: &MeterProfile,
    ) -> Result<Self, FetchError> {
        let model = data.details.as_ref().and_then(|d| d.model.clone());
        let single_phase = profile.is_single_phase(model.as_deref());

        let l1 = PhaseReading {
            voltage: require(data.voltage_ac_phase_1, "Body.Data.Voltage_AC_Phase_1")?,
            current: require(data.current_ac_phase_1, "Body.Data.Current_AC_Phase_1")?,
            power: require(data.power_real_p_phase_1, "Body.Data.PowerReal_P_Phase_1")?,
        };
        // L2 and L3 do not exist on the single-phase meter, whatever it reports
        let (l2, l3) = if single_phase {
            (PhaseReading::default(), PhaseReading::default())
        } else {
            (
                PhaseReading {
                    voltage: require(data.voltage_ac_phase_2, "Body.Data.Voltage_AC_Phase_2")?,
                    current: require(data.current_ac_phase_2, "Body.Data.Current_AC_Phase_2")?,
                    power: require(data.power_real_p_phase_2, "Body.Data.PowerReal_P_Phase_2")?,
                },
                PhaseReading {
                    voltage: require(data.voltage_ac_phase_3, "Body.Data.Voltage_AC_Phase_3")?,
                    current: require(data.current_ac_phase_3, "Body.Data.Current_AC_Phase_3")?,
                    power: require(data.power_real_p_phase_3, "Body.Data.PowerReal_P_Phase_3")?,
                },
            )
        };

        let consumed = require(
            data.energy_real_wac_sum_consumed,
            "Body.Data.EnergyReal_WAC_Sum_Consumed",
        )?;
        let produced = require(
            data.energy_real_wac_sum_produced,
            "Body.Data.EnergyReal_WAC_Sum_Produced",
        )?;

        Ok(Self {
            total_power: require(data.power_real_p_sum, "Body.Data.PowerReal_P_Sum")?,
            phases: [l1, l2, l3],
            energy_forward: profile.energy_unit.to_kwh(consumed),
            energy_reverse: profile.energy_unit.to_kwh(produced),
            model,
        })
    }
}

fn require(value: Option<f64>, field: &'static str) -> Result<f64, FetchError> {
    value.ok_or(FetchError::MissingField(field))
}
