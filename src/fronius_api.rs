use crate::error::FetchError;
use serde_derive::{Deserialize, Serialize};
use std::time::Duration;

const REALTIME_DATA_PATH: &str = "/solar_api/v1/GetMeterRealtimeData.cgi";

/// HTTP client for the Fronius Solar API meter endpoint.
pub struct FroniusMeter {
    base_url: String,
    device_id: u32,
    client: reqwest::Client,
}

impl FroniusMeter {
    pub fn new(base_url: &str, device_id: u32, timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            device_id,
            client,
        })
    }

    pub fn realtime_data_url(&self) -> String {
        format!(
            "{}{}?Scope=Device&DeviceId={}&DataCollection=MeterRealtimeData",
            self.base_url, REALTIME_DATA_PATH, self.device_id
        )
    }

    /// Performs one GET against the meter and returns the `Body.Data` object.
    pub async fn read_realtime_data(&self) -> Result<MeterRealtimeData, FetchError> {
        let device_id = self.device_id.to_string();
        let response = self
            .client
            .get(format!("{}{}", self.base_url, REALTIME_DATA_PATH))
            .query(&[
                ("Scope", "Device"),
                ("DeviceId", device_id.as_str()),
                ("DataCollection", "MeterRealtimeData"),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status));
        }
        let body = response.bytes().await?;
        let parsed: MeterRealtimeResponse = serde_json::from_slice(&body)?;
        parsed.into_data()
    }
}

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MeterRealtimeResponse {
    pub head: Option<ResponseHead>,
    pub body: Option<ResponseBody>,
}

impl MeterRealtimeResponse {
    pub fn into_data(self) -> Result<MeterRealtimeData, FetchError> {
        if let Some(status) = self.head.and_then(|head| head.status) {
            if status.code != 0 {
                return Err(FetchError::ApiStatus {
                    code: status.code,
                    reason: status.reason.unwrap_or_default(),
                });
            }
        }
        self.body
            .ok_or(FetchError::MissingField("Body"))?
            .data
            .ok_or(FetchError::MissingField("Body.Data"))
    }
}

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResponseHead {
    pub status: Option<ResponseStatus>,
}

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResponseStatus {
    pub code: i64,
    pub reason: Option<String>,
}

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResponseBody {
    pub data: Option<MeterRealtimeData>,
}

/// Raw `Body.Data` of a realtime meter query. Every measurement is optional
/// here; which ones are required is decided when building a reading.
#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeterRealtimeData {
    #[serde(rename = "PowerReal_P_Sum")]
    pub power_real_p_sum: Option<f64>,
    #[serde(rename = "Voltage_AC_Phase_1")]
    pub voltage_ac_phase_1: Option<f64>,
    #[serde(rename = "Voltage_AC_Phase_2")]
    pub voltage_ac_phase_2: Option<f64>,
    #[serde(rename = "Voltage_AC_Phase_3")]
    pub voltage_ac_phase_3: Option<f64>,
    #[serde(rename = "Current_AC_Phase_1")]
    pub current_ac_phase_1: Option<f64>,
    #[serde(rename = "Current_AC_Phase_2")]
    pub current_ac_phase_2: Option<f64>,
    #[serde(rename = "Current_AC_Phase_3")]
    pub current_ac_phase_3: Option<f64>,
    #[serde(rename = "PowerReal_P_Phase_1")]
    pub power_real_p_phase_1: Option<f64>,
    #[serde(rename = "PowerReal_P_Phase_2")]
    pub power_real_p_phase_2: Option<f64>,
    #[serde(rename = "PowerReal_P_Phase_3")]
    pub power_real_p_phase_3: Option<f64>,
    #[serde(rename = "EnergyReal_WAC_Sum_Consumed")]
    pub energy_real_wac_sum_consumed: Option<f64>,
    #[serde(rename = "EnergyReal_WAC_Sum_Produced")]
    pub energy_real_wac_sum_produced: Option<f64>,
    #[serde(rename = "Details")]
    pub details: Option<MeterDetails>,
}

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MeterDetails {
    pub model: Option<String>,
    pub manufacturer: Option<String>,
    pub serial: Option<String>,
}
