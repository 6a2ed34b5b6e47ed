use crate::bus::{BusService, BusWrite};
use crate::config::BridgeConfig;
use crate::fronius_api::FroniusMeter;
use crate::meter_bridge::MeterBridge;
use crate::meter_reading::MeterReading;
use crate::mqtt_bus::MqttBus;
use anyhow::Context;
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc::Receiver;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::info;

/// Connects to the bus, registers the device and polls the meter until Ctrl-C.
pub async fn run(config: &BridgeConfig) -> anyhow::Result<()> {
    let meter = FroniusMeter::new(
        &config.meter_url,
        config.meter_device_id,
        config.request_timeout(),
    )?;
    let identity = config.device_identity();
    let (bus, mut writes) = MqttBus::connect(
        &config.mqtt_settings(),
        &identity.service_name,
        &config.portal_id,
        identity.device_instance,
    );
    let mut bridge = MeterBridge::new(meter, config.meter_profile(), &identity, bus)
        .context("Can't register grid meter on the bus")?;

    info!(
        interval = ?config.poll_interval(),
        "Connected to bus, switching over to the polling loop"
    );
    let shutdown = async {
        // An error here means no signal handler; keep running in that case
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };
    drive(&mut bridge, &mut writes, config.poll_interval(), shutdown).await;
    info!("Shutdown requested, stopping");
    Ok(())
}

/// The bridge's event loop: one cycle per tick, external writes in between.
/// The first cycle starts one period after the call. A cycle that overruns
/// the period delays the following ticks instead of bunching them.
pub async fn drive<B, F>(
    bridge: &mut MeterBridge<B>,
    writes: &mut Receiver<BusWrite>,
    period: Duration,
    shutdown: F,
) where
    B: BusService,
    F: Future<Output = ()>,
{
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => break,
            Some(write) = writes.recv() => {
                bridge.handle_external_write(write);
            }
            _ = ticker.tick() => {
                bridge.update().await;
            }
        }
    }
}

/// Reads the meter once and prints the normalised reading as JSON.
pub async fn snapshot(config: &BridgeConfig) -> anyhow::Result<()> {
    let meter = FroniusMeter::new(
        &config.meter_url,
        config.meter_device_id,
        config.request_timeout(),
    )?;
    let data = meter
        .read_realtime_data()
        .await
        .with_context(|| format!("Can't read {}", meter.realtime_data_url()))?;
    let reading = MeterReading::from_realtime_data(&data, &config.meter_profile())?;
    println!("{}", serde_json::to_string_pretty(&reading)?);
    Ok(())
}
