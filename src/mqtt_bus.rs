//! MQTT transport for the bus, following the Venus OS dbus-mqtt layout:
//! values are announced retained on `N/<portal>/<type>/<instance><path>` and
//! other participants write through `W/<portal>/<type>/<instance><path>`,
//! both carrying `{"value": ...}`.

use crate::bus::{BusService, BusValue, BusWrite, ChangeCallback, LocalBus};
use crate::error::BusError;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, Publish, QoS};
use serde_derive::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::time::sleep;
use tracing::{debug, info, warn};

const REQUEST_QUEUE: usize = 64;
const WRITE_QUEUE: usize = 32;
const VICTRON_PREFIX: &str = "com.victronenergy.";

#[derive(Debug, Clone, PartialEq)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Topics {
    notify_prefix: String,
    write_prefix: String,
}

impl Topics {
    /// The topic's service type is the third segment of the bus service name
    /// (`com.victronenergy.grid.cgwacs_ttyUSB0_mb1` → `grid`). Names outside
    /// the `com.victronenergy.` namespace announce as `grid`.
    pub fn new(portal_id: &str, service_name: &str, device_instance: u32) -> Self {
        let service_type = service_name
            .strip_prefix(VICTRON_PREFIX)
            .and_then(|rest| rest.split('.').next())
            .filter(|kind| !kind.is_empty())
            .unwrap_or("grid");
        Self {
            notify_prefix: format!("N/{portal_id}/{service_type}/{device_instance}"),
            write_prefix: format!("W/{portal_id}/{service_type}/{device_instance}"),
        }
    }

    pub fn notify(&self, path: &str) -> String {
        format!("{}{}", self.notify_prefix, path)
    }

    pub fn write_subscription(&self) -> String {
        format!("{}/#", self.write_prefix)
    }

    /// Returns the bus path addressed by a write topic, if it is one of ours.
    pub fn path_of_write<'a>(&self, topic: &'a str) -> Option<&'a str> {
        topic
            .strip_prefix(self.write_prefix.as_str())
            .filter(|path| path.starts_with('/'))
    }
}

#[derive(Serialize)]
struct ValuePayload<'a> {
    value: &'a BusValue,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WritePayload {
    Wrapped { value: BusValue },
    Bare(BusValue),
}

pub fn encode_value(value: &BusValue) -> Result<Vec<u8>, BusError> {
    serde_json::to_vec(&ValuePayload { value }).map_err(|e| BusError::InvalidPayload(e.to_string()))
}

pub fn decode_write(payload: &[u8]) -> Result<BusValue, BusError> {
    match serde_json::from_slice(payload) {
        Ok(WritePayload::Wrapped { value }) | Ok(WritePayload::Bare(value)) => Ok(value),
        Err(e) => Err(BusError::InvalidPayload(e.to_string())),
    }
}

/// Requests handed to the MQTT client. Both calls must return immediately.
pub trait MqttLink {
    fn publish_retained(&self, topic: String, payload: Vec<u8>) -> Result<(), BusError>;

    fn subscribe_filter(&self, filter: String) -> Result<(), BusError>;
}

impl MqttLink for AsyncClient {
    fn publish_retained(&self, topic: String, payload: Vec<u8>) -> Result<(), BusError> {
        self.try_publish(topic, QoS::AtMostOnce, true, payload)
            .map_err(|e| BusError::Publish(e.to_string()))
    }

    fn subscribe_filter(&self, filter: String) -> Result<(), BusError> {
        self.try_subscribe(filter, QoS::AtLeastOnce)
            .map_err(|e| BusError::Publish(e.to_string()))
    }
}

/// Bus service that keeps its values in a [`LocalBus`] and mirrors them to MQTT.
///
/// A value the client refuses (request queue full while the broker is away)
/// stays pending and is sent again on the next change or [`BusService::flush`].
/// After every (re)connect all paths are announced again, since a broker
/// restart may have lost the retained values.
pub struct MqttBus<L = AsyncClient> {
    local: LocalBus,
    link: L,
    topics: Topics,
    pending: BTreeSet<String>,
    resync: Arc<AtomicBool>,
}

impl MqttBus<AsyncClient> {
    /// Creates the client and spawns the task driving its event loop.
    /// External writes arrive on the returned receiver.
    pub fn connect(
        settings: &MqttSettings,
        service_name: &str,
        portal_id: &str,
        device_instance: u32,
    ) -> (Self, Receiver<BusWrite>) {
        let client_id = format!("{}-{}", env!("CARGO_PKG_NAME"), device_instance);
        let mut options = MqttOptions::new(client_id, settings.host.clone(), settings.port);
        options.set_keep_alive(settings.keep_alive);
        if let (Some(u), Some(p)) = (&settings.username, &settings.password) {
            options.set_credentials(u.clone(), p.clone());
        }
        let topics = Topics::new(portal_id, service_name, device_instance);
        info!(
            host = %settings.host,
            port = settings.port,
            topic = %topics.notify(""),
            "Connecting to MQTT broker"
        );

        let (client, eventloop) = AsyncClient::new(options, REQUEST_QUEUE);
        let (write_tx, write_rx) = mpsc::channel(WRITE_QUEUE);
        let resync = Arc::new(AtomicBool::new(false));

        let loop_client = client.clone();
        let loop_topics = topics.clone();
        let loop_resync = resync.clone();
        tokio::spawn(async move {
            drive_event_loop(eventloop, loop_client, loop_topics, loop_resync, write_tx).await;
        });

        (Self::with_link(client, topics, resync), write_rx)
    }
}

impl<L: MqttLink> MqttBus<L> {
    /// `resync` is raised by the connection side to request a full republish.
    pub fn with_link(link: L, topics: Topics, resync: Arc<AtomicBool>) -> Self {
        Self {
            local: LocalBus::new(),
            link,
            topics,
            pending: BTreeSet::new(),
            resync,
        }
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    /// Paths whose current value has not reached the client yet.
    pub fn pending(&self) -> impl Iterator<Item = &str> {
        self.pending.iter().map(String::as_str)
    }

    fn publish(&mut self, path: &str) {
        let result = match self.local.value(path) {
            Some(value) => encode_value(value).and_then(|payload| {
                // Never wait on the broker from inside a polling cycle
                self.link.publish_retained(self.topics.notify(path), payload)
            }),
            None => return,
        };
        match result {
            Ok(()) => {
                self.pending.remove(path);
            }
            Err(e) => {
                debug!(path, error = %e, "MQTT publish deferred");
                self.pending.insert(path.to_string());
            }
        }
    }
}

impl<L: MqttLink> BusService for MqttBus<L> {
    fn add_path(&mut self, path: &str, initial: BusValue) -> Result<(), BusError> {
        self.local.add_path(path, initial)?;
        self.publish(path);
        Ok(())
    }

    fn add_writable_path(
        &mut self,
        path: &str,
        initial: BusValue,
        on_change: ChangeCallback,
    ) -> Result<(), BusError> {
        self.local.add_writable_path(path, initial, on_change)?;
        self.publish(path);
        Ok(())
    }

    fn set_value(&mut self, path: &str, value: BusValue) -> Result<(), BusError> {
        if self.local.replace(path, value)? || self.pending.contains(path) {
            self.publish(path);
        }
        Ok(())
    }

    fn value(&self, path: &str) -> Option<&BusValue> {
        self.local.value(path)
    }

    fn write_from_bus(&mut self, path: &str, value: BusValue) -> Result<bool, BusError> {
        let accepted = self.local.write_from_bus(path, value)?;
        if accepted {
            self.publish(path);
        }
        Ok(accepted)
    }

    fn flush(&mut self) {
        if self.resync.swap(false, Ordering::Relaxed) {
            info!("Announcing all paths to the MQTT broker");
            self.pending
                .extend(self.local.paths().map(|(path, _)| path.to_string()));
        }
        let paths: Vec<String> = self.pending.iter().cloned().collect();
        for path in paths {
            self.publish(&path);
        }
    }
}

async fn drive_event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    topics: Topics,
    resync: Arc<AtomicBool>,
    writes: Sender<BusWrite>,
) {
    loop {
        match eventloop.poll().await {
            Ok(event) => {
                let Some(write) = handle_event(event, &client, &topics, &resync) else {
                    continue;
                };
                if writes.send(write).await.is_err() {
                    info!("Bridge stopped, closing MQTT event loop");
                    return;
                }
            }
            Err(e) => {
                warn!(error = %e, "MQTT connection error, retrying");
                sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Reacts to one event of the MQTT connection and returns the external write
/// it carried, if any.
fn handle_event<L: MqttLink>(
    event: Event,
    link: &L,
    topics: &Topics,
    resync: &AtomicBool,
) -> Option<BusWrite> {
    match event {
        Event::Incoming(Packet::ConnAck(_)) => {
            info!("Connected to MQTT broker");
            // Subscriptions do not survive a clean-session reconnect
            if let Err(e) = link.subscribe_filter(topics.write_subscription()) {
                warn!(error = %e, "Can't subscribe to bus writes");
            }
            resync.store(true, Ordering::Relaxed);
            None
        }
        Event::Incoming(Packet::Publish(publish)) => match incoming_write(topics, &publish)? {
            Ok(write) => Some(write),
            Err(e) => {
                warn!(topic = %publish.topic, error = %e, "Ignoring bus write");
                None
            }
        },
        _ => None,
    }
}

/// `None` for topics outside our write prefix.
fn incoming_write(topics: &Topics, publish: &Publish) -> Option<Result<BusWrite, BusError>> {
    let path = topics.path_of_write(&publish.topic)?;
    Some(decode_write(&publish.payload).map(|value| BusWrite {
        path: path.to_string(),
        value,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::{ConnAck, ConnectReturnCode, Outgoing};
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    const SERVICE: &str = "com.victronenergy.grid.cgwacs_ttyUSB0_mb1";

    /// Client stand-in that refuses every request while offline.
    struct FakeBroker {
        online: Cell<bool>,
        published: RefCell<Vec<(String, String)>>,
        subscriptions: RefCell<Vec<String>>,
    }

    impl FakeBroker {
        fn new() -> Rc<Self> {
            Rc::new(Self {
                online: Cell::new(true),
                published: RefCell::new(Vec::new()),
                subscriptions: RefCell::new(Vec::new()),
            })
        }

        fn last(&self, topic: &str) -> Option<String> {
            self.published
                .borrow()
                .iter()
                .rev()
                .find(|(t, _)| t == topic)
                .map(|(_, payload)| payload.clone())
        }

        fn count(&self) -> usize {
            self.published.borrow().len()
        }
    }

    impl MqttLink for Rc<FakeBroker> {
        fn publish_retained(&self, topic: String, payload: Vec<u8>) -> Result<(), BusError> {
            if !self.online.get() {
                return Err(BusError::Publish("request queue full".to_string()));
            }
            let payload = String::from_utf8(payload).unwrap();
            self.published.borrow_mut().push((topic, payload));
            Ok(())
        }

        fn subscribe_filter(&self, filter: String) -> Result<(), BusError> {
            self.subscriptions.borrow_mut().push(filter);
            Ok(())
        }
    }

    fn bus_on(broker: &Rc<FakeBroker>) -> (MqttBus<Rc<FakeBroker>>, Arc<AtomicBool>) {
        let resync = Arc::new(AtomicBool::new(false));
        let bus = MqttBus::with_link(
            broker.clone(),
            Topics::new("fronius", SERVICE, 0),
            resync.clone(),
        );
        (bus, resync)
    }

    fn accept_all() -> ChangeCallback {
        Box::new(|_, _| true)
    }

    fn write_event(topic: &str, payload: &[u8]) -> Event {
        Event::Incoming(Packet::Publish(Publish::new(
            topic,
            QoS::AtLeastOnce,
            payload.to_vec(),
        )))
    }

    #[test]
    fn test_topics() {
        let topics = Topics::new("fronius", SERVICE, 40);
        assert_eq!(topics.notify("/Ac/Power"), "N/fronius/grid/40/Ac/Power");
        assert_eq!(topics.write_subscription(), "W/fronius/grid/40/#");
    }

    #[test]
    fn test_service_type_follows_service_name() {
        let topics = Topics::new("fronius", "com.victronenergy.acload.fronius_1", 3);
        assert_eq!(topics.notify("/Ac/Power"), "N/fronius/acload/3/Ac/Power");

        let topics = Topics::new("fronius", "my.own.meter", 3);
        assert_eq!(topics.notify("/Ac/Power"), "N/fronius/grid/3/Ac/Power");
    }

    #[test]
    fn test_path_of_write() {
        let topics = Topics::new("fronius", SERVICE, 0);
        assert_eq!(
            topics.path_of_write("W/fronius/grid/0/Ac/L2/Current"),
            Some("/Ac/L2/Current")
        );
        // Instance 0 must not match instance 01
        assert_eq!(topics.path_of_write("W/fronius/grid/01/Ac/Power"), None);
        assert_eq!(topics.path_of_write("N/fronius/grid/0/Ac/Power"), None);
    }

    #[test]
    fn test_encode_value() {
        assert_eq!(
            encode_value(&BusValue::Float(-500.0)).unwrap(),
            br#"{"value":-500.0}"#.to_vec()
        );
        assert_eq!(
            encode_value(&BusValue::from("Fronius Smart Meter")).unwrap(),
            br#"{"value":"Fronius Smart Meter"}"#.to_vec()
        );
    }

    #[test]
    fn test_decode_wrapped_and_bare_writes() {
        assert_eq!(decode_write(br#"{"value": 231.5}"#).unwrap(), BusValue::Float(231.5));
        assert_eq!(decode_write(b"7").unwrap(), BusValue::Int(7));
        assert_eq!(decode_write(br#""x""#).unwrap(), BusValue::from("x"));
    }

    #[test]
    fn test_decode_invalid_write() {
        assert!(matches!(
            decode_write(b"{not json"),
            Err(BusError::InvalidPayload(_))
        ));
        assert!(decode_write(br#"{"other": 1}"#).is_err());
    }

    #[test]
    fn test_registration_publishes_retained_values() {
        let broker = FakeBroker::new();
        let (mut bus, _) = bus_on(&broker);
        bus.add_path("/ProductId", 45069u32.into()).unwrap();
        bus.add_writable_path("/Ac/Power", 0u8.into(), accept_all())
            .unwrap();

        assert_eq!(
            broker.last("N/fronius/grid/0/ProductId").as_deref(),
            Some(r#"{"value":45069}"#)
        );
        assert_eq!(
            broker.last("N/fronius/grid/0/Ac/Power").as_deref(),
            Some(r#"{"value":0}"#)
        );
    }

    #[test]
    fn test_unchanged_value_is_not_republished() {
        let broker = FakeBroker::new();
        let (mut bus, _) = bus_on(&broker);
        bus.add_writable_path("/Ac/Power", 0u8.into(), accept_all())
            .unwrap();
        bus.set_value("/Ac/Power", 1730.0.into()).unwrap();
        let sent = broker.count();

        bus.set_value("/Ac/Power", 1730.0.into()).unwrap();
        assert_eq!(broker.count(), sent);
    }

    #[test]
    fn test_refused_publish_is_sent_on_next_set() {
        let broker = FakeBroker::new();
        let (mut bus, _) = bus_on(&broker);
        bus.add_writable_path("/Ac/Power", 0u8.into(), accept_all())
            .unwrap();
        bus.set_value("/Ac/Power", 1730.0.into()).unwrap();

        // Broker away: the fallback 0 W is stored but cannot be sent
        broker.online.set(false);
        bus.set_value("/Ac/Power", 0.0.into()).unwrap();
        assert_eq!(bus.value("/Ac/Power"), Some(&BusValue::Float(0.0)));
        assert_eq!(bus.pending().collect::<Vec<_>>(), vec!["/Ac/Power"]);
        assert_eq!(
            broker.last("N/fronius/grid/0/Ac/Power").as_deref(),
            Some(r#"{"value":1730.0}"#)
        );

        // Broker back while the meter is still down: the same value goes out
        broker.online.set(true);
        bus.set_value("/Ac/Power", 0.0.into()).unwrap();
        assert_eq!(
            broker.last("N/fronius/grid/0/Ac/Power").as_deref(),
            Some(r#"{"value":0.0}"#)
        );
        assert_eq!(bus.pending().count(), 0);
    }

    #[test]
    fn test_flush_retries_pending_paths() {
        let broker = FakeBroker::new();
        broker.online.set(false);
        let (mut bus, _) = bus_on(&broker);
        bus.add_path("/Connected", 1u8.into()).unwrap();
        bus.add_path("/ProductId", 45069u32.into()).unwrap();
        assert_eq!(bus.pending().count(), 2);

        bus.flush();
        assert_eq!(bus.pending().count(), 2);

        broker.online.set(true);
        bus.flush();
        assert_eq!(bus.pending().count(), 0);
        assert_eq!(
            broker.last("N/fronius/grid/0/Connected").as_deref(),
            Some(r#"{"value":1}"#)
        );
        assert!(broker.last("N/fronius/grid/0/ProductId").is_some());
    }

    #[test]
    fn test_connack_subscribes_and_requests_full_republish() {
        let broker = FakeBroker::new();
        let (mut bus, resync) = bus_on(&broker);
        bus.add_path("/ProductName", "Fronius Smart Meter".into())
            .unwrap();
        bus.add_writable_path("/Ac/Power", 0u8.into(), accept_all())
            .unwrap();
        broker.published.borrow_mut().clear();

        let connack = Event::Incoming(Packet::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::Success,
        }));
        assert_eq!(handle_event(connack, &broker, bus.topics(), &resync), None);
        assert_eq!(*broker.subscriptions.borrow(), vec!["W/fronius/grid/0/#"]);
        assert!(resync.load(Ordering::Relaxed));

        bus.flush();
        assert!(!resync.load(Ordering::Relaxed));
        assert_eq!(broker.count(), 2);
        assert_eq!(
            broker.last("N/fronius/grid/0/ProductName").as_deref(),
            Some(r#"{"value":"Fronius Smart Meter"}"#)
        );

        // Nothing left to announce on the next cycle
        bus.flush();
        assert_eq!(broker.count(), 2);
    }

    #[test]
    fn test_write_on_our_topic_is_forwarded() {
        let broker = FakeBroker::new();
        let topics = Topics::new("fronius", SERVICE, 0);
        let resync = AtomicBool::new(false);

        let write = handle_event(
            write_event("W/fronius/grid/0/Ac/L1/Voltage", br#"{"value": 231.5}"#),
            &broker,
            &topics,
            &resync,
        );
        assert_eq!(
            write,
            Some(BusWrite {
                path: "/Ac/L1/Voltage".to_string(),
                value: BusValue::Float(231.5),
            })
        );
        assert!(!resync.load(Ordering::Relaxed));
    }

    #[test]
    fn test_foreign_topics_and_bad_payloads_are_ignored() {
        let broker = FakeBroker::new();
        let topics = Topics::new("fronius", SERVICE, 0);
        let resync = AtomicBool::new(false);

        let other_device = write_event("W/fronius/grid/1/Ac/Power", b"5");
        assert_eq!(handle_event(other_device, &broker, &topics, &resync), None);

        let garbage = write_event("W/fronius/grid/0/Ac/Power", b"{not json");
        assert_eq!(handle_event(garbage, &broker, &topics, &resync), None);

        let ping = Event::Outgoing(Outgoing::PingReq);
        assert_eq!(handle_event(ping, &broker, &topics, &resync), None);
        assert!(broker.subscriptions.borrow().is_empty());
    }

    #[test]
    fn test_incoming_write() {
        let topics = Topics::new("fronius", SERVICE, 0);

        let publish = Publish::new("W/fronius/grid/0/Ac/Power", QoS::AtMostOnce, b"12".to_vec());
        let write = incoming_write(&topics, &publish).unwrap().unwrap();
        assert_eq!(write.path, "/Ac/Power");
        assert_eq!(write.value, BusValue::Int(12));

        let publish = Publish::new("W/fronius/grid/0/Ac/Power", QoS::AtMostOnce, b"nope".to_vec());
        assert!(matches!(
            incoming_write(&topics, &publish),
            Some(Err(BusError::InvalidPayload(_)))
        ));

        let publish = Publish::new("N/fronius/grid/0/Ac/Power", QoS::AtMostOnce, b"12".to_vec());
        assert!(incoming_write(&topics, &publish).is_none());
    }

    #[tokio::test]
    async fn test_values_are_kept_without_a_broker() {
        let settings = MqttSettings {
            host: "127.0.0.1".to_string(),
            port: 9,
            username: None,
            password: None,
            keep_alive: Duration::from_secs(30),
        };
        let (mut bus, _writes) = MqttBus::connect(&settings, SERVICE, "test", 0);

        bus.add_writable_path("/Ac/Power", 0u8.into(), accept_all())
            .unwrap();
        bus.set_value("/Ac/Power", 420.0.into()).unwrap();
        assert_eq!(bus.value("/Ac/Power"), Some(&BusValue::Float(420.0)));

        assert!(bus.write_from_bus("/Ac/Power", 1.0.into()).unwrap());
        assert_eq!(bus.value("/Ac/Power"), Some(&BusValue::Float(1.0)));
        assert_eq!(bus.topics().notify("/Ac/Power"), "N/test/grid/0/Ac/Power");
    }
}
