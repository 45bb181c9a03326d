//! Agent-side view of one driver: address negotiation and traffic fan-out.
//!
//! A `DriverLink` owns the agent's record of a driver's address table. It
//! translates device addresses into compact topic ids, groups them by
//! consuming device with a polling cadence, and replays configuration and
//! addresses whenever the driver announces `READY`.

use crate::broker::{DriverBroker, DriverEvent};
use edgelink_common::topic::MessageKind;
use bytes::Bytes;
use rand::Rng;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Notifications surfaced to the agent.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// The driver reached `UP`.
    Open,
    /// The driver left `UP`.
    Close,
    /// A data value arrived, mapped back to its device address.
    Data { address: String, payload: Bytes },
}

#[derive(Debug, Clone)]
struct AddrGroup {
    poll: u64,
    addrs: BTreeSet<String>,
}

#[derive(Serialize)]
struct AddrPacket<'a> {
    version: u32,
    addrs: &'a HashMap<String, String>,
    groups: BTreeMap<&'a str, GroupPacket<'a>>,
}

#[derive(Serialize)]
struct GroupPacket<'a> {
    poll: u64,
    addrs: &'a BTreeSet<String>,
}

pub struct DriverLink {
    id: String,
    conf: serde_json::Value,
    broker: DriverBroker,
    status: String,
    /// topic id -> device address
    addrs: HashMap<String, String>,
    /// device address -> topic id
    topics: HashMap<String, String>,
    /// consuming device -> polling group
    groups: HashMap<String, AddrGroup>,
    events: mpsc::UnboundedSender<LinkEvent>,
}

impl DriverLink {
    pub fn new(
        id: impl Into<String>,
        conf: serde_json::Value,
        broker: DriverBroker,
    ) -> (Self, mpsc::UnboundedReceiver<LinkEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                id: id.into(),
                conf,
                broker,
                status: "DOWN".to_string(),
                addrs: HashMap::new(),
                topics: HashMap::new(),
                groups: HashMap::new(),
                events,
            },
            rx,
        )
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    /// Announce the agent to the driver. Negotiation continues when the
    /// driver publishes `READY`.
    pub fn open(&self) {
        info!(driver = %self.id, "Opening driver link");
        self.broker.publish(
            &self.id,
            MessageKind::Active,
            None,
            Bytes::from_static(b"ONLINE"),
        );
    }

    pub fn close(&mut self) {
        self.broker.publish(
            &self.id,
            MessageKind::Active,
            None,
            Bytes::from_static(b"OFFLINE"),
        );
        if self.status == "UP" {
            let _ = self.events.send(LinkEvent::Close);
        }
    }

    /// Register the addresses one device wants polled at `poll_ms`.
    ///
    /// Unseen addresses get fresh topic ids; ids already negotiated are
    /// kept so in-flight poll results stay attributable. The updated table
    /// is pushed to the driver unless it is still `DOWN`.
    pub fn assign(&mut self, device: &str, poll_ms: u64, addresses: &[String]) {
        for address in addresses {
            if !self.topics.contains_key(address) {
                let id = self.new_topic_id();
                self.addrs.insert(id.clone(), address.clone());
                self.topics.insert(address.clone(), id);
            }
        }

        let addrs = addresses
            .iter()
            .map(|a| self.topics[a].clone())
            .collect::<BTreeSet<_>>();
        self.groups.insert(
            device.to_string(),
            AddrGroup {
                poll: poll_ms,
                addrs,
            },
        );

        if self.status != "DOWN" {
            self.send_addrs();
        }
    }

    /// Ask the driver to read the given addresses now.
    pub fn poll(&self, addresses: &[String]) {
        let topics = addresses
            .iter()
            .filter_map(|a| self.topics.get(a))
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n");
        self.broker
            .publish(&self.id, MessageKind::Poll, None, Bytes::from(topics));
    }

    /// Send a named command to the driver.
    pub fn command(&self, name: &str, payload: Bytes) {
        self.broker
            .publish(&self.id, MessageKind::Cmd, Some(name), payload);
    }

    /// Consume one broker event; events for other drivers are ignored.
    pub fn handle_event(&mut self, event: &DriverEvent) {
        if event.driver != self.id {
            return;
        }
        match event.kind {
            MessageKind::Status => {
                let status = String::from_utf8_lossy(&event.payload).to_string();
                self.on_status(status);
            }
            MessageKind::Data => {
                if let Some(data_id) = &event.data {
                    self.on_data(data_id, event.payload.clone());
                }
            }
            MessageKind::Err => {
                warn!(
                    driver = %self.id,
                    data = event.data.as_deref().unwrap_or(""),
                    error = %String::from_utf8_lossy(&event.payload),
                    "Driver reported error"
                );
            }
            // Our own control messages are looped back by the dispatch.
            MessageKind::Active
            | MessageKind::Conf
            | MessageKind::Addr
            | MessageKind::Cmd
            | MessageKind::Poll => {}
        }
    }

    fn on_status(&mut self, status: String) {
        let old = std::mem::replace(&mut self.status, status.clone());
        info!(driver = %self.id, from = %old, to = %status, "Driver status");

        match status.as_str() {
            "READY" => {
                // Fresh driver session: replay configuration and addresses.
                let conf = serde_json::to_vec(&self.conf).unwrap_or_default();
                self.broker
                    .publish(&self.id, MessageKind::Conf, None, Bytes::from(conf));
                self.send_addrs();
            }
            "UP" => {
                if old != "UP" {
                    let _ = self.events.send(LinkEvent::Open);
                }
            }
            "DOWN" | "CONF" | "CONN" | "AUTH" | "ADDR" | "ERR" => {
                if old == "UP" {
                    let _ = self.events.send(LinkEvent::Close);
                }
            }
            other => warn!(driver = %self.id, status = %other, "Unknown driver status"),
        }
    }

    fn on_data(&self, data_id: &str, payload: Bytes) {
        match self.addrs.get(data_id) {
            Some(address) => {
                let _ = self.events.send(LinkEvent::Data {
                    address: address.clone(),
                    payload,
                });
            }
            None => debug!(driver = %self.id, data_id, "Data for unknown topic id"),
        }
    }

    /// Publish the full address table so the driver can reconcile.
    fn send_addrs(&self) {
        let packet = AddrPacket {
            version: 1,
            addrs: &self.addrs,
            groups: self
                .groups
                .iter()
                .map(|(device, group)| {
                    (
                        device.as_str(),
                        GroupPacket {
                            poll: group.poll,
                            addrs: &group.addrs,
                        },
                    )
                })
                .collect(),
        };
        let payload = serde_json::to_vec(&packet).unwrap_or_default();
        self.broker
            .publish(&self.id, MessageKind::Addr, None, Bytes::from(payload));
    }

    /// Short random numeric ids; collisions retry against the live table
    /// so an id is never reused within a table's lifetime.
    fn new_topic_id(&self) -> String {
        let mut rng = rand::thread_rng();
        loop {
            let id = rng.gen_range(0..100_000u32).to_string();
            if !self.addrs.contains_key(&id) {
                return id;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::BrokerConfig;
    use edgelink_common::BrokerUrl;

    fn test_broker() -> DriverBroker {
        DriverBroker::new(BrokerConfig {
            url: BrokerUrl::parse("mqtt://127.0.0.1:0").unwrap(),
            passwords: "/nonexistent".into(),
            debug_user: None,
        })
    }

    fn status_event(driver: &str, status: &str) -> DriverEvent {
        DriverEvent {
            driver: driver.into(),
            kind: MessageKind::Status,
            data: None,
            payload: Bytes::copy_from_slice(status.as_bytes()),
        }
    }

    #[tokio::test]
    async fn assign_generates_unique_topic_ids() {
        let broker = test_broker();
        let (mut link, _events) = DriverLink::new("plcA", serde_json::json!({}), broker);

        let addresses: Vec<String> = (0..50).map(|i| format!("3,holding,{i},1")).collect();
        link.assign("devX", 1000, &addresses);

        assert_eq!(link.addrs.len(), 50);
        assert_eq!(link.topics.len(), 50);
        // Reassigning the same addresses must not mint new ids.
        link.assign("devX", 2000, &addresses);
        assert_eq!(link.addrs.len(), 50);
        assert_eq!(link.groups["devX"].poll, 2000);
    }

    #[tokio::test]
    async fn ready_replays_conf_and_addrs() {
        let broker = test_broker();
        let mut bus = broker.subscribe_events();
        let (mut link, _events) =
            DriverLink::new("plcA", serde_json::json!({"host": "10.0.0.5"}), broker);
        link.assign("devX", 1000, &["a1".to_string()]);

        link.handle_event(&status_event("plcA", "READY"));

        // First the configuration...
        let conf = bus.recv().await.unwrap();
        assert_eq!(conf.kind, MessageKind::Conf);
        let parsed: serde_json::Value = serde_json::from_slice(&conf.payload).unwrap();
        assert_eq!(parsed["host"], "10.0.0.5");

        // ...then the full address table.
        let addr = bus.recv().await.unwrap();
        assert_eq!(addr.kind, MessageKind::Addr);
        let parsed: serde_json::Value = serde_json::from_slice(&addr.payload).unwrap();
        assert_eq!(parsed["version"], 1);
        let topic_id = link.topics["a1"].clone();
        assert_eq!(parsed["addrs"][&topic_id], "a1");
        assert_eq!(parsed["groups"]["devX"]["poll"], 1000);
        assert_eq!(parsed["groups"]["devX"]["addrs"][0], topic_id);
    }

    #[tokio::test]
    async fn data_maps_back_to_address() {
        let broker = test_broker();
        let (mut link, mut events) = DriverLink::new("plcA", serde_json::json!({}), broker);
        link.assign("devX", 1000, &["a1".to_string()]);
        let topic_id = link.topics["a1"].clone();

        link.handle_event(&DriverEvent {
            driver: "plcA".into(),
            kind: MessageKind::Data,
            data: Some(topic_id),
            payload: Bytes::from_static(b"\x00\x2a"),
        });

        let event = events.try_recv().unwrap();
        assert_eq!(
            event,
            LinkEvent::Data {
                address: "a1".into(),
                payload: Bytes::from_static(b"\x00\x2a"),
            }
        );

        // Unknown topic ids are dropped silently.
        link.handle_event(&DriverEvent {
            driver: "plcA".into(),
            kind: MessageKind::Data,
            data: Some("99999999".into()),
            payload: Bytes::new(),
        });
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn up_and_down_emit_open_close() {
        let broker = test_broker();
        let (mut link, mut events) = DriverLink::new("plcA", serde_json::json!({}), broker);

        link.handle_event(&status_event("plcA", "UP"));
        assert_eq!(events.try_recv().unwrap(), LinkEvent::Open);

        // A repeated UP is not a new open.
        link.handle_event(&status_event("plcA", "UP"));
        assert!(events.try_recv().is_err());

        link.handle_event(&status_event("plcA", "CONN"));
        assert_eq!(events.try_recv().unwrap(), LinkEvent::Close);
    }

    #[tokio::test]
    async fn events_for_other_drivers_are_ignored() {
        let broker = test_broker();
        let (mut link, mut events) = DriverLink::new("plcA", serde_json::json!({}), broker);
        link.handle_event(&status_event("plcB", "UP"));
        assert!(events.try_recv().is_err());
        assert_eq!(link.status(), "DOWN");
    }
}
