//! The driver-side state machine.
//!
//! `Driver::run` owns the broker session (rumqttc) and an inner
//! `DriverCore` that consumes control messages, handler events and
//! connect/reconnect results from channels. Keeping the machine behind
//! channels gives strict per-driver ordering and lets the whole protocol
//! be exercised in tests without a network.

use crate::addr::{AddressConfig, AddressTable, ADDR_VERSION};
use crate::error::{DriverError, DriverResult};
use crate::handler::{DriverContext, Handler, HandlerEvent, HandlerFactory};
use crate::polling::{self, PollQueue, PollTask};
use crate::retry::{build_exponential_backoff, RetryPolicy};
use crate::status::{ConnectStatus, DriverStatus};
use backoff::{backoff::Backoff, ExponentialBackoff};
use bytes::Bytes;
use edgelink_common::{topic::MessageKind, BrokerUrl, Settings, NAMESPACE};
use edgelink_error::{EdgeError, EdgeResult};
use rumqttc::{AsyncClient, Event, LastWill, MqttOptions, Packet, QoS, SubscribeFilter};
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// MQTT keep-alive for the broker session.
const KEEP_ALIVE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Broker URL, `mqtt://host[:port]`.
    pub mqtt_url: String,
    /// Driver identity: client id and username in one.
    pub username: String,
    pub password: String,
    /// Southbound reconnect policy.
    pub retry: RetryPolicy,
}

impl DriverConfig {
    pub fn from_settings(settings: &Settings) -> EdgeResult<Self> {
        let username = settings.username.clone().ok_or_else(|| {
            EdgeError::InitializationError("EDGE_USERNAME is required".to_string())
        })?;
        let password = settings.password.clone().ok_or_else(|| {
            EdgeError::InitializationError("EDGE_PASSWORD is required".to_string())
        })?;
        Ok(Self {
            mqtt_url: settings.mqtt.clone(),
            username,
            password,
            retry: RetryPolicy::default(),
        })
    }
}

/// Messages the core emits for the broker session to publish.
#[derive(Debug)]
pub(crate) enum Outbound {
    Status(DriverStatus),
    Data { topic_id: String, payload: Bytes },
    PollError { topic_id: String, message: String },
}

/// Results of work the core farmed out to tasks. Every variant carries the
/// handler generation it belongs to so stale completions are discarded.
#[derive(Debug)]
enum Control {
    ConnectResult { generation: u64, status: ConnectStatus },
    SubscribeResult { generation: u64, ok: bool },
    ReconnectDue { generation: u64 },
}

/// A driver process: one handler implementation bound to one broker
/// identity.
pub struct Driver<F: HandlerFactory> {
    config: DriverConfig,
    factory: F,
    cancel: CancellationToken,
}

impl<F: HandlerFactory> Driver<F> {
    pub fn new(config: DriverConfig, factory: F) -> Self {
        Self {
            config,
            factory,
            cancel: CancellationToken::new(),
        }
    }

    /// Token that stops `run` and tears the handler down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Connect to the broker and run until shut down.
    #[instrument(name = "driver-run", skip_all)]
    pub async fn run(self) -> DriverResult<()> {
        let Driver {
            config,
            factory,
            cancel,
        } = self;

        let url = BrokerUrl::parse(&config.mqtt_url)
            .map_err(|e| DriverError::ConfigurationError(e.to_string()))?;
        let id = config.username.clone();
        let status_topic = format!("{NAMESPACE}/{id}/status");

        let mut options = MqttOptions::new(id.clone(), url.host, url.port);
        options.set_credentials(id.clone(), config.password.clone());
        options.set_clean_session(true);
        options.set_keep_alive(KEEP_ALIVE);
        // The broker turns our will into the DOWN the agent sees if this
        // process dies without saying goodbye.
        options.set_last_will(LastWill::new(
            status_topic.clone(),
            DriverStatus::Down.as_str().as_bytes(),
            QoS::AtMostOnce,
            false,
        ));

        let (client, mut eventloop) = AsyncClient::new(options, 64);

        let (handler_tx, mut handler_rx) = mpsc::unbounded_channel();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
        let (control_tx, mut control_rx) = mpsc::unbounded_channel();
        let mut core = DriverCore::new(
            id.clone(),
            factory,
            config.retry,
            handler_tx,
            outbound_tx,
            control_tx,
        );

        let control_topics: Vec<SubscribeFilter> = ["active", "conf", "addr", "poll", "cmd/#"]
            .iter()
            .map(|kind| SubscribeFilter::new(format!("{NAMESPACE}/{id}/{kind}"), QoS::AtMostOnce))
            .collect();

        info!(driver = %id, "Driver starting");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    core.shutdown().await;
                    let _ = client
                        .publish(status_topic.clone(), QoS::AtMostOnce, false,
                            DriverStatus::Down.as_str().as_bytes().to_vec())
                        .await;
                    let _ = client.disconnect().await;
                    break;
                }
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!(driver = %id, "Connected to broker");
                        if let Err(e) = client.subscribe_many(control_topics.clone()).await {
                            warn!(error = %e, "Control subscription failed");
                        }
                        core.on_broker_connected();
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        core.on_message(&publish.topic, publish.payload).await;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "Broker connection error");
                        core.on_broker_disconnected();
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                },
                Some(event) = handler_rx.recv() => core.on_handler_event(event),
                Some(control) = control_rx.recv() => core.on_control(control),
                Some(outbound) = outbound_rx.recv() => {
                    let (topic, payload): (String, Vec<u8>) = match outbound {
                        Outbound::Status(status) => (
                            status_topic.clone(),
                            status.as_str().as_bytes().to_vec(),
                        ),
                        Outbound::Data { topic_id, payload } => (
                            format!("{NAMESPACE}/{id}/data/{topic_id}"),
                            payload.to_vec(),
                        ),
                        Outbound::PollError { topic_id, message } => (
                            format!("{NAMESPACE}/{id}/err/{topic_id}"),
                            message.into_bytes(),
                        ),
                    };
                    if let Err(e) = client.publish(topic, QoS::AtMostOnce, false, payload).await {
                        warn!(error = %e, "Publish failed");
                    }
                }
            }
        }

        info!(driver = %id, "Driver stopped");
        Ok(())
    }
}

/// The protocol state machine proper. Single consumer; every mutation
/// happens on the `run` loop.
struct DriverCore<F: HandlerFactory> {
    id: String,
    factory: F,
    retry: RetryPolicy,
    status: DriverStatus,
    broker_connected: bool,
    /// Bumped on every configuration change; stale task results are
    /// discarded by comparing against it.
    generation: u64,
    handler: Option<Arc<F::Handler>>,
    poller: Option<PollQueue<<F::Handler as Handler>::Address>>,
    handler_cancel: CancellationToken,
    addrs: Option<AddressTable<<F::Handler as Handler>::Address>>,
    /// An addr that arrived before the handler existed, replayed at UP.
    pending_addr: Option<AddressConfig>,
    /// In-flight guard so overlapping failures cannot start two timers.
    reconnecting: bool,
    backoff: ExponentialBackoff,
    handler_events: mpsc::UnboundedSender<HandlerEvent>,
    outbound: mpsc::UnboundedSender<Outbound>,
    control: mpsc::UnboundedSender<Control>,
}

impl<F: HandlerFactory> DriverCore<F> {
    fn new(
        id: String,
        factory: F,
        retry: RetryPolicy,
        handler_events: mpsc::UnboundedSender<HandlerEvent>,
        outbound: mpsc::UnboundedSender<Outbound>,
        control: mpsc::UnboundedSender<Control>,
    ) -> Self {
        let backoff = build_exponential_backoff(&retry);
        Self {
            id,
            factory,
            retry,
            status: DriverStatus::Down,
            broker_connected: false,
            generation: 0,
            handler: None,
            poller: None,
            handler_cancel: CancellationToken::new(),
            addrs: None,
            pending_addr: None,
            reconnecting: false,
            backoff,
            handler_events,
            outbound,
            control,
        }
    }

    /// Update and republish the driver status. This is the only channel by
    /// which the agent learns driver health.
    fn set_status(&mut self, status: DriverStatus) {
        if self.status != status {
            info!(driver = %self.id, from = %self.status, to = %status, "Status");
        }
        self.status = status;
        if self.broker_connected {
            let _ = self.outbound.send(Outbound::Status(status));
        }
    }

    fn on_broker_connected(&mut self) {
        self.broker_connected = true;
        self.set_status(DriverStatus::Ready);
    }

    fn on_broker_disconnected(&mut self) {
        self.broker_connected = false;
    }

    async fn on_message(&mut self, topic: &str, payload: Bytes) {
        let mut parts = topic.splitn(4, '/');
        let (_ns, _id) = (parts.next(), parts.next());
        let Some(kind) = parts.next().and_then(MessageKind::parse) else {
            warn!(topic, "Message on unknown topic");
            return;
        };
        let data = parts.next();

        match kind {
            MessageKind::Active => {
                if payload.as_ref() == b"ONLINE" {
                    self.set_status(DriverStatus::Ready);
                }
            }
            MessageKind::Conf => self.on_conf(&payload).await,
            MessageKind::Addr => self.on_addr(&payload),
            MessageKind::Poll => self.on_poll(&payload),
            MessageKind::Cmd => self.on_cmd(data.unwrap_or(""), payload).await,
            other => warn!(kind = %other, "Unhandled driver message"),
        }
    }

    /// Configuration change: tear the old handler down completely, then
    /// build and connect its replacement.
    async fn on_conf(&mut self, payload: &[u8]) {
        let conf: serde_json::Value = match serde_json::from_slice(payload) {
            Ok(conf) => conf,
            Err(e) => {
                warn!(error = %e, "Configuration is not valid JSON");
                self.set_status(DriverStatus::Conf);
                return;
            }
        };
        debug!(driver = %self.id, "CONF received");

        // Until the new handler has subscribed we have no addresses.
        self.addrs = None;
        self.pending_addr = None;
        self.reconnecting = false;
        self.generation += 1;
        let generation = self.generation;

        // Stop polling before the old handler goes away, and wait for its
        // close so two handlers never touch the same transport.
        self.handler_cancel.cancel();
        self.handler_cancel = CancellationToken::new();
        self.poller = None;
        if let Some(old) = self.handler.take() {
            old.close().await;
        }

        let ctx = DriverContext::new(self.id.clone(), self.handler_events.clone());
        match self.factory.create(ctx, &conf) {
            Some(handler) => {
                let handler = Arc::new(handler);
                self.poller = Some(polling::spawn(
                    Arc::clone(&handler),
                    self.outbound.clone(),
                    self.handler_cancel.child_token(),
                ));
                self.handler = Some(handler);
                self.backoff = build_exponential_backoff(&self.retry);
                self.spawn_connect(generation);
            }
            None => {
                warn!(driver = %self.id, "Handler rejected driver configuration");
                self.set_status(DriverStatus::Conf);
            }
        }
    }

    fn spawn_connect(&self, generation: u64) {
        let Some(handler) = self.handler.clone() else {
            return;
        };
        info!(driver = %self.id, "Connecting handler");
        let control = self.control.clone();
        tokio::spawn(async move {
            let status = handler.connect().await;
            let _ = control.send(Control::ConnectResult { generation, status });
        });
    }

    fn on_control(&mut self, control: Control) {
        match control {
            Control::ConnectResult { generation, status } => {
                if generation != self.generation {
                    debug!("Discarding stale connect result");
                    return;
                }
                self.set_status(status.into());
                if status == ConnectStatus::Up {
                    self.on_up();
                } else {
                    self.schedule_reconnect(generation);
                }
            }
            Control::SubscribeResult { generation, ok } => {
                if generation != self.generation || ok {
                    return;
                }
                warn!(driver = %self.id, "Handler subscription failed");
                self.set_status(DriverStatus::Conn);
                self.schedule_reconnect(generation);
            }
            Control::ReconnectDue { generation } => {
                self.reconnecting = false;
                if generation != self.generation {
                    return;
                }
                if self.handler.is_some() {
                    self.spawn_connect(generation);
                }
            }
        }
    }

    /// The handler reached UP: apply any address table that was waiting
    /// for it, then (re)issue subscriptions.
    fn on_up(&mut self) {
        if self.addrs.is_none() {
            if let Some(config) = self.pending_addr.take() {
                self.apply_addr(&config);
                return; // apply_addr subscribes on success
            }
        }
        self.try_subscribe();
    }

    fn on_addr(&mut self, payload: &[u8]) {
        let config: AddressConfig = match serde_json::from_slice(payload) {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %e, "Addr packet is not valid JSON");
                self.set_status(DriverStatus::Addr);
                return;
            }
        };
        if config.version != ADDR_VERSION {
            warn!(version = config.version, "Bad addr config version");
            self.set_status(DriverStatus::Addr);
            return;
        }
        if self.handler.is_none() {
            debug!(driver = %self.id, "Addr before configuration, kept for later");
            self.pending_addr = Some(config);
            return;
        }
        self.apply_addr(&config);
    }

    fn apply_addr(&mut self, config: &AddressConfig) {
        let Some(handler) = self.handler.as_ref() else {
            return;
        };
        match AddressTable::build(handler.as_ref(), config) {
            Ok(table) => {
                info!(driver = %self.id, addresses = table.len(), "Set addrs");
                self.addrs = Some(table);
                self.try_subscribe();
            }
            Err(e) => {
                // All-or-nothing: a rejected packet leaves the previous
                // table in force.
                warn!(error = %e, "Rejected addr packet");
                self.set_status(DriverStatus::Addr);
            }
        }
    }

    fn try_subscribe(&mut self) {
        if !self.status.is_up() {
            debug!("Not subscribing yet, handler not UP");
            return;
        }
        let Some(handler) = self.handler.clone() else {
            return;
        };
        let Some(table) = self.addrs.as_ref() else {
            debug!("Not subscribing yet, no addresses configured");
            return;
        };
        let specs = table.specs();
        let generation = self.generation;
        let control = self.control.clone();
        tokio::spawn(async move {
            let ok = handler.subscribe(specs).await;
            let _ = control.send(Control::SubscribeResult { generation, ok });
        });
    }

    fn schedule_reconnect(&mut self, generation: u64) {
        if self.reconnecting {
            debug!(driver = %self.id, "Handler already reconnecting");
            return;
        }
        self.reconnecting = true;
        let delay = self
            .backoff
            .next_backoff()
            .unwrap_or(Duration::from_millis(self.retry.max_interval_ms));
        info!(driver = %self.id, delay_ms = delay.as_millis() as u64, "Handler reconnect scheduled");
        let control = self.control.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = control.send(Control::ReconnectDue { generation });
        });
    }

    fn on_poll(&mut self, payload: &[u8]) {
        let Some(table) = self.addrs.as_ref() else {
            warn!(driver = %self.id, "Can't poll, no addrs");
            return;
        };
        let Some(poller) = self.poller.as_ref() else {
            warn!(driver = %self.id, "Can't poll, no poller");
            return;
        };

        let text = String::from_utf8_lossy(payload);
        for topic_id in text.split('\n').map(str::trim).filter(|t| !t.is_empty()) {
            let Some(entry) = table.lookup(topic_id) else {
                debug!(topic_id, "Poll for unknown topic id");
                continue;
            };
            let task = PollTask {
                topic_id: topic_id.to_string(),
                address: entry.parsed.clone(),
            };
            if !poller.push(task) {
                error!(
                    driver = %self.id,
                    "Poll queue size exceeded. We're polling too fast for the device!"
                );
            }
        }
    }

    async fn on_cmd(&mut self, name: &str, payload: Bytes) {
        match self.handler.as_ref() {
            Some(handler) => handler.cmd(name, payload).await,
            None => warn!(command = name, "Command without handler"),
        }
    }

    fn on_handler_event(&mut self, event: HandlerEvent) {
        match event {
            HandlerEvent::Status(status) => {
                self.set_status(status.into());
                if status == ConnectStatus::Up {
                    self.on_up();
                } else {
                    self.schedule_reconnect(self.generation);
                }
            }
            HandlerEvent::Data { spec, payload } => {
                match self.addrs.as_ref().and_then(|t| t.topic_for_spec(&spec)) {
                    Some(topic_id) => {
                        let _ = self.outbound.send(Outbound::Data {
                            topic_id: topic_id.to_string(),
                            payload,
                        });
                    }
                    // Stale data arriving after an address-table swap.
                    None => debug!(spec, "Dropping data for unsubscribed address"),
                }
            }
        }
    }

    async fn shutdown(&mut self) {
        self.handler_cancel.cancel();
        self.poller = None;
        if let Some(handler) = self.handler.take() {
            handler.close().await;
        }
        self.status = DriverStatus::Down;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::PollConcurrency;
    use async_trait::async_trait;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };

    type CallLog = Arc<Mutex<Vec<String>>>;

    struct MockHandler {
        id: usize,
        log: CallLog,
        connect_status: ConnectStatus,
        connect_delay: Duration,
    }

    #[async_trait]
    impl Handler for MockHandler {
        type Address = String;

        async fn connect(&self) -> ConnectStatus {
            self.log.lock().unwrap().push(format!("connect#{}", self.id));
            tokio::time::sleep(self.connect_delay).await;
            self.connect_status
        }

        fn parse_address(&self, spec: &str) -> Option<String> {
            if spec.starts_with("bad") {
                None
            } else {
                Some(spec.to_string())
            }
        }

        fn poll_concurrency(&self) -> PollConcurrency {
            PollConcurrency::Serial
        }

        async fn subscribe(&self, specs: Vec<String>) -> bool {
            self.log
                .lock()
                .unwrap()
                .push(format!("subscribe#{}[{}]", self.id, specs.len()));
            true
        }

        async fn poll(&self, addr: &String) -> DriverResult<Option<Bytes>> {
            Ok(Some(Bytes::from(format!("value:{addr}"))))
        }

        async fn close(&self) {
            self.log.lock().unwrap().push(format!("close#{}", self.id));
        }
    }

    struct MockFactory {
        log: CallLog,
        counter: AtomicUsize,
        connect_status: ConnectStatus,
        connect_delay: Duration,
    }

    impl MockFactory {
        fn new(log: CallLog) -> Self {
            Self {
                log,
                counter: AtomicUsize::new(0),
                connect_status: ConnectStatus::Up,
                connect_delay: Duration::ZERO,
            }
        }
    }

    impl HandlerFactory for MockFactory {
        type Handler = MockHandler;

        fn create(&self, _ctx: DriverContext, conf: &serde_json::Value) -> Option<MockHandler> {
            if conf.get("reject").is_some() {
                return None;
            }
            let id = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
            Some(MockHandler {
                id,
                log: Arc::clone(&self.log),
                connect_status: self.connect_status,
                connect_delay: self.connect_delay,
            })
        }
    }

    struct Harness {
        core: DriverCore<MockFactory>,
        log: CallLog,
        outbound_rx: mpsc::UnboundedReceiver<Outbound>,
        control_rx: mpsc::UnboundedReceiver<Control>,
        handler_rx: mpsc::UnboundedReceiver<HandlerEvent>,
    }

    fn harness(customize: impl FnOnce(&mut MockFactory)) -> Harness {
        let log: CallLog = Arc::new(Mutex::new(Vec::new()));
        let mut factory = MockFactory::new(Arc::clone(&log));
        customize(&mut factory);

        let (handler_tx, handler_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let mut core = DriverCore::new(
            "plcA".to_string(),
            factory,
            RetryPolicy::immediate(),
            handler_tx,
            outbound_tx,
            control_tx,
        );
        core.on_broker_connected();

        Harness {
            core,
            log,
            outbound_rx,
            control_rx,
            handler_rx,
        }
    }

    impl Harness {
        /// Drive spawned tasks to completion and feed their results back,
        /// as the run loop would. Bounded so a reconnect loop with an
        /// immediate retry policy cannot pump forever.
        async fn pump(&mut self) {
            for _ in 0..25 {
                tokio::task::yield_now().await;
                match tokio::time::timeout(Duration::from_secs(10), self.control_rx.recv()).await {
                    Ok(Some(control)) => self.core.on_control(control),
                    _ => break,
                }
                while let Ok(event) = self.handler_rx.try_recv() {
                    self.core.on_handler_event(event);
                }
            }
        }

        fn statuses(&mut self) -> Vec<DriverStatus> {
            let mut out = Vec::new();
            while let Ok(message) = self.outbound_rx.try_recv() {
                if let Outbound::Status(status) = message {
                    out.push(status);
                }
            }
            out
        }

        fn log(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    fn conf(json: serde_json::Value) -> Bytes {
        Bytes::from(serde_json::to_vec(&json).unwrap())
    }

    const ADDR_PACKET: &str =
        r#"{"version":1,"addrs":{"t1":"3,108,4"},"groups":{"devX":{"poll":1000,"addrs":["t1"]}}}"#;

    #[tokio::test(start_paused = true)]
    async fn connect_flow_reaches_up_and_subscribes() {
        let mut h = harness(|_| {});
        h.core
            .on_message("fpEdge1/plcA/conf", conf(serde_json::json!({"host": "x"})))
            .await;
        h.core
            .on_message("fpEdge1/plcA/addr", Bytes::from_static(ADDR_PACKET.as_bytes()))
            .await;
        h.pump().await;

        assert!(h.core.status.is_up());
        let log = h.log();
        assert!(log.contains(&"connect#1".to_string()));
        assert!(log.contains(&"subscribe#1[1]".to_string()));
        let statuses = h.statuses();
        assert!(statuses.contains(&DriverStatus::Up));
    }

    #[tokio::test(start_paused = true)]
    async fn old_handler_closes_before_new_one_connects() {
        let mut h = harness(|_| {});
        h.core
            .on_message("fpEdge1/plcA/conf", conf(serde_json::json!({"n": 1})))
            .await;
        h.pump().await;
        assert!(h.core.status.is_up());

        h.core
            .on_message("fpEdge1/plcA/conf", conf(serde_json::json!({"n": 2})))
            .await;
        h.pump().await;

        let log = h.log();
        let close1 = log.iter().position(|e| e == "close#1").unwrap();
        let connect2 = log.iter().position(|e| e == "connect#2").unwrap();
        assert!(
            close1 < connect2,
            "close#1 must precede connect#2 in {log:?}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn double_conf_closes_first_handler_exactly_once() {
        let mut h = harness(|factory| factory.connect_delay = Duration::from_secs(5));

        // Two configurations before the first connect can resolve.
        h.core
            .on_message("fpEdge1/plcA/conf", conf(serde_json::json!({"n": 1})))
            .await;
        h.core
            .on_message("fpEdge1/plcA/conf", conf(serde_json::json!({"n": 2})))
            .await;
        h.pump().await;

        let log = h.log();
        assert_eq!(log.iter().filter(|e| *e == "close#1").count(), 1);
        // The final state belongs to the second configuration.
        assert_eq!(h.core.generation, 2);
        assert!(h.core.status.is_up());
        // The first handler's late result was discarded, not double-applied.
        assert_eq!(log.iter().filter(|e| *e == "close#2").count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_conf_fails_closed() {
        let mut h = harness(|_| {});
        h.core
            .on_message("fpEdge1/plcA/conf", conf(serde_json::json!({"reject": true})))
            .await;
        h.pump().await;
        assert_eq!(h.core.status, DriverStatus::Conf);

        h.core
            .on_message("fpEdge1/plcA/conf", Bytes::from_static(b"{not json"))
            .await;
        assert_eq!(h.core.status, DriverStatus::Conf);
    }

    #[tokio::test(start_paused = true)]
    async fn bad_addr_version_leaves_table_unchanged() {
        let mut h = harness(|_| {});
        h.core
            .on_message("fpEdge1/plcA/conf", conf(serde_json::json!({})))
            .await;
        h.core
            .on_message("fpEdge1/plcA/addr", Bytes::from_static(ADDR_PACKET.as_bytes()))
            .await;
        h.pump().await;
        assert_eq!(h.core.addrs.as_ref().unwrap().len(), 1);

        h.core
            .on_message(
                "fpEdge1/plcA/addr",
                conf(serde_json::json!({"version": 2, "addrs": {"t9": "x"}})),
            )
            .await;
        assert_eq!(h.core.status, DriverStatus::Addr);
        let table = h.core.addrs.as_ref().unwrap();
        assert_eq!(table.len(), 1);
        assert!(table.lookup("t1").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_spec_rejects_whole_packet() {
        let mut h = harness(|_| {});
        h.core
            .on_message("fpEdge1/plcA/conf", conf(serde_json::json!({})))
            .await;
        h.core
            .on_message("fpEdge1/plcA/addr", Bytes::from_static(ADDR_PACKET.as_bytes()))
            .await;
        h.pump().await;

        h.core
            .on_message(
                "fpEdge1/plcA/addr",
                conf(serde_json::json!({
                    "version": 1,
                    "addrs": {"t1": "3,108,4", "t2": "bad-address"},
                })),
            )
            .await;
        let table = h.core.addrs.as_ref().unwrap();
        assert_eq!(table.len(), 1);
        assert!(table.lookup("t2").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn addr_before_conf_is_replayed_at_up() {
        let mut h = harness(|_| {});
        h.core
            .on_message("fpEdge1/plcA/addr", Bytes::from_static(ADDR_PACKET.as_bytes()))
            .await;
        assert!(h.core.addrs.is_none());

        h.core
            .on_message("fpEdge1/plcA/conf", conf(serde_json::json!({})))
            .await;
        h.pump().await;

        assert!(h.core.status.is_up());
        assert_eq!(h.core.addrs.as_ref().unwrap().len(), 1);
        assert!(h.log().contains(&"subscribe#1[1]".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_connect_schedules_reconnect() {
        let mut h = harness(|factory| factory.connect_status = ConnectStatus::Conn);
        h.core
            .on_message("fpEdge1/plcA/conf", conf(serde_json::json!({})))
            .await;
        h.pump().await;

        assert_eq!(h.core.status, DriverStatus::Conn);
        // The immediate retry policy lets several attempts through; the
        // in-flight guard must have kept them sequential.
        let connects = h.log().iter().filter(|e| *e == "connect#1").count();
        assert!(connects >= 2, "expected reconnect attempts, got {connects}");
    }

    #[tokio::test(start_paused = true)]
    async fn push_data_is_routed_and_stale_data_dropped() {
        let mut h = harness(|_| {});
        h.core
            .on_message("fpEdge1/plcA/conf", conf(serde_json::json!({})))
            .await;
        h.core
            .on_message("fpEdge1/plcA/addr", Bytes::from_static(ADDR_PACKET.as_bytes()))
            .await;
        h.pump().await;
        h.statuses();

        h.core.on_handler_event(HandlerEvent::Data {
            spec: "3,108,4".to_string(),
            payload: Bytes::from_static(b"\x2a"),
        });
        match h.outbound_rx.try_recv().unwrap() {
            Outbound::Data { topic_id, payload } => {
                assert_eq!(topic_id, "t1");
                assert_eq!(payload.as_ref(), b"\x2a");
            }
            other => panic!("expected data, got {other:?}"),
        }

        // A spec no longer in the table is dropped, not an error.
        h.core.on_handler_event(HandlerEvent::Data {
            spec: "gone".to_string(),
            payload: Bytes::new(),
        });
        assert!(h.outbound_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn poll_publishes_data_for_known_topic_ids() {
        let mut h = harness(|_| {});
        h.core
            .on_message("fpEdge1/plcA/conf", conf(serde_json::json!({})))
            .await;
        h.core
            .on_message("fpEdge1/plcA/addr", Bytes::from_static(ADDR_PACKET.as_bytes()))
            .await;
        h.pump().await;
        h.statuses();

        h.core
            .on_message("fpEdge1/plcA/poll", Bytes::from_static(b"t1\nunknown"))
            .await;

        // Give the poll worker a chance to run the task.
        let outbound = tokio::time::timeout(Duration::from_secs(1), h.outbound_rx.recv())
            .await
            .expect("poll result within the timeout")
            .unwrap();
        match outbound {
            Outbound::Data { topic_id, payload } => {
                assert_eq!(topic_id, "t1");
                assert_eq!(payload.as_ref(), b"value:3,108,4");
            }
            other => panic!("expected data, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn active_online_sets_ready() {
        let mut h = harness(|_| {});
        h.statuses();
        h.core
            .on_message("fpEdge1/plcA/active", Bytes::from_static(b"ONLINE"))
            .await;
        assert_eq!(h.core.status, DriverStatus::Ready);
        assert_eq!(h.statuses(), vec![DriverStatus::Ready]);

        // OFFLINE is not a READY trigger.
        h.core
            .on_message("fpEdge1/plcA/active", Bytes::from_static(b"OFFLINE"))
            .await;
        assert!(h.statuses().is_empty());
    }
}
