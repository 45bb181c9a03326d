//! The southbound handler SPI.
//!
//! One handler implementation exists per driver process, selected at build
//! time; one handler *instance* exists per active configuration. Handlers
//! never talk to the broker: everything flows through the [`Driver`] via
//! return values and the [`DriverContext`] event channel.
//!
//! [`Driver`]: crate::Driver

use crate::error::DriverResult;
use crate::status::ConnectStatus;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashSet;
use tokio::sync::mpsc;
use tracing::warn;

/// How many `poll()` calls may be in flight at once.
///
/// Most industrial transports (S7, Modbus) are unsafe for concurrent reads
/// on one connection, so `Serial` is the default; a handler must opt in to
/// parallelism explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PollConcurrency {
    #[default]
    Serial,
    Parallel {
        limit: usize,
    },
}

/// Events a handler pushes back into the driver loop.
#[derive(Debug, Clone)]
pub enum HandlerEvent {
    /// Asynchronous connection-state notification, for handlers whose
    /// transport reports failures outside `connect()`.
    Status(ConnectStatus),
    /// Spontaneous southbound data, keyed by the raw address spec it was
    /// subscribed with.
    Data { spec: String, payload: Bytes },
}

/// Capabilities the driver hands to a handler at construction time.
#[derive(Debug, Clone)]
pub struct DriverContext {
    driver_id: String,
    events: mpsc::UnboundedSender<HandlerEvent>,
}

impl DriverContext {
    pub(crate) fn new(driver_id: String, events: mpsc::UnboundedSender<HandlerEvent>) -> Self {
        Self { driver_id, events }
    }

    pub fn driver_id(&self) -> &str {
        &self.driver_id
    }

    /// Report the southbound connection as established.
    pub fn conn_up(&self) {
        self.send(HandlerEvent::Status(ConnectStatus::Up));
    }

    /// Report the southbound connection as failed.
    pub fn conn_failed(&self) {
        self.send(HandlerEvent::Status(ConnectStatus::Conn));
    }

    /// Report a southbound authorization failure.
    pub fn conn_unauth(&self) {
        self.send(HandlerEvent::Status(ConnectStatus::Auth));
    }

    /// Push data for a subscribed address (push-discipline handlers).
    pub fn data(&self, spec: impl Into<String>, payload: Bytes) {
        self.send(HandlerEvent::Data {
            spec: spec.into(),
            payload,
        });
    }

    fn send(&self, event: HandlerEvent) {
        if self.events.send(event).is_err() {
            warn!(driver = %self.driver_id, "Driver loop gone, handler event dropped");
        }
    }
}

/// A southbound protocol adapter.
///
/// Pull handlers implement `poll`; push handlers implement `subscribe` and
/// feed [`DriverContext::data`] instead. Everything else is optional.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// The parsed form of a device address spec.
    type Address: Clone + Send + Sync + 'static;

    /// Connect to the southbound device.
    async fn connect(&self) -> ConnectStatus;

    /// Declared set of valid raw address strings, if the protocol has a
    /// finite vocabulary. Checked before `parse_address`.
    fn valid_addrs(&self) -> Option<&HashSet<String>> {
        None
    }

    /// Parse one raw address spec; None rejects the whole assignment.
    fn parse_address(&self, spec: &str) -> Option<Self::Address>;

    /// Whether this handler tolerates concurrent in-flight polls.
    fn poll_concurrency(&self) -> PollConcurrency {
        PollConcurrency::default()
    }

    /// (Re)establish southbound subscriptions for the given addresses.
    /// Returning false is treated as a connection failure.
    async fn subscribe(&self, _specs: Vec<Self::Address>) -> bool {
        true
    }

    /// Read one address. `Ok(None)` means "nothing to publish".
    async fn poll(&self, _addr: &Self::Address) -> DriverResult<Option<Bytes>> {
        Ok(None)
    }

    /// Execute a named command sent on `cmd/<name>`.
    async fn cmd(&self, name: &str, _payload: Bytes) {
        warn!(command = name, "Handler has no command support");
    }

    /// Release southbound resources. Awaited to completion before a
    /// replacement handler may connect.
    async fn close(&self);
}

/// Builds a handler from a driver configuration.
///
/// Returning None signals that the configuration was rejected.
pub trait HandlerFactory: Send + Sync + 'static {
    type Handler: Handler;

    fn create(&self, ctx: DriverContext, conf: &serde_json::Value) -> Option<Self::Handler>;
}
