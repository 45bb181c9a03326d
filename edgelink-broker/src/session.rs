//! Per-connection session state and the live-session registry.

use crate::auth::AclEntry;
use crate::pattern::TopicPattern;
use crate::protocol::packet::Packet;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// State for one authenticated connection.
///
/// Created after a successful CONNECT, removed when the connection task
/// ends. Subscriptions are compiled once at SUBSCRIBE time so routing is a
/// straight pattern walk.
#[derive(Debug)]
pub struct Session {
    pub acl: AclEntry,
    subscriptions: std::sync::Mutex<Vec<(String, TopicPattern)>>,
    outbound: mpsc::Sender<Packet>,
}

impl Session {
    pub fn new(acl: AclEntry, outbound: mpsc::Sender<Packet>) -> Self {
        Self {
            acl,
            subscriptions: std::sync::Mutex::new(Vec::new()),
            outbound,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.acl.client_id
    }

    pub fn subscribe(&self, filter: String, pattern: TopicPattern) {
        let mut subs = self.subscriptions.lock().unwrap();
        // Re-subscribing to the same filter replaces the old entry.
        subs.retain(|(f, _)| f != &filter);
        subs.push((filter, pattern));
    }

    pub fn unsubscribe(&self, filter: &str) {
        let mut subs = self.subscriptions.lock().unwrap();
        subs.retain(|(f, _)| f != filter);
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.subscriptions
            .lock()
            .unwrap()
            .iter()
            .any(|(_, p)| p.matches(topic))
    }

    /// Queue a packet for delivery; a full or closed outbound queue drops
    /// the packet (QoS 0).
    pub fn deliver(&self, packet: Packet) {
        if let Err(e) = self.outbound.try_send(packet) {
            debug!(client = %self.client_id(), error = %e, "Dropping outbound packet");
        }
    }
}

/// All live sessions, keyed by client id. Connecting with an id that is
/// already present replaces the previous session.
pub type SessionRegistry = Arc<DashMap<String, Arc<Session>>>;
