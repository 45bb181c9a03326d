//! The broker proper: TCP accept loop, per-connection protocol handling,
//! publish/subscribe authorization and namespace dispatch.

use crate::auth::{AuthRejection, Authenticator, PasswordStore};
use crate::pattern::TopicPattern;
use crate::protocol::packet::{
    ConnAck, ConnectReturnCode, Packet, Publish, SubAck, SUBACK_FAILURE,
};
use crate::protocol::MqttCodec;
use crate::session::{Session, SessionRegistry};
use edgelink_common::topic::{DriverTopic, MessageKind};
use bytes::Bytes;
use dashmap::DashMap;
use edgelink_common::{BrokerUrl, Settings};
use edgelink_error::{EdgeError, EdgeResult};
use futures::{SinkExt, StreamExt};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{broadcast, mpsc},
    time::{sleep_until, Instant},
};
use tokio_util::{codec::Framed, sync::CancellationToken};
use tracing::{debug, info, instrument, warn};

/// How long a client gets to send its CONNECT after the TCP handshake.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Read deadline for clients that do not request a keep-alive.
const IDLE_TIMEOUT: Duration = Duration::from_secs(600);

/// Outbound queue depth per connection.
const OUTBOUND_QUEUE: usize = 64;

/// A namespace message re-parsed for in-process consumers.
#[derive(Debug, Clone)]
pub struct DriverEvent {
    pub driver: String,
    pub kind: MessageKind,
    pub data: Option<String>,
    pub payload: Bytes,
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub url: BrokerUrl,
    pub passwords: String,
    pub debug_user: Option<String>,
}

impl BrokerConfig {
    pub fn from_settings(settings: &Settings) -> EdgeResult<Self> {
        Ok(Self {
            url: BrokerUrl::parse(&settings.mqtt)?,
            passwords: settings.passwords.clone(),
            debug_user: settings.debug_user.clone(),
        })
    }
}

/// The embedded message bus for the edge driver protocol.
#[derive(Clone)]
pub struct DriverBroker {
    authenticator: Authenticator,
    config: BrokerConfig,
    sessions: SessionRegistry,
    events: broadcast::Sender<DriverEvent>,
    cancel: CancellationToken,
}

impl DriverBroker {
    pub fn new(config: BrokerConfig) -> Self {
        let store = PasswordStore::new(config.passwords.clone());
        let authenticator = Authenticator::new(store, config.debug_user.clone());
        let (events, _) = broadcast::channel(256);
        Self {
            authenticator,
            config,
            sessions: Arc::new(DashMap::new()),
            events,
            cancel: CancellationToken::new(),
        }
    }

    /// Bind the listening socket and spawn the accept loop.
    ///
    /// Returns the bound address; a failed bind is the one startup error
    /// that is fatal to the process.
    #[instrument(name = "broker-start", skip_all)]
    pub async fn start(&self) -> EdgeResult<SocketAddr> {
        let addr = format!("{}:{}", self.config.url.host, self.config.url.port);
        let listener = TcpListener::bind(&addr).await.map_err(|e| {
            EdgeError::InitializationError(format!("Cannot bind broker socket {addr}: {e}"))
        })?;
        let local = listener.local_addr()?;
        info!(%local, "Broker listening");

        let broker = self.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            let broker = broker.clone();
                            tokio::spawn(async move {
                                broker.handle_connection(stream, peer).await;
                            });
                        }
                        Err(e) => warn!(error = %e, "Accept failed"),
                    }
                }
            }
            info!("Broker accept loop stopped");
        });

        Ok(local)
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Subscribe to the re-parsed namespace traffic. This is how the agent
    /// side consumes driver messages without a network round trip.
    pub fn subscribe_events(&self) -> broadcast::Receiver<DriverEvent> {
        self.events.subscribe()
    }

    /// Publish into the namespace from the agent side. QoS 0, no retain.
    pub fn publish(&self, driver: &str, kind: MessageKind, data: Option<&str>, payload: Bytes) {
        let topic = DriverTopic::new(driver, kind, data.map(str::to_string)).to_topic();
        self.route(&topic, payload);
    }

    /// Deliver a message to every matching subscriber and mirror it onto
    /// the local event channel.
    fn route(&self, topic: &str, payload: Bytes) {
        for session in self.sessions.iter() {
            if session.is_subscribed(topic) {
                session.deliver(Packet::Publish(Publish::qos0(topic, payload.clone())));
            }
        }

        match DriverTopic::parse(topic) {
            Some(parsed) => {
                let _ = self.events.send(DriverEvent {
                    driver: parsed.driver,
                    kind: parsed.kind,
                    data: parsed.data,
                    payload,
                });
            }
            None => debug!(topic, "Message on unknown topic"),
        }
    }

    #[instrument(name = "broker-connection", skip_all, fields(%peer))]
    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let mut framed = Framed::new(stream, MqttCodec);

        // The first packet must be a CONNECT, within the deadline.
        let connect = match tokio::time::timeout(CONNECT_TIMEOUT, framed.next()).await {
            Ok(Some(Ok(Packet::Connect(c)))) => c,
            Ok(Some(Ok(other))) => {
                warn!(%peer, packet = ?other, "First packet was not CONNECT");
                return;
            }
            Ok(Some(Err(e))) => {
                warn!(%peer, error = %e, "Handshake decode error");
                return;
            }
            Ok(None) | Err(_) => {
                debug!(%peer, "Connection closed before CONNECT");
                return;
            }
        };

        let acl = match self
            .authenticator
            .authenticate(
                &connect.client_id,
                connect.username.as_deref(),
                connect.password.as_ref(),
            )
            .await
        {
            Ok(acl) => acl,
            Err(rejection) => {
                warn!(%peer, client = %connect.client_id, %rejection, "AUTH rejected");
                let code = match rejection {
                    AuthRejection::BadCredentials(_) => ConnectReturnCode::BadCredentials,
                    AuthRejection::NotAuthorized(_) => ConnectReturnCode::NotAuthorized,
                };
                let _ = framed
                    .send(Packet::ConnAck(ConnAck {
                        session_present: false,
                        code,
                    }))
                    .await;
                return;
            }
        };

        let client_id = acl.client_id.clone();
        info!(%peer, client = %client_id, "AUTH accepted");

        let (outbound_tx, mut outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let session = Arc::new(Session::new(acl, outbound_tx));
        self.sessions.insert(client_id.clone(), Arc::clone(&session));

        if framed
            .send(Packet::ConnAck(ConnAck {
                session_present: false,
                code: ConnectReturnCode::Accepted,
            }))
            .await
            .is_err()
        {
            self.remove_session(&client_id, &session);
            return;
        }

        let grace = if connect.keep_alive > 0 {
            // MQTT allows 1.5x the keep-alive interval before the server
            // must drop the connection.
            Duration::from_millis(connect.keep_alive as u64 * 1500)
        } else {
            IDLE_TIMEOUT
        };

        let mut deadline = Instant::now() + grace;
        let mut graceful = false;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = sleep_until(deadline) => {
                    warn!(client = %client_id, "Keep-alive expired");
                    break;
                }
                outgoing = outbound_rx.recv() => {
                    let Some(packet) = outgoing else { break };
                    if framed.send(packet).await.is_err() {
                        break;
                    }
                }
                incoming = framed.next() => {
                    let packet = match incoming {
                        Some(Ok(packet)) => packet,
                        Some(Err(e)) => {
                            warn!(client = %client_id, error = %e, "Decode error");
                            break;
                        }
                        None => break,
                    };
                    deadline = Instant::now() + grace;

                    match packet {
                        Packet::Publish(publish) => {
                            if !self.handle_publish(&session, publish) {
                                break;
                            }
                        }
                        Packet::Subscribe(subscribe) => {
                            let ack = self.handle_subscribe(&session, subscribe);
                            if framed.send(Packet::SubAck(ack)).await.is_err() {
                                break;
                            }
                        }
                        Packet::Unsubscribe(unsubscribe) => {
                            for filter in &unsubscribe.filters {
                                session.unsubscribe(filter);
                            }
                            let ack = Packet::UnsubAck { packet_id: unsubscribe.packet_id };
                            if framed.send(ack).await.is_err() {
                                break;
                            }
                        }
                        Packet::PingReq => {
                            if framed.send(Packet::PingResp).await.is_err() {
                                break;
                            }
                        }
                        Packet::Disconnect => {
                            graceful = true;
                            break;
                        }
                        Packet::Connect(_) => {
                            warn!(client = %client_id, "Duplicate CONNECT");
                            break;
                        }
                        other => debug!(client = %client_id, packet = ?other, "Ignored packet"),
                    }
                }
            }
        }

        self.remove_session(&client_id, &session);

        // A graceful DISCONNECT revokes the will; anything else delivers it.
        if !graceful {
            if let Some(will) = connect.will {
                if session.acl.allow_publish(&will.topic) {
                    debug!(client = %client_id, topic = %will.topic, "Delivering will");
                    self.route(&will.topic, will.payload);
                }
            }
        }

        info!(client = %client_id, graceful, "Connection closed");
    }

    /// Returns false when the client must be disconnected.
    fn handle_publish(&self, session: &Session, publish: Publish) -> bool {
        debug!(client = %session.client_id(), topic = %publish.topic, "PUBLISH");

        // Retained state would be replayed by the broker long after the
        // driver that asserted it is gone; the protocol forbids it.
        if publish.retain {
            warn!(client = %session.client_id(), topic = %publish.topic,
                "Retained PUBLISH forbidden");
            return false;
        }
        if !session.acl.allow_publish(&publish.topic) {
            warn!(client = %session.client_id(), topic = %publish.topic,
                "Unauthorised PUBLISH");
            return false;
        }

        self.route(&publish.topic, publish.payload);
        true
    }

    fn handle_subscribe(
        &self,
        session: &Session,
        subscribe: crate::protocol::packet::Subscribe,
    ) -> SubAck {
        let mut return_codes = Vec::with_capacity(subscribe.filters.len());
        for (filter, _qos) in subscribe.filters {
            let granted = session.acl.allow_subscribe(&filter)
                && match TopicPattern::new(&filter) {
                    Ok(pattern) => {
                        session.subscribe(filter.clone(), pattern);
                        true
                    }
                    Err(_) => false,
                };
            if granted {
                debug!(client = %session.client_id(), filter, "SUBSCRIBE granted");
                return_codes.push(0x00);
            } else {
                warn!(client = %session.client_id(), filter, "Unauthorised SUBSCRIBE");
                return_codes.push(SUBACK_FAILURE);
            }
        }
        SubAck {
            packet_id: subscribe.packet_id,
            return_codes,
        }
    }

    /// Remove the session, but only if the registry still points at this
    /// connection (a reconnect may have replaced it already).
    fn remove_session(&self, client_id: &str, session: &Arc<Session>) {
        self.sessions
            .remove_if(client_id, |_, current| Arc::ptr_eq(current, session));
    }
}

impl std::fmt::Debug for DriverBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverBroker")
            .field("config", &self.config)
            .field("sessions", &self.sessions.len())
            .finish()
    }
}
