//! Embedded MQTT broker for the edge driver protocol.
//!
//! Hosts a private, local message bus restricted to the `fpEdge1`
//! namespace. Every connected client is authenticated against a filesystem
//! credential store and confined to its own topic tree; all namespace
//! traffic is additionally re-parsed and dispatched to in-process
//! subscribers so the agent side never needs a second network hop.

mod auth;
mod broker;
mod link;
mod pattern;
pub mod protocol;
mod session;

pub use auth::{AclEntry, Authenticator, PasswordStore};
pub use broker::{BrokerConfig, DriverBroker, DriverEvent};
pub use edgelink_common::topic::{DriverTopic, MessageKind, NAMESPACE};
pub use link::{DriverLink, LinkEvent};
pub use pattern::{PatternError, TopicPattern};

pub use edgelink_error::{EdgeError, EdgeResult};
