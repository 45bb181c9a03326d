//! Shared plumbing for the edgelink processes: logging bootstrap and
//! layered configuration.

mod logger;
mod settings;
pub mod topic;

pub use logger::Logger;
pub use settings::{BrokerUrl, Settings};
pub use topic::{DriverTopic, MessageKind, NAMESPACE};

pub use edgelink_error::{EdgeError, EdgeResult};
