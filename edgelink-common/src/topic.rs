//! The private topic namespace shared by the agent and every driver.

use std::fmt::{self, Display, Formatter};

/// Fixed namespace prefix for all driver traffic.
pub const NAMESPACE: &str = "fpEdge1";

/// The message kinds carried under `<NAMESPACE>/<driver>/...`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Agent -> driver: literal `ONLINE`/`OFFLINE`.
    Active,
    /// Agent -> driver: JSON handler configuration.
    Conf,
    /// Agent -> driver: JSON address assignment.
    Addr,
    /// Agent -> driver: newline-separated topic ids to read now.
    Poll,
    /// Agent -> driver: command payload, name in the topic suffix.
    Cmd,
    /// Driver -> agent: literal status string.
    Status,
    /// Driver -> agent: binary value for one topic id.
    Data,
    /// Driver -> agent: error text for one topic id.
    Err,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Active => "active",
            MessageKind::Conf => "conf",
            MessageKind::Addr => "addr",
            MessageKind::Poll => "poll",
            MessageKind::Cmd => "cmd",
            MessageKind::Status => "status",
            MessageKind::Data => "data",
            MessageKind::Err => "err",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(MessageKind::Active),
            "conf" => Some(MessageKind::Conf),
            "addr" => Some(MessageKind::Addr),
            "poll" => Some(MessageKind::Poll),
            "cmd" => Some(MessageKind::Cmd),
            "status" => Some(MessageKind::Status),
            "data" => Some(MessageKind::Data),
            "err" => Some(MessageKind::Err),
            _ => None,
        }
    }
}

impl Display for MessageKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed namespace topic: `<NAMESPACE>/<driver>/<kind>[/<data>]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverTopic {
    pub driver: String,
    pub kind: MessageKind,
    pub data: Option<String>,
}

impl DriverTopic {
    pub fn new(driver: impl Into<String>, kind: MessageKind, data: Option<String>) -> Self {
        Self {
            driver: driver.into(),
            kind,
            data,
        }
    }

    /// Parse a topic string. Returns None for anything outside the
    /// namespace or not matching the `<prefix>/<id>/<kind>[/<data>]` shape.
    pub fn parse(topic: &str) -> Option<Self> {
        let mut parts = topic.splitn(4, '/');
        if parts.next()? != NAMESPACE {
            return None;
        }
        let driver = parts.next()?;
        if driver.is_empty() {
            return None;
        }
        let kind = MessageKind::parse(parts.next()?)?;
        let data = parts.next().map(str::to_string);
        Some(Self {
            driver: driver.to_string(),
            kind,
            data,
        })
    }

    /// Compose the wire topic string.
    pub fn to_topic(&self) -> String {
        match &self.data {
            Some(data) => format!("{}/{}/{}/{}", NAMESPACE, self.driver, self.kind, data),
            None => format!("{}/{}/{}", NAMESPACE, self.driver, self.kind),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_control_topic() {
        let t = DriverTopic::parse("fpEdge1/plcA/conf").unwrap();
        assert_eq!(t.driver, "plcA");
        assert_eq!(t.kind, MessageKind::Conf);
        assert_eq!(t.data, None);
    }

    #[test]
    fn parse_data_topic() {
        let t = DriverTopic::parse("fpEdge1/plcA/data/31337").unwrap();
        assert_eq!(t.kind, MessageKind::Data);
        assert_eq!(t.data.as_deref(), Some("31337"));
    }

    #[test]
    fn parse_cmd_with_name() {
        let t = DriverTopic::parse("fpEdge1/plcA/cmd/restart").unwrap();
        assert_eq!(t.kind, MessageKind::Cmd);
        assert_eq!(t.data.as_deref(), Some("restart"));
    }

    #[test]
    fn reject_foreign_topics() {
        assert!(DriverTopic::parse("other/plcA/conf").is_none());
        assert!(DriverTopic::parse("fpEdge1/plcA/bogus").is_none());
        assert!(DriverTopic::parse("fpEdge1").is_none());
        assert!(DriverTopic::parse("fpEdge1//conf").is_none());
    }

    #[test]
    fn round_trip() {
        let t = DriverTopic::new("plcA", MessageKind::Err, Some("42".into()));
        assert_eq!(t.to_topic(), "fpEdge1/plcA/err/42");
        assert_eq!(DriverTopic::parse(&t.to_topic()).unwrap(), t);
    }
}
