use std::fmt::{self, Display, Formatter};

/// Driver health as published on the `status` topic.
///
/// Exactly one value is authoritative at any time; it is republished on
/// every transition so the agent never has to rely on replayed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverStatus {
    /// Not connected to the broker (also the last-will payload).
    Down,
    /// Broker session up, awaiting configuration.
    Ready,
    /// Southbound connection established; polling permitted.
    Up,
    /// Southbound connection failed.
    Conn,
    /// Southbound authorization failed.
    Auth,
    /// Configuration rejected.
    Conf,
    /// Address assignment rejected.
    Addr,
    /// Unrecoverable handler error.
    Err,
}

impl DriverStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriverStatus::Down => "DOWN",
            DriverStatus::Ready => "READY",
            DriverStatus::Up => "UP",
            DriverStatus::Conn => "CONN",
            DriverStatus::Auth => "AUTH",
            DriverStatus::Conf => "CONF",
            DriverStatus::Addr => "ADDR",
            DriverStatus::Err => "ERR",
        }
    }

    #[inline]
    pub fn is_up(&self) -> bool {
        matches!(self, DriverStatus::Up)
    }
}

impl Display for DriverStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The statuses a handler's `connect()` is permitted to report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStatus {
    /// Southbound device reachable and authorized.
    Up,
    /// Device unreachable.
    Conn,
    /// Device refused our credentials.
    Auth,
}

impl From<ConnectStatus> for DriverStatus {
    fn from(status: ConnectStatus) -> Self {
        match status {
            ConnectStatus::Up => DriverStatus::Up,
            ConnectStatus::Conn => DriverStatus::Conn,
            ConnectStatus::Auth => DriverStatus::Auth,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings_match_the_wire_protocol() {
        for (status, s) in [
            (DriverStatus::Down, "DOWN"),
            (DriverStatus::Ready, "READY"),
            (DriverStatus::Up, "UP"),
            (DriverStatus::Conn, "CONN"),
            (DriverStatus::Auth, "AUTH"),
            (DriverStatus::Conf, "CONF"),
            (DriverStatus::Addr, "ADDR"),
            (DriverStatus::Err, "ERR"),
        ] {
            assert_eq!(status.as_str(), s);
        }
    }

    #[test]
    fn connect_status_maps_into_driver_status() {
        assert_eq!(DriverStatus::from(ConnectStatus::Up), DriverStatus::Up);
        assert_eq!(DriverStatus::from(ConnectStatus::Conn), DriverStatus::Conn);
        assert_eq!(DriverStatus::from(ConnectStatus::Auth), DriverStatus::Auth);
        assert!(DriverStatus::from(ConnectStatus::Up).is_up());
    }
}
