use config::{Config, File};
use edgelink_error::{EdgeError, EdgeResult};
use serde::Deserialize;
use std::{ops::Deref, sync::Arc};

/// Default listening/connection port when the broker URL omits one.
pub const DEFAULT_MQTT_PORT: u16 = 1883;

/// Shared, immutable process settings.
///
/// Layered from an optional TOML file and the flat `EDGE_*` environment
/// variables the protocol has always used (`EDGE_MQTT`, `EDGE_PASSWORDS`,
/// `EDGE_USERNAME`, `EDGE_PASSWORD`).
#[derive(Debug, Clone)]
pub struct Settings(Arc<Inner>);

impl Deref for Settings {
    type Target = Inner;
    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl Settings {
    pub fn new(config_path: Option<&str>) -> EdgeResult<Self> {
        let mut builder = Config::builder();
        if let Some(path) = config_path {
            builder = builder.add_source(File::with_name(path).required(false));
        }
        let builder = builder.add_source(config::Environment::with_prefix("EDGE"));
        let inner: Inner = builder.build()?.try_deserialize()?;
        Ok(Self(Arc::new(inner)))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Inner {
    /// Broker URL, `mqtt://host[:port]`.
    #[serde(default = "Inner::mqtt_default")]
    pub mqtt: String,
    /// Credential directory: one file per username holding the raw secret.
    #[serde(default = "Inner::passwords_default")]
    pub passwords: String,
    /// Driver identity; doubles as MQTT client id and username.
    #[serde(default)]
    pub username: Option<String>,
    /// Driver secret matched byte-for-byte against the credential store.
    #[serde(default)]
    pub password: Option<String>,
    /// Identity granted an unrestricted ACL, if any.
    #[serde(default)]
    pub debug_user: Option<String>,
}

impl Inner {
    fn mqtt_default() -> String {
        "mqtt://127.0.0.1:1883".into()
    }

    fn passwords_default() -> String {
        "./passwords".into()
    }
}

/// Host/port pair parsed out of an `mqtt://` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerUrl {
    pub host: String,
    pub port: u16,
}

impl BrokerUrl {
    /// Parse `mqtt://host[:port]`; any other scheme is refused.
    pub fn parse(url: &str) -> EdgeResult<Self> {
        let rest = url
            .strip_prefix("mqtt://")
            .ok_or_else(|| EdgeError::Msg(format!("Unknown URL scheme in {url}")))?;
        let rest = rest.trim_end_matches('/');
        if rest.is_empty() {
            return Err(EdgeError::Msg(format!("Missing host in {url}")));
        }
        match rest.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| EdgeError::Msg(format!("Invalid port in {url}")))?;
                Ok(Self {
                    host: host.to_string(),
                    port,
                })
            }
            None => Ok(Self {
                host: rest.to_string(),
                port: DEFAULT_MQTT_PORT,
            }),
        }
    }
}
