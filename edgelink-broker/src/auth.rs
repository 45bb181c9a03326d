//! Authentication against the filesystem credential store, and the ACL
//! entries installed for each accepted client.

use crate::pattern::TopicPattern;
use edgelink_common::NAMESPACE;
use bytes::Bytes;
use std::path::PathBuf;
use tracing::debug;

/// One file per username, containing the raw password bytes.
#[derive(Debug, Clone)]
pub struct PasswordStore {
    dir: PathBuf,
}

impl PasswordStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Read the stored secret for `username`, or None if there is no
    /// credential file. Usernames that could escape the store directory
    /// are treated as absent.
    pub async fn lookup(&self, username: &str) -> Option<Bytes> {
        if username.is_empty()
            || username.contains('/')
            || username.contains('\\')
            || username.contains("..")
        {
            return None;
        }
        match tokio::fs::read(self.dir.join(username)).await {
            Ok(bytes) => Some(Bytes::from(bytes)),
            Err(e) => {
                debug!(username, error = %e, "No credential file");
                None
            }
        }
    }
}

/// Authorization state for one connected client, computed at connect time
/// and dropped on disconnect.
#[derive(Debug, Clone)]
pub struct AclEntry {
    pub client_id: String,
    publish: Vec<TopicPattern>,
    subscribe: Vec<TopicPattern>,
    unrestricted: bool,
}

impl AclEntry {
    /// The standard driver ACL: a client may publish only its own status,
    /// data and error topics, and subscribe only to its own control topics.
    fn for_driver(client_id: &str) -> Self {
        let own = |suffix: &str| {
            TopicPattern::new(&format!("{NAMESPACE}/{client_id}/{suffix}"))
                .expect("static ACL pattern")
        };
        Self {
            client_id: client_id.to_string(),
            publish: vec![own("status"), own("data/+"), own("err/+")],
            subscribe: vec![
                own("active"),
                own("conf"),
                own("addr"),
                own("poll"),
                own("cmd/#"),
            ],
            unrestricted: false,
        }
    }

    /// The debug identity: no topic restrictions at all.
    fn debug(client_id: &str) -> Self {
        Self {
            client_id: client_id.to_string(),
            publish: Vec::new(),
            subscribe: Vec::new(),
            unrestricted: true,
        }
    }

    pub fn allow_publish(&self, topic: &str) -> bool {
        self.unrestricted || self.publish.iter().any(|p| p.matches(topic))
    }

    /// Subscription filters are matched as strings against the allowed
    /// patterns; a literal `#` level in the filter is covered by the
    /// corresponding `#` in the ACL pattern.
    pub fn allow_subscribe(&self, filter: &str) -> bool {
        self.unrestricted || self.subscribe.iter().any(|p| p.matches(filter))
    }
}

/// Why a CONNECT was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthRejection {
    #[error("bad credentials: {0}")]
    BadCredentials(String),
    #[error("not authorized: {0}")]
    NotAuthorized(String),
}

/// Connect-time authentication: credentials plus the client-id rule.
#[derive(Debug, Clone)]
pub struct Authenticator {
    store: PasswordStore,
    debug_user: Option<String>,
}

impl Authenticator {
    pub fn new(store: PasswordStore, debug_user: Option<String>) -> Self {
        Self { store, debug_user }
    }

    fn is_debug(&self, username: &str) -> bool {
        self.debug_user.as_deref() == Some(username)
    }

    /// Validate a CONNECT and build the client's ACL entry.
    ///
    /// Rejects when no password was supplied, no credential file exists,
    /// the secret does not byte-compare equal, or -- for non-debug users --
    /// the client id differs from the username.
    pub async fn authenticate(
        &self,
        client_id: &str,
        username: Option<&str>,
        password: Option<&Bytes>,
    ) -> Result<AclEntry, AuthRejection> {
        let username = username.ok_or_else(|| {
            AuthRejection::BadCredentials(format!("No username from client {client_id}"))
        })?;
        let password = password.ok_or_else(|| {
            AuthRejection::BadCredentials(format!("No password for {username}"))
        })?;

        if !self.is_debug(username) && client_id != username {
            return Err(AuthRejection::NotAuthorized(format!(
                "Invalid client-id {client_id} for {username}"
            )));
        }

        let expect = self.store.lookup(username).await.ok_or_else(|| {
            AuthRejection::BadCredentials(format!("Unexpected driver {username}"))
        })?;
        if expect != *password {
            return Err(AuthRejection::BadCredentials(format!(
                "Bad password for {username}"
            )));
        }

        if self.is_debug(username) {
            Ok(AclEntry::debug(client_id))
        } else {
            Ok(AclEntry::for_driver(client_id))
        }
    }
}
