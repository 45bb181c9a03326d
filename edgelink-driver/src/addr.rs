//! Address assignments: wire format and the validated table.

use crate::error::{DriverError, DriverResult};
use crate::handler::Handler;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Required `version` field of an address packet.
pub const ADDR_VERSION: u32 = 1;

/// The `addr` packet as it appears on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddressConfig {
    pub version: u32,
    /// topic id -> raw device address spec
    #[serde(default)]
    pub addrs: HashMap<String, String>,
    /// consuming device -> polling group
    #[serde(default)]
    pub groups: HashMap<String, AddressGroup>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddressGroup {
    /// Polling cadence in milliseconds.
    pub poll: u64,
    /// Topic ids this device consumes; each must exist in `addrs`.
    #[serde(default)]
    pub addrs: BTreeSet<String>,
}

/// One accepted address: the raw spec and the handler's parsed form.
#[derive(Debug, Clone)]
pub struct AddressEntry<A> {
    pub raw: String,
    pub parsed: A,
}

/// The driver's live address table.
///
/// Built all-or-nothing from an [`AddressConfig`]: a single invalid entry
/// rejects the whole packet, so a partially applied table can never exist.
#[derive(Debug, Default)]
pub struct AddressTable<A> {
    /// topic id -> entry
    entries: HashMap<String, AddressEntry<A>>,
    /// raw spec -> topic id, for routing pushed data
    topics: HashMap<String, String>,
}

impl<A: Clone> AddressTable<A> {
    /// Validate a packet against a handler and build the table.
    pub fn build<H>(handler: &H, config: &AddressConfig) -> DriverResult<Self>
    where
        H: Handler<Address = A>,
    {
        if config.version != ADDR_VERSION {
            return Err(DriverError::AddressError(format!(
                "Bad addr config version: {}",
                config.version
            )));
        }

        if let Some(valid) = handler.valid_addrs() {
            let bad: Vec<&str> = config
                .addrs
                .values()
                .filter(|spec| !valid.contains(*spec))
                .map(String::as_str)
                .collect();
            if !bad.is_empty() {
                return Err(DriverError::AddressError(format!(
                    "Addresses outside the declared set: {bad:?}"
                )));
            }
        }

        let mut entries = HashMap::with_capacity(config.addrs.len());
        let mut topics = HashMap::with_capacity(config.addrs.len());
        for (topic_id, spec) in &config.addrs {
            let Some(parsed) = handler.parse_address(spec) else {
                return Err(DriverError::AddressError(format!(
                    "Invalid address spec: {spec}"
                )));
            };
            entries.insert(
                topic_id.clone(),
                AddressEntry {
                    raw: spec.clone(),
                    parsed,
                },
            );
            topics.insert(spec.clone(), topic_id.clone());
        }

        // A group naming a topic id the table does not hold is a protocol
        // error, not something to ignore.
        for (device, group) in &config.groups {
            for topic_id in &group.addrs {
                if !entries.contains_key(topic_id) {
                    return Err(DriverError::AddressError(format!(
                        "Group {device} references unknown topic id {topic_id}"
                    )));
                }
            }
        }

        Ok(Self { entries, topics })
    }

    pub fn lookup(&self, topic_id: &str) -> Option<&AddressEntry<A>> {
        self.entries.get(topic_id)
    }

    /// Resolve the topic id for a raw spec (push-data routing).
    pub fn topic_for_spec(&self, spec: &str) -> Option<&str> {
        self.topics.get(spec).map(String::as_str)
    }

    /// All parsed addresses, for handler subscription.
    pub fn specs(&self) -> Vec<A> {
        self.entries.values().map(|e| e.parsed.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
