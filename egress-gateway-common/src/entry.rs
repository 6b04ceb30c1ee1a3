use std::collections::BTreeMap;
use std::fmt::Display;
use std::net::IpAddr;
use std::str::FromStr;

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};

use crate::{Error, deserialize_from_str, serialize_to_string};

const EXCLUDED: &str = "excluded";

/// Where matching traffic is sent. `Excluded` rows are installed for excluded
/// CIDRs so a longest-prefix lookup in the datapath skips the gateway.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum GatewayTarget {
    Node(IpAddr),
    Excluded,
}

impl Display for GatewayTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GatewayTarget::Node(ip) => write!(f, "{ip}"),
            GatewayTarget::Excluded => write!(f, "{EXCLUDED}"),
        }
    }
}

impl FromStr for GatewayTarget {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == EXCLUDED {
            return Ok(GatewayTarget::Excluded);
        }
        Ok(GatewayTarget::Node(s.parse()?))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryKey {
    pub source_ip: IpAddr,
    #[serde(
        serialize_with = "serialize_to_string",
        deserialize_with = "deserialize_from_str"
    )]
    pub destination_cidr: IpNetwork,
}

impl Display for EntryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -> {}", self.source_ip, self.destination_cidr)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EntryValue {
    /// Only set on the node that is itself the gateway
    pub egress_ip: Option<IpAddr>,
    pub gateway: GatewayTarget,
}

/// One row of a node's egress table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyEntry {
    pub source_ip: IpAddr,
    #[serde(
        serialize_with = "serialize_to_string",
        deserialize_with = "deserialize_from_str"
    )]
    pub destination_cidr: IpNetwork,
    #[serde(default)]
    pub egress_ip: Option<IpAddr>,
    #[serde(
        serialize_with = "serialize_to_string",
        deserialize_with = "deserialize_from_str"
    )]
    pub gateway_ip: GatewayTarget,
}

impl PolicyEntry {
    pub fn new(key: EntryKey, value: EntryValue) -> Self {
        Self {
            source_ip: key.source_ip,
            destination_cidr: key.destination_cidr,
            egress_ip: value.egress_ip,
            gateway_ip: value.gateway,
        }
    }

    pub fn key(&self) -> EntryKey {
        EntryKey {
            source_ip: self.source_ip,
            destination_cidr: self.destination_cidr,
        }
    }

    pub fn value(&self) -> EntryValue {
        EntryValue {
            egress_ip: self.egress_ip,
            gateway: self.gateway_ip,
        }
    }
}

/// Minimal set of operations turning one table into another.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDiff {
    #[serde(default)]
    pub upserts: Vec<PolicyEntry>,
    #[serde(default)]
    pub removals: Vec<EntryKey>,
}

impl TableDiff {
    pub fn between(
        installed: &BTreeMap<EntryKey, EntryValue>,
        desired: &BTreeMap<EntryKey, EntryValue>,
    ) -> Self {
        let upserts = desired
            .iter()
            .filter(|(key, value)| installed.get(key) != Some(value))
            .map(|(key, value)| PolicyEntry::new(*key, *value))
            .collect();
        let removals = installed
            .keys()
            .filter(|key| !desired.contains_key(key))
            .copied()
            .collect();
        Self { upserts, removals }
    }

    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.removals.is_empty()
    }
}
