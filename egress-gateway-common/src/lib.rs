use std::collections::BTreeMap;
use std::fmt::Display;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

pub mod entry;
pub mod table;

pub use entry::{EntryKey, EntryValue, GatewayTarget, PolicyEntry, TableDiff};

/// JSON map of interface name to the addresses bound to it, in kernel order.
pub const INTERFACES_ANNOTATION: &str = "egress-gateway.mesh-cni.dev/interfaces";
/// Interface carrying the node's default route.
pub const DEFAULT_ROUTE_INTERFACE_ANNOTATION: &str =
    "egress-gateway.mesh-cni.dev/default-route-interface";

pub const DEFAULT_AGENT_PORT: u16 = 9965;

pub type NodeInterfaces = BTreeMap<String, Vec<IpAddr>>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid ip address: {0}")]
    AddrParseError(#[from] std::net::AddrParseError),

    #[error("invalid ip network: {0}")]
    InvalidIpNetwork(#[from] ipnetwork::IpNetworkError),

    #[error("malformed row {row}: {reason}")]
    MalformedRow { row: usize, reason: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Unspecified address of the same family as `ip`.
pub fn unspecified_like(ip: &IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    }
}

pub fn serialize_to_string<S, T>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
    T: ToString,
{
    value.to_string().serialize(serializer)
}

pub fn deserialize_from_str<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    T::Err: Display,
{
    let buf = String::deserialize(deserializer)?;
    T::from_str(&buf).map_err(|e| serde::de::Error::custom(e.to_string()))
}
