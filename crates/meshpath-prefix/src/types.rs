//! Prefix database data model and request channel types.

use core::fmt;
use core::str::FromStr;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// An IP prefix: address plus mask length.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[must_use]
pub struct IpPrefix {
    pub addr: IpAddr,
    pub prefix_len: u8,
}

impl IpPrefix {
    /// Maximum mask length for the address family.
    #[must_use]
    pub fn max_len(&self) -> u8 {
        match self.addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid prefix '{0}'")]
pub struct InvalidPrefix(pub String);

impl FromStr for IpPrefix {
    type Err = InvalidPrefix;

    /// Parse the conventional `address/len` form.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr_str, len_str) = s
            .split_once('/')
            .ok_or_else(|| InvalidPrefix(s.to_string()))?;
        let addr: IpAddr = addr_str.parse().map_err(|_| InvalidPrefix(s.to_string()))?;
        let prefix_len: u8 = len_str.parse().map_err(|_| InvalidPrefix(s.to_string()))?;

        let prefix = Self { addr, prefix_len };
        if prefix_len > prefix.max_len() {
            return Err(InvalidPrefix(s.to_string()));
        }
        Ok(prefix)
    }
}

impl fmt::Display for IpPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

/// Source-of-advertisement tag for a prefix entry.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum PrefixType {
    Loopback = 1,
    Default = 2,
    PrefixAllocator = 3,
    Breeze = 4,
    Rib = 5,
    Bgp = 6,
}

impl PrefixType {
    #[must_use]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(PrefixType::Loopback),
            2 => Some(PrefixType::Default),
            3 => Some(PrefixType::PrefixAllocator),
            4 => Some(PrefixType::Breeze),
            5 => Some(PrefixType::Rib),
            6 => Some(PrefixType::Bgp),
            _ => None,
        }
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            PrefixType::Loopback => "LOOPBACK",
            PrefixType::Default => "DEFAULT",
            PrefixType::PrefixAllocator => "PREFIX_ALLOCATOR",
            PrefixType::Breeze => "BREEZE",
            PrefixType::Rib => "RIB",
            PrefixType::Bgp => "BGP",
        }
    }
}

impl fmt::Display for PrefixType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One advertised prefix.
///
/// `data` is an opaque payload propagated verbatim to readers of the
/// published database. An entry is persistent unless `ephemeral` is
/// explicitly `Some(true)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[must_use]
pub struct PrefixEntry {
    pub prefix: IpPrefix,
    pub prefix_type: PrefixType,
    #[serde(default)]
    pub data: Vec<u8>,
    #[serde(default)]
    pub ephemeral: Option<bool>,
}

impl PrefixEntry {
    pub fn new(prefix: IpPrefix, prefix_type: PrefixType) -> Self {
        Self {
            prefix,
            prefix_type,
            data: Vec::new(),
            ephemeral: None,
        }
    }

    /// Persistent entries are written to durable storage; ephemeral ones
    /// appear only in the published database.
    #[must_use]
    pub fn is_persistent(&self) -> bool {
        !self.ephemeral.unwrap_or(false)
    }
}

/// A `(node, event, timestamp)` performance marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerfEvent {
    pub node_name: String,
    pub event_name: String,
    pub unix_ts_ms: i64,
}

/// Performance markers attached to a persisted database.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerfEvents {
    pub events: Vec<PerfEvent>,
}

/// The serialized form of a node's prefix advertisements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[must_use]
pub struct PrefixDatabase {
    pub this_node_name: String,
    pub prefix_entries: Vec<PrefixEntry>,
    #[serde(default)]
    pub perf_events: Option<PerfEvents>,
}

/// Commands accepted on the prefix request channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefixCommand {
    AddPrefixes,
    WithdrawPrefixes,
    WithdrawPrefixesByType,
    SyncPrefixesByType,
    GetAllPrefixes,
    GetPrefixesByType,
    /// A command tag this node does not understand.
    Unknown(u8),
}

impl PrefixCommand {
    #[must_use]
    pub fn as_u8(self) -> u8 {
        match self {
            PrefixCommand::AddPrefixes => 1,
            PrefixCommand::WithdrawPrefixes => 2,
            PrefixCommand::WithdrawPrefixesByType => 3,
            PrefixCommand::SyncPrefixesByType => 4,
            PrefixCommand::GetAllPrefixes => 5,
            PrefixCommand::GetPrefixesByType => 6,
            PrefixCommand::Unknown(v) => v,
        }
    }

    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => PrefixCommand::AddPrefixes,
            2 => PrefixCommand::WithdrawPrefixes,
            3 => PrefixCommand::WithdrawPrefixesByType,
            4 => PrefixCommand::SyncPrefixesByType,
            5 => PrefixCommand::GetAllPrefixes,
            6 => PrefixCommand::GetPrefixesByType,
            other => PrefixCommand::Unknown(other),
        }
    }
}

/// A tagged request on the prefix command channel.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub struct PrefixRequest {
    pub command: PrefixCommand,
    pub prefix_type: Option<PrefixType>,
    pub prefixes: Vec<PrefixEntry>,
}

impl PrefixRequest {
    pub fn new(command: PrefixCommand) -> Self {
        Self {
            command,
            prefix_type: None,
            prefixes: Vec::new(),
        }
    }

    pub fn with_prefixes(command: PrefixCommand, prefixes: Vec<PrefixEntry>) -> Self {
        Self {
            command,
            prefix_type: None,
            prefixes,
        }
    }

    pub fn with_type(command: PrefixCommand, prefix_type: PrefixType) -> Self {
        Self {
            command,
            prefix_type: Some(prefix_type),
            prefixes: Vec::new(),
        }
    }
}

/// The response to a [`PrefixRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub struct PrefixResponse {
    pub success: bool,
    pub message: Option<String>,
    pub prefixes: Vec<PrefixEntry>,
}

impl PrefixResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            message: None,
            prefixes: Vec::new(),
        }
    }

    pub fn ok_with(prefixes: Vec<PrefixEntry>) -> Self {
        Self {
            success: true,
            message: None,
            prefixes,
        }
    }

    pub fn fail(message: &str) -> Self {
        Self {
            success: false,
            message: Some(message.to_string()),
            prefixes: Vec::new(),
        }
    }
}
