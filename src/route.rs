//! Forwarding rules and the per-cycle route table.

use anyhow::{Result, anyhow, ensure};
use serde::Deserialize;
use std::{collections::BTreeMap, fmt, str::FromStr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
    Both,
}

impl Protocol {
    #[must_use]
    pub const fn includes_tcp(self) -> bool {
        matches!(self, Self::Tcp | Self::Both)
    }

    #[must_use]
    pub const fn includes_udp(self) -> bool {
        matches!(self, Self::Udp | Self::Both)
    }
}

impl FromStr for Protocol {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            "both" => Ok(Self::Both),
            other => Err(anyhow!("Unknown protocol: {other:?}")),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Both => "both",
        })
    }
}

/// One forwarding rule. Never mutated once read; the next fetch replaces it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub target_host: String,
    pub target_port: u16,
    pub protocol: Protocol,
}

impl Route {
    pub fn new(target_host: impl Into<String>, target_port: u16, protocol: Protocol) -> Result<Self> {
        let target_host = target_host.into();
        ensure!(!target_host.trim().is_empty(), "Target host must not be empty");
        ensure!(target_port != 0, "Target port must be in 1-65535");
        Ok(Self {
            target_host,
            target_port,
            protocol,
        })
    }

    /// Whether both routes send traffic to the same host and port.
    #[must_use]
    pub fn same_target(&self, other: &Self) -> bool {
        self.target_host == other.target_host && self.target_port == other.target_port
    }

    /// `host:port`, bracketing bare IPv6 literals.
    #[must_use]
    pub fn target_addr(&self) -> String {
        if self.target_host.contains(':') && !self.target_host.starts_with('[') {
            format!("[{}]:{}", self.target_host, self.target_port)
        } else {
            format!("{}:{}", self.target_host, self.target_port)
        }
    }
}

/// A raw row as the route store exposes it, before validation.
#[derive(Debug, Deserialize)]
pub struct RouteRow {
    pub listen_port: i64,
    pub target_ip: String,
    pub target_port: i64,
    pub protocol: String,
}

impl RouteRow {
    pub fn into_route(self) -> Result<(u16, Route)> {
        let listen_port = port_from_column("listen_port", self.listen_port)?;
        let target_port = port_from_column("target_port", self.target_port)?;
        let protocol = self.protocol.parse()?;
        Ok((listen_port, Route::new(self.target_ip, target_port, protocol)?))
    }
}

fn port_from_column(column: &str, value: i64) -> Result<u16> {
    u16::try_from(value)
        .ok()
        .filter(|port| *port != 0)
        .ok_or_else(|| anyhow!("{column} {value} is outside 1-65535"))
}

/// Snapshot of the desired state for one reconciliation cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteTable {
    routes: BTreeMap<u16, Route>,
}

impl RouteTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the route previously stored for `listen_port`, if any.
    pub fn insert(&mut self, listen_port: u16, route: Route) -> Option<Route> {
        self.routes.insert(listen_port, route)
    }

    #[must_use]
    pub fn get(&self, listen_port: u16) -> Option<&Route> {
        self.routes.get(&listen_port)
    }

    #[must_use]
    pub fn contains(&self, listen_port: u16) -> bool {
        self.routes.contains_key(&listen_port)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u16, &Route)> {
        self.routes.iter().map(|(port, route)| (*port, route))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn tcp_ports(&self) -> impl Iterator<Item = u16> + '_ {
        self.iter()
            .filter(|(_, route)| route.protocol.includes_tcp())
            .map(|(port, _)| port)
    }

    pub fn udp_ports(&self) -> impl Iterator<Item = u16> + '_ {
        self.iter()
            .filter(|(_, route)| route.protocol.includes_udp())
            .map(|(port, _)| port)
    }
}

impl FromIterator<(u16, Route)> for RouteTable {
    fn from_iter<I: IntoIterator<Item = (u16, Route)>>(iter: I) -> Self {
        Self {
            routes: iter.into_iter().collect(),
        }
    }
}
