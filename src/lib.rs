//! Dynamic Port Forwarder
//!
//! Reads a routing table of listen port → target host:port from a route store
//! (a MySQL `routes` table or a TOML file), opens TCP and/or UDP listeners for
//! every listed port, and relays traffic to the targets. The table is re-read
//! periodically and the live listener set is reconciled against it without
//! restarting the process.

pub mod config;
pub mod forward;
pub mod listener;
pub mod reconcile;
pub mod registry;
pub mod route;
pub mod sql;
pub mod store;

// Re-export commonly used types and functions
pub use config::{
    Config, DatabaseConfig, ListenConfig, RouteStore, RoutesConfig, load_config, load_config_from,
};
pub use forward::{MAX_DATAGRAM_SIZE, forward_datagram, forward_tcp};
pub use reconcile::Reconciler;
pub use registry::{ListenerHandle, ListenerId, ListenerRegistry, RegistrySnapshot, Transport};
pub use route::{Protocol, Route, RouteRow, RouteTable};
pub use sql::SqlRouteSource;
pub use store::{FileRouteSource, RouteSource, StaticRouteSource, parse_routes};
