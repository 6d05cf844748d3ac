//! Route stores the reconciler pulls its desired state from.

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::{
    fs,
    future::Future,
    path::{Path, PathBuf},
    sync::Mutex,
};
use tracing::{debug, warn};

use crate::route::{RouteRow, RouteTable};

/// Produces a fresh [`RouteTable`] once per reconciliation cycle.
///
/// An `Err` means the whole fetch failed and the cycle must be skipped.
/// Individually malformed rows are not errors; sources drop them and log.
pub trait RouteSource: Send + Sync {
    fn fetch(&self) -> impl Future<Output = Result<RouteTable>> + Send;
}

/// Routes read from a TOML file of `[[routes]]` rows, re-read on every fetch.
///
/// ```toml
/// [[routes]]
/// listen_port = 8080
/// target_ip = "10.0.0.5"
/// target_port = 80
/// protocol = "tcp"
/// ```
pub struct FileRouteSource {
    path: PathBuf,
}

#[derive(Deserialize)]
struct RoutesFile {
    #[serde(default)]
    routes: Vec<toml::Value>,
}

impl FileRouteSource {
    /// Opens the store, failing if the file cannot be read right now.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        fs::metadata(&path)
            .with_context(|| format!("Route store {} is not readable", path.display()))?;
        Ok(Self { path })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RouteSource for FileRouteSource {
    async fn fetch(&self) -> Result<RouteTable> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read route store {}", self.path.display()))?;
        parse_routes(&content)
            .with_context(|| format!("Failed to parse route store {}", self.path.display()))
    }
}

/// Parses the routes document, skipping rows that do not validate.
pub fn parse_routes(content: &str) -> Result<RouteTable> {
    let file: RoutesFile = toml::from_str(content).context("Route store is not valid TOML")?;
    let mut table = RouteTable::new();

    for (index, value) in file.routes.into_iter().enumerate() {
        let parsed = value
            .try_into::<RouteRow>()
            .map_err(anyhow::Error::from)
            .and_then(RouteRow::into_route);

        match parsed {
            Ok((listen_port, route)) => {
                if let Some(previous) = table.insert(listen_port, route) {
                    warn!(
                        row = index,
                        listen_port,
                        replaced_target = %previous.target_addr(),
                        "Duplicate listen port, later row wins"
                    );
                }
            }
            Err(e) => {
                warn!(row = index, error = %e, "Skipping malformed route row");
            }
        }
    }

    debug!(routes = table.len(), "Route table parsed");
    Ok(table)
}

/// In-memory route store. Starts empty; can be switched into a failing state.
#[derive(Default)]
pub struct StaticRouteSource {
    table: Mutex<Option<RouteTable>>,
}

impl StaticRouteSource {
    #[must_use]
    pub fn new(table: RouteTable) -> Self {
        Self {
            table: Mutex::new(Some(table)),
        }
    }

    pub fn set(&self, table: RouteTable) {
        if let Ok(mut guard) = self.table.lock() {
            *guard = Some(table);
        }
    }

    /// Makes every subsequent fetch fail until [`Self::set`] is called.
    pub fn fail(&self) {
        if let Ok(mut guard) = self.table.lock() {
            *guard = None;
        }
    }
}

impl RouteSource for StaticRouteSource {
    async fn fetch(&self) -> Result<RouteTable> {
        let guard = self
            .table
            .lock()
            .map_err(|_| anyhow!("Static route store lock poisoned"))?;
        guard
            .clone()
            .ok_or_else(|| anyhow!("Static route store is unavailable"))
    }
}
