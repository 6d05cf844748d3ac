//! MySQL-backed route store.

use anyhow::{Context, Result, anyhow};
use sqlx::{
    Row,
    mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions, MySqlRow},
};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::{
    config::DatabaseConfig,
    route::{RouteRow, RouteTable},
    store::RouteSource,
};

pub const ROUTES_QUERY: &str = "SELECT listen_port, target_ip, target_port, protocol FROM routes";

const MAX_CONNECTIONS: u32 = 2;
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// Routes read from the `routes` table on every fetch.
pub struct SqlRouteSource {
    pool: MySqlPool,
}

impl SqlRouteSource {
    /// Connects eagerly, so an unreachable database fails here.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = MySqlPoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect_with(connect_options(config))
            .await
            .with_context(|| {
                format!(
                    "Failed to connect to database {} at {}:{}",
                    config.dbname, config.host, config.port
                )
            })?;

        info!(
            host = %config.host,
            port = config.port,
            dbname = %config.dbname,
            "Connected to route database"
        );
        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn connect_options(config: &DatabaseConfig) -> MySqlConnectOptions {
    MySqlConnectOptions::new()
        .host(&config.host)
        .port(config.port)
        .username(&config.user)
        .password(&config.password)
        .database(&config.dbname)
}

impl RouteSource for SqlRouteSource {
    async fn fetch(&self) -> Result<RouteTable> {
        let rows = sqlx::query(ROUTES_QUERY)
            .fetch_all(&self.pool)
            .await
            .context("Failed to query routes table")?;

        let mut table = RouteTable::new();
        for (index, row) in rows.iter().enumerate() {
            match route_row(row).and_then(RouteRow::into_route) {
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
                    warn!(row = index, error = %format!("{e:#}"), "Skipping malformed route row");
                }
            }
        }

        debug!(routes = table.len(), "Route table loaded from database");
        Ok(table)
    }
}

fn route_row(row: &MySqlRow) -> Result<RouteRow> {
    Ok(RouteRow {
        listen_port: int_column(row, "listen_port")?,
        target_ip: row
            .try_get("target_ip")
            .context("Failed to read target_ip")?,
        target_port: int_column(row, "target_port")?,
        protocol: row.try_get("protocol").context("Failed to read protocol")?,
    })
}

/// Reads a signed or unsigned integer column as `i64`.
fn int_column(row: &MySqlRow, column: &str) -> Result<i64> {
    if let Ok(value) = row.try_get::<i64, _>(column) {
        return Ok(value);
    }
    let value: u64 = row
        .try_get(column)
        .with_context(|| format!("Failed to read {column} as an integer"))?;
    i64::try_from(value).map_err(|_| anyhow!("{column} {value} is outside 1-65535"))
}
