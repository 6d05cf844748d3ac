use anyhow::{Context, Result, bail, ensure};
use serde::Deserialize;
use std::{
    fmt, fs,
    net::{IpAddr, Ipv4Addr},
    path::{Path, PathBuf},
    time::Duration,
};

pub const CONFIG_FILE: &str = "config.toml";
pub const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_DATABASE_PORT: u16 = 3306;

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub listen: ListenConfig,
    pub database: Option<DatabaseConfig>,
    #[serde(default)]
    pub routes: RoutesConfig,
}

#[derive(Debug, Deserialize)]
pub struct ListenConfig {
    #[serde(default = "default_listen_ip")]
    pub ip: IpAddr,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            ip: default_listen_ip(),
        }
    }
}

/// Connection parameters for the MySQL route store.
#[derive(Clone, Deserialize)]
pub struct DatabaseConfig {
    pub user: String,
    #[serde(default)]
    pub password: String,
    pub host: String,
    #[serde(default = "default_database_port")]
    pub port: u16,
    pub dbname: String,
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("dbname", &self.dbname)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
pub struct RoutesConfig {
    /// Read routes from this TOML file instead of a database.
    pub file: Option<PathBuf>,
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
}

impl Default for RoutesConfig {
    fn default() -> Self {
        Self {
            file: None,
            refresh_interval_secs: default_refresh_interval_secs(),
        }
    }
}

impl RoutesConfig {
    #[must_use]
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }
}

/// Where the reconciler fetches its routes from.
#[derive(Debug, Clone, Copy)]
pub enum RouteStore<'a> {
    Database(&'a DatabaseConfig),
    File(&'a Path),
}

impl Config {
    /// The configured route store. Exactly one is present after parsing.
    pub fn route_store(&self) -> Result<RouteStore<'_>> {
        match (&self.database, &self.routes.file) {
            (Some(database), None) => Ok(RouteStore::Database(database)),
            (None, Some(file)) => Ok(RouteStore::File(file)),
            (Some(_), Some(_)) => bail!("Configure either [database] or routes.file, not both"),
            (None, None) => bail!("No route store configured: add a [database] section or routes.file"),
        }
    }
}

const fn default_listen_ip() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

const fn default_refresh_interval_secs() -> u64 {
    DEFAULT_REFRESH_INTERVAL_SECS
}

const fn default_database_port() -> u16 {
    DEFAULT_DATABASE_PORT
}

pub fn load_config() -> Result<Config> {
    load_config_from(CONFIG_FILE)
}

pub fn load_config_from(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {} file", path.display()))?;
    parse_config(&content).with_context(|| format!("Invalid configuration in {}", path.display()))
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config as valid TOML")?;
    ensure!(
        config.routes.refresh_interval_secs > 0,
        "routes.refresh_interval_secs must be greater than zero"
    );
    config.route_store()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_database_config() {
        let config = parse_config(
            r#"
            [listen]
            ip = "127.0.0.1"

            [database]
            user = "portmux"
            password = "secret"
            host = "db.internal"
            port = 3307
            dbname = "routing"

            [routes]
            refresh_interval_secs = 30
            "#,
        )
        .unwrap();

        assert_eq!(config.listen.ip, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(config.routes.refresh_interval(), Duration::from_secs(30));

        let RouteStore::Database(database) = config.route_store().unwrap() else {
            panic!("expected database route store");
        };
        assert_eq!(database.user, "portmux");
        assert_eq!(database.password, "secret");
        assert_eq!(database.host, "db.internal");
        assert_eq!(database.port, 3307);
        assert_eq!(database.dbname, "routing");
    }

    #[test]
    fn database_port_defaults_to_mysql() {
        let config = parse_config(
            "[database]\nuser = \"u\"\nhost = \"localhost\"\ndbname = \"routing\"\n",
        )
        .unwrap();

        let RouteStore::Database(database) = config.route_store().unwrap() else {
            panic!("expected database route store");
        };
        assert_eq!(database.port, DEFAULT_DATABASE_PORT);
        assert!(database.password.is_empty());
    }

    #[test]
    fn debug_output_hides_password() {
        let config = parse_config(
            "[database]\nuser = \"u\"\npassword = \"hunter2\"\nhost = \"h\"\ndbname = \"d\"\n",
        )
        .unwrap();

        let rendered = format!("{config:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn parses_file_store_with_defaults() {
        let config = parse_config("[routes]\nfile = \"routes.toml\"\n").unwrap();

        assert_eq!(config.listen.ip, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(
            config.routes.refresh_interval(),
            Duration::from_secs(DEFAULT_REFRESH_INTERVAL_SECS)
        );
        assert!(matches!(
            config.route_store().unwrap(),
            RouteStore::File(path) if path == Path::new("routes.toml")
        ));
    }

    #[test]
    fn rejects_zero_refresh_interval() {
        let result = parse_config("[routes]\nfile = \"r.toml\"\nrefresh_interval_secs = 0\n");
        tokio_test::assert_err!(result);
    }

    #[test]
    fn rejects_missing_route_store() {
        tokio_test::assert_err!(parse_config("[listen]\nip = \"0.0.0.0\"\n"));
    }

    #[test]
    fn rejects_two_route_stores() {
        let result = parse_config(
            "[database]\nuser = \"u\"\nhost = \"h\"\ndbname = \"d\"\n[routes]\nfile = \"r.toml\"\n",
        );
        tokio_test::assert_err!(result);
    }

    #[test]
    fn rejects_incomplete_database_section() {
        tokio_test::assert_err!(parse_config("[database]\nuser = \"u\"\nhost = \"h\"\n"));
    }

    #[test]
    fn rejects_malformed_listen_ip() {
        let result = parse_config("[listen]\nip = \"not-an-ip\"\n[routes]\nfile = \"r.toml\"\n");
        tokio_test::assert_err!(result);
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[routes]\nfile = \"routes.toml\"").unwrap();

        let config = load_config_from(file.path()).unwrap();
        assert_eq!(config.routes.file, Some(PathBuf::from("routes.toml")));
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        tokio_test::assert_err!(load_config_from(dir.path().join("absent.toml")));
    }
}
