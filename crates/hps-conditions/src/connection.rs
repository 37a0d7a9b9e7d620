use std::{
    fmt,
    net::{TcpStream, ToSocketAddrs},
    path::Path,
    str::FromStr,
    thread,
    time::Duration,
};

use rusqlite::{Connection, OpenFlags};
use strum::{Display, EnumString};
use tracing::{debug, info, warn};

use crate::{ConditionsError, ConditionsResult};

/// Environment variable naming a connection properties file.
pub const CONNECTION_ENV_VAR: &str = "HPS_CONDITIONS_CONNECTION";

/// Port used when the properties do not name one.
pub const DEFAULT_PORT: u16 = 3306;

/// Host whose reachability selects the JLab connection over the SLAC one.
pub const PROBE_HOST: &str = "jmysql.jlab.org";

/// How long the reachability check waits for [`PROBE_HOST`].
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection settings read from `key=value` properties.
///
/// `database` is the path of the SQLite file. `hostname` and `port` name the server the file
/// belongs to and are only used to describe the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionParameters {
    pub(crate) user: String,
    pub(crate) password: String,
    pub(crate) database: String,
    pub(crate) hostname: String,
    pub(crate) port: u16,
}

impl ConnectionParameters {
    /// Parameters from explicit values.
    pub fn new(user: &str, password: &str, database: &str, hostname: &str, port: u16) -> Self {
        Self {
            user: user.to_string(),
            password: password.to_string(),
            database: database.to_string(),
            hostname: hostname.to_string(),
            port,
        }
    }

    /// Parameters for a local SQLite file.
    pub fn sqlite(path: impl AsRef<Path>) -> Self {
        Self::new(
            "",
            "",
            &path.as_ref().to_string_lossy(),
            "localhost",
            DEFAULT_PORT,
        )
    }

    /// Reads parameters from a properties file.
    pub fn from_file(path: impl AsRef<Path>) -> ConditionsResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConditionsError::ConnectionFileNotFound(
                path.display().to_string(),
            ));
        }
        std::fs::read_to_string(path)?.parse()
    }

    /// Reads parameters from the file named by [`CONNECTION_ENV_VAR`], if it is set.
    pub fn from_env() -> ConditionsResult<Option<Self>> {
        match std::env::var(CONNECTION_ENV_VAR) {
            Ok(path) => {
                info!("using connection properties from {CONNECTION_ENV_VAR}={path}");
                Self::from_file(path).map(Some)
            }
            Err(_) => Ok(None),
        }
    }

    /// Database user.
    pub fn user(&self) -> &str {
        &self.user
    }
    /// Database password.
    pub fn password(&self) -> &str {
        &self.password
    }
    /// Path of the SQLite database file.
    pub fn database(&self) -> &str {
        &self.database
    }
    /// Server the database belongs to.
    pub fn hostname(&self) -> &str {
        &self.hostname
    }
    /// Server port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Opens the database, retrying with the default [`RetryPolicy`].
    pub fn create_connection(&self, busy_timeout: Duration) -> ConditionsResult<Connection> {
        self.create_connection_with(&RetryPolicy::default(), busy_timeout, thread::sleep)
    }

    /// Opens the database, retrying according to `policy` and waiting through `sleep`.
    pub fn create_connection_with(
        &self,
        policy: &RetryPolicy,
        busy_timeout: Duration,
        sleep: impl FnMut(Duration),
    ) -> ConditionsResult<Connection> {
        let result = retry_with_backoff(
            policy,
            |attempt| -> rusqlite::Result<Connection> {
                debug!("opening {self} (attempt {attempt})");
                let connection = Connection::open_with_flags(
                    &self.database,
                    OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
                )?;
                connection.busy_timeout(busy_timeout)?;
                connection.pragma_update(None, "foreign_keys", "ON")?;
                Ok(connection)
            },
            sleep,
        );
        result.map_err(|(attempts, source)| ConditionsError::ConnectionFailed {
            connection: self.to_string(),
            attempts,
            source,
        })
    }
}

impl fmt::Display for ConnectionParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.user.is_empty() {
            write!(f, "{}:{}/{}", self.hostname, self.port, self.database)
        } else {
            write!(
                f,
                "{}@{}:{}/{}",
                self.user, self.hostname, self.port, self.database
            )
        }
    }
}

impl FromStr for ConnectionParameters {
    type Err = ConditionsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut user = None;
        let mut password = None;
        let mut database = None;
        let mut hostname = None;
        let mut port = None;
        for line in s.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim().to_string();
            match key.trim() {
                "user" => user = Some(value),
                "password" => password = Some(value),
                "database" => database = Some(value),
                "hostname" => hostname = Some(value),
                "port" => {
                    port = Some(value.parse::<u16>().map_err(|_| {
                        ConditionsError::InvalidConnectionProperty {
                            key: "port",
                            value: value.clone(),
                        }
                    })?);
                }
                _ => {}
            }
        }
        Ok(Self {
            user: user.ok_or(ConditionsError::MissingConnectionProperty("user"))?,
            password: password.ok_or(ConditionsError::MissingConnectionProperty("password"))?,
            database: database.ok_or(ConditionsError::MissingConnectionProperty("database"))?,
            hostname: hostname.ok_or(ConditionsError::MissingConnectionProperty("hostname"))?,
            port: port.unwrap_or(DEFAULT_PORT),
        })
    }
}

/// Connection properties shipped with the crate.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, EnumString, Display)]
#[strum(serialize_all = "lowercase")]
pub enum ConnectionResource {
    /// `jlab_connection.prop`
    Jlab,
    /// `slac_connection.prop`
    Slac,
}

impl ConnectionResource {
    /// The bundled properties text.
    pub fn properties(&self) -> &'static str {
        match self {
            Self::Jlab => include_str!("../resources/jlab_connection.prop"),
            Self::Slac => include_str!("../resources/slac_connection.prop"),
        }
    }
    /// Parses the bundled properties.
    pub fn parameters(&self) -> ConditionsResult<ConnectionParameters> {
        self.properties().parse()
    }

    /// Picks JLab when [`PROBE_HOST`] answers within [`PROBE_TIMEOUT`], SLAC otherwise.
    pub fn select() -> Self {
        if host_reachable(PROBE_HOST, DEFAULT_PORT, PROBE_TIMEOUT) {
            Self::Jlab
        } else {
            Self::Slac
        }
    }
}

fn host_reachable(host: &str, port: u16, timeout: Duration) -> bool {
    let addrs = match (host, port).to_socket_addrs() {
        Ok(addrs) => addrs,
        Err(e) => {
            warn!("could not resolve {host}: {e}");
            return false;
        }
    };
    for addr in addrs {
        if TcpStream::connect_timeout(&addr, timeout).is_ok() {
            return true;
        }
    }
    debug!("{host}:{port} is not reachable");
    false
}

/// Parameters from the environment if set, else the canned resource for the current network.
pub fn default_parameters() -> ConditionsResult<ConnectionParameters> {
    if let Some(parameters) = ConnectionParameters::from_env()? {
        return Ok(parameters);
    }
    let resource = ConnectionResource::select();
    info!("using {resource} connection resource");
    resource.parameters()
}

/// Bounded retry with a linearly growing wait between attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts before giving up, including the first.
    pub max_attempts: u32,
    /// Wait after failed attempt `n` is `n * backoff_step`.
    pub backoff_step: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            backoff_step: Duration::from_secs(5),
        }
    }
}

/// Runs `op` until it succeeds or `policy.max_attempts` attempts have failed.
///
/// After failed attempt `n` (counting from 1) the wait is `n * backoff_step`. There is no wait
/// after the last attempt. On failure the attempt count and the last error are returned.
pub fn retry_with_backoff<T, E: fmt::Display>(
    policy: &RetryPolicy,
    mut op: impl FnMut(u32) -> Result<T, E>,
    mut sleep: impl FnMut(Duration),
) -> Result<T, (u32, E)> {
    let mut attempt = 1;
    loop {
        match op(attempt) {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= policy.max_attempts => return Err((attempt, e)),
            Err(e) => {
                let wait = policy.backoff_step * attempt;
                warn!("attempt {attempt} failed: {e}; retrying in {wait:?}");
                sleep(wait);
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn properties_parse_with_comments_and_default_port() {
        let parameters: ConnectionParameters = "# conditions db\n\
             ! read only\n\
             user = reader\n\
             password=secret\n\
             database=/tmp/hps_conditions.sqlite\n\
             hostname=localhost\n"
            .parse()
            .unwrap();
        assert_eq!(parameters.user(), "reader");
        assert_eq!(parameters.password(), "secret");
        assert_eq!(parameters.database(), "/tmp/hps_conditions.sqlite");
        assert_eq!(parameters.port(), DEFAULT_PORT);
        assert_eq!(
            parameters.to_string(),
            "reader@localhost:3306//tmp/hps_conditions.sqlite"
        );
    }

    #[test]
    fn missing_and_invalid_properties() {
        let err = "user=a\npassword=b\nhostname=c\n"
            .parse::<ConnectionParameters>()
            .unwrap_err();
        assert!(matches!(
            err,
            ConditionsError::MissingConnectionProperty("database")
        ));
        let err = "user=a\npassword=b\ndatabase=d\nhostname=c\nport=http\n"
            .parse::<ConnectionParameters>()
            .unwrap_err();
        assert!(matches!(
            err,
            ConditionsError::InvalidConnectionProperty { key: "port", .. }
        ));
    }

    #[test]
    fn canned_resources_parse() {
        let jlab = ConnectionResource::Jlab.parameters().unwrap();
        assert_eq!(jlab.hostname(), PROBE_HOST);
        let slac = ConnectionResource::Slac.parameters().unwrap();
        assert_eq!(slac.port(), 3306);
        assert_eq!("slac".parse::<ConnectionResource>().unwrap(), ConnectionResource::Slac);
    }

    #[test]
    fn missing_properties_file() {
        let err = ConnectionParameters::from_file("/nonexistent/hps.prop").unwrap_err();
        assert!(matches!(err, ConditionsError::ConnectionFileNotFound(_)));
    }

    #[test]
    fn retry_waits_grow_linearly() {
        let mut waits = Vec::new();
        let mut calls = 0;
        let result: Result<(), (u32, String)> = retry_with_backoff(
            &RetryPolicy::default(),
            |_| {
                calls += 1;
                Err("unreachable".to_string())
            },
            |wait| waits.push(wait.as_secs()),
        );
        assert_eq!(result.unwrap_err().0, 10);
        assert_eq!(calls, 10);
        assert_eq!(waits, vec![5, 10, 15, 20, 25, 30, 35, 40, 45]);
    }

    #[test]
    fn retry_stops_at_first_success() {
        let mut waits = 0;
        let result: Result<u32, (u32, String)> = retry_with_backoff(
            &RetryPolicy::default(),
            |attempt| {
                if attempt < 3 {
                    Err(format!("attempt {attempt}"))
                } else {
                    Ok(attempt)
                }
            },
            |_| waits += 1,
        );
        assert_eq!(result.unwrap(), 3);
        assert_eq!(waits, 2);
    }
}
