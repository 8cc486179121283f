//! Connection options.
//!
//! `ConnectOptions` can be built in code, parsed from a libpq-style conninfo
//! string, or deserialized from TOML.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::constants::{
    DEFAULT_APPLICATION_NAME, DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_HOST, DEFAULT_PORT,
    DEFAULT_USER,
};
use crate::error::{Error, Result};

/// Options for opening a connection.
///
/// Session parameters are passed through to the server unchanged.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConnectOptions {
    /// Server host.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// User name sent in the startup message.
    pub user: String,
    /// Password, sent only when the server asks for one.
    pub password: Option<String>,
    /// Database name; the server defaults it to the user name.
    pub database: Option<String>,
    /// Application name reported to the server.
    pub application_name: Option<String>,
    /// Timeout for establishing the TCP connection and the handshake.
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,
    /// Deadline for each statement and each fetch. `None` waits forever.
    #[serde(with = "opt_duration_millis")]
    pub statement_timeout: Option<Duration>,
    /// Run every statement in its own server-side transaction.
    pub autocommit: bool,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            user: DEFAULT_USER.to_string(),
            password: None,
            database: None,
            application_name: Some(DEFAULT_APPLICATION_NAME.to_string()),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            statement_timeout: None,
            autocommit: false,
        }
    }
}

impl fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("database", &self.database)
            .field("application_name", &self.application_name)
            .field("connect_timeout", &self.connect_timeout)
            .field("statement_timeout", &self.statement_timeout)
            .field("autocommit", &self.autocommit)
            .finish()
    }
}

impl ConnectOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = Some(name.into());
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn statement_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.statement_timeout = timeout;
        self
    }

    pub fn autocommit(mut self, autocommit: bool) -> Self {
        self.autocommit = autocommit;
        self
    }

    /// Parse options from a TOML document.
    ///
    /// ```toml
    /// host = "db.internal"
    /// port = 5433
    /// user = "app"
    /// statement_timeout = 2500  # milliseconds
    /// ```
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| Error::Config(e.to_string()))
    }

    /// Key/value pairs of the startup message.
    pub(crate) fn startup_params(&self) -> Vec<(String, String)> {
        let mut params = vec![("user".to_string(), self.user.clone())];
        if let Some(database) = &self.database {
            params.push(("database".to_string(), database.clone()));
        }
        if let Some(name) = &self.application_name {
            params.push(("application_name".to_string(), name.clone()));
        }
        params
    }

    fn set(&mut self, key: &str, value: String) -> Result<()> {
        match key {
            "host" | "hostaddr" => self.host = value,
            "port" => {
                self.port = value
                    .parse()
                    .map_err(|_| Error::Config(format!("invalid port: {value:?}")))?;
            }
            "user" => self.user = value,
            "password" => self.password = Some(value),
            "dbname" | "database" => self.database = Some(value),
            "application_name" => self.application_name = Some(value),
            "connect_timeout" => {
                let secs: u64 = value
                    .parse()
                    .map_err(|_| Error::Config(format!("invalid connect_timeout: {value:?}")))?;
                self.connect_timeout = Duration::from_secs(secs);
            }
            "statement_timeout" => {
                let millis: u64 = value
                    .parse()
                    .map_err(|_| Error::Config(format!("invalid statement_timeout: {value:?}")))?;
                // 0 disables the timeout, as in PostgreSQL
                self.statement_timeout = (millis > 0).then(|| Duration::from_millis(millis));
            }
            "autocommit" => {
                self.autocommit = parse_bool(&value)
                    .ok_or_else(|| Error::Config(format!("invalid autocommit: {value:?}")))?;
            }
            "sslmode" => match value.as_str() {
                "disable" | "allow" | "prefer" => {}
                other => {
                    return Err(Error::Config(format!(
                        "sslmode {other:?} is not supported, TLS is unavailable"
                    )))
                }
            },
            other => return Err(Error::Config(format!("unknown option {other:?}"))),
        }
        Ok(())
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => None,
    }
}

/// Parses a libpq-style conninfo string: `host=127.0.0.1 port=5432 user=app`.
///
/// Values may be single-quoted; inside quotes `\'` and `\\` are escapes.
impl FromStr for ConnectOptions {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut options = ConnectOptions::default();
        let mut chars = s.chars().peekable();

        loop {
            while chars.next_if(|c| c.is_whitespace()).is_some() {}
            if chars.peek().is_none() {
                break;
            }

            let mut key = String::new();
            while let Some(c) = chars.next_if(|c| *c != '=' && !c.is_whitespace()) {
                key.push(c);
            }
            while chars.next_if(|c| c.is_whitespace()).is_some() {}
            if chars.next() != Some('=') {
                return Err(Error::Config(format!("missing \"=\" after {key:?}")));
            }
            while chars.next_if(|c| c.is_whitespace()).is_some() {}

            let mut value = String::new();
            if chars.next_if_eq(&'\'').is_some() {
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some('\\') => match chars.next() {
                            Some(c) => value.push(c),
                            None => return Err(Error::Config("unterminated quoted value".into())),
                        },
                        Some(c) => value.push(c),
                        None => return Err(Error::Config("unterminated quoted value".into())),
                    }
                }
            } else {
                while let Some(c) = chars.next_if(|c| !c.is_whitespace()) {
                    value.push(c);
                }
            }

            options.set(&key, value)?;
        }

        Ok(options)
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

mod opt_duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let millis = Option::<u64>::deserialize(d)?;
        Ok(millis.filter(|m| *m > 0).map(Duration::from_millis))
    }
}
