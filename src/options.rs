//! Construction-time configuration.

use crate::CookieOptions;
use crate::store::Error;
use crate::store::handlersocket::DEFAULT_MAX_RESPONSE;
use std::time::Duration;

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 9999;
pub const DEFAULT_DBNAME: &str = "session";
pub const DEFAULT_DBTABLE: &str = "php_session";

/// Where the session table lives.
///
/// # Example
///
/// ```rust
/// use hsess::ServerOptions;
/// use std::time::Duration;
///
/// let server = ServerOptions::build()
///     .host("db.internal")
///     .port(9999)
///     .dbname("session")
///     .dbtable("php_session")
///     .io_timeout(Duration::from_secs(2));
/// assert!(server.validate().is_ok());
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerOptions {
    pub host: String,
    pub port: u16,
    pub dbname: String,
    pub dbtable: String,
    /// Upper bound for establishing the TCP connection.
    pub connect_timeout: Option<Duration>,
    /// Upper bound for one request/response exchange.
    pub io_timeout: Option<Duration>,
    /// Longest response line accepted, in bytes.
    pub max_response: u64,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            dbname: DEFAULT_DBNAME.to_string(),
            dbtable: DEFAULT_DBTABLE.to_string(),
            connect_timeout: Some(Duration::from_secs(5)),
            io_timeout: None,
            max_response: DEFAULT_MAX_RESPONSE,
        }
    }
}

impl ServerOptions {
    /// Creates a new `ServerOptions` with default values.
    pub fn build() -> Self {
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

    pub fn dbname(mut self, dbname: impl Into<String>) -> Self {
        self.dbname = dbname.into();
        self
    }

    pub fn dbtable(mut self, dbtable: impl Into<String>) -> Self {
        self.dbtable = dbtable.into();
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = Some(timeout);
        self
    }

    pub fn max_response(mut self, bytes: u64) -> Self {
        self.max_response = bytes;
        self
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.port == 0 {
            return Err(Error::Config("port must not be 0".to_string()));
        }
        if self.max_response == 0 {
            return Err(Error::Config("max_response must not be 0".to_string()));
        }
        check_name("host", &self.host)?;
        check_name("dbname", &self.dbname)?;
        check_name("dbtable", &self.dbtable)
    }
}

fn check_name(what: &str, value: &str) -> Result<(), Error> {
    if value.is_empty() {
        return Err(Error::Config(format!("{what} must not be empty")));
    }
    if value.bytes().any(|b| matches!(b, b'\t' | b'\n' | b'\0')) {
        return Err(Error::Config(format!(
            "{what} must not contain tabs, newlines or NUL bytes"
        )));
    }
    Ok(())
}

/// Everything needed to bootstrap sessions.
#[derive(Clone, Debug, Default)]
pub struct Options {
    pub cookie: CookieOptions,
    pub server: ServerOptions,
}

impl Options {
    pub fn build() -> Self {
        Self::default()
    }

    pub fn cookie(mut self, cookie: CookieOptions) -> Self {
        self.cookie = cookie;
        self
    }

    pub fn server(mut self, server: ServerOptions) -> Self {
        self.server = server;
        self
    }

    pub fn validate(&self) -> Result<(), Error> {
        self.cookie.validate()?;
        self.server.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = Options::default();
        assert_eq!(options.server.host, "localhost");
        assert_eq!(options.server.port, 9999);
        assert_eq!(options.server.dbname, "session");
        assert_eq!(options.server.dbtable, "php_session");
        assert_eq!(options.cookie.path, Some("/"));
        assert_eq!(options.cookie.domain, None);
        assert_eq!(options.cookie.max_age, 3600);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        assert!(matches!(
            ServerOptions::build().port(0).validate(),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            ServerOptions::build().max_response(0).validate(),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            ServerOptions::build().dbtable("").validate(),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            ServerOptions::build().dbname("ses\tsion").validate(),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            Options::build()
                .cookie(CookieOptions::build().max_age(0))
                .validate(),
            Err(Error::Config(_))
        ));
    }
}
