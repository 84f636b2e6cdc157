use crate::store::Error;
use cookie::SameSite;

/// Configuration options for session cookies.
///
/// `max_age` doubles as the session lifetime handed to garbage collection.
///
/// # Example
///
/// ```rust
/// use hsess::CookieOptions;
///
/// let cookie_options = CookieOptions::build()
///         .name("test_sess")
///         .http_only(true)
///         .same_site(cookie::SameSite::Lax)
///         .secure(true)
///         .max_age(60 * 60)
///         .path("/");
/// ```
#[derive(Clone, Copy, Debug)]
pub struct CookieOptions {
    pub http_only: bool,
    pub name: &'static str,
    pub domain: Option<&'static str>,
    pub path: Option<&'static str>,
    pub same_site: SameSite,
    pub secure: bool,
    pub max_age: i64,
}

impl Default for CookieOptions {
    fn default() -> Self {
        Self {
            http_only: true,
            name: "hsess",
            domain: None,
            path: Some("/"),
            same_site: SameSite::Lax,
            secure: true,
            max_age: 60 * 60,
        }
    }
}

impl CookieOptions {
    /// Creates a new `CookieOptions` with default values.
    pub fn build() -> Self {
        Self::default()
    }

    /// Sets the name of the cookie.
    pub fn name(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    pub fn http_only(mut self, http_only: bool) -> Self {
        self.http_only = http_only;
        self
    }

    pub fn same_site(mut self, same_site: SameSite) -> Self {
        self.same_site = same_site;
        self
    }

    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// An empty domain leaves the attribute off.
    pub fn domain(mut self, domain: &'static str) -> Self {
        self.domain = (!domain.is_empty()).then_some(domain);
        self
    }

    pub fn path(mut self, path: &'static str) -> Self {
        self.path = Some(path);
        self
    }

    pub fn max_age(mut self, seconds: i64) -> Self {
        self.max_age = seconds;
        self
    }

    pub(crate) fn lifetime_secs(&self) -> u64 {
        u64::try_from(self.max_age).unwrap_or(0)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.name.is_empty() {
            return Err(Error::Config("cookie name must not be empty".to_string()));
        }
        if self.max_age <= 0 {
            return Err(Error::Config(
                "session lifetime must be a positive number of seconds".to_string(),
            ));
        }
        Ok(())
    }
}
