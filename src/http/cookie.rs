//! Outgoing cookie construction and `Set-Cookie` serialization.

use crate::error::{Error, Result};
use std::time::{Duration, SystemTime};

/// A cookie to be attached to a response via
/// [`Response::set_cookie`](super::Response::set_cookie).
///
/// Defaults: path `/`, empty domain, `Max-Age` of 24 hours, no `Secure`,
/// `HttpOnly` or `SameSite` attribute.
#[derive(Debug, Clone)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub path: String,
    pub domain: String,
    pub secure: bool,
    pub http_only: bool,
    pub max_age: Duration,
    pub same_site: String,
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            path: "/".to_string(),
            domain: String::new(),
            secure: false,
            http_only: false,
            max_age: Duration::from_secs(24 * 60 * 60),
            same_site: String::new(),
        }
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    pub fn http_only(mut self, http_only: bool) -> Self {
        self.http_only = http_only;
        self
    }

    pub fn max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn same_site(mut self, same_site: impl Into<String>) -> Self {
        self.same_site = same_site.into();
        self
    }

    /// Validate prefix constraints and render the full `Set-Cookie` line.
    ///
    /// `__Secure-` names require the `Secure` attribute; `__Host-` names
    /// additionally require an empty domain and path `/`. When `Max-Age`
    /// is positive an `Expires` attribute is emitted as well, computed
    /// from the current UTC time in RFC 7231 IMF-fixdate form.
    pub(crate) fn serialize(&self) -> Result<String> {
        if self.name.starts_with("__Secure-") && !self.secure {
            return Err(Error::Handler(
                "__Secure- cookies require the Secure attribute".to_string(),
            ));
        }
        if self.name.starts_with("__Host-")
            && (!self.secure || !self.domain.is_empty() || self.path != "/")
        {
            return Err(Error::Handler(
                "__Host- cookies require Secure, no Domain and Path=/".to_string(),
            ));
        }

        let mut line = format!("{}={}", self.name, self.value);

        if !self.domain.is_empty() {
            line.push_str("; Domain=");
            line.push_str(&self.domain);
        }
        if !self.path.is_empty() {
            line.push_str("; Path=");
            line.push_str(&self.path);
        }
        if self.max_age.as_secs() > 0 {
            line.push_str(&format!("; Max-Age={}", self.max_age.as_secs()));
            let expires = httpdate::fmt_http_date(SystemTime::now() + self.max_age);
            line.push_str("; Expires=");
            line.push_str(&expires);
        }
        if self.secure {
            line.push_str("; Secure");
        }
        if self.http_only {
            line.push_str("; HttpOnly");
        }
        if !self.same_site.is_empty() {
            line.push_str("; SameSite=");
            line.push_str(&self.same_site);
        }

        Ok(line)
    }
}
