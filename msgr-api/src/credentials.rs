//! Credentials supplied by the login collaborator.
//!
//! The listener never logs in by itself; it is handed a user id, a cookie
//! jar and the page tokens and only reads from them.

use std::sync::Arc;

use rand::Rng;
use reqwest::cookie::{CookieStore, Jar};
use reqwest::Url;

use msgr_core::error::{MsgrError, MsgrResult};

/// Authenticated identity of one logical login.
#[derive(Clone)]
pub struct Credentials {
    /// Numeric id of the logged-in account.
    pub user_id: String,
    /// Random per-login client id, sent as `d` and `cid` on connect.
    pub client_id: String,
    /// Anti-CSRF page token, when the login collaborator scraped one.
    pub fb_dtsg: Option<String>,
    /// Acting page id (`av`), if acting as a page rather than the user.
    pub page_id: Option<String>,
    jar: Arc<Jar>,
    origin: Url,
}

impl Credentials {
    /// Wrap an existing cookie jar.
    pub fn new(user_id: impl Into<String>, jar: Arc<Jar>, base_url: &str) -> MsgrResult<Self> {
        let user_id = user_id.into();
        if user_id.trim().is_empty() {
            return Err(MsgrError::MissingConfig("user id".into()));
        }
        let origin = Url::parse(base_url)
            .map_err(|e| MsgrError::Config(format!("invalid base url {base_url:?}: {e}")))?;
        Ok(Self {
            user_id,
            client_id: random_client_id(),
            fb_dtsg: None,
            page_id: None,
            jar,
            origin,
        })
    }

    /// Build credentials from a raw `Cookie` header (`c_user=..; xs=..`).
    ///
    /// The user id is taken from the `c_user` cookie.
    pub fn from_cookie_header(header: &str, base_url: &str) -> MsgrResult<Self> {
        let origin = Url::parse(base_url)
            .map_err(|e| MsgrError::Config(format!("invalid base url {base_url:?}: {e}")))?;
        let domain = origin
            .host_str()
            .map(|h| h.trim_start_matches("www."))
            .unwrap_or("facebook.com")
            .to_string();

        let jar = Jar::default();
        let mut user_id = None;
        for pair in header.split(';') {
            let pair = pair.trim();
            let Some((name, value)) = pair.split_once('=') else {
                continue;
            };
            if name == "c_user" {
                user_id = Some(value.to_string());
            }
            jar.add_cookie_str(&format!("{name}={value}; Domain=.{domain}; Path=/"), &origin);
        }

        let user_id = user_id.ok_or_else(|| MsgrError::MissingConfig("c_user cookie".into()))?;
        Self::new(user_id, Arc::new(jar), base_url)
    }

    /// Set the page token.
    pub fn with_fb_dtsg(mut self, token: impl Into<String>) -> Self {
        self.fb_dtsg = Some(token.into());
        self
    }

    /// Act as a page.
    pub fn with_page_id(mut self, page_id: impl Into<String>) -> Self {
        self.page_id = Some(page_id.into());
        self
    }

    /// The cookie jar backing HTTP requests.
    pub fn jar(&self) -> Arc<Jar> {
        self.jar.clone()
    }

    /// The id requests are issued on behalf of.
    pub fn actor_id(&self) -> &str {
        self.page_id.as_deref().unwrap_or(&self.user_id)
    }

    /// Web origin the cookies belong to.
    pub fn origin(&self) -> &Url {
        &self.origin
    }

    /// `Cookie` header value for the web origin, used on the WebSocket upgrade.
    pub fn cookie_header(&self) -> Option<String> {
        self.jar
            .cookies(&self.origin)
            .and_then(|v| v.to_str().ok().map(str::to_string))
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("user_id", &self.user_id)
            .field("client_id", &self.client_id)
            .field("page_id", &self.page_id)
            .field("fb_dtsg", &self.fb_dtsg.as_ref().map(|_| "<redacted>"))
            .field("origin", &self.origin.as_str())
            .finish()
    }
}

fn random_client_id() -> String {
    format!("{:x}", rand::thread_rng().gen_range(0..2_147_483_648u32))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_cookie_header() {
        let creds = Credentials::from_cookie_header(
            "c_user=100042; xs=abc%3Adef; datr=zzz",
            "https://www.facebook.com",
        )
        .unwrap();
        assert_eq!(creds.user_id, "100042");
        assert_eq!(creds.actor_id(), "100042");

        let header = creds.cookie_header().unwrap();
        assert!(header.contains("c_user=100042"));
        assert!(header.contains("xs=abc%3Adef"));
    }

    #[test]
    fn test_missing_c_user() {
        let err = Credentials::from_cookie_header("xs=1", "https://www.facebook.com").unwrap_err();
        assert!(matches!(err, MsgrError::MissingConfig(_)));
    }

    #[test]
    fn test_empty_user_id_rejected() {
        let err = Credentials::new("  ", Arc::new(Jar::default()), "https://www.facebook.com")
            .unwrap_err();
        assert!(matches!(err, MsgrError::MissingConfig(_)));
    }

    #[test]
    fn test_page_id_is_actor() {
        let creds = Credentials::new("1", Arc::new(Jar::default()), "https://www.facebook.com")
            .unwrap()
            .with_page_id("77");
        assert_eq!(creds.actor_id(), "77");
    }

    #[test]
    fn test_client_id_is_hex() {
        let creds = Credentials::new("1", Arc::new(Jar::default()), "https://www.facebook.com")
            .unwrap();
        assert!(u64::from_str_radix(&creds.client_id, 16).is_ok());
    }

    #[test]
    fn test_debug_redacts_token() {
        let creds = Credentials::new("1", Arc::new(Jar::default()), "https://www.facebook.com")
            .unwrap()
            .with_fb_dtsg("secret-token");
        let printed = format!("{creds:?}");
        assert!(!printed.contains("secret-token"));
    }
}
