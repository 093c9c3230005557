//! Session tokens and the per-tenant authorization gate
//!
//! A logged-in browser carries a signed JWT in a cookie whose `sub` claim is
//! the tenant it authenticated as. The gate only ever compares that claim
//! with the tenant in the request path; it never looks at the registry.

use crate::config::AuthSettings;
use crate::status::escape_html;
use chrono::{Duration, Utc};
use hyper::header::{HeaderMap, COOKIE};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, TokenData, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Cookie carrying the OAuth `state` between `/login` and `/auth/callback`
pub const STATE_COOKIE: &str = "bullpen_oauth_state";

/// Lifetime of the OAuth state cookie
const STATE_MAX_AGE_SECS: i64 = 600;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Tenant the session was issued for
    pub sub: String,
    pub exp: i64,
    pub iat: i64,
}

/// Outcome of checking a request against the gate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    /// Session belongs to the requested tenant
    Allow,
    /// No usable session, send the browser to `/login`
    Login,
    /// Logged in, but as a different tenant
    Forbidden { own_tenant: String },
}

#[derive(Clone)]
pub struct SessionManager {
    settings: Arc<AuthSettings>,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl SessionManager {
    pub fn new(settings: AuthSettings) -> Self {
        let encoding_key = EncodingKey::from_secret(settings.session_secret.as_bytes());
        let decoding_key = DecodingKey::from_secret(settings.session_secret.as_bytes());
        Self {
            settings: Arc::new(settings),
            encoding_key,
            decoding_key,
        }
    }

    pub fn settings(&self) -> &AuthSettings {
        &self.settings
    }

    pub fn create_token(&self, tenant: &str) -> Result<String, jsonwebtoken::errors::Error> {
        let now = Utc::now();
        let exp = now + Duration::hours(self.settings.session_expiry_hours);

        let claims = Claims {
            sub: tenant.to_string(),
            exp: exp.timestamp(),
            iat: now.timestamp(),
        };

        encode(&Header::default(), &claims, &self.encoding_key)
    }

    pub fn verify_token(&self, token: &str) -> Result<TokenData<Claims>, jsonwebtoken::errors::Error> {
        decode::<Claims>(token, &self.decoding_key, &Validation::default())
    }

    /// Tenant of the session carried by the request, if it verifies
    pub fn session_tenant(&self, headers: &HeaderMap) -> Option<String> {
        let token = cookie_value(headers, &self.settings.cookie_name)?;
        match self.verify_token(&token) {
            Ok(data) => Some(data.claims.sub),
            Err(e) => {
                debug!(error = %e, "Rejected session token");
                None
            }
        }
    }

    /// Decide whether the request may reach `tenant`
    pub fn check(&self, headers: &HeaderMap, tenant: &str) -> GateDecision {
        match self.session_tenant(headers) {
            None => GateDecision::Login,
            Some(own) if own == tenant => GateDecision::Allow,
            Some(own) => GateDecision::Forbidden { own_tenant: own },
        }
    }

    pub fn session_cookie(&self, token: &str) -> String {
        self.cookie(
            &self.settings.cookie_name,
            token,
            self.settings.session_expiry_hours * 3600,
        )
    }

    pub fn logout_cookie(&self) -> String {
        self.cookie(&self.settings.cookie_name, "", 0)
    }

    pub fn state_cookie(&self, state: &str) -> String {
        self.cookie(STATE_COOKIE, state, STATE_MAX_AGE_SECS)
    }

    pub fn clear_state_cookie(&self) -> String {
        self.cookie(STATE_COOKIE, "", 0)
    }

    // Lax so the cookies survive the top-level redirect back from the
    // identity provider
    fn cookie(&self, name: &str, value: &str, max_age: i64) -> String {
        let mut cookie = format!("{}={}; Path=/; Max-Age={}; HttpOnly", name, value, max_age);
        if self.settings.cookie_secure {
            cookie.push_str("; Secure");
        }
        cookie.push_str("; SameSite=Lax");
        cookie
    }
}

/// Value of the named cookie across all `Cookie` headers
pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let prefix = format!("{}=", name);
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|header| header.split(';'))
        .map(str::trim)
        .filter_map(|cookie| cookie.strip_prefix(prefix.as_str()))
        .find(|value| !value.is_empty())
        .map(str::to_string)
}

/// Page shown to a logged-in user who asked for someone else's garden.
/// Deliberately says nothing about the requested tenant.
pub fn forbidden_page(own_tenant: &str) -> String {
    let own = escape_html(own_tenant);
    format!(
        r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>Forbidden</title></head>
<body>
<h1>Forbidden</h1>
<p>You are signed in as <strong>{own}</strong> and can only edit your own garden.</p>
<p><a href="/@{own}/">Go to your garden</a> &middot; <a href="/logout">Sign out</a></p>
</body>
</html>
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::HeaderValue;

    fn test_settings() -> AuthSettings {
        AuthSettings {
            client_id: "client".to_string(),
            client_secret: "secret".to_string(),
            authorize_url: "https://git.example.org/login/oauth/authorize".to_string(),
            token_url: "https://git.example.org/login/oauth/access_token".to_string(),
            userinfo_url: "https://git.example.org/api/v1/user".to_string(),
            redirect_url: "https://edit.example.org/auth/callback".to_string(),
            username_field: "login".to_string(),
            scopes: String::new(),
            session_secret: "test-secret-key-for-jwt-testing".to_string(),
            session_expiry_hours: 24,
            cookie_name: "test_session".to_string(),
            cookie_secure: false,
        }
    }

    fn headers_with_cookie(cookie: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_str(cookie).unwrap());
        headers
    }

    #[test]
    fn test_create_and_verify_token() {
        let sessions = SessionManager::new(test_settings());
        let token = sessions.create_token("alice").unwrap();

        let decoded = sessions.verify_token(&token).unwrap();
        assert_eq!(decoded.claims.sub, "alice");

        let now = Utc::now().timestamp();
        assert!(decoded.claims.exp > now);
        assert!(decoded.claims.exp <= now + 24 * 3600 + 1);
    }

    #[test]
    fn test_wrong_secret() {
        let token = SessionManager::new(test_settings()).create_token("alice").unwrap();

        let other = SessionManager::new(AuthSettings {
            session_secret: "different-secret".to_string(),
            ..test_settings()
        });
        assert!(other.verify_token(&token).is_err());
        assert!(other.verify_token("invalid.token.here").is_err());
    }

    #[test]
    fn test_gate_decisions() {
        let sessions = SessionManager::new(test_settings());
        let token = sessions.create_token("alice").unwrap();
        let headers = headers_with_cookie(&format!("other=1; test_session={}", token));

        assert_eq!(sessions.check(&headers, "alice"), GateDecision::Allow);
        assert_eq!(
            sessions.check(&headers, "bob"),
            GateDecision::Forbidden { own_tenant: "alice".to_string() }
        );
        assert_eq!(sessions.check(&HeaderMap::new(), "alice"), GateDecision::Login);
        assert_eq!(
            sessions.check(&headers_with_cookie("test_session=garbage"), "alice"),
            GateDecision::Login
        );
    }

    #[test]
    fn test_session_cookie() {
        let sessions = SessionManager::new(test_settings());
        let cookie = sessions.session_cookie("mytoken123");

        assert!(cookie.starts_with("test_session=mytoken123; Path=/"));
        assert!(cookie.contains("Max-Age=86400"));
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("SameSite=Lax"));
        assert!(!cookie.contains("Secure"));

        let secure = SessionManager::new(AuthSettings {
            cookie_secure: true,
            ..test_settings()
        });
        assert!(secure.session_cookie("t").contains("; Secure"));
    }

    #[test]
    fn test_clearing_cookies() {
        let sessions = SessionManager::new(test_settings());

        assert!(sessions.logout_cookie().starts_with("test_session=; "));
        assert!(sessions.logout_cookie().contains("Max-Age=0"));

        let state = sessions.state_cookie("abc");
        assert!(state.starts_with("bullpen_oauth_state=abc; "));
        assert!(state.contains("Max-Age=600"));
        assert!(sessions.clear_state_cookie().contains("Max-Age=0"));
    }

    #[test]
    fn test_cookie_value() {
        let headers = headers_with_cookie("test_session=abc123; other=value");
        assert_eq!(cookie_value(&headers, "test_session"), Some("abc123".to_string()));
        assert_eq!(cookie_value(&headers, "other"), Some("value".to_string()));
        assert_eq!(cookie_value(&headers, "missing"), None);

        let headers = headers_with_cookie("test_session=");
        assert_eq!(cookie_value(&headers, "test_session"), None);

        let mut headers = headers_with_cookie("a=1");
        headers.append(COOKIE, HeaderValue::from_static("test_session=xyz"));
        assert_eq!(cookie_value(&headers, "test_session"), Some("xyz".to_string()));
    }

    #[test]
    fn test_forbidden_page_links_own_garden() {
        let page = forbidden_page("alice");
        assert!(page.contains(r#"href="/@alice/""#));
        assert!(!page.contains("bob"));

        let page = forbidden_page("<x>");
        assert!(page.contains("&lt;x&gt;"));
        assert!(!page.contains("<x>"));
    }
}
