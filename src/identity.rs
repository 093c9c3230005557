//! Identity provider seam for the login flow

use crate::config::AuthSettings;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Something that can send a browser off to log in and turn the returned
/// authorization code into a tenant identifier
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Where to send the browser, carrying our `state`
    fn authorize_url(&self, state: &str) -> String;

    /// Exchange an authorization code for the authenticated username
    async fn exchange_code(&self, code: &str) -> Result<String>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// Authorization-code flow against a Forgejo/Gitea style provider
pub struct OAuthProvider {
    settings: AuthSettings,
    http_client: reqwest::Client,
}

impl OAuthProvider {
    pub fn new(settings: AuthSettings) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            settings,
            http_client,
        })
    }
}

#[async_trait]
impl IdentityProvider for OAuthProvider {
    fn authorize_url(&self, state: &str) -> String {
        let mut url = format!(
            "{}{}response_type=code&client_id={}&redirect_uri={}&state={}",
            self.settings.authorize_url,
            if self.settings.authorize_url.contains('?') { '&' } else { '?' },
            urlencoding::encode(&self.settings.client_id),
            urlencoding::encode(&self.settings.redirect_url),
            urlencoding::encode(state),
        );
        if !self.settings.scopes.is_empty() {
            url.push_str("&scope=");
            url.push_str(&urlencoding::encode(&self.settings.scopes));
        }
        url
    }

    async fn exchange_code(&self, code: &str) -> Result<String> {
        let form = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("client_id", self.settings.client_id.as_str()),
            ("client_secret", self.settings.client_secret.as_str()),
            ("redirect_uri", self.settings.redirect_url.as_str()),
        ];

        let response = self
            .http_client
            .post(&self.settings.token_url)
            .header("Accept", "application/json")
            .form(&form)
            .send()
            .await
            .context("Token request failed")?;

        if !response.status().is_success() {
            return Err(anyhow!("Token endpoint returned {}", response.status()));
        }

        let token: TokenResponse = response
            .json()
            .await
            .context("Malformed token response")?;

        let response = self
            .http_client
            .get(&self.settings.userinfo_url)
            .bearer_auth(&token.access_token)
            .header("Accept", "application/json")
            .send()
            .await
            .context("Userinfo request failed")?;

        if !response.status().is_success() {
            return Err(anyhow!("Userinfo endpoint returned {}", response.status()));
        }

        let user: serde_json::Value = response
            .json()
            .await
            .context("Malformed userinfo response")?;

        let username = user
            .get(&self.settings.username_field)
            .and_then(|value| value.as_str())
            .ok_or_else(|| anyhow!("Userinfo has no '{}' field", self.settings.username_field))?;

        debug!(username, "Identity provider exchange complete");
        Ok(username.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::{BodyExt, Full};
    use hyper::body::{Bytes, Incoming};
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    fn settings(base: &str) -> AuthSettings {
        AuthSettings {
            client_id: "bullpen client".to_string(),
            client_secret: "s3cret".to_string(),
            authorize_url: format!("{}/login/oauth/authorize", base),
            token_url: format!("{}/login/oauth/access_token", base),
            userinfo_url: format!("{}/api/v1/user", base),
            redirect_url: "https://edit.example.org/auth/callback".to_string(),
            username_field: "login".to_string(),
            scopes: String::new(),
            session_secret: "x".to_string(),
            session_expiry_hours: 24,
            cookie_name: "bullpen_session".to_string(),
            cookie_secure: true,
        }
    }

    async fn fake_provider_handler(
        req: Request<Incoming>,
    ) -> Result<Response<Full<Bytes>>, hyper::Error> {
        let path = req.uri().path().to_string();
        let auth = req
            .headers()
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = req.into_body().collect().await?.to_bytes();
        let body = String::from_utf8_lossy(&body).to_string();

        let response = match path.as_str() {
            "/login/oauth/access_token" if body.contains("code=good") => {
                Response::new(Full::new(Bytes::from(r#"{"access_token":"tok-1","token_type":"bearer"}"#)))
            }
            "/api/v1/user" if auth.as_deref() == Some("Bearer tok-1") => {
                Response::new(Full::new(Bytes::from(r#"{"id":7,"login":"alice"}"#)))
            }
            _ => {
                let mut response = Response::new(Full::new(Bytes::from("denied")));
                *response.status_mut() = StatusCode::UNAUTHORIZED;
                response
            }
        };
        Ok(response)
    }

    async fn start_fake_provider() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service_fn(fake_provider_handler))
                        .await;
                });
            }
        });
        addr
    }

    #[test]
    fn test_authorize_url() {
        let provider = OAuthProvider::new(settings("https://git.example.org")).unwrap();
        let url = provider.authorize_url("st@te");

        assert!(url.starts_with("https://git.example.org/login/oauth/authorize?response_type=code"));
        assert!(url.contains("client_id=bullpen%20client"));
        assert!(url.contains("redirect_uri=https%3A%2F%2Fedit.example.org%2Fauth%2Fcallback"));
        assert!(url.contains("state=st%40te"));
        assert!(!url.contains("scope="));
    }

    #[test]
    fn test_authorize_url_with_query_and_scopes() {
        let mut s = settings("https://git.example.org");
        s.authorize_url.push_str("?tenant=x");
        s.scopes = "read:user openid".to_string();
        let provider = OAuthProvider::new(s).unwrap();
        let url = provider.authorize_url("abc");

        assert!(url.contains("?tenant=x&response_type=code"));
        assert!(url.ends_with("&scope=read%3Auser%20openid"));
    }

    #[tokio::test]
    async fn test_exchange_code_returns_username() {
        let addr = start_fake_provider().await;
        let provider = OAuthProvider::new(settings(&format!("http://{}", addr))).unwrap();

        assert_eq!(provider.exchange_code("good").await.unwrap(), "alice");
    }

    #[tokio::test]
    async fn test_exchange_code_rejected() {
        let addr = start_fake_provider().await;
        let provider = OAuthProvider::new(settings(&format!("http://{}", addr))).unwrap();

        assert!(provider.exchange_code("bad").await.is_err());
    }

    #[tokio::test]
    async fn test_exchange_code_missing_username_field() {
        let addr = start_fake_provider().await;
        let mut s = settings(&format!("http://{}", addr));
        s.username_field = "username".to_string();
        let provider = OAuthProvider::new(s).unwrap();

        let err = provider.exchange_code("good").await.unwrap_err();
        assert!(err.to_string().contains("username"));
    }
}
