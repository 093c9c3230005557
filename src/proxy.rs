use crate::auth::{cookie_value, forbidden_page, GateDecision, SessionManager, STATE_COOKIE};
use crate::config::Config;
use crate::error::{json_error_response, BullpenError, ProxyErrorCode};
use crate::identity::{IdentityProvider, OAuthProvider};
use crate::instance::{validate_tenant, Instance, ASSETS_TENANT};
use crate::pool::{ConnectionPool, PoolConfig, ProxyBody};
use crate::registry::InstanceRegistry;
use crate::status;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE, LOCATION, SET_COOKIE};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";

/// Login flow collaborators. Absent when the gate is disabled.
pub struct Gate {
    pub sessions: SessionManager,
    pub identity: Arc<dyn IdentityProvider>,
}

/// Everything a request handler needs
pub struct ProxyState {
    registry: Arc<InstanceRegistry>,
    pool: ConnectionPool,
    gate: Option<Gate>,
    request_timeout: Duration,
}

impl ProxyState {
    pub fn new(
        registry: Arc<InstanceRegistry>,
        pool_config: PoolConfig,
        request_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            pool: ConnectionPool::new(pool_config),
            gate: None,
            request_timeout,
        }
    }

    pub fn with_gate(mut self, sessions: SessionManager, identity: Arc<dyn IdentityProvider>) -> Self {
        self.gate = Some(Gate { sessions, identity });
        self
    }

    /// Build the state for a loaded configuration, wiring up the OAuth
    /// provider when `[auth]` is present
    pub fn from_config(config: &Config, registry: Arc<InstanceRegistry>) -> anyhow::Result<Self> {
        let pool_config = PoolConfig {
            max_idle_per_host: config.server.pool_max_idle_per_host,
            idle_timeout: Duration::from_secs(config.server.pool_idle_timeout_secs),
        };
        let state = Self::new(registry, pool_config, config.server.request_timeout());

        match &config.auth {
            Some(auth) => {
                let identity = OAuthProvider::new(auth.clone())?;
                Ok(state.with_gate(SessionManager::new(auth.clone()), Arc::new(identity)))
            }
            None => Ok(state),
        }
    }

    pub fn registry(&self) -> &Arc<InstanceRegistry> {
        &self.registry
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn gate_enabled(&self) -> bool {
        self.gate.is_some()
    }
}

/// The public front door
pub struct ProxyServer {
    listener: TcpListener,
    state: Arc<ProxyState>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub async fn bind(
        bind_addr: SocketAddr,
        state: Arc<ProxyState>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(bind_addr).await?;
        Ok(Self {
            listener,
            state,
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let addr = self.listener.local_addr()?;
        info!(addr = %addr, gate = self.state.gate_enabled(), "Proxy server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, state).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(stream: S, state: Arc<ProxyState>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let state = Arc::clone(&state);
        async move { handle_request(req, state).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
enum Route<'a> {
    Status,
    Login,
    Callback,
    Logout,
    Assets,
    Tenant(&'a str),
    AddSlash(&'a str),
    MethodNotAllowed,
    NotFound,
}

fn route<'a>(method: &Method, path: &'a str) -> Route<'a> {
    let read_only = method == Method::GET || method == Method::HEAD;

    match path {
        "/" if read_only => return Route::Status,
        "/login" if method == Method::GET => return Route::Login,
        "/auth/callback" if method == Method::GET => return Route::Callback,
        "/logout" if method == Method::GET => return Route::Logout,
        "/" | "/login" | "/auth/callback" | "/logout" => return Route::MethodNotAllowed,
        _ => {}
    }

    if path.starts_with("/_assets/") {
        return if read_only {
            Route::Assets
        } else {
            Route::MethodNotAllowed
        };
    }

    if let Some(rest) = path.strip_prefix("/@") {
        let (tenant, has_slash) = match rest.split_once('/') {
            Some((tenant, _)) => (tenant, true),
            None => (rest, false),
        };
        if tenant.is_empty() {
            return Route::NotFound;
        }
        if !has_slash {
            return Route::AddSlash(tenant);
        }
        return match *method {
            Method::GET | Method::POST | Method::PUT | Method::DELETE | Method::PATCH => {
                Route::Tenant(tenant)
            }
            _ => Route::MethodNotAllowed,
        };
    }

    Route::NotFound
}

async fn handle_request(
    mut req: Request<Incoming>,
    state: Arc<ProxyState>,
) -> Result<Response<ProxyBody>, hyper::Error> {
    // Generate or propagate request ID
    let existing = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    let request_id = match existing {
        Some(id) => id,
        None => {
            let id = Uuid::new_v4().to_string();
            if let Ok(value) = HeaderValue::from_str(&id) {
                req.headers_mut().insert(X_REQUEST_ID, value);
            }
            id
        }
    };

    let path = req.uri().path().to_string();
    debug!(method = %req.method(), uri = %req.uri(), request_id = %request_id, "Incoming request");

    let response = match route(req.method(), &path) {
        Route::Status => status_page(&state),
        Route::Login => login(&state),
        Route::Callback => callback(&req, &state).await,
        Route::Logout => logout(&state),
        Route::Assets => proxy_assets(req, &state, &request_id).await,
        Route::AddSlash(tenant) => {
            let location = match req.uri().query() {
                Some(query) => format!("/@{}/?{}", tenant, query),
                None => format!("/@{}/", tenant),
            };
            redirect(StatusCode::PERMANENT_REDIRECT, &location)
        }
        Route::Tenant(tenant) => {
            let decision = state
                .gate
                .as_ref()
                .map(|gate| gate.sessions.check(req.headers(), tenant))
                .unwrap_or(GateDecision::Allow);

            match decision {
                GateDecision::Allow => proxy_tenant(req, tenant, &state, &request_id).await,
                GateDecision::Login => redirect(StatusCode::FOUND, "/login"),
                GateDecision::Forbidden { own_tenant } => {
                    info!(tenant, own_tenant = %own_tenant, request_id = %request_id, "Cross-tenant access refused");
                    html_response(StatusCode::FORBIDDEN, forbidden_page(&own_tenant))
                }
            }
        }
        Route::MethodNotAllowed => {
            json_error_response(ProxyErrorCode::MethodNotAllowed, "Method not allowed")
        }
        Route::NotFound => json_error_response(ProxyErrorCode::NotFound, "Not found"),
    };

    Ok(response)
}

async fn proxy_tenant(
    req: Request<Incoming>,
    tenant: &str,
    state: &ProxyState,
    request_id: &str,
) -> Response<ProxyBody> {
    let instance = match state.registry.get_or_create(tenant).await {
        Ok(instance) => instance,
        Err(e) => {
            match &e {
                BullpenError::InvalidTenant(_) | BullpenError::TenantNotFound(_) => {
                    debug!(tenant, request_id, "Unknown tenant");
                }
                _ => error!(tenant, request_id, error = %e, "Failed to obtain editor"),
            }
            return e.into_response();
        }
    };

    forward(req, &instance, state, request_id).await
}

async fn proxy_assets(
    req: Request<Incoming>,
    state: &ProxyState,
    request_id: &str,
) -> Response<ProxyBody> {
    // After a failed start, retries are left to the reaper for a while so
    // asset requests go straight to the fallback
    let assets = if state.registry.assets_backing_off() {
        state.registry.get_live(ASSETS_TENANT)
    } else {
        match state.registry.ensure_assets().await {
            Ok(_) => state.registry.get_live(ASSETS_TENANT),
            Err(e) => {
                warn!(request_id, error = %e, "Shared-assets instance unavailable");
                None
            }
        }
    };

    let instance = match assets.or_else(|| state.registry.most_recent_live(ASSETS_TENANT)) {
        Some(instance) => instance,
        None => return BullpenError::AssetsUnavailable.into_response(),
    };

    if !instance.is_assets() {
        debug!(fallback = instance.tenant(), request_id, "Serving assets from fallback instance");
    }

    forward(req, &instance, state, request_id).await
}

async fn forward(
    req: Request<Incoming>,
    instance: &Instance,
    state: &ProxyState,
    request_id: &str,
) -> Response<ProxyBody> {
    let port = instance.port();
    let tenant = instance.tenant();
    let timeout = state.request_timeout;

    match tokio::time::timeout(timeout, state.pool.send_request(req, port, timeout)).await {
        Ok(Ok(response)) => {
            instance.touch();
            response
        }
        Ok(Err(e)) => {
            // The instance stays registered; the next get_or_create notices
            // a dead process and replaces it
            error!(tenant, port, request_id, error = %e, "Failed to forward request");
            BullpenError::UpstreamUnreachable {
                port,
                reason: e.to_string(),
            }
            .into_response()
        }
        Err(_) => {
            warn!(
                tenant,
                port,
                request_id,
                timeout_secs = timeout.as_secs(),
                "Request timed out"
            );
            BullpenError::UpstreamTimeout {
                port,
                secs: timeout.as_secs(),
            }
            .into_response()
        }
    }
}

fn status_page(state: &ProxyState) -> Response<ProxyBody> {
    let registry = &state.registry;
    let page = status::render(
        &registry.list(),
        registry.allocated_ports().len(),
        registry.port_capacity(),
    );
    html_response(StatusCode::OK, page)
}

fn login(state: &ProxyState) -> Response<ProxyBody> {
    let Some(gate) = &state.gate else {
        return json_error_response(ProxyErrorCode::NotFound, "Login is not configured");
    };

    let oauth_state = Uuid::new_v4().simple().to_string();
    let mut response = redirect(StatusCode::FOUND, &gate.identity.authorize_url(&oauth_state));
    append_cookie(&mut response, &gate.sessions.state_cookie(&oauth_state));
    response
}

async fn callback(
    req: &Request<Incoming>,
    state: &ProxyState,
) -> Response<ProxyBody> {
    let Some(gate) = &state.gate else {
        return json_error_response(ProxyErrorCode::NotFound, "Login is not configured");
    };

    let query = req.uri().query().unwrap_or("");
    let code = query_param(query, "code");
    let returned_state = query_param(query, "state");
    let expected_state = cookie_value(req.headers(), STATE_COOKIE);

    let code = match (code, returned_state, expected_state) {
        (Some(code), Some(returned), Some(expected)) if returned == expected => code,
        _ => {
            warn!("Login callback with missing or mismatched state");
            return json_error_response(ProxyErrorCode::BadRequest, "Invalid login callback");
        }
    };

    let tenant = match gate.identity.exchange_code(&code).await {
        Ok(tenant) => tenant,
        Err(e) => {
            error!(error = %e, "Identity provider exchange failed");
            return json_error_response(ProxyErrorCode::IdentityProviderError, "Login failed");
        }
    };

    if validate_tenant(&tenant).is_err() || tenant == ASSETS_TENANT {
        warn!(tenant = %tenant, "Identity is not a usable tenant identifier");
        return html_response(
            StatusCode::FORBIDDEN,
            "<!DOCTYPE html>\n<html><body><h1>Forbidden</h1><p>This account cannot edit a garden.</p></body></html>\n"
                .to_string(),
        );
    }

    let token = match gate.sessions.create_token(&tenant) {
        Ok(token) => token,
        Err(e) => {
            error!(error = %e, "Failed to sign session token");
            return json_error_response(ProxyErrorCode::InternalError, "Login failed");
        }
    };

    info!(tenant = %tenant, "User logged in");
    let mut response = redirect(StatusCode::FOUND, &format!("/@{}/", tenant));
    append_cookie(&mut response, &gate.sessions.session_cookie(&token));
    append_cookie(&mut response, &gate.sessions.clear_state_cookie());
    response
}

fn logout(state: &ProxyState) -> Response<ProxyBody> {
    let mut response = redirect(StatusCode::FOUND, "/");
    if let Some(gate) = &state.gate {
        append_cookie(&mut response, &gate.sessions.logout_cookie());
    }
    response
}

/// First value of `name` in a query string, percent-decoded
fn query_param(query: &str, name: &str) -> Option<String> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == name)
        .and_then(|(_, value)| urlencoding::decode(&value.replace('+', " ")).ok().map(|v| v.into_owned()))
        .filter(|value| !value.is_empty())
}

fn full_body(body: impl Into<Bytes>) -> ProxyBody {
    Full::new(body.into()).map_err(|never| match never {}).boxed()
}

fn redirect(status: StatusCode, location: &str) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(Bytes::new()));
    *response.status_mut() = status;
    match HeaderValue::from_str(location) {
        Ok(value) => {
            response.headers_mut().insert(LOCATION, value);
            response
        }
        Err(_) => json_error_response(ProxyErrorCode::InternalError, "Invalid redirect"),
    }
}

fn html_response(status: StatusCode, body: String) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/html; charset=utf-8"),
    );
    response
}

fn append_cookie(response: &mut Response<ProxyBody>, cookie: &str) {
    if let Ok(value) = HeaderValue::from_str(cookie) {
        response.headers_mut().append(SET_COOKIE, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_fixed_paths() {
        assert_eq!(route(&Method::GET, "/"), Route::Status);
        assert_eq!(route(&Method::HEAD, "/"), Route::Status);
        assert_eq!(route(&Method::POST, "/"), Route::MethodNotAllowed);
        assert_eq!(route(&Method::GET, "/login"), Route::Login);
        assert_eq!(route(&Method::GET, "/auth/callback"), Route::Callback);
        assert_eq!(route(&Method::GET, "/logout"), Route::Logout);
        assert_eq!(route(&Method::POST, "/logout"), Route::MethodNotAllowed);
        assert_eq!(route(&Method::GET, "/favicon.ico"), Route::NotFound);
        assert_eq!(route(&Method::GET, "/_assets"), Route::NotFound);
    }

    #[test]
    fn test_route_assets() {
        assert_eq!(route(&Method::GET, "/_assets/app.css"), Route::Assets);
        assert_eq!(route(&Method::HEAD, "/_assets/"), Route::Assets);
        assert_eq!(route(&Method::POST, "/_assets/app.css"), Route::MethodNotAllowed);
    }

    #[test]
    fn test_route_tenant_paths() {
        for method in [Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::PATCH] {
            assert_eq!(route(&method, "/@alice/notes.md"), Route::Tenant("alice"));
        }
        assert_eq!(route(&Method::GET, "/@alice/"), Route::Tenant("alice"));
        assert_eq!(route(&Method::OPTIONS, "/@alice/x"), Route::MethodNotAllowed);
        assert_eq!(route(&Method::GET, "/@alice"), Route::AddSlash("alice"));
        assert_eq!(route(&Method::GET, "/@"), Route::NotFound);
        assert_eq!(route(&Method::GET, "/@/x"), Route::NotFound);
    }

    #[test]
    fn test_query_param() {
        let query = "code=abc%2Fdef&state=xyz&empty=&sp=a+b";
        assert_eq!(query_param(query, "code"), Some("abc/def".to_string()));
        assert_eq!(query_param(query, "state"), Some("xyz".to_string()));
        assert_eq!(query_param(query, "empty"), None);
        assert_eq!(query_param(query, "missing"), None);
        assert_eq!(query_param(query, "sp"), Some("a b".to_string()));
        assert_eq!(query_param("", "code"), None);
    }

    #[test]
    fn test_redirect_and_cookies() {
        let mut response = redirect(StatusCode::FOUND, "/@alice/");
        append_cookie(&mut response, "a=1");
        append_cookie(&mut response, "b=2");

        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers().get(LOCATION).unwrap(), "/@alice/");
        assert_eq!(response.headers().get_all(SET_COOKIE).iter().count(), 2);
    }
}
