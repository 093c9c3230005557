use crate::pool::PoolStats;
use crate::registry::InstanceRegistry;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::AUTHORIZATION;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Version information for the front door
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Helper to create a simple response - infallible with valid StatusCode
fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

/// Shared by every admin connection
struct AdminContext {
    registry: Arc<InstanceRegistry>,
    stats: Arc<PoolStats>,
    auth_token: String,
}

/// Operator API on a loopback port
pub struct AdminServer {
    listener: TcpListener,
    context: Arc<AdminContext>,
    shutdown_rx: watch::Receiver<bool>,
}

impl AdminServer {
    pub async fn bind(
        bind_addr: SocketAddr,
        registry: Arc<InstanceRegistry>,
        stats: Arc<PoolStats>,
        shutdown_rx: watch::Receiver<bool>,
        auth_token: String,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(bind_addr).await?;
        Ok(Self {
            listener,
            context: Arc::new(AdminContext {
                registry,
                stats,
                auth_token,
            }),
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn auth_token(&self) -> &str {
        &self.context.auth_token
    }

    pub async fn run(self) -> anyhow::Result<()> {
        info!(addr = %self.listener.local_addr()?, "Admin API server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let context = Arc::clone(&self.context);
                            tokio::spawn(async move {
                                if let Err(e) = serve_admin_connection(stream, context).await {
                                    debug!(addr = %addr, error = %e, "Admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept admin connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Admin server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_admin_connection<S>(stream: S, context: Arc<AdminContext>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let context = Arc::clone(&context);
        async move { handle_admin_request(req, context).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Admin connection error: {}", e))?;

    Ok(())
}

fn check_auth<B>(req: &Request<B>, expected_token: &str) -> bool {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|auth| {
            // Support "Bearer <token>" format
            auth.strip_prefix("Bearer ")
                .unwrap_or(auth)
                .eq(expected_token)
        })
        .unwrap_or(false)
}

async fn handle_admin_request(
    req: Request<hyper::body::Incoming>,
    context: Arc<AdminContext>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let path = req.uri().path();
    let method = req.method();

    debug!(%method, %path, "Admin API request");

    let response = match (method, path) {
        // Health check for the admin API itself (no auth required)
        (&Method::GET, "/health") => response(StatusCode::OK, "ok"),

        (&Method::GET, "/version") => {
            let version_info = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            json_response(StatusCode::OK, version_info.to_string())
        }

        (&Method::GET, "/instances") => {
            if !check_auth(&req, &context.auth_token) {
                warn!(path, "Unauthorized admin API request");
                response(StatusCode::UNAUTHORIZED, "unauthorized")
            } else {
                let registry = &context.registry;
                let instances = registry.list();
                let body = serde_json::json!({
                    "count": instances.len(),
                    "instances": instances,
                    "ports_in_use": registry.allocated_ports().len(),
                    "port_capacity": registry.port_capacity(),
                    "requests": context.stats.get_total_requests(),
                    "failed_requests": context.stats.get_failed_requests(),
                });
                json_response(StatusCode::OK, body.to_string())
            }
        }

        // Operator eviction: DELETE /instances/{tenant} (auth required)
        (&Method::DELETE, path) if path.starts_with("/instances/") => {
            if !check_auth(&req, &context.auth_token) {
                warn!(path, "Unauthorized admin API request");
                response(StatusCode::UNAUTHORIZED, "unauthorized")
            } else {
                let tenant = path.strip_prefix("/instances/").unwrap_or("");
                if tenant.is_empty() {
                    response(StatusCode::BAD_REQUEST, "missing tenant")
                } else if context.registry.remove(tenant).await {
                    info!(tenant, "Instance evicted via admin API");
                    response(StatusCode::OK, "ok")
                } else {
                    response(StatusCode::NOT_FOUND, "no such instance")
                }
            }
        }

        // 404 for everything else
        _ => response(StatusCode::NOT_FOUND, "not found"),
    };

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(auth: Option<&str>) -> Request<()> {
        let mut builder = Request::builder().uri("/instances");
        if let Some(auth) = auth {
            builder = builder.header(AUTHORIZATION, auth);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn test_check_auth() {
        assert!(check_auth(&request(Some("Bearer s3cret")), "s3cret"));
        assert!(check_auth(&request(Some("s3cret")), "s3cret"));
        assert!(!check_auth(&request(Some("Bearer wrong")), "s3cret"));
        assert!(!check_auth(&request(Some("Basic s3cret")), "s3cret"));
        assert!(!check_auth(&request(None), "s3cret"));
    }
}
