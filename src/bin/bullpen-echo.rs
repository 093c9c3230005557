//! Stand-in editor for development and integration tests
//!
//! Accepts the editor's command line:
//!   bullpen-echo -content <dir> serve -listen=<addr> -root=<prefix>
//!
//! Under `<prefix>`, GET requests for files that exist in `<dir>` are served
//! from disk. Every other request is echoed back as JSON.
//!
//! Environment variables:
//! - BULLPEN_ECHO_STARTUP_DELAY_MS: Delay before binding the listener (default: 0)
//! - BULLPEN_TENANT: Reported back in the `x-echo-tenant` header
//!
//! A `sleep_ms=<n>` query parameter delays the answer, and `stall=1` sends
//! the headers and a first chunk of body and then goes silent. Both exist
//! for timeout tests.

use anyhow::{bail, Context, Result};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Bytes, Frame, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;
use tokio::net::TcpListener;

struct EchoConfig {
    content: PathBuf,
    listen: String,
    root: String,
    tenant: String,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<EchoConfig> {
    let mut content = None;
    let mut listen = None;
    let mut root = String::from("/");

    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        if arg == "-content" {
            content = Some(args.next().context("-content needs a value")?);
        } else if let Some(value) = arg.strip_prefix("-content=") {
            content = Some(value.to_string());
        } else if let Some(value) = arg.strip_prefix("-listen=") {
            listen = Some(value.to_string());
        } else if let Some(value) = arg.strip_prefix("-root=") {
            root = value.to_string();
        } else if arg != "serve" {
            bail!("unexpected argument: {}", arg);
        }
    }

    Ok(EchoConfig {
        content: PathBuf::from(content.context("missing -content")?),
        listen: listen.context("missing -listen")?,
        root,
        tenant: std::env::var("BULLPEN_TENANT").unwrap_or_default(),
    })
}

/// File under `content` addressed by `path`, when `path` sits below `root`
/// and stays inside the content directory
fn file_for(config: &EchoConfig, path: &str) -> Option<PathBuf> {
    let relative = path.strip_prefix(config.root.trim_end_matches('/'))?;
    let relative = urlencoding::decode(relative.trim_start_matches('/')).ok()?;
    let relative = Path::new(relative.as_ref());
    if relative.as_os_str().is_empty()
        || relative.components().any(|c| !matches!(c, Component::Normal(_)))
    {
        return None;
    }
    let file = config.content.join(relative);
    file.is_file().then_some(file)
}

fn query_value<'a>(query: &'a str, name: &str) -> Option<&'a str> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value)
}

fn sleep_ms(query: &str) -> Option<u64> {
    query_value(query, "sleep_ms").and_then(|value| value.parse().ok())
}

/// Announces 100 bytes, sends a few, then never finishes
struct StalledBody {
    sent: bool,
}

impl Body for StalledBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        _cx: &mut TaskContext<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, Infallible>>> {
        if self.sent {
            return Poll::Pending;
        }
        self.sent = true;
        Poll::Ready(Some(Ok(Frame::data(Bytes::from_static(b"partial")))))
    }
}

fn full(body: impl Into<Bytes>) -> BoxBody<Bytes, Infallible> {
    Full::new(body.into()).boxed()
}

async fn handle(
    req: Request<Incoming>,
    config: Arc<EchoConfig>,
) -> Result<Response<BoxBody<Bytes, Infallible>>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or("").to_string();

    if let Some(ms) = sleep_ms(&query) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    if query_value(&query, "stall") == Some("1") {
        return Ok(Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "text/plain")
            .header("content-length", "100")
            .header("x-echo-tenant", config.tenant.as_str())
            .body(StalledBody { sent: false }.boxed())
            .expect("valid response"));
    }

    if method == Method::GET {
        if let Some(file) = file_for(&config, &path) {
            let response = match tokio::fs::read(&file).await {
                Ok(contents) => Response::builder()
                    .status(StatusCode::OK)
                    .header("content-type", "application/octet-stream")
                    .header("x-echo-tenant", config.tenant.as_str())
                    .body(full(contents)),
                Err(_) => Response::builder()
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(full("read error")),
            };
            return Ok(response.expect("valid response"));
        }
    }

    let headers: BTreeMap<String, String> = req
        .headers()
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).to_string(),
            )
        })
        .collect();
    let body = req.into_body().collect().await?.to_bytes();

    let echo = serde_json::json!({
        "method": method.as_str(),
        "path": path,
        "query": query,
        "headers": headers,
        "body": String::from_utf8_lossy(&body),
        "tenant": config.tenant,
    });

    // content-encoding is advertised so the front door has something to strip
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/json")
        .header("content-encoding", "identity")
        .header("x-echo-tenant", config.tenant.as_str())
        .body(full(echo.to_string()))
        .expect("valid response"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Arc::new(parse_args(std::env::args().skip(1))?);

    let startup_delay: u64 = std::env::var("BULLPEN_ECHO_STARTUP_DELAY_MS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    if startup_delay > 0 {
        eprintln!("bullpen-echo: sleeping for {}ms before starting", startup_delay);
        tokio::time::sleep(Duration::from_millis(startup_delay)).await;
    }

    let listener = TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;
    eprintln!(
        "bullpen-echo: serving {} under {} on {}",
        config.content.display(),
        config.root,
        config.listen
    );

    loop {
        let (stream, _) = listener.accept().await?;
        let config = Arc::clone(&config);
        tokio::spawn(async move {
            let service = service_fn(move |req| handle(req, Arc::clone(&config)));
            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                eprintln!("bullpen-echo: connection error: {}", e);
            }
        });
    }
}
