//! A single editor process serving one tenant's content on one loopback port

use crate::config::InstanceSettings;
use crate::error::BullpenError;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Registry key of the always-on shared-assets instance. Valid tenant
/// identifiers start with an alphanumeric character, so this never collides.
pub const ASSETS_TENANT: &str = "_assets";

/// Maximum tenant identifier length
const MAX_TENANT_LEN: usize = 64;

/// Timeout for a single readiness probe
const READY_PROBE_TIMEOUT: Duration = Duration::from_millis(100);

/// Check that a tenant identifier is safe to use as a directory name and
/// URL segment
pub fn validate_tenant(tenant: &str) -> Result<(), BullpenError> {
    let mut chars = tenant.chars();
    let valid = tenant.len() <= MAX_TENANT_LEN
        && chars.next().is_some_and(|c| c.is_ascii_alphanumeric())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));

    if valid {
        Ok(())
    } else {
        Err(BullpenError::InvalidTenant(tenant.to_string()))
    }
}

/// One running (or stopped) editor process
#[derive(Debug)]
pub struct Instance {
    tenant: String,
    port: u16,
    content_dir: PathBuf,
    root: String,
    grace_period: Duration,
    child: Mutex<Option<Child>>,
    pid: AtomicU32,
    started_at: Instant,
    last_activity: Mutex<Instant>,
}

impl Instance {
    pub fn new(
        tenant: &str,
        port: u16,
        content_dir: impl Into<PathBuf>,
        root: &str,
        grace_period: Duration,
    ) -> Self {
        let now = Instant::now();
        Self {
            tenant: tenant.to_string(),
            port,
            content_dir: content_dir.into(),
            root: root.to_string(),
            grace_period,
            child: Mutex::new(None),
            pid: AtomicU32::new(0),
            started_at: now,
            last_activity: Mutex::new(now),
        }
    }

    /// Instance serving `content_root/<tenant>` under `/@<tenant>`
    pub fn for_tenant(tenant: &str, port: u16, settings: &InstanceSettings) -> Self {
        Self::new(
            tenant,
            port,
            settings.content_root.join(tenant),
            &format!("/@{}", tenant),
            settings.shutdown_grace_period(),
        )
    }

    /// The shared-assets instance, serving the scratch directory at `/`
    pub fn for_assets(port: u16, settings: &InstanceSettings) -> Self {
        Self::new(
            ASSETS_TENANT,
            port,
            settings.assets_dir.clone(),
            "/",
            settings.shutdown_grace_period(),
        )
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn content_dir(&self) -> &Path {
        &self.content_dir
    }

    /// Path prefix the editor is mounted under
    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn is_assets(&self) -> bool {
        self.tenant == ASSETS_TENANT
    }

    /// PID of the child, if one was spawned
    pub fn pid(&self) -> Option<u32> {
        match self.pid.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Substitute the per-instance placeholders in an argument template
    pub fn command_args(&self, template: &[String]) -> Vec<String> {
        let content = self.content_dir.to_string_lossy();
        let listen = format!("127.0.0.1:{}", self.port);
        let port = self.port.to_string();
        template
            .iter()
            .map(|arg| {
                arg.replace("{content}", &content)
                    .replace("{listen}", &listen)
                    .replace("{root}", &self.root)
                    .replace("{port}", &port)
            })
            .collect()
    }

    /// Spawn the editor and wait until it accepts connections on its port.
    ///
    /// On failure the child is torn down before returning.
    pub async fn start(&self, settings: &InstanceSettings) -> Result<(), BullpenError> {
        let args = self.command_args(&settings.backend_args);

        info!(
            tenant = %self.tenant,
            port = self.port,
            command = %settings.backend_command,
            args = ?args,
            "Starting editor instance"
        );

        let mut cmd = Command::new(&settings.backend_command);
        cmd.args(&args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        for (key, value) in &settings.env {
            cmd.env(key, value);
        }
        cmd.env("PORT", self.port.to_string());
        cmd.env("BULLPEN_TENANT", &self.tenant);

        let mut child = cmd.spawn().map_err(|source| BullpenError::SpawnFailed {
            tenant: self.tenant.clone(),
            source,
        })?;

        let pid = child.id().unwrap_or(0);
        self.pid.store(pid, Ordering::SeqCst);
        forward_output(child.stdout.take(), self.tenant.clone(), "stdout");
        forward_output(child.stderr.take(), self.tenant.clone(), "stderr");
        *self.child.lock() = Some(child);

        debug!(tenant = %self.tenant, pid, "Editor process spawned");

        let retries = settings.startup_retries;
        let interval = settings.startup_poll_interval();
        let mut attempts = 0;

        while attempts < retries {
            attempts += 1;
            if port_accepts(self.port).await {
                info!(
                    tenant = %self.tenant,
                    port = self.port,
                    pid,
                    attempts,
                    "Editor instance ready"
                );
                self.touch();
                return Ok(());
            }
            if !self.is_alive() {
                warn!(tenant = %self.tenant, pid, "Editor exited during startup");
                break;
            }
            tokio::time::sleep(interval).await;
        }

        self.stop().await;
        Err(BullpenError::StartupTimeout {
            tenant: self.tenant.clone(),
            port: self.port,
            attempts,
        })
    }

    /// SIGTERM, wait out the grace period, then SIGKILL. No-op when already
    /// stopped.
    pub async fn stop(&self) {
        let child = self.child.lock().take();
        let Some(mut child) = child else {
            return;
        };

        if let Ok(Some(status)) = child.try_wait() {
            debug!(tenant = %self.tenant, ?status, "Editor already exited");
            return;
        }

        if let Some(pid) = child.id() {
            info!(tenant = %self.tenant, pid, "Sending SIGTERM to editor");

            #[cfg(unix)]
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }

            #[cfg(not(unix))]
            {
                let _ = child.start_kill();
            }
        }

        match tokio::time::timeout(self.grace_period, child.wait()).await {
            Ok(Ok(status)) => {
                info!(tenant = %self.tenant, ?status, "Editor exited gracefully");
            }
            Ok(Err(e)) => {
                warn!(tenant = %self.tenant, error = %e, "Error waiting for editor to exit");
            }
            Err(_) => {
                warn!(
                    tenant = %self.tenant,
                    grace_period_secs = self.grace_period.as_secs(),
                    "Grace period exceeded, sending SIGKILL"
                );
                let _ = child.kill().await;
            }
        }
    }

    /// Record proxied traffic
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Time since the last proxied request
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Whether the OS process is still running
    pub fn is_alive(&self) -> bool {
        let mut guard = self.child.lock();
        match guard.as_mut() {
            None => false,
            Some(child) => match child.try_wait() {
                Ok(None) => true,
                Ok(Some(status)) => {
                    debug!(tenant = %self.tenant, ?status, "Editor process has exited");
                    false
                }
                Err(e) => {
                    warn!(tenant = %self.tenant, error = %e, "Failed to poll editor process");
                    false
                }
            },
        }
    }

    #[cfg(test)]
    pub(crate) fn set_idle_for(&self, idle: Duration) {
        if let Some(then) = Instant::now().checked_sub(idle) {
            *self.last_activity.lock() = then;
        }
    }
}

async fn port_accepts(port: u16) -> bool {
    matches!(
        tokio::time::timeout(READY_PROBE_TIMEOUT, TcpStream::connect(("127.0.0.1", port))).await,
        Ok(Ok(_))
    )
}

fn forward_output<R>(stream: Option<R>, tenant: String, stream_name: &'static str)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let Some(stream) = stream else {
        return;
    };
    // Drained to EOF whatever the bytes are: a closed read end would kill
    // the editor with SIGPIPE on its next write
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    debug!(tenant = %tenant, stream = stream_name, "{}", line.trim_end());
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!(tenant = %tenant, stream = stream_name, error = %e, "Failed to read editor output");
                    break;
                }
            }
        }
    });
}
