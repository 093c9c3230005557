use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for the front door
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Public listener and proxy settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Per-tenant editor instance settings
    pub instances: InstanceSettings,

    /// Identity provider and session settings. When absent the
    /// authorization gate is disabled.
    pub auth: Option<AuthSettings>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Public HTTP port (default: 5019)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Port for the loopback admin API (default: 0, disabled)
    #[serde(default)]
    pub admin_port: u16,

    /// Bearer token for the admin API.
    /// If not set, a random token is generated at startup and logged
    pub admin_token: Option<String>,

    /// Max time to wait for an editor instance to answer a proxied request
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Maximum idle upstream connections per instance (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle upstream connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn admin_enabled(&self) -> bool {
        self.admin_port > 0
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            admin_port: 0,
            admin_token: None,
            request_timeout_secs: default_request_timeout(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

/// Settings for spawning and reaping editor instances
///
/// # Security Warning
///
/// `backend_command` and `backend_args` are executed directly for every
/// tenant. Configuration files must be protected with appropriate file
/// permissions (e.g., readable only by the service user).
#[derive(Debug, Deserialize, Clone)]
pub struct InstanceSettings {
    /// Directory holding one subdirectory per tenant (kept current by the
    /// sync pipeline, never written by us)
    pub content_root: PathBuf,

    /// Editor executable to spawn per tenant
    pub backend_command: String,

    /// Arguments for the editor. `{content}`, `{listen}`, `{root}` and
    /// `{port}` are substituted per instance.
    #[serde(default = "default_backend_args")]
    pub backend_args: Vec<String>,

    /// Extra environment variables for every instance
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Scratch directory served by the shared-assets instance
    #[serde(default = "default_assets_dir")]
    pub assets_dir: PathBuf,

    /// First port handed out to instances (inclusive)
    #[serde(default = "default_port_range_start")]
    pub port_range_start: u16,

    /// End of the port range (exclusive)
    #[serde(default = "default_port_range_end")]
    pub port_range_end: u16,

    /// Seconds without proxied traffic before an instance is reaped
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Seconds between reaper cycles
    #[serde(default = "default_reap_interval")]
    pub reap_interval_secs: u64,

    /// Number of port probes while waiting for a new instance
    #[serde(default = "default_startup_retries")]
    pub startup_retries: u32,

    /// Delay between port probes in milliseconds
    #[serde(default = "default_startup_poll_interval")]
    pub startup_poll_interval_ms: u64,

    /// Grace period in seconds between SIGTERM and SIGKILL
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,
}

impl InstanceSettings {
    /// Create settings with defaults for everything but the content root
    /// and the editor command
    pub fn new(content_root: impl Into<PathBuf>, backend_command: &str) -> Self {
        Self {
            content_root: content_root.into(),
            backend_command: backend_command.to_string(),
            backend_args: default_backend_args(),
            env: HashMap::new(),
            assets_dir: default_assets_dir(),
            port_range_start: default_port_range_start(),
            port_range_end: default_port_range_end(),
            idle_timeout_secs: default_idle_timeout(),
            reap_interval_secs: default_reap_interval(),
            startup_retries: default_startup_retries(),
            startup_poll_interval_ms: default_startup_poll_interval(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
        }
    }

    /// Set the port range (builder pattern)
    pub fn with_port_range(mut self, start: u16, end: u16) -> Self {
        self.port_range_start = start;
        self.port_range_end = end;
        self
    }

    /// Set the shared-assets scratch directory (builder pattern)
    pub fn with_assets_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.assets_dir = dir.into();
        self
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }

    pub fn startup_poll_interval(&self) -> Duration {
        Duration::from_millis(self.startup_poll_interval_ms)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }

    /// Expand a leading `~/` in the configured paths
    pub fn expand_paths(&mut self) {
        self.content_root = expand_home(&self.content_root);
        self.assets_dir = expand_home(&self.assets_dir);
        self.backend_command = expand_home(Path::new(&self.backend_command))
            .to_string_lossy()
            .into_owned();
    }

    fn validate(&self, errors: &mut Vec<String>) {
        if self.backend_command.trim().is_empty() {
            errors.push("instances: 'backend_command' must not be empty".to_string());
        }
        if self.content_root.as_os_str().is_empty() {
            errors.push("instances: 'content_root' must not be empty".to_string());
        }
        if self.port_range_start == 0 {
            errors.push("instances: 'port_range_start' must be greater than 0".to_string());
        }
        if self.port_range_start >= self.port_range_end {
            errors.push(format!(
                "instances: empty port range [{}, {})",
                self.port_range_start, self.port_range_end
            ));
        }
        if self.idle_timeout_secs == 0 {
            errors.push("instances: 'idle_timeout_secs' must be greater than 0".to_string());
        }
        if self.reap_interval_secs == 0 {
            errors.push("instances: 'reap_interval_secs' must be greater than 0".to_string());
        }
        if self.startup_retries == 0 {
            errors.push("instances: 'startup_retries' must be greater than 0".to_string());
        }
    }
}

/// OAuth identity provider credentials and session cookie settings
#[derive(Debug, Deserialize, Clone)]
pub struct AuthSettings {
    pub client_id: String,
    pub client_secret: String,

    /// Provider authorization endpoint the browser is sent to
    pub authorize_url: String,

    /// Provider token endpoint (authorization code exchange)
    pub token_url: String,

    /// Provider endpoint describing the logged-in user
    pub userinfo_url: String,

    /// Our own `/auth/callback` URL as registered with the provider
    pub redirect_url: String,

    /// Field of the userinfo document holding the tenant identifier
    #[serde(default = "default_username_field")]
    pub username_field: String,

    /// Space separated scopes to request (default: none)
    #[serde(default)]
    pub scopes: String,

    /// HMAC secret for session tokens
    pub session_secret: String,

    #[serde(default = "default_session_expiry_hours")]
    pub session_expiry_hours: i64,

    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,

    /// Mark cookies `Secure` (default: true)
    #[serde(default = "default_true")]
    pub cookie_secure: bool,
}

impl AuthSettings {
    fn validate(&self, errors: &mut Vec<String>) {
        let required = [
            ("client_id", &self.client_id),
            ("client_secret", &self.client_secret),
            ("authorize_url", &self.authorize_url),
            ("token_url", &self.token_url),
            ("userinfo_url", &self.userinfo_url),
            ("redirect_url", &self.redirect_url),
            ("username_field", &self.username_field),
            ("session_secret", &self.session_secret),
            ("cookie_name", &self.cookie_name),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                errors.push(format!("auth: '{}' must not be empty", name));
            }
        }
        if self.session_expiry_hours <= 0 {
            errors.push("auth: 'session_expiry_hours' must be greater than 0".to_string());
        }
    }
}

// Default value functions
fn default_listen_port() -> u16 {
    5019
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_backend_args() -> Vec<String> {
    ["-content", "{content}", "serve", "-listen={listen}", "-root={root}"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_assets_dir() -> PathBuf {
    std::env::temp_dir().join("bullpen-assets")
}

fn default_port_range_start() -> u16 {
    6000
}

fn default_port_range_end() -> u16 {
    7000
}

fn default_idle_timeout() -> u64 {
    600 // 10 minutes
}

fn default_reap_interval() -> u64 {
    60
}

fn default_startup_retries() -> u32 {
    20
}

fn default_startup_poll_interval() -> u64 {
    100
}

fn default_shutdown_grace_period() -> u64 {
    5
}

fn default_username_field() -> String {
    "login".to_string()
}

fn default_session_expiry_hours() -> i64 {
    24
}

fn default_cookie_name() -> String {
    "bullpen_session".to_string()
}

fn default_true() -> bool {
    true
}

fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => dirs_next::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| path.to_path_buf()),
        Err(_) => path.to_path_buf(),
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.instances.expand_paths();
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        self.instances.validate(&mut errors);
        if let Some(auth) = &self.auth {
            auth.validate(&mut errors);
        }
        if self.server.request_timeout_secs == 0 {
            errors.push("server: 'request_timeout_secs' must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[instances]
content_root = "/srv/agora/garden"
backend_command = "/usr/local/bin/bull"
"#;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
port = 8080
bind = "0.0.0.0"
admin_port = 9000
request_timeout_secs = 10

[instances]
content_root = "/srv/agora/garden"
backend_command = "/usr/local/bin/bull"
backend_args = ["serve", "--port={port}", "--dir={content}"]
assets_dir = "/tmp/assets"
port_range_start = 6100
port_range_end = 6200
idle_timeout_secs = 300

[instances.env]
BULL_THEME = "dark"

[auth]
client_id = "bullpen"
client_secret = "s3cret"
authorize_url = "https://git.example.org/login/oauth/authorize"
token_url = "https://git.example.org/login/oauth/access_token"
userinfo_url = "https://git.example.org/api/v1/user"
redirect_url = "https://edit.example.org/auth/callback"
session_secret = "hmac-secret"
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.admin_port, 9000);
        assert_eq!(config.server.request_timeout(), Duration::from_secs(10));
        assert_eq!(config.instances.port_range_start, 6100);
        assert_eq!(config.instances.port_range_end, 6200);
        assert_eq!(config.instances.idle_timeout(), Duration::from_secs(300));
        assert_eq!(config.instances.backend_args.len(), 3);
        assert_eq!(config.instances.env.get("BULL_THEME").unwrap(), "dark");

        let auth = config.auth.unwrap();
        assert_eq!(auth.username_field, "login");
        assert_eq!(auth.cookie_name, "bullpen_session");
        assert!(auth.cookie_secure);
        assert_eq!(auth.session_expiry_hours, 24);
    }

    #[test]
    fn test_minimal_config_defaults() {
        let config: Config = toml::from_str(MINIMAL).unwrap();
        config.validate().unwrap();

        assert_eq!(config.server.port, 5019);
        assert_eq!(config.server.bind, "127.0.0.1");
        assert!(!config.server.admin_enabled());
        assert_eq!(config.server.request_timeout_secs, 30);
        assert!(config.auth.is_none());

        let instances = &config.instances;
        assert_eq!(instances.port_range_start, 6000);
        assert_eq!(instances.port_range_end, 7000);
        assert_eq!(instances.idle_timeout(), Duration::from_secs(600));
        assert_eq!(instances.reap_interval(), Duration::from_secs(60));
        assert_eq!(instances.startup_retries, 20);
        assert_eq!(instances.startup_poll_interval(), Duration::from_millis(100));
        assert_eq!(instances.shutdown_grace_period(), Duration::from_secs(5));
        assert_eq!(
            instances.backend_args,
            vec!["-content", "{content}", "serve", "-listen={listen}", "-root={root}"]
        );
    }

    #[test]
    fn test_instances_table_is_required() {
        let result: Result<Config, _> = toml::from_str("[server]\nport = 80\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_port_range() {
        let mut config: Config = toml::from_str(MINIMAL).unwrap();
        config.instances.port_range_start = 7000;
        config.instances.port_range_end = 7000;

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("empty port range"));
    }

    #[test]
    fn test_validate_multiple_errors() {
        let mut config: Config = toml::from_str(MINIMAL).unwrap();
        config.instances.backend_command = " ".to_string();
        config.instances.idle_timeout_secs = 0;
        config.instances.startup_retries = 0;

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("backend_command"));
        assert!(err.contains("idle_timeout_secs"));
        assert!(err.contains("startup_retries"));
    }

    #[test]
    fn test_validate_auth_requires_credentials() {
        let toml = format!(
            "{}\n[auth]\nclient_id = \"\"\nclient_secret = \"x\"\nauthorize_url = \"a\"\ntoken_url = \"t\"\nuserinfo_url = \"u\"\nredirect_url = \"r\"\nsession_secret = \"\"\n",
            MINIMAL
        );
        let config: Config = toml::from_str(&toml).unwrap();

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("client_id"));
        assert!(err.contains("session_secret"));
        assert!(!err.contains("client_secret"));
    }

    #[test]
    fn test_instance_settings_builder() {
        let settings = InstanceSettings::new("/garden", "bull")
            .with_port_range(20000, 20010)
            .with_assets_dir("/tmp/x");

        assert_eq!(settings.content_root, PathBuf::from("/garden"));
        assert_eq!(settings.port_range_start, 20000);
        assert_eq!(settings.port_range_end, 20010);
        assert_eq!(settings.assets_dir, PathBuf::from("/tmp/x"));
    }

    #[test]
    fn test_expand_home() {
        let plain = expand_home(Path::new("/srv/garden"));
        assert_eq!(plain, PathBuf::from("/srv/garden"));

        if let Some(home) = dirs_next::home_dir() {
            assert_eq!(expand_home(Path::new("~/go/bin/bull")), home.join("go/bin/bull"));
        }
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bullpen.toml");
        std::fs::write(&path, MINIMAL).unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.instances.backend_command, "/usr/local/bin/bull");

        std::fs::write(&path, "[instances]\ncontent_root = \"/g\"\nbackend_command = \"\"\n").unwrap();
        assert!(Config::load(&path).is_err());
    }
}
