//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The persona access token is loaded from COMPANION_ACCESS_TOKEN or
//! access_token_file, never stored in the TOML directly.

use common::Secret;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use companion_auth::{
    DEFAULT_BLAZE_ID, DEFAULT_PRODUCT_NAME, DEFAULT_TICKET_LIFETIME_SECS, WAL_LOGIN_ENDPOINT,
};
use companion_pool::PoolSettings;
use companion_poll::OrchestratorSettings;

/// Env var carrying the persona access token
pub const ACCESS_TOKEN_ENV: &str = "COMPANION_ACCESS_TOKEN";

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub pool: PoolConfig,
    pub persona: PersonaConfig,
    #[serde(default)]
    pub poller: PollerConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default)]
    pub streams: Vec<StreamConfig>,
}

/// Credential pool sizing and persistence
#[derive(Debug, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_min_pool_size")]
    pub min_pool_size: usize,
    #[serde(default = "default_refresh_cooldown")]
    pub refresh_cooldown_secs: u64,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,
    #[serde(default = "default_captured_auth_path")]
    pub captured_auth_path: PathBuf,
    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_pool_size: default_min_pool_size(),
            refresh_cooldown_secs: default_refresh_cooldown(),
            failure_threshold: default_failure_threshold(),
            state_path: default_state_path(),
            captured_auth_path: default_captured_auth_path(),
            maintenance_interval_secs: default_maintenance_interval(),
        }
    }
}

/// Persona used to mint session tickets
#[derive(Debug, Deserialize)]
pub struct PersonaConfig {
    #[serde(skip)]
    pub access_token: Option<Secret<String>>,
    /// Path to a file holding the access token (alternative to the env var)
    #[serde(default)]
    pub access_token_file: Option<PathBuf>,
    #[serde(default)]
    pub persona_id: Option<u64>,
    #[serde(default)]
    pub cookie: Option<Secret<String>>,
    #[serde(default = "default_login_endpoint")]
    pub login_endpoint: String,
    #[serde(default = "default_product_name")]
    pub product_name: String,
    #[serde(default = "default_blaze_id")]
    pub blaze_id: String,
    #[serde(default = "default_ticket_lifetime")]
    pub ticket_lifetime_secs: u64,
}

/// Polling cadence, timeouts and backoff
#[derive(Debug, Deserialize)]
pub struct PollerConfig {
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_ceiling")]
    pub backoff_ceiling_secs: u64,
    #[serde(default = "default_jitter")]
    pub jitter: f64,
    #[serde(default = "default_success_key")]
    pub success_key: String,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval(),
            request_timeout_secs: default_request_timeout(),
            max_consecutive_failures: default_max_consecutive_failures(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_ceiling_secs: default_backoff_ceiling(),
            jitter: default_jitter(),
            success_key: default_success_key(),
        }
    }
}

/// Where normalized auctions are written
#[derive(Debug, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_output_path")]
    pub path: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            path: default_output_path(),
        }
    }
}

/// Health and metrics listener
#[derive(Debug, Deserialize)]
pub struct AdminConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            max_connections: default_max_connections(),
        }
    }
}

/// One independently polled request stream
#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    pub name: String,
    /// Path to the JSON request template
    pub template: PathBuf,
    /// Per-stream overrides for template placeholders
    #[serde(default)]
    pub context: BTreeMap<String, String>,
    /// Overrides `poller.interval_secs` for this stream
    #[serde(default)]
    pub interval_secs: Option<u64>,
}

fn default_min_pool_size() -> usize {
    2
}

fn default_refresh_cooldown() -> u64 {
    10
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_state_path() -> PathBuf {
    PathBuf::from("pool-state.json")
}

fn default_captured_auth_path() -> PathBuf {
    PathBuf::from("captured-auth.json")
}

fn default_maintenance_interval() -> u64 {
    30
}

fn default_login_endpoint() -> String {
    WAL_LOGIN_ENDPOINT.to_string()
}

fn default_product_name() -> String {
    DEFAULT_PRODUCT_NAME.to_string()
}

fn default_blaze_id() -> String {
    DEFAULT_BLAZE_ID.to_string()
}

fn default_ticket_lifetime() -> u64 {
    DEFAULT_TICKET_LIFETIME_SECS
}

fn default_interval() -> u64 {
    5
}

fn default_request_timeout() -> u64 {
    10
}

fn default_max_consecutive_failures() -> u32 {
    5
}

fn default_backoff_base_ms() -> u64 {
    1000
}

fn default_backoff_ceiling() -> u64 {
    60
}

fn default_jitter() -> f64 {
    0.2
}

fn default_success_key() -> String {
    "responseInfo".to_string()
}

fn default_output_path() -> PathBuf {
    PathBuf::from("auctions.jsonl")
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9090))
}

fn default_max_connections() -> usize {
    64
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Access token resolution order:
    /// 1. COMPANION_ACCESS_TOKEN env var
    /// 2. access_token_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.validate()?;

        if let Ok(token) = std::env::var(ACCESS_TOKEN_ENV) {
            let token = token.trim().to_owned();
            if !token.is_empty() {
                config.persona.access_token = Some(Secret::new(token));
            }
        }
        if config.persona.access_token.is_some() {
            return Ok(config);
        }
        if let Some(ref token_file) = config.persona.access_token_file {
            let token = std::fs::read_to_string(token_file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read access_token_file {}: {e}",
                    token_file.display()
                ))
            })?;
            let token = token.trim().to_owned();
            if !token.is_empty() {
                config.persona.access_token = Some(Secret::new(token));
            }
        }

        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        let endpoint = &self.persona.login_endpoint;
        if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
            return Err(common::Error::Config(format!(
                "login_endpoint must start with http:// or https://, got: {endpoint}"
            )));
        }

        let non_zero = [
            ("min_pool_size", self.pool.min_pool_size as u64),
            ("refresh_cooldown_secs", self.pool.refresh_cooldown_secs),
            ("failure_threshold", u64::from(self.pool.failure_threshold)),
            ("maintenance_interval_secs", self.pool.maintenance_interval_secs),
            ("ticket_lifetime_secs", self.persona.ticket_lifetime_secs),
            ("interval_secs", self.poller.interval_secs),
            ("request_timeout_secs", self.poller.request_timeout_secs),
            (
                "max_consecutive_failures",
                u64::from(self.poller.max_consecutive_failures),
            ),
            ("backoff_base_ms", self.poller.backoff_base_ms),
            ("backoff_ceiling_secs", self.poller.backoff_ceiling_secs),
            ("max_connections", self.admin.max_connections as u64),
        ];
        for (name, value) in non_zero {
            if value == 0 {
                return Err(common::Error::Config(format!(
                    "{name} must be greater than 0"
                )));
            }
        }

        if !(0.0..=1.0).contains(&self.poller.jitter) {
            return Err(common::Error::Config(format!(
                "jitter must be between 0.0 and 1.0, got: {}",
                self.poller.jitter
            )));
        }

        if self.streams.is_empty() {
            return Err(common::Error::Config(
                "at least one [[streams]] entry is required".into(),
            ));
        }
        let mut seen = std::collections::BTreeSet::new();
        for stream in &self.streams {
            if stream.name.trim().is_empty() {
                return Err(common::Error::Config("stream name must not be empty".into()));
            }
            if !seen.insert(stream.name.as_str()) {
                return Err(common::Error::Config(format!(
                    "duplicate stream name: {}",
                    stream.name
                )));
            }
            if stream.interval_secs == Some(0) {
                return Err(common::Error::Config(format!(
                    "stream {}: interval_secs must be greater than 0",
                    stream.name
                )));
            }
        }

        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("auction-collector.toml")
    }

    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            min_pool_size: self.pool.min_pool_size,
            refresh_cooldown: Duration::from_secs(self.pool.refresh_cooldown_secs),
            failure_threshold: self.pool.failure_threshold,
        }
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            request_timeout: Duration::from_secs(self.poller.request_timeout_secs),
            backoff_base: Duration::from_millis(self.poller.backoff_base_ms),
            backoff_ceiling: Duration::from_secs(self.poller.backoff_ceiling_secs),
            jitter: self.poller.jitter,
            success_key: self.poller.success_key.clone(),
            ..OrchestratorSettings::default()
        }
    }

    /// Poll interval for `stream`, falling back to the poller default.
    pub fn stream_interval(&self, stream: &StreamConfig) -> Duration {
        Duration::from_secs(stream.interval_secs.unwrap_or(self.poller.interval_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Serializes tests that mutate environment variables.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// SAFETY: Callers must hold ENV_MUTEX to prevent concurrent env mutation.
    unsafe fn set_env(key: &str, val: &str) {
        unsafe { std::env::set_var(key, val) };
    }

    unsafe fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) };
    }

    fn valid_toml() -> &'static str {
        r#"
[persona]
persona_id = 1234567

[[streams]]
name = "auctions"
template = "templates/auction_search.json"
"#
    }

    fn write_config(dir: &tempfile::TempDir, contents: &str) -> PathBuf {
        let path = dir.path().join("config.toml");
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_load_valid_config_with_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, valid_toml());
        unsafe { remove_env(ACCESS_TOKEN_ENV) };

        let config = Config::load(&path).unwrap();
        assert_eq!(config.pool.min_pool_size, 2);
        assert_eq!(config.pool.refresh_cooldown_secs, 10);
        assert_eq!(config.pool.failure_threshold, 3);
        assert_eq!(config.persona.persona_id, Some(1234567));
        assert_eq!(config.persona.login_endpoint, WAL_LOGIN_ENDPOINT);
        assert_eq!(config.poller.interval_secs, 5);
        assert_eq!(config.poller.request_timeout_secs, 10);
        assert_eq!(config.poller.max_consecutive_failures, 5);
        assert_eq!(config.poller.success_key, "responseInfo");
        assert_eq!(config.admin.listen_addr.port(), 9090);
        assert_eq!(config.streams.len(), 1);
        assert_eq!(config.streams[0].name, "auctions");
        assert!(config.persona.access_token.is_none());
    }

    #[test]
    fn test_load_missing_file() {
        let result = Config::load(Path::new("/nonexistent/path/config.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_load_invalid_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "not valid {{{{ toml");
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn test_access_token_from_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, valid_toml());

        unsafe { set_env(ACCESS_TOKEN_ENV, "eyJ.env.token") };
        let config = Config::load(&path).unwrap();
        assert_eq!(
            config.persona.access_token.as_ref().unwrap().expose(),
            "eyJ.env.token"
        );
        unsafe { remove_env(ACCESS_TOKEN_ENV) };
    }

    #[test]
    fn test_access_token_from_file() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let token_path = dir.path().join("access_token");
        std::fs::write(&token_path, "eyJ.file.token\n").unwrap();
        let path = write_config(
            &dir,
            &format!(
                r#"
[persona]
access_token_file = "{}"

[[streams]]
name = "auctions"
template = "t.json"
"#,
                token_path.display()
            ),
        );

        unsafe { remove_env(ACCESS_TOKEN_ENV) };
        let config = Config::load(&path).unwrap();
        assert_eq!(
            config.persona.access_token.as_ref().unwrap().expose(),
            "eyJ.file.token"
        );
    }

    #[test]
    fn test_access_token_env_overrides_missing_file() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[persona]
access_token_file = "/nonexistent/path/access_token"

[[streams]]
name = "auctions"
template = "t.json"
"#,
        );

        unsafe { set_env(ACCESS_TOKEN_ENV, "eyJ.env.wins") };
        let config = Config::load(&path).unwrap();
        assert_eq!(
            config.persona.access_token.as_ref().unwrap().expose(),
            "eyJ.env.wins",
            "env var must take precedence over access_token_file"
        );
        unsafe { remove_env(ACCESS_TOKEN_ENV) };
    }

    #[test]
    fn test_missing_access_token_file_is_error() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[persona]
access_token_file = "/nonexistent/path/access_token"

[[streams]]
name = "auctions"
template = "t.json"
"#,
        );

        unsafe { remove_env(ACCESS_TOKEN_ENV) };
        let err = Config::load(&path).unwrap_err().to_string();
        assert!(err.contains("access_token_file"), "got: {err}");
    }

    #[test]
    fn test_cookie_is_redacted_in_debug() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[persona]
cookie = "sid=very-secret"

[[streams]]
name = "auctions"
template = "t.json"
"#,
        );
        unsafe { remove_env(ACCESS_TOKEN_ENV) };

        let config = Config::load(&path).unwrap();
        assert_eq!(
            config.persona.cookie.as_ref().unwrap().expose(),
            "sid=very-secret"
        );
        assert!(!format!("{config:?}").contains("very-secret"));
    }

    #[test]
    fn test_stream_context_and_interval_override() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[persona]

[poller]
interval_secs = 7

[[streams]]
name = "qb-gold"
template = "search.json"
interval_secs = 2
context = { position = "QB", rarity = "gold" }

[[streams]]
name = "all"
template = "search.json"
"#,
        );
        unsafe { remove_env(ACCESS_TOKEN_ENV) };

        let config = Config::load(&path).unwrap();
        assert_eq!(config.streams[0].context["position"], "QB");
        assert_eq!(
            config.stream_interval(&config.streams[0]),
            Duration::from_secs(2)
        );
        assert_eq!(
            config.stream_interval(&config.streams[1]),
            Duration::from_secs(7)
        );
    }

    #[test]
    fn test_settings_conversion() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[pool]
min_pool_size = 4
refresh_cooldown_secs = 20
failure_threshold = 2

[persona]

[poller]
request_timeout_secs = 3
backoff_base_ms = 250
backoff_ceiling_secs = 30
jitter = 0.0
success_key = "data"

[[streams]]
name = "auctions"
template = "t.json"
"#,
        );
        unsafe { remove_env(ACCESS_TOKEN_ENV) };

        let config = Config::load(&path).unwrap();
        let pool = config.pool_settings();
        assert_eq!(pool.min_pool_size, 4);
        assert_eq!(pool.refresh_cooldown, Duration::from_secs(20));
        assert_eq!(pool.failure_threshold, 2);

        let poll = config.orchestrator_settings();
        assert_eq!(poll.request_timeout, Duration::from_secs(3));
        assert_eq!(poll.backoff_base, Duration::from_millis(250));
        assert_eq!(poll.backoff_ceiling, Duration::from_secs(30));
        assert_eq!(poll.jitter, 0.0);
        assert_eq!(poll.success_key, "data");
    }

    #[test]
    fn test_empty_streams_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "[persona]\n");
        let err = Config::load(&path).unwrap_err().to_string();
        assert!(err.contains("[[streams]]"), "got: {err}");
    }

    #[test]
    fn test_duplicate_stream_names_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[persona]

[[streams]]
name = "auctions"
template = "a.json"

[[streams]]
name = "auctions"
template = "b.json"
"#,
        );
        let err = Config::load(&path).unwrap_err().to_string();
        assert!(err.contains("duplicate stream name"), "got: {err}");
    }

    #[test]
    fn test_zero_values_rejected() {
        let cases = [
            ("[pool]\nmin_pool_size = 0\n", "min_pool_size"),
            ("[pool]\nrefresh_cooldown_secs = 0\n", "refresh_cooldown_secs"),
            ("[poller]\nrequest_timeout_secs = 0\n", "request_timeout_secs"),
            ("[poller]\ninterval_secs = 0\n", "interval_secs"),
            (
                "[poller]\nmax_consecutive_failures = 0\n",
                "max_consecutive_failures",
            ),
            ("[admin]\nmax_connections = 0\n", "max_connections"),
        ];
        for (section, field) in cases {
            let dir = tempfile::tempdir().unwrap();
            let contents = format!(
                "{section}\n[persona]\n\n[[streams]]\nname = \"a\"\ntemplate = \"t.json\"\n"
            );
            let path = write_config(&dir, &contents);
            let err = Config::load(&path).unwrap_err().to_string();
            assert!(err.contains(field), "{field}: got {err}");
        }
    }

    #[test]
    fn test_out_of_range_jitter_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            "[persona]\n\n[poller]\njitter = 1.5\n\n[[streams]]\nname = \"a\"\ntemplate = \"t.json\"\n",
        );
        let err = Config::load(&path).unwrap_err().to_string();
        assert!(err.contains("jitter"), "got: {err}");
    }

    #[test]
    fn test_invalid_login_endpoint_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[persona]
login_endpoint = "wal2.tools.gos.bio-iad.ea.com/wal/authentication/login"

[[streams]]
name = "auctions"
template = "t.json"
"#,
        );
        let err = Config::load(&path).unwrap_err().to_string();
        assert!(
            err.contains("login_endpoint must start with http"),
            "got: {err}"
        );
    }

    #[test]
    fn test_resolve_path_cli_arg() {
        let path = Config::resolve_path(Some("/custom/path.toml"));
        assert_eq!(path, PathBuf::from("/custom/path.toml"));
    }

    #[test]
    fn test_resolve_path_env_var() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("CONFIG_PATH", "/env/path.toml") };
        let path = Config::resolve_path(None);
        assert_eq!(path, PathBuf::from("/env/path.toml"));
        unsafe { remove_env("CONFIG_PATH") };
    }

    #[test]
    fn test_resolve_path_default() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("CONFIG_PATH") };
        let path = Config::resolve_path(None);
        assert_eq!(path, PathBuf::from("auction-collector.toml"));
    }

    #[test]
    fn test_resolve_path_cli_overrides_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("CONFIG_PATH", "/env/should-lose.toml") };
        let path = Config::resolve_path(Some("/cli/wins.toml"));
        assert_eq!(path, PathBuf::from("/cli/wins.toml"));
        unsafe { remove_env("CONFIG_PATH") };
    }
}
