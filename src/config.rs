//! Configuration management with serde serialization/deserialization
//!
//! This module provides the service configuration, the render request and
//! result types, and the Chrome launch settings used by every worker.

use crate::RenderError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure for the renderer
///
/// Controls the worker pool size, per-request timeouts, result caching,
/// worker recycling and request blocking.
///
/// # Examples
///
/// ```rust
/// use rendergun::Config;
///
/// // Use default configuration
/// let config = Config::default();
///
/// // Create custom configuration
/// let config = Config {
///     pool_size: 2,
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Number of renderer workers, each owning one Chrome process (default: 4)
    pub pool_size: usize,

    /// Navigation timeout applied when a request does not carry its own (default: 10 seconds)
    pub request_timeout: Duration,

    /// Largest per-request timeout a caller may ask for (default: 60 seconds)
    pub max_request_timeout: Duration,

    /// Result cache limits
    pub cache: CacheConfig,

    /// When workers are recycled to bound browser-side memory growth
    pub restart: RestartPolicy,

    /// Regular expression matched against every outgoing request URL; matches are aborted
    pub blacklist_pattern: Option<String>,

    /// Where the ad-block host list is read from
    pub adblock_hosts: HostsSource,

    /// Path to Chrome/Chromium executable (default: auto-detect)
    pub chrome_path: Option<String>,

    /// User-Agent sent by every rendered page
    pub user_agent: String,

    /// How often cache and pool statistics are logged (default: 30 seconds)
    pub stats_interval: Duration,

    /// Delay between relaunch attempts after a browser exited (default: 1 second)
    pub relaunch_delay: Duration,

    /// Deadline for the control-channel round trip used by health checks (default: 2 seconds)
    pub health_probe_timeout: Duration,

    /// HTTP listener settings
    pub server: ServerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pool_size: 4,
            request_timeout: Duration::from_millis(10_000),
            max_request_timeout: Duration::from_secs(60),
            cache: CacheConfig::default(),
            restart: RestartPolicy::default(),
            blacklist_pattern: None,
            adblock_hosts: HostsSource::default(),
            chrome_path: None,
            user_agent: format!("rendergun/{}", env!("CARGO_PKG_VERSION")),
            stats_interval: Duration::from_secs(30),
            relaunch_delay: Duration::from_secs(1),
            health_probe_timeout: Duration::from_secs(2),
            server: ServerConfig::default(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), RenderError> {
        if self.pool_size == 0 {
            return Err(RenderError::Configuration(
                "Pool size must be greater than 0".to_string(),
            ));
        }

        if self.request_timeout.is_zero() {
            return Err(RenderError::Configuration(
                "Request timeout must be greater than 0".to_string(),
            ));
        }

        if self.request_timeout > self.max_request_timeout {
            return Err(RenderError::Configuration(
                "Request timeout must not exceed the maximum request timeout".to_string(),
            ));
        }

        if self.cache.max_size == 0 {
            return Err(RenderError::Configuration(
                "Cache max size must be greater than 0".to_string(),
            ));
        }

        if self.restart.threshold == 0 {
            return Err(RenderError::Configuration(
                "Restart threshold must be greater than 0".to_string(),
            ));
        }

        if self.restart.check_interval.is_zero() || self.stats_interval.is_zero() {
            return Err(RenderError::Configuration(
                "Check intervals must be greater than 0".to_string(),
            ));
        }

        if let Some(pattern) = &self.blacklist_pattern {
            regex::Regex::new(pattern).map_err(|e| {
                RenderError::Configuration(format!("Invalid blacklist pattern: {e}"))
            })?;
        }

        Ok(())
    }
}

/// Result cache limits
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Upper bound on the summed body length of cached results, in bytes (default: 100 MiB)
    pub max_size: usize,

    /// Entries older than this are treated as absent (default: 30 minutes)
    pub max_age: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 100 * 1024 * 1024,
            max_age: Duration::from_secs(1800),
        }
    }
}

/// Request-count based worker recycling
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RestartPolicy {
    /// An idle worker that served more than this many requests is relaunched (default: 50)
    pub threshold: usize,

    /// How often workers are inspected (default: 30 seconds)
    pub check_interval: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            threshold: 50,
            check_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 3000,
        }
    }
}

/// Origin of the hosts-file formatted ad-block list
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HostsSource {
    /// Local file
    File(PathBuf),
    /// Downloaded once over HTTP(S)
    Url(String),
    /// Literal hosts-file text
    Inline(String),
}

impl Default for HostsSource {
    fn default() -> Self {
        HostsSource::File(PathBuf::from("data/adblock-hosts.txt"))
    }
}

impl HostsSource {
    /// Interprets `http://` and `https://` values as URLs and anything else as a path.
    pub fn parse(value: &str) -> Self {
        if value.starts_with("http://") || value.starts_with("https://") {
            HostsSource::Url(value.to_string())
        } else {
            HostsSource::File(PathBuf::from(value))
        }
    }
}

/// Page-load completion condition
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum WaitStrategy {
    /// The `load` event of the main document
    #[default]
    Load,
    /// No network activity in the main frame for a short quiet period
    NetworkIdle,
}

impl std::str::FromStr for WaitStrategy {
    type Err = RenderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "load" => Ok(WaitStrategy::Load),
            "network-idle" | "networkidle" | "networkidle0" => Ok(WaitStrategy::NetworkIdle),
            other => Err(RenderError::Configuration(format!(
                "Unknown wait strategy '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RenderRequest {
    pub id: String,
    pub url: String,
    /// HTML served for the main document instead of fetching it
    pub content: Option<String>,
    pub wait_until: WaitStrategy,
    /// Overrides the configured request timeout
    pub timeout: Option<Duration>,
    pub abort_request_pattern: Option<String>,
    pub block_ads: bool,
}

impl Default for RenderRequest {
    fn default() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            url: String::new(),
            content: None,
            wait_until: WaitStrategy::default(),
            timeout: None,
            abort_request_pattern: None,
            block_ads: false,
        }
    }
}

impl RenderRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenderResult {
    pub code: u16,
    pub body: String,
}

impl RenderResult {
    pub fn new(code: u16, body: impl Into<String>) -> Self {
        Self {
            code,
            body: body.into(),
        }
    }

    /// Only successful renders are worth keeping around.
    pub fn is_cacheable(&self) -> bool {
        (200..300).contains(&self.code)
    }
}

/// Generate Chrome command-line arguments for one worker
///
/// # Examples
///
/// ```rust
/// use rendergun::{Config, get_chrome_args};
///
/// let config = Config::default();
/// let args = get_chrome_args(&config);
/// assert!(args.contains(&"--no-sandbox".to_string()));
/// ```
pub fn get_chrome_args(config: &Config) -> Vec<String> {
    vec![
        "--no-sandbox".to_string(),
        "--disable-dev-shm-usage".to_string(),
        "--disable-gpu".to_string(),
        "--disable-background-timer-throttling".to_string(),
        "--disable-backgrounding-occluded-windows".to_string(),
        "--disable-renderer-backgrounding".to_string(),
        "--disable-features=TranslateUI".to_string(),
        "--disable-extensions".to_string(),
        "--disable-default-apps".to_string(),
        "--disable-sync".to_string(),
        "--no-first-run".to_string(),
        "--ignore-certificate-errors".to_string(),
        format!("--user-agent={}", config.user_agent),
        "--disable-background-networking".to_string(),
    ]
}

const BROWSER_TIMEOUT_MARGIN: Duration = Duration::from_secs(5);

/// Fresh Chrome profile directory for one worker.
pub(crate) fn user_data_dir(worker_id: usize) -> PathBuf {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    std::env::temp_dir().join(format!(
        "rendergun-{}-{}-{}",
        std::process::id(),
        worker_id,
        &suffix[..8]
    ))
}

/// Deadline for a single CDP command, navigation included. Sits above every
/// timeout a render may use so the render's own deadline always fires first.
pub fn browser_request_timeout(config: &Config) -> Duration {
    config.max_request_timeout.max(config.request_timeout) + BROWSER_TIMEOUT_MARGIN
}

/// Chrome launch configuration for one worker, with request interception enabled.
///
/// `user_data_dir` must not be shared with any other running browser.
pub fn create_browser_config(
    config: &Config,
    user_data_dir: &Path,
) -> Result<chromiumoxide::browser::BrowserConfig, RenderError> {
    use chromiumoxide::browser::BrowserConfig;

    let mut builder = BrowserConfig::builder()
        .args(get_chrome_args(config))
        .user_data_dir(user_data_dir)
        .enable_request_intercept()
        .request_timeout(browser_request_timeout(config));

    if let Some(chrome_path) = &config.chrome_path {
        builder = builder.chrome_executable(chrome_path);
    }

    builder.build().map_err(RenderError::BrowserLaunchFailed)
}
