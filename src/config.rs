//! Configuration management with serde serialization/deserialization
//!
//! This module holds the service configuration, the environment overrides the
//! server accepts, the render request model, and the Chromium launch settings.

use crate::RenderError;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::str::FromStr;
use std::time::Duration;

/// Environment variable holding the render timeout in milliseconds.
pub const ENV_RENDER_TIMEOUT: &str = "SCREENSHOT_TIMEOUT";
/// Environment variable holding the pool restart gutter time in milliseconds.
pub const ENV_RESTART_GUTTER: &str = "RESTART_HOUR";
/// Environment variable holding the number of browser instances.
pub const ENV_POOL_SIZE: &str = "CHROMIUM_NUM";
/// Environment variable holding the queue concurrency ceiling.
pub const ENV_CONCURRENCY: &str = "CONCURRENCY";
/// Environment variable holding the per-window request limit.
pub const ENV_RATE_LIMIT: &str = "RATE_LIMIT";
/// Environment variable holding the listen port.
pub const ENV_PORT: &str = "PORT";

/// Main configuration structure for the render service
///
/// Controls the browser pool, the task queue, the restart cycle and the
/// per-client rate limit.
///
/// # Examples
///
/// ```rust
/// use render_pool::Config;
///
/// let config = Config {
///     pool_size: 4,
///     max_queue: 8,
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Number of Chromium instances kept in the pool (default: 1)
    ///
    /// Jobs share instances when this is lower than `max_queue`; each render
    /// still gets its own page.
    pub pool_size: usize,

    /// Maximum number of render jobs executing at once (default: 10)
    pub max_queue: usize,

    /// Deadline for a single render call (default: 10 seconds)
    pub render_timeout: Duration,

    /// Pool age after which every instance is replaced (default: 12 hours)
    pub restart_gutter: Duration,

    /// How often the restart coordinator checks the pool age (default: 30 seconds)
    pub restart_check_interval: Duration,

    /// Requests admitted per client within one window (default: 100)
    pub rate_limit_max: u32,

    /// Length of a rate-limit window (default: 60 seconds)
    pub rate_limit_window: Duration,

    /// Tracked client keys above which expired windows are swept (default: 10000)
    pub rate_limit_max_keys: usize,

    /// Address the HTTP server binds to (default: 0.0.0.0)
    pub bind_address: String,

    /// Port the HTTP server listens on (default: 3030)
    pub port: u16,

    /// Base name of the attachment returned to clients (default: "file")
    pub default_out_name: String,

    /// Browser viewport used for every page
    pub viewport: Viewport,

    /// Path to the Chrome/Chromium executable (default: auto-detect)
    pub chrome_path: Option<String>,

    /// Port for the Prometheus exporter; disabled when unset
    pub metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pool_size: 1,
            max_queue: 10,
            render_timeout: Duration::from_millis(10_000),
            restart_gutter: Duration::from_millis(43_200_000),
            restart_check_interval: Duration::from_secs(30),
            rate_limit_max: 100,
            rate_limit_window: Duration::from_secs(60),
            rate_limit_max_keys: 10_000,
            bind_address: "0.0.0.0".to_string(),
            port: 3030,
            default_out_name: "file".to_string(),
            viewport: Viewport::default(),
            chrome_path: None,
            metrics_port: None,
        }
    }
}

impl Config {
    /// Parse a JSON configuration document; missing fields keep their defaults.
    pub fn from_json(content: &str) -> Result<Self, RenderError> {
        Ok(serde_json::from_str(content)?)
    }

    /// Apply the environment-style overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<(), RenderError> {
        self.apply_env_from(|name| std::env::var(name).ok())
    }

    /// Apply environment-style overrides read through `lookup`.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), RenderError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(ms) = parse_var::<u64, _>(&lookup, ENV_RENDER_TIMEOUT)? {
            self.render_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, ENV_RESTART_GUTTER)? {
            self.restart_gutter = Duration::from_millis(ms);
        }
        if let Some(size) = parse_var(&lookup, ENV_POOL_SIZE)? {
            self.pool_size = size;
        }
        if let Some(concurrency) = parse_var(&lookup, ENV_CONCURRENCY)? {
            self.max_queue = concurrency;
        }
        if let Some(max) = parse_var(&lookup, ENV_RATE_LIMIT)? {
            self.rate_limit_max = max;
        }
        if let Some(port) = parse_var(&lookup, ENV_PORT)? {
            self.port = port;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), RenderError> {
        if self.pool_size == 0 {
            return Err(RenderError::Configuration(
                "Pool size must be greater than 0".to_string(),
            ));
        }

        if self.max_queue == 0 {
            return Err(RenderError::Configuration(
                "Queue concurrency must be greater than 0".to_string(),
            ));
        }

        if self.render_timeout.is_zero() {
            return Err(RenderError::Configuration(
                "Render timeout must be greater than 0".to_string(),
            ));
        }

        if self.restart_check_interval.is_zero() {
            return Err(RenderError::Configuration(
                "Restart check interval must be greater than 0".to_string(),
            ));
        }

        if self.rate_limit_max == 0 || self.rate_limit_window.is_zero() {
            return Err(RenderError::Configuration(
                "Rate limit and window must be greater than 0".to_string(),
            ));
        }

        if self.viewport.width == 0 || self.viewport.height == 0 {
            return Err(RenderError::Configuration(
                "Viewport dimensions must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

fn parse_var<T, F>(lookup: &F, name: &str) -> Result<Option<T>, RenderError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| RenderError::Configuration(format!("{name} must be an integer, got {raw:?}"))),
        _ => Ok(None),
    }
}

/// Browser viewport configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Viewport {
    /// Viewport width in pixels (default: 1366)
    pub width: u32,

    /// Viewport height in pixels (default: 768)
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1366,
            height: 768,
        }
    }
}

/// What a render job produces
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    /// Whole page printed as A4 PDF
    Pdf,
    /// PNG screenshot of the page or of the selected element
    #[default]
    Image,
}

impl OutputKind {
    /// Interpret the request's `type` field. Only `"pdf"` selects PDF output.
    pub fn from_type_field(value: Option<&str>) -> Self {
        match value {
            Some("pdf") => OutputKind::Pdf,
            _ => OutputKind::Image,
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            OutputKind::Pdf => "application/pdf",
            OutputKind::Image => "image/png",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            OutputKind::Pdf => "pdf",
            OutputKind::Image => "png",
        }
    }
}

/// Parameters of one render job, as sent by the client
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RenderRequest {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub html: Option<String>,
    #[serde(default)]
    pub selector: Option<String>,
    #[serde(
        rename = "type",
        default,
        deserialize_with = "deserialize_output_kind"
    )]
    pub output: OutputKind,
}

fn deserialize_output_kind<'de, D>(deserializer: D) -> Result<OutputKind, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(OutputKind::from_type_field(raw.as_deref()))
}

/// Where the browser should navigate for a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderTarget<'a> {
    Url(&'a str),
    Html(&'a str),
}

impl RenderRequest {
    pub fn from_url(url: impl Into<String>, output: OutputKind) -> Self {
        Self {
            url: Some(url.into()),
            output,
            ..Default::default()
        }
    }

    pub fn from_html(html: impl Into<String>, output: OutputKind) -> Self {
        Self {
            html: Some(html.into()),
            output,
            ..Default::default()
        }
    }

    /// Parse a request body. A body that is not a JSON object yields an
    /// empty request, which then fails validation. Fields of the wrong type
    /// are ignored one by one rather than rejecting the whole body.
    pub fn from_body(body: &[u8]) -> Self {
        let Ok(Value::Object(fields)) = serde_json::from_slice::<Value>(body) else {
            return Self::default();
        };
        let text = |name: &str| fields.get(name).and_then(Value::as_str).map(str::to_string);

        Self {
            url: text("url"),
            html: text("html"),
            selector: text("selector"),
            output: OutputKind::from_type_field(fields.get("type").and_then(Value::as_str)),
        }
    }

    /// Reject requests that carry neither a URL nor HTML.
    pub fn validate(&self) -> Result<(), RenderError> {
        if self.url.is_some() || self.html.is_some() {
            Ok(())
        } else {
            Err(RenderError::Validation(
                "either url or html must be provided".to_string(),
            ))
        }
    }

    /// The navigation target; `url` wins when both are present.
    pub fn target(&self) -> Option<RenderTarget<'_>> {
        match (&self.url, &self.html) {
            (Some(url), _) => Some(RenderTarget::Url(url)),
            (None, Some(html)) => Some(RenderTarget::Html(html)),
            (None, None) => None,
        }
    }

    /// Selector to wait for, ignoring empty strings.
    pub fn selector(&self) -> Option<&str> {
        self.selector.as_deref().filter(|s| !s.is_empty())
    }

    /// Short description for log lines; HTML bodies are not logged in full.
    pub fn describe(&self) -> String {
        match self.target() {
            Some(RenderTarget::Url(url)) => format!("url={url}"),
            Some(RenderTarget::Html(html)) => format!("html=<{} bytes>", html.len()),
            None => "empty".to_string(),
        }
    }
}

/// Generate Chromium command-line arguments for a pool slot
///
/// Each slot gets its own user data directory so that several instances
/// can run side by side.
pub fn get_chrome_args(config: &Config, slot: usize) -> Vec<String> {
    let unique_id = format!("{}-{}", std::process::id(), slot);

    vec![
        "--headless".to_string(),
        "--no-sandbox".to_string(),
        "--disable-setuid-sandbox".to_string(),
        "--disable-dev-shm-usage".to_string(),
        "--disable-gpu".to_string(),
        "--no-first-run".to_string(),
        "--no-zygote".to_string(),
        "--disable-extensions".to_string(),
        "--ignore-certificate-errors".to_string(),
        format!(
            "--window-size={},{}",
            config.viewport.width, config.viewport.height
        ),
        format!("--user-data-dir=/tmp/render-pool-{unique_id}"),
    ]
}

pub fn create_browser_config(
    config: &Config,
    slot: usize,
) -> Result<chromiumoxide::browser::BrowserConfig, RenderError> {
    use chromiumoxide::browser::BrowserConfig;

    let mut builder = BrowserConfig::builder()
        .window_size(config.viewport.width, config.viewport.height)
        .args(get_chrome_args(config, slot));

    if let Some(chrome_path) = &config.chrome_path {
        builder = builder.chrome_executable(chrome_path);
    }

    builder.build().map_err(RenderError::PoolLaunchFailure)
}
