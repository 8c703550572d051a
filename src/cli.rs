use crate::{
    format_bytes, format_duration, AppState, BrowserLauncher, Config, OutputKind,
    RenderRequest, RenderService, RestartCoordinator,
};
use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "render-pool")]
#[command(about = "Render web pages to PNG or PDF through a pool of headless Chromium instances")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    #[arg(long, global = true, help = "Configuration file path (JSON)")]
    pub config: Option<PathBuf>,

    #[arg(long, global = true, help = "Number of Chromium instances")]
    pub pool_size: Option<usize>,

    #[arg(long, global = true, help = "Maximum concurrent render jobs")]
    pub concurrency: Option<usize>,

    #[arg(long, global = true, help = "Render timeout in milliseconds")]
    pub timeout_ms: Option<u64>,

    #[arg(long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(long, global = true, help = "Chrome executable path")]
    pub chrome_path: Option<String>,

    #[arg(long, global = true, help = "Expose Prometheus metrics on this port")]
    pub metrics_port: Option<u16>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the HTTP render server (default)
    Serve {
        #[arg(short, long, help = "Listen port")]
        port: Option<u16>,

        #[arg(long, help = "Bind address")]
        bind: Option<String>,
    },

    /// Render a single URL or HTML file to disk
    Render {
        #[arg(long, conflicts_with = "html", help = "URL to render")]
        url: Option<String>,

        #[arg(long, help = "HTML file to render")]
        html: Option<PathBuf>,

        #[arg(short, long, help = "Output file path")]
        output: PathBuf,

        #[arg(long, help = "CSS selector of the element to capture")]
        selector: Option<String>,

        #[arg(long, help = "Produce an A4 PDF instead of a PNG")]
        pdf: bool,
    },

    /// Validate a configuration file
    Validate {
        #[arg(help = "Configuration file to validate")]
        file: PathBuf,
    },
}

impl Cli {
    /// Apply the command-line overrides, the last configuration layer.
    pub fn apply_overrides(&self, config: &mut Config) {
        if let Some(pool_size) = self.pool_size {
            config.pool_size = pool_size;
        }
        if let Some(concurrency) = self.concurrency {
            config.max_queue = concurrency;
        }
        if let Some(timeout_ms) = self.timeout_ms {
            config.render_timeout = Duration::from_millis(timeout_ms);
        }
        if let Some(chrome_path) = &self.chrome_path {
            config.chrome_path = Some(chrome_path.clone());
        }
        if let Some(metrics_port) = self.metrics_port {
            config.metrics_port = Some(metrics_port);
        }
        if let Some(Commands::Serve { port, bind }) = &self.command {
            if let Some(port) = port {
                config.port = *port;
            }
            if let Some(bind) = bind {
                config.bind_address = bind.clone();
            }
        }
    }
}

/// Build the effective configuration: defaults, then the config file, then
/// the environment, then the command line.
pub async fn load_config(args: &Cli) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => read_config_file(path).await?,
        None => Config::default(),
    };

    config.apply_env()?;
    args.apply_overrides(&mut config);
    config.validate()?;

    info!("Configuration loaded successfully");
    Ok(config)
}

async fn read_config_file(path: &Path) -> anyhow::Result<Config> {
    let content = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let config =
        Config::from_json(&content).with_context(|| format!("parsing {}", path.display()))?;
    Ok(config)
}

pub struct CliRunner {
    pub config: Config,
    launcher: Arc<dyn BrowserLauncher>,
}

impl CliRunner {
    pub fn new(config: Config, launcher: Arc<dyn BrowserLauncher>) -> Self {
        Self { config, launcher }
    }

    pub async fn run(
        &self,
        command: Option<Commands>,
        shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        match command.unwrap_or(Commands::Serve {
            port: None,
            bind: None,
        }) {
            Commands::Serve { .. } => self.run_server(shutdown).await,
            Commands::Render {
                url,
                html,
                output,
                selector,
                pdf,
            } => self.run_render(url, html, output, selector, pdf).await,
            Commands::Validate { file } => validate_config_file(&file).await,
        }
    }

    pub async fn run_server(&self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        if let Some(port) = self.config.metrics_port {
            crate::metrics::install_prometheus(&self.config.bind_address, port)?;
        }

        let service = Arc::new(RenderService::new(
            self.config.clone(),
            self.launcher.clone(),
        ));
        if let Err(e) = service.start().await {
            error!("chromium start failed: {}", e);
            return Err(e).context("cold start of the browser pool");
        }
        info!("chromium start success!");

        let coordinator = RestartCoordinator::new(
            service.pool().clone(),
            service.queue().clone(),
            self.config.restart_gutter,
            self.config.restart_check_interval,
        )
        .spawn(shutdown.clone());

        let state = AppState::new(service.clone());
        let result = crate::serve(&self.config, state, shutdown).await;

        // The coordinator watches the same signal; it only lingers if the
        // server failed on its own.
        coordinator.abort();
        service.shutdown().await;

        result.context("HTTP server")
    }

    pub async fn run_render(
        &self,
        url: Option<String>,
        html: Option<PathBuf>,
        output: PathBuf,
        selector: Option<String>,
        pdf: bool,
    ) -> anyhow::Result<()> {
        let mut request = build_request(url, html, pdf).await?;
        request.selector = selector;

        let service = RenderService::new(self.config.clone(), self.launcher.clone());
        service.start().await.context("starting browser pool")?;

        let result = service.render(request.clone()).await;
        service.shutdown().await;
        let response = result.with_context(|| format!("rendering {}", request.describe()))?;

        if let Some(parent) = output.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&output, &response.body).await?;

        println!("Render completed:");
        println!("  Source: {}", request.describe());
        println!("  Output: {}", output.display());
        println!("  Type: {}", response.content_type);
        println!("  Size: {}", format_bytes(response.body.len()));
        Ok(())
    }
}

async fn build_request(
    url: Option<String>,
    html: Option<PathBuf>,
    pdf: bool,
) -> anyhow::Result<RenderRequest> {
    let output = if pdf {
        OutputKind::Pdf
    } else {
        OutputKind::Image
    };

    match (url, html) {
        (Some(url), _) => Ok(RenderRequest::from_url(url, output)),
        (None, Some(path)) => {
            let content = fs::read_to_string(&path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            Ok(RenderRequest::from_html(content, output))
        }
        (None, None) => bail!("either --url or --html is required"),
    }
}

pub async fn validate_config_file(path: &Path) -> anyhow::Result<()> {
    println!("Validating configuration: {}", path.display());

    let config = read_config_file(path).await?;
    config.validate()?;

    println!("Configuration is valid:");
    println!("  Chromium instances: {}", config.pool_size);
    println!("  Concurrency: {}", config.max_queue);
    println!("  Render timeout: {}", format_duration(config.render_timeout));
    println!("  Restart cycle: {}", format_duration(config.restart_gutter));
    println!(
        "  Rate limit: {} per {}",
        config.rate_limit_max,
        format_duration(config.rate_limit_window)
    );
    println!("  Listen: {}:{}", config.bind_address, config.port);
    Ok(())
}

/// Install the tracing subscriber. `RUST_LOG` takes precedence over
/// `verbose`.
pub fn setup_logging(verbose: bool) -> anyhow::Result<()> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!(e))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeLauncher, FakeOutcome};

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("render-pool-{}-{}", uuid::Uuid::new_v4(), name))
    }

    #[test]
    fn test_defaults_to_serve() {
        let cli = Cli::try_parse_from(["render-pool"]).unwrap();
        assert!(cli.command.is_none());
        assert!(!cli.verbose);
    }

    #[test]
    fn test_cli_overrides_win() {
        let cli = Cli::try_parse_from([
            "render-pool",
            "serve",
            "--port",
            "8080",
            "--pool-size",
            "4",
            "--concurrency",
            "8",
            "--timeout-ms",
            "2500",
        ])
        .unwrap();

        let mut config = Config::default();
        cli.apply_overrides(&mut config);
        assert_eq!(config.port, 8080);
        assert_eq!(config.pool_size, 4);
        assert_eq!(config.max_queue, 8);
        assert_eq!(config.render_timeout, Duration::from_millis(2500));
    }

    #[test]
    fn test_render_rejects_url_and_html_together() {
        let result = Cli::try_parse_from([
            "render-pool",
            "render",
            "--url",
            "https://example.com",
            "--html",
            "page.html",
            "--output",
            "out.png",
        ]);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_config_file_layer() {
        let path = temp_path("config.json");
        fs::write(&path, r#"{"pool_size": 3, "max_queue": 6}"#)
            .await
            .unwrap();

        let cli = Cli::try_parse_from([
            "render-pool",
            "--config",
            path.to_str().unwrap(),
            "--pool-size",
            "5",
        ])
        .unwrap();
        let config = load_config(&cli).await.unwrap();
        assert_eq!(config.pool_size, 5);

        let file_only = read_config_file(&path).await.unwrap();
        assert_eq!(file_only.pool_size, 3);
        assert_eq!(file_only.max_queue, 6);

        tokio_test::assert_ok!(validate_config_file(&path).await);
        let _ = fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn test_invalid_config_file_is_rejected() {
        let path = temp_path("bad.json");
        fs::write(&path, r#"{"pool_size": 0}"#).await.unwrap();

        tokio_test::assert_err!(validate_config_file(&path).await);
        let _ = fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn test_build_request_needs_a_source() {
        tokio_test::assert_err!(build_request(None, None, false).await);

        let request = build_request(Some("https://example.com".to_string()), None, true)
            .await
            .unwrap();
        assert_eq!(request.output, OutputKind::Pdf);
    }

    #[tokio::test]
    async fn test_render_writes_output_file() {
        let launcher = Arc::new(
            FakeLauncher::new().outcome(FakeOutcome::Bytes(b"\x89PNG rendered".to_vec())),
        );
        let runner = CliRunner::new(Config::default(), launcher.clone());
        let output = temp_path("out.png");

        runner
            .run_render(
                Some("https://example.com".to_string()),
                None,
                output.clone(),
                Some("#main".to_string()),
                false,
            )
            .await
            .unwrap();

        assert_eq!(fs::read(&output).await.unwrap(), b"\x89PNG rendered");
        let records = launcher.render_records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].request.selector.as_deref(), Some("#main"));
        let _ = fs::remove_file(&output).await;
    }
}
