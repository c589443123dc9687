use crate::{
    format_bytes, format_duration, server, Config, HostsSource, RenderRequest, WaitStrategy,
    WorkerPool,
};
use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "rendergun")]
#[command(about = "Render JavaScript-heavy pages into static HTML")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, help = "Configuration file path (JSON)")]
    pub config: Option<PathBuf>,

    #[arg(long, env = "RENDERGUN_POOL_SIZE", help = "Number of renderer workers")]
    pub pool_size: Option<usize>,

    #[arg(
        long,
        env = "RENDERGUN_REQUEST_TIMEOUT",
        help = "Default navigation timeout in milliseconds"
    )]
    pub timeout: Option<u64>,

    #[arg(
        long,
        env = "RENDERGUN_MAX_REQUEST_TIMEOUT",
        help = "Largest per-request navigation timeout in milliseconds"
    )]
    pub max_timeout: Option<u64>,

    #[arg(long, env = "RENDERGUN_CACHE_MAX_SIZE", help = "Result cache size in MiB")]
    pub cache_max_size: Option<usize>,

    #[arg(
        long,
        env = "RENDERGUN_CACHE_MAX_AGE",
        help = "Result cache entry lifetime in seconds"
    )]
    pub cache_max_age: Option<u64>,

    #[arg(
        long,
        env = "RENDERGUN_RESTART_AFTER",
        help = "Relaunch a worker's browser after this many requests"
    )]
    pub restart_after: Option<usize>,

    #[arg(
        long,
        env = "RENDERGUN_BLACKLIST_REGEXP",
        help = "Abort every outgoing request whose URL matches this regex"
    )]
    pub blacklist: Option<String>,

    #[arg(long, env = "CHROMIUM_PATH", help = "Chrome executable path")]
    pub chrome_path: Option<String>,

    #[arg(
        long,
        env = "RENDERGUN_ADBLOCK_HOSTS",
        help = "Ad-block hosts file path or http(s) URL"
    )]
    pub adblock_hosts: Option<String>,

    #[arg(long, help = "Enable verbose logging")]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the HTTP render service
    Serve {
        #[arg(long, help = "Bind address")]
        bind: Option<String>,

        #[arg(short, long, env = "PORT", help = "Server port")]
        port: Option<u16>,
    },

    /// Render a single URL and print the HTML
    Render {
        #[arg(short, long, help = "URL to render")]
        url: String,

        #[arg(long, help = "Serve this file as the main document instead of fetching it")]
        content_file: Option<PathBuf>,

        #[arg(short, long, help = "Write the HTML here instead of stdout")]
        output: Option<PathBuf>,

        #[arg(long, help = "Completion condition (load, networkidle0)")]
        wait_until: Option<String>,

        #[arg(long, help = "Block requests to known ad hosts")]
        block_ads: bool,

        #[arg(long, help = "Abort requests whose URL matches this regex")]
        abort_request: Option<String>,
    },

    /// Launch the pool and report worker health
    Health {
        #[arg(long, help = "Show per-worker details")]
        detailed: bool,
    },

    /// Validate a configuration file without launching browsers
    Validate {
        #[arg(short, long, help = "Configuration file to validate")]
        config: PathBuf,
    },
}

#[derive(Debug, Clone)]
pub struct RenderOptions {
    pub url: String,
    pub content_file: Option<PathBuf>,
    pub output: Option<PathBuf>,
    pub wait_until: Option<String>,
    pub block_ads: bool,
    pub abort_request: Option<String>,
}

/// Defaults, then the optional config file, then flags and their env vars.
pub async fn load_config(args: &Cli) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => read_config_file(path).await?,
        None => Config::default(),
    };
    apply_overrides(&mut config, args);
    config.validate().context("invalid configuration")?;

    info!("Configuration loaded successfully");
    info!("Pool size: {}", config.pool_size);
    info!(
        "Request timeout: {} (max {})",
        format_duration(config.request_timeout),
        format_duration(config.max_request_timeout)
    );
    info!(
        "Cache: {} for {}",
        format_bytes(config.cache.max_size),
        format_duration(config.cache.max_age)
    );
    Ok(config)
}

async fn read_config_file(path: &Path) -> anyhow::Result<Config> {
    let content = fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))
}

pub fn apply_overrides(config: &mut Config, args: &Cli) {
    if let Some(pool_size) = args.pool_size {
        config.pool_size = pool_size;
    }
    if let Some(timeout) = args.timeout {
        config.request_timeout = Duration::from_millis(timeout);
    }
    if let Some(max_timeout) = args.max_timeout {
        config.max_request_timeout = Duration::from_millis(max_timeout);
    }
    if let Some(mib) = args.cache_max_size {
        config.cache.max_size = mib.saturating_mul(1024 * 1024);
    }
    if let Some(secs) = args.cache_max_age {
        config.cache.max_age = Duration::from_secs(secs);
    }
    if let Some(threshold) = args.restart_after {
        config.restart.threshold = threshold;
    }
    if let Some(pattern) = &args.blacklist {
        config.blacklist_pattern = Some(pattern.clone()).filter(|p| !p.is_empty());
    }
    if let Some(chrome_path) = &args.chrome_path {
        config.chrome_path = Some(chrome_path.clone());
    }
    if let Some(hosts) = &args.adblock_hosts {
        config.adblock_hosts = HostsSource::parse(hosts);
    }
}

pub struct CliRunner {
    pub config: Config,
}

impl CliRunner {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub async fn run(&self, command: Commands) -> anyhow::Result<()> {
        match command {
            Commands::Serve { bind, port } => self.run_server(bind, port).await,
            Commands::Render {
                url,
                content_file,
                output,
                wait_until,
                block_ads,
                abort_request,
            } => {
                self.run_render(RenderOptions {
                    url,
                    content_file,
                    output,
                    wait_until,
                    block_ads,
                    abort_request,
                })
                .await
            }
            Commands::Health { detailed } => self.show_health(detailed).await,
            Commands::Validate { config } => validate_config(&config).await,
        }
    }

    pub async fn run_server(&self, bind: Option<String>, port: Option<u16>) -> anyhow::Result<()> {
        let bind = bind.unwrap_or_else(|| self.config.server.bind.clone());
        let port = port.unwrap_or(self.config.server.port);
        let addr: SocketAddr = format!("{bind}:{port}")
            .parse()
            .with_context(|| format!("invalid bind address {bind}:{port}"))?;

        let pool = WorkerPool::launch(self.config.clone()).await?;
        pool.spawn_maintenance();
        server::run(pool, addr).await
    }

    pub async fn run_render(&self, options: RenderOptions) -> anyhow::Result<()> {
        let request = self.create_request(&options).await?;
        info!("Rendering: {}", request.url);

        let pool = WorkerPool::launch(self.config.clone()).await?;
        let rendered = pool.render(request).await;
        pool.close().await;
        let result = rendered?;

        eprintln!("Status: {}", result.code);
        match &options.output {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent).await?;
                }
                fs::write(path, &result.body)
                    .await
                    .with_context(|| format!("failed to write {}", path.display()))?;
                info!("HTML saved to: {}", path.display());
            }
            None => println!("{}", result.body),
        }

        if result.code >= 400 {
            warn!("Render of {} finished with status {}", options.url, result.code);
        }
        Ok(())
    }

    pub async fn create_request(&self, options: &RenderOptions) -> anyhow::Result<RenderRequest> {
        let mut request = RenderRequest::new(options.url.clone());
        request.block_ads = options.block_ads;
        request.abort_request_pattern = options.abort_request.clone();

        if let Some(wait_until) = &options.wait_until {
            request.wait_until = wait_until.parse::<WaitStrategy>()?;
        }
        if let Some(path) = &options.content_file {
            let content = fs::read_to_string(path)
                .await
                .with_context(|| format!("failed to read {}", path.display()))?;
            request.content = Some(content);
        }
        Ok(request)
    }

    pub async fn show_health(&self, detailed: bool) -> anyhow::Result<()> {
        let pool = WorkerPool::launch(self.config.clone()).await?;
        let health = pool.pool_health().await;
        let cache = pool.cache().stats();

        println!("Renderer Health");
        println!("===============");
        println!("Healthy: {}", health.healthy);
        println!(
            "Workers: {}/{} healthy",
            health.healthy_count(),
            health.workers.len()
        );

        if detailed {
            println!("\nWorkers:");
            for worker in &health.workers {
                println!(
                    "  Worker {}: {:?} - healthy: {}, served: {}, in flight: {}",
                    worker.id, worker.state, worker.healthy, worker.served, worker.in_flight
                );
            }
        }

        println!("\nCache:");
        println!("  Entries: {}", cache.entries);
        println!(
            "  Size: {} of {}",
            format_bytes(cache.total_bytes),
            format_bytes(cache.max_bytes)
        );
        println!("  Hit rate: {:.1}%", cache.hit_rate() * 100.0);

        pool.close().await;
        if !health.healthy {
            bail!("renderer pool is not healthy");
        }
        Ok(())
    }
}

pub async fn validate_config(path: &Path) -> anyhow::Result<()> {
    println!("Validating configuration: {}", path.display());

    let config = read_config_file(path).await?;
    config.validate().context("configuration is invalid")?;

    println!("Configuration is valid:");
    println!("  Pool size: {}", config.pool_size);
    println!("  Request timeout: {}", format_duration(config.request_timeout));
    println!(
        "  Cache: {} for {}",
        format_bytes(config.cache.max_size),
        format_duration(config.cache.max_age)
    );
    println!(
        "  Restart after: {} requests (checked every {})",
        config.restart.threshold,
        format_duration(config.restart.check_interval)
    );
    if let Some(pattern) = &config.blacklist_pattern {
        println!("  Blacklist: {pattern}");
    }
    println!("  Ad-block hosts: {:?}", config.adblock_hosts);

    Ok(())
}

/// Logs go to stderr so `render` can stream HTML on stdout.
pub fn setup_logging(verbose: bool) -> anyhow::Result<()> {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!(e))
}
