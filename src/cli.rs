use crate::{
    format_bytes, install_prometheus, serve, validate_config, AppState, CacheStore,
    CaptureRequest, CaptureService, Config, Metrics,
};
use anyhow::{bail, Context};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use clap::{Parser, Subcommand};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tracing::info;

#[derive(Parser)]
#[command(name = "capture-service")]
#[command(about = "Element screenshot capture service with a result cache")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, help = "Configuration file path (JSON)")]
    pub config: Option<PathBuf>,

    #[arg(long, help = "Maximum concurrent captures")]
    pub max_concurrent: Option<usize>,

    #[arg(long, help = "Directory for persisted cache entries")]
    pub cache_dir: Option<PathBuf>,

    #[arg(long, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(long, help = "Chrome executable path")]
    pub chrome_path: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP service
    Serve {
        #[arg(short, long, help = "Listen port")]
        port: Option<u16>,

        #[arg(long, help = "Bind address")]
        host: Option<String>,

        #[arg(long, help = "Expose Prometheus metrics at /metrics")]
        metrics: bool,
    },

    /// Capture one element and write the PNG to disk
    Capture {
        #[arg(short, long, help = "Page URL")]
        url: String,

        #[arg(short, long, help = "CSS selector of the element")]
        selector: String,

        #[arg(long, default_value = "", help = "Element tag reported in metadata")]
        element_type: String,

        #[arg(short, long, help = "Output file path")]
        output: PathBuf,
    },

    /// Validate a configuration file
    Validate {
        #[arg(short, long, help = "Configuration file to validate")]
        config: PathBuf,
    },

    /// Show statistics of the persisted cache
    CacheStats,

    /// Delete every persisted cache entry
    CacheClear,
}

pub struct CliRunner {
    pub config: Config,
}

impl CliRunner {
    pub fn new(mut config: Config, args: &Cli) -> Self {
        if let Some(max_concurrent) = args.max_concurrent {
            config.pool.max_concurrent = max_concurrent;
        }
        if let Some(cache_dir) = &args.cache_dir {
            config.cache.dir = Some(cache_dir.clone());
        }
        if let Some(chrome_path) = &args.chrome_path {
            config.chrome_path = Some(chrome_path.clone());
        }

        Self { config }
    }

    /// Runs `command`; long-running commands stop when `shutdown` resolves.
    pub async fn run<F>(mut self, command: Commands, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match command {
            Commands::Serve {
                port,
                host,
                metrics,
            } => {
                if let Some(port) = port {
                    self.config.server.port = port;
                }
                if let Some(host) = host {
                    self.config.server.host = host;
                }
                self.config.server.metrics_endpoint |= metrics;
                self.run_server(shutdown).await
            }
            Commands::Capture {
                url,
                selector,
                element_type,
                output,
            } => {
                let request = CaptureRequest::new(url, selector).with_element_type(element_type);
                tokio::select! {
                    result = self.run_capture(request, output) => result,
                    _ = shutdown => bail!("Capture interrupted"),
                }
            }
            Commands::Validate { config } => self.validate_config(config).await,
            Commands::CacheStats => self.show_cache_stats().await,
            Commands::CacheClear => self.clear_cache().await,
        }
    }

    pub async fn run_server<F>(&self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        validate_config(&self.config)?;

        let handle = if self.config.server.metrics_endpoint {
            Some(install_prometheus()?)
        } else {
            None
        };

        let metrics = Arc::new(Metrics::new());
        let service = CaptureService::from_config(&self.config, metrics).await?;

        let mut state = AppState::new(service);
        if let Some(handle) = handle {
            state = state.with_metrics(handle);
        }

        serve(&self.config, Arc::new(state), shutdown).await?;
        Ok(())
    }

    pub async fn run_capture(&self, request: CaptureRequest, output: PathBuf) -> anyhow::Result<()> {
        info!("Capturing {} on {}", request.selector, request.url);

        let service = CaptureService::from_config(&self.config, Arc::new(Metrics::noop())).await?;
        let outcome = service.capture(&request).await;
        service.shutdown().await;
        let response = outcome?;

        let encoded = response
            .result
            .screenshot
            .as_deref()
            .context("capture succeeded without an image")?;
        let png = STANDARD.decode(encoded).context("invalid base64 screenshot")?;

        if let Some(parent) = output.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&output, &png).await?;

        println!("Screenshot captured successfully:");
        println!("  URL: {}", request.url);
        println!("  Selector: {}", request.selector);
        println!("  Output: {}", output.display());
        println!("  Size: {}", format_bytes(png.len()));
        println!("  Cached: {}", response.cached);

        if let Some(metadata) = &response.result.metadata {
            println!("  Title: {}", metadata.title);
            println!("  Final URL: {}", metadata.url);
        }

        Ok(())
    }

    pub async fn validate_config(&self, config_path: PathBuf) -> anyhow::Result<()> {
        println!("Validating configuration: {}", config_path.display());

        let config = Config::from_file(&config_path).await?;
        validate_config(&config)?;

        println!("Configuration is valid:");
        println!("  Listen: {}", config.bind_address());
        println!("  Max concurrent: {}", config.pool.max_concurrent);
        println!("  Cache entries: {}", config.cache.max_entries);
        println!("  Cache TTL: {:?}", config.cache.ttl);
        println!(
            "  Viewport: {}x{}",
            config.capture.viewport.width, config.capture.viewport.height
        );

        Ok(())
    }

    async fn open_persisted_cache(&self) -> anyhow::Result<CacheStore> {
        if self.config.cache.dir.is_none() {
            bail!("No cache directory configured; pass --cache-dir or set cache.dir");
        }
        Ok(CacheStore::open(&self.config.cache).await?)
    }

    pub async fn show_cache_stats(&self) -> anyhow::Result<()> {
        let cache = self.open_persisted_cache().await?;
        let stats = cache.stats();

        println!("Cache Statistics");
        println!("================");
        println!("  Entries: {}/{}", stats.count, stats.max_cache_size);
        println!(
            "  Total size: {} ({:.2} MB)",
            format_bytes(stats.total_size_bytes as usize),
            stats.total_size_mb
        );
        println!("  TTL: {} hours", stats.cache_ttl_hours);
        if let Some(oldest) = &stats.oldest_entry {
            println!("  Oldest: {oldest}");
        }
        if let Some(newest) = &stats.newest_entry {
            println!("  Newest: {newest}");
        }

        Ok(())
    }

    pub async fn clear_cache(&self) -> anyhow::Result<()> {
        let cache = self.open_persisted_cache().await?;
        let count = cache.len();
        cache.clear().await;

        println!("Removed {count} cached entries");
        Ok(())
    }
}

pub fn setup_logging(verbose: bool) -> anyhow::Result<()> {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();

    Ok(())
}
