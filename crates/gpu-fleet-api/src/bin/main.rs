//! GPU fleet service entry point

use clap::{Parser, Subcommand};
use gpu_fleet_api::{create_router, AppState};
use gpu_fleet_core::{BenchmarkKind, FleetConfig, FleetService, Vendor};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "gpu-fleet")]
#[command(about = "GPU fleet discovery and health service")]
#[command(version)]
struct Cli {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, global = true, env = "FLEET_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server with background discovery and heartbeat sweeps
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "8080", env = "PORT")]
        port: u16,

        /// Host to bind to
        #[arg(long, default_value = "0.0.0.0")]
        host: String,

        /// Provider IDs accepted for heartbeats (repeatable), added to `identity.providers`
        #[arg(long = "provider")]
        providers: Vec<String>,
    },

    /// Run one discovery cycle on this host and print the inventory
    Discover {
        /// Only these vendors (repeatable)
        #[arg(long = "vendor")]
        vendors: Vec<Vendor>,

        /// Output format
        #[arg(short, long, default_value = "json")]
        output: String,
    },

    /// Benchmark one resource on this host
    Benchmark {
        /// Resource ID as reported by `discover`
        resource_id: String,

        /// Benchmark kinds (repeatable); all when omitted
        #[arg(short, long = "kind")]
        kinds: Vec<BenchmarkKind>,

        /// Duration per benchmark in seconds
        #[arg(short, long)]
        duration_secs: Option<u64>,
    },
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<FleetConfig> {
    let config = match path {
        Some(path) => {
            let mut config = FleetConfig::from_file(&path)?;
            config.apply_env_overrides();
            config
        }
        None => FleetConfig::from_env(),
    };
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let cli = Cli::parse();
    let mut config = load_config(cli.config)?;

    match cli.command {
        Commands::Serve { port, host, providers } => {
            let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
            config.identity.providers.extend(providers);
            config.validate()?;
            tracing::info!(providers = config.identity.providers.len(), "Registered providers");
            let service = Arc::new(FleetService::builder(config).build().await?);
            service.start();

            let router = create_router(Arc::new(AppState::new(service.clone())));
            tracing::info!(%addr, version = gpu_fleet_core::VERSION, "Starting GPU fleet service");

            let listener = tokio::net::TcpListener::bind(addr).await?;
            axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        tracing::warn!(error = %e, "Failed to listen for shutdown signal");
                    }
                })
                .await?;

            service.shutdown().await;
        }

        Commands::Discover { vendors, output } => {
            let service = FleetService::builder(config).build().await?;
            let filter = (!vendors.is_empty()).then_some(vendors);
            let result = service.discover_all(true, filter.as_deref()).await;
            service.shutdown().await;
            let report = result?;

            match output.as_str() {
                "json" => println!("{}", serde_json::to_string_pretty(&report)?),
                _ => {
                    println!("{} resources", report.resources.len());
                    for resource in &report.resources {
                        println!(
                            "  {}  {}  {} MB  {:.0}%",
                            resource.id, resource.name, resource.specs.memory_total_mb, resource.status.utilization_pct
                        );
                    }
                    for warning in &report.warnings {
                        println!("  warning: {}", warning);
                    }
                }
            }
        }

        Commands::Benchmark {
            resource_id,
            kinds,
            duration_secs,
        } => {
            let service = FleetService::builder(config).build().await?;
            let result = service
                .run_benchmark(&resource_id, &kinds, duration_secs.map(Duration::from_secs))
                .await;
            service.shutdown().await;
            println!("{}", serde_json::to_string_pretty(&result?)?);
        }
    }

    Ok(())
}
