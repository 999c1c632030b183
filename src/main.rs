use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use parastat::accel::BackendPreference;
use parastat::config::PipelineConfig;

#[derive(Parser)]
#[command(
    name = "parastat",
    about = "Data-parallel summary statistics over work-group reductions",
    version,
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compute min, max, sum, mean, variance and stdev of a dataset file
    Run {
        /// Dataset file (overrides input.path from the config file)
        input: Option<PathBuf>,

        /// Platform index
        #[arg(short = 'p', long)]
        platform: Option<usize>,

        /// Device index within the platform
        #[arg(short = 'd', long)]
        device: Option<usize>,

        /// Work-group size
        #[arg(long)]
        local_size: Option<usize>,

        /// Compute backend
        #[arg(long, value_enum)]
        backend: Option<BackendPreference>,

        /// Zero-based field holding the measurement
        #[arg(long)]
        column: Option<usize>,

        /// Also run atomic min/max and require agreement
        #[arg(long)]
        compare_atomic: bool,

        /// Config file path (default: $PARASTAT_CONFIG, then ./parastat.toml)
        #[arg(long)]
        config: Option<PathBuf>,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// List platforms and devices
    #[command(short_flag = 'l')]
    List {
        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so stdout stays parseable
    let builder = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr);
    if std::env::var_os("PARASTAT_LOG_JSON").is_some() {
        builder.json().init();
    } else {
        builder.init();
    }

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            input,
            platform,
            device,
            local_size,
            backend,
            column,
            compare_atomic,
            config,
            json,
        } => {
            let mut cfg = match &config {
                Some(path) => PipelineConfig::load(path)?,
                None => PipelineConfig::load_or_default(),
            };
            if let Some(platform) = platform {
                cfg.device.platform_index = platform;
            }
            if let Some(device) = device {
                cfg.device.device_index = device;
            }
            if let Some(backend) = backend {
                cfg.device.backend = backend;
            }
            if let Some(local_size) = local_size {
                cfg.reduction.local_size = local_size;
            }
            if let Some(column) = column {
                cfg.input.column = column;
            }
            cfg.reduction.compare_atomic |= compare_atomic;

            let input = input
                .or_else(|| cfg.input.path.clone())
                .context("no input file given (pass a path or set input.path in the config file)")?;

            let cancel = CancellationToken::new();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("interrupt received, cancelling at the next dispatch");
                    on_interrupt.cancel();
                }
            });

            let report = parastat::run(&cfg, &input, cancel).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{}", parastat::report::format_summary(&report));
            }
        }
        Commands::List { json } => {
            let listing = parastat::list_devices();
            if json {
                let value: Vec<_> = listing
                    .iter()
                    .map(|(backend, platforms)| {
                        serde_json::json!({ "backend": backend, "platforms": platforms })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&value)?);
            } else {
                for (backend, platforms) in &listing {
                    println!("[{}]", backend);
                    if platforms.is_empty() {
                        println!("  (no platforms found)");
                    }
                    for platform in platforms {
                        println!(
                            "  Platform {}: {} ({})",
                            platform.index, platform.name, platform.vendor
                        );
                        for device in &platform.devices {
                            println!(
                                "    Device {}: {} | max work-group {} | {} compute units",
                                device.index,
                                device.name,
                                device.max_work_group_size,
                                device.compute_units
                            );
                        }
                    }
                }
            }
        }
    }

    Ok(())
}
