//! Main binary for the gpu-guard daemon (gpu-guardd)

use clap::{Parser, Subcommand, ValueEnum};
use guard_agent::{init_logging, shutdown_signal, AgentConfig, AgentError, ControlLoop, Result};
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "gpu-guardd")]
#[command(about = "Noisy-neighbor SLO guard for shared GPU nodes")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level, overrides the configuration file
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Log actions instead of applying them
    #[arg(long)]
    dry_run: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the control loop until interrupted
    Run,
    /// Run a single cycle and print its report
    Once {
        /// Report format
        #[arg(short, long, value_enum, default_value_t = ReportFormat::Yaml)]
        format: ReportFormat,
    },
    /// Generate default configuration
    Config {
        /// Output file path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Validate configuration
    Validate {
        /// Configuration file to validate
        #[arg(short, long)]
        config: PathBuf,
    },
}

/// Output format for cycle reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ReportFormat {
    /// YAML document
    Yaml,
    /// Pretty-printed JSON
    Json,
    /// One-line summary
    Text,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Run) | None => run(&cli).await,
        Some(Commands::Once { format }) => once(&cli, format).await,
        Some(Commands::Config { ref output }) => generate_config(output.clone()),
        Some(Commands::Validate { ref config }) => validate_config(config.clone()),
    }
}

/// Load, apply CLI overrides, validate, then start logging
fn prepare(cli: &Cli) -> Result<AgentConfig> {
    let mut config = AgentConfig::load(cli.config.as_deref())?;

    if let Some(ref level) = cli.log_level {
        config.logging.level = level.clone();
    }
    if cli.dry_run {
        config.sources.dry_run = true;
    }

    config.validate()?;
    init_logging(&config.logging)?;

    match cli.config {
        Some(ref path) => info!("Loaded configuration from: {}", path.display()),
        None => info!("Using default configuration"),
    }
    Ok(config)
}

async fn run(cli: &Cli) -> Result<()> {
    let config = prepare(cli)?;

    let mut control = match ControlLoop::from_config(&config) {
        Ok(control) => control,
        Err(e) => {
            error!("Failed to start: {}", e);
            return Err(e);
        }
    };

    info!(
        "Starting gpu-guard: {} GPUs, threshold {}ms, sink {}",
        control.snapshot().len(),
        config.guard.controller.tail_threshold_ms,
        control.executor().sink_name()
    );

    control.run(shutdown_signal()).await
}

async fn once(cli: &Cli, format: ReportFormat) -> Result<()> {
    let config = prepare(cli)?;
    let mut control = ControlLoop::from_config(&config)?;

    let report = control.run_cycle().await;
    let rendered = match format {
        ReportFormat::Yaml => serde_yaml::to_string(&report).map_err(|e| e.to_string()),
        ReportFormat::Json => serde_json::to_string_pretty(&report).map_err(|e| e.to_string()),
        ReportFormat::Text => Ok(report.to_string()),
    }
    .map_err(|e| AgentError::Config(format!("Failed to serialize report: {}", e)))?;
    println!("{}", rendered);

    Ok(())
}

fn generate_config(output: Option<PathBuf>) -> Result<()> {
    let config = AgentConfig::default();

    if let Some(output_path) = output {
        config.to_file(&output_path)?;
        println!("Generated configuration file: {}", output_path.display());
    } else {
        let yaml = serde_yaml::to_string(&config)
            .map_err(|e| AgentError::Config(format!("Failed to serialize config: {}", e)))?;
        println!("{}", yaml);
    }

    Ok(())
}

fn validate_config(config_path: PathBuf) -> Result<()> {
    println!("Validating configuration: {}", config_path.display());

    let config = AgentConfig::load(Some(&config_path))?;
    config.validate()?;

    let controller = &config.guard.controller;
    println!("Configuration is valid");
    println!(
        "  Detection: p99 > {}ms for {} windows, cooldown {} observations",
        controller.tail_threshold_ms,
        controller.persistence_windows,
        controller.cooldown_observations
    );
    println!("  Poll interval: {}ms", controller.poll_interval_ms);
    println!("  Metrics: {}", config.sources.metrics_dir.display());
    println!("  Topology: {}", config.sources.topology_file.display());
    if config.sources.dry_run {
        println!("  Dry run: actions will not be applied");
    }

    Ok(())
}
