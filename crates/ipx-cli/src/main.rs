use clap::{Parser, Subcommand, ValueEnum};
use ipx_core::{ExporterConfig, Tables, display_tables, summarize};
use ipx_metrics::{MetricsCollector, MetricsServer};
use ipx_save::{SaveCommand, SaveError, parse_iptables_save};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "iptables-exporter")]
#[command(version, about = "Prometheus exporter for iptables counters", long_about = None)]
struct Cli {
    /// YAML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log filter (trace, debug, info, warn, error or a full directive)
    #[arg(long = "log.level", global = true, default_value = "info")]
    log_level: String,

    /// Log output format
    #[arg(long = "log.format", global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve metrics over HTTP (default)
    Serve(ServeArgs),
    /// Run the save command once and print the parsed tables
    Dump {
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// Parse a saved dump from a file or stdin
    Parse {
        /// Dump file, stdin when omitted
        #[arg(short, long)]
        file: Option<PathBuf>,
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
}

#[derive(clap::Args, Default)]
struct ServeArgs {
    /// Address on which to expose metrics and web interface
    #[arg(long = "web.listen-address")]
    listen_address: Option<String>,

    /// Path under which to expose metrics
    #[arg(long = "web.telemetry-path")]
    telemetry_path: Option<String>,

    /// Save command producing the counter dump
    #[arg(long = "collector.command")]
    collector_command: Option<String>,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
    Summary,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level, cli.log_format)?;

    let config = load_config(cli.config.as_deref())?;

    match cli.command.unwrap_or(Commands::Serve(ServeArgs::default())) {
        Commands::Serve(args) => {
            tokio::runtime::Runtime::new()?.block_on(async { serve(config, args).await })?;
        }
        Commands::Dump { format } => {
            tokio::runtime::Runtime::new()?.block_on(async { dump(&config, format).await })?;
        }
        Commands::Parse { file, format } => parse_file(file.as_deref(), format)?,
    }

    Ok(())
}

fn init_logging(level: &str, format: LogFormat) -> anyhow::Result<()> {
    let filter = EnvFilter::try_new(level)
        .map_err(|e| anyhow::anyhow!("Invalid log level '{}': {}", level, e))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.with_target(false).compact().init(),
        LogFormat::Json => builder.json().init(),
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> anyhow::Result<ExporterConfig> {
    match path {
        Some(path) => {
            let config = ExporterConfig::from_file(path)?;
            tracing::debug!(path = %path.display(), "loaded configuration");
            Ok(config)
        }
        None => Ok(ExporterConfig::default()),
    }
}

/// Flags win over the config file, which wins over built-in defaults.
fn apply_overrides(mut config: ExporterConfig, args: ServeArgs) -> ExporterConfig {
    if let Some(addr) = args.listen_address {
        config.web.listen_address = addr;
    }
    if let Some(path) = args.telemetry_path {
        config.web.telemetry_path = path;
    }
    if let Some(command) = args.collector_command {
        config.collector.command = command;
    }
    config
}

async fn serve(config: ExporterConfig, args: ServeArgs) -> anyhow::Result<()> {
    let config = apply_overrides(config, args);
    config.validate()?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting iptables_exporter");
    tracing::info!(
        command = %config.collector.command,
        args = ?config.collector.args,
        "Collector configuration"
    );

    let collector = MetricsCollector::new()?;
    let command = SaveCommand::from_config(&config.collector);
    let server = MetricsServer::new(
        collector,
        command,
        config.listen_addr()?,
        &config.web.telemetry_path,
    );
    server.serve().await
}

async fn dump(config: &ExporterConfig, format: OutputFormat) -> anyhow::Result<()> {
    let command = SaveCommand::from_config(&config.collector);
    let tables = command.collect().await?;
    print_tables(&tables, format)
}

fn parse_file(file: Option<&Path>, format: OutputFormat) -> anyhow::Result<()> {
    let result = match file {
        Some(path) => {
            let f = std::fs::File::open(path)
                .map_err(|e| anyhow::anyhow!("Failed to open {}: {}", path.display(), e))?;
            parse_iptables_save(BufReader::new(f))
        }
        None => parse_iptables_save(std::io::stdin().lock()),
    };

    match result {
        Ok(tables) => print_tables(&tables, format),
        Err(SaveError::Parse(errors)) => {
            eprintln!("❌ {} malformed line(s):", errors.len());
            for error in &errors {
                eprintln!("  • {}", error);
            }
            anyhow::bail!("dump could not be parsed")
        }
        Err(e) => Err(e.into()),
    }
}

fn print_tables(tables: &Tables, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Text => display_tables(tables),
        OutputFormat::Summary => summarize(tables).display(),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(tables)?),
    }
    Ok(())
}
