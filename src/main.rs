//! influx-downsample
//!
//! Downsamples InfluxDB measurements in place according to a retention
//! schema file.

use anyhow::{Context, Result};
use clap::Parser;
use common::cli::CommonCommands;
use common::cli::utils::{display_config, init_logging, load_config, version_info};
use common::config::DEFAULT_SCHEMA_FILE;
use common::{Configuration, ConnectionOverrides};
use downsampler::planner::format_interval;
use downsampler::{CompiledSchema, Downsampler, RunReport};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Downsample InfluxDB measurements by retention policy",
    long_about = None
)]
struct Args {
    /// Path to the schema file (JSON or TOML)
    #[arg(short, long, default_value = DEFAULT_SCHEMA_FILE)]
    schema: PathBuf,

    /// InfluxDB host, overrides the schema file
    #[arg(short = 'H', long)]
    host: Option<String>,

    /// InfluxDB port, overrides the schema file
    #[arg(short = 'P', long)]
    port: Option<u16>,

    /// InfluxDB username, overrides the schema file
    #[arg(short, long)]
    username: Option<String>,

    /// InfluxDB password, overrides the schema file
    #[arg(short, long)]
    password: Option<String>,

    /// Log every statement without executing it
    #[arg(long)]
    dry_run: bool,

    /// Enable debug logging
    #[arg(short, long, conflicts_with = "quiet")]
    verbose: bool,

    /// Only log warnings and errors
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Option<CommonCommands>,
}

impl Args {
    fn overrides(&self) -> ConnectionOverrides {
        ConnectionOverrides {
            host: self.host.clone(),
            port: self.port,
            username: self.username.clone(),
            password: self.password.clone(),
        }
    }

    fn load_config(&self) -> Result<Configuration> {
        let mut config = load_config(&self.schema, &self.overrides())?;
        config.dry_run |= self.dry_run;
        Ok(config)
    }
}

fn print_schema(schema: &CompiledSchema) {
    println!("Reference time: {}", schema.reference_time);
    println!("Databases: {}", schema.databases.join(", "));
    for policy in &schema.policies {
        println!(
            "Policy #{} ({} tiers, function {})",
            policy.index,
            policy.windows.len(),
            policy
                .function
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| "per field type".to_string())
        );
        for (index, window) in policy.windows.iter().enumerate() {
            let interval = window
                .interval
                .map(format_interval)
                .unwrap_or_else(|| "raw".to_string());
            let from = window
                .min_timestamp
                .map(|ts| ts.to_rfc3339())
                .unwrap_or_else(|| "-inf".to_string());
            let to = window
                .max_timestamp
                .map(|ts| ts.to_rfc3339())
                .unwrap_or_else(|| "now".to_string());
            println!("  window {index}: {interval} from {from} to {to}");
        }
    }
}

fn print_report(report: &RunReport) {
    let mode = if report.dry_run { "dry run" } else { "applied" };
    println!("Run {} ({mode})", report.run_id);
    for database in &report.databases {
        for measurement in &database.measurements {
            println!(
                "{}.{}: {} statements, {} aggregated, {} restored{}",
                database.database,
                measurement.measurement,
                measurement.steps.len(),
                measurement.aggregated(),
                measurement.restored,
                if measurement.resumed() { " (resumed)" } else { "" }
            );
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let command = args.command.clone().unwrap_or_default();

    if command == CommonCommands::Version {
        println!("{}", version_info());
        return Ok(());
    }

    init_logging(args.verbose, args.quiet);
    let config = args.load_config()?;

    match command {
        CommonCommands::Config { json } => display_config(&config, json),
        CommonCommands::Validate => {
            let schema = CompiledSchema::compile(&config).context("Schema does not compile")?;
            print_schema(&schema);
            Ok(())
        }
        CommonCommands::Run => {
            let downsampler =
                Downsampler::from_config(&config).context("Failed to set up downsampler")?;
            let report = downsampler.run().await.context("Downsampling failed")?;
            print_report(&report);
            Ok(())
        }
        CommonCommands::Version => Ok(()),
    }
}
