use clap::Subcommand;

/// Subcommands of the downsampling CLI
#[derive(Subcommand, Debug, Clone, Default, PartialEq, Eq)]
pub enum CommonCommands {
    /// Compile the schema and downsample every configured database (default)
    #[default]
    Run,
    /// Show the effective configuration and exit
    Config {
        #[arg(long, help = "Show configuration in JSON format")]
        json: bool,
    },
    /// Compile the schema, report the policies and exit
    Validate,
    /// Show version information and exit
    Version,
}

/// Utility functions for CLI operations
pub mod utils {
    use crate::config::{Configuration, ConnectionOverrides};
    use anyhow::{Context, Result};
    use std::path::Path;
    use tracing_subscriber::EnvFilter;

    /// Install the tracing subscriber. `RUST_LOG` wins over the flags.
    pub fn init_logging(verbose: bool, quiet: bool) {
        let level = if quiet {
            "warn"
        } else if verbose {
            "debug"
        } else {
            "info"
        };

        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    /// Load the schema file and apply command line connection overrides
    pub fn load_config(path: &Path, overrides: &ConnectionOverrides) -> Result<Configuration> {
        tracing::info!(path = %path.display(), "Loading schema");

        let mut config = Configuration::load_from_path(path).context("Failed to load schema")?;
        overrides.apply(&mut config);
        config.validate().context("Invalid schema")?;

        Ok(config)
    }

    /// Display configuration in human-readable or JSON format
    pub fn display_config(config: &Configuration, json: bool) -> Result<()> {
        let config = config.redacted();

        if json {
            let json = serde_json::to_string_pretty(&config)
                .context("Failed to serialize configuration to JSON")?;
            println!("{json}");
            return Ok(());
        }

        println!("Downsample Configuration:");
        println!("=========================");
        println!("InfluxDB: {} (user {})", config.base_url(), config.username);
        println!("Databases: {}", config.databases.join(", "));
        println!("Policy precedence: {:?}", config.policy_precedence);
        println!(
            "Retry: backoff={:?}, max_attempts={:?}, max_elapsed={:?}",
            config.retry.backoff, config.retry.max_attempts, config.retry.max_elapsed
        );
        if config.checkpoint.enabled {
            println!("Checkpoint: {}", config.checkpoint.path.display());
        } else {
            println!("Checkpoint: disabled");
        }
        println!("Dry run: {}", config.dry_run);

        for (index, policy) in config.policies.iter().enumerate() {
            println!(
                "Policy #{index}: database={} measurement={} field={} retentions={} function={}",
                policy.pattern.database.as_deref().unwrap_or(".*"),
                policy.pattern.measurement.as_deref().unwrap_or(".*"),
                policy.pattern.field.as_deref().unwrap_or(".*"),
                policy.retentions,
                policy.function.as_deref().unwrap_or("<default>"),
            );
        }
        Ok(())
    }

    /// Standard version information
    pub fn version_info() -> String {
        format!(
            "{} {} ({})",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
            env!("CARGO_PKG_RUST_VERSION")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_common_commands_default() {
        assert_eq!(CommonCommands::default(), CommonCommands::Run);
    }

    #[test]
    fn test_version_info() {
        let version = utils::version_info();
        assert!(version.contains(env!("CARGO_PKG_VERSION")));
    }
}
