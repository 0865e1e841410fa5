use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use crimesync_core::ReportingPeriod;
use crimesync_store::TableName;
use crimesync_sync::SyncConfig;

#[derive(Debug, Parser)]
#[command(name = "crimesync")]
#[command(about = "Ingest street-level crimes from data.police.uk into Postgres")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch every area for the reporting period and upload new rows.
    Sync(SyncArgs),
    /// Create the target table if it is missing.
    Migrate {
        #[arg(long)]
        table: Option<TableName>,
    },
}

#[derive(Debug, Default, Args)]
struct SyncArgs {
    /// CSV with borough,latitude,longitude columns.
    #[arg(long)]
    areas: Option<PathBuf>,
    /// Reporting period, YYYY-MM.
    #[arg(long)]
    period: Option<ReportingPeriod>,
    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long)]
    max_rps: Option<f64>,
    #[arg(long)]
    table: Option<TableName>,
    /// Fetch and transform without touching the database.
    #[arg(long)]
    dry_run: bool,
}

impl SyncArgs {
    fn apply(&self, config: &mut SyncConfig) {
        if let Some(areas) = &self.areas {
            config.areas_csv = areas.clone();
        }
        if let Some(period) = self.period {
            config.period = period;
        }
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size.max(1);
        }
        if let Some(max_rps) = self.max_rps {
            config.http.max_requests_per_second = max_rps;
        }
        if let Some(table) = &self.table {
            config.table = table.clone();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = SyncConfig::from_env()?;

    match cli.command.unwrap_or_else(|| Commands::Sync(SyncArgs::default())) {
        Commands::Sync(args) => {
            args.apply(&mut config);
            let summary = crimesync_sync::run_sync(&config, args.dry_run).await?;
            println!(
                "sync complete: run_id={} period={} areas={} batches={} fetched={} rows={} rejected={} skipped_existing={} inserted={} abandoned_batches={}",
                summary.run_id,
                summary.period,
                summary.areas,
                summary.batches,
                summary.fetched_records,
                summary.normalized_rows,
                summary.rejected_rows,
                summary.skipped_existing,
                summary.inserted_rows,
                summary.abandoned_batches
            );
        }
        Commands::Migrate { table } => {
            if let Some(table) = table {
                config.table = table;
            }
            let table = crimesync_sync::migrate(&config).await?;
            println!("table {table} is ready");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn sync_flags_override_config() {
        let cli = Cli::parse_from([
            "crimesync",
            "sync",
            "--period",
            "2023-11",
            "--batch-size",
            "0",
            "--table",
            "public.crimes",
            "--dry-run",
        ]);
        let Some(Commands::Sync(args)) = cli.command else {
            panic!("expected sync");
        };
        let mut config = SyncConfig::default();
        args.apply(&mut config);

        assert!(args.dry_run);
        assert_eq!(config.period.to_string(), "2023-11");
        assert_eq!(config.batch_size, 1);
        assert_eq!(config.table.as_str(), "public.crimes");
    }

    #[test]
    fn invalid_period_is_rejected() {
        assert!(Cli::try_parse_from(["crimesync", "sync", "--period", "June"]).is_err());
    }
}
