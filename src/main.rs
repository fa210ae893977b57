mod client;
mod config;
mod db;
mod error;
mod fees;
mod state;
mod tracker;

use crate::client::NodeClient;
use clap::{Args, Parser, Subcommand};
use config::Config;
use log::{error, info, warn};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "feeboss", about = "Demand-driven fee setter for LND")]
struct Cli {
    /// Path to feeboss.toml config file
    #[arg(short, long, default_value = "feeboss.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Compute and set new fee policies (default)
    SetFees(SetFeesArgs),
    /// Print the most recent fee decisions from the database
    Status {
        /// Number of decisions to show
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
}

/// Command-line overrides of the `[fees]` config section.
#[derive(Args, Debug, Default)]
struct SetFeesArgs {
    /// Time-lock delta in blocks
    #[arg(long)]
    cltv: Option<u32>,
    /// Base fee in msat
    #[arg(long)]
    base_fee_msat: Option<u64>,
    /// Forwarding history window in days
    #[arg(long)]
    from_days_ago: Option<u32>,
    /// Lower bound of the fee rate
    #[arg(long)]
    min_fee_rate: Option<f64>,
    /// Set fees without asking for confirmation
    #[arg(long)]
    reckless: bool,
}

impl SetFeesArgs {
    fn apply_to(&self, fees: &mut config::FeesConfig) {
        if let Some(cltv) = self.cltv {
            fees.cltv = cltv;
        }
        if let Some(base_fee_msat) = self.base_fee_msat {
            fees.base_fee_msat = base_fee_msat;
        }
        if let Some(from_days_ago) = self.from_days_ago {
            fees.from_days_ago = from_days_ago;
        }
        if let Some(min_fee_rate) = self.min_fee_rate {
            fees.min_fee_rate = min_fee_rate;
        }
        if self.reckless {
            fees.reckless = true;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let command = cli
        .command
        .unwrap_or_else(|| Commands::SetFees(SetFeesArgs::default()));

    let config = match &command {
        Commands::SetFees(args) => {
            let mut config = Config::from_file(&cli.config)?;
            args.apply_to(&mut config.fees);
            config.validate()?;
            config
        }
        Commands::Status { .. } => Config::load(&cli.config)?,
    };

    // Initialize logging
    let log_level = config.general.log_level.clone();
    env_logger::Builder::new()
        .filter_level(log_level.parse().unwrap_or(log::LevelFilter::Info))
        .format_timestamp_secs()
        .init();

    let db = db::Database::open(&config.general.database_path)?;

    match command {
        Commands::SetFees(_) => set_fees(&config, &db).await,
        Commands::Status { limit } => print_status(&db, limit),
    }
}

async fn set_fees(config: &Config, db: &db::Database) -> anyhow::Result<()> {
    info!("FeeBoss v{} starting", env!("CARGO_PKG_VERSION"));

    if config.general.dry_run {
        warn!("DRY-RUN MODE: No fee policies will be set");
    }

    let client = client::LndRestClient::new(config)?;

    // Startup connectivity check
    info!("Verifying LND connectivity...");
    match client.get_info().await {
        Ok(info) => {
            info!(
                "Connected to LND node: {} ({}), {} active channels",
                info.alias, info.identity_pubkey, info.num_active_channels
            );
        }
        Err(e) => {
            error!("Cannot reach LND: {:#}. Aborting.", e);
            return Err(e);
        }
    }

    let run_config = config.fees.run_config();
    let summary = fees::run(
        config,
        &run_config,
        &client,
        db,
        &fees::confirm::StdinConfirm,
        chrono::Utc::now(),
    )
    .await?;

    info!(
        "Fee setter: {} proposed, {} skipped, {} applied, {} failed",
        summary.proposed, summary.skipped, summary.applied, summary.failed
    );
    Ok(())
}

fn print_status(db: &db::Database, limit: usize) -> anyhow::Result<()> {
    let rows = tracker::decisions::recent(db, limit)?;

    println!("FeeBoss Status");
    println!("==============");

    let Some(latest) = rows.first() else {
        println!("No fee decisions recorded yet.");
        return Ok(());
    };

    let last_run = chrono::DateTime::from_timestamp(latest.run_at, 0)
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| latest.run_at.to_string());
    println!("Last run:               {}", last_run);
    println!(
        "Channels skipped:       {}",
        tracker::decisions::error_count(db, latest.run_at)?
    );
    println!();
    println!(
        "{:<20} {:>7} {:>7} {:>7} {:>10} {:>10} {:>8}  channel point",
        "channel", "ub", "flow", "change", "old rate", "new rate", "applied"
    );
    for row in &rows {
        println!(
            "{:<20} {:>7.2} {:>7.2} {:>7.3} {:>10.6} {:>10.6} {:>8}  {}",
            row.channel_id,
            row.unbalancedness,
            row.flow_direction,
            row.weighted_change,
            row.fee_rate_old,
            row.fee_rate_new,
            if row.applied { "yes" } else { "no" },
            row.channel_point,
        );
    }

    Ok(())
}
