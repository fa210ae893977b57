pub mod compositor;
pub mod confirm;
pub mod factors;
pub mod setter;

use crate::client::NodeClient;
use crate::config::Config;
use crate::db::Database;
use crate::error::{FeeError, FeeResult};
use crate::state::NodeState;
use crate::tracker::{decisions, forwarding};
use chrono::{DateTime, Duration, Utc};
use confirm::Confirm;
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::HashSet;

/// Balance and size of one open channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelState {
    pub channel_id: String,
    /// `txid:output_index`, the key policy updates are addressed by
    pub channel_point: String,
    pub capacity: u64,
    /// -1 (all funds remote) .. 1 (all funds local)
    pub unbalancedness: f64,
}

/// Forwarding activity of one channel over the lookback window.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ForwardingStats {
    /// -1 (only inward) .. 1 (only outward)
    pub flow_direction: f64,
    pub fees_total_msat: u64,
    pub total_forwarding_in: u64,
    pub total_forwarding_out: u64,
    pub number_forwardings: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeePolicy {
    pub base_fee_msat: u64,
    /// Proportional fee as a fraction of the forwarded amount
    pub fee_rate: f64,
    pub cltv: u32,
}

/// Parameters of one fee-setting run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    pub cltv: u32,
    pub base_fee_msat: u64,
    pub from_days_ago: u32,
    pub min_fee_rate: f64,
    pub reckless: bool,
}

impl RunConfig {
    pub fn validate(&self) -> FeeResult<()> {
        if self.from_days_ago == 0 {
            return Err(FeeError::Configuration {
                field: "from_days_ago",
                reason: "must be positive, got 0".to_string(),
            });
        }
        if !self.min_fee_rate.is_finite() || self.min_fee_rate <= 0.0 {
            return Err(FeeError::Configuration {
                field: "min_fee_rate",
                reason: format!("must be a positive number, got {}", self.min_fee_rate),
            });
        }
        Ok(())
    }

    /// Forwarding history window ending at `now`, as unix seconds.
    pub fn window(&self, now: DateTime<Utc>) -> (i64, i64) {
        let start = now - Duration::days(self.from_days_ago as i64);
        (start.timestamp(), now.timestamp())
    }
}

/// What a run did, for the caller to report.
#[derive(Debug, Default, PartialEq)]
pub struct RunSummary {
    pub proposed: usize,
    pub skipped: usize,
    pub applied: usize,
    pub failed: usize,
}

/// Run the demand-based fee setter once: gather node data, compute new
/// policies, ask for confirmation and push them.
pub async fn run(
    config: &Config,
    run_config: &RunConfig,
    client: &(impl NodeClient + Sync),
    db: &Database,
    gate: &dyn Confirm,
    now: DateTime<Utc>,
) -> anyhow::Result<RunSummary> {
    // Fail before touching the node
    run_config.validate()?;

    let (start, end) = run_config.window(now);
    info!(
        "Fee setter: analyzing forwardings of the last {} days",
        run_config.from_days_ago
    );

    let node_state = NodeState::collect(client).await?;
    let stats = forwarding::collect(client, start, end).await?;

    let outcome = compositor::compute_policies(
        &node_state.channel_states(),
        &stats,
        run_config,
        &node_state.current_policies(),
    )?;

    for err in &outcome.errors {
        warn!("Fee setter: channel {} not evaluated: {}", err.channel_id, err.error);
    }

    let mut summary = RunSummary {
        proposed: outcome.policies.len(),
        skipped: outcome.errors.len(),
        ..Default::default()
    };

    if outcome.policies.is_empty() {
        debug!("Fee setter: no policies to set");
        decisions::record(db, end, &outcome, &HashSet::new())?;
        return Ok(summary);
    }

    let approved = if config.general.dry_run {
        info!("  (dry-run: not applying)");
        false
    } else if run_config.reckless {
        true
    } else {
        gate.confirm(&outcome.policies)?
    };

    let mut applied = HashSet::new();
    if approved {
        let report = setter::apply(client, &outcome.policies).await;
        summary.failed = report.failed.len();
        applied = report.applied;
        info!("Have set new fee policy on {} channels.", applied.len());
    } else if !config.general.dry_run {
        info!("Didn't set new fee policy.");
    }
    summary.applied = applied.len();

    decisions::record(db, end, &outcome, &applied)?;

    Ok(summary)
}
