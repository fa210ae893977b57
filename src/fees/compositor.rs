//! Combines the change factors into one new fee policy per channel.
//!
//! Algorithm, per channel:
//! 1. Missing forwarding stats count as no activity.
//! 2. Compute the demand, unbalancedness and flow factors.
//! 3. Blend them with weights 1.2 / 1.0 / 0.6; the flow weight drops to 0
//!    when nothing was forwarded through the channel.
//! 4. Fee rates at or below 2e-6 get their deviation from 1.0 tripled, so the
//!    change is noticeable on tiny rates.
//! 5. New rate = max(min_fee_rate, current rate * change).
//!
//! Channels are evaluated independently. A channel with bad input data ends
//! up in `PolicyOutcome::errors` and does not affect any other channel.

use super::factors::{factor_demand, factor_flow, factor_unbalancedness};
use super::{ChannelState, FeePolicy, ForwardingStats, RunConfig};
use crate::error::{FeeError, FeeResult};
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

const WEIGHT_DEMAND: f64 = 1.2;
const WEIGHT_UNBALANCEDNESS: f64 = 1.0;
const WEIGHT_FLOW: f64 = 0.6;

/// Fee rates at or below this get an amplified change.
pub const SMALL_FEE_RATE: f64 = 2e-6;
const SMALL_FEE_AMPLIFICATION: f64 = 3.0;

/// One term of the weighted blend.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightedFactor {
    pub value: f64,
    pub weight: f64,
}

impl WeightedFactor {
    pub fn new(value: f64, weight: f64) -> Self {
        Self { value, weight }
    }
}

/// Weighted arithmetic mean of the factors.
/// Returns the neutral change 1.0 if no factor carries any weight.
pub fn weighted_mean(factors: &[WeightedFactor]) -> f64 {
    let total_weight: f64 = factors.iter().map(|f| f.weight).sum();
    if total_weight <= 0.0 {
        return 1.0;
    }
    factors.iter().map(|f| f.weight * f.value).sum::<f64>() / total_weight
}

/// The three weighted factors for a channel, in blend order.
pub fn blend_terms(
    factor_unbalancedness: f64,
    factor_flow: f64,
    factor_demand: f64,
    total_forwarding_sats: u64,
) -> [WeightedFactor; 3] {
    // Without any forwarding the flow direction carries no information
    let wgt_flow = if total_forwarding_sats == 0 {
        0.0
    } else {
        WEIGHT_FLOW
    };
    [
        WeightedFactor::new(factor_unbalancedness, WEIGHT_UNBALANCEDNESS),
        WeightedFactor::new(factor_flow, wgt_flow),
        WeightedFactor::new(factor_demand, WEIGHT_DEMAND),
    ]
}

/// Exaggerate the change on tiny fee rates, where a plain multiplication
/// would barely move the absolute fee.
pub fn amplify_small_fee(change: f64, fee_rate: f64) -> f64 {
    if fee_rate <= SMALL_FEE_RATE {
        1.0 + (change - 1.0) * SMALL_FEE_AMPLIFICATION
    } else {
        change
    }
}

/// Audit record of one channel's fee decision.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelDecision {
    pub channel_id: String,
    pub channel_point: String,
    pub capacity_sats: u64,
    pub unbalancedness: f64,
    pub flow_direction: f64,
    pub fees_total_msat: u64,
    pub number_forwardings: u64,
    pub forwarded_in_sats: u64,
    pub forwarded_out_sats: u64,
    pub factor_demand: f64,
    pub factor_unbalancedness: f64,
    pub factor_flow: f64,
    /// Blend of the three factors.
    pub weighted_change: f64,
    /// Change actually applied, after small-fee amplification.
    pub applied_change: f64,
    pub fee_rate_old: f64,
    pub fee_rate_new: f64,
}

impl ChannelDecision {
    /// Parsable one-line form of the decision. The change column is the one
    /// actually applied to the fee rate.
    pub fn stats_line(&self) -> String {
        format!(
            "stats: {} {} {} {:.3} {:.3} {:.3} {} {:.3} {:.3} {:.3} {:.3} {:.6} {:.6}",
            self.channel_id,
            self.forwarded_in_sats,
            self.forwarded_out_sats,
            self.unbalancedness,
            self.flow_direction,
            self.fees_total_msat as f64 / 1000.0,
            self.capacity_sats,
            self.factor_demand,
            self.factor_unbalancedness,
            self.factor_flow,
            self.applied_change,
            self.fee_rate_old,
            self.fee_rate_new,
        )
    }
}

/// A channel that could not be evaluated.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelError {
    pub channel_id: String,
    pub error: FeeError,
}

/// Result of one batch evaluation.
#[derive(Debug, Default)]
pub struct PolicyOutcome {
    /// New policies keyed by channel point.
    pub policies: BTreeMap<String, FeePolicy>,
    /// One record per successfully evaluated channel, in channel id order.
    pub decisions: Vec<ChannelDecision>,
    pub errors: Vec<ChannelError>,
}

/// Compute new fee policies for all channels.
///
/// `channels` is keyed by channel id, `stats` by channel id (channels
/// without an entry had no forwarding activity) and `current_policies` by
/// channel point. Only configuration errors are returned as `Err`.
pub fn compute_policies(
    channels: &BTreeMap<String, ChannelState>,
    stats: &HashMap<String, ForwardingStats>,
    config: &RunConfig,
    current_policies: &HashMap<String, FeePolicy>,
) -> FeeResult<PolicyOutcome> {
    config.validate()?;

    info!("Determining new channel policies based on demand.");
    info!(
        "Every channel will have a base fee of {} msat and cltv of {}.",
        config.base_fee_msat, config.cltv
    );

    let mut outcome = PolicyOutcome::default();

    for (channel_id, channel) in channels {
        let channel_stats = stats.get(channel_id).copied().unwrap_or_default();

        match decide(channel, &channel_stats, config, current_policies) {
            Ok(decision) => {
                outcome.policies.insert(
                    decision.channel_point.clone(),
                    FeePolicy {
                        base_fee_msat: config.base_fee_msat,
                        fee_rate: decision.fee_rate_new,
                        cltv: config.cltv,
                    },
                );
                outcome.decisions.push(decision);
            }
            Err(error) => {
                warn!("Skipping channel {}: {}", channel_id, error);
                outcome.errors.push(ChannelError {
                    channel_id: channel_id.clone(),
                    error,
                });
            }
        }
    }

    Ok(outcome)
}

/// Evaluate a single channel.
pub fn decide(
    channel: &ChannelState,
    stats: &ForwardingStats,
    config: &RunConfig,
    current_policies: &HashMap<String, FeePolicy>,
) -> FeeResult<ChannelDecision> {
    check_signal(&channel.channel_id, "unbalancedness", channel.unbalancedness)?;
    check_signal(&channel.channel_id, "flow_direction", stats.flow_direction)?;

    let fee_rate = current_policies
        .get(&channel.channel_point)
        .map(|p| p.fee_rate)
        .ok_or_else(|| FeeError::MissingPolicy {
            channel_id: channel.channel_id.clone(),
            channel_point: channel.channel_point.clone(),
        })?;

    let ub = channel.unbalancedness;
    let flow = stats.flow_direction;
    let total_forwarding = stats.total_forwarding_in + stats.total_forwarding_out;

    info!(">>> New channel policy for channel {}", channel.channel_id);
    info!(
        "    ub: {:.2} flow: {:.2}, fees: {:.3} sat, cap: {} sat, nfwd: {}, in: {} sat, out: {} sat.",
        ub,
        flow,
        stats.fees_total_msat as f64 / 1000.0,
        channel.capacity,
        stats.number_forwardings,
        stats.total_forwarding_in,
        stats.total_forwarding_out,
    );

    let f_demand = factor_demand(
        stats.total_forwarding_out as f64,
        channel.capacity,
        config.from_days_ago as f64,
    );
    let f_ub = factor_unbalancedness(ub);
    let f_flow = factor_flow(flow);

    let weighted_change = weighted_mean(&blend_terms(f_ub, f_flow, f_demand, total_forwarding));

    info!(
        "    Change factors: demand: {:.3}, unbalancedness {:.3}, flow: {:.3}. Weighted change: {:.3}",
        f_demand, f_ub, f_flow, weighted_change
    );

    let applied_change = amplify_small_fee(weighted_change, fee_rate);
    let fee_rate_new = (fee_rate * applied_change).max(config.min_fee_rate);

    info!("    Fee rate: {:.6} -> {:.6}", fee_rate, fee_rate_new);

    let decision = ChannelDecision {
        channel_id: channel.channel_id.clone(),
        channel_point: channel.channel_point.clone(),
        capacity_sats: channel.capacity,
        unbalancedness: ub,
        flow_direction: flow,
        fees_total_msat: stats.fees_total_msat,
        number_forwardings: stats.number_forwardings,
        forwarded_in_sats: stats.total_forwarding_in,
        forwarded_out_sats: stats.total_forwarding_out,
        factor_demand: f_demand,
        factor_unbalancedness: f_ub,
        factor_flow: f_flow,
        weighted_change,
        applied_change,
        fee_rate_old: fee_rate,
        fee_rate_new,
    };

    debug!("{}", decision.stats_line());

    Ok(decision)
}

/// Signals must be finite and within [-1, 1]; upstream guarantees this, so a
/// violation is reported rather than clamped.
fn check_signal(channel_id: &str, field: &'static str, value: f64) -> FeeResult<()> {
    if value.is_finite() && (-1.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(FeeError::InvalidInput {
            channel_id: channel_id.to_string(),
            field,
            value,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_config() -> RunConfig {
        RunConfig {
            cltv: 20,
            base_fee_msat: 40,
            from_days_ago: 7,
            min_fee_rate: 0.000004,
            reckless: false,
        }
    }

    fn channel(id: &str, ub: f64) -> ChannelState {
        ChannelState {
            channel_id: id.to_string(),
            channel_point: format!("{}:0", id),
            capacity: 1_000_000,
            unbalancedness: ub,
        }
    }

    fn policy(fee_rate: f64) -> FeePolicy {
        FeePolicy {
            base_fee_msat: 1000,
            fee_rate,
            cltv: 40,
        }
    }

    fn single(
        ch: ChannelState,
        stats: Option<ForwardingStats>,
        fee_rate: f64,
    ) -> (BTreeMap<String, ChannelState>, HashMap<String, ForwardingStats>, HashMap<String, FeePolicy>) {
        let mut current = HashMap::new();
        current.insert(ch.channel_point.clone(), policy(fee_rate));
        let mut all_stats = HashMap::new();
        if let Some(s) = stats {
            all_stats.insert(ch.channel_id.clone(), s);
        }
        let mut channels = BTreeMap::new();
        channels.insert(ch.channel_id.clone(), ch);
        (channels, all_stats, current)
    }

    /// Forwarding exactly on the weekly demand target, no net direction.
    fn on_target_stats() -> ForwardingStats {
        ForwardingStats {
            flow_direction: 0.0,
            fees_total_msat: 12_000,
            total_forwarding_in: 100_000,
            total_forwarding_out: 100_000,
            number_forwardings: 10,
        }
    }

    #[test]
    fn test_weighted_mean_simple() {
        let terms = [WeightedFactor::new(1.0, 1.0), WeightedFactor::new(2.0, 1.0)];
        assert!((weighted_mean(&terms) - 1.5).abs() < 1e-12);
    }

    #[test]
    fn test_weighted_mean_zero_weight_ignored() {
        let terms = [WeightedFactor::new(0.6, 1.0), WeightedFactor::new(1.5, 0.0)];
        assert!((weighted_mean(&terms) - 0.6).abs() < 1e-12);
    }

    #[test]
    fn test_weighted_mean_no_weight_is_neutral() {
        assert_eq!(weighted_mean(&[]), 1.0);
        assert_eq!(weighted_mean(&[WeightedFactor::new(3.0, 0.0)]), 1.0);
    }

    #[test]
    fn test_blend_terms_zeroes_flow_without_forwarding() {
        let idle = blend_terms(1.0, 1.5, 0.75, 0);
        assert_eq!(idle[1].weight, 0.0);
        let busy = blend_terms(1.0, 1.5, 0.75, 1);
        assert_eq!(busy[1].weight, WEIGHT_FLOW);
        assert_eq!(busy[0].weight, WEIGHT_UNBALANCEDNESS);
        assert_eq!(busy[2].weight, WEIGHT_DEMAND);
    }

    #[test]
    fn test_amplify_small_fee() {
        // 1.1 -> 1 + 0.1 * 3
        assert!((amplify_small_fee(1.1, 0.0000015) - 1.3).abs() < 1e-12);
        assert!((amplify_small_fee(0.9, SMALL_FEE_RATE) - 0.7).abs() < 1e-12);
        assert_eq!(amplify_small_fee(1.1, 0.0001), 1.1);
    }

    #[test]
    fn test_small_fee_amplified_then_floored() {
        let fee_rate = 0.0000015;
        let change = amplify_small_fee(1.1, fee_rate);
        let new_rate = fee_rate * change;
        assert!((new_rate - 0.00000195).abs() < 1e-15);
        // Default floor of 4e-6 lifts it
        assert_eq!(new_rate.max(run_config().min_fee_rate), 0.000004);
    }

    #[test]
    fn test_small_fee_rate_change_amplified() {
        let mut config = run_config();
        config.min_fee_rate = 1e-7;

        for fee_rate in [0.0000015, SMALL_FEE_RATE] {
            let (channels, stats, current) = single(channel("a", 0.4), None, fee_rate);
            let outcome = compute_policies(&channels, &stats, &config, &current).unwrap();

            let d = &outcome.decisions[0];
            let expected_change = 1.0 + 3.0 * (d.weighted_change - 1.0);
            assert!(
                (d.applied_change - expected_change).abs() < 1e-12,
                "rate {}: applied {} vs {}",
                fee_rate,
                d.applied_change,
                expected_change
            );
            assert_ne!(d.applied_change, d.weighted_change);
            assert_eq!(d.fee_rate_new, fee_rate * d.applied_change);
            assert_eq!(outcome.policies["a:0"].fee_rate, d.fee_rate_new);
        }
    }

    #[test]
    fn test_stats_line_reports_applied_change() {
        let mut config = run_config();
        config.min_fee_rate = 1e-7;
        let (channels, stats, current) = single(channel("a", 0.4), None, 0.0000015);
        let outcome = compute_policies(&channels, &stats, &config, &current).unwrap();

        let d = &outcome.decisions[0];
        let line = d.stats_line();
        let cols: Vec<&str> = line.split_whitespace().collect();
        assert_eq!(cols[0], "stats:");
        assert_eq!(cols[1], "a");
        assert_eq!(cols.len(), 14);
        assert_eq!(cols[11], format!("{:.3}", d.applied_change));
        assert_ne!(cols[11], format!("{:.3}", d.weighted_change));
    }

    #[test]
    fn test_small_fee_rate_floored_after_amplification() {
        let mut config = run_config();
        config.min_fee_rate = 1e-7;
        // Drained and idle: amplified change pulls the rate below the floor
        let (channels, stats, current) = single(channel("a", -1.0), None, 0.0000015);
        let outcome = compute_policies(&channels, &stats, &config, &current).unwrap();

        let d = &outcome.decisions[0];
        assert!(0.0000015 * d.applied_change < config.min_fee_rate);
        assert_eq!(d.fee_rate_new, config.min_fee_rate);
    }

    #[test]
    fn test_neutral_signals_keep_fee_rate() {
        let (channels, stats, current) = single(channel("a", 0.0), Some(on_target_stats()), 0.0001);
        let outcome = compute_policies(&channels, &stats, &run_config(), &current).unwrap();

        let decision = &outcome.decisions[0];
        assert_eq!(decision.weighted_change, 1.0);
        assert_eq!(decision.fee_rate_new, 0.0001);
        assert_eq!(outcome.policies["a:0"].fee_rate, 0.0001);
    }

    #[test]
    fn test_idle_channel_only_demand_pulls_down() {
        // Idle: flow weight is zero, demand factor 0.75 keeps its weight
        let (channels, stats, current) = single(channel("a", 0.0), None, 0.0001);
        let outcome = compute_policies(&channels, &stats, &run_config(), &current).unwrap();

        let d = &outcome.decisions[0];
        assert_eq!(d.factor_unbalancedness, 1.0);
        assert_eq!(d.factor_demand, 0.75);
        let expected = (1.0 * 1.0 + 1.2 * 0.75) / 2.2;
        assert!((d.weighted_change - expected).abs() < 1e-12);
        assert!((d.fee_rate_new - 0.0001 * expected).abs() < 1e-15);
    }

    #[test]
    fn test_idle_drained_channel() {
        let (channels, stats, current) = single(channel("a", -0.8), None, 0.0001);
        let outcome = compute_policies(&channels, &stats, &run_config(), &current).unwrap();

        let d = &outcome.decisions[0];
        assert!((d.factor_unbalancedness - 0.6).abs() < 1e-12);
        let expected = (1.0 * 0.6 + 1.2 * 0.75) / 2.2;
        assert!((d.weighted_change - expected).abs() < 1e-12);
        assert!((d.fee_rate_new - 0.0001 * expected).abs() < 1e-15);
        assert!(d.fee_rate_new >= run_config().min_fee_rate);
    }

    #[test]
    fn test_outward_demand_raises_fee() {
        let stats = ForwardingStats {
            flow_direction: 0.8,
            fees_total_msat: 250_000,
            total_forwarding_in: 100_000,
            total_forwarding_out: 1_000_000,
            number_forwardings: 40,
        };
        let (channels, stats, current) = single(channel("a", 0.2), Some(stats), 0.0001);
        let outcome = compute_policies(&channels, &stats, &run_config(), &current).unwrap();

        let d = &outcome.decisions[0];
        assert_eq!(d.factor_demand, 2.0);
        assert!(d.factor_flow > 1.0);
        assert!(d.fee_rate_new > 0.0001);
    }

    #[test]
    fn test_floor_always_holds() {
        let config = run_config();
        for ub in [-1.0, -0.5, 0.0, 0.5, 1.0] {
            for fee_rate in [0.0, 0.000001, 0.000002, 0.000005, 0.001] {
                let (channels, stats, current) = single(channel("a", ub), None, fee_rate);
                let outcome = compute_policies(&channels, &stats, &config, &current).unwrap();
                assert!(outcome.policies["a:0"].fee_rate >= config.min_fee_rate);
            }
        }
    }

    #[test]
    fn test_policy_uses_run_config_base_and_cltv() {
        let (channels, stats, current) = single(channel("a", 0.0), None, 0.0001);
        let outcome = compute_policies(&channels, &stats, &run_config(), &current).unwrap();
        let p = &outcome.policies["a:0"];
        assert_eq!(p.base_fee_msat, 40);
        assert_eq!(p.cltv, 20);
    }

    #[test]
    fn test_deterministic() {
        let (channels, stats, current) = single(channel("a", 0.37), Some(on_target_stats()), 0.00023);
        let first = compute_policies(&channels, &stats, &run_config(), &current).unwrap();
        let second = compute_policies(&channels, &stats, &run_config(), &current).unwrap();
        assert_eq!(first.decisions, second.decisions);
        assert_eq!(first.policies, second.policies);
    }

    #[test]
    fn test_invalid_unbalancedness_does_not_abort_batch() {
        let mut channels = BTreeMap::new();
        channels.insert("bad".to_string(), channel("bad", 1.7));
        channels.insert("good".to_string(), channel("good", 0.0));
        let mut current = HashMap::new();
        current.insert("bad:0".to_string(), policy(0.0001));
        current.insert("good:0".to_string(), policy(0.0001));

        let outcome = compute_policies(&channels, &HashMap::new(), &run_config(), &current).unwrap();

        assert_eq!(outcome.policies.len(), 1);
        assert!(outcome.policies.contains_key("good:0"));
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.errors[0].channel_id, "bad");
        assert!(matches!(
            outcome.errors[0].error,
            FeeError::InvalidInput { field: "unbalancedness", .. }
        ));
    }

    #[test]
    fn test_non_finite_flow_rejected() {
        let stats = ForwardingStats {
            flow_direction: f64::NAN,
            ..on_target_stats()
        };
        let (channels, stats, current) = single(channel("a", 0.0), Some(stats), 0.0001);
        let outcome = compute_policies(&channels, &stats, &run_config(), &current).unwrap();
        assert!(outcome.policies.is_empty());
        assert!(matches!(
            outcome.errors[0].error,
            FeeError::InvalidInput { field: "flow_direction", .. }
        ));
    }

    #[test]
    fn test_missing_current_policy_reported() {
        let mut channels = BTreeMap::new();
        channels.insert("a".to_string(), channel("a", 0.0));
        let outcome =
            compute_policies(&channels, &HashMap::new(), &run_config(), &HashMap::new()).unwrap();
        assert!(matches!(outcome.errors[0].error, FeeError::MissingPolicy { .. }));
    }

    #[test]
    fn test_configuration_error_is_returned() {
        let mut config = run_config();
        config.from_days_ago = 0;
        let (channels, stats, current) = single(channel("a", 0.0), None, 0.0001);
        let err = compute_policies(&channels, &stats, &config, &current).unwrap_err();
        assert!(matches!(err, FeeError::Configuration { field: "from_days_ago", .. }));

        let mut config = run_config();
        config.min_fee_rate = 0.0;
        let err = compute_policies(&channels, &stats, &config, &current).unwrap_err();
        assert!(matches!(err, FeeError::Configuration { field: "min_fee_rate", .. }));
    }

    #[test]
    fn test_decision_serializes() {
        let (channels, stats, current) = single(channel("a", 0.0), None, 0.0001);
        let outcome = compute_policies(&channels, &stats, &run_config(), &current).unwrap();
        let json = serde_json::to_value(&outcome.decisions[0]).unwrap();
        assert_eq!(json["channel_id"], "a");
        assert_eq!(json["factor_demand"], 0.75);
    }
}
