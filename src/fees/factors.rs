//! Change factors for the demand-based fee setter.
//!
//! Each factor turns one observed signal into a multiplier around 1.0:
//! - Unbalancedness: `1 + ub / 2`, limited to [0.5, 1.5]
//! - Flow direction: same curve, applied to the net forwarding direction
//! - Demand: outward volume per day against a fixed weekly target,
//!   limited to at most 2.0 (no lower limit)
//!
//! All three are pure functions of their inputs.

/// Rescaling of the unbalancedness / flow signal before it becomes a change.
const SIGNAL_RESCALE: f64 = 0.5;
/// Maximal change in either direction for the unbalancedness / flow factors.
const SIGNAL_MAX_CHANGE: f64 = 0.5;

/// Slope of the demand curve: no forwarding at all lowers the fee by 25%.
const DEMAND_MIN_CHANGE: f64 = 0.25;
/// Upper limit of the demand factor: at most double the fee rate.
const DEMAND_MAX_CHANGE: f64 = 1.0;
/// Outward volume (sat) per week at which the demand factor is neutral.
const DEMAND_TARGET_SATS_PER_WEEK: f64 = 100_000.0;

/// Linear change `1 + signal * rescale`, limited to `[1 - c_max, 1 + c_max]`.
fn limited_change(signal: f64, rescale: f64, c_max: f64) -> f64 {
    let c = 1.0 + signal * rescale;
    if c > 1.0 {
        c.min(1.0 + c_max)
    } else {
        c.max(1.0 - c_max)
    }
}

/// Change factor from the channel's unbalancedness (`ub` in [-1, 1]).
///
/// A positive `ub` (local surplus) raises the fee rate, a negative one
/// (drained channel) lowers it.
pub fn factor_unbalancedness(ub: f64) -> f64 {
    limited_change(ub, SIGNAL_RESCALE, SIGNAL_MAX_CHANGE)
}

/// Change factor from the net forwarding direction (`flow` in [-1, 1]).
///
/// Predominantly outward forwarding signals demand and raises the fee rate.
pub fn factor_flow(flow: f64) -> f64 {
    limited_change(flow, SIGNAL_RESCALE, SIGNAL_MAX_CHANGE)
}

/// Change factor from the amount forwarded out of the channel (sat) during
/// the lookback window.
///
/// `capacity` is part of the signature so a capacity-relative target
/// (e.g. 10% of capacity per week) can replace the fixed one; the current
/// model ignores it. `lookback_days` must be positive, which
/// `RunConfig::validate` guarantees before any factor is computed.
pub fn factor_demand(amount_out: f64, _capacity: u64, lookback_days: f64) -> f64 {
    let rate = amount_out / lookback_days;
    let rate_target = DEMAND_TARGET_SATS_PER_WEEK / 7.0;

    let c = DEMAND_MIN_CHANGE * (rate / rate_target - 1.0) + 1.0;

    c.min(1.0 + DEMAND_MAX_CHANGE)
}
