use crate::db::Database;
use crate::fees::compositor::PolicyOutcome;
use log::debug;
use std::collections::HashSet;

/// Stored fee decision, as shown by `status`.
#[derive(Debug, Clone, PartialEq)]
pub struct DecisionRow {
    pub run_at: i64,
    pub channel_id: String,
    pub channel_point: String,
    pub unbalancedness: f64,
    pub flow_direction: f64,
    pub weighted_change: f64,
    pub fee_rate_old: f64,
    pub fee_rate_new: f64,
    pub applied: bool,
}

/// Record every decision and error of a run. `applied` holds the channel
/// points whose policy update went through.
pub fn record(
    db: &Database,
    run_at: i64,
    outcome: &PolicyOutcome,
    applied: &HashSet<String>,
) -> anyhow::Result<()> {
    // All rows of a run commit together
    let tx = db.conn().unchecked_transaction()?;

    for d in &outcome.decisions {
        tx.execute(
            "INSERT INTO fee_decisions (run_at, channel_id, channel_point, capacity_sats, \
             unbalancedness, flow_direction, fees_total_msat, number_forwardings, \
             forwarded_in_sats, forwarded_out_sats, factor_demand, factor_unbalancedness, \
             factor_flow, weighted_change, applied_change, fee_rate_old, fee_rate_new, applied) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
            rusqlite::params![
                run_at,
                d.channel_id,
                d.channel_point,
                d.capacity_sats as i64,
                d.unbalancedness,
                d.flow_direction,
                d.fees_total_msat as i64,
                d.number_forwardings as i64,
                d.forwarded_in_sats as i64,
                d.forwarded_out_sats as i64,
                d.factor_demand,
                d.factor_unbalancedness,
                d.factor_flow,
                d.weighted_change,
                d.applied_change,
                d.fee_rate_old,
                d.fee_rate_new,
                applied.contains(&d.channel_point),
            ],
        )?;
    }

    for e in &outcome.errors {
        tx.execute(
            "INSERT INTO fee_decision_errors (run_at, channel_id, reason) VALUES (?1, ?2, ?3)",
            rusqlite::params![run_at, e.channel_id, e.error.to_string()],
        )?;
    }

    tx.commit()?;

    debug!(
        "Decision tracker: recorded {} decisions, {} errors",
        outcome.decisions.len(),
        outcome.errors.len()
    );

    Ok(())
}

/// Most recent decisions, newest first.
pub fn recent(db: &Database, limit: usize) -> anyhow::Result<Vec<DecisionRow>> {
    let mut stmt = db.conn().prepare(
        "SELECT run_at, channel_id, channel_point, unbalancedness, flow_direction, \
         weighted_change, fee_rate_old, fee_rate_new, applied \
         FROM fee_decisions ORDER BY run_at DESC, id DESC LIMIT ?1",
    )?;
    let rows = stmt
        .query_map(rusqlite::params![limit as i64], |row| {
            Ok(DecisionRow {
                run_at: row.get(0)?,
                channel_id: row.get(1)?,
                channel_point: row.get(2)?,
                unbalancedness: row.get(3)?,
                flow_direction: row.get(4)?,
                weighted_change: row.get(5)?,
                fee_rate_old: row.get(6)?,
                fee_rate_new: row.get(7)?,
                applied: row.get(8)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Number of channels a run could not evaluate.
pub fn error_count(db: &Database, run_at: i64) -> anyhow::Result<i64> {
    let count = db.conn().query_row(
        "SELECT COUNT(*) FROM fee_decision_errors WHERE run_at = ?1",
        rusqlite::params![run_at],
        |r| r.get(0),
    )?;
    Ok(count)
}
