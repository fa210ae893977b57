use crate::client::{ForwardingEvent, ForwardingHistoryRequest, NodeClient};
use crate::fees::ForwardingStats;
use log::{debug, info};
use std::collections::HashMap;

/// Page size requested from the node's forwarding log.
const MAX_EVENTS_PER_PAGE: u32 = 50_000;

/// Fetch all forwardings between `start` and `end` (unix seconds) and
/// aggregate them per channel id.
pub async fn collect(
    client: &(impl NodeClient + Sync),
    start: i64,
    end: i64,
) -> anyhow::Result<HashMap<String, ForwardingStats>> {
    let mut events = Vec::new();
    let mut index_offset = 0u32;

    loop {
        let resp = client
            .forwarding_history(ForwardingHistoryRequest {
                start_time: start,
                end_time: end,
                index_offset,
                num_max_events: MAX_EVENTS_PER_PAGE,
            })
            .await?;

        let page_len = resp.forwarding_events.len();
        events.extend(resp.forwarding_events);
        index_offset = resp.last_offset_index;

        // A short page is the last one
        if page_len < MAX_EVENTS_PER_PAGE as usize {
            break;
        }
    }

    match (events.first(), events.last()) {
        (Some(first), Some(last)) => info!(
            "Forwarding tracker: {} forwardings between {} and {}",
            events.len(),
            first.timestamp,
            last.timestamp
        ),
        _ => debug!("Forwarding tracker: no forwardings in window"),
    }

    Ok(aggregate(&events))
}

/// Per-channel totals. The amount entering a channel counts as inward flow
/// of the incoming channel, the amount leaving counts as outward flow of the
/// outgoing channel. Fees are credited to the outgoing channel, which is the
/// one whose policy charged them.
pub fn aggregate(events: &[ForwardingEvent]) -> HashMap<String, ForwardingStats> {
    let mut stats: HashMap<String, ForwardingStats> = HashMap::new();

    for event in events {
        let incoming = stats.entry(event.chan_id_in.to_string()).or_default();
        incoming.total_forwarding_in += event.amt_in;
        incoming.number_forwardings += 1;

        let outgoing = stats.entry(event.chan_id_out.to_string()).or_default();
        outgoing.total_forwarding_out += event.amt_out;
        outgoing.fees_total_msat += event.fee_msat;
        outgoing.number_forwardings += 1;
    }

    for s in stats.values_mut() {
        s.flow_direction = flow_direction(s.total_forwarding_in, s.total_forwarding_out);
    }

    stats
}

/// -1 when a channel only received, 1 when it only sent, 0 without traffic.
fn flow_direction(amount_in: u64, amount_out: u64) -> f64 {
    let total = amount_in as f64 + amount_out as f64;
    if total == 0.0 {
        return 0.0;
    }
    (amount_out as f64 - amount_in as f64) / total
}
