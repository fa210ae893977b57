use crate::client::{Channel, ChannelFee, NodeClient};
use crate::fees::{ChannelState, FeePolicy};
use log::debug;
use std::collections::{BTreeMap, HashMap};

/// Snapshot of the node's channels and fee policies collected at the start of a run.
pub struct NodeState {
    pub channels: Vec<Channel>,
    pub fees: Vec<ChannelFee>,
}

impl NodeState {
    /// Collect fresh node state from LND.
    pub async fn collect(client: &(impl NodeClient + Sync)) -> anyhow::Result<Self> {
        let channels = client.list_channels().await?;
        let fees = client.fee_report().await?;

        let state = Self { channels, fees };

        debug!(
            "Collected state: {} channels ({} active, {} sat), {} fee policies",
            state.channels.len(),
            state.channels.iter().filter(|c| c.active).count(),
            state.total_channel_capacity_sats(),
            state.fees.len(),
        );

        Ok(state)
    }

    /// Channel states keyed by channel id. Channels without capacity are skipped.
    pub fn channel_states(&self) -> BTreeMap<String, ChannelState> {
        self.channels
            .iter()
            .filter(|c| c.capacity > 0)
            .map(|c| {
                let channel_id = c.chan_id.to_string();
                let state = ChannelState {
                    channel_id: channel_id.clone(),
                    channel_point: c.channel_point.clone(),
                    capacity: c.capacity,
                    unbalancedness: unbalancedness(c),
                };
                (channel_id, state)
            })
            .collect()
    }

    /// Current policies keyed by channel point.
    ///
    /// LND's fee report carries no time-lock delta; `cltv` is left at 0 and
    /// only the fee parts serve as the baseline.
    pub fn current_policies(&self) -> HashMap<String, FeePolicy> {
        self.fees
            .iter()
            .map(|f| {
                (
                    f.channel_point.clone(),
                    FeePolicy {
                        base_fee_msat: f.base_fee_msat,
                        fee_rate: f.fee_rate,
                        cltv: 0,
                    },
                )
            })
            .collect()
    }

    /// Total channel capacity in satoshis.
    pub fn total_channel_capacity_sats(&self) -> u64 {
        self.channels.iter().map(|c| c.capacity).sum()
    }
}

/// Balance skew of a channel: -1 when all funds are remote, 1 when all are
/// local. The commitment fee is reserved from the initiator's balance, so it
/// is counted back as local funds when we opened the channel.
pub fn unbalancedness(channel: &Channel) -> f64 {
    if channel.capacity == 0 {
        return 0.0;
    }
    let commit_fee = if channel.initiator {
        channel.commit_fee
    } else {
        0
    };
    let local = (channel.local_balance + commit_fee) as f64;
    (2.0 * local / channel.capacity as f64 - 1.0).clamp(-1.0, 1.0)
}
