use super::FeePolicy;
use crate::client::NodeClient;
use log::{error, info};
use std::collections::{BTreeMap, HashSet};

/// Channel points that were updated and those whose update failed.
#[derive(Debug, Default)]
pub struct ApplyReport {
    pub applied: HashSet<String>,
    pub failed: Vec<(String, String)>,
}

/// Push every policy to the node, one channel at a time.
///
/// A failing channel is logged and skipped; the remaining channels are still
/// updated.
pub async fn apply(
    client: &(impl NodeClient + Sync),
    policies: &BTreeMap<String, FeePolicy>,
) -> ApplyReport {
    let mut report = ApplyReport::default();

    for (channel_point, policy) in policies {
        info!(
            "Fee setter: channel {} -- base: {}msat, rate: {:.6}, cltv: {}",
            channel_point, policy.base_fee_msat, policy.fee_rate, policy.cltv,
        );

        match client.update_channel_policy(channel_point, policy).await {
            Ok(()) => {
                report.applied.insert(channel_point.clone());
            }
            Err(e) => {
                error!("Fee setter: failed to update {}: {:#}", channel_point, e);
                report.failed.push((channel_point.clone(), format!("{:#}", e)));
            }
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::mock::MockNodeClient;

    fn policies() -> BTreeMap<String, FeePolicy> {
        let mut policies = BTreeMap::new();
        for (point, rate) in [("aa:0", 0.0001), ("bb:1", 0.00025)] {
            policies.insert(
                point.to_string(),
                FeePolicy {
                    base_fee_msat: 40,
                    fee_rate: rate,
                    cltv: 20,
                },
            );
        }
        policies
    }

    #[tokio::test]
    async fn test_apply_pushes_all() {
        let mock = MockNodeClient::new();
        let report = apply(&mock, &policies()).await;

        assert_eq!(report.applied.len(), 2);
        assert!(report.failed.is_empty());

        let calls = mock.update_policy_calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, "aa:0");
        assert_eq!(calls[1].1.fee_rate, 0.00025);
    }

    #[tokio::test]
    async fn test_apply_continues_after_failure() {
        let mut mock = MockNodeClient::new();
        mock.failing_channel_points.insert("aa:0".to_string());

        let report = apply(&mock, &policies()).await;

        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "aa:0");
        assert!(report.applied.contains("bb:1"));
        assert_eq!(mock.update_policy_calls.lock().unwrap().len(), 1);
    }
}
