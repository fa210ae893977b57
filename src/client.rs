use anyhow::Context;
use log::{debug, warn};
use serde::de::{self, Deserializer};
use serde::Deserialize;
use std::fmt::Display;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::sleep;

use crate::config::Config;
use crate::fees::FeePolicy;

/// Trait abstracting the LND REST API surface used by the fee setter.
///
/// This enables mock-based integration testing without a live node.
#[async_trait::async_trait]
pub trait NodeClient: Send + Sync {
    async fn get_info(&self) -> anyhow::Result<NodeInfo>;
    async fn list_channels(&self) -> anyhow::Result<Vec<Channel>>;
    async fn fee_report(&self) -> anyhow::Result<Vec<ChannelFee>>;
    async fn forwarding_history(
        &self,
        request: ForwardingHistoryRequest,
    ) -> anyhow::Result<ForwardingHistoryResponse>;
    async fn update_channel_policy(
        &self,
        channel_point: &str,
        policy: &FeePolicy,
    ) -> anyhow::Result<()>;
}

// ---------------------------------------------------------------------------
// Wire types (LND REST, grpc-gateway JSON)
// ---------------------------------------------------------------------------

/// LND encodes 64-bit integers as JSON strings and omits zero values.
fn string_or_number<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr + Deserialize<'de>,
    T::Err: Display,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw<T> {
        Str(String),
        Num(T),
    }

    match Raw::<T>::deserialize(deserializer)? {
        Raw::Str(s) => s.parse().map_err(de::Error::custom),
        Raw::Num(n) => Ok(n),
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeInfo {
    #[serde(default)]
    pub identity_pubkey: String,
    #[serde(default)]
    pub alias: String,
    #[serde(default)]
    pub num_active_channels: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Channel {
    #[serde(default)]
    pub active: bool,
    pub channel_point: String,
    #[serde(default, deserialize_with = "string_or_number")]
    pub chan_id: u64,
    #[serde(default, deserialize_with = "string_or_number")]
    pub capacity: u64,
    #[serde(default, deserialize_with = "string_or_number")]
    pub local_balance: u64,
    #[serde(default, deserialize_with = "string_or_number")]
    pub commit_fee: u64,
    #[serde(default)]
    pub initiator: bool,
}

#[derive(Debug, Default, Deserialize)]
struct ListChannelsResponse {
    #[serde(default)]
    channels: Vec<Channel>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChannelFee {
    pub channel_point: String,
    #[serde(default, deserialize_with = "string_or_number")]
    pub base_fee_msat: u64,
    #[serde(default)]
    pub fee_rate: f64,
}

#[derive(Debug, Default, Deserialize)]
struct FeeReportResponse {
    #[serde(default)]
    channel_fees: Vec<ChannelFee>,
}

#[derive(Debug, Clone)]
pub struct ForwardingHistoryRequest {
    pub start_time: i64,
    pub end_time: i64,
    pub index_offset: u32,
    pub num_max_events: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ForwardingEvent {
    #[serde(default, deserialize_with = "string_or_number")]
    pub timestamp: u64,
    #[serde(default, deserialize_with = "string_or_number")]
    pub chan_id_in: u64,
    #[serde(default, deserialize_with = "string_or_number")]
    pub chan_id_out: u64,
    #[serde(default, deserialize_with = "string_or_number")]
    pub amt_in: u64,
    #[serde(default, deserialize_with = "string_or_number")]
    pub amt_out: u64,
    #[serde(default, deserialize_with = "string_or_number")]
    pub fee_msat: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ForwardingHistoryResponse {
    #[serde(default)]
    pub forwarding_events: Vec<ForwardingEvent>,
    #[serde(default)]
    pub last_offset_index: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FailedUpdate {
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub update_error: String,
}

/// LND answers `chanpolicy` with 200 even when individual updates were
/// rejected; those are listed here.
#[derive(Debug, Default, Deserialize)]
struct PolicyUpdateResponse {
    #[serde(default)]
    failed_updates: Vec<FailedUpdate>,
}

impl PolicyUpdateResponse {
    fn into_result(self, channel_point: &str) -> anyhow::Result<()> {
        if let Some(failed) = self.failed_updates.first() {
            anyhow::bail!(
                "Policy update rejected for {}: {} {}",
                channel_point,
                failed.reason,
                failed.update_error
            );
        }
        Ok(())
    }
}

/// Split a `txid:output_index` channel point.
pub fn parse_channel_point(channel_point: &str) -> anyhow::Result<(&str, u32)> {
    let (txid, index) = channel_point
        .split_once(':')
        .with_context(|| format!("Malformed channel point: {}", channel_point))?;
    if txid.len() != 64 || !txid.chars().all(|c| c.is_ascii_hexdigit()) {
        anyhow::bail!("Malformed funding txid in channel point: {}", channel_point);
    }
    let index = index
        .parse()
        .with_context(|| format!("Malformed output index in channel point: {}", channel_point))?;
    Ok((txid, index))
}

// ---------------------------------------------------------------------------
// REST client
// ---------------------------------------------------------------------------

/// Rate-limited, retrying client for LND's REST interface.
pub struct LndRestClient {
    http: reqwest::Client,
    base_url: String,
    macaroon_hex: String,
    /// Semaphore for rate limiting (1 concurrent request)
    rate_limiter: Arc<Semaphore>,
}

const MAX_RETRIES: u32 = 3;
const RETRY_BASE_MS: u64 = 1000;
const RATE_LIMIT_DELAY_MS: u64 = 100;
const MACAROON_HEADER: &str = "Grpc-Metadata-macaroon";

impl LndRestClient {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let cert_pem = std::fs::read(&config.server.tls_cert_path).with_context(|| {
            format!(
                "Failed to read TLS cert at {}",
                config.server.tls_cert_path.display()
            )
        })?;
        let macaroon = std::fs::read(&config.server.macaroon_path).with_context(|| {
            format!(
                "Failed to read macaroon at {}",
                config.server.macaroon_path.display()
            )
        })?;

        let cert = reqwest::Certificate::from_pem(&cert_pem)
            .context("TLS cert is not valid PEM")?;
        let http = reqwest::Client::builder()
            .add_root_certificate(cert)
            .timeout(Duration::from_secs(config.server.request_timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            http,
            base_url: config.server.rest_url.trim_end_matches('/').to_string(),
            macaroon_hex: hex::encode(macaroon),
            rate_limiter: Arc::new(Semaphore::new(1)),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn rate_limit(&self) -> anyhow::Result<()> {
        let _permit = self.rate_limiter.acquire().await
            .map_err(|_| anyhow::anyhow!("Rate limiter semaphore closed"))?;
        sleep(Duration::from_millis(RATE_LIMIT_DELAY_MS)).await;
        Ok(())
    }

    async fn with_retry<F, Fut, T>(&self, name: &str, f: F) -> anyhow::Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<T>>,
    {
        let mut attempt = 0;
        loop {
            self.rate_limit().await?;
            match f().await {
                Ok(resp) => {
                    debug!("{}: success", name);
                    return Ok(resp);
                }
                Err(e) if attempt + 1 < MAX_RETRIES => {
                    let delay = RETRY_BASE_MS * 2u64.pow(attempt);
                    warn!(
                        "{}: attempt {} failed ({:#}), retrying in {}ms",
                        name,
                        attempt + 1,
                        e,
                        delay
                    );
                    sleep(Duration::from_millis(delay)).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(e.context(format!(
                        "{}: all {} attempts failed",
                        name, MAX_RETRIES
                    )));
                }
            }
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> anyhow::Result<T> {
        let resp = self
            .http
            .get(self.url(path))
            .header(MACAROON_HEADER, &self.macaroon_hex)
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json().await?)
    }

    async fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> anyhow::Result<T> {
        let resp = self
            .http
            .post(self.url(path))
            .header(MACAROON_HEADER, &self.macaroon_hex)
            .json(body)
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json().await?)
    }
}

#[async_trait::async_trait]
impl NodeClient for LndRestClient {
    async fn get_info(&self) -> anyhow::Result<NodeInfo> {
        self.with_retry("GetInfo", || self.get_json("/v1/getinfo")).await
    }

    async fn list_channels(&self) -> anyhow::Result<Vec<Channel>> {
        let resp: ListChannelsResponse = self
            .with_retry("ListChannels", || self.get_json("/v1/channels"))
            .await?;
        Ok(resp.channels)
    }

    async fn fee_report(&self) -> anyhow::Result<Vec<ChannelFee>> {
        let resp: FeeReportResponse = self
            .with_retry("FeeReport", || self.get_json("/v1/fees"))
            .await?;
        Ok(resp.channel_fees)
    }

    async fn forwarding_history(
        &self,
        request: ForwardingHistoryRequest,
    ) -> anyhow::Result<ForwardingHistoryResponse> {
        let body = serde_json::json!({
            "start_time": request.start_time.to_string(),
            "end_time": request.end_time.to_string(),
            "index_offset": request.index_offset,
            "num_max_events": request.num_max_events,
        });
        self.with_retry("ForwardingHistory", || self.post_json("/v1/switch", &body))
            .await
    }

    async fn update_channel_policy(
        &self,
        channel_point: &str,
        policy: &FeePolicy,
    ) -> anyhow::Result<()> {
        let (txid, output_index) = parse_channel_point(channel_point)?;
        let body = serde_json::json!({
            "chan_point": {
                "funding_txid_str": txid,
                "output_index": output_index,
            },
            "base_fee_msat": policy.base_fee_msat.to_string(),
            "fee_rate": policy.fee_rate,
            "time_lock_delta": policy.cltv,
        });
        let resp: PolicyUpdateResponse = self
            .with_retry("UpdateChannelPolicy", || self.post_json("/v1/chanpolicy", &body))
            .await?;
        resp.into_result(channel_point)
    }
}

// ---------------------------------------------------------------------------
// Mock client for integration testing
// ---------------------------------------------------------------------------
