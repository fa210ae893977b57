use crate::fees::RunConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub fees: FeesConfig,
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// LND REST endpoint, e.g. https://localhost:8080
    pub rest_url: String,
    /// Path to the admin (or fee-setting) macaroon
    pub macaroon_path: PathBuf,
    /// Path to LND's TLS certificate
    pub tls_cert_path: PathBuf,
    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
pub struct GeneralConfig {
    /// Path to the SQLite audit database
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Dry-run mode: log decisions but push nothing
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeesConfig {
    /// Time-lock delta set on every channel (blocks)
    #[serde(default = "default_cltv")]
    pub cltv: u32,
    /// Base fee set on every channel (msat)
    #[serde(default = "default_base_fee_msat")]
    pub base_fee_msat: u64,
    /// Forwarding history window in days
    #[serde(default = "default_from_days_ago")]
    pub from_days_ago: u32,
    /// Fee rates are never set below this
    #[serde(default = "default_min_fee_rate")]
    pub min_fee_rate: f64,
    /// Apply without asking for confirmation
    #[serde(default)]
    pub reckless: bool,
}

// Default value functions
fn default_request_timeout() -> u64 {
    30
}
fn default_database_path() -> PathBuf {
    PathBuf::from("feeboss.db")
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_cltv() -> u32 {
    20
}
fn default_base_fee_msat() -> u64 {
    40
}
fn default_from_days_ago() -> u32 {
    7
}
fn default_min_fee_rate() -> f64 {
    0.000004
}

// Default implementations
impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            log_level: default_log_level(),
            dry_run: false,
        }
    }
}

impl Default for FeesConfig {
    fn default() -> Self {
        Self {
            cltv: default_cltv(),
            base_fee_msat: default_base_fee_msat(),
            from_days_ago: default_from_days_ago(),
            min_fee_rate: default_min_fee_rate(),
            reckless: false,
        }
    }
}

impl FeesConfig {
    pub fn run_config(&self) -> RunConfig {
        RunConfig {
            cltv: self.cltv,
            base_fee_msat: self.base_fee_msat,
            from_days_ago: self.from_days_ago,
            min_fee_rate: self.min_fee_rate,
            reckless: self.reckless,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let config = Self::from_file(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse without validating, so command-line overrides can be applied first.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        // Hard limits (non-configurable safety rails)
        const ABS_MIN_CLTV: u32 = 18;
        const ABS_MAX_CLTV: u32 = 2016;
        const ABS_MIN_MIN_FEE_RATE: f64 = 0.000001;
        const ABS_MAX_MIN_FEE_RATE: f64 = 0.01;
        const ABS_MAX_BASE_FEE_MSAT: u64 = 100_000;
        const ABS_MAX_DAYS: u32 = 365;

        self.fees.run_config().validate()?;

        if self.fees.cltv < ABS_MIN_CLTV || self.fees.cltv > ABS_MAX_CLTV {
            anyhow::bail!(
                "cltv ({}) must be between {} and {}",
                self.fees.cltv,
                ABS_MIN_CLTV,
                ABS_MAX_CLTV
            );
        }
        // LND rounds the rate to whole ppm; anything smaller ends up as 0
        if self.fees.min_fee_rate < ABS_MIN_MIN_FEE_RATE {
            anyhow::bail!(
                "min_fee_rate ({}) below absolute minimum ({})",
                self.fees.min_fee_rate,
                ABS_MIN_MIN_FEE_RATE
            );
        }
        if self.fees.min_fee_rate > ABS_MAX_MIN_FEE_RATE {
            anyhow::bail!(
                "min_fee_rate ({}) above absolute maximum ({})",
                self.fees.min_fee_rate,
                ABS_MAX_MIN_FEE_RATE
            );
        }
        if self.fees.base_fee_msat > ABS_MAX_BASE_FEE_MSAT {
            anyhow::bail!(
                "base_fee_msat ({}) above absolute maximum ({})",
                self.fees.base_fee_msat,
                ABS_MAX_BASE_FEE_MSAT
            );
        }
        if self.fees.from_days_ago > ABS_MAX_DAYS {
            anyhow::bail!(
                "from_days_ago ({}) above absolute maximum ({})",
                self.fees.from_days_ago,
                ABS_MAX_DAYS
            );
        }
        if !self.server.rest_url.starts_with("https://") {
            anyhow::bail!("rest_url must start with https://");
        }
        if !self.server.tls_cert_path.exists() {
            anyhow::bail!(
                "TLS cert not found at: {}",
                self.server.tls_cert_path.display()
            );
        }
        if !self.server.macaroon_path.exists() {
            anyhow::bail!(
                "Macaroon not found at: {}",
                self.server.macaroon_path.display()
            );
        }
        Ok(())
    }

    /// Create a config with all defaults for testing purposes.
    /// The cert and macaroon paths are set to the provided path (must exist for validation).
    #[cfg(test)]
    pub fn test_default(credentials_path: std::path::PathBuf) -> Self {
        Self {
            server: ServerConfig {
                rest_url: "https://localhost:8080".to_string(),
                macaroon_path: credentials_path.clone(),
                tls_cert_path: credentials_path,
                request_timeout_secs: default_request_timeout(),
            },
            general: GeneralConfig::default(),
            fees: FeesConfig::default(),
        }
    }
}
